// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Processing-affinity masks for poller threads.
//!
//! Accepted forms are a hexadecimal bitmap (`0x3`, `3`) or a bracketed cpu
//! list with ranges (`[0,2-3]`). At most 64 cpus are addressable.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use serde::{Serialize, Serializer};

use crate::unix::host_cpu_count;
use crate::UtilError;

pub const MAX_MASK_CPUS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Build a mask from raw bits. An empty mask is rejected.
    pub fn from_bits(bits: u64) -> Result<Self> {
        if bits == 0 {
            return Err(anyhow!(UtilError::InvalidCpuMask(
                format!("{:#x}", bits),
                "empty mask".to_string()
            )));
        }
        Ok(CpuMask(bits))
    }

    /// Mask containing only `cpu`.
    pub fn single(cpu: usize) -> Result<Self> {
        if cpu >= MAX_MASK_CPUS {
            return Err(anyhow!(UtilError::OutOfBound(
                cpu as u64,
                MAX_MASK_CPUS as u64
            )));
        }
        Ok(CpuMask(1 << cpu))
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_MASK_CPUS && self.0 & (1 << cpu) != 0
    }

    pub fn is_subset_of(&self, other: &CpuMask) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn cpus(&self) -> Vec<usize> {
        (0..MAX_MASK_CPUS).filter(|c| self.contains(*c)).collect()
    }

    /// Fail if the mask names a cpu the host does not have.
    pub fn check_online(&self) -> Result<()> {
        let online = host_cpu_count();
        if let Some(cpu) = self.cpus().into_iter().find(|c| *c >= online) {
            return Err(anyhow!(UtilError::CpuNotOnline(cpu, online)));
        }
        Ok(())
    }

    /// Pin the calling thread to this mask.
    pub fn bind_current_thread(&self, name: &str) -> Result<()> {
        let mut set = CpuSet::new();
        for cpu in self.cpus() {
            set.set(cpu)
                .map_err(|_| anyhow!(UtilError::SetAffinity(name.to_string())))?;
        }
        sched_setaffinity(Pid::from_raw(0), &set)
            .map_err(|e| anyhow!(UtilError::SetAffinity(name.to_string())).context(e))
    }

    fn parse_list(s: &str, body: &str) -> Result<u64> {
        let invalid = |why: &str| anyhow!(UtilError::InvalidCpuMask(s.to_string(), why.to_string()));
        let mut bits = 0_u64;
        for item in body.split(',').map(str::trim) {
            let (first, last) = match item.split_once('-') {
                Some((a, b)) => (a.trim(), b.trim()),
                None => (item, item),
            };
            let first = first
                .parse::<usize>()
                .map_err(|_| invalid("bad cpu number"))?;
            let last = last.parse::<usize>().map_err(|_| invalid("bad cpu number"))?;
            if first > last {
                return Err(invalid("descending range"));
            }
            if last >= MAX_MASK_CPUS {
                return Err(invalid("cpu number too large"));
            }
            for cpu in first..=last {
                bits |= 1 << cpu;
            }
        }
        Ok(bits)
    }
}

impl FromStr for CpuMask {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let bits = if let Some(body) = trimmed
            .strip_prefix('[')
            .and_then(|b| b.strip_suffix(']'))
        {
            Self::parse_list(s, body)?
        } else {
            let hex = trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
                .unwrap_or(trimmed);
            u64::from_str_radix(hex, 16).map_err(|_| {
                anyhow!(UtilError::InvalidCpuMask(
                    s.to_string(),
                    "not a hexadecimal mask".to_string()
                ))
            })?
        };
        Self::from_bits(bits)
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for CpuMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}
