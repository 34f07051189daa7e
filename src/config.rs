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

//! Controller and device configuration.
//!
//! Both are parsed with clap from the comma separated property form used on
//! management command lines, e.g. `id=ctrl0,cpumask=[0-1],max-batch=16`.

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use serde::Serialize;

use crate::controller::VHOST_SCSI_CTRLR_MAX_DEVS;
use crate::VhostScsiError;
use util::cpumask::CpuMask;

/// Avail entries taken from one request queue per poll iteration.
pub const DEFAULT_MAX_BATCH: u32 = 32;
/// Busy refusals of one command retried before it is aborted. A refused
/// command is retried only after the poller swept a completion, or idled with
/// nothing submitted, and its queue takes no new chains while it waits.
pub const DEFAULT_RETRY_LIMIT: u32 = 4;
/// Descriptors accepted in one chain, indirect ones included.
pub const DEFAULT_MAX_CHAIN_LEN: u16 = 256;
/// Sleep of an idle poller, in microseconds.
pub const DEFAULT_IDLE_PARK_US: u64 = 50;

const MAX_STRING_LENGTH: usize = 255;
const MAX_BATCH: u64 = 1024;
const MAX_RETRY_LIMIT: u64 = 64;
const MAX_CHAIN_LEN: u64 = 32768;
const MAX_IDLE_PARK_US: u64 = 1_000_000;

pub trait ConfigCheck: Send + Sync {
    /// To check the legality of Config structure.
    fn check(&self) -> Result<()>;
}

/// Split `key=value,flag` properties into clap long options. Commas inside
/// brackets belong to the value, so cpu lists like `[0,2-3]` survive.
pub fn str_slip_to_clap(args: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0_u32;
    let mut start = 0;
    for (pos, c) in args.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                items.push(&args[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
    }
    items.push(&args[start..]);

    let mut itr = Vec::new();
    for item in items.into_iter().filter(|i| !i.is_empty()) {
        match item.split_once('=') {
            Some((key, value)) => {
                itr.push(format!("--{}", key));
                itr.push(value.to_string());
            }
            None => itr.push(format!("--{}", item)),
        }
    }
    itr
}

pub fn check_arg_too_long(arg: &str, name: &str) -> Result<()> {
    if arg.len() > MAX_STRING_LENGTH {
        return Err(anyhow!(VhostScsiError::StringLengthTooLong(
            name.to_string(),
            MAX_STRING_LENGTH
        )));
    }
    Ok(())
}

pub fn valid_id(id: &str) -> Result<String> {
    check_arg_too_long(id, "id")?;
    if id.is_empty() {
        bail!("Id can not be empty");
    }
    Ok(id.to_string())
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(anyhow!(VhostScsiError::IllegalValue(
            name.to_string(),
            value,
            min,
            max
        )));
    }
    Ok(())
}

/// Poll loop tunables applied to controllers created without explicit ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollerTunables {
    pub max_batch: u32,
    pub retry_limit: u32,
    pub max_chain_len: u16,
    pub idle_park_us: u64,
}

impl Default for PollerTunables {
    fn default() -> Self {
        PollerTunables {
            max_batch: DEFAULT_MAX_BATCH,
            retry_limit: DEFAULT_RETRY_LIMIT,
            max_chain_len: DEFAULT_MAX_CHAIN_LEN,
            idle_park_us: DEFAULT_IDLE_PARK_US,
        }
    }
}

/// Config structure for a vhost-scsi controller.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(no_binary_name(true))]
pub struct ControllerConfig {
    #[arg(long, value_parser = valid_id)]
    pub id: String,
    /// Cpus eligible to run the poller of the controller.
    #[arg(long)]
    pub cpumask: CpuMask,
    #[arg(long, default_value_t = DEFAULT_MAX_BATCH)]
    pub max_batch: u32,
    #[arg(long, default_value_t = DEFAULT_RETRY_LIMIT)]
    pub retry_limit: u32,
    #[arg(long, default_value_t = DEFAULT_MAX_CHAIN_LEN)]
    pub max_chain_len: u16,
    #[arg(long, default_value_t = DEFAULT_IDLE_PARK_US)]
    pub idle_park_us: u64,
}

impl ControllerConfig {
    pub fn new(id: &str, cpumask: CpuMask, tunables: &PollerTunables) -> Self {
        ControllerConfig {
            id: id.to_string(),
            cpumask,
            max_batch: tunables.max_batch,
            retry_limit: tunables.retry_limit,
            max_chain_len: tunables.max_chain_len,
            idle_park_us: tunables.idle_park_us,
        }
    }

    pub fn tunables(&self) -> PollerTunables {
        PollerTunables {
            max_batch: self.max_batch,
            retry_limit: self.retry_limit,
            max_chain_len: self.max_chain_len,
            idle_park_us: self.idle_park_us,
        }
    }
}

impl ConfigCheck for ControllerConfig {
    fn check(&self) -> Result<()> {
        valid_id(&self.id)?;
        self.cpumask.check_online()?;
        check_range("max-batch", u64::from(self.max_batch), 1, MAX_BATCH)?;
        check_range("retry-limit", u64::from(self.retry_limit), 0, MAX_RETRY_LIMIT)?;
        check_range(
            "max-chain-len",
            u64::from(self.max_chain_len),
            1,
            MAX_CHAIN_LEN,
        )?;
        check_range("idle-park-us", self.idle_park_us, 0, MAX_IDLE_PARK_US)
    }
}

/// Config structure for a device bound to one slot of a controller.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(no_binary_name(true))]
pub struct DeviceConfig {
    #[arg(long)]
    pub slot: u32,
    /// Backend name of lun 0.
    #[arg(long, value_parser = valid_id)]
    pub backend: String,
    #[arg(long)]
    pub cpumask: Option<CpuMask>,
}

impl ConfigCheck for DeviceConfig {
    fn check(&self) -> Result<()> {
        if self.slot as usize >= VHOST_SCSI_CTRLR_MAX_DEVS {
            return Err(anyhow!(VhostScsiError::BadIndex(
                self.slot,
                VHOST_SCSI_CTRLR_MAX_DEVS
            )));
        }
        check_arg_too_long(&self.backend, "backend")?;
        if let Some(mask) = self.cpumask.as_ref() {
            mask.check_online()?;
        }
        Ok(())
    }
}
