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

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use log::info;
use thiserror::Error;

use crate::bus::{ScsiSense, CHECK_CONDITION, GOOD, SCSI_CDB_SIZE};
use crate::ScsiBackendError;
use util::aio::Iovec;

/// One SCSI command handed to a logical unit.
#[derive(Clone, Debug)]
pub struct ScsiTask {
    /// Logical unit number inside the target.
    pub lun: u16,
    /// Tag chosen by the initiator.
    pub tag: u64,
    pub cdb: [u8; SCSI_CDB_SIZE],
    /// Device-readable buffers, host addresses straight into guest memory.
    pub data_out: Vec<Iovec>,
    /// Device-writable buffers, host addresses straight into guest memory.
    pub data_in: Vec<Iovec>,
    /// Bytes described by `data_out` and `data_in` together.
    pub transfer_len: u64,
}

/// Outcome of a SCSI command as reported by the logical unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScsiTaskResult {
    /// SAM status.
    pub status: u8,
    /// Sense data, empty unless `status` is CHECK CONDITION.
    pub sense: Vec<u8>,
    /// Bytes of the data buffer that were not transferred.
    pub residual: u64,
}

impl ScsiTaskResult {
    pub fn good(residual: u64) -> Self {
        ScsiTaskResult {
            status: GOOD,
            sense: Vec::new(),
            residual,
        }
    }

    pub fn check_condition(sense: ScsiSense) -> Self {
        ScsiTaskResult {
            status: CHECK_CONDITION,
            sense: sense.to_fixed().to_vec(),
            residual: 0,
        }
    }

    pub fn with_residual(mut self, residual: u64) -> Self {
        self.residual = residual;
        self
    }

    pub fn with_status(status: u8) -> Self {
        ScsiTaskResult {
            status,
            ..Default::default()
        }
    }
}

/// Completion of a submitted task. A well behaved logical unit calls it
/// exactly once, callers must tolerate more.
pub trait ScsiCompleteCb: Send + Sync {
    fn scsi_task_complete_cb(&self, result: ScsiTaskResult);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The logical unit cannot take the task now, submitting again later may work.
    #[error("Logical unit is busy")]
    Busy,
    #[error("Logical unit failed to accept the task: {0}")]
    Failed(String),
}

/// A storage endpoint executing SCSI commands asynchronously.
pub trait ScsiLun: Send + Sync {
    fn name(&self) -> &str;

    /// Start `task`. On `Ok` the callback runs later, possibly on another
    /// thread. On `Err` it never runs for this submission.
    fn submit(&self, task: ScsiTask, cb: Arc<dyn ScsiCompleteCb>) -> Result<(), SubmitError>;
}

/// Lookup of logical units by backend name.
pub trait LunResolver: Send + Sync {
    fn resolve_lun(&self, name: &str) -> Option<Arc<dyn ScsiLun>>;
}

/// Logical units created in this process.
#[derive(Default)]
pub struct LunRegistry {
    luns: RwLock<HashMap<String, Arc<dyn ScsiLun>>>,
}

impl LunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, lun: Arc<dyn ScsiLun>) -> Result<()> {
        let mut luns = self
            .luns
            .write()
            .map_err(|_| anyhow!("Logical unit table is poisoned"))?;
        let name = lun.name().to_string();
        if luns.contains_key(&name) {
            return Err(anyhow!(ScsiBackendError::LunExists(name)));
        }
        info!("Register logical unit {}", name);
        luns.insert(name, lun);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<dyn ScsiLun>> {
        let mut luns = self
            .luns
            .write()
            .map_err(|_| anyhow!("Logical unit table is poisoned"))?;
        let lun = luns
            .remove(name)
            .ok_or_else(|| anyhow!(ScsiBackendError::LunNotFound(name.to_string())))?;
        info!("Unregister logical unit {}", name);
        Ok(lun)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.luns.read() {
            Ok(luns) => luns.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

impl LunResolver for LunRegistry {
    fn resolve_lun(&self, name: &str) -> Option<Arc<dyn ScsiLun>> {
        self.luns.read().ok()?.get(name).cloned()
    }
}
