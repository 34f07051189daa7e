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

//! Device slot table of a vhost-scsi controller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Error, Result};
use serde::Serialize;

use crate::config::{ControllerConfig, PollerTunables};
use crate::request::VIRTIO_SCSI_MAX_LUN;
use crate::transport::ActiveRings;
use crate::VhostScsiError;
use scsi_backend::ScsiLun;
use util::cpumask::CpuMask;

/// Number of device slots of one controller.
pub const VHOST_SCSI_CTRLR_MAX_DEVS: usize = 8;

/// Bounds checked index of a device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u8);

impl SlotIndex {
    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }

    /// All slots of a controller, in order.
    pub fn all() -> impl Iterator<Item = SlotIndex> {
        (0..VHOST_SCSI_CTRLR_MAX_DEVS as u8).map(SlotIndex)
    }
}

impl TryFrom<u32> for SlotIndex {
    type Error = Error;

    fn try_from(index: u32) -> Result<Self> {
        if index as usize >= VHOST_SCSI_CTRLR_MAX_DEVS {
            return Err(anyhow!(VhostScsiError::BadIndex(
                index,
                VHOST_SCSI_CTRLR_MAX_DEVS
            )));
        }
        Ok(SlotIndex(index as u8))
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn check_lun_id(lun: u16) -> Result<()> {
    if lun > VIRTIO_SCSI_MAX_LUN {
        return Err(anyhow!(VhostScsiError::LunOutOfRange(
            lun,
            VIRTIO_SCSI_MAX_LUN
        )));
    }
    Ok(())
}

/// A scsi target bound to a device slot.
///
/// The value is never modified once shared with the poller. Lun changes build
/// a new device, so a snapshot held by the poller stays consistent.
#[derive(Clone)]
pub struct ScsiDevice {
    name: String,
    cpumask: Option<CpuMask>,
    luns: BTreeMap<u16, Arc<dyn ScsiLun>>,
}

impl ScsiDevice {
    pub fn new(slot: SlotIndex, cpumask: Option<CpuMask>) -> Self {
        ScsiDevice {
            name: format!("Dev{}", slot),
            cpumask,
            luns: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpumask(&self) -> Option<CpuMask> {
        self.cpumask
    }

    pub fn lun(&self, id: u16) -> Option<&Arc<dyn ScsiLun>> {
        self.luns.get(&id)
    }

    pub fn lun_ids(&self) -> Vec<u16> {
        self.luns.keys().copied().collect()
    }

    pub fn with_lun(&self, id: u16, lun: Arc<dyn ScsiLun>) -> Self {
        let mut dev = self.clone();
        dev.luns.insert(id, lun);
        dev
    }

    pub fn without_lun(&self, id: u16) -> Self {
        let mut dev = self.clone();
        dev.luns.remove(&id);
        dev
    }
}

impl fmt::Debug for ScsiDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let luns: BTreeMap<u16, &str> = self.luns.iter().map(|(id, l)| (*id, l.name())).collect();
        f.debug_struct("ScsiDevice")
            .field("name", &self.name)
            .field("cpumask", &self.cpumask)
            .field("luns", &luns)
            .finish()
    }
}

/// Callback run by the poller once a detached slot has drained.
pub type RemoveCallback = Box<dyn FnOnce(&str, SlotIndex) + Send>;

/// Deferred changes consumed by the poller at the start of an iteration.
pub(crate) enum ControllerEvent {
    AttachDevice {
        slot: SlotIndex,
        device: Arc<ScsiDevice>,
    },
    DetachDevice {
        slot: SlotIndex,
        cb: Option<RemoveCallback>,
    },
    AttachLun {
        slot: SlotIndex,
        lun: u16,
        device: Arc<ScsiDevice>,
    },
    DetachLun {
        slot: SlotIndex,
        lun: u16,
        /// The device without the lun.
        device: Arc<ScsiDevice>,
        cb: Option<RemoveCallback>,
    },
    StartTransport(ActiveRings),
    StopTransport,
    Shutdown,
}

impl fmt::Debug for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerEvent::AttachDevice { slot, .. } => write!(f, "AttachDevice({})", slot),
            ControllerEvent::DetachDevice { slot, .. } => write!(f, "DetachDevice({})", slot),
            ControllerEvent::AttachLun { slot, lun, .. } => {
                write!(f, "AttachLun({}, {})", slot, lun)
            }
            ControllerEvent::DetachLun { slot, lun, .. } => {
                write!(f, "DetachLun({}, {})", slot, lun)
            }
            ControllerEvent::StartTransport(_) => write!(f, "StartTransport"),
            ControllerEvent::StopTransport => write!(f, "StopTransport"),
            ControllerEvent::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Reports from the poller to the management side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugNotice {
    DeviceDetached { slot: SlotIndex },
    LunDetached { slot: SlotIndex, lun: u16 },
    /// Avail indexes to resume the vrings from.
    TransportStopped { vring_bases: Vec<u16> },
}

/// Counters of one controller, updated by the poller and the completion callbacks.
#[derive(Debug, Default)]
pub struct ControllerStats {
    pub requests: AtomicU64,
    pub completions: AtomicU64,
    pub malformed_chains: AtomicU64,
    pub bad_target: AtomicU64,
    pub backend_retries: AtomicU64,
    pub aborted: AtomicU64,
    pub duplicate_heads: AtomicU64,
    pub duplicate_completions: AtomicU64,
    pub ctrl_requests: AtomicU64,
    pub events_sent: AtomicU64,
    pub events_missed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub completions: u64,
    pub malformed_chains: u64,
    pub bad_target: u64,
    pub backend_retries: u64,
    pub aborted: u64,
    pub duplicate_heads: u64,
    pub duplicate_completions: u64,
    pub ctrl_requests: u64,
    pub events_sent: u64,
    pub events_missed: u64,
}

impl ControllerStats {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            requests: get(&self.requests),
            completions: get(&self.completions),
            malformed_chains: get(&self.malformed_chains),
            bad_target: get(&self.bad_target),
            backend_retries: get(&self.backend_retries),
            aborted: get(&self.aborted),
            duplicate_heads: get(&self.duplicate_heads),
            duplicate_completions: get(&self.duplicate_completions),
            ctrl_requests: get(&self.ctrl_requests),
            events_sent: get(&self.events_sent),
            events_missed: get(&self.events_missed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LunInfo {
    pub id: u16,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub slot: u8,
    pub name: String,
    /// "reserved", "bound" or "removing".
    pub state: String,
    pub cpumask: Option<CpuMask>,
    pub luns: Vec<LunInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerInfo {
    pub name: String,
    pub cpumask: CpuMask,
    pub tunables: PollerTunables,
    pub transport_started: bool,
    pub devices: Vec<DeviceInfo>,
    pub stats: StatsSnapshot,
}

impl ControllerInfo {
    pub fn new(config: &ControllerConfig, started: bool, stats: StatsSnapshot) -> Self {
        ControllerInfo {
            name: config.id.clone(),
            cpumask: config.cpumask,
            tunables: config.tunables(),
            transport_started: started,
            devices: Vec::new(),
            stats,
        }
    }
}
