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

//! Management surface of the vhost-scsi controllers of one process.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use crate::config::{ConfigCheck, ControllerConfig, DeviceConfig, PollerTunables};
use crate::controller::{
    check_lun_id, ControllerEvent, ControllerInfo, ControllerStats, DeviceInfo, HotplugNotice,
    LunInfo, RemoveCallback, ScsiDevice, SlotIndex, StatsSnapshot,
};
use crate::poller::spawn_poller;
use crate::transport::TransportContext;
use crate::VhostScsiError;
use scsi_backend::{LunResolver, ScsiLun};
use util::cpumask::CpuMask;

/// Result of a removal that may have to wait for in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    /// Done, the callback has already run.
    Removed,
    /// The poller is draining the slot, the callback runs once it is empty.
    Pending,
}

/// Management view of a device slot.
enum ControlSlot {
    Free,
    Reserved { cpumask: Option<CpuMask> },
    Bound { device: Arc<ScsiDevice> },
    Removing { device: Arc<ScsiDevice> },
}

struct ControllerHandle {
    config: ControllerConfig,
    slots: Vec<ControlSlot>,
    /// Backends of luns detached from a bound device whose requests are still in flight.
    draining_luns: BTreeMap<(SlotIndex, u16), String>,
    transport_started: bool,
    /// Avail indexes reported when the transport last stopped.
    vring_bases: Vec<u16>,
    stats: Arc<ControllerStats>,
    events: Sender<ControllerEvent>,
    notices: Receiver<HotplugNotice>,
    thread: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    fn new(config: ControllerConfig) -> Result<Self> {
        let stats = Arc::new(ControllerStats::default());
        let poller = spawn_poller(&config, stats.clone())?;
        Ok(ControllerHandle {
            config,
            slots: SlotIndex::all().map(|_| ControlSlot::Free).collect(),
            draining_luns: BTreeMap::new(),
            transport_started: false,
            vring_bases: Vec::new(),
            stats,
            events: poller.events,
            notices: poller.notices,
            thread: Some(poller.thread),
        })
    }

    fn name(&self) -> &str {
        &self.config.id
    }

    fn post(&self, event: ControllerEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow!(VhostScsiError::PollerGone(self.name().to_string())))?;
        if let Some(thread) = self.thread.as_ref() {
            thread.thread().unpark();
        }
        Ok(())
    }

    fn apply_notice(&mut self, notice: HotplugNotice) {
        match notice {
            HotplugNotice::DeviceDetached { slot } => {
                info!("Controller {}: slot {} is free", self.config.id, slot);
                self.slots[slot.as_usize()] = ControlSlot::Free;
            }
            HotplugNotice::LunDetached { slot, lun } => {
                self.draining_luns.remove(&(slot, lun));
            }
            HotplugNotice::TransportStopped { vring_bases } => {
                self.transport_started = false;
                self.vring_bases = vring_bases;
            }
        }
    }

    fn apply_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            self.apply_notice(notice);
        }
    }

    fn slot(&self, slot: SlotIndex) -> &ControlSlot {
        &self.slots[slot.as_usize()]
    }

    fn device(&self, slot: SlotIndex) -> Option<&Arc<ScsiDevice>> {
        match self.slot(slot) {
            ControlSlot::Bound { device } | ControlSlot::Removing { device } => Some(device),
            _ => None,
        }
    }

    fn bound_device(&self, slot: SlotIndex) -> Result<Arc<ScsiDevice>> {
        match self.slot(slot) {
            ControlSlot::Bound { device } => Ok(device.clone()),
            ControlSlot::Removing { .. } => Err(anyhow!(VhostScsiError::Busy(
                self.name().to_string(),
                format!("device slot {} is being removed", slot)
            ))),
            _ => Err(anyhow!(VhostScsiError::SlotEmpty(
                self.name().to_string(),
                slot.raw()
            ))),
        }
    }

    fn is_idle(&self) -> bool {
        !self.transport_started && self.slots.iter().all(|s| matches!(s, ControlSlot::Free))
    }

    fn uses_backend(&self, backend: &str) -> bool {
        if self.draining_luns.values().any(|name| name == backend) {
            return true;
        }
        SlotIndex::all().any(|slot| {
            self.device(slot).map_or(false, |dev| {
                dev.lun_ids()
                    .iter()
                    .any(|id| dev.lun(*id).map_or(false, |l| l.name() == backend))
            })
        })
    }

    fn info(&self) -> ControllerInfo {
        let mut info = ControllerInfo::new(
            &self.config,
            self.transport_started,
            self.stats.snapshot(),
        );
        for slot in SlotIndex::all() {
            let (state, cpumask, device) = match self.slot(slot) {
                ControlSlot::Free => continue,
                ControlSlot::Reserved { cpumask } => ("reserved", *cpumask, None),
                ControlSlot::Bound { device } => ("bound", device.cpumask(), Some(device)),
                ControlSlot::Removing { device } => ("removing", device.cpumask(), Some(device)),
            };
            let luns = device.map_or_else(Vec::new, |dev| {
                dev.lun_ids()
                    .into_iter()
                    .filter_map(|id| {
                        dev.lun(id).map(|l| LunInfo {
                            id,
                            backend: l.name().to_string(),
                        })
                    })
                    .collect()
            });
            info.devices.push(DeviceInfo {
                slot: slot.raw(),
                name: format!("Dev{}", slot),
                state: state.to_string(),
                cpumask,
                luns,
            });
        }
        info
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        if self.events.send(ControllerEvent::Shutdown).is_err() {
            warn!("Poller of controller {} already exited", self.config.id);
        }
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                error!("Poller of controller {} panicked", self.config.id);
            }
        }
    }
}

/// Controllers of this process, keyed by name.
pub struct VhostScsiRegistry {
    resolver: Arc<dyn LunResolver>,
    defaults: PollerTunables,
    controllers: BTreeMap<String, ControllerHandle>,
}

impl VhostScsiRegistry {
    /// # Arguments
    ///
    /// * `resolver` - Where `add_device` and `attach_lun` look backends up.
    /// * `defaults` - Tunables of controllers constructed without a config.
    pub fn new(resolver: Arc<dyn LunResolver>, defaults: PollerTunables) -> Self {
        VhostScsiRegistry {
            resolver,
            defaults,
            controllers: BTreeMap::new(),
        }
    }

    fn controller(&mut self, name: &str) -> Result<&mut ControllerHandle> {
        let handle = self
            .controllers
            .get_mut(name)
            .ok_or_else(|| anyhow!(VhostScsiError::ControllerNotFound(name.to_string())))?;
        handle.apply_notices();
        Ok(handle)
    }

    fn resolve_unused(&self, backend: &str) -> Result<Arc<dyn ScsiLun>> {
        let lun = self
            .resolver
            .resolve_lun(backend)
            .ok_or_else(|| anyhow!(VhostScsiError::BackendNotFound(backend.to_string())))?;
        if self.controllers.values().any(|c| c.uses_backend(backend)) {
            return Err(anyhow!(VhostScsiError::BackendInUse(backend.to_string())));
        }
        Ok(lun)
    }

    pub fn construct_controller(&mut self, name: &str, cpumask: CpuMask) -> Result<()> {
        let config = ControllerConfig::new(name, cpumask, &self.defaults);
        self.construct_controller_with_config(config)
    }

    pub fn construct_controller_with_config(&mut self, config: ControllerConfig) -> Result<()> {
        if self.controllers.contains_key(&config.id) {
            return Err(anyhow!(VhostScsiError::NameExists(config.id)));
        }
        config.check()?;

        let name = config.id.clone();
        let cpumask = config.cpumask;
        let handle = ControllerHandle::new(config)?;
        self.controllers.insert(name.clone(), handle);
        info!("Controller {} constructed on cpus {}", name, cpumask);
        Ok(())
    }

    /// Destroy an idle controller. It must have no device and a stopped transport.
    pub fn remove_controller(&mut self, name: &str) -> Result<()> {
        let handle = self.controller(name)?;
        if !handle.is_idle() {
            return Err(anyhow!(VhostScsiError::Busy(
                name.to_string(),
                "devices bound or transport started".to_string()
            )));
        }
        self.controllers.remove(name);
        info!("Controller {} removed", name);
        Ok(())
    }

    /// Reserve slot `slot` of controller `ctrlr`, optionally on a subset of its cpus.
    pub fn construct_device(
        &mut self,
        ctrlr: &str,
        slot: u32,
        cpumask: Option<CpuMask>,
    ) -> Result<()> {
        let handle = self.controller(ctrlr)?;
        let slot = SlotIndex::try_from(slot)?;
        if !matches!(handle.slot(slot), ControlSlot::Free) {
            return Err(anyhow!(VhostScsiError::SlotInUse(
                ctrlr.to_string(),
                slot.raw()
            )));
        }
        if let Some(mask) = cpumask.as_ref() {
            if !mask.is_subset_of(&handle.config.cpumask) {
                return Err(anyhow!(VhostScsiError::CpuMaskNotSubset(
                    mask.to_string(),
                    handle.config.cpumask.to_string()
                )));
            }
        }
        handle.slots[slot.as_usize()] = ControlSlot::Reserved { cpumask };
        Ok(())
    }

    /// Bind backend `backend` as lun 0 of a new device in slot `slot`.
    pub fn add_device(&mut self, ctrlr: &str, slot: u32, backend: &str) -> Result<()> {
        let slot = SlotIndex::try_from(slot)?;
        match self.controller(ctrlr)?.slot(slot) {
            ControlSlot::Bound { .. } | ControlSlot::Removing { .. } => {
                return Err(anyhow!(VhostScsiError::SlotInUse(
                    ctrlr.to_string(),
                    slot.raw()
                )));
            }
            _ => {}
        }
        let lun = self.resolve_unused(backend)?;

        let handle = self.controller(ctrlr)?;
        let cpumask = match handle.slot(slot) {
            ControlSlot::Reserved { cpumask } => *cpumask,
            _ => None,
        };
        let device = Arc::new(ScsiDevice::new(slot, cpumask).with_lun(0, lun));
        handle
            .post(ControllerEvent::AttachDevice {
                slot,
                device: device.clone(),
            })
            .with_context(|| format!("Failed to add device to slot {} of {}", slot, ctrlr))?;
        handle.slots[slot.as_usize()] = ControlSlot::Bound { device };
        info!(
            "Controller {}: backend {} added as lun 0 of slot {}",
            ctrlr, backend, slot
        );
        Ok(())
    }

    /// `construct_device` and `add_device` from one parsed device config.
    pub fn add_device_with_config(&mut self, ctrlr: &str, config: &DeviceConfig) -> Result<()> {
        config.check()?;
        let reserved = config.cpumask.is_some();
        if reserved {
            self.construct_device(ctrlr, config.slot, config.cpumask)?;
        }
        let ret = self.add_device(ctrlr, config.slot, &config.backend);
        if ret.is_err() && reserved {
            let handle = self.controller(ctrlr)?;
            let slot = SlotIndex::try_from(config.slot)?;
            handle.slots[slot.as_usize()] = ControlSlot::Free;
        }
        ret
    }

    /// Add backend `backend` as lun `lun` of the device in slot `slot`.
    pub fn attach_lun(&mut self, ctrlr: &str, slot: u32, lun: u16, backend: &str) -> Result<()> {
        let slot = SlotIndex::try_from(slot)?;
        check_lun_id(lun)?;
        let handle = self.controller(ctrlr)?;
        let device = handle.bound_device(slot)?;
        if device.lun(lun).is_some() || handle.draining_luns.contains_key(&(slot, lun)) {
            return Err(anyhow!(VhostScsiError::LunInUse(
                ctrlr.to_string(),
                slot.raw(),
                lun
            )));
        }
        let backend_lun = self.resolve_unused(backend)?;

        let device = Arc::new(device.with_lun(lun, backend_lun));
        let handle = self.controller(ctrlr)?;
        handle.post(ControllerEvent::AttachLun {
            slot,
            lun,
            device: device.clone(),
        })?;
        handle.slots[slot.as_usize()] = ControlSlot::Bound { device };
        info!(
            "Controller {}: backend {} attached as lun {} of slot {}",
            ctrlr, backend, lun, slot
        );
        Ok(())
    }

    /// Detach lun `lun` of the device in slot `slot`. Requests still in flight
    /// on it complete first, `cb` runs after that.
    pub fn detach_lun(
        &mut self,
        ctrlr: &str,
        slot: u32,
        lun: u16,
        cb: Option<RemoveCallback>,
    ) -> Result<RemoveStatus> {
        let slot = SlotIndex::try_from(slot)?;
        let handle = self.controller(ctrlr)?;
        let device = handle.bound_device(slot)?;
        let backend = match device.lun(lun) {
            Some(l) => l.name().to_string(),
            None => {
                return Err(anyhow!(VhostScsiError::LunNotFound(
                    ctrlr.to_string(),
                    slot.raw(),
                    lun
                )))
            }
        };

        let device = Arc::new(device.without_lun(lun));
        handle.post(ControllerEvent::DetachLun {
            slot,
            lun,
            device: device.clone(),
            cb,
        })?;
        handle.slots[slot.as_usize()] = ControlSlot::Bound { device };
        // The backend stays claimed until the poller reports the lun drained.
        handle.draining_luns.insert((slot, lun), backend);
        info!("Controller {}: detaching lun {} of slot {}", ctrlr, lun, slot);
        Ok(RemoveStatus::Pending)
    }

    /// Remove the device in slot `slot`. A reserved slot is freed at once, a
    /// bound one is drained by the poller and `cb` runs when it is free.
    pub fn remove_device(
        &mut self,
        ctrlr: &str,
        slot: u32,
        cb: Option<RemoveCallback>,
    ) -> Result<RemoveStatus> {
        let slot = SlotIndex::try_from(slot)?;
        let handle = self.controller(ctrlr)?;
        match handle.slot(slot) {
            ControlSlot::Free => Err(anyhow!(VhostScsiError::SlotEmpty(
                ctrlr.to_string(),
                slot.raw()
            ))),
            ControlSlot::Removing { .. } => Err(anyhow!(VhostScsiError::Busy(
                ctrlr.to_string(),
                format!("device slot {} is being removed", slot)
            ))),
            ControlSlot::Reserved { .. } => {
                handle.slots[slot.as_usize()] = ControlSlot::Free;
                if let Some(cb) = cb {
                    cb(ctrlr, slot);
                }
                Ok(RemoveStatus::Removed)
            }
            ControlSlot::Bound { device } => {
                let device = device.clone();
                handle.post(ControllerEvent::DetachDevice { slot, cb })?;
                info!(
                    "Controller {}: removing {} from slot {}",
                    ctrlr,
                    device.name(),
                    slot
                );
                handle.slots[slot.as_usize()] = ControlSlot::Removing { device };
                Ok(RemoveStatus::Pending)
            }
        }
    }

    /// The device in slot `slot`, until its removal has completed.
    pub fn get_device(&mut self, ctrlr: &str, slot: u32) -> Result<Option<Arc<ScsiDevice>>> {
        let slot = SlotIndex::try_from(slot)?;
        Ok(self.controller(ctrlr)?.device(slot).cloned())
    }

    /// Hand the vrings set up by the guest driver to the poller.
    pub fn start_controller(&mut self, ctrlr: &str, transport: TransportContext) -> Result<()> {
        let handle = self.controller(ctrlr)?;
        if handle.transport_started {
            return Err(anyhow!(VhostScsiError::TransportStarted(ctrlr.to_string())));
        }
        let rings = transport
            .activate(handle.config.max_chain_len)
            .with_context(|| format!("Failed to start controller {}", ctrlr))?;
        handle.post(ControllerEvent::StartTransport(rings))?;
        handle.transport_started = true;
        info!("Controller {}: transport started", ctrlr);
        Ok(())
    }

    /// Stop serving the vrings once the requests in flight complete. Returns
    /// the avail index each vring stopped at.
    pub fn stop_controller(&mut self, ctrlr: &str) -> Result<Vec<u16>> {
        let handle = self.controller(ctrlr)?;
        if !handle.transport_started {
            return Err(anyhow!(VhostScsiError::TransportNotStarted(
                ctrlr.to_string()
            )));
        }
        handle.post(ControllerEvent::StopTransport)?;
        loop {
            let notice = handle
                .notices
                .recv()
                .map_err(|_| anyhow!(VhostScsiError::PollerGone(ctrlr.to_string())))?;
            let stopped = matches!(notice, HotplugNotice::TransportStopped { .. });
            handle.apply_notice(notice);
            if stopped {
                return Ok(handle.vring_bases.clone());
            }
        }
    }

    pub fn query_controllers(&mut self) -> Vec<ControllerInfo> {
        self.controllers
            .values_mut()
            .map(|handle| {
                handle.apply_notices();
                handle.info()
            })
            .collect()
    }

    pub fn controller_stats(&mut self, ctrlr: &str) -> Result<StatsSnapshot> {
        Ok(self.controller(ctrlr)?.stats.snapshot())
    }
}
