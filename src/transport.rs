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

//! What the transport hands over once the guest driver is ready.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::warn;
use vmm_sys_util::eventfd::EventFd;

use crate::VhostScsiError;
use address_space::GuestMemory;
use virtio::{
    Queue, QueueConfig, QUEUE_TYPE_SPLIT_VRING, VIRTIO_F_RING_EVENT_IDX,
    VIRTIO_F_RING_INDIRECT_DESC, VIRTIO_F_VERSION_1, VIRTIO_SCSI_F_HOTPLUG, VIRTIO_SCSI_F_INOUT,
};

/// Virtio Scsi Controller has 1 ctrl queue, 1 event queue and at least 1 cmd queue.
pub const SCSI_CTRL_QUEUE_IDX: usize = 0;
pub const SCSI_EVENT_QUEUE_IDX: usize = 1;
pub const SCSI_MIN_QUEUE_NUM: usize = 3;
/// Upper bound of vrings accepted from the transport.
pub const SCSI_MAX_QUEUE_NUM: usize = 64;

/// Features the engine can serve.
pub const VHOST_SCSI_FEATURES: u64 = 1 << VIRTIO_F_VERSION_1
    | 1 << VIRTIO_F_RING_INDIRECT_DESC
    | 1 << VIRTIO_F_RING_EVENT_IDX
    | 1 << VIRTIO_SCSI_F_INOUT
    | 1 << VIRTIO_SCSI_F_HOTPLUG;

/// One vring as set up by the guest driver.
pub struct VringInfo {
    /// Ring addresses, size and the avail index to resume from.
    pub config: QueueConfig,
    /// Written to interrupt the guest for this ring.
    pub call_evt: Arc<EventFd>,
}

pub struct TransportContext {
    /// Guest memory mapped into this process.
    pub mem: Arc<GuestMemory>,
    /// Bit mask of features negotiated by the backend and the frontend.
    pub driver_features: u64,
    /// Control queue, event queue, then the request queues.
    pub vrings: Vec<VringInfo>,
}

/// Queues built from a validated `TransportContext`.
pub(crate) struct ActiveRings {
    pub mem: Arc<GuestMemory>,
    pub features: u64,
    pub queues: Vec<Queue>,
    pub call_evts: Vec<Arc<EventFd>>,
}

impl TransportContext {
    /// Negotiated features restricted to those the engine serves.
    pub fn features(&self) -> u64 {
        let unsupported = self.driver_features & !VHOST_SCSI_FEATURES;
        if unsupported != 0 {
            warn!(
                "Transport acknowledged features unsupported by vhost scsi: 0x{:x}",
                unsupported
            );
        }
        self.driver_features & VHOST_SCSI_FEATURES
    }

    /// Check the ring layout and build the queues for `max_chain_len` long chains.
    pub(crate) fn activate(self, max_chain_len: u16) -> Result<ActiveRings> {
        let queue_num = self.vrings.len();
        if !(SCSI_MIN_QUEUE_NUM..=SCSI_MAX_QUEUE_NUM).contains(&queue_num) {
            return Err(anyhow!(VhostScsiError::InvalidTransport(format!(
                "{} vrings, expected {} to {}",
                queue_num, SCSI_MIN_QUEUE_NUM, SCSI_MAX_QUEUE_NUM
            ))));
        }

        let features = self.features();
        let mut queues = Vec::with_capacity(queue_num);
        let mut call_evts = Vec::with_capacity(queue_num);
        for (index, vring) in self.vrings.into_iter().enumerate() {
            let mut queue = Queue::new(vring.config, QUEUE_TYPE_SPLIT_VRING)
                .with_context(|| format!("Failed to create vring {}", index))?;
            if !queue.is_valid(&self.mem) {
                return Err(anyhow!(VhostScsiError::InvalidTransport(format!(
                    "vring {} has an invalid layout",
                    index
                ))));
            }
            queue.vring.set_max_chain_len(max_chain_len);
            queues.push(queue);
            call_evts.push(vring.call_evt);
        }

        Ok(ActiveRings {
            mem: self.mem,
            features,
            queues,
            call_evts,
        })
    }
}
