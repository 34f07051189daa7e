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

mod split;

pub use split::*;

use anyhow::{anyhow, bail, Result};

use crate::VirtioError;
use address_space::{GuestAddress, GuestMemory};

/// Split Virtqueue.
pub const QUEUE_TYPE_SPLIT_VRING: u16 = 1;
/// Packed Virtqueue.
pub const QUEUE_TYPE_PACKED_VRING: u16 = 2;

/// This marks a buffer as continuing via the next field.
pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
/// This marks a buffer as write-only (otherwise read-only).
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
/// This means the buffer contains a list of buffer descriptors.
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

fn checked_offset_mem(
    mem: &GuestMemory,
    base: GuestAddress,
    offset: u64,
) -> Result<GuestAddress> {
    if !mem.address_in_memory(base, offset) {
        bail!(
            "Invalid Address for queue: base 0x{:X}, size {}",
            base.raw_value(),
            offset
        );
    }
    base.checked_add(offset).ok_or_else(|| {
        anyhow!(VirtioError::AddressOverflow(
            "queue",
            base.raw_value(),
            offset
        ))
    })
}

/// IO vector element which contains the information of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElemIovec {
    /// Guest address of descriptor.
    pub addr: GuestAddress,
    /// Length of descriptor.
    pub len: u32,
}

/// IO request element.
#[derive(Debug, Default)]
pub struct Element {
    /// Index of the descriptor in the table.
    pub index: u16,
    /// Number of descriptors.
    pub desc_num: u16,
    /// Vector to put host readable descriptors.
    pub out_iovec: Vec<ElemIovec>,
    /// Vector to put host writable descriptors.
    pub in_iovec: Vec<ElemIovec>,
}

impl Element {
    /// Create an IO request element.
    ///
    /// # Arguments
    ///
    /// * `index` - The index of descriptor in the virqueue descriptor table.
    pub fn new(index: u16) -> Self {
        Element {
            index,
            ..Default::default()
        }
    }

    pub fn iovec_size(iovec: &[ElemIovec]) -> u64 {
        iovec.iter().map(|e| e.len as u64).sum()
    }
}

/// Outcome of taking one entry off the available ring.
#[derive(Debug)]
pub enum PoppedChain {
    /// A fully validated descriptor chain.
    Element(Element),
    /// The head index is valid but the chain failed validation. `partial`
    /// holds the segments validated before the failure, the head can still be
    /// returned through the used ring.
    Malformed {
        index: u16,
        partial: Element,
        error: anyhow::Error,
    },
    /// The avail entry named a head outside the descriptor table. Nothing can
    /// be returned to the guest for it.
    Discarded { head: u16, error: anyhow::Error },
}

/// Vring operations.
pub trait VringOps {
    /// Return true if the vring is enable by driver.
    fn is_enabled(&self) -> bool;

    /// Return true if the configuration of vring is valid.
    ///
    /// # Arguments
    ///
    /// * `mem` - Guest memory holding the vring.
    fn is_valid(&self, mem: &GuestMemory) -> bool;

    /// Take the next entry from the available ring, `Ok(None)` if it is empty.
    /// An `Err` means the ring itself can no longer be read.
    ///
    /// # Arguments
    ///
    /// * `mem` - Guest memory holding the vring.
    /// * `features` - Bit mask of features negotiated by the backend and the frontend.
    fn pop_avail(&mut self, mem: &GuestMemory, features: u64) -> Result<Option<PoppedChain>>;

    /// Fill the used vring after processing the IO request.
    ///
    /// # Arguments
    ///
    /// * `mem` - Guest memory holding the vring.
    /// * `index` - Index of descriptor in the virqueue descriptor table.
    /// * `len` - Total length of the descriptor chain which was used (written to).
    fn add_used(&mut self, mem: &GuestMemory, index: u16, len: u32) -> Result<()>;

    /// Return true if guest needed to be notified.
    fn should_notify(&mut self, mem: &GuestMemory, features: u64) -> bool;

    /// Get the actual size of the vring.
    fn actual_size(&self) -> u16;

    /// Get the configuration of the vring.
    fn get_queue_config(&self) -> QueueConfig;

    /// The number of descriptor chains in the available ring.
    fn avail_ring_len(&mut self, mem: &GuestMemory) -> Result<u16>;

    /// Get the avail index of the vring.
    fn get_avail_idx(&self, mem: &GuestMemory) -> Result<u16>;

    /// Get the used index of the vring.
    fn get_used_idx(&self, mem: &GuestMemory) -> Result<u16>;

    /// Bound the number of descriptors accepted in one chain, indirect ones included.
    fn set_max_chain_len(&mut self, max: u16);
}

/// Virtio queue.
pub struct Queue {
    /// Vring structure.
    pub vring: Box<dyn VringOps + Send>,
}

impl Queue {
    /// Create a virtqueue.
    ///
    /// # Arguments
    ///
    /// * `queue_config` - Configuration of the vring.
    /// * `queue_type` - Type of virtqueue.
    pub fn new(queue_config: QueueConfig, queue_type: u16) -> Result<Self> {
        let vring: Box<dyn VringOps + Send> = match queue_type {
            QUEUE_TYPE_SPLIT_VRING => Box::new(SplitVring::new(queue_config)),
            _ => return Err(anyhow!(VirtioError::QueueType(queue_type))),
        };

        Ok(Queue { vring })
    }

    /// Return true if the virtqueue is enabled by driver.
    pub fn is_enabled(&self) -> bool {
        self.vring.is_enabled()
    }

    /// Return true if the memory layout of the virqueue is valid.
    pub fn is_valid(&self, mem: &GuestMemory) -> bool {
        self.vring.is_valid(mem)
    }
}
