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

use std::cmp::min;
use std::mem::size_of;
use std::num::Wrapping;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use log::{error, trace, warn};

use super::{
    checked_offset_mem, ElemIovec, Element, PoppedChain, VringOps, VIRTQ_DESC_F_INDIRECT,
    VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
};
use crate::{virtio_has_feature, VirtioError, VIRTIO_F_RING_EVENT_IDX};
use address_space::{GuestAddress, GuestMemory};
use util::byte_code::ByteCode;

/// When host consumes a buffer, don't interrupt the guest.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;
/// When guest produces a buffer, don't notify the host.
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;

/// Max total len of a descriptor chain.
const DESC_CHAIN_MAX_TOTAL_LEN: u64 = 1u64 << 32;
/// The length of used element.
const USEDELEM_LEN: u64 = size_of::<UsedElem>() as u64;
/// The length of avail element.
const AVAILELEM_LEN: u64 = size_of::<u16>() as u64;
/// The length of available ring except array of avail element(flags: u16 idx: u16 used_event: u16).
const VRING_AVAIL_LEN_EXCEPT_AVAILELEM: u64 = (size_of::<u16>() * 3) as u64;
/// The length of used ring except array of used element(flags: u16 idx: u16 avail_event: u16).
const VRING_USED_LEN_EXCEPT_USEDELEM: u64 = (size_of::<u16>() * 3) as u64;
/// The length of flags(u16) and idx(u16).
const VRING_FLAGS_AND_IDX_LEN: u64 = size_of::<SplitVringFlagsIdx>() as u64;
/// The position of idx in the available ring and the used ring.
const VRING_IDX_POSITION: u64 = size_of::<u16>() as u64;
/// The length of virtio descriptor.
pub const DESCRIPTOR_LEN: u64 = size_of::<SplitVringDesc>() as u64;

/// The configuration of virtqueue.
#[derive(Default, Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Guest physical address of the descriptor table.
    pub desc_table: GuestAddress,
    /// Guest physical address of the available ring.
    pub avail_ring: GuestAddress,
    /// Guest physical address of the used ring.
    pub used_ring: GuestAddress,
    /// The maximal size of elements offered by the device.
    pub max_size: u16,
    /// The queue size set by the guest.
    pub size: u16,
    /// Virtual queue ready bit.
    pub ready: bool,
    /// Most descriptors accepted in one chain, indirect entries included.
    pub max_chain_len: u16,
    /// The next index which can be popped in the available vring.
    next_avail: Wrapping<u16>,
    /// The next index which can be pushed in the used vring.
    next_used: Wrapping<u16>,
    /// The index of last descriptor used which has triggered interrupt.
    last_signal_used: Wrapping<u16>,
    /// The last_signal_used is valid or not.
    signal_used_valid: bool,
}

impl QueueConfig {
    /// Create configuration for a virtqueue.
    ///
    /// # Arguments
    ///
    /// * `max_size` - The maximum size of the virtqueue.
    pub fn new(max_size: u16) -> Self {
        QueueConfig {
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            max_size,
            size: max_size,
            ready: false,
            max_chain_len: max_size,
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
            last_signal_used: Wrapping(0),
            signal_used_valid: false,
        }
    }

    /// Resume a ring whose first `base` entries were already consumed and completed.
    pub fn set_vring_base(&mut self, base: u16) {
        self.next_avail = Wrapping(base);
        self.next_used = Wrapping(base);
        self.signal_used_valid = false;
    }

    /// The next avail index to consume, reported back to the transport on stop.
    pub fn vring_base(&self) -> u16 {
        self.next_avail.0
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.max_size);
    }
}

/// Virtio used element.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct UsedElem {
    /// Index of descriptor in the virqueue descriptor table.
    pub id: u32,
    /// Total length of the descriptor chain which was used (written to).
    pub len: u32,
}

impl ByteCode for UsedElem {}

/// A struct including flags and idx for avail vring and used vring.
#[repr(C)]
#[derive(Default, Clone, Copy)]
struct SplitVringFlagsIdx {
    flags: u16,
    idx: u16,
}

impl ByteCode for SplitVringFlagsIdx {}

struct DescInfo {
    /// The guest address of the descriptor table.
    table: GuestAddress,
    /// The size of the descriptor table.
    size: u16,
    /// The index of the current descriptor table.
    index: u16,
    /// The descriptor table.
    desc: SplitVringDesc,
}

/// Descriptor of split vring.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct SplitVringDesc {
    /// Address (guest-physical).
    pub addr: GuestAddress,
    /// Length.
    pub len: u32,
    /// The flags as indicated above.
    pub flags: u16,
    /// We chain unused descriptors via this, too.
    pub next: u16,
}

impl ByteCode for SplitVringDesc {}

impl SplitVringDesc {
    /// Read and check one descriptor of a table.
    ///
    /// # Arguments
    ///
    /// * `mem` - Guest memory holding the table.
    /// * `desc_table` - Guest address of the descriptor table.
    /// * `queue_size` - Number of entries in the table.
    /// * `index` - Index of descriptor in the table.
    fn new(mem: &GuestMemory, desc_table: GuestAddress, queue_size: u16, index: u16) -> Result<Self> {
        if index >= queue_size {
            return Err(anyhow!(VirtioError::QueueIndex(index, queue_size)));
        }

        let offset = u64::from(index) * DESCRIPTOR_LEN;
        let desc_addr = desc_table.checked_add(offset).ok_or_else(|| {
            anyhow!(VirtioError::AddressOverflow(
                "creating a descriptor",
                desc_table.raw_value(),
                offset
            ))
        })?;
        let desc = mem
            .read_object::<SplitVringDesc>(desc_addr)
            .with_context(|| VirtioError::ReadObjectErr("a descriptor", desc_addr.raw_value()))?;

        desc.check(mem, queue_size)?;
        Ok(desc)
    }

    /// Indirect descriptors get their table range checked only after the
    /// entry count has been accepted.
    fn check(&self, mem: &GuestMemory, queue_size: u16) -> Result<()> {
        if self.len == 0 {
            bail!("Zero sized buffers are not allowed");
        }
        if self.has_next() && self.next >= queue_size {
            bail!(
                "The next index {} exceed queue size {}",
                self.next,
                queue_size
            );
        }
        if !self.is_indirect_desc() {
            self.check_range(mem)?;
        }
        Ok(())
    }

    fn check_range(&self, mem: &GuestMemory) -> Result<()> {
        checked_offset_mem(mem, self.addr, u64::from(self.len))
            .with_context(|| "The memory of descriptor is invalid")?;
        Ok(())
    }

    /// Return true if this descriptor has next descriptor.
    fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    /// Check whether this descriptor is write-only or read-only.
    /// Write-only means that the emulated device can write and the driver can read.
    fn write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    /// Return true if this descriptor is a indirect descriptor.
    fn is_indirect_desc(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }

    /// The len can be divided evenly by the size of descriptor and can not be zero.
    fn check_indirect(&self) -> Result<()> {
        if self.len == 0 || u64::from(self.len) % DESCRIPTOR_LEN != 0 {
            bail!("The indirect descriptor is invalid, len: {}", self.len);
        }
        if self.has_next() {
            bail!("INDIRECT and NEXT flag should not be used together");
        }
        Ok(())
    }

    /// Get the num of descriptor in the table of indirect descriptor.
    fn get_desc_num(&self) -> u32 {
        (u64::from(self.len) / DESCRIPTOR_LEN) as u32
    }

    /// Walk the chain starting at `desc_info`, filling `elem` as segments pass validation.
    ///
    /// On error `elem` keeps the segments accepted so far.
    fn get_element(
        mem: &GuestMemory,
        desc_info: &DescInfo,
        max_chain_len: u16,
        elem: &mut Element,
    ) -> Result<()> {
        let mut table = desc_info.table;
        let mut table_size = desc_info.size;
        let mut desc = desc_info.desc;
        let budget = u32::from(max_chain_len.max(1));
        let mut walked_in_table: u16 = 0;
        let mut indirect = false;
        let mut write_elem_count: u32 = 0;
        let mut desc_total_len: u64 = 0;
        elem.index = desc_info.index;

        loop {
            if desc.is_indirect_desc() {
                desc.check_indirect()?;
                if indirect {
                    return Err(anyhow!(VirtioError::IndirectNested));
                }
                indirect = true;

                let count = desc.get_desc_num();
                let remaining = budget - u32::from(elem.desc_num);
                if count > remaining {
                    return Err(anyhow!(VirtioError::IndirectTooLong(count, remaining)));
                }
                desc.check_range(mem)
                    .with_context(|| "Invalid indirect descriptor table")?;
                table = desc.addr;
                table_size = count as u16;
                walked_in_table = 0;
                desc = Self::new(mem, table, table_size, 0)
                    .with_context(|| "Failed to read indirect descriptor 0")?;
                continue;
            }

            if u32::from(elem.desc_num) >= budget {
                return Err(anyhow!(VirtioError::ChainTooLong(budget)));
            }
            if walked_in_table >= table_size {
                bail!(
                    "Descriptor chain loops in a table of {} entries",
                    table_size
                );
            }

            let iovec = ElemIovec {
                addr: desc.addr,
                len: desc.len,
            };
            if desc.write_only() {
                elem.in_iovec.push(iovec);
                write_elem_count += 1;
            } else {
                if write_elem_count > 0 {
                    return Err(anyhow!(VirtioError::DescOrder));
                }
                elem.out_iovec.push(iovec);
            }
            elem.desc_num += 1;
            walked_in_table += 1;
            desc_total_len += u64::from(iovec.len);

            if !desc.has_next() {
                break;
            }
            let next = desc.next;
            desc = Self::new(mem, table, table_size, next)
                .with_context(|| format!("Failed to find next descriptor {}", next))?;
        }

        if desc_total_len > DESC_CHAIN_MAX_TOTAL_LEN {
            return Err(anyhow!(VirtioError::ChainTotalLen(desc_total_len)));
        }

        Ok(())
    }
}

/// Split vring.
#[derive(Default, Clone, Copy)]
pub struct SplitVring {
    /// The configuration of virtqueue.
    queue_config: QueueConfig,
}

impl Deref for SplitVring {
    type Target = QueueConfig;
    fn deref(&self) -> &Self::Target {
        &self.queue_config
    }
}

impl DerefMut for SplitVring {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.queue_config
    }
}

impl SplitVring {
    /// Create a split vring.
    ///
    /// # Arguments
    ///
    /// * `queue_config` - Configuration of the vring.
    pub fn new(queue_config: QueueConfig) -> Self {
        SplitVring { queue_config }
    }

    /// The actual size of the queue.
    fn actual_size(&self) -> u16 {
        min(self.size, self.max_size)
    }

    /// Get the flags and idx of the available ring from guest memory.
    fn get_avail_flags_idx(&self, mem: &GuestMemory) -> Result<SplitVringFlagsIdx> {
        mem.read_object::<SplitVringFlagsIdx>(self.avail_ring)
            .with_context(|| {
                VirtioError::ReadObjectErr("avail flags idx", self.avail_ring.raw_value())
            })
    }

    /// Get the idx of the available ring from guest memory.
    fn get_avail_idx(&self, mem: &GuestMemory) -> Result<u16> {
        let flags_idx = self.get_avail_flags_idx(mem)?;
        Ok(flags_idx.idx)
    }

    /// Get the flags of the available ring from guest memory.
    fn get_avail_flags(&self, mem: &GuestMemory) -> Result<u16> {
        let flags_idx = self.get_avail_flags_idx(mem)?;
        Ok(flags_idx.flags)
    }

    /// Get the flags and idx of the used ring from guest memory.
    fn get_used_flags_idx(&self, mem: &GuestMemory) -> Result<SplitVringFlagsIdx> {
        // Make sure the idx read from guest memory is new.
        fence(Ordering::SeqCst);
        mem.read_object::<SplitVringFlagsIdx>(self.used_ring)
            .with_context(|| VirtioError::ReadObjectErr("used flags idx", self.used_ring.raw_value()))
    }

    /// Get the index of the used ring from guest memory.
    fn get_used_idx(&self, mem: &GuestMemory) -> Result<u16> {
        let flag_idx = self.get_used_flags_idx(mem)?;
        Ok(flag_idx.idx)
    }

    /// Set the avail idx to the field of the event index for the available ring.
    fn set_avail_event(&self, mem: &GuestMemory, event_idx: u16) -> Result<()> {
        trace!("vring {:p} set avail event {}", self, event_idx);
        let avail_event_offset =
            VRING_FLAGS_AND_IDX_LEN + USEDELEM_LEN * u64::from(self.actual_size());

        // The used ring range with avail_event has been checked in is_invalid_memory.
        mem.write_object(&event_idx, self.used_ring.unchecked_add(avail_event_offset))
            .with_context(|| {
                format!(
                    "Failed to set avail event idx, used_ring: 0x{:X}, offset: {}",
                    self.used_ring.raw_value(),
                    avail_event_offset,
                )
            })?;
        // Make sure the data has been set.
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Get the event index of the used ring from guest memory.
    fn get_used_event(&self, mem: &GuestMemory) -> Result<u16> {
        let used_event_offset =
            VRING_FLAGS_AND_IDX_LEN + AVAILELEM_LEN * u64::from(self.actual_size());
        // Make sure the event idx read from guest memory is new.
        fence(Ordering::SeqCst);
        let used_event_addr = self.avail_ring.unchecked_add(used_event_offset);
        mem.read_object::<u16>(used_event_addr)
            .with_context(|| VirtioError::ReadObjectErr("used event id", used_event_addr.raw_value()))
    }

    /// Return true if VRING_AVAIL_F_NO_INTERRUPT is set.
    fn is_avail_ring_no_interrupt(&self, mem: &GuestMemory) -> bool {
        match self.get_avail_flags(mem) {
            Ok(avail_flags) => (avail_flags & VRING_AVAIL_F_NO_INTERRUPT) != 0,
            Err(ref e) => {
                warn!(
                    "Failed to get the status for VRING_AVAIL_F_NO_INTERRUPT {:?}",
                    e
                );
                false
            }
        }
    }

    /// Return true if it's required to trigger interrupt for the used vring.
    fn used_ring_need_event(&mut self, mem: &GuestMemory) -> bool {
        let old = self.last_signal_used;
        let new = self.next_used;

        let used_event_idx = match self.get_used_event(mem) {
            Ok(idx) => Wrapping(idx),
            Err(ref e) => {
                error!("Failed to get the status for notifying used vring: {:?}", e);
                return false;
            }
        };

        let valid = self.signal_used_valid;
        self.signal_used_valid = true;
        self.last_signal_used = new;
        !valid || (new - used_event_idx - Wrapping(1)) < (new - old)
    }

    fn is_overlap(
        start1: GuestAddress,
        end1: GuestAddress,
        start2: GuestAddress,
        end2: GuestAddress,
    ) -> bool {
        !(start1 >= end2 || start2 >= end1)
    }

    fn is_invalid_memory(&self, mem: &GuestMemory, actual_size: u64) -> bool {
        let desc_len = DESCRIPTOR_LEN * actual_size;
        let desc_table_end = match checked_offset_mem(mem, self.desc_table, desc_len) {
            Ok(addr) => addr,
            Err(ref e) => {
                error!(
                    "descriptor table is out of bounds: start:0x{:X} size:{} {:?}",
                    self.desc_table.raw_value(),
                    desc_len,
                    e
                );
                return true;
            }
        };

        let avail_len = VRING_AVAIL_LEN_EXCEPT_AVAILELEM + AVAILELEM_LEN * actual_size;
        let desc_avail_end = match checked_offset_mem(mem, self.avail_ring, avail_len) {
            Ok(addr) => addr,
            Err(ref e) => {
                error!(
                    "avail ring is out of bounds: start:0x{:X} size:{} {:?}",
                    self.avail_ring.raw_value(),
                    avail_len,
                    e
                );
                return true;
            }
        };

        let used_len = VRING_USED_LEN_EXCEPT_USEDELEM + USEDELEM_LEN * actual_size;
        let desc_used_end = match checked_offset_mem(mem, self.used_ring, used_len) {
            Ok(addr) => addr,
            Err(ref e) => {
                error!(
                    "used ring is out of bounds: start:0x{:X} size:{} {:?}",
                    self.used_ring.raw_value(),
                    used_len,
                    e,
                );
                return true;
            }
        };

        if SplitVring::is_overlap(
            self.desc_table,
            desc_table_end,
            self.avail_ring,
            desc_avail_end,
        ) || SplitVring::is_overlap(
            self.avail_ring,
            desc_avail_end,
            self.used_ring,
            desc_used_end,
        ) || SplitVring::is_overlap(
            self.desc_table,
            desc_table_end,
            self.used_ring,
            desc_used_end,
        ) {
            error!("The memory of descriptor table: 0x{:X}, avail ring: 0x{:X} or used ring: 0x{:X} is overlapped. queue size:{}",
                   self.desc_table.raw_value(), self.avail_ring.raw_value(), self.used_ring.raw_value(), actual_size);
            return true;
        }

        if self.desc_table.0 & 0xf != 0 {
            error!(
                "descriptor table: 0x{:X} is not aligned",
                self.desc_table.raw_value()
            );
            true
        } else if self.avail_ring.0 & 0x1 != 0 {
            error!(
                "avail ring: 0x{:X} is not aligned",
                self.avail_ring.raw_value()
            );
            true
        } else if self.used_ring.0 & 0x3 != 0 {
            error!(
                "used ring: 0x{:X} is not aligned",
                self.used_ring.raw_value()
            );
            true
        } else {
            false
        }
    }

    /// Read the chain head published at avail position `next_avail`.
    fn read_avail_head(&self, mem: &GuestMemory, next_avail: Wrapping<u16>) -> Result<u16> {
        let index_offset =
            VRING_FLAGS_AND_IDX_LEN + AVAILELEM_LEN * u64::from(next_avail.0 % self.actual_size());
        let desc_index_addr = self.avail_ring.unchecked_add(index_offset);
        mem.read_object::<u16>(desc_index_addr).with_context(|| {
            VirtioError::ReadObjectErr("the index of descriptor", desc_index_addr.raw_value())
        })
    }

    fn read_chain(&self, mem: &GuestMemory, head: u16, elem: &mut Element) -> Result<()> {
        let size = self.actual_size();
        let desc = SplitVringDesc::new(mem, self.desc_table, size, head)?;
        let desc_info = DescInfo {
            table: self.desc_table,
            size,
            index: head,
            desc,
        };
        SplitVringDesc::get_element(mem, &desc_info, self.max_chain_len, elem)
    }
}

impl VringOps for SplitVring {
    fn is_enabled(&self) -> bool {
        self.ready
    }

    fn is_valid(&self, mem: &GuestMemory) -> bool {
        let size = u64::from(self.actual_size());
        if !self.ready {
            error!("The configuration of vring is not ready");
            false
        } else if self.size > self.max_size || self.size == 0 || (self.size & (self.size - 1)) != 0
        {
            error!(
                "vring with invalid size:{} max size:{}",
                self.size, self.max_size
            );
            false
        } else {
            !self.is_invalid_memory(mem, size)
        }
    }

    fn pop_avail(&mut self, mem: &GuestMemory, features: u64) -> Result<Option<PoppedChain>> {
        if !self.is_enabled() || self.avail_ring_len(mem)? == 0 {
            return Ok(None);
        }

        // Make sure descriptor read does not bypass avail index read.
        fence(Ordering::Acquire);

        let head = self.read_avail_head(mem, self.next_avail)?;
        // Suppress queue notification related to current processing desc chain.
        if virtio_has_feature(features, VIRTIO_F_RING_EVENT_IDX) {
            self.set_avail_event(mem, (self.next_avail + Wrapping(1)).0)
                .with_context(|| "Failed to set avail event for popping avail ring")?;
        }
        self.next_avail += Wrapping(1);

        let size = self.actual_size();
        if head >= size {
            return Ok(Some(PoppedChain::Discarded {
                head,
                error: anyhow!(VirtioError::QueueIndex(head, size)),
            }));
        }

        let mut element = Element::new(head);
        match self.read_chain(mem, head, &mut element) {
            Ok(()) => {
                trace!(
                    "vring {:p} pop head {} out {} in {}",
                    self,
                    head,
                    element.out_iovec.len(),
                    element.in_iovec.len()
                );
                Ok(Some(PoppedChain::Element(element)))
            }
            Err(e) => Ok(Some(PoppedChain::Malformed {
                index: head,
                partial: element,
                error: e.context(format!("Malformed descriptor chain {}", head)),
            })),
        }
    }

    fn add_used(&mut self, mem: &GuestMemory, index: u16, len: u32) -> Result<()> {
        if index >= self.actual_size() {
            return Err(anyhow!(VirtioError::QueueIndex(index, self.actual_size())));
        }

        let next_used = u64::from(self.next_used.0 % self.actual_size());
        trace!(
            "vring {:p} add used slot {} head {} len {}",
            self,
            next_used,
            index,
            len
        );
        let used_elem_addr = self
            .used_ring
            .unchecked_add(VRING_FLAGS_AND_IDX_LEN + next_used * USEDELEM_LEN);
        let used_elem = UsedElem {
            id: u32::from(index),
            len,
        };
        mem.write_object::<UsedElem>(&used_elem, used_elem_addr)
            .with_context(|| "Failed to write object for used element")?;
        // Make sure used element is filled before updating used idx.
        fence(Ordering::Release);

        self.next_used += Wrapping(1);
        mem.write_object(
            &(self.next_used.0),
            self.used_ring.unchecked_add(VRING_IDX_POSITION),
        )
        .with_context(|| "Failed to write next used idx")?;
        // Make sure used index is exposed before notifying guest.
        fence(Ordering::SeqCst);

        // Do we wrap around?
        if self.next_used == self.last_signal_used {
            self.signal_used_valid = false;
        }
        Ok(())
    }

    fn should_notify(&mut self, mem: &GuestMemory, features: u64) -> bool {
        if virtio_has_feature(features, VIRTIO_F_RING_EVENT_IDX) {
            self.used_ring_need_event(mem)
        } else {
            !self.is_avail_ring_no_interrupt(mem)
        }
    }

    fn actual_size(&self) -> u16 {
        self.actual_size()
    }

    fn get_queue_config(&self) -> QueueConfig {
        let mut config = self.queue_config;
        config.signal_used_valid = false;
        config
    }

    fn avail_ring_len(&mut self, mem: &GuestMemory) -> Result<u16> {
        let avail_idx = self.get_avail_idx(mem).map(Wrapping)?;

        Ok((avail_idx - self.next_avail).0)
    }

    fn get_avail_idx(&self, mem: &GuestMemory) -> Result<u16> {
        SplitVring::get_avail_idx(self, mem)
    }

    fn get_used_idx(&self, mem: &GuestMemory) -> Result<u16> {
        SplitVring::get_used_idx(self, mem)
    }

    fn set_max_chain_len(&mut self, max: u16) {
        self.max_chain_len = max;
    }
}
