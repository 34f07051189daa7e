// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
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

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem::size_of;
use std::rc::Rc;

use super::malloc::{round_up, GuestAllocator};
use crate::libtest::TestState;
use address_space::GuestAddress;
use util::byte_code::ByteCode;
use virtio::QueueConfig;

pub const VIRTIO_F_VERSION_1: u64 = 32;
pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;
pub const VRING_DESC_F_INDIRECT: u16 = 4;
pub const VRING_USED_F_NO_NOTIFY: u16 = 1;
pub const VIRTIO_PCI_VRING_ALIGN: u32 = 4096;
pub const VIRTIO_RING_F_INDIRECT_DESC: u64 = 28;
pub const VIRTIO_RING_F_EVENT_IDX: u64 = 29;
/// When host consumes a buffer, don't interrupt the guest.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

const VRING_AVAIL_IDX_OFFSET: u64 = 2;
const VRING_AVAIL_RING_OFFSET: u64 = 4;
const VRING_USED_IDX_OFFSET: u64 = 2;
const VRING_USED_RING_OFFSET: u64 = 4;

#[repr(C, packed(16))]
#[derive(Default, Copy, Clone, Debug)]
pub struct VringDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl ByteCode for VringDesc {}
pub static VRING_DESC_SIZE: u64 = size_of::<VringDesc>() as u64;

#[repr(C)]
#[derive(Default, Copy, Clone, Debug)]
pub struct VringUsedElem {
    pub id: u32,
    pub len: u32,
}

impl ByteCode for VringUsedElem {}

#[derive(Default)]
pub struct TestVringDescEntry {
    pub data: u64,
    pub len: u32,
    pub write: bool,
}

impl TestVringDescEntry {
    pub fn new(data: u64, len: u32, write: bool) -> Self {
        TestVringDescEntry { data, len, write }
    }
}

/// An indirect descriptor table built in guest memory.
#[derive(Default)]
pub struct TestVringIndirectDesc {
    pub desc: u64,
    pub index: u16,
    pub elem: u16,
}

impl TestVringIndirectDesc {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    pub fn setup(
        &mut self,
        alloc: Rc<RefCell<GuestAllocator>>,
        test_state: Rc<RefCell<TestState>>,
        elem: u16,
    ) {
        self.elem = elem;
        self.desc = alloc.borrow_mut().alloc(VRING_DESC_SIZE * u64::from(elem));

        for i in 0..elem {
            let desc = VringDesc {
                addr: 0,
                len: 0,
                flags: if i + 1 < elem { VRING_DESC_F_NEXT } else { 0 },
                next: i + 1,
            };
            test_state
                .borrow()
                .memwrite(self.desc + VRING_DESC_SIZE * u64::from(i), desc.as_bytes());
        }
    }

    pub fn add_desc(
        &mut self,
        test_state: Rc<RefCell<TestState>>,
        data: u64,
        len: u32,
        write: bool,
    ) {
        assert!(self.index < self.elem);

        let addr = self.desc + VRING_DESC_SIZE * u64::from(self.index);
        let mut desc = VringDesc::from_bytes(&test_state.borrow().memread(addr, VRING_DESC_SIZE))
            .unwrap();
        desc.addr = data;
        desc.len = len;
        if write {
            desc.flags |= VRING_DESC_F_WRITE;
        }
        test_state.borrow().memwrite(addr, desc.as_bytes());
        self.index += 1;
    }
}

/// Driver side of a split virtqueue.
#[derive(Default)]
pub struct TestVirtQueue {
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
    pub index: u16,
    pub size: u32,
    pub free_head: u32,
    pub align: u32,
    last_used_idx: u16,
    pub indirect: bool,
    pub event: bool,
    /// Used length of every returned head not yet taken by the test.
    pub desc_len: HashMap<u32, u32>,
}

impl TestVirtQueue {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    pub fn setup(
        &mut self,
        alloc: Rc<RefCell<GuestAllocator>>,
        index: u16,
        queue_size: u32,
        features: u64,
    ) {
        assert!(queue_size != 0);
        assert!(queue_size & (queue_size - 1) == 0);

        self.index = index;
        self.size = queue_size;
        self.free_head = 0;
        self.align = VIRTIO_PCI_VRING_ALIGN;
        self.indirect = (features & (1 << VIRTIO_RING_F_INDIRECT_DESC)) != 0;
        self.event = (features & (1 << VIRTIO_RING_F_EVENT_IDX)) != 0;

        let addr = alloc
            .borrow_mut()
            .alloc_pages(u64::from(get_vring_size(self.size, self.align)));
        self.desc = addr;
        self.avail = self.desc + u64::from(self.size) * VRING_DESC_SIZE;
        self.used = round_up(
            self.avail + (size_of::<u16>() as u64 * u64::from(3 + self.size)),
            u64::from(self.align),
        );
    }

    pub fn vring_init(&self, test_state: Rc<RefCell<TestState>>) {
        let state = test_state.borrow();
        state.memset(self.desc, u64::from(self.size) * VRING_DESC_SIZE, &[0]);
        // avail flags, idx, ring and used_event.
        state.memset(
            self.avail,
            VRING_AVAIL_RING_OFFSET + 2 * u64::from(self.size) + 2,
            &[0],
        );
        // used flags, idx, ring and avail_event.
        state.memset(
            self.used,
            VRING_USED_RING_OFFSET + 8 * u64::from(self.size) + 2,
            &[0],
        );
    }

    /// Ring addresses as handed to the engine by the transport.
    pub fn queue_config(&self) -> QueueConfig {
        let mut config = QueueConfig::new(self.size as u16);
        config.desc_table = GuestAddress(self.desc);
        config.avail_ring = GuestAddress(self.avail);
        config.used_ring = GuestAddress(self.used);
        config.size = self.size as u16;
        config.ready = true;
        config
    }

    pub fn used_idx(&self, test_state: Rc<RefCell<TestState>>) -> u16 {
        test_state
            .borrow()
            .readw(self.used + VRING_USED_IDX_OFFSET)
    }

    /// Get used elements from used ring and save to self.desc_len
    pub fn get_buf(&mut self, test_state: Rc<RefCell<TestState>>) -> bool {
        let mut ret = false;
        loop {
            let index = self.used_idx(test_state.clone());
            if index == self.last_used_idx {
                break;
            }

            let elem_addr = self.used
                + VRING_USED_RING_OFFSET
                + u64::from(u32::from(self.last_used_idx) % self.size)
                    * size_of::<VringUsedElem>() as u64;
            let elem = VringUsedElem::from_bytes(
                &test_state
                    .borrow()
                    .memread(elem_addr, size_of::<VringUsedElem>() as u64),
            )
            .unwrap();
            assert!(
                self.desc_len.insert(elem.id, elem.len).is_none(),
                "head {} returned twice",
                elem.id
            );

            self.last_used_idx = self.last_used_idx.wrapping_add(1);
            ret = true;
        }
        ret
    }

    pub fn get_avail_event(&self, test_state: Rc<RefCell<TestState>>) -> u16 {
        assert!(self.event);

        test_state.borrow().readw(
            self.used + VRING_USED_RING_OFFSET + 8 * u64::from(self.size),
        )
    }

    pub fn set_used_event(&self, test_state: Rc<RefCell<TestState>>, index: u16) {
        test_state.borrow().writew(
            self.avail + VRING_AVAIL_RING_OFFSET + 2 * u64::from(self.size),
            index,
        );
    }

    pub fn set_avail_flags(&self, test_state: Rc<RefCell<TestState>>, flags: u16) {
        test_state.borrow().writew(self.avail, flags);
    }

    /// Publish `desc_idx` in the avail ring.
    pub fn update_avail(&self, test_state: Rc<RefCell<TestState>>, desc_idx: u32) {
        let state = test_state.borrow();
        let idx = state.readw(self.avail + VRING_AVAIL_IDX_OFFSET);
        if self.event {
            self.set_used_event(test_state.clone(), idx);
        }
        state.writew(
            self.avail + VRING_AVAIL_RING_OFFSET + 2 * u64::from(u32::from(idx) % self.size),
            desc_idx as u16,
        );
        state.writew(self.avail + VRING_AVAIL_IDX_OFFSET, idx.wrapping_add(1));
    }

    pub fn add(
        &mut self,
        test_state: Rc<RefCell<TestState>>,
        data: u64,
        len: u32,
        write: bool,
    ) -> u32 {
        self.add_chained(test_state, vec![TestVringDescEntry::new(data, len, write)])
    }

    pub fn add_chained(
        &mut self,
        test_state: Rc<RefCell<TestState>>,
        data_entries: Vec<TestVringDescEntry>,
    ) -> u32 {
        let free_head = self.free_head;

        for (i, entry) in data_entries.iter().enumerate() {
            let mut flags: u16 = 0;
            let mut next_desc = 0;
            if entry.write {
                flags |= VRING_DESC_F_WRITE;
            }
            if i < data_entries.len() - 1 {
                flags |= VRING_DESC_F_NEXT;
                next_desc = (self.free_head + 1) % self.size;
            }

            let desc_elem = VringDesc {
                addr: entry.data,
                len: entry.len,
                flags,
                next: next_desc as u16,
            };
            self.add_elem_to_desc(test_state.clone(), desc_elem);
        }
        self.update_avail(test_state, free_head);
        free_head
    }

    pub fn add_indirect(
        &mut self,
        test_state: Rc<RefCell<TestState>>,
        indirect: TestVringIndirectDesc,
        mixed: bool,
    ) -> u32 {
        assert!(indirect.index >= indirect.elem);

        let free_head = self.free_head;
        let desc_elem = VringDesc {
            addr: indirect.desc,
            len: VRING_DESC_SIZE as u32 * u32::from(indirect.elem),
            flags: VRING_DESC_F_INDIRECT,
            next: 0,
        };
        self.add_elem_to_desc(test_state.clone(), desc_elem);
        if !mixed {
            self.update_avail(test_state, free_head);
        }
        free_head
    }

    /// Write `desc` as is into the next free slot of the table, without publishing it.
    pub fn add_raw_desc(&mut self, test_state: Rc<RefCell<TestState>>, desc: VringDesc) -> u32 {
        let index = self.free_head;
        self.add_elem_to_desc(test_state, desc);
        index
    }

    // Add a vring desc elem to desc table.
    fn add_elem_to_desc(&mut self, test_state: Rc<RefCell<TestState>>, elem: VringDesc) {
        let desc_elem_addr = self.desc + VRING_DESC_SIZE * u64::from(self.free_head);
        test_state
            .borrow()
            .memwrite(desc_elem_addr, elem.as_bytes());
        self.free_head = (self.free_head + 1) % self.size;
    }
}

#[inline]
pub fn get_vring_size(num: u32, align: u32) -> u32 {
    let desc_avail =
        (size_of::<VringDesc>() as u32 * num + size_of::<u16>() as u32 * (3 + num)) as u64;
    let desc_avail_align = round_up(desc_avail, u64::from(align)) as u32;
    desc_avail_align + size_of::<u16>() as u32 * 3 + size_of::<VringUsedElem>() as u32 * num
}
