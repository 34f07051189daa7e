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

use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use address_space::{GuestAddress, GuestMemory};
use util::byte_code::ByteCode;

/// Guest memory of a test case.
pub const TEST_MEM_SIZE: u64 = 64 * 1024 * 1024;

static LOGGER_INIT: Once = Once::new();

/// Guest side view of the memory shared with the engine.
pub struct TestState {
    mem: Arc<GuestMemory>,
}

impl TestState {
    pub fn new(mem_size: u64) -> Self {
        let mem = GuestMemory::with_size(mem_size).unwrap();
        TestState { mem: Arc::new(mem) }
    }

    pub fn mem(&self) -> Arc<GuestMemory> {
        self.mem.clone()
    }

    fn read<T: ByteCode>(&self, addr: u64) -> T {
        self.mem.read_object::<T>(GuestAddress(addr)).unwrap()
    }

    fn write<T: ByteCode>(&self, addr: u64, data: T) {
        self.mem.write_object(&data, GuestAddress(addr)).unwrap();
    }

    pub fn readb(&self, addr: u64) -> u8 {
        self.read(addr)
    }

    pub fn readw(&self, addr: u64) -> u16 {
        self.read(addr)
    }

    pub fn readl(&self, addr: u64) -> u32 {
        self.read(addr)
    }

    pub fn readq(&self, addr: u64) -> u64 {
        self.read(addr)
    }

    pub fn memread(&self, addr: u64, size: u64) -> Vec<u8> {
        let mut data = vec![0_u8; size as usize];
        self.mem.read(&mut data, GuestAddress(addr)).unwrap();
        data
    }

    pub fn writeb(&self, addr: u64, data: u8) {
        self.write(addr, data);
    }

    pub fn writew(&self, addr: u64, data: u16) {
        self.write(addr, data);
    }

    pub fn writel(&self, addr: u64, data: u32) {
        self.write(addr, data);
    }

    pub fn writeq(&self, addr: u64, data: u64) {
        self.write(addr, data);
    }

    pub fn memwrite(&self, addr: u64, data: &[u8]) {
        self.mem.write(data, GuestAddress(addr)).unwrap();
    }

    pub fn memset(&self, addr: u64, size: u64, pat: &[u8]) {
        let data: Vec<u8> = pat.iter().copied().cycle().take(size as usize).collect();
        self.memwrite(addr, &data);
    }

    /// Let the poller run for `ns` nanoseconds.
    pub fn clock_step_ns(&self, ns: u64) {
        thread::sleep(Duration::from_nanos(ns));
    }
}

pub fn test_init(mem_size: u64) -> TestState {
    LOGGER_INIT.call_once(|| {
        if let Err(e) = util::logger::init_logger(None) {
            eprintln!("Failed to init logger: {:?}", e);
        }
    });
    TestState::new(mem_size)
}
