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

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use util::aio::{iov_from_buf_direct, iov_to_buf_direct, Iovec};
use util::byte_code::ByteCode;

use crate::{AddressSpaceError, GuestAddress, HostMemMapping};

/// Bounds-checked view of guest RAM.
///
/// Every guest-controlled address goes through this object before being
/// dereferenced, so an untrusted offset can never reach memory outside the
/// mappings it was built from.
#[derive(Debug, Clone)]
pub struct GuestMemory {
    /// Sorted by guest base address, never overlapping.
    regions: Vec<Arc<HostMemMapping>>,
}

impl GuestMemory {
    /// Build the view from the mappings handed over by the transport.
    pub fn new(mut mappings: Vec<HostMemMapping>) -> Result<Self> {
        mappings.sort_by_key(|m| m.start_address());
        for pair in mappings.windows(2) {
            if pair[0].range().find_intersection(pair[1].range()).is_some() {
                return Err(anyhow!(AddressSpaceError::Overlap(
                    pair[1].start_address().raw_value(),
                    pair[1].size()
                )));
            }
        }
        Ok(GuestMemory {
            regions: mappings.into_iter().map(Arc::new).collect(),
        })
    }

    /// Convenience constructor: one anonymous region `[0, size)`.
    pub fn with_size(size: u64) -> Result<Self> {
        Self::new(vec![HostMemMapping::new(GuestAddress(0), size, false)?])
    }

    fn find_region(&self, addr: GuestAddress) -> Option<&Arc<HostMemMapping>> {
        let idx = match self
            .regions
            .binary_search_by_key(&addr, |r| r.start_address())
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let region = &self.regions[idx];
        if region.range().contains(addr, 1) {
            Some(region)
        } else {
            None
        }
    }

    /// Check that `[addr, addr + size)` lies inside one region.
    pub fn address_in_memory(&self, addr: GuestAddress, size: u64) -> bool {
        self.find_region(addr)
            .map_or(false, |r| r.range().contains(addr, size))
    }

    /// Host address of `[addr, addr + size)` if it lies inside one region.
    pub fn get_host_address(&self, addr: GuestAddress, size: u64) -> Option<u64> {
        let region = self.find_region(addr)?;
        if !region.range().contains(addr, size) {
            return None;
        }
        Some(region.host_address() + addr.offset_from(region.start_address()))
    }

    /// Translate `[addr, addr + count)` into host segments. The range may cross
    /// adjacent regions but must not touch a hole.
    pub fn get_address_map(&self, addr: GuestAddress, count: u64) -> Result<Vec<Iovec>> {
        let mut iovecs = Vec::new();
        let mut cur = addr;
        let mut left = count;
        if count != 0 && addr.checked_add(count - 1).is_none() {
            return Err(anyhow!(AddressSpaceError::Overflow(addr.raw_value())));
        }
        while left > 0 {
            let region = self
                .find_region(cur)
                .ok_or_else(|| anyhow!(AddressSpaceError::OutOfRange(addr.raw_value(), count)))?;
            let offset = cur.offset_from(region.start_address());
            let len = std::cmp::min(left, region.size() - offset);
            iovecs.push(Iovec::new(region.host_address() + offset, len));
            left -= len;
            if left > 0 {
                cur = cur
                    .checked_add(len)
                    .ok_or_else(|| anyhow!(AddressSpaceError::Overflow(cur.raw_value())))?;
            }
        }
        Ok(iovecs)
    }

    /// Fill `buf` from guest memory at `addr`.
    pub fn read(&self, buf: &mut [u8], addr: GuestAddress) -> Result<()> {
        let iovecs = self.get_address_map(addr, buf.len() as u64)?;
        iov_to_buf_direct(&iovecs, 0, buf)?;
        Ok(())
    }

    /// Copy `buf` into guest memory at `addr`.
    pub fn write(&self, buf: &[u8], addr: GuestAddress) -> Result<()> {
        let iovecs = self.get_address_map(addr, buf.len() as u64)?;
        iov_from_buf_direct(&iovecs, buf)?;
        Ok(())
    }

    /// Write an object to memory.
    ///
    /// # Note
    /// To use this method, it is necessary to implement `ByteCode` trait for your object.
    pub fn write_object<T: ByteCode>(&self, data: &T, addr: GuestAddress) -> Result<()> {
        self.write(data.as_bytes(), addr)
            .with_context(|| format!("Failed to write object at 0x{:x}", addr.raw_value()))
    }

    /// Read some data from memory to form an object.
    pub fn read_object<T: ByteCode>(&self, addr: GuestAddress) -> Result<T> {
        let mut obj = T::default();
        self.read(obj.as_mut_bytes(), addr)
            .with_context(|| format!("Failed to read object at 0x{:x}", addr.raw_value()))?;
        Ok(obj)
    }

    /// Return the end address of the highest region.
    pub fn memory_end_address(&self) -> GuestAddress {
        self.regions.last().map_or(GuestAddress(0), |r| {
            r.start_address().unchecked_add(r.size())
        })
    }
}
