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

use anyhow::{anyhow, Context, Result};
use log::error;
use util::unix::do_mmap;

use crate::{AddressRange, AddressSpaceError, GuestAddress};

/// One contiguous piece of guest RAM visible in this process.
///
/// The mapping is either created here (anonymous, released on drop) or
/// supplied by the transport, which keeps ownership of it.
#[derive(Debug)]
pub struct HostMemMapping {
    /// Record the range of one memory segment.
    address_range: AddressRange,
    /// The start address of mapped memory.
    host_addr: *mut u8,
    /// Unmap on drop.
    owned: bool,
}

// Send and Sync is not auto-implemented for raw pointer type.
// The fields never change once initialized, only the pointed-to bytes are accessed.
unsafe impl Send for HostMemMapping {}
unsafe impl Sync for HostMemMapping {}

impl HostMemMapping {
    /// Allocate an anonymous mapping backing `size` bytes of guest RAM at `guest_addr`.
    ///
    /// # Arguments
    ///
    /// * `guest_addr` - Base GPA.
    /// * `size` - Size of memory that will be mapped.
    /// * `dump_guest_core` - Dump guest memory during coredump or not.
    pub fn new(guest_addr: GuestAddress, size: u64, dump_guest_core: bool) -> Result<Self> {
        if size == 0 {
            return Err(anyhow!(AddressSpaceError::EmptyRegion(guest_addr.0)));
        }
        if guest_addr.checked_add(size - 1).is_none() {
            return Err(anyhow!(AddressSpaceError::Overflow(guest_addr.0)));
        }
        let host_addr = do_mmap(size, dump_guest_core)
            .with_context(|| format!("Failed to map guest ram at 0x{:x}", guest_addr.0))?;

        Ok(Self {
            address_range: AddressRange::new(guest_addr, size),
            host_addr: host_addr as *mut u8,
            owned: true,
        })
    }

    /// Wrap a mapping established by the transport.
    ///
    /// # Safety
    ///
    /// `host_addr` must point to `size` readable and writable bytes that stay
    /// mapped for the lifetime of the returned object.
    pub unsafe fn from_raw(guest_addr: GuestAddress, host_addr: u64, size: u64) -> Result<Self> {
        if size == 0 || host_addr == 0 {
            return Err(anyhow!(AddressSpaceError::EmptyRegion(guest_addr.0)));
        }
        if guest_addr.checked_add(size - 1).is_none() || host_addr.checked_add(size - 1).is_none()
        {
            return Err(anyhow!(AddressSpaceError::Overflow(guest_addr.0)));
        }
        Ok(Self {
            address_range: AddressRange::new(guest_addr, size),
            host_addr: host_addr as *mut u8,
            owned: false,
        })
    }

    pub fn size(&self) -> u64 {
        self.address_range.size
    }

    pub fn start_address(&self) -> GuestAddress {
        self.address_range.base
    }

    pub fn range(&self) -> AddressRange {
        self.address_range
    }

    /// Get start `HVA` (host virtual address) of mapped memory.
    #[inline]
    pub fn host_address(&self) -> u64 {
        self.host_addr as u64
    }
}

impl Drop for HostMemMapping {
    /// Release the memory mapping.
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        // SAFETY: host_addr/size describe the mapping created in `new`.
        let ret = unsafe {
            libc::munmap(
                self.host_addr as *mut libc::c_void,
                self.size() as libc::size_t,
            )
        };
        if ret != 0 {
            error!(
                "Failed to unmap guest ram at 0x{:x}: {}",
                self.start_address().0,
                std::io::Error::last_os_error()
            );
        }
    }
}
