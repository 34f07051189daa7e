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

use std::fmt;

/// Guest physical address as published by the driver in descriptors and ring setup.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    pub fn raw_value(self) -> u64 {
        self.0
    }

    /// Offset of this address from `base`. The caller guarantees `self >= base`.
    pub fn offset_from(self, base: Self) -> u64 {
        self.0 - base.0
    }

    /// Return None if the sum overflows.
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    /// Return None if the difference underflows.
    pub fn checked_sub(self, offset: u64) -> Option<Self> {
        self.0.checked_sub(offset).map(Self)
    }

    /// The caller guarantees no overflow occurs.
    pub fn unchecked_add(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::Debug for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GuestAddress(0x{:x})", self.0)
    }
}

/// Half-open guest range `[base, base + size)`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub base: GuestAddress,
    pub size: u64,
}

impl AddressRange {
    pub fn new(base: GuestAddress, size: u64) -> AddressRange {
        AddressRange { base, size }
    }

    /// Exclusive end, computed in 128 bits so a range ending at 2^64 is representable.
    fn end(&self) -> u128 {
        self.base.0 as u128 + self.size as u128
    }

    /// Exclusive end address, None when the range reaches the top of the address space.
    pub fn end_addr(&self) -> Option<GuestAddress> {
        self.base.checked_add(self.size)
    }

    /// Whether `[addr, addr + len)` lies fully inside this range.
    pub fn contains(&self, addr: GuestAddress, len: u64) -> bool {
        addr >= self.base && addr.0 as u128 + len as u128 <= self.end()
    }

    /// Intersection with `other`, None if they do not overlap.
    pub fn find_intersection(&self, other: AddressRange) -> Option<AddressRange> {
        let begin = std::cmp::max(self.base.0 as u128, other.base.0 as u128);
        let end = std::cmp::min(self.end(), other.end());
        if begin >= end {
            return None;
        }
        Some(AddressRange {
            base: GuestAddress(begin as u64),
            size: (end - begin) as u64,
        })
    }
}
