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

use std::mem::size_of;
use std::slice::{from_raw_parts, from_raw_parts_mut};

/// Plain-old-data types that can be viewed as raw bytes and rebuilt from raw bytes.
///
/// Wire structures shared with the guest are `#[repr(C, packed)]` and live at
/// arbitrary guest addresses, so the constructors copy instead of casting a
/// pointer, which keeps them free of alignment requirements.
pub trait ByteCode: Default + Copy + Send + Sync {
    /// View the object as a byte slice.
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: Self is plain data and fully initialized.
        unsafe { from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }

    /// View the object as a mutable byte slice.
    fn as_mut_bytes(&mut self) -> &mut [u8] {
        // SAFETY: Self is plain data, any byte pattern is a valid value.
        unsafe { from_raw_parts_mut(self as *mut Self as *mut u8, size_of::<Self>()) }
    }

    /// Build an object from exactly `size_of::<Self>()` bytes.
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != size_of::<Self>() {
            return None;
        }
        Self::from_prefix(data)
    }

    /// Build an object from the leading bytes of `data`, ignoring the rest.
    fn from_prefix(data: &[u8]) -> Option<Self> {
        if data.len() < size_of::<Self>() {
            return None;
        }
        let mut obj = Self::default();
        obj.as_mut_bytes().copy_from_slice(&data[..size_of::<Self>()]);
        Some(obj)
    }
}

impl ByteCode for u8 {}
impl ByteCode for u16 {}
impl ByteCode for u32 {}
impl ByteCode for u64 {}
