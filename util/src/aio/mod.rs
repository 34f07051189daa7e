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

//! Host scatter-gather segments handed to storage backends.
//!
//! Every `Iovec` is produced by the guest memory layer after a bounds check,
//! so the helpers below may dereference `iov_base` directly.

use std::cmp::min;

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Iovec {
    pub iov_base: u64,
    pub iov_len: u64,
}

impl Iovec {
    pub fn new(base: u64, len: u64) -> Self {
        Iovec {
            iov_base: base,
            iov_len: len,
        }
    }

    pub fn is_none(&self) -> bool {
        self.iov_base == 0 && self.iov_len == 0
    }
}

pub fn get_iov_size(iovecs: &[Iovec]) -> u64 {
    iovecs.iter().map(|iov| iov.iov_len).sum()
}

/// Copy bytes out of `iovecs`, skipping the first `offset` bytes. Returns the count copied.
pub fn iov_to_buf_direct(iovecs: &[Iovec], offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut iovec_off = offset;
    let mut copied = 0_usize;
    for iov in iovecs {
        if copied == buf.len() {
            break;
        }
        if iovec_off >= iov.iov_len {
            iovec_off -= iov.iov_len;
            continue;
        }
        let len = min((iov.iov_len - iovec_off) as usize, buf.len() - copied);
        // SAFETY: the segment was validated against guest memory when it was built.
        let src = unsafe {
            std::slice::from_raw_parts((iov.iov_base + iovec_off) as *const u8, len)
        };
        buf[copied..copied + len].copy_from_slice(src);
        copied += len;
        iovec_off = 0;
    }
    Ok(copied)
}

/// Copy `buf` into `iovecs` from the start. Returns the count copied.
pub fn iov_from_buf_direct(iovecs: &[Iovec], buf: &[u8]) -> Result<usize> {
    let mut copied = 0_usize;
    for iov in iovecs {
        if copied == buf.len() {
            break;
        }
        let len = min(iov.iov_len as usize, buf.len() - copied);
        if len != 0 && iov.iov_base == 0 {
            bail!("Null iovec with length {}", iov.iov_len);
        }
        // SAFETY: the segment was validated against guest memory when it was built.
        let dst = unsafe { std::slice::from_raw_parts_mut(iov.iov_base as *mut u8, len) };
        dst.copy_from_slice(&buf[copied..copied + len]);
        copied += len;
    }
    Ok(copied)
}

/// Drop `size` bytes from the front of `iovecs`. Returns `None` if they are shorter than `size`.
pub fn iov_discard_front_direct(iovecs: &mut [Iovec], mut size: u64) -> Option<&mut [Iovec]> {
    let mut index = 0;
    while index < iovecs.len() {
        let iov = &mut iovecs[index];
        if iov.iov_len > size {
            iov.iov_base += size;
            iov.iov_len -= size;
            return Some(&mut iovecs[index..]);
        }
        size -= iov.iov_len;
        index += 1;
    }
    if size == 0 {
        return Some(&mut []);
    }
    None
}
