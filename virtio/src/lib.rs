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

//! Virtio split virtqueue handling for a device backend running outside the VMM.
//!
//! The transport maps the guest rings into this process and negotiates
//! features; this crate validates the ring layout, walks descriptor chains
//! and publishes used entries.

pub mod error;
mod queue;

pub use error::VirtioError;
pub use queue::*;

use std::cmp;

use anyhow::Result;

use address_space::GuestMemory;
use util::aio::{iov_from_buf_direct, iov_to_buf_direct, Iovec};

/// Feature Bits, refer to Virtio Spec.
/// Negotiating this feature indicates that the driver can use descriptors
/// with the VIRTQ_DESC_F_INDIRECT flag set.
pub const VIRTIO_F_RING_INDIRECT_DESC: u32 = 28;
/// This feature enables the used_event and the avail_event fields.
pub const VIRTIO_F_RING_EVENT_IDX: u32 = 29;
/// Indicates compliance with Virtio Spec.
pub const VIRTIO_F_VERSION_1: u32 = 32;

/// A single request can include both device-readable and device-writable data buffers.
pub const VIRTIO_SCSI_F_INOUT: u32 = 0;
/// The host SHOULD enable reporting of hot-plug and hot-unplug events for LUNs and targets.
pub const VIRTIO_SCSI_F_HOTPLUG: u32 = 1;
/// The host will report changes to LUN parameters via a VIRTIO_SCSI_T_PARAM_CHANGE event.
pub const VIRTIO_SCSI_F_CHANGE: u32 = 2;

/// Identifier of virtio scsi device, refer to Virtio Spec.
pub const VIRTIO_TYPE_SCSI: u32 = 8;

/// Check if the bit of features is configured.
///
/// # Arguments
///
/// * `feature` - The feature of the device.
/// * `fbit` - The bit to check.
pub fn virtio_has_feature(feature: u64, fbit: u32) -> bool {
    feature & (1 << fbit) != 0
}

/// Read iovec to buf and return the read number of bytes.
pub fn iov_to_buf(mem: &GuestMemory, iovec: &[ElemIovec], buf: &mut [u8]) -> Result<usize> {
    let mut start: usize = 0;

    for iov in iovec {
        if start >= buf.len() {
            break;
        }
        let end = cmp::min(start + iov.len as usize, buf.len());
        let addr_map = mem.get_address_map(iov.addr, (end - start) as u64)?;
        start += iov_to_buf_direct(&addr_map, 0, &mut buf[start..end])?;
    }
    Ok(start)
}

/// Write buf to iovec and return the written number of bytes.
pub fn iov_from_buf(mem: &GuestMemory, iovec: &[ElemIovec], buf: &[u8]) -> Result<usize> {
    let mut start: usize = 0;

    for iov in iovec {
        if start >= buf.len() {
            break;
        }
        let end = cmp::min(start + iov.len as usize, buf.len());
        let addr_map = mem.get_address_map(iov.addr, (end - start) as u64)?;
        start += iov_from_buf_direct(&addr_map, &buf[start..end])?;
    }
    Ok(start)
}

/// Discard "size" bytes of the front of iovec.
pub fn iov_discard_front(iovec: &mut [ElemIovec], mut size: u64) -> Option<&mut [ElemIovec]> {
    let mut index = 0;
    while index < iovec.len() {
        let iov = &mut iovec[index];
        if iov.len as u64 > size {
            iov.addr.0 += size;
            iov.len -= size as u32;
            return Some(&mut iovec[index..]);
        }
        size -= iov.len as u64;
        index += 1;
    }
    if size == 0 {
        return Some(&mut []);
    }
    None
}

/// Convert GPA buffer iovec to HVA buffer iovec.
/// If don't need the entire iovec, use iov_discard_front firstly.
pub fn gpa_hva_iovec_map(
    gpa_elemiovec: &[ElemIovec],
    mem: &GuestMemory,
) -> Result<(u64, Vec<Iovec>)> {
    let mut iov_size = 0;
    let mut hva_iovec = Vec::with_capacity(gpa_elemiovec.len());

    for elem in gpa_elemiovec.iter() {
        let mut hva_vec = mem.get_address_map(elem.addr, elem.len as u64)?;
        hva_iovec.append(&mut hva_vec);
        iov_size += elem.len as u64;
    }

    Ok((iov_size, hva_iovec))
}
