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

//! Virtio-scsi wire format, request translation and response marshalling.

use std::cmp;
use std::mem::size_of;

use log::error;

use address_space::GuestMemory;
use scsi_backend::bus::{ScsiSense, CHECK_CONDITION, SCSI_CDB_SIZE};
use scsi_backend::ScsiTaskResult;
use util::aio::Iovec;
use util::byte_code::ByteCode;
use virtio::{
    gpa_hva_iovec_map, iov_discard_front, iov_to_buf, virtio_has_feature, ElemIovec, Element,
    VIRTIO_SCSI_F_INOUT,
};

/// Default values of the cdb and sense data size configuration fields.
pub const VIRTIO_SCSI_CDB_DEFAULT_SIZE: usize = 32;
pub const VIRTIO_SCSI_SENSE_DEFAULT_SIZE: usize = 96;

/// Control type codes.
/// Task Management Function.
pub const VIRTIO_SCSI_T_TMF: u32 = 0;
/// Asynchronous notification query.
pub const VIRTIO_SCSI_T_AN_QUERY: u32 = 1;
/// Asynchronous notification subscription.
pub const VIRTIO_SCSI_T_AN_SUBSCRIBE: u32 = 2;

/// Valid TMF Subtypes.
pub const VIRTIO_SCSI_T_TMF_ABORT_TASK: u32 = 0;
pub const VIRTIO_SCSI_T_TMF_ABORT_TASK_SET: u32 = 1;
pub const VIRTIO_SCSI_T_TMF_CLEAR_ACA: u32 = 2;
pub const VIRTIO_SCSI_T_TMF_CLEAR_TASK_SET: u32 = 3;
pub const VIRTIO_SCSI_T_TMF_I_T_NEXUS_RESET: u32 = 4;
pub const VIRTIO_SCSI_T_TMF_LOGICAL_UNIT_RESET: u32 = 5;
pub const VIRTIO_SCSI_T_TMF_QUERY_TASK: u32 = 6;
pub const VIRTIO_SCSI_T_TMF_QUERY_TASK_SET: u32 = 7;

/// Command-specific response values.
/// The request was completed and the status byte if filled with a SCSI status code.
pub const VIRTIO_SCSI_S_OK: u8 = 0;
/// If the content of the CDB(such as the allocation length, parameter length or transfer size)
/// requires more data than is available in the datain and dataout buffers.
pub const VIRTIO_SCSI_S_OVERRUN: u8 = 1;
/// The request was aborted.
pub const VIRTIO_SCSI_S_ABORTED: u8 = 2;
/// The request was never processed because the target indicated by lun does not exist.
pub const VIRTIO_SCSI_S_BAD_TARGET: u8 = 3;
/// The request was reset by a bus or device reset.
pub const VIRTIO_SCSI_S_RESET: u8 = 4;
/// The request failed but retrying it on the same path may succeed.
pub const VIRTIO_SCSI_S_BUSY: u8 = 5;
/// The request failed due to a problem in the connection between the host and the target.
pub const VIRTIO_SCSI_S_TRANSPORT_FAILURE: u8 = 6;
/// The target is suffering a failure and retrying on another path will not help.
pub const VIRTIO_SCSI_S_TARGET_FAILURE: u8 = 7;
/// The nexus is suffering a failure but retrying on another path may yield a different result.
pub const VIRTIO_SCSI_S_NEXUS_FAILURE: u8 = 8;
/// Other host or driver error. In particular, if neither dataout nor datain is empty, and the
/// VIRTIO_SCSI_F_INOUT feature has not been negotiated, the request will be immediately returned
/// with a response equal to VIRTIO_SCSI_S_FAILURE.
pub const VIRTIO_SCSI_S_FAILURE: u8 = 9;
/// Task management function responses.
pub const VIRTIO_SCSI_S_FUNCTION_SUCCEEDED: u8 = 10;
pub const VIRTIO_SCSI_S_FUNCTION_REJECTED: u8 = 11;
pub const VIRTIO_SCSI_S_INCORRECT_LUN: u8 = 12;

/// Event types.
pub const VIRTIO_SCSI_T_NO_EVENT: u32 = 0;
pub const VIRTIO_SCSI_T_TRANSPORT_RESET: u32 = 1;
pub const VIRTIO_SCSI_T_ASYNC_NOTIFY: u32 = 2;
/// Set in the event type when earlier events were dropped for lack of buffers.
pub const VIRTIO_SCSI_T_EVENTS_MISSED: u32 = 0x8000_0000;

/// Reasons of VIRTIO_SCSI_T_TRANSPORT_RESET.
pub const VIRTIO_SCSI_EVT_RESET_HARD: u32 = 0;
pub const VIRTIO_SCSI_EVT_RESET_RESCAN: u32 = 1;
pub const VIRTIO_SCSI_EVT_RESET_REMOVED: u32 = 2;

/// Largest lun id of the flat space addressing format.
pub const VIRTIO_SCSI_MAX_LUN: u16 = 0x3FFF;

#[repr(C, packed)]
#[derive(Default, Clone, Copy, Debug)]
pub struct VirtioScsiCmdReq {
    /// Logical Unit Number.
    pub lun: [u8; 8],
    /// Command identifier.
    pub tag: u64,
    /// Task attribute.
    pub task_attr: u8,
    /// SAM command priority field.
    pub prio: u8,
    pub crn: u8,
    pub cdb: [u8; VIRTIO_SCSI_CDB_DEFAULT_SIZE],
}

impl ByteCode for VirtioScsiCmdReq {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct VirtioScsiCmdResp {
    /// Sense data length.
    pub sense_len: u32,
    /// Resudual bytes in data buffer.
    pub resid: u32,
    /// Status qualifier.
    pub status_qualifier: u16,
    /// Command completion status.
    pub status: u8,
    /// Response value.
    pub response: u8,
    /// Sense buffer data.
    pub sense: [u8; VIRTIO_SCSI_SENSE_DEFAULT_SIZE],
}

impl Default for VirtioScsiCmdResp {
    fn default() -> Self {
        VirtioScsiCmdResp {
            sense_len: 0,
            resid: 0,
            status_qualifier: 0,
            status: 0,
            response: 0,
            sense: [0; VIRTIO_SCSI_SENSE_DEFAULT_SIZE],
        }
    }
}

impl VirtioScsiCmdResp {
    pub fn with_response(response: u8) -> Self {
        VirtioScsiCmdResp {
            response,
            ..Default::default()
        }
    }

    /// CHECK CONDITION carrying `sense`.
    pub fn check_condition(sense: ScsiSense) -> Self {
        let mut resp = Self::with_response(VIRTIO_SCSI_S_OK);
        resp.status = CHECK_CONDITION;
        resp.set_sense(&sense.to_fixed());
        resp
    }

    fn set_sense(&mut self, sense: &[u8]) {
        let len = cmp::min(sense.len(), VIRTIO_SCSI_SENSE_DEFAULT_SIZE);
        self.sense[..len].copy_from_slice(&sense[..len]);
        self.sense_len = len as u32;
    }
}

impl ByteCode for VirtioScsiCmdResp {}

/// Task Managememt Request.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VirtioScsiCtrlTmfReq {
    pub ctrltype: u32,
    pub subtype: u32,
    pub lun: [u8; 8],
    pub tag: u64,
}

impl ByteCode for VirtioScsiCtrlTmfReq {}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VirtioScsiCtrlTmfResp {
    pub response: u8,
}

impl ByteCode for VirtioScsiCtrlTmfResp {}

/// Asynchronous notification query/subscription.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VirtioScsiCtrlAnReq {
    pub ctrltype: u32,
    pub lun: [u8; 8],
    pub event_requested: u32,
}

impl ByteCode for VirtioScsiCtrlAnReq {}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VirtioScsiCtrlAnResp {
    pub event_actual: u32,
    pub response: u8,
}

impl ByteCode for VirtioScsiCtrlAnResp {}

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtioScsiEvent {
    pub event: u32,
    pub lun: [u8; 8],
    pub reason: u32,
}

impl ByteCode for VirtioScsiEvent {}

impl VirtioScsiEvent {
    pub fn transport_reset(target: u8, lun: u16, reason: u32) -> Self {
        VirtioScsiEvent {
            event: VIRTIO_SCSI_T_TRANSPORT_RESET,
            lun: virtio_scsi_encode_lun(target, lun),
            reason,
        }
    }
}

//   lun: [u8, 8]
//   | Byte 0 | Byte 1 | Byte 2 | Byte 3 | Byte 4 | Byte 5 | Byte 6 | Byte 7 |
//   |    1   | target |       lun       |                 0                 |
pub fn virtio_scsi_get_lun_id(lun: [u8; 8]) -> u16 {
    ((u16::from(lun[2]) << 8) | u16::from(lun[3])) & VIRTIO_SCSI_MAX_LUN
}

/// Target and lun addressed by `lun`, `None` when byte 0 is not 1.
pub fn virtio_scsi_lun_target(lun: [u8; 8]) -> Option<(u8, u16)> {
    if lun[0] != 1 {
        return None;
    }
    Some((lun[1], virtio_scsi_get_lun_id(lun)))
}

/// Flat space addressing of `lun` in `target`.
pub fn virtio_scsi_encode_lun(target: u8, lun: u16) -> [u8; 8] {
    let lun = lun & VIRTIO_SCSI_MAX_LUN;
    [1, target, 0x40 | (lun >> 8) as u8, lun as u8, 0, 0, 0, 0]
}

/// A command queue request ready for dispatch.
#[derive(Debug)]
pub struct CmdRequest {
    pub head: u16,
    pub req: VirtioScsiCmdReq,
    /// Device-writable part of the chain, response header first.
    pub resp_iovec: Vec<ElemIovec>,
    /// Host segments following the request header.
    pub data_out: Vec<Iovec>,
    /// Host segments following the response header.
    pub data_in: Vec<Iovec>,
    pub data_out_len: u64,
    pub data_in_len: u64,
}

#[derive(Debug)]
pub enum CmdParse {
    Ready(CmdRequest),
    /// Return `resp` to the guest without dispatching.
    Respond {
        head: u16,
        resp_iovec: Vec<ElemIovec>,
        resp: VirtioScsiCmdResp,
    },
    /// The chain has no room for a response header.
    NoResponse { head: u16 },
}

/// Size of the response header, the part of the used length every completion carries.
pub const CMD_RESP_SIZE: u64 = size_of::<VirtioScsiCmdResp>() as u64;
const CMD_REQ_SIZE: u64 = size_of::<VirtioScsiCmdReq>() as u64;

/// Split a validated chain into request header, response header and data segments.
pub fn parse_cmd_request(mem: &GuestMemory, elem: Element, features: u64) -> CmdParse {
    let head = elem.index;
    if Element::iovec_size(&elem.in_iovec) < CMD_RESP_SIZE {
        error!(
            "Missed response header for scsi request {}: in {} desc num {}",
            head,
            elem.in_iovec.len(),
            elem.desc_num
        );
        return CmdParse::NoResponse { head };
    }
    let respond = |resp: VirtioScsiCmdResp| CmdParse::Respond {
        head,
        resp_iovec: elem.in_iovec.clone(),
        resp,
    };

    let mut req = VirtioScsiCmdReq::default();
    let size = iov_to_buf(mem, &elem.out_iovec, req.as_mut_bytes()).unwrap_or_else(|e| {
        error!("Failed to read scsi request header {}: {:?}", head, e);
        0
    });
    if (size as u64) < CMD_REQ_SIZE {
        error!(
            "Invalid length for scsi request {}: get {}, expected {}",
            head, size, CMD_REQ_SIZE
        );
        return respond(VirtioScsiCmdResp::check_condition(
            scsi_backend::bus::SCSI_SENSE_INVALID_FIELD,
        ));
    }

    // Get possible dataout buffer from virtqueue Element.
    let mut iovec = elem.out_iovec.clone();
    let elemiov = iov_discard_front(&mut iovec, CMD_REQ_SIZE).unwrap_or_default();
    let (data_out_len, data_out) = match gpa_hva_iovec_map(elemiov, mem) {
        Ok(map) => map,
        Err(e) => {
            error!("Failed to map dataout of scsi request {}: {:?}", head, e);
            return respond(VirtioScsiCmdResp::with_response(VIRTIO_SCSI_S_FAILURE));
        }
    };

    // Get possible datain buffer from virtqueue Element.
    let mut iovec = elem.in_iovec.clone();
    let elemiov = iov_discard_front(&mut iovec, CMD_RESP_SIZE).unwrap_or_default();
    let (data_in_len, data_in) = match gpa_hva_iovec_map(elemiov, mem) {
        Ok(map) => map,
        Err(e) => {
            error!("Failed to map datain of scsi request {}: {:?}", head, e);
            return respond(VirtioScsiCmdResp::with_response(VIRTIO_SCSI_S_FAILURE));
        }
    };

    if data_out_len > 0 && data_in_len > 0 && !virtio_has_feature(features, VIRTIO_SCSI_F_INOUT) {
        error!(
            "Scsi request {} has both datain and dataout buffer without INOUT feature",
            head
        );
        return respond(VirtioScsiCmdResp::with_response(VIRTIO_SCSI_S_FAILURE));
    }

    CmdParse::Ready(CmdRequest {
        head,
        req,
        resp_iovec: elem.in_iovec,
        data_out,
        data_in,
        data_out_len,
        data_in_len,
    })
}

impl CmdRequest {
    pub fn cdb(&self) -> [u8; SCSI_CDB_SIZE] {
        self.req.cdb
    }

    pub fn tag(&self) -> u64 {
        self.req.tag
    }
}

/// Wire response for `result` and the count of data-in bytes it filled.
pub fn cmd_resp_from_result(result: &ScsiTaskResult, data_in_len: u64) -> (VirtioScsiCmdResp, u64) {
    let mut resp = VirtioScsiCmdResp::with_response(VIRTIO_SCSI_S_OK);
    resp.status = result.status;
    resp.resid = cmp::min(result.residual, u64::from(u32::MAX)) as u32;
    resp.set_sense(&result.sense);
    (resp, data_in_len.saturating_sub(result.residual))
}

/// Used length of a command completion that filled `data_len` bytes of data-in.
pub fn cmd_used_len(data_len: u64) -> u32 {
    cmp::min(CMD_RESP_SIZE + data_len, u64::from(u32::MAX)) as u32
}
