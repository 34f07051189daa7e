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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VhostScsiError {
    #[error("Util")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("AddressSpace")]
    AddressSpace {
        #[from]
        source: address_space::error::AddressSpaceError,
    },
    #[error("Virtio")]
    Virtio {
        #[from]
        source: virtio::error::VirtioError,
    },
    #[error("Controller {0} already exists")]
    NameExists(String),
    #[error("Controller {0} not found")]
    ControllerNotFound(String),
    #[error("Device index {0} is out of range, controller supports {1} devices")]
    BadIndex(u32, usize),
    #[error("Device slot {1} of controller {0} is in use")]
    SlotInUse(String, u8),
    #[error("Device slot {1} of controller {0} is empty")]
    SlotEmpty(String, u8),
    #[error("Backend {0} not found")]
    BackendNotFound(String),
    #[error("Backend {0} is already attached")]
    BackendInUse(String),
    #[error("Lun {2} of device slot {1} of controller {0} is in use")]
    LunInUse(String, u8, u16),
    #[error("Lun {2} of device slot {1} of controller {0} not found")]
    LunNotFound(String, u8, u16),
    #[error("Cpu mask {0} of device is not a subset of controller mask {1}")]
    CpuMaskNotSubset(String, String),
    #[error("Lun id {0} is out of range, max is {1}")]
    LunOutOfRange(u16, u16),
    #[error("Controller {0} is busy: {1}")]
    Busy(String, String),
    #[error("Transport of controller {0} is already started")]
    TransportStarted(String),
    #[error("Transport of controller {0} is not started")]
    TransportNotStarted(String),
    #[error("Invalid transport: {0}")]
    InvalidTransport(String),
    #[error("Poller of controller {0} has exited")]
    PollerGone(String),
    #[error("The length of {0} exceeds max length {1}")]
    StringLengthTooLong(String, usize),
    #[error("Invalid value for {0}: {1}, expected range [{2}, {3}]")]
    IllegalValue(String, u64, u64, u64),
}
