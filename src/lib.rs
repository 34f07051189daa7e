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

//! # vhost_scsi
//!
//! A vhost-scsi target engine. It serves the virtqueues of paravirtualized
//! SCSI controllers: descriptor chains posted by the guest are translated
//! into SCSI tasks for backend logical units, and their results are written
//! back to the used rings. Devices and luns can be plugged and unplugged
//! while requests are in flight.
//!
//! Each controller owns one poller thread bound to its cpu mask. The
//! [`VhostScsiRegistry`] is the management surface, it never touches queue
//! state directly but posts events the poller applies between iterations.

pub mod config;
pub mod controller;
pub mod error;
pub mod registry;
pub mod request;
pub mod transport;

mod poller;

pub use anyhow::Result;
pub use config::{ConfigCheck, ControllerConfig, DeviceConfig, PollerTunables};
pub use controller::{
    ControllerInfo, DeviceInfo, HotplugNotice, LunInfo, RemoveCallback, ScsiDevice, SlotIndex,
    StatsSnapshot, VHOST_SCSI_CTRLR_MAX_DEVS,
};
pub use error::VhostScsiError;
pub use registry::{RemoveStatus, VhostScsiRegistry};
pub use transport::{TransportContext, VringInfo, VHOST_SCSI_FEATURES};
