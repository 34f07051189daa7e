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

//! Logical units behind the vhost-scsi engine.
//!
//! The engine only sees the `ScsiLun` trait: it submits a task carrying the
//! CDB and host iovecs and gets the SAM status, sense data and residual back
//! through a `ScsiCompleteCb`. `LunRegistry` resolves backend names.

pub mod bus;
pub mod error;
pub mod lun;
pub mod malloc;

pub use error::ScsiBackendError;
pub use lun::{
    LunRegistry, LunResolver, ScsiCompleteCb, ScsiLun, ScsiTask, ScsiTaskResult, SubmitError,
};
pub use malloc::MallocLun;
