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
pub enum ScsiBackendError {
    #[error("Util")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("Logical unit {0} already exists")]
    LunExists(String),
    #[error("Logical unit {0} not found")]
    LunNotFound(String),
    #[error("Invalid logical unit {0} geometry: {1} blocks of {2} bytes")]
    InvalidGeometry(String, u64, u32),
    #[error("Queue depth of logical unit {0} must be positive")]
    InvalidQueueDepth(String),
    #[error("Access of {1} bytes at offset {0} is beyond the end of the disk ({2})")]
    OutOfRange(u64, u64, u64),
    #[error("Worker of logical unit {0} has exited")]
    WorkerGone(String),
}
