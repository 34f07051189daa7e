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
pub enum UtilError {
    #[error("Io")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Index :{0} out of bound :{1}")]
    OutOfBound(u64, u64),
    #[error("Invalid cpu mask \"{0}\": {1}")]
    InvalidCpuMask(String, String),
    #[error("Cpu {0} is not online, host has {1} cpus")]
    CpuNotOnline(usize, usize),
    #[error("Failed to set affinity of thread {0}")]
    SetAffinity(String),
    #[error("Failed to mmap {0} bytes")]
    Mmap(u64),
}
