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
pub enum AddressSpaceError {
    #[error("Util")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("Failed to find matched region, addr 0x{0:X}")]
    RegionNotFound(u64),
    #[error("Address overflows, addr is 0x{0:X}")]
    Overflow(u64),
    #[error("Access out of guest memory, addr 0x{0:X}, size 0x{1:X}")]
    OutOfRange(u64, u64),
    #[error("Region 0x{0:X}+0x{1:X} overlaps an existing region")]
    Overlap(u64, u64),
    #[error("Empty region at 0x{0:X}")]
    EmptyRegion(u64),
}
