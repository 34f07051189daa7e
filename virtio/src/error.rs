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
pub enum VirtioError {
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
    #[error("Queue index {0} invalid, queue size is {1}")]
    QueueIndex(u16, u16),
    #[error("Vring descriptor is invalid")]
    QueueDescInvalid,
    #[error("Address overflows for {0}, address: 0x{1:x}, offset: {2}")]
    AddressOverflow(&'static str, u64, u64),
    #[error("Failed to read object for {0}, address: 0x{1:x}")]
    ReadObjectErr(&'static str, u64),
    #[error("Descriptor chain has more than {0} descriptors")]
    ChainTooLong(u32),
    #[error("Indirect table with {0} descriptors exceeds the remaining budget of {1}")]
    IndirectTooLong(u32, u32),
    #[error("Found two indirect descriptor elem in one request")]
    IndirectNested,
    #[error("Invalid order of the descriptor elem")]
    DescOrder,
    #[error("Descriptor chain is longer than 4GB in total: {0}")]
    ChainTotalLen(u64),
    #[error("Failed to get iovec from element!")]
    ElementEmpty,
    #[error("Unsupported queue type {0}")]
    QueueType(u16),
}
