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

//! Guest memory as seen by the request engine.
//!
//! The transport maps guest RAM into this process and hands the mappings
//! over as `HostMemMapping`s. `GuestMemory` is the only way the engine reads
//! or writes guest-owned bytes: descriptor tables, rings, request headers
//! and data buffers are all reached through its bounds-checked accessors.

pub mod error;

mod address;
mod guest_memory;
mod host_mmap;

pub use address::{AddressRange, GuestAddress};
pub use error::AddressSpaceError;
pub use guest_memory::GuestMemory;
pub use host_mmap::HostMemMapping;
