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

use anyhow::Result;

use crate::UtilError;

/// Get the page size of host.
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf has no side effects.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Number of online host cpus.
pub fn host_cpu_count() -> usize {
    // SAFETY: sysconf has no side effects.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Create an anonymous private mapping of `len` bytes and return its host address.
///
/// # Arguments
///
/// * `len` - Length of the mapping.
/// * `dump_guest_core` - Include the mapping in core dumps or not.
pub fn do_mmap(len: u64, dump_guest_core: bool) -> Result<u64> {
    // SAFETY: a fresh anonymous mapping does not alias any existing memory.
    let hva = unsafe {
        libc::mmap(
            std::ptr::null_mut() as *mut libc::c_void,
            len as libc::size_t,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if hva == libc::MAP_FAILED {
        return Err(anyhow::anyhow!(UtilError::Mmap(len))
            .context(std::io::Error::last_os_error()));
    }

    if !dump_guest_core {
        // SAFETY: hva/len describe the mapping created above.
        unsafe { libc::madvise(hva, len as libc::size_t, libc::MADV_DONTDUMP) };
    }

    Ok(hva as u64)
}
