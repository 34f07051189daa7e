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

/// Current wall clock as (seconds, nanoseconds) since the epoch.
pub fn gettime() -> Result<(u64, u32)> {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_REALTIME)?;
    Ok((ts.tv_sec() as u64, ts.tv_nsec() as u32))
}

/// Split seconds since the epoch into local [year, month, day, hour, minute, second].
pub fn get_format_time(sec: i64) -> [i32; 6] {
    // SAFETY: `tm` is plain data and fully written by localtime_r.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let time = sec as libc::time_t;
    // SAFETY: both pointers reference valid stack objects.
    unsafe { libc::localtime_r(&time, &mut tm) };

    [
        tm.tm_year + 1900,
        tm.tm_mon + 1,
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
    ]
}
