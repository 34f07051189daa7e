// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
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

use rand::distributions::Alphanumeric;
use rand::Rng;

pub fn get_rand_str(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

/// Split `total` bytes into `parts` non-empty random lengths.
pub fn rand_split(total: u32, parts: usize) -> Vec<u32> {
    assert!(parts > 0 && total as usize >= parts);
    let mut rng = rand::thread_rng();
    let mut cuts: Vec<u32> = (0..parts - 1).map(|_| rng.gen_range(1..total)).collect();
    cuts.sort_unstable();
    cuts.dedup();
    let mut lens = Vec::new();
    let mut last = 0;
    for cut in cuts {
        lens.push(cut - last);
        last = cut;
    }
    lens.push(total - last);
    lens
}

pub fn rand_pattern(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}
