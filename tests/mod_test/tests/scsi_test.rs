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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use mod_test::libdriver::scsi_lun::{ManualLun, RefusingLun};
use mod_test::libdriver::virtio::{
    TestVringDescEntry, VringDesc, VIRTIO_F_VERSION_1, VIRTIO_RING_F_INDIRECT_DESC,
    VRING_DESC_F_INDIRECT, VRING_DESC_F_NEXT,
};
use mod_test::libdriver::virtio_scsi::{
    read10_cdb, write10_cdb, TestScsiReq, TestVirtioScsi, CONTROLLER_NAME, CTRL_QUEUE,
    EVENT_QUEUE, REQUEST_QUEUE,
};
use mod_test::libtest::TEST_MEM_SIZE;
use mod_test::utils::{rand_pattern, rand_split};
use rand::Rng;
use scsi_backend::bus::{
    CHECK_CONDITION, GOOD, SCSI_SENSE_LEN, SCSI_SENSE_LUN_NOT_SUPPORTED,
    SCSI_SENSE_TARGET_FAILURE, TASK_ABORTED, TEST_UNIT_READY,
};
use util::byte_code::ByteCode;
use vhost_scsi::request::{
    virtio_scsi_encode_lun, VirtioScsiCmdReq, VirtioScsiCtrlAnReq, VirtioScsiCtrlTmfReq,
    VirtioScsiEvent, VIRTIO_SCSI_EVT_RESET_REMOVED, VIRTIO_SCSI_EVT_RESET_RESCAN,
    VIRTIO_SCSI_S_BAD_TARGET, VIRTIO_SCSI_S_FAILURE, VIRTIO_SCSI_S_FUNCTION_REJECTED,
    VIRTIO_SCSI_S_FUNCTION_SUCCEEDED, VIRTIO_SCSI_S_OK, VIRTIO_SCSI_T_AN_QUERY,
    VIRTIO_SCSI_T_EVENTS_MISSED, VIRTIO_SCSI_T_TMF, VIRTIO_SCSI_T_TMF_ABORT_TASK,
    VIRTIO_SCSI_T_TMF_I_T_NEXUS_RESET, VIRTIO_SCSI_T_TMF_LOGICAL_UNIT_RESET,
};
use vhost_scsi::{
    ControllerConfig, DeviceConfig, LunInfo, PollerTunables, RemoveStatus, SlotIndex,
    VhostScsiError,
};
use virtio::{VIRTIO_SCSI_F_HOTPLUG, VIRTIO_SCSI_F_INOUT};

const DEFAULT_FEATURES: u64 = 1 << VIRTIO_F_VERSION_1
    | 1 << VIRTIO_RING_F_INDIRECT_DESC
    | 1 << VIRTIO_SCSI_F_INOUT
    | 1 << VIRTIO_SCSI_F_HOTPLUG;
const BLOCK_SIZE: u32 = 512;
const CMD_RESP_SIZE: u32 = 108;
/// Long enough for the poller to pick up a control event.
const SETTLE_NS: u64 = 20 * 1000 * 1000;

fn scsi_test_init(num_req_queues: usize) -> TestVirtioScsi {
    TestVirtioScsi::new(DEFAULT_FEATURES, num_req_queues, PollerTunables::default())
}

fn read_req(target: u8, lun: u16, blocks: u16) -> TestScsiReq {
    TestScsiReq::new(target, lun, &read10_cdb(0, blocks))
        .with_data_in(u32::from(blocks) * BLOCK_SIZE)
}

/// Callback for a removal, setting the returned flag when it runs.
fn removal_flag() -> (Arc<AtomicBool>, Box<dyn FnOnce(&str, SlotIndex) + Send>) {
    let flag = Arc::new(AtomicBool::new(false));
    let done = flag.clone();
    let cb = Box::new(move |name: &str, _slot: SlotIndex| {
        assert_eq!(name, CONTROLLER_NAME);
        done.store(true, Ordering::SeqCst);
    });
    (flag, cb)
}

/// Basic IO against a malloc backed lun. target 0, lun 0.
/// TestStep:
///   1. Write 8 blocks of random data.
///   2. Read them back.
/// Expect:
///   1. WRITE_10 completes GOOD with used length of the response header only.
///   2. READ_10 completes GOOD, used length 108 + 4096, data matches.
///   3. The call eventfd of the request queue is signalled.
#[test]
fn scsi_malloc_read_write_test() {
    let mut test = scsi_test_init(1);
    let malloc = test.add_malloc_lun("Malloc0", 2048);
    test.add_device(0, "Malloc0");
    test.start();

    let data = rand_pattern(4096);
    let write = TestScsiReq::new(0, 0, &write10_cdb(0, 8)).with_data_out(data.clone());
    let cmd = test.send_cmd(REQUEST_QUEUE, &write);
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE);
    assert_eq!(result.resp.response, VIRTIO_SCSI_S_OK);
    assert_eq!(result.resp.status, GOOD);

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 8));
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE + 4096);
    assert_eq!(result.resp.response, VIRTIO_SCSI_S_OK);
    assert_eq!(result.resp.status, GOOD);
    assert_eq!({ result.resp.resid }, 0);
    assert_eq!(result.data_in, data);

    let mut disk = vec![0_u8; 4096];
    malloc.read_at(0, &mut disk).unwrap();
    assert_eq!(disk, data);

    let call_evt = test.call_evts[REQUEST_QUEUE].clone();
    test.wait_until(|_| call_evt.read().is_ok());

    let stats = test.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.completions, 2);
}

/// Device slots beyond the controller's table are refused.
/// TestStep:
///   1. Reserve slot 8.
///   2. Add a device to slot 8.
/// Expect:
///   1/2. BadIndex, the device table is unchanged.
#[test]
fn scsi_device_slot_out_of_range_test() {
    let mut test = scsi_test_init(1);
    test.add_malloc_lun("Malloc0", 64);

    let err = test
        .registry
        .construct_device(CONTROLLER_NAME, 8, None)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VhostScsiError>(),
        Some(VhostScsiError::BadIndex(8, 8))
    ));
    let err = test
        .registry
        .add_device(CONTROLLER_NAME, 8, "Malloc0")
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VhostScsiError>(),
        Some(VhostScsiError::BadIndex(8, 8))
    ));
    assert!(test.registry.get_device(CONTROLLER_NAME, 8).is_err());

    let infos = test.registry.query_controllers();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].devices.is_empty());
}

/// Malformed descriptor chains never reach a logical unit.
/// TestStep:
///   1. Publish an indirect descriptor claiming 10000 entries.
///   2. Publish a chain looping between two descriptors.
///   3. Publish a command whose data-in buffer lies outside guest memory.
/// Expect:
///   1/2. Returned with used length 0.
///   3. Response FAILURE with used length 108.
///   1/2/3. Nothing is submitted, every chain is counted as malformed.
#[test]
fn scsi_malformed_chain_test() {
    let mut test = scsi_test_init(1);
    let lun = ManualLun::new("Manual0");
    test.add_lun(lun.clone());
    test.add_device(0, "Manual0");
    test.start();

    let state = test.state.clone();
    let vq = test.queues[REQUEST_QUEUE].clone();

    let table = test.alloc.borrow_mut().alloc(4096);
    let head = vq.borrow_mut().add_raw_desc(
        state.clone(),
        VringDesc {
            addr: table,
            len: 10000 * 16,
            flags: VRING_DESC_F_INDIRECT,
            next: 0,
        },
    );
    vq.borrow().update_avail(state.clone(), head);
    assert_eq!(test.wait_used(REQUEST_QUEUE, head), 0);

    let buf = test.alloc.borrow_mut().alloc(64);
    let head = vq.borrow().free_head;
    vq.borrow_mut().add_raw_desc(
        state.clone(),
        VringDesc {
            addr: buf,
            len: 64,
            flags: VRING_DESC_F_NEXT,
            next: (head + 1) as u16,
        },
    );
    vq.borrow_mut().add_raw_desc(
        state.clone(),
        VringDesc {
            addr: buf,
            len: 64,
            flags: VRING_DESC_F_NEXT,
            next: head as u16,
        },
    );
    vq.borrow().update_avail(state.clone(), head);
    assert_eq!(test.wait_used(REQUEST_QUEUE, head), 0);

    let header = VirtioScsiCmdReq {
        lun: virtio_scsi_encode_lun(0, 0),
        cdb: [0; 32],
        ..Default::default()
    };
    let req_addr = test.alloc.borrow_mut().alloc(64);
    state.borrow().memwrite(req_addr, header.as_bytes());
    let resp_addr = test.alloc.borrow_mut().alloc(u64::from(CMD_RESP_SIZE));
    let head = vq.borrow_mut().add_chained(
        state.clone(),
        vec![
            TestVringDescEntry::new(req_addr, header.as_bytes().len() as u32, false),
            TestVringDescEntry::new(resp_addr, CMD_RESP_SIZE, true),
            TestVringDescEntry::new(TEST_MEM_SIZE + 0x1000, 512, true),
        ],
    );
    assert_eq!(test.wait_used(REQUEST_QUEUE, head), CMD_RESP_SIZE);
    // Response byte follows sense_len, resid, status_qualifier and status.
    assert_eq!(state.borrow().readb(resp_addr + 11), VIRTIO_SCSI_S_FAILURE);

    assert_eq!(lun.submits(), 0);
    let stats = test.stats();
    assert_eq!(stats.malformed_chains, 3);
    assert_eq!(stats.completions, 0);
}

/// Hot removal of a device with commands in flight.
/// TestStep:
///   1. Submit 3 commands to the device in slot 0 and keep them pending.
///   2. Remove the device.
///   3. Submit a new command to slot 0.
///   4. Complete the pending commands one by one.
/// Expect:
///   2. Removal is pending.
///   3. New command gets BAD_TARGET at once.
///   4. The slot stays occupied until the last completion, the callback
///      runs after that and the slot reads back as unbound.
#[test]
fn scsi_remove_device_drains_inflight_test() {
    let mut test = scsi_test_init(1);
    let lun = ManualLun::new("Manual0");
    test.add_lun(lun.clone());
    test.add_device(0, "Manual0");
    test.start();

    let cmds: Vec<_> = (0..3)
        .map(|_| test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1)))
        .collect();
    test.wait_until(|_| lun.pending() == 3);

    let (removed, cb) = removal_flag();
    let status = test
        .registry
        .remove_device(CONTROLLER_NAME, 0, Some(cb))
        .unwrap();
    assert_eq!(status, RemoveStatus::Pending);
    assert!(test.registry.get_device(CONTROLLER_NAME, 0).unwrap().is_some());
    // A second removal of the same slot is refused while draining.
    assert!(test.registry.remove_device(CONTROLLER_NAME, 0, None).is_err());

    test.state.borrow().clock_step_ns(SETTLE_NS);
    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1));
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE);
    assert_eq!(result.resp.response, VIRTIO_SCSI_S_BAD_TARGET);
    assert_eq!(lun.submits(), 3);

    for (i, cmd) in cmds.iter().enumerate() {
        assert!(!removed.load(Ordering::SeqCst));
        assert!(test.registry.get_device(CONTROLLER_NAME, 0).unwrap().is_some());
        assert!(lun.complete_next(scsi_backend::ScsiTaskResult::good(0), 1));
        let result = test.wait_cmd(cmd);
        assert_eq!(result.used_len, CMD_RESP_SIZE + BLOCK_SIZE);
        assert_eq!(result.resp.status, GOOD);
        if i + 1 < cmds.len() {
            assert!(test.not_used_after(REQUEST_QUEUE, cmds[i + 1].head, 1000));
        }
    }

    test.wait_until(|_| removed.load(Ordering::SeqCst));
    assert!(test.registry.get_device(CONTROLLER_NAME, 0).unwrap().is_none());
    assert_eq!(test.stats().bad_target, 1);
}

/// A logical unit completing the same task twice.
/// Expect:
///   The head is returned once and the extra completion is counted.
#[test]
fn scsi_duplicate_completion_test() {
    let mut test = scsi_test_init(1);
    let lun = ManualLun::new("Manual0");
    test.add_lun(lun.clone());
    test.add_device(0, "Manual0");
    test.start();

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1));
    test.wait_until(|_| lun.pending() == 1);
    assert!(lun.complete_next(scsi_backend::ScsiTaskResult::good(0), 2));

    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE + BLOCK_SIZE);
    assert!(test.not_used_after(REQUEST_QUEUE, cmd.head, 10 * 1000));

    let stats = test.stats();
    assert_eq!(stats.duplicate_completions, 1);
    assert_eq!(stats.completions, 1);
}

/// The guest publishes a head that is still in flight.
/// Expect:
///   The second publication is dropped, the head is returned once.
#[test]
fn scsi_duplicate_head_test() {
    let mut test = scsi_test_init(1);
    let lun = ManualLun::new("Manual0");
    test.add_lun(lun.clone());
    test.add_device(0, "Manual0");
    test.start();

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1));
    test.wait_until(|_| lun.pending() == 1);
    test.queues[REQUEST_QUEUE]
        .borrow()
        .update_avail(test.state.clone(), cmd.head);
    test.wait_until(|t| t.stats().duplicate_heads == 1);
    assert_eq!(lun.submits(), 1);

    assert_eq!(lun.complete_all_good(), 1);
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE + BLOCK_SIZE);
    assert!(test.not_used_after(REQUEST_QUEUE, cmd.head, 10 * 1000));
}

/// A logical unit that stays busy.
/// Expect:
///   The command is retried retry_limit times, then completes TASK ABORTED
///   with the whole data-in buffer as residual.
#[test]
fn scsi_busy_backend_test() {
    let tunables = PollerTunables {
        retry_limit: 3,
        ..Default::default()
    };
    let mut test = TestVirtioScsi::new(DEFAULT_FEATURES, 1, tunables);
    let lun = RefusingLun::busy("Busy0");
    test.add_lun(lun.clone());
    test.add_device(0, "Busy0");
    test.start();

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1));
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE);
    assert_eq!(result.resp.response, VIRTIO_SCSI_S_OK);
    assert_eq!(result.resp.status, TASK_ABORTED);
    assert_eq!({ result.resp.resid }, BLOCK_SIZE);
    assert_eq!(lun.submits(), 4);

    let stats = test.stats();
    assert_eq!(stats.backend_retries, 3);
    assert_eq!(stats.aborted, 1);
}

/// A burst of reads against a logical unit with a queue depth of 2.
/// Expect:
///   Refused commands wait for completions instead of burning their
///   retries, so every read completes GOOD and none is aborted.
#[test]
fn scsi_saturated_backend_test() {
    let mut test = scsi_test_init(1);
    let lun = scsi_backend::MallocLun::new("Malloc0", 64, BLOCK_SIZE, 2).unwrap();
    test.add_lun(lun);
    test.add_device(0, "Malloc0");
    test.start();

    let cmds: Vec<_> = (0..64)
        .map(|_| test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1)))
        .collect();
    for cmd in cmds.iter() {
        let result = test.wait_cmd(cmd);
        assert_eq!(result.used_len, CMD_RESP_SIZE + BLOCK_SIZE);
        assert_eq!(result.resp.response, VIRTIO_SCSI_S_OK);
        assert_eq!(result.resp.status, GOOD);
    }

    let stats = test.stats();
    assert_eq!(stats.aborted, 0);
    assert_eq!(stats.completions, 64);
}

/// Removing a device while its only command waits for a busy logical unit.
/// Expect:
///   The waiting command completes BAD_TARGET at once, is never submitted
///   again and the removal finishes without waiting for the retries.
#[test]
fn scsi_remove_device_with_backlog_test() {
    let tunables = PollerTunables {
        retry_limit: 64,
        idle_park_us: 100 * 1000,
        ..Default::default()
    };
    let mut test = TestVirtioScsi::new(DEFAULT_FEATURES, 1, tunables);
    let lun = RefusingLun::busy("Busy0");
    test.add_lun(lun.clone());
    test.add_device(0, "Busy0");
    test.start();

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1));
    test.wait_until(|_| lun.submits() >= 1);

    let (removed, cb) = removal_flag();
    let status = test
        .registry
        .remove_device(CONTROLLER_NAME, 0, Some(cb))
        .unwrap();
    assert_eq!(status, RemoveStatus::Pending);

    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE);
    assert_eq!(result.resp.response, VIRTIO_SCSI_S_BAD_TARGET);
    assert_eq!({ result.resp.resid }, BLOCK_SIZE);

    test.wait_until(|_| removed.load(Ordering::SeqCst));
    assert!(test.registry.get_device(CONTROLLER_NAME, 0).unwrap().is_none());
    let submits = lun.submits();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(lun.submits(), submits);
    assert_eq!(test.stats().aborted, 0);
}

/// Detaching a busy lun while a command to it waits for a retry.
/// Expect:
///   The waiting command completes with LOGICAL UNIT NOT SUPPORTED and the
///   detach finishes, lun 0 keeps working.
#[test]
fn scsi_detach_lun_with_backlog_test() {
    let tunables = PollerTunables {
        retry_limit: 64,
        idle_park_us: 100 * 1000,
        ..Default::default()
    };
    let mut test = TestVirtioScsi::new(DEFAULT_FEATURES, 1, tunables);
    test.add_malloc_lun("Malloc0", 64);
    let busy = RefusingLun::busy("Busy1");
    test.add_lun(busy.clone());
    test.add_device(0, "Malloc0");
    test.registry
        .attach_lun(CONTROLLER_NAME, 0, 1, "Busy1")
        .unwrap();
    test.start();

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 1, 1));
    test.wait_until(|_| busy.submits() >= 1);

    let (detached, cb) = removal_flag();
    let status = test
        .registry
        .detach_lun(CONTROLLER_NAME, 0, 1, Some(cb))
        .unwrap();
    assert_eq!(status, RemoveStatus::Pending);

    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE);
    assert_eq!(result.resp.status, CHECK_CONDITION);
    assert_eq!(
        result.resp.sense[..SCSI_SENSE_LEN],
        SCSI_SENSE_LUN_NOT_SUPPORTED.to_fixed()
    );
    assert_eq!({ result.resp.resid }, BLOCK_SIZE);
    test.wait_until(|_| detached.load(Ordering::SeqCst));

    let other = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1));
    assert_eq!(test.wait_cmd(&other).resp.status, GOOD);
    let submits = busy.submits();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(busy.submits(), submits);
}

/// A logical unit refusing the task.
/// Expect:
///   CHECK CONDITION with TARGET FAILURE sense.
#[test]
fn scsi_failed_backend_test() {
    let mut test = scsi_test_init(1);
    let lun = RefusingLun::failed("Failed0");
    test.add_lun(lun.clone());
    test.add_device(0, "Failed0");
    test.start();

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1));
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE);
    assert_eq!(result.resp.response, VIRTIO_SCSI_S_OK);
    assert_eq!(result.resp.status, CHECK_CONDITION);
    assert_eq!({ result.resp.sense_len }, SCSI_SENSE_LEN as u32);
    assert_eq!(
        result.resp.sense[..SCSI_SENSE_LEN],
        SCSI_SENSE_TARGET_FAILURE.to_fixed()
    );
    assert_eq!({ result.resp.resid }, BLOCK_SIZE);
    assert_eq!(lun.submits(), 1);
}

/// Commands addressed to nothing.
/// Expect:
///   Empty or out of range target: BAD_TARGET.
///   Unknown lun of a bound target: CHECK CONDITION, LOGICAL UNIT NOT SUPPORTED.
#[test]
fn scsi_bad_target_and_lun_test() {
    let mut test = scsi_test_init(1);
    test.add_malloc_lun("Malloc0", 64);
    test.add_device(0, "Malloc0");
    test.start();

    for target in [3_u8, 200] {
        let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(target, 0, 1));
        let result = test.wait_cmd(&cmd);
        assert_eq!(result.used_len, CMD_RESP_SIZE);
        assert_eq!(result.resp.response, VIRTIO_SCSI_S_BAD_TARGET);
    }

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 5, 1));
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE);
    assert_eq!(result.resp.response, VIRTIO_SCSI_S_OK);
    assert_eq!(result.resp.status, CHECK_CONDITION);
    assert_eq!(
        result.resp.sense[..SCSI_SENSE_LEN],
        SCSI_SENSE_LUN_NOT_SUPPORTED.to_fixed()
    );

    let cmd = test.send_cmd(REQUEST_QUEUE, &TestScsiReq::new(0, 0, &[TEST_UNIT_READY]));
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE);
    assert_eq!(result.resp.status, GOOD);

    assert_eq!(test.stats().bad_target, 2);
}

/// Data buffers split into random descriptor layouts.
/// Expect:
///   Whatever the split, the data written is read back and the used
///   length counts the response header plus the data read.
#[test]
fn scsi_random_segments_test() {
    let mut test = scsi_test_init(1);
    let malloc = test.add_malloc_lun("Malloc0", 256);
    test.add_device(0, "Malloc0");
    test.start();

    let mut rng = rand::thread_rng();
    for _ in 0..16 {
        let blocks: u16 = rng.gen_range(1..=16);
        let lba: u32 = rng.gen_range(0..=(256 - u32::from(blocks)));
        let len = u32::from(blocks) * BLOCK_SIZE;
        let data = rand_pattern(len as usize);

        let mut write =
            TestScsiReq::new(0, 0, &write10_cdb(lba, blocks)).with_data_out(data.clone());
        write.data_out_segs = rand_split(len, rng.gen_range(1..=8));
        let cmd = test.send_cmd(REQUEST_QUEUE, &write);
        let result = test.wait_cmd(&cmd);
        assert_eq!(result.resp.status, GOOD);
        assert_eq!(result.used_len, CMD_RESP_SIZE);

        let mut read = TestScsiReq::new(0, 0, &read10_cdb(lba, blocks));
        read.data_in_segs = rand_split(len, rng.gen_range(1..=8));
        assert_eq!(read.data_in_len(), len);
        let cmd = test.send_cmd(REQUEST_QUEUE, &read);
        let result = test.wait_cmd(&cmd);
        assert_eq!(result.resp.status, GOOD);
        assert_eq!(result.used_len, CMD_RESP_SIZE + len);
        assert_eq!(result.data_in, data);

        let mut disk = vec![0_u8; len as usize];
        malloc
            .read_at(u64::from(lba) * u64::from(BLOCK_SIZE), &mut disk)
            .unwrap();
        assert_eq!(disk, data);
    }
}

/// Commands carrying both data-out and data-in buffers.
/// Expect:
///   With INOUT negotiated the command reaches the lun.
///   Without it the command fails with FAILURE and is never submitted.
#[test]
fn scsi_inout_test() {
    let mut test = scsi_test_init(1);
    test.add_malloc_lun("Malloc0", 64);
    test.add_device(0, "Malloc0");
    test.start();

    let req = TestScsiReq::new(0, 0, &write10_cdb(0, 1))
        .with_data_out(rand_pattern(BLOCK_SIZE as usize))
        .with_data_in(BLOCK_SIZE);
    let cmd = test.send_cmd(REQUEST_QUEUE, &req);
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.resp.response, VIRTIO_SCSI_S_OK);
    assert_eq!(result.resp.status, GOOD);
    assert_eq!({ result.resp.resid }, BLOCK_SIZE);
    assert_eq!(result.used_len, CMD_RESP_SIZE);

    let mut test = TestVirtioScsi::new(
        DEFAULT_FEATURES & !(1 << VIRTIO_SCSI_F_INOUT),
        1,
        PollerTunables::default(),
    );
    let lun = ManualLun::new("Manual0");
    test.add_lun(lun.clone());
    test.add_device(0, "Manual0");
    test.start();

    let cmd = test.send_cmd(REQUEST_QUEUE, &req);
    let result = test.wait_cmd(&cmd);
    assert_eq!(result.used_len, CMD_RESP_SIZE);
    assert_eq!(result.resp.response, VIRTIO_SCSI_S_FAILURE);
    assert_eq!(lun.submits(), 0);
}

/// Requests on the control queue.
/// Expect:
///   Resets of present targets and luns succeed, other task management
///   functions are rejected, AN queries report no event, unknown types
///   are returned with used length 0.
#[test]
fn scsi_ctrl_queue_test() {
    let mut test = scsi_test_init(1);
    test.add_malloc_lun("Malloc0", 64);
    test.add_device(0, "Malloc0");
    test.start();

    let tmf_cases = [
        (VIRTIO_SCSI_T_TMF_LOGICAL_UNIT_RESET, 0, 0, VIRTIO_SCSI_S_FUNCTION_SUCCEEDED),
        (VIRTIO_SCSI_T_TMF_I_T_NEXUS_RESET, 0, 0, VIRTIO_SCSI_S_FUNCTION_SUCCEEDED),
        (VIRTIO_SCSI_T_TMF_ABORT_TASK, 0, 0, VIRTIO_SCSI_S_FUNCTION_REJECTED),
        (VIRTIO_SCSI_T_TMF_LOGICAL_UNIT_RESET, 0, 3, VIRTIO_SCSI_S_FUNCTION_REJECTED),
        (VIRTIO_SCSI_T_TMF_I_T_NEXUS_RESET, 4, 0, VIRTIO_SCSI_S_FUNCTION_REJECTED),
    ];
    for (subtype, target, lun, expect) in tmf_cases {
        let req = VirtioScsiCtrlTmfReq {
            ctrltype: VIRTIO_SCSI_T_TMF,
            subtype,
            lun: virtio_scsi_encode_lun(target, lun),
            tag: 0,
        };
        let (head, resp_addr) = test.send_ctrl(req.as_bytes(), 1);
        assert_eq!(test.wait_used(CTRL_QUEUE, head), 1);
        assert_eq!(test.state.borrow().readb(resp_addr), expect);
    }

    let req = VirtioScsiCtrlAnReq {
        ctrltype: VIRTIO_SCSI_T_AN_QUERY,
        lun: virtio_scsi_encode_lun(0, 0),
        event_requested: 0xff,
    };
    let (head, resp_addr) = test.send_ctrl(req.as_bytes(), 5);
    assert_eq!(test.wait_used(CTRL_QUEUE, head), 5);
    assert_eq!(test.state.borrow().readl(resp_addr), 0);
    assert_eq!(test.state.borrow().readb(resp_addr + 4), VIRTIO_SCSI_S_OK);

    let (head, _) = test.send_ctrl(&9_u32.to_le_bytes(), 8);
    assert_eq!(test.wait_used(CTRL_QUEUE, head), 0);

    assert_eq!(test.stats().ctrl_requests, 7);
}

/// Hotplug events on the event queue.
/// TestStep:
///   1. Add a device to slot 1.
///   2. Attach lun 2 to it.
///   3. Detach lun 2.
///   4. Remove the device.
/// Expect:
///   1/2. Transport reset event with reason RESCAN for the new target or lun.
///   3/4. Transport reset event with reason REMOVED.
#[test]
fn scsi_hotplug_event_test() {
    let mut test = scsi_test_init(1);
    test.add_malloc_lun("Malloc0", 64);
    test.add_malloc_lun("Malloc1", 64);
    test.start();

    let buf = test.post_event_buf();
    test.add_device(1, "Malloc0");
    assert_eq!(
        test.wait_event(buf),
        VirtioScsiEvent::transport_reset(1, 0, VIRTIO_SCSI_EVT_RESET_RESCAN)
    );

    let buf = test.post_event_buf();
    test.registry
        .attach_lun(CONTROLLER_NAME, 1, 2, "Malloc1")
        .unwrap();
    assert_eq!(
        test.wait_event(buf),
        VirtioScsiEvent::transport_reset(1, 2, VIRTIO_SCSI_EVT_RESET_RESCAN)
    );

    let buf = test.post_event_buf();
    let status = test
        .registry
        .detach_lun(CONTROLLER_NAME, 1, 2, None)
        .unwrap();
    assert_eq!(status, RemoveStatus::Pending);
    assert_eq!(
        test.wait_event(buf),
        VirtioScsiEvent::transport_reset(1, 2, VIRTIO_SCSI_EVT_RESET_REMOVED)
    );

    let buf = test.post_event_buf();
    let (removed, cb) = removal_flag();
    test.registry
        .remove_device(CONTROLLER_NAME, 1, Some(cb))
        .unwrap();
    assert_eq!(
        test.wait_event(buf),
        VirtioScsiEvent::transport_reset(1, 0, VIRTIO_SCSI_EVT_RESET_REMOVED)
    );
    test.wait_until(|_| removed.load(Ordering::SeqCst));
    assert_eq!(test.stats().events_sent, 4);
}

/// Events raised while the guest supplied no event buffer.
/// Expect:
///   The next buffer carries the EVENTS_MISSED flag.
#[test]
fn scsi_events_missed_test() {
    let mut test = scsi_test_init(1);
    test.add_malloc_lun("Malloc0", 64);
    test.start();

    test.add_device(0, "Malloc0");
    test.wait_until(|t| t.stats().events_missed >= 1);

    let buf = test.post_event_buf();
    let event = test.wait_event(buf);
    assert_eq!({ event.event }, VIRTIO_SCSI_T_EVENTS_MISSED);
}

/// Without HOTPLUG negotiated no event is ever queued.
#[test]
fn scsi_no_hotplug_event_test() {
    let mut test = TestVirtioScsi::new(
        DEFAULT_FEATURES & !(1 << VIRTIO_SCSI_F_HOTPLUG),
        1,
        PollerTunables::default(),
    );
    test.add_malloc_lun("Malloc0", 64);
    test.start();

    let buf = test.post_event_buf();
    test.add_device(0, "Malloc0");
    test.state.borrow().clock_step_ns(SETTLE_NS);
    assert!(test.not_used_after(EVENT_QUEUE, buf.0, 1000));
    let stats = test.stats();
    assert_eq!(stats.events_sent, 0);
    assert_eq!(stats.events_missed, 0);
}

/// Stopping the transport with commands in flight.
/// Expect:
///   stop_controller returns once they completed, with the avail index
///   of every vring.
#[test]
fn scsi_stop_controller_waits_test() {
    let mut test = scsi_test_init(1);
    let lun = ManualLun::new("Manual0");
    test.add_lun(lun.clone());
    test.add_device(0, "Manual0");
    test.start();

    let cmds: Vec<_> = (0..2)
        .map(|_| test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1)))
        .collect();
    test.wait_until(|_| lun.pending() == 2);

    let completer = lun.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        completer.complete_all_good()
    });

    let bases = test.registry.stop_controller(CONTROLLER_NAME).unwrap();
    assert_eq!(lun.pending(), 0);
    assert_eq!(bases, vec![0, 0, 2]);
    assert_eq!(worker.join().unwrap(), 2);

    for cmd in cmds.iter() {
        let result = test.wait_cmd(cmd);
        assert_eq!(result.used_len, CMD_RESP_SIZE + BLOCK_SIZE);
    }

    let err = test.registry.stop_controller(CONTROLLER_NAME).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VhostScsiError>(),
        Some(VhostScsiError::TransportNotStarted(_))
    ));
    // Stopped transport leaves the device bound.
    assert!(test.registry.get_device(CONTROLLER_NAME, 0).unwrap().is_some());

    // Resume from the reported bases, consumed chains are not served again.
    let mut transport = test.transport();
    for (vring, base) in transport.vrings.iter_mut().zip(bases) {
        vring.config.set_vring_base(base);
    }
    test.registry
        .start_controller(CONTROLLER_NAME, transport)
        .unwrap();
    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1));
    test.wait_until(|_| lun.pending() == 1);
    assert_eq!(lun.submits(), 3);
    assert_eq!(lun.complete_all_good(), 1);
    assert_eq!(test.wait_cmd(&cmd).used_len, CMD_RESP_SIZE + BLOCK_SIZE);
}

/// Detaching a lun of a running device.
/// Expect:
///   New commands to the lun fail at once with LOGICAL UNIT NOT SUPPORTED,
///   the callback runs after the in-flight command completed, other luns
///   keep working.
#[test]
fn scsi_detach_lun_test() {
    let mut test = scsi_test_init(1);
    let lun0 = ManualLun::new("Manual0");
    let lun1 = ManualLun::new("Manual1");
    test.add_lun(lun0.clone());
    test.add_lun(lun1.clone());
    test.add_device(0, "Manual0");
    test.registry
        .attach_lun(CONTROLLER_NAME, 0, 1, "Manual1")
        .unwrap();
    test.start();

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 1, 1));
    test.wait_until(|_| lun1.pending() == 1);

    let (detached, cb) = removal_flag();
    let status = test
        .registry
        .detach_lun(CONTROLLER_NAME, 0, 1, Some(cb))
        .unwrap();
    assert_eq!(status, RemoveStatus::Pending);
    test.state.borrow().clock_step_ns(SETTLE_NS);

    let rejected = test.send_cmd(REQUEST_QUEUE, &read_req(0, 1, 1));
    let result = test.wait_cmd(&rejected);
    assert_eq!(result.resp.status, CHECK_CONDITION);
    assert_eq!(
        result.resp.sense[..SCSI_SENSE_LEN],
        SCSI_SENSE_LUN_NOT_SUPPORTED.to_fixed()
    );
    assert_eq!(lun1.submits(), 1);
    assert!(!detached.load(Ordering::SeqCst));

    let other = test.send_cmd(REQUEST_QUEUE, &read_req(0, 0, 1));
    test.wait_until(|_| lun0.pending() == 1);
    assert_eq!(lun0.complete_all_good(), 1);
    assert_eq!(test.wait_cmd(&other).resp.status, GOOD);

    assert_eq!(lun1.complete_all_good(), 1);
    assert_eq!(test.wait_cmd(&cmd).resp.status, GOOD);
    test.wait_until(|_| detached.load(Ordering::SeqCst));

    let device = test
        .registry
        .get_device(CONTROLLER_NAME, 0)
        .unwrap()
        .unwrap();
    assert_eq!(device.lun_ids(), vec![0]);
}

/// Binding a backend whose lun is still draining.
/// Expect:
///   Until the in-flight command completes the backend is in use for new
///   devices and luns, afterwards it can be bound again.
#[test]
fn scsi_detach_lun_keeps_backend_claimed_test() {
    let mut test = scsi_test_init(1);
    let lun0 = ManualLun::new("Manual0");
    let lun1 = ManualLun::new("Manual1");
    test.add_lun(lun0.clone());
    test.add_lun(lun1.clone());
    test.add_device(0, "Manual0");
    test.registry
        .attach_lun(CONTROLLER_NAME, 0, 1, "Manual1")
        .unwrap();
    test.start();

    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(0, 1, 1));
    test.wait_until(|_| lun1.pending() == 1);

    let (detached, cb) = removal_flag();
    let status = test
        .registry
        .detach_lun(CONTROLLER_NAME, 0, 1, Some(cb))
        .unwrap();
    assert_eq!(status, RemoveStatus::Pending);
    test.state.borrow().clock_step_ns(SETTLE_NS);
    assert!(!detached.load(Ordering::SeqCst));

    let err = test
        .registry
        .add_device(CONTROLLER_NAME, 1, "Manual1")
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VhostScsiError>(),
        Some(VhostScsiError::BackendInUse(_))
    ));
    assert!(test.registry.get_device(CONTROLLER_NAME, 1).unwrap().is_none());
    let err = test
        .registry
        .attach_lun(CONTROLLER_NAME, 0, 2, "Manual1")
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VhostScsiError>(),
        Some(VhostScsiError::BackendInUse(_))
    ));

    assert_eq!(lun1.complete_all_good(), 1);
    assert_eq!(test.wait_cmd(&cmd).resp.status, GOOD);
    test.wait_until(|_| detached.load(Ordering::SeqCst));

    test.add_device(1, "Manual1");
    let cmd = test.send_cmd(REQUEST_QUEUE, &read_req(1, 0, 1));
    test.wait_until(|_| lun1.pending() == 1);
    assert_eq!(lun1.complete_all_good(), 1);
    assert_eq!(test.wait_cmd(&cmd).resp.status, GOOD);
    assert_eq!(lun0.submits(), 0);
}

/// Several request queues served by one poller.
/// Expect:
///   Every queue is processed and its avail index reported on stop.
#[test]
fn scsi_multi_queue_test() {
    let mut test = scsi_test_init(4);
    test.add_malloc_lun("Malloc0", 64);
    test.add_device(0, "Malloc0");
    test.start();

    let patterns: Vec<Vec<u8>> = (0..4).map(|_| rand_pattern(BLOCK_SIZE as usize)).collect();
    let writes: Vec<_> = patterns
        .iter()
        .enumerate()
        .map(|(i, data)| {
            let req =
                TestScsiReq::new(0, 0, &write10_cdb(i as u32, 1)).with_data_out(data.clone());
            test.send_cmd(REQUEST_QUEUE + i, &req)
        })
        .collect();
    for cmd in writes.iter() {
        assert_eq!(test.wait_cmd(cmd).resp.status, GOOD);
    }

    for (i, data) in patterns.iter().enumerate() {
        let req = TestScsiReq::new(0, 0, &read10_cdb(i as u32, 1)).with_data_in(BLOCK_SIZE);
        let cmd = test.send_cmd(REQUEST_QUEUE + 3 - i, &req);
        let result = test.wait_cmd(&cmd);
        assert_eq!(result.resp.status, GOOD);
        assert_eq!(&result.data_in, data);
    }

    let bases = test.registry.stop_controller(CONTROLLER_NAME).unwrap();
    assert_eq!(bases, vec![0, 0, 2, 2, 2, 2]);
}

/// Controllers and devices created from command line style configs.
/// Expect:
///   The parsed tunables and the bound backend show up in the query, a
///   backend cannot be bound twice and a bad slot leaves the table untouched.
#[test]
fn scsi_config_cmdline_test() {
    let mut test = scsi_test_init(1);
    test.add_malloc_lun("Malloc0", 64);
    test.add_malloc_lun("Malloc1", 64);

    let config = ControllerConfig::try_parse_from(vhost_scsi::config::str_slip_to_clap(
        "id=ctrl1,cpumask=0x1,retry-limit=2",
    ))
    .unwrap();
    test.registry
        .construct_controller_with_config(config)
        .unwrap();

    let device =
        DeviceConfig::try_parse_from(vhost_scsi::config::str_slip_to_clap("slot=3,backend=Malloc0"))
            .unwrap();
    test.registry
        .add_device_with_config("ctrl1", &device)
        .unwrap();

    let dup =
        DeviceConfig::try_parse_from(vhost_scsi::config::str_slip_to_clap("slot=4,backend=Malloc0"))
            .unwrap();
    let err = test
        .registry
        .add_device_with_config("ctrl1", &dup)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VhostScsiError>(),
        Some(VhostScsiError::BackendInUse(_))
    ));

    let bad =
        DeviceConfig::try_parse_from(vhost_scsi::config::str_slip_to_clap("slot=9,backend=Malloc1"))
            .unwrap();
    assert!(test.registry.add_device_with_config("ctrl1", &bad).is_err());

    let infos = test.registry.query_controllers();
    let info = infos.iter().find(|i| i.name == "ctrl1").unwrap();
    assert_eq!(info.tunables.retry_limit, 2);
    assert_eq!(info.devices.len(), 1);
    assert_eq!(info.devices[0].slot, 3);
    assert_eq!(info.devices[0].state, "bound");
    assert_eq!(
        info.devices[0].luns,
        vec![LunInfo {
            id: 0,
            backend: "Malloc0".to_string()
        }]
    );

    let json = serde_json::to_string(info).unwrap();
    assert!(json.contains("\"retry_limit\":2"));

    let status = test.registry.remove_device("ctrl1", 3, None).unwrap();
    assert_eq!(status, RemoveStatus::Pending);
    test.wait_until(|t| t.registry.get_device("ctrl1", 3).unwrap().is_none());
    test.registry.remove_controller("ctrl1").unwrap();
    assert!(test.registry.remove_controller("ctrl1").is_err());
}
