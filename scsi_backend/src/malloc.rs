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

//! Memory backed logical unit.
//!
//! Commands are queued to a worker thread which copies between the in-memory
//! disk and the task's host iovecs, then reports completion from that thread.

use std::cmp;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, info, warn};

use crate::bus::*;
use crate::lun::{ScsiCompleteCb, ScsiLun, ScsiTask, ScsiTaskResult, SubmitError};
use crate::ScsiBackendError;
use util::aio::{get_iov_size, iov_from_buf_direct, iov_to_buf_direct};

/// Used to compute the number of sectors.
const SECTOR_SHIFT: u8 = 9;
pub const DEFAULT_BLOCK_SIZE: u32 = 1_u32 << SECTOR_SHIFT;
pub const DEFAULT_QUEUE_DEPTH: usize = 128;

const SCSI_INQUIRY_VENDOR: &[u8; 8] = b"STRA    ";
const SCSI_INQUIRY_PRODUCT: &[u8; 16] = b"MALLOC DISK     ";
const SCSI_INQUIRY_VERSION: &[u8; 4] = b"2.4 ";
const SCSI_STANDARD_INQUIRY_LEN: usize = 36;
/// Longest unit serial number reported in VPD page 0x80.
const SCSI_SERIAL_MAX_LEN: usize = 20;
/// VPD pages.
const VPD_SUPPORTED_PAGES: u8 = 0x00;
const VPD_UNIT_SERIAL_NUMBER: u8 = 0x80;

struct MallocIo {
    task: ScsiTask,
    cb: Arc<dyn ScsiCompleteCb>,
}

#[derive(Clone, Copy)]
struct Geometry {
    block_size: u32,
    num_blocks: u64,
}

pub struct MallocLun {
    name: String,
    geometry: Geometry,
    queue_depth: usize,
    inflight: Arc<AtomicUsize>,
    disk: Arc<Mutex<Vec<u8>>>,
    sender: Mutex<Option<Sender<MallocIo>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MallocLun {
    /// Create a zero filled logical unit of `num_blocks` blocks of `block_size` bytes.
    /// At most `queue_depth` tasks may be outstanding, submitting more reports `Busy`.
    pub fn new(
        name: &str,
        num_blocks: u64,
        block_size: u32,
        queue_depth: usize,
    ) -> Result<Arc<Self>> {
        if block_size < DEFAULT_BLOCK_SIZE || !block_size.is_power_of_two() || num_blocks == 0 {
            return Err(anyhow!(ScsiBackendError::InvalidGeometry(
                name.to_string(),
                num_blocks,
                block_size
            )));
        }
        if queue_depth == 0 {
            return Err(anyhow!(ScsiBackendError::InvalidQueueDepth(
                name.to_string()
            )));
        }
        let size = num_blocks
            .checked_mul(u64::from(block_size))
            .and_then(|s| usize::try_from(s).ok())
            .ok_or_else(|| {
                anyhow!(ScsiBackendError::InvalidGeometry(
                    name.to_string(),
                    num_blocks,
                    block_size
                ))
            })?;

        let geometry = Geometry {
            block_size,
            num_blocks,
        };
        let disk = Arc::new(Mutex::new(vec![0_u8; size]));
        let inflight = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = channel();

        let worker_name = name.to_string();
        let worker_disk = disk.clone();
        let worker_inflight = inflight.clone();
        let worker = thread::Builder::new()
            .name(format!("malloc-{}", name))
            .spawn(move || {
                malloc_worker(worker_name, geometry, worker_disk, worker_inflight, receiver)
            })
            .with_context(|| format!("Failed to spawn worker for logical unit {}", name))?;

        info!(
            "Logical unit {} created: {} blocks of {} bytes, queue depth {}",
            name, num_blocks, block_size, queue_depth
        );
        Ok(Arc::new(MallocLun {
            name: name.to_string(),
            geometry,
            queue_depth,
            inflight,
            disk,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    pub fn num_blocks(&self) -> u64 {
        self.geometry.num_blocks
    }

    /// Tasks submitted and not completed yet.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Copy disk content at byte `offset` into `buf`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let disk = self
            .disk
            .lock()
            .map_err(|_| anyhow!("Disk of logical unit {} is poisoned", self.name))?;
        let range = disk_range(disk.len(), offset, buf.len() as u64)?;
        buf.copy_from_slice(&disk[range.0..range.1]);
        Ok(())
    }

    /// Overwrite disk content at byte `offset` with `buf`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut disk = self
            .disk
            .lock()
            .map_err(|_| anyhow!("Disk of logical unit {} is poisoned", self.name))?;
        let range = disk_range(disk.len(), offset, buf.len() as u64)?;
        disk[range.0..range.1].copy_from_slice(buf);
        Ok(())
    }
}

impl ScsiLun for MallocLun {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, task: ScsiTask, cb: Arc<dyn ScsiCompleteCb>) -> Result<(), SubmitError> {
        if self.inflight.fetch_add(1, Ordering::AcqRel) >= self.queue_depth {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(SubmitError::Busy);
        }

        let sent = match self.sender.lock() {
            Ok(sender) => match sender.as_ref() {
                Some(s) => s.send(MallocIo { task, cb }).is_ok(),
                None => false,
            },
            Err(_) => false,
        };
        if !sent {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(SubmitError::Failed(
                ScsiBackendError::WorkerGone(self.name.clone()).to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for MallocLun {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish the queued tasks and exit.
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!("Worker of logical unit {} panicked", self.name);
            }
        }
        debug!("Logical unit {} released", self.name);
    }
}

fn disk_range(disk_len: usize, offset: u64, len: u64) -> Result<(usize, usize)> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= disk_len as u64)
        .ok_or_else(|| anyhow!(ScsiBackendError::OutOfRange(offset, len, disk_len as u64)))?;
    Ok((offset as usize, end as usize))
}

fn malloc_worker(
    name: String,
    geometry: Geometry,
    disk: Arc<Mutex<Vec<u8>>>,
    inflight: Arc<AtomicUsize>,
    receiver: Receiver<MallocIo>,
) {
    while let Ok(io) = receiver.recv() {
        let result = execute(&name, geometry, &disk, &io.task);
        inflight.fetch_sub(1, Ordering::AcqRel);
        io.cb.scsi_task_complete_cb(result);
    }
    debug!("Worker of logical unit {} exits", name);
}

fn execute(
    name: &str,
    geometry: Geometry,
    disk: &Mutex<Vec<u8>>,
    task: &ScsiTask,
) -> ScsiTaskResult {
    let data_in_len = get_iov_size(&task.data_in);
    let cmd = match ScsiCommand::parse(&task.cdb, geometry.block_size) {
        Some(cmd) => cmd,
        None => {
            debug!("{}: invalid cdb opcode {:#x}", name, task.cdb[0]);
            return ScsiTaskResult::check_condition(SCSI_SENSE_INVALID_OPCODE)
                .with_residual(data_in_len);
        }
    };
    debug!(
        "{}: lun {} tag {} op {:#x} lba {} xfer {}",
        name, task.lun, task.tag, cmd.op, cmd.lba, cmd.xfer
    );

    let emulated = match cmd.op {
        TEST_UNIT_READY | SYNCHRONIZE_CACHE | SYNCHRONIZE_CACHE_16 => Ok(Vec::new()),
        REQUEST_SENSE => Ok(SCSI_SENSE_NO_SENSE.to_fixed().to_vec()),
        INQUIRY => scsi_command_emulate_inquiry(&cmd, name),
        READ_CAPACITY_10 => scsi_command_emulate_read_capacity_10(&cmd, geometry),
        SERVICE_ACTION_IN_16 => scsi_command_emulate_service_action_in_16(&cmd, geometry),
        READ_6 | READ_10 | READ_12 | READ_16 => {
            return malloc_read(&cmd, geometry, disk, task, data_in_len)
        }
        WRITE_6 | WRITE_10 | WRITE_12 | WRITE_16 => {
            return malloc_write(&cmd, geometry, disk, task, data_in_len)
        }
        _ => {
            info!(
                "{}: emulation scsi command {:#x} is not supported",
                name, cmd.op
            );
            Err(SCSI_SENSE_INVALID_OPCODE)
        }
    };

    match emulated {
        Ok(outbuf) => {
            let len = cmp::min(outbuf.len() as u64, cmd.xfer) as usize;
            match iov_from_buf_direct(&task.data_in, &outbuf[..len]) {
                Ok(written) => ScsiTaskResult::good(data_in_len - written as u64),
                Err(e) => {
                    error!("{}: failed to return data of {:#x}: {:?}", name, cmd.op, e);
                    ScsiTaskResult::check_condition(SCSI_SENSE_TARGET_FAILURE)
                        .with_residual(data_in_len)
                }
            }
        }
        Err(sense) => ScsiTaskResult::check_condition(sense).with_residual(data_in_len),
    }
}

/// Byte range of the disk addressed by `cmd`, or the sense to report.
fn lba_range(cmd: &ScsiCommand, geometry: Geometry) -> Result<(usize, usize), ScsiSense> {
    let block_size = u64::from(geometry.block_size);
    let blocks = cmd.xfer / block_size;
    match cmd.lba.checked_add(blocks) {
        Some(end) if end <= geometry.num_blocks => {
            Ok(((cmd.lba * block_size) as usize, (end * block_size) as usize))
        }
        _ => Err(SCSI_SENSE_LBA_OUT_OF_RANGE),
    }
}

fn malloc_read(
    cmd: &ScsiCommand,
    geometry: Geometry,
    disk: &Mutex<Vec<u8>>,
    task: &ScsiTask,
    data_in_len: u64,
) -> ScsiTaskResult {
    let (start, end) = match lba_range(cmd, geometry) {
        Ok(range) => range,
        Err(sense) => return ScsiTaskResult::check_condition(sense).with_residual(data_in_len),
    };
    let len = end - start;
    if data_in_len < len as u64 {
        warn!(
            "Read of {} bytes into a {} bytes buffer rejected",
            len, data_in_len
        );
        return ScsiTaskResult::check_condition(SCSI_SENSE_INVALID_FIELD)
            .with_residual(data_in_len);
    }
    let disk = match disk.lock() {
        Ok(disk) => disk,
        Err(_) => {
            return ScsiTaskResult::check_condition(SCSI_SENSE_TARGET_FAILURE)
                .with_residual(data_in_len)
        }
    };
    match iov_from_buf_direct(&task.data_in, &disk[start..start + len]) {
        Ok(written) => ScsiTaskResult::good(data_in_len - written as u64),
        Err(e) => {
            error!("Failed to read {} bytes at {}: {:?}", len, start, e);
            ScsiTaskResult::check_condition(SCSI_SENSE_IO_ERROR).with_residual(data_in_len)
        }
    }
}

fn malloc_write(
    cmd: &ScsiCommand,
    geometry: Geometry,
    disk: &Mutex<Vec<u8>>,
    task: &ScsiTask,
    data_in_len: u64,
) -> ScsiTaskResult {
    let data_out_len = get_iov_size(&task.data_out);
    let (start, end) = match lba_range(cmd, geometry) {
        Ok(range) => range,
        Err(sense) => return ScsiTaskResult::check_condition(sense).with_residual(data_in_len),
    };
    let len = end - start;
    if data_out_len < len as u64 {
        warn!(
            "Write of {} bytes from a {} bytes buffer rejected",
            len, data_out_len
        );
        return ScsiTaskResult::check_condition(SCSI_SENSE_INVALID_FIELD)
            .with_residual(data_in_len);
    }
    let mut disk = match disk.lock() {
        Ok(disk) => disk,
        Err(_) => {
            return ScsiTaskResult::check_condition(SCSI_SENSE_TARGET_FAILURE)
                .with_residual(data_in_len)
        }
    };
    match iov_to_buf_direct(&task.data_out, 0, &mut disk[start..start + len]) {
        Ok(_) => ScsiTaskResult::good(data_in_len),
        Err(e) => {
            error!("Failed to write {} bytes at {}: {:?}", len, start, e);
            ScsiTaskResult::check_condition(SCSI_SENSE_IO_ERROR).with_residual(data_in_len)
        }
    }
}

fn scsi_command_emulate_inquiry(cmd: &ScsiCommand, name: &str) -> Result<Vec<u8>, ScsiSense> {
    // Byte1 bit0: EVPD(enable vital product data).
    if cmd.buf[1] & 0x1 != 0 {
        return scsi_command_emulate_vpd_page(cmd, name);
    }
    if cmd.buf[2] != 0 {
        return Err(SCSI_SENSE_INVALID_FIELD);
    }

    let mut outbuf = vec![0_u8; SCSI_STANDARD_INQUIRY_LEN];
    // outbuf:
    // Byte0: Peripheral device type, direct access block device.
    // Byte2: Version.
    // Byte3: bits[0-3]: Response Data Format; bit 4:Hisup.
    // Byte4: Additional Length(outbuf.len()-5).
    // Byte7: bit1: Cmdque; bit4: SYNC.
    outbuf[2] = 5;
    outbuf[3] = 2 | 0x10;
    outbuf[4] = (SCSI_STANDARD_INQUIRY_LEN - 5) as u8;
    outbuf[7] = 0x12;
    outbuf[8..16].copy_from_slice(SCSI_INQUIRY_VENDOR);
    outbuf[16..32].copy_from_slice(SCSI_INQUIRY_PRODUCT);
    outbuf[32..36].copy_from_slice(SCSI_INQUIRY_VERSION);
    Ok(outbuf)
}

fn scsi_command_emulate_vpd_page(cmd: &ScsiCommand, name: &str) -> Result<Vec<u8>, ScsiSense> {
    let page_code = cmd.buf[2];
    let mut outbuf = vec![0_u8, page_code, 0, 0];
    match page_code {
        VPD_SUPPORTED_PAGES => {
            outbuf.push(VPD_SUPPORTED_PAGES);
            outbuf.push(VPD_UNIT_SERIAL_NUMBER);
        }
        VPD_UNIT_SERIAL_NUMBER => {
            let serial = name.as_bytes();
            outbuf.extend_from_slice(&serial[..cmp::min(serial.len(), SCSI_SERIAL_MAX_LEN)]);
        }
        _ => return Err(SCSI_SENSE_INVALID_FIELD),
    }
    // Byte[2-3]: Page Length.
    let page_len = (outbuf.len() - 4) as u16;
    BigEndian::write_u16(&mut outbuf[2..4], page_len);
    Ok(outbuf)
}

fn scsi_command_emulate_read_capacity_10(
    cmd: &ScsiCommand,
    geometry: Geometry,
) -> Result<Vec<u8>, ScsiSense> {
    if cmd.buf[8] & 1 == 0 && cmd.lba != 0 {
        // PMI(Partial Medium Indicator)
        return Err(SCSI_SENSE_INVALID_FIELD);
    }

    let mut outbuf = vec![0_u8; 8];
    let last_lba = cmp::min(geometry.num_blocks - 1, u64::from(u32::MAX)) as u32;
    // Bytes[0-3]: Returned Logical Block Address(the logical block address of the last logical
    //             block).
    // Bytes[4-7]: Logical Block Length In Bytes.
    BigEndian::write_u32(&mut outbuf[0..4], last_lba);
    BigEndian::write_u32(&mut outbuf[4..8], geometry.block_size);
    Ok(outbuf)
}

fn scsi_command_emulate_service_action_in_16(
    cmd: &ScsiCommand,
    geometry: Geometry,
) -> Result<Vec<u8>, ScsiSense> {
    // Read Capacity(16) Command.
    // Byte 0: Operation Code(0x9e)
    // Byte 1: bit0 - bit4: Service Action(0x10), bit 5 - bit 7: Reserved.
    if cmd.buf[1] & 0x1f != SAI_READ_CAPACITY_16 {
        return Err(SCSI_SENSE_INVALID_FIELD);
    }

    let mut outbuf = vec![0_u8; 32];
    // Byte[0-7]: Returned Logical BLock Address(the logical block address of the last logical
    //            block).
    // Byte[8-11]: Logical Block Length in Bytes.
    BigEndian::write_u64(&mut outbuf[0..8], geometry.num_blocks - 1);
    BigEndian::write_u32(&mut outbuf[8..12], geometry.block_size);
    Ok(outbuf)
}
