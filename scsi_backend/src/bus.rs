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

use byteorder::{BigEndian, ByteOrder};

/// Scsi Operation Codes.
pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const READ_6: u8 = 0x08;
pub const WRITE_6: u8 = 0x0a;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SENSE: u8 = 0x1a;
pub const START_STOP: u8 = 0x1b;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;
pub const SYNCHRONIZE_CACHE: u8 = 0x35;
pub const READ_16: u8 = 0x88;
pub const WRITE_16: u8 = 0x8a;
pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
pub const SERVICE_ACTION_IN_16: u8 = 0x9e;
pub const REPORT_LUNS: u8 = 0xa0;
pub const READ_12: u8 = 0xa8;
pub const WRITE_12: u8 = 0xaa;

/// SAM Status codes.
pub const GOOD: u8 = 0x00;
pub const CHECK_CONDITION: u8 = 0x02;
pub const CONDITION_GOOD: u8 = 0x04;
pub const BUSY: u8 = 0x08;
pub const RESERVATION_CONFLICT: u8 = 0x18;
pub const TASK_SET_FULL: u8 = 0x28;
pub const ACA_ACTIVE: u8 = 0x30;
pub const TASK_ABORTED: u8 = 0x40;

/// SERVICE ACTION IN subcodes.
pub const SAI_READ_CAPACITY_16: u8 = 0x10;

/// Sense Keys.
pub const NO_SENSE: u8 = 0x00;
pub const RECOVERED_ERROR: u8 = 0x01;
pub const NOT_READY: u8 = 0x02;
pub const MEDIUM_ERROR: u8 = 0x03;
pub const HARDWARE_ERROR: u8 = 0x04;
pub const ILLEGAL_REQUEST: u8 = 0x05;
pub const UNIT_ATTENTION: u8 = 0x06;
pub const DATA_PROTECT: u8 = 0x07;
pub const ABORTED_COMMAND: u8 = 0x0b;

macro_rules! scsisense {
    ( $key:expr, $asc: expr, $ascq:expr) => {
        ScsiSense {
            key: $key,
            asc: $asc,
            ascq: $ascq,
        }
    };
}

/// Sense Code.
pub const SCSI_SENSE_NO_SENSE: ScsiSense = scsisense!(NO_SENSE, 0x00, 0x00);
pub const SCSI_SENSE_LUN_NOT_READY: ScsiSense = scsisense!(NOT_READY, 0x04, 0x03);
pub const SCSI_SENSE_TARGET_FAILURE: ScsiSense = scsisense!(HARDWARE_ERROR, 0x44, 0x00);
pub const SCSI_SENSE_INVALID_OPCODE: ScsiSense = scsisense!(ILLEGAL_REQUEST, 0x20, 0x00);
pub const SCSI_SENSE_LBA_OUT_OF_RANGE: ScsiSense = scsisense!(ILLEGAL_REQUEST, 0x21, 0x00);
pub const SCSI_SENSE_INVALID_FIELD: ScsiSense = scsisense!(ILLEGAL_REQUEST, 0x24, 0x00);
pub const SCSI_SENSE_LUN_NOT_SUPPORTED: ScsiSense = scsisense!(ILLEGAL_REQUEST, 0x25, 0x00);
pub const SCSI_SENSE_IO_ERROR: ScsiSense = scsisense!(ABORTED_COMMAND, 0x00, 0x06);
pub const SCSI_SENSE_COMMAND_ABORTED: ScsiSense = scsisense!(ABORTED_COMMAND, 0x2f, 0x02);
pub const SCSI_SENSE_REPORTED_LUNS_CHANGED: ScsiSense = scsisense!(UNIT_ATTENTION, 0x3f, 0x0e);

/// Length of fixed format sense data.
pub const SCSI_SENSE_LEN: usize = 18;
/// Response code of fixed format sense data for current errors.
const SENSE_FIXED_CURRENT: u8 = 0x70;

/// Size of the Command Descriptor Block carried by a request.
pub const SCSI_CDB_SIZE: usize = 32;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScsiSense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl ScsiSense {
    /// Encode as fixed format sense data.
    pub fn to_fixed(&self) -> [u8; SCSI_SENSE_LEN] {
        let mut buf = [0_u8; SCSI_SENSE_LEN];
        buf[0] = SENSE_FIXED_CURRENT;
        buf[2] = self.key;
        // Additional sense length: sense len - 8.
        buf[7] = (SCSI_SENSE_LEN - 8) as u8;
        buf[12] = self.asc;
        buf[13] = self.ascq;
        buf
    }

    /// Decode fixed format sense data, `None` for any other format.
    pub fn from_fixed(buf: &[u8]) -> Option<Self> {
        if buf.len() < 14 || buf[0] & 0x7f != SENSE_FIXED_CURRENT {
            return None;
        }
        Some(scsisense!(buf[2] & 0xf, buf[12], buf[13]))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScsiXferMode {
    /// TEST_UNIT_READY, ...
    ScsiXferNone,
    /// READ, INQUIRY, MODE_SENSE, ...
    ScsiXferFromDev,
    /// WRITE, MODE_SELECT, ...
    ScsiXferToDev,
}

/// A Command Descriptor Block decoded far enough to execute it.
#[derive(Clone, Debug)]
pub struct ScsiCommand {
    /// The Command Descriptor Block(CDB).
    pub buf: [u8; SCSI_CDB_SIZE],
    /// Scsi Operation Code.
    pub op: u8,
    /// Length of CDB.
    pub len: u32,
    /// Transfer length in bytes.
    pub xfer: u64,
    /// Logical Block Address.
    pub lba: u64,
    /// Transfer direction.
    pub mode: ScsiXferMode,
}

impl ScsiCommand {
    /// Decode `cdb` for a device with `block_size` byte blocks. Returns `None`
    /// for vendor specific or reserved group codes.
    pub fn parse(cdb: &[u8; SCSI_CDB_SIZE], block_size: u32) -> Option<Self> {
        let len = scsi_cdb_length(cdb)?;
        Some(ScsiCommand {
            buf: *cdb,
            op: cdb[0],
            len,
            xfer: scsi_cdb_xfer(cdb, u64::from(block_size)),
            lba: scsi_cdb_lba(cdb),
            mode: scsi_cdb_xfer_mode(cdb),
        })
    }
}

fn scsi_cdb_length(cdb: &[u8; SCSI_CDB_SIZE]) -> Option<u32> {
    match cdb[0] >> 5 {
        // CDB[0]: Operation Code Byte. Bits[0-4]: Command Code. Bits[5-7]: Group Code.
        // Group Code |  Meaning            |
        // 000b       |  6 bytes commands.  |
        // 001b       |  10 bytes commands. |
        // 010b       |  10 bytes commands. |
        // 011b       |  reserved.          |
        // 100b       |  16 bytes commands. |
        // 101b       |  12 bytes commands. |
        // 110b       |  vendor specific.   |
        // 111b       |  vendor specific.   |
        0 => Some(6),
        1 | 2 => Some(10),
        4 => Some(16),
        5 => Some(12),
        _ => None,
    }
}

fn scsi_cdb_xfer(cdb: &[u8; SCSI_CDB_SIZE], block_size: u64) -> u64 {
    let xfer = match cdb[0] >> 5 {
        // Group Code  |  Transfer length. |
        // 000b        |  Byte[4].         |
        // 001b        |  Bytes[7-8].      |
        // 010b        |  Bytes[7-8].      |
        // 100b        |  Bytes[10-13].    |
        // 101b        |  Bytes[6-9].      |
        0 => u64::from(cdb[4]),
        1 | 2 => u64::from(BigEndian::read_u16(&cdb[7..])),
        4 => u64::from(BigEndian::read_u32(&cdb[10..])),
        5 => u64::from(BigEndian::read_u32(&cdb[6..])),
        _ => 0,
    };

    match cdb[0] {
        TEST_UNIT_READY | START_STOP | SYNCHRONIZE_CACHE | SYNCHRONIZE_CACHE_16 => 0,
        READ_CAPACITY_10 => 8,
        // length 0 means 256 blocks.
        WRITE_6 | READ_6 if xfer == 0 => 256 * block_size,
        WRITE_6 | READ_6 | WRITE_10 | WRITE_12 | WRITE_16 | READ_10 | READ_12 | READ_16 => {
            xfer * block_size
        }
        INQUIRY => u64::from(cdb[4]) | u64::from(cdb[3]) << 8,
        _ => xfer,
    }
}

fn scsi_cdb_lba(cdb: &[u8; SCSI_CDB_SIZE]) -> u64 {
    match cdb[0] >> 5 {
        // Group Code  |  Logical Block Address.       |
        // 000b        |  Byte[1].bits[0-4]~Byte[3].   |
        // 001b        |  Bytes[2-5].                  |
        // 010b        |  Bytes[2-5].                  |
        // 100b        |  Bytes[2-9].                  |
        // 101b        |  Bytes[2-5].                  |
        0 => u64::from(BigEndian::read_u32(&cdb[0..]) & 0x1fffff),
        1 | 2 | 5 => u64::from(BigEndian::read_u32(&cdb[2..])),
        4 => BigEndian::read_u64(&cdb[2..]),
        _ => 0,
    }
}

fn scsi_cdb_xfer_mode(cdb: &[u8; SCSI_CDB_SIZE]) -> ScsiXferMode {
    match cdb[0] {
        WRITE_6 | WRITE_10 | WRITE_12 | WRITE_16 => ScsiXferMode::ScsiXferToDev,
        TEST_UNIT_READY | START_STOP | SYNCHRONIZE_CACHE | SYNCHRONIZE_CACHE_16 => {
            ScsiXferMode::ScsiXferNone
        }
        _ => ScsiXferMode::ScsiXferFromDev,
    }
}
