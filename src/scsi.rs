//! # SCSI helpers
//!
//! Opcode and status constants, CDB field decoding, and fixed-format sense
//! data encoding. Everything here is a pure function over byte buffers; the
//! dispatch and completion machinery in the rest of the crate builds on it.
//!
//! ## Key pieces
//!
//! - **`opcode` / `sam` / `sense_key` / `asc`**: the constants the dispatcher
//!   and backends share
//! - **CDB decoding**: [`get_lba`] and [`get_xfer_length`] for the 6/10/12/16
//!   byte CDB forms
//! - **Sense encoding**: [`set_sense_data`] producing fixed-format sense,
//!   including the MISCOMPARE first-mismatch descriptor
//! - **errno mapping**: [`errno_to_sam_status`] for the backend errno contract

/// Size of the per-command sense buffer, matching the kernel target layer.
pub const SENSE_BUFFER_LEN: usize = 96;

/// SCSI operation codes decoded by the dispatcher.
pub mod opcode {
    pub const READ_6: u8 = 0x08;
    pub const READ_10: u8 = 0x28;
    pub const READ_12: u8 = 0xa8;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_6: u8 = 0x0a;
    pub const WRITE_10: u8 = 0x2a;
    pub const WRITE_12: u8 = 0xaa;
    pub const WRITE_16: u8 = 0x8a;
    pub const WRITE_VERIFY: u8 = 0x2e;
    pub const SYNCHRONIZE_CACHE: u8 = 0x35;
    pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
    pub const COMPARE_AND_WRITE: u8 = 0x89;
    pub const WRITE_SAME: u8 = 0x41;
    pub const WRITE_SAME_16: u8 = 0x93;
}

/// SAM-5 status codes delivered back to the transport.
pub mod sam {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const TASK_SET_FULL: u8 = 0x28;
}

/// Sense keys used by this crate.
pub mod sense_key {
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const MISCOMPARE: u8 = 0x0e;
}

/// Additional sense code / qualifier pairs, packed `(ASC << 8) | ASCQ`.
pub mod asc {
    /// WRITE ERROR
    pub const WRITE_ERROR: u16 = 0x0c00;
    /// UNRECOVERED READ ERROR
    pub const READ_ERROR: u16 = 0x1100;
    /// MISCOMPARE DURING VERIFY OPERATION
    pub const MISCOMPARE_DURING_VERIFY: u16 = 0x1d00;
    /// LOGICAL BLOCK ADDRESS OUT OF RANGE
    pub const LBA_OUT_OF_RANGE: u16 = 0x2100;
    /// INVALID FIELD IN CDB
    pub const INVALID_FIELD_IN_CDB: u16 = 0x2400;
    /// LOGICAL UNIT NOT ACCESSIBLE, ASYMMETRIC ACCESS STATE TRANSITION
    pub const STATE_TRANSITION: u16 = 0x040a;
}

/// Length in bytes of the CDB starting with `opcode`, 0 if unknown.
pub fn cdb_len(opcode: u8) -> usize {
    match opcode >> 5 {
        0 => 6,
        1 | 2 => 10,
        4 => 16,
        5 => 12,
        _ => 0,
    }
}

/// Decode the starting LBA from a CDB.
///
/// Handles the 6, 10, 12 and 16 byte read/write CDB forms; the group code in
/// the opcode's top bits selects the layout.
pub fn get_lba(cdb: &[u8]) -> u64 {
    match cdb_len(cdb[0]) {
        6 => (((cdb[1] as u64) & 0x1f) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64,
        10 | 12 => u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64,
        16 => u64::from_be_bytes([
            cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
        ]),
        _ => 0,
    }
}

/// Decode the transfer length (in blocks) from a CDB.
///
/// A 6-byte CDB with a zero length field means 256 blocks. COMPARE AND WRITE
/// carries its block count in byte 13 rather than the usual 16-byte slot.
pub fn get_xfer_length(cdb: &[u8]) -> u32 {
    if cdb[0] == opcode::COMPARE_AND_WRITE {
        return cdb[13] as u32;
    }
    match cdb_len(cdb[0]) {
        6 => match cdb[4] {
            0 => 256,
            n => n as u32,
        },
        10 => u16::from_be_bytes([cdb[7], cdb[8]]) as u32,
        12 => u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]),
        16 => u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]),
        _ => 0,
    }
}

/// Fill `sense` with fixed-format sense data and return `CHECK_CONDITION`.
///
/// # Arguments:
///
/// * `sense`: the command's sense buffer
/// * `key`: sense key
/// * `asc_ascq`: packed additional sense code and qualifier
/// * `info`: for MISCOMPARE, the byte offset of the first mismatch; stored
///   big-endian in the INFORMATION field with the VALID bit set
pub fn set_sense_data(sense: &mut [u8], key: u8, asc_ascq: u16, info: Option<u32>) -> u8 {
    sense[..18].fill(0);
    sense[0] = 0x70; // fixed format, current error
    sense[2] = key;
    sense[7] = 0x0a;
    sense[12] = (asc_ascq >> 8) as u8;
    sense[13] = (asc_ascq & 0xff) as u8;
    if let Some(val) = info {
        if key == sense_key::MISCOMPARE {
            sense[3..7].copy_from_slice(&val.to_be_bytes());
            sense[0] |= 0x80;
        }
    }
    sam::CHECK_CONDITION
}

/// Whether a store operation moved data toward the initiator; selects the
/// ASC reported for a medium error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDir {
    FromStore,
    ToStore,
}

/// Map an OS errno from a backend to a SAM status, encoding sense as needed.
///
/// `ENOMEM` is a transient resource condition, `ETIMEDOUT` maps to `BUSY`
/// (cluster op timer expired), `ESHUTDOWN` to not-ready state transition
/// (client fenced), and everything else to a medium error in the direction
/// given by `dir`. The lock-aware wrapper lives on the completion path; this
/// function only encodes.
pub fn errno_to_sam_status(errno: i32, sense: &mut [u8], dir: XferDir) -> u8 {
    match errno {
        libc::ENOMEM => sam::TASK_SET_FULL,
        libc::ETIMEDOUT => sam::BUSY,
        libc::ESHUTDOWN => set_sense_data(
            sense,
            sense_key::NOT_READY,
            asc::STATE_TRANSITION,
            None,
        ),
        _ => {
            let code = match dir {
                XferDir::FromStore => asc::READ_ERROR,
                XferDir::ToStore => asc::WRITE_ERROR,
            };
            set_sense_data(sense, sense_key::MEDIUM_ERROR, code, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdb_decode_forms() {
        // READ_10, lba 0x01020304, 8 blocks
        let mut cdb = [0u8; 10];
        cdb[0] = opcode::READ_10;
        cdb[2..6].copy_from_slice(&0x01020304u32.to_be_bytes());
        cdb[7..9].copy_from_slice(&8u16.to_be_bytes());
        assert_eq!(get_lba(&cdb), 0x01020304);
        assert_eq!(get_xfer_length(&cdb), 8);

        // READ_16, 64-bit lba
        let mut cdb = [0u8; 16];
        cdb[0] = opcode::READ_16;
        cdb[2..10].copy_from_slice(&0x0000000a_00000001u64.to_be_bytes());
        cdb[10..14].copy_from_slice(&16u32.to_be_bytes());
        assert_eq!(get_lba(&cdb), 0x0000000a_00000001);
        assert_eq!(get_xfer_length(&cdb), 16);

        // READ_6 with zero length means 256 blocks
        let mut cdb = [0u8; 6];
        cdb[0] = opcode::READ_6;
        cdb[1] = 0x01;
        cdb[2] = 0x02;
        cdb[3] = 0x03;
        assert_eq!(get_lba(&cdb), 0x010203);
        assert_eq!(get_xfer_length(&cdb), 256);

        // WRITE_12 length field
        let mut cdb = [0u8; 12];
        cdb[0] = opcode::WRITE_12;
        cdb[6..10].copy_from_slice(&1024u32.to_be_bytes());
        assert_eq!(get_xfer_length(&cdb), 1024);

        // COMPARE_AND_WRITE block count in byte 13
        let mut cdb = [0u8; 16];
        cdb[0] = opcode::COMPARE_AND_WRITE;
        cdb[13] = 2;
        assert_eq!(get_xfer_length(&cdb), 2);
    }

    #[test]
    fn test_sense_fixed_format() {
        let mut sense = [0u8; SENSE_BUFFER_LEN];
        let status = set_sense_data(
            &mut sense,
            sense_key::MEDIUM_ERROR,
            asc::READ_ERROR,
            None,
        );
        assert_eq!(status, sam::CHECK_CONDITION);
        assert_eq!(sense[0], 0x70);
        assert_eq!(sense[2], sense_key::MEDIUM_ERROR);
        assert_eq!(sense[7], 0x0a);
        assert_eq!(sense[12], 0x11);
        assert_eq!(sense[13], 0x00);
    }

    #[test]
    fn test_sense_miscompare_descriptor() {
        let mut sense = [0u8; SENSE_BUFFER_LEN];
        set_sense_data(
            &mut sense,
            sense_key::MISCOMPARE,
            asc::MISCOMPARE_DURING_VERIFY,
            Some(17),
        );
        // VALID bit plus big-endian offset in the INFORMATION field
        assert_eq!(sense[0], 0xf0);
        assert_eq!(&sense[3..7], &17u32.to_be_bytes());
        assert_eq!(sense[2], sense_key::MISCOMPARE);
        assert_eq!(sense[12], 0x1d);
    }

    #[test]
    fn test_errno_mapping() {
        let mut sense = [0u8; SENSE_BUFFER_LEN];
        assert_eq!(
            errno_to_sam_status(libc::ENOMEM, &mut sense, XferDir::FromStore),
            sam::TASK_SET_FULL
        );
        assert_eq!(
            errno_to_sam_status(libc::ETIMEDOUT, &mut sense, XferDir::FromStore),
            sam::BUSY
        );
        assert_eq!(
            errno_to_sam_status(libc::ESHUTDOWN, &mut sense, XferDir::FromStore),
            sam::CHECK_CONDITION
        );
        assert_eq!(sense[2], sense_key::NOT_READY);

        assert_eq!(
            errno_to_sam_status(libc::EIO, &mut sense, XferDir::ToStore),
            sam::CHECK_CONDITION
        );
        assert_eq!(sense[2], sense_key::MEDIUM_ERROR);
        assert_eq!(sense[12], 0x0c);
    }
}
