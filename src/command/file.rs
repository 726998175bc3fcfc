//! File I/O commands: `SELECT_FILE`, `GET_DATA`, the `READ_*` family and
//! the `UPDATE`/`WRITE`/`APPEND` record/binary commands.

use crate::apdu::{Apdu, StatusWord};
use crate::error::ErrorKind;

use super::{Command, CommandKind, CommandRef, StatusProperty};

const INS_SELECT_FILE: u8 = 0xA4;
const INS_GET_DATA: u8 = 0xCA;
const INS_READ_RECORDS: u8 = 0xB2;
const INS_READ_RECORD_MULTIPLE: u8 = 0xB3;
const INS_READ_BINARY: u8 = 0xB0;
const INS_SEARCH_RECORD_MULTIPLE: u8 = 0xA2;
const INS_UPDATE_RECORD: u8 = 0xDC;
const INS_WRITE_RECORD: u8 = 0xD2;
const INS_APPEND_RECORD: u8 = 0xE2;
const INS_UPDATE_BINARY: u8 = 0xD6;
const INS_WRITE_BINARY: u8 = 0xD0;

/// `GET_DATA` tag for the card's own PKI-mode certificate.
pub const TAG_CARD_CERTIFICATE: u16 = 0x7F21;
/// `GET_DATA` tag for the CA certificate that issued it.
pub const TAG_CA_CERTIFICATE: u16 = 0x7F22;

const FILE_NOT_FOUND: (StatusWord, StatusProperty) = (
    0x6A82,
    StatusProperty {
        info: "file not found",
        successful: false,
        error_kind: Some(ErrorKind::SelectFile),
    },
);

const RECORD_NOT_FOUND: (StatusWord, StatusProperty) = (
    0x6A83,
    StatusProperty {
        info: "record not found",
        successful: false,
        error_kind: Some(ErrorKind::UnexpectedCommandStatus),
    },
);

const SELECT_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[FILE_NOT_FOUND];
const READ_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[FILE_NOT_FOUND, RECORD_NOT_FOUND];
const WRITE_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[
    FILE_NOT_FOUND,
    (
        0x6985,
        StatusProperty {
            info: "access conditions not satisfied",
            successful: false,
            error_kind: Some(ErrorKind::ImproperState),
        },
    ),
];

/// Select a file by its LID (2-byte identifier).
pub fn build_select_file(lid: [u8; 2]) -> Command {
    let apdu = Apdu::build(0x00, INS_SELECT_FILE, 0x09, 0x00, Some(&lid), Some(0x00));
    Command::new(
        CommandRef::SelectFile,
        apdu,
        0,
        SELECT_STATUS_TABLE,
        false,
        false,
        CommandKind::SelectFile,
    )
}

/// Read a tag-addressed data object (`GET_DATA`), e.g. an FCI or, in PKI
/// mode, a certificate.
pub fn build_get_data(tag: u16) -> Command {
    let p1 = (tag >> 8) as u8;
    let p2 = tag as u8;
    let apdu = Apdu::build(0x00, INS_GET_DATA, p1, p2, None, Some(0x00));
    Command::new(
        CommandRef::GetData,
        apdu,
        0,
        SELECT_STATUS_TABLE,
        false,
        false,
        CommandKind::GetData { tag },
    )
}

/// Read one record of `sfi`. `legacy_case1` is
/// `card.capabilities().contains(CardCapabilities::LEGACY_CASE1)` — on
/// such cards a literal `Le = 0x00` is read as "zero bytes", not "any
/// length", so a non-zero placeholder must be requested instead (I2).
pub fn build_read_record(sfi: u8, record_number: u8, legacy_case1: bool) -> Command {
    let p2 = (sfi << 3) | 0x04;
    let le = if legacy_case1 { 0xFF } else { 0x00 };
    let apdu = Apdu::build(0x00, INS_READ_RECORDS, record_number, p2, None, Some(le));
    Command::new(
        CommandRef::ReadRecords,
        apdu,
        0,
        READ_STATUS_TABLE,
        false,
        false,
        CommandKind::ReadRecords {
            sfi,
            first_record: record_number,
        },
    )
}

/// Read multiple whole records of `sfi` in one APDU (`READ_RECORDS` with
/// P1 = first record, Le sized for `count` records of `record_size`
/// bytes each).
pub fn build_read_records(sfi: u8, first_record: u8, count: u8, record_size: u8) -> Command {
    let p2 = (sfi << 3) | 0x05;
    let le = count.saturating_mul(record_size);
    let apdu = Apdu::build(0x00, INS_READ_RECORDS, first_record, p2, None, Some(le));
    Command::new(
        CommandRef::ReadRecords,
        apdu,
        le,
        READ_STATUS_TABLE,
        false,
        false,
        CommandKind::ReadRecords { sfi, first_record },
    )
}

/// `READ_RECORD_MULTIPLE`: read the same byte range from several records
/// of a counter/cyclic file in one APDU.
pub fn build_read_record_multiple(sfi: u8, record_number: u8, offset: u8, length: u8) -> Command {
    let p2 = (sfi << 3) | 0x01;
    let data = [offset, length];
    let apdu = Apdu::build(
        0x00,
        INS_READ_RECORD_MULTIPLE,
        record_number,
        p2,
        Some(&data),
        Some(0x00),
    );
    Command::new(
        CommandRef::ReadRecordMultiple,
        apdu,
        0,
        READ_STATUS_TABLE,
        false,
        false,
        CommandKind::ReadRecordMultiple {
            sfi,
            record: record_number,
        },
    )
}

/// Read `length` bytes of a binary file starting at `offset`.
pub fn build_read_binary(sfi: u8, offset: u16, length: u8) -> Command {
    let (p1, p2) = if sfi == 0 {
        ((offset >> 8) as u8, offset as u8)
    } else {
        (0x80 | sfi, offset as u8)
    };
    let apdu = Apdu::build(0x00, INS_READ_BINARY, p1, p2, None, Some(length));
    Command::new(
        CommandRef::ReadBinary,
        apdu,
        0,
        READ_STATUS_TABLE,
        false,
        false,
        CommandKind::ReadBinary { sfi, offset },
    )
}

/// `SEARCH_RECORD_MULTIPLE`: search `pattern` across a file's records.
pub fn build_search_record_multiple(sfi: u8, pattern: Vec<u8>) -> Command {
    let p2 = (sfi << 3) | 0x01;
    let apdu = Apdu::build(0x00, INS_SEARCH_RECORD_MULTIPLE, 0x00, p2, Some(&pattern), Some(0x00));
    Command::new(
        CommandRef::SearchRecordMultiple,
        apdu,
        0,
        READ_STATUS_TABLE,
        false,
        false,
        CommandKind::SearchRecordMultiple { sfi },
    )
}

/// Overwrite one record of `sfi` with `data` (modifying command).
pub fn build_update_record(sfi: u8, record_number: u8, data: Vec<u8>) -> Command {
    let p2 = (sfi << 3) | 0x04;
    let apdu = Apdu::build(0x00, INS_UPDATE_RECORD, record_number, p2, Some(&data), None);
    Command::new(
        CommandRef::UpdateRecord,
        apdu,
        0,
        WRITE_STATUS_TABLE,
        true,
        false,
        CommandKind::UpdateRecord {
            sfi,
            record: record_number,
            data,
        },
    )
}

/// Write into one record of `sfi`, OR-ing `data` into the existing
/// content rather than replacing it (modifying command).
pub fn build_write_record(sfi: u8, record_number: u8, data: Vec<u8>) -> Command {
    let p2 = (sfi << 3) | 0x04;
    let apdu = Apdu::build(0x00, INS_WRITE_RECORD, record_number, p2, Some(&data), None);
    Command::new(
        CommandRef::WriteRecord,
        apdu,
        0,
        WRITE_STATUS_TABLE,
        true,
        false,
        CommandKind::WriteRecord {
            sfi,
            record: record_number,
            data,
        },
    )
}

/// Append a new record to a linear/cyclic file (modifying command).
pub fn build_append_record(sfi: u8, data: Vec<u8>) -> Command {
    let p2 = (sfi << 3) | 0x04;
    let apdu = Apdu::build(0x00, INS_APPEND_RECORD, 0x00, p2, Some(&data), None);
    Command::new(
        CommandRef::AppendRecord,
        apdu,
        0,
        WRITE_STATUS_TABLE,
        true,
        false,
        CommandKind::AppendRecord { sfi, data },
    )
}

/// Overwrite `data` at `offset` in a binary file (modifying command).
pub fn build_update_binary(sfi: u8, offset: u16, data: Vec<u8>) -> Command {
    let (p1, p2) = if sfi == 0 {
        ((offset >> 8) as u8, offset as u8)
    } else {
        (0x80 | sfi, offset as u8)
    };
    let apdu = Apdu::build(0x00, INS_UPDATE_BINARY, p1, p2, Some(&data), None);
    Command::new(
        CommandRef::UpdateBinary,
        apdu,
        0,
        WRITE_STATUS_TABLE,
        true,
        false,
        CommandKind::UpdateBinary { sfi, offset, data },
    )
}

/// Write (OR-merge) `data` at `offset` in a binary file (modifying
/// command).
pub fn build_write_binary(sfi: u8, offset: u16, data: Vec<u8>) -> Command {
    let (p1, p2) = if sfi == 0 {
        ((offset >> 8) as u8, offset as u8)
    } else {
        (0x80 | sfi, offset as u8)
    };
    let apdu = Apdu::build(0x00, INS_WRITE_BINARY, p1, p2, Some(&data), None);
    Command::new(
        CommandRef::WriteBinary,
        apdu,
        0,
        WRITE_STATUS_TABLE,
        true,
        false,
        CommandKind::WriteBinary { sfi, offset, data },
    )
}
