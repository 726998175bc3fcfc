//! Stored-Value commands: `SV_GET`, `SV_RELOAD`, `SV_DEBIT`, `SV_UNDEBIT`,
//! plus the standalone `RATIFICATION` APDU.

use crate::apdu::{Apdu, StatusWord};
use crate::error::ErrorKind;
use crate::types::SvOperation;

use super::{Command, CommandKind, CommandRef, StatusProperty};

const INS_SV_GET: u8 = 0x7C;
const INS_SV_RELOAD: u8 = 0x56;
const INS_SV_DEBIT_OR_UNDEBIT: u8 = 0x54;
const INS_RATIFICATION: u8 = 0xB2;

const SV_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[
    (
        0x6985,
        StatusProperty {
            info: "SV command preconditions not satisfied",
            successful: false,
            error_kind: Some(ErrorKind::ImproperState),
        },
    ),
    (
        0x6200,
        StatusProperty {
            info: "SV data postponed to the session's postponed data",
            successful: true,
            error_kind: None,
        },
    ),
];

/// Build `SV_GET`, requesting the load or debit log depending on `operation`.
pub fn build_sv_get(operation: SvOperation) -> Command {
    let p1 = match operation {
        SvOperation::Reload => 0x01,
        SvOperation::Debit => 0x00,
    };
    let apdu = Apdu::build(0x00, INS_SV_GET, p1, 0x00, None, Some(0x00));
    Command::new(
        CommandRef::SvGet,
        apdu,
        0,
        SV_STATUS_TABLE,
        false,
        false,
        CommandKind::SvGet { operation },
    )
}

/// Encode the fixed `amount || date || time` header shared by all three
/// SV modifying commands; the SAM-computed security data is appended
/// separately via [`Command::finalize_request`].
fn sv_modify_header(amount: i32, date: u16, time: u16) -> Vec<u8> {
    let amount_bytes = amount.to_be_bytes();
    let mut header = vec![amount_bytes[1], amount_bytes[2], amount_bytes[3]];
    header.extend_from_slice(&date.to_be_bytes());
    header.extend_from_slice(&time.to_be_bytes());
    header
}

/// Build `SV_RELOAD`. `amount` must be non-negative (it is the sign
/// itself, not the operation, that distinguishes reload from debit).
/// The trailing SAM security-data bytes are a placeholder until
/// finalized.
pub fn build_sv_reload(amount: i32, date: u16, time: u16, security_data_len: usize) -> Command {
    let mut data = sv_modify_header(amount, date, time);
    data.extend(std::iter::repeat(0u8).take(security_data_len));
    // The response is either empty (postponed, `0x6200`) or carries SV
    // security data, so `Some(0x00)` ("any length") rather than a fixed
    // size; `finalize_crypto_dependent_command` mirrors this trailing Le
    // byte when it splices in the SAM-computed security data.
    let apdu = Apdu::build(0x00, INS_SV_RELOAD, 0x00, 0x00, Some(&data), Some(0x00));
    Command::new(
        CommandRef::SvReload,
        apdu,
        0,
        SV_STATUS_TABLE,
        true,
        true,
        CommandKind::SvReload { amount },
    )
}

/// Build `SV_DEBIT`.
pub fn build_sv_debit(amount: i32, date: u16, time: u16, security_data_len: usize) -> Command {
    let mut data = sv_modify_header(amount, date, time);
    data.extend(std::iter::repeat(0u8).take(security_data_len));
    let apdu = Apdu::build(0x00, INS_SV_DEBIT_OR_UNDEBIT, 0x00, 0x00, Some(&data), Some(0x00));
    Command::new(
        CommandRef::SvDebit,
        apdu,
        0,
        SV_STATUS_TABLE,
        true,
        true,
        CommandKind::SvDebit { amount },
    )
}

/// Build `SV_UNDEBIT` (reverses a previously committed debit).
pub fn build_sv_undebit(amount: i32, date: u16, time: u16, security_data_len: usize) -> Command {
    let mut data = sv_modify_header(amount, date, time);
    data.extend(std::iter::repeat(0u8).take(security_data_len));
    let apdu = Apdu::build(0x00, INS_SV_DEBIT_OR_UNDEBIT, 0x01, 0x00, Some(&data), Some(0x00));
    Command::new(
        CommandRef::SvUndebit,
        apdu,
        0,
        SV_STATUS_TABLE,
        true,
        true,
        CommandKind::SvUndebit { amount },
    )
}

/// Build the standalone `RATIFICATION` APDU (rule CL-RAT-CMD.1): a
/// zero-length `READ_RECORDS` sent purely to confirm the terminal
/// received `CLOSE_SECURE_SESSION`'s response, tolerated to fail
/// (CL-RAT-DELAY.1).
pub fn build_ratification() -> Command {
    let apdu = Apdu::build(0x00, INS_RATIFICATION, 0x00, 0x00, None, None);
    Command::new(
        CommandRef::Ratification,
        apdu,
        0,
        &[],
        false,
        false,
        CommandKind::Ratification,
    )
}
