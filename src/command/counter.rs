//! Counter commands: `INCREASE`, `DECREASE` and their `_MULTIPLE`
//! variants.

use crate::apdu::{Apdu, StatusWord};
use crate::error::ErrorKind;

use super::{Command, CommandKind, CommandRef, StatusProperty};

const INS_INCREASE: u8 = 0x32;
const INS_DECREASE: u8 = 0x30;
const INS_INCREASE_MULTIPLE: u8 = 0x3A;
const INS_DECREASE_MULTIPLE: u8 = 0x38;

const COUNTER_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[
    (
        0x6A80,
        StatusProperty {
            info: "incorrect counter value (underflow/overflow)",
            successful: false,
            error_kind: Some(ErrorKind::UnexpectedCommandStatus),
        },
    ),
    (
        0x6200,
        StatusProperty {
            info: "counter value postponed to the session's postponed data",
            successful: true,
            error_kind: None,
        },
    ),
];

fn encode_delta(delta: u32) -> [u8; 3] {
    [(delta >> 16) as u8, (delta >> 8) as u8, delta as u8]
}

fn build_single(ins: u8, command_ref: CommandRef, sfi: u8, counter: u8, delta: u32, kind: CommandKind) -> Command {
    let p2 = sfi << 3;
    let data = encode_delta(delta);
    let apdu = Apdu::build(0x00, ins, counter, p2, Some(&data), Some(0x00));
    Command::new(command_ref, apdu, 0, COUNTER_STATUS_TABLE, true, false, kind)
}

/// Credit `counter` of `sfi` by `delta`.
pub fn build_increase(sfi: u8, counter: u8, delta: u32) -> Command {
    build_single(
        INS_INCREASE,
        CommandRef::Increase,
        sfi,
        counter,
        delta,
        CommandKind::Increase { sfi, counter, delta },
    )
}

/// Debit `counter` of `sfi` by `delta`.
pub fn build_decrease(sfi: u8, counter: u8, delta: u32) -> Command {
    build_single(
        INS_DECREASE,
        CommandRef::Decrease,
        sfi,
        counter,
        delta,
        CommandKind::Decrease { sfi, counter, delta },
    )
}

fn build_multiple(
    ins: u8,
    command_ref: CommandRef,
    sfi: u8,
    deltas: Vec<(u8, u32)>,
    kind: CommandKind,
) -> Command {
    let p2 = sfi << 3;
    let mut data = Vec::with_capacity(deltas.len() * 4);
    for (counter, delta) in &deltas {
        data.push(*counter);
        data.extend_from_slice(&encode_delta(*delta));
    }
    // Request up to one `counter_id(1) || new_value(3)` quadruple per
    // counter; the card may legitimately answer with less (postponed,
    // `0x6200`), so `Command::new`'s own length check stays at 0 rather
    // than enforcing this as an exact size.
    let le = (deltas.len() as u32 * 4).min(255) as u8;
    let apdu = Apdu::build(0x00, ins, 0x00, p2, Some(&data), Some(le));
    Command::new(command_ref, apdu, 0, COUNTER_STATUS_TABLE, true, false, kind)
}

/// Credit several counters of `sfi` in one APDU (CL-CMD-MULTI rule
/// family), falling back to repeated [`build_increase`] on cards that
/// don't support the multiple variant is the caller's responsibility.
pub fn build_increase_multiple(sfi: u8, deltas: Vec<(u8, u32)>) -> Command {
    build_multiple(
        INS_INCREASE_MULTIPLE,
        CommandRef::IncreaseMultiple,
        sfi,
        deltas.clone(),
        CommandKind::IncreaseMultiple { sfi, deltas },
    )
}

/// Debit several counters of `sfi` in one APDU.
pub fn build_decrease_multiple(sfi: u8, deltas: Vec<(u8, u32)>) -> Command {
    build_multiple(
        INS_DECREASE_MULTIPLE,
        CommandRef::DecreaseMultiple,
        sfi,
        deltas.clone(),
        CommandKind::DecreaseMultiple { sfi, deltas },
    )
}
