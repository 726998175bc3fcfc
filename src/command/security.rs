//! PIN, key-management and administrative commands: `GET_CHALLENGE`,
//! `VERIFY_PIN`, `CHANGE_PIN`, `CHANGE_KEY`, `INVALIDATE`, `REHABILITATE`.

use crate::apdu::{Apdu, StatusWord};
use crate::error::ErrorKind;

use super::{Command, CommandKind, CommandRef, StatusProperty};

const INS_GET_CHALLENGE: u8 = 0x84;
const INS_VERIFY_PIN: u8 = 0x20;
const INS_CHANGE_PIN_PLAIN: u8 = 0x24;
const INS_CHANGE_PIN_CIPHERED: u8 = 0xD8;
const INS_CHANGE_KEY: u8 = 0xD8;
const INS_INVALIDATE: u8 = 0x04;
const INS_REHABILITATE: u8 = 0x44;

const PIN_BLOCKED: (StatusWord, StatusProperty) = (
    0x6983,
    StatusProperty {
        info: "PIN blocked",
        successful: true,
        error_kind: None,
    },
);

const PIN_2_ATTEMPTS: (StatusWord, StatusProperty) = (
    0x63C2,
    StatusProperty {
        info: "incorrect PIN, 2 attempts remaining",
        successful: true,
        error_kind: None,
    },
);

const PIN_1_ATTEMPT: (StatusWord, StatusProperty) = (
    0x63C1,
    StatusProperty {
        info: "incorrect PIN, 1 attempt remaining",
        successful: true,
        error_kind: None,
    },
);

/// `VERIFY_PIN`'s status table: every one of these entries counts as a
/// "successful" exchange even when the PIN itself was wrong,
/// because the card still answered the command correctly — only the
/// access level (and the caller, by inspecting `pin_attempts_remaining`)
/// decides whether the verification succeeded.
const VERIFY_PIN_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[PIN_2_ATTEMPTS, PIN_1_ATTEMPT, PIN_BLOCKED];

const CHANGE_KEY_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[(
    0x6985,
    StatusProperty {
        info: "access conditions not satisfied",
        successful: false,
        error_kind: Some(ErrorKind::ImproperState),
    },
)];

const NO_EXTRA_STATUS: &[(StatusWord, StatusProperty)] = &[];

/// `GET_CHALLENGE`: draw an 8-byte card challenge, used both to open a
/// session and to cipher a PIN/key outside one.
pub fn build_get_challenge() -> Command {
    let apdu = Apdu::build(0x00, INS_GET_CHALLENGE, 0x00, 0x00, None, Some(0x08));
    Command::new(
        CommandRef::GetChallenge,
        apdu,
        8,
        NO_EXTRA_STATUS,
        false,
        false,
        CommandKind::GetChallenge,
    )
}

/// Build `VERIFY_PIN` with a plaintext 4-digit PIN (only legal when
/// `pin_plain_transmission_enabled`).
pub fn build_verify_pin_plain(pin: [u8; 4]) -> Command {
    let apdu = Apdu::build(0x00, INS_VERIFY_PIN, 0x00, 0x00, Some(&pin), None);
    Command::new(
        CommandRef::VerifyPin,
        apdu,
        0,
        VERIFY_PIN_STATUS_TABLE,
        false,
        false,
        CommandKind::VerifyPin { pin, ciphered: false },
    )
}

/// Build `VERIFY_PIN` with a placeholder ciphered data-in, to be
/// replaced via [`Command::finalize_request`] once the crypto provider
/// has ciphered the PIN against the card's challenge.
pub fn build_verify_pin_ciphered(pin: [u8; 4]) -> Command {
    let apdu = Apdu::build(0x00, INS_VERIFY_PIN, 0x00, 0x00, Some(&[0u8; 8]), None);
    Command::new(
        CommandRef::VerifyPin,
        apdu,
        0,
        VERIFY_PIN_STATUS_TABLE,
        false,
        true,
        CommandKind::VerifyPin { pin, ciphered: true },
    )
}

/// Build `CHANGE_PIN` with a plaintext new PIN.
pub fn build_change_pin_plain(new_pin: [u8; 4]) -> Command {
    let apdu = Apdu::build(0x00, INS_CHANGE_PIN_PLAIN, 0x00, 0x00, Some(&new_pin), None);
    Command::new(
        CommandRef::ChangePin,
        apdu,
        0,
        NO_EXTRA_STATUS,
        true,
        false,
        CommandKind::ChangePin { new_pin, ciphered: false },
    )
}

/// Build `CHANGE_PIN` with a placeholder ciphered data-in, replaced once
/// the crypto provider has ciphered the new PIN against the card's
/// challenge.
pub fn build_change_pin_ciphered(new_pin: [u8; 4]) -> Command {
    let apdu = Apdu::build(0x00, INS_CHANGE_PIN_CIPHERED, 0x00, 0x00, Some(&[0u8; 8]), None);
    Command::new(
        CommandRef::ChangePin,
        apdu,
        0,
        NO_EXTRA_STATUS,
        true,
        true,
        CommandKind::ChangePin { new_pin, ciphered: true },
    )
}

/// Build `CHANGE_KEY` with a placeholder 32-byte ciphered key blob,
/// replaced once the crypto provider has computed it.
pub fn build_change_key(key_index: u8, issuer_kif: u8, issuer_kvc: u8, new_kif: u8, new_kvc: u8) -> Command {
    let apdu = Apdu::build(0x00, INS_CHANGE_KEY, key_index, 0x00, Some(&[0u8; 32]), None);
    Command::new(
        CommandRef::ChangeKey,
        apdu,
        0,
        CHANGE_KEY_STATUS_TABLE,
        true,
        true,
        CommandKind::ChangeKey {
            key_index,
            issuer_kif,
            issuer_kvc,
            new_kif,
            new_kvc,
        },
    )
}

/// Build `INVALIDATE`.
pub fn build_invalidate() -> Command {
    let apdu = Apdu::build(0x00, INS_INVALIDATE, 0x00, 0x00, None, None);
    Command::new(
        CommandRef::Invalidate,
        apdu,
        0,
        NO_EXTRA_STATUS,
        true,
        false,
        CommandKind::Invalidate,
    )
}

/// Build `REHABILITATE`.
pub fn build_rehabilitate() -> Command {
    let apdu = Apdu::build(0x00, INS_REHABILITATE, 0x00, 0x00, None, None);
    Command::new(
        CommandRef::Rehabilitate,
        apdu,
        0,
        NO_EXTRA_STATUS,
        true,
        false,
        CommandKind::Rehabilitate,
    )
}

/// Build `VERIFY_PIN` with no data-in (Case1): learn
/// `pin_attempts_remaining` without attempting a verification.
pub fn build_check_pin_status() -> Command {
    let apdu = Apdu::build(0x00, INS_VERIFY_PIN, 0x00, 0x00, None, None);
    Command::new(
        CommandRef::VerifyPin,
        apdu,
        0,
        VERIFY_PIN_STATUS_TABLE,
        false,
        false,
        CommandKind::CheckPinStatus,
    )
}

/// Map a `VERIFY_PIN` response's status word to the `pin_attempts_remaining`
/// value it implies.
pub fn pin_attempts_from_status_word(sw: StatusWord) -> Option<u8> {
    match sw {
        crate::apdu::SW_SUCCESS => Some(3),
        0x63C2 => Some(2),
        0x63C1 => Some(1),
        0x6983 => Some(0),
        _ => None,
    }
}
