//! Session lifecycle commands: `OPEN_SECURE_SESSION`, `CLOSE_SECURE_SESSION`,
//! `MANAGE_SECURE_SESSION`.

use crate::apdu::{Apdu, StatusWord};
use crate::error::ErrorKind;
use crate::types::AccessLevel;

use super::{Command, CommandKind, CommandRef, StatusProperty};

const INS_OPEN_SECURE_SESSION: u8 = 0x8A;
const INS_CLOSE_OR_MANAGE_SECURE_SESSION: u8 = 0x8E;

const OPEN_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[
    (
        0x6700,
        StatusProperty {
            info: "Lc value not supported",
            successful: false,
            error_kind: Some(ErrorKind::UnexpectedCommandStatus),
        },
    ),
    (
        0x6985,
        StatusProperty {
            info: "access forbidden (session already open, or wrong access level)",
            successful: false,
            error_kind: Some(ErrorKind::ImproperState),
        },
    ),
    (
        0x6A82,
        StatusProperty {
            info: "file not found",
            successful: false,
            error_kind: Some(ErrorKind::SelectFile),
        },
    ),
];

const CLOSE_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[(
    0x6988,
    StatusProperty {
        info: "incorrect terminal session MAC",
        successful: false,
        error_kind: Some(ErrorKind::InvalidCardSessionMac),
    },
)];

const MANAGE_STATUS_TABLE: &[(StatusWord, StatusProperty)] = &[(
    0x6985,
    StatusProperty {
        info: "not allowed outside a secure session, or unsupported by the card",
        successful: false,
        error_kind: Some(ErrorKind::ImproperState),
    },
)];

/// Build `OPEN_SECURE_SESSION`. When `read_sfi`/`read_record` are given,
/// the response also carries the first record of that file.
pub fn build_open_secure_session(level: AccessLevel, read_sfi: Option<u8>, read_record: u8) -> Command {
    let p1 = level.session_open_p1();
    let p2 = read_sfi.map(|sfi| (sfi << 3) | 0x01).unwrap_or(0x00);
    let data = read_sfi.map(|_| vec![read_record]);

    let apdu = Apdu::build(0x00, INS_OPEN_SECURE_SESSION, p1, p2, data.as_deref(), Some(0x00));
    Command::new(
        CommandRef::OpenSecureSession,
        apdu,
        0,
        OPEN_STATUS_TABLE,
        false,
        false,
        CommandKind::OpenSecureSession,
    )
}

/// Build `CLOSE_SECURE_SESSION`. The terminal MAC (or, for `abort`, no
/// data at all) is a placeholder until [`Command::finalize_request`]
/// splices in the crypto provider's computed bytes.
pub fn build_close_secure_session(abort: bool, ratified: bool) -> Command {
    let p1 = 0x00;
    let p2 = if ratified { 0x00 } else { 0x01 };

    let (data, le): (Option<Vec<u8>>, Option<u8>) = if abort {
        (None, None)
    } else {
        (Some(vec![0u8; 4]), Some(0x00))
    };

    let apdu = Apdu::build(0x00, INS_CLOSE_OR_MANAGE_SECURE_SESSION, p1, p2, data.as_deref(), le);
    Command::new(
        CommandRef::CloseSecureSession,
        apdu,
        0,
        CLOSE_STATUS_TABLE,
        false,
        !abort,
        CommandKind::CloseSecureSession { abort },
    )
}

/// Build `MANAGE_SECURE_SESSION`. P2 bit 0 requests mutual authentication
/// (placeholder 8-byte terminal MAC, spliced in later), bit 1 activates
/// in-session encryption.
pub fn build_manage_secure_session(mutual_auth: bool, activate_encryption: bool) -> Command {
    let mut p2 = 0x00;
    if mutual_auth {
        p2 |= 0x01;
    }
    if activate_encryption {
        p2 |= 0x02;
    }

    let (data, le): (Option<Vec<u8>>, Option<u8>) = if mutual_auth {
        (Some(vec![0u8; 8]), Some(0x08))
    } else {
        (None, None)
    };

    let apdu = Apdu::build(
        0x00,
        INS_CLOSE_OR_MANAGE_SECURE_SESSION,
        0xFF,
        p2,
        data.as_deref(),
        le,
    );
    Command::new(
        CommandRef::ManageSecureSession,
        apdu,
        if mutual_auth { 8 } else { 0 },
        MANAGE_STATUS_TABLE,
        false,
        mutual_auth,
        CommandKind::ManageSecureSession {
            mutual_auth,
            activate_encryption,
        },
    )
}
