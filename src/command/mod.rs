//! Command descriptor.
//!
//! One file per command family, a flat [`CommandRef`] enum identifying
//! the wire command, and a single [`Command`] struct carrying
//! both the built APDU and enough variant-specific state ([`CommandKind`])
//! to mutate the card image once a response arrives. Shared behaviour —
//! status lookup, response-length check, session-buffer sizing — lives
//! once here rather than duplicated per variant.

pub mod counter;
pub mod file;
pub mod security;
pub mod session;
pub mod sv;

use crate::apdu::{self, Apdu, StatusWord};
use crate::card_image::CardImage;
use crate::error::{CalypsoError, ErrorKind, Result};

/// Identifies a wire command, drawn from this crate's closed command catalogue.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CommandRef {
    OpenSecureSession,
    CloseSecureSession,
    ManageSecureSession,
    GetChallenge,
    SelectFile,
    GetData,
    ReadRecords,
    ReadRecordMultiple,
    ReadBinary,
    SearchRecordMultiple,
    UpdateRecord,
    WriteRecord,
    AppendRecord,
    UpdateBinary,
    WriteBinary,
    Increase,
    Decrease,
    IncreaseMultiple,
    DecreaseMultiple,
    VerifyPin,
    ChangePin,
    ChangeKey,
    Invalidate,
    Rehabilitate,
    SvGet,
    SvReload,
    SvDebit,
    SvUndebit,
    Ratification,
}

impl CommandRef {
    /// Human-readable name: the audit trail's `command_ref` and the tag
    /// used in error descriptions.
    pub fn as_str(self) -> &'static str {
        use CommandRef::*;
        match self {
            OpenSecureSession => "OPEN_SECURE_SESSION",
            CloseSecureSession => "CLOSE_SECURE_SESSION",
            ManageSecureSession => "MANAGE_SECURE_SESSION",
            GetChallenge => "GET_CHALLENGE",
            SelectFile => "SELECT_FILE",
            GetData => "GET_DATA",
            ReadRecords => "READ_RECORDS",
            ReadRecordMultiple => "READ_RECORD_MULTIPLE",
            ReadBinary => "READ_BINARY",
            SearchRecordMultiple => "SEARCH_RECORD_MULTIPLE",
            UpdateRecord => "UPDATE_RECORD",
            WriteRecord => "WRITE_RECORD",
            AppendRecord => "APPEND_RECORD",
            UpdateBinary => "UPDATE_BINARY",
            WriteBinary => "WRITE_BINARY",
            Increase => "INCREASE",
            Decrease => "DECREASE",
            IncreaseMultiple => "INCREASE_MULTIPLE",
            DecreaseMultiple => "DECREASE_MULTIPLE",
            VerifyPin => "VERIFY_PIN",
            ChangePin => "CHANGE_PIN",
            ChangeKey => "CHANGE_KEY",
            Invalidate => "INVALIDATE",
            Rehabilitate => "REHABILITATE",
            SvGet => "SV_GET",
            SvReload => "SV_RELOAD",
            SvDebit => "SV_DEBIT",
            SvUndebit => "SV_UNDEBIT",
            Ratification => "RATIFICATION",
        }
    }
}

/// One row of a command's status table: `{info, successful, error_kind}`.
#[derive(Copy, Clone, Debug)]
pub struct StatusProperty {
    /// Short human-readable description of this status.
    pub info: &'static str,
    /// Whether this status counts as a success for this command.
    pub successful: bool,
    /// The error kind to raise when `successful` is false.
    pub error_kind: Option<ErrorKind>,
}

const SUCCESS: StatusProperty = StatusProperty {
    info: "success",
    successful: true,
    error_kind: None,
};

const UNKNOWN: StatusProperty = StatusProperty {
    info: "status word not present in this command's status table",
    successful: false,
    error_kind: Some(ErrorKind::UnknownStatus),
};

/// Look up `sw` in `table`. `0x9000` always succeeds even if the table
/// omits it; any other unlisted SW is `UnknownStatus`.
pub fn lookup_status(table: &[(StatusWord, StatusProperty)], sw: StatusWord) -> StatusProperty {
    if sw == apdu::SW_SUCCESS {
        return SUCCESS;
    }
    table
        .iter()
        .find(|(entry_sw, _)| *entry_sw == sw)
        .map(|(_, property)| *property)
        .unwrap_or(UNKNOWN)
}

/// Rule CL-CSS-RESPLE.1: a successful response's data length must equal
/// the command's declared `le`, unless `le == 0` ("any length" allowed).
fn check_response_length(command_ref: CommandRef, le: u8, data: &[u8]) -> Result<()> {
    if le != 0 && data.len() != usize::from(le) {
        return Err(CalypsoError::with_description(
            ErrorKind::UnexpectedCommandStatus,
            format!(
                "{}: expected {} response bytes, got {}",
                command_ref.as_str(),
                le,
                data.len()
            ),
        ));
    }
    Ok(())
}

/// The session-buffer cost of one modifying command.
pub fn compute_command_session_buffer_size(card: &CardImage, apdu: &Apdu) -> i32 {
    if card.uses_byte_counter() {
        apdu.as_bytes().len() as i32 + 6 - 5
    } else {
        1
    }
}

/// Variant-specific payload needed to mutate the card image once a
/// response arrives.
#[derive(Clone, Debug)]
pub enum CommandKind {
    OpenSecureSession,
    CloseSecureSession { abort: bool },
    ManageSecureSession { mutual_auth: bool, activate_encryption: bool },
    GetChallenge,
    SelectFile,
    GetData { tag: u16 },
    ReadRecords { sfi: u8, first_record: u8 },
    ReadRecordMultiple { sfi: u8, record: u8 },
    ReadBinary { sfi: u8, offset: u16 },
    SearchRecordMultiple { sfi: u8 },
    UpdateRecord { sfi: u8, record: u8, data: Vec<u8> },
    WriteRecord { sfi: u8, record: u8, data: Vec<u8> },
    AppendRecord { sfi: u8, data: Vec<u8> },
    UpdateBinary { sfi: u8, offset: u16, data: Vec<u8> },
    WriteBinary { sfi: u8, offset: u16, data: Vec<u8> },
    Increase { sfi: u8, counter: u8, delta: u32 },
    Decrease { sfi: u8, counter: u8, delta: u32 },
    IncreaseMultiple { sfi: u8, deltas: Vec<(u8, u32)> },
    DecreaseMultiple { sfi: u8, deltas: Vec<(u8, u32)> },
    VerifyPin { pin: [u8; 4], ciphered: bool },
    ChangePin { new_pin: [u8; 4], ciphered: bool },
    ChangeKey { key_index: u8, issuer_kif: u8, issuer_kvc: u8, new_kif: u8, new_kvc: u8 },
    Invalidate,
    Rehabilitate,
    SvGet { operation: crate::types::SvOperation },
    SvReload { amount: i32 },
    SvDebit { amount: i32 },
    SvUndebit { amount: i32 },
    Ratification,
    /// `VERIFY_PIN` sent with no data-in, solely to learn
    /// `pin_attempts_remaining` without attempting a verification.
    CheckPinStatus,
}

/// Decode a 3-byte big-endian two's-complement integer, the signed-amount
/// encoding `sv_modify_header` uses for SV command amounts.
fn decode_signed_i24(bytes: &[u8]) -> i32 {
    let unsigned = u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2]);
    if unsigned & 0x0080_0000 != 0 {
        (unsigned | 0xFF00_0000) as i32
    } else {
        unsigned as i32
    }
}

impl CommandKind {
    fn apply(&self, card: &mut CardImage, data: &[u8]) -> Result<()> {
        match self {
            CommandKind::OpenSecureSession
            | CommandKind::CloseSecureSession { .. }
            | CommandKind::ManageSecureSession { .. }
            | CommandKind::GetData { .. }
            | CommandKind::SearchRecordMultiple { .. }
            | CommandKind::VerifyPin { .. }
            | CommandKind::ChangePin { .. }
            | CommandKind::ChangeKey { .. }
            | CommandKind::CheckPinStatus
            | CommandKind::Ratification => {
                // These either carry no card-image mutation of their own
                // (the session state machine owns their effects: MAC
                // seeding, SV postponed data, …), or are handled above
                // `apply` in `parse_response` (PIN attempt counters), or
                // their payload is opaque to the card image.
                Ok(())
            }
            CommandKind::Invalidate => {
                card.set_df_invalidated(true);
                Ok(())
            }
            CommandKind::Rehabilitate => {
                card.set_df_invalidated(false);
                Ok(())
            }
            CommandKind::SvGet { .. } => {
                if data.len() < 12 {
                    return Err(CalypsoError::with_description(
                        ErrorKind::InconsistentData,
                        "SV_GET response shorter than header(6)+kvc(1)+balance(3)+tnum(2)",
                    ));
                }
                let mut sv = card.sv_data().clone();
                sv.get_header = data[..6].to_vec();
                sv.kvc = Some(data[6]);
                sv.balance = decode_signed_i24(&data[7..10]);
                sv.tnum = u16::from(data[10]) << 8 | u16::from(data[11]);
                sv.get_data = data.to_vec();
                card.set_sv_data(sv);
                Ok(())
            }
            CommandKind::SvReload { amount } => {
                let mut sv = card.sv_data().clone();
                sv.balance = sv.balance.saturating_add(*amount);
                card.set_sv_data(sv);
                Ok(())
            }
            CommandKind::SvDebit { amount } => {
                let mut sv = card.sv_data().clone();
                sv.balance = sv.balance.saturating_sub(*amount);
                card.set_sv_data(sv);
                Ok(())
            }
            CommandKind::SvUndebit { amount } => {
                let mut sv = card.sv_data().clone();
                sv.balance = sv.balance.saturating_add(*amount);
                card.set_sv_data(sv);
                Ok(())
            }
            CommandKind::GetChallenge => {
                let mut challenge = [0u8; 8];
                if data.len() == 8 {
                    challenge.copy_from_slice(data);
                    card.set_card_challenge(challenge);
                }
                Ok(())
            }
            CommandKind::SelectFile => Ok(()),
            CommandKind::ReadRecords { sfi, first_record } => {
                if !data.is_empty() {
                    card.write_record(*sfi, *first_record, data.to_vec());
                }
                Ok(())
            }
            CommandKind::ReadRecordMultiple { sfi, record } => {
                if !data.is_empty() {
                    card.write_record(*sfi, *record, data.to_vec());
                }
                Ok(())
            }
            CommandKind::ReadBinary { sfi, .. } => {
                if !data.is_empty() {
                    card.write_record(*sfi, 1, data.to_vec());
                }
                Ok(())
            }
            CommandKind::UpdateRecord { sfi, record, data } | CommandKind::WriteRecord { sfi, record, data } => {
                card.write_record(*sfi, *record, data.clone());
                Ok(())
            }
            CommandKind::AppendRecord { sfi, data } => {
                card.write_record(*sfi, 1, data.clone());
                Ok(())
            }
            CommandKind::UpdateBinary { sfi, data, .. } | CommandKind::WriteBinary { sfi, data, .. } => {
                card.write_record(*sfi, 1, data.clone());
                Ok(())
            }
            CommandKind::Increase { sfi, counter, delta } => {
                apply_counter_delta(card, *sfi, *counter, *delta, data, true)
            }
            CommandKind::Decrease { sfi, counter, delta } => {
                apply_counter_delta(card, *sfi, *counter, *delta, data, false)
            }
            CommandKind::IncreaseMultiple { sfi, deltas } => {
                for (counter, delta) in deltas {
                    apply_counter_delta(card, *sfi, *counter, *delta, &[], true)?;
                }
                Ok(())
            }
            CommandKind::DecreaseMultiple { sfi, deltas } => {
                for (counter, delta) in deltas {
                    apply_counter_delta(card, *sfi, *counter, *delta, &[], false)?;
                }
                Ok(())
            }
        }
    }
}

/// Apply an INCREASE/DECREASE to the card image. When the card's actual
/// response carried the new counter value (immediate mode), use it
/// directly; otherwise (postponed mode, `0x6200`, empty data) derive it
/// from the previously known value plus `delta`.
fn apply_counter_delta(
    card: &mut CardImage,
    sfi: u8,
    counter: u8,
    delta: u32,
    data: &[u8],
    increase: bool,
) -> Result<()> {
    if data.len() == 3 {
        let value = u32::from(data[0]) << 16 | u32::from(data[1]) << 8 | u32::from(data[2]);
        card.set_counter(sfi, counter, value);
        return Ok(());
    }

    let current = card.get_counter(sfi, counter).ok_or_else(|| {
        CalypsoError::with_description(
            ErrorKind::AnticipationFailure,
            format!("counter {sfi:#x}/{counter} unknown, cannot derive postponed value"),
        )
    })?;
    let new_value = if increase {
        current.saturating_add(delta)
    } else {
        current.saturating_sub(delta)
    };
    card.set_counter(sfi, counter, new_value);
    Ok(())
}

/// The response a command's successful execution is expected to produce,
/// computed before the command is ever sent (Testable Property #8). Only
/// meaningful for commands that consume the session buffer: reads and
/// other out-of-buffer commands always need a real round trip since their
/// data can't be known ahead of time, so those return `Ok(None)` and fall
/// back to feeding the MAC chain from the actual response once it arrives.
///
/// Default is a bare `0x9000` with no data (the modifying commands whose
/// response never carries more than a status word). `INCREASE`/`DECREASE`
/// anticipate the counter's new value; the `_MULTIPLE` variants anticipate
/// the concatenated `counter_id || new_value` list; the SV modifying
/// commands always anticipate the postponed-data status `0x6200`, since
/// their real balance effect is only settled at `CLOSE_SECURE_SESSION`.
pub fn anticipated_response(command: &Command, card: &CardImage) -> Result<Option<Vec<u8>>> {
    if !command.uses_session_buffer {
        return Ok(None);
    }

    let mut data = match &command.kind {
        CommandKind::Increase { sfi, counter, delta } => encode_anticipated_counter(card, *sfi, *counter, *delta, true)?,
        CommandKind::Decrease { sfi, counter, delta } => encode_anticipated_counter(card, *sfi, *counter, *delta, false)?,
        CommandKind::IncreaseMultiple { sfi, deltas } => {
            let mut bytes = Vec::with_capacity(deltas.len() * 4);
            for (counter, delta) in deltas {
                bytes.push(*counter);
                bytes.extend_from_slice(&encode_anticipated_counter(card, *sfi, *counter, *delta, true)?);
            }
            bytes
        }
        CommandKind::DecreaseMultiple { sfi, deltas } => {
            let mut bytes = Vec::with_capacity(deltas.len() * 4);
            for (counter, delta) in deltas {
                bytes.push(*counter);
                bytes.extend_from_slice(&encode_anticipated_counter(card, *sfi, *counter, *delta, false)?);
            }
            bytes
        }
        CommandKind::SvReload { .. } | CommandKind::SvDebit { .. } | CommandKind::SvUndebit { .. } => {
            return Ok(Some(vec![0x62, 0x00]));
        }
        _ => Vec::new(),
    };
    data.extend_from_slice(&apdu::SW_SUCCESS.to_be_bytes());
    Ok(Some(data))
}

fn encode_anticipated_counter(card: &CardImage, sfi: u8, counter: u8, delta: u32, increase: bool) -> Result<Vec<u8>> {
    let current = card.get_counter(sfi, counter).ok_or_else(|| {
        CalypsoError::with_description(
            ErrorKind::AnticipationFailure,
            format!("counter {sfi:#x}/{counter} unknown, cannot anticipate its new value"),
        )
    })?;
    let new_value = if increase { current.saturating_add(delta) } else { current.saturating_sub(delta) };
    Ok(vec![(new_value >> 16) as u8, (new_value >> 8) as u8, new_value as u8])
}

/// A built command: its APDU, status table, and enough state to mutate
/// the card image once a response arrives.
#[derive(Clone, Debug)]
pub struct Command {
    command_ref: CommandRef,
    apdu: Apdu,
    le: u8,
    status_table: &'static [(StatusWord, StatusProperty)],
    /// Does this command consume session-buffer capacity?
    pub uses_session_buffer: bool,
    /// Must the crypto provider contribute bytes (terminal MAC, SV
    /// security data, ciphered PIN) before this APDU can be sent (I6)?
    pub crypto_required_before_send: bool,
    kind: CommandKind,
}

impl Command {
    pub(crate) fn new(
        command_ref: CommandRef,
        apdu: Apdu,
        le: u8,
        status_table: &'static [(StatusWord, StatusProperty)],
        uses_session_buffer: bool,
        crypto_required_before_send: bool,
        kind: CommandKind,
    ) -> Self {
        Self {
            command_ref,
            apdu,
            le,
            status_table,
            uses_session_buffer,
            crypto_required_before_send,
            kind,
        }
    }

    /// Which wire command this is.
    pub fn command_ref(&self) -> CommandRef {
        self.command_ref
    }

    /// The command's built APDU.
    pub fn apdu(&self) -> &Apdu {
        &self.apdu
    }

    /// Variant-specific state.
    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Replace this command's APDU bytes wholesale (I5: idempotent
    /// `finalize_request`), used once a crypto provider has computed the
    /// tail bytes this command's `crypto_required_before_send` flagged as
    /// outstanding (terminal MAC, SV security data, ciphered PIN).
    pub fn finalize_request(&mut self, bytes: Vec<u8>) {
        let case = self.apdu.case();
        self.apdu = Apdu::from_bytes(bytes, case);
    }

    /// Validate `response` against this command's status table and apply
    /// its effect to `card`. Returns the matched [`StatusProperty`] on
    /// success.
    pub fn parse_response(&self, card: &mut CardImage, response: &[u8]) -> Result<StatusProperty> {
        let sw = apdu::status_word(response);
        let data = apdu::response_data(response);
        let property = lookup_status(self.status_table, sw);

        if matches!(self.kind, CommandKind::VerifyPin { .. } | CommandKind::CheckPinStatus) {
            if let Some(attempts) = security::pin_attempts_from_status_word(sw) {
                card.set_pin_attempts_remaining(attempts);
            }
        }

        if !property.successful {
            return Err(CalypsoError::with_description(
                property.error_kind.unwrap_or(ErrorKind::UnexpectedCommandStatus),
                format!("{} returned SW {:04X} ({})", self.command_ref.as_str(), sw, property.info),
            ));
        }

        check_response_length(self.command_ref, self.le, data)?;
        self.kind.apply(card, data)?;
        Ok(property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card_image::{CardCapabilities, ProductType};

    fn card() -> CardImage {
        CardImage::new(
            b"1TIC.ICA".to_vec(),
            [0; 8],
            ProductType::PrimeRev3,
            CardCapabilities::EXTENDED_MODE,
            230,
        )
    }

    #[test]
    fn reads_are_not_anticipatable() {
        let card = card();
        let read = file::build_read_records(7, 1, 3, 29);
        assert_eq!(anticipated_response(&read, &card).unwrap(), None);
    }

    #[test]
    fn plain_modifying_command_anticipates_success_only() {
        let card = card();
        let update = file::build_update_record(7, 1, vec![0xAB; 4]);
        assert_eq!(anticipated_response(&update, &card).unwrap(), Some(vec![0x90, 0x00]));
    }

    #[test]
    fn increase_anticipates_the_new_counter_value() {
        let mut card = card();
        card.set_counter(7, 1, 100);
        let increase = counter::build_increase(7, 1, 5);
        let expected = vec![0x00, 0x00, 0x69, 0x90, 0x00];
        assert_eq!(anticipated_response(&increase, &card).unwrap(), Some(expected));
    }

    #[test]
    fn increase_without_a_known_counter_fails_to_anticipate() {
        let card = card();
        let increase = counter::build_increase(7, 1, 5);
        let err = anticipated_response(&increase, &card).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AnticipationFailure);
    }

    #[test]
    fn increase_multiple_anticipates_the_concatenated_list() {
        let mut card = card();
        card.set_counter(7, 1, 100);
        card.set_counter(7, 2, 50);
        let increase = counter::build_increase_multiple(7, vec![(1, 5), (2, 10)]);
        let expected = vec![0x01, 0x00, 0x00, 0x69, 0x02, 0x00, 0x00, 0x3C, 0x90, 0x00];
        assert_eq!(anticipated_response(&increase, &card).unwrap(), Some(expected));
    }

    #[test]
    fn sv_reload_anticipates_postponed_data_status() {
        let card = card();
        let reload = sv::build_sv_reload(1000, 0, 0, 8);
        assert_eq!(anticipated_response(&reload, &card).unwrap(), Some(vec![0x62, 0x00]));
    }
}
