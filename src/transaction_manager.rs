//! Transaction manager: the public façade.
//!
//! A single owner of the transport and the in-memory state it drives,
//! generalised here to also own the [`CardImage`] and [`SecureSession`].
//! Every `prepare_*` method validates its arguments eagerly and pushes a
//! [`Command`] onto the queue; nothing is sent to the card until
//! [`TransactionManager::process_commands`] drains it.

use std::sync::Arc;

use crate::card_image::CardImage;
use crate::command::{self, Command};
use crate::crypto::SymmetricCryptoProvider;
use crate::error::{AuditEntry, CalypsoError, ErrorKind, Result};
use crate::queue::CommandQueue;
use crate::security_setting::SecuritySetting;
use crate::session::SecureSession;
use crate::transport::ReaderTransport;
use crate::types::{AccessLevel, ChannelControl, SvOperation};

fn validate_sfi(sfi: u8) -> Result<()> {
    if !(1..=30).contains(&sfi) {
        return Err(CalypsoError::with_description(
            ErrorKind::IllegalArgument,
            format!("sfi {sfi:#x} out of range [1, 30]"),
        ));
    }
    Ok(())
}

fn validate_record(record: u8) -> Result<()> {
    if !(1..=250).contains(&record) {
        return Err(CalypsoError::with_description(
            ErrorKind::IllegalArgument,
            format!("record number {record} out of range [1, 250]"),
        ));
    }
    Ok(())
}

fn validate_record_offset(offset: u8) -> Result<()> {
    // Record-addressed offsets (READ_RECORD_MULTIPLE) are one byte wide.
    let _ = offset;
    Ok(())
}

fn validate_binary_offset(offset: u16) -> Result<()> {
    if offset > 32767 {
        return Err(CalypsoError::with_description(
            ErrorKind::IllegalArgument,
            format!("binary offset {offset} out of range [0, 32767]"),
        ));
    }
    Ok(())
}

fn validate_pin(pin: &[u8]) -> Result<[u8; 4]> {
    if pin.len() != 4 {
        return Err(CalypsoError::with_description(
            ErrorKind::IllegalArgument,
            format!("PIN must be exactly 4 digits, got {}", pin.len()),
        ));
    }
    let mut out = [0u8; 4];
    out.copy_from_slice(pin);
    Ok(out)
}

/// Owns a [`CardImage`], a [`SecureSession`], the command queue, the
/// crypto provider and the reader transport for one card's lifetime
///. Not `Send`/`Sync`: single-threaded,
/// cooperative scheduling only.
pub struct TransactionManager {
    card: CardImage,
    settings: Arc<SecuritySetting>,
    crypto: Box<dyn SymmetricCryptoProvider>,
    transport: Box<dyn ReaderTransport>,
    session: SecureSession,
    queue: CommandQueue,
    audit: Vec<AuditEntry>,
    pending_open: Option<AccessLevel>,
    pending_close: bool,
    pending_cancel: bool,
    last_sv_get_operation: Option<SvOperation>,
    sv_operation_prepared: bool,
}

impl TransactionManager {
    /// Build a manager around an already-selected `card`, frozen
    /// `settings`, and the collaborators it will drive.
    pub fn new(
        card: CardImage,
        settings: Arc<SecuritySetting>,
        crypto: Box<dyn SymmetricCryptoProvider>,
        transport: Box<dyn ReaderTransport>,
    ) -> Self {
        Self {
            card,
            settings,
            crypto,
            transport,
            session: SecureSession::new(),
            queue: CommandQueue::new(),
            audit: Vec::new(),
            pending_open: None,
            pending_close: false,
            pending_cancel: false,
            last_sv_get_operation: None,
            sv_operation_prepared: false,
        }
    }

    /// Read-only view of the card image as currently mirrored.
    pub fn card(&self) -> &CardImage {
        &self.card
    }

    /// The audit trail accumulated by the most recent `process_commands`
    /// call.
    pub fn audit_trail(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Idempotently pre-diversify the crypto provider's keys ahead of the
    /// next transaction.
    pub fn init_sam_context_for_next_transaction(&mut self) -> Result<()> {
        self.crypto
            .pre_init_terminal_secure_session_context()
            .map_err(|e| CalypsoError::with_description(ErrorKind::Crypto, e.to_string()))
    }

    fn fail_stop(&mut self, err: CalypsoError) -> CalypsoError {
        if self.session.is_open() {
            let _ = self.session.abort(
                &mut self.card,
                self.crypto.as_mut(),
                self.transport.as_mut(),
                ChannelControl::KeepOpen,
                &mut self.audit,
            );
        }
        self.queue = CommandQueue::new();
        self.pending_open = None;
        self.pending_close = false;
        self.pending_cancel = false;
        self.last_sv_get_operation = None;
        self.sv_operation_prepared = false;
        err.with_audit_trail(self.audit.clone())
    }

    fn push(&mut self, command: Command) -> &mut Self {
        self.queue.push(command);
        self
    }

    // ---- Transaction lifecycle -------------------------------------

    /// Queue a secure-session open at `level`; the actual
    /// `OPEN_SECURE_SESSION` APDU is sent by `process_commands`.
    pub fn prepare_open_secure_session(&mut self, level: AccessLevel) -> Result<&mut Self> {
        if self.session.is_open() || self.pending_open.is_some() {
            return Err(self.fail_stop(CalypsoError::with_description(
                ErrorKind::ImproperState,
                "a secure session is already open or already queued to open",
            )));
        }
        self.pending_open = Some(level);
        Ok(self)
    }

    /// Queue a normal `CLOSE_SECURE_SESSION`.
    pub fn prepare_close_secure_session(&mut self) -> Result<&mut Self> {
        if self.pending_cancel {
            return Err(self.fail_stop(CalypsoError::with_description(
                ErrorKind::ImproperState,
                "a cancellation is already queued",
            )));
        }
        self.pending_close = true;
        Ok(self)
    }

    /// Queue an abort-mode close: no terminal MAC, the card image is
    /// restored from the pre-open snapshot once processed.
    pub fn prepare_cancel_secure_session(&mut self) -> Result<&mut Self> {
        self.pending_close = false;
        self.pending_cancel = true;
        Ok(self)
    }

    /// Drive every queued command through the card, opening/closing (or
    /// splitting across sub-sessions) as needed, accumulating the audit
    /// trail.
    pub fn process_commands(&mut self, close_physical_channel: bool) -> Result<&mut Self> {
        self.audit.clear();

        let final_channel_control = if close_physical_channel {
            ChannelControl::CloseAfter
        } else {
            ChannelControl::KeepOpen
        };

        let result = self.run_process_commands(final_channel_control);
        match result {
            Ok(()) => {
                self.pending_open = None;
                self.pending_close = false;
                self.pending_cancel = false;
                // CL-SV-1PCSS.1 is scoped to one secure session, which can
                // span several `process_commands` calls; only clear this
                // bookkeeping once the session has actually closed.
                if !self.session.is_open() {
                    self.last_sv_get_operation = None;
                    self.sv_operation_prepared = false;
                }
                Ok(self)
            }
            Err(err) => Err(self.fail_stop(err)),
        }
    }

    fn run_process_commands(&mut self, final_channel_control: ChannelControl) -> Result<()> {
        let read_on_open = self
            .pending_open
            .map(|_| self.queue.take_read_on_open(self.settings.is_read_on_session_opening_disabled()))
            .unwrap_or(None);

        let commands = self.queue.drain();

        let initial_counter = self.card.payload_capacity() as i32;
        let multiple_session_enabled = self.settings.is_multiple_session_enabled();
        let plans = crate::queue::plan_sub_sessions(&self.card, &commands, initial_counter, multiple_session_enabled)?;

        let mut commands = commands;
        let total_plans = plans.len();
        let last_plan_index = total_plans.saturating_sub(1);

        for (plan_index, plan) in plans.into_iter().enumerate() {
            let is_last_plan = plan_index == last_plan_index;

            if let Some(level) = self.pending_open {
                if plan_index == 0 {
                    let (sfi, record) = read_on_open.unzip();
                    self.session.open(
                        &mut self.card,
                        &self.settings,
                        self.crypto.as_mut(),
                        self.transport.as_mut(),
                        level,
                        sfi,
                        record.unwrap_or(0),
                        None,
                        &mut self.audit,
                    )?;
                } else {
                    self.session.open(
                        &mut self.card,
                        &self.settings,
                        self.crypto.as_mut(),
                        self.transport.as_mut(),
                        level,
                        None,
                        0,
                        None,
                        &mut self.audit,
                    )?;
                }
            }

            let last_index_in_plan = plan.len().saturating_sub(1);
            for (position, &index) in plan.iter().enumerate() {
                let is_last_command_overall = is_last_plan && position == last_index_in_plan && !self.pending_close && !self.pending_cancel;
                let channel_control = if is_last_command_overall {
                    final_channel_control
                } else {
                    ChannelControl::KeepOpen
                };

                let command = &mut commands[index];
                if self.session.is_open() {
                    self.session.process_in_session_command(
                        command,
                        &mut self.card,
                        &self.settings,
                        self.crypto.as_mut(),
                        self.transport.as_mut(),
                        channel_control,
                        &mut self.audit,
                    )?;
                } else {
                    crate::session::process_out_of_session_command(
                        command,
                        &mut self.card,
                        self.transport.as_mut(),
                        channel_control,
                        &mut self.audit,
                    )?;
                }
            }

            if is_last_plan {
                if self.pending_close {
                    self.session.close(
                        &mut self.card,
                        self.crypto.as_mut(),
                        self.transport.as_mut(),
                        self.settings.is_ratification_mechanism_enabled(),
                        final_channel_control,
                        &mut self.audit,
                    )?;
                } else if self.pending_cancel {
                    self.session.abort(
                        &mut self.card,
                        self.crypto.as_mut(),
                        self.transport.as_mut(),
                        final_channel_control,
                        &mut self.audit,
                    )?;
                }
            } else if self.session.is_open() {
                // Buffer overflow mid-sequence: close this
                // sub-session (ratified) before the next plan re-opens.
                self.session.close(
                    &mut self.card,
                    self.crypto.as_mut(),
                    self.transport.as_mut(),
                    self.settings.is_ratification_mechanism_enabled(),
                    ChannelControl::KeepOpen,
                    &mut self.audit,
                )?;
            }
        }

        Ok(())
    }

    // ---- File I/O ----------------------------------------------------

    /// `SELECT_FILE` by LID.
    pub fn prepare_select_file(&mut self, lid: [u8; 2]) -> Result<&mut Self> {
        Ok(self.push(command::file::build_select_file(lid)))
    }

    /// `GET_DATA` for a tag-addressed object.
    pub fn prepare_get_data(&mut self, tag: u16) -> Result<&mut Self> {
        Ok(self.push(command::file::build_get_data(tag)))
    }

    /// Read a single record.
    pub fn prepare_read_record(&mut self, sfi: u8, record_number: u8) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi).and_then(|_| validate_record(record_number)) {
            return Err(self.fail_stop(e));
        }
        use crate::card_image::CardCapabilities;
        let legacy_case1 = self.card.capabilities().contains(CardCapabilities::LEGACY_CASE1);
        Ok(self.push(command::file::build_read_record(sfi, record_number, legacy_case1)))
    }

    /// Read a range of whole records, chunked to the card's payload
    /// capacity.
    pub fn prepare_read_records(&mut self, sfi: u8, from: u8, to: u8, record_size: u8) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi).and_then(|_| validate_record(from)).and_then(|_| validate_record(to)) {
            return Err(self.fail_stop(e));
        }
        if to < from {
            return Err(self.fail_stop(CalypsoError::with_description(
                ErrorKind::IllegalArgument,
                format!("read_records: to ({to}) precedes from ({from})"),
            )));
        }

        let per_apdu = (self.card.payload_capacity() / (usize::from(record_size) + 2)).max(1) as u8;
        let mut record = from;
        while record <= to {
            let remaining = to - record + 1;
            let count = remaining.min(per_apdu);
            if count <= 1 {
                use crate::card_image::CardCapabilities;
                let legacy_case1 = self.card.capabilities().contains(CardCapabilities::LEGACY_CASE1);
                self.queue.push(command::file::build_read_record(sfi, record, legacy_case1));
            } else {
                self.queue.push(command::file::build_read_records(sfi, record, count, record_size));
            }
            record = record.saturating_add(count).max(record + 1);
            if count == 0 {
                break;
            }
        }
        Ok(self)
    }

    /// Read `nb_bytes` at `offset` of each record in `from..=to`
    /// (`READ_RECORD_MULTIPLE`).
    pub fn prepare_read_records_partially(&mut self, sfi: u8, from: u8, to: u8, offset: u8, nb_bytes: u8) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi)
            .and_then(|_| validate_record(from))
            .and_then(|_| validate_record(to))
            .and_then(|_| validate_record_offset(offset))
        {
            return Err(self.fail_stop(e));
        }
        for record in from..=to {
            self.queue.push(command::file::build_read_record_multiple(sfi, record, offset, nb_bytes));
        }
        Ok(self)
    }

    /// Read `nb_bytes` of a binary file starting at `offset`, chunked to
    /// the card's payload capacity; precedes with a selection-tip
    /// `READ_BINARY(offset=0)` when `sfi>0 && offset>255`.
    pub fn prepare_read_binary(&mut self, sfi: u8, offset: u16, nb_bytes: u16) -> Result<&mut Self> {
        if let Err(e) = validate_binary_offset(offset) {
            return Err(self.fail_stop(e));
        }
        if sfi > 0 && offset > 255 {
            self.queue.push(command::file::build_read_binary(sfi, 0, 1));
        }
        let capacity = self.card.payload_capacity().max(1) as u16;
        let mut remaining = nb_bytes;
        let mut cursor = offset;
        while remaining > 0 {
            let chunk = remaining.min(capacity).min(255) as u8;
            self.queue.push(command::file::build_read_binary(sfi, cursor, chunk));
            cursor += u16::from(chunk);
            remaining -= u16::from(chunk);
        }
        Ok(self)
    }

    /// Read `n_counters` counters of `sfi` starting at counter 1 (each
    /// counter record is 3 bytes).
    pub fn prepare_read_counter(&mut self, sfi: u8, n_counters: u8) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::file::build_read_records(sfi, 1, n_counters, 3)))
    }

    /// `SEARCH_RECORD_MULTIPLE` for `pattern`.
    pub fn prepare_search_records(&mut self, sfi: u8, pattern: Vec<u8>) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::file::build_search_record_multiple(sfi, pattern)))
    }

    /// Append a record to `sfi`.
    pub fn prepare_append_record(&mut self, sfi: u8, data: Vec<u8>) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::file::build_append_record(sfi, data)))
    }

    /// Overwrite one record.
    pub fn prepare_update_record(&mut self, sfi: u8, record_number: u8, data: Vec<u8>) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi).and_then(|_| validate_record(record_number)) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::file::build_update_record(sfi, record_number, data)))
    }

    /// Write (OR-merge) into one record.
    pub fn prepare_write_record(&mut self, sfi: u8, record_number: u8, data: Vec<u8>) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi).and_then(|_| validate_record(record_number)) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::file::build_write_record(sfi, record_number, data)))
    }

    /// Overwrite `data` at `offset` of a binary file, chunked to the
    /// card's payload capacity.
    pub fn prepare_update_binary(&mut self, sfi: u8, offset: u16, data: Vec<u8>) -> Result<&mut Self> {
        if let Err(e) = validate_binary_offset(offset) {
            return Err(self.fail_stop(e));
        }
        let capacity = self.card.payload_capacity().max(1);
        for (i, chunk) in data.chunks(capacity).enumerate() {
            let chunk_offset = offset + (i * capacity) as u16;
            self.queue.push(command::file::build_update_binary(sfi, chunk_offset, chunk.to_vec()));
        }
        Ok(self)
    }

    /// Write (OR-merge) `data` at `offset` of a binary file, chunked to
    /// the card's payload capacity.
    pub fn prepare_write_binary(&mut self, sfi: u8, offset: u16, data: Vec<u8>) -> Result<&mut Self> {
        if let Err(e) = validate_binary_offset(offset) {
            return Err(self.fail_stop(e));
        }
        let capacity = self.card.payload_capacity().max(1);
        for (i, chunk) in data.chunks(capacity).enumerate() {
            let chunk_offset = offset + (i * capacity) as u16;
            self.queue.push(command::file::build_write_binary(sfi, chunk_offset, chunk.to_vec()));
        }
        Ok(self)
    }

    // ---- Counters ------------------------------------------------------

    /// Credit one counter.
    pub fn prepare_increase_counter(&mut self, sfi: u8, counter: u8, delta: u32) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::counter::build_increase(sfi, counter, delta)))
    }

    /// Debit one counter.
    pub fn prepare_decrease_counter(&mut self, sfi: u8, counter: u8, delta: u32) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::counter::build_decrease(sfi, counter, delta)))
    }

    /// Credit several counters, chunked by `payload_capacity / 4`
    /// counters per APDU.
    pub fn prepare_increase_counters(&mut self, sfi: u8, deltas: Vec<(u8, u32)>) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi) {
            return Err(self.fail_stop(e));
        }
        let per_apdu = (self.card.payload_capacity() / 4).max(1);
        for chunk in deltas.chunks(per_apdu) {
            self.queue.push(command::counter::build_increase_multiple(sfi, chunk.to_vec()));
        }
        Ok(self)
    }

    /// Debit several counters, chunked by `payload_capacity / 4` counters
    /// per APDU.
    pub fn prepare_decrease_counters(&mut self, sfi: u8, deltas: Vec<(u8, u32)>) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi) {
            return Err(self.fail_stop(e));
        }
        let per_apdu = (self.card.payload_capacity() / 4).max(1);
        for chunk in deltas.chunks(per_apdu) {
            self.queue.push(command::counter::build_decrease_multiple(sfi, chunk.to_vec()));
        }
        Ok(self)
    }

    /// Set `counter` of `sfi` to `new_value`, emitting an increase or
    /// decrease for the delta against the last known value; fails if the
    /// current value isn't known.
    pub fn prepare_set_counter(&mut self, sfi: u8, counter: u8, new_value: u32) -> Result<&mut Self> {
        if let Err(e) = validate_sfi(sfi) {
            return Err(self.fail_stop(e));
        }
        let current = self.card.get_counter(sfi, counter).ok_or_else(|| {
            CalypsoError::with_description(
                ErrorKind::AnticipationFailure,
                format!("counter {sfi:#x}/{counter} unknown, cannot compute set_counter delta"),
            )
        });
        let current = match current {
            Ok(v) => v,
            Err(e) => return Err(self.fail_stop(e)),
        };
        if new_value >= current {
            Ok(self.push(command::counter::build_increase(sfi, counter, new_value - current)))
        } else {
            Ok(self.push(command::counter::build_decrease(sfi, counter, current - new_value)))
        }
    }

    // ---- Security --------------------------------------------------

    fn pin_ciphering_required(&self) -> bool {
        !self.settings.is_pin_plain_transmission_enabled()
    }

    /// Verify `pin`, ciphering it first unless plain transmission is
    /// enabled. Ciphering auto-prepends a `GET_CHALLENGE` when the card
    /// image doesn't already carry one.
    pub fn prepare_verify_pin(&mut self, pin: &[u8]) -> Result<&mut Self> {
        let pin = match validate_pin(pin) {
            Ok(p) => p,
            Err(e) => return Err(self.fail_stop(e)),
        };

        if self.pin_ciphering_required() {
            if self.card.challenge().is_none() {
                self.queue.push(command::security::build_get_challenge());
            }
            self.queue.push(command::security::build_verify_pin_ciphered(pin));
        } else {
            self.queue.push(command::security::build_verify_pin_plain(pin));
        }
        Ok(self)
    }

    /// Change the PIN to `new_pin`, under the same ciphering policy as
    /// [`TransactionManager::prepare_verify_pin`].
    pub fn prepare_change_pin(&mut self, new_pin: &[u8]) -> Result<&mut Self> {
        let new_pin = match validate_pin(new_pin) {
            Ok(p) => p,
            Err(e) => return Err(self.fail_stop(e)),
        };

        if self.pin_ciphering_required() {
            if self.card.challenge().is_none() {
                self.queue.push(command::security::build_get_challenge());
            }
            self.queue.push(command::security::build_change_pin_ciphered(new_pin));
        } else {
            self.queue.push(command::security::build_change_pin_plain(new_pin));
        }
        Ok(self)
    }

    /// Learn `pin_attempts_remaining` without attempting verification.
    pub fn prepare_check_pin_status(&mut self) -> Result<&mut Self> {
        Ok(self.push(command::security::build_check_pin_status()))
    }

    /// `CHANGE_KEY`: replace the key at `key_index` with `(new_kif,
    /// new_kvc)`, ciphered under `(issuer_kif, issuer_kvc)`.
    pub fn prepare_change_key(&mut self, key_index: u8, issuer_kif: u8, issuer_kvc: u8, new_kif: u8, new_kvc: u8) -> Result<&mut Self> {
        if self.card.challenge().is_none() {
            self.queue.push(command::security::build_get_challenge());
        }
        Ok(self.push(command::security::build_change_key(key_index, issuer_kif, issuer_kvc, new_kif, new_kvc)))
    }

    /// Request early mutual authentication via `MANAGE_SECURE_SESSION`
    /// (`mutual_auth = true`, no encryption toggle).
    pub fn prepare_early_mutual_authentication(&mut self) -> Result<&mut Self> {
        Ok(self.push(command::session::build_manage_secure_session(true, false)))
    }

    /// Turn on in-session encryption via `MANAGE_SECURE_SESSION`.
    pub fn prepare_activate_encryption(&mut self) -> Result<&mut Self> {
        Ok(self.push(command::session::build_manage_secure_session(false, true)))
    }

    /// `MANAGE_SECURE_SESSION` carries no deactivation P2 bit in this
    /// catalogue; deactivation happens implicitly when the
    /// session closes. Exposed as a no-op for API symmetry with the
    /// other lifecycle toggles.
    pub fn prepare_deactivate_encryption(&mut self) -> Result<&mut Self> {
        Ok(self)
    }

    // ---- Stored Value ------------------------------------------------

    /// `SV_GET` for `operation`; when the card isn't extended-mode and
    /// both logs were requested by settings, an extra `SV_GET` for the
    /// other operation is queued first (rule CL-SV-GETNUMBER.1).
    pub fn prepare_sv_get(&mut self, operation: SvOperation) -> Result<&mut Self> {
        use crate::card_image::CardCapabilities;

        if self.settings.is_sv_load_and_debit_log_enabled() && !self.card.capabilities().contains(CardCapabilities::EXTENDED_MODE) {
            let other = match operation {
                SvOperation::Reload => SvOperation::Debit,
                SvOperation::Debit => SvOperation::Reload,
            };
            self.queue.push(command::sv::build_sv_get(other));
        }
        self.queue.push(command::sv::build_sv_get(operation));
        self.last_sv_get_operation = Some(operation);
        Ok(self)
    }

    fn check_sv_modify_preconditions(&mut self, expected: SvOperation, amount: i32, check_negative_balance: bool) -> Result<()> {
        if self.last_sv_get_operation != Some(expected) {
            return Err(CalypsoError::with_description(
                ErrorKind::ImproperState,
                "an SV modifying command must follow a matching SV_GET (CL-SV-GETDEBIT.1/GETRLOAD.1)",
            ));
        }
        if self.session.is_open() {
            if self.sv_operation_prepared {
                return Err(CalypsoError::with_description(
                    ErrorKind::ImproperState,
                    "at most one SV modifying command is allowed per secure session (CL-SV-1PCSS.1)",
                ));
            }
            self.sv_operation_prepared = true;
        }
        if check_negative_balance && !self.settings.is_sv_negative_balance_authorized() {
            let balance = self.card.sv_data().balance;
            if balance - amount < 0 {
                return Err(CalypsoError::with_description(
                    ErrorKind::ImproperState,
                    format!("SV debit of {amount} would bring balance {balance} negative"),
                ));
            }
        }
        Ok(())
    }

    /// `SV_RELOAD`: credit the purse by `amount`.
    pub fn prepare_sv_reload(&mut self, amount: i32, date: u16, time: u16) -> Result<&mut Self> {
        if let Err(e) = self.check_sv_modify_preconditions(SvOperation::Reload, amount, false) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::sv::build_sv_reload(amount, date, time, security_data_len(&self.card))))
    }

    /// `SV_DEBIT`: debit the purse by `amount`, aborting if it would go
    /// negative and negative balances aren't authorized.
    pub fn prepare_sv_debit(&mut self, amount: i32, date: u16, time: u16) -> Result<&mut Self> {
        if let Err(e) = self.check_sv_modify_preconditions(SvOperation::Debit, amount, true) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::sv::build_sv_debit(amount, date, time, security_data_len(&self.card))))
    }

    /// `SV_UNDEBIT`: reverse a previously committed debit of `amount`.
    pub fn prepare_sv_undebit(&mut self, amount: i32, date: u16, time: u16) -> Result<&mut Self> {
        if let Err(e) = self.check_sv_modify_preconditions(SvOperation::Debit, amount, false) {
            return Err(self.fail_stop(e));
        }
        Ok(self.push(command::sv::build_sv_undebit(amount, date, time, security_data_len(&self.card))))
    }

    /// Read both the reload and debit SV logs (all available records of
    /// the SV log files); the mirrored `SvData` is stale until the next
    /// `SV_GET`, so `card.clear_sv_data()` is called once the reads are
    /// queued.
    pub fn prepare_sv_read_all_logs(&mut self) -> Result<&mut Self> {
        const SV_RELOAD_LOG_SFI: u8 = 0x14;
        const SV_DEBIT_LOG_SFI: u8 = 0x15;
        self.queue.push(command::file::build_read_records(SV_RELOAD_LOG_SFI, 1, 3, 29));
        self.queue.push(command::file::build_read_records(SV_DEBIT_LOG_SFI, 1, 1, 29));
        self.card.clear_sv_data();
        self.last_sv_get_operation = None;
        Ok(self)
    }

    // ---- Administrative ----------------------------------------------

    /// `INVALIDATE` the DF.
    pub fn prepare_invalidate(&mut self) -> Result<&mut Self> {
        Ok(self.push(command::security::build_invalidate()))
    }

    /// `REHABILITATE` the DF.
    pub fn prepare_rehabilitate(&mut self) -> Result<&mut Self> {
        Ok(self.push(command::security::build_rehabilitate()))
    }
}

/// Length in bytes of a SAM's SV security-data blob spliced into an
/// `SV_RELOAD`/`SV_DEBIT`/`SV_UNDEBIT` APDU: 5-byte MAC in plain mode,
/// 10 bytes in extended mode,
/// on top of the fixed `sam_id(4) + challenge(3) + tnum(3)` fields.
fn security_data_len(card: &CardImage) -> usize {
    use crate::card_image::CardCapabilities;
    let mac_len = if card.capabilities().contains(CardCapabilities::EXTENDED_MODE) { 10 } else { 5 };
    4 + 3 + 3 + mac_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::{self};
    use crate::card_image::{CardCapabilities, ProductType};
    use crate::crypto::mock::MockSamProvider;
    use crate::security_setting::SecuritySettingBuilder;
    use crate::transport::{ApduResponse, CardRequest, CardResponse, TransportError};

    struct ScriptedTransport {
        responses: Vec<Vec<u8>>,
    }

    impl ReaderTransport for ScriptedTransport {
        fn transmit(&mut self, request: CardRequest, _channel_control: ChannelControl) -> std::result::Result<CardResponse, TransportError> {
            let mut apdus = Vec::new();
            for _ in &request.apdus {
                let bytes = self.responses.remove(0);
                let status_word = apdu::status_word(&bytes);
                apdus.push(ApduResponse { bytes, status_word });
            }
            Ok(CardResponse { apdus })
        }
    }

    fn card() -> CardImage {
        CardImage::new(b"1TIC.ICA".to_vec(), [0; 8], ProductType::PrimeRev3, CardCapabilities::EXTENDED_MODE, 230)
    }

    fn settings() -> Arc<SecuritySetting> {
        SecuritySettingBuilder::new()
            .authorize_session_key(0x21, 0x79)
            .default_kif(AccessLevel::Debit, 0x21)
            .default_kvc(AccessLevel::Debit, 0x79)
            .pin_plain_transmission_enabled(true)
            .build()
    }

    fn manager(transport: ScriptedTransport) -> TransactionManager {
        TransactionManager::new(
            card(),
            settings(),
            Box::new(MockSamProvider::with_single_key([0xAA; 4], 0x21, 0x79, [0x42; 16])),
            Box::new(transport),
        )
    }

    // Scenario S1: plain read + close channel.
    #[test]
    fn plain_read_outside_session() {
        let mut response = vec![0xAB; 16];
        response.extend_from_slice(&[0x90, 0x00]);
        let mut manager = manager(ScriptedTransport { responses: vec![response] });

        manager.prepare_read_record(0x07, 1).unwrap();
        manager.process_commands(true).unwrap();

        assert_eq!(manager.audit_trail().len(), 1);
        assert_eq!(manager.card().get_record(0x07, 1), Some([0xAB; 16].as_slice()));
    }

    // Scenario S2: open + update + close, exactly three APDUs.
    #[test]
    fn session_open_update_close() {
        let mut open_response = vec![0x21u8, 0x79, 1, 2, 3, 4, 5, 6, 7, 8];
        open_response.extend_from_slice(&[0x90, 0x00]);
        let update_response = vec![0x90, 0x00];

        // Fabricate the card's half of the session tag for the CLOSE
        // response the same way session.rs's own round-trip test does,
        // using a throwaway provider instance seeded identically to the
        // one the manager will own.
        let mut scripting_crypto = MockSamProvider::with_single_key([0xAA; 4], 0x21, 0x79, [0x42; 16]);
        scripting_crypto.pre_init_terminal_secure_session_context().unwrap();
        scripting_crypto.init_terminal_secure_session_context().unwrap();
        let mut open_body = vec![0x21u8, 0x79];
        open_body.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        scripting_crypto.init_terminal_session_mac(&open_body, AccessLevel::Debit, 0x21, 0x79).unwrap();
        let update_apdu = crate::command::file::build_update_record(0x08, 1, vec![0xAB; 16]);
        scripting_crypto.update_terminal_session_mac(update_apdu.apdu().as_bytes()).unwrap();
        scripting_crypto.update_terminal_session_mac(&[0x90, 0x00]).unwrap();
        let tag = scripting_crypto.peek_session_tag().unwrap();
        let mut close_response = tag[8..16].to_vec();
        close_response.extend_from_slice(&[0x90, 0x00]);

        let crypto = MockSamProvider::with_single_key([0xAA; 4], 0x21, 0x79, [0x42; 16]);
        let transport = ScriptedTransport { responses: vec![open_response, update_response, close_response] };
        let mut manager = TransactionManager::new(card(), settings(), Box::new(crypto), Box::new(transport));

        manager.prepare_open_secure_session(AccessLevel::Debit).unwrap();
        manager.prepare_update_record(0x08, 1, vec![0xAB; 16]).unwrap();
        manager.prepare_close_secure_session().unwrap();
        manager.process_commands(true).unwrap();

        assert_eq!(manager.audit_trail().len(), 3);
        assert!(!manager.session.is_open());
        assert_eq!(manager.card().get_record(0x08, 1), Some([0xAB; 16].as_slice()));
    }

    // Scenario S3: buffer overflow with multi-session off fails before any APDU is sent.
    #[test]
    fn buffer_overflow_without_multiple_session_fails_eagerly() {
        let mut manager = manager(ScriptedTransport { responses: vec![] });
        manager.prepare_open_secure_session(AccessLevel::Debit).unwrap();
        manager.prepare_update_record(0x08, 1, vec![0xAB; 200]).unwrap();
        manager.prepare_update_record(0x08, 2, vec![0xAB; 200]).unwrap();
        manager.prepare_update_record(0x08, 3, vec![0xAB; 200]).unwrap();

        let err = manager.process_commands(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionBufferOverflow);
        assert!(manager.audit_trail().is_empty());
    }

    #[test]
    fn verify_pin_argument_validation_is_eager() {
        let mut manager = manager(ScriptedTransport { responses: vec![] });
        let err = manager.prepare_verify_pin(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[test]
    fn sv_debit_without_prior_sv_get_is_rejected() {
        let mut manager = manager(ScriptedTransport { responses: vec![] });
        let err = manager.prepare_sv_debit(100, 0x1234, 0x5678).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImproperState);
    }
}
