//! In-memory mirror of the card's selected application.
//!
//! A typed, big-endian-parsed mirror of on-device state, with a
//! `CardCapabilities` bitflags type for the card's feature flags.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::types::{AccessLevel, FileType};

bitflags! {
    /// Feature flags a card may or may not support.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CardCapabilities: u8 {
        /// Card understands extended-mode APDUs (MSS, byte-counter
        /// session buffer accounting, longer SV MACs).
        const EXTENDED_MODE   = 0b0000_0001;
        /// Card has a PIN object and supports VERIFY_PIN/CHANGE_PIN.
        const PIN_FEATURE     = 0b0000_0010;
        /// Card has a Stored Value purse.
        const SV_FEATURE      = 0b0000_0100;
        /// Session buffer is accounted in bytes rather than "1 unit per
        /// modifying command" (see `compute_command_session_buffer_size`).
        const BYTE_COUNTER    = 0b0000_1000;
        /// Record reads on this card require a non-zero Le even when "any
        /// length" would normally be requested.
        const LEGACY_CASE1    = 0b0001_0000;
    }
}

/// Card family, as reported by the ATR/FCI during selection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProductType {
    /// First revision of the "Prime" product line.
    PrimeRev1,
    /// Second revision.
    PrimeRev2,
    /// Third revision (adds extended mode).
    PrimeRev3,
    /// "Light" product line: reduced file system, no SV/PIN.
    Light,
    /// "Basic" product line.
    Basic,
}

/// One elementary file in the card's DF tree.
#[derive(Clone, Debug, Default)]
pub struct ElementaryFile {
    /// File organisation.
    pub file_type: Option<FileType>,
    /// File Control Information, set by `SELECT_FILE`/on session open.
    pub fci: Vec<u8>,
    /// `record_number -> bytes`. For `FileType::Counters`, each value is
    /// exactly 3 bytes (a big-endian counter).
    pub records: HashMap<u8, Vec<u8>>,
}

impl ElementaryFile {
    fn new(file_type: FileType) -> Self {
        Self {
            file_type: Some(file_type),
            fci: Vec::new(),
            records: HashMap::new(),
        }
    }
}

/// An opaque snapshot of a [`CardImage`], used to restore it when a
/// session is cancelled or aborted.
///
/// Deep-copies everything mutable: since `CardImage` owns all of its data
/// (no shared/interior-mutable fields), a plain [`Clone`] already
/// satisfies that requirement.
#[derive(Clone, Debug)]
pub struct Snapshot(CardImage);

/// Stored-Value purse state mirrored from the card.
#[derive(Clone, Debug, Default)]
pub struct SvData {
    /// Current KVC used by the SV purse.
    pub kvc: Option<u8>,
    /// Current balance, in the smallest currency unit.
    pub balance: i32,
    /// Transaction number of the last committed SV operation.
    pub tnum: u16,
    /// Header bytes returned by the most recent `SV_GET`.
    pub get_header: Vec<u8>,
    /// Data bytes returned by the most recent `SV_GET`.
    pub get_data: Vec<u8>,
    /// Signature the card attached to the last SV operation performed
    /// outside a secure session.
    pub operation_signature: Vec<u8>,
}

/// Mutable, exclusively-owned mirror of a Calypso card's selected
/// application.
#[derive(Clone, Debug)]
pub struct CardImage {
    df_name: Vec<u8>,
    serial_number: [u8; 8],
    product_type: ProductType,
    capabilities: CardCapabilities,
    modifications_counter_in_bytes: bool,
    payload_capacity: usize,

    challenge: Option<[u8; 8]>,
    kif: Option<u8>,
    kvc: Option<u8>,
    pin_attempts_remaining: u8,
    sv: SvData,
    card_public_key: Option<Vec<u8>>,
    card_certificate: Option<Vec<u8>>,
    ca_certificate: Option<Vec<u8>>,
    df_invalidated: bool,
    pre_open_write_access_level: Option<AccessLevel>,

    files: HashMap<u8, ElementaryFile>,

    /// Modifications counter, reset from the card's advertised buffer
    /// size whenever a session is opened.
    pub(crate) modifications_counter: i32,
}

impl CardImage {
    /// Construct a new card image as produced by an external selection
    /// step (out of scope for this crate).
    pub fn new(
        df_name: Vec<u8>,
        serial_number: [u8; 8],
        product_type: ProductType,
        capabilities: CardCapabilities,
        payload_capacity: usize,
    ) -> Self {
        assert!(
            (5..=16).contains(&df_name.len()),
            "DF name must be 5-16 bytes"
        );

        Self {
            df_name,
            serial_number,
            product_type,
            capabilities,
            modifications_counter_in_bytes: capabilities.contains(CardCapabilities::BYTE_COUNTER),
            payload_capacity,
            challenge: None,
            kif: None,
            kvc: None,
            pin_attempts_remaining: 3,
            sv: SvData::default(),
            card_public_key: None,
            card_certificate: None,
            ca_certificate: None,
            df_invalidated: false,
            pre_open_write_access_level: None,
            files: HashMap::new(),
            modifications_counter: 0,
        }
    }

    /// DF name selected on the card (I1: immutable after selection).
    pub fn df_name(&self) -> &[u8] {
        &self.df_name
    }

    /// 8-byte card serial number (I1: immutable after selection).
    pub fn serial_number(&self) -> [u8; 8] {
        self.serial_number
    }

    /// Card product type.
    pub fn product_type(&self) -> ProductType {
        self.product_type
    }

    /// Card capability flags.
    pub fn capabilities(&self) -> CardCapabilities {
        self.capabilities
    }

    /// Does this card's session buffer need byte-level accounting?
    pub fn uses_byte_counter(&self) -> bool {
        self.modifications_counter_in_bytes
    }

    /// Maximum bytes of command data a single APDU may carry on this
    /// card.
    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    /// Register an elementary file's type (typically from an FCI parsed
    /// during `SELECT_FILE`).
    pub fn set_file_header(&mut self, sfi: u8, file_type: FileType, fci: Vec<u8>) {
        let file = self
            .files
            .entry(sfi)
            .or_insert_with(|| ElementaryFile::new(file_type));
        file.file_type = Some(file_type);
        file.fci = fci;
    }

    /// Write (or overwrite) one record of an elementary file.
    pub fn write_record(&mut self, sfi: u8, record_number: u8, bytes: Vec<u8>) {
        self.files
            .entry(sfi)
            .or_insert_with(|| ElementaryFile::new(FileType::Linear))
            .records
            .insert(record_number, bytes);
    }

    /// Read one record. Returns `None` if the SFI or record is unknown.
    pub fn get_record(&self, sfi: u8, record_number: u8) -> Option<&[u8]> {
        self.files
            .get(&sfi)
            .and_then(|file| file.records.get(&record_number))
            .map(Vec::as_slice)
    }

    /// Read a counter's current value as a 24-bit unsigned integer.
    /// Returns `None` if unknown.
    pub fn get_counter(&self, sfi: u8, counter_number: u8) -> Option<u32> {
        self.get_record(sfi, counter_number).map(|bytes| {
            assert_eq!(bytes.len(), 3, "counter record must be 3 bytes");
            u32::from(bytes[0]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[2])
        })
    }

    /// Read every known counter of a file as `counter_number -> value`.
    pub fn get_all_counters(&self, sfi: u8) -> HashMap<u8, u32> {
        self.files
            .get(&sfi)
            .map(|file| {
                file.records
                    .iter()
                    .map(|(n, bytes)| {
                        assert_eq!(bytes.len(), 3, "counter record must be 3 bytes");
                        let v = u32::from(bytes[0]) << 16
                            | u32::from(bytes[1]) << 8
                            | u32::from(bytes[2]);
                        (*n, v)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set a counter's value directly (used when mutating counters from
    /// an anticipated or actual INCREASE/DECREASE response).
    pub fn set_counter(&mut self, sfi: u8, counter_number: u8, value: u32) {
        let bytes = vec![(value >> 16) as u8, (value >> 8) as u8, value as u8];
        self.files
            .entry(sfi)
            .or_insert_with(|| ElementaryFile::new(FileType::Counters))
            .records
            .insert(counter_number, bytes);
    }

    /// The 8-byte challenge returned by `GET_CHALLENGE`, if any.
    pub fn challenge(&self) -> Option<[u8; 8]> {
        self.challenge
    }

    /// Record the card's challenge.
    pub fn set_card_challenge(&mut self, challenge: [u8; 8]) {
        self.challenge = Some(challenge);
    }

    /// KIF of the key used for the currently open (or most recently
    /// open) session.
    pub fn kif(&self) -> Option<u8> {
        self.kif
    }

    /// KVC of the key used for the currently open (or most recently
    /// open) session.
    pub fn kvc(&self) -> Option<u8> {
        self.kvc
    }

    /// Record the KIF/KVC reported by the card's `OPEN_SECURE_SESSION`
    /// response.
    pub fn set_kif_kvc(&mut self, kif: u8, kvc: u8) {
        self.kif = Some(kif);
        self.kvc = Some(kvc);
    }

    /// Remaining PIN presentation attempts (I4: always in `0..=3`).
    pub fn pin_attempts_remaining(&self) -> u8 {
        self.pin_attempts_remaining
    }

    /// Set remaining PIN attempts, per the VERIFY_PIN status word mapping.
    pub fn set_pin_attempts_remaining(&mut self, n: u8) {
        assert!(n <= 3, "pin_attempts_remaining must be in 0..=3");
        self.pin_attempts_remaining = n;
    }

    /// Current mirrored SV purse state.
    pub fn sv_data(&self) -> &SvData {
        &self.sv
    }

    /// Overwrite the mirrored SV purse state wholesale, e.g. after
    /// parsing an `SV_GET` response.
    pub fn set_sv_data(&mut self, sv: SvData) {
        self.sv = sv;
    }

    /// Zero out the mirrored SV data (used by `SvReadAllLogs`, which
    /// invalidates it until the caller re-reads the SV log records).
    pub fn clear_sv_data(&mut self) {
        self.sv = SvData::default();
    }

    /// Card's public key, set once extracted by the asymmetric crypto
    /// provider in PKI mode.
    pub fn card_public_key(&self) -> Option<&[u8]> {
        self.card_public_key.as_deref()
    }

    /// Record the card's public key.
    pub fn set_public_key(&mut self, key: Vec<u8>) {
        self.card_public_key = Some(key);
    }

    /// Card's own certificate, if already present in the image (fetched
    /// via `GET_DATA` otherwise).
    pub fn card_certificate(&self) -> Option<&[u8]> {
        self.card_certificate.as_deref()
    }

    /// Record the card's certificate.
    pub fn set_card_certificate(&mut self, certificate: Vec<u8>) {
        self.card_certificate = Some(certificate);
    }

    /// Issuer (CA) certificate, once fetched/registered.
    pub fn ca_certificate(&self) -> Option<&[u8]> {
        self.ca_certificate.as_deref()
    }

    /// Record the issuer (CA) certificate.
    pub fn set_ca_certificate(&mut self, certificate: Vec<u8>) {
        self.ca_certificate = Some(certificate);
    }

    /// Has the DF been invalidated (`INVALIDATE` command)?
    pub fn is_df_invalidated(&self) -> bool {
        self.df_invalidated
    }

    /// Record the DF's invalidation state.
    pub fn set_df_invalidated(&mut self, invalidated: bool) {
        self.df_invalidated = invalidated;
    }

    /// Access level requested by a not-yet-opened session (used by the
    /// PKI pre-open flow).
    pub fn pre_open_write_access_level(&self) -> Option<AccessLevel> {
        self.pre_open_write_access_level
    }

    /// Record the access level a pre-open flow is targeting.
    pub fn set_pre_open_write_access_level(&mut self, level: Option<AccessLevel>) {
        self.pre_open_write_access_level = level;
    }

    /// Deep-copy the current state into an opaque snapshot (I3).
    pub fn backup(&self) -> Snapshot {
        Snapshot(self.clone())
    }

    /// Revert every mutation performed since `snapshot` was taken (I3).
    pub fn restore_from(&mut self, snapshot: Snapshot) {
        *self = snapshot.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_card() -> CardImage {
        CardImage::new(
            b"1TIC.ICA".to_vec(),
            [0, 1, 2, 3, 4, 5, 6, 7],
            ProductType::PrimeRev3,
            CardCapabilities::EXTENDED_MODE | CardCapabilities::SV_FEATURE,
            230,
        )
    }

    #[test]
    fn unknown_record_is_absent() {
        let card = sample_card();
        assert!(card.get_record(7, 1).is_none());
    }

    #[test]
    fn write_then_read_record_roundtrips() {
        let mut card = sample_card();
        card.write_record(7, 1, vec![0xAB; 16]);
        assert_eq!(card.get_record(7, 1), Some([0xAB; 16].as_slice()));
    }

    #[test]
    fn counters_roundtrip_as_be_u24() {
        let mut card = sample_card();
        card.set_counter(6, 1, 0x01_02_03);
        assert_eq!(card.get_counter(6, 1), Some(0x01_02_03));
        assert_eq!(card.get_all_counters(6).get(&1), Some(&0x01_02_03));
    }

    #[test]
    fn backup_restore_reverts_mutations() {
        let mut card = sample_card();
        let snapshot = card.backup();
        card.write_record(8, 1, vec![0xFF; 16]);
        card.set_pin_attempts_remaining(0);
        card.restore_from(snapshot);
        assert!(card.get_record(8, 1).is_none());
        assert_eq!(card.pin_attempts_remaining(), 3);
    }

    #[test]
    fn pin_attempts_invariant_is_enforced() {
        let mut card = sample_card();
        card.set_pin_attempts_remaining(2);
        assert_eq!(card.pin_attempts_remaining(), 2);
    }

    #[test]
    #[should_panic(expected = "0..=3")]
    fn pin_attempts_out_of_range_panics() {
        let mut card = sample_card();
        card.set_pin_attempts_remaining(4);
    }
}
