//! Crypto provider interface.
//!
//! The providers themselves are opaque collaborators: this module only
//! defines the trait surface the secure-session state machine drives,
//! plus [`mock`] reference implementations used by this crate's own
//! test-suite. Keeps the secure-channel crypto behind a narrow set of
//! operations invoked in strict order by the session.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use crate::types::AccessLevel;

/// Errors raised by a crypto provider, kept distinct from the core's
/// flat [`crate::ErrorKind`] taxonomy so callers can tell a logic failure
/// (bad MAC, unknown key) from an I/O failure talking to the SAM/PKI
/// backend.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The provider rejected the request on logical grounds (unknown
    /// KIF/KVC, malformed challenge, MAC mismatch, …).
    #[error("crypto provider logic error: {0}")]
    Logic(String),
    /// The provider failed to reach its backend (SAM reader, HSM, PKI
    /// service, …).
    #[error("crypto provider I/O error: {0}")]
    Io(String),
}

/// Security-data blob a SAM computes for an `SV_RELOAD`/`SV_DEBIT`/
/// `SV_UNDEBIT` command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SvSecurityData {
    /// 4-byte SAM identifier.
    pub sam_id: [u8; 4],
    /// 3-byte SAM challenge.
    pub challenge: [u8; 3],
    /// 3-byte SAM transaction number.
    pub transaction_number: [u8; 3],
    /// SAM MAC: 5 bytes in plain mode, 10 bytes in extended mode.
    pub mac: Vec<u8>,
}

impl SvSecurityData {
    /// Concatenate the fields in wire order
    /// (`sam_id || challenge || transaction_number || mac`), the exact
    /// tail spliced into an SV APDU by `finalize_request`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 3 + 3 + self.mac.len());
        out.extend_from_slice(&self.sam_id);
        out.extend_from_slice(&self.challenge);
        out.extend_from_slice(&self.transaction_number);
        out.extend_from_slice(&self.mac);
        out
    }
}

/// The input needed to compute [`SvSecurityData`]: the raw SV command's
/// header/data bytes the SAM must authenticate over.
#[derive(Clone, Debug)]
pub struct SvCommandSecurityInput {
    /// `SV_GET` response header bytes.
    pub sv_get_header: Vec<u8>,
    /// `SV_GET` response data bytes.
    pub sv_get_data: Vec<u8>,
    /// The partially-built SV command APDU requiring security data.
    pub sv_command_partial_request: Vec<u8>,
}

/// Symmetric (SAM-backed) crypto provider interface.
///
/// The secure-session state machine calls `update_terminal_session_mac`
/// strictly in request/response order; implementations may rely on that
/// ordering (odd calls are requests, even calls are responses) rather
/// than tracking direction themselves.
pub trait SymmetricCryptoProvider {
    /// Start a new secure-session context, returning the SAM's 8-byte
    /// challenge to splice into `OPEN_SECURE_SESSION`.
    fn init_terminal_secure_session_context(&mut self) -> Result<[u8; 8], CryptoError>;

    /// Seed the MAC chain from the card's `OPEN_SECURE_SESSION` response
    /// body plus the access level's computed KIF/KVC.
    fn init_terminal_session_mac(
        &mut self,
        open_session_response_data: &[u8],
        level: AccessLevel,
        kif: u8,
        kvc: u8,
    ) -> Result<(), CryptoError>;

    /// Absorb `bytes` (a request or a response) into the running MAC.
    /// When encryption is active, returns the ciphered/deciphered
    /// replacement of equal length; otherwise returns `bytes` unchanged.
    fn update_terminal_session_mac(&mut self, bytes: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Turn on in-session encryption (only legal via `MANAGE_SECURE_SESSION`).
    fn activate_encryption(&mut self) -> Result<(), CryptoError>;

    /// Turn off in-session encryption.
    fn deactivate_encryption(&mut self) -> Result<(), CryptoError>;

    /// Is encryption currently active?
    fn is_encryption_active(&self) -> bool;

    /// Compute the 8-byte terminal MAC for early mutual authentication
    /// (`MANAGE_SECURE_SESSION` with a mutual-auth P2).
    fn generate_terminal_session_mac(&mut self) -> Result<[u8; 8], CryptoError>;

    /// Compute the final 8-byte terminal MAC sent inside
    /// `CLOSE_SECURE_SESSION`.
    fn finalize_terminal_session_mac(&mut self) -> Result<[u8; 8], CryptoError>;

    /// Validate the card's session MAC (returned by `CLOSE_SECURE_SESSION`
    /// or a mutual-auth `MANAGE_SECURE_SESSION`).
    fn is_card_session_mac_valid(&mut self, card_mac: &[u8]) -> Result<bool, CryptoError>;

    /// Validate an SV MAC the card attached to a completed SV operation.
    fn is_card_sv_mac_valid(&mut self, card_sv_mac: &[u8]) -> Result<bool, CryptoError>;

    /// Cipher a PIN for `VERIFY_PIN` presentation.
    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: [u8; 8],
        pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Cipher an old/new PIN pair for `CHANGE_PIN`.
    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: [u8; 8],
        current_pin: &[u8; 4],
        new_pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Compute the security data to splice into an SV modifying command.
    fn compute_sv_command_security_data(
        &mut self,
        input: SvCommandSecurityInput,
    ) -> Result<SvSecurityData, CryptoError>;

    /// Compute a 32-byte ciphered card key blob for `CHANGE_KEY`.
    fn generate_ciphered_card_key(
        &mut self,
        card_challenge: [u8; 8],
        issuer_kif: u8,
        issuer_kvc: u8,
        new_kif: u8,
        new_kvc: u8,
    ) -> Result<[u8; 32], CryptoError>;

    /// Idempotently pre-diversify keys for the next transaction, so the
    /// first `OPEN_SECURE_SESSION` of that transaction doesn't pay the
    /// diversification latency.
    fn pre_init_terminal_secure_session_context(&mut self) -> Result<(), CryptoError>;

    /// Flush any SAM APDUs queued internally by the above calls to the
    /// SAM reader.
    fn synchronize(&mut self) -> Result<(), CryptoError>;
}

/// A certificate successfully parsed by a type-specific [`CertificateParser`].
#[derive(Clone, Debug)]
pub struct ParsedCertificate {
    /// First byte of the raw certificate, identifying its type.
    pub type_byte: u8,
    /// Opaque payload (subject identifier, validity, etc.) the
    /// asymmetric provider understands; the core never interprets it.
    pub content: Vec<u8>,
}

/// Pluggable certificate parser, looked up by type byte.
pub trait CertificateParser {
    /// Parse a raw certificate.
    fn parse(&self, raw: &[u8]) -> Result<ParsedCertificate, CryptoError>;
}

/// Registry of certificate parsers, keyed by type byte, for both card
/// and CA certificates.
pub trait CertificateParserRegistry {
    /// Look up the parser for a card certificate's type byte.
    fn get_card_certificate_parser(&self, type_byte: u8) -> Option<&dyn CertificateParser>;
    /// Look up the parser for a CA certificate's type byte.
    fn get_ca_certificate_parser(&self, type_byte: u8) -> Option<&dyn CertificateParser>;
}

/// Asymmetric (PKI-mode) crypto provider interface.
pub trait AsymmetricCryptoProvider {
    /// Open an opaque per-transaction handle; PKI mode has no MAC chain
    /// to seed, so this is intentionally lightweight compared to
    /// `init_terminal_session_mac`.
    fn create_card_transaction_manager(&mut self) -> Result<(), CryptoError>;

    /// Verify `certificate` was issued by `parent_content` and return its
    /// parsed content.
    fn check_certificate_and_get_content(
        &mut self,
        certificate: &ParsedCertificate,
        parent_content: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Verify `certificate` was issued by `parent_content` and extract the
    /// card's public key, binding it to `card_identifier`.
    fn check_certificate_and_get_public_key(
        &mut self,
        certificate: &ParsedCertificate,
        parent_content: &[u8],
        card_identifier: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}
