//! Security settings.
//!
//! A frozen configuration bag assembled once via [`SecuritySettingBuilder`]
//! and shared read-only by every [`crate::TransactionManager`] built from
//! it: every builder setter consumes and returns `Self`, and the result is
//! wrapped in an `Arc` so it can be cloned cheaply across managers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::crypto::CertificateParserRegistry;
use crate::types::AccessLevel;

/// Ciphering mode used to protect a PIN in flight.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PinCipheringMode {
    /// PIN travels in clear (only legal when `pin_plain_transmission_enabled`).
    Plain,
    /// PIN is ciphered by the crypto provider under the given `(kif, kvc)`.
    Ciphered {
        /// KIF of the key used to cipher the PIN.
        kif: u8,
        /// KVC of the key used to cipher the PIN.
        kvc: u8,
    },
}

/// Frozen security configuration, built once via [`SecuritySettingBuilder`].
#[derive(Clone)]
pub struct SecuritySetting {
    authorized_session_keys: HashSet<(u8, u8)>,
    authorized_sv_keys: HashSet<(u8, u8)>,
    kif_map: HashMap<(AccessLevel, u8), u8>,
    default_kif_map: HashMap<AccessLevel, u8>,
    default_kvc_map: HashMap<AccessLevel, u8>,
    pin_verification_ciphering: HashMap<(u8, u8), PinCipheringMode>,
    pin_modification_ciphering: HashMap<(u8, u8), PinCipheringMode>,
    multiple_session_enabled: bool,
    ratification_mechanism_enabled: bool,
    pin_plain_transmission_enabled: bool,
    sv_load_and_debit_log_enabled: bool,
    sv_negative_balance_authorized: bool,
    read_on_session_opening_disabled: bool,
    certificate_parser_registry: Option<Arc<dyn CertificateParserRegistry>>,
    pca_public_key: Option<Vec<u8>>,
}

impl fmt::Debug for SecuritySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecuritySetting")
            .field("authorized_session_keys", &self.authorized_session_keys)
            .field("authorized_sv_keys", &self.authorized_sv_keys)
            .field("kif_map", &self.kif_map)
            .field("default_kif_map", &self.default_kif_map)
            .field("default_kvc_map", &self.default_kvc_map)
            .field("multiple_session_enabled", &self.multiple_session_enabled)
            .field("ratification_mechanism_enabled", &self.ratification_mechanism_enabled)
            .field("pin_plain_transmission_enabled", &self.pin_plain_transmission_enabled)
            .field("sv_load_and_debit_log_enabled", &self.sv_load_and_debit_log_enabled)
            .field("sv_negative_balance_authorized", &self.sv_negative_balance_authorized)
            .field("read_on_session_opening_disabled", &self.read_on_session_opening_disabled)
            .field("certificate_parser_registry", &self.certificate_parser_registry.is_some())
            .field("pca_public_key", &self.pca_public_key.is_some())
            .finish()
    }
}

impl SecuritySetting {
    /// Is the session `(kif, kvc)` pair authorized to open a secure session?
    pub fn is_session_key_authorized(&self, kif: u8, kvc: u8) -> bool {
        self.authorized_session_keys.contains(&(kif, kvc))
    }

    /// Is the `(kif, kvc)` pair authorized for SV operations?
    pub fn is_sv_key_authorized(&self, kif: u8, kvc: u8) -> bool {
        self.authorized_sv_keys.contains(&(kif, kvc))
    }

    /// Rule CL-KEY-KIF.1/KIFUNK.1: compute the KVC to use for `level`,
    /// preferring the card's own KVC when it reported one.
    pub fn compute_kvc(&self, level: AccessLevel, card_kvc: Option<u8>) -> Option<u8> {
        card_kvc.or_else(|| self.default_kvc_map.get(&level).copied())
    }

    /// Rule CL-KEY-KIF.1/KIFUNK.1: compute the KIF to use for `level`. A
    /// card KIF of `0xFF` means "use the settings-driven KIF for this KVC",
    /// falling back to the per-level default.
    pub fn compute_kif(&self, level: AccessLevel, card_kif: u8, kvc: Option<u8>) -> Option<u8> {
        if card_kif != 0xFF {
            return Some(card_kif);
        }
        let kvc = kvc?;
        self.kif_map
            .get(&(level, kvc))
            .copied()
            .or_else(|| self.default_kif_map.get(&level).copied())
    }

    /// Ciphering mode to use when presenting a PIN.
    pub fn pin_verification_ciphering_mode(&self, kif: u8, kvc: u8) -> PinCipheringMode {
        self.pin_verification_ciphering
            .get(&(kif, kvc))
            .copied()
            .unwrap_or(PinCipheringMode::Plain)
    }

    /// Ciphering mode to use when modifying a PIN.
    pub fn pin_modification_ciphering_mode(&self, kif: u8, kvc: u8) -> PinCipheringMode {
        self.pin_modification_ciphering
            .get(&(kif, kvc))
            .copied()
            .unwrap_or(PinCipheringMode::Plain)
    }

    /// Is a modifying command allowed to split its session into multiple
    /// sub-sessions on buffer overflow, rather than failing outright?
    pub fn is_multiple_session_enabled(&self) -> bool {
        self.multiple_session_enabled
    }

    /// Should contactless sessions send a dedicated ratification APDU
    /// (CL-RAT-CMD.1)?
    pub fn is_ratification_mechanism_enabled(&self) -> bool {
        self.ratification_mechanism_enabled
    }

    /// May a PIN ever be transmitted in clear?
    pub fn is_pin_plain_transmission_enabled(&self) -> bool {
        self.pin_plain_transmission_enabled
    }

    /// Should `prepareSvGet` request both the load and debit logs?
    pub fn is_sv_load_and_debit_log_enabled(&self) -> bool {
        self.sv_load_and_debit_log_enabled
    }

    /// May an SV debit bring the balance negative?
    pub fn is_sv_negative_balance_authorized(&self) -> bool {
        self.sv_negative_balance_authorized
    }

    /// Is the read-on-session-opening optimisation disabled?
    pub fn is_read_on_session_opening_disabled(&self) -> bool {
        self.read_on_session_opening_disabled
    }

    /// The certificate parser registry configured for PKI-mode session
    /// opening, if any.
    pub fn certificate_parser_registry(&self) -> Option<&dyn CertificateParserRegistry> {
        self.certificate_parser_registry.as_deref()
    }

    /// The trusted PCA (root) public key, verifying the top of the
    /// card/CA certificate chain in PKI mode.
    pub fn pca_public_key(&self) -> Option<&[u8]> {
        self.pca_public_key.as_deref()
    }
}

/// Builder for [`SecuritySetting`]. Every setter consumes and returns
/// `Self`; call [`SecuritySettingBuilder::build`] to freeze the result
/// into an `Arc<SecuritySetting>` ready to hand to a `TransactionManager`.
#[derive(Clone, Default)]
pub struct SecuritySettingBuilder {
    authorized_session_keys: HashSet<(u8, u8)>,
    authorized_sv_keys: HashSet<(u8, u8)>,
    kif_map: HashMap<(AccessLevel, u8), u8>,
    default_kif_map: HashMap<AccessLevel, u8>,
    default_kvc_map: HashMap<AccessLevel, u8>,
    pin_verification_ciphering: HashMap<(u8, u8), PinCipheringMode>,
    pin_modification_ciphering: HashMap<(u8, u8), PinCipheringMode>,
    multiple_session_enabled: bool,
    ratification_mechanism_enabled: bool,
    pin_plain_transmission_enabled: bool,
    sv_load_and_debit_log_enabled: bool,
    sv_negative_balance_authorized: bool,
    read_on_session_opening_disabled: bool,
    certificate_parser_registry: Option<Arc<dyn CertificateParserRegistry>>,
    pca_public_key: Option<Vec<u8>>,
}

impl SecuritySettingBuilder {
    /// Start building with every boolean flag at its safest default (all
    /// false: no multi-session, no plain PIN, no negative balance, no
    /// ratification, logs enabled off, optimisation enabled).
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorize a `(kif, kvc)` pair to open a secure session.
    pub fn authorize_session_key(mut self, kif: u8, kvc: u8) -> Self {
        self.authorized_session_keys.insert((kif, kvc));
        self
    }

    /// Authorize a `(kif, kvc)` pair for SV operations.
    pub fn authorize_sv_key(mut self, kif: u8, kvc: u8) -> Self {
        self.authorized_sv_keys.insert((kif, kvc));
        self
    }

    /// Map `(level, kvc) -> kif`, consulted by [`SecuritySetting::compute_kif`].
    pub fn kif(mut self, level: AccessLevel, kvc: u8, kif: u8) -> Self {
        self.kif_map.insert((level, kvc), kif);
        self
    }

    /// Default KIF for `level`, used when no specific `(level, kvc)` entry matches.
    pub fn default_kif(mut self, level: AccessLevel, kif: u8) -> Self {
        self.default_kif_map.insert(level, kif);
        self
    }

    /// Default KVC for `level`, used when the card reports none.
    pub fn default_kvc(mut self, level: AccessLevel, kvc: u8) -> Self {
        self.default_kvc_map.insert(level, kvc);
        self
    }

    /// Ciphering mode for PIN presentation under `(kif, kvc)`.
    pub fn pin_verification_ciphering_mode(mut self, kif: u8, kvc: u8, mode: PinCipheringMode) -> Self {
        self.pin_verification_ciphering.insert((kif, kvc), mode);
        self
    }

    /// Ciphering mode for PIN modification under `(kif, kvc)`.
    pub fn pin_modification_ciphering_mode(mut self, kif: u8, kvc: u8, mode: PinCipheringMode) -> Self {
        self.pin_modification_ciphering.insert((kif, kvc), mode);
        self
    }

    /// Enable splitting a session across sub-sessions on buffer overflow.
    pub fn multiple_session_enabled(mut self, enabled: bool) -> Self {
        self.multiple_session_enabled = enabled;
        self
    }

    /// Enable the dedicated contactless ratification APDU.
    pub fn ratification_mechanism_enabled(mut self, enabled: bool) -> Self {
        self.ratification_mechanism_enabled = enabled;
        self
    }

    /// Allow PINs to be transmitted in clear.
    pub fn pin_plain_transmission_enabled(mut self, enabled: bool) -> Self {
        self.pin_plain_transmission_enabled = enabled;
        self
    }

    /// Request both the reload and debit SV logs on `prepareSvGet`.
    pub fn sv_load_and_debit_log_enabled(mut self, enabled: bool) -> Self {
        self.sv_load_and_debit_log_enabled = enabled;
        self
    }

    /// Allow an SV debit to bring the balance negative.
    pub fn sv_negative_balance_authorized(mut self, enabled: bool) -> Self {
        self.sv_negative_balance_authorized = enabled;
        self
    }

    /// Disable the read-on-session-opening optimisation.
    pub fn read_on_session_opening_disabled(mut self, disabled: bool) -> Self {
        self.read_on_session_opening_disabled = disabled;
        self
    }

    /// Register the certificate parser registry consulted by PKI-mode
    /// session opening.
    pub fn certificate_parser_registry(mut self, registry: Arc<dyn CertificateParserRegistry>) -> Self {
        self.certificate_parser_registry = Some(registry);
        self
    }

    /// Register the trusted PCA (root) public key that anchors the
    /// PKI-mode certificate chain.
    pub fn pca_public_key(mut self, key: Vec<u8>) -> Self {
        self.pca_public_key = Some(key);
        self
    }

    /// Freeze the bag into a shareable, immutable [`SecuritySetting`].
    pub fn build(self) -> Arc<SecuritySetting> {
        Arc::new(SecuritySetting {
            authorized_session_keys: self.authorized_session_keys,
            authorized_sv_keys: self.authorized_sv_keys,
            kif_map: self.kif_map,
            default_kif_map: self.default_kif_map,
            default_kvc_map: self.default_kvc_map,
            pin_verification_ciphering: self.pin_verification_ciphering,
            pin_modification_ciphering: self.pin_modification_ciphering,
            multiple_session_enabled: self.multiple_session_enabled,
            ratification_mechanism_enabled: self.ratification_mechanism_enabled,
            pin_plain_transmission_enabled: self.pin_plain_transmission_enabled,
            sv_load_and_debit_log_enabled: self.sv_load_and_debit_log_enabled,
            sv_negative_balance_authorized: self.sv_negative_balance_authorized,
            read_on_session_opening_disabled: self.read_on_session_opening_disabled,
            certificate_parser_registry: self.certificate_parser_registry,
            pca_public_key: self.pca_public_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Arc<SecuritySetting> {
        SecuritySettingBuilder::new()
            .authorize_session_key(0x21, 0x79)
            .authorize_sv_key(0x21, 0x79)
            .default_kif(AccessLevel::Debit, 0x30)
            .default_kvc(AccessLevel::Debit, 0x79)
            .kif(AccessLevel::Debit, 0x7A, 0x31)
            .build()
    }

    #[test]
    fn session_key_authorization_is_exact_pair_match() {
        let s = settings();
        assert!(s.is_session_key_authorized(0x21, 0x79));
        assert!(!s.is_session_key_authorized(0x21, 0x7A));
    }

    #[test]
    fn compute_kvc_prefers_card_value_over_default() {
        let s = settings();
        assert_eq!(s.compute_kvc(AccessLevel::Debit, Some(0x99)), Some(0x99));
        assert_eq!(s.compute_kvc(AccessLevel::Debit, None), Some(0x79));
    }

    #[test]
    fn compute_kif_uses_card_value_unless_unknown_marker() {
        let s = settings();
        assert_eq!(s.compute_kif(AccessLevel::Debit, 0x10, Some(0x79)), Some(0x10));
        assert_eq!(s.compute_kif(AccessLevel::Debit, 0xFF, Some(0x7A)), Some(0x31));
        assert_eq!(s.compute_kif(AccessLevel::Debit, 0xFF, Some(0x00)), Some(0x30));
        assert_eq!(s.compute_kif(AccessLevel::Debit, 0xFF, None), None);
    }

    #[test]
    fn pin_ciphering_mode_defaults_to_plain() {
        let s = settings();
        assert_eq!(
            s.pin_verification_ciphering_mode(0x21, 0x79),
            PinCipheringMode::Plain
        );
    }

    #[test]
    fn flags_default_to_safe_values() {
        let s = SecuritySettingBuilder::new().build();
        assert!(!s.is_multiple_session_enabled());
        assert!(!s.is_pin_plain_transmission_enabled());
        assert!(!s.is_sv_negative_balance_authorized());
    }
}
