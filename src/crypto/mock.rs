//! In-process reference crypto providers.
//!
//! These exist only so this crate's own test-suite can exercise the
//! session state machine end to end without a real SAM or PKI backend;
//! they are not production cryptography. Uses CMAC-over-AES128 for the
//! MAC chain and AES-CBC for encryption, keyed off Calypso's KIF/KVC
//! addressing.

use std::collections::HashMap;

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::{Cmac, Mac as _};
use ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use subtle::ConstantTimeEq;

use crate::types::AccessLevel;

use super::{
    AsymmetricCryptoProvider, CertificateParser, CertificateParserRegistry, CryptoError,
    ParsedCertificate, SvCommandSecurityInput, SvSecurityData, SymmetricCryptoProvider,
};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Derive a 16-byte working key from a master key and a context, using a
/// CMAC-as-PRF construction simplified to a single 16-byte output block
/// (Calypso's SAM-side KDF is out of
/// scope; this exists only to give the mock provider *a* deterministic
/// working key).
fn derive_key(master_key: &[u8; 16], context: &[u8]) -> [u8; 16] {
    let mut mac = Cmac::<Aes128>::new_from_slice(master_key).expect("valid key length");
    mac.update(context);
    let tag = mac.finalize().into_bytes();
    let mut key = [0u8; 16];
    key.copy_from_slice(&tag[..16]);
    key
}

fn xor_bytes(a: &[u8; 8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

fn cmac_tag(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = Cmac::<Aes128>::new_from_slice(key).expect("valid key length");
    mac.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Pad `data` with zero bytes up to the next multiple of the AES block
/// size, encrypt/decrypt in CBC mode, and truncate back to the original
/// length. A real implementation would use a proper padding scheme;
/// this mock only needs the ciphertext to round-trip.
fn cbc_transform(key: &[u8; 16], iv: &[u8; 16], data: &[u8], encrypt: bool) -> Vec<u8> {
    let original_len = data.len();
    let padded_len = original_len.div_ceil(16).max(1) * 16;
    let mut buf = vec![0u8; padded_len];
    buf[..original_len].copy_from_slice(data);

    if encrypt {
        let cipher = Aes128CbcEnc::new(key.into(), iv.into());
        cipher
            .encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf, original_len)
            .expect("buffer sized to a multiple of the block size");
    } else {
        let cipher = Aes128CbcDec::new(key.into(), iv.into());
        cipher
            .decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf)
            .expect("buffer sized to a multiple of the block size");
    }

    buf.truncate(original_len);
    buf
}

/// A test/demo stand-in for a SAM, implementing [`SymmetricCryptoProvider`].
pub struct MockSamProvider {
    keys: HashMap<(u8, u8), [u8; 16]>,
    sam_id: [u8; 4],
    sam_challenge: [u8; 8],
    session_mac_key: Option<[u8; 16]>,
    session_cipher_key: Option<[u8; 16]>,
    digest_cache: Vec<u8>,
    encryption_active: bool,
    sv_transaction_number: u16,
}

impl MockSamProvider {
    /// Build a provider with a fixed `(kif, kvc) -> master key` table.
    pub fn new(sam_id: [u8; 4], keys: HashMap<(u8, u8), [u8; 16]>) -> Self {
        Self {
            keys,
            sam_id,
            sam_challenge: [0u8; 8],
            session_mac_key: None,
            session_cipher_key: None,
            digest_cache: Vec::new(),
            encryption_active: false,
            sv_transaction_number: 0,
        }
    }

    /// Build a provider seeded with a single authorized `(kif, kvc)` pair,
    /// convenient for tests.
    pub fn with_single_key(sam_id: [u8; 4], kif: u8, kvc: u8, key: [u8; 16]) -> Self {
        let mut keys = HashMap::new();
        keys.insert((kif, kvc), key);
        Self::new(sam_id, keys)
    }

    fn mac_key(&self) -> Result<&[u8; 16], CryptoError> {
        self.session_mac_key
            .as_ref()
            .ok_or_else(|| CryptoError::Logic("session MAC key not yet derived".into()))
    }

    /// Expose the full 16-byte session tag for tests that need to
    /// fabricate a matching card-side MAC without duplicating the CMAC
    /// derivation. Not part of [`SymmetricCryptoProvider`]: a real SAM
    /// never lets the terminal read the card's half of the tag directly.
    pub(crate) fn peek_session_tag(&self) -> Result<[u8; 16], CryptoError> {
        let key = *self.mac_key()?;
        Ok(cmac_tag(&key, &self.digest_cache))
    }
}

impl SymmetricCryptoProvider for MockSamProvider {
    fn init_terminal_secure_session_context(&mut self) -> Result<[u8; 8], CryptoError> {
        // A real SAM would draw this from its RNG; determinism here keeps
        // the provider usable as a literal-scenario fixture.
        self.sam_challenge = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        self.digest_cache.clear();
        self.session_mac_key = None;
        self.session_cipher_key = None;
        self.encryption_active = false;
        Ok(self.sam_challenge)
    }

    fn init_terminal_session_mac(
        &mut self,
        open_session_response_data: &[u8],
        level: AccessLevel,
        kif: u8,
        kvc: u8,
    ) -> Result<(), CryptoError> {
        let master_key = *self
            .keys
            .get(&(kif, kvc))
            .ok_or_else(|| CryptoError::Logic(format!("unknown key (kif={kif:#x}, kvc={kvc:#x})")))?;

        let mut context = Vec::with_capacity(1 + open_session_response_data.len());
        context.push(level.session_open_p1());
        context.extend_from_slice(&self.sam_challenge);
        context.extend_from_slice(open_session_response_data);

        self.session_mac_key = Some(derive_key(&master_key, &context));
        self.session_cipher_key = Some(derive_key(&master_key, &[context.as_slice(), b"ENC"].concat()));
        self.digest_cache.clear();
        self.digest_cache.extend_from_slice(open_session_response_data);
        Ok(())
    }

    fn update_terminal_session_mac(&mut self, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.digest_cache.extend_from_slice(bytes);

        if self.encryption_active {
            let cipher_key = *self
                .session_cipher_key
                .as_ref()
                .ok_or_else(|| CryptoError::Logic("no cipher key derived".into()))?;
            let iv = [0u8; 16];
            Ok(cbc_transform(&cipher_key, &iv, bytes, true))
        } else {
            Ok(bytes.to_vec())
        }
    }

    fn activate_encryption(&mut self) -> Result<(), CryptoError> {
        self.encryption_active = true;
        Ok(())
    }

    fn deactivate_encryption(&mut self) -> Result<(), CryptoError> {
        self.encryption_active = false;
        Ok(())
    }

    fn is_encryption_active(&self) -> bool {
        self.encryption_active
    }

    fn generate_terminal_session_mac(&mut self) -> Result<[u8; 8], CryptoError> {
        let key = *self.mac_key()?;
        let tag = cmac_tag(&key, &self.digest_cache);
        let mut mac = [0u8; 8];
        mac.copy_from_slice(&tag[..8]);
        Ok(mac)
    }

    fn finalize_terminal_session_mac(&mut self) -> Result<[u8; 8], CryptoError> {
        self.generate_terminal_session_mac()
    }

    fn is_card_session_mac_valid(&mut self, card_mac: &[u8]) -> Result<bool, CryptoError> {
        let key = *self.mac_key()?;
        let tag = cmac_tag(&key, &self.digest_cache);
        Ok(tag[8..16].ct_eq(card_mac).unwrap_u8() == 1)
    }

    fn is_card_sv_mac_valid(&mut self, card_sv_mac: &[u8]) -> Result<bool, CryptoError> {
        let key = *self.mac_key()?;
        let tag = cmac_tag(&key, &self.digest_cache);
        Ok(tag[..card_sv_mac.len().min(16)].ct_eq(card_sv_mac).unwrap_u8() == 1)
    }

    fn cipher_pin_for_presentation(
        &mut self,
        card_challenge: [u8; 8],
        pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        let master_key = *self
            .keys
            .get(&(kif, kvc))
            .ok_or_else(|| CryptoError::Logic(format!("unknown PIN key (kif={kif:#x}, kvc={kvc:#x})")))?;
        let key = derive_key(&master_key, b"PIN-VERIFY");
        let keystream = cmac_tag(&key, &card_challenge);
        let mut plaintext = [0u8; 8];
        plaintext[..4].copy_from_slice(pin);
        Ok(xor_bytes(&plaintext, &keystream[..8]))
    }

    fn cipher_pin_for_modification(
        &mut self,
        card_challenge: [u8; 8],
        current_pin: &[u8; 4],
        new_pin: &[u8; 4],
        kif: u8,
        kvc: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        let master_key = *self
            .keys
            .get(&(kif, kvc))
            .ok_or_else(|| CryptoError::Logic(format!("unknown PIN key (kif={kif:#x}, kvc={kvc:#x})")))?;
        let key = derive_key(&master_key, b"PIN-MODIFY");
        let keystream = cmac_tag(&key, &card_challenge);
        let mut plaintext = [0u8; 8];
        plaintext[..4].copy_from_slice(current_pin);
        plaintext[4..].copy_from_slice(new_pin);
        Ok(xor_bytes(&plaintext, &keystream[..8]))
    }

    fn compute_sv_command_security_data(
        &mut self,
        input: SvCommandSecurityInput,
    ) -> Result<SvSecurityData, CryptoError> {
        let key = *self.mac_key()?;
        self.sv_transaction_number += 1;
        let tnum = self.sv_transaction_number;

        let mut mac_input = Vec::new();
        mac_input.extend_from_slice(&input.sv_get_header);
        mac_input.extend_from_slice(&input.sv_get_data);
        mac_input.extend_from_slice(&input.sv_command_partial_request);
        let tag = cmac_tag(&key, &mac_input);

        Ok(SvSecurityData {
            sam_id: self.sam_id,
            challenge: [self.sam_challenge[0], self.sam_challenge[1], self.sam_challenge[2]],
            transaction_number: [(tnum >> 16) as u8, (tnum >> 8) as u8, tnum as u8],
            mac: tag[..5].to_vec(),
        })
    }

    fn generate_ciphered_card_key(
        &mut self,
        card_challenge: [u8; 8],
        issuer_kif: u8,
        issuer_kvc: u8,
        new_kif: u8,
        new_kvc: u8,
    ) -> Result<[u8; 32], CryptoError> {
        let issuer_key = *self.keys.get(&(issuer_kif, issuer_kvc)).ok_or_else(|| {
            CryptoError::Logic(format!(
                "unknown issuer key (kif={issuer_kif:#x}, kvc={issuer_kvc:#x})"
            ))
        })?;
        let new_key = *self
            .keys
            .get(&(new_kif, new_kvc))
            .ok_or_else(|| CryptoError::Logic(format!("unknown new key (kif={new_kif:#x}, kvc={new_kvc:#x})")))?;

        let wrap_key = derive_key(&issuer_key, &card_challenge);
        let iv = [0u8; 16];
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&cbc_transform(&wrap_key, &iv, &new_key, true));
        out[16..].copy_from_slice(&cmac_tag(&wrap_key, &new_key));
        Ok(out)
    }

    fn pre_init_terminal_secure_session_context(&mut self) -> Result<(), CryptoError> {
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), CryptoError> {
        Ok(())
    }
}

/// A test/demo certificate format: `type_byte || pubkey(33) || payload || signature(64)`.
pub struct MockCertificateParser;

impl CertificateParser for MockCertificateParser {
    fn parse(&self, raw: &[u8]) -> Result<ParsedCertificate, CryptoError> {
        if raw.len() < 1 + 33 + 64 {
            return Err(CryptoError::Logic("certificate too short".into()));
        }
        Ok(ParsedCertificate {
            type_byte: raw[0],
            content: raw[1..].to_vec(),
        })
    }
}

/// Registry with a single parser type, sufficient for PKI-mode tests.
pub struct MockCertificateParserRegistry;

impl CertificateParserRegistry for MockCertificateParserRegistry {
    fn get_card_certificate_parser(&self, _type_byte: u8) -> Option<&dyn CertificateParser> {
        Some(&MockCertificateParser)
    }

    fn get_ca_certificate_parser(&self, _type_byte: u8) -> Option<&dyn CertificateParser> {
        Some(&MockCertificateParser)
    }
}

/// A test/demo stand-in for a PKI-mode asymmetric provider, implementing
/// [`AsymmetricCryptoProvider`] over ECDSA P-256, repurposed here for
/// certificate-chain verification
/// instead of HSM object signing).
#[derive(Default)]
pub struct MockAsymmetricProvider;

impl MockAsymmetricProvider {
    fn verify(content_with_signature: &[u8], parent_public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if content_with_signature.len() < 64 {
            return Err(CryptoError::Logic("certificate payload too short for signature".into()));
        }
        let split = content_with_signature.len() - 64;
        let (payload, signature_bytes) = content_with_signature.split_at(split);

        let verifying_key = VerifyingKey::from_sec1_bytes(parent_public_key)
            .map_err(|e| CryptoError::Logic(format!("invalid parent public key: {e}")))?;
        let signature = Signature::from_slice(signature_bytes)
            .map_err(|e| CryptoError::Logic(format!("invalid signature encoding: {e}")))?;

        verifying_key
            .verify(payload, &signature)
            .map_err(|_| CryptoError::Logic("certificate signature verification failed".into()))?;

        Ok(payload.to_vec())
    }
}

impl AsymmetricCryptoProvider for MockAsymmetricProvider {
    fn create_card_transaction_manager(&mut self) -> Result<(), CryptoError> {
        Ok(())
    }

    fn check_certificate_and_get_content(
        &mut self,
        certificate: &ParsedCertificate,
        parent_content: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        Self::verify(&certificate.content, parent_content)
    }

    fn check_certificate_and_get_public_key(
        &mut self,
        certificate: &ParsedCertificate,
        parent_content: &[u8],
        card_identifier: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = Self::verify(&certificate.content, parent_content)?;
        if payload.len() < 33 + card_identifier.len() {
            return Err(CryptoError::Logic("certificate payload missing public key".into()));
        }
        Ok(payload[..33].to_vec())
    }
}

/// Build a self-signed test key pair, returning `(signing_key, sec1_public_key_bytes)`.
pub fn generate_test_key_pair(seed: &[u8; 32]) -> (SigningKey, Vec<u8>) {
    let signing_key = SigningKey::from_bytes(seed.into()).expect("valid scalar");
    let verifying_key = VerifyingKey::from(&signing_key);
    let public_key = verifying_key.to_encoded_point(true).as_bytes().to_vec();
    (signing_key, public_key)
}

/// Sign `payload` with `signing_key`, returning `payload || signature`
/// in the [`MockCertificateParser`] wire format (minus the leading type
/// byte and public key, which the caller prepends).
pub fn sign_certificate_payload(signing_key: &SigningKey, payload: &[u8]) -> Vec<u8> {
    let signature: Signature = signing_key.sign(payload);
    let mut out = payload.to_vec();
    out.extend_from_slice(&signature.to_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> MockSamProvider {
        MockSamProvider::with_single_key([0xAA, 0xBB, 0xCC, 0xDD], 0x21, 0x79, [0x42; 16])
    }

    #[test]
    fn mac_chain_is_deterministic_given_same_inputs() {
        let mut a = provider();
        let mut b = provider();
        a.init_terminal_secure_session_context().unwrap();
        b.init_terminal_secure_session_context().unwrap();
        a.init_terminal_session_mac(&[1, 2, 3], AccessLevel::Debit, 0x21, 0x79)
            .unwrap();
        b.init_terminal_session_mac(&[1, 2, 3], AccessLevel::Debit, 0x21, 0x79)
            .unwrap();
        a.update_terminal_session_mac(&[4, 5, 6]).unwrap();
        b.update_terminal_session_mac(&[4, 5, 6]).unwrap();
        assert_eq!(
            a.finalize_terminal_session_mac().unwrap(),
            b.finalize_terminal_session_mac().unwrap()
        );
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut p = provider();
        p.init_terminal_secure_session_context().unwrap();
        let err = p
            .init_terminal_session_mac(&[], AccessLevel::Debit, 0x00, 0x00)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Logic(_)));
    }

    #[test]
    fn encryption_roundtrips_through_cbc() {
        let mut p = provider();
        p.init_terminal_secure_session_context().unwrap();
        p.init_terminal_session_mac(&[1, 2, 3], AccessLevel::Debit, 0x21, 0x79)
            .unwrap();
        p.activate_encryption().unwrap();
        let ciphered = p.update_terminal_session_mac(b"hello calypso!!!").unwrap();
        assert_ne!(ciphered, b"hello calypso!!!");
        assert_eq!(ciphered.len(), "hello calypso!!!".len());
    }

    #[test]
    fn certificate_chain_verifies_with_matching_key() {
        let (ca_key, ca_pub) = generate_test_key_pair(&[7u8; 32]);
        let mut payload = vec![0u8; 33];
        payload[0] = 0x02;
        let signed = sign_certificate_payload(&ca_key, &payload);
        let certificate = ParsedCertificate {
            type_byte: 0x01,
            content: signed,
        };

        let mut provider = MockAsymmetricProvider;
        let content = provider
            .check_certificate_and_get_content(&certificate, &ca_pub)
            .unwrap();
        assert_eq!(content, payload);
    }

    #[test]
    fn certificate_chain_rejects_wrong_key() {
        let (ca_key, _ca_pub) = generate_test_key_pair(&[7u8; 32]);
        let (_other_key, other_pub) = generate_test_key_pair(&[9u8; 32]);
        let payload = vec![0u8; 33];
        let signed = sign_certificate_payload(&ca_key, &payload);
        let certificate = ParsedCertificate {
            type_byte: 0x01,
            content: signed,
        };

        let mut provider = MockAsymmetricProvider;
        assert!(provider
            .check_certificate_and_get_content(&certificate, &other_pub)
            .is_err());
    }
}
