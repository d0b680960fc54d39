//! # Record Authentication
//!
//! Stored values can be bound to their publisher with an envelope that
//! travels as the DHT value itself:
//!
//! ```text
//! base32(signature) | value | public-key-material
//! ```
//!
//! The separator is the literal ASCII `|` byte. The signature covers
//! `value | public-key-material`, so neither half can be swapped without
//! breaking it. Key material is the hex encoding of the publisher's 32-byte
//! Ed25519 public key; the signature text is base32 so it can also appear
//! inside case-insensitive query names.
//!
//! A verifier does not need to know the publisher's key in advance - the
//! envelope carries it, and the query name pins `blake3(material)`, so a
//! substituted key is caught before the signature is ever checked.
//!
//! ## Fragile contract
//!
//! The envelope is split on the raw separator byte. Base32 signature text
//! and hex key material can never contain `|`, but the value could; such a
//! value corrupts the split and fails verification. Publishers must keep
//! the separator out of their values.

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use tracing::{debug, error};

/// Separator byte between envelope fields.
pub const ENVELOPE_SEPARATOR: u8 = b'|';

/// Length of a public-key hash in bytes.
pub const PUBLIC_KEY_HASH_LEN: usize = 32;

/// A publisher's Ed25519 signing keypair.
///
/// Distinct from node identity: a node relays whatever entries it holds,
/// while a publisher keypair vouches for the content of specific records.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The key material as it appears inside envelopes.
    pub fn public_material(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Hash a consumer embeds (base32-encoded) in `.key`-style query names
    /// to pin this publisher.
    pub fn public_key_hash(&self) -> [u8; PUBLIC_KEY_HASH_LEN] {
        public_key_hash(self.public_material().as_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_material())
            .finish_non_exhaustive()
    }
}

/// Hash of public-key material as it appears in an envelope.
pub fn public_key_hash(material: &[u8]) -> [u8; PUBLIC_KEY_HASH_LEN] {
    *blake3::hash(material).as_bytes()
}

/// Sign `value` with a publisher keypair, producing the envelope bytes to
/// store in the DHT.
///
/// The fresh signature is self-verified both against the signing key's own
/// verifying key and against the key re-parsed from the envelope material;
/// if either check fails, a cryptography failure is logged and an empty
/// result returned rather than an unverifiable envelope.
pub fn sign_record(keypair: &Keypair, value: &[u8]) -> Vec<u8> {
    let material = keypair.public_material();

    let mut signed = Vec::with_capacity(value.len() + 1 + material.len());
    signed.extend_from_slice(value);
    signed.push(ENVELOPE_SEPARATOR);
    signed.extend_from_slice(material.as_bytes());

    let signature = keypair.signing_key.sign(&signed);

    if keypair
        .signing_key
        .verifying_key()
        .verify(&signed, &signature)
        .is_err()
    {
        error!("cryptography failure: fresh signature rejected by the signing key");
        return Vec::new();
    }
    match parse_material(material.as_bytes()) {
        Some(reparsed) if reparsed.verify(&signed, &signature).is_ok() => {}
        _ => {
            error!("cryptography failure: fresh signature rejected by the published key material");
            return Vec::new();
        }
    }

    let signature_text = BASE32_NOPAD.encode(&signature.to_bytes());
    let mut envelope = Vec::with_capacity(signature_text.len() + 1 + signed.len());
    envelope.extend_from_slice(signature_text.as_bytes());
    envelope.push(ENVELOPE_SEPARATOR);
    envelope.extend_from_slice(&signed);
    envelope
}

/// Verify an envelope against the publisher hash pinned by the query.
///
/// Returns the enclosed value only when the carried key material hashes to
/// `expected_hash` *and* the signature verifies over
/// `value | material` under that key. Every failure returns `None` - a
/// wrong-but-non-`None` value is never produced.
pub fn verify_record(expected_hash: &[u8], envelope: &[u8]) -> Option<Vec<u8>> {
    let (signature_text, value, material) = split_envelope(envelope)?;

    let signature_bytes = match BASE32_NOPAD.decode(signature_text) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "envelope signature is not valid base32");
            return None;
        }
    };
    let signature_bytes: [u8; 64] = match signature_bytes.as_slice().try_into() {
        Ok(arr) => arr,
        Err(_) => {
            debug!(len = signature_bytes.len(), "envelope signature has wrong length");
            return None;
        }
    };
    let signature = Signature::from_bytes(&signature_bytes);

    if public_key_hash(material).as_slice() != expected_hash {
        debug!("envelope key material does not match the expected publisher hash");
        return None;
    }

    let key = match parse_material(material) {
        Some(key) => key,
        None => {
            debug!("envelope key material is not a valid public key");
            return None;
        }
    };

    let mut signed = Vec::with_capacity(value.len() + 1 + material.len());
    signed.extend_from_slice(value);
    signed.push(ENVELOPE_SEPARATOR);
    signed.extend_from_slice(material);

    if key.verify(&signed, &signature).is_err() {
        debug!("envelope signature does not verify");
        return None;
    }

    Some(value.to_vec())
}

/// Split an envelope into (signature text, value, key material).
///
/// Scans for the literal separator; a fourth separator, if present, ends
/// the key material and the remainder is ignored. Fewer than two
/// separators cannot form an envelope.
fn split_envelope(data: &[u8]) -> Option<(&[u8], &[u8], &[u8])> {
    let first = data.iter().position(|b| *b == ENVELOPE_SEPARATOR)?;
    let signature_text = &data[..first];

    let rest = &data[first + 1..];
    let second = rest.iter().position(|b| *b == ENVELOPE_SEPARATOR)?;
    let value = &rest[..second];

    let tail = &rest[second + 1..];
    let material = match tail.iter().position(|b| *b == ENVELOPE_SEPARATOR) {
        Some(third) => &tail[..third],
        None => tail,
    };

    Some((signature_text, value, material))
}

fn parse_material(material: &[u8]) -> Option<VerifyingKey> {
    let text = std::str::from_utf8(material).ok()?;
    let bytes = hex::decode(text).ok()?;
    let arr: [u8; 32] = bytes.as_slice().try_into().ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_returns_the_value() {
        let keypair = Keypair::generate();
        let value = b"record bytes";

        let envelope = sign_record(&keypair, value);
        assert!(!envelope.is_empty());

        let verified = verify_record(&keypair.public_key_hash(), &envelope);
        assert_eq!(verified.as_deref(), Some(&value[..]));
    }

    #[test]
    fn empty_value_roundtrips() {
        let keypair = Keypair::generate();
        let envelope = sign_record(&keypair, b"");
        assert_eq!(
            verify_record(&keypair.public_key_hash(), &envelope).as_deref(),
            Some(&b""[..])
        );
    }

    #[test]
    fn wrong_publisher_hash_is_rejected() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();

        let envelope = sign_record(&keypair, b"record");
        assert_eq!(verify_record(&other.public_key_hash(), &envelope), None);
    }

    #[test]
    fn tampered_value_is_rejected() {
        let keypair = Keypair::generate();
        let envelope = sign_record(&keypair, b"record");

        // Flip a byte inside the value region (after the first separator).
        let sep = envelope
            .iter()
            .position(|b| *b == ENVELOPE_SEPARATOR)
            .unwrap();
        let mut tampered = envelope.clone();
        tampered[sep + 1] ^= 0x01;

        assert_eq!(verify_record(&keypair.public_key_hash(), &tampered), None);
    }

    #[test]
    fn swapped_key_material_is_rejected() {
        // An attacker re-signs the value with their own key and presents
        // their material; the pinned hash catches the substitution.
        let publisher = Keypair::generate();
        let attacker = Keypair::generate();

        let forged = sign_record(&attacker, b"record");
        assert_eq!(verify_record(&publisher.public_key_hash(), &forged), None);
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let keypair = Keypair::generate();
        let envelope = sign_record(&keypair, b"record");

        // Replace the signature text with non-base32 noise of the same length.
        let sep = envelope
            .iter()
            .position(|b| *b == ENVELOPE_SEPARATOR)
            .unwrap();
        let mut tampered = envelope.clone();
        for byte in tampered[..sep].iter_mut() {
            *byte = b'!';
        }

        assert_eq!(verify_record(&keypair.public_key_hash(), &tampered), None);
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let keypair = Keypair::generate();
        let envelope = sign_record(&keypair, b"record");

        assert_eq!(
            verify_record(&keypair.public_key_hash(), &envelope[..envelope.len() / 2]),
            None
        );
        assert_eq!(verify_record(&keypair.public_key_hash(), b""), None);
        assert_eq!(verify_record(&keypair.public_key_hash(), b"no separators"), None);
    }

    #[test]
    fn separator_inside_value_breaks_verification() {
        // Documented fragile contract: the split is byte-literal, so a value
        // containing the separator cannot survive verification.
        let keypair = Keypair::generate();
        let envelope = sign_record(&keypair, b"left|right");

        assert_eq!(verify_record(&keypair.public_key_hash(), &envelope), None);
    }

    #[test]
    fn keypair_reconstruction_preserves_identity() {
        let original = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&original.secret_key_bytes());

        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());
        assert_eq!(original.public_key_hash(), restored.public_key_hash());

        let envelope = sign_record(&restored, b"value");
        assert!(verify_record(&original.public_key_hash(), &envelope).is_some());
    }
}
