//! Passport Signature Verification (Ed25519)
//!
//! Verifies the detached Ed25519 signature over the canonical passport
//! payload, using precomputed public-key material from the cache. No
//! network, no per-call key parsing.
//!
//! This is a crypto hot path - runs on every credentialed call.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::canonical::{decode_hex, passport_signing_payload};
use crate::credential::Passport;
use crate::{GateError, Result};

/// Issuer id to prepared verification key. Built once per key refresh.
pub type IssuerKeyMap = HashMap<String, VerifyingKey>;

/// Parse a hex-encoded Ed25519 public key (optional `0x` prefix).
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = decode_hex(hex_key)?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| GateError::InvalidKeyMaterial(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| GateError::InvalidKeyMaterial(e.to_string()))
}

/// `sha256:<hex>` fingerprint of a verifying key. Used as the receipt key
/// id when none is configured.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{:x}", Sha256::digest(key.as_bytes()))
}

/// Verify a passport signature against a prepared issuer key.
pub fn verify_passport(passport: &Passport, key: &VerifyingKey) -> Result<()> {
    let payload = passport_signing_payload(passport)?;
    let sig_bytes = decode_hex(&passport.signature)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| GateError::SignatureInvalid)?;
    key.verify(&payload, &signature)
        .map_err(|_| GateError::SignatureInvalid)
}
