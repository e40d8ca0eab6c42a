//! Canonical payload serialization
//!
//! Signatures are bound to exact byte sequences, so payload serialization
//! is centralized here. The rules:
//! - Fields in the fixed order given below, never map order
//! - Absent optional fields are omitted, not null
//! - Compact JSON, no whitespace
//! - Timestamps as RFC 3339 UTC
//! - Constraint maps serialize with sorted keys (BTreeMap)
//!
//! Any drift in these rules invalidates every signature in the field.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::constraints::ConstraintMap;
use crate::credential::{Claim, Passport};
use crate::receipt::{Consumption, Receipt};
use crate::{GateError, Result};

/// Passport signing payload, field order fixed:
/// passport_id, issuer_id, subject_id, gate_id, claims, constraints,
/// expires_at, issued_at, catalog_version_pin.
#[derive(Serialize)]
struct PassportPayload<'a> {
    passport_id: &'a str,
    issuer_id: &'a str,
    subject_id: &'a str,
    gate_id: &'a str,
    claims: &'a [Claim],
    constraints: &'a ConstraintMap,
    expires_at: &'a DateTime<Utc>,
    issued_at: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog_version_pin: Option<&'a BTreeMap<String, u32>>,
}

/// The exact bytes a passport signature covers.
pub fn passport_signing_payload(passport: &Passport) -> Result<Vec<u8>> {
    let payload = PassportPayload {
        passport_id: &passport.passport_id,
        issuer_id: &passport.issuer_id,
        subject_id: &passport.subject_id,
        gate_id: &passport.gate_id,
        claims: &passport.claims,
        constraints: &passport.constraints,
        expires_at: &passport.expires_at,
        issued_at: &passport.issued_at,
        catalog_version_pin: passport.catalog_version_pin.as_ref(),
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Receipt signing payload: the receipt with `proof` excluded, field order
/// fixed as declared.
#[derive(Serialize)]
struct ReceiptPayload<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    receipt_id: &'a str,
    gate_id: &'a str,
    subject_id: &'a str,
    passport_id: &'a str,
    permission_key: &'a str,
    catalog_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_nonce: Option<&'a str>,
    effective_constraints: &'a ConstraintMap,
    consumption: &'a Consumption,
}

/// The exact bytes a receipt proof covers.
pub fn receipt_signing_payload(receipt: &Receipt) -> Result<Vec<u8>> {
    let payload = ReceiptPayload {
        kind: &receipt.kind,
        receipt_id: &receipt.receipt_id,
        gate_id: &receipt.gate_id,
        subject_id: &receipt.subject_id,
        passport_id: &receipt.passport_id,
        permission_key: &receipt.permission_key,
        catalog_version: receipt.catalog_version,
        request_nonce: receipt.request_nonce.as_deref(),
        effective_constraints: &receipt.effective_constraints,
        consumption: &receipt.consumption,
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Decode a hex string, tolerating an optional `0x`/`0X` prefix.
pub fn decode_hex(input: &str) -> Result<Vec<u8>> {
    let stripped = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    hex::decode(stripped).map_err(|e| GateError::InvalidSignatureEncoding(e.to_string()))
}

/// Lowercase hex without a prefix.
pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn passport() -> Passport {
        Passport {
            passport_id: "ppt_1".into(),
            issuer_id: "issuer_a".into(),
            subject_id: "agent_7".into(),
            gate_id: "gate_travel".into(),
            claims: vec![Claim {
                key: "flights:search".into(),
                constraints: ConstraintMap::new(),
            }],
            constraints: [("core:cost:max_per_action".to_string(), json!(500))]
                .into_iter()
                .collect(),
            expires_at: Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap(),
            issued_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            catalog_version_pin: None,
            signature: "ignored".into(),
        }
    }

    #[test]
    fn test_field_order_is_fixed() {
        let bytes = passport_signing_payload(&passport()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let order = [
            "passport_id",
            "issuer_id",
            "subject_id",
            "gate_id",
            "claims",
            "constraints",
            "expires_at",
            "issued_at",
        ];
        let mut last = 0;
        for field in order {
            let pos = text.find(&format!("\"{}\"", field)).unwrap();
            assert!(pos >= last, "{} out of order in {}", field, text);
            last = pos;
        }
    }

    #[test]
    fn test_absent_pin_is_omitted() {
        let text =
            String::from_utf8(passport_signing_payload(&passport()).unwrap()).unwrap();
        assert!(!text.contains("catalog_version_pin"));

        let mut p = passport();
        p.catalog_version_pin = Some([("gate_travel".to_string(), 2u32)].into_iter().collect());
        let text = String::from_utf8(passport_signing_payload(&p).unwrap()).unwrap();
        assert!(text.contains("\"catalog_version_pin\":{\"gate_travel\":2}"));
    }

    #[test]
    fn test_signature_not_in_payload() {
        let text =
            String::from_utf8(passport_signing_payload(&passport()).unwrap()).unwrap();
        assert!(!text.contains("ignored"));
        assert!(!text.contains("\"signature\""));
    }

    #[test]
    fn test_payload_is_compact() {
        let text =
            String::from_utf8(passport_signing_payload(&passport()).unwrap()).unwrap();
        assert!(!text.contains(": "));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn test_hex_prefix_tolerated() {
        assert_eq!(decode_hex("0a0b").unwrap(), vec![0x0a, 0x0b]);
        assert_eq!(decode_hex("0x0a0b").unwrap(), vec![0x0a, 0x0b]);
        assert_eq!(decode_hex("0X0A0B").unwrap(), vec![0x0a, 0x0b]);
        assert!(decode_hex("zz").is_err());
    }
}
