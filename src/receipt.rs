//! Consumption Receipts
//!
//! A receipt is a signed record of one successful billable call, verifiable
//! by the caller without contacting the gate. The signed byte sequence is
//! authoritative: issuance and verification both produce it through the
//! same canonical writer, so the bytes checked are the bytes signed.
//!
//! Cost rules:
//! - per-minute pricing with a known duration bills whole minutes (ceiling)
//! - otherwise per-call pricing times units
//! - otherwise zero
//! - platform fee is ceil(cost * basis_points / 10_000)

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::{decode_hex, encode_hex, receipt_signing_payload};
use crate::constraints::{keys, ConstraintMap};
use crate::error::codes;
use crate::{GateError, Result};

/// What was consumed, priced in integer cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumption {
    pub units: u64,
    pub cost_cents: i64,
    pub platform_fee_cents: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Detached signature over the canonical receipt payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proof {
    pub key_id: String,
    pub signature: String,
}

/// A signed consumption attestation.
///
/// Field declaration order matches the canonical signing payload; `proof`
/// is excluded from the signed bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(rename = "type")]
    pub kind: String,
    pub receipt_id: String,
    pub gate_id: String,
    pub subject_id: String,
    pub passport_id: String,
    pub permission_key: String,
    pub catalog_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_nonce: Option<String>,
    /// Pricing and platform-fee snapshot the cost was computed from.
    pub effective_constraints: ConstraintMap,
    pub consumption: Consumption,
    pub proof: Proof,
}

pub const RECEIPT_TYPE: &str = "consumption";

/// Inputs to receipt issuance.
#[derive(Debug, Clone)]
pub struct IssueParams {
    pub gate_id: String,
    pub subject_id: String,
    pub passport_id: String,
    pub permission_key: String,
    pub catalog_version: u32,
    /// Effective constraints at decision time; only `commerce:` terms are
    /// snapshotted into the receipt.
    pub effective_constraints: ConstraintMap,
    pub request_nonce: Option<String>,
    pub duration_ms: Option<u64>,
    pub units: u64,
    pub timestamp: DateTime<Utc>,
}

/// Issue and sign a receipt. `sign` gets the canonical payload bytes and
/// returns the raw signature bytes.
pub fn issue<F>(params: IssueParams, sign: F, key_id: &str) -> Result<Receipt>
where
    F: Fn(&[u8]) -> Vec<u8>,
{
    let snapshot: ConstraintMap = params
        .effective_constraints
        .iter()
        .filter(|(k, _)| k.starts_with("commerce:"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let (cost_cents, platform_fee_cents) =
        compute_cost(&snapshot, params.units, params.duration_ms)?;

    let mut receipt = Receipt {
        kind: RECEIPT_TYPE.to_string(),
        receipt_id: format!("rcpt_{}", Uuid::new_v4().simple()),
        gate_id: params.gate_id,
        subject_id: params.subject_id,
        passport_id: params.passport_id,
        permission_key: params.permission_key,
        catalog_version: params.catalog_version,
        request_nonce: params.request_nonce,
        effective_constraints: snapshot,
        consumption: Consumption {
            units: params.units,
            cost_cents,
            platform_fee_cents,
            timestamp: params.timestamp,
            duration_ms: params.duration_ms,
        },
        proof: Proof {
            key_id: String::new(),
            signature: String::new(),
        },
    };

    let payload = receipt_signing_payload(&receipt)?;
    receipt.proof = Proof {
        key_id: key_id.to_string(),
        signature: encode_hex(&sign(&payload)),
    };
    Ok(receipt)
}

/// Why a receipt failed verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiptError {
    #[error("receipt nonce does not match the expected nonce")]
    NonceMismatch,

    #[error("receipt signature verification failed")]
    SignatureMismatch,

    #[error("cost_cents is {found}, pricing snapshot reconstructs {expected}")]
    CostMismatch { expected: i64, found: i64 },

    #[error("platform_fee_cents is {found}, pricing snapshot reconstructs {expected}")]
    PlatformFeeMismatch { expected: i64, found: i64 },
}

impl ReceiptError {
    pub fn code(&self) -> &'static str {
        match self {
            ReceiptError::NonceMismatch => codes::NONCE_MISMATCH,
            ReceiptError::SignatureMismatch => codes::SIGNATURE_MISMATCH,
            ReceiptError::CostMismatch { .. } => codes::COST_MISMATCH,
            ReceiptError::PlatformFeeMismatch { .. } => codes::PLATFORM_FEE_MISMATCH,
        }
    }
}

/// Verify a receipt: nonce echo, signature over the reconstructed canonical
/// payload, then cost and fee reconstruction from the receipt's own
/// snapshot. `verify_sig(payload, signature)` reports signature validity.
pub fn verify<F>(
    receipt: &Receipt,
    expected_nonce: Option<&str>,
    verify_sig: F,
) -> std::result::Result<(), ReceiptError>
where
    F: Fn(&[u8], &[u8]) -> bool,
{
    if let Some(expected) = expected_nonce {
        if receipt.request_nonce.as_deref() != Some(expected) {
            return Err(ReceiptError::NonceMismatch);
        }
    }

    let payload = receipt_signing_payload(receipt).map_err(|_| ReceiptError::SignatureMismatch)?;
    let sig_bytes =
        decode_hex(&receipt.proof.signature).map_err(|_| ReceiptError::SignatureMismatch)?;
    if !verify_sig(&payload, &sig_bytes) {
        return Err(ReceiptError::SignatureMismatch);
    }

    let (cost, fee) = compute_cost(
        &receipt.effective_constraints,
        receipt.consumption.units,
        receipt.consumption.duration_ms,
    )
    .map_err(|_| ReceiptError::SignatureMismatch)?;
    if receipt.consumption.cost_cents != cost {
        return Err(ReceiptError::CostMismatch {
            expected: cost,
            found: receipt.consumption.cost_cents,
        });
    }
    if receipt.consumption.platform_fee_cents != fee {
        return Err(ReceiptError::PlatformFeeMismatch {
            expected: fee,
            found: receipt.consumption.platform_fee_cents,
        });
    }
    Ok(())
}

/// Verify against a gate public key.
pub fn verify_with_key(
    receipt: &Receipt,
    expected_nonce: Option<&str>,
    gate_key: &VerifyingKey,
) -> std::result::Result<(), ReceiptError> {
    verify(receipt, expected_nonce, |payload, sig| {
        Signature::from_slice(sig)
            .map(|s| gate_key.verify(payload, &s).is_ok())
            .unwrap_or(false)
    })
}

fn term_int(constraints: &ConstraintMap, key: &str) -> Option<i64> {
    constraints.get(key).and_then(Value::as_i64)
}

fn compute_cost(
    constraints: &ConstraintMap,
    units: u64,
    duration_ms: Option<u64>,
) -> Result<(i64, i64)> {
    let model = constraints
        .get(keys::PRICING_MODEL)
        .and_then(Value::as_str)
        .unwrap_or("per_call");

    let cost = if model == "per_minute" && duration_ms.is_some() {
        match term_int(constraints, keys::PRICING_PER_MINUTE_CENTS) {
            Some(per_minute) => {
                let minutes = duration_ms.unwrap_or(0).div_ceil(60_000) as i64;
                per_minute.checked_mul(minutes).ok_or(GateError::Overflow)?
            }
            None => 0,
        }
    } else {
        match term_int(constraints, keys::PRICING_PER_CALL_CENTS) {
            Some(per_call) => per_call
                .checked_mul(units as i64)
                .ok_or(GateError::Overflow)?,
            None => 0,
        }
    };

    let fee = match term_int(constraints, keys::PLATFORM_FEE_BASIS_POINTS) {
        Some(bps) => {
            let product = cost.checked_mul(bps).ok_or(GateError::Overflow)?;
            // Ceiling division is normative for the fee.
            (product + 9_999) / 10_000
        }
        None => 0,
    };

    Ok((cost, fee))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;

    fn pricing(per_call: i64, bps: i64) -> ConstraintMap {
        [
            (keys::PRICING_PER_CALL_CENTS.to_string(), json!(per_call)),
            (keys::PLATFORM_FEE_BASIS_POINTS.to_string(), json!(bps)),
        ]
        .into_iter()
        .collect()
    }

    fn params(effective: ConstraintMap) -> IssueParams {
        IssueParams {
            gate_id: "gate_travel".into(),
            subject_id: "agent_7".into(),
            passport_id: "ppt_1".into(),
            permission_key: "flights:book".into(),
            catalog_version: 5,
            effective_constraints: effective,
            request_nonce: Some("nonce_1".into()),
            duration_ms: None,
            units: 1,
            timestamp: Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    fn issue_signed(effective: ConstraintMap) -> (Receipt, SigningKey) {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let receipt = issue(
            params(effective),
            |payload| key.sign(payload).to_bytes().to_vec(),
            "gate_key_1",
        )
        .unwrap();
        (receipt, key)
    }

    #[test]
    fn test_issue_verify_roundtrip() {
        // Scenario E: 10 cents per call, 200 bps fee -> cost 10, fee 1.
        let (receipt, key) = issue_signed(pricing(10, 200));
        assert_eq!(receipt.consumption.cost_cents, 10);
        assert_eq!(receipt.consumption.platform_fee_cents, 1);
        assert_eq!(receipt.kind, RECEIPT_TYPE);
        assert_eq!(receipt.proof.key_id, "gate_key_1");
        assert!(verify_with_key(&receipt, Some("nonce_1"), &key.verifying_key()).is_ok());
        assert!(verify_with_key(&receipt, None, &key.verifying_key()).is_ok());
    }

    #[test]
    fn test_wrong_nonce_rejected() {
        let (receipt, key) = issue_signed(pricing(10, 200));
        assert_eq!(
            verify_with_key(&receipt, Some("nonce_other"), &key.verifying_key()),
            Err(ReceiptError::NonceMismatch)
        );
    }

    #[test]
    fn test_tampered_cost_detected() {
        let (mut receipt, key) = issue_signed(pricing(10, 200));
        receipt.consumption.cost_cents = 11;
        // The signature breaks first; the reconstruction check is what names
        // the field once an attacker also re-signs.
        assert_eq!(
            verify_with_key(&receipt, Some("nonce_1"), &key.verifying_key()),
            Err(ReceiptError::SignatureMismatch)
        );

        let resigned = {
            let payload = receipt_signing_payload(&receipt).unwrap();
            receipt.proof.signature = encode_hex(&key.sign(&payload).to_bytes());
            receipt
        };
        assert_eq!(
            verify_with_key(&resigned, Some("nonce_1"), &key.verifying_key()),
            Err(ReceiptError::CostMismatch {
                expected: 10,
                found: 11
            })
        );
    }

    #[test]
    fn test_tampered_fee_detected() {
        let (mut receipt, key) = issue_signed(pricing(10, 200));
        receipt.consumption.platform_fee_cents = 0;
        let payload = receipt_signing_payload(&receipt).unwrap();
        receipt.proof.signature = encode_hex(&key.sign(&payload).to_bytes());
        assert_eq!(
            verify_with_key(&receipt, Some("nonce_1"), &key.verifying_key()),
            Err(ReceiptError::PlatformFeeMismatch {
                expected: 1,
                found: 0
            })
        );
    }

    #[test]
    fn test_tampered_snapshot_detected() {
        let (mut receipt, key) = issue_signed(pricing(10, 200));
        receipt
            .effective_constraints
            .insert(keys::PRICING_PER_CALL_CENTS.to_string(), json!(1));
        let result = verify_with_key(&receipt, Some("nonce_1"), &key.verifying_key());
        assert_eq!(result, Err(ReceiptError::SignatureMismatch));
    }

    #[test]
    fn test_per_minute_pricing_bills_whole_minutes() {
        let effective: ConstraintMap = [
            (keys::PRICING_MODEL.to_string(), json!("per_minute")),
            (keys::PRICING_PER_MINUTE_CENTS.to_string(), json!(30)),
        ]
        .into_iter()
        .collect();
        let mut p = params(effective);
        p.duration_ms = Some(61_000);
        let key = SigningKey::generate(&mut rand::thread_rng());
        let receipt = issue(p, |b| key.sign(b).to_bytes().to_vec(), "k1").unwrap();
        // 61s rounds up to 2 minutes.
        assert_eq!(receipt.consumption.cost_cents, 60);
        assert!(verify_with_key(&receipt, Some("nonce_1"), &key.verifying_key()).is_ok());
    }

    #[test]
    fn test_no_pricing_means_zero_cost() {
        let (receipt, key) = issue_signed(ConstraintMap::new());
        assert_eq!(receipt.consumption.cost_cents, 0);
        assert_eq!(receipt.consumption.platform_fee_cents, 0);
        assert!(verify_with_key(&receipt, Some("nonce_1"), &key.verifying_key()).is_ok());
    }

    #[test]
    fn test_fee_rounds_up() {
        // 33 cents at 100 bps = 0.33 cents -> 1 cent.
        let (receipt, _) = issue_signed(pricing(33, 100));
        assert_eq!(receipt.consumption.platform_fee_cents, 1);
    }

    #[test]
    fn test_units_multiply_per_call() {
        let mut p = params(pricing(10, 0));
        p.units = 4;
        let key = SigningKey::generate(&mut rand::thread_rng());
        let receipt = issue(p, |b| key.sign(b).to_bytes().to_vec(), "k1").unwrap();
        assert_eq!(receipt.consumption.cost_cents, 40);
    }

    #[test]
    fn test_limit_constraints_not_snapshotted() {
        let mut effective = pricing(10, 200);
        effective.insert(keys::COST_MAX_PER_ACTION.to_string(), json!(100_000));
        let (receipt, _) = issue_signed(effective);
        assert!(!receipt
            .effective_constraints
            .contains_key(keys::COST_MAX_PER_ACTION));
        assert!(receipt
            .effective_constraints
            .contains_key(keys::PRICING_PER_CALL_CENTS));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ReceiptError::NonceMismatch.code(), codes::NONCE_MISMATCH);
        assert_eq!(
            ReceiptError::CostMismatch {
                expected: 1,
                found: 2
            }
            .code(),
            codes::COST_MISMATCH
        );
    }
}
