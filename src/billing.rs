//! Billing Aggregation
//!
//! Sums a homogeneous batch of consumption receipts into one period record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::receipt::Receipt;
use crate::{GateError, Result};

/// One settled billing period for a (subject, gate) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub subject_id: String,
    pub gate_id: String,
    pub total_calls: u64,
    pub total_cost_cents: i64,
    pub total_platform_fee_cents: i64,
    pub receipt_ids: Vec<String>,
}

/// Aggregate receipts into a period record. All receipts must share one
/// subject and one gate; an empty batch yields `None`.
pub fn aggregate(
    receipts: &[Receipt],
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Result<Option<BillingPeriod>> {
    let first = match receipts.first() {
        Some(r) => r,
        None => return Ok(None),
    };

    let mut period = BillingPeriod {
        period_start,
        period_end,
        subject_id: first.subject_id.clone(),
        gate_id: first.gate_id.clone(),
        total_calls: 0,
        total_cost_cents: 0,
        total_platform_fee_cents: 0,
        receipt_ids: Vec::with_capacity(receipts.len()),
    };

    for receipt in receipts {
        if receipt.subject_id != period.subject_id || receipt.gate_id != period.gate_id {
            return Err(GateError::MixedReceipts(format!(
                "receipt {} is for {}@{}, batch is for {}@{}",
                receipt.receipt_id,
                receipt.subject_id,
                receipt.gate_id,
                period.subject_id,
                period.gate_id
            )));
        }
        period.total_calls += receipt.consumption.units;
        period.total_cost_cents += receipt.consumption.cost_cents;
        period.total_platform_fee_cents += receipt.consumption.platform_fee_cents;
        period.receipt_ids.push(receipt.receipt_id.clone());
    }

    Ok(Some(period))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::{Consumption, Proof, RECEIPT_TYPE};
    use chrono::TimeZone;

    fn receipt(id: &str, subject: &str, gate: &str, units: u64, cost: i64, fee: i64) -> Receipt {
        Receipt {
            kind: RECEIPT_TYPE.to_string(),
            receipt_id: id.into(),
            gate_id: gate.into(),
            subject_id: subject.into(),
            passport_id: "ppt_1".into(),
            permission_key: "flights:book".into(),
            catalog_version: 5,
            request_nonce: None,
            effective_constraints: Default::default(),
            consumption: Consumption {
                units,
                cost_cents: cost,
                platform_fee_cents: fee,
                timestamp: Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
                duration_ms: None,
            },
            proof: Proof {
                key_id: "k1".into(),
                signature: String::new(),
            },
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_empty_batch_is_none() {
        let (start, end) = window();
        assert_eq!(aggregate(&[], start, end).unwrap(), None);
    }

    #[test]
    fn test_sums() {
        let (start, end) = window();
        let receipts = vec![
            receipt("r1", "agent_7", "gate_travel", 1, 10, 1),
            receipt("r2", "agent_7", "gate_travel", 3, 30, 1),
        ];
        let period = aggregate(&receipts, start, end).unwrap().unwrap();
        assert_eq!(period.total_calls, 4);
        assert_eq!(period.total_cost_cents, 40);
        assert_eq!(period.total_platform_fee_cents, 2);
        assert_eq!(period.receipt_ids, vec!["r1", "r2"]);
        assert_eq!(period.subject_id, "agent_7");
    }

    #[test]
    fn test_mixed_subject_rejected() {
        let (start, end) = window();
        let receipts = vec![
            receipt("r1", "agent_7", "gate_travel", 1, 10, 1),
            receipt("r2", "agent_8", "gate_travel", 1, 10, 1),
        ];
        assert!(matches!(
            aggregate(&receipts, start, end),
            Err(GateError::MixedReceipts(_))
        ));
    }

    #[test]
    fn test_mixed_gate_rejected() {
        let (start, end) = window();
        let receipts = vec![
            receipt("r1", "agent_7", "gate_travel", 1, 10, 1),
            receipt("r2", "agent_7", "gate_other", 1, 10, 1),
        ];
        assert!(aggregate(&receipts, start, end).is_err());
    }
}
