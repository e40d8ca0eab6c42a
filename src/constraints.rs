//! Constraint Registry, Merge, and Evaluation
//!
//! Constraints are typed by key:
//! - limit keys (integers, usage bounds) merge by elementwise min
//! - term keys (commercial/agreement) always take the catalog value
//! - policy keys (booleans/lists) tighten: boolean restrictions OR together,
//!   otherwise the credential value refines the catalog default
//! - unknown keys pass the credential value through
//!
//! Evaluation runs six categories in a fixed order and aggregates with
//! BLOCK > SUSPEND > PERMIT. Term constraints never produce a verdict; they
//! only feed receipt pricing.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::ratelimit::{CumulativeCostTracker, RateLimiter};
use crate::{ConstraintDecision, GateError, Result};

/// A constraint mapping: key to JSON value, sorted for canonical output.
pub type ConstraintMap = BTreeMap<String, Value>;

/// The recognized constraint keys.
pub mod keys {
    // limit
    pub const COST_MAX_PER_ACTION: &str = "core:cost:max_per_action";
    /// Legacy spelling of [`COST_MAX_PER_ACTION`]; aliased at merge time.
    pub const COST_MAX_LEGACY: &str = "core:cost:max";
    pub const COST_MAX_CUMULATIVE: &str = "core:cost:max_cumulative";
    pub const COST_APPROVAL_THRESHOLD: &str = "core:cost:approval_threshold";
    pub const RATE_PER_MINUTE: &str = "core:rate:per_minute";
    pub const RATE_PER_HOUR: &str = "core:rate:per_hour";
    pub const RATE_PER_DAY: &str = "core:rate:per_day";

    // term
    pub const PRICING_MODEL: &str = "commerce:pricing:model";
    pub const PRICING_PER_CALL_CENTS: &str = "commerce:pricing:per_call_cents";
    pub const PRICING_PER_MINUTE_CENTS: &str = "commerce:pricing:per_minute_cents";
    pub const PRICING_CURRENCY: &str = "commerce:pricing:currency";
    pub const FREE_TIER_CALLS: &str = "commerce:free_tier:calls";
    pub const SLA_UPTIME_PERCENT: &str = "commerce:sla:uptime_percent";
    pub const SLA_RESPONSE_TIME_MS: &str = "commerce:sla:response_time_ms";
    pub const PLATFORM_FEE_BASIS_POINTS: &str = "commerce:platform_fee:basis_points";

    // policy
    pub const APPROVAL_REQUIRED: &str = "core:approval:required";
    pub const ACTION_ALLOWLIST: &str = "core:scope:action_allowlist";
    pub const ACTION_BLOCKLIST: &str = "core:scope:action_blocklist";
    pub const DOMAIN_ALLOWLIST: &str = "core:scope:domain_allowlist";
    pub const DOMAIN_BLOCKLIST: &str = "core:scope:domain_blocklist";
    pub const OPERATING_HOURS: &str = "core:time:operating_hours";
    pub const BLACKOUT_WINDOWS: &str = "core:time:blackout_windows";
    pub const DATA_READ_ONLY: &str = "core:data:read_only";
    pub const DATA_NO_PII_EXPORT: &str = "core:data:no_pii_export";
}

/// Obligation tokens attached to SUSPEND decisions. Plain strings so they
/// serialize into the wire decision and external workflow engines can act
/// on them.
pub mod obligations {
    pub const REQUIRE_APPROVAL: &str = "require_approval";
    pub const LOG_ACTION: &str = "log_action";
    pub const NOTIFY_OWNER: &str = "notify_owner";
}

/// Context value the cost category reads its canonical amount from.
pub const AMOUNT_CANONICAL: &str = "amount_canonical";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Limit,
    Term,
    Policy,
    Unknown,
}

/// Look up the type of a constraint key.
pub fn kind_of(key: &str) -> ConstraintKind {
    use keys::*;
    match key {
        COST_MAX_PER_ACTION | COST_MAX_LEGACY | COST_MAX_CUMULATIVE | COST_APPROVAL_THRESHOLD
        | RATE_PER_MINUTE | RATE_PER_HOUR | RATE_PER_DAY => ConstraintKind::Limit,
        PRICING_MODEL | PRICING_PER_CALL_CENTS | PRICING_PER_MINUTE_CENTS | PRICING_CURRENCY
        | FREE_TIER_CALLS | SLA_UPTIME_PERCENT | SLA_RESPONSE_TIME_MS
        | PLATFORM_FEE_BASIS_POINTS => ConstraintKind::Term,
        APPROVAL_REQUIRED | ACTION_ALLOWLIST | ACTION_BLOCKLIST | DOMAIN_ALLOWLIST
        | DOMAIN_BLOCKLIST | OPERATING_HOURS | BLACKOUT_WINDOWS | DATA_READ_ONLY
        | DATA_NO_PII_EXPORT => ConstraintKind::Policy,
        _ => ConstraintKind::Unknown,
    }
}

// `core:cost:max` is the deprecated spelling; both sides of a merge are
// normalized to the canonical key before the rules apply so the two names
// are never merged as distinct keys.
fn canonical_key(key: &str) -> &str {
    if key == keys::COST_MAX_LEGACY {
        tracing::warn!(key, "deprecated constraint key, use core:cost:max_per_action");
        keys::COST_MAX_PER_ACTION
    } else {
        key
    }
}

fn normalize_map(map: &ConstraintMap) -> ConstraintMap {
    map.iter()
        .map(|(k, v)| (canonical_key(k).to_string(), v.clone()))
        .collect()
}

fn limit_value(key: &str, value: &Value) -> Result<i64> {
    value.as_i64().ok_or_else(|| {
        GateError::ConstraintTypeError(format!("limit key {key} requires an integer, got {value}"))
    })
}

/// Merge catalog-default constraints with credential constraints into the
/// effective mapping.
pub fn merge(catalog: &ConstraintMap, credential: &ConstraintMap) -> Result<ConstraintMap> {
    let catalog = normalize_map(catalog);
    let credential = normalize_map(credential);

    let mut effective = ConstraintMap::new();
    let all_keys = catalog.keys().chain(credential.keys());

    for key in all_keys {
        if effective.contains_key(key) {
            continue;
        }
        let cat = catalog.get(key);
        let cred = credential.get(key);

        let value = match kind_of(key) {
            ConstraintKind::Limit => match (cat, cred) {
                (Some(a), Some(b)) => {
                    let merged = limit_value(key, a)?.min(limit_value(key, b)?);
                    Some(Value::from(merged))
                }
                (Some(a), None) => Some(Value::from(limit_value(key, a)?)),
                (None, Some(b)) => Some(Value::from(limit_value(key, b)?)),
                (None, None) => None,
            },
            ConstraintKind::Term => cat.cloned(),
            ConstraintKind::Policy => match (cat, cred) {
                (Some(Value::Bool(a)), Some(Value::Bool(b))) => Some(Value::Bool(*a || *b)),
                (_, Some(b)) => Some(b.clone()),
                (Some(a), None) => Some(a.clone()),
                (None, None) => None,
            },
            ConstraintKind::Unknown => cred.or(cat).cloned(),
        };

        if let Some(v) = value {
            effective.insert(key.clone(), v);
        }
    }

    Ok(effective)
}

/// Inputs to one evaluation pass.
pub struct EvalInput<'a> {
    pub effective: &'a ConstraintMap,
    pub action: &'a str,
    pub context: &'a HashMap<String, Value>,
    pub now: DateTime<Utc>,
    /// Rate/cumulative bucket subject, normally the passport id.
    pub subject: &'a str,
}

/// Outcome of evaluating the effective constraints against one request.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: ConstraintDecision,
    pub reason_codes: Vec<String>,
    pub obligations: Vec<String>,
}

impl Evaluation {
    fn permit() -> Self {
        Self {
            decision: ConstraintDecision::Permit,
            reason_codes: vec![],
            obligations: vec![],
        }
    }

    fn absorb(&mut self, verdict: ConstraintDecision, reason: &str, obligation: Option<&str>) {
        self.decision = self.decision.max(verdict);
        if !self.reason_codes.iter().any(|r| r == reason) {
            self.reason_codes.push(reason.to_string());
        }
        if let Some(o) = obligation {
            if !self.obligations.iter().any(|x| x == o) {
                self.obligations.push(o.to_string());
            }
        }
    }
}

fn flag(map: &ConstraintMap, key: &str) -> bool {
    map.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn int(map: &ConstraintMap, key: &str) -> Option<i64> {
    map.get(key).and_then(Value::as_i64)
}

fn string_list(value: &Value) -> Vec<&str> {
    value
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn context_flag(context: &HashMap<String, Value>, key: &str) -> bool {
    context.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Evaluate effective constraints. Categories run in fixed order; the
/// aggregate is the max verdict. The limiter and cost tracker are read-only
/// here; consumption is committed separately after an overall permit.
pub fn evaluate(
    input: &EvalInput<'_>,
    limiter: &RateLimiter,
    cumulative: &CumulativeCostTracker,
) -> Evaluation {
    let mut out = Evaluation::permit();
    let eff = input.effective;

    // 1. Temporal
    if let Some(hours) = eff.get(keys::OPERATING_HOURS) {
        if !within_operating_hours(hours, input.now) {
            out.absorb(ConstraintDecision::Block, "outside_operating_hours", None);
        }
    }
    if let Some(windows) = eff.get(keys::BLACKOUT_WINDOWS).and_then(Value::as_array) {
        if windows.iter().any(|w| in_blackout(w, input.now)) {
            out.absorb(ConstraintDecision::Block, "blackout_window", None);
        }
    }

    // 2. Scope
    if let Some(allow) = eff.get(keys::ACTION_ALLOWLIST) {
        let list = string_list(allow);
        if !list.is_empty() && !list.contains(&input.action) {
            out.absorb(ConstraintDecision::Block, "action_not_allowed", None);
        }
    }
    if let Some(block) = eff.get(keys::ACTION_BLOCKLIST) {
        if string_list(block).contains(&input.action) {
            out.absorb(ConstraintDecision::Block, "action_blocked", None);
        }
    }
    if let Some(domain) = input.context.get("domain").and_then(Value::as_str) {
        if let Some(allow) = eff.get(keys::DOMAIN_ALLOWLIST) {
            let list = string_list(allow);
            if !list.is_empty() && !list.contains(&domain) {
                out.absorb(ConstraintDecision::Block, "domain_not_allowed", None);
            }
        }
        if let Some(block) = eff.get(keys::DOMAIN_BLOCKLIST) {
            if string_list(block).contains(&domain) {
                out.absorb(ConstraintDecision::Block, "domain_blocked", None);
            }
        }
    }

    // 3. Rate (constraint-declared windows; the registered action window is
    // the pipeline's final step)
    let now_ms = input.now.timestamp_millis();
    for (key, window_ms) in RATE_WINDOWS {
        if let Some(max) = int(eff, key) {
            let max = max.clamp(0, u32::MAX as i64) as u32;
            if !limiter.check_quota(key, input.subject, max, window_ms, now_ms) {
                out.absorb(ConstraintDecision::Block, "rate_limited", None);
            }
        }
    }

    // 4. Cost
    let amount = input
        .context
        .get(AMOUNT_CANONICAL)
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if let Some(max) = int(eff, keys::COST_MAX_PER_ACTION) {
        if amount > max {
            out.absorb(ConstraintDecision::Block, "cost_limit_exceeded", None);
        }
    }
    if let Some(max) = int(eff, keys::COST_MAX_CUMULATIVE) {
        let spent = cumulative.peek(input.action, input.subject);
        if spent + amount > max {
            out.absorb(ConstraintDecision::Block, "cumulative_cost_exceeded", None);
        }
    }
    if let Some(threshold) = int(eff, keys::COST_APPROVAL_THRESHOLD) {
        if amount >= threshold {
            out.absorb(
                ConstraintDecision::Suspend,
                "approval_required",
                Some(obligations::REQUIRE_APPROVAL),
            );
        }
    }

    // 5. Approval
    if flag(eff, keys::APPROVAL_REQUIRED) {
        out.absorb(
            ConstraintDecision::Suspend,
            "approval_required",
            Some(obligations::REQUIRE_APPROVAL),
        );
    }

    // 6. Data
    if flag(eff, keys::DATA_READ_ONLY) && context_flag(input.context, "write") {
        out.absorb(ConstraintDecision::Block, "read_only_violation", None);
    }
    if flag(eff, keys::DATA_NO_PII_EXPORT) && context_flag(input.context, "pii_export") {
        out.absorb(ConstraintDecision::Block, "pii_export_blocked", None);
    }

    out
}

const RATE_WINDOWS: [(&str, i64); 3] = [
    (keys::RATE_PER_MINUTE, 60_000),
    (keys::RATE_PER_HOUR, 3_600_000),
    (keys::RATE_PER_DAY, 86_400_000),
];

/// Commit consumption after an overall permit: bump constraint rate windows
/// and record spend toward the cumulative ceiling. Cumulative totals are
/// only tracked while a ceiling constraint exists.
pub fn commit_consumption(
    effective: &ConstraintMap,
    action: &str,
    subject: &str,
    context: &HashMap<String, Value>,
    now: DateTime<Utc>,
    limiter: &RateLimiter,
    cumulative: &CumulativeCostTracker,
) {
    let now_ms = now.timestamp_millis();
    for (key, window_ms) in RATE_WINDOWS {
        if let Some(max) = int(effective, key) {
            let max = max.clamp(0, u32::MAX as i64) as u32;
            limiter.increment_quota(key, subject, max, window_ms, now_ms);
        }
    }
    if effective.contains_key(keys::COST_MAX_CUMULATIVE) {
        let amount = context
            .get(AMOUNT_CANONICAL)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if amount > 0 {
            cumulative.add(action, subject, amount);
        }
    }
}

// hours value is [start, end) in UTC; wrap-around windows like [22, 6) are
// open across midnight.
fn within_operating_hours(value: &Value, now: DateTime<Utc>) -> bool {
    let bounds = match value.as_array() {
        Some(a) if a.len() == 2 => a,
        _ => return true,
    };
    let (start, end) = match (bounds[0].as_i64(), bounds[1].as_i64()) {
        (Some(s), Some(e)) => (s, e),
        _ => return true,
    };
    if start == end {
        return true;
    }
    let hour = chrono::Timelike::hour(&now) as i64;
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

fn in_blackout(window: &Value, now: DateTime<Utc>) -> bool {
    let start = window
        .get("start")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
    let end = window
        .get("end")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
    match (start, end) {
        (Some(s), Some(e)) => now >= s && now < e,
        _ => {
            tracing::warn!(?window, "skipping malformed blackout window");
            false
        }
    }
}
