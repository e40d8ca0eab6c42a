//! Hot-Path Verification Pipeline
//!
//! The strict per-call sequence that turns (credential, action, context)
//! into a decision. Security properties:
//! - No I/O, no suspension points; only cache snapshots observed at entry
//! - Short-circuits to the first failing step's denial code
//! - Anti-downgrade: once a passport is presented, failure never falls
//!   back to anonymous access
//! - Deterministic for identical inputs at a frozen `now`
//!
//! This is the security chokepoint - runs on every tool call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheStore;
use crate::catalog::VersionResolution;
use crate::constraints::{self, ConstraintMap, EvalInput};
use crate::credential::LoadedPassport;
use crate::error::{codes, human_message};
use crate::ratelimit::{CumulativeCostTracker, RateLimiter};
use crate::signature::verify_passport;
use crate::{ConstraintDecision, Decision};

/// Whether stale cache data denies or admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    FailOpen,
    FailClosed,
}

impl Default for FailMode {
    fn default() -> Self {
        FailMode::FailOpen
    }
}

/// Per-action override of the freshness policy.
#[derive(Debug, Clone, Copy)]
pub struct FailModeOverride {
    pub fail_mode: FailMode,
    /// Tighter-than-TTL bound on revocation snapshot age.
    pub revocation_max_age: Option<Duration>,
}

/// Anonymous access policy for unauthenticated callers.
#[derive(Debug, Clone, Default)]
pub struct AnonymousPolicy {
    pub allowed_actions: HashSet<String>,
    pub read_only: bool,
    pub rate_limit_per_minute: Option<u32>,
    pub rate_limit_per_hour: Option<u32>,
    pub upgrade_message: Option<String>,
}

/// Static policy the pipeline is built with.
#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    pub gate_id: String,
    pub anonymous: Option<AnonymousPolicy>,
    pub default_fail_mode: FailMode,
    pub fail_mode_overrides: HashMap<String, FailModeOverride>,
}

/// One verification request. `now` is explicit so decisions are
/// reproducible under frozen time.
pub struct VerifyRequest<'a> {
    pub passport: Option<&'a LoadedPassport>,
    pub action: &'a str,
    pub context: &'a HashMap<String, Value>,
    pub source_id: Option<&'a str>,
    pub now: DateTime<Utc>,
}

/// A structured denial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Denial {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<String>,
}

/// The pipeline's total result. SUSPEND surfaces on the wire as deny plus
/// reason codes and obligations.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyResult {
    pub decision: Decision,
    pub constraint_decision: ConstraintDecision,
    pub reason_codes: Vec<String>,
    pub obligations: Vec<String>,
    pub effective_constraints: ConstraintMap,
    pub denial: Option<Denial>,
    /// True when every cache entry consulted for this decision was fresh.
    pub confident: bool,
    /// Catalog version the decision was made against, when one was resolved.
    pub catalog_version: Option<u32>,
}

pub struct Pipeline {
    policy: PipelinePolicy,
    cache: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    cumulative: Arc<CumulativeCostTracker>,

    checks: AtomicU64,
    permits: AtomicU64,
    denials: AtomicU64,
}

/// Key used for the anonymous per-minute window.
const ANON_MINUTE_SCOPE: &str = "anonymous:minute";
const ANON_HOUR_SCOPE: &str = "anonymous:hour";

impl Pipeline {
    pub fn new(
        policy: PipelinePolicy,
        cache: Arc<CacheStore>,
        limiter: Arc<RateLimiter>,
        cumulative: Arc<CumulativeCostTracker>,
    ) -> Self {
        Self {
            policy,
            cache,
            limiter,
            cumulative,
            checks: AtomicU64::new(0),
            permits: AtomicU64::new(0),
            denials: AtomicU64::new(0),
        }
    }

    /// Run the full verification sequence. Total: every input produces a
    /// `VerifyResult`, never an error.
    pub fn verify(&self, req: &VerifyRequest<'_>) -> VerifyResult {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let result = self.run(req);
        match result.decision {
            Decision::Permit => self.permits.fetch_add(1, Ordering::Relaxed),
            Decision::Deny => self.denials.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn run(&self, req: &VerifyRequest<'_>) -> VerifyResult {
        // Step 1: no credential presented.
        let passport = match req.passport {
            Some(p) => p,
            None => return self.anonymous_path(req),
        };

        // A passport was presented; from here on no branch reaches the
        // anonymous path. Credential-integrity denials (unknown issuer, bad
        // signature, expired, revoked) for actions anonymous access would
        // have admitted carry an anti_downgrade breadcrumb; a valid passport
        // that is merely unauthorized does not.
        let downgrade_hint = self.anonymous_would_admit(req.action);
        let mut confident = true;

        // Step 2: issuer known.
        let issuer_id = &passport.passport().issuer_id;
        let key = match self.cache.issuer_keys() {
            Some(read) => {
                confident &= read.fresh;
                read.value.get(issuer_id).copied()
            }
            None => {
                confident = false;
                None
            }
        };
        let key = match key {
            Some(k) => k,
            None => {
                return deny(codes::ISSUER_NOT_ALLOWED, None, confident, downgrade_hint);
            }
        };

        // Step 3: signature valid.
        if verify_passport(passport.passport(), &key).is_err() {
            return deny(codes::INVALID_SIGNATURE, None, confident, downgrade_hint);
        }

        // Step 4: not expired (expiry instant itself is already expired).
        if req.now >= passport.passport().expires_at {
            return deny(codes::PASSPORT_EXPIRED, None, confident, downgrade_hint);
        }

        // Step 5: not revoked. Staleness is judged under the per-action
        // override; a stale set denies only in fail_closed.
        let fail_override = self.policy.fail_mode_overrides.get(req.action);
        let fail_mode = fail_override
            .map(|o| o.fail_mode)
            .unwrap_or(self.policy.default_fail_mode);
        let revocations = self.cache.revocations();
        let revocations_fresh = match &revocations {
            Some(read) => match fail_override.and_then(|o| o.revocation_max_age) {
                Some(max_age) => read.fresh_within(max_age),
                None => read.fresh,
            },
            None => false,
        };
        confident &= revocations_fresh;
        if let Some(read) = &revocations {
            if read.value.contains(&passport.passport().passport_id) {
                return deny(codes::PASSPORT_REVOKED, None, confident, downgrade_hint);
            }
        }
        if !revocations_fresh && fail_mode == FailMode::FailClosed {
            let mut result = deny(codes::PASSPORT_REVOKED, None, confident, downgrade_hint);
            if let Some(d) = result.denial.as_mut() {
                d.message = "Revocation data is stale and this action fails closed".to_string();
            }
            return result;
        }

        // Step 6: catalog version resolution. The passport itself is intact
        // past this point, so these denials carry no anti_downgrade marker.
        let catalog = match self.cache.catalog() {
            Some(read) => read,
            None => {
                return deny(codes::CATALOG_VERSION_UNKNOWN, None, false, false);
            }
        };
        confident &= catalog.fresh;
        let pin = passport.pinned_version(&self.policy.gate_id);
        let resolution = catalog.value.resolve(pin);
        if resolution == VersionResolution::Deprecated {
            return deny(codes::CATALOG_VERSION_DEPRECATED, None, confident, false);
        }
        let (resolved, catalog_version) = match catalog.value.resolved(resolution) {
            Some(r) => r,
            None => {
                return deny(codes::CATALOG_VERSION_UNKNOWN, None, confident, false);
            }
        };

        // Step 7: action declared in the catalog.
        let permission = match resolution {
            VersionResolution::Current => catalog.value.permission(req.action),
            _ => resolved.permission(req.action),
        };
        let permission = match permission {
            Some(p) => p,
            None => return deny(codes::PERMISSION_DENIED, None, confident, false),
        };

        // Step 8: action claimed by the passport.
        let claim = match passport.claim(req.action) {
            Some(c) => c,
            None => {
                return deny(
                    codes::PERMISSION_DENIED,
                    permission.upgrade_template.clone(),
                    confident,
                    false,
                );
            }
        };

        // Step 9: merge and evaluate constraints. The credential side is the
        // passport-wide mapping refined by the claim's own mapping.
        let mut credential_side = passport.passport().constraints.clone();
        for (k, v) in &claim.constraints {
            credential_side.insert(k.clone(), v.clone());
        }
        let effective = match constraints::merge(&permission.default_constraints, &credential_side) {
            Ok(e) => e,
            Err(_) => {
                return deny(codes::CONSTRAINT_TYPE_ERROR, None, confident, false);
            }
        };

        let subject = passport.passport().passport_id.as_str();
        let evaluation = constraints::evaluate(
            &EvalInput {
                effective: &effective,
                action: req.action,
                context: req.context,
                now: req.now,
                subject,
            },
            &self.limiter,
            &self.cumulative,
        );
        match evaluation.decision {
            ConstraintDecision::Block => {
                return VerifyResult {
                    decision: Decision::Deny,
                    constraint_decision: ConstraintDecision::Block,
                    reason_codes: evaluation.reason_codes,
                    obligations: evaluation.obligations,
                    effective_constraints: effective,
                    denial: Some(Denial {
                        code: codes::CONSTRAINT_VIOLATED.to_string(),
                        message: human_message(codes::CONSTRAINT_VIOLATED).to_string(),
                        upgrade: None,
                    }),
                    confident,
                    catalog_version: Some(catalog_version),
                };
            }
            ConstraintDecision::Suspend => {
                return VerifyResult {
                    decision: Decision::Deny,
                    constraint_decision: ConstraintDecision::Suspend,
                    reason_codes: evaluation.reason_codes,
                    obligations: evaluation.obligations,
                    effective_constraints: effective,
                    denial: Some(Denial {
                        code: codes::APPROVAL_REQUIRED.to_string(),
                        message: human_message(codes::APPROVAL_REQUIRED).to_string(),
                        upgrade: None,
                    }),
                    confident,
                    catalog_version: Some(catalog_version),
                };
            }
            ConstraintDecision::Permit => {}
        }

        // Step 10: registered action rate limit, then commit consumption.
        let now_ms = req.now.timestamp_millis();
        if !self.limiter.check(req.action, subject, now_ms) {
            let mut result = deny(codes::RATE_LIMITED, None, confident, false);
            result.effective_constraints = effective;
            result.catalog_version = Some(catalog_version);
            return result;
        }
        self.limiter.increment(req.action, subject, now_ms);
        constraints::commit_consumption(
            &effective,
            req.action,
            subject,
            req.context,
            req.now,
            &self.limiter,
            &self.cumulative,
        );

        VerifyResult {
            decision: Decision::Permit,
            constraint_decision: ConstraintDecision::Permit,
            reason_codes: vec![],
            obligations: vec![],
            effective_constraints: effective,
            denial: None,
            confident,
            catalog_version: Some(catalog_version),
        }
    }

    fn anonymous_would_admit(&self, action: &str) -> bool {
        self.policy
            .anonymous
            .as_ref()
            .map(|p| p.allowed_actions.contains(action))
            .unwrap_or(false)
    }

    // Step 1 branch: unauthenticated caller. Consults no signed-data cache
    // entries, so `confident` is true by construction.
    fn anonymous_path(&self, req: &VerifyRequest<'_>) -> VerifyResult {
        let policy = match &self.policy.anonymous {
            Some(p) if p.allowed_actions.contains(req.action) => p,
            other => {
                let upgrade = other.as_ref().and_then(|p| p.upgrade_message.clone());
                return deny(codes::PASSPORT_MISSING, upgrade, true, false);
            }
        };

        if policy.read_only
            && req
                .context
                .get("write")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        {
            return deny(codes::PERMISSION_DENIED, policy.upgrade_message.clone(), true, false);
        }

        let source = req.source_id.unwrap_or("anonymous");
        let now_ms = req.now.timestamp_millis();
        let windows = [
            (ANON_MINUTE_SCOPE, policy.rate_limit_per_minute, 60_000i64),
            (ANON_HOUR_SCOPE, policy.rate_limit_per_hour, 3_600_000i64),
        ];
        for (scope, max, window_ms) in windows {
            if let Some(max) = max {
                if !self.limiter.check_quota(scope, source, max, window_ms, now_ms) {
                    return deny(codes::RATE_LIMITED, policy.upgrade_message.clone(), true, false);
                }
            }
        }
        for (scope, max, window_ms) in windows {
            if let Some(max) = max {
                self.limiter.increment_quota(scope, source, max, window_ms, now_ms);
            }
        }

        VerifyResult {
            decision: Decision::Permit,
            constraint_decision: ConstraintDecision::Permit,
            reason_codes: vec![],
            obligations: vec![],
            effective_constraints: ConstraintMap::new(),
            denial: None,
            confident: true,
            catalog_version: None,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            checks: self.checks.load(Ordering::Relaxed),
            permits: self.permits.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
        }
    }
}

fn deny(code: &str, upgrade: Option<String>, confident: bool, anti_downgrade: bool) -> VerifyResult {
    let mut reason_codes = vec![code.to_string()];
    if anti_downgrade {
        reason_codes.push(codes::ANTI_DOWNGRADE.to_string());
    }
    VerifyResult {
        decision: Decision::Deny,
        constraint_decision: ConstraintDecision::Block,
        reason_codes,
        obligations: vec![],
        effective_constraints: ConstraintMap::new(),
        denial: Some(Denial {
            code: code.to_string(),
            message: human_message(code).to_string(),
            upgrade,
        }),
        confident,
        catalog_version: None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub checks: u64,
    pub permits: u64,
    pub denials: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RevocationSet;
    use crate::canonical::{encode_hex, passport_signing_payload};
    use crate::catalog::{Catalog, CatalogSnapshot, PermissionSpec, RiskLevel};
    use crate::constraints::keys;
    use crate::credential::{Claim, Passport};
    use chrono::TimeZone;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;
    use std::collections::BTreeMap;

    const GATE: &str = "gate_travel";
    const ISSUER: &str = "issuer_a";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn permission(key: &str, defaults: ConstraintMap, upgrade: Option<&str>) -> PermissionSpec {
        PermissionSpec {
            key: key.into(),
            display_name: key.into(),
            risk: RiskLevel::Low,
            default_constraints: defaults,
            required_constraints: vec![],
            upgrade_template: upgrade.map(String::from),
        }
    }

    fn catalog(version: u32, min_compatible: u32) -> CatalogSnapshot {
        let book_defaults: ConstraintMap =
            [(keys::COST_MAX_PER_ACTION.to_string(), json!(500_000))]
                .into_iter()
                .collect();
        CatalogSnapshot::new(
            Catalog {
                gate_id: GATE.into(),
                version,
                min_compatible_version: min_compatible,
                permissions: vec![
                    permission("flights:search", ConstraintMap::new(), None),
                    permission("flights:book", book_defaults, Some("traveler_plus")),
                ],
                published_at: now(),
            },
            BTreeMap::new(),
        )
    }

    struct Rig {
        pipeline: Pipeline,
        key: SigningKey,
    }

    fn rig_with(policy: PipelinePolicy, cache: CacheStore, key: SigningKey) -> Rig {
        cache.put_issuer_keys(
            [(ISSUER.to_string(), key.verifying_key())].into_iter().collect(),
        );
        if cache.catalog().is_none() {
            cache.put_catalog(catalog(5, 3));
        }
        if cache.revocations().is_none() {
            cache.put_revocations(RevocationSet::new());
        }
        Rig {
            pipeline: Pipeline::new(
                policy,
                Arc::new(cache),
                Arc::new(RateLimiter::new()),
                Arc::new(CumulativeCostTracker::new()),
            ),
            key,
        }
    }

    fn rig() -> Rig {
        rig_with(base_policy(None), CacheStore::default(), SigningKey::generate(&mut rand::thread_rng()))
    }

    fn base_policy(anonymous: Option<AnonymousPolicy>) -> PipelinePolicy {
        PipelinePolicy {
            gate_id: GATE.into(),
            anonymous,
            default_fail_mode: FailMode::FailOpen,
            fail_mode_overrides: HashMap::new(),
        }
    }

    // Anonymous policy admitting `action`, for asserting which denials do
    // and do not carry the anti_downgrade marker.
    fn anon_for(action: &str) -> Option<AnonymousPolicy> {
        Some(AnonymousPolicy {
            allowed_actions: [action.to_string()].into_iter().collect(),
            ..Default::default()
        })
    }

    fn passport(key: &SigningKey, claims: Vec<Claim>) -> LoadedPassport {
        let mut p = Passport {
            passport_id: "ppt_test".into(),
            issuer_id: ISSUER.into(),
            subject_id: "agent_7".into(),
            gate_id: GATE.into(),
            claims,
            constraints: ConstraintMap::new(),
            expires_at: now() + chrono::Duration::days(30),
            issued_at: now() - chrono::Duration::days(1),
            catalog_version_pin: None,
            signature: String::new(),
        };
        sign(&mut p, key);
        LoadedPassport::load(p).unwrap()
    }

    fn sign(p: &mut Passport, key: &SigningKey) {
        let payload = passport_signing_payload(p).unwrap();
        p.signature = encode_hex(&key.sign(&payload).to_bytes());
    }

    fn claim(key: &str, constraints: ConstraintMap) -> Claim {
        Claim {
            key: key.into(),
            constraints,
        }
    }

    fn verify(rig: &Rig, passport: Option<&LoadedPassport>, action: &str) -> VerifyResult {
        verify_with_context(rig, passport, action, &HashMap::new(), now())
    }

    fn verify_with_context(
        rig: &Rig,
        passport: Option<&LoadedPassport>,
        action: &str,
        context: &HashMap<String, Value>,
        at: DateTime<Utc>,
    ) -> VerifyResult {
        rig.pipeline.verify(&VerifyRequest {
            passport,
            action,
            context,
            source_id: Some("src_1"),
            now: at,
        })
    }

    #[test]
    fn test_happy_path_permit() {
        let rig = rig();
        let p = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())]);
        let result = verify(&rig, Some(&p), "flights:search");
        assert_eq!(result.decision, Decision::Permit);
        assert_eq!(result.constraint_decision, ConstraintDecision::Permit);
        assert!(result.denial.is_none());
        assert!(result.confident);
        assert_eq!(result.catalog_version, Some(5));
    }

    #[test]
    fn test_permit_is_deterministic() {
        let rig = rig();
        let p = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())]);
        let first = verify(&rig, Some(&p), "flights:search");
        let second = verify(&rig, Some(&p), "flights:search");
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_passport_denied_without_anonymous() {
        let rig = rig();
        let result = verify(&rig, None, "flights:search");
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.denial.unwrap().code, codes::PASSPORT_MISSING);
    }

    #[test]
    fn test_anonymous_permit_and_rate_limit() {
        let anon = AnonymousPolicy {
            allowed_actions: ["flights:search".to_string()].into_iter().collect(),
            rate_limit_per_minute: Some(2),
            upgrade_message: Some("get_a_passport".into()),
            ..Default::default()
        };
        let rig = rig_with(
            base_policy(Some(anon)),
            CacheStore::default(),
            SigningKey::generate(&mut rand::thread_rng()),
        );

        assert_eq!(verify(&rig, None, "flights:search").decision, Decision::Permit);
        assert_eq!(verify(&rig, None, "flights:search").decision, Decision::Permit);
        let third = verify(&rig, None, "flights:search");
        assert_eq!(third.denial.as_ref().unwrap().code, codes::RATE_LIMITED);

        // An action outside the allowed set stays denied.
        let other = verify(&rig, None, "flights:book");
        let denial = other.denial.unwrap();
        assert_eq!(denial.code, codes::PASSPORT_MISSING);
        assert_eq!(denial.upgrade.as_deref(), Some("get_a_passport"));
    }

    #[test]
    fn test_anti_downgrade_expired_passport() {
        // Scenario D: expired passport, anonymous enabled for the action.
        let anon = AnonymousPolicy {
            allowed_actions: ["flights:search".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let rig = rig_with(
            base_policy(Some(anon)),
            CacheStore::default(),
            SigningKey::generate(&mut rand::thread_rng()),
        );
        let mut raw = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())])
            .passport()
            .clone();
        raw.expires_at = now() - chrono::Duration::days(1);
        sign(&mut raw, &rig.key);
        let p = LoadedPassport::load(raw).unwrap();

        let result = verify(&rig, Some(&p), "flights:search");
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.denial.unwrap().code, codes::PASSPORT_EXPIRED);
        assert!(result.reason_codes.contains(&codes::ANTI_DOWNGRADE.to_string()));
    }

    #[test]
    fn test_expiry_instant_is_expired() {
        let rig = rig();
        let mut raw = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())])
            .passport()
            .clone();
        raw.expires_at = now();
        sign(&mut raw, &rig.key);
        let p = LoadedPassport::load(raw).unwrap();
        let result = verify(&rig, Some(&p), "flights:search");
        assert_eq!(result.denial.unwrap().code, codes::PASSPORT_EXPIRED);
    }

    #[test]
    fn test_unknown_issuer() {
        let rig = rig();
        let stranger = SigningKey::generate(&mut rand::thread_rng());
        let mut raw = passport(&stranger, vec![claim("flights:search", ConstraintMap::new())])
            .passport()
            .clone();
        raw.issuer_id = "issuer_unknown".into();
        sign(&mut raw, &stranger);
        let p = LoadedPassport::load(raw).unwrap();
        let result = verify(&rig, Some(&p), "flights:search");
        assert_eq!(result.denial.unwrap().code, codes::ISSUER_NOT_ALLOWED);
    }

    #[test]
    fn test_tampered_signature() {
        let rig = rig();
        let mut raw = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())])
            .passport()
            .clone();
        raw.subject_id = "agent_tampered".into();
        let p = LoadedPassport::load(raw).unwrap();
        let result = verify(&rig, Some(&p), "flights:search");
        assert_eq!(result.denial.unwrap().code, codes::INVALID_SIGNATURE);
    }

    #[test]
    fn test_revoked_passport() {
        let cache = CacheStore::default();
        cache.put_revocations(["ppt_test".to_string()].into_iter().collect());
        let rig = rig_with(base_policy(None), cache, SigningKey::generate(&mut rand::thread_rng()));
        let p = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())]);
        let result = verify(&rig, Some(&p), "flights:search");
        assert_eq!(result.denial.unwrap().code, codes::PASSPORT_REVOKED);
    }

    #[test]
    fn test_deprecated_pin() {
        // Anonymous would admit the action; a deprecated pin on an intact
        // passport must still not be tagged anti_downgrade.
        let rig = rig_with(
            base_policy(anon_for("flights:search")),
            CacheStore::default(),
            SigningKey::generate(&mut rand::thread_rng()),
        );
        let mut raw = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())])
            .passport()
            .clone();
        raw.catalog_version_pin = Some([(GATE.to_string(), 2u32)].into_iter().collect());
        sign(&mut raw, &rig.key);
        let p = LoadedPassport::load(raw).unwrap();
        let result = verify(&rig, Some(&p), "flights:search");
        assert!(!result.reason_codes.contains(&codes::ANTI_DOWNGRADE.to_string()));
        assert_eq!(result.denial.unwrap().code, codes::CATALOG_VERSION_DEPRECATED);
    }

    #[test]
    fn test_action_missing_from_catalog() {
        let rig = rig_with(
            base_policy(anon_for("hotels:book")),
            CacheStore::default(),
            SigningKey::generate(&mut rand::thread_rng()),
        );
        let p = passport(&rig.key, vec![claim("hotels:book", ConstraintMap::new())]);
        let result = verify(&rig, Some(&p), "hotels:book");
        // A valid passport lacking a grant is not a credential failure.
        assert!(!result.reason_codes.contains(&codes::ANTI_DOWNGRADE.to_string()));
        let denial = result.denial.unwrap();
        assert_eq!(denial.code, codes::PERMISSION_DENIED);
        assert!(denial.upgrade.is_none());
    }

    #[test]
    fn test_unclaimed_action_gets_upgrade_hint() {
        let rig = rig_with(
            base_policy(anon_for("flights:book")),
            CacheStore::default(),
            SigningKey::generate(&mut rand::thread_rng()),
        );
        let p = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())]);
        let result = verify(&rig, Some(&p), "flights:book");
        assert!(!result.reason_codes.contains(&codes::ANTI_DOWNGRADE.to_string()));
        let denial = result.denial.unwrap();
        assert_eq!(denial.code, codes::PERMISSION_DENIED);
        assert_eq!(denial.upgrade.as_deref(), Some("traveler_plus"));
    }

    #[test]
    fn test_cost_limit_scenario() {
        // Scenario B: catalog caps at 500_000, credential tightens to 100_000.
        let rig = rig();
        let constraints: ConstraintMap =
            [(keys::COST_MAX_PER_ACTION.to_string(), json!(100_000))]
                .into_iter()
                .collect();
        let p = passport(&rig.key, vec![claim("flights:book", constraints)]);

        let over: HashMap<String, Value> =
            [("amount_canonical".to_string(), json!(150_000))].into_iter().collect();
        let result = verify_with_context(&rig, Some(&p), "flights:book", &over, now());
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.constraint_decision, ConstraintDecision::Block);
        assert_eq!(result.denial.unwrap().code, codes::CONSTRAINT_VIOLATED);

        let under: HashMap<String, Value> =
            [("amount_canonical".to_string(), json!(50_000))].into_iter().collect();
        let result = verify_with_context(&rig, Some(&p), "flights:book", &under, now());
        assert_eq!(result.decision, Decision::Permit);
        assert_eq!(
            result.effective_constraints[keys::COST_MAX_PER_ACTION],
            json!(100_000)
        );
    }

    #[test]
    fn test_approval_suspend_scenario() {
        // Scenario C: approval flag suspends; wire decision is deny.
        let rig = rig();
        let constraints: ConstraintMap =
            [(keys::APPROVAL_REQUIRED.to_string(), json!(true))].into_iter().collect();
        let p = passport(&rig.key, vec![claim("flights:search", constraints)]);
        let result = verify(&rig, Some(&p), "flights:search");
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.constraint_decision, ConstraintDecision::Suspend);
        assert_eq!(result.reason_codes, vec!["approval_required"]);
        assert_eq!(result.obligations, vec!["require_approval"]);
        assert_eq!(result.denial.unwrap().code, codes::APPROVAL_REQUIRED);
    }

    #[test]
    fn test_registered_rate_limit_scenario() {
        // Scenario F: 2 per minute, third call denied, window expiry recovers.
        let rig = rig();
        rig.pipeline.limiter.register("flights:search", 2, 60_000);
        let p = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())]);

        assert_eq!(verify(&rig, Some(&p), "flights:search").decision, Decision::Permit);
        assert_eq!(verify(&rig, Some(&p), "flights:search").decision, Decision::Permit);
        let third = verify(&rig, Some(&p), "flights:search");
        assert_eq!(third.denial.unwrap().code, codes::RATE_LIMITED);

        let later = now() + chrono::Duration::seconds(61);
        let result = verify_with_context(&rig, Some(&p), "flights:search", &HashMap::new(), later);
        assert_eq!(result.decision, Decision::Permit);
    }

    #[test]
    fn test_stale_revocations_fail_open_vs_closed() {
        let stale_cache = || {
            let cache = CacheStore::new(
                std::time::Duration::from_secs(300),
                std::time::Duration::from_secs(0),
                std::time::Duration::from_secs(300),
            );
            cache.put_revocations(RevocationSet::new());
            cache
        };

        // fail_open: stale revocations only drop confidence.
        let rig = rig_with(base_policy(None), stale_cache(), SigningKey::generate(&mut rand::thread_rng()));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let p = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())]);
        let result = verify(&rig, Some(&p), "flights:search");
        assert_eq!(result.decision, Decision::Permit);
        assert!(!result.confident);

        // fail_closed override for this action: stale revocations deny.
        let mut policy = base_policy(None);
        policy.fail_mode_overrides.insert(
            "flights:search".into(),
            FailModeOverride {
                fail_mode: FailMode::FailClosed,
                revocation_max_age: None,
            },
        );
        let rig = rig_with(policy, stale_cache(), SigningKey::generate(&mut rand::thread_rng()));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let p = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())]);
        let result = verify(&rig, Some(&p), "flights:search");
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.denial.unwrap().code, codes::PASSPORT_REVOKED);
    }

    #[test]
    fn test_empty_cache_denies_catalog_unknown() {
        let cache = CacheStore::default();
        let key = SigningKey::generate(&mut rand::thread_rng());
        cache.put_issuer_keys([(ISSUER.to_string(), key.verifying_key())].into_iter().collect());
        cache.put_revocations(RevocationSet::new());
        let pipeline = Pipeline::new(
            base_policy(anon_for("flights:search")),
            Arc::new(cache),
            Arc::new(RateLimiter::new()),
            Arc::new(CumulativeCostTracker::new()),
        );
        let rig = Rig { pipeline, key };
        let p = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())]);
        let result = verify(&rig, Some(&p), "flights:search");
        // Missing catalog data is not a credential failure.
        assert!(!result.reason_codes.contains(&codes::ANTI_DOWNGRADE.to_string()));
        assert_eq!(result.denial.unwrap().code, codes::CATALOG_VERSION_UNKNOWN);
        assert!(!result.confident);
    }

    #[test]
    fn test_stats() {
        let rig = rig();
        let p = passport(&rig.key, vec![claim("flights:search", ConstraintMap::new())]);
        let _ = verify(&rig, Some(&p), "flights:search");
        let _ = verify(&rig, None, "flights:search");
        let stats = rig.pipeline.stats();
        assert_eq!(stats.checks, 2);
        assert_eq!(stats.permits, 1);
        assert_eq!(stats.denials, 1);
    }
}
