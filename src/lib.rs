//! Local Permission Gate
//!
//! The trust layer in front of tool handlers. Every call is decided locally:
//! - Hot-path verification pipeline with no network I/O
//! - Cached, background-refreshed catalog / revocations / issuer keys
//! - Typed constraint merge (catalog x credential) and evaluation
//! - Deterministic decimal normalization for money values
//! - Signed consumption receipts verifiable by the caller
//!
//! The host RPC/tool server embeds [`Gate`] and routes calls through
//! [`Gate::handle_tool_call`].

pub mod audit;
pub mod billing;
pub mod cache;
pub mod canonical;
pub mod catalog;
pub mod config;
pub mod constraints;
pub mod credential;
pub mod error;
pub mod normalize;
pub mod pipeline;
pub mod ratelimit;
pub mod receipt;
pub mod refresh;
pub mod session;
pub mod signature;
pub mod tool;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::config::GateConfig;
use crate::credential::LoadedPassport;
use crate::pipeline::{Pipeline, PipelinePolicy, VerifyRequest, VerifyResult};
use crate::ratelimit::{CumulativeCostTracker, RateLimiter};
use crate::refresh::{spawn_refresher, RefreshIntervals, RefresherHandle, SafeDefaultRequest, UpstreamClient};
use crate::session::{Session, SessionStore};
use crate::tool::{
    extract_context, DenialMeta, GatedTool, ResponseMeta, ToolCallRequest, ToolCallResponse,
    ToolRegistry,
};

pub use error::{codes, human_message, GateError};

/// Gate core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type for gate operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Budget for denial-response enrichment (suggestions).
const SUGGESTION_TIMEOUT: Duration = Duration::from_millis(500);

/// Wire decision for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Permit,
    Deny,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Permit => write!(f, "permit"),
            Decision::Deny => write!(f, "deny"),
        }
    }
}

/// Internal three-valued constraint decision. Ordered so the aggregate of
/// several category verdicts is their max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConstraintDecision {
    Permit,
    Suspend,
    Block,
}

impl std::fmt::Display for ConstraintDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintDecision::Permit => write!(f, "PERMIT"),
            ConstraintDecision::Suspend => write!(f, "SUSPEND"),
            ConstraintDecision::Block => write!(f, "BLOCK"),
        }
    }
}

/// The assembled gate: cache, pipeline, sessions, tools, receipts.
pub struct Gate {
    config: GateConfig,
    cache: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    cumulative: Arc<CumulativeCostTracker>,
    sessions: SessionStore,
    registry: ToolRegistry,
    pipeline: Pipeline,
    upstream: Option<Arc<UpstreamClient>>,
    refresher: Option<RefresherHandle>,
    signing_key: Option<SigningKey>,
}

impl Gate {
    pub fn new(config: GateConfig) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CacheStore::new(
            config.cache.catalog_ttl(),
            config.cache.revocation_ttl(),
            config.cache.keys_ttl(),
        ));
        let limiter = Arc::new(RateLimiter::new());
        let cumulative = Arc::new(CumulativeCostTracker::new());
        let pipeline = Pipeline::new(
            PipelinePolicy {
                gate_id: config.gate_id.clone(),
                anonymous: config.anonymous.to_policy(),
                default_fail_mode: config.cache.fail_mode,
                fail_mode_overrides: config.cache.overrides(),
            },
            Arc::clone(&cache),
            Arc::clone(&limiter),
            Arc::clone(&cumulative),
        );

        Ok(Self {
            config,
            cache,
            limiter,
            cumulative,
            sessions: SessionStore::new(),
            registry: ToolRegistry::new(),
            pipeline,
            upstream: None,
            refresher: None,
            signing_key: None,
        })
    }

    /// Attach the Ed25519 key receipts are signed with.
    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn register_tool(&mut self, tool: GatedTool) {
        self.registry.register(tool);
    }

    /// Register a fixed-window limit for an action.
    pub fn register_rate_limit(&self, action: &str, max: u32, window_ms: i64) {
        self.limiter.register(action, max, window_ms);
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run the verification pipeline directly.
    pub fn verify(&self, request: &VerifyRequest<'_>) -> VerifyResult {
        self.pipeline.verify(request)
    }

    /// Connect to the upstream authority and start the background refresh
    /// loops. Requires a tokio runtime.
    pub fn start_refresh(&mut self) -> Result<()> {
        let client = Arc::new(UpstreamClient::new(
            self.config.uniplex_api_url.clone(),
            self.config.gate_id.clone(),
            self.config.gate_secret.clone(),
            self.config.trusted_issuers.clone(),
        )?);
        let intervals = RefreshIntervals {
            catalog: self.config.cache.catalog_ttl(),
            revocations: self.config.cache.revocation_ttl(),
            keys: self.config.cache.keys_ttl(),
        };
        self.refresher = Some(spawn_refresher(
            Arc::clone(&client),
            Arc::clone(&self.cache),
            intervals,
        ));
        self.upstream = Some(client);
        Ok(())
    }

    pub fn stop_refresh(&mut self) {
        if let Some(mut handle) = self.refresher.take() {
            handle.shutdown();
        }
    }

    /// Fetch or create the session, bootstrapping a credential where
    /// configuration allows: the test-mode mock passport first, then
    /// safe-default issuance through the upstream. Bootstrap failures
    /// leave the session credential-less rather than failing the call.
    pub async fn ensure_session(&self, session_id: &str) -> Session {
        let now = Utc::now();
        let session = self.sessions.get_or_create(session_id, now);
        if session.passport.is_some() {
            return session;
        }

        if self.config.test_mode.enabled {
            if let Some(mock) = &self.config.test_mode.mock_passport {
                if let Err(e) = self.sessions.set_passport(session_id, mock.clone(), now) {
                    tracing::warn!(error = %e, "test-mode mock passport rejected");
                }
                return self.sessions.get_or_create(session_id, now);
            }
        }

        if self.config.safe_default.enabled && self.config.safe_default.auto_issue {
            if let Some(upstream) = &self.upstream {
                let request = SafeDefaultRequest {
                    session_id: session_id.to_string(),
                    permissions: self.config.safe_default.permissions.clone(),
                    constraints: self.config.safe_default.constraints.clone(),
                    max_lifetime: self.config.safe_default.max_lifetime.clone(),
                };
                match upstream.issue_safe_default(&request).await {
                    Ok(passport) => {
                        if let Err(e) = self.sessions.set_passport(session_id, passport, now) {
                            tracing::warn!(error = %e, "safe-default passport rejected");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "safe-default issuance failed"),
                }
            }
        }

        self.sessions.get_or_create(session_id, now)
    }

    /// The downstream entry point: decide, then execute.
    ///
    /// Denials come back as `Ok` responses with `isError` set and structured
    /// metadata. Handler failures propagate as `Err` after the audit record
    /// is closed with error status.
    pub async fn handle_tool_call(&self, request: ToolCallRequest) -> Result<ToolCallResponse> {
        let tool = self
            .registry
            .get(&request.name)
            .ok_or_else(|| GateError::UnknownTool(request.name.clone()))?;

        let now = Utc::now();
        let passport = match request.meta.session_id.as_deref() {
            Some(session_id) => self.ensure_session(session_id).await.passport,
            None => None,
        };

        let context = extract_context(&tool, &request.arguments);
        let source_id = request
            .meta
            .agent_id
            .as_deref()
            .or(request.meta.session_id.as_deref());

        let result = self.pipeline.verify(&VerifyRequest {
            passport: passport.as_deref(),
            action: &tool.permission,
            context: &context,
            source_id,
            now,
        });

        if result.decision == Decision::Deny {
            return Ok(self.denial_response(&request, &tool, result).await);
        }

        let started = Instant::now();
        let outcome = (tool.handler)(request.arguments.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut attestation = if self.config.audit.enabled {
            let mut record = audit::AuditRecord::new(
                &self.config.gate_id,
                &tool.name,
                &tool.permission,
                now,
            );
            record.session_id = request.meta.session_id.clone();
            record.subject_id = passport.as_ref().map(|p| p.passport().subject_id.clone());
            record.duration_ms = Some(duration_ms);
            if self.config.audit.log_inputs {
                record.inputs = Some(request.arguments.clone());
            }
            Some(record)
        } else {
            None
        };

        let value = match outcome {
            Ok(v) => v,
            Err(e) => {
                if let Some(record) = attestation.take() {
                    let record = record.errored();
                    tracing::warn!(audit_id = %record.audit_id, tool = %tool.name, "handler failed");
                }
                return Err(e);
            }
        };

        if let Some(record) = attestation.as_mut() {
            if self.config.audit.log_outputs {
                record.outputs = Some(value.clone());
            }
        }

        let consumption = if self.config.commerce.enabled && self.config.commerce.issue_receipts {
            self.issue_receipt(&tool, &request, passport.as_deref(), &result, duration_ms, now)
        } else {
            None
        };

        let mut response = ToolCallResponse::ok(serde_json::to_string(&value)?);
        response.meta = ResponseMeta {
            denial: None,
            suggestions: None,
            attestation,
            consumption,
        };
        Ok(response)
    }

    async fn denial_response(
        &self,
        request: &ToolCallRequest,
        tool: &GatedTool,
        result: VerifyResult,
    ) -> ToolCallResponse {
        let denial = result.denial.unwrap_or_else(|| pipeline::Denial {
            code: codes::PERMISSION_DENIED.to_string(),
            message: human_message(codes::PERMISSION_DENIED).to_string(),
            upgrade: None,
        });

        let mut text = denial.message.clone();
        if let Some(upgrade) = &denial.upgrade {
            text.push_str(&format!(" (upgrade available: {upgrade})"));
        }

        // Enrichment is best-effort and strictly bounded; a timeout ships
        // the un-enriched response.
        let suggestions = tokio::time::timeout(SUGGESTION_TIMEOUT, async {
            self.registry.suggestions(&request.name)
        })
        .await
        .ok()
        .filter(|s| !s.is_empty());

        let attestation = if self.config.audit.enabled {
            let mut record = audit::AuditRecord::new(
                &self.config.gate_id,
                &tool.name,
                &tool.permission,
                Utc::now(),
            )
            .denied(&denial.code);
            record.session_id = request.meta.session_id.clone();
            Some(record)
        } else {
            None
        };

        let mut response = ToolCallResponse::error(text);
        response.meta = ResponseMeta {
            denial: Some(DenialMeta {
                code: denial.code,
                message: denial.message,
                upgrade: denial.upgrade,
                reason_codes: result.reason_codes,
                obligations: result.obligations,
                confident: result.confident,
            }),
            suggestions,
            attestation,
            consumption: None,
        };
        response
    }

    fn issue_receipt(
        &self,
        tool: &GatedTool,
        request: &ToolCallRequest,
        passport: Option<&LoadedPassport>,
        result: &VerifyResult,
        duration_ms: u64,
        now: chrono::DateTime<Utc>,
    ) -> Option<receipt::Receipt> {
        let passport = passport?;
        let signing_key = self.signing_key.as_ref()?;
        let key_id = self
            .config
            .commerce
            .signing_key_id
            .clone()
            .or_else(|| self.config.signing_key_id.clone())
            .unwrap_or_else(|| signature::key_fingerprint(&signing_key.verifying_key()));

        let params = receipt::IssueParams {
            gate_id: self.config.gate_id.clone(),
            subject_id: passport.passport().subject_id.clone(),
            passport_id: passport.passport().passport_id.clone(),
            permission_key: tool.permission.clone(),
            catalog_version: result.catalog_version.unwrap_or(0),
            effective_constraints: result.effective_constraints.clone(),
            request_nonce: request
                .arguments
                .get("request_nonce")
                .and_then(serde_json::Value::as_str)
                .map(String::from),
            duration_ms: Some(duration_ms),
            units: 1,
            timestamp: now,
        };

        match receipt::issue(
            params,
            |payload| signing_key.sign(payload).to_bytes().to_vec(),
            &key_id,
        ) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(error = %e, "receipt issuance failed");
                None
            }
        }
    }
}
