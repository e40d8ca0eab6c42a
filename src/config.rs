//! Gate configuration
//!
//! The recognized options and their environment overrides. Environment
//! variables map 1:1 to root keys: scalars as plain strings
//! (`UNIPLEX_GATE_ID`, `UNIPLEX_API_URL`, `UNIPLEX_GATE_SECRET`,
//! `UNIPLEX_SIGNING_KEY_ID`), object-valued roots as JSON
//! (`UNIPLEX_CACHE`, `UNIPLEX_ANONYMOUS`, ...), lists comma-separated
//! (`UNIPLEX_TRUSTED_ISSUERS`).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constraints::ConstraintMap;
use crate::credential::Passport;
use crate::pipeline::{AnonymousPolicy, FailMode, FailModeOverride};
use crate::{GateError, Result};

pub const DEFAULT_API_URL: &str = "https://api.uniplex.ai";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub gate_id: String,
    pub uniplex_api_url: String,
    pub gate_secret: Option<String>,
    pub signing_key_id: Option<String>,
    pub safe_default: SafeDefaultConfig,
    pub trusted_issuers: Vec<String>,
    pub trust_networks: Vec<String>,
    pub cache: CacheConfig,
    pub audit: AuditConfig,
    pub commerce: CommerceConfig,
    pub anonymous: AnonymousConfig,
    pub test_mode: TestModeConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            gate_id: String::new(),
            uniplex_api_url: DEFAULT_API_URL.to_string(),
            gate_secret: None,
            signing_key_id: None,
            safe_default: SafeDefaultConfig::default(),
            trusted_issuers: vec![],
            trust_networks: vec![],
            cache: CacheConfig::default(),
            audit: AuditConfig::default(),
            commerce: CommerceConfig::default(),
            anonymous: AnonymousConfig::default(),
            test_mode: TestModeConfig::default(),
        }
    }
}

impl GateConfig {
    pub fn new(gate_id: impl Into<String>) -> Self {
        Self {
            gate_id: gate_id.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: GateConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Build entirely from the environment. `UNIPLEX_GATE_ID` is required.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gate_id.is_empty() {
            return Err(GateError::Upstream("gate_id is required".to_string()));
        }
        Ok(())
    }

    /// Overlay recognized `UNIPLEX_*` variables onto this configuration.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("UNIPLEX_GATE_ID") {
            self.gate_id = v;
        }
        if let Ok(v) = std::env::var("UNIPLEX_API_URL") {
            self.uniplex_api_url = v;
        }
        if let Ok(v) = std::env::var("UNIPLEX_GATE_SECRET") {
            self.gate_secret = Some(v);
        }
        if let Ok(v) = std::env::var("UNIPLEX_SIGNING_KEY_ID") {
            self.signing_key_id = Some(v);
        }
        if let Ok(v) = std::env::var("UNIPLEX_TRUSTED_ISSUERS") {
            self.trusted_issuers = split_list(&v);
        }
        if let Ok(v) = std::env::var("UNIPLEX_TRUST_NETWORKS") {
            self.trust_networks = split_list(&v);
        }
        apply_json_env("UNIPLEX_SAFE_DEFAULT", &mut self.safe_default);
        apply_json_env("UNIPLEX_CACHE", &mut self.cache);
        apply_json_env("UNIPLEX_AUDIT", &mut self.audit);
        apply_json_env("UNIPLEX_COMMERCE", &mut self.commerce);
        apply_json_env("UNIPLEX_ANONYMOUS", &mut self.anonymous);
        apply_json_env("UNIPLEX_TEST_MODE", &mut self.test_mode);
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn apply_json_env<T: for<'de> Deserialize<'de>>(var: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match serde_json::from_str(&raw) {
            Ok(parsed) => *target = parsed,
            Err(e) => tracing::warn!(var, error = %e, "ignoring unparseable env override"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeDefaultConfig {
    pub enabled: bool,
    pub auto_issue: bool,
    pub permissions: Vec<String>,
    pub constraints: ConstraintMap,
    /// ISO-8601 duration, passed through to the issuer.
    pub max_lifetime: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub catalog_max_age_minutes: u64,
    pub revocation_max_age_minutes: u64,
    pub key_max_age_minutes: u64,
    pub fail_mode: FailMode,
    pub fail_mode_overrides: HashMap<String, FailModeOverrideConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            catalog_max_age_minutes: 5,
            revocation_max_age_minutes: 1,
            key_max_age_minutes: 5,
            fail_mode: FailMode::FailOpen,
            fail_mode_overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_max_age_minutes * 60)
    }

    pub fn revocation_ttl(&self) -> Duration {
        Duration::from_secs(self.revocation_max_age_minutes * 60)
    }

    pub fn keys_ttl(&self) -> Duration {
        Duration::from_secs(self.key_max_age_minutes * 60)
    }

    pub fn overrides(&self) -> HashMap<String, FailModeOverride> {
        self.fail_mode_overrides
            .iter()
            .map(|(action, o)| (action.clone(), o.to_override()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailModeOverrideConfig {
    pub fail_mode: FailMode,
    pub revocation_max_age_seconds: Option<u64>,
}

impl Default for FailModeOverrideConfig {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::FailOpen,
            revocation_max_age_seconds: None,
        }
    }
}

impl FailModeOverrideConfig {
    pub fn to_override(&self) -> FailModeOverride {
        FailModeOverride {
            fail_mode: self.fail_mode,
            revocation_max_age: self.revocation_max_age_seconds.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    Full,
    Sampled,
    SessionDigest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_inputs: bool,
    pub log_outputs: bool,
    pub webhook_url: Option<String>,
    pub mode: AuditMode,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_inputs: false,
            log_outputs: false,
            webhook_url: None,
            mode: AuditMode::Full,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommerceConfig {
    pub enabled: bool,
    pub issue_receipts: bool,
    pub signing_key_id: Option<String>,
}

impl Default for CommerceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            issue_receipts: true,
            signing_key_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymousConfig {
    pub enabled: bool,
    pub allowed_actions: Vec<String>,
    pub read_only: bool,
    pub rate_limit_per_minute: Option<u32>,
    pub rate_limit_per_hour: Option<u32>,
    pub upgrade_message: Option<String>,
}

impl AnonymousConfig {
    pub fn to_policy(&self) -> Option<AnonymousPolicy> {
        if !self.enabled {
            return None;
        }
        Some(AnonymousPolicy {
            allowed_actions: self.allowed_actions.iter().cloned().collect(),
            read_only: self.read_only,
            rate_limit_per_minute: self.rate_limit_per_minute,
            rate_limit_per_hour: self.rate_limit_per_hour,
            upgrade_message: self.upgrade_message.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestModeConfig {
    pub enabled: bool,
    pub mock_passport: Option<Passport>,
}
