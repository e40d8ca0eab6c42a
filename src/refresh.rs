//! Background Cache Refresh
//!
//! Talks to the upstream authority and replaces cache snapshots on
//! independent timers. Transport and parse errors are logged and swallowed;
//! the prior snapshot stays authoritative. Nothing here is ever called from
//! the hot path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheStore, RevocationSet};
use crate::catalog::{Catalog, CatalogSnapshot};
use crate::constraints::ConstraintMap;
use crate::credential::Passport;
use crate::signature::{parse_public_key, IssuerKeyMap};
use crate::{GateError, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the upstream authority endpoints.
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    gate_id: String,
    gate_secret: Option<String>,
    trusted_issuers: Option<HashSet<String>>,
}

#[derive(Debug, Deserialize)]
struct RevocationsResponse {
    passport_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    keys: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SafeDefaultResponse {
    passport: Passport,
}

/// Body for the safe-default issuance endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SafeDefaultRequest {
    pub session_id: String,
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "ConstraintMap::is_empty")]
    pub constraints: ConstraintMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lifetime: Option<String>,
}

impl UpstreamClient {
    pub fn new(
        base_url: impl Into<String>,
        gate_id: impl Into<String>,
        gate_secret: Option<String>,
        trusted_issuers: Vec<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| GateError::Upstream(e.to_string()))?;
        let trusted_issuers = if trusted_issuers.is_empty() {
            None
        } else {
            Some(trusted_issuers.into_iter().collect())
        };
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gate_id: gate_id.into(),
            gate_secret,
            trusted_issuers,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(secret) = &self.gate_secret {
            builder = builder.bearer_auth(secret);
        }
        builder
    }

    pub async fn fetch_catalog(&self) -> Result<CatalogSnapshot> {
        let mut catalog: Catalog = self
            .get(&format!("/gates/{}/catalog", self.gate_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if catalog.gate_id.is_empty() {
            catalog.gate_id = self.gate_id.clone();
        }
        Ok(CatalogSnapshot::new(catalog, Default::default()))
    }

    pub async fn fetch_revocations(&self) -> Result<RevocationSet> {
        let response: RevocationsResponse = self
            .get(&format!("/gates/{}/revocations", self.gate_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.passport_ids.into_iter().collect())
    }

    pub async fn fetch_issuer_keys(&self) -> Result<IssuerKeyMap> {
        let response: KeysResponse = self
            .get("/issuers/keys")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(build_key_map(response.keys, self.trusted_issuers.as_ref()))
    }

    /// Bootstrap a minimal, short-lived passport for a fresh session.
    /// Network operation; must stay outside the hot path.
    pub async fn issue_safe_default(&self, request: &SafeDefaultRequest) -> Result<Passport> {
        let mut builder = self.http.post(format!(
            "{}/gates/{}/passports/safe-default",
            self.base_url, self.gate_id
        ));
        if let Some(secret) = &self.gate_secret {
            builder = builder.bearer_auth(secret);
        }
        let response: SafeDefaultResponse = builder
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.passport)
    }
}

// A key that fails to parse is skipped with a warning rather than failing
// the whole refresh; the published entry is always complete over the keys
// it contains.
fn build_key_map(raw: HashMap<String, String>, trusted: Option<&HashSet<String>>) -> IssuerKeyMap {
    let mut keys = IssuerKeyMap::with_capacity(raw.len());
    for (issuer_id, hex_key) in raw {
        if let Some(allowed) = trusted {
            if !allowed.contains(&issuer_id) {
                continue;
            }
        }
        match parse_public_key(&hex_key) {
            Ok(key) => {
                keys.insert(issuer_id, key);
            }
            Err(e) => {
                tracing::warn!(issuer_id, error = %e, "skipping unparseable issuer key");
            }
        }
    }
    keys
}

/// Per-entry refresh cadence.
#[derive(Debug, Clone, Copy)]
pub struct RefreshIntervals {
    pub catalog: Duration,
    pub revocations: Duration,
    pub keys: Duration,
}

impl Default for RefreshIntervals {
    fn default() -> Self {
        Self {
            catalog: Duration::from_secs(300),
            revocations: Duration::from_secs(60),
            keys: Duration::from_secs(300),
        }
    }
}

/// Handle owning the three refresh tasks. Dropping it stops them.
pub struct RefresherHandle {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RefresherHandle {
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RefresherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start the three background refresh loops. Each fetches immediately,
/// then on its own timer.
pub fn spawn_refresher(
    client: Arc<UpstreamClient>,
    cache: Arc<CacheStore>,
    intervals: RefreshIntervals,
) -> RefresherHandle {
    let catalog_task = {
        let client = Arc::clone(&client);
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(intervals.catalog);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                match client.fetch_catalog().await {
                    Ok(snapshot) => {
                        tracing::debug!(version = snapshot.current().version, "catalog refreshed");
                        cache.put_catalog(snapshot);
                    }
                    Err(e) => tracing::warn!(error = %e, "catalog refresh failed, keeping prior"),
                }
            }
        })
    };

    let revocation_task = {
        let client = Arc::clone(&client);
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(intervals.revocations);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                match client.fetch_revocations().await {
                    Ok(revoked) => {
                        tracing::debug!(count = revoked.len(), "revocation set refreshed");
                        cache.put_revocations(revoked);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "revocation refresh failed, keeping prior")
                    }
                }
            }
        })
    };

    let keys_task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(intervals.keys);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            match client.fetch_issuer_keys().await {
                Ok(keys) => {
                    tracing::debug!(count = keys.len(), "issuer keys refreshed");
                    cache.put_issuer_keys(keys);
                }
                Err(e) => tracing::warn!(error = %e, "issuer key refresh failed, keeping prior"),
            }
        }
    });

    RefresherHandle {
        tasks: vec![catalog_task, revocation_task, keys_task],
    }
}
