//! Passport (credential) model
//!
//! A passport is a signed token authorizing its bearer to invoke named
//! permissions at a target gate under declared constraints. The passport
//! value itself is immutable after loading; the claims-by-key index is a
//! derived, rebuilt-on-load structure and is never mutated independently.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constraints::ConstraintMap;
use crate::{GateError, Result};

/// A single claim: one permission key plus the constraints the issuer
/// attached to that permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// Permission key, e.g. `flights:book`.
    pub key: String,

    /// Per-claim constraint mapping.
    #[serde(default)]
    pub constraints: ConstraintMap,
}

/// A signed passport as presented by a caller.
///
/// Field declaration order matches the canonical signing payload
/// (see `canonical::passport_signing_payload`); reordering fields here
/// breaks signature compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passport {
    /// Unique passport ID.
    pub passport_id: String,

    /// Issuer that signed this passport.
    pub issuer_id: String,

    /// Subject the passport was issued to.
    pub subject_id: String,

    /// Gate this passport targets.
    pub gate_id: String,

    /// Ordered claims.
    #[serde(default)]
    pub claims: Vec<Claim>,

    /// Passport-wide constraint mapping.
    #[serde(default)]
    pub constraints: ConstraintMap,

    /// When the passport expires.
    pub expires_at: DateTime<Utc>,

    /// When the passport was issued.
    pub issued_at: DateTime<Utc>,

    /// Optional catalog-version pin, gate id to version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_version_pin: Option<BTreeMap<String, u32>>,

    /// Detached hex-encoded Ed25519 signature over the canonical payload.
    pub signature: String,
}

/// A passport plus its derived claims-by-key index.
///
/// The index is a pure function of the claims list: loading the same
/// passport twice produces the same index.
#[derive(Debug, Clone)]
pub struct LoadedPassport {
    passport: Passport,
    claims_by_key: HashMap<String, usize>,
}

impl LoadedPassport {
    /// Validate invariants and build the claims index.
    ///
    /// Fails when `expires_at` is not strictly after `issued_at`.
    pub fn load(passport: Passport) -> Result<Self> {
        if passport.expires_at <= passport.issued_at {
            return Err(GateError::InvalidPassport(format!(
                "expires_at {} is not after issued_at {}",
                passport.expires_at, passport.issued_at
            )));
        }

        let claims_by_key = Self::build_index(&passport.claims);
        Ok(Self {
            passport,
            claims_by_key,
        })
    }

    /// Parse and load a passport from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let passport: Passport = serde_json::from_str(json)?;
        Self::load(passport)
    }

    // First occurrence wins when a key appears twice in the claims list.
    fn build_index(claims: &[Claim]) -> HashMap<String, usize> {
        let mut index = HashMap::with_capacity(claims.len());
        for (i, claim) in claims.iter().enumerate() {
            index.entry(claim.key.clone()).or_insert(i);
        }
        index
    }

    /// O(1) claim lookup by permission key.
    pub fn claim(&self, key: &str) -> Option<&Claim> {
        self.claims_by_key
            .get(key)
            .map(|&i| &self.passport.claims[i])
    }

    /// Whether the passport grants the permission at all.
    pub fn has_claim(&self, key: &str) -> bool {
        self.claims_by_key.contains_key(key)
    }

    /// The catalog version this passport pins for the given gate, if any.
    pub fn pinned_version(&self, gate_id: &str) -> Option<u32> {
        self.passport
            .catalog_version_pin
            .as_ref()
            .and_then(|pins| pins.get(gate_id).copied())
    }

    /// The underlying immutable passport.
    pub fn passport(&self) -> &Passport {
        &self.passport
    }
}
