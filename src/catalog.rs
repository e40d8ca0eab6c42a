//! Permission catalog
//!
//! The catalog is the gate authority's signed declaration of the permissions
//! it recognizes, their risk levels, and their default constraints. Term
//! constraints in the catalog are authoritative; credential values for them
//! are discarded during merge.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constraints::ConstraintMap;

/// Risk classification for a permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// One permission as declared by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSpec {
    /// Permission key, e.g. `flights:book`.
    pub key: String,

    /// Human-readable name.
    pub display_name: String,

    /// Risk level.
    pub risk: RiskLevel,

    /// Default constraint mapping (authoritative for term constraints).
    #[serde(default)]
    pub default_constraints: ConstraintMap,

    /// Constraint keys a credential must declare to use this permission.
    #[serde(default)]
    pub required_constraints: Vec<String>,

    /// Template name to hint at when a caller lacks this permission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_template: Option<String>,
}

/// A published catalog version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    /// Not part of the upstream response body (the gate id is in the URL);
    /// the refresher fills it in.
    #[serde(default)]
    pub gate_id: String,
    pub version: u32,
    pub min_compatible_version: u32,
    pub permissions: Vec<PermissionSpec>,
    pub published_at: DateTime<Utc>,
}

impl Catalog {
    /// Linear permission lookup. Used for retained (non-current) versions;
    /// the current version goes through the snapshot index instead.
    pub fn permission(&self, key: &str) -> Option<&PermissionSpec> {
        self.permissions.iter().find(|p| p.key == key)
    }
}

/// Outcome of resolving a credential's catalog-version pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionResolution {
    /// Use the current catalog.
    Current,
    /// Use a retained older version.
    Retained(u32),
    /// The pin is below the minimum compatible version. Permanent denial.
    Deprecated,
}

/// The cached catalog: current version plus its permission index, and any
/// retained older versions.
///
/// Built once per refresh and treated as immutable afterwards.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    current: Catalog,
    by_key: HashMap<String, usize>,
    retained: BTreeMap<u32, Catalog>,
}

impl CatalogSnapshot {
    pub fn new(current: Catalog, retained: BTreeMap<u32, Catalog>) -> Self {
        let by_key = current
            .permissions
            .iter()
            .enumerate()
            .map(|(i, p)| (p.key.clone(), i))
            .collect();
        Self {
            current,
            by_key,
            retained,
        }
    }

    pub fn current(&self) -> &Catalog {
        &self.current
    }

    /// O(1) permission lookup in the current catalog.
    pub fn permission(&self, key: &str) -> Option<&PermissionSpec> {
        self.by_key.get(key).map(|&i| &self.current.permissions[i])
    }

    /// Resolve a version pin.
    ///
    /// No pin resolves to current. A pin below the minimum compatible
    /// version is deprecated regardless of retention. A compatible pin
    /// resolves to the retained version when we still hold it, and falls
    /// forward to current otherwise (current is always a superset-or-later
    /// of any compatible version).
    pub fn resolve(&self, pin: Option<u32>) -> VersionResolution {
        match pin {
            None => VersionResolution::Current,
            Some(v) if v < self.current.min_compatible_version => VersionResolution::Deprecated,
            Some(v) if v == self.current.version => VersionResolution::Current,
            Some(v) if self.retained.contains_key(&v) => VersionResolution::Retained(v),
            Some(_) => VersionResolution::Current,
        }
    }

    /// The catalog a resolution points at, with its effective version.
    pub fn resolved(&self, resolution: VersionResolution) -> Option<(&Catalog, u32)> {
        match resolution {
            VersionResolution::Current => Some((&self.current, self.current.version)),
            VersionResolution::Retained(v) => self.retained.get(&v).map(|c| (c, v)),
            VersionResolution::Deprecated => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn permission(key: &str) -> PermissionSpec {
        PermissionSpec {
            key: key.into(),
            display_name: key.into(),
            risk: RiskLevel::Low,
            default_constraints: ConstraintMap::new(),
            required_constraints: vec![],
            upgrade_template: None,
        }
    }

    fn catalog(version: u32, min_compatible: u32) -> Catalog {
        Catalog {
            gate_id: "gate_travel".into(),
            version,
            min_compatible_version: min_compatible,
            permissions: vec![permission("flights:search"), permission("flights:book")],
            published_at: Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_indexed_lookup() {
        let snapshot = CatalogSnapshot::new(catalog(5, 3), BTreeMap::new());
        assert!(snapshot.permission("flights:search").is_some());
        assert!(snapshot.permission("hotels:book").is_none());
    }

    #[test]
    fn test_no_pin_resolves_current() {
        let snapshot = CatalogSnapshot::new(catalog(5, 3), BTreeMap::new());
        assert_eq!(snapshot.resolve(None), VersionResolution::Current);
        let (_, version) = snapshot.resolved(VersionResolution::Current).unwrap();
        assert_eq!(version, 5);
    }

    #[test]
    fn test_pin_below_min_is_deprecated() {
        let snapshot = CatalogSnapshot::new(catalog(5, 3), BTreeMap::new());
        assert_eq!(snapshot.resolve(Some(2)), VersionResolution::Deprecated);
        assert!(snapshot.resolved(VersionResolution::Deprecated).is_none());
    }

    #[test]
    fn test_retained_pin_resolves_retained() {
        let mut retained = BTreeMap::new();
        retained.insert(4, catalog(4, 3));
        let snapshot = CatalogSnapshot::new(catalog(5, 3), retained);
        assert_eq!(snapshot.resolve(Some(4)), VersionResolution::Retained(4));
        let (c, version) = snapshot.resolved(VersionResolution::Retained(4)).unwrap();
        assert_eq!(version, 4);
        assert_eq!(c.version, 4);
    }

    #[test]
    fn test_unretained_compatible_pin_falls_forward() {
        let snapshot = CatalogSnapshot::new(catalog(5, 3), BTreeMap::new());
        assert_eq!(snapshot.resolve(Some(4)), VersionResolution::Current);
    }

    #[test]
    fn test_min_boundary_is_inclusive() {
        let snapshot = CatalogSnapshot::new(catalog(5, 3), BTreeMap::new());
        // A pin exactly at min_compatible_version must resolve.
        assert_eq!(snapshot.resolve(Some(3)), VersionResolution::Current);
    }
}
