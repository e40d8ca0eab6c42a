//! Local Authorization Cache
//!
//! Holds the three signed-data snapshots the hot path reads: the permission
//! catalog, the revocation set, and the issuer public-key map. Each entry
//! refreshes independently and is replaced whole; a reader observes either
//! the old snapshot in full or the new one in full, never a mix.
//!
//! Reads never block refresh. Freshness is reported to the caller, not
//! enforced here; fail-open/fail-closed policy lives in the pipeline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogSnapshot;
use crate::signature::IssuerKeyMap;

/// Revoked passport ids.
pub type RevocationSet = HashSet<String>;

/// Default TTLs per entry.
pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_REVOCATION_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_KEYS_TTL: Duration = Duration::from_secs(300);

struct Entry<T> {
    value: Arc<T>,
    cached_at: Instant,
}

/// One snapshot handed to a reader.
pub struct CacheRead<T> {
    pub value: Arc<T>,
    /// Age of the snapshot at read time.
    pub age: Duration,
    /// Whether the snapshot is within its TTL.
    pub fresh: bool,
}

impl<T> CacheRead<T> {
    /// Re-judge freshness under a caller-supplied maximum age (per-action
    /// overrides use this).
    pub fn fresh_within(&self, max_age: Duration) -> bool {
        self.age <= max_age
    }
}

/// The in-memory cache of signed authorization data.
pub struct CacheStore {
    catalog: RwLock<Option<Entry<CatalogSnapshot>>>,
    revocations: RwLock<Option<Entry<RevocationSet>>>,
    issuer_keys: RwLock<Option<Entry<IssuerKeyMap>>>,

    catalog_ttl: Duration,
    revocation_ttl: Duration,
    keys_ttl: Duration,

    reads: AtomicU64,
    stale_reads: AtomicU64,
    refreshes: AtomicU64,
}

impl CacheStore {
    pub fn new(catalog_ttl: Duration, revocation_ttl: Duration, keys_ttl: Duration) -> Self {
        Self {
            catalog: RwLock::new(None),
            revocations: RwLock::new(None),
            issuer_keys: RwLock::new(None),
            catalog_ttl,
            revocation_ttl,
            keys_ttl,
            reads: AtomicU64::new(0),
            stale_reads: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    fn read<T>(&self, slot: &RwLock<Option<Entry<T>>>, ttl: Duration) -> Option<CacheRead<T>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = slot.read();
        let entry = guard.as_ref()?;
        let age = entry.cached_at.elapsed();
        let fresh = age <= ttl;
        if !fresh {
            self.stale_reads.fetch_add(1, Ordering::Relaxed);
        }
        Some(CacheRead {
            value: Arc::clone(&entry.value),
            age,
            fresh,
        })
    }

    fn write<T>(&self, slot: &RwLock<Option<Entry<T>>>, value: T) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        *slot.write() = Some(Entry {
            value: Arc::new(value),
            cached_at: Instant::now(),
        });
    }

    pub fn catalog(&self) -> Option<CacheRead<CatalogSnapshot>> {
        self.read(&self.catalog, self.catalog_ttl)
    }

    pub fn revocations(&self) -> Option<CacheRead<RevocationSet>> {
        self.read(&self.revocations, self.revocation_ttl)
    }

    pub fn issuer_keys(&self) -> Option<CacheRead<IssuerKeyMap>> {
        self.read(&self.issuer_keys, self.keys_ttl)
    }

    /// Replace the catalog snapshot.
    pub fn put_catalog(&self, snapshot: CatalogSnapshot) {
        self.write(&self.catalog, snapshot);
    }

    /// Replace the revocation set.
    pub fn put_revocations(&self, revoked: RevocationSet) {
        self.write(&self.revocations, revoked);
    }

    /// Replace the issuer key map.
    pub fn put_issuer_keys(&self, keys: IssuerKeyMap) {
        self.write(&self.issuer_keys, keys);
    }

    pub fn revocation_ttl(&self) -> Duration {
        self.revocation_ttl
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            reads: self.reads.load(Ordering::Relaxed),
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_TTL, DEFAULT_REVOCATION_TTL, DEFAULT_KEYS_TTL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub reads: u64,
    pub stale_reads: u64,
    pub refreshes: u64,
}
