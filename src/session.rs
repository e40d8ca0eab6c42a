//! Session Store
//!
//! In-memory map from session id to bound passport. A session holds at most
//! one passport at a time; replacement is permitted and lifetime policy is
//! the caller's. Safe-default issuance is a network operation and happens in
//! the facade, never here.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::credential::{LoadedPassport, Passport};
use crate::Result;

#[derive(Clone)]
pub struct Session {
    pub session_id: String,
    pub passport: Option<Arc<LoadedPassport>>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// The only entry point: fetch the session, creating it on first use,
    /// and touch its activity timestamp.
    pub fn get_or_create(&self, session_id: &str, now: DateTime<Utc>) -> Session {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session {
                session_id: session_id.to_string(),
                passport: None,
                created_at: now,
                last_activity_at: now,
            });
        entry.last_activity_at = now;
        entry.clone()
    }

    /// Bind a passport to a session, rebuilding its claims index.
    pub fn set_passport(&self, session_id: &str, passport: Passport, now: DateTime<Utc>) -> Result<()> {
        let loaded = Arc::new(LoadedPassport::load(passport)?);
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session {
                session_id: session_id.to_string(),
                passport: None,
                created_at: now,
                last_activity_at: now,
            });
        entry.passport = Some(loaded);
        entry.last_activity_at = now;
        Ok(())
    }

    pub fn clear_passport(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.passport = None;
        }
    }

    /// Drop sessions idle longer than `max_idle`.
    pub fn purge_inactive(&self, max_idle: Duration, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now - s.last_activity_at <= max_idle);
        before - self.sessions.len()
    }

    /// Unbind passports whose expiry has passed. The session itself stays.
    pub fn clear_expired_passports(&self, now: DateTime<Utc>) -> usize {
        let mut cleared = 0;
        for mut entry in self.sessions.iter_mut() {
            let expired = entry
                .passport
                .as_ref()
                .map(|p| p.passport().expires_at <= now)
                .unwrap_or(false);
            if expired {
                entry.passport = None;
                cleared += 1;
            }
        }
        cleared
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
