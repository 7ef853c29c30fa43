//! In-memory session tokens.
//!
//! A session is minted the first time a valid API token is presented and can
//! then be used in its place. An identity holds at most one live session;
//! presenting the API token again returns that session. Sessions expire after
//! a fixed TTL: reads evict lazily, and `sweep_expired()` is called
//! periodically so pools can be torn down eagerly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::RngCore;

pub const SESSION_PREFIX: &str = "sess_";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub(crate) struct SessionEntry {
    identity: String,
    issued_at: DateTime<Utc>,
    expires_at: Instant,
}

/// Issued session credential.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub identity: String,
    pub issued_at: DateTime<Utc>,
}

impl SessionEntry {
    fn session(&self, token: &str) -> Session {
        Session {
            token: token.to_string(),
            identity: self.identity.clone(),
            issued_at: self.issued_at,
        }
    }
}

/// Lock order: `by_identity` before `sessions`, never the reverse.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, SessionEntry>>,
    by_identity: Arc<DashMap<String, String>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            by_identity: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The live session for `identity`, minting one if it has none.
    pub fn issue(&self, identity: &str) -> Session {
        let now = Instant::now();
        match self.by_identity.entry(identity.to_string()) {
            Entry::Occupied(mut current) => {
                if let Some(entry) = self.sessions.get(current.get()) {
                    if now < entry.expires_at {
                        return entry.session(current.get());
                    }
                }
                let session = self.mint(identity);
                let stale = current.insert(session.token.clone());
                self.sessions.remove(&stale);
                session
            }
            Entry::Vacant(slot) => {
                let session = self.mint(identity);
                slot.insert(session.token.clone());
                session
            }
        }
    }

    fn mint(&self, identity: &str) -> Session {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = format!(
            "{}{}",
            SESSION_PREFIX,
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
        );
        let entry = SessionEntry {
            identity: identity.to_string(),
            issued_at: Utc::now(),
            expires_at: Instant::now() + self.ttl,
        };
        let session = entry.session(&token);
        self.sessions.insert(token, entry);
        tracing::debug!(identity = %identity, "session issued");
        session
    }

    fn unindex(&self, identity: &str, token: &str) {
        self.by_identity.remove_if(identity, |_, current| current == token);
    }

    /// Identity behind a live session, or `None` if unknown or expired.
    pub fn resolve(&self, token: &str) -> Option<String> {
        if !token.starts_with(SESSION_PREFIX) {
            return None;
        }
        if let Some(entry) = self.sessions.get(token) {
            if Instant::now() < entry.expires_at {
                return Some(entry.identity.clone());
            }
            // expired: drop the ref before removing
            let identity = entry.identity.clone();
            drop(entry);
            if self.sessions.remove(token).is_some() {
                self.unindex(&identity, token);
            }
        }
        None
    }

    /// Explicit logout. Returns the identity the session belonged to.
    pub fn revoke(&self, token: &str) -> Option<String> {
        let (_, entry) = self.sessions.remove(token)?;
        self.unindex(&entry.identity, token);
        Some(entry.identity)
    }

    /// Drop every session belonging to `identity`. Returns how many went.
    pub fn revoke_identity(&self, identity: &str) -> usize {
        let mut revoked = 0;
        self.sessions.retain(|_, entry| {
            if entry.identity == identity {
                revoked += 1;
                false
            } else {
                true
            }
        });
        self.by_identity.remove(identity);
        revoked
    }

    /// Remove expired sessions and return the identities they belonged to.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut expired: Vec<(String, String)> = Vec::new();
        self.sessions.retain(|token, entry| {
            if entry.expires_at > now {
                true
            } else {
                expired.push((entry.identity.clone(), token.clone()));
                false
            }
        });
        for (identity, token) in &expired {
            self.unindex(identity, token);
        }
        let mut identities: Vec<String> = expired.into_iter().map(|(identity, _)| identity).collect();
        identities.sort();
        identities.dedup();
        identities
    }

    pub fn has_live_session(&self, identity: &str) -> bool {
        let Some(token) = self.by_identity.get(identity).map(|t| t.value().clone()) else {
            return false;
        };
        self.sessions
            .get(&token)
            .map(|e| e.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Distinct identities that currently hold a session.
    pub fn identities(&self) -> Vec<String> {
        let set: HashSet<String> = self.sessions.iter().map(|e| e.identity.clone()).collect();
        let mut ids: Vec<String> = set.into_iter().collect();
        ids.sort();
        ids
    }

    pub fn issued_at(&self, token: &str) -> Option<DateTime<Utc>> {
        self.sessions.get(token).map(|e| e.issued_at)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&self) {
        self.by_identity.clear();
        self.sessions.clear();
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}
