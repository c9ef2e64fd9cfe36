//! Session storage keyed by identity key.

use bsv_auth_msg::{Certificate, IdentityKey};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Bridge-side view of an authenticated peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub identity_key: IdentityKey,
    pub is_authenticated: bool,
    pub certificates: Vec<Certificate>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(identity_key: IdentityKey, is_authenticated: bool) -> Self {
        let now = Utc::now();
        Self {
            identity_key,
            is_authenticated,
            certificates: Vec::new(),
            created_at: now,
            last_activity: now,
        }
    }
}

/// Partial update applied by [`SessionStore::update_session`]. Every update
/// refreshes `last_activity`.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub is_authenticated: Option<bool>,
    pub certificates: Option<Vec<Certificate>>,
}

/// Storage of sessions, keyed by identity key.
pub trait SessionStore: Send + Sync {
    fn has_session(&self, identity_key: &IdentityKey) -> bool;

    fn get_session(&self, identity_key: &IdentityKey) -> Option<SessionRecord>;

    /// Insert or replace the session for the record's identity.
    fn create_session(&self, record: SessionRecord) -> Result<()>;

    fn update_session(&self, identity_key: &IdentityKey, update: SessionUpdate) -> Result<()>;

    /// Returns whether a session existed.
    fn delete_session(&self, identity_key: &IdentityKey) -> bool;

    /// Drop sessions idle past the store's max age. Returns how many.
    fn sweep_expired(&self, now: DateTime<Utc>) -> usize;
}

/// Process-local session store with idle expiry.
pub struct InMemorySessionStore {
    sessions: DashMap<IdentityKey, SessionRecord>,
    max_age: ChronoDuration,
}

impl InMemorySessionStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_age: ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::days(36_500)),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl SessionStore for InMemorySessionStore {
    fn has_session(&self, identity_key: &IdentityKey) -> bool {
        self.sessions.contains_key(identity_key)
    }

    fn get_session(&self, identity_key: &IdentityKey) -> Option<SessionRecord> {
        self.sessions.get(identity_key).map(|entry| entry.clone())
    }

    fn create_session(&self, record: SessionRecord) -> Result<()> {
        debug!(identity_key = %record.identity_key, "session created");
        self.sessions.insert(record.identity_key.clone(), record);
        Ok(())
    }

    fn update_session(&self, identity_key: &IdentityKey, update: SessionUpdate) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(identity_key)
            .ok_or_else(|| Error::Internal(format!("no session for {}", identity_key)))?;
        if let Some(is_authenticated) = update.is_authenticated {
            session.is_authenticated = is_authenticated;
        }
        if let Some(certificates) = update.certificates {
            session.certificates = certificates;
        }
        session.last_activity = Utc::now();
        Ok(())
    }

    fn delete_session(&self, identity_key: &IdentityKey) -> bool {
        self.sessions.remove(identity_key).is_some()
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now.signed_duration_since(session.last_activity) <= self.max_age);
        let expired = before.saturating_sub(self.sessions.len());
        if expired > 0 {
            debug!(expired, "expired idle sessions");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> IdentityKey {
        let mut bytes = [byte; 33];
        bytes[0] = 0x02;
        IdentityKey::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_session_lifecycle() {
        let store = InMemorySessionStore::default();
        let alice = key(1);
        assert!(!store.has_session(&alice));
        assert!(store.update_session(&alice, SessionUpdate::default()).is_err());

        store
            .create_session(SessionRecord::new(alice.clone(), true))
            .unwrap();
        assert!(store.has_session(&alice));

        store
            .update_session(
                &alice,
                SessionUpdate {
                    certificates: Some(vec![Certificate::new("age", "02aa")]),
                    ..Default::default()
                },
            )
            .unwrap();
        let session = store.get_session(&alice).unwrap();
        assert_eq!(session.certificates.len(), 1);
        assert!(session.is_authenticated);

        assert!(store.delete_session(&alice));
        assert!(!store.delete_session(&alice));
    }

    #[test]
    fn test_sweep_drops_idle_sessions() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        store.create_session(SessionRecord::new(key(1), true)).unwrap();
        store.create_session(SessionRecord::new(key(2), true)).unwrap();

        assert_eq!(store.sweep_expired(Utc::now()), 0);
        assert_eq!(
            store.sweep_expired(Utc::now() + ChronoDuration::seconds(61)),
            2
        );
        assert!(store.is_empty());
    }
}
