use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::crypto::Key;
use crate::database::DatabaseGateway;
use crate::evidence::{EvidenceStore, SyncStatus};
use crate::types::{AgentIdentity, Identification, SyncInfo, SyncStats};

/// An authenticated agent, from handshake to BYE or timeout.
#[derive(Clone)]
pub struct Session {
    pub cookie: String,
    pub identity: AgentIdentity,
    pub agent_id: Option<String>,
    pub key: Key,
    pub peer: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub identification: Option<Identification>,
    pub stats: SyncStats,
}

// The session key stays out of logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("cookie", &self.cookie)
            .field("identity", &self.identity)
            .field("agent_id", &self.agent_id)
            .field("peer", &self.peer)
            .field("created_at", &self.created_at)
            .field("last_seen", &self.last_seen)
            .field("identification", &self.identification)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn sync_info(&self) -> SyncInfo {
        SyncInfo {
            ident: self.identity.ident.clone(),
            instance: self.identity.instance.clone(),
            platform: self.identity.platform,
            demo: self.identity.demo,
            level: self.identity.level,
            agent_id: self.agent_id.clone(),
            peer: self.peer.clone(),
            sync_time: self.created_at.timestamp(),
            identification: self.identification.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// Cookie → session table. One lock guards every mutation; the timeout sweep
/// collects expired entries under the lock and notifies outside of it.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    db: Arc<DatabaseGateway>,
    evidence: Arc<EvidenceStore>,
}

impl SessionManager {
    pub fn new(db: Arc<DatabaseGateway>, evidence: Arc<EvidenceStore>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            db,
            evidence,
        }
    }

    pub fn create(&self, identity: AgentIdentity, agent_id: Option<String>, key: Key, peer: &str) -> String {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        let cookie = loop {
            let mut candidate = uuid::Uuid::new_v4().simple().to_string();
            if let Some(limit) = identity.platform.cookie_limit() {
                candidate.truncate(limit);
            }
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        info!(
            instance = %identity.instance,
            ident = %identity.ident,
            platform = %identity.platform,
            peer,
            "session created"
        );
        sessions.insert(
            cookie.clone(),
            Session {
                cookie: cookie.clone(),
                identity,
                agent_id,
                key,
                peer: peer.to_string(),
                created_at: now,
                last_seen: now,
                identification: None,
                stats: SyncStats::default(),
            },
        );
        cookie
    }

    /// True for a live cookie; refreshes its last-seen time.
    pub fn check(&self, cookie: &str) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(cookie) {
            Some(session) => {
                session.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, cookie: &str) -> Option<Session> {
        self.sessions.lock().get(cookie).cloned()
    }

    /// Applies `f` to the live session. False if the cookie is gone.
    pub fn update(&self, cookie: &str, f: impl FnOnce(&mut Session)) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(cookie) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, cookie: &str) -> Option<Session> {
        let removed = self.sessions.lock().remove(cookie);
        if let Some(session) = &removed {
            debug!(instance = %session.identity.instance, "session deleted");
        }
        removed
    }

    pub fn length(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn all(&self) -> Vec<Session> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Removes sessions idle for at least `window` as of `now`.
    pub(crate) fn expire(&self, window: Duration, now: DateTime<Utc>) -> Vec<Session> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let mut sessions = self.sessions.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now.signed_duration_since(s.last_seen) >= window)
            .map(|(cookie, _)| cookie.clone())
            .collect();

        expired
            .iter()
            .filter_map(|cookie| sessions.remove(cookie))
            .map(|mut session| {
                session.stats.timed_out = true;
                session.stats.ended_at = Some(now.timestamp());
                session
            })
            .collect()
    }

    /// Timeout sweep: expires idle sessions and reports them as timed out.
    pub async fn timeout(&self, window: Duration) -> usize {
        let now = Utc::now();
        let expired = self.expire(window, now);
        for session in &expired {
            warn!(
                instance = %session.identity.instance,
                idle_secs = now.signed_duration_since(session.last_seen).num_seconds(),
                "session timed out"
            );
            self.db.sync_timeout(&session.sync_info()).await;
            if let Err(e) = self
                .evidence
                .set_sync_status(&session.identity.instance, SyncStatus::Timeout, now.timestamp())
                .await
            {
                warn!(instance = %session.identity.instance, "cannot record timeout: {}", e);
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{identity, TestRelay};
    use crate::types::Platform;

    #[tokio::test]
    async fn test_created_session_is_valid() {
        let relay = TestRelay::connected().await;
        let cookie = relay.sessions.create(identity(), None, [1u8; 16], "10.0.0.1");
        assert!(!cookie.is_empty());
        assert!(relay.sessions.check(&cookie));
        assert!(!relay.sessions.check("not-a-cookie"));
        assert_eq!(relay.sessions.get(&cookie).unwrap().peer, "10.0.0.1");
        assert_eq!(relay.sessions.length(), 1);
        assert_eq!(relay.sessions.all()[0].cookie, cookie);
    }

    #[tokio::test]
    async fn test_cookies_are_unique() {
        let relay = TestRelay::connected().await;
        let mut cookies: Vec<String> = (0..200)
            .map(|_| relay.sessions.create(identity(), None, [0u8; 16], "peer"))
            .collect();
        cookies.sort();
        cookies.dedup();
        assert_eq!(cookies.len(), 200);
    }

    #[tokio::test]
    async fn test_symbian_cookie_fits_legacy_buffer() {
        let relay = TestRelay::connected().await;
        let mut id = identity();
        id.platform = Platform::Symbian;
        let cookie = relay.sessions.create(id, None, [0u8; 16], "peer");
        assert_eq!(cookie.len(), 26);
        assert!(relay.sessions.check(&cookie));
    }

    #[tokio::test]
    async fn test_expiry_respects_window() {
        let relay = TestRelay::connected().await;
        let cookie = relay.sessions.create(identity(), None, [0u8; 16], "peer");
        let seen = relay.sessions.get(&cookie).unwrap().last_seen;
        let window = Duration::from_secs(7200);

        let just_before = seen + chrono::Duration::seconds(7199);
        assert!(relay.sessions.expire(window, just_before).is_empty());
        assert!(relay.sessions.check(&cookie));

        let seen = relay.sessions.get(&cookie).unwrap().last_seen;
        let expired = relay.sessions.expire(window, seen + chrono::Duration::seconds(7200));
        assert_eq!(expired.len(), 1);
        assert!(expired[0].stats.timed_out);
        assert!(!relay.sessions.check(&cookie));
    }

    #[tokio::test]
    async fn test_timeout_sweep_notifies_database() {
        let relay = TestRelay::connected().await;
        let id = identity();
        relay.evidence.register(&id, None, "peer").await.unwrap();
        let stale = relay.sessions.create(id.clone(), None, [0u8; 16], "peer");

        assert_eq!(relay.sessions.timeout(Duration::from_secs(3600)).await, 0);
        assert!(relay.sessions.check(&stale));

        assert_eq!(relay.sessions.timeout(Duration::ZERO).await, 1);
        assert!(!relay.sessions.check(&stale));
        assert_eq!(relay.mock.calls("sync_timeout"), 1);
        let info = relay.evidence.instance(&id.instance).await.unwrap().unwrap();
        assert_eq!(info.sync_status, SyncStatus::Timeout);
    }

    #[tokio::test]
    async fn test_debug_hides_session_key() {
        let relay = TestRelay::connected().await;
        let cookie = relay.sessions.create(identity(), None, [0xAB; 16], "peer");
        let rendered = format!("{:?}", relay.sessions.get(&cookie).unwrap());
        assert!(!rendered.contains("171, 171"));
        assert!(!rendered.contains("key"));
    }
}
