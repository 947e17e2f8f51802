//! Session State
//!
//! Per-user context for one sign-in: the pending PIN, the account token once
//! approved, and the candidate list awaiting a save. Sessions live in a
//! registry keyed by an opaque id and expire after a period of inactivity.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::candidates::CandidateServer;
use crate::token::AccessToken;

/// Resolution progress for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Started,
    Polling,
    ServersReady,
    Saving,
    Saved,
    Failed(&'static str),
}

/// A PIN issued by `start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExchange {
    pub pin_id: u64,
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PendingExchange {
    pub fn new(pin_id: u64, code: String, expires_at: Option<&str>) -> Self {
        Self {
            pin_id,
            code,
            issued_at: Utc::now(),
            expires_at: expires_at
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| now >= t).unwrap_or(false)
    }
}

/// Mutable state for one user's sign-in
#[derive(Debug)]
pub struct SessionContext {
    /// `X-Plex-Client-Identifier`, stable for the life of the session
    pub client_id: String,
    pub pending: Option<PendingExchange>,
    /// Account token from the approved PIN
    pub exchange_token: Option<AccessToken>,
    pub candidates: Vec<CandidateServer>,
    pub phase: Phase,
    last_seen: Instant,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().simple().to_string(),
            pending: None,
            exchange_token: None,
            candidates: Vec::new(),
            phase: Phase::Idle,
            last_seen: Instant::now(),
        }
    }

    /// Replace any previous exchange; the old PIN becomes unknown
    pub fn begin_exchange(&mut self, pending: PendingExchange) {
        self.pending = Some(pending);
        self.exchange_token = None;
        self.candidates.clear();
        self.phase = Phase::Started;
    }

    /// Forget the exchange so the caller must start over
    pub fn abandon_exchange(&mut self, reason: &'static str) {
        self.pending = None;
        self.exchange_token = None;
        self.candidates.clear();
        self.phase = Phase::Failed(reason);
    }

    /// The presented PIN id is the live one issued to this session
    pub fn owns_pin(&self, pin_id: u64, now: DateTime<Utc>) -> bool {
        match &self.pending {
            Some(p) => pin_id > 0 && p.pin_id == pin_id && !p.is_expired(now),
            None => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

pub type SharedSession = Arc<Mutex<SessionContext>>;

/// All live sessions, keyed by session id
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedSession>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a live session
    pub async fn get(&self, id: &str) -> Option<SharedSession> {
        self.prune().await;
        self.sessions.read().await.get(id).cloned()
    }

    /// Existing session for `id`, or a new one under a fresh id
    pub async fn get_or_create(&self, id: Option<&str>) -> (String, SharedSession) {
        if let Some(id) = id {
            if let Some(session) = self.get(id).await {
                return (id.to_string(), session);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Mutex::new(SessionContext::new()));
        self.sessions
            .write()
            .await
            .insert(id.clone(), session.clone());
        debug!(session = %id, "Session created");
        (id, session)
    }

    /// Drop sessions idle longer than the TTL
    pub async fn prune(&self) {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        // Sessions locked by an in-flight call are in use and kept
        sessions.retain(|_, s| match s.try_lock() {
            Ok(ctx) => ctx.idle_for() < self.ttl,
            Err(_) => true,
        });
        let dropped = before - sessions.len();
        if dropped > 0 {
            debug!(dropped, "Expired sessions pruned");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
