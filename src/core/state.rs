//! Process-wide shared state
//!
//! The registered-user table, the call-session table, the probe-history
//! ring and the phone quality records, each behind its own guard. Every
//! accessor copies data out; no reference into a table survives past the
//! call that produced it, so no lock is ever held across I/O.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::AgentConfig;
use crate::{Error, Result};

/// One SIP endpoint or directory entry.
#[derive(Debug, Clone)]
pub struct RegisteredUser {
    pub user_id: String,
    pub display_name: String,
    pub active: bool,
    pub known_from_directory: bool,
    pub contact_uri: Option<String>,
    pub addr: Option<SocketAddr>,
    pub expires_at: Option<SystemTime>,
}

/// Registered-user table. Keyed by the numeric user id; entries known
/// from the directory are never removed, only deactivated.
pub struct UserTable {
    inner: RwLock<HashMap<String, RegisteredUser>>,
    capacity: usize,
}

impl UserTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Upsert from a REGISTER. A directory-known entry keeps its
    /// directory display name.
    pub async fn register(
        &self,
        user_id: &str,
        display_name: Option<&str>,
        contact_uri: Option<&str>,
        addr: SocketAddr,
        expires: Duration,
        active: bool,
    ) -> Result<()> {
        let mut table = self.inner.write().await;
        if let Some(user) = table.get_mut(user_id) {
            if !user.known_from_directory {
                if let Some(name) = display_name {
                    user.display_name = name.to_string();
                }
            }
            user.active = active;
            user.contact_uri = contact_uri.map(str::to_string);
            user.addr = Some(addr);
            user.expires_at = Some(SystemTime::now() + expires);
            return Ok(());
        }
        if table.len() >= self.capacity {
            return Err(Error::capacity("user table full"));
        }
        table.insert(
            user_id.to_string(),
            RegisteredUser {
                user_id: user_id.to_string(),
                display_name: display_name.unwrap_or(user_id).to_string(),
                active,
                known_from_directory: false,
                contact_uri: contact_uri.map(str::to_string),
                addr: Some(addr),
                expires_at: Some(SystemTime::now() + expires),
            },
        );
        Ok(())
    }

    /// Upsert from the phonebook directory.
    pub async fn upsert_directory(
        &self,
        user_id: &str,
        display_name: &str,
        active: bool,
    ) -> Result<()> {
        let mut table = self.inner.write().await;
        if let Some(user) = table.get_mut(user_id) {
            user.display_name = display_name.to_string();
            user.known_from_directory = true;
            user.active = active;
            return Ok(());
        }
        if table.len() >= self.capacity {
            return Err(Error::capacity("user table full"));
        }
        table.insert(
            user_id.to_string(),
            RegisteredUser {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                active,
                known_from_directory: true,
                contact_uri: None,
                addr: None,
                expires_at: None,
            },
        );
        Ok(())
    }

    /// Deactivate directory-known users absent from the latest artifact,
    /// unless a live registration keeps them current.
    pub async fn deactivate_missing(&self, present: &HashSet<String>) -> usize {
        let now = SystemTime::now();
        let mut table = self.inner.write().await;
        let mut deactivated = 0;
        for user in table.values_mut() {
            if present.contains(&user.user_id) {
                continue;
            }
            let registered = user
                .expires_at
                .map(|expiry| expiry > now)
                .unwrap_or(false);
            if !registered && user.active {
                user.active = false;
                deactivated += 1;
            }
        }
        deactivated
    }

    pub async fn get(&self, user_id: &str) -> Option<RegisteredUser> {
        self.inner.read().await.get(user_id).cloned()
    }

    pub async fn active_users(&self) -> Vec<RegisteredUser> {
        self.inner
            .read()
            .await
            .values()
            .filter(|u| u.active)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Call-session lifecycle. FREE is absence from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    InviteSent,
    Ringing,
    Established,
    Terminating,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub state: CallState,
    pub caller_addr: SocketAddr,
    pub callee_addr: SocketAddr,
    pub from_tag: Option<String>,
    pub to_tag: Option<String>,
    pub created_at: SystemTime,
}

/// Fixed-capacity call-session table keyed by Call-ID.
pub struct CallTable {
    inner: RwLock<HashMap<String, CallSession>>,
    capacity: usize,
}

impl CallTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Create a session for a new INVITE. Returns `false` when a session
    /// with this Call-ID already exists (a retransmission).
    pub async fn create(
        &self,
        call_id: &str,
        caller_addr: SocketAddr,
        callee_addr: SocketAddr,
        from_tag: Option<String>,
    ) -> Result<bool> {
        let mut table = self.inner.write().await;
        if table.contains_key(call_id) {
            return Ok(false);
        }
        if table.len() >= self.capacity {
            return Err(Error::capacity("call-session table full"));
        }
        table.insert(
            call_id.to_string(),
            CallSession {
                call_id: call_id.to_string(),
                state: CallState::InviteSent,
                caller_addr,
                callee_addr,
                from_tag,
                to_tag: None,
                created_at: SystemTime::now(),
            },
        );
        Ok(true)
    }

    pub async fn get(&self, call_id: &str) -> Option<CallSession> {
        self.inner.read().await.get(call_id).cloned()
    }

    pub async fn set_state(&self, call_id: &str, state: CallState) -> bool {
        let mut table = self.inner.write().await;
        match table.get_mut(call_id) {
            Some(session) => {
                session.state = state;
                true
            }
            None => false,
        }
    }

    /// Mark the dialog established and capture the callee's tag.
    pub async fn establish(&self, call_id: &str, to_tag: Option<String>) -> bool {
        let mut table = self.inner.write().await;
        match table.get_mut(call_id) {
            Some(session) => {
                session.state = CallState::Established;
                if to_tag.is_some() {
                    session.to_tag = to_tag;
                }
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, call_id: &str) -> Option<CallSession> {
        self.inner.write().await.remove(call_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Computed probe metrics for one destination.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub dst_ip: String,
    pub dst_node: String,
    pub timestamp: u64,
    pub rtt_ms_avg: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
    pub hop_count: u32,
    pub hops: Vec<String>,
    pub link_type: String,
}

/// Fixed-capacity ring of probe results; writes never block beyond the
/// guard and the oldest entry is overwritten once full.
pub struct ProbeHistory {
    inner: Mutex<VecDeque<ProbeResult>>,
    capacity: usize,
}

impl ProbeHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub async fn push(&self, result: ProbeResult) {
        let mut ring = self.inner.lock().await;
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(result);
    }

    pub async fn snapshot(&self) -> Vec<ProbeResult> {
        self.inner.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Outcome of one phone quality test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QualityStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "busy")]
    Busy,
    #[serde(rename = "sip_error")]
    SipError,
    #[serde(rename = "sip_timeout")]
    SipTimeout,
    #[serde(rename = "resolve_failed")]
    ResolveFailed,
}

/// Latest VoIP probe result for one phone; overwritten each cycle.
#[derive(Debug, Clone, Serialize)]
pub struct QualityRecord {
    pub phone_number: String,
    pub phone_ip: String,
    pub last_test_time: u64,
    pub status: QualityStatus,
    pub sip_rtt_ms: Option<f64>,
    pub media_jitter_ms: Option<f64>,
    pub media_loss_pct: Option<f64>,
}

/// SIP proxy counters surfaced through the health document.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub datagrams_received: AtomicU64,
    pub oversize_dropped: AtomicU64,
    pub parse_failures: AtomicU64,
    pub requests_forwarded: AtomicU64,
    pub responses_forwarded: AtomicU64,
    pub rejects: AtomicU64,
}

impl ProxyStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// The explicitly constructed context shared between components. Startup
/// composes one of these and hands `Arc` clones to each task.
pub struct SharedState {
    pub users: UserTable,
    pub calls: CallTable,
    pub probe_history: ProbeHistory,
    pub quality: DashMap<String, QualityRecord>,
    pub proxy_stats: ProxyStats,
    pub started_at: SystemTime,
}

/// Probe-history ring capacity.
pub const PROBE_HISTORY_CAPACITY: usize = 64;

impl SharedState {
    pub fn new(config: &AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            users: UserTable::new(config.sip.max_users),
            calls: CallTable::new(config.sip.max_sessions),
            probe_history: ProbeHistory::new(PROBE_HISTORY_CAPACITY),
            quality: DashMap::new(),
            proxy_stats: ProxyStats::default(),
            started_at: SystemTime::now(),
        })
    }
}

/// Seconds since the epoch, for the JSON documents and cache lines.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
