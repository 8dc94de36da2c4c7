//! Per-session records
//!
//! A session is one live connection from a remote peer using a specific
//! protocol. Identity (UUID, creation time, remote address, protocol) is
//! immutable; state, bound path and protocol extras are mutated by the
//! owning front-end only. Byte counters are atomics so the media plane can
//! bump them without locking.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Which front-end owns the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionProtocol {
    RtspConn,
    RtspSession,
    RtmpConn,
    SrtConn,
    WebRtcSession,
}

impl SessionProtocol {
    /// Path segment used by the control API (`/v3/<this>/list`)
    pub fn api_segment(&self) -> &'static str {
        match self {
            SessionProtocol::RtspConn => "rtspconns",
            SessionProtocol::RtspSession => "rtspsessions",
            SessionProtocol::RtmpConn => "rtmpconns",
            SessionProtocol::SrtConn => "srtconns",
            SessionProtocol::WebRtcSession => "webrtcsessions",
        }
    }
}

/// What the session is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Read,
    Publish,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Read => "read",
            SessionState::Publish => "publish",
        }
    }
}

#[derive(Debug, Default)]
struct SessionMutable {
    state: SessionState,
    /// Bound path name; empty while idle
    path: String,
    /// RTSP transport description, when negotiated
    transport: Option<String>,
    /// WebRTC: selected candidate pair, once known
    local_candidate: String,
    remote_candidate: String,
    /// WebRTC: peer connection fully established
    established: bool,
}

/// A live protocol session
#[derive(Debug)]
pub struct SessionInfo {
    pub id: Uuid,
    /// WHIP/WHEP follow-up token; only WebRTC sessions carry one
    pub secret: Option<Uuid>,
    pub created: DateTime<Utc>,
    pub remote_addr: SocketAddr,
    pub protocol: SessionProtocol,
    /// Shared with the media plane; `Arc` so stream readers and writers can
    /// bump it without holding the record
    pub bytes_received: Arc<AtomicU64>,
    pub bytes_sent: Arc<AtomicU64>,
    mutable: RwLock<SessionMutable>,
}

/// Point-in-time copy of a session, for the API façade
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub remote_addr: SocketAddr,
    pub protocol: SessionProtocol,
    pub state: SessionState,
    pub path: String,
    pub transport: Option<String>,
    pub local_candidate: String,
    pub remote_candidate: String,
    pub established: bool,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl SessionInfo {
    /// Create a session record with a fresh UUID
    pub fn new(protocol: SessionProtocol, remote_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            secret: None,
            created: Utc::now(),
            remote_addr,
            protocol,
            bytes_received: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            mutable: RwLock::new(SessionMutable::default()),
        })
    }

    /// Create a WebRTC session record carrying an unguessable secret
    pub fn with_secret(protocol: SessionProtocol, remote_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            secret: Some(Uuid::new_v4()),
            created: Utc::now(),
            remote_addr,
            protocol,
            bytes_received: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            mutable: RwLock::new(SessionMutable::default()),
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionMutable> {
        self.mutable
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind the session to a path in read or publish state
    pub fn set_active(&self, state: SessionState, path: &str) {
        let mut m = self.write();
        m.state = state;
        m.path = path.to_string();
    }

    /// Return to idle, clearing the bound path
    pub fn set_idle(&self) {
        let mut m = self.write();
        m.state = SessionState::Idle;
        m.path.clear();
    }

    /// RTSP: record the negotiated transport
    pub fn set_transport(&self, transport: &str) {
        self.write().transport = Some(transport.to_string());
    }

    /// WebRTC: mark the peer connection established
    pub fn set_established(&self, local_candidate: &str, remote_candidate: &str) {
        let mut m = self.write();
        m.established = true;
        m.local_candidate = local_candidate.to_string();
        m.remote_candidate = remote_candidate.to_string();
    }

    /// Whether the peer connection is established (WebRTC)
    pub fn established(&self) -> bool {
        self.mutable
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .established
    }

    /// Consistent copy for the API
    pub fn snapshot(&self) -> SessionSnapshot {
        let m = self
            .mutable
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        SessionSnapshot {
            id: self.id,
            created: self.created,
            remote_addr: self.remote_addr,
            protocol: self.protocol,
            state: m.state,
            path: m.path.clone(),
            transport: m.transport.clone(),
            local_candidate: m.local_candidate.clone(),
            remote_candidate: m.remote_candidate.clone(),
            established: m.established,
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}
