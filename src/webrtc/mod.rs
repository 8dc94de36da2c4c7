//! WebRTC signaling: WHIP ingestion and WHEP egress
//!
//! The HTTP surface ([`http`]) accepts the three-leg dance (POST offer,
//! PATCH trickle-ICE, DELETE teardown) and hands it to the
//! [`WebRtcServer`], which bridges each HTTP session to a path attach and
//! runs the per-session handshake state machine ([`session`]). The actual
//! ICE/DTLS stack sits behind the [`peer`] traits.

pub mod http;
pub mod peer;
pub mod sdp;
pub mod session;
pub mod stub;

pub use session::WebRtcSessionState;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::conf::ConfStore;
use crate::error::{RelayError, Result};
use crate::path::manager::PathManager;
use crate::registry::SessionRegistry;
use peer::PeerConnector;
use sdp::IceCandidate;
use session::SessionCmd;

/// A new WHIP/WHEP session request, credentials included
#[derive(Debug, Clone)]
pub struct NewSessionReq {
    pub path: String,
    /// true for WHIP (publish), false for WHEP (read)
    pub publish: bool,
    /// SDP offer body
    pub offer: String,
    pub remote_addr: SocketAddr,
    pub user: Option<String>,
    pub pass: Option<String>,
}

/// Outcome of a successful POST leg
#[derive(Debug, Clone)]
pub struct NewSessionRes {
    pub id: Uuid,
    pub secret: Uuid,
    pub answer: String,
}

/// Bridges the WHIP/WHEP HTTP surface to the path core
pub struct WebRtcServer {
    pub(crate) manager: PathManager,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) store: Arc<ConfStore>,
    pub(crate) connector: Arc<dyn PeerConnector>,
    /// Command mailboxes of running session tasks, by session id
    handles: Mutex<HashMap<Uuid, mpsc::Sender<SessionCmd>>>,
}

impl WebRtcServer {
    pub fn new(
        manager: PathManager,
        registry: Arc<SessionRegistry>,
        store: Arc<ConfStore>,
        connector: Arc<dyn PeerConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            registry,
            store,
            connector,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// POST leg: authenticate, attach to the path, produce the answer
    ///
    /// The whole leg is bounded by the configured handshake timeout;
    /// running over it surfaces as `Terminated(Timeout)`.
    pub async fn new_session(self: &Arc<Self>, req: NewSessionReq) -> Result<NewSessionRes> {
        let window = self.store.current().conf.handshake_timeout();
        match tokio::time::timeout(window, session::create(self, req)).await {
            Ok(res) => res,
            Err(_) => Err(RelayError::Terminated(
                crate::error::TerminateReason::Timeout,
            )),
        }
    }

    /// PATCH leg: feed trickle-ICE candidates to the session behind a secret
    pub async fn add_candidates(&self, secret: Uuid, candidates: Vec<IceCandidate>) -> Result<()> {
        let cmd_tx = self.handle_for_secret(&secret)?;
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(SessionCmd::Candidates { candidates, reply })
            .await
            .map_err(|_| RelayError::NotFound("session".to_string()))?;
        rx.await
            .map_err(|_| RelayError::NotFound("session".to_string()))?
    }

    /// DELETE leg: tear the session down; returns after side effects ran
    pub async fn delete_session(&self, secret: Uuid) -> Result<()> {
        let cmd_tx = self.handle_for_secret(&secret)?;
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(SessionCmd::Delete { reply })
            .await
            .map_err(|_| RelayError::NotFound("session".to_string()))?;
        // a dropped reply means a concurrent teardown already ran; the
        // outcome the caller asked for holds either way
        let _ = rx.await;
        Ok(())
    }

    fn handle_for_secret(&self, secret: &Uuid) -> Result<mpsc::Sender<SessionCmd>> {
        let session = self
            .registry
            .lookup_by_secret(secret)
            .ok_or_else(|| RelayError::NotFound("session".to_string()))?;
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&session.id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound("session".to_string()))
    }

    pub(crate) fn insert_handle(&self, id: Uuid, tx: mpsc::Sender<SessionCmd>) {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, tx);
    }

    pub(crate) fn remove_handle(&self, id: &Uuid) {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }
}
