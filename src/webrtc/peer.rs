//! Peer connection seam
//!
//! The ICE/DTLS stack is an external collaborator. The handshake
//! coordinator drives it through these traits and consumes its typed
//! events; nothing else in the relay knows how media actually moves.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::sdp::IceCandidate;
use crate::error::Result;
use crate::stream::UnitFrame;

/// Direction of a WebRTC session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// WHIP: the remote sends media to us
    Publish,
    /// WHEP: we send media to the remote
    Read,
}

/// Events emitted by the underlying peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate became available
    LocalCandidate(IceCandidate),
    /// ICE and DTLS completed; media can flow
    Established {
        local_candidate: String,
        remote_candidate: String,
    },
    /// The connection failed permanently
    Failed(String),
    /// The remote closed the connection
    Closed,
}

/// A created peer connection, answer included
pub struct PeerLink {
    /// SDP answer to return to the HTTP client
    pub answer: String,
    /// Publish role: track descriptions parsed from the offer.
    /// Read role: echo of the tracks the answer accepts.
    pub tracks: Vec<String>,
    /// Command side of the connection
    pub conn: Box<dyn PeerConnection>,
    /// Event stream; closes when the connection is gone
    pub events: mpsc::Receiver<PeerEvent>,
    /// Publish role: frames arriving from the remote
    pub incoming: Option<mpsc::Receiver<UnitFrame>>,
    /// Read role: frames to deliver to the remote
    pub outgoing: Option<mpsc::Sender<UnitFrame>>,
}

/// Factory for peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Apply an offer and produce an answer with local candidates bundled
    ///
    /// `tracks` is the path's track list for [`PeerRole::Read`]; it is
    /// empty for [`PeerRole::Publish`], where the connector announces the
    /// offered tracks in the returned link instead.
    async fn connect(&self, role: PeerRole, offer: &str, tracks: &[String]) -> Result<PeerLink>;
}

/// Live connection handle used after the answer was sent
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Feed trickle-ICE candidates received via PATCH
    async fn add_remote_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()>;

    /// Close the connection; idempotent
    async fn close(&self);
}
