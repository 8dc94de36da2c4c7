//! In-process peer stand-in
//!
//! A deterministic [`PeerConnector`] used by the test suite and by the
//! server binary until a real ICE/DTLS stack is wired in. The answer echoes
//! the offer's media sections, the connection establishes immediately
//! (unless told not to), and test code can inject frames and events
//! through [`StubControl`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::peer::{PeerConnection, PeerConnector, PeerEvent, PeerLink, PeerRole};
use super::sdp::IceCandidate;
use crate::error::Result;
use crate::stream::UnitFrame;

/// Test/bench handle to one stub connection
pub struct StubControl {
    /// Inject peer events (`Failed`, `Closed`, ...)
    pub events: mpsc::Sender<PeerEvent>,
    /// Publish role: inject frames "arriving from the remote"
    pub incoming: Option<mpsc::Sender<UnitFrame>>,
    /// Read role: observe frames "delivered to the remote"
    pub outgoing: Option<mpsc::Receiver<UnitFrame>>,
    /// Times `close` was called on the connection
    pub close_count: Arc<AtomicU32>,
    /// Candidates fed via PATCH
    pub remote_candidates: Arc<Mutex<Vec<IceCandidate>>>,
}

/// Deterministic peer connector
pub struct StubConnector {
    /// Emit `Established` right after the answer; on by default
    auto_establish: bool,
    controls: Mutex<Vec<StubControl>>,
}

impl Default for StubConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl StubConnector {
    pub fn new() -> Self {
        Self {
            auto_establish: true,
            controls: Mutex::new(Vec::new()),
        }
    }

    /// Connections stay in `gathering` until test code injects events
    pub fn manual() -> Self {
        Self {
            auto_establish: false,
            controls: Mutex::new(Vec::new()),
        }
    }

    /// Drain the controls of connections created so far
    pub fn take_controls(&self) -> Vec<StubControl> {
        let mut controls = self
            .controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        controls.drain(..).collect()
    }

    fn offered_tracks(offer: &str) -> Vec<String> {
        offer
            .lines()
            .filter_map(|line| line.strip_prefix("m="))
            .filter_map(|media| media.split_whitespace().next())
            .map(|kind| kind.to_string())
            .collect()
    }

    fn answer_for(tracks: &[String]) -> String {
        let mut answer = String::from("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        for (i, track) in tracks.iter().enumerate() {
            let kind = track.split('/').next().unwrap_or("application");
            answer.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\n", kind, i));
        }
        answer
    }
}

#[async_trait]
impl PeerConnector for StubConnector {
    async fn connect(&self, role: PeerRole, offer: &str, tracks: &[String]) -> Result<PeerLink> {
        let tracks = match role {
            PeerRole::Publish => Self::offered_tracks(offer),
            PeerRole::Read => tracks.to_vec(),
        };

        let (events_tx, events_rx) = mpsc::channel(16);
        let close_count = Arc::new(AtomicU32::new(0));
        let remote_candidates = Arc::new(Mutex::new(Vec::new()));

        let (incoming, incoming_ctl, outgoing, outgoing_ctl) = match role {
            PeerRole::Publish => {
                let (tx, rx) = mpsc::channel(64);
                (Some(rx), Some(tx), None, None)
            }
            PeerRole::Read => {
                let (tx, rx) = mpsc::channel(64);
                (None, None, Some(tx), Some(rx))
            }
        };

        if self.auto_establish {
            let events = events_tx.clone();
            tokio::spawn(async move {
                let _ = events
                    .send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: "candidate:1 1 UDP 2130706431 127.0.0.1 50000 typ host"
                            .to_string(),
                        mid: Some("0".to_string()),
                    }))
                    .await;
                let _ = events
                    .send(PeerEvent::Established {
                        local_candidate: "127.0.0.1:50000".to_string(),
                        remote_candidate: "127.0.0.1:50001".to_string(),
                    })
                    .await;
            });
        }

        self.controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(StubControl {
                events: events_tx,
                incoming: incoming_ctl,
                outgoing: outgoing_ctl,
                close_count: Arc::clone(&close_count),
                remote_candidates: Arc::clone(&remote_candidates),
            });

        Ok(PeerLink {
            answer: Self::answer_for(&tracks),
            tracks,
            conn: Box::new(StubPeer {
                close_count,
                remote_candidates,
            }),
            events: events_rx,
            incoming,
            outgoing,
        })
    }
}

struct StubPeer {
    close_count: Arc<AtomicU32>,
    remote_candidates: Arc<Mutex<Vec<IceCandidate>>>,
}

#[async_trait]
impl PeerConnection for StubPeer {
    async fn add_remote_candidates(&self, candidates: Vec<IceCandidate>) -> Result<()> {
        self.remote_candidates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(candidates);
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_tracks_from_offer() {
        let connector = StubConnector::new();
        let offer = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

        let link = connector
            .connect(PeerRole::Publish, offer, &[])
            .await
            .unwrap();
        assert_eq!(link.tracks, vec!["video".to_string(), "audio".to_string()]);
        assert!(link.answer.starts_with("v=0"));
        assert_eq!(link.answer.matches("m=").count(), 2);
        assert!(link.incoming.is_some());
        assert!(link.outgoing.is_none());
    }

    #[tokio::test]
    async fn test_read_echoes_path_tracks() {
        let connector = StubConnector::new();
        let tracks = vec!["video/H264".to_string()];

        let link = connector
            .connect(PeerRole::Read, "v=0\r\nm=video 9 X 96\r\n", &tracks)
            .await
            .unwrap();
        assert_eq!(link.tracks, tracks);
        assert!(link.outgoing.is_some());
    }

    #[tokio::test]
    async fn test_auto_establish_emits_events() {
        let connector = StubConnector::new();
        let mut link = connector
            .connect(PeerRole::Read, "v=0\r\nm=video 9 X 96\r\n", &[])
            .await
            .unwrap();

        let first = link.events.recv().await.unwrap();
        assert!(matches!(first, PeerEvent::LocalCandidate(_)));
        let second = link.events.recv().await.unwrap();
        assert!(matches!(second, PeerEvent::Established { .. }));
    }
}
