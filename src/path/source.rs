//! Path-owned pull sources
//!
//! A path configured with a URL dials the upstream itself through a
//! [`SourceDialer`], the seam behind which the actual protocol client
//! (RTSP, RTMP, SRT) lives. The driver task connects, publishes into the
//! path like any external publisher would, and re-dials with exponential
//! backoff when the upstream drops: 5 s doubling up to 30 s, reset after
//! every successful connect, forever until the path is destroyed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use super::{EndpointRef, PathRequest, PublisherSlot};
use crate::error::{RelayError, Result, TerminateReason};
use crate::stream::UnitFrame;

/// Backoff after the first failed dial
pub const RECONNECT_INITIAL: Duration = Duration::from_secs(5);
/// Backoff ceiling
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// A live upstream connection produced by a dialer
pub struct SourceConn {
    /// Announced track descriptions
    pub tracks: Vec<String>,
    /// Incoming frames; the channel closing means the upstream dropped
    pub frames: mpsc::Receiver<UnitFrame>,
}

/// Protocol client seam: dials a configured source URL
#[async_trait]
pub trait SourceDialer: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> Result<SourceConn>;
}

/// Dialer used when no protocol client is wired in; every dial fails and
/// the path stays in its reconnect loop
pub struct NullDialer;

#[async_trait]
impl SourceDialer for NullDialer {
    async fn dial(&self, url: &str) -> Result<SourceConn> {
        Err(RelayError::Internal(format!(
            "no source client available for {}",
            url
        )))
    }
}

pub(crate) struct DriverParams {
    pub path_name: String,
    pub url: String,
    pub endpoint: EndpointRef,
    pub dialer: Arc<dyn SourceDialer>,
    pub path_tx: mpsc::Sender<PathRequest>,
    pub read_timeout: Duration,
    pub stop: watch::Receiver<bool>,
}

/// Reconnect loop of one path's source
pub(crate) async fn run_driver(mut params: DriverParams) {
    let mut backoff = RECONNECT_INITIAL;

    loop {
        if *params.stop.borrow() {
            return;
        }

        tracing::debug!(
            path = %params.path_name,
            url = %params.url,
            "source connecting"
        );

        let dialed = tokio::select! {
            res = tokio::time::timeout(params.read_timeout, params.dialer.dial(&params.url)) => res,
            _ = params.stop.changed() => return,
        };

        match dialed {
            Ok(Ok(conn)) => {
                backoff = RECONNECT_INITIAL;
                match publish(&mut params, conn).await {
                    Forward::Stopped => return,
                    Forward::Disconnected => {
                        tracing::warn!(
                            path = %params.path_name,
                            url = %params.url,
                            "source disconnected, reconnecting"
                        );
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    path = %params.path_name,
                    url = %params.url,
                    error = %e,
                    retry_in = ?backoff,
                    "source dial failed"
                );
            }
            Err(_) => {
                tracing::warn!(
                    path = %params.path_name,
                    url = %params.url,
                    retry_in = ?backoff,
                    "source dial timed out"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = params.stop.changed() => return,
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

enum Forward {
    /// The path is going away; do not reconnect
    Stopped,
    /// The upstream dropped; reconnect
    Disconnected,
}

/// Publish one upstream connection into the path and pump its frames
async fn publish(params: &mut DriverParams, mut conn: SourceConn) -> Forward {
    let (reply, rx) = oneshot::channel();
    let sent = params
        .path_tx
        .send(PathRequest::AddPublisher {
            endpoint: params.endpoint,
            tracks: conn.tracks.clone(),
            reply,
        })
        .await;
    if sent.is_err() {
        return Forward::Stopped;
    }

    let slot: PublisherSlot = match rx.await {
        Ok(Ok(slot)) => slot,
        // the slot is taken or the path is draining; either way the driver
        // has nothing to feed
        Ok(Err(_)) | Err(_) => return Forward::Stopped,
    };

    tracing::info!(
        path = %params.path_name,
        url = %params.url,
        tracks = conn.tracks.len(),
        "source connected"
    );

    let mut terminated = slot.terminated;
    loop {
        tokio::select! {
            frame = conn.frames.recv() => {
                match frame {
                    Some(frame) => {
                        slot.writer.send(frame);
                    }
                    None => {
                        let _ = params
                            .path_tx
                            .send(PathRequest::RemovePublisher {
                                id: params.endpoint.id,
                                reason: TerminateReason::SourceGone,
                            })
                            .await;
                        return Forward::Disconnected;
                    }
                }
            }
            _ = &mut terminated => {
                // the path detached us (drain or override)
                return Forward::Stopped;
            }
            _ = params.stop.changed() => {
                let _ = params
                    .path_tx
                    .send(PathRequest::RemovePublisher {
                        id: params.endpoint.id,
                        reason: TerminateReason::SourceGone,
                    })
                    .await;
                return Forward::Stopped;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::PathConf;
    use crate::path::{spawn, PathSpawn};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    /// Dialer that fails `failures` times, then produces a connection and
    /// pushes a few frames before hanging up
    struct FlakyDialer {
        attempts: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl SourceDialer for FlakyDialer {
        async fn dial(&self, _url: &str) -> Result<SourceConn> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(RelayError::Internal("connection refused".to_string()));
            }

            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for ts in 0..3u64 {
                    if tx
                        .send(UnitFrame::new(0, ts, Bytes::from_static(&[1u8; 32])))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                // keep the connection up; dropping tx would hang up
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(tx);
            });

            Ok(SourceConn {
                tracks: vec!["video/H264".to_string()],
                frames: rx,
            })
        }
    }

    fn spawn_source_path(dialer: Arc<dyn SourceDialer>, on_demand: bool) -> crate::path::PathHandle {
        let (idle_tx, _idle_rx) = mpsc::unbounded_channel();
        spawn(PathSpawn {
            name: "live".to_string(),
            conf_name: "live".to_string(),
            conf: Arc::new(PathConf {
                source: "rtsp://upstream.example.com/feed".to_string(),
                source_on_demand: on_demand,
                ..PathConf::default()
            }),
            pinned: true,
            epoch: 1,
            idle_tx,
            dialer,
            read_timeout: Duration::from_secs(10),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_connects_and_feeds_readers() {
        let dialer = Arc::new(FlakyDialer {
            attempts: AtomicU32::new(0),
            failures: 0,
        });
        let path = spawn_source_path(dialer, false);

        // a reader arriving before the dial finishes waits for ready
        let mut slot = tokio::time::timeout(
            Duration::from_secs(5),
            path.add_reader(
                crate::path::EndpointRef {
                    kind: crate::path::EndpointKind::WebRtcSession,
                    id: uuid::Uuid::new_v4(),
                },
                Arc::new(AtomicU64::new(0)),
                true,
            ),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(slot.tracks, vec!["video/H264".to_string()]);
        let frame = slot.reader.recv().await.unwrap();
        assert_eq!(frame.size(), 32);

        let snap = path.snapshot().await.unwrap();
        assert!(snap.ready);
        assert_eq!(
            snap.source.map(|s| s.kind),
            Some(crate::path::EndpointKind::RtspSource)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_and_reconnect() {
        let dialer = Arc::new(FlakyDialer {
            attempts: AtomicU32::new(0),
            failures: 2,
        });
        let shared: Arc<dyn SourceDialer> = Arc::clone(&dialer) as Arc<dyn SourceDialer>;
        let path = spawn_source_path(shared, false);

        // attempt 1 fails now, attempt 2 after 5 s, attempt 3 after 10 s more
        tokio::time::sleep(Duration::from_secs(16)).await;

        let snap = path.snapshot().await.unwrap();
        assert!(snap.ready);
        assert!(dialer.attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_while_reconnecting() {
        let dialer = Arc::new(FlakyDialer {
            attempts: AtomicU32::new(0),
            failures: 1000,
        });
        let path = spawn_source_path(dialer, false);

        tokio::time::sleep(Duration::from_secs(12)).await;
        let snap = path.snapshot().await.unwrap();
        assert!(!snap.ready);
        // the configured source is still visible to the API while dialing
        assert!(snap.source.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_dial_starts_at_first_reader() {
        let dialer = Arc::new(FlakyDialer {
            attempts: AtomicU32::new(0),
            failures: 0,
        });
        let shared: Arc<dyn SourceDialer> = Arc::clone(&dialer) as Arc<dyn SourceDialer>;
        let path = spawn_source_path(shared, true);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 0);

        let _slot = tokio::time::timeout(
            Duration::from_secs(5),
            path.add_reader(
                crate::path::EndpointRef {
                    kind: crate::path::EndpointKind::WebRtcSession,
                    id: uuid::Uuid::new_v4(),
                },
                Arc::new(AtomicU64::new(0)),
                true,
            ),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(dialer.attempts.load(Ordering::SeqCst) >= 1);
    }
}
