//! WHIP/WHEP handshake state machine
//!
//! One task per session, driven by typed events rather than linear control
//! flow: commands from the HTTP surface (PATCH, DELETE), events from the
//! peer stack, the path's terminate signal, the establish deadline, and
//! media frames. Teardown runs at most once no matter which of those fires
//! first; the task ends right after it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::peer::{PeerConnection, PeerEvent, PeerRole};
use super::sdp::{self, IceCandidate};
use super::{NewSessionReq, NewSessionRes, WebRtcServer};
use crate::auth::{AccessRequest, AuthAction, AuthProtocol};
use crate::error::{Result, TerminateReason};
use crate::path::{EndpointKind, EndpointRef, PathHandle};
use crate::registry::{SessionInfo, SessionProtocol, SessionState};
use crate::stream::{StreamReadError, StreamReader, StreamWriter, UnitFrame};

/// Handshake progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebRtcSessionState {
    Created,
    Offered,
    Gathering,
    Established,
    Failed,
    Closed,
}

/// Commands from the HTTP surface to a running session task
pub(crate) enum SessionCmd {
    Candidates {
        candidates: Vec<IceCandidate>,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        reply: oneshot::Sender<()>,
    },
}

/// POST leg: validate, authenticate, attach, answer, spawn the task
pub(crate) async fn create(
    server: &Arc<WebRtcServer>,
    req: NewSessionReq,
) -> Result<NewSessionRes> {
    sdp::validate_offer(&req.offer)?;

    let session = SessionInfo::with_secret(SessionProtocol::WebRtcSession, req.remote_addr);
    let endpoint = EndpointRef {
        kind: EndpointKind::WebRtcSession,
        id: session.id,
    };
    let access = AccessRequest {
        name: req.path.clone(),
        action: if req.publish {
            AuthAction::Publish
        } else {
            AuthAction::Read
        },
        user: req.user.clone(),
        pass: req.pass.clone(),
        ip: req.remote_addr.ip(),
        proto: AuthProtocol::WebRtc,
    };

    let (path, pump, conn, events, answer) = if req.publish {
        // the peer stack parses the offer and announces the incoming tracks
        let link = server
            .connector
            .connect(PeerRole::Publish, &req.offer, &[])
            .await?;

        let attach = server
            .manager
            .attach_publisher(&access, endpoint, link.tracks)
            .await;
        let (path, slot) = match attach {
            Ok(ok) => ok,
            Err(e) => {
                link.conn.close().await;
                return Err(e);
            }
        };

        let pump = MediaPump::Publish {
            incoming: link.incoming,
            writer: slot.writer,
            terminated: slot.terminated,
        };
        (path, pump, link.conn, link.events, link.answer)
    } else {
        // readers wait for a pull source to come up; the handshake window
        // bounds the wait
        let (path, slot) = server
            .manager
            .attach_reader(
                &access,
                endpoint,
                Arc::clone(&session.bytes_sent),
                true,
            )
            .await?;

        let link = match server
            .connector
            .connect(PeerRole::Read, &req.offer, &slot.tracks)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                path.remove_reader(endpoint.id).await;
                return Err(e);
            }
        };

        let pump = MediaPump::Read {
            reader: Some(slot.reader),
            outgoing: link.outgoing,
            terminated: slot.terminated,
        };
        (path, pump, link.conn, link.events, link.answer)
    };

    if let Err(e) = server.registry.register(Arc::clone(&session)) {
        conn.close().await;
        detach(&path, &pump, endpoint.id, TerminateReason::ClientGone).await;
        return Err(e);
    }
    session.set_active(
        if req.publish {
            SessionState::Publish
        } else {
            SessionState::Read
        },
        path.name(),
    );

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    server.insert_handle(session.id, cmd_tx);

    let secret = session.secret.unwrap_or_else(Uuid::new_v4);
    let res = NewSessionRes {
        id: session.id,
        secret,
        answer,
    };

    tracing::info!(
        path = path.name(),
        session = %session.id,
        publish = req.publish,
        remote = %req.remote_addr,
        "webrtc session created"
    );

    let task = SessionTask {
        server: Arc::clone(server),
        session,
        path,
        endpoint_id: endpoint.id,
        conn,
        // the answer goes out as soon as `create` returns
        state: WebRtcSessionState::Gathering,
        deadline: tokio::time::Instant::now() + server.store.current().conf.handshake_timeout(),
    };
    tokio::spawn(task.run(cmd_rx, events, pump));

    Ok(res)
}

/// Frame plumbing of one direction
enum MediaPump {
    Publish {
        incoming: Option<mpsc::Receiver<UnitFrame>>,
        writer: StreamWriter,
        terminated: oneshot::Receiver<TerminateReason>,
    },
    Read {
        reader: Option<StreamReader>,
        outgoing: Option<mpsc::Sender<UnitFrame>>,
        terminated: oneshot::Receiver<TerminateReason>,
    },
}

enum MediaStep {
    /// A frame moved (either direction)
    Forwarded(usize),
    /// The media leg ended; the peer events decide what happens next
    Ended,
    /// The reader fell behind the path's fan-out channel
    Lagged,
    /// The path detached this session
    PathTerminated(TerminateReason),
}

impl MediaPump {
    /// Wait for the next media-plane event; pends forever once both the
    /// frames and the terminate signal are consumed
    async fn next(&mut self) -> MediaStep {
        match self {
            MediaPump::Publish {
                incoming,
                writer,
                terminated,
            } => {
                match incoming {
                    Some(rx) => {
                        tokio::select! {
                            frame = rx.recv() => match frame {
                                Some(frame) => {
                                    let size = frame.size();
                                    writer.send(frame);
                                    MediaStep::Forwarded(size)
                                }
                                None => {
                                    *incoming = None;
                                    MediaStep::Ended
                                }
                            },
                            reason = terminated => {
                                MediaStep::PathTerminated(reason.unwrap_or(TerminateReason::SourceGone))
                            }
                        }
                    }
                    None => {
                        let reason = terminated.await;
                        MediaStep::PathTerminated(reason.unwrap_or(TerminateReason::SourceGone))
                    }
                }
            }
            MediaPump::Read {
                reader,
                outgoing,
                terminated,
            } => match reader {
                Some(stream) => {
                    tokio::select! {
                        frame = stream.recv() => match frame {
                            Ok(frame) => {
                                let size = frame.size();
                                // a peer that cannot drain its queue loses
                                // frames rather than stalling the session
                                if let Some(out) = outgoing {
                                    let _ = out.try_send(frame);
                                }
                                MediaStep::Forwarded(size)
                            }
                            Err(StreamReadError::Lagged(_)) => MediaStep::Lagged,
                            Err(StreamReadError::Closed) => {
                                *reader = None;
                                MediaStep::Ended
                            }
                        },
                        reason = terminated => {
                            MediaStep::PathTerminated(reason.unwrap_or(TerminateReason::SourceGone))
                        }
                    }
                }
                None => {
                    let reason = terminated.await;
                    MediaStep::PathTerminated(reason.unwrap_or(TerminateReason::SourceGone))
                }
            },
        }
    }

    fn is_publish(&self) -> bool {
        matches!(self, MediaPump::Publish { .. })
    }
}

async fn detach(path: &PathHandle, pump: &MediaPump, id: Uuid, reason: TerminateReason) {
    if pump.is_publish() {
        path.remove_publisher(id, reason).await;
    } else {
        path.remove_reader(id).await;
    }
}

struct SessionTask {
    server: Arc<WebRtcServer>,
    session: Arc<SessionInfo>,
    path: PathHandle,
    endpoint_id: Uuid,
    conn: Box<dyn PeerConnection>,
    state: WebRtcSessionState,
    deadline: tokio::time::Instant,
}

impl SessionTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCmd>,
        mut events: mpsc::Receiver<PeerEvent>,
        mut pump: MediaPump,
    ) {
        let establish_timer = tokio::time::sleep_until(self.deadline);
        tokio::pin!(establish_timer);

        let (reason, delete_reply) = loop {
            let established = self.state == WebRtcSessionState::Established;

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCmd::Candidates { candidates, reply }) => {
                            let res = self.conn.add_remote_candidates(candidates).await;
                            let _ = reply.send(res);
                        }
                        Some(SessionCmd::Delete { reply }) => {
                            break (TerminateReason::ClientGone, Some(reply));
                        }
                        // the server dropped us; treat like a close
                        None => break (TerminateReason::ClientGone, None),
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(PeerEvent::LocalCandidate(_)) => {
                            // candidates after the answer only matter to the
                            // peer stack itself
                        }
                        Some(PeerEvent::Established { local_candidate, remote_candidate }) => {
                            self.state = WebRtcSessionState::Established;
                            self.session.set_established(&local_candidate, &remote_candidate);
                            tracing::info!(
                                session = %self.session.id,
                                local = %local_candidate,
                                remote = %remote_candidate,
                                "peer connection established"
                            );
                        }
                        Some(PeerEvent::Failed(err)) => {
                            tracing::info!(session = %self.session.id, error = %err, "peer connection failed");
                            self.state = WebRtcSessionState::Failed;
                            break (TerminateReason::ClientGone, None);
                        }
                        Some(PeerEvent::Closed) | None => {
                            break (TerminateReason::ClientGone, None);
                        }
                    }
                }
                step = pump.next() => {
                    match step {
                        MediaStep::Forwarded(size) => {
                            if pump.is_publish() {
                                self.session
                                    .bytes_received
                                    .fetch_add(size as u64, Ordering::Relaxed);
                            }
                        }
                        MediaStep::Ended => {}
                        MediaStep::Lagged => break (TerminateReason::ClientGone, None),
                        MediaStep::PathTerminated(reason) => break (reason, None),
                    }
                }
                () = &mut establish_timer, if !established => {
                    tracing::info!(
                        session = %self.session.id,
                        "handshake window elapsed before establishment"
                    );
                    break (TerminateReason::Timeout, None);
                }
            }
        };

        self.teardown(&pump, reason).await;
        if let Some(reply) = delete_reply {
            let _ = reply.send(());
        }
    }

    /// The single exit point: close the peer, detach from the path,
    /// unregister. Runs exactly once per session; the task returns right
    /// after its first invocation.
    async fn teardown(&mut self, pump: &MediaPump, reason: TerminateReason) {
        if self.state != WebRtcSessionState::Failed {
            self.state = WebRtcSessionState::Closed;
        }

        self.conn.close().await;
        detach(&self.path, pump, self.endpoint_id, reason).await;
        self.server.remove_handle(&self.session.id);
        self.server.registry.unregister(&self.session.id);
        self.session.set_idle();

        tracing::info!(
            session = %self.session.id,
            reason = reason.as_str(),
            "webrtc session closed"
        );
    }
}
