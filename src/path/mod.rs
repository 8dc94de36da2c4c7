//! Per-path state machine
//!
//! A path is the rendezvous point between one publisher and any number of
//! readers. Each path runs as its own task with a bounded mailbox; every
//! externally visible operation enqueues a request and awaits the reply, so
//! all mutations of one path are serialized in submission order. Mailbox
//! overflow fails the request with `Busy` instead of buffering without bound.
//!
//! Paths with a URL source own a [`source`] driver that dials and re-dials
//! the upstream; it feeds the same publisher slot an external session would.

pub mod manager;
pub mod source;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::conf::PathConf;
use crate::error::{RelayError, Result, TerminateReason};
use crate::stream::{StreamBus, StreamReader, StreamWriter, DEFAULT_BUS_CAPACITY};

/// Mailbox depth per path; overflow surfaces as `Busy`
pub const MAILBOX_CAPACITY: usize = 64;

/// The kind of endpoint bound to a path, as reported by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    RtspSession,
    RtmpConn,
    SrtConn,
    WebRtcSession,
    /// Path-owned pull source
    RtspSource,
}

impl EndpointKind {
    /// Label used in API `source`/`readers` entries
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::RtspSession => "rtspSession",
            EndpointKind::RtmpConn => "rtmpConn",
            EndpointKind::SrtConn => "srtConn",
            EndpointKind::WebRtcSession => "webRTCSession",
            EndpointKind::RtspSource => "rtspSource",
        }
    }
}

/// Reference to a publisher or reader bound to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRef {
    pub kind: EndpointKind,
    pub id: Uuid,
}

/// Track list and ready time of a ready path
#[derive(Debug, Clone)]
pub struct PathDescription {
    pub tracks: Vec<String>,
    pub ready_time: DateTime<Utc>,
}

/// Slot handed to an admitted publisher
#[derive(Debug)]
pub struct PublisherSlot {
    /// Frame sink fanning out to the readers
    pub writer: StreamWriter,
    /// Fires once if the path detaches the publisher
    pub terminated: oneshot::Receiver<TerminateReason>,
}

/// Slot handed to an attached reader
#[derive(Debug)]
pub struct ReaderSlot {
    pub reader: StreamReader,
    pub tracks: Vec<String>,
    /// Fires once if the path detaches the reader
    pub terminated: oneshot::Receiver<TerminateReason>,
}

/// Point-in-time copy of a path, for the API façade
#[derive(Debug, Clone)]
pub struct PathSnapshot {
    pub name: String,
    pub conf_name: String,
    pub source: Option<EndpointRef>,
    pub ready: bool,
    pub ready_time: Option<DateTime<Utc>>,
    pub tracks: Vec<String>,
    pub bytes_received: u64,
    pub readers: Vec<EndpointRef>,
}

pub(crate) enum PathRequest {
    Describe {
        /// Block until ready instead of failing with `NotReady`
        wait: bool,
        reply: oneshot::Sender<Result<PathDescription>>,
    },
    AddPublisher {
        endpoint: EndpointRef,
        tracks: Vec<String>,
        reply: oneshot::Sender<Result<PublisherSlot>>,
    },
    RemovePublisher {
        id: Uuid,
        reason: TerminateReason,
    },
    AddReader {
        endpoint: EndpointRef,
        bytes_sent: Arc<AtomicU64>,
        wait: bool,
        reply: oneshot::Sender<Result<ReaderSlot>>,
    },
    RemoveReader {
        id: Uuid,
    },
    Snapshot {
        reply: oneshot::Sender<PathSnapshot>,
    },
    /// Terminate every member and stop accepting work
    Drain {
        reason: TerminateReason,
        reply: oneshot::Sender<()>,
    },
    /// Manager close check: shuts the path down iff still empty
    ConfirmIdle {
        reply: oneshot::Sender<bool>,
    },
}

/// Note sent to the manager when a non-pinned path becomes empty
#[derive(Debug)]
pub(crate) struct PathIdleNote {
    pub name: String,
    pub epoch: u64,
}

/// Cloneable handle to one path's mailbox
#[derive(Debug, Clone)]
pub struct PathHandle {
    name: Arc<str>,
    conf: Arc<PathConf>,
    tx: mpsc::Sender<PathRequest>,
}

impl PathHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conf(&self) -> &Arc<PathConf> {
        &self.conf
    }

    fn enqueue(&self, req: PathRequest) -> Result<()> {
        self.tx.try_send(req).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::Busy(self.name.to_string()),
            mpsc::error::TrySendError::Closed(_) => {
                RelayError::Terminated(TerminateReason::Reconfigured)
            }
        })
    }

    async fn recv<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        rx.await
            .map_err(|_| RelayError::Terminated(TerminateReason::Reconfigured))
    }

    /// Track list and ready time; with `wait` the reply is deferred until
    /// the path becomes ready (bound the wait with a caller-side timeout)
    pub async fn describe(&self, wait: bool) -> Result<PathDescription> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(PathRequest::Describe { wait, reply })?;
        self.recv(rx).await?
    }

    /// Admit a publisher; `AlreadyPublishing` if the slot is taken
    pub async fn add_publisher(
        &self,
        endpoint: EndpointRef,
        tracks: Vec<String>,
    ) -> Result<PublisherSlot> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(PathRequest::AddPublisher {
            endpoint,
            tracks,
            reply,
        })?;
        self.recv(rx).await?
    }

    /// Detach the publisher; idempotent, never fails
    pub async fn remove_publisher(&self, id: Uuid, reason: TerminateReason) {
        // removals must not be lost to a full mailbox
        let _ = self.tx.send(PathRequest::RemovePublisher { id, reason }).await;
    }

    /// Attach a reader; `wait` blocks until ready when the path allows it
    pub async fn add_reader(
        &self,
        endpoint: EndpointRef,
        bytes_sent: Arc<AtomicU64>,
        wait: bool,
    ) -> Result<ReaderSlot> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(PathRequest::AddReader {
            endpoint,
            bytes_sent,
            wait,
            reply,
        })?;
        self.recv(rx).await?
    }

    /// Detach a reader; idempotent, never fails
    pub async fn remove_reader(&self, id: Uuid) {
        let _ = self.tx.send(PathRequest::RemoveReader { id }).await;
    }

    /// Consistent copy for the API
    pub async fn snapshot(&self) -> Result<PathSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(PathRequest::Snapshot { reply })?;
        self.recv(rx).await
    }

    pub(crate) async fn drain(&self, reason: TerminateReason) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PathRequest::Drain { reason, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub(crate) async fn confirm_idle(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PathRequest::ConfirmIdle { reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

struct Member {
    endpoint: EndpointRef,
    terminate: oneshot::Sender<TerminateReason>,
}

struct PendingReader {
    endpoint: EndpointRef,
    bytes_sent: Arc<AtomicU64>,
    reply: oneshot::Sender<Result<ReaderSlot>>,
}

/// Everything needed to spawn a path task
pub(crate) struct PathSpawn {
    pub name: String,
    pub conf_name: String,
    pub conf: Arc<PathConf>,
    /// Pinned paths never notify the manager when empty
    pub pinned: bool,
    pub epoch: u64,
    pub idle_tx: mpsc::UnboundedSender<PathIdleNote>,
    pub dialer: Arc<dyn source::SourceDialer>,
    pub read_timeout: std::time::Duration,
}

/// Spawn a path actor and return its handle
pub(crate) fn spawn(params: PathSpawn) -> PathHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let handle = PathHandle {
        name: Arc::from(params.name.as_str()),
        conf: Arc::clone(&params.conf),
        tx: tx.clone(),
    };

    let actor = PathActor {
        name: params.name,
        conf_name: params.conf_name,
        conf: params.conf,
        pinned: params.pinned,
        epoch: params.epoch,
        idle_tx: params.idle_tx,
        dialer: params.dialer,
        read_timeout: params.read_timeout,
        self_tx: tx,
        bus: StreamBus::new(DEFAULT_BUS_CAPACITY),
        ready_time: None,
        tracks: Vec::new(),
        publisher: None,
        readers: Vec::new(),
        describe_waiters: Vec::new(),
        pending_readers: Vec::new(),
        source_driver: None,
        source_id: None,
        lost_publisher: false,
    };

    tokio::spawn(actor.run(rx));
    handle
}

struct PathActor {
    name: String,
    conf_name: String,
    conf: Arc<PathConf>,
    pinned: bool,
    epoch: u64,
    idle_tx: mpsc::UnboundedSender<PathIdleNote>,
    dialer: Arc<dyn source::SourceDialer>,
    read_timeout: std::time::Duration,
    /// Own mailbox, handed to the source driver
    self_tx: mpsc::Sender<PathRequest>,
    bus: StreamBus,
    ready_time: Option<DateTime<Utc>>,
    tracks: Vec<String>,
    publisher: Option<Member>,
    readers: Vec<Member>,
    describe_waiters: Vec<oneshot::Sender<Result<PathDescription>>>,
    pending_readers: Vec<PendingReader>,
    /// Stop signal of the running source driver, if any
    source_driver: Option<watch::Sender<bool>>,
    /// Driver endpoint id, once a driver was started
    source_id: Option<Uuid>,
    /// A publisher was bound and has gone; attaches now fail with
    /// `SourceGone` instead of `NotReady` until a publisher returns
    lost_publisher: bool,
}

impl PathActor {
    fn ready(&self) -> bool {
        self.ready_time.is_some()
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PathRequest>) {
        tracing::debug!(path = %self.name, conf = %self.conf_name, "path created");

        if self.conf.source_url().is_some() && !self.conf.source_on_demand {
            self.start_source_driver();
        }

        while let Some(req) = rx.recv().await {
            match req {
                PathRequest::Describe { wait, reply } => self.on_describe(wait, reply),
                PathRequest::AddPublisher {
                    endpoint,
                    tracks,
                    reply,
                } => self.on_add_publisher(endpoint, tracks, reply),
                PathRequest::RemovePublisher { id, reason } => {
                    self.on_remove_publisher(id, reason)
                }
                PathRequest::AddReader {
                    endpoint,
                    bytes_sent,
                    wait,
                    reply,
                } => self.on_add_reader(endpoint, bytes_sent, wait, reply),
                PathRequest::RemoveReader { id } => self.on_remove_reader(id),
                PathRequest::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                PathRequest::Drain { reason, reply } => {
                    self.teardown(reason);
                    let _ = reply.send(());
                    break;
                }
                PathRequest::ConfirmIdle { reply } => {
                    let idle = self.publisher.is_none()
                        && self.readers.is_empty()
                        && self.pending_readers.is_empty();
                    let _ = reply.send(idle);
                    if idle {
                        self.teardown(TerminateReason::Reconfigured);
                        break;
                    }
                }
            }
        }

        tracing::debug!(path = %self.name, "path destroyed");
    }

    fn on_describe(&mut self, wait: bool, reply: oneshot::Sender<Result<PathDescription>>) {
        if self.ready() {
            let _ = reply.send(Ok(self.description()));
            return;
        }

        self.start_on_demand_source();

        let may_wait = wait
            && (self.conf.wait_for_publisher
                || self.conf.source_url().is_some());
        if may_wait {
            self.describe_waiters.push(reply);
        } else if self.lost_publisher {
            let _ = reply.send(Err(RelayError::Terminated(TerminateReason::SourceGone)));
        } else {
            let _ = reply.send(Err(RelayError::NotReady(self.name.clone())));
        }
    }

    fn on_add_publisher(
        &mut self,
        endpoint: EndpointRef,
        tracks: Vec<String>,
        reply: oneshot::Sender<Result<PublisherSlot>>,
    ) {
        if tracks.is_empty() {
            let _ = reply.send(Err(RelayError::Protocol(
                "publisher announced no tracks".to_string(),
            )));
            return;
        }

        if let Some(current) = &self.publisher {
            if self.conf.override_publisher {
                let id = current.endpoint.id;
                tracing::info!(
                    path = %self.name,
                    old = %id,
                    new = %endpoint.id,
                    "publisher overridden"
                );
                self.on_remove_publisher(id, TerminateReason::ClientGone);
            } else {
                let _ = reply.send(Err(RelayError::AlreadyPublishing(self.name.clone())));
                return;
            }
        }

        let (terminate, terminated) = oneshot::channel();
        self.publisher = Some(Member {
            endpoint,
            terminate,
        });
        self.tracks = tracks;
        self.ready_time = Some(Utc::now());
        self.lost_publisher = false;

        tracing::info!(
            path = %self.name,
            session = %endpoint.id,
            kind = endpoint.kind.as_str(),
            tracks = self.tracks.len(),
            "publisher attached, path ready"
        );

        let slot = PublisherSlot {
            writer: self.bus.writer(),
            terminated,
        };
        if reply.send(Ok(slot)).is_err() {
            // caller cancelled between enqueue and admission
            self.on_remove_publisher(endpoint.id, TerminateReason::ClientGone);
            return;
        }

        self.flush_waiters();
    }

    /// Hand out the description and attach pending readers now that the
    /// path is ready
    fn flush_waiters(&mut self) {
        let description = self.description();
        for waiter in self.describe_waiters.drain(..) {
            let _ = waiter.send(Ok(description.clone()));
        }

        let pending = std::mem::take(&mut self.pending_readers);
        for p in pending {
            self.attach_reader(p.endpoint, p.bytes_sent, p.reply);
        }
    }

    fn on_remove_publisher(&mut self, id: Uuid, reason: TerminateReason) {
        let Some(member) = self.publisher.take() else {
            return;
        };
        if member.endpoint.id != id {
            self.publisher = Some(member);
            return;
        }

        let _ = member.terminate.send(reason);
        self.tracks.clear();
        self.ready_time = None;
        self.lost_publisher = true;

        let detached = self.readers.len();
        for reader in self.readers.drain(..) {
            let _ = reader.terminate.send(TerminateReason::SourceGone);
        }

        tracing::info!(
            path = %self.name,
            session = %id,
            reason = reason.as_str(),
            readers_detached = detached,
            "publisher detached"
        );

        self.maybe_notify_idle();
    }

    fn on_add_reader(
        &mut self,
        endpoint: EndpointRef,
        bytes_sent: Arc<AtomicU64>,
        wait: bool,
        reply: oneshot::Sender<Result<ReaderSlot>>,
    ) {
        if self.ready() {
            self.attach_reader(endpoint, bytes_sent, reply);
            return;
        }

        self.start_on_demand_source();

        let may_wait = wait
            && (self.conf.wait_for_publisher
                || self.conf.source_url().is_some());
        if may_wait {
            self.pending_readers.push(PendingReader {
                endpoint,
                bytes_sent,
                reply,
            });
        } else if self.lost_publisher {
            let _ = reply.send(Err(RelayError::Terminated(TerminateReason::SourceGone)));
        } else {
            let _ = reply.send(Err(RelayError::NotReady(self.name.clone())));
        }
    }

    fn attach_reader(
        &mut self,
        endpoint: EndpointRef,
        bytes_sent: Arc<AtomicU64>,
        reply: oneshot::Sender<Result<ReaderSlot>>,
    ) {
        let (terminate, terminated) = oneshot::channel();
        let slot = ReaderSlot {
            reader: self.bus.reader(bytes_sent),
            tracks: self.tracks.clone(),
            terminated,
        };

        if reply.send(Ok(slot)).is_err() {
            // caller cancelled; nothing was attached yet
            return;
        }

        self.readers.push(Member {
            endpoint,
            terminate,
        });

        tracing::info!(
            path = %self.name,
            session = %endpoint.id,
            kind = endpoint.kind.as_str(),
            readers = self.readers.len(),
            "reader attached"
        );
    }

    fn on_remove_reader(&mut self, id: Uuid) {
        let before = self.readers.len();
        self.readers.retain(|r| r.endpoint.id != id);
        if self.readers.len() != before {
            tracing::info!(
                path = %self.name,
                session = %id,
                readers = self.readers.len(),
                "reader detached"
            );
            self.maybe_notify_idle();
        }
    }

    fn description(&self) -> PathDescription {
        PathDescription {
            tracks: self.tracks.clone(),
            ready_time: self.ready_time.unwrap_or_else(Utc::now),
        }
    }

    fn snapshot(&self) -> PathSnapshot {
        let source = self
            .publisher
            .as_ref()
            .map(|p| p.endpoint)
            .or_else(|| {
                // a configured pull source is visible even while dialing
                self.source_id.map(|id| EndpointRef {
                    kind: EndpointKind::RtspSource,
                    id,
                })
            });

        PathSnapshot {
            name: self.name.clone(),
            conf_name: self.conf_name.clone(),
            source,
            ready: self.ready(),
            ready_time: self.ready_time,
            tracks: self.tracks.clone(),
            bytes_received: self.bus.bytes_received(),
            readers: self.readers.iter().map(|r| r.endpoint).collect(),
        }
    }

    fn teardown(&mut self, reason: TerminateReason) {
        if let Some(driver) = self.source_driver.take() {
            let _ = driver.send(true);
        }
        if let Some(publisher) = self.publisher.take() {
            let _ = publisher.terminate.send(reason);
        }
        for reader in self.readers.drain(..) {
            let _ = reader.terminate.send(reason);
        }
        for waiter in self.describe_waiters.drain(..) {
            let _ = waiter.send(Err(RelayError::Terminated(reason)));
        }
        for pending in self.pending_readers.drain(..) {
            let _ = pending.reply.send(Err(RelayError::Terminated(reason)));
        }
        self.tracks.clear();
        self.ready_time = None;
    }

    fn maybe_notify_idle(&self) {
        if self.pinned {
            return;
        }
        if self.publisher.is_none() && self.readers.is_empty() && self.pending_readers.is_empty() {
            let _ = self.idle_tx.send(PathIdleNote {
                name: self.name.clone(),
                epoch: self.epoch,
            });
        }
    }

    fn start_on_demand_source(&mut self) {
        if self.conf.source_on_demand && self.source_driver.is_none() {
            self.start_source_driver();
        }
    }

    fn start_source_driver(&mut self) {
        let Some(url) = self.conf.source_url() else {
            return;
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let id = Uuid::new_v4();
        self.source_driver = Some(stop_tx);
        self.source_id = Some(id);

        tokio::spawn(source::run_driver(source::DriverParams {
            path_name: self.name.clone(),
            url: url.to_string(),
            endpoint: EndpointRef {
                kind: EndpointKind::RtspSource,
                id,
            },
            dialer: Arc::clone(&self.dialer),
            path_tx: self.self_tx.clone(),
            read_timeout: self.read_timeout,
            stop: stop_rx,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::source::NullDialer;
    use std::time::Duration;

    fn test_spawn(conf: PathConf, pinned: bool) -> (PathHandle, mpsc::UnboundedReceiver<PathIdleNote>) {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let handle = spawn(PathSpawn {
            name: "cam1".to_string(),
            conf_name: "cam1".to_string(),
            conf: Arc::new(conf),
            pinned,
            epoch: 1,
            idle_tx,
            dialer: Arc::new(NullDialer),
            read_timeout: Duration::from_secs(10),
        });
        (handle, idle_rx)
    }

    fn endpoint(kind: EndpointKind) -> EndpointRef {
        EndpointRef {
            kind,
            id: Uuid::new_v4(),
        }
    }

    fn tracks() -> Vec<String> {
        vec!["video/H264".to_string(), "audio/Opus".to_string()]
    }

    #[tokio::test]
    async fn test_single_publisher_invariant() {
        let (path, _idle) = test_spawn(PathConf::default(), false);

        let first = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(first, tracks()).await.unwrap();

        let second = endpoint(EndpointKind::RtmpConn);
        let err = path.add_publisher(second, tracks()).await.unwrap_err();
        assert!(matches!(err, RelayError::AlreadyPublishing(_)));
    }

    #[tokio::test]
    async fn test_ready_implies_tracks_and_time() {
        let (path, _idle) = test_spawn(PathConf::default(), false);

        let snap = path.snapshot().await.unwrap();
        assert!(!snap.ready);
        assert!(snap.tracks.is_empty());
        assert!(snap.ready_time.is_none());

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();

        let snap = path.snapshot().await.unwrap();
        assert!(snap.ready);
        assert!(!snap.tracks.is_empty());
        assert!(snap.ready_time.is_some());
        assert_eq!(snap.source, Some(publisher));
    }

    #[tokio::test]
    async fn test_publisher_lifecycle_law() {
        let (path, _idle) = test_spawn(PathConf::default(), false);

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();
        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;

        let snap = path.snapshot().await.unwrap();
        assert!(!snap.ready);
        assert!(snap.tracks.is_empty());
        assert!(snap.ready_time.is_none());
        assert!(snap.source.is_none());
    }

    #[tokio::test]
    async fn test_remove_publisher_idempotent() {
        let (path, _idle) = test_spawn(PathConf::default(), false);

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();
        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;
        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;

        // a different id never detaches the current publisher
        let next = endpoint(EndpointKind::RtmpConn);
        let _slot = path.add_publisher(next, tracks()).await.unwrap();
        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;
        assert!(path.snapshot().await.unwrap().ready);
    }

    #[tokio::test]
    async fn test_reader_requires_ready() {
        let (path, _idle) = test_spawn(PathConf::default(), false);

        let err = path
            .add_reader(
                endpoint(EndpointKind::WebRtcSession),
                Arc::new(AtomicU64::new(0)),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_reader_after_teardown_sees_source_gone() {
        let (path, _idle) = test_spawn(PathConf::default(), false);

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();
        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;

        let err = path
            .add_reader(
                endpoint(EndpointKind::WebRtcSession),
                Arc::new(AtomicU64::new(0)),
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Terminated(TerminateReason::SourceGone));
    }

    #[tokio::test]
    async fn test_reader_add_remove_law() {
        let (path, _idle) = test_spawn(PathConf::default(), false);

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();
        let before = path.snapshot().await.unwrap();

        let reader = endpoint(EndpointKind::WebRtcSession);
        let slot = path
            .add_reader(reader, Arc::new(AtomicU64::new(0)), false)
            .await
            .unwrap();
        assert_eq!(slot.tracks, tracks());
        assert_eq!(path.snapshot().await.unwrap().readers.len(), 1);

        path.remove_reader(reader.id).await;
        path.remove_reader(reader.id).await; // idempotent

        let after = path.snapshot().await.unwrap();
        assert_eq!(after.ready, before.ready);
        assert_eq!(after.tracks, before.tracks);
        assert!(after.readers.is_empty());
    }

    #[tokio::test]
    async fn test_readers_detached_on_publisher_loss() {
        let (path, _idle) = test_spawn(PathConf::default(), false);

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();

        let reader = endpoint(EndpointKind::WebRtcSession);
        let slot = path
            .add_reader(reader, Arc::new(AtomicU64::new(0)), false)
            .await
            .unwrap();

        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;

        let reason = slot.terminated.await.unwrap();
        assert_eq!(reason, TerminateReason::SourceGone);
        assert!(path.snapshot().await.unwrap().readers.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_publisher() {
        let conf = PathConf {
            wait_for_publisher: true,
            ..PathConf::default()
        };
        let (path, _idle) = test_spawn(conf, false);

        let reader = endpoint(EndpointKind::WebRtcSession);
        let waiting = {
            let path = path.clone();
            tokio::spawn(async move {
                path.add_reader(reader, Arc::new(AtomicU64::new(0)), true)
                    .await
            })
        };

        // let the attach request reach the mailbox, then publish
        tokio::time::sleep(Duration::from_millis(50)).await;
        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();

        let slot = waiting.await.unwrap().unwrap();
        assert_eq!(slot.tracks, tracks());
    }

    #[tokio::test]
    async fn test_describe_waits_and_flushes() {
        let conf = PathConf {
            wait_for_publisher: true,
            ..PathConf::default()
        };
        let (path, _idle) = test_spawn(conf, false);

        let waiting = {
            let path = path.clone();
            tokio::spawn(async move { path.describe(true).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();

        let description = waiting.await.unwrap().unwrap();
        assert_eq!(description.tracks, tracks());
    }

    #[tokio::test]
    async fn test_override_publisher() {
        let conf = PathConf {
            override_publisher: true,
            ..PathConf::default()
        };
        let (path, _idle) = test_spawn(conf, false);

        let first = endpoint(EndpointKind::RtmpConn);
        let slot1 = path.add_publisher(first, tracks()).await.unwrap();

        let second = endpoint(EndpointKind::WebRtcSession);
        let _slot2 = path.add_publisher(second, tracks()).await.unwrap();

        assert_eq!(
            slot1.terminated.await.unwrap(),
            TerminateReason::ClientGone
        );
        assert!(path.snapshot().await.unwrap().ready);
    }

    #[tokio::test]
    async fn test_idle_notification() {
        let (path, mut idle) = test_spawn(PathConf::default(), false);

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();
        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;

        let note = idle.recv().await.unwrap();
        assert_eq!(note.name, "cam1");
        assert_eq!(note.epoch, 1);

        // a close check against an empty path shuts it down
        assert!(path.confirm_idle().await);
        let err = path.snapshot().await.unwrap_err();
        assert!(matches!(err, RelayError::Terminated(_)));
    }

    #[tokio::test]
    async fn test_pinned_path_never_reports_idle() {
        let conf = PathConf {
            always_on: true,
            ..PathConf::default()
        };
        let (path, mut idle) = test_spawn(conf, true);

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let _slot = path.add_publisher(publisher, tracks()).await.unwrap();
        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;

        // force the mailbox to cycle, then check no note arrived
        let _ = path.snapshot().await.unwrap();
        assert!(idle.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain_terminates_members() {
        let (path, _idle) = test_spawn(PathConf::default(), false);

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let pub_slot = path.add_publisher(publisher, tracks()).await.unwrap();
        let reader = endpoint(EndpointKind::WebRtcSession);
        let read_slot = path
            .add_reader(reader, Arc::new(AtomicU64::new(0)), false)
            .await
            .unwrap();

        path.drain(TerminateReason::Reconfigured).await;

        assert_eq!(
            pub_slot.terminated.await.unwrap(),
            TerminateReason::Reconfigured
        );
        assert_eq!(
            read_slot.terminated.await.unwrap(),
            TerminateReason::Reconfigured
        );

        let err = path.snapshot().await.unwrap_err();
        assert!(matches!(err, RelayError::Terminated(_)));
    }

    #[tokio::test]
    async fn test_empty_track_list_rejected() {
        let (path, _idle) = test_spawn(PathConf::default(), false);
        let err = path
            .add_publisher(endpoint(EndpointKind::WebRtcSession), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_frames_flow_publisher_to_reader() {
        use bytes::Bytes;
        use crate::stream::UnitFrame;

        let (path, _idle) = test_spawn(PathConf::default(), false);

        let publisher = endpoint(EndpointKind::WebRtcSession);
        let slot = path.add_publisher(publisher, tracks()).await.unwrap();

        let sent = Arc::new(AtomicU64::new(0));
        let reader = endpoint(EndpointKind::WebRtcSession);
        let mut read_slot = path
            .add_reader(reader, Arc::clone(&sent), false)
            .await
            .unwrap();

        slot.writer
            .send(UnitFrame::new(0, 0, Bytes::from_static(&[7u8; 64])));

        let frame = read_slot.reader.recv().await.unwrap();
        assert_eq!(frame.size(), 64);
        assert_eq!(path.snapshot().await.unwrap().bytes_received, 64);
        assert_eq!(sent.load(std::sync::atomic::Ordering::Relaxed), 64);
    }
}
