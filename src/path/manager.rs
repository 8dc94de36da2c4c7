//! Path manager
//!
//! Owns the path namespace. Every publisher/reader resolution, path
//! creation and config reload passes through one actor task, which makes
//! creation per name naturally coalesced and makes reloads linearizable
//! with respect to resolutions: a request sees the generation current at
//! the moment the actor dequeues it, never a mixture.
//!
//! Authentication runs in the caller's task *before* the actor is involved,
//! so the anti-brute-force delay never stalls the namespace.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::source::SourceDialer;
use super::{
    spawn, EndpointRef, PathDescription, PathHandle, PathIdleNote, PathSnapshot, PathSpawn,
    PublisherSlot, ReaderSlot,
};
use crate::auth::{AccessRequest, AuthAction, Authenticator};
use crate::conf::{ConfGeneration, ConfStore, PathConf};
use crate::error::{RelayError, Result, TerminateReason};

/// Mailbox depth of the manager actor
const MANAGER_MAILBOX: usize = 256;

enum ManagerRequest {
    GetOrCreate {
        name: String,
        reply: oneshot::Sender<Result<PathHandle>>,
    },
    Get {
        name: String,
        reply: oneshot::Sender<Option<PathHandle>>,
    },
    List {
        reply: oneshot::Sender<Vec<PathHandle>>,
    },
    Reload {
        generation: Arc<ConfGeneration>,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the path namespace
#[derive(Clone)]
pub struct PathManager {
    tx: mpsc::Sender<ManagerRequest>,
    auth: Authenticator,
}

impl PathManager {
    /// Spawn the manager actor over the store's current generation
    pub fn spawn(store: &Arc<ConfStore>, dialer: Arc<dyn SourceDialer>) -> PathManager {
        let (tx, rx) = mpsc::channel(MANAGER_MAILBOX);
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();

        let actor = ManagerActor {
            generation: store.current(),
            paths: HashMap::new(),
            next_epoch: 1,
            idle_tx,
            dialer,
        };
        tokio::spawn(actor.run(rx, idle_rx));

        PathManager {
            tx,
            auth: Authenticator::new(Arc::clone(store)),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ManagerRequest,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| RelayError::Internal("path manager is gone".to_string()))?;
        rx.await
            .map_err(|_| RelayError::Internal("path manager dropped a request".to_string()))
    }

    /// Authenticate and resolve a path for publishing or reading
    ///
    /// Creates the path if the name matches a configured pattern and no
    /// instance exists yet; two concurrent resolutions of the same name
    /// yield the same instance.
    pub async fn resolve_for_access(&self, access: &AccessRequest) -> Result<PathHandle> {
        self.auth.check(access).await?;
        self.request(|reply| ManagerRequest::GetOrCreate {
            name: access.name.clone(),
            reply,
        })
        .await?
    }

    /// Whether an attach lost the race against its path idling out; one
    /// re-resolution is enough because the manager processes the removal
    /// before it hands out another handle for the name
    fn raced_teardown(err: &RelayError) -> bool {
        matches!(err, RelayError::Terminated(TerminateReason::Reconfigured))
    }

    /// Admit a publisher on a path, resolving and authenticating first
    pub async fn attach_publisher(
        &self,
        access: &AccessRequest,
        endpoint: EndpointRef,
        tracks: Vec<String>,
    ) -> Result<(PathHandle, PublisherSlot)> {
        debug_assert_eq!(access.action, AuthAction::Publish);
        let path = self.resolve_for_access(access).await?;
        match path.add_publisher(endpoint, tracks.clone()).await {
            Ok(slot) => Ok((path, slot)),
            Err(e) if Self::raced_teardown(&e) => {
                let path = self.resolve_for_access(access).await?;
                let slot = path.add_publisher(endpoint, tracks).await?;
                Ok((path, slot))
            }
            Err(e) => Err(e),
        }
    }

    /// Attach a reader to a path, resolving and authenticating first
    pub async fn attach_reader(
        &self,
        access: &AccessRequest,
        endpoint: EndpointRef,
        bytes_sent: Arc<AtomicU64>,
        wait: bool,
    ) -> Result<(PathHandle, ReaderSlot)> {
        let path = self.resolve_for_access(access).await?;
        match path.add_reader(endpoint, Arc::clone(&bytes_sent), wait).await {
            Ok(slot) => Ok((path, slot)),
            Err(e) if Self::raced_teardown(&e) => {
                let path = self.resolve_for_access(access).await?;
                let slot = path.add_reader(endpoint, bytes_sent, wait).await?;
                Ok((path, slot))
            }
            Err(e) => Err(e),
        }
    }

    /// Proxy a describe to the matching path
    pub async fn describe(&self, access: &AccessRequest, wait: bool) -> Result<PathDescription> {
        let path = self.resolve_for_access(access).await?;
        match path.describe(wait).await {
            Err(e) if Self::raced_teardown(&e) => {
                let path = self.resolve_for_access(access).await?;
                path.describe(wait).await
            }
            other => other,
        }
    }

    /// Existing path instance by name, if any
    pub async fn get(&self, name: &str) -> Result<Option<PathHandle>> {
        self.request(|reply| ManagerRequest::Get {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Apply a new configuration generation
    pub async fn reload(&self, generation: Arc<ConfGeneration>) -> Result<()> {
        self.request(|reply| ManagerRequest::Reload { generation, reply })
            .await
    }

    /// Snapshots of every live path, name-ordered
    pub async fn paths_snapshot(&self) -> Result<Vec<PathSnapshot>> {
        let handles = self.request(|reply| ManagerRequest::List { reply }).await?;

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            // a path torn down while we iterate is simply skipped
            if let Ok(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }
}

struct PathEntry {
    handle: PathHandle,
    conf: Arc<PathConf>,
    epoch: u64,
    pinned: bool,
}

struct ManagerActor {
    generation: Arc<ConfGeneration>,
    paths: HashMap<String, PathEntry>,
    next_epoch: u64,
    idle_tx: mpsc::UnboundedSender<PathIdleNote>,
    dialer: Arc<dyn SourceDialer>,
}

impl ManagerActor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ManagerRequest>,
        mut idle_rx: mpsc::UnboundedReceiver<PathIdleNote>,
    ) {
        self.create_pinned();

        loop {
            tokio::select! {
                req = rx.recv() => {
                    let Some(req) = req else { break };
                    match req {
                        ManagerRequest::GetOrCreate { name, reply } => {
                            let _ = reply.send(self.get_or_create(&name));
                        }
                        ManagerRequest::Get { name, reply } => {
                            let _ = reply.send(self.paths.get(&name).map(|e| e.handle.clone()));
                        }
                        ManagerRequest::List { reply } => {
                            let handles =
                                self.paths.values().map(|e| e.handle.clone()).collect();
                            let _ = reply.send(handles);
                        }
                        ManagerRequest::Reload { generation, reply } => {
                            self.reload(generation).await;
                            let _ = reply.send(());
                        }
                    }
                }
                note = idle_rx.recv() => {
                    // the manager owns both channel ends; idle_rx cannot close
                    if let Some(note) = note {
                        self.close_if_idle(note).await;
                    }
                }
            }
        }

        for (_, entry) in self.paths.drain() {
            entry.handle.drain(TerminateReason::Reconfigured).await;
        }
    }

    fn read_timeout(&self) -> Duration {
        self.generation.conf.read_timeout()
    }

    fn create_path(&mut self, name: &str, conf_name: &str, conf: Arc<PathConf>, pinned: bool) -> PathHandle {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let handle = spawn(PathSpawn {
            name: name.to_string(),
            conf_name: conf_name.to_string(),
            conf: Arc::clone(&conf),
            pinned,
            epoch,
            idle_tx: self.idle_tx.clone(),
            dialer: Arc::clone(&self.dialer),
            read_timeout: self.read_timeout(),
        });

        self.paths.insert(
            name.to_string(),
            PathEntry {
                handle: handle.clone(),
                conf,
                epoch,
                pinned,
            },
        );
        handle
    }

    /// Instantiate every path the current generation pins
    fn create_pinned(&mut self) {
        let pinned: Vec<(String, Arc<PathConf>)> = self
            .generation
            .pinned_paths()
            .map(|(name, conf)| (name.to_string(), conf))
            .collect();
        for (name, conf) in pinned {
            if !self.paths.contains_key(&name) {
                let conf_name = name.clone();
                self.create_path(&name, &conf_name, conf, true);
            }
        }
    }

    fn get_or_create(&mut self, name: &str) -> Result<PathHandle> {
        if let Some(entry) = self.paths.get(name) {
            return Ok(entry.handle.clone());
        }

        let Some((conf_name, conf)) = self.generation.find_path_conf(name) else {
            return Err(RelayError::NotFound(name.to_string()));
        };
        if !crate::conf::valid_path_name(name) {
            return Err(RelayError::NotFound(name.to_string()));
        }

        let conf_name = conf_name.to_string();
        Ok(self.create_path(name, &conf_name, conf, false))
    }

    async fn reload(&mut self, generation: Arc<ConfGeneration>) {
        let names: Vec<String> = self.paths.keys().cloned().collect();

        for name in names {
            let new_conf = generation.find_path_conf(&name);
            let keep = match (&new_conf, self.paths.get(&name)) {
                (Some((_, conf)), Some(entry)) => **conf == *entry.conf,
                _ => false,
            };
            if keep {
                continue;
            }

            if let Some(entry) = self.paths.remove(&name) {
                tracing::info!(
                    path = %name,
                    matched = new_conf.is_some(),
                    "path reconfigured, draining"
                );
                entry.handle.drain(TerminateReason::Reconfigured).await;
            }
        }

        self.generation = generation;
        self.create_pinned();
    }

    async fn close_if_idle(&mut self, note: PathIdleNote) {
        let Some(entry) = self.paths.get(&note.name) else {
            return;
        };
        // a stale note from a previous instance of the same name
        if entry.epoch != note.epoch || entry.pinned {
            return;
        }

        // the path shuts itself down only if it is still empty; any attach
        // processed after the note wins
        if entry.handle.confirm_idle().await {
            tracing::debug!(path = %note.name, "idle path removed");
            self.paths.remove(&note.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthProtocol;
    use crate::conf::Conf;
    use crate::error::TerminateReason;
    use crate::path::source::NullDialer;
    use crate::path::EndpointKind;
    use uuid::Uuid;

    fn store(yaml: &str) -> Arc<ConfStore> {
        Arc::new(ConfStore::new(Conf::from_yaml(yaml).unwrap()).unwrap())
    }

    fn manager(store: &Arc<ConfStore>) -> PathManager {
        PathManager::spawn(store, Arc::new(NullDialer))
    }

    fn access(name: &str, action: AuthAction) -> AccessRequest {
        AccessRequest {
            name: name.to_string(),
            action,
            user: None,
            pass: None,
            ip: "192.0.2.20".parse().unwrap(),
            proto: AuthProtocol::WebRtc,
        }
    }

    fn endpoint() -> EndpointRef {
        EndpointRef {
            kind: EndpointKind::WebRtcSession,
            id: Uuid::new_v4(),
        }
    }

    fn tracks() -> Vec<String> {
        vec!["video/H264".to_string()]
    }

    #[tokio::test]
    async fn test_unknown_name_not_found() {
        let store = store("paths:\n  cam1: {}\n");
        let manager = manager(&store);

        let err = manager
            .resolve_for_access(&access("ghost", AuthAction::Publish))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_resolves_coalesce() {
        let store = store("paths:\n  all: {}\n");
        let manager = manager(&store);

        let mut joins = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            joins.push(tokio::spawn(async move {
                manager
                    .resolve_for_access(&access("cam1", AuthAction::Read))
                    .await
            }));
        }
        for join in joins {
            join.await.unwrap().unwrap();
        }

        let snapshots = manager.paths_snapshot().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "cam1");
    }

    #[tokio::test]
    async fn test_publish_and_read_through_manager() {
        let store = store("paths:\n  cam1: {}\n");
        let manager = manager(&store);

        let (_path, _pub_slot) = manager
            .attach_publisher(&access("cam1", AuthAction::Publish), endpoint(), tracks())
            .await
            .unwrap();

        let (_path, read_slot) = manager
            .attach_reader(
                &access("cam1", AuthAction::Read),
                endpoint(),
                Arc::new(AtomicU64::new(0)),
                false,
            )
            .await
            .unwrap();
        assert_eq!(read_slot.tracks, tracks());
    }

    #[tokio::test]
    async fn test_double_publisher_rejected() {
        let store = store("paths:\n  cam1: {}\n");
        let manager = manager(&store);

        let (_p, _slot) = manager
            .attach_publisher(&access("cam1", AuthAction::Publish), endpoint(), tracks())
            .await
            .unwrap();

        let err = manager
            .attach_publisher(&access("cam1", AuthAction::Publish), endpoint(), tracks())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AlreadyPublishing(_)));
    }

    #[tokio::test]
    async fn test_reload_drains_changed_path() {
        let store = store("paths:\n  cam1: {}\n");
        let manager = manager(&store);

        let (_path, pub_slot) = manager
            .attach_publisher(&access("cam1", AuthAction::Publish), endpoint(), tracks())
            .await
            .unwrap();

        let new_conf = Conf::from_yaml(
            "paths:\n  cam1:\n    source: rtsp://upstream.example.com/feed\n",
        )
        .unwrap();
        store.replace(new_conf).unwrap();
        manager.reload(store.current()).await.unwrap();

        assert_eq!(
            pub_slot.terminated.await.unwrap(),
            TerminateReason::Reconfigured
        );

        // the replacement is pinned (URL source) and reports an rtspSource
        let snapshots = manager.paths_snapshot().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            snapshots[0].source.map(|s| s.kind),
            Some(EndpointKind::RtspSource)
        );
    }

    #[tokio::test]
    async fn test_reload_same_content_no_churn() {
        let store = store("paths:\n  cam1: {}\n");
        let manager = manager(&store);

        let (_path, pub_slot) = manager
            .attach_publisher(&access("cam1", AuthAction::Publish), endpoint(), tracks())
            .await
            .unwrap();

        // identical content, new generation
        let same = Conf::from_yaml("paths:\n  cam1: {}\n").unwrap();
        store.replace(same).unwrap();
        manager.reload(store.current()).await.unwrap();

        // publisher is untouched and the path is still ready
        let snapshots = manager.paths_snapshot().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].ready);
        drop(pub_slot);
    }

    #[tokio::test]
    async fn test_reload_removes_unmatched_path() {
        let store = store("paths:\n  all: {}\n");
        let manager = manager(&store);

        let (_path, pub_slot) = manager
            .attach_publisher(&access("cam1", AuthAction::Publish), endpoint(), tracks())
            .await
            .unwrap();

        store
            .replace(Conf::from_yaml("paths:\n  other: {}\n").unwrap())
            .unwrap();
        manager.reload(store.current()).await.unwrap();

        assert_eq!(
            pub_slot.terminated.await.unwrap(),
            TerminateReason::Reconfigured
        );
        assert!(manager.paths_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_instantiates_new_always_on() {
        let store = store("paths:\n  cam1: {}\n");
        let manager = manager(&store);
        assert!(manager.paths_snapshot().await.unwrap().is_empty());

        store
            .replace(
                Conf::from_yaml("paths:\n  studio:\n    alwaysOn: true\n  cam1: {}\n").unwrap(),
            )
            .unwrap();
        manager.reload(store.current()).await.unwrap();

        let snapshots = manager.paths_snapshot().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "studio");
    }

    #[tokio::test]
    async fn test_idle_path_is_destroyed() {
        let store = store("paths:\n  all: {}\n");
        let manager = manager(&store);

        let publisher = endpoint();
        let (path, _slot) = manager
            .attach_publisher(&access("cam1", AuthAction::Publish), publisher, tracks())
            .await
            .unwrap();
        assert_eq!(manager.paths_snapshot().await.unwrap().len(), 1);

        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;

        // give the idle note a few mailbox cycles to land
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if manager.paths_snapshot().await.unwrap().is_empty() {
                return;
            }
        }
        panic!("idle path was not destroyed");
    }

    #[tokio::test]
    async fn test_attach_wins_over_idle_note() {
        let store = store("paths:\n  all: {}\n");
        let manager = manager(&store);

        let publisher = endpoint();
        let (path, _slot) = manager
            .attach_publisher(&access("cam1", AuthAction::Publish), publisher, tracks())
            .await
            .unwrap();

        path.remove_publisher(publisher.id, TerminateReason::ClientGone)
            .await;

        // a publisher re-attaching immediately keeps the path alive
        let (_path2, _slot2) = manager
            .attach_publisher(&access("cam1", AuthAction::Publish), endpoint(), tracks())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let snapshots = manager.paths_snapshot().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].ready);
    }
}
