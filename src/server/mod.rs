//! Top-level supervisor
//!
//! Builds the config store, session registry, path manager and the two HTTP
//! servers, pumps config reload events into the path manager, and tears
//! everything down on shutdown. Both listeners are bound eagerly so a bad
//! address fails startup instead of surfacing later.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::api;
use crate::conf::{Conf, ConfStore};
use crate::error::{RelayError, Result};
use crate::path::manager::PathManager;
use crate::path::source::SourceDialer;
use crate::registry::SessionRegistry;
use crate::webrtc::peer::PeerConnector;
use crate::webrtc::{http as webrtc_http, WebRtcServer};

/// A fully wired relay instance
pub struct Relay {
    store: Arc<ConfStore>,
    registry: Arc<SessionRegistry>,
    manager: PathManager,
    webrtc: Arc<WebRtcServer>,
    api_listener: TcpListener,
    webrtc_listener: TcpListener,
    api_addr: SocketAddr,
    webrtc_addr: SocketAddr,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("api_addr", &self.api_addr)
            .field("webrtc_addr", &self.webrtc_addr)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Validate the config, bind the listeners and spawn the core
    pub async fn new(
        conf: Conf,
        dialer: Arc<dyn SourceDialer>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Relay> {
        let store = Arc::new(ConfStore::new(conf)?);
        let registry = Arc::new(SessionRegistry::new());
        let manager = PathManager::spawn(&store, dialer);
        let webrtc = WebRtcServer::new(
            manager.clone(),
            Arc::clone(&registry),
            Arc::clone(&store),
            connector,
        );

        let conf = store.current();
        let api_listener = bind(&conf.conf.api_address).await?;
        let webrtc_listener = bind(&conf.conf.webrtc_address).await?;
        let api_addr = local_addr(&api_listener)?;
        let webrtc_addr = local_addr(&webrtc_listener)?;

        Ok(Relay {
            store,
            registry,
            manager,
            webrtc,
            api_listener,
            webrtc_listener,
            api_addr,
            webrtc_addr,
        })
    }

    /// Configuration store, shared with the API and reload pump
    pub fn store(&self) -> &Arc<ConfStore> {
        &self.store
    }

    /// Actual bound address of the control API (useful with port 0)
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    /// Actual bound address of the WHIP/WHEP server
    pub fn webrtc_addr(&self) -> SocketAddr {
        self.webrtc_addr
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let Relay {
            store,
            registry,
            manager,
            webrtc,
            api_listener,
            webrtc_listener,
            api_addr,
            webrtc_addr,
        } = self;

        let api_router = api::router(Arc::clone(&store), Arc::clone(&registry), manager.clone());
        let webrtc_router = webrtc_http::router(webrtc);

        tracing::info!(addr = %api_addr, "control API listening");
        tracing::info!(addr = %webrtc_addr, "WebRTC server listening");

        // reload pump: every generation published by the store is applied
        // to the path manager, in order
        let mut reload_rx = store.subscribe();
        let reload_pump = async move {
            while reload_rx.changed().await.is_ok() {
                let generation = reload_rx.borrow_and_update().clone();
                if let Err(e) = manager.reload(generation).await {
                    tracing::error!(error = %e, "config reload failed");
                }
            }
        };

        let api_server = async move {
            axum::serve(
                api_listener,
                api_router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
        };
        let webrtc_server = async move {
            axum::serve(
                webrtc_listener,
                webrtc_router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
        };

        tokio::select! {
            _ = shutdown => {
                tracing::info!("shutdown requested");
                Ok(())
            }
            res = api_server => {
                res.map_err(|e| RelayError::Internal(format!("api server: {}", e)))
            }
            res = webrtc_server => {
                res.map_err(|e| RelayError::Internal(format!("webrtc server: {}", e)))
            }
            _ = reload_pump => Ok(()),
        }
    }
}

async fn bind(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| RelayError::Validation(format!("invalid bind address {:?}", addr)))?;
    TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::Validation(format!("cannot bind {}: {}", addr, e)))
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|e| RelayError::Internal(format!("local addr: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::source::NullDialer;
    use crate::webrtc::stub::StubConnector;

    #[tokio::test]
    async fn test_relay_binds_ephemeral_ports() {
        let mut conf = Conf::default();
        conf.api_address = "127.0.0.1:0".to_string();
        conf.webrtc_address = "127.0.0.1:0".to_string();

        let relay = Relay::new(
            conf,
            Arc::new(NullDialer),
            Arc::new(StubConnector::new()),
        )
        .await
        .unwrap();

        assert_ne!(relay.api_addr().port(), 0);
        assert_ne!(relay.webrtc_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_invalid_bind_address_rejected() {
        let mut conf = Conf::default();
        conf.api_address = "256.0.0.1:9997".to_string();

        // address syntax is caught by validation before binding
        let err = Relay::new(
            conf,
            Arc::new(NullDialer),
            Arc::new(StubConnector::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }
}
