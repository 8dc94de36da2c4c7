//! Admission control for publishers and readers
//!
//! A single operation: [`Authenticator::check`]. The path pattern is resolved
//! first (no match is `NotFound`), then the IP allow-list, then credentials.
//! Wrong credentials cost the caller a fixed delay before the error returns,
//! to rate-limit brute force; absent credentials return immediately with the
//! challenge flag set so HTTP front-ends can send `WWW-Authenticate`.

use std::net::IpAddr;
use std::sync::Arc;

use crate::conf::{parse_ip_or_cidr, ConfStore, PathConf};
use crate::error::{RelayError, Result};

/// What the caller wants to do with the path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Publish,
    Read,
    /// Recording playback; gated by the read rules
    Playback,
}

impl AuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAction::Publish => "publish",
            AuthAction::Read => "read",
            AuthAction::Playback => "playback",
        }
    }
}

/// Protocol tag carried for logging and per-protocol rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Rtsp,
    Rtmp,
    Srt,
    WebRtc,
    Hls,
    Api,
}

impl AuthProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProtocol::Rtsp => "rtsp",
            AuthProtocol::Rtmp => "rtmp",
            AuthProtocol::Srt => "srt",
            AuthProtocol::WebRtc => "webrtc",
            AuthProtocol::Hls => "hls",
            AuthProtocol::Api => "api",
        }
    }
}

/// One admission request
#[derive(Debug, Clone)]
pub struct AccessRequest {
    /// Path name being accessed
    pub name: String,
    pub action: AuthAction,
    /// Credentials, if the client supplied any
    pub user: Option<String>,
    pub pass: Option<String>,
    /// Source address of the client
    pub ip: IpAddr,
    pub proto: AuthProtocol,
}

/// Decides whether an access request is permitted
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<ConfStore>,
}

impl Authenticator {
    pub fn new(store: Arc<ConfStore>) -> Self {
        Self { store }
    }

    /// Check a request against the current configuration generation
    ///
    /// May sleep for the configured delay before returning a
    /// wrong-credential failure; callers must not hold a path mailbox slot
    /// across this call.
    pub async fn check(&self, req: &AccessRequest) -> Result<()> {
        let generation = self.store.current();
        let Some((_, path_conf)) = generation.find_path_conf(&req.name) else {
            return Err(RelayError::NotFound(req.name.clone()));
        };

        match self.check_against(&path_conf, req) {
            Ok(()) => Ok(()),
            Err(RelayError::Auth { challenge: false }) => {
                tracing::info!(
                    path = %req.name,
                    action = req.action.as_str(),
                    proto = req.proto.as_str(),
                    ip = %req.ip,
                    "authentication failed"
                );
                // fixed pause against credential brute force
                tokio::time::sleep(generation.conf.auth_fail_delay()).await;
                Err(RelayError::Auth { challenge: false })
            }
            Err(e) => Err(e),
        }
    }

    fn check_against(&self, conf: &PathConf, req: &AccessRequest) -> Result<()> {
        let (user, pass, ips) = match req.action {
            AuthAction::Publish => (&conf.publish_user, &conf.publish_pass, &conf.publish_ips),
            AuthAction::Read | AuthAction::Playback => {
                (&conf.read_user, &conf.read_pass, &conf.read_ips)
            }
        };

        if !ips.is_empty() {
            let allowed = ips
                .iter()
                .filter_map(|entry| parse_ip_or_cidr(entry))
                .any(|net| net.contains(req.ip));
            if !allowed {
                return Err(RelayError::Auth { challenge: false });
            }
        }

        if user.is_empty() && pass.is_empty() {
            return Ok(());
        }

        match (&req.user, &req.pass) {
            (None, None) => Err(RelayError::Auth { challenge: true }),
            (supplied_user, supplied_pass) => {
                let user_ok = supplied_user.as_deref().unwrap_or("") == user;
                let pass_ok = supplied_pass.as_deref().unwrap_or("") == pass;
                if user_ok && pass_ok {
                    Ok(())
                } else {
                    Err(RelayError::Auth { challenge: false })
                }
            }
        }
    }
}
