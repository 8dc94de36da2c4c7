//! # relay-rs
//!
//! A real-time media relay addressed by named paths. Publishers push a
//! stream to a path, readers pull it, and the relay coordinates the
//! rendezvous: admission control, at-most-one publisher per path, reader
//! fan-out, hot configuration reload, and WHIP/WHEP signaling over HTTP.
//!
//! ## Architecture
//!
//! - [`conf`] — immutable, versioned configuration generations with
//!   all-or-nothing validation and hot reload.
//! - [`auth`] — admission checks with anti-brute-force pacing.
//! - [`path`] — one actor per path serializing every mutation through a
//!   bounded mailbox; [`path::manager`] owns the namespace and applies
//!   reloads linearizably; [`path::source`] re-dials pull sources with
//!   exponential backoff.
//! - [`registry`] — the process-wide session index (UUID and WHIP secret).
//! - [`webrtc`] — the WHIP/WHEP handshake coordinator and HTTP surface;
//!   the ICE/DTLS stack stays behind [`webrtc::peer`] traits.
//! - [`api`] — the `/v3` JSON control API.
//! - [`server`] — the supervisor wiring it all together.
//!
//! Protocol clients (RTSP, RTMP, SRT) and the media stack are external
//! collaborators plugged in through [`path::source::SourceDialer`] and
//! [`webrtc::peer::PeerConnector`].

pub mod api;
pub mod auth;
pub mod conf;
pub mod error;
pub mod path;
pub mod registry;
pub mod server;
pub mod stream;
pub mod webrtc;

pub use conf::{Conf, ConfStore, PathConf};
pub use error::{RelayError, Result, TerminateReason};
pub use server::Relay;
