//! Syntax-level SDP handling
//!
//! The relay only inspects the surface of SDP: enough to reject garbage
//! offers early, to split a trickle-ICE fragment into candidates, and to
//! advertise ICE servers as `Link:` headers. Everything semantic (codec
//! negotiation, DTLS, candidate pairing) happens behind the
//! [`super::peer::PeerConnector`] seam.

use crate::error::{RelayError, Result};

/// One ICE candidate carried by a trickle fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// The `candidate:...` attribute value
    pub candidate: String,
    /// The media section it belongs to, when the fragment names one
    pub mid: Option<String>,
}

/// Reject an offer that cannot be SDP at all
///
/// Real parsing is the peer stack's job; this only guards the handshake
/// coordinator against clearly malformed input.
pub fn validate_offer(offer: &str) -> Result<()> {
    if offer.trim().is_empty() {
        return Err(RelayError::Protocol("empty SDP offer".to_string()));
    }
    let mut lines = offer.lines();
    match lines.next() {
        Some(first) if first.trim_end() == "v=0" => {}
        _ => {
            return Err(RelayError::Protocol(
                "SDP offer does not start with v=0".to_string(),
            ))
        }
    }
    if !offer.lines().any(|l| l.starts_with("m=")) {
        return Err(RelayError::Protocol(
            "SDP offer has no media section".to_string(),
        ));
    }
    Ok(())
}

/// Parse an `application/trickle-ice-sdpfrag` body into candidates
///
/// A fragment is a sequence of `a=mid:` and `a=candidate:` attributes,
/// optionally preceded by `a=ice-ufrag`/`a=ice-pwd`. Anything else is a
/// protocol error.
pub fn parse_ice_fragment(body: &str) -> Result<Vec<IceCandidate>> {
    let mut candidates = Vec::new();
    let mut current_mid: Option<String> = None;

    for raw in body.lines() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }

        if let Some(attr) = line.strip_prefix("a=") {
            if let Some(mid) = attr.strip_prefix("mid:") {
                current_mid = Some(mid.to_string());
            } else if attr.starts_with("candidate:") {
                candidates.push(IceCandidate {
                    candidate: attr.to_string(),
                    mid: current_mid.clone(),
                });
            } else if attr.starts_with("ice-ufrag:")
                || attr.starts_with("ice-pwd:")
                || attr == "end-of-candidates"
            {
                // allowed fragment attributes without candidate payload
            } else {
                return Err(RelayError::Protocol(format!(
                    "unexpected attribute in ICE fragment: {}",
                    attr
                )));
            }
        } else if line.starts_with("m=") {
            // per-media-section fragments reset the mid context
            current_mid = None;
        } else {
            return Err(RelayError::Protocol(format!(
                "unexpected line in ICE fragment: {}",
                line
            )));
        }
    }

    if candidates.is_empty() {
        return Err(RelayError::Protocol(
            "ICE fragment carries no candidates".to_string(),
        ));
    }
    Ok(candidates)
}

/// `Link:` header values advertising the configured STUN/TURN servers
pub fn ice_server_links(servers: &[String]) -> Vec<String> {
    servers
        .iter()
        .map(|url| format!("<{}>; rel=\"ice-server\"", url))
        .collect()
}
