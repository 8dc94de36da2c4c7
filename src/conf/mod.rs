//! Server and per-path configuration
//!
//! The config document is YAML with a closed key set: unknown keys reject the
//! load. Per-path settings are written as overrides on top of `pathDefaults`,
//! keyed by a [`PathPattern`]. Validation is all-or-nothing; a rejected
//! document leaves the current generation untouched.

pub mod pattern;
pub mod store;

pub use pattern::{valid_path_name, PathPattern};
pub use store::{ConfGeneration, ConfStore};

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RelayError, Result};

/// URL schemes accepted for pull sources
const SOURCE_SCHEMES: [&str; 5] = ["rtsp", "rtsps", "rtmp", "rtmps", "srt"];

/// Fully resolved per-path settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PathConf {
    /// `"publisher"` to accept an external publisher, or a URL the path
    /// dials itself (`rtsp://...`, `rtmp://...`, `srt://...`)
    pub source: String,

    /// Dial the source at first reader instead of at path creation
    pub source_on_demand: bool,

    /// Keep the path alive even when empty (publisher-source paths only;
    /// URL-source paths with an exact name are always pinned)
    pub always_on: bool,

    /// Recording flag (accepted and reported; recording itself is not
    /// performed by this server)
    pub record: bool,

    /// Readers arriving before the publisher block until ready instead of
    /// failing with `NotReady`
    pub wait_for_publisher: bool,

    /// A new publisher replaces the current one instead of being rejected
    pub override_publisher: bool,

    /// Credentials required to publish (empty = open)
    pub publish_user: String,
    pub publish_pass: String,
    /// IPs or CIDRs allowed to publish (empty = any)
    pub publish_ips: Vec<String>,

    /// Credentials required to read (empty = open)
    pub read_user: String,
    pub read_pass: String,
    /// IPs or CIDRs allowed to read (empty = any)
    pub read_ips: Vec<String>,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            source: "publisher".to_string(),
            source_on_demand: false,
            always_on: false,
            record: false,
            wait_for_publisher: false,
            override_publisher: false,
            publish_user: String::new(),
            publish_pass: String::new(),
            publish_ips: Vec::new(),
            read_user: String::new(),
            read_pass: String::new(),
            read_ips: Vec::new(),
        }
    }
}

impl PathConf {
    /// Whether the path accepts an external publisher
    pub fn is_publisher_source(&self) -> bool {
        self.source == "publisher"
    }

    /// The pull-source URL, if the path dials its own source
    pub fn source_url(&self) -> Option<&str> {
        if self.is_publisher_source() {
            None
        } else {
            Some(self.source.as_str())
        }
    }
}

/// Per-path overrides as written in the config document and in API patches
///
/// Unset fields inherit from `pathDefaults`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct OptionalPathConf {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_on_demand: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub always_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_publisher: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_publisher: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_ips: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_ips: Option<Vec<String>>,
}

macro_rules! overlay {
    ($out:expr, $over:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(v) = &$over.$field {
                $out.$field = v.clone();
            }
        )+
    };
}

impl OptionalPathConf {
    /// Resolve against defaults, producing the effective settings
    pub fn apply_to(&self, defaults: &PathConf) -> PathConf {
        let mut out = defaults.clone();
        overlay!(
            out,
            self,
            source,
            source_on_demand,
            always_on,
            record,
            wait_for_publisher,
            override_publisher,
            publish_user,
            publish_pass,
            publish_ips,
            read_user,
            read_pass,
            read_ips,
        );
        out
    }
}

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Conf {
    /// Log verbosity: error, warn, info, debug or trace
    pub log_level: String,

    /// Bind address of the JSON control API
    pub api_address: String,

    /// Bind address of the WHIP/WHEP HTTP server
    pub webrtc_address: String,

    /// Value of `Access-Control-Allow-Origin` on WebRTC HTTP responses
    pub allow_origin: String,

    /// STUN/TURN servers advertised to WHIP/WHEP clients
    pub ice_servers: Vec<String>,

    /// Network read timeout, seconds
    pub read_timeout: u64,

    /// Network write timeout, seconds
    pub write_timeout: u64,

    /// Delay enforced after a wrong-credential authentication attempt,
    /// seconds (minimum 1)
    pub auth_fail_delay: u64,

    /// WebRTC handshake window: POST to established, seconds
    pub handshake_timeout: u64,

    /// Defaults inherited by every path
    pub path_defaults: PathConf,

    /// Per-pattern overrides
    pub paths: HashMap<String, OptionalPathConf>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            api_address: "127.0.0.1:9997".to_string(),
            webrtc_address: "0.0.0.0:8889".to_string(),
            allow_origin: "*".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            read_timeout: 10,
            write_timeout: 10,
            auth_fail_delay: 2,
            handshake_timeout: 10,
            path_defaults: PathConf::default(),
            paths: HashMap::new(),
        }
    }
}

impl Conf {
    /// Parse and validate a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let conf: Conf = serde_yaml::from_str(text)
            .map_err(|e| RelayError::Validation(e.to_string()))?;
        conf.validate()?;
        Ok(conf)
    }

    /// Load and validate a config file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Validation(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }

    /// Validate the whole document; all-or-nothing
    pub fn validate(&self) -> Result<()> {
        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(RelayError::Validation(format!(
                    "unknown log level {:?}",
                    other
                )))
            }
        }

        for (label, addr) in [("apiAddress", &self.api_address), ("webrtcAddress", &self.webrtc_address)] {
            addr.parse::<std::net::SocketAddr>().map_err(|_| {
                RelayError::Validation(format!("{} is not a valid socket address: {:?}", label, addr))
            })?;
        }

        if self.read_timeout == 0 || self.write_timeout == 0 {
            return Err(RelayError::Validation(
                "readTimeout and writeTimeout must be positive".to_string(),
            ));
        }
        if self.auth_fail_delay < 1 {
            return Err(RelayError::Validation(
                "authFailDelay must be at least 1 second".to_string(),
            ));
        }
        if self.handshake_timeout == 0 {
            return Err(RelayError::Validation(
                "handshakeTimeout must be positive".to_string(),
            ));
        }

        validate_path_conf("pathDefaults", None, &self.path_defaults)?;

        for (key, overrides) in &self.paths {
            let pattern = PathPattern::parse(key)?;
            let effective = overrides.apply_to(&self.path_defaults);
            validate_path_conf(key, Some(&pattern), &effective)?;
        }

        Ok(())
    }

    /// Effective settings for a pattern key, or `None` if the key is absent
    pub fn effective_path_conf(&self, key: &str) -> Option<PathConf> {
        self.paths
            .get(key)
            .map(|overrides| overrides.apply_to(&self.path_defaults))
    }

    /// Network read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    /// Anti-brute-force delay as a `Duration`
    pub fn auth_fail_delay(&self) -> Duration {
        Duration::from_secs(self.auth_fail_delay)
    }

    /// WebRTC handshake window as a `Duration`
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

fn validate_path_conf(key: &str, pattern: Option<&PathPattern>, conf: &PathConf) -> Result<()> {
    if let Some(url) = conf.source_url() {
        let parsed = Url::parse(url).map_err(|e| {
            RelayError::Validation(format!("path {:?}: invalid source URL: {}", key, e))
        })?;
        if !SOURCE_SCHEMES.contains(&parsed.scheme()) {
            return Err(RelayError::Validation(format!(
                "path {:?}: unsupported source scheme {:?}",
                key,
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() {
            return Err(RelayError::Validation(format!(
                "path {:?}: source URL has no host",
                key
            )));
        }
        if conf.wait_for_publisher {
            return Err(RelayError::Validation(format!(
                "path {:?}: waitForPublisher requires source: publisher",
                key
            )));
        }
        if conf.override_publisher {
            return Err(RelayError::Validation(format!(
                "path {:?}: overridePublisher requires source: publisher",
                key
            )));
        }
    } else if conf.source_on_demand {
        return Err(RelayError::Validation(format!(
            "path {:?}: sourceOnDemand requires a URL source",
            key
        )));
    }

    if conf.always_on {
        match pattern {
            Some(PathPattern::Exact(_)) => {}
            Some(_) => {
                return Err(RelayError::Validation(format!(
                    "path {:?}: alwaysOn is only valid on an exact path name",
                    key
                )))
            }
            // pathDefaults cannot be always-on: it would pin every pattern
            None => {
                return Err(RelayError::Validation(
                    "pathDefaults: alwaysOn is only valid on an exact path name".to_string(),
                ))
            }
        }
    }

    for (label, list) in [("publishIps", &conf.publish_ips), ("readIps", &conf.read_ips)] {
        for entry in list {
            parse_ip_or_cidr(entry).ok_or_else(|| {
                RelayError::Validation(format!(
                    "path {:?}: {} entry {:?} is not an IP or CIDR",
                    key, label, entry
                ))
            })?;
        }
    }

    Ok(())
}

/// An allow-list entry: a single address or a network prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpOrCidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpOrCidr {
    /// Whether `ip` falls inside this entry
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = 32u32.saturating_sub(self.prefix as u32);
                if bits >= 32 {
                    return true;
                }
                (u32::from(net) >> bits) == (u32::from(ip) >> bits)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = 128u32.saturating_sub(self.prefix as u32);
                if bits >= 128 {
                    return true;
                }
                (u128::from(net) >> bits) == (u128::from(ip) >> bits)
            }
            _ => false,
        }
    }
}

/// Parse `"10.0.0.0/8"` or a bare address (full-length prefix)
pub fn parse_ip_or_cidr(entry: &str) -> Option<IpOrCidr> {
    match entry.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            let max = if addr.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return None;
            }
            Some(IpOrCidr { addr, prefix })
        }
        None => {
            let addr: IpAddr = entry.parse().ok()?;
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            Some(IpOrCidr { addr, prefix })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        Conf::default().validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let conf = Conf::from_yaml(
            r#"
logLevel: debug
paths:
  cam1:
    publishUser: admin
    publishPass: secret
  "~^live/.*$":
    readUser: viewer
    readPass: view
  all: {}
"#,
        )
        .unwrap();

        assert_eq!(conf.log_level, "debug");
        assert_eq!(conf.paths.len(), 3);
        let cam1 = conf.effective_path_conf("cam1").unwrap();
        assert_eq!(cam1.publish_user, "admin");
        assert_eq!(cam1.source, "publisher");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Conf::from_yaml("noSuchOption: true\n").unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_unknown_path_key_rejected() {
        let err = Conf::from_yaml("paths:\n  cam1:\n    bogus: 3\n").unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let err = Conf::from_yaml("paths:\n  \"~^cam[\": {}\n").unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_source_url_syntax_only() {
        // Unreachable but syntactically fine: accepted
        Conf::from_yaml("paths:\n  live:\n    source: rtsp://203.0.113.7/feed\n").unwrap();

        let err =
            Conf::from_yaml("paths:\n  live:\n    source: \"not a url\"\n").unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let err = Conf::from_yaml("paths:\n  live:\n    source: ftp://x/feed\n").unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_always_on_on_regex_rejected() {
        let err =
            Conf::from_yaml("paths:\n  \"~^cam.*$\":\n    alwaysOn: true\n").unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_auth_delay_floor() {
        let err = Conf::from_yaml("authFailDelay: 0\n").unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_path_defaults_inheritance() {
        let conf = Conf::from_yaml(
            r#"
pathDefaults:
  readUser: viewer
  readPass: view
paths:
  open:
    readUser: ""
    readPass: ""
  locked: {}
"#,
        )
        .unwrap();

        assert_eq!(conf.effective_path_conf("open").unwrap().read_user, "");
        assert_eq!(conf.effective_path_conf("locked").unwrap().read_user, "viewer");
    }

    #[test]
    fn test_cidr_matching() {
        let net = parse_ip_or_cidr("10.0.0.0/8").unwrap();
        assert!(net.contains("10.200.3.4".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));

        let single = parse_ip_or_cidr("192.168.1.5").unwrap();
        assert!(single.contains("192.168.1.5".parse().unwrap()));
        assert!(!single.contains("192.168.1.6".parse().unwrap()));

        let v6 = parse_ip_or_cidr("fd00::/8").unwrap();
        assert!(v6.contains("fd00::1".parse().unwrap()));
        assert!(!v6.contains("::1".parse().unwrap()));

        assert!(parse_ip_or_cidr("10.0.0.0/33").is_none());
        assert!(parse_ip_or_cidr("banana").is_none());
    }
}
