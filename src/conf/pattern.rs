//! Path name patterns
//!
//! A key in the `paths:` config map is one of:
//! - an exact path name (`cam1`, `floor2/cam1`)
//! - a regular expression, prefixed with `~` (`~^cam[0-9]+$`)
//! - the catch-all `all`

use regex::Regex;

use crate::error::{RelayError, Result};

/// Parsed form of a `paths:` map key
#[derive(Debug, Clone)]
pub enum PathPattern {
    /// Exact path name
    Exact(String),
    /// `~`-prefixed regular expression
    Regex(Regex),
    /// The `all` catch-all
    Any,
}

impl PathPattern {
    /// Parse a config map key into a pattern
    pub fn parse(key: &str) -> Result<Self> {
        if key == "all" {
            return Ok(PathPattern::Any);
        }
        if let Some(expr) = key.strip_prefix('~') {
            let re = Regex::new(expr).map_err(|e| {
                RelayError::Validation(format!("invalid path regex {:?}: {}", key, e))
            })?;
            return Ok(PathPattern::Regex(re));
        }
        if !valid_path_name(key) {
            return Err(RelayError::Validation(format!(
                "invalid path name {:?}: must be non-empty, without leading or trailing slash",
                key
            )));
        }
        Ok(PathPattern::Exact(key.to_string()))
    }

    /// Whether the pattern matches a concrete path name
    pub fn matches(&self, name: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => exact == name,
            PathPattern::Regex(re) => re.is_match(name),
            PathPattern::Any => true,
        }
    }

    /// Exact name, if this is an exact pattern
    pub fn as_exact(&self) -> Option<&str> {
        match self {
            PathPattern::Exact(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

/// Validate a concrete path name
///
/// Names may contain slashes (multi-segment names are routable), but must be
/// non-empty and must not start or end with a slash.
pub fn valid_path_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('/') && !name.ends_with('/') && !name.contains("//")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        let p = PathPattern::parse("cam1").unwrap();
        assert!(p.matches("cam1"));
        assert!(!p.matches("cam2"));
        assert_eq!(p.as_exact(), Some("cam1"));
    }

    #[test]
    fn test_multi_segment_exact() {
        let p = PathPattern::parse("floor2/cam1").unwrap();
        assert!(p.matches("floor2/cam1"));
        assert!(!p.matches("floor2"));
    }

    #[test]
    fn test_regex() {
        let p = PathPattern::parse("~^cam[0-9]+$").unwrap();
        assert!(p.matches("cam7"));
        assert!(!p.matches("mic1"));
        assert!(p.as_exact().is_none());
    }

    #[test]
    fn test_bad_regex_rejected() {
        assert!(PathPattern::parse("~^cam[").is_err());
    }

    #[test]
    fn test_any() {
        let p = PathPattern::parse("all").unwrap();
        assert!(p.matches("anything/at/all"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(PathPattern::parse("").is_err());
        assert!(PathPattern::parse("/cam1").is_err());
        assert!(PathPattern::parse("cam1/").is_err());
        assert!(!valid_path_name("a//b"));
    }
}
