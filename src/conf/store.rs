//! Versioned configuration generations
//!
//! The store publishes immutable [`ConfGeneration`]s through a watch channel:
//! readers grab the current `Arc` without holding a lock, and components that
//! care about reloads subscribe to the channel. `replace` validates first and
//! swaps atomically; a rejected document leaves the current generation in
//! force.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::{Conf, PathConf, PathPattern};
use crate::error::Result;

/// One immutable configuration generation
#[derive(Debug)]
pub struct ConfGeneration {
    /// Monotonic version, starting at 1
    pub version: u64,
    /// The validated document
    pub conf: Conf,
    /// Compiled patterns, resolution order: exact, then `~regex` by key,
    /// then `all`
    patterns: Vec<(String, PathPattern, Arc<PathConf>)>,
}

impl ConfGeneration {
    fn compile(version: u64, conf: Conf) -> Self {
        let mut patterns: Vec<(String, PathPattern, Arc<PathConf>)> = conf
            .paths
            .iter()
            .filter_map(|(key, overrides)| {
                // Validation already ran; an unparsable key cannot appear here
                let pattern = PathPattern::parse(key).ok()?;
                let effective = Arc::new(overrides.apply_to(&conf.path_defaults));
                Some((key.clone(), pattern, effective))
            })
            .collect();

        patterns.sort_by(|(ka, pa, _), (kb, pb, _)| {
            fn rank(p: &PathPattern) -> u8 {
                match p {
                    PathPattern::Exact(_) => 0,
                    PathPattern::Regex(_) => 1,
                    PathPattern::Any => 2,
                }
            }
            rank(pa).cmp(&rank(pb)).then_with(|| ka.cmp(kb))
        });

        Self {
            version,
            conf,
            patterns,
        }
    }

    /// Resolve a concrete path name to its matching pattern key and settings
    pub fn find_path_conf(&self, name: &str) -> Option<(&str, Arc<PathConf>)> {
        self.patterns
            .iter()
            .find(|(_, pattern, _)| pattern.matches(name))
            .map(|(key, _, conf)| (key.as_str(), Arc::clone(conf)))
    }

    /// Exact-named paths that must exist while this generation is current:
    /// URL sources (their dial loop is their demand) and `alwaysOn` paths
    pub fn pinned_paths(&self) -> impl Iterator<Item = (&str, Arc<PathConf>)> {
        self.patterns.iter().filter_map(|(_, pattern, conf)| {
            let name = pattern.as_exact()?;
            if conf.always_on || !conf.is_publisher_source() {
                Some((name, Arc::clone(conf)))
            } else {
                None
            }
        })
    }
}

/// The process-wide configuration store
#[derive(Debug)]
pub struct ConfStore {
    tx: watch::Sender<Arc<ConfGeneration>>,
    // Serializes writers; readers never touch it
    write_lock: Mutex<()>,
}

impl ConfStore {
    /// Create a store from an already validated initial document
    pub fn new(conf: Conf) -> Result<Self> {
        conf.validate()?;
        let (tx, _) = watch::channel(Arc::new(ConfGeneration::compile(1, conf)));
        Ok(Self {
            tx,
            write_lock: Mutex::new(()),
        })
    }

    /// The latest generation
    pub fn current(&self) -> Arc<ConfGeneration> {
        self.tx.borrow().clone()
    }

    /// Validate `new`, assign the next version and swap atomically
    ///
    /// Returns the new version. Emits a reload event to every subscriber.
    pub fn replace(&self, new: Conf) -> Result<u64> {
        new.validate()?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let version = self.tx.borrow().version + 1;
        let generation = Arc::new(ConfGeneration::compile(version, new));
        self.tx.send_replace(generation);

        tracing::info!(version = version, "configuration reloaded");
        Ok(version)
    }

    /// Subscribe to reload events; the receiver always yields the latest
    /// generation
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfGeneration>> {
        self.tx.subscribe()
    }
}
