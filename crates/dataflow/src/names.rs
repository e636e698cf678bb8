//! Node naming and addressing.
//!
//! Every node is addressed by a short identifier matching
//! `[A-Za-z_][A-Za-z0-9_]{0,63}`. The OS-level objects derive from it with
//! an `oat_` prefix: the segment is a file named `oat_<node>` under the
//! shared-memory root, and the protocol barriers are named semaphores
//! `/oat_<node>.w` (write barrier) and `/oat_<node>.r<slot>` (one read
//! barrier per source slot).

use crate::errors::NodeError;
use std::env;
use std::path::{Path, PathBuf};

pub const SEGMENT_PREFIX: &str = "oat_";

pub const DEFAULT_SHM_ROOT: &str = "/dev/shm";

/// Default number of admitted sources per node. Overridable up to [`SLOT_CAP`].
pub const DEFAULT_MAX_SOURCES: u32 = 10;

/// Hard cap on slots per node; the attach mask is a single u32.
pub const SLOT_CAP: u32 = 32;

const MAX_NAME_LEN: usize = 64;

/// Validate a node name against `[A-Za-z_][A-Za-z0-9_]{0,63}`.
pub fn validate(name: &str) -> Result<(), NodeError> {
    let mut chars = name.chars();

    let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_head || !valid_tail || name.len() > MAX_NAME_LEN {
        return Err(NodeError::InvalidName(name.to_string()));
    }

    Ok(())
}

pub fn write_sem_name(name: &str) -> String {
    format!("/{SEGMENT_PREFIX}{name}.w")
}

pub fn read_sem_name(name: &str, slot: u32) -> String {
    format!("/{SEGMENT_PREFIX}{name}.r{slot}")
}

/// Per-process node configuration: the shared-memory root and the admitted
/// source count. Both take environment overrides; tests substitute a
/// temporary root so concurrent runs never collide.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub root: PathBuf,
    pub max_sources: u32,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let root = env::var("OAT_SHM_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SHM_ROOT));

        let max_sources = env::var("OAT_MAX_SOURCES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_SOURCES)
            .clamp(1, SLOT_CAP);

        Self { root, max_sources }
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            max_sources: DEFAULT_MAX_SOURCES,
        }
    }

    pub fn max_sources(mut self, max_sources: u32) -> Self {
        self.max_sources = max_sources.clamp(1, SLOT_CAP);
        self
    }

    pub fn segment_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{SEGMENT_PREFIX}{name}"))
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["F", "frames", "_raw", "cam_0", "a".repeat(64).as_str()] {
            assert!(validate(name).is_ok(), "{name:?} should be valid");
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "0cam", "with-dash", "with space", "a".repeat(65).as_str()] {
            assert!(validate(name).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_derived_object_names() {
        let cfg = NodeConfig::with_root("/dev/shm");
        assert_eq!(cfg.segment_path("frames"), PathBuf::from("/dev/shm/oat_frames"));
        assert_eq!(write_sem_name("frames"), "/oat_frames.w");
        assert_eq!(read_sem_name("frames", 7), "/oat_frames.r7");
    }

    #[test]
    fn test_max_sources_is_clamped() {
        let cfg = NodeConfig::with_root("/tmp").max_sources(1000);
        assert_eq!(cfg.max_sources, SLOT_CAP);

        let cfg = NodeConfig::with_root("/tmp").max_sources(0);
        assert_eq!(cfg.max_sources, 1);
    }
}
