//! Segment and doorbell configuration
//!
//! Processes that share a segment must agree on its key out of band. The
//! defaults below are what the demos use; every field can be overridden from
//! the environment.

use std::env;
use std::path::PathBuf;

use crate::{Error, Result};

/// Default segment key
pub const DEFAULT_KEY: u32 = 0x5348_4B54; // "SHKT"

/// Default usable segment size (1 MiB)
pub const DEFAULT_SEGMENT_SIZE: usize = 1024 * 1024;

/// Default directory holding doorbell FIFOs
pub const DEFAULT_DOORBELL_DIR: &str = "/tmp";

pub const ENV_KEY: &str = "SHMKIT_KEY";
pub const ENV_SIZE: &str = "SHMKIT_SIZE";
pub const ENV_DOORBELL_DIR: &str = "SHMKIT_DOORBELL_DIR";

/// Which segment to create or attach, and how large it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    pub key: u32,
    /// Usable bytes, excluding the segment header
    pub size: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_KEY,
            size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

impl SegmentConfig {
    /// Defaults overridden by `SHMKIT_KEY` and `SHMKIT_SIZE`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(v) = env::var(ENV_KEY) {
            config.key = parse_u32(&v)
                .ok_or_else(|| Error::InvalidArgument(format!("{}={}", ENV_KEY, v)))?;
        }
        if let Ok(v) = env::var(ENV_SIZE) {
            config.size = v
                .trim()
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("{}={}", ENV_SIZE, v)))?;
        }
        Ok(config)
    }
}

/// Where doorbell FIFOs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoorbellConfig {
    pub dir: PathBuf,
}

impl Default for DoorbellConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_DOORBELL_DIR),
        }
    }
}

impl DoorbellConfig {
    /// Defaults overridden by `SHMKIT_DOORBELL_DIR`.
    pub fn from_env() -> Self {
        match env::var_os(ENV_DOORBELL_DIR) {
            Some(dir) => Self { dir: dir.into() },
            None => Self::default(),
        }
    }

    /// Doorbell path for a queue: `<dir>/<queue-name>.db`
    pub fn path_for(&self, queue_name: &str) -> PathBuf {
        self.dir.join(format!("{}.db", queue_name))
    }
}

/// Accepts decimal or `0x`-prefixed hex.
fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_u32("42"), Some(42));
        assert_eq!(parse_u32("0x2A"), Some(42));
        assert_eq!(parse_u32(" 0X2a "), Some(42));
        assert_eq!(parse_u32("nope"), None);
    }

    #[test]
    fn test_doorbell_path() {
        let cfg = DoorbellConfig {
            dir: PathBuf::from("/var/run/shmkit"),
        };
        assert_eq!(
            cfg.path_for("log queue"),
            PathBuf::from("/var/run/shmkit/log queue.db")
        );
    }

    #[test]
    fn test_defaults() {
        let cfg = SegmentConfig::default();
        assert_eq!(cfg.key, DEFAULT_KEY);
        assert_eq!(cfg.size, DEFAULT_SEGMENT_SIZE);
    }
}
