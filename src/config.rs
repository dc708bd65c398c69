//! Library configuration.
//!
//! A [`Config`] can be passed explicitly to [`ZipReader`](crate::ZipReader)
//! and [`ZipWriter`](crate::ZipWriter) constructors. A process-wide default
//! exists as a convenience; it is cloned on every read so a concurrent
//! [`configure`] call never tears a handle's view of it.

use std::sync::RwLock;

use crate::error::{ZipError, ZipResult};

/// Smallest permitted chunk size for the streaming driver.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Default chunk size: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Maximum length of archive and entry comments, in bytes.
pub const MAX_COMMENT_LENGTH: usize = 65535;

/// Tuning knobs shared by readers and writers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on the bytes pulled from a source per codec step.
    /// Values below [`MIN_CHUNK_SIZE`] are clamped up.
    pub chunk_size: usize,
    /// Number of codec workers kept for off-thread compression and
    /// crypto. `None` picks the available parallelism (at least 2).
    pub max_workers: Option<usize>,
    /// When false, codec work always runs inline on the calling task.
    pub use_workers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: None,
            use_workers: true,
        }
    }
}

impl Config {
    /// Chunk size with the floor applied.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(MIN_CHUNK_SIZE)
    }

    /// Worker count with the default applied.
    pub fn effective_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        })
    }

    /// Reject option combinations that contradict each other. Called by
    /// handle constructors before the configuration is captured.
    pub fn validate(&self) -> ZipResult<()> {
        if !self.use_workers && self.max_workers.is_some() {
            return Err(ZipError::ConfigConflict(
                "max_workers has no effect when use_workers is disabled",
            ));
        }
        Ok(())
    }
}

static DEFAULT_CONFIG: RwLock<Config> = RwLock::new(Config {
    chunk_size: DEFAULT_CHUNK_SIZE,
    max_workers: None,
    use_workers: true,
});

/// Mutate the process-wide default configuration.
pub fn configure<F: FnOnce(&mut Config)>(f: F) {
    let mut cfg = DEFAULT_CONFIG.write().expect("config lock poisoned");
    f(&mut cfg);
    tracing::debug!(chunk_size = cfg.chunk_size, "default config updated");
}

/// Snapshot of the process-wide default configuration.
pub fn default_config() -> Config {
    DEFAULT_CONFIG.read().expect("config lock poisoned").clone()
}
