use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::sync::copier::{CHUNK_SIZE, LARGE_FILE_THRESHOLD};
use crate::sync::manager::SessionOptions;
use crate::sync::{default_workers, CopyOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Workers per session (0 = cpu count clamped to 2..=8)
    pub workers: usize,

    /// Files at or above this many bytes are copied in chunks
    pub large_file_threshold: u64,

    /// Chunk size for large-file copies
    pub chunk_size: usize,

    /// Log lines kept per session
    pub log_entries: usize,

    /// Default destination root for the batch mode
    pub default_dest: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8888,
            workers: 0,
            large_file_threshold: LARGE_FILE_THRESHOLD,
            chunk_size: CHUNK_SIZE,
            log_entries: 1000,
            default_dest: None,
        }
    }
}

impl Config {
    /// Load config from `.env` (if present) and the environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Config::default();

        if let Ok(port) = std::env::var("SYNC_PORT") {
            config.port = port.parse().context("SYNC_PORT")?;
        }

        if let Ok(workers) = std::env::var("SYNC_WORKERS") {
            config.workers = workers.parse().context("SYNC_WORKERS")?;
        }

        if let Ok(threshold) = std::env::var("SYNC_LARGE_FILE_THRESHOLD") {
            config.large_file_threshold = threshold.parse().context("SYNC_LARGE_FILE_THRESHOLD")?;
        }

        if let Ok(chunk) = std::env::var("SYNC_CHUNK_SIZE") {
            config.chunk_size = chunk.parse().context("SYNC_CHUNK_SIZE")?;
            anyhow::ensure!(config.chunk_size > 0, "SYNC_CHUNK_SIZE must be positive");
        }

        if let Ok(entries) = std::env::var("SYNC_LOG_ENTRIES") {
            config.log_entries = entries.parse().context("SYNC_LOG_ENTRIES")?;
        }

        if let Ok(dest) = std::env::var("SYNC_DEST") {
            config.default_dest = Some(PathBuf::from(dest));
        }

        Ok(config)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            copy: CopyOptions {
                large_file_threshold: self.large_file_threshold,
                chunk_size: self.chunk_size,
            },
            default_workers: if self.workers == 0 { default_workers() } else { self.workers },
            log_entries: self.log_entries,
        }
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_constants() {
        let config = Config::default();
        assert_eq!(config.workers, 0);
        let options = config.session_options();
        assert_eq!(options.copy.large_file_threshold, 10 * 1024 * 1024);
        assert_eq!(options.copy.chunk_size, 1024 * 1024);
        assert!((2..=8).contains(&options.default_workers));
    }

    #[test]
    fn test_explicit_workers_are_kept() {
        let config = Config { workers: 3, ..Config::default() };
        assert_eq!(config.session_options().default_workers, 3);
    }
}
