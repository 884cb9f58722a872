//! fossick-server: the desktop search and metadata indexing daemon.
//!
//! The indexer thread runs the [`schedule::Scheduler`] over tickets
//! produced by the [`crawl`] and [`watch`] event sources, extracting
//! content through [`pipeline`] into the [`index`] and [`store`]
//! layers. Batched metadata mutations arrive through [`batch`].

pub mod batch;
pub mod cache;
pub mod classify;
pub mod crawl;
pub mod error;
pub mod extract;
pub mod index;
pub mod journal;
pub mod mailstore;
pub mod monitor;
pub mod nfs_lock;
pub mod pipeline;
pub mod schedule;
pub mod state;
pub mod store;
pub mod watch;

use std::path::PathBuf;

/// Per-user cache directory holding indexes and metadata stores.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".cache")))
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("fossick")
}

/// Per-user configuration file location.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("fossick")
        .join("fossick.toml")
}
