//! Daemon configuration, loaded from `fossick.toml`.
//!
//! Unknown keys are retained across load/save so hand-edited files
//! round-trip. Legacy keys from older releases are translated into
//! their current equivalents on load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct General {
    pub verbosity: u8,
    /// Seconds to sleep before the first indexing pass.
    pub initial_sleep: u32,
    pub low_memory_mode: bool,
    pub nfs_locking: bool,
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Default for General {
    fn default() -> Self {
        Self {
            verbosity: 1,
            initial_sleep: 45,
            low_memory_mode: false,
            nfs_locking: false,
            extra: toml::Table::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Watches {
    pub watch_directory_roots: Vec<PathBuf>,
    pub crawl_directory_roots: Vec<PathBuf>,
    pub no_watch_directory_roots: Vec<PathBuf>,
    pub enable_watching: bool,
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Default for Watches {
    fn default() -> Self {
        Self {
            watch_directory_roots: vec![PathBuf::from("~")],
            crawl_directory_roots: Vec::new(),
            no_watch_directory_roots: Vec::new(),
            enable_watching: true,
            extra: toml::Table::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Indexing {
    /// 0 (no throttling) .. 20 (maximum sleep between items).
    pub throttle: u8,
    pub enable_indexing: bool,
    pub enable_content_indexing: bool,
    pub enable_thumbnails: bool,
    pub disabled_modules: Vec<String>,
    pub no_index_file_types: Vec<String>,
    pub min_word_length: u8,
    pub max_word_length: u16,
    pub language: String,
    pub enable_stemmer: bool,
    pub disable_indexing_on_battery: bool,
    pub disable_indexing_on_battery_init: bool,
    /// Percent free space below which indexing pauses; -1 disables.
    pub low_disk_space_limit: i8,
    pub index_mounted_directories: bool,
    pub index_removable_media: bool,
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Default for Indexing {
    fn default() -> Self {
        Self {
            throttle: 0,
            enable_indexing: true,
            enable_content_indexing: true,
            enable_thumbnails: true,
            disabled_modules: Vec::new(),
            no_index_file_types: Vec::new(),
            min_word_length: 3,
            max_word_length: 30,
            language: "en".to_string(),
            enable_stemmer: true,
            disable_indexing_on_battery: true,
            disable_indexing_on_battery_init: false,
            low_disk_space_limit: 1,
            index_mounted_directories: true,
            index_removable_media: true,
            extra: toml::Table::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Performance {
    pub max_text_to_index: u64,
    pub max_words_to_index: u32,
    pub max_bucket_count: u32,
    pub min_bucket_count: u32,
    /// Distinct-term count below which flushes target the main index.
    pub flush_term_threshold: u32,
    /// Main-index size beyond which flushes spill to a temp index.
    pub index_spill_bytes: u64,
    /// Update postings count forcing a flush into the update index.
    pub update_flush_threshold: u32,
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Default for Performance {
    fn default() -> Self {
        Self {
            max_text_to_index: 1_048_576,
            max_words_to_index: 10_000,
            max_bucket_count: 524_288,
            min_bucket_count: 65_536,
            flush_term_threshold: 5_000,
            index_spill_bytes: 4_000_000,
            update_flush_threshold: 10_000,
            extra: toml::Table::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: General,
    pub watches: Watches,
    pub indexing: Indexing,
    pub performance: Performance,
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Config {
    /// Load from a toml file, clamping out-of-range values and
    /// translating legacy keys. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, toml::de::Error> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(_) => return Ok(Self::default()),
        };
        let mut config: Config = toml::from_str(&text)?;
        config.translate_legacy_keys();
        config.clamp();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, text)
    }

    /// Cache memory budget driving the flush estimator.
    pub fn cache_memory_limit(&self) -> u64 {
        if self.general.low_memory_mode {
            8 * 1024 * 1024
        } else {
            80 * 1024 * 1024
        }
    }

    pub fn module_enabled(&self, module: &str) -> bool {
        !self
            .indexing
            .disabled_modules
            .iter()
            .any(|m| m.eq_ignore_ascii_case(module))
    }

    /// Older releases used per-mailer booleans and a skip-mount-points
    /// flag; map them onto disabled_modules / index_mounted_directories.
    fn translate_legacy_keys(&mut self) {
        let legacy_mailers = [
            ("index_evolution_emails", "evolution"),
            ("index_kmail_emails", "kmail"),
            ("index_thunderbird_emails", "thunderbird"),
            ("index_modest_emails", "modest"),
        ];
        if let Some(toml::Value::Table(emails)) = self.extra.remove("emails") {
            for (key, module) in legacy_mailers {
                if let Some(toml::Value::Boolean(false)) = emails.get(key) {
                    if self.module_enabled(module) {
                        self.indexing.disabled_modules.push(module.to_string());
                    }
                }
            }
        }
        if let Some(toml::Value::Boolean(skip)) = self.indexing.extra.remove("skip_mount_points") {
            self.indexing.index_mounted_directories = !skip;
        }
    }

    fn clamp(&mut self) {
        clamp_field("general.verbosity", &mut self.general.verbosity, 0, 3);
        clamp_field("general.initial_sleep", &mut self.general.initial_sleep, 0, 1000);
        clamp_field("indexing.throttle", &mut self.indexing.throttle, 0, 20);
        clamp_field("indexing.min_word_length", &mut self.indexing.min_word_length, 0, 30);
        clamp_field("indexing.max_word_length", &mut self.indexing.max_word_length, 0, 200);
        clamp_field(
            "indexing.low_disk_space_limit",
            &mut self.indexing.low_disk_space_limit,
            -1,
            100,
        );
        if self.indexing.min_word_length as u16 >= self.indexing.max_word_length {
            warn!("min_word_length >= max_word_length, resetting to defaults");
            self.indexing.min_word_length = 3;
            self.indexing.max_word_length = 30;
        }
    }
}

fn clamp_field<T: PartialOrd + Copy + std::fmt::Display>(name: &str, value: &mut T, min: T, max: T) {
    if *value < min {
        warn!(key = name, "config value {} below minimum {}, clamping", value, min);
        *value = min;
    } else if *value > max {
        warn!(key = name, "config value {} above maximum {}, clamping", value, max);
        *value = max;
    }
}
