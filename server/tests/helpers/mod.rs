//! Shared fixture for integration tests: a watched root, a private
//! data directory, and an engine state wired to both.

use fossick_core::config::Config;
use fossick_server::schedule::{RunExit, Scheduler};
use fossick_server::state::EngineState;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestHarness {
    pub root: TempDir,
    pub data: TempDir,
    pub state: Arc<EngineState>,
}

impl TestHarness {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();

        let mut config = Config::default();
        config.watches.watch_directory_roots = vec![root.path().to_path_buf()];
        config.general.initial_sleep = 0;
        // Keep the pass to the fixture root: no host application or
        // mailer directories
        config.indexing.disabled_modules = [
            "applications",
            "conversations",
            "webhistory",
            "evolution",
            "kmail",
            "thunderbird",
            "modest",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let state = EngineState::new(config, data.path()).unwrap();
        Self { root, data, state }
    }

    /// Create a file under the watched root.
    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Run one complete indexing pass to idle.
    pub fn run_pass(&self) -> RunExit {
        Scheduler::new(Arc::clone(&self.state)).exit_when_idle().run()
    }

    pub fn service_for(&self, path: &std::path::Path) -> Option<fossick_core::types::Service> {
        self.state.store.lookup_service(&path.to_string_lossy()).unwrap()
    }
}
