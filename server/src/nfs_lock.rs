//! NFS-safe advisory lock for the data directory.
//!
//! Plain O_EXCL creation is not atomic over broken-lock NFS mounts, so
//! the lock is taken by creating the lock file, hard-linking a
//! host-specific name to it, and checking that the link count is
//! exactly 2. Stale locks older than five minutes are removed.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const LOCK_FILE: &str = "fossick.lock";
const STALE_AFTER: Duration = Duration::from_secs(300);
const MAX_ATTEMPTS: u32 = 10_000;

pub struct NfsLock {
    lock_path: PathBuf,
    host_path: PathBuf,
    enabled: bool,
    held: bool,
}

impl NfsLock {
    pub fn new(dir: &Path, enabled: bool) -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        Self {
            lock_path: dir.join(LOCK_FILE),
            host_path: dir.join(format!("{LOCK_FILE}.{user}")),
            enabled,
            held: false,
        }
    }

    fn is_stale(&self) -> bool {
        let Ok(meta) = std::fs::metadata(&self.lock_path) else {
            return false;
        };
        match meta.modified().and_then(|m| {
            SystemTime::now().duration_since(m).map_err(|e| io::Error::other(e))
        }) {
            Ok(age) => age > STALE_AFTER,
            Err(_) => false,
        }
    }

    #[cfg(unix)]
    fn link_count(&self) -> u64 {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(&self.lock_path).map(|m| m.nlink()).unwrap_or(0)
    }

    #[cfg(not(unix))]
    fn link_count(&self) -> u64 {
        // No hard-link check available; exclusive creation has to do
        2
    }

    /// Acquire the lock, retrying with a small jittered backoff.
    pub fn obtain(&mut self) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        for attempt in 0..MAX_ATTEMPTS {
            if self.is_stale() {
                warn!(path = %self.lock_path.display(), "removing stale lock");
                let _ = std::fs::remove_file(&self.lock_path);
            }

            let created = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path);

            if created.is_ok() {
                #[cfg(unix)]
                std::fs::hard_link(&self.lock_path, &self.host_path)?;

                if self.link_count() == 2 {
                    debug!(path = %self.lock_path.display(), "lock obtained");
                    self.held = true;
                    return Ok(());
                }
                // Raced with another host; back off and retry
                let _ = std::fs::remove_file(&self.host_path);
                let _ = std::fs::remove_file(&self.lock_path);
            }

            let jitter = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.subsec_micros() % 90_000)
                .unwrap_or(1_000);
            std::thread::sleep(Duration::from_micros(1_000 + u64::from(jitter + attempt % 128)));
        }

        Err(io::Error::other("could not obtain lock"))
    }

    pub fn release(&mut self) {
        if !self.enabled || !self.held {
            return;
        }
        let _ = std::fs::remove_file(&self.host_path);
        let _ = std::fs::remove_file(&self.lock_path);
        self.held = false;
    }
}

impl Drop for NfsLock {
    fn drop(&mut self) {
        self.release();
    }
}
