//! Scheduler: the cooperative state machine driving the indexer thread.
//!
//! Phases run in a fixed order on first run — Config, Applications,
//! Files, CrawlFiles, Conversations, WebHistory, External, Emails,
//! Finished — after which the thread parks and lives off filesystem
//! events. Between any two items the gates are checked: pause flags,
//! battery, I/O grace, shutdown. Parking always ends the store
//! transaction first so readers are never starved, and a wake-up
//! re-opens it before the next item.

use crate::cache::WordCache;
use crate::crawl::{self, watch_limit};
use crate::error::ErrorClass;
use crate::index::IndexKind;
use crate::pipeline::{Outcome, Pipeline};
use crate::state::EngineState;
use fossick_core::types::FileInfo;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Commit-and-reopen the store transaction this often.
const REGULATE_EVERY: u64 = 250;
/// Additionally close and reopen the handles this often.
const REFRESH_EVERY: u64 = 1_000;
/// Default cap on filesystem watches before the system limit applies.
const DEFAULT_WATCH_CAP: usize = 65_536;
/// Pending tickets pulled from the persistent queue per round.
const PENDING_BATCH: usize = 100;

/// Indexing phases, in first-run order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexPhase {
    Config,
    Applications,
    Files,
    CrawlFiles,
    Conversations,
    WebHistory,
    External,
    Emails,
    Finished,
}

impl IndexPhase {
    fn next(&self) -> IndexPhase {
        match self {
            IndexPhase::Config => IndexPhase::Applications,
            IndexPhase::Applications => IndexPhase::Files,
            IndexPhase::Files => IndexPhase::CrawlFiles,
            IndexPhase::CrawlFiles => IndexPhase::Conversations,
            IndexPhase::Conversations => IndexPhase::WebHistory,
            IndexPhase::WebHistory => IndexPhase::External,
            IndexPhase::External => IndexPhase::Emails,
            IndexPhase::Emails => IndexPhase::Finished,
            IndexPhase::Finished => IndexPhase::Finished,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            IndexPhase::Config => "Config",
            IndexPhase::Applications => "Applications",
            IndexPhase::Files => "Files",
            IndexPhase::CrawlFiles => "CrawlFiles",
            IndexPhase::Conversations => "Conversations",
            IndexPhase::WebHistory => "WebHistory",
            IndexPhase::External => "External",
            IndexPhase::Emails => "Emails",
            IndexPhase::Finished => "Finished",
        }
    }
}

/// Why the scheduler returned.
#[derive(Debug, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
    /// One-shot mode finished its pass.
    Idle,
    StorageError(String),
}

pub struct Scheduler {
    state: Arc<EngineState>,
    cache: WordCache,
    phase: IndexPhase,
    first_time_index: bool,
    items: u64,
    watches_used: usize,
    watch_budget: usize,
    started: Instant,
    /// Return instead of parking once everything drains (for one-shot
    /// runs and tests).
    exit_when_idle: bool,
    /// The post-pass work already ran for the current drain.
    pass_finished: bool,
}

impl Scheduler {
    pub fn new(state: Arc<EngineState>) -> Self {
        let cache = WordCache::with_update_table(Arc::clone(&state.update_words));
        let first_time_index = match state.store.has_option("InitialIndex") {
            Ok(false) => {
                let _ = state.store.set_option_int("InitialIndex", 1);
                true
            }
            _ => state.store.get_option_int("InitialIndex").unwrap_or(0) == 1,
        };
        Self {
            state,
            cache,
            phase: IndexPhase::Config,
            first_time_index,
            items: 0,
            watches_used: 0,
            watch_budget: watch_limit(DEFAULT_WATCH_CAP),
            started: Instant::now(),
            exit_when_idle: false,
            pass_finished: false,
        }
    }

    pub fn exit_when_idle(mut self) -> Self {
        self.exit_when_idle = true;
        self
    }

    /// Thread entry point: drive phases and the ticket queue until
    /// shutdown (or idle in one-shot mode).
    pub fn run(&mut self) -> RunExit {
        info!("starting indexing");
        self.started = Instant::now();

        if let Err(e) = self.state.store.start_index_transaction() {
            return RunExit::StorageError(e.to_string());
        }

        let exit = loop {
            if !self.check_gates() {
                break RunExit::Shutdown;
            }

            // Directories queued for (re)scan come first so their
            // children enter the queue in BFS order
            if let Some(dir) = self.state.pop_directory() {
                let pipeline = Pipeline::new(&self.state, &mut self.cache);
                pipeline.scan_queued_directory(&dir);
                continue;
            }

            if let Some(ticket) = self.state.queue.try_pop() {
                match self.process_ticket(ticket) {
                    Ok(()) => continue,
                    Err(exit) => break exit,
                }
            }

            // Nothing queued: replay persisted pending work
            match self.state.store.take_pending_batch(PENDING_BATCH) {
                Ok(batch) if !batch.is_empty() => {
                    for ticket in batch {
                        self.state.queue.push(ticket);
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "pending queue unavailable");
                }
            }

            if self.phase != IndexPhase::Finished {
                if let Err(exit) = self.advance_phase() {
                    break exit;
                }
                continue;
            }

            if !self.pass_finished {
                if let Err(exit) = self.finish_pass() {
                    break exit;
                }
                self.pass_finished = true;
            }
            if self.exit_when_idle {
                break RunExit::Idle;
            }

            // Idle: wait for filesystem events or shutdown
            self.set_progress_state("Idle");
            self.state.signal.wait_timeout(Duration::from_secs(1));
        };

        let _ = self.state.store.end_index_transaction();
        let _ = self.cache.flush_all(&self.state.indexes, &self.performance());
        info!(elapsed_s = self.started.elapsed().as_secs(), "indexer stopped");
        exit
    }

    fn performance(&self) -> fossick_core::config::Performance {
        self.state.config.read().unwrap().performance.clone()
    }

    // -- gates --------------------------------------------------------------

    /// Check every gate; park (ending the transaction) while any holds.
    /// Returns false once shutdown is observed.
    fn check_gates(&mut self) -> bool {
        loop {
            if self.state.is_shutting_down() {
                return false;
            }

            let gates = &self.state.gates;
            let stopped = !gates.is_running.load(Ordering::SeqCst)
                || !gates.enable_indexing.load(Ordering::SeqCst);
            let paused = stopped
                || gates.pause_manual.load(Ordering::SeqCst)
                || gates.pause_battery.load(Ordering::SeqCst)
                || {
                    let config = self.state.config.read().unwrap();
                    self.state.power.should_pause(&config)
                }
                || gates.pause_io.load(Ordering::SeqCst);

            if paused {
                let _ = self.state.store.end_index_transaction();
                if stopped {
                    let _ = self.cache.flush_all(&self.state.indexes, &self.performance());
                }
                self.set_progress_state("Paused");
                // A gate can never hold shutdown past one tick
                self.state.signal.wait_timeout(Duration::from_secs(1));
                continue;
            }

            if self.state.grace.active() {
                debug!("pausing while client requests or external disk I/O take place");
                let _ = self.state.store.end_index_transaction();
                self.set_progress_state("IoWait");
                self.state.signal.wait_timeout(Duration::from_secs(1));
                continue;
            }

            let limit = self.state.config.read().unwrap().cache_memory_limit();
            if self.cache.needs_flush(limit) {
                let _ = self.state.store.end_index_transaction();
                if let Err(e) = self.cache.flush_all(&self.state.indexes, &self.performance()) {
                    if e.class() == ErrorClass::StorageFull {
                        warn!("disk full while flushing, parking until space frees");
                        self.state.signal.wait_timeout(Duration::from_secs(1));
                        continue;
                    }
                    error!(error = %e, "cache flush failed");
                }
            }

            if !self.state.store.in_transaction() {
                if self.state.store.start_index_transaction().is_err() {
                    return false;
                }
            }
            return true;
        }
    }

    // -- ticket processing --------------------------------------------------

    fn process_ticket(&mut self, ticket: FileInfo) -> Result<(), RunExit> {
        self.items += 1;
        self.pass_finished = false;
        let uri = ticket.uri.to_string_lossy().to_string();

        let outcome = {
            let mut pipeline = Pipeline::new(&self.state, &mut self.cache);
            pipeline.process(ticket)
        };

        match outcome {
            Outcome::Indexed | Outcome::Done | Outcome::Rescheduled => {}
            Outcome::Dropped => {
                let mut progress = self.state.progress.lock().unwrap();
                progress.errors_in_current_run += 1;
            }
            Outcome::Fatal(ErrorClass::StorageFull, message) => {
                warn!(error = %message, "storage full, parking the scheduler");
                let _ = self.state.store.end_index_transaction();
                self.state.signal.wait_timeout(Duration::from_secs(1));
            }
            Outcome::Fatal(_, message) => {
                error!(error = %message, "storage corrupt, stopping the indexer");
                return Err(RunExit::StorageError(message));
            }
        }

        {
            let mut progress = self.state.progress.lock().unwrap();
            progress.items_done += 1;
            progress.current_uri = uri;
        }

        if self.items % REGULATE_EVERY == 0 {
            if let Err(e) = self.state.store.regulate_transaction() {
                warn!(error = %e, "transaction regulator failed");
            }
            self.emit_progress();
        }
        if self.items % REFRESH_EVERY == 0 {
            if let Err(e) = self.state.store.refresh_handles() {
                warn!(error = %e, "handle refresh failed");
            }
            let _ = self.state.store.start_index_transaction();
        }
        Ok(())
    }

    // -- phases -------------------------------------------------------------

    fn advance_phase(&mut self) -> Result<(), RunExit> {
        match self.phase {
            IndexPhase::Config => {
                info!("starting config indexing");
            }
            IndexPhase::Applications => self.phase_applications(),
            IndexPhase::Files => self.phase_files()?,
            IndexPhase::CrawlFiles => self.phase_crawl_files(),
            IndexPhase::Conversations => self.phase_conversations(),
            IndexPhase::WebHistory => self.phase_webhistory(),
            IndexPhase::External => {}
            IndexPhase::Emails => self.phase_emails()?,
            IndexPhase::Finished => {}
        }
        self.phase = self.phase.next();
        self.set_progress_state(self.phase.label());
        self.emit_progress();
        Ok(())
    }

    fn crawl_into_queue(&mut self, roots: &[PathBuf], watch: bool) {
        let budget = self.watch_budget;
        let mut used = self.watches_used;
        let stats = crawl::crawl_roots(
            roots,
            &self.state.classifier,
            &self.state.ontology,
            &self.state.gates.is_running,
            &mut |_dir| {
                if !watch || used >= budget {
                    return false;
                }
                used += 1;
                true
            },
            &mut |ticket| self.state.queue.push(ticket),
        );
        self.watches_used = used;
        {
            let mut progress = self.state.progress.lock().unwrap();
            progress.items_total += (stats.files + stats.directories) as u64;
            progress.folders_count += stats.directories as u64;
        }
        info!(
            files = stats.files,
            directories = stats.directories,
            watches = stats.watches_added,
            "crawl queued"
        );
    }

    fn phase_applications(&mut self) {
        if !self.state.config.read().unwrap().module_enabled("applications") {
            return;
        }
        info!("starting application indexing");
        let home = std::env::var("HOME").unwrap_or_default();
        let roots: Vec<PathBuf> = [
            PathBuf::from("/usr/share/applications"),
            PathBuf::from(format!("{home}/.local/share/applications")),
        ]
        .into_iter()
        .filter(|p| p.is_dir())
        .collect();
        for root in &roots {
            self.state.classifier.add_service_dir("Applications", root);
        }
        self.crawl_into_queue(&roots, false);
    }

    fn phase_files(&mut self) -> Result<(), RunExit> {
        info!("starting file indexing");

        // Give the session a quiet start before the heavy churn
        let initial_sleep = self.state.config.read().unwrap().general.initial_sleep;
        if self.first_time_index && initial_sleep > 0 {
            info!(seconds = initial_sleep, "sleeping before initial index");
            for _ in 0..initial_sleep {
                if self.state.is_shutting_down() {
                    return Ok(());
                }
                self.state.signal.wait_timeout(Duration::from_secs(1));
            }
        }

        // Anything previously indexed under a no-watch root gets
        // tombstoned before the crawl
        let no_watch: Vec<PathBuf> = {
            let config = self.state.config.read().unwrap();
            config.watches.no_watch_directory_roots.clone()
        };
        for root in no_watch {
            if let Ok(Some(service)) =
                self.state.store.lookup_service(&root.to_string_lossy())
            {
                info!(root = %root.display(), "deleting entities under no-watch root");
                let _ = self.state.store.delete_service(service.id);
            }
        }

        let watching = self.state.config.read().unwrap().watches.enable_watching;
        let roots = self.state.classifier.watch_roots().to_vec();
        self.crawl_into_queue(&roots, watching);
        Ok(())
    }

    fn phase_crawl_files(&mut self) {
        let roots = self.state.classifier.crawl_roots().to_vec();
        if roots.is_empty() {
            return;
        }
        info!("starting directory crawling");
        self.crawl_into_queue(&roots, false);
    }

    fn phase_conversations(&mut self) {
        if !self.state.config.read().unwrap().module_enabled("conversations") {
            return;
        }
        let home = std::env::var("HOME").unwrap_or_default();
        let candidates = [
            PathBuf::from(format!("{home}/.gaim/logs")),
            PathBuf::from(format!("{home}/.purple/logs")),
        ];
        let roots: Vec<PathBuf> = candidates.into_iter().filter(|p| p.is_dir()).collect();
        if roots.is_empty() {
            return;
        }
        info!("starting chat log indexing");
        for root in &roots {
            self.state.classifier.add_service_dir("GaimConversations", root);
        }
        self.crawl_into_queue(&roots, true);
    }

    fn phase_webhistory(&mut self) {
        if !self.state.config.read().unwrap().module_enabled("webhistory") {
            return;
        }
        let home = std::env::var("HOME").unwrap_or_default();
        let root = PathBuf::from(format!("{home}/.xesam/Firefox/ToIndex"));
        if !root.is_dir() {
            return;
        }
        info!("starting web history indexing");
        self.state.classifier.add_service_dir("WebHistory", &root);
        self.crawl_into_queue(&[root], true);
    }

    /// The Files → Emails seam: flush, merge the file indexes, apply
    /// the update journal, then queue the mail stores.
    fn phase_emails(&mut self) -> Result<(), RunExit> {
        self.seam_flush_and_merge(IndexKind::Files)?;

        let config = self.state.config.read().unwrap().clone();
        let home = std::env::var("HOME").unwrap_or_default();
        let modules = [
            ("evolution", "EvolutionEmails", format!("{home}/.evolution/mail")),
            ("kmail", "KMailEmails", format!("{home}/.kde/share/apps/kmail/mail")),
            ("thunderbird", "ThunderbirdEmails", format!("{home}/.thunderbird")),
            ("modest", "ModestEmails", format!("{home}/.modest/cache/mail")),
        ];

        let mut roots = Vec::new();
        for (module, class, dir) in modules {
            if !config.module_enabled(module) {
                continue;
            }
            let dir = PathBuf::from(dir);
            if !dir.is_dir() {
                continue;
            }
            self.state.classifier.add_service_dir(class, &dir);
            // Unfinished initial runs recheck every message
            if self.first_time_index {
                let _ = self
                    .state
                    .store
                    .reset_mtime_under(fossick_core::types::StoreKind::Emails, &dir.to_string_lossy());
            }
            roots.push(dir);
        }
        if !roots.is_empty() {
            info!("starting email indexing");
            self.crawl_into_queue(&roots, true);
        }
        Ok(())
    }

    fn seam_flush_and_merge(&mut self, kind: IndexKind) -> Result<(), RunExit> {
        if let Err(e) = self.state.store.end_index_transaction() {
            return Err(RunExit::StorageError(e.to_string()));
        }
        if let Err(e) = self.cache.flush_all(&self.state.indexes, &self.performance()) {
            warn!(error = %e, "flush failed at phase seam");
        }
        if let Err(e) = self.state.indexes.merge(kind) {
            warn!(error = %e, "index merge failed");
        }
        if kind == IndexKind::Files {
            match self.state.indexes.apply_changes() {
                Ok(applied) if applied > 0 => {
                    let seq = self.state.store.get_option_int("UpdateAppliedSeq").unwrap_or(0);
                    let _ = self.state.store.set_option_int("UpdateAppliedSeq", seq + 1);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "update journal application failed"),
            }
        }
        self.state
            .store
            .start_index_transaction()
            .map_err(|e| RunExit::StorageError(e.to_string()))?;
        Ok(())
    }

    /// Everything drained after the Emails phase: final flush, merges,
    /// and the one-time post-index bookkeeping.
    fn finish_pass(&mut self) -> Result<(), RunExit> {
        if let Err(e) = self.state.store.end_index_transaction() {
            return Err(RunExit::StorageError(e.to_string()));
        }
        if let Err(e) = self.cache.flush_all(&self.state.indexes, &self.performance()) {
            warn!(error = %e, "final flush failed");
        }
        if let Err(e) = self.state.store.refresh_handles() {
            warn!(error = %e, "handle refresh failed");
        }
        let _ = self.state.indexes.merge(IndexKind::Files);
        let _ = self.state.indexes.merge(IndexKind::Emails);

        if self.state.is_shutting_down() {
            return Ok(());
        }

        if self.first_time_index {
            self.first_time_index = false;
            if let Err(e) = self.state.store.set_option_int("InitialIndex", 0) {
                warn!(error = %e, "could not record initial index completion");
            }
            if let Err(e) = self.state.store.analyze() {
                warn!(error = %e, "analyze failed");
            }
            let progress = self.state.progress.lock().unwrap().clone();
            info!(
                duration_s = self.started.elapsed().as_secs(),
                total_errors = progress.errors_in_current_run,
                "initial indexing finished"
            );
        }

        self.state
            .store
            .start_index_transaction()
            .map_err(|e| RunExit::StorageError(e.to_string()))?;
        Ok(())
    }

    // -- progress -----------------------------------------------------------

    fn set_progress_state(&self, label: &str) {
        let mut progress = self.state.progress.lock().unwrap();
        if progress.state != label {
            progress.state = label.to_string();
        }
    }

    fn emit_progress(&self) {
        let progress = self.state.progress.lock().unwrap().clone();
        info!(
            state = progress.state.as_str(),
            done = progress.items_done,
            total = progress.items_total,
            uri = progress.current_uri.as_str(),
            errors = progress.errors_in_current_run,
            "progress"
        );
        drop(progress);
        self.state.write_status();
    }
}
