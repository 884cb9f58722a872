//! Shared engine state: the single context value threaded through the
//! crawler, watcher, pipeline and scheduler instead of globals.

use crate::cache::UpdateTable;
use crate::classify::Classifier;
use crate::extract::ExtractorRegistry;
use crate::index::IndexSet;
use crate::monitor::{MountTree, PowerMonitor};
use crate::store::MetaStore;
use dashmap::DashMap;
use fossick_core::config::Config;
use fossick_core::language::Language;
use fossick_core::types::{FileInfo, Ontology};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Gates and signalling
// ---------------------------------------------------------------------------

/// Pause/run switches checked by the scheduler between items.
#[derive(Default)]
pub struct Gates {
    pub is_running: AtomicBool,
    pub enable_indexing: AtomicBool,
    pub pause_manual: AtomicBool,
    pub pause_battery: AtomicBool,
    pub pause_io: AtomicBool,
    pub shutdown: AtomicBool,
}

impl Gates {
    pub fn new(config: &Config) -> Self {
        let gates = Self::default();
        gates.is_running.store(true, Ordering::SeqCst);
        gates.enable_indexing.store(config.indexing.enable_indexing, Ordering::SeqCst);
        gates
    }
}

/// Condvar wrapper the event sources use to wake a parked scheduler.
#[derive(Default)]
pub struct Signal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn notify(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.cond.notify_all();
    }

    /// Wait until notified or the timeout passes. Returns true when a
    /// notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            let (guard, _) = self.cond.wait_timeout(pending, timeout).unwrap();
            pending = guard;
        }
        std::mem::take(&mut *pending)
    }
}

// ---------------------------------------------------------------------------
// Queues and grace
// ---------------------------------------------------------------------------

/// Multi-producer single-consumer ticket queue between the event
/// sources and the indexer thread.
pub struct FileQueue {
    tx: Sender<FileInfo>,
    rx: Mutex<Receiver<FileInfo>>,
}

impl Default for FileQueue {
    fn default() -> Self {
        let (tx, rx) = channel();
        Self { tx, rx: Mutex::new(rx) }
    }
}

impl FileQueue {
    pub fn sender(&self) -> Sender<FileInfo> {
        self.tx.clone()
    }

    pub fn push(&self, info: FileInfo) {
        let _ = self.tx.send(info);
    }

    pub fn try_pop(&self) -> Option<FileInfo> {
        self.rx.lock().unwrap().try_recv().ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<FileInfo> {
        match self.rx.lock().unwrap().recv_timeout(timeout) {
            Ok(info) => Some(info),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// How long a path stays in grace after filesystem activity.
pub const IO_GRACE: Duration = Duration::from_secs(2);

/// Per-path I/O grace: written by the watcher threads, polled by the
/// scheduler's grace gate.
#[derive(Default)]
pub struct GraceTable {
    touched: DashMap<PathBuf, Instant>,
}

impl GraceTable {
    pub fn touch(&self, path: &Path) {
        self.touched.insert(path.to_path_buf(), Instant::now());
    }

    /// True while any path saw activity within the grace window.
    /// Expired entries are purged as a side effect.
    pub fn active(&self) -> bool {
        let now = Instant::now();
        self.touched.retain(|_, t| now.duration_since(*t) < IO_GRACE);
        !self.touched.is_empty()
    }

    pub fn clear(&self) {
        self.touched.clear();
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress counters emitted with status signals.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Progress {
    pub state: String,
    pub items_done: u64,
    pub items_total: u64,
    pub current_uri: String,
    pub folders_count: u64,
    pub folders_processed: u64,
    pub errors_in_current_run: u64,
    pub last_error_message: String,
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

pub struct EngineState {
    pub config: RwLock<Config>,
    pub data_dir: PathBuf,
    pub ontology: Arc<Ontology>,
    pub language: Arc<Language>,
    pub classifier: Classifier,
    pub extractors: ExtractorRegistry,
    pub gates: Gates,
    pub signal: Signal,
    pub grace: GraceTable,
    pub queue: FileQueue,
    /// Directories awaiting a (re)scan, fed by directory tickets.
    pub dir_queue: Mutex<VecDeque<PathBuf>>,
    pub indexes: IndexSet,
    pub store: MetaStore,
    pub update_words: Arc<UpdateTable>,
    pub power: PowerMonitor,
    pub mounts: MountTree,
    pub progress: Mutex<Progress>,
}

impl EngineState {
    pub fn new(config: Config, data_dir: &Path) -> Result<Arc<Self>, crate::error::StoreError> {
        let ontology = Arc::new(
            Ontology::build().map_err(crate::error::StoreError::UnknownClass)?,
        );
        let language = Arc::new(Language::new(
            &config.indexing.language,
            config.indexing.enable_stemmer,
        ));
        let classifier = Classifier::from_config(&config);
        let indexes = IndexSet::open(data_dir).map_err(|e| match e {
            crate::error::IndexError::Io(io) => crate::error::StoreError::Io(io),
            other => crate::error::StoreError::Parse(other.to_string()),
        })?;
        let store = MetaStore::open(data_dir, Arc::clone(&ontology))?;
        let gates = Gates::new(&config);

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            data_dir: data_dir.to_path_buf(),
            ontology,
            language,
            classifier,
            extractors: ExtractorRegistry::default(),
            gates,
            signal: Signal::default(),
            grace: GraceTable::default(),
            queue: FileQueue::default(),
            dir_queue: Mutex::new(VecDeque::new()),
            indexes,
            store,
            update_words: Arc::new(UpdateTable::default()),
            power: PowerMonitor::default(),
            mounts: MountTree::default(),
            progress: Mutex::new(Progress::default()),
        }))
    }

    /// Request shutdown and wake anything parked.
    pub fn request_shutdown(&self) {
        self.gates.shutdown.store(true, Ordering::SeqCst);
        self.signal.notify();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.gates.shutdown.load(Ordering::SeqCst)
    }

    /// Push a directory for (re)scanning and wake the scheduler.
    pub fn queue_directory(&self, path: PathBuf) {
        self.dir_queue.lock().unwrap().push_back(path);
        self.signal.notify();
    }

    pub fn pop_directory(&self) -> Option<PathBuf> {
        self.dir_queue.lock().unwrap().pop_front()
    }

    /// Request-thread surface: tag a service. The keyword lands in the
    /// store and its terms re-score the index through the update cache.
    pub fn add_keyword(&self, id: u64, keyword: &str) -> Result<(), crate::error::StoreError> {
        self.store.add_keyword(id, keyword)?;
        self.score_keyword(id, keyword, false)?;
        self.signal.notify();
        Ok(())
    }

    /// Remove a tag; index entries decay via deletion markers.
    pub fn remove_keyword(&self, id: u64, keyword: &str) -> Result<(), crate::error::StoreError> {
        self.store.remove_keyword(id, keyword)?;
        self.score_keyword(id, keyword, true)?;
        self.signal.notify();
        Ok(())
    }

    fn score_keyword(
        &self,
        id: u64,
        keyword: &str,
        removal: bool,
    ) -> Result<(), crate::error::StoreError> {
        let Some((_, service)) = self.store.service_by_id(id)? else {
            return Ok(());
        };
        let weight =
            if removal { 1 } else { self.ontology.property_weight("User:Keywords").max(1) };
        let (max_len, min_len) = {
            let config = self.config.read().unwrap();
            (config.indexing.max_word_length as usize, config.indexing.min_word_length as usize)
        };
        let mut counts = std::collections::HashMap::new();
        fossick_core::parser::text_to_counts(
            &mut counts, keyword, weight, &self.language, 0, max_len, min_len, false, true,
        );
        for (term, score) in counts {
            // A zero score is the deletion marker for the merge
            let score = if removal { 0 } else { score };
            self.update_words.add(&term, service.id as u32, service.class_id, score);
        }
        Ok(())
    }

    /// Write the machine-readable status file next to the indexes.
    pub fn write_status(&self) {
        let progress = self.progress.lock().unwrap().clone();
        if let Ok(json) = serde_json::to_string_pretty(&progress) {
            let _ = std::fs::write(self.data_dir.join("status.json"), json);
        }
    }
}
