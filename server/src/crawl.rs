//! Breadth-first directory crawler.
//!
//! Directories are visited through a FIFO so an entire level is
//! enumerated before descending, which keeps open-handle counts flat
//! and guarantees a directory's ticket precedes its children's. Watch
//! registration shares the walk but stops at the watch budget while
//! crawling continues.

use crate::classify::{Classifier, Decision};
use fossick_core::types::{FileAction, FileInfo, Ontology};
use ignore::WalkBuilder;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Watches held back from the system limit for other consumers.
const WATCH_LIMIT_RESERVE: usize = 500;

/// Effective watch budget: the configured cap bounded by the system
/// limit minus a reserve.
pub fn watch_limit(configured: usize) -> usize {
    let system = std::fs::read_to_string("/proc/sys/fs/inotify/max_user_watches")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .map(|n| n.saturating_sub(WATCH_LIMIT_RESERVE));
    match system {
        Some(limit) => configured.min(limit),
        None => configured,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub directories: usize,
    pub files: usize,
    pub watches_added: usize,
}

/// Enumerate one directory level: child directories and files, sorted
/// by name for deterministic ticket order.
pub(crate) fn enumerate(dir: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let walker = WalkBuilder::new(dir)
        .max_depth(Some(1))
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        if entry.file_type().is_some_and(|ft| ft.is_dir()) {
            dirs.push(entry.into_path());
        } else {
            files.push(entry.into_path());
        }
    }
    (dirs, files)
}

/// Crawl a set of roots breadth-first, emitting `Check` tickets for
/// files and a `DirectoryCheck` per directory once its children have
/// been queued. `add_watch` is called for each watchable directory and
/// returns false once the watch budget is exhausted.
pub fn crawl_roots(
    roots: &[PathBuf],
    classifier: &Classifier,
    ontology: &Ontology,
    running: &AtomicBool,
    add_watch: &mut dyn FnMut(&Path) -> bool,
    emit: &mut dyn FnMut(FileInfo),
) -> CrawlStats {
    let mut stats = CrawlStats::default();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    let mut budget_left = true;

    for root in roots {
        if root.is_dir() && !classifier.is_no_watched(root) {
            queue.push_back(root.clone());
        }
    }

    while let Some(dir) = queue.pop_front() {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let classification = classifier.evaluate(&dir, true, ontology);
        if classification.decision == Decision::Ignore {
            continue;
        }

        if classification.decision == Decision::Watch && budget_left {
            if add_watch(&dir) {
                stats.watches_added += 1;
            } else {
                // Watching stops at the limit but crawling continues
                debug!(path = %dir.display(), "watch budget exhausted");
                budget_left = false;
            }
        }

        let (subdirs, files) = enumerate(&dir);

        for file in files {
            let file_classification = classifier.evaluate(&file, false, ontology);
            if file_classification.decision == Decision::Ignore {
                continue;
            }
            let mut info = FileInfo::new(file, FileAction::Check);
            info.mime = Some(file_classification.mime);
            info.is_hidden = file_classification.is_hidden;
            emit(info);
            stats.files += 1;
        }

        for sub in subdirs {
            if !classifier.is_no_watched(&sub) {
                queue.push_back(sub);
            }
        }

        let mut info = FileInfo::new(dir, FileAction::DirectoryCheck);
        info.is_directory = true;
        info.is_hidden = classification.is_hidden;
        emit(info);
        stats.directories += 1;
    }

    stats
}
