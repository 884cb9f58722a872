//! Live filesystem watcher.
//!
//! Subscribes to FS events on every watch root and turns them into
//! pipeline tickets. MovedFrom events sit in a holding queue so the
//! matching MovedTo (same cookie) can coalesce the pair into a single
//! rename; unmatched ones decay into deletes once their grace runs out
//! and a stat confirms the path is gone. Every event also touches the
//! I/O grace table that holds the scheduler back while writes are in
//! flight.

use crate::classify::Decision;
use crate::state::EngineState;
use fossick_core::types::{FileAction, FileInfo};
use notify::event::{AccessKind, AccessMode, CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tick driving the MovedFrom holding queue.
pub const MOVED_TICK: Duration = Duration::from_millis(350);

// ---------------------------------------------------------------------------
// Rename coalescing
// ---------------------------------------------------------------------------

/// Holding queue for MovedFrom events awaiting their MovedTo half.
#[derive(Default)]
pub struct MovedQueue {
    pending: Vec<FileInfo>,
}

/// What became of an expired MovedFrom.
#[derive(Debug, PartialEq, Eq)]
pub enum Expiry {
    Deleted(FileInfo),
    /// The path still exists; recheck instead of deleting.
    Recheck(FileInfo),
}

impl MovedQueue {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Park a MovedFrom with one tick of grace.
    pub fn push(&mut self, mut info: FileInfo) {
        info.action = FileAction::MovedFrom;
        info.counter = 1;
        self.pending.push(info);
    }

    /// Try to pair a MovedTo against a parked MovedFrom by cookie.
    /// On success returns the combined rename ticket.
    pub fn pair(&mut self, cookie: u32, to_uri: &Path) -> Option<FileInfo> {
        if cookie == 0 {
            return None;
        }
        let at = self.pending.iter().position(|p| p.cookie == cookie)?;
        let mut info = self.pending.remove(at);
        info.moved_to_uri = Some(to_uri.to_path_buf());
        Some(info)
    }

    /// Age the queue by one tick; expired entries become deletes, or
    /// rechecks when the path turns out to still exist.
    pub fn tick(&mut self, exists: &dyn Fn(&Path) -> bool) -> Vec<Expiry> {
        let mut expired = Vec::new();
        let mut keep = Vec::new();
        for mut info in self.pending.drain(..) {
            info.counter -= 1;
            if info.counter >= 0 {
                keep.push(info);
                continue;
            }
            if exists(&info.uri) {
                info.action = FileAction::Check;
                expired.push(Expiry::Recheck(info));
            } else {
                info.action = FileAction::Delete;
                expired.push(Expiry::Deleted(info));
            }
        }
        self.pending = keep;
        expired
    }
}

// ---------------------------------------------------------------------------
// Event mapping
// ---------------------------------------------------------------------------

/// Intermediate classification of a notify event.
#[derive(Debug, PartialEq, Eq)]
pub enum MappedEvent {
    Single(PathBuf, FileAction),
    MovedFrom(PathBuf, u32),
    MovedTo(PathBuf, u32),
    /// A complete rename delivered as one event.
    Rename(PathBuf, PathBuf),
    None,
}

/// Map a notify event to pipeline terms.
pub fn map_event(kind: &EventKind, paths: &[PathBuf], cookie: u32) -> MappedEvent {
    let first = match paths.first() {
        Some(p) => p.clone(),
        None => return MappedEvent::None,
    };
    match kind {
        EventKind::Create(CreateKind::Folder) => {
            MappedEvent::Single(first, FileAction::DirectoryCreated)
        }
        EventKind::Create(_) => MappedEvent::Single(first, FileAction::FileCreated),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            MappedEvent::Single(first, FileAction::WritableFileClosed)
        }
        EventKind::Access(_) => MappedEvent::None,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            MappedEvent::MovedFrom(first, cookie)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => MappedEvent::MovedTo(first, cookie),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            MappedEvent::Rename(first, paths[1].clone())
        }
        EventKind::Modify(ModifyKind::Name(_)) => MappedEvent::Single(first, FileAction::Check),
        EventKind::Modify(_) => MappedEvent::Single(first, FileAction::WritableFileClosed),
        EventKind::Remove(RemoveKind::Folder) => {
            MappedEvent::Single(first, FileAction::DirectoryDeleted)
        }
        EventKind::Remove(RemoveKind::File) => MappedEvent::Single(first, FileAction::FileDeleted),
        EventKind::Remove(_) => MappedEvent::Single(first, FileAction::Delete),
        EventKind::Any | EventKind::Other => MappedEvent::None,
    }
}

// ---------------------------------------------------------------------------
// Watcher thread
// ---------------------------------------------------------------------------

/// Keep this handle alive for the duration of the live phase; dropping
/// it stops the watcher.
pub struct LiveWatcher {
    _watcher: RecommendedWatcher,
}

/// Start watching every watch root and spawn the event loop thread.
pub fn start_watcher(state: Arc<EngineState>) -> Option<LiveWatcher> {
    let (tx, rx) = mpsc::channel::<notify::Event>();

    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "could not create file watcher");
            return None;
        }
    };

    for root in state.classifier.watch_roots() {
        if !root.is_dir() {
            continue;
        }
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => info!(root = %root.display(), "watching"),
            Err(e) => warn!(root = %root.display(), error = %e, "could not watch root"),
        }
    }

    let state_clone = Arc::clone(&state);
    std::thread::Builder::new()
        .name("fossick-watch".into())
        .spawn(move || event_loop(rx, state_clone))
        .ok()?;

    Some(LiveWatcher { _watcher: watcher })
}

fn event_loop(rx: mpsc::Receiver<notify::Event>, state: Arc<EngineState>) {
    let mut moved = MovedQueue::default();

    loop {
        if state.is_shutting_down() {
            break;
        }
        match rx.recv_timeout(MOVED_TICK) {
            Ok(event) => {
                let cookie = event.attrs.tracker().unwrap_or(0) as u32;
                handle_event(&state, &mut moved, map_event(&event.kind, &event.paths, cookie));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                drain_expired(&state, &mut moved);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn accepts(state: &EngineState, path: &Path, is_delete: bool) -> bool {
    // Deletions of previously indexed paths must pass even though the
    // path no longer stats; only the no-watch filter applies.
    if state.classifier.is_no_watched(path) {
        return false;
    }
    if is_delete {
        return true;
    }
    let classification = state.classifier.evaluate(path, path.is_dir(), &state.ontology);
    classification.decision != Decision::Ignore
}

fn enqueue(state: &EngineState, info: FileInfo) {
    state.grace.touch(&info.uri);
    debug!(uri = %info.uri.display(), action = ?info.action, "fs event");
    state.queue.push(info);
    state.signal.notify();
}

fn handle_event(state: &EngineState, moved: &mut MovedQueue, mapped: MappedEvent) {
    match mapped {
        MappedEvent::Single(path, action) => {
            if !accepts(state, &path, action.is_delete()) {
                return;
            }
            let mut info = FileInfo::new(path, action);
            info.is_directory = matches!(
                action,
                FileAction::DirectoryCreated | FileAction::DirectoryDeleted
            ) || info.uri.is_dir();
            enqueue(state, info);
        }
        MappedEvent::MovedFrom(path, cookie) => {
            if !accepts(state, &path, true) {
                return;
            }
            state.grace.touch(&path);
            let info = FileInfo::new(path, FileAction::MovedFrom).with_cookie(cookie);
            moved.push(info);
        }
        MappedEvent::MovedTo(path, cookie) => match moved.pair(cookie, &path) {
            Some(info) => {
                if accepts(state, &info.uri, true) {
                    enqueue(state, info);
                }
            }
            None => {
                // No matching MovedFrom: the file arrived from outside
                // the watched tree
                if accepts(state, &path, false) {
                    let action = if path.is_dir() {
                        FileAction::DirectoryCreated
                    } else {
                        FileAction::FileCreated
                    };
                    enqueue(state, FileInfo::new(path, action));
                }
            }
        },
        MappedEvent::Rename(from, to) => {
            if !accepts(state, &from, true) {
                return;
            }
            let mut info = FileInfo::new(from, FileAction::MovedFrom);
            info.is_directory = to.is_dir();
            info.moved_to_uri = Some(to);
            enqueue(state, info);
        }
        MappedEvent::None => {}
    }
}

fn drain_expired(state: &EngineState, moved: &mut MovedQueue) {
    if moved.is_empty() {
        return;
    }
    for expiry in moved.tick(&|p: &Path| p.exists()) {
        match expiry {
            Expiry::Deleted(info) => {
                debug!(uri = %info.uri.display(), "unpaired move decayed to delete");
                enqueue(state, info);
            }
            Expiry::Recheck(info) => enqueue(state, info),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moved_from(path: &str, cookie: u32) -> FileInfo {
        FileInfo::new(path, FileAction::MovedFrom).with_cookie(cookie)
    }

    #[test]
    fn pair_matches_cookie() {
        let mut q = MovedQueue::default();
        q.push(moved_from("/w/a.txt", 7));
        q.push(moved_from("/w/b.txt", 9));

        let paired = q.pair(7, Path::new("/w/x/a.txt")).unwrap();
        assert_eq!(paired.uri, PathBuf::from("/w/a.txt"));
        assert_eq!(paired.moved_to_uri.as_deref(), Some(Path::new("/w/x/a.txt")));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn zero_cookie_never_pairs() {
        let mut q = MovedQueue::default();
        q.push(moved_from("/w/a.txt", 0));
        assert!(q.pair(0, Path::new("/w/b.txt")).is_none());
    }

    #[test]
    fn unpaired_move_decays_to_delete_after_grace() {
        let mut q = MovedQueue::default();
        q.push(moved_from("/w/a.txt", 7));

        // First tick: counter 1 -> 0, still parked
        assert!(q.tick(&|_| false).is_empty());
        assert_eq!(q.len(), 1);

        // Second tick: expired
        let expired = q.tick(&|_| false);
        assert_eq!(expired.len(), 1);
        match &expired[0] {
            Expiry::Deleted(info) => assert_eq!(info.action, FileAction::Delete),
            other => panic!("expected delete, got {other:?}"),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn surviving_path_is_rechecked_not_deleted() {
        let mut q = MovedQueue::default();
        q.push(moved_from("/w/a.txt", 7));
        q.tick(&|_| true);
        let expired = q.tick(&|_| true);
        match &expired[0] {
            Expiry::Recheck(info) => assert_eq!(info.action, FileAction::Check),
            other => panic!("expected recheck, got {other:?}"),
        }
    }

    #[test]
    fn event_kinds_map_to_actions() {
        let p = vec![PathBuf::from("/w/a.txt")];
        assert_eq!(
            map_event(&EventKind::Create(CreateKind::File), &p, 0),
            MappedEvent::Single(p[0].clone(), FileAction::FileCreated)
        );
        assert_eq!(
            map_event(&EventKind::Create(CreateKind::Folder), &p, 0),
            MappedEvent::Single(p[0].clone(), FileAction::DirectoryCreated)
        );
        assert_eq!(
            map_event(&EventKind::Access(AccessKind::Close(AccessMode::Write)), &p, 0),
            MappedEvent::Single(p[0].clone(), FileAction::WritableFileClosed)
        );
        assert_eq!(
            map_event(&EventKind::Remove(RemoveKind::File), &p, 0),
            MappedEvent::Single(p[0].clone(), FileAction::FileDeleted)
        );
        assert_eq!(
            map_event(&EventKind::Modify(ModifyKind::Name(RenameMode::From)), &p, 3),
            MappedEvent::MovedFrom(p[0].clone(), 3)
        );
        assert_eq!(
            map_event(&EventKind::Modify(ModifyKind::Name(RenameMode::To)), &p, 3),
            MappedEvent::MovedTo(p[0].clone(), 3)
        );
    }

    #[test]
    fn both_rename_maps_directly() {
        let paths = vec![PathBuf::from("/w/a.txt"), PathBuf::from("/w/b.txt")];
        assert_eq!(
            map_event(&EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &paths, 0),
            MappedEvent::Rename(paths[0].clone(), paths[1].clone())
        );
    }
}
