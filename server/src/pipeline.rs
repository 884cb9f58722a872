//! Extraction pipeline: one `FileInfo` ticket in, postings and store
//! mutations out.
//!
//! A ticket passes three stages on the indexer thread: prechecks fill
//! in database state and refine ambiguous actions, the action handler
//! applies renames/deletes and queues directory rescans, and entities
//! that still need content work get classified, extracted, tokenized
//! and written to the word caches and the metadata store. Recoverable
//! errors never escape the ticket: they decrement its counter and park
//! it in the persistent pending queue.

use crate::cache::WordCache;
use crate::classify::mime_for_path;
use crate::error::ErrorClass;
use crate::mailstore;
use crate::state::EngineState;
use fossick_core::parser::text_to_counts;
use fossick_core::types::{FileAction, FileInfo};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of processing one ticket.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Content was (re)indexed.
    Indexed,
    /// Handled without touching the index (renames, fresh checks, …).
    Done,
    /// Parked in the pending queue for another attempt.
    Rescheduled,
    /// Given up on.
    Dropped,
    /// The scheduler must park or stop (storage full / corrupt).
    Fatal(ErrorClass, String),
}

pub struct Pipeline<'a> {
    state: &'a EngineState,
    cache: &'a mut WordCache,
}

impl<'a> Pipeline<'a> {
    pub fn new(state: &'a EngineState, cache: &'a mut WordCache) -> Self {
        Self { state, cache }
    }

    /// Run a ticket through prechecks, action handling and indexing.
    pub fn process(&mut self, info: FileInfo) -> Outcome {
        let Some(mut info) = self.precheck(info) else {
            return Outcome::Done;
        };

        let need_index = match self.apply_action(&mut info) {
            Ok(need) => need,
            Err(e) => return self.absorb(info, e),
        };
        if !need_index {
            return Outcome::Done;
        }

        self.throttle(&info);
        match self.index_entity(&info) {
            Ok(()) => Outcome::Indexed,
            Err(e) => self.absorb(info, e),
        }
    }

    /// Route an error: transient ones reschedule the ticket, permanent
    /// ones drop it, storage trouble escalates to the scheduler.
    fn absorb(&self, mut info: FileInfo, error: PipelineError) -> Outcome {
        let class = error.class();
        match class {
            ErrorClass::IoTransient => {
                info.counter -= 1;
                if info.counter < 0 {
                    warn!(uri = %info.uri.display(), error = %error.message, "giving up on ticket");
                    return Outcome::Dropped;
                }
                debug!(uri = %info.uri.display(), retries = info.counter, "rescheduling ticket");
                if self.state.store.mark_pending(&info).is_err() {
                    return Outcome::Dropped;
                }
                Outcome::Rescheduled
            }
            ErrorClass::IoPermanent => {
                // The path is gone for good; drop the stale row if any
                if info.file_id != 0 {
                    let _ = self.state.store.delete_service(info.file_id);
                }
                Outcome::Dropped
            }
            ErrorClass::Parse => {
                warn!(uri = %info.uri.display(), error = %error.message, "skipping unparseable item");
                Outcome::Dropped
            }
            ErrorClass::Cancelled => Outcome::Dropped,
            ErrorClass::StorageFull => {
                // Keep the ticket; it replays once space frees up
                let _ = self.state.store.mark_pending(&info);
                Outcome::Fatal(class, error.message)
            }
            ErrorClass::StorageCorrupt => Outcome::Fatal(class, error.message),
        }
    }

    fn throttle(&self, info: &FileInfo) {
        if info.is_directory {
            return;
        }
        let throttle = self.state.config.read().unwrap().indexing.throttle;
        if throttle > 0 {
            std::thread::sleep(Duration::from_millis(u64::from(throttle) * 5));
        }
    }

    // -- prechecks ----------------------------------------------------------

    /// Fill database state, refine ambiguous actions, and handle
    /// deletions inline. `None` means the ticket is finished.
    fn precheck(&self, mut info: FileInfo) -> Option<FileInfo> {
        let creates = matches!(
            info.action,
            FileAction::Create | FileAction::FileCreated | FileAction::DirectoryCreated
        );
        if info.file_id == 0 && !creates {
            if let Ok(Some(service)) = self.state.store.lookup_service(&info.uri.to_string_lossy())
            {
                info.file_id = service.id;
                info.indextime = service.indextime;
                info.is_directory = service.is_directory;
                info.is_new = false;
            } else {
                info.is_new = true;
            }
        } else {
            info.is_new = info.file_id == 0;
        }

        self.verify_action(&mut info);

        if matches!(info.action, FileAction::FileDeleted | FileAction::DirectoryDeleted) {
            self.delete_entity(&info);
            return None;
        }

        // Everything else needs a live path (or a live rename target)
        match std::fs::symlink_metadata(&info.uri) {
            Ok(meta) => {
                info.is_directory = meta.is_dir();
                info.mtime = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
            }
            Err(_) => {
                let target_ok = info
                    .moved_to_uri
                    .as_ref()
                    .map(|p| p.exists())
                    .unwrap_or(false);
                if !target_ok {
                    return None;
                }
            }
        }
        info.is_hidden = info
            .uri
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false);

        Some(info)
    }

    /// Turn ambiguous actions into their file/directory variants.
    fn verify_action(&self, info: &mut FileInfo) {
        match info.action {
            FileAction::Check => {
                if info.is_directory || info.uri.is_dir() {
                    info.action = FileAction::DirectoryCheck;
                } else {
                    info.action = FileAction::FileCheck;
                }
            }
            FileAction::Delete => {
                // Unknown deletions are treated as directories, the
                // worse case
                if info.file_id == 0 {
                    info.is_directory = true;
                }
                info.action = if info.is_directory {
                    FileAction::DirectoryDeleted
                } else {
                    FileAction::FileDeleted
                };
            }
            FileAction::MovedFrom => {
                info.action = if info.is_directory {
                    FileAction::DirectoryMovedFrom
                } else {
                    FileAction::FileMovedFrom
                };
            }
            FileAction::MovedTo => {
                info.action = if info.is_directory {
                    FileAction::DirectoryMovedTo
                } else {
                    FileAction::FileMovedTo
                };
            }
            FileAction::Create => {
                info.action = if info.is_directory || info.uri.is_dir() {
                    FileAction::DirectoryCreated
                } else {
                    FileAction::FileCreated
                };
            }
            _ => {}
        }
    }

    fn delete_entity(&self, info: &FileInfo) {
        if info.file_id == 0 {
            return;
        }
        match self.state.store.delete_service(info.file_id) {
            Ok(ids) => info!(uri = %info.uri.display(), rows = ids.len(), "deleted"),
            Err(e) => warn!(uri = %info.uri.display(), error = %e, "delete failed"),
        }
    }

    // -- actions ------------------------------------------------------------

    /// Apply the action's side effects; returns whether the entity
    /// still needs content indexing.
    fn apply_action(&mut self, info: &mut FileInfo) -> Result<bool, PipelineError> {
        let mut need_index = info.mtime > info.indextime;

        match info.action {
            FileAction::FileCheck => {}
            FileAction::FileChanged | FileAction::FileCreated | FileAction::WritableFileClosed => {
                need_index = true;
            }
            FileAction::FileMovedFrom => {
                need_index = false;
                if let Some(to) = info.moved_to_uri.clone() {
                    info!(from = %info.uri.display(), to = %to.display(), "moving file");
                    self.state
                        .store
                        .move_service(&info.uri.to_string_lossy(), &to.to_string_lossy())
                        .map_err(PipelineError::store)?;
                }
            }
            FileAction::DirectoryMovedFrom => {
                need_index = false;
                if let Some(to) = info.moved_to_uri.clone() {
                    info!(from = %info.uri.display(), to = %to.display(), "moving directory");
                    self.state
                        .store
                        .move_directory(&info.uri.to_string_lossy(), &to.to_string_lossy())
                        .map_err(PipelineError::store)?;
                }
            }
            FileAction::DirectoryRefresh => {
                if need_index && !self.state.classifier.is_no_watched(&info.uri) {
                    self.state.queue_directory(info.uri.clone());
                    self.state.progress.lock().unwrap().folders_count += 1;
                }
                need_index = false;
            }
            FileAction::DirectoryCheck => {
                if need_index && !self.state.classifier.is_no_watched(&info.uri) {
                    self.state.queue_directory(info.uri.clone());
                    if info.indextime > 0 {
                        self.check_deleted_children(&info.uri);
                    }
                }
            }
            FileAction::DirectoryCreated => {
                need_index = true;
                if !self.state.classifier.is_no_watched(&info.uri) {
                    debug!(uri = %info.uri.display(), "scanning created directory");
                    self.state.queue_directory(info.uri.clone());
                }
            }
            _ => {}
        }

        Ok(need_index)
    }

    /// Compare a directory's stored children against the filesystem
    /// and delete what vanished.
    fn check_deleted_children(&self, dir: &Path) {
        let Ok(children) = self.state.store.files_in_folder(&dir.to_string_lossy()) else {
            return;
        };
        for (id, path, _is_dir) in children {
            if !Path::new(&path).exists() {
                let _ = self.state.store.delete_service(id);
            }
        }
    }

    /// Enumerate a queued directory, pushing Check tickets for every
    /// child plus a final one for the directory itself.
    pub fn scan_queued_directory(&self, dir: &Path) {
        let (subdirs, files) = crate::crawl::enumerate(dir);
        for path in files.into_iter().chain(subdirs) {
            self.state.queue.push(FileInfo::new(path, FileAction::Check));
        }
        let mut dir_info = FileInfo::new(dir.to_path_buf(), FileAction::Check);
        dir_info.is_directory = true;
        self.state.queue.push(dir_info);
        self.state.progress.lock().unwrap().folders_processed += 1;
    }

    // -- indexing -----------------------------------------------------------

    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Classify and index one entity.
    fn index_entity(&mut self, info: &FileInfo) -> Result<(), PipelineError> {
        let mime = info
            .mime
            .clone()
            .unwrap_or_else(|| mime_for_path(&info.uri, info.is_directory));
        let class = self
            .state
            .classifier
            .service_for_path(&info.uri, &self.state.ontology, &mime)
            .clone();

        if class.name.ends_with("Emails") {
            if mailstore::is_summary_file(&info.uri) {
                return self.index_mail_summary(info, class.id);
            }
            return Ok(());
        }

        let path = info.uri.to_string_lossy().to_string();
        let service_id = match self.state.store.lookup_service(&path).map_err(PipelineError::store)? {
            Some(existing) => existing.id,
            None => {
                let hidden = if info.is_directory {
                    info.is_hidden || !class.show_service_directories
                } else {
                    info.is_hidden || !class.show_service_files
                };
                self.state
                    .store
                    .insert_service(&path, class.id, &mime, info.mtime, info.is_directory, hidden)
                    .map_err(PipelineError::store)?
            }
        };

        if info.is_directory {
            self.state
                .store
                .update_service_times(service_id, info.mtime, self.now())
                .map_err(PipelineError::store)?;
            return Ok(());
        }

        let config = self.state.config.read().unwrap().clone();
        let mut counts: HashMap<String, u32> = HashMap::new();
        let mut properties: Vec<(String, String)> = Vec::new();

        // The name always scores, delimited so "foo_bar-baz" finds all
        // three words
        let name = info.uri.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        self.count_text(&mut counts, &name, "File:Name", &config, true);
        properties.push(("File:Name".into(), name));
        if let Ok(meta) = std::fs::metadata(&info.uri) {
            properties.push(("File:Size".into(), meta.len().to_string()));
        }

        // Content and format metadata are best-effort: an extractor
        // failure still records the basics
        if class.has_full_text || class.has_metadata {
            match self.state.extractors.extract(&info.uri, &mime) {
                Some(Ok(extraction)) => {
                    for (property, value) in &extraction.metadata {
                        self.count_text(&mut counts, value, property, &config, false);
                        properties.push((property.clone(), value.clone()));
                    }
                    if class.has_full_text && config.indexing.enable_content_indexing {
                        if let Some(text) = &extraction.text {
                            let capped: String = text
                                .chars()
                                .take(config.performance.max_text_to_index as usize)
                                .collect();
                            self.count_text(&mut counts, &capped, "File:Contents", &config, false);
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(uri = %info.uri.display(), error = %e, "extractor failed, keeping basic metadata");
                }
                None => {}
            }
        }

        for (term, score) in counts {
            self.cache.add(&term, service_id as u32, class.id, score, info.is_new);
        }
        self.state.store.set_properties(service_id, &properties).map_err(PipelineError::store)?;
        self.state
            .store
            .update_service_times(service_id, info.mtime, self.now())
            .map_err(PipelineError::store)?;
        Ok(())
    }

    /// Tokenize a value into the shared counts map, weighted by its
    /// property.
    fn count_text(
        &self,
        counts: &mut HashMap<String, u32>,
        text: &str,
        property: &str,
        config: &fossick_core::config::Config,
        delimit: bool,
    ) {
        let weight = self.state.ontology.property_weight(property);
        if weight == 0 {
            return;
        }
        let complete = text_to_counts(
            counts,
            text,
            weight,
            &self.state.language,
            config.performance.max_words_to_index,
            config.indexing.max_word_length as usize,
            config.indexing.min_word_length as usize,
            true,
            delimit,
        );
        if !complete {
            debug!(property, "word cap reached while counting");
        }
    }

    /// Decode a mail summary file and index its messages.
    fn index_mail_summary(&mut self, info: &FileInfo, class_id: u32) -> Result<(), PipelineError> {
        let (header, messages) =
            mailstore::read_summary(&info.uri).map_err(PipelineError::summary)?;
        info!(
            uri = %info.uri.display(),
            count = header.count,
            decoded = messages.len(),
            "indexing mail summary"
        );

        let config = self.state.config.read().unwrap().clone();
        for message in messages {
            if message.deleted {
                continue;
            }
            let uri = format!("{}#{}", info.uri.display(), message.uid);
            let service_id = match self.state.store.lookup_service(&uri).map_err(PipelineError::store)? {
                Some(existing) => {
                    if existing.indextime > 0 && existing.mtime >= message.date_received {
                        continue;
                    }
                    existing.id
                }
                None => self
                    .state
                    .store
                    .insert_service(
                        &uri,
                        class_id,
                        "message/rfc822",
                        message.date_received,
                        false,
                        false,
                    )
                    .map_err(PipelineError::store)?,
            };

            let mut counts: HashMap<String, u32> = HashMap::new();
            self.count_text(&mut counts, &message.subject, "Email:Subject", &config, false);
            self.count_text(&mut counts, &message.from, "Email:Sender", &config, true);
            let recipients: Vec<String> = message
                .to
                .iter()
                .chain(message.cc.iter())
                .map(|p| format!("{} {}", p.name, p.addr))
                .collect();
            self.count_text(&mut counts, &recipients.join(" "), "Email:Recipients", &config, true);

            for (term, score) in counts {
                self.cache.add(&term, service_id as u32, class_id, score, true);
            }

            let properties = vec![
                ("Email:Subject".to_string(), message.subject.clone()),
                ("Email:Sender".to_string(), message.from.clone()),
                ("Email:Date".to_string(), message.date_received.to_string()),
                ("Email:Size".to_string(), message.size.to_string()),
            ];
            self.state
                .store
                .set_properties(service_id, &properties)
                .map_err(PipelineError::store)?;
            self.state
                .store
                .update_service_times(service_id, message.date_received, self.now())
                .map_err(PipelineError::store)?;
        }

        // The summary file itself is a service so rechecks can compare
        // mtimes
        let path = info.uri.to_string_lossy().to_string();
        let summary_id = match self.state.store.lookup_service(&path).map_err(PipelineError::store)? {
            Some(s) => s.id,
            None => self
                .state
                .store
                .insert_service(&path, class_id, "application/x-mail-summary", info.mtime, false, true)
                .map_err(PipelineError::store)?,
        };
        self.state
            .store
            .update_service_times(summary_id, info.mtime, self.now())
            .map_err(PipelineError::store)?;
        Ok(())
    }
}

/// Internal error carrier keeping the taxonomy class and a message.
pub struct PipelineError {
    class: ErrorClass,
    message: String,
}

impl PipelineError {
    fn store(e: crate::error::StoreError) -> Self {
        Self { class: e.class(), message: e.to_string() }
    }

    fn summary(e: crate::error::SummaryError) -> Self {
        Self { class: e.class(), message: e.to_string() }
    }

    fn class(&self) -> ErrorClass {
        self.class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EngineState;
    use fossick_core::config::Config;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(watch_root: &Path) -> Arc<EngineState> {
        let data = TempDir::new().unwrap();
        let mut config = Config::default();
        config.watches.watch_directory_roots = vec![watch_root.to_path_buf()];
        config.general.initial_sleep = 0;
        let state = EngineState::new(config, data.path()).unwrap();
        // Leak the tempdir so the databases outlive the test body
        std::mem::forget(data);
        state
    }

    fn check(path: &Path) -> FileInfo {
        FileInfo::new(path.to_path_buf(), FileAction::Check)
    }

    #[test]
    fn indexing_a_file_creates_service_and_postings() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("report.txt");
        std::fs::write(&file, "quarterly summary numbers").unwrap();

        let state = engine(root.path());
        let mut cache = WordCache::new();
        let mut pipeline = Pipeline::new(&state, &mut cache);

        assert_eq!(pipeline.process(check(&file)), Outcome::Indexed);

        let service = state.store.lookup_service(&file.to_string_lossy()).unwrap().unwrap();
        assert!(!service.is_directory);
        assert!(service.indextime > 0);
        assert!(cache.word_count() > 0);
    }

    #[test]
    fn unchanged_file_is_not_reindexed() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("stable.txt");
        std::fs::write(&file, "unchanging words").unwrap();

        let state = engine(root.path());
        let mut cache = WordCache::new();

        assert_eq!(Pipeline::new(&state, &mut cache).process(check(&file)), Outcome::Indexed);
        let before = state.store.lookup_service(&file.to_string_lossy()).unwrap().unwrap();
        let postings_before = cache.posting_count();

        // Same mtime, already indexed: replay must be a no-op
        assert_eq!(Pipeline::new(&state, &mut cache).process(check(&file)), Outcome::Done);
        let after = state.store.lookup_service(&file.to_string_lossy()).unwrap().unwrap();
        assert_eq!(before.indextime, after.indextime);
        assert_eq!(cache.posting_count(), postings_before);
    }

    #[test]
    fn move_updates_path_without_reindex() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("a.txt");
        std::fs::write(&file, "alpha words").unwrap();
        std::fs::create_dir(root.path().join("x")).unwrap();

        let state = engine(root.path());
        let mut cache = WordCache::new();
        Pipeline::new(&state, &mut cache).process(check(&file));
        let indexed = state.store.lookup_service(&file.to_string_lossy()).unwrap().unwrap();
        let postings = cache.posting_count();

        // Simulate the paired rename: file moved on disk, then ticket
        let dest = root.path().join("x/a.txt");
        std::fs::rename(&file, &dest).unwrap();
        let mut ticket = FileInfo::new(file.clone(), FileAction::MovedFrom);
        ticket.moved_to_uri = Some(dest.clone());
        assert_eq!(Pipeline::new(&state, &mut cache).process(ticket), Outcome::Done);

        let moved = state.store.lookup_service(&dest.to_string_lossy()).unwrap().unwrap();
        assert_eq!(moved.id, indexed.id);
        assert_eq!(moved.indextime, indexed.indextime);
        assert_eq!(cache.posting_count(), postings);
        assert!(state.store.lookup_service(&file.to_string_lossy()).unwrap().is_none());
    }

    #[test]
    fn deleted_file_drops_service() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("gone.txt");
        std::fs::write(&file, "temporary words").unwrap();

        let state = engine(root.path());
        let mut cache = WordCache::new();
        let mut pipeline = Pipeline::new(&state, &mut cache);
        pipeline.process(check(&file));
        assert!(state.store.lookup_service(&file.to_string_lossy()).unwrap().is_some());

        std::fs::remove_file(&file).unwrap();
        assert_eq!(pipeline.process(FileInfo::new(file.clone(), FileAction::Delete)), Outcome::Done);
        assert!(state.store.lookup_service(&file.to_string_lossy()).unwrap().is_none());
    }

    #[test]
    fn directory_check_queues_rescan() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("inside.txt"), "content").unwrap();

        let state = engine(root.path());
        let mut cache = WordCache::new();
        let mut pipeline = Pipeline::new(&state, &mut cache);

        let mut ticket = FileInfo::new(root.path().to_path_buf(), FileAction::Check);
        ticket.is_directory = true;
        pipeline.process(ticket);

        assert_eq!(state.pop_directory(), Some(root.path().to_path_buf()));
    }

    #[test]
    fn scan_queued_directory_emits_child_checks() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("one.txt"), "1").unwrap();
        std::fs::write(root.path().join("two.txt"), "2").unwrap();

        let state = engine(root.path());
        let mut cache = WordCache::new();
        let pipeline = Pipeline::new(&state, &mut cache);
        pipeline.scan_queued_directory(root.path());

        let mut seen = 0;
        while state.queue.try_pop().is_some() {
            seen += 1;
        }
        // two children plus the directory itself
        assert_eq!(seen, 3);
    }

    #[test]
    fn mail_summary_indexes_messages() {
        let root = TempDir::new().unwrap();
        let mail_dir = root.path().join("mail");
        std::fs::create_dir(&mail_dir).unwrap();

        // Minimal modern summary with one live message
        let mut buf: Vec<u8> = Vec::new();
        let be = |buf: &mut Vec<u8>, v: i32| buf.extend_from_slice(&v.to_be_bytes());
        let s = |buf: &mut Vec<u8>, v: &str| {
            buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
            buf.extend_from_slice(v.as_bytes());
        };
        be(&mut buf, 14);
        be(&mut buf, 0);
        be(&mut buf, 2);
        be(&mut buf, 1_213_000_000);
        be(&mut buf, 1);
        be(&mut buf, 1);
        be(&mut buf, 0);
        be(&mut buf, 0);
        be(&mut buf, 3); // maildir secondary version
        s(&mut buf, "41");
        be(&mut buf, 2048);
        be(&mut buf, 0);
        be(&mut buf, 1_213_000_100);
        be(&mut buf, 1_213_000_200);
        s(&mut buf, "release notes");
        s(&mut buf, "dev@example.org");
        s(&mut buf, "team@example.org");
        s(&mut buf, "");
        s(&mut buf, "");
        be(&mut buf, 0);
        be(&mut buf, 0);
        be(&mut buf, 0);
        be(&mut buf, 0);
        be(&mut buf, 0);
        let summary = mail_dir.join("summary.mmap");
        std::fs::write(&summary, &buf).unwrap();

        let state = engine(root.path());
        state.classifier.add_service_dir("EvolutionEmails", &mail_dir);
        let mut cache = WordCache::new();
        let mut pipeline = Pipeline::new(&state, &mut cache);

        assert_eq!(pipeline.process(check(&summary)), Outcome::Indexed);

        let uri = format!("{}#41", summary.display());
        let message = state.store.lookup_service(&uri).unwrap().unwrap();
        assert_eq!(message.mime, "message/rfc822");
        let props = state.store.get_properties(message.id).unwrap();
        assert!(props.iter().any(|(p, v)| p == "Email:Subject" && v == "release notes"));
        // Email terms go to the email cache as new words
        assert!(cache.word_count() > 0);
    }
}
