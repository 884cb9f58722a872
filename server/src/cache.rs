//! In-memory word cache: posting deltas accumulated between flushes.
//!
//! Three tables: new file words, new email words, and post-index update
//! words. The file and email tables are touched only by the indexer
//! thread; the update table is also written by the request thread when
//! a user edits tags or metadata, so it lives behind a mutex.

use crate::error::IndexError;
use crate::index::{IndexKind, IndexSet};
use fossick_core::config::Performance;
use fossick_core::types::{is_email_class_id, WordDetails};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Estimator weights: 8 bytes per posting plus per-term map overhead.
const POSTING_BYTES: u64 = 8;
const TERM_OVERHEAD_BYTES: u64 = 150;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CacheTable {
    words: HashMap<String, Vec<WordDetails>>,
    postings: usize,
}

impl CacheTable {
    /// Append a posting; returns true when the term is new to the table.
    fn add(&mut self, term: &str, details: WordDetails) -> bool {
        self.postings += 1;
        match self.words.get_mut(term) {
            Some(buffer) => {
                buffer.push(details);
                false
            }
            None => {
                self.words.insert(term.to_string(), vec![details]);
                true
            }
        }
    }

    fn terms(&self) -> usize {
        self.words.len()
    }

    fn clear(&mut self) -> HashMap<String, Vec<WordDetails>> {
        self.postings = 0;
        std::mem::take(&mut self.words)
    }
}

/// The update table, shared with the request thread.
#[derive(Default)]
pub struct UpdateTable {
    inner: Mutex<CacheTable>,
}

impl UpdateTable {
    /// Record a metadata-change delta for an already-indexed service.
    /// A zero score marks the posting for removal.
    pub fn add(&self, term: &str, service_id: u32, class_id: u32, score: u32) -> bool {
        self.inner.lock().unwrap().add(term, WordDetails::new(service_id, class_id, score))
    }

    fn stats(&self) -> (usize, usize) {
        let t = self.inner.lock().unwrap();
        (t.terms(), t.postings)
    }
}

// ---------------------------------------------------------------------------
// Word cache
// ---------------------------------------------------------------------------

/// Accumulator owned by the indexer thread. Only the update table is
/// reachable from other threads, via [`WordCache::update_table`].
pub struct WordCache {
    file_words: CacheTable,
    email_words: CacheTable,
    update_words: Arc<UpdateTable>,
    /// Distinct new terms across the file and email tables.
    word_count: usize,
}

impl Default for WordCache {
    fn default() -> Self {
        Self::new()
    }
}

impl WordCache {
    pub fn new() -> Self {
        Self::with_update_table(Arc::new(UpdateTable::default()))
    }

    /// Build around an existing update table, so the request thread's
    /// handle and the indexer's cache share one set of deltas.
    pub fn with_update_table(update_words: Arc<UpdateTable>) -> Self {
        Self {
            file_words: CacheTable::default(),
            email_words: CacheTable::default(),
            update_words,
            word_count: 0,
        }
    }

    /// Handle for the request thread's tag and metadata edits.
    pub fn update_table(&self) -> Arc<UpdateTable> {
        Arc::clone(&self.update_words)
    }

    /// Add one posting. Email-range classes route to the email table;
    /// otherwise `is_new` picks the file table over the update table.
    pub fn add(&mut self, term: &str, service_id: u32, class_id: u32, score: u32, is_new: bool) {
        if is_new {
            let details = WordDetails::new(service_id, class_id, score);
            let table = if is_email_class_id(class_id) {
                &mut self.email_words
            } else {
                &mut self.file_words
            };
            if table.add(term, details) {
                self.word_count += 1;
            }
        } else {
            self.update_words.add(term, service_id, class_id, score);
        }
    }

    pub fn word_count(&self) -> usize {
        self.word_count
    }

    pub fn update_word_count(&self) -> usize {
        self.update_words.stats().0
    }

    pub fn posting_count(&self) -> usize {
        self.file_words.postings + self.email_words.postings + self.update_words.stats().1
    }

    /// Estimated memory footprint in bytes.
    pub fn estimated_bytes(&self) -> u64 {
        let (update_terms, update_postings) = self.update_words.stats();
        let postings = (self.file_words.postings + self.email_words.postings + update_postings) as u64;
        let terms = (self.word_count + update_terms) as u64;
        postings * POSTING_BYTES + terms * TERM_OVERHEAD_BYTES
    }

    /// Whether the estimator exceeds the configured memory limit.
    pub fn needs_flush(&self, memory_limit: u64) -> bool {
        self.estimated_bytes() > memory_limit
    }

    /// Flush every table to disk and clear the cache.
    ///
    /// Small flushes target the main indexes directly; past the term
    /// threshold each main index spills to a fresh temp index once it
    /// exceeds the spill size. Update words go to the main file index
    /// until temp merges are pending or the update table grows large.
    pub fn flush_all(&mut self, indexes: &IndexSet, perf: &Performance) -> Result<(), IndexError> {
        let (update_terms, _) = self.update_words.stats();
        if self.word_count == 0 && update_terms == 0 {
            return Ok(());
        }
        info!(
            postings = self.posting_count(),
            terms = self.word_count,
            update_terms = update_terms,
            "flushing word cache"
        );

        let spill = self.word_count >= perf.flush_term_threshold as usize;

        let file_words = self.file_words.clear();
        if !file_words.is_empty() {
            Self::flush_table(file_words, indexes, IndexKind::Files, spill, perf)?;
        }

        let email_words = self.email_words.clear();
        if !email_words.is_empty() {
            Self::flush_table(email_words, indexes, IndexKind::Emails, spill, perf)?;
        }

        let update_words = self.update_words.inner.lock().unwrap().clear();
        if !update_words.is_empty() {
            let to_update_index = indexes.has_temp_files(IndexKind::Files)
                || update_terms >= perf.update_flush_threshold as usize;
            if to_update_index {
                let mut update = indexes.update_index().lock().unwrap();
                for (term, postings) in update_words {
                    update.update(&term, &postings)?;
                }
                update.sync()?;
            } else {
                let mut main = indexes.main(IndexKind::Files).lock().unwrap();
                for (term, postings) in update_words {
                    main.update(&term, &postings)?;
                }
                main.sync()?;
            }
        }

        self.word_count = 0;
        Ok(())
    }

    fn flush_table(
        words: HashMap<String, Vec<WordDetails>>,
        indexes: &IndexSet,
        kind: IndexKind,
        spill: bool,
        perf: &Performance,
    ) -> Result<(), IndexError> {
        let use_temp = spill && indexes.main_size(kind) > perf.index_spill_bytes;
        if use_temp {
            let mut temp = indexes.create_temp(kind)?;
            for (term, postings) in words {
                temp.append(&term, &postings)?;
            }
            temp.sync()?;
            debug!(kind = ?kind, "flushed cache table to temp index");
        } else {
            let mut main = indexes.main(kind).lock().unwrap();
            for (term, postings) in words {
                main.append(&term, &postings)?;
            }
            main.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn perf() -> Performance {
        Performance::default()
    }

    #[test]
    fn add_routes_by_class_and_novelty() {
        let mut cache = WordCache::new();
        cache.add("doc", 1, 3, 5, true); // file class, new
        cache.add("mail", 2, 21, 5, true); // email class, new
        cache.add("tag", 1, 3, 5, false); // update

        assert_eq!(cache.word_count(), 2);
        assert_eq!(cache.update_word_count(), 1);
        assert_eq!(cache.posting_count(), 3);
    }

    #[test]
    fn estimator_matches_formula() {
        let mut cache = WordCache::new();
        cache.add("one", 1, 1, 1, true);
        cache.add("one", 2, 1, 1, true);
        cache.add("two", 3, 1, 1, true);
        // 3 postings * 8 + 2 terms * 150
        assert_eq!(cache.estimated_bytes(), 3 * 8 + 2 * 150);
        assert!(cache.needs_flush(100));
        assert!(!cache.needs_flush(10_000));
    }

    #[test]
    fn flush_preserves_posting_multiset() {
        let dir = TempDir::new().unwrap();
        let indexes = IndexSet::open(dir.path()).unwrap();
        let mut cache = WordCache::new();
        cache.add("apple", 1, 3, 5, true);
        cache.add("apple", 2, 3, 2, true);
        cache.add("mail", 9, 21, 1, true);

        cache.flush_all(&indexes, &perf()).unwrap();

        assert_eq!(cache.word_count(), 0);
        assert_eq!(cache.posting_count(), 0);
        let file_postings = indexes.lookup(IndexKind::Files, "apple").unwrap();
        assert_eq!(file_postings.len(), 2);
        let email_postings =
            indexes.main(IndexKind::Emails).lock().unwrap().lookup("mail").unwrap();
        assert_eq!(email_postings.len(), 1);
    }

    #[test]
    fn small_update_set_flushes_into_main_index() {
        let dir = TempDir::new().unwrap();
        let indexes = IndexSet::open(dir.path()).unwrap();
        indexes.main(IndexKind::Files).lock().unwrap().append("apple", &[WordDetails::new(1, 3, 5)]).unwrap();

        let mut cache = WordCache::new();
        cache.add("apple", 1, 3, 9, false);
        cache.flush_all(&indexes, &perf()).unwrap();

        // Applied directly to main, not parked in the update index
        assert_eq!(indexes.update_index().lock().unwrap().term_count(), 0);
        let postings = indexes.main(IndexKind::Files).lock().unwrap().lookup("apple").unwrap();
        assert_eq!(postings, vec![WordDetails::new(1, 3, 9)]);
    }

    #[test]
    fn updates_park_in_update_index_when_temps_exist() {
        let dir = TempDir::new().unwrap();
        let indexes = IndexSet::open(dir.path()).unwrap();
        let _t = indexes.create_temp(IndexKind::Files).unwrap();

        let mut cache = WordCache::new();
        cache.add("apple", 1, 3, 9, false);
        cache.flush_all(&indexes, &perf()).unwrap();

        assert_eq!(indexes.update_index().lock().unwrap().term_count(), 1);
    }

    #[test]
    fn update_table_usable_from_other_threads() {
        let cache = WordCache::new();
        let table = cache.update_table();
        let handle = std::thread::spawn(move || {
            table.add("shared", 7, 3, 4);
        });
        handle.join().unwrap();
        assert_eq!(cache.update_word_count(), 1);
    }
}
