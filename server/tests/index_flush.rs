//! Cache flush policy and temp-index spill/merge behavior.

use fossick_core::config::Performance;
use fossick_core::types::WordDetails;
use fossick_server::cache::WordCache;
use fossick_server::index::{IndexKind, IndexSet};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Scenario: cache-driven flush
// ---------------------------------------------------------------------------

#[test]
fn estimator_triggers_single_flush_preserving_counts() {
    let dir = TempDir::new().unwrap();
    let indexes = IndexSet::open(dir.path()).unwrap();
    let mut cache = WordCache::new();
    let memory_limit = 100 * 1024;

    // One item feeds 20k distinct terms; the estimator is consulted
    // between items, so this costs exactly one flush
    for i in 0..20_000u32 {
        cache.add(&format!("term{i:05}"), i + 1, 3, 1, true);
    }
    assert!(cache.needs_flush(memory_limit));

    let mut flushes = 0;
    if cache.needs_flush(memory_limit) {
        cache.flush_all(&indexes, &Performance::default()).unwrap();
        flushes += 1;
    }
    assert!(!cache.needs_flush(memory_limit));
    assert_eq!(flushes, 1);
    assert_eq!(cache.word_count(), 0);
    assert_eq!(cache.posting_count(), 0);

    // The union of flushed postings matches what the cache held
    let mut total = 0usize;
    let mut main = indexes.main(IndexKind::Files).lock().unwrap();
    assert_eq!(main.term_count(), 20_000);
    for term in main.terms() {
        total += main.lookup(&term).unwrap().len();
    }
    assert_eq!(total, 20_000);
}

// ---------------------------------------------------------------------------
// Scenario: temp-index spill plus merge
// ---------------------------------------------------------------------------

#[test]
fn big_flush_spills_to_temp_then_merges() {
    let dir = TempDir::new().unwrap();
    let indexes = IndexSet::open(dir.path()).unwrap();
    let perf = Performance::default();

    // Grow the main index past the spill threshold (~4 MB)
    {
        let mut main = indexes.main(IndexKind::Files).lock().unwrap();
        let fat_postings: Vec<WordDetails> =
            (0..1000).map(|i| WordDetails::new(i, 3, 1)).collect();
        let mut written = 0u64;
        let mut n = 0u32;
        while written < perf.index_spill_bytes + 8_192 {
            main.append(&format!("seed{n:06}"), &fat_postings).unwrap();
            written = main.size();
            n += 1;
        }
        main.sync().unwrap();
    }
    let seeded_terms = indexes.main(IndexKind::Files).lock().unwrap().term_count();

    // A large cache (past the term threshold) must spill to tmp.1
    let mut cache = WordCache::new();
    for i in 0..10_000u32 {
        cache.add(&format!("fresh{i:05}"), 500_000 + i, 3, 1, true);
    }
    cache.flush_all(&indexes, &perf).unwrap();

    let temps = indexes.temp_files(IndexKind::Files);
    assert_eq!(temps.len(), 1);
    assert!(temps[0].ends_with("file-index.tmp.1"));
    assert!(indexes
        .main(IndexKind::Files)
        .lock()
        .unwrap()
        .lookup("fresh00000")
        .unwrap()
        .is_empty());

    // Idle merge folds the spill into main and removes it
    indexes.merge(IndexKind::Files).unwrap();
    assert!(!indexes.has_temp_files(IndexKind::Files));

    let mut main = indexes.main(IndexKind::Files).lock().unwrap();
    assert_eq!(main.term_count(), seeded_terms + 10_000);
    assert_eq!(main.lookup("fresh00000").unwrap().len(), 1);
    assert_eq!(main.lookup("seed000000").unwrap().len(), 1000);
}

// ---------------------------------------------------------------------------
// Small flushes stay on the main index
// ---------------------------------------------------------------------------

#[test]
fn small_flush_targets_main_even_when_main_is_big() {
    let dir = TempDir::new().unwrap();
    let indexes = IndexSet::open(dir.path()).unwrap();
    let perf = Performance::default();

    {
        let mut main = indexes.main(IndexKind::Files).lock().unwrap();
        let fat: Vec<WordDetails> = (0..1000).map(|i| WordDetails::new(i, 3, 1)).collect();
        let mut n = 0u32;
        while main.size() < perf.index_spill_bytes + 8_192 {
            main.append(&format!("seed{n:06}"), &fat).unwrap();
            n += 1;
        }
    }

    // Below the 5000-term threshold: straight to main, no temp
    let mut cache = WordCache::new();
    for i in 0..100u32 {
        cache.add(&format!("tiny{i:03}"), 900_000 + i, 3, 1, true);
    }
    cache.flush_all(&indexes, &perf).unwrap();

    assert!(!indexes.has_temp_files(IndexKind::Files));
    assert_eq!(
        indexes.main(IndexKind::Files).lock().unwrap().lookup("tiny000").unwrap().len(),
        1
    );
}
