//! On-disk inverted index: `term → packed WordDetails[]`.
//!
//! Each index is a record log — `[u16 term_len][term][u32 len][postings]`
//! — with an in-memory extent map rebuilt by scanning at open. Appends
//! go to the log tail; replace-semantics indexes logically supersede
//! earlier records by swapping the extent list. A corrupt tail is
//! truncated at open rather than failing the whole index.
//!
//! The set manager owns the main file and email indexes, the update
//! index, and the sequentially-numbered temp spills that `merge` folds
//! back into the main files.

use crate::error::IndexError;
use fossick_core::types::{decode_postings, encode_postings, WordDetails};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const FILE_INDEX_NAME: &str = "file-index.main";
pub const EMAIL_INDEX_NAME: &str = "email-index.main";
pub const UPDATE_INDEX_NAME: &str = "update-index";

/// Which family of index files an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Files,
    Emails,
}

impl IndexKind {
    fn main_name(&self) -> &'static str {
        match self {
            IndexKind::Files => FILE_INDEX_NAME,
            IndexKind::Emails => EMAIL_INDEX_NAME,
        }
    }

    fn temp_prefix(&self) -> &'static str {
        match self {
            IndexKind::Files => "file-index.tmp.",
            IndexKind::Emails => "email-index.tmp.",
        }
    }
}

// ---------------------------------------------------------------------------
// Single index file
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct Extent {
    offset: u64,
    len: u32,
}

/// One disk-backed index file plus its extent map.
pub struct IndexFile {
    path: PathBuf,
    file: File,
    extents: BTreeMap<String, Vec<Extent>>,
    size: u64,
    /// Replace semantics: lookups de-duplicate by service id with
    /// last-writer-wins (the update index).
    replace: bool,
}

impl IndexFile {
    /// Open (or create) an index file and rebuild the extent map.
    pub fn open(path: &Path, replace: bool) -> Result<Self, IndexError> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut extents: BTreeMap<String, Vec<Extent>> = BTreeMap::new();
        let mut pos = 0usize;
        let mut valid_end = 0usize;
        while pos < data.len() {
            let Some(record) = read_record(&data, pos) else {
                warn!(path = %path.display(), offset = pos, "truncating corrupt index tail");
                break;
            };
            let (term, extent, next) = record;
            if replace {
                extents.insert(term, vec![extent]);
            } else {
                extents.entry(term).or_default().push(extent);
            }
            pos = next;
            valid_end = next;
        }

        if valid_end < data.len() {
            file.set_len(valid_end as u64)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self { path: path.to_path_buf(), file, extents, size: valid_end as u64, replace })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn term_count(&self) -> usize {
        self.extents.len()
    }

    /// Append postings for a term. For replace-semantics indexes the
    /// new record supersedes earlier ones after an LWW merge.
    pub fn append(&mut self, term: &str, postings: &[WordDetails]) -> Result<(), IndexError> {
        if postings.is_empty() {
            return Ok(());
        }
        if self.replace {
            return self.update(term, postings);
        }
        let extent = self.write_record(term, postings)?;
        self.extents.entry(term.to_string()).or_default().push(extent);
        Ok(())
    }

    /// Merge deltas into the existing value, de-duplicating by service
    /// id with last-writer-wins on the amalgamated field. Replace
    /// indexes keep deletion markers (they are consumed when applied);
    /// everywhere else a marker removes the posting for good.
    pub fn update(&mut self, term: &str, postings: &[WordDetails]) -> Result<(), IndexError> {
        let mut merged: BTreeMap<u32, WordDetails> =
            self.lookup_raw(term)?.into_iter().map(|p| (p.id, p)).collect();
        for p in postings {
            merged.insert(p.id, *p);
        }
        let mut merged: Vec<WordDetails> = merged.into_values().collect();
        if !self.replace {
            merged = strip_deletions(merged);
        }
        let extent = self.write_record(term, &merged)?;
        self.extents.insert(term.to_string(), vec![extent]);
        Ok(())
    }

    /// Read the postings stored against a term, deletion markers
    /// filtered out.
    pub fn lookup(&mut self, term: &str) -> Result<Vec<WordDetails>, IndexError> {
        let out = self.lookup_raw(term)?;
        if self.replace {
            return Ok(strip_deletions(out));
        }
        Ok(out)
    }

    /// Like `lookup` but keeps deletion markers, for code that applies
    /// or merges deltas.
    pub(crate) fn lookup_raw(&mut self, term: &str) -> Result<Vec<WordDetails>, IndexError> {
        let Some(extents) = self.extents.get(term) else {
            return Ok(Vec::new());
        };
        let extents = extents.clone();
        let mut out = Vec::new();
        for extent in extents {
            self.file.seek(SeekFrom::Start(extent.offset))?;
            let mut buf = vec![0u8; extent.len as usize];
            self.file.read_exact(&mut buf)?;
            out.extend(decode_postings(&buf));
        }
        self.file.seek(SeekFrom::End(0))?;
        if self.replace {
            out = dedupe_last_writer(out);
        }
        Ok(out)
    }

    /// All terms in lexical order.
    pub fn terms(&self) -> Vec<String> {
        self.extents.keys().cloned().collect()
    }

    pub fn sync(&mut self) -> Result<(), IndexError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Drop every record, resetting the file to empty.
    pub fn clear(&mut self) -> Result<(), IndexError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.extents.clear();
        self.size = 0;
        Ok(())
    }

    /// Strict scan of an index file: returns the record count, or the
    /// offset of the first corrupt record.
    pub fn check_integrity(path: &Path) -> Result<usize, IndexError> {
        let data = std::fs::read(path)?;
        let mut pos = 0usize;
        let mut records = 0usize;
        while pos < data.len() {
            match read_record(&data, pos) {
                Some((_, _, next)) => {
                    records += 1;
                    pos = next;
                }
                None => {
                    return Err(IndexError::Corrupt { path: path.to_path_buf(), offset: pos as u64 })
                }
            }
        }
        Ok(records)
    }

    fn write_record(&mut self, term: &str, postings: &[WordDetails]) -> Result<Extent, IndexError> {
        let term_bytes = term.as_bytes();
        let payload = encode_postings(postings);
        let mut record = Vec::with_capacity(2 + term_bytes.len() + 4 + payload.len());
        record.extend_from_slice(&(term_bytes.len() as u16).to_le_bytes());
        record.extend_from_slice(term_bytes);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&payload);

        let offset = self.size + 2 + term_bytes.len() as u64 + 4;
        self.file.write_all(&record)?;
        self.size += record.len() as u64;
        Ok(Extent { offset, len: payload.len() as u32 })
    }
}

fn read_record(data: &[u8], pos: usize) -> Option<(String, Extent, usize)> {
    let term_len = u16::from_le_bytes(data.get(pos..pos + 2)?.try_into().ok()?) as usize;
    let term_start = pos + 2;
    let term = std::str::from_utf8(data.get(term_start..term_start + term_len)?).ok()?;
    let len_start = term_start + term_len;
    let payload_len =
        u32::from_le_bytes(data.get(len_start..len_start + 4)?.try_into().ok()?) as usize;
    // Postings are 8-byte records; anything else is corruption
    if payload_len % 8 != 0 {
        return None;
    }
    let payload_start = len_start + 4;
    let end = payload_start + payload_len;
    if end > data.len() {
        return None;
    }
    Some((
        term.to_string(),
        Extent { offset: payload_start as u64, len: payload_len as u32 },
        end,
    ))
}

/// Keep only the most recent posting per service id, ordered by id.
/// Deletion markers survive; strip them at the point of application.
fn dedupe_last_writer(postings: Vec<WordDetails>) -> Vec<WordDetails> {
    let mut by_id: BTreeMap<u32, WordDetails> = BTreeMap::new();
    for p in postings {
        by_id.insert(p.id, p);
    }
    by_id.into_values().collect()
}

fn strip_deletions(postings: Vec<WordDetails>) -> Vec<WordDetails> {
    postings.into_iter().filter(|p| !p.is_deletion()).collect()
}

// ---------------------------------------------------------------------------
// Index set
// ---------------------------------------------------------------------------

/// The daemon's indexes: file main, email main, and the update index,
/// plus management of temp spills and merging.
pub struct IndexSet {
    data_dir: PathBuf,
    file_index: Mutex<IndexFile>,
    email_index: Mutex<IndexFile>,
    update_index: Mutex<IndexFile>,
}

impl IndexSet {
    pub fn open(data_dir: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            file_index: Mutex::new(IndexFile::open(&data_dir.join(FILE_INDEX_NAME), false)?),
            email_index: Mutex::new(IndexFile::open(&data_dir.join(EMAIL_INDEX_NAME), false)?),
            update_index: Mutex::new(IndexFile::open(&data_dir.join(UPDATE_INDEX_NAME), true)?),
        })
    }

    pub fn main(&self, kind: IndexKind) -> &Mutex<IndexFile> {
        match kind {
            IndexKind::Files => &self.file_index,
            IndexKind::Emails => &self.email_index,
        }
    }

    pub fn update_index(&self) -> &Mutex<IndexFile> {
        &self.update_index
    }

    pub fn main_size(&self, kind: IndexKind) -> u64 {
        self.main(kind).lock().unwrap().size()
    }

    /// Look a term up across main and update indexes, update entries
    /// winning per service id.
    pub fn lookup(&self, kind: IndexKind, term: &str) -> Result<Vec<WordDetails>, IndexError> {
        let mut main = self.main(kind).lock().unwrap().lookup(term)?;
        if kind == IndexKind::Files {
            let update = self.update_index.lock().unwrap().lookup_raw(term)?;
            if !update.is_empty() {
                main.extend(update);
                main = strip_deletions(dedupe_last_writer(main));
            }
        }
        Ok(main)
    }

    /// Create the next free temp index (`<prefix>1`, `<prefix>2`, …).
    pub fn create_temp(&self, kind: IndexKind) -> Result<IndexFile, IndexError> {
        for k in 1..1000 {
            let path = self.data_dir.join(format!("{}{}", kind.temp_prefix(), k));
            if path.exists() {
                continue;
            }
            info!(path = %path.display(), "spilling flush to temp index");
            return IndexFile::open(&path, false);
        }
        Err(IndexError::Io(std::io::Error::other("no free temp index slot")))
    }

    /// Temp spill files for a kind, in creation (numeric) order.
    pub fn temp_files(&self, kind: IndexKind) -> Vec<PathBuf> {
        let prefix = kind.temp_prefix();
        let mut numbered: Vec<(u32, PathBuf)> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.data_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(suffix) = name.strip_prefix(prefix) {
                    if let Ok(k) = suffix.parse::<u32>() {
                        numbered.push((k, entry.path()));
                    }
                }
            }
        }
        numbered.sort_by_key(|(k, _)| *k);
        numbered.into_iter().map(|(_, p)| p).collect()
    }

    pub fn has_temp_files(&self, kind: IndexKind) -> bool {
        !self.temp_files(kind).is_empty()
    }

    /// Fold all temp indexes into the main index: a term-ordered walk
    /// combining posting arrays in creation order, de-duplicated per
    /// service id, written to a fresh file and renamed over main.
    pub fn merge(&self, kind: IndexKind) -> Result<(), IndexError> {
        let temps = self.temp_files(kind);
        if temps.is_empty() {
            return Ok(());
        }
        info!(kind = ?kind, temps = temps.len(), "merging temp indexes into main");

        let mut main = self.main(kind).lock().unwrap();
        let mut combined: BTreeMap<String, Vec<WordDetails>> = BTreeMap::new();
        for term in main.terms() {
            combined.insert(term.clone(), main.lookup(&term)?);
        }
        for path in &temps {
            let mut temp = IndexFile::open(path, false)?;
            for term in temp.terms() {
                combined.entry(term.clone()).or_default().extend(temp.lookup(&term)?);
            }
        }

        let new_path = self.data_dir.join(format!("{}.new", kind.main_name()));
        let mut fresh = IndexFile::open(&new_path, false)?;
        fresh.clear()?;
        for (term, postings) in combined {
            let deduped = strip_deletions(dedupe_last_writer(postings));
            if !deduped.is_empty() {
                fresh.append(&term, &deduped)?;
            }
        }
        fresh.sync()?;

        std::fs::rename(&new_path, main.path())?;
        *main = IndexFile::open(&self.data_dir.join(kind.main_name()), false)?;
        drop(main);

        for path in temps {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not remove merged temp index");
            }
        }
        Ok(())
    }

    /// Apply accumulated update-index deltas against the file main
    /// index, rewriting affected term entries, then reset the update
    /// index. Safe to re-run after a crash: the merge is last-writer-
    /// wins over identical data.
    pub fn apply_changes(&self) -> Result<usize, IndexError> {
        let mut update = self.update_index.lock().unwrap();
        let terms = update.terms();
        if terms.is_empty() {
            return Ok(0);
        }
        debug!(terms = terms.len(), "applying update-index journal");

        let mut main = self.file_index.lock().unwrap();
        for term in &terms {
            let deltas = update.lookup_raw(term)?;
            let mut merged = main.lookup(term)?;
            merged.extend(deltas);
            let merged = strip_deletions(dedupe_last_writer(merged));
            let extent = main.write_record(term, &merged)?;
            main.extents.insert(term.clone(), vec![extent]);
        }
        main.sync()?;
        drop(main);

        update.clear()?;
        Ok(terms.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn details(id: u32, score: u32) -> WordDetails {
        WordDetails::new(id, 1, score)
    }

    #[test]
    fn append_and_lookup_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut idx = IndexFile::open(&dir.path().join("test.idx"), false).unwrap();
        idx.append("apple", &[details(1, 5)]).unwrap();
        idx.append("apple", &[details(2, 3)]).unwrap();
        assert_eq!(idx.lookup("apple").unwrap(), vec![details(1, 5), details(2, 3)]);
        assert_eq!(idx.lookup("missing").unwrap(), vec![]);
    }

    #[test]
    fn extent_map_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.idx");
        {
            let mut idx = IndexFile::open(&path, false).unwrap();
            idx.append("pear", &[details(7, 1)]).unwrap();
            idx.sync().unwrap();
        }
        let mut idx = IndexFile::open(&path, false).unwrap();
        assert_eq!(idx.lookup("pear").unwrap(), vec![details(7, 1)]);
    }

    #[test]
    fn corrupt_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.idx");
        {
            let mut idx = IndexFile::open(&path, false).unwrap();
            idx.append("good", &[details(1, 1)]).unwrap();
            idx.sync().unwrap();
        }
        // Garbage after the valid record
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0xFF, 0x13, 0x37]).unwrap();
        drop(f);

        let mut idx = IndexFile::open(&path, false).unwrap();
        assert_eq!(idx.lookup("good").unwrap(), vec![details(1, 1)]);
        idx.append("more", &[details(2, 2)]).unwrap();
        assert_eq!(idx.lookup("more").unwrap(), vec![details(2, 2)]);
    }

    #[test]
    fn update_index_is_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let mut idx = IndexFile::open(&dir.path().join("update.idx"), true).unwrap();
        idx.update("apple", &[details(1, 5), details(2, 2)]).unwrap();
        idx.update("apple", &[details(1, 9)]).unwrap();
        assert_eq!(idx.lookup("apple").unwrap(), vec![details(1, 9), details(2, 2)]);
    }

    #[test]
    fn deletion_markers_remove_postings() {
        let dir = TempDir::new().unwrap();
        let mut idx = IndexFile::open(&dir.path().join("update.idx"), true).unwrap();
        idx.update("apple", &[details(1, 5), details(2, 2)]).unwrap();
        idx.update("apple", &[WordDetails::new(1, 1, 0)]).unwrap();
        assert_eq!(idx.lookup("apple").unwrap(), vec![details(2, 2)]);
    }

    #[test]
    fn temp_naming_picks_first_free_slot() {
        let dir = TempDir::new().unwrap();
        let set = IndexSet::open(dir.path()).unwrap();
        let t1 = set.create_temp(IndexKind::Files).unwrap();
        assert!(t1.path().ends_with("file-index.tmp.1"));
        let t2 = set.create_temp(IndexKind::Files).unwrap();
        assert!(t2.path().ends_with("file-index.tmp.2"));
        assert_eq!(set.temp_files(IndexKind::Files).len(), 2);
        assert!(!set.has_temp_files(IndexKind::Emails));
    }

    #[test]
    fn merge_combines_temps_and_removes_them() {
        let dir = TempDir::new().unwrap();
        let set = IndexSet::open(dir.path()).unwrap();
        set.main(IndexKind::Files).lock().unwrap().append("apple", &[details(1, 5)]).unwrap();

        let mut t1 = set.create_temp(IndexKind::Files).unwrap();
        t1.append("apple", &[details(2, 3)]).unwrap();
        t1.append("banana", &[details(3, 1)]).unwrap();
        t1.sync().unwrap();
        drop(t1);

        set.merge(IndexKind::Files).unwrap();

        assert!(!set.has_temp_files(IndexKind::Files));
        let mut main = set.main(IndexKind::Files).lock().unwrap();
        assert_eq!(main.lookup("apple").unwrap(), vec![details(1, 5), details(2, 3)]);
        assert_eq!(main.lookup("banana").unwrap(), vec![details(3, 1)]);
    }

    #[test]
    fn merge_keeps_most_recent_posting_per_service() {
        let dir = TempDir::new().unwrap();
        let set = IndexSet::open(dir.path()).unwrap();
        set.main(IndexKind::Files).lock().unwrap().append("apple", &[details(1, 5)]).unwrap();

        let mut t1 = set.create_temp(IndexKind::Files).unwrap();
        t1.append("apple", &[details(1, 9)]).unwrap();
        t1.sync().unwrap();
        drop(t1);

        set.merge(IndexKind::Files).unwrap();
        let mut main = set.main(IndexKind::Files).lock().unwrap();
        assert_eq!(main.lookup("apple").unwrap(), vec![details(1, 9)]);
    }

    #[test]
    fn apply_changes_rewrites_and_clears() {
        let dir = TempDir::new().unwrap();
        let set = IndexSet::open(dir.path()).unwrap();
        set.main(IndexKind::Files).lock().unwrap().append("apple", &[details(1, 5)]).unwrap();
        set.update_index().lock().unwrap().update("apple", &[details(1, 8)]).unwrap();

        let applied = set.apply_changes().unwrap();
        assert_eq!(applied, 1);
        assert_eq!(
            set.main(IndexKind::Files).lock().unwrap().lookup("apple").unwrap(),
            vec![details(1, 8)]
        );
        assert_eq!(set.update_index().lock().unwrap().term_count(), 0);

        // Re-running with an empty journal is a no-op
        assert_eq!(set.apply_changes().unwrap(), 0);
    }

    #[test]
    fn combined_lookup_prefers_update_entries() {
        let dir = TempDir::new().unwrap();
        let set = IndexSet::open(dir.path()).unwrap();
        set.main(IndexKind::Files).lock().unwrap().append("apple", &[details(1, 5)]).unwrap();
        set.update_index().lock().unwrap().update("apple", &[details(1, 7)]).unwrap();
        assert_eq!(set.lookup(IndexKind::Files, "apple").unwrap(), vec![details(1, 7)]);
    }
}
