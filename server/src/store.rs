//! Metadata store façade: the relational side of the engine.
//!
//! Four sqlite files: file-meta, email-meta and virtual-meta hold
//! service rows (chosen by class at insert, immutable afterwards);
//! common holds options, the persistent pending queue, the event
//! journal, id sequences, and the statement graph mutated by batch
//! updates. Every façade mutation journals an event row for the ids it
//! touches.
//!
//! The update interpreter at the bottom executes exactly the operation
//! shapes the batch layer emits — property-clear deletes, TriG resource
//! inserts, typed statements — inside one transaction. Anything else is
//! a parse error handled per the skip-unless-strict policy.

use crate::error::StoreError;
use fossick_core::types::{FileAction, FileInfo, Ontology, Service, StoreKind};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

pub const FILE_META_DB: &str = "file-meta.db";
pub const EMAIL_META_DB: &str = "email-meta.db";
pub const VIRTUAL_META_DB: &str = "virtual-meta.db";
pub const COMMON_DB: &str = "common.db";

const SERVICE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS services (
    id           INTEGER PRIMARY KEY,
    parent_id    INTEGER NOT NULL DEFAULT 0,
    path         TEXT NOT NULL UNIQUE,
    class_id     INTEGER NOT NULL,
    mime         TEXT NOT NULL DEFAULT '',
    mtime        INTEGER NOT NULL DEFAULT 0,
    indextime    INTEGER NOT NULL DEFAULT 0,
    is_directory INTEGER NOT NULL DEFAULT 0,
    is_hidden    INTEGER NOT NULL DEFAULT 0,
    enabled      INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_services_class ON services(class_id);
CREATE TABLE IF NOT EXISTS service_properties (
    service_id INTEGER NOT NULL,
    property   TEXT NOT NULL,
    value      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_properties_service ON service_properties(service_id);
CREATE TABLE IF NOT EXISTS service_keywords (
    service_id INTEGER NOT NULL,
    keyword    TEXT NOT NULL,
    UNIQUE(service_id, keyword)
);
";

const COMMON_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS options (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sequences (
    name  TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS pending_files (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id      INTEGER NOT NULL DEFAULT 0,
    uri          TEXT NOT NULL,
    moved_to_uri TEXT,
    mime         TEXT,
    action       INTEGER NOT NULL,
    is_directory INTEGER NOT NULL DEFAULT 0,
    counter      INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS events (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id INTEGER NOT NULL,
    kind       INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS statements (
    graph     TEXT NOT NULL DEFAULT '',
    subject   TEXT NOT NULL,
    predicate TEXT NOT NULL,
    object    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_statements_spo ON statements(subject, predicate);
";

// ---------------------------------------------------------------------------
// Store set
// ---------------------------------------------------------------------------

pub struct MetaStore {
    data_dir: PathBuf,
    ontology: Arc<Ontology>,
    files: Mutex<Connection>,
    emails: Mutex<Connection>,
    virtuals: Mutex<Connection>,
    common: Mutex<Connection>,
    in_transaction: AtomicBool,
}

fn open_db(path: &Path, schema: &str) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    // journal_mode returns the resulting mode as a row
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
    conn.execute_batch(schema)?;
    Ok(conn)
}

impl MetaStore {
    pub fn open(data_dir: &Path, ontology: Arc<Ontology>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            ontology,
            files: Mutex::new(open_db(&data_dir.join(FILE_META_DB), SERVICE_SCHEMA)?),
            emails: Mutex::new(open_db(&data_dir.join(EMAIL_META_DB), SERVICE_SCHEMA)?),
            virtuals: Mutex::new(open_db(&data_dir.join(VIRTUAL_META_DB), SERVICE_SCHEMA)?),
            common: Mutex::new(open_db(&data_dir.join(COMMON_DB), COMMON_SCHEMA)?),
            in_transaction: AtomicBool::new(false),
        })
    }

    fn conn(&self, store: StoreKind) -> MutexGuard<'_, Connection> {
        match store {
            StoreKind::Files => self.files.lock().unwrap(),
            StoreKind::Emails => self.emails.lock().unwrap(),
            StoreKind::Virtual => self.virtuals.lock().unwrap(),
        }
    }

    pub(crate) fn common(&self) -> MutexGuard<'_, Connection> {
        self.common.lock().unwrap()
    }

    fn store_for_class(&self, class_id: u32) -> Result<StoreKind, StoreError> {
        self.ontology
            .class_by_id(class_id)
            .map(|c| c.store)
            .ok_or_else(|| StoreError::UnknownClass(class_id.to_string()))
    }

    fn next_service_id(&self) -> Result<u64, StoreError> {
        let conn = self.common();
        conn.execute(
            "INSERT INTO sequences(name, value) VALUES('service_id', 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            [],
        )?;
        let id: i64 =
            conn.query_row("SELECT value FROM sequences WHERE name = 'service_id'", [], |r| {
                r.get(0)
            })?;
        Ok(id as u64)
    }

    // -- transactions -------------------------------------------------------

    /// Open the long-lived index transaction on the service stores.
    pub fn start_index_transaction(&self) -> Result<(), StoreError> {
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for store in [StoreKind::Files, StoreKind::Emails, StoreKind::Virtual] {
            self.conn(store).execute_batch("BEGIN IMMEDIATE")?;
        }
        trace!("index transaction started");
        Ok(())
    }

    /// Commit the index transaction if one is open.
    pub fn end_index_transaction(&self) -> Result<(), StoreError> {
        if !self.in_transaction.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for store in [StoreKind::Files, StoreKind::Emails, StoreKind::Virtual] {
            self.conn(store).execute_batch("COMMIT")?;
        }
        trace!("index transaction committed");
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    /// Commit and reopen the index transaction. Called by the
    /// scheduler's transaction regulator.
    pub fn regulate_transaction(&self) -> Result<(), StoreError> {
        if self.in_transaction() {
            self.end_index_transaction()?;
            self.start_index_transaction()?;
        }
        Ok(())
    }

    /// Close and reopen every connection, releasing statement caches.
    pub fn refresh_handles(&self) -> Result<(), StoreError> {
        self.end_index_transaction()?;
        debug!("refreshing database handles");
        let pairs: [(&Mutex<Connection>, &str, &str); 4] = [
            (&self.files, FILE_META_DB, SERVICE_SCHEMA),
            (&self.emails, EMAIL_META_DB, SERVICE_SCHEMA),
            (&self.virtuals, VIRTUAL_META_DB, SERVICE_SCHEMA),
            (&self.common, COMMON_DB, COMMON_SCHEMA),
        ];
        for (slot, name, schema) in pairs {
            let mut guard = slot.lock().unwrap();
            *guard = open_db(&self.data_dir.join(name), schema)?;
        }
        Ok(())
    }

    /// One-time statistics refresh after the first full index.
    pub fn analyze(&self) -> Result<(), StoreError> {
        info!("updating database statistics");
        for store in [StoreKind::Files, StoreKind::Emails, StoreKind::Virtual] {
            self.conn(store).execute_batch("ANALYZE")?;
        }
        Ok(())
    }

    // -- services -----------------------------------------------------------

    /// Insert a service row into the store its class dictates.
    pub fn insert_service(
        &self,
        path: &str,
        class_id: u32,
        mime: &str,
        mtime: i64,
        is_directory: bool,
        is_hidden: bool,
    ) -> Result<u64, StoreError> {
        let store = self.store_for_class(class_id)?;
        let id = self.next_service_id()?;
        let parent_id = self
            .lookup_service_in(store, &parent_path(path))
            .ok()
            .flatten()
            .map(|s| s.id)
            .unwrap_or(0);
        self.conn(store).execute(
            "INSERT INTO services(id, parent_id, path, class_id, mime, mtime, indextime, is_directory, is_hidden)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
            params![id as i64, parent_id as i64, path, class_id, mime, mtime, is_directory, is_hidden],
        )?;
        self.push_event(id, crate::journal::EventKind::Added)?;
        Ok(id)
    }

    fn row_to_service(row: &rusqlite::Row<'_>) -> rusqlite::Result<Service> {
        Ok(Service {
            id: row.get::<_, i64>(0)? as u64,
            parent_id: row.get::<_, i64>(1)? as u64,
            path: row.get(2)?,
            class_id: row.get(3)?,
            mime: row.get(4)?,
            mtime: row.get(5)?,
            indextime: row.get(6)?,
            is_directory: row.get(7)?,
            is_hidden: row.get(8)?,
            enabled: row.get(9)?,
        })
    }

    const SERVICE_COLS: &'static str =
        "id, parent_id, path, class_id, mime, mtime, indextime, is_directory, is_hidden, enabled";

    fn lookup_service_in(
        &self,
        store: StoreKind,
        path: &str,
    ) -> Result<Option<Service>, StoreError> {
        let conn = self.conn(store);
        let service = conn
            .query_row(
                &format!("SELECT {} FROM services WHERE path = ?1", Self::SERVICE_COLS),
                [path],
                Self::row_to_service,
            )
            .optional()?;
        Ok(service)
    }

    /// Find a service by path, searching the file, email and virtual
    /// stores in that order.
    pub fn lookup_service(&self, path: &str) -> Result<Option<Service>, StoreError> {
        for store in [StoreKind::Files, StoreKind::Emails, StoreKind::Virtual] {
            if let Some(s) = self.lookup_service_in(store, path)? {
                return Ok(Some(s));
            }
        }
        Ok(None)
    }

    /// Find a service by id across stores.
    pub fn service_by_id(&self, id: u64) -> Result<Option<(StoreKind, Service)>, StoreError> {
        for store in [StoreKind::Files, StoreKind::Emails, StoreKind::Virtual] {
            let found = self
                .conn(store)
                .query_row(
                    &format!("SELECT {} FROM services WHERE id = ?1", Self::SERVICE_COLS),
                    [id as i64],
                    Self::row_to_service,
                )
                .optional()?;
            if let Some(s) = found {
                return Ok(Some((store, s)));
            }
        }
        Ok(None)
    }

    /// Stamp mtime and indextime after a successful extraction.
    pub fn update_service_times(&self, id: u64, mtime: i64, indextime: i64) -> Result<(), StoreError> {
        let Some((store, _)) = self.service_by_id(id)? else {
            return Ok(());
        };
        self.conn(store).execute(
            "UPDATE services SET mtime = ?2, indextime = ?3 WHERE id = ?1",
            params![id as i64, mtime, indextime],
        )?;
        self.push_event(id, crate::journal::EventKind::Modified)?;
        Ok(())
    }

    /// Delete a service; a directory takes its children with it.
    /// Returns every deleted id.
    pub fn delete_service(&self, id: u64) -> Result<Vec<u64>, StoreError> {
        let Some((store, service)) = self.service_by_id(id)? else {
            return Ok(Vec::new());
        };
        let mut ids = vec![id];
        if service.is_directory {
            let prefix = format!("{}/%", service.path);
            let conn = self.conn(store);
            let mut stmt = conn.prepare("SELECT id FROM services WHERE path LIKE ?1")?;
            let children: Vec<i64> =
                stmt.query_map([&prefix], |r| r.get(0))?.collect::<Result<_, _>>()?;
            ids.extend(children.into_iter().map(|i| i as u64));
        }
        {
            let conn = self.conn(store);
            for sid in &ids {
                conn.execute("DELETE FROM services WHERE id = ?1", [*sid as i64])?;
                conn.execute("DELETE FROM service_properties WHERE service_id = ?1", [*sid as i64])?;
                conn.execute("DELETE FROM service_keywords WHERE service_id = ?1", [*sid as i64])?;
            }
        }
        for sid in &ids {
            self.push_event(*sid, crate::journal::EventKind::Removed)?;
        }
        Ok(ids)
    }

    /// Rename a single service row. Index time is untouched: a rename
    /// is not a content change.
    pub fn move_service(&self, old_path: &str, new_path: &str) -> Result<Option<u64>, StoreError> {
        let Some(service) = self.lookup_service(old_path)? else {
            return Ok(None);
        };
        let store = self.store_for_class(service.class_id)?;
        self.conn(store).execute(
            "UPDATE services SET path = ?2 WHERE id = ?1",
            params![service.id as i64, new_path],
        )?;
        self.push_event(service.id, crate::journal::EventKind::Modified)?;
        Ok(Some(service.id))
    }

    /// Rename a directory and rewrite every child path under it.
    pub fn move_directory(&self, old_path: &str, new_path: &str) -> Result<usize, StoreError> {
        let Some(service) = self.lookup_service(old_path)? else {
            return Ok(0);
        };
        let store = self.store_for_class(service.class_id)?;
        let mut moved = 0usize;
        {
            let conn = self.conn(store);
            conn.execute(
                "UPDATE services SET path = ?2 WHERE id = ?1",
                params![service.id as i64, new_path],
            )?;
            moved += 1;
            let prefix = format!("{}/%", old_path);
            let mut stmt = conn.prepare("SELECT id, path FROM services WHERE path LIKE ?1")?;
            let children: Vec<(i64, String)> = stmt
                .query_map([&prefix], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<_, _>>()?;
            for (cid, cpath) in children {
                let suffix = &cpath[old_path.len()..];
                conn.execute(
                    "UPDATE services SET path = ?2 WHERE id = ?1",
                    params![cid, format!("{new_path}{suffix}")],
                )?;
                moved += 1;
            }
        }
        self.push_event(service.id, crate::journal::EventKind::Modified)?;
        Ok(moved)
    }

    // -- properties and keywords -------------------------------------------

    pub fn set_properties(&self, id: u64, entries: &[(String, String)]) -> Result<(), StoreError> {
        let Some((store, _)) = self.service_by_id(id)? else {
            return Ok(());
        };
        {
            let conn = self.conn(store);
            for (property, value) in entries {
                conn.execute(
                    "DELETE FROM service_properties WHERE service_id = ?1 AND property = ?2",
                    params![id as i64, property],
                )?;
                conn.execute(
                    "INSERT INTO service_properties(service_id, property, value) VALUES (?1, ?2, ?3)",
                    params![id as i64, property, value],
                )?;
            }
        }
        self.push_event(id, crate::journal::EventKind::Modified)?;
        Ok(())
    }

    pub fn get_properties(&self, id: u64) -> Result<Vec<(String, String)>, StoreError> {
        let Some((store, _)) = self.service_by_id(id)? else {
            return Ok(Vec::new());
        };
        let conn = self.conn(store);
        let mut stmt = conn.prepare(
            "SELECT property, value FROM service_properties WHERE service_id = ?1 ORDER BY property",
        )?;
        let rows = stmt
            .query_map([id as i64], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    pub fn add_keyword(&self, id: u64, keyword: &str) -> Result<(), StoreError> {
        let Some((store, _)) = self.service_by_id(id)? else {
            return Ok(());
        };
        self.conn(store).execute(
            "INSERT OR IGNORE INTO service_keywords(service_id, keyword) VALUES (?1, ?2)",
            params![id as i64, keyword],
        )?;
        self.push_event(id, crate::journal::EventKind::Modified)?;
        Ok(())
    }

    pub fn remove_keyword(&self, id: u64, keyword: &str) -> Result<(), StoreError> {
        let Some((store, _)) = self.service_by_id(id)? else {
            return Ok(());
        };
        self.conn(store).execute(
            "DELETE FROM service_keywords WHERE service_id = ?1 AND keyword = ?2",
            params![id as i64, keyword],
        )?;
        self.push_event(id, crate::journal::EventKind::Modified)?;
        Ok(())
    }

    pub fn get_keywords(&self, id: u64) -> Result<Vec<String>, StoreError> {
        let Some((store, _)) = self.service_by_id(id)? else {
            return Ok(Vec::new());
        };
        let conn = self.conn(store);
        let mut stmt = conn.prepare(
            "SELECT keyword FROM service_keywords WHERE service_id = ?1 ORDER BY keyword",
        )?;
        let rows = stmt.query_map([id as i64], |r| r.get(0))?.collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Paths of currently indexed children of a directory, for
    /// detecting deletions during a re-check.
    pub fn files_in_folder(&self, path: &str) -> Result<Vec<(u64, String, bool)>, StoreError> {
        let like = format!("{}/%", path);
        let not_like = format!("{}/%/%", path);
        let conn = self.conn(StoreKind::Files);
        let mut stmt = conn.prepare(
            "SELECT id, path, is_directory FROM services WHERE path LIKE ?1 AND path NOT LIKE ?2",
        )?;
        let rows = stmt
            .query_map(params![like, not_like], |r| {
                Ok((r.get::<_, i64>(0)? as u64, r.get(1)?, r.get(2)?))
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Reset mtime for every service under a prefix so it is rechecked.
    pub fn reset_mtime_under(&self, store: StoreKind, prefix: &str) -> Result<usize, StoreError> {
        let like = format!("{}/%", prefix);
        let n = self
            .conn(store)
            .execute("UPDATE services SET mtime = 0 WHERE path LIKE ?1", [&like])?;
        Ok(n)
    }

    // -- options ------------------------------------------------------------

    pub fn has_option(&self, key: &str) -> Result<bool, StoreError> {
        let n: i64 = self.common().query_row(
            "SELECT COUNT(*) FROM options WHERE key = ?1",
            [key],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn get_option_int(&self, key: &str) -> Result<i64, StoreError> {
        let value: Option<String> = self
            .common()
            .query_row("SELECT value FROM options WHERE key = ?1", [key], |r| r.get(0))
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub fn set_option_int(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.common().execute(
            "INSERT INTO options(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    // -- pending queue ------------------------------------------------------

    /// Park a ticket in the persistent queue; it survives restarts.
    pub fn mark_pending(&self, info: &FileInfo) -> Result<(), StoreError> {
        self.common().execute(
            "INSERT INTO pending_files(file_id, uri, moved_to_uri, mime, action, is_directory, counter)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                info.file_id as i64,
                info.uri.to_string_lossy(),
                info.moved_to_uri.as_ref().map(|p| p.to_string_lossy().to_string()),
                info.mime,
                info.action.code(),
                info.is_directory,
                info.counter,
            ],
        )?;
        Ok(())
    }

    pub fn has_pending(&self) -> Result<bool, StoreError> {
        let n: i64 =
            self.common().query_row("SELECT COUNT(*) FROM pending_files", [], |r| r.get(0))?;
        Ok(n > 0)
    }

    /// Take up to `limit` pending tickets, removing them from the queue.
    pub fn take_pending_batch(&self, limit: usize) -> Result<Vec<FileInfo>, StoreError> {
        let conn = self.common();
        let mut stmt = conn.prepare(
            "SELECT id, file_id, uri, moved_to_uri, mime, action, is_directory, counter
             FROM pending_files ORDER BY id LIMIT ?1",
        )?;
        let rows: Vec<(i64, FileInfo)> = stmt
            .query_map([limit as i64], |r| {
                let row_id: i64 = r.get(0)?;
                let mut info = FileInfo::new(
                    PathBuf::from(r.get::<_, String>(2)?),
                    FileAction::from_code(r.get(5)?),
                );
                info.file_id = r.get::<_, i64>(1)? as u64;
                info.moved_to_uri = r.get::<_, Option<String>>(3)?.map(PathBuf::from);
                info.mime = r.get(4)?;
                info.is_directory = r.get(6)?;
                info.counter = r.get(7)?;
                Ok((row_id, info))
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        for (row_id, _) in &rows {
            conn.execute("DELETE FROM pending_files WHERE id = ?1", [row_id])?;
        }
        Ok(rows.into_iter().map(|(_, info)| info).collect())
    }
}

fn parent_path(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Update interpreter (batch execution surface)
// ---------------------------------------------------------------------------

/// One quad in the statement graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quad {
    pub graph: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// Parsed update operation after shape matching.
#[derive(Debug)]
pub enum UpdateOp {
    /// `DELETE WHERE { GRAPH <g> { <s> <p> ?o } }`
    ClearProperty { graph: String, subject: String, predicate: String },
    /// Quads to insert (from TriG payloads or `INSERT DATA`).
    Insert(Vec<Quad>),
}

impl MetaStore {
    /// Execute a list of parsed update operations atomically. On any
    /// error the transaction rolls back and the store is unchanged.
    pub fn perform_update(&self, ops: Vec<UpdateOp>) -> Result<(), StoreError> {
        let mut conn = self.common();
        let tx = conn.transaction()?;
        for op in ops {
            match op {
                UpdateOp::ClearProperty { graph, subject, predicate } => {
                    tx.execute(
                        "DELETE FROM statements WHERE graph = ?1 AND subject = ?2 AND predicate = ?3",
                        params![graph, subject, predicate],
                    )?;
                }
                UpdateOp::Insert(quads) => {
                    for q in quads {
                        tx.execute(
                            "INSERT INTO statements(graph, subject, predicate, object) VALUES (?1, ?2, ?3, ?4)",
                            params![q.graph, q.subject, q.predicate, q.object],
                        )?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Read the statement graph for a subject (test and query surface).
    pub fn statements_for(&self, subject: &str) -> Result<Vec<Quad>, StoreError> {
        let conn = self.common();
        let mut stmt = conn.prepare(
            "SELECT graph, subject, predicate, object FROM statements WHERE subject = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([subject], |r| {
                Ok(Quad {
                    graph: r.get(0)?,
                    subject: r.get(1)?,
                    predicate: r.get(2)?,
                    object: r.get(3)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}

/// Parse a raw SPARQL update into interpreter operations. Only the
/// shapes the batch layer generates are understood; anything else is a
/// `Parse` error for the caller's strictness policy to judge.
pub fn parse_sparql_update(text: &str) -> Result<Vec<UpdateOp>, StoreError> {
    let trimmed = text.trim();
    let delete_re = regex::Regex::new(
        r"(?s)^DELETE\s+WHERE\s*\{\s*(?:GRAPH\s*<([^>]*)>\s*\{)?\s*<([^>]*)>\s+(\S+)\s+\?\w+\s*\}?\s*\}$",
    )
    .unwrap();
    if let Some(caps) = delete_re.captures(trimmed) {
        return Ok(vec![UpdateOp::ClearProperty {
            graph: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
            subject: caps[2].to_string(),
            predicate: caps[3].trim_matches(['<', '>']).to_string(),
        }]);
    }
    let insert_re = regex::Regex::new(r"(?s)^INSERT\s+DATA\s*\{(.*)\}$").unwrap();
    if let Some(caps) = insert_re.captures(trimmed) {
        let quads = parse_trig(&caps[1])?;
        return Ok(vec![UpdateOp::Insert(quads)]);
    }
    Err(StoreError::Parse(format!("unsupported update shape: {}", truncate(trimmed, 80))))
}

fn truncate(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Parse the TriG subset the resource serializer emits: prefix
/// declarations, an optional GRAPH block, and subject blocks with
/// `;`-chained predicate/object pairs.
pub fn parse_trig(text: &str) -> Result<Vec<Quad>, StoreError> {
    let mut prefixes: Vec<(String, String)> = Vec::new();
    let mut quads = Vec::new();
    let mut graph = String::new();
    let mut subject: Option<String> = None;

    let expand = |prefixes: &[(String, String)], name: &str| -> String {
        if name.starts_with('<') && name.ends_with('>') {
            return name[1..name.len() - 1].to_string();
        }
        if let Some((prefix, local)) = name.split_once(':') {
            if let Some((_, iri)) = prefixes.iter().find(|(p, _)| p == prefix) {
                return format!("{iri}{local}");
            }
        }
        name.to_string()
    };

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("@prefix") {
            let rest = rest.trim().trim_end_matches('.').trim();
            if let Some((prefix, iri)) = rest.split_once(':') {
                let iri = iri.trim().trim_matches(['<', '>']);
                prefixes.push((prefix.trim().to_string(), iri.to_string()));
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("GRAPH") {
            let rest = rest.trim();
            if let Some(end) = rest.find('{') {
                graph = rest[..end].trim().trim_matches(['<', '>']).to_string();
            }
            continue;
        }
        if line == "}" {
            graph.clear();
            continue;
        }

        // Subject line: a bare identifier token
        if (line.starts_with('<') && line.ends_with('>')) || (line.starts_with("_:") && !line.contains(' ')) {
            subject = Some(expand(&prefixes, line));
            continue;
        }

        // Predicate/object line ending in ';' or '.'
        let Some(current) = subject.clone() else {
            return Err(StoreError::Parse(format!("statement before subject: {line}")));
        };
        let body = line.trim_end_matches([';', '.']).trim();
        let Some((predicate, object)) = body.split_once(char::is_whitespace) else {
            return Err(StoreError::Parse(format!("malformed statement: {line}")));
        };
        let object = object.trim();
        let object = if object.starts_with('"') {
            // Strip quotes and any datatype suffix
            let end = object.rfind('"').unwrap_or(object.len() - 1);
            unescape_literal(&object[1..end])
        } else {
            expand(&prefixes, object)
        };
        quads.push(Quad {
            graph: graph.clone(),
            subject: current,
            predicate: expand(&prefixes, predicate),
            object,
        });
        if line.ends_with('.') {
            subject = None;
        }
    }
    Ok(quads)
}

fn unescape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Skip-or-fail handling for an op that did not parse.
pub fn handle_parse_failure(e: StoreError, strict: bool) -> Result<(), StoreError> {
    if strict {
        Err(e)
    } else {
        warn!(error = %e, "skipping malformed update operation");
        Ok(())
    }
}
