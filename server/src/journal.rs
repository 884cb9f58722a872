//! Event journal: row-level deltas consumed by live-query matchers.
//!
//! Every façade mutation that touches a live-query-visible row appends
//! an event. Consumers poll with [`MetaStore::take_events`], which
//! deletes what it returns; the matcher only polls while the indexer is
//! idle, since during indexing the word cache is the authoritative
//! producer.

use crate::error::StoreError;
use crate::store::MetaStore;
use rusqlite::params;

/// What happened to the row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Removed,
    Modified,
}

impl EventKind {
    fn code(&self) -> i64 {
        match self {
            EventKind::Added => 1,
            EventKind::Removed => 2,
            EventKind::Modified => 3,
        }
    }

    fn from_code(code: i64) -> Self {
        match code {
            1 => EventKind::Added,
            2 => EventKind::Removed,
            _ => EventKind::Modified,
        }
    }
}

/// One journal row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub seq: u64,
    pub service_id: u64,
    pub kind: EventKind,
}

impl MetaStore {
    /// Append an event row for a mutated service.
    pub fn push_event(&self, service_id: u64, kind: EventKind) -> Result<(), StoreError> {
        self.common().execute(
            "INSERT INTO events(service_id, kind) VALUES (?1, ?2)",
            params![service_id as i64, kind.code()],
        )?;
        Ok(())
    }

    /// Consume up to `limit` events in sequence order, deleting them.
    pub fn take_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let conn = self.common();
        let mut stmt = conn
            .prepare("SELECT seq, service_id, kind FROM events ORDER BY seq LIMIT ?1")?;
        let events: Vec<Event> = stmt
            .query_map([limit as i64], |r| {
                Ok(Event {
                    seq: r.get::<_, i64>(0)? as u64,
                    service_id: r.get::<_, i64>(1)? as u64,
                    kind: EventKind::from_code(r.get(2)?),
                })
            })?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        for event in &events {
            conn.execute("DELETE FROM events WHERE seq = ?1", [event.seq as i64])?;
        }
        Ok(events)
    }

    pub fn event_count(&self) -> Result<usize, StoreError> {
        let n: i64 = self.common().query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}
