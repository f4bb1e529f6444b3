//! Audit sink backends.

#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;

use crate::audit::entry::AuditEntry;
use crate::audit::jsonl::{JsonlConfig, JsonlWriter};
use crate::core::errors::Result;

/// Destination for audit entries. Owned by the recorder thread.
///
/// An `Err` diverts the entry to the recorder's fallback writer; it is never
/// surfaced to the operation being audited.
pub trait AuditSink: Send {
    fn name(&self) -> &'static str;

    fn record(&mut self, entry: &AuditEntry) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// ──────────────────── JSONL ────────────────────

/// JSONL file sink. The writer degrades internally, so this never errors.
pub struct JsonlAuditSink {
    writer: JsonlWriter,
}

impl JsonlAuditSink {
    pub fn open(config: JsonlConfig) -> Self {
        Self {
            writer: JsonlWriter::open(config),
        }
    }
}

impl AuditSink for JsonlAuditSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn record(&mut self, entry: &AuditEntry) -> Result<()> {
        self.writer.write_entry(entry);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.sync();
        Ok(())
    }
}

// ──────────────────── memory ────────────────────

/// In-memory sink. Clones share the same buffer, so one clone can be handed to
/// the recorder and another kept for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn record(&mut self, entry: &AuditEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

// ──────────────────── SQLite ────────────────────

#[cfg(feature = "sqlite")]
pub use sqlite_sink::SqliteAuditSink;

#[cfg(feature = "sqlite")]
mod sqlite_sink {
    use std::path::Path;

    use rusqlite::{Connection, params};

    use super::AuditSink;
    use crate::audit::entry::AuditEntry;
    use crate::core::errors::{Result, TsimError};

    /// `audit_log` table in a WAL-mode SQLite database.
    pub struct SqliteAuditSink {
        conn: Connection,
    }

    impl SqliteAuditSink {
        pub fn open(path: &Path) -> Result<Self> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| TsimError::io(parent, source))?;
            }
            let conn = Connection::open(path)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;
                 CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    actor_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    resource TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    metadata TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);",
            )?;
            Ok(Self { conn })
        }

        /// Number of stored entries (diagnostics and tests).
        pub fn count(&self) -> Result<i64> {
            Ok(self
                .conn
                .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?)
        }
    }

    impl AuditSink for SqliteAuditSink {
        fn name(&self) -> &'static str {
            "sqlite"
        }

        fn record(&mut self, entry: &AuditEntry) -> Result<()> {
            self.conn
                .prepare_cached(
                    "INSERT INTO audit_log (timestamp, actor_id, action, resource, scope, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?
                .execute(params![
                    entry.timestamp_rfc3339(),
                    entry.actor_id,
                    entry.action.as_str(),
                    entry.resource,
                    entry.scope.to_string(),
                    serde_json::to_string(&entry.metadata)?,
                ])?;
            Ok(())
        }
    }

}
