//! Append-only audit trail for mutating operations.

pub mod entry;
pub mod jsonl;
pub mod recorder;
pub mod sink;

use crate::core::config::{AuditSinkKind, Config};
use crate::core::errors::Result;

pub use entry::{AuditAction, AuditEntry};
pub use recorder::{AuditHandle, AuditRecorder, AuditStats, RecorderConfig};
pub use sink::{AuditSink, JsonlAuditSink, MemoryAuditSink};

/// Build the sink selected by `audit.sink`.
pub fn open_sink(config: &Config) -> Result<Box<dyn AuditSink>> {
    match config.audit.sink {
        AuditSinkKind::Jsonl => Ok(Box::new(JsonlAuditSink::open(
            jsonl::JsonlConfig::from_config(config),
        ))),
        #[cfg(feature = "sqlite")]
        AuditSinkKind::Sqlite => Ok(Box::new(sink::SqliteAuditSink::open(
            &config.paths.sqlite_db,
        )?)),
        #[cfg(not(feature = "sqlite"))]
        AuditSinkKind::Sqlite => {
            eprintln!("[TSIM-AUDIT] sqlite sink requested but feature disabled, using jsonl");
            Ok(Box::new(JsonlAuditSink::open(
                jsonl::JsonlConfig::from_config(config),
            )))
        }
    }
}
