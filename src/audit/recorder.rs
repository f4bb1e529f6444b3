//! Audit recorder: a dedicated thread that drains a bounded channel into a sink.
//!
//! Callers hold an [`AuditHandle`] and never block: `record()` uses
//! `try_send()`, and a full channel drops the entry and bumps a counter. The
//! thread reports the drop count as its own entry the next time it wakes.
//! Sink errors divert the entry to a fallback JSONL writer (file, then stderr,
//! then discard); after repeated failures the sink is bypassed entirely.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::audit::entry::AuditEntry;
use crate::audit::jsonl::{JsonlConfig, JsonlWriter};
use crate::audit::sink::AuditSink;
use crate::core::config::AuditConfig;
use crate::core::errors::{Result, TsimError};

/// Consecutive sink failures before the sink is bypassed.
const SINK_FAILURE_LIMIT: u32 = 3;

/// How long `flush()` waits for the recorder thread.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

enum AuditMessage {
    Entry(Box<AuditEntry>),
    Flush(Sender<()>),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    /// Drops not yet reported by the recorder thread.
    pending_dropped: AtomicU64,
    total_dropped: AtomicU64,
    recorded: AtomicU64,
    diverted: AtomicU64,
}

/// Point-in-time recorder counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct AuditStats {
    /// Entries written by the primary sink.
    pub recorded: u64,
    /// Entries sent to the fallback writer after a sink failure.
    pub diverted: u64,
    /// Entries lost to channel back-pressure or a closed recorder.
    pub dropped: u64,
}

// ──────────────────── handle ────────────────────

/// Cheaply cloneable, non-blocking sender of audit entries.
#[derive(Clone)]
pub struct AuditHandle {
    tx: Option<Sender<AuditMessage>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for AuditHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditHandle")
            .field("enabled", &self.tx.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

impl AuditHandle {
    /// Handle that discards every entry. For contexts without an audit trail.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Fire-and-forget. Never blocks and never fails the caller.
    pub fn record(&self, entry: AuditEntry) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(AuditMessage::Entry(Box::new(entry))) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.counters.pending_dropped.fetch_add(1, Ordering::Relaxed);
                self.counters.total_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Block until every entry sent so far has reached the sink.
    ///
    /// Returns `false` if the recorder is gone or did not answer in time.
    pub fn flush(&self) -> bool {
        let Some(tx) = &self.tx else {
            return true;
        };
        let (ack_tx, ack_rx) = bounded(1);
        if tx
            .send_timeout(AuditMessage::Flush(ack_tx), FLUSH_TIMEOUT)
            .is_err()
        {
            return false;
        }
        ack_rx.recv_timeout(FLUSH_TIMEOUT).is_ok()
    }

    #[must_use]
    pub fn stats(&self) -> AuditStats {
        AuditStats {
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            diverted: self.counters.diverted.load(Ordering::Relaxed),
            dropped: self.counters.total_dropped.load(Ordering::Relaxed),
        }
    }
}

// ──────────────────── configuration ────────────────────

/// Options for spawning the recorder.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub channel_capacity: usize,
    /// Fallback file for diverted entries; stderr when `None`.
    pub fallback_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self::from(&AuditConfig::default())
    }
}

impl From<&AuditConfig> for RecorderConfig {
    fn from(cfg: &AuditConfig) -> Self {
        Self {
            channel_capacity: cfg.channel_capacity,
            fallback_path: cfg.fallback_path.clone(),
            max_size_bytes: cfg.max_size_bytes,
            max_rotated_files: cfg.max_rotated_files,
        }
    }
}

impl RecorderConfig {
    fn fallback_writer(&self) -> JsonlWriter {
        self.fallback_path.as_ref().map_or_else(JsonlWriter::stderr_only, |path| {
            JsonlWriter::open(JsonlConfig {
                path: path.clone(),
                fallback_path: None,
                max_size_bytes: self.max_size_bytes,
                max_rotated_files: self.max_rotated_files,
            })
        })
    }
}

// ──────────────────── recorder ────────────────────

/// Owner of the recorder thread.
pub struct AuditRecorder {
    handle: AuditHandle,
    join: Option<thread::JoinHandle<()>>,
}

impl AuditRecorder {
    /// Spawn the recorder thread draining into `sink`.
    pub fn spawn(sink: Box<dyn AuditSink>, config: &RecorderConfig) -> Result<Self> {
        let (tx, rx) = bounded::<AuditMessage>(config.channel_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let thread_counters = Arc::clone(&counters);
        let fallback = config.fallback_writer();

        let join = thread::Builder::new()
            .name("tsim-audit".to_string())
            .spawn(move || recorder_main(&rx, sink, fallback, &thread_counters))
            .map_err(|e| TsimError::Runtime {
                details: format!("failed to spawn audit recorder thread: {e}"),
            })?;

        Ok(Self {
            handle: AuditHandle {
                tx: Some(tx),
                counters,
            },
            join: Some(join),
        })
    }

    #[must_use]
    pub fn handle(&self) -> AuditHandle {
        self.handle.clone()
    }

    /// Drain outstanding entries, stop the thread, and wait for it.
    pub fn shutdown(mut self) -> AuditStats {
        self.stop();
        self.handle.stats()
    }

    fn stop(&mut self) {
        if let Some(join) = self.join.take() {
            if let Some(tx) = &self.handle.tx {
                let _ = tx.send(AuditMessage::Shutdown);
            }
            if join.join().is_err() {
                eprintln!("[TSIM-AUDIT] recorder thread panicked");
            }
        }
    }
}

impl Drop for AuditRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

// ──────────────────── recorder thread ────────────────────

fn recorder_main(
    rx: &Receiver<AuditMessage>,
    mut sink: Box<dyn AuditSink>,
    mut fallback: JsonlWriter,
    counters: &Counters,
) {
    let mut failures: u32 = 0;
    let mut bypassed = false;

    let mut write = |entry: &AuditEntry, sink: &mut Box<dyn AuditSink>| {
        if !bypassed {
            match sink.record(entry) {
                Ok(()) => {
                    failures = 0;
                    counters.recorded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= SINK_FAILURE_LIMIT {
                        eprintln!(
                            "[TSIM-AUDIT] {} sink failed {failures} times, bypassing: {e}",
                            sink.name()
                        );
                        bypassed = true;
                    }
                }
            }
        }
        fallback.write_entry(entry);
        fallback.flush();
        counters.diverted.fetch_add(1, Ordering::Relaxed);
    };

    while let Ok(message) = rx.recv() {
        let dropped = counters.pending_dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            write(&AuditEntry::dropped(dropped), &mut sink);
        }

        match message {
            AuditMessage::Entry(entry) => write(entry.as_ref(), &mut sink),
            AuditMessage::Flush(ack) => {
                let _ = sink.flush();
                let _ = ack.send(());
            }
            AuditMessage::Shutdown => break,
        }
    }

    // Entries queued behind the shutdown request still get written.
    while let Ok(message) = rx.try_recv() {
        if let AuditMessage::Entry(entry) = message {
            write(entry.as_ref(), &mut sink);
        }
    }
    let _ = sink.flush();
}
