//! Lazy, restartable evaluation of an event list into snapshots.
//!
//! [`Replay`] is the single implementation of event application: the engine's
//! `run` drives it and persists each item, `replay` hands it straight to the
//! caller. Both therefore produce identical snapshots by construction.

use std::sync::Arc;

use crate::scenario::event::{Event, ExtensionRegistry, ReviewSet};
use crate::scenario::model::{RunFailure, Snapshot};
use crate::signal::calculator::TrustCalculator;

/// Iterator over the snapshots an event list produces.
///
/// Yields `Ok(snapshot)` per applied event and at most one `Err(failure)`,
/// after which it is exhausted. Cloning captures the current position.
#[derive(Debug, Clone)]
pub struct Replay {
    events: Arc<[Event]>,
    calculator: TrustCalculator,
    extensions: ExtensionRegistry,
    position: usize,
    set: ReviewSet,
    halted: bool,
}

impl Replay {
    #[must_use]
    pub fn new(
        events: impl Into<Arc<[Event]>>,
        calculator: TrustCalculator,
        extensions: ExtensionRegistry,
    ) -> Self {
        Self {
            events: events.into(),
            calculator,
            extensions,
            position: 0,
            set: ReviewSet::new(),
            halted: false,
        }
    }

    /// Rewind to the first event.
    pub fn restart(&mut self) {
        self.position = 0;
        self.set = ReviewSet::new();
        self.halted = false;
    }

    /// Fresh iterator over the same events, positioned at the start.
    #[must_use]
    pub fn restarted(&self) -> Self {
        let mut copy = self.clone();
        copy.restart();
        copy
    }

    /// Drain the remaining snapshots, stopping at the first failure.
    pub fn snapshots(self) -> (Vec<Snapshot>, Option<RunFailure>) {
        let mut out = Vec::with_capacity(self.events.len().saturating_sub(self.position));
        for item in self {
            match item {
                Ok(snapshot) => out.push(snapshot),
                Err(failure) => return (out, Some(failure)),
            }
        }
        (out, None)
    }
}

impl Iterator for Replay {
    type Item = Result<Snapshot, RunFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.halted {
            return None;
        }
        let index = self.position;
        let event = self.events.get(index)?;
        self.position += 1;

        if let Err(error) = self.set.apply(event, &self.extensions) {
            self.halted = true;
            return Some(Err(RunFailure {
                event_index: index,
                error,
            }));
        }

        let reviews = self.set.to_vec();
        let metrics = self.calculator.compute(&reviews);
        Some(Ok(Snapshot {
            index,
            reviews,
            metrics,
            created_at: event.at(),
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.halted {
            return (0, Some(0));
        }
        let remaining = self.events.len() - self.position;
        (0, Some(remaining))
    }
}

impl std::iter::FusedIterator for Replay {}
