//! Fuzz harness: seeded generation, invariant checking, reproducible runs.

pub mod cancel;
pub mod generator;
pub mod harness;
pub mod invariants;
pub mod run;

pub use cancel::CancelToken;
pub use generator::{EventGenerator, FuzzBounds, derive_seed, reproduce};
pub use harness::{AbortedIteration, FuzzBatchReport, FuzzHarness, FuzzRequest};
pub use invariants::{Invariant, InvariantInput, Violation, default_invariants};
pub use run::FuzzRun;
