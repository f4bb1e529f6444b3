#![forbid(unsafe_code)]

//! Trust simulation and fuzzing engine (tsim).
//!
//! Scenarios are ordered lists of review events. Running one applies each
//! event to a review set and persists a [`Snapshot`](scenario::model::Snapshot)
//! of the computed trust metrics after every step; replaying it recomputes
//! the identical timeline. The fuzz harness generates random-but-valid
//! scenarios from a seed and checks invariant predicates against every
//! snapshot. An isolation guard keeps sandbox and production data apart and
//! confines fuzzing to sandboxes.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use trustsim::prelude::*;
//!
//! let sim = Simulator::in_memory(Config::default())?;
//! let ctx = EnvironmentContext::sandbox("me", SandboxId::parse("scratch")?);
//! let runs = sim.run_fuzz_batch(&ctx, 100, FuzzBounds::with_max_events(10))?;
//! # Ok::<(), TsimError>(())
//! ```

pub mod prelude;

pub mod audit;
pub mod core;
pub mod fuzz;
pub mod isolation;
pub mod scenario;
pub mod signal;
pub mod simulator;
pub mod store;
