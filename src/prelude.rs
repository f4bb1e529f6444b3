//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use trustsim::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{Result, TsimError};
pub use crate::core::ids::{FuzzRunId, ScenarioId};

// Signals
pub use crate::signal::calculator::TrustCalculator;
pub use crate::signal::model::{Review, ReviewSource, TrustMetrics};

// Scenarios
pub use crate::scenario::engine::ScenarioEngine;
pub use crate::scenario::event::{Event, EventExtension, EventKind, ExtensionRegistry};
pub use crate::scenario::model::{
    Scenario, ScenarioMeta, ScenarioOrigin, ScenarioState, ScenarioSummary, Snapshot,
};

// Fuzzing
pub use crate::fuzz::{
    CancelToken, FuzzBatchReport, FuzzBounds, FuzzRequest, FuzzRun, Invariant, Violation,
};

// Isolation
pub use crate::isolation::context::{EnvironmentContext, EnvironmentResolver};
pub use crate::isolation::guard::{Decision, DenialReason, SandboxId, Scope};

// Facade
pub use crate::simulator::{RunSummary, Simulator};
