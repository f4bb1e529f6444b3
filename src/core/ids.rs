//! Typed identifiers for scenarios and fuzz runs.
//!
//! Ids are derived from wall-clock time, the process id, and a per-generator
//! counter. No random source is involved, so the scenario engine stays free of
//! RNG calls.

#![allow(missing_docs)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Wrap an existing id (e.g. one read back from storage or the CLI).
            #[must_use]
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(ScenarioId, "scn");
string_id!(FuzzRunId, "fzr");

/// Process-unique id source.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scenario_id(&self) -> ScenarioId {
        ScenarioId::new(self.next(ScenarioId::PREFIX))
    }

    #[must_use]
    pub fn fuzz_run_id(&self) -> FuzzRunId {
        FuzzRunId::new(self.next(FuzzRunId::PREFIX))
    }

    fn next(&self, prefix: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let micros = chrono::Utc::now().timestamp_micros();
        format!("{prefix}-{micros:x}-{:x}-{seq:04x}", std::process::id())
    }
}
