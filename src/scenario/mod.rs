//! Scenarios: events, snapshots, replay, and the engine that runs them.

pub mod delta;
pub mod engine;
pub mod event;
pub mod model;
pub mod replay;
