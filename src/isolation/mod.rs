//! Isolation guard: sandbox/production scoping for every engine operation.

pub mod context;
pub mod guard;
