//! Signal model and the pure trust score calculator.

pub mod calculator;
pub mod model;
