//! State Management Module
//!
//! Execution state of a run, rebuilt from or advanced by its history.

mod mutable_state;

pub use mutable_state::{ExecutionStatus, MutableState};
