//! Admin API Module
//!
//! Serves peer clusters over the framed transport: raw history reads,
//! task pushes, task generation for migration, and status.

mod admin;

pub use admin::{AdminService, AdminState};
