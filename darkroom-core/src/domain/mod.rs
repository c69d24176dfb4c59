//! Core domain types
//!
//! These types are shared between the engine (which persists and mutates them)
//! and the client/CLI (which only read them).

pub mod alert;
pub mod artifact;
pub mod instance;
pub mod job;
pub mod metrics;
pub mod worker;
