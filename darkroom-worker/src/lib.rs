//! Darkroom Worker
//!
//! The job engine behind the Darkroom server.
//!
//! Architecture:
//! - Store: job records and per-type pending lists (Redis, or in-memory)
//! - Queue: job lifecycle on top of the store (enqueue, dequeue, status, retry)
//! - Remote: GPU instance provisioning and remote command execution
//! - Cache: size-bounded local cache for model weights
//! - Pool: self-scaling workers, the supervisor loop and alert fan-out
//! - Monitor: periodic metrics and pruning of old terminal jobs
//! - Handlers: training and generation jobs built from the pieces above
//! - Engine: the context that owns all of it and exposes the outward interface

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod remote;
pub mod shutdown;
pub mod store;
pub mod themes;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::Engine;
