//! Collaborator interfaces
//!
//! Narrow interfaces through which the engine reaches the outside world:
//! - Storage: artifact upload, download, URLs and deletion
//! - Persistence: job-owning entity records (trained models, photobooks,
//!   generated images)
//! - Notifiers: alert delivery channels
//!
//! The engine only depends on the traits. Reference implementations live
//! here (local filesystem storage, webhook and log notifiers) and in the
//! server crate (Postgres persistence).

mod notify;
mod persistence;
mod storage;

pub use notify::{LogNotifier, WebhookNotifier};
pub use persistence::{Persistence, PhotobookOutput, TrainingCommit};
pub use storage::{LocalStorage, Storage};
