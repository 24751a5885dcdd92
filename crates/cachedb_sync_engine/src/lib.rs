//! # cachedb sync engine
//!
//! Keeps a device's inventory in step with a remote record zone.
//!
//! This crate provides:
//! - The [`RemoteStore`] service abstraction and an in-process
//!   [`MemoryRemote`]
//! - [`SyncEngine`] with its state machine (idle → pulling → pushing → synced)
//! - Cancellation that never advances a cursor past unfinished work
//! - Retry with exponential backoff
//! - A background loop driven by commits and an optional interval
//! - The separate, destructive remote-zone erase
//!
//! ## Key invariants
//!
//! - Pull always happens before push
//! - With the sync flag off, no batch is built and no remote call is made
//! - Merging is idempotent, so re-delivered pages are harmless
//! - Cursors are persisted only after the page they cover has been applied

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod convert;
mod engine;
mod error;
mod remote;

pub use config::{RetryConfig, SyncConfig};
pub use convert::{from_sync, to_sync};
pub use engine::{SyncEngine, SyncOutcome, SyncReport, SyncState, SyncStats};
pub use error::{SyncError, SyncResult};
pub use remote::{MemoryRemote, RemoteStore};
