//! # cachedb storage
//!
//! Byte-store backends underneath the cachedb journal.
//!
//! A backend knows nothing about frames, entities, or sync. It offers
//! positional reads, appends, durability barriers, and truncation, and the
//! journal in `cachedb_core` owns every byte of format interpretation.
//!
//! ## Backends
//!
//! - [`InMemoryBackend`] for ephemeral and preview stores
//! - [`FileBackend`] for a journal file on disk
//! - [`FaultyBackend`] wraps another backend and fails on command, used to
//!   exercise commit-failure paths
//!
//! ```rust
//! use cachedb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let at = backend.append(b"frame").unwrap();
//! assert_eq!(backend.read_at(at, 5).unwrap(), b"frame");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod faulty;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use faulty::{FaultPlan, FaultyBackend};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
