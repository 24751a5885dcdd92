//! # cachedb sync protocol
//!
//! Wire types exchanged between a device and its remote zone.
//!
//! This crate provides:
//! - [`SyncChange`], one row of the batch schema
//! - [`ChangeBatch`], an ordered run of rows
//! - Push, pull and erase requests with their acknowledgements
//! - [`SyncMessage`], a tagged envelope over all of them
//!
//! Everything encodes to canonical CBOR through [`cachedb_codec`]. This is
//! a pure protocol crate with no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod messages;

pub use change::{ChangeBatch, SyncChange};
pub use messages::{
    EraseAck, EraseRequest, PullRequest, PullResponse, PushAck, PushRequest, SyncMessage,
};

pub use cachedb_codec::{CodecError, CodecResult, Decode, Encode};
