//! CLI command implementations.

pub mod dump_journal;
pub mod inspect;
pub mod seed;
pub mod sync_flag;

use cachedb_core::{Config, Inventory, RecoveryReport};
use std::path::Path;

/// Opens an existing store. Recovery may drop a torn journal tail.
pub async fn open_existing(
    path: &Path,
) -> Result<(Inventory, RecoveryReport), Box<dyn std::error::Error>> {
    let config = Config::directory(path).create_if_missing(false);
    Ok(Inventory::open_with_report(config).await?)
}
