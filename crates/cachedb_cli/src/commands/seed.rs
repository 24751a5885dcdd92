//! Seed-preview command implementation.

use cachedb_core::{seed_preview, Config, Inventory};
use std::path::Path;

/// Runs the seed-preview command.
pub async fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let inventory = Inventory::open(Config::directory(path)).await?;
    let root = seed_preview(&inventory).await?;
    let snapshot = inventory.snapshot();
    println!(
        "seeded storage root {root}: {} items, {} boxes, {} tags",
        snapshot.items_in(&root).len(),
        snapshot.boxes_in(&root).len(),
        snapshot.tags().len()
    );
    Ok(())
}
