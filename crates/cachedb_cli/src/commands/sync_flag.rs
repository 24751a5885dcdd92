//! Sync flag command implementation.

use cachedb_core::Inventory;
use std::path::Path;

/// What to do with the flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Turn sync on.
    Enable,
    /// Turn sync off.
    Disable,
    /// Report only.
    Status,
}

/// Runs the sync command.
pub async fn run(path: &Path, action: Action) -> Result<(), Box<dyn std::error::Error>> {
    let (inventory, _) = super::open_existing(path).await?;
    apply(&inventory, action).await?;
    let persistence = inventory.persistence();
    let cursor = persistence.cursor();
    println!(
        "sync: {}",
        if persistence.sync_enabled() { "enabled" } else { "disabled" }
    );
    println!("  sent seq:      {}", cursor.sent_seq);
    println!("  remote cursor: {}", cursor.remote);
    println!("  unsent:        {}", persistence.unsent_len());
    Ok(())
}

/// Persists the flag change, if any.
pub async fn apply(inventory: &Inventory, action: Action) -> cachedb_core::CoreResult<()> {
    match action {
        Action::Enable => inventory.set_sync_enabled(true).await,
        Action::Disable => inventory.set_sync_enabled(false).await,
        Action::Status => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachedb_core::Config;
    use tempfile::tempdir;

    #[tokio::test]
    async fn flag_persists_across_opens() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        drop(Inventory::open(Config::directory(&path)).await.unwrap());

        for (action, expected) in [
            (Action::Enable, true),
            (Action::Status, true),
            (Action::Disable, false),
        ] {
            let (inventory, _) = crate::commands::open_existing(&path).await.unwrap();
            apply(&inventory, action).await.unwrap();
            drop(inventory);
            let (inventory, _) = crate::commands::open_existing(&path).await.unwrap();
            assert_eq!(inventory.sync_enabled(), expected);
        }
    }
}
