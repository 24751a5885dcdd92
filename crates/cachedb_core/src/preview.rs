//! Sample data for previews and demos.

use crate::error::CoreResult;
use crate::inventory::{Inventory, NewItem, NewStorageRoot};
use crate::types::EntityId;

/// Name of the preview storage root.
pub const PREVIEW_ROOT: &str = "Preview";

/// Writes the preview data set into `inventory` and returns the root id.
///
/// The set is one storage root holding ten items `Test 0` to `Test 9`, a
/// box `A` holding `Test With Box`, and a tag `Clothing`.
///
/// # Errors
///
/// Fails if a commit fails.
pub async fn seed(inventory: &Inventory) -> CoreResult<EntityId> {
    let root = inventory
        .create_storage_root(NewStorageRoot::new(PREVIEW_ROOT))
        .await?;
    for i in 0..10 {
        inventory
            .create_item(NewItem::new(format!("Test {i}")).in_root(root))
            .await?;
    }
    let storage_box = inventory.create_box(root, "A").await?;
    inventory
        .create_item(NewItem::new("Test With Box").in_root(root).in_box(storage_box))
        .await?;
    inventory.create_tag("Clothing", None).await?;
    tracing::debug!(%root, "preview data seeded");
    Ok(root)
}

impl Inventory {
    /// An in-memory store seeded with [`seed`].
    ///
    /// # Errors
    ///
    /// Only fails if the runtime cannot run the open task.
    pub async fn preview() -> CoreResult<Self> {
        let inventory = Self::in_memory().await?;
        seed(&inventory).await?;
        Ok(inventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;

    #[tokio::test]
    async fn preview_matches_the_sample_set() {
        let inventory = Inventory::preview().await.unwrap();
        let snapshot = inventory.snapshot();
        let roots = snapshot.storage_roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name, PREVIEW_ROOT);

        let items = snapshot.items_in(&roots[0].id);
        assert_eq!(items.len(), 11);
        let boxed: Vec<_> = items.iter().filter(|i| i.storage_box.is_some()).collect();
        assert_eq!(boxed.len(), 1);
        assert_eq!(boxed[0].name, "Test With Box");

        let boxes = snapshot.boxes_in(&roots[0].id);
        assert_eq!(boxes[0].name, "A");
        assert_eq!(snapshot.items_in_box(&boxes[0].id).len(), 1);
        assert_eq!(snapshot.tags()[0].name, "Clothing");
        assert_eq!(snapshot.count(EntityKind::Tag), 1);
        assert_eq!(inventory.persistence().store().pending_len(), 0);
    }
}
