//! The persisted document: the full inventory and promo state as one unit.

use serde::{Deserialize, Serialize};

use super::{InventoryItem, InventoryPatch, Promo, PromoPatch};

/// The top-level persisted unit. Always deserializable: missing or malformed
/// lists collapse to empty via serde defaults, so the system always has a
/// usable state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub inventory: Vec<InventoryItem>,
    #[serde(default)]
    pub promos: Vec<Promo>,
}

impl StoreDocument {
    /// Merge a patch into the inventory list by id: shallow-merge an existing
    /// entry, or append a new record when the id is unknown.
    pub fn upsert_inventory(&mut self, patch: &InventoryPatch) {
        match self.inventory.iter_mut().find(|item| item.id == patch.id) {
            Some(item) => patch.apply_to(item),
            None => self.inventory.push(patch.materialize()),
        }
    }

    /// Replace-or-append a full item, as broadcast receivers do. The incoming
    /// record is authoritative and overrides any local state for that id.
    pub fn merge_inventory_item(&mut self, item: InventoryItem) {
        match self.inventory.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => self.inventory.push(item),
        }
    }

    /// Remove an item by id. Removing a missing id is a no-op.
    pub fn remove_inventory(&mut self, id: &str) {
        self.inventory.retain(|item| item.id != id);
    }

    /// Merge a patch into the promo list by id (requires the id to be set).
    pub fn upsert_promo(&mut self, id: &str, patch: &PromoPatch) {
        match self.promos.iter_mut().find(|promo| promo.id == id) {
            Some(promo) => patch.apply_to(promo),
            None => self.promos.push(patch.materialize(id)),
        }
    }

    /// Replace-or-append a full promo.
    pub fn merge_promo(&mut self, promo: Promo) {
        match self.promos.iter_mut().find(|p| p.id == promo.id) {
            Some(existing) => *existing = promo,
            None => self.promos.push(promo),
        }
    }

    /// Remove a promo by id. Removing a missing id is a no-op.
    pub fn remove_promo(&mut self, id: &str) {
        self.promos.retain(|promo| promo.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerant_deserialization() {
        let doc: StoreDocument = serde_json::from_str("{}").unwrap();
        assert!(doc.inventory.is_empty());
        assert!(doc.promos.is_empty());

        let doc: StoreDocument = serde_json::from_str(r#"{"inventory":[]}"#).unwrap();
        assert!(doc.promos.is_empty());
    }

    #[test]
    fn test_upsert_distinct_ids_grow_list_once_each() {
        let mut doc = StoreDocument::default();
        for id in ["a", "b", "c", "a", "b"] {
            let patch: InventoryPatch =
                serde_json::from_value(serde_json::json!({ "id": id, "quantity": 1 })).unwrap();
            doc.upsert_inventory(&patch);
        }
        // Re-upserting an existing id must not grow the list
        assert_eq!(doc.inventory.len(), 3);
    }

    #[test]
    fn test_remove_missing_id_is_noop() {
        let mut doc = StoreDocument::default();
        doc.remove_promo("missing");
        doc.remove_inventory("missing");
        assert!(doc.promos.is_empty());
        assert!(doc.inventory.is_empty());
    }
}
