//! Inventory item model matching the storefront InventoryItem interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single sellable unit: one color variant of one model.
///
/// `quantity` and `is_available` are independent flags; a unit with zero stock
/// may still be listed as available (incoming shipment) and vice versa. Both
/// must be checked to decide sellability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub color_name: String,
    #[serde(default)]
    pub color_hex: String,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub is_available: bool,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

/// Partial update for an inventory item, keyed by id.
///
/// Fields left out of the request are preserved on the existing record
/// (shallow merge). Upserting an unknown id materializes a new record from
/// whatever fields the patch carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryPatch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_available: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl InventoryPatch {
    /// Shallow-merge this patch into an existing item.
    ///
    /// Setting `quantity` always refreshes `last_updated` to server time.
    pub fn apply_to(&self, item: &mut InventoryItem) {
        if let Some(model_id) = &self.model_id {
            item.model_id = model_id.clone();
        }
        if let Some(color_name) = &self.color_name {
            item.color_name = color_name.clone();
        }
        if let Some(color_hex) = &self.color_hex {
            item.color_hex = color_hex.clone();
        }
        if let Some(is_available) = self.is_available {
            item.is_available = is_available;
        }
        if let Some(quantity) = self.quantity {
            item.quantity = quantity;
            item.last_updated = Utc::now();
        } else if let Some(last_updated) = self.last_updated {
            item.last_updated = last_updated;
        }
    }

    /// Build a fresh item for an id not present in the store.
    pub fn materialize(&self) -> InventoryItem {
        let mut item = InventoryItem {
            id: self.id.clone(),
            model_id: String::new(),
            color_name: String::new(),
            color_hex: String::new(),
            quantity: 0,
            is_available: false,
            last_updated: Utc::now(),
        };
        self.apply_to(&mut item);
        item
    }
}
