//! Data models shared by the store, the hub, and the sync agent.
//!
//! All wire types serialize with camelCase field names to match the storefront contract.

mod document;
mod envelope;
mod inventory;
mod promo;

pub use document::*;
pub use envelope::*;
pub use inventory::*;
pub use promo::*;

use serde::Deserialize;

/// Accepts either a single value or a batch in one request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}
