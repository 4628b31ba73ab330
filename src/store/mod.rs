//! Durable document store backed by a single JSON file.
//!
//! The store is the sole authority for persisted state. Every mutation is a
//! full load-modify-save cycle executed under an internal write lock, so
//! cycles apply one at a time in arrival order and no partially-applied
//! mutation is ever observable. Writes land in a temporary file that is
//! atomically renamed over the canonical path, so readers never see a torn
//! document.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::errors::AppError;
use crate::models::{InventoryItem, InventoryPatch, Promo, PromoPatch, StoreDocument};

pub struct Store {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the backing file. A missing file, a parse error, or any I/O
    /// failure yields the empty document: the system always has usable state.
    pub async fn load(&self) -> StoreDocument {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(doc) => doc,
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), "Unreadable store file, starting empty: {}", err);
                    StoreDocument::default()
                }
            },
            Err(err) => {
                tracing::debug!(path = %self.path.display(), "No store file yet: {}", err);
                StoreDocument::default()
            }
        }
    }

    /// Persist the full document. Serialized against all other writers.
    pub async fn save(&self, doc: &StoreDocument) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        self.save_locked(doc).await
    }

    /// Merge patches into the inventory list by id and persist, returning the
    /// refreshed list. One atomic load-modify-save cycle for the whole batch.
    pub async fn upsert_inventory(
        &self,
        patches: &[InventoryPatch],
    ) -> Result<Vec<InventoryItem>, AppError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await;
        for patch in patches {
            doc.upsert_inventory(patch);
        }
        self.save_locked(&doc).await?;
        Ok(doc.inventory)
    }

    /// Remove an inventory item by id and persist. A missing id leaves the
    /// list unchanged.
    pub async fn delete_inventory(&self, id: &str) -> Result<Vec<InventoryItem>, AppError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await;
        doc.remove_inventory(id);
        self.save_locked(&doc).await?;
        Ok(doc.inventory)
    }

    /// Merge a promo patch by id and persist, returning the refreshed list.
    pub async fn upsert_promo(&self, patch: &PromoPatch) -> Result<Vec<Promo>, AppError> {
        let id = patch
            .id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AppError::Validation("Promo id is required".to_string()))?
            .to_string();

        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await;
        doc.upsert_promo(&id, patch);
        self.save_locked(&doc).await?;
        Ok(doc.promos)
    }

    /// Remove a promo by id and persist. A missing id leaves the list
    /// unchanged and is not an error.
    pub async fn delete_promo(&self, id: &str) -> Result<Vec<Promo>, AppError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await;
        doc.remove_promo(id);
        self.save_locked(&doc).await?;
        Ok(doc.promos)
    }

    /// Temp-write then atomic rename. Callers must hold the write lock.
    async fn save_locked(&self, doc: &StoreDocument) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|err| AppError::Store(format!("Serialize failed: {}", err)))?;

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
