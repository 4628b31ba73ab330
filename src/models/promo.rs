//! Promotion model matching the storefront PromoData interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A promotion spanning one or more models, valid within a date window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promo {
    pub id: String,
    #[serde(default)]
    pub model_ids: Vec<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub freebies: Vec<String>,
    #[serde(default = "Utc::now")]
    pub start_date: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub is_active: bool,
}

impl Promo {
    /// A promo is currently active for a model iff the active flag is set,
    /// `now` falls inside the date window, and the model is covered.
    pub fn is_active_for(&self, model_id: &str, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.start_date <= now
            && self.end_date >= now
            && self.model_ids.iter().any(|m| m == model_id)
    }
}

/// Partial update for a promo, keyed by id. A missing id means the server
/// assigns one (promo creation through the add path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freebies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl PromoPatch {
    /// Fill in a generated id when the caller did not supply one.
    pub fn ensure_id(mut self) -> Self {
        let missing = self.id.as_deref().map_or(true, |id| id.trim().is_empty());
        if missing {
            self.id = Some(uuid::Uuid::new_v4().to_string());
        }
        self
    }

    /// Shallow-merge this patch into an existing promo.
    pub fn apply_to(&self, promo: &mut Promo) {
        if let Some(model_ids) = &self.model_ids {
            promo.model_ids = model_ids.clone();
        }
        if let Some(title) = &self.title {
            promo.title = title.clone();
        }
        if let Some(description) = &self.description {
            promo.description = description.clone();
        }
        if let Some(freebies) = &self.freebies {
            promo.freebies = freebies.clone();
        }
        if let Some(start_date) = self.start_date {
            promo.start_date = start_date;
        }
        if let Some(end_date) = self.end_date {
            promo.end_date = end_date;
        }
        if let Some(is_active) = self.is_active {
            promo.is_active = is_active;
        }
    }

    /// Build a fresh promo for an id not present in the store.
    pub fn materialize(&self, id: &str) -> Promo {
        let mut promo = Promo {
            id: id.to_string(),
            model_ids: Vec::new(),
            title: String::new(),
            description: String::new(),
            freebies: Vec::new(),
            start_date: Utc::now(),
            end_date: Utc::now(),
            is_active: false,
        };
        self.apply_to(&mut promo);
        promo
    }
}
