//! HTTP surface mirroring the realtime operations.
//!
//! Serves clients that cannot hold a persistent connection: reads come from
//! the hub's mirror, writes run the same store-upsert-then-broadcast path as
//! socket mutations (with no origin exclusion, since the writer holds no open
//! connection).

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::hub::{DetailedStats, HealthStats};
use crate::models::{InventoryPatch, OneOrMany, Promo, PromoPatch, StoreDocument};
use crate::AppState;

/// `?id=` query for delete endpoints.
#[derive(Debug, Deserialize)]
pub struct IdParams {
    #[serde(default)]
    pub id: String,
}

/// Response body for promo endpoints.
#[derive(Debug, Serialize)]
pub struct PromoList {
    pub promos: Vec<Promo>,
}

/// GET /inventory - the full document.
pub async fn get_inventory(State(state): State<AppState>) -> Json<StoreDocument> {
    Json(state.hub.document().await)
}

/// POST /inventory - upsert a single item or a batch, broadcast to all open
/// connections, and return the refreshed document.
pub async fn post_inventory(
    State(state): State<AppState>,
    Json(body): Json<OneOrMany<InventoryPatch>>,
) -> Result<Json<StoreDocument>, AppError> {
    let doc = state.hub.apply_inventory(body.into_vec(), None).await?;
    Ok(Json(doc))
}

/// DELETE /inventory?id= - remove an item by id.
pub async fn delete_inventory(
    State(state): State<AppState>,
    Query(params): Query<IdParams>,
) -> Result<Json<StoreDocument>, AppError> {
    if params.id.trim().is_empty() {
        return Err(AppError::Validation("Missing id".to_string()));
    }
    let doc = state.hub.remove_inventory(&params.id, None).await?;
    Ok(Json(doc))
}

/// GET /promo - just the promo list.
pub async fn get_promos(State(state): State<AppState>) -> Json<PromoList> {
    Json(PromoList {
        promos: state.hub.document().await.promos,
    })
}

/// POST /promo - upsert one promo (id assigned server-side when absent).
pub async fn post_promo(
    State(state): State<AppState>,
    Json(patch): Json<PromoPatch>,
) -> Result<Json<PromoList>, AppError> {
    let promos = state.hub.apply_promo(patch, None).await?;
    Ok(Json(PromoList { promos }))
}

/// DELETE /promo?id= - remove a promo by id; removing a missing id returns
/// the unchanged list.
pub async fn delete_promo(
    State(state): State<AppState>,
    Query(params): Query<IdParams>,
) -> Result<Json<PromoList>, AppError> {
    if params.id.trim().is_empty() {
        return Err(AppError::Validation("Missing id".to_string()));
    }
    let promos = state.hub.remove_promo(&params.id, None).await?;
    Ok(Json(PromoList { promos }))
}

/// GET /health - liveness and connection counts.
pub async fn health(State(state): State<AppState>) -> Json<HealthStats> {
    Json(state.hub.health().await)
}

/// GET /stats - health plus per-session detail.
pub async fn stats(State(state): State<AppState>) -> Json<DetailedStats> {
    Json(state.hub.stats().await)
}
