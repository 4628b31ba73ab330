//! Broadcast hub: connection lifecycle, message routing, and consistency of
//! the broadcast stream with the store.
//!
//! All mutations funnel through the store's write lock, and broadcasts go out
//! only after a confirmed persist, so every connected client converges on the
//! same last-writer-wins state ordered by lock acquisition. The hub keeps an
//! in-memory mirror of the document, refreshed from every store return value,
//! to answer reads without disk I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, timeout, MissedTickBehavior};

use crate::auth;
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{
    kinds, Envelope, InventoryPatch, OneOrMany, Promo, PromoPatch, StoreDocument,
};
use crate::store::Store;
use crate::AppState;

/// Per-connection session record. Created on connect, destroyed on
/// disconnect, never persisted.
struct Session {
    remote_addr: SocketAddr,
    authenticated: bool,
    user_id: Option<String>,
    connected_at: Instant,
    last_activity: Instant,
    sender: mpsc::UnboundedSender<Message>,
}

pub struct Hub {
    config: Arc<Config>,
    store: Store,
    mirror: RwLock<StoreDocument>,
    sessions: RwLock<HashMap<String, Session>>,
    started_at: Instant,
}

/// Payload for `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthStats {
    pub status: &'static str,
    pub clients: usize,
    pub authenticated: usize,
    pub uptime: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-session detail for `GET /stats`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub id: String,
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub remote_addr: String,
    pub connected_for_ms: u128,
    pub idle_ms: u128,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStats {
    #[serde(flatten)]
    pub health: HealthStats,
    pub client_details: Vec<SessionStats>,
}

impl Hub {
    /// Construct a hub over the given store, priming the in-memory mirror
    /// from disk.
    pub async fn open(config: Arc<Config>, store: Store) -> Self {
        let mirror = store.load().await;
        tracing::info!(
            path = %store.path().display(),
            "Loaded store: {} inventory items, {} promos",
            mirror.inventory.len(),
            mirror.promos.len()
        );
        Self {
            config,
            store,
            mirror: RwLock::new(mirror),
            sessions: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    /// Current document state, served from the mirror.
    pub async fn document(&self) -> StoreDocument {
        self.mirror.read().await.clone()
    }

    pub async fn health(&self) -> HealthStats {
        let sessions = self.sessions.read().await;
        HealthStats {
            status: "ok",
            clients: sessions.len(),
            authenticated: sessions.values().filter(|s| s.authenticated).count(),
            uptime: self.started_at.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
        }
    }

    pub async fn stats(&self) -> DetailedStats {
        let health = self.health().await;
        let sessions = self.sessions.read().await;
        let now = Instant::now();
        let client_details = sessions
            .iter()
            .map(|(id, session)| SessionStats {
                id: id.clone(),
                authenticated: session.authenticated,
                user_id: session.user_id.clone(),
                remote_addr: session.remote_addr.to_string(),
                connected_for_ms: now.duration_since(session.connected_at).as_millis(),
                idle_ms: now.duration_since(session.last_activity).as_millis(),
            })
            .collect();
        DetailedStats {
            health,
            client_details,
        }
    }

    // ---- mutation operations (shared by the socket and HTTP paths) ----

    /// Upsert one or more inventory patches, refresh the mirror, and
    /// broadcast the canonical inventory list to every open connection
    /// except `origin`. Nothing is broadcast on store failure.
    pub async fn apply_inventory(
        &self,
        patches: Vec<InventoryPatch>,
        origin: Option<&str>,
    ) -> Result<StoreDocument, AppError> {
        if patches.is_empty() {
            return Err(AppError::Validation("No items provided".to_string()));
        }
        if patches.iter().any(|p| p.id.trim().is_empty()) {
            return Err(AppError::Validation("Item id is required".to_string()));
        }

        let inventory = timeout(
            self.config.store_timeout,
            self.store.upsert_inventory(&patches),
        )
        .await
        .map_err(|_| AppError::Store("Store write timed out".to_string()))??;

        let doc = {
            let mut mirror = self.mirror.write().await;
            mirror.inventory = inventory.clone();
            mirror.clone()
        };

        self.broadcast(&Envelope::new(kinds::INVENTORY, json!(inventory)), origin)
            .await;
        Ok(doc)
    }

    /// Remove an inventory item, refresh the mirror, and broadcast the
    /// deletion marker.
    pub async fn remove_inventory(
        &self,
        id: &str,
        origin: Option<&str>,
    ) -> Result<StoreDocument, AppError> {
        let inventory = timeout(self.config.store_timeout, self.store.delete_inventory(id))
            .await
            .map_err(|_| AppError::Store("Store write timed out".to_string()))??;

        let doc = {
            let mut mirror = self.mirror.write().await;
            mirror.inventory = inventory;
            mirror.clone()
        };

        self.broadcast(
            &Envelope::new(kinds::INVENTORY, json!({ "id": id, "deleted": true })),
            origin,
        )
        .await;
        Ok(doc)
    }

    /// Upsert a promo, refresh the mirror, and broadcast the canonical
    /// merged promo (not the raw client payload).
    pub async fn apply_promo(
        &self,
        patch: PromoPatch,
        origin: Option<&str>,
    ) -> Result<Vec<Promo>, AppError> {
        let patch = patch.ensure_id();
        let promos = timeout(self.config.store_timeout, self.store.upsert_promo(&patch))
            .await
            .map_err(|_| AppError::Store("Store write timed out".to_string()))??;

        {
            let mut mirror = self.mirror.write().await;
            mirror.promos = promos.clone();
        }

        let id = patch.id.as_deref().unwrap_or_default();
        if let Some(canonical) = promos.iter().find(|p| p.id == id) {
            self.broadcast(&Envelope::new(kinds::PROMO, json!(canonical)), origin)
                .await;
        }
        Ok(promos)
    }

    /// Remove a promo, refresh the mirror, and broadcast the deletion marker.
    pub async fn remove_promo(
        &self,
        id: &str,
        origin: Option<&str>,
    ) -> Result<Vec<Promo>, AppError> {
        let promos = timeout(self.config.store_timeout, self.store.delete_promo(id))
            .await
            .map_err(|_| AppError::Store("Store write timed out".to_string()))??;

        {
            let mut mirror = self.mirror.write().await;
            mirror.promos = promos.clone();
        }

        self.broadcast(
            &Envelope::new(kinds::PROMO, json!({ "id": id, "deleted": true })),
            origin,
        )
        .await;
        Ok(promos)
    }

    // ---- broadcast ----

    /// Send to every open connection except `exclude`. When auth is
    /// required, unauthenticated sessions are skipped.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: Option<&str>) -> usize {
        match envelope.to_json() {
            Ok(text) => self.broadcast_raw(&text, exclude).await,
            Err(err) => {
                tracing::error!("Failed to serialize broadcast: {}", err);
                0
            }
        }
    }

    async fn broadcast_raw(&self, text: &str, exclude: Option<&str>) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for (id, session) in sessions.iter() {
            if exclude == Some(id.as_str()) {
                continue;
            }
            if self.config.require_auth && !session.authenticated {
                continue;
            }
            if session.sender.send(Message::Text(text.to_string().into())).is_ok() {
                delivered += 1;
            }
        }
        tracing::debug!("Broadcast delivered to {} clients", delivered);
        delivered
    }

    async fn send_to(&self, session_id: &str, envelope: &Envelope) {
        let Ok(text) = envelope.to_json() else {
            return;
        };
        let sessions = self.sessions.read().await;
        if let Some(session) = sessions.get(session_id) {
            let _ = session.sender.send(Message::Text(text.into()));
        }
    }

    // ---- session registry ----

    async fn register(
        &self,
        remote_addr: SocketAddr,
        sender: mpsc::UnboundedSender<Message>,
    ) -> String {
        let id = format!("client_{}", uuid::Uuid::new_v4().simple());
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            id.clone(),
            Session {
                remote_addr,
                // Auto-authenticate when no auth handshake is required
                authenticated: !self.config.require_auth,
                user_id: None,
                connected_at: now,
                last_activity: now,
                sender,
            },
        );
        tracing::info!(
            "Client connected: {} from {} - total {}",
            id,
            remote_addr,
            sessions.len()
        );
        id
    }

    async fn unregister(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
        tracing::info!(
            "Client {} disconnected - remaining {}",
            session_id,
            sessions.len()
        );
    }

    async fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    async fn idle_for(&self, session_id: &str) -> Option<Duration> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.last_activity.elapsed())
    }

    async fn connection_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn may_mutate(&self, session_id: &str) -> bool {
        if !self.config.require_auth {
            return true;
        }
        self.sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|s| s.authenticated)
    }

    // ---- message dispatch ----

    async fn handle_text(&self, session_id: &str, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("Dropping malformed envelope from {}: {}", session_id, err);
                return;
            }
        };
        if let Err(reason) = envelope.validate(Utc::now(), self.config.max_clock_skew) {
            tracing::warn!("Dropping envelope from {}: {}", session_id, reason);
            return;
        }
        if let (Some(secret), Some(signature)) = (
            self.config.auth_secret.as_deref(),
            envelope.signature.as_deref(),
        ) {
            if !auth::verify_payload(secret, &envelope.data, signature) {
                tracing::warn!("Dropping envelope with bad signature from {}", session_id);
                return;
            }
        }

        match envelope.kind.as_str() {
            kinds::AUTH => self.handle_auth(session_id, &envelope).await,
            kinds::PING => {
                self.send_to(session_id, &Envelope::new(kinds::PONG, Value::Null))
                    .await;
            }
            kinds::INVENTORY => {
                if !self.may_mutate(session_id).await {
                    tracing::warn!("Rejected unauthorized inventory update from {}", session_id);
                    return;
                }
                match serde_json::from_value::<OneOrMany<InventoryPatch>>(envelope.data.clone()) {
                    Ok(patches) => {
                        if let Err(err) = self
                            .apply_inventory(patches.into_vec(), Some(session_id))
                            .await
                        {
                            tracing::error!(
                                "Failed to persist inventory update from {}: {}",
                                session_id,
                                err
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!("Invalid inventory payload from {}: {}", session_id, err);
                    }
                }
            }
            kinds::PROMO => {
                if !self.may_mutate(session_id).await {
                    tracing::warn!("Rejected unauthorized promo update from {}", session_id);
                    return;
                }
                match serde_json::from_value::<PromoPatch>(envelope.data.clone()) {
                    Ok(patch) => {
                        if let Err(err) = self.apply_promo(patch, Some(session_id)).await {
                            tracing::error!(
                                "Failed to persist promo update from {}: {}",
                                session_id,
                                err
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!("Invalid promo payload from {}: {}", session_id, err);
                    }
                }
            }
            other => {
                // Opaque relay for forward-compatible message types
                tracing::debug!("Relaying {} message from {}", other, session_id);
                self.broadcast_raw(text, Some(session_id)).await;
            }
        }
    }

    async fn handle_auth(&self, session_id: &str, envelope: &Envelope) {
        let handshake_session = envelope
            .data
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        let user_id = envelope
            .data
            .get("userId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        // When a secret is configured the handshake must carry a valid
        // signature; unsigned handshakes degrade to a presence check.
        let signed = match self.config.auth_secret.as_deref() {
            Some(secret) => envelope
                .signature
                .as_deref()
                .is_some_and(|sig| auth::verify_payload(secret, &envelope.data, sig)),
            None => true,
        };

        if handshake_session.is_some() && user_id.is_some() && signed {
            {
                let mut sessions = self.sessions.write().await;
                if let Some(session) = sessions.get_mut(session_id) {
                    session.authenticated = true;
                    session.user_id = user_id.clone();
                }
            }
            let user_id = user_id.unwrap_or_default();
            tracing::info!("Client {} authenticated as {}", session_id, user_id);
            self.send_to(
                session_id,
                &Envelope::new(
                    kinds::AUTH_SUCCESS,
                    json!({ "userId": user_id, "timestamp": Utc::now() }),
                ),
            )
            .await;
        } else {
            self.send_to(
                session_id,
                &Envelope::new(kinds::AUTH_ERROR, json!({ "message": "Authentication failed" })),
            )
            .await;
        }
    }
}

/// `GET /ws` - upgrade to the persistent connection.
pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| handle_socket(hub, socket, addr))
}

async fn handle_socket(hub: Arc<Hub>, socket: WebSocket, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if hub.connection_count().await >= hub.config.max_connections {
        tracing::warn!(
            "Connection limit reached ({}), closing {}",
            hub.config.max_connections,
            addr
        );
        let _ = ws_tx.close().await;
        return;
    }

    // Outbound frames flow through a queue so broadcasts never block on a
    // slow peer's socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session_id = hub.register(addr, tx.clone()).await;

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let welcome = Envelope::new(
        kinds::NOTIFICATION,
        json!({
            "message": "Connected to showroom realtime sync",
            "sessionId": session_id,
            "features": { "authRequired": hub.config.require_auth }
        }),
    );
    if let Ok(text) = welcome.to_json() {
        let _ = tx.send(Message::Text(text.into()));
    }

    let period = hub.config.heartbeat_interval;
    let mut heartbeat = interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        hub.touch(&session_id).await;
                        hub.handle_text(&session_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        hub.touch(&session_id).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        hub.touch(&session_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!("Socket error for {}: {}", session_id, err);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let idle = hub.idle_for(&session_id).await;
                if idle.map_or(true, |idle| idle > hub.config.idle_timeout) {
                    tracing::info!("Closing idle connection {}", session_id);
                    let _ = tx.send(Message::Close(None));
                    break;
                }
                let _ = tx.send(Message::Ping(Vec::new().into()));
            }
        }
    }

    hub.unregister(&session_id).await;
    writer.abort();
}
