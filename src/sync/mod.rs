//! Client-side sync agent: the storefront's view of the hub.
//!
//! The agent keeps a local replica of the document, loads it through a
//! fallback chain (hub, then a seed file, then empty), applies mutations
//! optimistically with revert on delivery failure, and folds broadcast
//! frames back into the replica so it converges on the hub's state.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::auth;
use crate::models::{kinds, Envelope, InventoryItem, Promo, StoreDocument};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where the current replica came from. Surfaced to callers so the UI can
/// flag non-live data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Live document fetched from the hub.
    Hub,
    /// Local seed file; the hub was unreachable.
    Seed,
    /// Built-in empty state; nothing else was available.
    Sample,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Hub => "hub",
            DataSource::Seed => "seed",
            DataSource::Sample => "sample",
        }
    }
}

/// Something the agent observed on the realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The inventory list changed under a broadcast.
    InventoryChanged,
    /// The promo list changed under a broadcast.
    PromosChanged,
    /// A server notice (welcome frame, service messages).
    Notice(String),
    /// The handshake was accepted.
    AuthAccepted,
    /// The handshake was rejected.
    AuthRejected(String),
    /// A heartbeat frame (pong or protocol-level ping/pong).
    Heartbeat,
    /// A frame with an unrecognized type, relayed by the hub.
    Opaque(String),
}

#[derive(Debug)]
pub enum SyncError {
    Http(String),
    Socket(String),
    Serialization(String),
    Rejected(String),
    Disconnected,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Http(msg) => write!(f, "HTTP request failed: {}", msg),
            SyncError::Socket(msg) => write!(f, "Socket error: {}", msg),
            SyncError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            SyncError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            SyncError::Disconnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Http(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Socket(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Agent configuration. Defaults target a hub on localhost.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL for the HTTP surface, without a trailing slash.
    pub api_base: String,
    /// URL for the realtime endpoint.
    pub ws_url: String,
    /// Optional local seed document used when the hub is unreachable.
    pub seed_path: Option<PathBuf>,
    /// Shared secret for envelope signing; unsigned when absent.
    pub auth_secret: Option<String>,
    /// User identity sent in the handshake; no handshake when absent.
    pub user_id: Option<String>,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Base delay before the first reconnect attempt; doubles per attempt.
    pub reconnect_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8081".to_string(),
            ws_url: "ws://127.0.0.1:8081/ws".to_string(),
            seed_path: None,
            auth_secret: None,
            user_id: None,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

pub struct SyncAgent {
    config: AgentConfig,
    http: reqwest::Client,
    session_id: String,
    document: StoreDocument,
    source: DataSource,
    ws: Option<WsStream>,
    reconnect_attempts: u32,
}

impl SyncAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            session_id: format!("session_{}", uuid::Uuid::new_v4().simple()),
            document: StoreDocument::default(),
            source: DataSource::Sample,
            ws: None,
            reconnect_attempts: 0,
        }
    }

    pub fn document(&self) -> &StoreDocument {
        &self.document
    }

    pub fn source(&self) -> DataSource {
        self.source
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.ws.is_some()
    }

    // ---- initial load ----

    /// Populate the replica through the fallback chain: live hub, then the
    /// seed file, then the empty document. Never fails; the returned source
    /// tells the caller what they got.
    pub async fn initial_load(&mut self) -> DataSource {
        if let Some(doc) = self.fetch_document().await {
            self.document = doc;
            self.source = DataSource::Hub;
        } else if let Some(doc) = self.load_seed().await {
            tracing::warn!("Hub unreachable, serving seed data");
            self.document = doc;
            self.source = DataSource::Seed;
        } else {
            tracing::warn!("Hub unreachable and no seed available, serving empty state");
            self.document = StoreDocument::default();
            self.source = DataSource::Sample;
        }
        self.source
    }

    /// Fetch the full document, trying the bare route first and the `/api`
    /// prefix second.
    async fn fetch_document(&self) -> Option<StoreDocument> {
        let base = self.config.api_base.trim_end_matches('/');
        for url in [format!("{}/inventory", base), format!("{}/api/inventory", base)] {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<StoreDocument>().await {
                        Ok(doc) => return Some(doc),
                        Err(err) => tracing::warn!("Unreadable document from {}: {}", url, err),
                    }
                }
                Ok(resp) => tracing::debug!("Fetch from {} returned {}", url, resp.status()),
                Err(err) => tracing::debug!("Fetch from {} failed: {}", url, err),
            }
        }
        None
    }

    async fn load_seed(&self) -> Option<StoreDocument> {
        let path = self.config.seed_path.as_ref()?;
        let bytes = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    // ---- connection lifecycle ----

    /// Open the realtime connection and, when a user identity is configured,
    /// send the auth handshake.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        let (ws, _) = connect_async(self.config.ws_url.as_str()).await?;
        self.ws = Some(ws);
        self.reconnect_attempts = 0;
        tracing::info!("Connected to {}", self.config.ws_url);

        if let Some(user_id) = self.config.user_id.clone() {
            self.send_envelope(
                kinds::AUTH,
                json!({
                    "sessionId": self.session_id,
                    "userId": user_id,
                    "timestamp": Utc::now(),
                }),
            )
            .await?;
        }
        Ok(())
    }

    /// Retry `connect` with exponentially growing delays until it succeeds
    /// or the attempt budget is spent.
    pub async fn reconnect(&mut self) -> Result<(), SyncError> {
        while self.reconnect_attempts < self.config.max_reconnect_attempts {
            let delay = self.config.reconnect_delay * 2u32.pow(self.reconnect_attempts);
            self.reconnect_attempts += 1;
            tracing::info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay,
                self.reconnect_attempts,
                self.config.max_reconnect_attempts
            );
            tokio::time::sleep(delay).await;

            let attempts = self.reconnect_attempts;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    // connect() resets the counter on success only
                    self.reconnect_attempts = attempts;
                    tracing::warn!("Reconnect attempt failed: {}", err);
                }
            }
        }
        Err(SyncError::Disconnected)
    }

    /// Close the realtime connection, keeping the replica.
    pub async fn disconnect(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
    }

    // ---- incoming frames ----

    /// Wait for the next frame and fold it into the replica. Returns
    /// `Ok(None)` when the connection closed cleanly or a frame was dropped.
    pub async fn poll_event(&mut self) -> Result<Option<SyncEvent>, SyncError> {
        let mut ws = self.ws.take().ok_or(SyncError::Disconnected)?;
        let incoming = ws.next().await;
        self.ws = Some(ws);

        match incoming {
            Some(Ok(WsMessage::Text(text))) => Ok(self.apply_frame(&text)),
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                Ok(Some(SyncEvent::Heartbeat))
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                self.ws = None;
                Ok(None)
            }
            Some(Ok(_)) => Ok(None),
            Some(Err(err)) => {
                self.ws = None;
                Err(err.into())
            }
        }
    }

    /// Drive the connection until the reconnect budget is spent, invoking
    /// `on_event` for every observed event.
    pub async fn run(&mut self, mut on_event: impl FnMut(SyncEvent)) -> Result<(), SyncError> {
        loop {
            if self.ws.is_none() {
                self.reconnect().await?;
            }
            match self.poll_event().await {
                Ok(Some(event)) => on_event(event),
                Ok(None) => {}
                Err(err) => tracing::warn!("Connection lost: {}", err),
            }
        }
    }

    /// Fold one broadcast frame into the replica. Frames that do not parse
    /// are dropped; the broadcast payload is authoritative and overrides any
    /// optimistic local state for the same records.
    fn apply_frame(&mut self, text: &str) -> Option<SyncEvent> {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!("Dropping unreadable frame: {}", err);
                return None;
            }
        };

        match envelope.kind.as_str() {
            kinds::INVENTORY => {
                self.merge_inventory_frame(envelope.data);
                Some(SyncEvent::InventoryChanged)
            }
            kinds::PROMO => {
                self.merge_promo_frame(envelope.data);
                Some(SyncEvent::PromosChanged)
            }
            kinds::NOTIFICATION => {
                let message = envelope
                    .data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Some(SyncEvent::Notice(message))
            }
            kinds::AUTH_SUCCESS => Some(SyncEvent::AuthAccepted),
            kinds::AUTH_ERROR => {
                let message = envelope
                    .data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Some(SyncEvent::AuthRejected(message))
            }
            kinds::PONG => Some(SyncEvent::Heartbeat),
            other => Some(SyncEvent::Opaque(other.to_string())),
        }
    }

    /// Inventory frames carry either the canonical full list, a single item,
    /// or a deletion marker `{id, deleted: true}`.
    fn merge_inventory_frame(&mut self, data: Value) {
        if let Some(id) = deletion_marker(&data) {
            self.document.remove_inventory(&id);
            return;
        }
        if data.is_array() {
            if let Ok(inventory) = serde_json::from_value::<Vec<InventoryItem>>(data) {
                self.document.inventory = inventory;
            }
            return;
        }
        if let Ok(item) = serde_json::from_value::<InventoryItem>(data) {
            self.document.merge_inventory_item(item);
        }
    }

    /// Promo frames carry the canonical merged promo or a deletion marker.
    fn merge_promo_frame(&mut self, data: Value) {
        if let Some(id) = deletion_marker(&data) {
            self.document.remove_promo(&id);
            return;
        }
        if data.is_array() {
            if let Ok(promos) = serde_json::from_value::<Vec<Promo>>(data) {
                self.document.promos = promos;
            }
            return;
        }
        if let Ok(promo) = serde_json::from_value::<Promo>(data) {
            self.document.merge_promo(promo);
        }
    }

    // ---- mutations ----

    /// Set an item's quantity, applying locally first and reverting if the
    /// write cannot be delivered over either channel.
    pub async fn update_quantity(&mut self, item_id: &str, quantity: u32) -> Result<(), SyncError> {
        let Some(pos) = self.document.inventory.iter().position(|i| i.id == item_id) else {
            return Err(SyncError::Rejected(format!("Unknown item: {}", item_id)));
        };
        let previous = self.document.inventory[pos].clone();
        self.document.inventory[pos].quantity = quantity;
        self.document.inventory[pos].last_updated = Utc::now();

        let patch = json!({ "id": item_id, "quantity": quantity });
        if let Err(err) = self.send_mutation(kinds::INVENTORY, patch).await {
            tracing::warn!("Quantity update for {} failed, reverting: {}", item_id, err);
            self.document.merge_inventory_item(previous);
            return Err(err);
        }
        Ok(())
    }

    /// Set an item's availability flag, optimistically with revert.
    pub async fn update_availability(
        &mut self,
        item_id: &str,
        is_available: bool,
    ) -> Result<(), SyncError> {
        let Some(pos) = self.document.inventory.iter().position(|i| i.id == item_id) else {
            return Err(SyncError::Rejected(format!("Unknown item: {}", item_id)));
        };
        let previous = self.document.inventory[pos].clone();
        self.document.inventory[pos].is_available = is_available;

        let patch = json!({ "id": item_id, "isAvailable": is_available });
        if let Err(err) = self.send_mutation(kinds::INVENTORY, patch).await {
            tracing::warn!(
                "Availability update for {} failed, reverting: {}",
                item_id,
                err
            );
            self.document.merge_inventory_item(previous);
            return Err(err);
        }
        Ok(())
    }

    /// Create a promo, generating an id when the caller left it empty.
    /// Returns the id the promo was stored under.
    pub async fn add_promo(&mut self, mut promo: Promo) -> Result<String, SyncError> {
        if promo.id.trim().is_empty() {
            promo.id = uuid::Uuid::new_v4().to_string();
        }
        let id = promo.id.clone();
        self.upsert_promo(promo).await?;
        Ok(id)
    }

    /// Store a full promo, optimistically with revert.
    pub async fn upsert_promo(&mut self, promo: Promo) -> Result<(), SyncError> {
        let previous = self
            .document
            .promos
            .iter()
            .find(|p| p.id == promo.id)
            .cloned();
        let id = promo.id.clone();
        self.document.merge_promo(promo.clone());

        let payload = serde_json::to_value(&promo)?;
        if let Err(err) = self.send_mutation(kinds::PROMO, payload).await {
            tracing::warn!("Promo upsert for {} failed, reverting: {}", id, err);
            match previous {
                Some(previous) => self.document.merge_promo(previous),
                None => self.document.remove_promo(&id),
            }
            return Err(err);
        }
        Ok(())
    }

    /// Delete a promo. Deletion has no realtime message type, so it always
    /// goes over HTTP; the hub broadcasts the deletion marker to everyone
    /// including this agent.
    pub async fn delete_promo(&mut self, id: &str) -> Result<(), SyncError> {
        let previous = self.document.promos.iter().find(|p| p.id == id).cloned();
        self.document.remove_promo(id);

        let base = self.config.api_base.trim_end_matches('/');
        let mut last_err = SyncError::Disconnected;
        for url in [format!("{}/promo", base), format!("{}/api/promo", base)] {
            match self.http.delete(&url).query(&[("id", id)]).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    last_err = SyncError::Http(format!("{} not found", url));
                }
                Ok(resp) => {
                    last_err = SyncError::Rejected(format!("Server returned {}", resp.status()));
                    break;
                }
                Err(err) => last_err = err.into(),
            }
        }

        tracing::warn!("Promo delete for {} failed, reverting: {}", id, last_err);
        if let Some(previous) = previous {
            self.document.merge_promo(previous);
        }
        Err(last_err)
    }

    /// Send a heartbeat over the realtime channel.
    pub async fn send_ping(&mut self) -> Result<(), SyncError> {
        self.send_envelope(kinds::PING, Value::Null).await
    }

    // ---- delivery ----

    /// Deliver a mutation over the realtime channel when connected, falling
    /// back to the HTTP surface otherwise.
    async fn send_mutation(&mut self, kind: &str, data: Value) -> Result<(), SyncError> {
        if self.ws.is_some() {
            match self.send_envelope(kind, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!("Realtime send failed, trying HTTP: {}", err);
                    self.ws = None;
                }
            }
        }
        self.post_mutation(kind, &data).await
    }

    async fn send_envelope(&mut self, kind: &str, data: Value) -> Result<(), SyncError> {
        let mut envelope = Envelope::new(kind, data);
        envelope.session_id = Some(self.session_id.clone());
        envelope.user_id = self.config.user_id.clone();
        if let Some(secret) = &self.config.auth_secret {
            envelope.signature = Some(auth::sign_payload(secret, &envelope.data));
        }
        let text = envelope.to_json()?;

        let mut ws = self.ws.take().ok_or(SyncError::Disconnected)?;
        let result = ws.send(WsMessage::Text(text)).await;
        self.ws = Some(ws);
        result.map_err(Into::into)
    }

    async fn post_mutation(&self, kind: &str, data: &Value) -> Result<(), SyncError> {
        let base = self.config.api_base.trim_end_matches('/');
        let path = if kind == kinds::PROMO { "promo" } else { "inventory" };

        let mut last_err = SyncError::Disconnected;
        for url in [format!("{}/{}", base, path), format!("{}/api/{}", base, path)] {
            match self.http.post(&url).json(data).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    last_err = SyncError::Http(format!("{} not found", url));
                }
                Ok(resp) => {
                    return Err(SyncError::Rejected(format!(
                        "Server returned {}",
                        resp.status()
                    )));
                }
                Err(err) => last_err = err.into(),
            }
        }
        Err(last_err)
    }

    // ---- derived queries ----

    /// Color names of a model's variants that are both flagged available and
    /// in stock. Both flags gate sellability.
    pub fn available_colors(&self, model_id: &str) -> Vec<String> {
        self.document
            .inventory
            .iter()
            .filter(|item| item.model_id == model_id && item.is_available && item.quantity > 0)
            .map(|item| item.color_name.clone())
            .collect()
    }

    /// Stock on hand for one model/color variant; unknown variants read as
    /// zero.
    pub fn stock_level(&self, model_id: &str, color_name: &str) -> u32 {
        self.document
            .inventory
            .iter()
            .find(|item| item.model_id == model_id && item.color_name == color_name)
            .map_or(0, |item| item.quantity)
    }

    /// Promos currently active for a model.
    pub fn active_promos(&self, model_id: &str) -> Vec<&Promo> {
        let now = Utc::now();
        self.document
            .promos
            .iter()
            .filter(|promo| promo.is_active_for(model_id, now))
            .collect()
    }
}

/// Extract the id from a `{id, deleted: true}` marker, if this is one.
fn deletion_marker(data: &Value) -> Option<String> {
    if data.get("deleted").and_then(Value::as_bool) == Some(true) {
        data.get("id").and_then(Value::as_str).map(str::to_string)
    } else {
        None
    }
}
