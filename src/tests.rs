//! Integration tests for the showroom sync backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::Config;
use crate::hub::Hub;
use crate::models::{kinds, Envelope};
use crate::store::Store;
use crate::sync::{AgentConfig, DataSource, SyncAgent, SyncEvent};
use crate::{auth, create_router, AppState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test fixture for integration tests.
struct TestFixture {
    client: Client,
    base_url: String,
    ws_url: String,
    _temp_dir: TempDir,
}

struct FixtureOptions {
    require_auth: bool,
    auth_secret: Option<String>,
    max_connections: usize,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            require_auth: false,
            auth_secret: None,
            max_connections: 100,
        }
    }
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_options(FixtureOptions::default()).await
    }

    async fn with_options(options: FixtureOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("inventory.json");

        let config = Arc::new(Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            db_path: db_path.clone(),
            allowed_origins: Vec::new(),
            require_auth: options.require_auth,
            auth_secret: options.auth_secret,
            max_connections: options.max_connections,
            max_clock_skew: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            log_level: "warn".to_string(),
        });

        let store = Store::new(db_path);
        let hub = Arc::new(Hub::open(Arc::clone(&config), store).await);

        let state = AppState {
            hub,
            config: Arc::clone(&config),
        };

        let app = create_router(state);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");
        let base_url = format!("http://{}", addr);
        let ws_url = format!("ws://{}/ws", addr);

        // Spawn server
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        // Wait for server to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        TestFixture {
            client: Client::new(),
            base_url,
            ws_url,
            _temp_dir: temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn connect_ws(&self) -> Socket {
        let (ws, _) = connect_async(&self.ws_url).await.expect("Failed to connect");
        ws
    }
}

/// Read the next text frame as JSON, skipping protocol-level frames.
async fn recv_json(ws: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for frame")
            .expect("Connection closed")
            .expect("Socket error");
        match frame {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("Unexpected frame: {:?}", other),
        }
    }
}

/// Assert that no text frame arrives within a short window.
async fn assert_silent(ws: &mut Socket) {
    let outcome = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    match outcome {
        Err(_) => {}
        Ok(Some(Ok(WsMessage::Ping(_)))) | Ok(Some(Ok(WsMessage::Pong(_)))) => {}
        Ok(frame) => panic!("Expected silence, got {:?}", frame),
    }
}

fn send_frame(envelope: &Envelope) -> WsMessage {
    WsMessage::Text(envelope.to_json().unwrap())
}

// ---- HTTP surface ----

#[tokio::test]
async fn test_health_check() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["clients"], 0);
    assert!(body["uptime"].is_number());
}

#[tokio::test]
async fn test_inventory_upsert_and_shallow_merge() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({
            "id": "inv_1_1",
            "modelId": "1",
            "colorName": "Red",
            "colorHex": "#F00",
            "quantity": 5,
            "isAvailable": true
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["inventory"].as_array().unwrap().len(), 1);

    // A quantity-only patch preserves every untouched field
    let resp = fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({ "id": "inv_1_1", "quantity": 0 }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let item = &body["inventory"][0];
    assert_eq!(item["quantity"], 0);
    assert_eq!(item["colorName"], "Red");
    assert_eq!(item["isAvailable"], true);
}

#[tokio::test]
async fn test_inventory_batch_and_idempotent_reupsert() {
    let fixture = TestFixture::new().await;

    let batch = json!([
        { "id": "a", "modelId": "1", "quantity": 1 },
        { "id": "b", "modelId": "1", "quantity": 2 }
    ]);
    fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&batch)
        .send()
        .await
        .unwrap();

    // Same batch again must not grow the list
    let resp = fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&batch)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["inventory"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_inventory_delete_and_validation() {
    let fixture = TestFixture::new().await;

    fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({ "id": "a", "quantity": 1 }))
        .send()
        .await
        .unwrap();

    // Missing id is rejected with the error envelope
    let resp = fixture
        .client
        .delete(fixture.url("/inventory"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let resp = fixture
        .client
        .delete(fixture.url("/inventory?id=a"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["inventory"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_blank_item_id_rejected() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({ "id": "  ", "quantity": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_promo_lifecycle() {
    let fixture = TestFixture::new().await;

    // Creating without an id assigns one server-side
    let resp = fixture
        .client
        .post(fixture.url("/promo"))
        .json(&json!({
            "modelIds": ["1"],
            "title": "Launch Promo",
            "isActive": true,
            "startDate": Utc::now(),
            "endDate": Utc::now()
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let promos = body["promos"].as_array().unwrap();
    assert_eq!(promos.len(), 1);
    let id = promos[0]["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());

    // Deleting a missing id returns the unchanged list
    let resp = fixture
        .client
        .delete(fixture.url("/promo?id=promo_missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["promos"].as_array().unwrap().len(), 1);

    let resp = fixture
        .client
        .delete(fixture.url(&format!("/promo?id={}", id)))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert!(body["promos"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_api_prefix_serves_same_routes() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .get(fixture.url("/api/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    fixture
        .client
        .post(fixture.url("/api/inventory"))
        .json(&json!({ "id": "a", "quantity": 3 }))
        .send()
        .await
        .unwrap();

    let body: Value = fixture
        .client
        .get(fixture.url("/inventory"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["inventory"][0]["id"], "a");
}

#[tokio::test]
async fn test_stats_reports_sessions() {
    let fixture = TestFixture::new().await;

    let mut ws = fixture.connect_ws().await;
    let welcome = recv_json(&mut ws).await;
    assert_eq!(welcome["type"], "notification");

    let body: Value = fixture
        .client
        .get(fixture.url("/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["clients"], 1);
    assert_eq!(body["clientDetails"].as_array().unwrap().len(), 1);
    assert_eq!(body["clientDetails"][0]["authenticated"], true);
}

// ---- realtime channel ----

#[tokio::test]
async fn test_welcome_frame_carries_session_id() {
    let fixture = TestFixture::new().await;

    let mut ws = fixture.connect_ws().await;
    let welcome = recv_json(&mut ws).await;

    assert_eq!(welcome["type"], "notification");
    assert!(welcome["data"]["sessionId"]
        .as_str()
        .is_some_and(|id| id.starts_with("client_")));
    assert_eq!(welcome["data"]["features"]["authRequired"], false);
}

#[tokio::test]
async fn test_ping_pong() {
    let fixture = TestFixture::new().await;

    let mut ws = fixture.connect_ws().await;
    recv_json(&mut ws).await; // welcome

    ws.send(send_frame(&Envelope::new(kinds::PING, Value::Null)))
        .await
        .unwrap();
    let pong = recv_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn test_broadcast_reaches_peers_but_not_origin() {
    let fixture = TestFixture::new().await;

    let mut origin = fixture.connect_ws().await;
    let mut peer = fixture.connect_ws().await;
    recv_json(&mut origin).await;
    recv_json(&mut peer).await;

    origin
        .send(send_frame(&Envelope::new(
            kinds::INVENTORY,
            json!({ "id": "inv_1", "modelId": "1", "quantity": 4 }),
        )))
        .await
        .unwrap();

    // The peer receives the canonical list, not the raw patch
    let frame = recv_json(&mut peer).await;
    assert_eq!(frame["type"], "inventory");
    assert_eq!(frame["data"][0]["id"], "inv_1");
    assert_eq!(frame["data"][0]["quantity"], 4);

    assert_silent(&mut origin).await;

    // The write was persisted before the broadcast
    let body: Value = fixture
        .client
        .get(fixture.url("/inventory"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["inventory"][0]["quantity"], 4);
}

#[tokio::test]
async fn test_http_write_broadcasts_to_sockets() {
    let fixture = TestFixture::new().await;

    let mut ws = fixture.connect_ws().await;
    recv_json(&mut ws).await;

    fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({ "id": "inv_1", "quantity": 9 }))
        .send()
        .await
        .unwrap();

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["type"], "inventory");
    assert_eq!(frame["data"][0]["quantity"], 9);
}

#[tokio::test]
async fn test_deletion_broadcasts_marker() {
    let fixture = TestFixture::new().await;

    fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({ "id": "inv_1", "quantity": 1 }))
        .send()
        .await
        .unwrap();

    let mut ws = fixture.connect_ws().await;
    recv_json(&mut ws).await;

    fixture
        .client
        .delete(fixture.url("/inventory?id=inv_1"))
        .send()
        .await
        .unwrap();

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["type"], "inventory");
    assert_eq!(frame["data"]["id"], "inv_1");
    assert_eq!(frame["data"]["deleted"], true);
}

#[tokio::test]
async fn test_malformed_and_stale_frames_dropped() {
    let fixture = TestFixture::new().await;

    let mut origin = fixture.connect_ws().await;
    let mut peer = fixture.connect_ws().await;
    recv_json(&mut origin).await;
    recv_json(&mut peer).await;

    // Not JSON at all
    origin
        .send(WsMessage::Text("{not json".to_string()))
        .await
        .unwrap();

    // Valid shape but outside the accepted clock window
    let mut stale = Envelope::new(kinds::INVENTORY, json!({ "id": "inv_1", "quantity": 1 }));
    stale.timestamp = Utc::now() - chrono::Duration::minutes(10);
    origin.send(send_frame(&stale)).await.unwrap();

    assert_silent(&mut peer).await;

    // The connection survives dropped frames
    origin
        .send(send_frame(&Envelope::new(kinds::PING, Value::Null)))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut origin).await["type"], "pong");
}

#[tokio::test]
async fn test_unknown_kind_relayed_opaquely() {
    let fixture = TestFixture::new().await;

    let mut origin = fixture.connect_ws().await;
    let mut peer = fixture.connect_ws().await;
    recv_json(&mut origin).await;
    recv_json(&mut peer).await;

    origin
        .send(send_frame(&Envelope::new(
            "showroom_tour",
            json!({ "room": "main" }),
        )))
        .await
        .unwrap();

    let frame = recv_json(&mut peer).await;
    assert_eq!(frame["type"], "showroom_tour");
    assert_eq!(frame["data"]["room"], "main");
    assert_silent(&mut origin).await;
}

#[tokio::test]
async fn test_connection_cap_closes_excess_connections() {
    let fixture = TestFixture::with_options(FixtureOptions {
        max_connections: 1,
        ..FixtureOptions::default()
    })
    .await;

    let mut first = fixture.connect_ws().await;
    recv_json(&mut first).await;

    let mut second = fixture.connect_ws().await;
    let frame = tokio::time::timeout(Duration::from_secs(2), second.next())
        .await
        .expect("Timed out waiting for close");
    assert!(matches!(frame, None | Some(Ok(WsMessage::Close(_))) | Some(Err(_))));
}

// ---- authentication ----

#[tokio::test]
async fn test_unauthenticated_mutations_dropped_when_auth_required() {
    let secret = "integration-secret";
    let fixture = TestFixture::with_options(FixtureOptions {
        require_auth: true,
        auth_secret: Some(secret.to_string()),
        ..FixtureOptions::default()
    })
    .await;

    let mut ws = fixture.connect_ws().await;
    let welcome = recv_json(&mut ws).await;
    assert_eq!(welcome["data"]["features"]["authRequired"], true);

    // A mutation before the handshake is silently dropped
    ws.send(send_frame(&Envelope::new(
        kinds::INVENTORY,
        json!({ "id": "inv_1", "quantity": 1 }),
    )))
    .await
    .unwrap();
    assert_silent(&mut ws).await;

    let body: Value = fixture
        .client
        .get(fixture.url("/inventory"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["inventory"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_signed_handshake_unlocks_mutations() {
    let secret = "integration-secret";
    let fixture = TestFixture::with_options(FixtureOptions {
        require_auth: true,
        auth_secret: Some(secret.to_string()),
        ..FixtureOptions::default()
    })
    .await;

    let mut ws = fixture.connect_ws().await;
    recv_json(&mut ws).await;

    let data = json!({ "sessionId": "session_test", "userId": "user_7" });
    let mut handshake = Envelope::new(kinds::AUTH, data.clone());
    handshake.signature = Some(auth::sign_payload(secret, &data));
    ws.send(send_frame(&handshake)).await.unwrap();

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "auth_success");
    assert_eq!(reply["data"]["userId"], "user_7");

    let data = json!({ "id": "inv_1", "quantity": 2 });
    let mut mutation = Envelope::new(kinds::INVENTORY, data.clone());
    mutation.signature = Some(auth::sign_payload(secret, &data));
    ws.send(send_frame(&mutation)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let body: Value = fixture
        .client
        .get(fixture.url("/inventory"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["inventory"][0]["quantity"], 2);
}

#[tokio::test]
async fn test_bad_signature_fails_handshake() {
    let fixture = TestFixture::with_options(FixtureOptions {
        require_auth: true,
        auth_secret: Some("integration-secret".to_string()),
        ..FixtureOptions::default()
    })
    .await;

    let mut ws = fixture.connect_ws().await;
    recv_json(&mut ws).await;

    let data = json!({ "sessionId": "session_test", "userId": "user_7" });
    let mut handshake = Envelope::new(kinds::AUTH, data.clone());
    handshake.signature = Some(auth::sign_payload("wrong-secret", &data));
    ws.send(send_frame(&handshake)).await.unwrap();

    // A bad signature fails structural validation before dispatch
    assert_silent(&mut ws).await;
}

#[tokio::test]
async fn test_unsigned_handshake_rejected_when_secret_configured() {
    let fixture = TestFixture::with_options(FixtureOptions {
        require_auth: true,
        auth_secret: Some("integration-secret".to_string()),
        ..FixtureOptions::default()
    })
    .await;

    let mut ws = fixture.connect_ws().await;
    recv_json(&mut ws).await;

    ws.send(send_frame(&Envelope::new(
        kinds::AUTH,
        json!({ "sessionId": "session_test", "userId": "user_7" }),
    )))
    .await
    .unwrap();

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "auth_error");
}

// ---- sync agent against a live hub ----

#[tokio::test]
async fn test_agent_loads_live_document() {
    let fixture = TestFixture::new().await;

    fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({ "id": "inv_1", "modelId": "1", "colorName": "Red", "quantity": 3, "isAvailable": true }))
        .send()
        .await
        .unwrap();

    let mut agent = SyncAgent::new(AgentConfig {
        api_base: fixture.base_url.clone(),
        ws_url: fixture.ws_url.clone(),
        ..AgentConfig::default()
    });

    assert_eq!(agent.initial_load().await, DataSource::Hub);
    assert_eq!(agent.document().inventory.len(), 1);
    assert_eq!(agent.available_colors("1"), vec!["Red".to_string()]);
}

#[tokio::test]
async fn test_agent_mutation_persists_and_fans_out() {
    let fixture = TestFixture::new().await;

    fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({ "id": "inv_1", "modelId": "1", "quantity": 3 }))
        .send()
        .await
        .unwrap();

    let mut observer = fixture.connect_ws().await;
    recv_json(&mut observer).await;

    let mut agent = SyncAgent::new(AgentConfig {
        api_base: fixture.base_url.clone(),
        ws_url: fixture.ws_url.clone(),
        ..AgentConfig::default()
    });
    agent.initial_load().await;
    agent.connect().await.unwrap();

    // Welcome frame surfaces as a notice
    let event = agent.poll_event().await.unwrap();
    assert!(matches!(event, Some(SyncEvent::Notice(_))));

    agent.update_quantity("inv_1", 7).await.unwrap();
    assert_eq!(agent.document().inventory[0].quantity, 7);

    // The other connection sees the canonical list
    let frame = recv_json(&mut observer).await;
    assert_eq!(frame["type"], "inventory");
    assert_eq!(frame["data"][0]["quantity"], 7);

    let body: Value = fixture
        .client
        .get(fixture.url("/inventory"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["inventory"][0]["quantity"], 7);
}

#[tokio::test]
async fn test_agent_converges_on_peer_writes() {
    let fixture = TestFixture::new().await;

    let mut agent = SyncAgent::new(AgentConfig {
        api_base: fixture.base_url.clone(),
        ws_url: fixture.ws_url.clone(),
        ..AgentConfig::default()
    });
    agent.initial_load().await;
    agent.connect().await.unwrap();
    agent.poll_event().await.unwrap(); // welcome

    fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({ "id": "inv_1", "modelId": "1", "quantity": 5 }))
        .send()
        .await
        .unwrap();

    let event = agent.poll_event().await.unwrap();
    assert_eq!(event, Some(SyncEvent::InventoryChanged));
    assert_eq!(agent.document().inventory[0].quantity, 5);
    assert_eq!(agent.stock_level("1", ""), 5);
}

#[tokio::test]
async fn test_agent_falls_back_to_http_without_socket() {
    let fixture = TestFixture::new().await;

    fixture
        .client
        .post(fixture.url("/inventory"))
        .json(&json!({ "id": "inv_1", "quantity": 1 }))
        .send()
        .await
        .unwrap();

    let mut agent = SyncAgent::new(AgentConfig {
        api_base: fixture.base_url.clone(),
        ws_url: fixture.ws_url.clone(),
        ..AgentConfig::default()
    });
    agent.initial_load().await;
    assert!(!agent.is_connected());

    agent.update_quantity("inv_1", 4).await.unwrap();

    let body: Value = fixture
        .client
        .get(fixture.url("/inventory"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["inventory"][0]["quantity"], 4);
}
