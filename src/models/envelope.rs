//! Typed message envelope exchanged over the persistent connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Message kinds understood by the hub. Anything else is relayed opaquely
/// for forward compatibility.
pub mod kinds {
    pub const INVENTORY: &str = "inventory";
    pub const PROMO: &str = "promo";
    pub const AUTH: &str = "auth";
    pub const PING: &str = "ping";

    // Server-to-client only
    pub const PONG: &str = "pong";
    pub const AUTH_SUCCESS: &str = "auth_success";
    pub const AUTH_ERROR: &str = "auth_error";
    pub const NOTIFICATION: &str = "notification";
}

/// The wire envelope: `{type, data, timestamp, sessionId?, userId?, signature?}`.
///
/// `type` and `timestamp` are mandatory; `data` is mandatory for data-bearing
/// kinds but heartbeat frames carry none.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: Utc::now(),
            session_id: None,
            user_id: None,
            signature: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Whether this kind must carry a data payload.
    fn requires_data(&self) -> bool {
        !matches!(self.kind.as_str(), kinds::PING | kinds::PONG)
    }

    /// Structural and freshness checks applied before dispatch. A timestamp
    /// deviating from server time beyond `max_skew` is treated as replayed
    /// or clock-skewed and the message is dropped.
    pub fn validate(&self, now: DateTime<Utc>, max_skew: Duration) -> Result<(), &'static str> {
        if self.kind.trim().is_empty() {
            return Err("missing type");
        }
        if self.requires_data() && self.data.is_null() {
            return Err("missing data");
        }
        let skew = (now - self.timestamp).num_milliseconds().unsigned_abs();
        if skew > max_skew.as_millis() as u64 {
            return Err("timestamp outside accepted window");
        }
        Ok(())
    }
}
