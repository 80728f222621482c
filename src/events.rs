//! Game-event feed: the read-only stream of platform events the reconciler
//! derives progress from.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::store::StoreError;

pub const EVENT_ENTITY_KILLED: &str = "entity-killed";
pub const EVENT_SHOP_ORDER: &str = "shop-order-status-changed";
pub const EVENT_PLAYER_DEATH: &str = "player-death";
pub const EVENT_CURRENCY_DEDUCTED: &str = "currency-deducted";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEvent {
    pub id: String,
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub meta: Value,
    pub created_at: DateTime<Utc>,
}

impl GameEvent {
    /// Shop orders only count once they reach COMPLETED.
    pub fn is_completed_shop_order(&self) -> bool {
        self.meta
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.eq_ignore_ascii_case("COMPLETED"))
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait EventFeed: Send + Sync {
    /// Events of one class strictly newer than `since`, oldest first.
    async fn events_since(
        &self,
        event_name: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GameEvent>, StoreError>;
}

pub struct HttpEventFeed {
    client: reqwest::Client,
    base_url: String,
    token: String,
    game_server_id: String,
}

impl HttpEventFeed {
    pub fn new(
        base_url: &str,
        token: &str,
        game_server_id: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            game_server_id: game_server_id.to_string(),
        })
    }
}

#[async_trait]
impl EventFeed for HttpEventFeed {
    async fn events_since(
        &self,
        event_name: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GameEvent>, StoreError> {
        let url = format!("{}/events/search", self.base_url);
        // The platform's event filter key is lowercase "gameserverId",
        // unlike the variables API.
        let body = json!({
            "filters": {
                "eventName": [event_name],
                "gameserverId": [self.game_server_id],
            },
            "greaterThan": { "createdAt": since.to_rfc3339() },
            "limit": limit.max(1),
        });
        debug!(event_name, since = %since, "Event search");
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::network(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StoreError::from_status(status.as_u16(), &text));
        }
        #[derive(Deserialize)]
        struct Envelope {
            data: Vec<GameEvent>,
        }
        let envelope: Envelope = resp.json().await.map_err(|e| StoreError {
            kind: crate::store::StoreErrorKind::Unknown,
            status: None,
            message: format!("malformed event response: {e}"),
        })?;
        let mut events = envelope.data;
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}
