//! Outbound game-server operations: player lookup, the online snapshot,
//! notifications, and currency grants.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::store::StoreError;

#[async_trait]
pub trait GameClient: Send + Sync {
    /// Display name for a player, if resolvable.
    async fn player_name(&self, player_id: &str) -> Result<Option<String>, StoreError>;

    /// Players currently online on our game server.
    async fn online_player_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Private message by player name. Notification-only; never part of the
    /// state machine.
    async fn send_pm(&self, player_name: &str, message: &str) -> Result<(), StoreError>;

    /// Server-wide broadcast.
    async fn broadcast(&self, message: &str) -> Result<(), StoreError>;

    /// Credit currency to a player. Failures here must leave claim state
    /// untouched so the grant is retried.
    async fn add_currency(&self, player_id: &str, amount: i64) -> Result<(), StoreError>;
}

pub struct HttpGameClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    game_server_id: String,
}

impl HttpGameClient {
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

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let resp = req
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| StoreError::network(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::from_status(status.as_u16(), &body));
        }
        Ok(resp)
    }

    async fn execute_command(&self, command: &str) -> Result<(), StoreError> {
        let url = format!(
            "{}/gameservers/{}/command",
            self.base_url, self.game_server_id
        );
        debug!(command, "Executing game-server command");
        self.send(self.client.post(&url).json(&json!({ "command": command })))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl GameClient for HttpGameClient {
    async fn player_name(&self, player_id: &str) -> Result<Option<String>, StoreError> {
        #[derive(Deserialize)]
        struct Envelope {
            data: PlayerData,
        }
        #[derive(Deserialize)]
        struct PlayerData {
            name: Option<String>,
        }
        let url = format!("{}/players/{}", self.base_url, player_id);
        let resp = match self.send(self.client.get(&url)).await {
            Ok(r) => r,
            Err(e) if e.kind == crate::store::StoreErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let envelope: Envelope = resp.json().await.map_err(|e| StoreError {
            kind: crate::store::StoreErrorKind::Unknown,
            status: None,
            message: format!("malformed player response: {e}"),
        })?;
        Ok(envelope.data.name)
    }

    async fn online_player_ids(&self) -> Result<Vec<String>, StoreError> {
        #[derive(Deserialize)]
        struct Envelope {
            data: Vec<Pog>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Pog {
            player_id: String,
        }
        let url = format!("{}/gameservers/players/search", self.base_url);
        let body = json!({
            "filters": {
                "gameServerId": [self.game_server_id],
                "online": [true],
            },
            "limit": 1000,
        });
        let resp = self.send(self.client.post(&url).json(&body)).await?;
        let envelope: Envelope = resp.json().await.map_err(|e| StoreError {
            kind: crate::store::StoreErrorKind::Unknown,
            status: None,
            message: format!("malformed player search response: {e}"),
        })?;
        Ok(envelope.data.into_iter().map(|p| p.player_id).collect())
    }

    async fn send_pm(&self, player_name: &str, message: &str) -> Result<(), StoreError> {
        // Quotes inside either field would break the command line.
        let name = player_name.replace('"', "");
        let text = message.replace('"', "'");
        self.execute_command(&format!("pm \"{name}\" \"{text}\"")).await
    }

    async fn broadcast(&self, message: &str) -> Result<(), StoreError> {
        let text = message.replace('"', "'");
        self.execute_command(&format!("say \"{text}\"")).await
    }

    async fn add_currency(&self, player_id: &str, amount: i64) -> Result<(), StoreError> {
        let url = format!(
            "{}/gameservers/{}/players/{}/currency",
            self.base_url, self.game_server_id, player_id
        );
        self.send(self.client.post(&url).json(&json!({ "currency": amount })))
            .await?;
        Ok(())
    }
}
