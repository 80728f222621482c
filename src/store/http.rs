use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{NewVariable, StoreError, Variable, VariableQuery, VariableStore};

/// Platform responses wrap their payload in `{ "data": ... }`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// reqwest-backed client for the platform's variables API.
pub struct HttpVariableStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpVariableStore {
    pub fn new(base_url: &str, token: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn search_body(query: &VariableQuery) -> Value {
        let mut filters = Map::new();
        if let Some(key) = &query.key {
            filters.insert("key".into(), json!([key]));
        }
        if let Some(gs) = &query.game_server_id {
            filters.insert("gameServerId".into(), json!([gs]));
        }
        if let Some(pid) = &query.player_id {
            filters.insert("playerId".into(), json!([pid]));
        }
        if let Some(mid) = &query.module_id {
            filters.insert("moduleId".into(), json!([mid]));
        }
        let mut body = json!({
            "filters": Value::Object(filters),
            "limit": query.limit.max(1),
        });
        if let Some(cutoff) = &query.created_before {
            body["lessThan"] = json!({ "createdAt": cutoff.to_rfc3339() });
        }
        body
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
}

#[async_trait]
impl VariableStore for HttpVariableStore {
    async fn search(&self, query: &VariableQuery) -> Result<Vec<Variable>, StoreError> {
        let url = format!("{}/variables/search", self.base_url);
        let body = Self::search_body(query);
        debug!(url = %url, key = ?query.key, "Variable search");
        let resp = self.send(self.client.post(&url).json(&body)).await?;
        let envelope: Envelope<Vec<Variable>> = resp.json().await.map_err(|e| StoreError {
            kind: super::StoreErrorKind::Unknown,
            status: None,
            message: format!("malformed search response: {e}"),
        })?;
        Ok(envelope.data)
    }

    async fn create(&self, var: &NewVariable) -> Result<Variable, StoreError> {
        let url = format!("{}/variables", self.base_url);
        let mut body = json!({
            "key": var.key,
            "value": var.value,
            "gameServerId": var.game_server_id,
            "moduleId": var.module_id,
        });
        if let Some(pid) = &var.player_id {
            body["playerId"] = json!(pid);
        }
        let resp = self.send(self.client.post(&url).json(&body)).await?;
        let envelope: Envelope<Variable> = resp.json().await.map_err(|e| StoreError {
            kind: super::StoreErrorKind::Unknown,
            status: None,
            message: format!("malformed create response: {e}"),
        })?;
        Ok(envelope.data)
    }

    async fn update(&self, id: &str, value: &str) -> Result<(), StoreError> {
        let url = format!("{}/variables/{}", self.base_url, id);
        self.send(self.client.put(&url).json(&json!({ "value": value })))
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let url = format!("{}/variables/{}", self.base_url, id);
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }
}
