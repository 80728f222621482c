//! Variable-store access: the wire model, the `VariableStore` trait, and the
//! typed `RecordStore` layer every engine component goes through.

mod error;
mod http;

pub use error::{StoreError, StoreErrorKind};
pub use http::HttpVariableStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One key/value record as returned by the platform's variable search.
/// `value` is always a JSON-encoded string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub game_server_id: Option<String>,
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Exact-filter search request. Every field is optional; the platform ANDs
/// whatever is present.
#[derive(Debug, Clone, Default)]
pub struct VariableQuery {
    pub key: Option<String>,
    pub game_server_id: Option<String>,
    pub player_id: Option<String>,
    pub module_id: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Fields for creating a new variable.
#[derive(Debug, Clone)]
pub struct NewVariable {
    pub key: String,
    pub value: String,
    pub game_server_id: String,
    pub player_id: Option<String>,
    pub module_id: String,
}

/// Raw store operations. The platform has no native upsert; everything above
/// this trait is built from search-then-branch sequences.
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn search(&self, query: &VariableQuery) -> Result<Vec<Variable>, StoreError>;
    async fn create(&self, var: &NewVariable) -> Result<Variable, StoreError>;
    async fn update(&self, id: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Scope every engine read/write is confined to: one game server, one module,
/// optionally one player.
#[derive(Debug, Clone)]
pub struct RecordScope {
    pub game_server_id: String,
    pub module_id: String,
}

/// Typed adapter over the raw store. All reads are filtered by the full
/// (key, gameServerId, playerId?, moduleId) tuple so records owned by other
/// modules never leak into engine state.
pub struct RecordStore {
    store: std::sync::Arc<dyn VariableStore>,
    scope: RecordScope,
}

impl RecordStore {
    pub fn new(store: std::sync::Arc<dyn VariableStore>, scope: RecordScope) -> Self {
        Self { store, scope }
    }

    pub fn scope(&self) -> &RecordScope {
        &self.scope
    }

    fn scoped_query(&self, key: &str, player_id: Option<&str>) -> VariableQuery {
        VariableQuery {
            key: Some(key.to_string()),
            game_server_id: Some(self.scope.game_server_id.clone()),
            player_id: player_id.map(|p| p.to_string()),
            module_id: Some(self.scope.module_id.clone()),
            created_before: None,
            limit: 1,
        }
    }

    /// Find one record by exact key within our scope. A hit whose moduleId
    /// disagrees with ours is a key collision with another module; it is
    /// dropped, never trusted.
    pub async fn find(
        &self,
        key: &str,
        player_id: Option<&str>,
    ) -> Result<Option<Variable>, StoreError> {
        let found = self.store.search(&self.scoped_query(key, player_id)).await?;
        Ok(found.into_iter().find(|v| self.owns(v)))
    }

    /// Find the same key across *all* modules on our game server. Used only
    /// by the external-progress merge, which deliberately reads foreign
    /// copies of a quest key.
    pub async fn find_any_module(&self, key: &str) -> Result<Vec<Variable>, StoreError> {
        let query = VariableQuery {
            key: Some(key.to_string()),
            game_server_id: Some(self.scope.game_server_id.clone()),
            limit: 5,
            ..Default::default()
        };
        self.store.search(&query).await
    }

    /// List up to `limit` records in our scope, optionally for one player.
    /// Prefix filtering happens client-side; the platform only does exact
    /// key matches.
    pub async fn scan(
        &self,
        player_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Variable>, StoreError> {
        let query = VariableQuery {
            key: None,
            game_server_id: Some(self.scope.game_server_id.clone()),
            player_id: player_id.map(|p| p.to_string()),
            module_id: Some(self.scope.module_id.clone()),
            created_before: None,
            limit,
        };
        let found = self.store.search(&query).await?;
        Ok(found.into_iter().filter(|v| self.owns(v)).collect())
    }

    /// Records in our scope created before `cutoff`. Used by retention.
    pub async fn scan_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Variable>, StoreError> {
        let query = VariableQuery {
            game_server_id: Some(self.scope.game_server_id.clone()),
            module_id: Some(self.scope.module_id.clone()),
            created_before: Some(cutoff),
            limit,
            ..Default::default()
        };
        let found = self.store.search(&query).await?;
        Ok(found.into_iter().filter(|v| self.owns(v)).collect())
    }

    /// Search-then-branch write. Two concurrent upserts can both observe
    /// "not found" and both create; callers treat duplicate keys as
    /// equivalent and reconcile on the next pass.
    pub async fn upsert(
        &self,
        key: &str,
        player_id: Option<&str>,
        value: &str,
    ) -> Result<(), StoreError> {
        match self.find(key, player_id).await? {
            Some(existing) => self.store.update(&existing.id, value).await,
            None => {
                let var = NewVariable {
                    key: key.to_string(),
                    value: value.to_string(),
                    game_server_id: self.scope.game_server_id.clone(),
                    player_id: player_id.map(|p| p.to_string()),
                    module_id: self.scope.module_id.clone(),
                };
                self.store.create(&var).await.map(|_| ())
            }
        }
    }

    pub async fn update_by_id(&self, id: &str, value: &str) -> Result<(), StoreError> {
        self.store.update(id, value).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(id).await
    }

    fn owns(&self, var: &Variable) -> bool {
        let module_ok = match &var.module_id {
            Some(m) => *m == self.scope.module_id,
            // Module-less hits can only come from a misbehaving search;
            // treat them as foreign.
            None => false,
        };
        if !module_ok {
            warn!(
                key = %var.key,
                module_id = ?var.module_id,
                "Dropping record owned by a different module (key collision)"
            );
        }
        module_ok
    }
}
