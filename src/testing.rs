//! Test infrastructure: in-memory variable store, scripted event feed, and a
//! recording game client with failure injection. Lets integration tests
//! exercise the real reconcile/claim/reset passes with a controlled clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::events::{EventFeed, GameEvent};
use crate::game::GameClient;
use crate::store::{NewVariable, StoreError, StoreErrorKind, Variable, VariableQuery, VariableStore};

// ---------------------------------------------------------------------------
// MemoryVariableStore
// ---------------------------------------------------------------------------

/// In-memory stand-in for the platform variables API. Same observable
/// semantics: exact-filter search, no native upsert, string values.
pub struct MemoryVariableStore {
    vars: Mutex<Vec<Variable>>,
    next_id: AtomicU32,
}

impl MemoryVariableStore {
    pub fn new() -> Self {
        Self {
            vars: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Seed a record directly, bypassing scope plumbing.
    pub fn seed(
        &self,
        key: &str,
        value: &str,
        game_server_id: &str,
        player_id: Option<&str>,
        module_id: Option<&str>,
    ) -> String {
        self.seed_created_at(key, value, game_server_id, player_id, module_id, Utc::now())
    }

    pub fn seed_created_at(
        &self,
        key: &str,
        value: &str,
        game_server_id: &str,
        player_id: Option<&str>,
        module_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> String {
        let id = format!("var-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut vars = self.vars.lock().unwrap_or_else(|e| e.into_inner());
        vars.push(Variable {
            id: id.clone(),
            key: key.to_string(),
            value: value.to_string(),
            game_server_id: Some(game_server_id.to_string()),
            player_id: player_id.map(|p| p.to_string()),
            module_id: module_id.map(|m| m.to_string()),
            created_at,
        });
        id
    }

    pub fn get_value(&self, key: &str) -> Option<String> {
        let vars = self.vars.lock().unwrap_or_else(|e| e.into_inner());
        vars.iter().find(|v| v.key == key).map(|v| v.value.clone())
    }

    pub fn count_with_key(&self, key: &str) -> usize {
        let vars = self.vars.lock().unwrap_or_else(|e| e.into_inner());
        vars.iter().filter(|v| v.key == key).count()
    }

}

impl Default for MemoryVariableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VariableStore for MemoryVariableStore {
    async fn search(&self, query: &VariableQuery) -> Result<Vec<Variable>, StoreError> {
        let vars = self.vars.lock().unwrap_or_else(|e| e.into_inner());
        let matches = vars
            .iter()
            .filter(|v| {
                query.key.as_ref().map_or(true, |k| v.key == *k)
                    && query
                        .game_server_id
                        .as_ref()
                        .map_or(true, |g| v.game_server_id.as_deref() == Some(g.as_str()))
                    && query
                        .player_id
                        .as_ref()
                        .map_or(true, |p| v.player_id.as_deref() == Some(p.as_str()))
                    && query
                        .module_id
                        .as_ref()
                        .map_or(true, |m| v.module_id.as_deref() == Some(m.as_str()))
                    && query.created_before.map_or(true, |c| v.created_at < c)
            })
            .take(query.limit.max(1))
            .cloned()
            .collect();
        Ok(matches)
    }

    async fn create(&self, var: &NewVariable) -> Result<Variable, StoreError> {
        let id = self.seed(
            &var.key,
            &var.value,
            &var.game_server_id,
            var.player_id.as_deref(),
            Some(var.module_id.as_str()),
        );
        let vars = self.vars.lock().unwrap_or_else(|e| e.into_inner());
        Ok(vars.iter().find(|v| v.id == id).cloned().unwrap())
    }

    async fn update(&self, id: &str, value: &str) -> Result<(), StoreError> {
        let mut vars = self.vars.lock().unwrap_or_else(|e| e.into_inner());
        match vars.iter_mut().find(|v| v.id == id) {
            Some(v) => {
                v.value = value.to_string();
                Ok(())
            }
            None => Err(StoreError {
                kind: StoreErrorKind::NotFound,
                status: Some(404),
                message: format!("no variable {id}"),
            }),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut vars = self.vars.lock().unwrap_or_else(|e| e.into_inner());
        let before = vars.len();
        vars.retain(|v| v.id != id);
        if vars.len() == before {
            return Err(StoreError {
                kind: StoreErrorKind::NotFound,
                status: Some(404),
                message: format!("no variable {id}"),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockEventFeed
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockEventFeed {
    events: Mutex<HashMap<String, Vec<GameEvent>>>,
    fail_fetches: Mutex<HashMap<String, usize>>,
}

impl MockEventFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        event_name: &str,
        id: &str,
        player_id: Option<&str>,
        meta: serde_json::Value,
        created_at: DateTime<Utc>,
    ) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.entry(event_name.to_string()).or_default().push(GameEvent {
            id: id.to_string(),
            player_id: player_id.map(|p| p.to_string()),
            meta,
            created_at,
        });
    }

    /// Script the next `n` fetches of one event class to fail.
    pub fn fail_next_fetches(&self, event_name: &str, n: usize) {
        self.fail_fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(event_name.to_string(), n);
    }
}

#[async_trait]
impl EventFeed for MockEventFeed {
    async fn events_since(
        &self,
        event_name: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<GameEvent>, StoreError> {
        {
            let mut fails = self.fail_fetches.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(remaining) = fails.get_mut(event_name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError {
                        kind: StoreErrorKind::ServerError,
                        status: Some(503),
                        message: "scripted fetch failure".to_string(),
                    });
                }
            }
        }
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<GameEvent> = events
            .get(event_name)
            .map(|v| {
                v.iter()
                    .filter(|e| e.created_at > since)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matched.sort_by_key(|e| e.created_at);
        Ok(matched)
    }
}

// ---------------------------------------------------------------------------
// MockGameClient
// ---------------------------------------------------------------------------

/// Records every outbound call; currency grants can be scripted to fail the
/// next N times for at-least-once tests.
#[derive(Default)]
pub struct MockGameClient {
    pub names: Mutex<HashMap<String, String>>,
    pub online: Mutex<Vec<String>>,
    pub pms: Mutex<Vec<(String, String)>>,
    pub broadcasts: Mutex<Vec<String>>,
    pub grants: Mutex<Vec<(String, i64)>>,
    fail_grants: AtomicUsize,
}

impl MockGameClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_name(&self, player_id: &str, name: &str) {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(player_id.to_string(), name.to_string());
    }

    pub fn set_online(&self, player_ids: &[&str]) {
        *self.online.lock().unwrap_or_else(|e| e.into_inner()) =
            player_ids.iter().map(|p| p.to_string()).collect();
    }

    pub fn fail_next_grants(&self, n: usize) {
        self.fail_grants.store(n, Ordering::SeqCst);
    }

    pub fn granted_total(&self, player_id: &str) -> i64 {
        self.grants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(p, _)| p == player_id)
            .map(|(_, a)| a)
            .sum()
    }
}

#[async_trait]
impl GameClient for MockGameClient {
    async fn player_name(&self, player_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(player_id)
            .cloned())
    }

    async fn online_player_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.online.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn send_pm(&self, player_name: &str, message: &str) -> Result<(), StoreError> {
        self.pms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((player_name.to_string(), message.to_string()));
        Ok(())
    }

    async fn broadcast(&self, message: &str) -> Result<(), StoreError> {
        self.broadcasts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
        Ok(())
    }

    async fn add_currency(&self, player_id: &str, amount: i64) -> Result<(), StoreError> {
        let remaining = self.fail_grants.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_grants.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError {
                kind: StoreErrorKind::ServerError,
                status: Some(503),
                message: "scripted grant failure".to_string(),
            });
        }
        self.grants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((player_id.to_string(), amount));
        Ok(())
    }
}
