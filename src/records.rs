//! Record schema for everything the engine persists in the variable store,
//! plus the key-naming contract. Keys must stay bit-for-bit compatible with
//! existing deployments; changing a prefix strands live player data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::QuestConfig;
use crate::quest::QuestType;

/// Watermark of the last successfully completed reconciler pass.
pub const LAST_RUN_KEY: &str = "questTracker_last_run";
/// Global reset stamp: the local date the daily reset last ran.
pub const LAST_RESET_KEY: &str = "dailyquests_last_reset_at";
/// Today's rotation, written only by the reset coordinator.
pub const ACTIVE_TYPES_KEY: &str = "dailyquests_active_types";
/// Convenience mirror of the current local date.
pub const CURRENT_DATE_KEY: &str = "dailyquests_current_date";
/// Manual-remediation flag: "all" or a playerId. Deleted once honored.
pub const FORCE_RESET_KEY: &str = "dailyquests_force_reset";
/// Last reconciler error, for quick operator inspection.
pub const DIAG_KEY: &str = "questdiag_last_error";

pub const QUEST_KEY_PREFIX: &str = "dailyquest_";
pub const SESSION_KEY_PREFIX: &str = "session_";
pub const DEATHLESS_KEY_PREFIX: &str = "deathless_session_";
pub const PENDING_KEY_PREFIX: &str = "autoclaim_pending_";
pub const PLAYER_RESET_KEY_PREFIX: &str = "dailyquests_player_reset_at_";
pub const SEEN_EVENTS_KEY_PREFIX: &str = "dailyquest_seen_events_";

/// Prefixes subject to retention cleanup.
pub const RETAINED_PREFIXES: [&str; 6] = [
    QUEST_KEY_PREFIX,
    SESSION_KEY_PREFIX,
    DEATHLESS_KEY_PREFIX,
    PENDING_KEY_PREFIX,
    PLAYER_RESET_KEY_PREFIX,
    SEEN_EVENTS_KEY_PREFIX,
];

pub fn quest_key(player_id: &str, date: &str, quest_type: QuestType) -> String {
    format!("dailyquest_{player_id}_{date}_{quest_type}")
}

pub fn session_key(player_id: &str, date: &str) -> String {
    format!("session_{player_id}_{date}")
}

pub fn deathless_session_key(player_id: &str, date: &str) -> String {
    format!("deathless_session_{player_id}_{date}")
}

pub fn pending_key(player_id: &str, date: &str) -> String {
    format!("autoclaim_pending_{player_id}_{date}")
}

pub fn player_reset_key(player_id: &str, date: &str) -> String {
    format!("{PLAYER_RESET_KEY_PREFIX}{player_id}_{date}")
}

pub fn seen_events_key(date: &str) -> String {
    format!("{SEEN_EVENTS_KEY_PREFIX}{date}")
}

/// Decompose `dailyquest_{playerId}_{date}_{type}`. Player ids are platform
/// UUIDs and never contain underscores, so a plain split is safe.
pub fn parse_quest_key(key: &str) -> Option<(String, String, QuestType)> {
    let rest = key.strip_prefix(QUEST_KEY_PREFIX)?;
    let mut parts = rest.splitn(3, '_');
    let player_id = parts.next()?;
    let date = parts.next()?;
    let quest_type = QuestType::parse(parts.next()?)?;
    if player_id.is_empty() || date.is_empty() {
        return None;
    }
    Some((player_id.to_string(), date.to_string(), quest_type))
}

/// Decompose `autoclaim_pending_{playerId}_{date}`.
pub fn parse_pending_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix(PENDING_KEY_PREFIX)?;
    let mut parts = rest.splitn(2, '_');
    let player_id = parts.next()?;
    let date = parts.next()?;
    if player_id.is_empty() || date.is_empty() {
        return None;
    }
    Some((player_id.to_string(), date.to_string()))
}

/// One player's progress on one quest for one day.
///
/// `completed` and `claimed` are sticky: set once, never cleared outside an
/// explicit reset. `notified` guards the one-time completion PM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestRecord {
    #[serde(rename = "type")]
    pub quest_type: QuestType,
    #[serde(default)]
    pub target: i64,
    #[serde(default)]
    pub progress: i64,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub claimed: bool,
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl QuestRecord {
    pub fn fresh(quest_type: QuestType, date: &str, cfg: &QuestConfig, now: DateTime<Utc>) -> Self {
        Self {
            quest_type,
            target: quest_type.target(cfg),
            progress: 0,
            completed: false,
            claimed: false,
            notified: false,
            date: date.to_string(),
            created_at: Some(now),
            last_updated: Some(now),
        }
    }

    /// Parse a stored value and upgrade legacy shapes. Returns None for
    /// corrupt data: unparseable JSON, or a `type` field disagreeing with
    /// the type encoded in the key. The caller rebuilds a fresh record in
    /// that case rather than trusting partial data.
    pub fn parse(value: &str, expected: QuestType, cfg: &QuestConfig) -> Option<Self> {
        let mut record: QuestRecord = match serde_json::from_str(value) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Unparseable quest record");
                return None;
            }
        };
        if record.quest_type != expected {
            warn!(
                key_type = %expected,
                value_type = %record.quest_type,
                "Quest record type disagrees with its key"
            );
            return None;
        }
        record.normalize(cfg);
        Some(record)
    }

    /// Migration/normalization applied on every read: backfill a missing
    /// target (older module versions omitted it) and re-assert the clamp.
    pub fn normalize(&mut self, cfg: &QuestConfig) {
        if self.target <= 0 {
            self.target = self.quest_type.target(cfg);
        }
        if self.progress < 0 {
            self.progress = 0;
        }
        if self.completed {
            self.progress = self.progress.min(self.target);
        }
    }

    /// Bounded increment: `progress = min(progress + amount, target)`.
    /// Returns true exactly once, on the transition to completed. Claimed
    /// records are immutable.
    pub fn apply_increment(&mut self, amount: i64, now: DateTime<Utc>) -> bool {
        if self.claimed {
            return false;
        }
        let was_completed = self.completed;
        self.progress = (self.progress + amount.max(0)).min(self.target);
        if self.progress >= self.target {
            self.completed = true;
        }
        self.last_updated = Some(now);
        self.completed && !was_completed
    }

    /// Session-derived progress for duration quests. While incomplete the
    /// value follows the session exactly: a death restarts a survival
    /// session, so it may go down. Once completed it pins to target;
    /// claimed records stay untouched. Returns true on the completion edge.
    pub fn apply_duration(&mut self, progress: i64, now: DateTime<Utc>) -> bool {
        if self.claimed {
            return false;
        }
        let was_completed = self.completed;
        if self.completed {
            self.progress = self.target;
        } else {
            self.progress = progress.clamp(0, self.target);
            if self.progress >= self.target {
                self.completed = true;
            }
        }
        self.last_updated = Some(now);
        self.completed && !was_completed
    }

    /// Absolute progress for externally-fed quests. Never regresses, clamps
    /// to target. Returns true on the completion edge.
    pub fn apply_absolute(&mut self, progress: i64, now: DateTime<Utc>) -> bool {
        if self.claimed {
            return false;
        }
        let was_completed = self.completed;
        self.progress = self.progress.max(progress.max(0)).min(self.target);
        if self.progress >= self.target {
            self.completed = true;
        }
        self.last_updated = Some(now);
        self.completed && !was_completed
    }

    pub fn to_value(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Elapsed-time accumulator for continuous-duration quests.
/// `start_time` goes null while the player is offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub total_time: i64,
    #[serde(default)]
    pub last_update: i64,
}

impl SessionRecord {
    pub fn started(now_ms: i64) -> Self {
        Self {
            start_time: Some(now_ms),
            total_time: 0,
            last_update: now_ms,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match serde_json::from_str::<SessionRecord>(value) {
            Ok(mut s) => {
                if s.total_time < 0 {
                    s.total_time = 0;
                }
                Some(s)
            }
            Err(e) => {
                warn!(error = %e, "Unparseable session record");
                None
            }
        }
    }

    pub fn to_value(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// The day's rotation. Owned exclusively by the reset coordinator and
/// immutable for the day once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTypes {
    pub date: String,
    pub types: Vec<QuestType>,
}

impl ActiveTypes {
    /// Tolerant parse: unknown type names (from newer or older module
    /// versions) are dropped instead of failing the whole record.
    pub fn parse(value: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct Raw {
            date: String,
            types: Vec<serde_json::Value>,
        }
        let raw: Raw = serde_json::from_str(value).ok()?;
        let types = raw
            .types
            .iter()
            .filter_map(|v| v.as_str().and_then(QuestType::parse))
            .collect();
        Some(Self {
            date: raw.date,
            types,
        })
    }

    pub fn to_value(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A completion awaiting its delayed reward grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingItem {
    #[serde(rename = "type")]
    pub quest_type: QuestType,
    pub completed_at: i64,
}

/// Per-player pending-claim queue. A type appears at most once; entries are
/// removed once their reward has been granted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingClaims {
    pub items: Vec<PendingItem>,
}

impl PendingClaims {
    pub fn parse(value: &str) -> Self {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            items: Vec<serde_json::Value>,
        }
        let raw: Raw = match serde_json::from_str(value) {
            Ok(r) => r,
            Err(_) => return Self::default(),
        };
        let items = raw
            .items
            .into_iter()
            .filter_map(|v| serde_json::from_value::<PendingItem>(v).ok())
            .collect();
        Self { items }
    }

    /// Append deduplicated by type. Returns false if the type was already
    /// queued.
    pub fn push(&mut self, quest_type: QuestType, now_ms: i64) -> bool {
        if self.items.iter().any(|i| i.quest_type == quest_type) {
            return false;
        }
        self.items.push(PendingItem {
            quest_type,
            completed_at: now_ms,
        });
        true
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_value(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"items\":[]}".to_string())
    }
}

/// Dedup set for event streams that can describe the same underlying game
/// action twice (shop completion vs currency deduction). Bounded so the
/// record cannot grow without limit within a day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeenEvents {
    pub ids: Vec<String>,
}

impl SeenEvents {
    const CAP: usize = 500;

    pub fn parse(value: &str) -> Self {
        serde_json::from_str(value).unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id)
    }

    /// Insert, evicting oldest entries past the cap. Returns false if the
    /// id was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        self.ids.push(id.to_string());
        if self.ids.len() > Self::CAP {
            let excess = self.ids.len() - Self::CAP;
            self.ids.drain(..excess);
        }
        true
    }

    pub fn to_value(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"ids\":[]}".to_string())
    }
}

/// Reset stamps were written as epoch milliseconds by some module versions
/// and ISO timestamps by others. Accept both; anything else is zero.
pub fn parse_stamp_ms(raw: &str) -> i64 {
    let trimmed = raw.trim().trim_matches('"');
    if let Ok(n) = trimmed.parse::<i64>() {
        if n > 0 {
            return n;
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return dt.timestamp_millis();
    }
    0
}
