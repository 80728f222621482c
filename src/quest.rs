//! Quest-type domain: the catalogue of daily objectives, their targets and
//! rewards, and the kill-classification policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::QuestConfig;

/// A named daily objective. Wire names are part of the stored key contract
/// and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestType {
    Vote,
    #[serde(rename = "levelgain")]
    LevelGain,
    #[serde(rename = "zombiekills")]
    ZombieKills,
    #[serde(rename = "feralkills")]
    FeralKills,
    #[serde(rename = "vulturekills")]
    VultureKills,
    #[serde(rename = "shopquest")]
    ShopQuest,
    #[serde(rename = "dieonce")]
    DieOnce,
    #[serde(rename = "timespent")]
    TimeSpent,
    Unkillable,
}

/// Types whose progress is driven by an updater outside this engine.
pub const EXTERNAL_TYPES: [QuestType; 2] = [QuestType::Vote, QuestType::LevelGain];

/// Always part of the daily rotation.
pub const ALWAYS_TYPES: [QuestType; 2] = [QuestType::Vote, QuestType::LevelGain];

/// Candidate pool the rotation draws the rest from. Order matters: it is
/// the input to the seeded shuffle and must stay stable across releases.
pub const POOL_TYPES: [QuestType; 7] = [
    QuestType::TimeSpent,
    QuestType::ZombieKills,
    QuestType::ShopQuest,
    QuestType::Unkillable,
    QuestType::FeralKills,
    QuestType::VultureKills,
    QuestType::DieOnce,
];

impl QuestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestType::Vote => "vote",
            QuestType::LevelGain => "levelgain",
            QuestType::ZombieKills => "zombiekills",
            QuestType::FeralKills => "feralkills",
            QuestType::VultureKills => "vulturekills",
            QuestType::ShopQuest => "shopquest",
            QuestType::DieOnce => "dieonce",
            QuestType::TimeSpent => "timespent",
            QuestType::Unkillable => "unkillable",
        }
    }

    pub fn parse(s: &str) -> Option<QuestType> {
        match s {
            "vote" => Some(QuestType::Vote),
            "levelgain" => Some(QuestType::LevelGain),
            "zombiekills" => Some(QuestType::ZombieKills),
            "feralkills" => Some(QuestType::FeralKills),
            "vulturekills" => Some(QuestType::VultureKills),
            "shopquest" => Some(QuestType::ShopQuest),
            "dieonce" => Some(QuestType::DieOnce),
            "timespent" => Some(QuestType::TimeSpent),
            "unkillable" => Some(QuestType::Unkillable),
            _ => None,
        }
    }

    /// Stylized name used in player-facing messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            QuestType::TimeSpent => "TIME SURVIVOR",
            QuestType::ShopQuest => "TRADE BEERS",
            QuestType::LevelGain => "EXPERIENCE GRINDER",
            QuestType::ZombieKills => "ZOMBIE HUNTER",
            QuestType::Vote => "SERVER SUPPORTER",
            QuestType::Unkillable => "UNKILLABLE",
            QuestType::FeralKills => "FERAL WHO?",
            QuestType::VultureKills => "COME DOWN!",
            QuestType::DieOnce => "DEATH? I DONT CARE",
        }
    }

    /// Duration quests measure progress in elapsed milliseconds; everything
    /// else counts discrete events.
    pub fn is_duration(&self) -> bool {
        matches!(self, QuestType::TimeSpent | QuestType::Unkillable)
    }

    /// Goal for this type: a count, or milliseconds for duration quests.
    pub fn target(&self, cfg: &QuestConfig) -> i64 {
        match self {
            QuestType::TimeSpent => cfg.targets.timespent_minutes * 60_000,
            QuestType::Unkillable => cfg.targets.unkillable_minutes * 60_000,
            QuestType::ZombieKills => cfg.targets.zombiekills,
            QuestType::FeralKills => cfg.targets.feralkills,
            QuestType::VultureKills => cfg.targets.vulturekills,
            QuestType::LevelGain => cfg.targets.levelgain,
            QuestType::ShopQuest => cfg.targets.shopquest,
            QuestType::DieOnce => cfg.targets.dieonce,
            QuestType::Vote => cfg.targets.vote,
        }
    }

    /// Currency granted on claim.
    pub fn reward(&self, cfg: &QuestConfig) -> i64 {
        match self {
            QuestType::Vote => cfg.rewards.vote,
            QuestType::Unkillable => cfg.rewards.unkillable,
            QuestType::DieOnce => cfg.rewards.dieonce,
            _ => cfg.rewards.default_amount,
        }
    }
}

impl std::fmt::Display for QuestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kill-count quests a single entity-kill event feeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KillClass {
    pub zombie: bool,
    pub feral: bool,
    pub vulture: bool,
}

/// Event-to-quest classification changed repeatedly across module versions,
/// so it lives behind a trait instead of being baked into the reconciler.
pub trait KillClassifier: Send + Sync {
    fn classify(&self, meta: &Value) -> KillClass;
}

/// Default policy: case-insensitive substring matching over the entity
/// metadata fields the game server is known to populate. Feral kills also
/// count as zombie kills.
#[derive(Debug, Default)]
pub struct SubstringClassifier;

impl SubstringClassifier {
    fn haystack(meta: &Value) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for field in ["msg", "entity", "entityName", "target", "entityClass"] {
            if let Some(s) = meta.get(field).and_then(|v| v.as_str()) {
                parts.push(s);
            }
        }
        parts.join(" ").to_lowercase()
    }
}

impl KillClassifier for SubstringClassifier {
    fn classify(&self, meta: &Value) -> KillClass {
        let text = Self::haystack(meta);
        let vulture = text.contains("vulture");
        let feral = text.contains("feral");
        let zombie = feral || text.contains("zomb");
        KillClass {
            zombie,
            feral,
            vulture,
        }
    }
}
