use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub quests: QuestConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    /// Platform API token. Usually supplied via QUESTKEEPER_API_TOKEN
    /// rather than checked into config.toml.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub game_server_id: String,
    pub module_id: String,
    /// Minutes east of UTC for the server's calendar day. The reference
    /// deployment runs on Prague time.
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

fn default_utc_offset_minutes() -> i32 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuestConfig {
    /// HH:MM local time at which the daily reset becomes eligible.
    #[serde(default = "default_reset_time")]
    pub reset_time: String,
    /// How many quests are active per day, always-included types counted.
    #[serde(default = "default_total_daily")]
    pub total_daily: usize,
    #[serde(default = "default_enable_time_tracking")]
    pub enable_time_tracking: bool,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
}

impl Default for QuestConfig {
    fn default() -> Self {
        Self {
            reset_time: default_reset_time(),
            total_daily: default_total_daily(),
            enable_time_tracking: default_enable_time_tracking(),
            targets: TargetsConfig::default(),
            rewards: RewardsConfig::default(),
        }
    }
}

fn default_reset_time() -> String {
    "00:15".to_string()
}

fn default_total_daily() -> usize {
    5
}

fn default_enable_time_tracking() -> bool {
    true
}

/// Per-type goal overrides. Time quests are configured in minutes and
/// converted to milliseconds where they are consumed.
#[derive(Debug, Deserialize, Clone)]
pub struct TargetsConfig {
    #[serde(default = "default_timespent_minutes")]
    pub timespent_minutes: i64,
    #[serde(default = "default_unkillable_minutes")]
    pub unkillable_minutes: i64,
    #[serde(default = "default_zombiekills")]
    pub zombiekills: i64,
    #[serde(default = "default_feralkills")]
    pub feralkills: i64,
    #[serde(default = "default_vulturekills")]
    pub vulturekills: i64,
    #[serde(default = "default_levelgain")]
    pub levelgain: i64,
    #[serde(default = "default_one")]
    pub shopquest: i64,
    #[serde(default = "default_one")]
    pub dieonce: i64,
    #[serde(default = "default_one")]
    pub vote: i64,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            timespent_minutes: default_timespent_minutes(),
            unkillable_minutes: default_unkillable_minutes(),
            zombiekills: default_zombiekills(),
            feralkills: default_feralkills(),
            vulturekills: default_vulturekills(),
            levelgain: default_levelgain(),
            shopquest: default_one(),
            dieonce: default_one(),
            vote: default_one(),
        }
    }
}

fn default_timespent_minutes() -> i64 {
    60
}
fn default_unkillable_minutes() -> i64 {
    180
}
fn default_zombiekills() -> i64 {
    200
}
fn default_feralkills() -> i64 {
    10
}
fn default_vulturekills() -> i64 {
    10
}
fn default_levelgain() -> i64 {
    5
}
fn default_one() -> i64 {
    1
}

/// Reward amounts in server currency ("beers" on the reference server).
#[derive(Debug, Deserialize, Clone)]
pub struct RewardsConfig {
    #[serde(default = "default_reward")]
    pub default_amount: i64,
    #[serde(default = "default_big_reward")]
    pub vote: i64,
    #[serde(default = "default_big_reward")]
    pub unkillable: i64,
    #[serde(default = "default_big_reward")]
    pub dieonce: i64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            default_amount: default_reward(),
            vote: default_big_reward(),
            unkillable: default_big_reward(),
            dieonce: default_big_reward(),
        }
    }
}

fn default_reward() -> i64 {
    25
}
fn default_big_reward() -> i64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_tracker_interval_secs")]
    pub tracker_interval_secs: u64,
    #[serde(default = "default_claim_interval_secs")]
    pub claim_interval_secs: u64,
    #[serde(default = "default_reset_interval_secs")]
    pub reset_interval_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Soft wall-clock budget for one tracker pass.
    #[serde(default = "default_pass_budget_ms")]
    pub pass_budget_ms: u64,
    /// Grace period before a completed quest's reward is granted.
    #[serde(default = "default_claim_grace_ms")]
    pub claim_grace_ms: i64,
    /// Upper bound on time credited per tracker tick.
    #[serde(default = "default_tick_cap_ms")]
    pub tick_cap_ms: i64,
    #[serde(default = "default_event_page_limit")]
    pub event_page_limit: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            tracker_interval_secs: default_tracker_interval_secs(),
            claim_interval_secs: default_claim_interval_secs(),
            reset_interval_secs: default_reset_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            pass_budget_ms: default_pass_budget_ms(),
            claim_grace_ms: default_claim_grace_ms(),
            tick_cap_ms: default_tick_cap_ms(),
            event_page_limit: default_event_page_limit(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_tracker_interval_secs() -> u64 {
    60
}
fn default_claim_interval_secs() -> u64 {
    15
}
fn default_reset_interval_secs() -> u64 {
    60
}
fn default_cleanup_interval_secs() -> u64 {
    21600
}
fn default_pass_budget_ms() -> u64 {
    6000
}
fn default_claim_grace_ms() -> i64 {
    5000
}
fn default_tick_cap_ms() -> i64 {
    300_000
}
fn default_event_page_limit() -> usize {
    300
}
fn default_retention_days() -> i64 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 {
    3939
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;
        if config.api.token.is_empty() {
            if let Ok(token) = std::env::var("QUESTKEEPER_API_TOKEN") {
                config.api.token = token;
            }
        }
        Ok(config)
    }

    /// Parse quests.reset_time into (hour, minute). Falls back to 00:15 on
    /// malformed input rather than refusing to start.
    pub fn reset_hhmm(&self) -> (u32, u32) {
        let mut parts = self.quests.reset_time.splitn(2, ':');
        let h = parts.next().and_then(|s| s.trim().parse().ok());
        let m = parts.next().and_then(|s| s.trim().parse().ok());
        match (h, m) {
            (Some(h), Some(m)) if h < 24 && m < 60 => (h, m),
            _ => (0, 15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
[api]
base_url = "https://api.takaro.example"
token = "t0ken"

[server]
game_server_id = "gs-1"
module_id = "mod-1"
"#
    }

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(minimal_toml().as_bytes()).unwrap();
        let cfg = AppConfig::load(f.path()).unwrap();
        assert_eq!(cfg.quests.reset_time, "00:15");
        assert_eq!(cfg.quests.total_daily, 5);
        assert_eq!(cfg.quests.targets.zombiekills, 200);
        assert_eq!(cfg.quests.rewards.default_amount, 25);
        assert_eq!(cfg.jobs.tick_cap_ms, 300_000);
        assert_eq!(cfg.jobs.claim_grace_ms, 5000);
        assert_eq!(cfg.server.utc_offset_minutes, 120);
    }

    #[test]
    fn test_reset_hhmm_parsing() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(minimal_toml().as_bytes()).unwrap();
        let mut cfg = AppConfig::load(f.path()).unwrap();
        assert_eq!(cfg.reset_hhmm(), (0, 15));
        cfg.quests.reset_time = "06:30".to_string();
        assert_eq!(cfg.reset_hhmm(), (6, 30));
        cfg.quests.reset_time = "junk".to_string();
        assert_eq!(cfg.reset_hhmm(), (0, 15));
        cfg.quests.reset_time = "25:00".to_string();
        assert_eq!(cfg.reset_hhmm(), (0, 15));
    }
}
