//! Daily reset coordination.
//!
//! The reset is a state machine over the persisted reset stamp, not a timer:
//! any pass observing local time at or past the configured reset time with a
//! stale stamp performs the rollover. A pass that crashes midway leaves the
//! stamp unwritten only if it failed before the commit point, in which case
//! the next pass redoes the whole thing; redoing is harmless because every
//! step is an idempotent upsert keyed on today's date.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::game::GameClient;
use crate::quest::QuestType;
use crate::records::{
    self, deathless_session_key, parse_quest_key, pending_key, player_reset_key, quest_key,
    session_key, ActiveTypes, QuestRecord, SessionRecord, ACTIVE_TYPES_KEY, CURRENT_DATE_KEY,
    FORCE_RESET_KEY, LAST_RESET_KEY,
};
use crate::rotation::select_types;
use crate::store::RecordStore;
use crate::utils::{at_or_after, local_date_string};

const REFRESH_BROADCAST: &str = "Daily quests have been refreshed. Good luck!";

pub struct ResetCoordinator {
    records: Arc<RecordStore>,
    game: Arc<dyn GameClient>,
    config: AppConfig,
}

impl ResetCoordinator {
    pub fn new(records: Arc<RecordStore>, game: Arc<dyn GameClient>, config: AppConfig) -> Self {
        Self {
            records,
            game,
            config,
        }
    }

    /// One coordinator pass: honor any manual force-reset flag, then run the
    /// scheduled rollover if it is due and has not happened today.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let offset = self.config.server.utc_offset_minutes;
        let today = local_date_string(now, offset);

        if let Some(force) = self.records.find(FORCE_RESET_KEY, None).await? {
            self.honor_force_flag(&force.id, &force.value, &today, now)
                .await?;
        }

        let (hh, mm) = self.config.reset_hhmm();
        if !at_or_after(now, offset, hh, mm) {
            return Ok(());
        }
        let stamp = self
            .records
            .find(LAST_RESET_KEY, None)
            .await?
            .map(|v| v.value);
        if stamp.as_deref() == Some(today.as_str()) {
            return Ok(());
        }

        self.perform_reset(&today, now).await
    }

    /// `dailyquests_force_reset` holds "all" or a single playerId. The flag
    /// is deleted before acting so a crash mid-reset cannot loop on it.
    async fn honor_force_flag(
        &self,
        flag_id: &str,
        flag_value: &str,
        today: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let target = flag_value.trim().trim_matches('"').to_string();
        self.records.delete(flag_id).await?;
        info!(target, "Honoring force-reset flag");
        if target.eq_ignore_ascii_case("all") || target.is_empty() {
            self.perform_reset(today, now).await
        } else {
            let types = self.todays_types(today).await;
            self.reset_player(&target, today, &types, now, true).await
        }
    }

    /// The full daily rollover. Order matters: the rotation and date records
    /// are committed first so a concurrent reconciler pass immediately sees
    /// today's types; the stamp goes last, marking the reset Done.
    async fn perform_reset(&self, today: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        let types = select_types(
            today,
            &self.records.scope().game_server_id,
            &self.config.quests,
        );
        info!(date = today, ?types, "Running daily quest reset");

        let active = ActiveTypes {
            date: today.to_string(),
            types: types.clone(),
        };
        self.records
            .upsert(ACTIVE_TYPES_KEY, None, &active.to_value())
            .await?;
        self.records.upsert(CURRENT_DATE_KEY, None, today).await?;

        for player_id in self.known_players().await? {
            if let Err(e) = self.reset_player(&player_id, today, &types, now, false).await {
                warn!(player_id, error = %e, "Player reset failed; next pass retries");
            }
        }

        self.records.upsert(LAST_RESET_KEY, None, today).await?;

        if let Err(e) = self.game.broadcast(REFRESH_BROADCAST).await {
            warn!(error = %e, "Refresh broadcast failed");
        }
        Ok(())
    }

    /// Everyone with quest records in the store plus everyone currently
    /// online, so both returning and brand-new players get today's set.
    async fn known_players(&self) -> anyhow::Result<Vec<String>> {
        let mut players: HashSet<String> = HashSet::new();
        for var in self.records.scan(None, 1000).await? {
            if let Some((player_id, _, _)) = parse_quest_key(&var.key) {
                players.insert(player_id);
            }
        }
        match self.game.online_player_ids().await {
            Ok(online) => players.extend(online),
            Err(e) => warn!(error = %e, "Online snapshot unavailable during reset"),
        }
        Ok(players.into_iter().collect())
    }

    /// Roll one player over to today's quest set.
    ///
    /// Stale (non-today) per-player records are deleted; today's records are
    /// left alone so a re-run never wipes progress made since the first
    /// attempt. `wipe_today` is the force-reset path, which does start over.
    async fn reset_player(
        &self,
        player_id: &str,
        today: &str,
        types: &[QuestType],
        now: DateTime<Utc>,
        wipe_today: bool,
    ) -> anyhow::Result<()> {
        let now_ms = now.timestamp_millis();

        for var in self.records.scan(Some(player_id), 500).await? {
            // The date is embedded in every per-player key.
            let stale = !var.key.contains(today) || wipe_today;
            let ours = records::RETAINED_PREFIXES
                .iter()
                .any(|p| var.key.starts_with(p));
            if stale && ours {
                if let Err(e) = self.records.delete(&var.id).await {
                    warn!(key = %var.key, error = %e, "Stale record delete failed");
                }
            }
        }

        let online = match self.game.online_player_ids().await {
            Ok(ids) => ids.contains(&player_id.to_string()),
            Err(_) => false,
        };

        for quest_type in types {
            let key = quest_key(player_id, today, *quest_type);
            if !wipe_today && self.records.find(&key, Some(player_id)).await?.is_some() {
                continue; // progress made since a partial reset survives
            }
            let fresh = QuestRecord::fresh(*quest_type, today, &self.config.quests, now);
            self.records
                .upsert(&key, Some(player_id), &fresh.to_value())
                .await?;
        }

        if self.config.quests.enable_time_tracking {
            let session = if online {
                SessionRecord::started(now_ms)
            } else {
                SessionRecord {
                    start_time: None,
                    total_time: 0,
                    last_update: now_ms,
                }
            };
            if types.contains(&QuestType::TimeSpent) {
                self.records
                    .upsert(&session_key(player_id, today), Some(player_id), &session.to_value())
                    .await?;
            }
            if types.contains(&QuestType::Unkillable) {
                self.records
                    .upsert(
                        &deathless_session_key(player_id, today),
                        Some(player_id),
                        &session.to_value(),
                    )
                    .await?;
            }
        }

        // The per-player stamp fences survival progress earned before this
        // rollover out of today's quests.
        self.records
            .upsert(
                &player_reset_key(player_id, today),
                Some(player_id),
                &now_ms.to_string(),
            )
            .await?;

        // A leftover pending queue from a forced mid-day reset would grant
        // rewards for quests that no longer exist.
        if wipe_today {
            if let Some(pending) = self
                .records
                .find(&pending_key(player_id, today), Some(player_id))
                .await?
            {
                self.records.delete(&pending.id).await?;
            }
        }
        Ok(())
    }

    async fn todays_types(&self, today: &str) -> Vec<QuestType> {
        if let Ok(Some(var)) = self.records.find(ACTIVE_TYPES_KEY, None).await {
            if let Some(active) = ActiveTypes::parse(&var.value) {
                if active.date == today && !active.types.is_empty() {
                    return active.types;
                }
            }
        }
        select_types(
            today,
            &self.records.scope().game_server_id,
            &self.config.quests,
        )
    }
}
