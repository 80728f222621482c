//! Completion & auto-claim pipeline.
//!
//! Detecting a completion and rewarding it are decoupled: the reconciler
//! appends to a per-player pending queue, and a separate drain pass grants
//! rewards once entries have aged past a short grace period so a burst of
//! near-simultaneous completions collapses into one message. Rewards are
//! at-least-once: a failed grant leaves the queue entry in place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::game::GameClient;
use crate::quest::QuestType;
use crate::records::{
    parse_pending_key, pending_key, quest_key, PendingClaims, QuestRecord, PENDING_KEY_PREFIX,
};
use crate::store::RecordStore;
use crate::utils::{local_date_string, local_yesterday_string};

pub struct ClaimPipeline {
    records: Arc<RecordStore>,
    game: Arc<dyn GameClient>,
    config: AppConfig,
}

impl ClaimPipeline {
    pub fn new(records: Arc<RecordStore>, game: Arc<dyn GameClient>, config: AppConfig) -> Self {
        Self {
            records,
            game,
            config,
        }
    }

    /// Queue a completion for delayed claiming, deduplicated by type.
    pub async fn enqueue_pending(
        &self,
        player_id: &str,
        date: &str,
        quest_type: QuestType,
        now_ms: i64,
    ) -> anyhow::Result<()> {
        let key = pending_key(player_id, date);
        let mut pending = match self.records.find(&key, Some(player_id)).await? {
            Some(var) => PendingClaims::parse(&var.value),
            None => PendingClaims::default(),
        };
        if pending.push(quest_type, now_ms) {
            self.records
                .upsert(&key, Some(player_id), &pending.to_value())
                .await?;
            info!(player_id, quest = %quest_type, "Queued completion for auto-claim");
        }
        Ok(())
    }

    /// One-time completion notice, sent on the completed edge.
    pub async fn notify_completion(&self, player_id: &str, quest_type: QuestType) {
        let name = match self.game.player_name(player_id).await {
            Ok(Some(name)) => name,
            _ => return, // offline or unresolvable; the reward still arrives
        };
        let text = format!(
            "✔ {} complete! Reward will be claimed shortly.",
            quest_type.display_name()
        );
        if let Err(e) = self.game.send_pm(&name, &text).await {
            warn!(player_id, error = %e, "Completion PM failed");
        }
    }

    /// Drain pass: grant rewards for pending entries older than the grace
    /// period. Safe to run on any cadence; each entry resolves exactly once.
    pub async fn run_drain_pass(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let offset = self.config.server.utc_offset_minutes;
        let today = local_date_string(now, offset);
        let yesterday = local_yesterday_string(now, offset);
        let now_ms = now.timestamp_millis();
        let grace = self.config.jobs.claim_grace_ms;

        // Yesterday's queues are included so a completion just before local
        // midnight is still rewarded before the reset reaps the records.
        let vars = self.records.scan(None, 1000).await?;
        for var in vars.into_iter().filter(|v| v.key.starts_with(PENDING_KEY_PREFIX)) {
            let Some((_, date)) = parse_pending_key(&var.key) else {
                continue;
            };
            if date != today && date != yesterday {
                continue;
            }
            let Some(player_id) = var.player_id.clone() else {
                warn!(key = %var.key, "Pending record without a player scope");
                continue;
            };
            if let Err(e) = self
                .drain_player(&var.id, &var.value, &player_id, &date, now_ms, grace)
                .await
            {
                warn!(player_id, error = %e, "Drain failed for player; will retry next pass");
            }
        }
        Ok(())
    }

    async fn drain_player(
        &self,
        pending_var_id: &str,
        pending_value: &str,
        player_id: &str,
        date: &str,
        now_ms: i64,
        grace_ms: i64,
    ) -> anyhow::Result<()> {
        let pending = PendingClaims::parse(pending_value);
        if pending.is_empty() {
            // Nothing to retry later either.
            self.records.delete(pending_var_id).await?;
            return Ok(());
        }

        let mut remaining = Vec::new();
        let mut claimed_count = 0u32;
        let mut total_reward = 0i64;

        for item in pending.items {
            if now_ms - item.completed_at < grace_ms {
                remaining.push(item);
                continue;
            }
            match self.claim_one(player_id, date, item.quest_type).await {
                Ok(ClaimOutcome::Granted(amount)) => {
                    claimed_count += 1;
                    total_reward += amount;
                }
                Ok(ClaimOutcome::Stale) => {
                    // Already claimed elsewhere or record gone: resolved,
                    // drop the entry without granting.
                }
                Err(e) => {
                    warn!(player_id, quest = %item.quest_type, error = %e,
                        "Reward grant failed; keeping pending entry");
                    remaining.push(item);
                }
            }
        }

        if remaining.is_empty() {
            self.records.delete(pending_var_id).await?;
        } else {
            let rewritten = PendingClaims { items: remaining };
            self.records
                .update_by_id(pending_var_id, &rewritten.to_value())
                .await?;
        }

        if claimed_count > 0 {
            self.send_batch_summary(player_id, claimed_count, total_reward)
                .await;
        }
        Ok(())
    }

    /// Grant one quest's reward. Re-validates `completed && !claimed`
    /// immediately before committing; a failed precondition is a no-op.
    /// `claimed` is only written after the grant succeeds.
    async fn claim_one(
        &self,
        player_id: &str,
        date: &str,
        quest_type: QuestType,
    ) -> anyhow::Result<ClaimOutcome> {
        let key = quest_key(player_id, date, quest_type);
        let Some(var) = self.records.find(&key, Some(player_id)).await? else {
            return Ok(ClaimOutcome::Stale);
        };
        let Some(mut quest) = QuestRecord::parse(&var.value, quest_type, &self.config.quests)
        else {
            return Ok(ClaimOutcome::Stale);
        };
        if !quest.completed || quest.claimed {
            return Ok(ClaimOutcome::Stale);
        }

        let amount = quest_type.reward(&self.config.quests);
        self.game.add_currency(player_id, amount).await?;

        quest.claimed = true;
        quest.last_updated = Some(Utc::now());
        self.records.update_by_id(&var.id, &quest.to_value()).await?;
        info!(player_id, quest = %quest_type, amount, "Reward claimed");
        Ok(ClaimOutcome::Granted(amount))
    }

    async fn send_batch_summary(&self, player_id: &str, count: u32, total: i64) {
        let Ok(Some(name)) = self.game.player_name(player_id).await else {
            return;
        };
        let quest_word = if count == 1 { "quest" } else { "quests" };
        let text = format!(
            "✪ Quest reward awarded ✪ {count} {quest_word} completed - {total} beers have been deposited to your account."
        );
        if let Err(e) = self.game.send_pm(&name, &text).await {
            warn!(player_id, error = %e, "Reward summary PM failed");
        }
    }
}

enum ClaimOutcome {
    Granted(i64),
    Stale,
}
