//! Progress reconciler: the periodic pass that turns game events and the
//! online-player snapshot into quest-record state transitions.
//!
//! Every invocation is a stateless function of (store contents, event feed,
//! wall clock). Reprocessing is safe by construction: counts derive from a
//! watermark cursor, currency-linked completions from an explicit dedup set,
//! and time quests from session records. A local failure is logged and
//! isolated per player/event; it never stalls the rest of the pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::claims::ClaimPipeline;
use crate::config::AppConfig;
use crate::events::{
    EventFeed, GameEvent, EVENT_CURRENCY_DEDUCTED, EVENT_ENTITY_KILLED, EVENT_PLAYER_DEATH,
    EVENT_SHOP_ORDER,
};
use crate::game::GameClient;
use crate::quest::{KillClassifier, QuestType, EXTERNAL_TYPES};
use crate::records::{
    self, deathless_session_key, parse_quest_key, player_reset_key, quest_key, seen_events_key,
    session_key, ActiveTypes, QuestRecord, SeenEvents, SessionRecord, DIAG_KEY, LAST_RESET_KEY,
    LAST_RUN_KEY, QUEST_KEY_PREFIX,
};
use crate::rotation::select_types;
use crate::session_time;
use crate::store::{RecordStore, StoreError};
use crate::utils::{local_date_string, local_yesterday_string};

/// Soft wall-clock budget for one pass. When it runs out, remaining work is
/// abandoned and the next scheduled pass picks up from the watermark.
struct PassBudget {
    deadline: Instant,
}

impl PassBudget {
    fn new(budget_ms: u64) -> Self {
        Self {
            deadline: Instant::now() + Duration::from_millis(budget_ms),
        }
    }

    fn within(&self) -> bool {
        Instant::now() < self.deadline
    }
}

pub struct ProgressReconciler {
    records: Arc<RecordStore>,
    events: Arc<dyn EventFeed>,
    game: Arc<dyn GameClient>,
    claims: Arc<ClaimPipeline>,
    classifier: Box<dyn KillClassifier>,
    config: AppConfig,
}

impl ProgressReconciler {
    pub fn new(
        records: Arc<RecordStore>,
        events: Arc<dyn EventFeed>,
        game: Arc<dyn GameClient>,
        claims: Arc<ClaimPipeline>,
        classifier: Box<dyn KillClassifier>,
        config: AppConfig,
    ) -> Self {
        Self {
            records,
            events,
            game,
            claims,
            classifier,
            config,
        }
    }

    /// One reconciler pass.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let offset = self.config.server.utc_offset_minutes;
        let today = local_date_string(now, offset);

        // Until the daily reset has run for today, keep reconciling
        // yesterday's records; the rotation hasn't rolled over yet.
        let last_reset = self
            .records
            .find(LAST_RESET_KEY, None)
            .await?
            .map(|v| v.value);
        let date = if last_reset.as_deref() == Some(today.as_str()) {
            today
        } else {
            local_yesterday_string(now, offset)
        };

        let active = self.active_types(&date).await;
        let watermark = self.load_watermark(now).await;
        let budget = PassBudget::new(self.config.jobs.pass_budget_ms);

        let events_complete = self
            .process_events(&date, &active, watermark, now, &budget)
            .await;

        if budget.within() {
            self.sync_external(&date, &active, now).await;
        }

        if budget.within() {
            self.update_time_quests(&date, &active, now, &budget).await;
        }

        // The watermark advances only after every event class was fully
        // processed; a budget exhaustion or crash mid-pass re-processes
        // rather than silently skipping events.
        if events_complete {
            self.records
                .upsert(LAST_RUN_KEY, None, &now.to_rfc3339())
                .await?;
        } else {
            info!("Pass budget exhausted; watermark held for re-processing");
        }
        Ok(())
    }

    /// Today's rotation, preferring the persisted record and falling back
    /// to the deterministic recomputation when it is missing or stale.
    async fn active_types(&self, date: &str) -> HashSet<QuestType> {
        if let Ok(Some(var)) = self.records.find(records::ACTIVE_TYPES_KEY, None).await {
            if let Some(parsed) = ActiveTypes::parse(&var.value) {
                if parsed.date == date && !parsed.types.is_empty() {
                    return parsed.types.into_iter().collect();
                }
            }
        }
        select_types(date, &self.records.scope().game_server_id, &self.config.quests)
            .into_iter()
            .collect()
    }

    async fn load_watermark(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let fallback = now - chrono::Duration::minutes(5);
        match self.records.find(LAST_RUN_KEY, None).await {
            Ok(Some(var)) => DateTime::parse_from_rfc3339(var.value.trim().trim_matches('"'))
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(fallback),
            _ => fallback,
        }
    }

    /// Event-derived progress. Returns true when every class was fully
    /// processed within the budget.
    async fn process_events(
        &self,
        date: &str,
        active: &HashSet<QuestType>,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        budget: &PassBudget,
    ) -> bool {
        let limit = self.config.jobs.event_page_limit;

        let kill_types = [
            QuestType::ZombieKills,
            QuestType::FeralKills,
            QuestType::VultureKills,
        ];
        if kill_types.iter().any(|t| active.contains(t)) {
            let kills = match self.events.events_since(EVENT_ENTITY_KILLED, since, limit).await {
                Ok(events) => events,
                Err(e) => {
                    self.record_fetch_diag("kill", &e, now).await;
                    return false;
                }
            };
            for event in &kills {
                if !budget.within() {
                    return false;
                }
                self.apply_kill_event(event, date, active, now).await;
            }
        }

        if active.contains(&QuestType::ShopQuest) {
            if !self
                .process_shop_streams(date, since, now, budget, limit)
                .await
            {
                return false;
            }
        }

        if active.contains(&QuestType::DieOnce) || active.contains(&QuestType::Unkillable) {
            let deaths = match self.events.events_since(EVENT_PLAYER_DEATH, since, limit).await {
                Ok(events) => events,
                Err(e) => {
                    self.record_fetch_diag("death", &e, now).await;
                    return false;
                }
            };
            for event in &deaths {
                if !budget.within() {
                    return false;
                }
                self.apply_death_event(event, date, active, now).await;
            }
        }

        true
    }

    async fn apply_kill_event(
        &self,
        event: &GameEvent,
        date: &str,
        active: &HashSet<QuestType>,
        now: DateTime<Utc>,
    ) {
        let Some(player_id) = event.player_id.as_deref() else {
            return;
        };
        let class = self.classifier.classify(&event.meta);
        let mut touched: Vec<QuestType> = Vec::new();
        if class.zombie {
            touched.push(QuestType::ZombieKills);
        }
        if class.feral {
            touched.push(QuestType::FeralKills);
        }
        if class.vulture {
            touched.push(QuestType::VultureKills);
        }
        for quest_type in touched {
            if !active.contains(&quest_type) {
                continue;
            }
            if let Err(e) = self.increment_quest(player_id, date, quest_type, 1, now).await {
                warn!(player_id, quest = %quest_type, error = %e, "Kill increment failed");
                self.record_diag(&format!("kill increment failed: {e}"), now).await;
            }
        }
    }

    /// Shop completions arrive on two streams (order-status events and
    /// currency deductions) that can describe the same purchase. Both are
    /// funneled through one dedup set keyed by order id (falling back to
    /// event id) so a purchase counts once no matter which streams carry it.
    async fn process_shop_streams(
        &self,
        date: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        budget: &PassBudget,
        limit: usize,
    ) -> bool {
        let seen_key = seen_events_key(date);
        let mut seen = match self.records.find(&seen_key, None).await {
            Ok(Some(var)) => SeenEvents::parse(&var.value),
            Ok(None) => SeenEvents::default(),
            Err(e) => {
                self.record_diag(&format!("seen-set load failed: {e}"), now).await;
                return false;
            }
        };
        let mut dirty = false;

        let complete = self
            .apply_shop_streams(date, since, now, budget, limit, &mut seen, &mut dirty)
            .await;

        // A partial pass holds the watermark and re-fetches these events;
        // without the persisted dedup set every counted increment would
        // count again on the retry.
        if dirty {
            if let Err(e) = self.records.upsert(&seen_key, None, &seen.to_value()).await {
                warn!(error = %e, "Failed to persist event dedup set");
            }
        }
        complete
    }

    async fn apply_shop_streams(
        &self,
        date: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        budget: &PassBudget,
        limit: usize,
        seen: &mut SeenEvents,
        dirty: &mut bool,
    ) -> bool {
        let shops = match self.events.events_since(EVENT_SHOP_ORDER, since, limit).await {
            Ok(events) => events,
            Err(e) => {
                self.record_fetch_diag("shop", &e, now).await;
                return false;
            }
        };
        for event in &shops {
            if !budget.within() {
                return false;
            }
            if !event.is_completed_shop_order() {
                continue;
            }
            self.count_shop_event(event, date, seen, dirty, now).await;
        }

        let deductions = match self
            .events
            .events_since(EVENT_CURRENCY_DEDUCTED, since, limit)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                self.record_fetch_diag("currency", &e, now).await;
                return false;
            }
        };
        for event in &deductions {
            if !budget.within() {
                return false;
            }
            // Only deductions tied to a shop order count; plain spends don't.
            if event.meta.get("orderId").and_then(|v| v.as_str()).is_none() {
                continue;
            }
            self.count_shop_event(event, date, seen, dirty, now).await;
        }
        true
    }

    async fn count_shop_event(
        &self,
        event: &GameEvent,
        date: &str,
        seen: &mut SeenEvents,
        dirty: &mut bool,
        now: DateTime<Utc>,
    ) {
        let Some(player_id) = event.player_id.as_deref() else {
            return;
        };
        let dedup_id = match event.meta.get("orderId").and_then(|v| v.as_str()) {
            Some(order) => format!("order:{order}"),
            None => format!("event:{}", event.id),
        };
        if seen.contains(&dedup_id) {
            debug!(dedup_id, "Duplicate shop action skipped");
            return;
        }
        // Marked seen only after the increment lands, otherwise a failed
        // write would swallow the purchase for good.
        if let Err(e) = self
            .increment_quest(player_id, date, QuestType::ShopQuest, 1, now)
            .await
        {
            warn!(player_id, error = %e, "Shop increment failed");
            self.record_diag(&format!("shop increment failed: {e}"), now).await;
            return;
        }
        seen.insert(&dedup_id);
        *dirty = true;
    }

    async fn apply_death_event(
        &self,
        event: &GameEvent,
        date: &str,
        active: &HashSet<QuestType>,
        now: DateTime<Utc>,
    ) {
        let Some(player_id) = event.player_id.as_deref() else {
            return;
        };

        if active.contains(&QuestType::DieOnce) {
            if let Err(e) = self
                .increment_quest(player_id, date, QuestType::DieOnce, 1, now)
                .await
            {
                warn!(player_id, error = %e, "Die-once increment failed");
            }
        }

        // A death restarts the survival clock from the moment it happened.
        if active.contains(&QuestType::Unkillable) {
            let key = deathless_session_key(player_id, date);
            let death_ms = event.created_at.timestamp_millis();
            let mut session = match self.records.find(&key, Some(player_id)).await {
                Ok(Some(var)) => SessionRecord::parse(&var.value)
                    .unwrap_or_else(|| SessionRecord::started(death_ms)),
                Ok(None) => SessionRecord::started(death_ms),
                Err(e) => {
                    warn!(player_id, error = %e, "Deathless session read failed");
                    return;
                }
            };
            session_time::restart(&mut session, death_ms);
            if let Err(e) = self
                .records
                .upsert(&key, Some(player_id), &session.to_value())
                .await
            {
                warn!(player_id, error = %e, "Deathless session restart failed");
            }
        }
    }

    /// Max-merge progress for quest types fed by an updater outside this
    /// engine. Neither side ever regresses: we only lift our own record up
    /// to the best externally-visible copy of the same key.
    async fn sync_external(&self, date: &str, active: &HashSet<QuestType>, now: DateTime<Utc>) {
        let want: Vec<QuestType> = EXTERNAL_TYPES
            .iter()
            .copied()
            .filter(|t| active.contains(t))
            .collect();
        if want.is_empty() {
            return;
        }

        let vars = match self.records.scan(None, 1000).await {
            Ok(vars) => vars,
            Err(e) => {
                self.record_diag(&format!("external scan failed: {e}"), now).await;
                return;
            }
        };
        let marker = format!("_{date}_");
        for var in vars
            .iter()
            .filter(|v| v.key.starts_with(QUEST_KEY_PREFIX) && v.key.contains(&marker))
        {
            let Some((player_id, _, quest_type)) = parse_quest_key(&var.key) else {
                continue;
            };
            if !want.contains(&quest_type) {
                continue;
            }
            let Some(mut own) = QuestRecord::parse(&var.value, quest_type, &self.config.quests)
            else {
                continue;
            };

            let candidates = match self.records.find_any_module(&var.key).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(key = %var.key, error = %e, "External lookup failed");
                    continue;
                }
            };
            let best = candidates
                .iter()
                .filter(|c| c.id != var.id)
                .filter_map(|c| serde_json::from_str::<QuestRecord>(&c.value).ok())
                .max_by_key(|q| (q.completed, q.progress));
            let Some(ext) = best else {
                continue;
            };

            let was_completed = own.completed;
            let changed = ext.progress > own.progress || (ext.completed && !own.completed);
            if !changed {
                continue;
            }
            let edge = own.apply_absolute(ext.progress, now) || (ext.completed && !was_completed);
            if ext.completed {
                own.completed = true;
            }
            if ext.claimed {
                own.claimed = true;
            }
            let should_notify = edge && !own.notified && !own.claimed;
            if should_notify {
                own.notified = true;
            }
            if let Err(e) = self.records.update_by_id(&var.id, &own.to_value()).await {
                warn!(key = %var.key, error = %e, "External merge write failed");
                continue;
            }
            if should_notify {
                self.on_completion_edge(&player_id, date, quest_type, now).await;
            }
        }
    }

    /// Session ticks for duration quests, then push session time into the
    /// quest records.
    async fn update_time_quests(
        &self,
        date: &str,
        active: &HashSet<QuestType>,
        now: DateTime<Utc>,
        budget: &PassBudget,
    ) {
        if !self.config.quests.enable_time_tracking {
            return;
        }
        if !active.iter().any(|t| t.is_duration()) {
            return;
        }
        let online: HashSet<String> = match self.game.online_player_ids().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                self.record_diag(&format!("online snapshot failed: {e}"), now).await;
                return;
            }
        };

        let vars = match self.records.scan(None, 1000).await {
            Ok(vars) => vars,
            Err(e) => {
                self.record_diag(&format!("time scan failed: {e}"), now).await;
                return;
            }
        };

        let timespent_suffix = format!("_{date}_timespent");
        let unkillable_suffix = format!("_{date}_unkillable");
        let mut timespent_players: Vec<String> = Vec::new();
        let mut unkillable_players: Vec<String> = Vec::new();
        for var in &vars {
            if !var.key.starts_with(QUEST_KEY_PREFIX) {
                continue;
            }
            if var.key.ends_with(&timespent_suffix) {
                if let Some((player, _, _)) = parse_quest_key(&var.key) {
                    timespent_players.push(player);
                }
            } else if var.key.ends_with(&unkillable_suffix) {
                if let Some((player, _, _)) = parse_quest_key(&var.key) {
                    unkillable_players.push(player);
                }
            }
        }

        if active.contains(&QuestType::TimeSpent) {
            for player_id in &timespent_players {
                if !budget.within() {
                    return;
                }
                if let Err(e) = self
                    .tick_timespent(player_id, date, &online, now)
                    .await
                {
                    warn!(player_id, error = %e, "Timespent update failed");
                }
            }
        }

        if active.contains(&QuestType::Unkillable) {
            for player_id in &unkillable_players {
                if !budget.within() {
                    return;
                }
                if let Err(e) = self
                    .tick_unkillable(player_id, date, &online, now)
                    .await
                {
                    warn!(player_id, error = %e, "Unkillable update failed");
                }
            }
        }
    }

    async fn tick_timespent(
        &self,
        player_id: &str,
        date: &str,
        online: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let now_ms = now.timestamp_millis();
        let cap = self.config.jobs.tick_cap_ms;
        let skey = session_key(player_id, date);
        let is_online = online.contains(player_id);

        let session_var = self.records.find(&skey, Some(player_id)).await?;
        let mut session = match &session_var {
            Some(var) => {
                SessionRecord::parse(&var.value).unwrap_or_else(|| SessionRecord::started(now_ms))
            }
            // Lazily created the first time an online player is seen.
            None if is_online => SessionRecord::started(now_ms),
            None => return Ok(()),
        };

        if is_online {
            session_time::mark_online(&mut session, now_ms);
            session_time::tick_online(&mut session, now_ms, cap);
        } else {
            session_time::mark_offline(&mut session, now_ms, cap);
        }

        let qkey = quest_key(player_id, date, QuestType::TimeSpent);
        let mut quest = self.load_or_rebuild_quest(&qkey, player_id, date, QuestType::TimeSpent, now).await?;
        let edge = quest.apply_duration(session.total_time, now);
        if quest.completed || quest.claimed {
            // Stop the meter once the goal is reached.
            session.total_time = session.total_time.min(quest.target);
            session.start_time = None;
        }
        let notify = edge && !quest.notified;
        if notify {
            quest.notified = true;
        }

        self.records
            .upsert(&skey, Some(player_id), &session.to_value())
            .await?;
        self.save_quest(&qkey, player_id, &quest).await?;
        if notify {
            self.on_completion_edge(player_id, date, QuestType::TimeSpent, now).await;
        }
        Ok(())
    }

    async fn tick_unkillable(
        &self,
        player_id: &str,
        date: &str,
        online: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let now_ms = now.timestamp_millis();
        let cap = self.config.jobs.tick_cap_ms;
        let dkey = deathless_session_key(player_id, date);
        let is_online = online.contains(player_id);

        let session_var = self.records.find(&dkey, Some(player_id)).await?;
        let mut session = match &session_var {
            Some(var) => {
                SessionRecord::parse(&var.value).unwrap_or_else(|| SessionRecord::started(now_ms))
            }
            None if is_online => SessionRecord::started(now_ms),
            None => return Ok(()),
        };

        let stamp_var = self
            .records
            .find(&player_reset_key(player_id, date), Some(player_id))
            .await?;
        let reset_stamp = stamp_var
            .map(|v| records::parse_stamp_ms(&v.value))
            .unwrap_or(0);

        if is_online {
            session_time::mark_online(&mut session, now_ms);
            session.last_update = now_ms;
        } else {
            session_time::mark_offline(&mut session, now_ms, cap);
        }
        let progress = session_time::deathless_progress(&session, reset_stamp, now_ms);

        let qkey = quest_key(player_id, date, QuestType::Unkillable);
        let mut quest = self
            .load_or_rebuild_quest(&qkey, player_id, date, QuestType::Unkillable, now)
            .await?;
        let edge = quest.apply_duration(progress, now);
        if quest.completed || quest.claimed {
            session.total_time = session.total_time.min(quest.target);
            session.start_time = None;
        }
        let notify = edge && !quest.notified;
        if notify {
            quest.notified = true;
        }

        self.records
            .upsert(&dkey, Some(player_id), &session.to_value())
            .await?;
        self.save_quest(&qkey, player_id, &quest).await?;
        if notify {
            self.on_completion_edge(player_id, date, QuestType::Unkillable, now).await;
        }
        Ok(())
    }

    /// Bounded increment with lazy creation and corrupt-record recovery.
    async fn increment_quest(
        &self,
        player_id: &str,
        date: &str,
        quest_type: QuestType,
        amount: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let key = quest_key(player_id, date, quest_type);
        let mut quest = self
            .load_or_rebuild_quest(&key, player_id, date, quest_type, now)
            .await?;
        let edge = quest.apply_increment(amount, now);
        let notify = edge && !quest.notified;
        if notify {
            quest.notified = true;
        }
        self.save_quest(&key, player_id, &quest).await?;
        if notify {
            self.on_completion_edge(player_id, date, quest_type, now).await;
        }
        Ok(())
    }

    /// Load a quest record; a missing record is lazily created and a corrupt
    /// one (unparseable, or type disagreeing with the key) is rebuilt fresh
    /// for the current day rather than trusted.
    async fn load_or_rebuild_quest(
        &self,
        key: &str,
        player_id: &str,
        date: &str,
        quest_type: QuestType,
        now: DateTime<Utc>,
    ) -> anyhow::Result<QuestRecord> {
        Ok(match self.records.find(key, Some(player_id)).await? {
            Some(var) => match QuestRecord::parse(&var.value, quest_type, &self.config.quests) {
                Some(quest) => quest,
                None => {
                    warn!(key, "Rebuilding corrupt quest record");
                    QuestRecord::fresh(quest_type, date, &self.config.quests, now)
                }
            },
            None => QuestRecord::fresh(quest_type, date, &self.config.quests, now),
        })
    }

    async fn save_quest(
        &self,
        key: &str,
        player_id: &str,
        quest: &QuestRecord,
    ) -> anyhow::Result<()> {
        self.records
            .upsert(key, Some(player_id), &quest.to_value())
            .await?;
        Ok(())
    }

    /// Completion side-effects, fired exactly once per quest per day.
    async fn on_completion_edge(
        &self,
        player_id: &str,
        date: &str,
        quest_type: QuestType,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self
            .claims
            .enqueue_pending(player_id, date, quest_type, now.timestamp_millis())
            .await
        {
            warn!(player_id, quest = %quest_type, error = %e, "Pending enqueue failed");
        }
        self.claims.notify_completion(player_id, quest_type).await;
    }

    /// A feed fetch that died mid-pass. Transient failures (timeouts, 5xx)
    /// resolve themselves on the next pass; the rest need an operator.
    async fn record_fetch_diag(&self, what: &str, e: &StoreError, now: DateTime<Utc>) {
        warn!(transient = e.is_transient(), error = %e, "{what} fetch failed");
        self.record_diag(&format!("{what} fetch failed: {e}"), now).await;
    }

    /// Last-error breadcrumb for operators; best-effort.
    async fn record_diag(&self, msg: &str, now: DateTime<Utc>) {
        let payload = json!({ "at": now.to_rfc3339(), "msg": msg }).to_string();
        if let Err(e) = self.records.upsert(DIAG_KEY, None, &payload).await {
            warn!(error = %e, "Diagnostic write failed");
        }
    }
}
