//! Full-pipeline tests: daily reset, event reconciliation, and claim drain
//! running against the in-memory store with a controlled clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use crate::claims::ClaimPipeline;
use crate::config::AppConfig;
use crate::events::{EVENT_ENTITY_KILLED, EVENT_PLAYER_DEATH};
use crate::quest::{QuestType, SubstringClassifier};
use crate::records::{quest_key, ActiveTypes, QuestRecord, ACTIVE_TYPES_KEY, LAST_RESET_KEY};
use crate::reset::ResetCoordinator;
use crate::store::{RecordScope, RecordStore};
use crate::testing::{MemoryVariableStore, MockEventFeed, MockGameClient};
use crate::tracker::ProgressReconciler;

const GS: &str = "gs-1";
const MODULE: &str = "mod-1";

struct World {
    mem: Arc<MemoryVariableStore>,
    feed: Arc<MockEventFeed>,
    game: Arc<MockGameClient>,
    config: AppConfig,
    reset: ResetCoordinator,
    reconciler: ProgressReconciler,
    claims: Arc<ClaimPipeline>,
}

fn world() -> World {
    let mem = Arc::new(MemoryVariableStore::new());
    let feed = Arc::new(MockEventFeed::new());
    let game = Arc::new(MockGameClient::new());
    let records = Arc::new(RecordStore::new(
        mem.clone(),
        RecordScope {
            game_server_id: GS.to_string(),
            module_id: MODULE.to_string(),
        },
    ));
    let config: AppConfig = toml::from_str(
        r#"
[api]
base_url = "http://localhost"
token = "t"

[server]
game_server_id = "gs-1"
module_id = "mod-1"
utc_offset_minutes = 0
"#,
    )
    .unwrap();
    let claims = Arc::new(ClaimPipeline::new(
        records.clone(),
        game.clone(),
        config.clone(),
    ));
    let reset = ResetCoordinator::new(records.clone(), game.clone(), config.clone());
    let reconciler = ProgressReconciler::new(
        records,
        feed.clone(),
        game.clone(),
        claims.clone(),
        Box::new(SubstringClassifier),
        config.clone(),
    );
    World {
        mem,
        feed,
        game,
        config,
        reset,
        reconciler,
        claims,
    }
}

fn morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

fn active_types(w: &World) -> Vec<QuestType> {
    ActiveTypes::parse(&w.mem.get_value(ACTIVE_TYPES_KEY).unwrap())
        .unwrap()
        .types
}

#[tokio::test]
async fn test_reset_then_kills_then_claim() {
    let w = world();
    w.game.set_online(&["p1"]);
    w.game.set_name("p1", "Alice");

    w.reset.run_pass(morning()).await.unwrap();
    assert_eq!(w.mem.get_value(LAST_RESET_KEY).unwrap(), "2024-05-01");
    let types = active_types(&w);
    assert_eq!(types.len(), 5);

    // Feed enough kills to finish the zombie quest if it rotated in today;
    // otherwise finish die-once via a death event.
    let (quest, event_count) = if types.contains(&QuestType::ZombieKills) {
        (QuestType::ZombieKills, w.config.quests.targets.zombiekills)
    } else {
        (QuestType::DieOnce, 0)
    };

    // The first pass falls back to a now-minus-5-minutes watermark; events
    // sit one second past it so the strict greater-than filter keeps them.
    let t0 = morning() + Duration::minutes(10);
    if quest == QuestType::ZombieKills {
        for i in 0..event_count {
            w.feed.push(
                EVENT_ENTITY_KILLED,
                &format!("kill-{i}"),
                Some("p1"),
                json!({ "entity": "zombieArlene" }),
                t0 + Duration::seconds(i + 1),
            );
        }
    } else if types.contains(&QuestType::DieOnce) {
        w.feed.push(
            EVENT_PLAYER_DEATH,
            "death-1",
            Some("p1"),
            json!({}),
            t0 + Duration::seconds(1),
        );
    } else {
        return; // rotation has neither countable quest; nothing to drive
    }

    let pass_at = t0 + Duration::minutes(5);
    w.reconciler.run_pass(pass_at).await.unwrap();

    let stored = w.mem.get_value(&quest_key("p1", "2024-05-01", quest)).unwrap();
    let record = QuestRecord::parse(&stored, quest, &w.config.quests).unwrap();
    assert!(record.completed);
    assert!(!record.claimed);

    // Drain after the grace period: reward granted, record claimed.
    let drain_at = pass_at + Duration::seconds(30);
    w.claims.run_drain_pass(drain_at).await.unwrap();

    let stored = w.mem.get_value(&quest_key("p1", "2024-05-01", quest)).unwrap();
    let record = QuestRecord::parse(&stored, quest, &w.config.quests).unwrap();
    assert!(record.claimed);
    assert_eq!(
        w.game.granted_total("p1"),
        quest.reward(&w.config.quests)
    );

    // Replaying both passes grants nothing further.
    w.reconciler
        .run_pass(drain_at + Duration::minutes(1))
        .await
        .unwrap();
    w.claims
        .run_drain_pass(drain_at + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(
        w.game.granted_total("p1"),
        quest.reward(&w.config.quests)
    );
}

#[tokio::test]
async fn test_next_day_rollover_archives_progress() {
    let w = world();
    w.game.set_online(&["p1"]);
    w.reset.run_pass(morning()).await.unwrap();
    let day_one = active_types(&w);

    // Next day, past reset time.
    let next_morning = morning() + Duration::days(1);
    w.reset.run_pass(next_morning).await.unwrap();
    assert_eq!(w.mem.get_value(LAST_RESET_KEY).unwrap(), "2024-05-02");

    // Yesterday's per-player records are gone; today's exist fresh.
    for t in &day_one {
        assert_eq!(
            w.mem.count_with_key(&quest_key("p1", "2024-05-01", *t)),
            0,
            "previous day records removed on rollover"
        );
    }
    let day_two = active_types(&w);
    for t in &day_two {
        assert_eq!(w.mem.count_with_key(&quest_key("p1", "2024-05-02", *t)), 1);
    }
}

#[tokio::test]
async fn test_events_before_reset_land_on_yesterday() {
    let w = world();
    w.game.set_online(&["p1"]);
    // Yesterday's reset ran; today's has not (it's 00:05, gate is 00:15).
    let yesterday_morning = Utc.with_ymd_and_hms(2024, 4, 30, 8, 0, 0).unwrap();
    w.reset.run_pass(yesterday_morning).await.unwrap();
    assert_eq!(w.mem.get_value(LAST_RESET_KEY).unwrap(), "2024-04-30");

    let just_after_midnight = Utc.with_ymd_and_hms(2024, 5, 1, 0, 5, 0).unwrap();
    w.reset.run_pass(just_after_midnight).await.unwrap();
    assert_eq!(
        w.mem.get_value(LAST_RESET_KEY).unwrap(),
        "2024-04-30",
        "gate not reached yet"
    );

    let types = active_types(&w);
    if types.contains(&QuestType::ZombieKills) {
        w.feed.push(
            EVENT_ENTITY_KILLED,
            "k1",
            Some("p1"),
            json!({ "entity": "zombieBoe" }),
            just_after_midnight - Duration::minutes(1),
        );
        w.reconciler.run_pass(just_after_midnight).await.unwrap();
        let stored = w
            .mem
            .get_value(&quest_key("p1", "2024-04-30", QuestType::ZombieKills))
            .unwrap();
        let record =
            QuestRecord::parse(&stored, QuestType::ZombieKills, &w.config.quests).unwrap();
        assert_eq!(record.progress, 1);
        assert!(w
            .mem
            .get_value(&quest_key("p1", "2024-05-01", QuestType::ZombieKills))
            .is_none());
    }
}
