//! Daemon wiring: construct the HTTP clients, hang the four periodic jobs
//! off the heartbeat, start the health server, and wait for shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::claims::ClaimPipeline;
use crate::cleanup::RetentionSweeper;
use crate::config::AppConfig;
use crate::daemon;
use crate::events::HttpEventFeed;
use crate::game::{GameClient, HttpGameClient};
use crate::heartbeat::{HeartbeatCoordinator, HeartbeatTelemetry};
use crate::quest::SubstringClassifier;
use crate::reset::ResetCoordinator;
use crate::store::{HttpVariableStore, RecordScope, RecordStore};
use crate::tracker::ProgressReconciler;

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    info!(
        game_server_id = %config.server.game_server_id,
        module_id = %config.server.module_id,
        "Starting questkeeper"
    );
    if config.api.token.is_empty() {
        anyhow::bail!("No API token configured (set api.token or QUESTKEEPER_API_TOKEN)");
    }

    let store = Arc::new(HttpVariableStore::new(
        &config.api.base_url,
        &config.api.token,
        config.api.request_timeout_secs,
    )?);
    let records = Arc::new(RecordStore::new(
        store,
        RecordScope {
            game_server_id: config.server.game_server_id.clone(),
            module_id: config.server.module_id.clone(),
        },
    ));
    let events = Arc::new(HttpEventFeed::new(
        &config.api.base_url,
        &config.api.token,
        &config.server.game_server_id,
        config.api.request_timeout_secs,
    )?);
    let game: Arc<dyn GameClient> = Arc::new(HttpGameClient::new(
        &config.api.base_url,
        &config.api.token,
        &config.server.game_server_id,
        config.api.request_timeout_secs,
    )?);

    let claims = Arc::new(ClaimPipeline::new(
        records.clone(),
        game.clone(),
        config.clone(),
    ));
    let reconciler = Arc::new(ProgressReconciler::new(
        records.clone(),
        events,
        game.clone(),
        claims.clone(),
        Box::new(SubstringClassifier),
        config.clone(),
    ));
    let reset = Arc::new(ResetCoordinator::new(
        records.clone(),
        game,
        config.clone(),
    ));
    let sweeper = Arc::new(RetentionSweeper::new(records, config.clone()));

    let telemetry = Arc::new(HeartbeatTelemetry::new());
    // Tick every 5s; each job carries its own interval. Two permits: the
    // tracker and the claim drain may overlap, anything more queues.
    let mut heartbeat = HeartbeatCoordinator::new(5, 2, telemetry.clone());

    let job = reconciler.clone();
    heartbeat.register_job(
        "tracker",
        Duration::from_secs(config.jobs.tracker_interval_secs),
        move || {
            let job = job.clone();
            async move { job.run_pass(Utc::now()).await }
        },
    );
    let job = claims.clone();
    heartbeat.register_job(
        "claim-drain",
        Duration::from_secs(config.jobs.claim_interval_secs),
        move || {
            let job = job.clone();
            async move { job.run_drain_pass(Utc::now()).await }
        },
    );
    let job = reset.clone();
    heartbeat.register_job(
        "daily-reset",
        Duration::from_secs(config.jobs.reset_interval_secs),
        move || {
            let job = job.clone();
            async move { job.run_pass(Utc::now()).await }
        },
    );
    let job = sweeper.clone();
    heartbeat.register_job(
        "retention-sweep",
        Duration::from_secs(config.jobs.cleanup_interval_secs),
        move || {
            let job = job.clone();
            async move { job.run_pass(Utc::now()).await }
        },
    );
    heartbeat.start();

    let health_port = config.daemon.health_port;
    tokio::spawn(async move {
        if let Err(e) = daemon::start_health_server(health_port, telemetry).await {
            error!(error = %e, "Health server exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}
