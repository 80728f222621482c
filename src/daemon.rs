use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde_json::json;
use tracing::info;

use crate::heartbeat::HeartbeatTelemetry;

/// Start the health check HTTP server.
pub async fn start_health_server(
    port: u16,
    telemetry: Arc<HeartbeatTelemetry>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .with_state(telemetry);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Health server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Overall status plus a per-job snapshot. "degraded" once any job has
/// failed three or more times in a row.
async fn health_handler(State(telemetry): State<Arc<HeartbeatTelemetry>>) -> Json<serde_json::Value> {
    let jobs = telemetry.snapshots();
    let degraded = jobs.iter().any(|j| j.consecutive_failures >= 3);
    Json(json!({
        "status": if degraded { "degraded" } else { "ok" },
        "jobs": jobs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_payload_reflects_job_state() {
        let telemetry = Arc::new(HeartbeatTelemetry::new());
        telemetry.register_job("tracker", Duration::from_secs(60));
        let Json(body) = health_handler(State(telemetry.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["jobs"][0]["name"], "tracker");

        telemetry.mark_failure("tracker", 3, "boom".to_string());
        let Json(body) = health_handler(State(telemetry)).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["jobs"][0]["consecutive_failures"], 3);
    }
}
