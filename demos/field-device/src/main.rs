use std::{error::Error, sync::Arc};

use fieldsync::{
    config::EngineConfig,
    job::{builder::JobBuilder, ProjectSnapshot},
    network::ProbingNetworkMonitor,
    remote::{http::HttpRemoteApi, NoAuth, StaticToken, TokenProvider},
    SyncEngine,
};
use fieldsync_sqlx::{SqliteEntityStateTracker, SqliteJobStore, TrackedTable};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_DATABASE_PATH: &str = "fieldsync-demo.db";
const API_URL: &str = "FIELDSYNC_API_URL";
const DATABASE_PATH: &str = "FIELDSYNC_DATABASE";
const CONFIG_PATH: &str = "FIELDSYNC_CONFIG";
const TOKEN: &str = "FIELDSYNC_TOKEN";

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let api_url = std::env::var(API_URL).unwrap_or_else(|_| DEFAULT_API_URL.to_owned());
    let database_path =
        std::env::var(DATABASE_PATH).unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_owned());
    let config = match std::env::var(CONFIG_PATH) {
        Ok(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        Err(_) => EngineConfig::default(),
    };
    let tokens: Arc<dyn TokenProvider> = match std::env::var(TOKEN) {
        Ok(token) => Arc::new(StaticToken(token)),
        Err(_) => Arc::new(NoAuth),
    };

    let store = SqliteJobStore::connect(&database_path).await?;
    // The host owns its domain tables; the engine only mirrors status onto them.
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sync_status TEXT
        )",
    )
    .execute(&*store)
    .await?;
    sqlx::query(
        "INSERT INTO projects (id, name, sync_status) VALUES ('demo-project', 'North ridge', 'pending')
        ON CONFLICT (id) DO UPDATE SET sync_status = 'pending'",
    )
    .execute(&*store)
    .await?;
    let tracker = SqliteEntityStateTracker::new(
        (*store).clone(),
        [TrackedTable::new("project", "projects").without_remote_url()],
    )?;

    let probe_token = CancellationToken::new();
    let monitor = ProbingNetworkMonitor::new(
        api_url.as_str(),
        config.probe_interval(),
        config.request_timeout(),
    )?;
    let probe = monitor.spawn(probe_token.clone());
    monitor.set_link_up(true);

    let remote = HttpRemoteApi::new(&api_url, config.request_timeout(), tokens)?;
    let engine = SyncEngine::builder(store, Arc::new(monitor), Arc::new(tracker))
        .with_config(config)
        .with_default_handlers(Arc::new(remote))
        .start()
        .await?;

    let mut reports = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(report) => tracing::info!(
                    source = %report.source,
                    synced = report.synced,
                    failed = report.failed,
                    discarded = report.discarded,
                    skipped = report.skipped,
                    "Sync pass finished"
                ),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Missed sync pass reports")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let job_id = engine
        .enqueue(JobBuilder::project(ProjectSnapshot {
            id: "demo-project".to_owned(),
            body: serde_json::json!({ "name": "North ridge", "area_ha": 12.5 }),
        }))
        .await?;
    tracing::info!(%job_id, "Enqueued project submission, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    engine.graceful_shutdown().await?;
    probe_token.cancel();
    probe.await?;
    Ok(())
}
