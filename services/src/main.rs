use std::sync::Arc;
use std::time::Duration;

use common::config::AppConfig;
use common::logger::init_logging;
use migration::Migrator;
use sea_orm_migration::MigratorTrait;
use services::config::EngineConfig;
use services::roster::HttpRosterProvider;
use services::Engine;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cfg = AppConfig::global().clone();
    let _log_guard = init_logging("logs", &cfg.log_file, &cfg.log_level, cfg.log_to_stdout);

    let db = db::connect().await.expect("Failed to connect to database");
    Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    let provider = Arc::new(HttpRosterProvider::new(cfg.roster_service_url.clone()));
    let engine = Engine::new(db, provider, EngineConfig::from(&cfg));

    info!(
        project = %cfg.project_name,
        env = %cfg.env,
        roster_service = %cfg.roster_service_url,
        interval_seconds = cfg.reconcile_interval_seconds,
        "roster reconciler started"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.reconcile_interval_seconds.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.reconcile_failures().await {
                    error!(error = %e, "reconciliation pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    engine.shutdown().await;
    info!("roster reconciler stopped");
}
