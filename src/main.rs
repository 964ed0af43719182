use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use medbatch::config;
use medbatch::db;
use medbatch::model::AnalysisEvent;
use medbatch::storage::LocalStorage;
use medbatch::vision::VisionClient;
use medbatch::worker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Analysis worker daemon for the medicine batch-entry service")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/medbatch.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let storage = LocalStorage::new(&cfg.app.data_dir);
    let base_url = Url::parse(&cfg.vision.base_url).context("invalid vision.base_url")?;
    let vision = VisionClient::new(cfg.vision.api_key.clone(), cfg.vision.model.clone(), base_url);

    // Sessions subscribe to this topic; the worker publishes outcomes on it.
    let (events, _keepalive) = tokio::sync::broadcast::channel::<AnalysisEvent>(256);

    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;

    info!("starting analysis worker");
    loop {
        match worker::process_next_job(&pool, &vision, &storage, &events, max_backoff).await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_sleep).await;
                }
            }
            Err(err) => {
                error!(?err, "analysis worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
