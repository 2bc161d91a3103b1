//! `openfarmd` — the OpenFarm server binary.
//!
//! Usage:
//!   openfarmd --data-dir <dir> [--template <schedule.yaml>] [--listen <addr>]
//!
//! The schedule template defaults to `{data_dir}/schedule.yaml`; when
//! that file does not exist the built-in 42-day broiler schedule is
//! used.

mod routes;

use std::sync::Arc;

use clap::Parser;
use openfarm_core::Module;
use tracing::info;

/// OpenFarm server.
#[derive(Parser, Debug)]
#[command(name = "openfarmd", about = "OpenFarm server")]
struct Cli {
    /// Directory for durable state.
    #[arg(long = "data-dir", required = true)]
    data_dir: String,

    /// Path to the care schedule template YAML.
    #[arg(long = "template")]
    template: Option<String>,

    /// Listen address.
    #[arg(long = "listen", default_value = "0.0.0.0:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let data_dir = std::path::PathBuf::from(&cli.data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let config = openfarm_core::ServiceConfig {
        data_dir: Some(data_dir),
        template_path: cli.template.as_ref().map(std::path::PathBuf::from),
        listen: cli.listen.clone(),
        ..Default::default()
    };

    // Embedded KV store (shared by all modules).
    let kv: Arc<dyn openfarm_kv::KVStore> = Arc::new(
        openfarm_kv::RedbStore::open(&config.resolve_db_path())
            .map_err(|e| anyhow::anyhow!("failed to open KV store: {}", e))?,
    );

    // Schedule template, from file or built-in.
    let template = Arc::new(
        care::schedule::ScheduleTemplate::load(&config.resolve_template_path())
            .map_err(|e| anyhow::anyhow!("failed to load schedule template: {}", e))?,
    );

    let care_module = care::CareModule::new(Arc::clone(&kv), template)?;
    info!("Care module initialized");

    let module_routes = vec![(care_module.name(), care_module.routes())];
    let app = routes::build_router(module_routes);

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!("OpenFarm server listening on {}", cli.listen);
    axum::serve(listener, app).await?;

    Ok(())
}
