use anyhow::Context;
use fleeting_orchestrator::notifications::NotificationHandler;
use fleeting_orchestrator::provider_manager::build_provider;
use fleeting_orchestrator::routes::{create_router, AppState};
use fleeting_orchestrator::settings::Settings;
use fleeting_orchestrator::temp_cache::build_cache;
use fleeting_orchestrator::{FleetConfig, FleetController, ProjectDirectory};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env().context("invalid configuration")?;
    let provider = build_provider(&settings)?;
    let cache = build_cache(&settings).context("cannot set up reconciliation cache")?;
    let fleet = FleetController::new(provider, cache, FleetConfig::from_settings(&settings))
        .context("cannot build fleet controller")?;

    let projects = ProjectDirectory::new(settings.projects_dir.clone());
    let ids = projects
        .ids()
        .with_context(|| format!("cannot read projects from {}", settings.projects_dir.display()))?;
    tracing::info!(projects = ?ids, provider = %settings.provider, "fleeting starting");

    let state = Arc::new(AppState {
        projects,
        fleet: Arc::new(fleet),
        notifications: NotificationHandler::new().context("cannot build http client")?,
    });

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, "listening");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
