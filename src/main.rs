use std::sync::Arc;

use anyhow::Context;

use rescue_onboard::config::AppConfig;
use rescue_onboard::onboarding::catalog::Catalog;
use rescue_onboard::onboarding::skills::FileTaxonomyLoader;
use rescue_onboard::onboarding::{
    Collaborators, OnboardingController, OnboardingRouteState, onboarding_routes,
};
use rescue_onboard::remote::RescueApiClient;
use rescue_onboard::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("Rescue Onboard v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/onboarding", config.port);
    eprintln!("   WS: ws://0.0.0.0:{}/ws/onboarding", config.port);
    eprintln!("   Rescue service: {}", config.api_base_url);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Remote collaborators ─────────────────────────────────────────────
    let client = Arc::new(RescueApiClient::from_config(&config));
    let mut apis = Collaborators::from_shared(Arc::clone(&client));
    if let Some(path) = &config.skill_taxonomy_path {
        apis.taxonomy = Arc::new(FileTaxonomyLoader::new(path));
        eprintln!("   Skill taxonomy: {}", path.display());
    }
    if config.geocode_base_url.is_none() {
        eprintln!("   Geocoding: disabled");
    }
    eprintln!(
        "   Document stage: {}",
        if config.include_document_stage { "enabled" } else { "disabled" }
    );

    let controller = OnboardingController::new(
        db,
        Catalog::default(),
        config.include_document_stage,
        apis,
    );

    let app = onboarding_routes(OnboardingRouteState {
        controller,
        oracle: client,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "Onboarding server started");
    axum::serve(listener, app).await?;

    Ok(())
}
