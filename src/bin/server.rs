//! Reinforce Server
//!
//! HTTP API for patient records, uploads and quizzes.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reinforce::{
    api::{self, AppState},
    AzureOpenAiGenerator, CareStore, Config, QuestionGenerator, QuizEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(
        "Starting Reinforce Server on {}:{}",
        config.server_host,
        config.server_port
    );
    tracing::info!("Data directory: {:?}", config.data_dir);
    if config.api_key.is_none() {
        tracing::warn!("APP_API_KEY is not set; every request except /health will fail");
    }

    // Initialize components
    let generator: Option<Arc<dyn QuestionGenerator>> = match config.llm.clone() {
        Some(llm) => {
            tracing::info!("Question generation: {} ({})", llm.deployment, llm.endpoint);
            Some(Arc::new(AzureOpenAiGenerator::new(llm)?))
        }
        None => {
            tracing::info!("Question generation: fallback questions only");
            None
        }
    };

    let host = config.server_host.clone();
    let port = config.server_port;
    let api_key = config.api_key.clone();
    let store = CareStore::new(config)?;

    let state = Arc::new(AppState {
        store,
        engine: QuizEngine::new(generator),
        api_key,
    });

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port)).await?;
    tracing::info!("Server listening on http://{}:{}", host, port);

    axum::serve(listener, app).await?;

    Ok(())
}
