//! The `survey-agent` HTTP server.

#[macro_use]
extern crate tracing;

use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use survey_agent::auth::TokenAuth;
use survey_agent::build_state;
use survey_agent::config::{ConfigError, ServerConfig};
use survey_agent::routes::router;
use survey_agent::sqlite::SqliteStore;
use survey_agent::surveys::{Survey, SurveyDirectory};
use survey_agent_core::store::{MemoryStore, StoreError};
use survey_agent_core::tool::SchemaError;
use survey_agent_openai_model::{Error as OpenAIError, OpenAIProvider};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open the store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to create the model provider: {0}")]
    Provider(#[from] OpenAIError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("failed to load surveys from {path}: {reason}")]
    Surveys { path: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = ServerConfig::from_env()?;
    debug!("starting with {config:?}");

    let surveys = match &config.surveys_path {
        Some(path) => load_surveys(path)?,
        None => {
            warn!("SURVEY_AGENT_SURVEYS is not set, the survey list is empty");
            vec![]
        }
    };
    info!("loaded {} surveys", surveys.len());
    let directory = Arc::new(SurveyDirectory::new(surveys));

    if config.tokens.is_empty() {
        warn!("SURVEY_AGENT_TOKENS is not set, every request will be rejected");
    }
    let auth = TokenAuth::new(config.tokens.clone());

    let provider = OpenAIProvider::new(config.openai_config())?;
    let agent_config = config.agent_config().with_system_prompt(
        include_str!("./system_prompt.md")
            .replace("{{TODAY}}", &Utc::now().date_naive().to_string()),
    );

    let state = match &config.db_path {
        Some(path) => {
            info!("storing sessions in {}", path.display());
            let store = Arc::new(SqliteStore::open(path)?);
            build_state(provider, store, directory, auth, agent_config)?
        }
        None => {
            warn!("SURVEY_AGENT_DB is not set, sessions are kept in memory");
            let store = Arc::new(MemoryStore::new());
            build_state(provider, store, directory, auth, agent_config)?
        }
    };

    let listener = TcpListener::bind(config.addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn load_surveys(path: &Path) -> Result<Vec<Survey>, StartupError> {
    let failed = |reason: String| StartupError::Surveys {
        path: path.display().to_string(),
        reason,
    };
    let text = fs::read_to_string(path).map_err(|err| failed(err.to_string()))?;
    serde_json::from_str(&text).map_err(|err| failed(err.to_string()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
