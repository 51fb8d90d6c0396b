//! An HR survey assistant served over HTTP.
//!
//! The crate wires the [`survey_agent_core`] agent to an OpenAI-compatible
//! model, a session store and the survey tools, and exposes it as an axum
//! router. Tools that would change a survey only propose a task; the change
//! happens once the user confirms it through `/confirm-action`.

#[allow(unused_imports)]
#[macro_use]
extern crate tracing;

pub mod auth;
pub mod config;
pub mod routes;
pub mod sqlite;
pub mod surveys;

use std::sync::Arc;

use survey_agent_core::gate::ConfirmationGate;
use survey_agent_core::store::{SessionStore, TaskStore};
use survey_agent_core::tool::SchemaError;
use survey_agent_core::{AgentBuilder, AgentConfig, ChatService};
use survey_agent_model::ModelProvider;

use crate::auth::TokenAuth;
use crate::routes::AppState;
use crate::surveys::{SurveyDirectory, SurveyTools};

/// Re-exports of [`survey_agent_core`] crate.
pub mod core {
    pub use survey_agent_core::*;
}

/// Assembles the handler state around one model provider and one store.
pub fn build_state<P, S>(
    provider: P,
    store: Arc<S>,
    directory: Arc<SurveyDirectory>,
    auth: TokenAuth,
    config: AgentConfig,
) -> Result<AppState, SchemaError>
where
    P: ModelProvider + 'static,
    S: SessionStore + TaskStore + 'static,
{
    let registry = surveys::registry()?;
    let session_store: Arc<dyn SessionStore> = store.clone();
    let task_store: Arc<dyn TaskStore> = store;

    let gate = Arc::new(ConfirmationGate::new(
        task_store,
        surveys::actions(Arc::clone(&directory)),
    ));
    let agent = AgentBuilder::with_model_provider(provider)
        .with_registry(Arc::new(registry))
        .with_store(Arc::clone(&session_store))
        .with_config(config)
        .build();
    let chat = ChatService::new(
        agent,
        session_store,
        SurveyTools::new(directory, Arc::clone(&gate)),
    );

    Ok(AppState {
        chat: Arc::new(chat),
        gate,
        auth,
    })
}
