//! Core logic of the survey assistant: the agent loop, tool declaration and
//! validation, the confirmation gate and the stores they log to.

#[macro_use]
extern crate tracing;

pub mod agent;
mod event;
pub mod gate;
mod locale;
mod model_client;
mod service;
pub mod store;
pub mod tool;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentError, MAX_TOOL_ROUNDS};
pub use event::StreamEvent;
pub use gate::{ConfirmationGate, GateError};
pub use locale::{Locale, UnknownLocale};
pub use service::{ChatRequest, ChatService, ExecutorFactory, ToolContext};
