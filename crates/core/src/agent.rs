//! The agent loop.
//!
//! One call to [`Agent::run_turn`] drives a single user turn: it asks the
//! model, runs the tools it requests in order, feeds the results back and
//! repeats until the model answers in plain text, a confirmable action is
//! proposed, or the round bound is reached.

mod builder;
mod config;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Value, json};
use survey_agent_model::{
    AssistantMessage, ModelMessage, ModelProviderError, ModelRequest,
    ModelTool, ToolCallRequest, ToolCallResult, Usage,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Locale;
use crate::event::StreamEvent;
use crate::model_client::ModelClient;
use crate::store::{
    NewMessage, NewToolRun, SessionStore, StoreError, ToolRunStatus,
    ToolRunUpdate,
};
use crate::tool::{
    ErrorKind, PendingAction, ToolExecutorSet, ToolOutput, ToolRegistry,
};
pub use builder::AgentBuilder;
pub use config::{AgentConfig, MAX_TOOL_ROUNDS};

/// Errors that abort a turn.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The model backend failed.
    #[error("model request failed: {0}")]
    Model(Box<dyn ModelProviderError>),
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A tool refused to run for the caller.
    #[error("permission denied: {0}")]
    Unauthorized(String),
    /// The client went away.
    #[error("turn was cancelled")]
    Cancelled,
    /// The turn ran out of time.
    #[error("turn timed out")]
    Timeout,
}

/// The input of one turn.
pub struct Turn<'a> {
    /// The session the turn belongs to.
    pub session_id: &'a str,
    /// The new user message.
    pub message: &'a str,
    /// Prior messages, oldest first, without `message`.
    pub history: &'a [ModelMessage],
    /// The tools bound to the caller.
    pub executors: &'a ToolExecutorSet,
    pub locale: Locale,
    /// Receives a `tool_result` event for every tool that produced output.
    pub events: &'a mpsc::Sender<StreamEvent>,
    pub cancel: &'a CancellationToken,
}

/// One logged tool invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolRunRecord {
    pub id: String,
    pub tool_name: String,
    pub input: Value,
    pub status: ToolRunStatus,
    pub output: Option<Value>,
    pub latency_ms: u64,
}

/// What a turn produced.
#[derive(Clone, Debug, Default)]
pub struct TurnOutcome {
    /// The final answer.
    pub text: String,
    pub tool_runs: Vec<ToolRunRecord>,
    /// The action proposed in this turn, if any.
    pub pending_action: Option<PendingAction>,
    /// Tokens spent over all model calls.
    pub usage: Usage,
    /// Number of model rounds that requested tools or answered.
    pub rounds: usize,
}

enum CallOutcome {
    Output(ToolOutput),
    Rejected(Value),
    Denied(String),
}

/// Drives model rounds and tool calls for one turn at a time.
///
/// The agent itself is stateless between turns and can serve many turns
/// concurrently.
pub struct Agent {
    model_client: ModelClient,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn SessionStore>,
    config: AgentConfig,
}

impl Agent {
    #[inline]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs one turn to completion.
    ///
    /// Model and store errors are not retried. Tool errors other than
    /// permission failures are fed back to the model and the loop goes on.
    pub async fn run_turn(
        &self,
        turn: Turn<'_>,
    ) -> Result<TurnOutcome, AgentError> {
        let mut messages = Vec::with_capacity(turn.history.len() + 2);
        if let Some(prompt) = self.config.system_prompt() {
            messages.push(ModelMessage::system(prompt));
        }
        messages.extend_from_slice(turn.history);
        messages.push(ModelMessage::user(turn.message));

        let tools = self.registry.definitions();
        let mut outcome = TurnOutcome::default();

        for round in 1..=self.config.max_tool_rounds() {
            outcome.rounds = round;
            let reply = self
                .call_model(&messages, &tools, turn.cancel, &mut outcome)
                .await?;
            if reply.tool_calls.is_empty() {
                outcome.text = final_text(reply.content, turn.locale);
                return Ok(outcome);
            }

            debug!("round {round}: {} tool calls", reply.tool_calls.len());
            let calls = reply.tool_calls.clone();
            messages.push(ModelMessage::Assistant(reply));

            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                let result = self.run_tool_call(&turn, call, &mut outcome).await?;
                results.push(result);
            }
            messages.push(ModelMessage::ToolResults { results });

            if outcome.pending_action.is_some() {
                // One more call for the confirmation prompt; any tool call
                // in this reply is ignored.
                let reply = self
                    .call_model(&messages, &tools, turn.cancel, &mut outcome)
                    .await?;
                outcome.text = final_text(reply.content, turn.locale);
                return Ok(outcome);
            }
        }

        warn!(
            "no final answer after {} rounds",
            self.config.max_tool_rounds()
        );
        outcome.text = turn.locale.fallback_answer().to_owned();
        Ok(outcome)
    }

    async fn call_model(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelTool],
        cancel: &CancellationToken,
        outcome: &mut TurnOutcome,
    ) -> Result<AssistantMessage, AgentError> {
        let req = ModelRequest {
            messages: messages.to_vec(),
            tools: tools.to_vec(),
        };
        let resp = or_cancel(cancel, self.model_client.send_request(req))
            .await?
            .map_err(AgentError::Model)?;
        outcome.usage += resp.usage;
        Ok(resp.message)
    }

    async fn run_tool_call(
        &self,
        turn: &Turn<'_>,
        call: ToolCallRequest,
        outcome: &mut TurnOutcome,
    ) -> Result<ToolCallResult, AgentError> {
        let ToolCallRequest {
            id,
            name,
            arguments,
        } = call;
        let started = Instant::now();
        let run_id = self
            .store
            .log_tool_run(NewToolRun {
                session_id: turn.session_id.to_owned(),
                tool_name: name.clone(),
                input: arguments.clone(),
            })
            .await?;

        let has_pending = outcome.pending_action.is_some();
        let call_outcome = match self
            .invoke(turn, &id, &name, arguments.clone(), has_pending)
            .await
        {
            Ok(call_outcome) => call_outcome,
            Err(err) => {
                // The run must not stay `running` once the turn is gone.
                self.fail_tool_run(&run_id, started).await;
                return Err(err);
            }
        };
        let latency_ms = elapsed_ms(started);

        let (status, output, payload) = match call_outcome {
            CallOutcome::Output(ToolOutput::Plain(value)) => {
                (ToolRunStatus::Succeeded, Some(value.clone()), value)
            }
            CallOutcome::Output(ToolOutput::PendingConfirmation(action)) => {
                let payload = action.model_payload();
                let output = action.to_value();
                outcome.pending_action = Some(action);
                (ToolRunStatus::Succeeded, Some(output), payload)
            }
            CallOutcome::Rejected(payload) => {
                (ToolRunStatus::Failed, None, payload)
            }
            CallOutcome::Denied(reason) => {
                self.fail_tool_run(&run_id, started).await;
                warn!("tool `{name}` denied: {reason}");
                return Err(AgentError::Unauthorized(reason));
            }
        };

        self.store
            .update_tool_run(
                &run_id,
                ToolRunUpdate {
                    status,
                    output: output.clone(),
                    completed_at: Utc::now(),
                    latency_ms,
                },
            )
            .await?;
        if let Some(output) = &output {
            let event = StreamEvent::ToolResult {
                tool: name.clone(),
                output: output.clone(),
            };
            turn.events
                .send(event)
                .await
                .map_err(|_| AgentError::Cancelled)?;
        }
        self.store
            .log_message(NewMessage::tool(
                turn.session_id,
                &name,
                arguments.clone(),
                payload.clone(),
            ))
            .await?;

        outcome.tool_runs.push(ToolRunRecord {
            id: run_id,
            tool_name: name,
            input: arguments,
            status,
            output,
            latency_ms,
        });
        Ok(ToolCallResult {
            id,
            content: payload.to_string(),
            is_error: status == ToolRunStatus::Failed,
        })
    }

    /// Resolves a tool run as failed. Store errors are only logged, the
    /// caller is already returning an error of its own.
    async fn fail_tool_run(&self, run_id: &str, started: Instant) {
        let update = ToolRunUpdate {
            status: ToolRunStatus::Failed,
            output: None,
            completed_at: Utc::now(),
            latency_ms: elapsed_ms(started),
        };
        if let Err(err) = self.store.update_tool_run(run_id, update).await {
            error!("failed to resolve tool run {run_id}: {err}");
        }
    }

    async fn invoke(
        &self,
        turn: &Turn<'_>,
        call_id: &str,
        name: &str,
        arguments: Value,
        has_pending: bool,
    ) -> Result<CallOutcome, AgentError> {
        if !self.registry.is_valid_tool_name(name) {
            warn!("model requested unknown tool `{name}`");
            return Ok(CallOutcome::Rejected(json!({
                "error": format!("unknown tool: {name}"),
            })));
        }
        if let Err(fields) = self.registry.validate(name, &arguments) {
            debug!("invalid input for `{name}`: {fields:?}");
            return Ok(CallOutcome::Rejected(json!({
                "error": format!("invalid input for {name}"),
                "fields": fields,
            })));
        }
        if has_pending && self.registry.is_confirmable(name) {
            return Ok(CallOutcome::Rejected(json!({
                "error": "another action is already waiting for confirmation",
            })));
        }
        let Some(fut) = turn.executors.execute(name, call_id, arguments) else {
            warn!("no executor bound for `{name}`");
            return Ok(CallOutcome::Rejected(json!({
                "error": format!("tool {name} is not available"),
            })));
        };

        match or_cancel(turn.cancel, fut).await? {
            Ok(output) => Ok(CallOutcome::Output(output)),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                Ok(CallOutcome::Denied(err.reason().into_owned()))
            }
            Err(err) => {
                debug!("tool `{name}` failed: {err}");
                Ok(CallOutcome::Rejected(err.model_payload()))
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn final_text(content: String, locale: Locale) -> String {
    if content.trim().is_empty() {
        locale.fallback_answer().to_owned()
    } else {
        content
    }
}

async fn or_cancel<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, AgentError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        output = fut => Ok(output),
    }
}
