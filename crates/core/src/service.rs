//! Turn orchestration between the transport, the store and the agent.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Instant;

use survey_agent_model::ModelMessage;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent::{Agent, AgentError, Turn, TurnOutcome};
use crate::event::StreamEvent;
use crate::store::{Message, NewMessage, Role, SessionStore, StoreError};
use crate::tool::ToolExecutorSet;
use crate::Locale;

/// Who a turn runs for. Executors are bound to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolContext {
    pub user_id: String,
    pub session_id: String,
    pub locale: Locale,
}

/// Builds the executors for one request.
pub trait ExecutorFactory: Send + Sync {
    /// Returns executors bound to `ctx`.
    fn executors(&self, ctx: &ToolContext) -> ToolExecutorSet;
}

impl<F> ExecutorFactory for F
where
    F: Fn(&ToolContext) -> ToolExecutorSet + Send + Sync,
{
    #[inline]
    fn executors(&self, ctx: &ToolContext) -> ToolExecutorSet {
        self(ctx)
    }
}

/// A new user message from an authenticated caller.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    /// Continue this session instead of starting a new one.
    pub session_id: Option<String>,
    pub locale: Locale,
}

/// Runs turns and reports them as [`StreamEvent`]s.
pub struct ChatService {
    agent: Agent,
    store: Arc<dyn SessionStore>,
    executors: Box<dyn ExecutorFactory>,
}

impl ChatService {
    /// Creates a service. `store` should be the one the agent logs to.
    pub fn new<E: ExecutorFactory + 'static>(
        agent: Agent,
        store: Arc<dyn SessionStore>,
        executors: E,
    ) -> Self {
        Self {
            agent,
            store,
            executors: Box::new(executors),
        }
    }

    /// Runs one turn, pushing its events to `events`.
    ///
    /// The last event is always either `done` or `error`, unless the
    /// receiver went away first.
    pub async fn handle(
        &self,
        req: ChatRequest,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        if req.message.trim().is_empty() {
            events.send(StreamEvent::error("message is empty")).await.ok();
            return;
        }

        match self.run(req, &events, &cancel).await {
            Ok(()) => {}
            Err(AgentError::Cancelled) => {
                debug!("turn cancelled by the client");
            }
            Err(err) => {
                error!("turn failed: {err}");
                events.send(StreamEvent::error(error_message(&err))).await.ok();
            }
        }
    }

    async fn run(
        &self,
        req: ChatRequest,
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let session = self
            .store
            .get_or_create_session(&req.user_id, req.session_id.as_deref())
            .await?;
        let span = info_span!("turn", session_id = %session.id);

        async move {
            let history = self.history(&session.id).await?;
            self.store
                .log_message(NewMessage::user(&session.id, &req.message))
                .await?;

            let ctx = ToolContext {
                user_id: req.user_id,
                session_id: session.id.clone(),
                locale: req.locale,
            };
            let executors = self.executors.executors(&ctx);

            let started = Instant::now();
            let turn_cancel = cancel.child_token();
            let turn = Turn {
                session_id: &session.id,
                message: &req.message,
                history: &history,
                executors: &executors,
                locale: req.locale,
                events,
                cancel: &turn_cancel,
            };
            let outcome = self.run_with_deadline(turn, &turn_cancel).await?;
            let latency_ms =
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            info!(
                "turn finished in {latency_ms}ms after {} rounds, {} tool runs",
                outcome.rounds,
                outcome.tool_runs.len()
            );

            self.store
                .log_message(NewMessage {
                    tokens_in: Some(outcome.usage.input_tokens),
                    tokens_out: Some(outcome.usage.output_tokens),
                    latency_ms: Some(latency_ms),
                    ..NewMessage::assistant(&session.id, &outcome.text)
                })
                .await?;
            self.store.update_session_activity(&session.id).await?;

            send(events, StreamEvent::Text {
                content: outcome.text,
            })
            .await?;
            if let Some(action) = outcome.pending_action {
                send(events, action.into()).await?;
            }
            send(events, StreamEvent::Done {
                session_id: session.id,
            })
            .await
        }
        .instrument(span)
        .await
    }

    /// Runs the turn until the turn timeout, then cancels it and lets it
    /// wind down so no tool run is left unresolved.
    async fn run_with_deadline(
        &self,
        turn: Turn<'_>,
        turn_cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let run = self.agent.run_turn(turn);
        let deadline = sleep(self.agent.config().turn_timeout());
        tokio::pin!(run, deadline);

        tokio::select! {
            result = &mut run => result,
            _ = &mut deadline => {
                turn_cancel.cancel();
                if let Ok(outcome) = run.await {
                    debug!("turn finished after its deadline, {} rounds", outcome.rounds);
                }
                Err(AgentError::Timeout)
            }
        }
    }

    async fn history(
        &self,
        session_id: &str,
    ) -> Result<Vec<ModelMessage>, StoreError> {
        let limit = self.agent.config().history_limit();
        let messages = self.store.dialogue_messages(session_id, limit).await?;
        // A window cut mid-exchange must still open with a user message.
        Ok(messages
            .into_iter()
            .skip_while(|msg| msg.role == Role::Assistant)
            .filter_map(to_model_message)
            .collect())
    }
}

fn to_model_message(msg: Message) -> Option<ModelMessage> {
    let content = msg.content?;
    match msg.role {
        Role::User => Some(ModelMessage::user(content)),
        Role::Assistant => Some(ModelMessage::assistant(content)),
        Role::Tool => None,
    }
}

async fn send(
    events: &mpsc::Sender<StreamEvent>,
    event: StreamEvent,
) -> Result<(), AgentError> {
    events.send(event).await.map_err(|_| AgentError::Cancelled)
}

fn error_message(err: &AgentError) -> String {
    match err {
        AgentError::Store(StoreError::NotFound) => "session not found".to_owned(),
        AgentError::Unauthorized(_) | AgentError::Timeout => err.to_string(),
        AgentError::Model(_) | AgentError::Store(_) | AgentError::Cancelled => {
            "the assistant is unavailable, please try again".to_owned()
        }
    }
}
