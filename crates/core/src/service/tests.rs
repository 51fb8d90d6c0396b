use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use survey_agent_test_model::{PresetEvent, PresetResponse, TestModelProvider};

use super::*;
use crate::agent::{AgentBuilder, AgentConfig};
use crate::store::{MemoryStore, ToolRunStatus};
use crate::tool::{PendingAction, Tool, ToolOutput, ToolRegistry, ToolResult};

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct SurveyInput {
    survey_id: String,
}

struct ActivateTool {
    ctx: ToolContext,
}

impl Tool for ActivateTool {
    type Input = SurveyInput;

    fn name(&self) -> &str {
        "activate_survey"
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let slow = input.survey_id == "slow";
        let result = Ok(ToolOutput::PendingConfirmation(PendingAction {
            task_id: format!("task-for-{}", self.ctx.user_id),
            action_type: "activate_survey".to_owned(),
            target: input.survey_id,
            message: "Activate the survey?".to_owned(),
            metadata: None,
        }));
        async move {
            if slow {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            result
        }
    }
}

fn service(
    provider: &TestModelProvider,
    store: &Arc<MemoryStore>,
    config: AgentConfig,
) -> ChatService {
    let registry = ToolRegistry::builder()
        .with_confirmable_tool::<SurveyInput>(
            "activate_survey",
            "Activates a draft survey.",
        )
        .build()
        .unwrap();
    let agent = AgentBuilder::with_model_provider(provider.clone())
        .with_registry(Arc::new(registry))
        .with_store(store.clone())
        .with_config(config)
        .build();
    ChatService::new(agent, store.clone(), |ctx: &ToolContext| {
        ToolExecutorSet::new().with_tool(ActivateTool { ctx: ctx.clone() })
    })
}

fn request(message: &str, session_id: Option<String>) -> ChatRequest {
    ChatRequest {
        user_id: "u-1".to_owned(),
        message: message.to_owned(),
        session_id,
        locale: Locale::En,
    }
}

async fn collect(
    service: &ChatService,
    req: ChatRequest,
) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(16);
    service.handle(req, tx, CancellationToken::new()).await;
    let mut events = vec![];
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn session_of(events: &[StreamEvent]) -> String {
    match events.last() {
        Some(StreamEvent::Done { session_id }) => session_id.clone(),
        other => panic!("turn didn't finish: {other:?}"),
    }
}

#[tokio::test]
async fn test_turn_with_pending_action() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::with_events([
        PresetEvent::tool_call(
            "call_1",
            "activate_survey",
            json!({ "survey_id": "s-1" }),
        ),
    ]));
    provider.add_response(
        PresetResponse::text("Activate Pulse Q3?").with_usage(40, 6),
    );
    let store = Arc::new(MemoryStore::new());
    let service = service(&provider, &store, AgentConfig::default());

    let events = collect(&service, request("Start the Q3 pulse", None)).await;
    let kinds: Vec<_> = events.iter().map(StreamEvent::kind).collect();
    assert_eq!(kinds, ["tool_result", "text", "action_pending", "done"]);
    let StreamEvent::ActionPending { id, target, .. } = &events[2] else {
        unreachable!();
    };
    assert_eq!(id, "task-for-u-1");
    assert_eq!(target, "s-1");

    let session_id = session_of(&events);
    let messages = store.session_messages(&session_id, 10).await.unwrap();
    let roles: Vec<_> = messages.iter().map(|msg| msg.role).collect();
    assert_eq!(roles, [Role::User, Role::Tool, Role::Assistant]);
    let answer = &messages[2];
    assert_eq!(answer.content.as_deref(), Some("Activate Pulse Q3?"));
    assert_eq!(answer.tokens_in, Some(40));
    assert_eq!(answer.tokens_out, Some(6));
    assert!(answer.latency_ms.is_some());
}

#[tokio::test]
async fn test_history_is_replayed() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::with_events([
        PresetEvent::tool_call(
            "call_1",
            "activate_survey",
            json!({ "survey_id": "s-1" }),
        ),
    ]));
    provider.add_response(PresetResponse::text("Activate it?"));
    provider.add_response(PresetResponse::text("Sure."));
    let store = Arc::new(MemoryStore::new());
    let service = service(&provider, &store, AgentConfig::default());

    let events = collect(&service, request("Start it", None)).await;
    let session_id = session_of(&events);
    let events =
        collect(&service, request("Thanks", Some(session_id.clone()))).await;
    assert_eq!(session_of(&events), session_id);

    let requests = provider.requests();
    assert_eq!(
        requests[2].messages,
        [
            ModelMessage::user("Start it"),
            ModelMessage::assistant("Activate it?"),
            ModelMessage::user("Thanks"),
        ]
    );
}

#[tokio::test]
async fn test_tool_messages_stay_out_of_history() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::with_events([
        PresetEvent::tool_call("call_1", "lookup_employee", json!({})),
        PresetEvent::tool_call("call_2", "lookup_employee", json!({})),
        PresetEvent::tool_call("call_3", "lookup_employee", json!({})),
    ]));
    provider.add_response(PresetResponse::text("Nice to meet you, Kim."));
    provider.add_response(PresetResponse::text("Kim."));
    provider.add_response(PresetResponse::text("Anytime."));
    let store = Arc::new(MemoryStore::new());
    let config = AgentConfig::default().with_history_limit(3);
    let service = service(&provider, &store, config);

    let events = collect(&service, request("My name is Kim", None)).await;
    let session_id = session_of(&events);
    let events = collect(
        &service,
        request("What is my name?", Some(session_id.clone())),
    )
    .await;
    session_of(&events);
    let events =
        collect(&service, request("Thanks", Some(session_id.clone()))).await;
    session_of(&events);

    let requests = provider.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(
        requests[2].messages,
        [
            ModelMessage::user("My name is Kim"),
            ModelMessage::assistant("Nice to meet you, Kim."),
            ModelMessage::user("What is my name?"),
        ]
    );
    // The window starts at an answer, which is dropped.
    assert_eq!(
        requests[3].messages,
        [
            ModelMessage::user("What is my name?"),
            ModelMessage::assistant("Kim."),
            ModelMessage::user("Thanks"),
        ]
    );
}

#[tokio::test]
async fn test_empty_message() {
    let provider = TestModelProvider::default();
    let store = Arc::new(MemoryStore::new());
    let service = service(&provider, &store, AgentConfig::default());

    let events = collect(&service, request("   ", None)).await;
    assert_eq!(events, [StreamEvent::error("message is empty")]);
    assert!(provider.requests().is_empty());
    assert_eq!(store.session_count(), 0);
}

#[tokio::test]
async fn test_foreign_session() {
    let provider = TestModelProvider::default();
    let store = Arc::new(MemoryStore::new());
    let session = store.get_or_create_session("u-2", None).await.unwrap();
    let service = service(&provider, &store, AgentConfig::default());

    let events = collect(&service, request("Hi", Some(session.id))).await;
    assert_eq!(events, [StreamEvent::error("session not found")]);
}

#[tokio::test]
async fn test_model_failure() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::text("x").with_failures(0));
    let store = Arc::new(MemoryStore::new());
    let service = service(&provider, &store, AgentConfig::default());

    let events = collect(&service, request("Hi", None)).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), "error");
}

#[tokio::test(start_paused = true)]
async fn test_turn_timeout() {
    let mut provider = TestModelProvider::default();
    provider.set_delay(Duration::from_secs(30));
    provider.add_response(PresetResponse::text("too late"));
    let store = Arc::new(MemoryStore::new());
    let config =
        AgentConfig::default().with_turn_timeout(Duration::from_secs(5));
    let service = service(&provider, &store, config);

    let events = collect(&service, request("Hi", None)).await;
    assert_eq!(events, [StreamEvent::error("turn timed out")]);
}

#[tokio::test(start_paused = true)]
async fn test_turn_timeout_resolves_tool_runs() {
    let mut provider = TestModelProvider::default();
    provider.add_response(PresetResponse::with_events([
        PresetEvent::tool_call(
            "call_1",
            "activate_survey",
            json!({ "survey_id": "slow" }),
        ),
    ]));
    provider.add_response(PresetResponse::text("never requested"));
    let store = Arc::new(MemoryStore::new());
    let session = store.get_or_create_session("u-1", None).await.unwrap();
    let config =
        AgentConfig::default().with_turn_timeout(Duration::from_secs(5));
    let service = service(&provider, &store, config);

    let events =
        collect(&service, request("Start it", Some(session.id.clone()))).await;
    assert_eq!(events, [StreamEvent::error("turn timed out")]);
    assert_eq!(provider.consumed(), 1);

    let runs = store.tool_runs(&session.id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, ToolRunStatus::Failed);
}
