use std::collections::HashMap;

use axum::body::{Body, to_bytes};
use axum::http::Request;
use survey_agent_core::store::{
    MemoryStore, SessionStore, TaskStatus, TaskStore, ToolRunStatus,
};
use survey_agent_core::AgentConfig;
use survey_agent_test_model::{PresetEvent, PresetResponse, TestModelProvider};
use tower::ServiceExt as _;

use super::*;
use crate::surveys::{SurveyDirectory, SurveyStatus, fixtures};

struct Fixture {
    router: Router,
    provider: TestModelProvider,
    store: Arc<MemoryStore>,
    directory: Arc<SurveyDirectory>,
}

impl Fixture {
    fn new(responses: Vec<PresetResponse>) -> Self {
        let mut provider = TestModelProvider::default();
        for response in responses {
            provider.add_response(response);
        }
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(fixtures::directory());
        let auth = TokenAuth::new(HashMap::from([
            ("tok-hr".to_owned(), "hr-1".to_owned()),
            ("tok-other".to_owned(), "hr-2".to_owned()),
        ]));
        let state = crate::build_state(
            provider.clone(),
            Arc::clone(&store),
            Arc::clone(&directory),
            auth,
            AgentConfig::default(),
        )
        .unwrap();
        Self {
            router: router(state),
            provider,
            store,
            directory,
        }
    }

    async fn post(
        &self,
        uri: &str,
        token: Option<&str>,
        body: Value,
    ) -> (StatusCode, String) {
        let mut req = Request::post(uri).header("content-type", "application/json");
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let resp = self
            .router
            .clone()
            .oneshot(req.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn chat(&self, token: Option<&str>, body: Value) -> (StatusCode, Vec<Value>) {
        let (status, body) = self.post("/chat", token, body).await;
        (status, frames(&body))
    }

    async fn confirm(
        &self,
        token: &str,
        action_id: &str,
        confirmed: bool,
    ) -> (StatusCode, Value) {
        let (status, body) = self
            .post(
                "/confirm-action",
                Some(token),
                json!({ "actionId": action_id, "confirmed": confirmed }),
            )
            .await;
        (status, serde_json::from_str(&body).unwrap())
    }
}

/// Collects the JSON payloads of the `data:` lines of an SSE body.
fn frames(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

fn types(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
}

#[tokio::test]
async fn test_health() {
    let fixture = Fixture::new(vec![]);
    let resp = fixture
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_activate_then_confirm() {
    let fixture = Fixture::new(vec![
        PresetResponse::with_events([PresetEvent::tool_call(
            "call-1",
            "activate_survey",
            json!({ "survey": "Pulse Q3" }),
        )]),
        PresetResponse::text("Shall I activate Pulse Q3? Please confirm."),
    ]);

    let (status, frames) = fixture
        .chat(Some("tok-hr"), json!({ "message": "Open the Q3 pulse survey" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        types(&frames),
        ["tool_result", "text", "action_pending", "done"]
    );
    let pending = &frames[2];
    assert_eq!(pending["actionType"], "activate_survey");
    assert_eq!(pending["target"], "s-pulse");
    let action_id = pending["id"].as_str().unwrap();
    let session_id = frames[3]["sessionId"].as_str().unwrap();

    // Only proposed so far.
    assert_eq!(
        fixture.directory.find("s-pulse").unwrap().status,
        SurveyStatus::Draft
    );

    let (status, body) = fixture.confirm("tok-other", action_id, true).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, body) = fixture.confirm("tok-hr", action_id, true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "“Pulse Q3” is now open for answers.");
    assert_eq!(
        fixture.directory.find("s-pulse").unwrap().status,
        SurveyStatus::Active
    );
    let task = fixture.store.task(action_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.session_id, session_id);

    let (status, _) = fixture.confirm("tok-hr", action_id, true).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = fixture.confirm("tok-hr", action_id, false).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cancel_in_japanese() {
    let fixture = Fixture::new(vec![
        PresetResponse::with_events([PresetEvent::tool_call(
            "call-1",
            "close_survey",
            json!({ "survey": "s-engagement" }),
        )]),
        PresetResponse::text("締め切ってよろしいですか？"),
    ]);

    let (_, frames) = fixture
        .chat(
            Some("tok-hr"),
            json!({ "message": "エンゲージメント調査を締め切って", "locale": "ja-JP" }),
        )
        .await;
    let pending = frames
        .iter()
        .find(|f| f["type"] == "action_pending")
        .unwrap();
    assert!(pending["message"].as_str().unwrap().contains("締め切りますか"));
    let action_id = pending["id"].as_str().unwrap();

    let (status, body) = fixture
        .post(
            "/confirm-action",
            Some("tok-hr"),
            json!({ "actionId": action_id, "confirmed": false, "locale": "ja" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["message"], Locale::Ja.cancellation_message());
    assert_eq!(
        fixture.directory.find("s-engagement").unwrap().status,
        SurveyStatus::Active
    );
    let task = fixture.store.task(action_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn test_close_closed_survey() {
    let fixture = Fixture::new(vec![
        PresetResponse::with_events([PresetEvent::tool_call(
            "call-1",
            "close_survey",
            json!({ "survey": "Onboarding feedback" }),
        )]),
        PresetResponse::text("That survey is already closed."),
    ]);

    let (status, frames) = fixture
        .chat(Some("tok-hr"), json!({ "message": "Close onboarding feedback" }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(types(&frames), ["text", "done"]);

    let session_id = frames[1]["sessionId"].as_str().unwrap();
    assert!(
        fixture
            .store
            .session_tasks(session_id)
            .await
            .unwrap()
            .is_empty()
    );
    let runs = fixture.store.tool_runs(session_id).await.unwrap();
    assert_eq!(runs[0].status, ToolRunStatus::Failed);

    // The model saw why.
    let requests = fixture.provider.requests();
    assert_eq!(requests.len(), 2);
}

#[tokio::test]
async fn test_chat_rejections() {
    let fixture = Fixture::new(vec![]);

    let (status, frames) = fixture
        .chat(Some("tok-hr"), json!({ "message": "  " }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(frames, [json!({ "type": "error", "message": "message is empty" })]);

    let (status, frames) = fixture
        .chat(None, json!({ "message": "List surveys" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(types(&frames), ["error"]);

    let (status, frames) = fixture
        .chat(Some("tok-bogus"), json!({ "message": "List surveys" }))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(types(&frames), ["error"]);

    assert_eq!(fixture.provider.requests().len(), 0);
    assert_eq!(fixture.store.session_count(), 0);
}

#[tokio::test]
async fn test_foreign_session() {
    let fixture = Fixture::new(vec![PresetResponse::text("unused")]);
    let session = fixture
        .store
        .get_or_create_session("hr-2", None)
        .await
        .unwrap();

    let (status, frames) = fixture
        .chat(
            Some("tok-hr"),
            json!({ "message": "Hello", "sessionId": session.id }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        frames,
        [json!({ "type": "error", "message": "session not found" })]
    );
}

#[tokio::test]
async fn test_confirm_action_rejections() {
    let fixture = Fixture::new(vec![]);

    let (status, body) = fixture
        .post(
            "/confirm-action",
            None,
            json!({ "actionId": "x", "confirmed": true }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, r#"{"error":"unauthorized"}"#);

    let (status, _) = fixture
        .post("/confirm-action", Some("tok-hr"), json!({ "actionId": "x" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = fixture.confirm("tok-hr", "missing", true).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "action not found");
}
