use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::store::{MemoryStore, TaskStep};

#[derive(Clone, Default)]
struct CountingAction {
    runs: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl ConfirmedAction for CountingAction {
    async fn execute(
        &self,
        input: Value,
        ctx: &ActionContext,
    ) -> Result<String, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail {
            return Err(ToolError::execution_error().with_reason("mail server down"));
        }
        Ok(format!("closed {} for {}", input["survey_id"], ctx.user_id))
    }
}

fn setup(action: CountingAction) -> (Arc<MemoryStore>, Arc<ConfirmationGate>) {
    let store = Arc::new(MemoryStore::new());
    let gate = ConfirmationGate::new(
        store.clone(),
        ActionRegistry::new().with_action("close_survey", action),
    );
    (store, Arc::new(gate))
}

fn proposal() -> TaskProposal {
    TaskProposal {
        session_id: "session-1".to_owned(),
        creator_id: "u-1".to_owned(),
        title: "Close Engagement 2024".to_owned(),
        tool_name: "close_survey".to_owned(),
        input: json!({ "survey_id": "s-1" }),
        metadata: None,
    }
}

#[tokio::test]
async fn test_confirm() {
    let action = CountingAction::default();
    let (store, gate) = setup(action.clone());

    let task_id = gate.create_pending_task(proposal()).await.unwrap();
    let task = store.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let message = gate
        .resolve(&task_id, "u-1", true, Locale::En)
        .await
        .unwrap();
    assert_eq!(message, r#"closed "s-1" for u-1"#);
    assert_eq!(action.runs.load(Ordering::SeqCst), 1);

    let task = store.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let steps = store.task_steps(&task_id).await.unwrap();
    assert_eq!(steps[0].status, TaskStepStatus::Completed);

    let err = gate
        .resolve(&task_id, "u-1", true, Locale::En)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GateError::Conflict {
            status: TaskStatus::Completed
        }
    ));
    assert_eq!(action.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_action() {
    let action = CountingAction {
        fail: true,
        ..Default::default()
    };
    let (store, gate) = setup(action);

    let task_id = gate.create_pending_task(proposal()).await.unwrap();
    let err = gate
        .resolve(&task_id, "u-1", true, Locale::En)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "mail server down");

    let task = store.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let steps = store.task_steps(&task_id).await.unwrap();
    assert_eq!(steps[0].status, TaskStepStatus::Failed);
    assert_eq!(steps[0].error.as_deref(), Some("mail server down"));
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let action = CountingAction::default();
    let (store, gate) = setup(action.clone());

    let task_id = gate.create_pending_task(proposal()).await.unwrap();
    let first = gate
        .resolve(&task_id, "u-1", false, Locale::Ja)
        .await
        .unwrap();
    let second = gate
        .resolve(&task_id, "u-1", false, Locale::Ja)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first, Locale::Ja.cancellation_message());

    let task = store.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    let steps = store.task_steps(&task_id).await.unwrap();
    assert_eq!(steps[0].status, TaskStepStatus::Skipped);

    let err = gate
        .resolve(&task_id, "u-1", true, Locale::En)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GateError::Conflict {
            status: TaskStatus::Canceled
        }
    ));
    assert_eq!(action.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_tasks_are_private() {
    let (_, gate) = setup(CountingAction::default());
    let task_id = gate.create_pending_task(proposal()).await.unwrap();

    let err = gate
        .resolve(&task_id, "u-2", true, Locale::En)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::NotFound));

    let err = gate
        .resolve("missing", "u-1", false, Locale::En)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::NotFound));
}

#[tokio::test]
async fn test_unsupported_tool() {
    let (_, gate) = setup(CountingAction::default());
    let err = gate
        .create_pending_task(TaskProposal {
            tool_name: "delete_company".to_owned(),
            ..proposal()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::UnsupportedTool(name) if name == "delete_company"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_confirmations() {
    let action = CountingAction::default();
    let (_, gate) = setup(action.clone());
    let task_id = gate.create_pending_task(proposal()).await.unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                gate.resolve(&task_id, "u-1", true, Locale::En).await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(GateError::Conflict { .. }) => conflicts += 1,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(action.runs.load(Ordering::SeqCst), 1);
}

/// Delegates to a [`MemoryStore`] but can't start any step.
struct StuckSteps(Arc<MemoryStore>);

#[async_trait]
impl TaskStore for StuckSteps {
    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError> {
        self.0.create_task(task).await
    }

    async fn task(&self, id: &str) -> Result<Task, StoreError> {
        self.0.task(id).await
    }

    async fn task_steps(
        &self,
        task_id: &str,
    ) -> Result<Vec<TaskStep>, StoreError> {
        self.0.task_steps(task_id).await
    }

    async fn claim_task(
        &self,
        id: &str,
        next: TaskStatus,
    ) -> Result<bool, StoreError> {
        self.0.claim_task(id, next).await
    }

    async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        self.0.set_task_status(id, status).await
    }

    async fn set_step_status(
        &self,
        step_id: &str,
        status: TaskStepStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        if status == TaskStepStatus::InProgress {
            return Err(StoreError::Backend("disk full".to_owned()));
        }
        self.0.set_step_status(step_id, status, error).await
    }

    async fn skip_steps(&self, task_id: &str) -> Result<(), StoreError> {
        self.0.skip_steps(task_id).await
    }

    async fn session_tasks(
        &self,
        session_id: &str,
    ) -> Result<Vec<Task>, StoreError> {
        self.0.session_tasks(session_id).await
    }
}

#[tokio::test]
async fn test_step_store_error_fails_the_task() {
    let action = CountingAction::default();
    let store = Arc::new(MemoryStore::new());
    let gate = ConfirmationGate::new(
        Arc::new(StuckSteps(store.clone())),
        ActionRegistry::new().with_action("close_survey", action.clone()),
    );

    let task_id = gate.create_pending_task(proposal()).await.unwrap();
    let err = gate
        .resolve(&task_id, "u-1", true, Locale::En)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::Store(StoreError::Backend(_))));
    assert_eq!(action.runs.load(Ordering::SeqCst), 0);

    let task = store.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}
