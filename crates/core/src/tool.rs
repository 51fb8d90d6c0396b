//! Tool declaration, validation and execution.
//!
//! Two halves meet here. The [`ToolRegistry`] is the static catalog that the
//! model sees: names, descriptions, input schemas and which tools are
//! confirmable. The [`ToolExecutorSet`] is built per request and holds the
//! functions that actually run, already bound to the caller's identity.

mod error;
mod executor;
mod object;
mod registry;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub use error::{Error, ErrorKind};
pub use executor::ToolExecutorSet;
pub use registry::{FieldError, SchemaError, ToolRegistry, ToolRegistryBuilder};

/// The result of a tool call.
pub type ToolResult = Result<ToolOutput, Error>;

/// What a tool executor hands back on success.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ToolOutput {
    /// Plain data, fed back to the model as JSON.
    Plain(Value),
    /// A mutating action was proposed and now waits for the user.
    PendingConfirmation(PendingAction),
}

impl ToolOutput {
    /// Wraps any serializable value as a plain output.
    pub fn plain<T: Serialize>(value: &T) -> Result<Self, Error> {
        serde_json::to_value(value)
            .map(ToolOutput::Plain)
            .map_err(|err| Error::execution_error().with_reason(err.to_string()))
    }
}

/// A proposed action that is backed by a pending task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    /// Id of the task; the only handle the client gets.
    pub task_id: String,
    /// The kind of action, usually the confirmable tool's name.
    pub action_type: String,
    /// Reference to the object the action touches, e.g. a survey id.
    pub target: String,
    /// The confirmation prompt shown to the user.
    pub message: String,
    /// Extra details for the client to render.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PendingAction {
    /// The shape recorded as the tool run's output.
    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "action": "pending_confirmation",
            "taskId": self.task_id,
            "type": self.action_type,
            "target": self.target,
            "message": self.message,
        });
        if let Some(metadata) = &self.metadata {
            value["metadata"] = metadata.clone();
        }
        value
    }

    /// The tool-result payload the model sees instead of the real output.
    pub(crate) fn model_payload(&self) -> Value {
        json!({
            "status": "pending_confirmation",
            "taskId": self.task_id,
            "message": self.message,
            "note": "The action has NOT been performed. Ask the user to \
                     confirm or cancel it and do not call further tools.",
        })
    }
}

/// A function the agent can run on behalf of the model.
///
/// Implementations are bound to one request: any identity or session the
/// tool needs is captured when the tool is constructed, not passed at
/// execution time.
pub trait Tool: Send + Sync + 'static {
    /// The type of input that the tool accepts.
    type Input: DeserializeOwned + Send;

    /// Returns the name of the tool, matching its registry entry.
    fn name(&self) -> &str;

    /// Executes the tool with already validated input.
    ///
    /// This method must return a future that is fully independent of `self`,
    /// and the future should be cancellation safe.
    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_action_shapes() {
        let action = PendingAction {
            task_id: "t-1".to_owned(),
            action_type: "close_survey".to_owned(),
            target: "s-1".to_owned(),
            message: "Close the survey?".to_owned(),
            metadata: Some(json!({ "title": "Engagement" })),
        };

        let value = action.to_value();
        assert_eq!(value["action"], "pending_confirmation");
        assert_eq!(value["taskId"], "t-1");
        assert_eq!(value["type"], "close_survey");
        assert_eq!(value["metadata"]["title"], "Engagement");

        let payload = action.model_payload();
        assert_eq!(payload["status"], "pending_confirmation");
        assert!(payload.get("target").is_none());
    }
}
