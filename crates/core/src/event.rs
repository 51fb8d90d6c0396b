use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool::PendingAction;

/// Progress of one turn, as pushed to the client.
///
/// Within a turn the order is: any number of `tool_result`, then `text`,
/// then at most one `action_pending`, then `done`. A failure replaces all
/// of that with a single `error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum StreamEvent {
    /// A tool produced output.
    ToolResult {
        /// The tool's name.
        tool: String,
        /// What the tool returned.
        output: Value,
    },
    /// The final answer.
    Text {
        /// The answer text.
        content: String,
    },
    /// The turn proposed an action that needs confirmation.
    ActionPending {
        /// The task id to confirm or cancel.
        id: String,
        /// The kind of action.
        action_type: String,
        /// The object the action touches.
        target: String,
        /// The confirmation prompt.
        message: String,
        /// Extra details for rendering.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    /// The turn finished.
    Done {
        /// The session the turn belongs to.
        session_id: String,
    },
    /// The turn failed.
    Error {
        /// A message that is safe to show to the user.
        message: String,
    },
}

impl StreamEvent {
    /// Returns the wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::Text { .. } => "text",
            StreamEvent::ActionPending { .. } => "action_pending",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Shorthand for an error event.
    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }
}

impl From<PendingAction> for StreamEvent {
    fn from(action: PendingAction) -> Self {
        StreamEvent::ActionPending {
            id: action.task_id,
            action_type: action.action_type,
            target: action.target,
            message: action.message,
            metadata: action.metadata,
        }
    }
}
