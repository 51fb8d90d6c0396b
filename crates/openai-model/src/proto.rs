use serde::{Deserialize, Serialize};
use serde_json::Value;
use survey_agent_model::{
    AssistantMessage, ModelMessage, ModelRequest, ModelTool, Usage,
};

use crate::OpenAIConfig;

// ------------------------------
// Types received from the server
// ------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct FunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ToolCallDelta {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub function: Option<FunctionDelta>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub usage: Option<ChunkUsage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Delta {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct ChunkUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl From<ChunkUsage> for Usage {
    #[inline]
    fn from(usage: ChunkUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

// ------------------------
// Types sent to the server
// ------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct Tool {
    r#type: &'static str,
    function: FunctionTool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct ToolCall {
    id: String,
    r#type: &'static str,
    function: FunctionCall,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream_options: StreamOptions,
    stream: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

// -----------
// Conversions
// -----------

pub fn create_request(
    req: &ModelRequest,
    config: &OpenAIConfig,
) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        push_messages(msg, &mut messages);
    }
    ChatCompletionRequest {
        model: config.model.clone(),
        messages,
        tools: req.tools.iter().map(create_tool).collect(),
        max_tokens: config.max_tokens,
        stream_options: StreamOptions {
            include_usage: true,
        },
        stream: true,
    }
}

fn push_messages(msg: &ModelMessage, out: &mut Vec<Message>) {
    match msg {
        ModelMessage::System { content } => out.push(Message::System {
            content: content.clone(),
        }),
        ModelMessage::User { content } => out.push(Message::User {
            content: content.clone(),
        }),
        ModelMessage::Assistant(assistant) => {
            out.push(create_assistant_message(assistant))
        }
        // The wire format wants one `tool` message per call.
        ModelMessage::ToolResults { results } => {
            out.extend(results.iter().map(|result| Message::Tool {
                tool_call_id: result.id.clone(),
                content: result.content.clone(),
            }))
        }
    }
}

fn create_assistant_message(msg: &AssistantMessage) -> Message {
    let content = if msg.content.is_empty() && !msg.tool_calls.is_empty() {
        None
    } else {
        Some(msg.content.clone())
    };
    let tool_calls = msg
        .tool_calls
        .iter()
        .map(|call| ToolCall {
            id: call.id.clone(),
            r#type: "function",
            function: FunctionCall {
                name: call.name.clone(),
                arguments: match &call.arguments {
                    // Arguments that never parsed are replayed verbatim.
                    Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                },
            },
        })
        .collect();
    Message::Assistant {
        content,
        tool_calls,
    }
}

#[inline]
fn create_tool(tool: &ModelTool) -> Tool {
    Tool {
        r#type: "function",
        function: FunctionTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        },
    }
}
