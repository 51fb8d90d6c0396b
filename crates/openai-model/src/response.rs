use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use pin_project_lite::pin_project;
use serde_json::{Map, Value};
use survey_agent_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent,
    ToolCallRequest, Usage,
};

use crate::Error;
use crate::io::SseDecoder;
use crate::proto::{ChatCompletionChunk, ToolCallDelta};

struct PartialState {
    sse: SseDecoder,
    tool_calls: Vec<ToolCallDelta>,
    usage: Option<Usage>,
    finish_reason: Option<ModelFinishReason>,
    // Events decoded from the stream but not yet handed out. Text deltas
    // flow through here as they arrive; tool calls, usage and completion
    // are queued once the stream ends, since tool call arguments are only
    // complete by then.
    pending: VecDeque<ModelResponseEvent>,
    done: bool,
}

impl PartialState {
    fn merge_tool_call(&mut self, delta: ToolCallDelta) {
        let index = delta.index.unwrap_or(self.tool_calls.len() as u32);
        let Some(partial) = self
            .tool_calls
            .iter_mut()
            .find(|t| t.index.unwrap_or(0) == index)
        else {
            self.tool_calls.push(ToolCallDelta {
                index: Some(index),
                ..delta
            });
            return;
        };

        if let Some(id) = delta.id {
            partial.id.get_or_insert_default().push_str(&id);
        }
        let Some(function) = delta.function else {
            return;
        };
        let partial_func = partial.function.get_or_insert_default();
        if let Some(name) = function.name {
            partial_func.name.get_or_insert_default().push_str(&name);
        }
        if let Some(arguments) = function.arguments {
            partial_func
                .arguments
                .get_or_insert_default()
                .push_str(&arguments);
        }
    }

    fn finish(&mut self) {
        self.done = true;
        let mut tool_calls = std::mem::take(&mut self.tool_calls);
        tool_calls.sort_by_key(|t| t.index);
        let has_tool_calls = !tool_calls.is_empty();
        for call in tool_calls {
            let function = call.function.unwrap_or_default();
            self.pending.push_back(ModelResponseEvent::ToolCall(
                ToolCallRequest {
                    id: call.id.unwrap_or_default(),
                    name: function.name.unwrap_or_default(),
                    arguments: parse_arguments(function.arguments),
                },
            ));
        }
        if let Some(usage) = self.usage.take() {
            self.pending.push_back(ModelResponseEvent::Usage(usage));
        }
        let reason = self.finish_reason.take().unwrap_or(if has_tool_calls {
            ModelFinishReason::ToolCalls
        } else {
            ModelFinishReason::Stop
        });
        self.pending.push_back(ModelResponseEvent::Completed(reason));
    }
}

/// Empty arguments mean "no arguments". Unparsable ones are kept as a raw
/// string so that schema validation reports them back to the model.
fn parse_arguments(raw: Option<String>) -> Value {
    let raw = raw.unwrap_or_default();
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    pub struct OpenAIResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
    }
}

impl OpenAIResponse {
    pub fn from_sse(sse: SseDecoder) -> Self {
        let partial_state = PartialState {
            sse,
            tool_calls: Default::default(),
            usage: None,
            finish_reason: None,
            pending: Default::default(),
            done: false,
        };
        Self {
            next_event_fut: Some(Box::pin(next_event(partial_state))),
        }
    }
}

impl ModelResponse for OpenAIResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        match ready!(next_event_fut.as_mut().poll(cx)) {
            Ok((Some(event), partial_state)) => {
                *this.next_event_fut =
                    Some(Box::pin(next_event(partial_state)));
                Poll::Ready(Ok(Some(event)))
            }
            Ok((None, _)) => {
                *this.next_event_fut = None;
                Poll::Ready(Ok(None))
            }
            Err(err) => {
                *this.next_event_fut = None;
                Poll::Ready(Err(err))
            }
        }
    }
}

async fn next_event(mut state: PartialState) -> NextEvent {
    loop {
        if let Some(event) = state.pending.pop_front() {
            return Ok((Some(event), state));
        }
        if state.done {
            return Ok((None, state));
        }

        let data = state.sse.next_event().await.map_err(|err| {
            Error::new(format!("{err:?}"), ErrorKind::Network)
        })?;
        let Some(data) = data else {
            state.finish();
            continue;
        };
        trace!("got sse event: {data}");
        if data == "[DONE]" {
            state.finish();
            continue;
        }

        let chunk = serde_json::from_str::<ChatCompletionChunk>(&data)
            .map_err(|err| {
                Error::new(format!("{err}"), ErrorKind::InvalidResponse)
            })?;
        if let Some(usage) = chunk.usage {
            state.usage = Some(usage.into());
        }
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    state
                        .pending
                        .push_back(ModelResponseEvent::MessageDelta(content));
                }
            }
            for delta in choice.delta.tool_calls.into_iter().flatten() {
                state.merge_tool_call(delta);
            }
            if let Some(reason) = choice.finish_reason {
                state.finish_reason = Some(match reason.as_str() {
                    "tool_calls" | "function_call" => {
                        ModelFinishReason::ToolCalls
                    }
                    "length" => ModelFinishReason::Length,
                    _ => ModelFinishReason::Stop,
                });
            }
        }
    }
}
