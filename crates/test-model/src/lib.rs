//! A scripted fake model for testing the agent loop.

mod preset;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use survey_agent_model::{
    ErrorKind, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    events: VecDeque<ModelResponseEvent>,
    delay: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        let Some(delay) = this.delay else {
            return Poll::Ready(Ok(this.events.pop_front()));
        };

        let sleep = this.sleep.get_or_insert_with(|| Box::pin(sleep(delay)));
        ready!(sleep.as_mut().poll(cx));
        this.sleep = None;
        Poll::Ready(Ok(this.events.pop_front()))
    }
}

#[derive(Default)]
struct ScriptState {
    steps: Vec<PresetResponse>,
    cursor: usize,
    failed_attempts: u64,
    requests: Vec<ModelRequest>,
}

/// A scripted fake model for testing purpose.
///
/// Every request consumes the next preset response of the script, in the
/// order they were added. Requests beyond the end of the script fail. All
/// clones share the same script, so a test can keep one clone around to
/// inspect the requests the agent sent.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    state: Arc<Mutex<ScriptState>>,
    delay: Option<Duration>,
}

impl TestModelProvider {
    #[inline]
    pub fn add_response(&mut self, preset: PresetResponse) {
        self.lock().steps.push(preset);
    }

    /// Makes every event of every response arrive after `duration`.
    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns all requests received so far, including failed ones.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock().requests.clone()
    }

    /// Returns how many scripted responses were fully consumed.
    pub fn consumed(&self) -> usize {
        self.lock().cursor
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        // A poisoned script only happens after a test already panicked.
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn next_response(&self, req: &ModelRequest) -> Result<TestModelResponse, Error> {
        let mut state = self.lock();
        state.requests.push(req.clone());

        let cursor = state.cursor;
        let Some(step) = state.steps.get(cursor).cloned() else {
            return Err(Error {
                message: "no enough steps",
                kind: ErrorKind::Other,
            });
        };

        match step.failures {
            Some(0) => {
                return Err(Error {
                    message: "scripted permanent failure",
                    kind: ErrorKind::Network,
                });
            }
            Some(failures) if state.failed_attempts < failures => {
                state.failed_attempts += 1;
                return Err(Error {
                    message: "scripted transient failure",
                    kind: ErrorKind::RateLimitExceeded,
                });
            }
            _ => {}
        }

        state.cursor += 1;
        state.failed_attempts = 0;

        let finish_reason = if step.has_tool_calls() {
            ModelFinishReason::ToolCalls
        } else {
            ModelFinishReason::Stop
        };
        let mut events: VecDeque<_> = step
            .events
            .into_iter()
            .map(|event| match event {
                PresetEvent::MessageDelta(msg) => {
                    ModelResponseEvent::MessageDelta(msg)
                }
                PresetEvent::ToolCall(req) => ModelResponseEvent::ToolCall(req),
                PresetEvent::Usage(usage) => ModelResponseEvent::Usage(usage),
            })
            .collect();
        events.push_back(ModelResponseEvent::Completed(finish_reason));

        Ok(TestModelResponse {
            events,
            delay: self.delay,
            sleep: None,
        })
    }
}

impl Debug for TestModelProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TestModelProvider")
            .field("steps", &state.steps.len())
            .field("cursor", &state.cursor)
            .finish_non_exhaustive()
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        ready(self.next_response(req))
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use serde_json::json;
    use survey_agent_model::{ModelMessage, ToolCallRequest};

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> (String, Vec<ToolCallRequest>, Option<ModelFinishReason>) {
        let mut resp = pin!(resp);
        let mut msg = String::new();
        let mut tool_calls = vec![];
        let mut finish = None;
        while let Some(event) = poll_fn(|cx| resp.as_mut().poll_next_event(cx))
            .await
            .unwrap()
        {
            match event {
                ModelResponseEvent::Completed(reason) => finish = Some(reason),
                ModelResponseEvent::MessageDelta(delta) => msg.push_str(&delta),
                ModelResponseEvent::ToolCall(req) => tool_calls.push(req),
                ModelResponseEvent::Usage(_) => {}
            }
        }
        (msg, tool_calls, finish)
    }

    fn request(text: &str) -> ModelRequest {
        ModelRequest {
            messages: vec![ModelMessage::user(text)],
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn test_script_is_consumed_in_order() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::MessageDelta("Checking ".to_owned()),
            PresetEvent::tool_call(
                "call_1",
                "get_survey_progress",
                json!({ "survey_id": "s-1" }),
            ),
        ]));
        provider.add_response(PresetResponse::text("Done."));

        let resp = provider.send_request(&request("progress?")).await.unwrap();
        let (msg, calls, finish) = collect_response(resp).await;
        assert_eq!(msg, "Checking ");
        assert_eq!(calls.len(), 1);
        assert_eq!(finish, Some(ModelFinishReason::ToolCalls));

        let resp = provider.send_request(&request("and?")).await.unwrap();
        let (msg, calls, finish) = collect_response(resp).await;
        assert_eq!(msg, "Done.");
        assert!(calls.is_empty());
        assert_eq!(finish, Some(ModelFinishReason::Stop));

        assert!(provider.send_request(&request("more")).await.is_err());
        assert_eq!(provider.requests().len(), 3);
        assert_eq!(provider.consumed(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::text("ok").with_failures(2));

        for _ in 0..2 {
            let err = provider.send_request(&request("hi")).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        }
        assert!(provider.send_request(&request("hi")).await.is_ok());
    }

    #[tokio::test]
    async fn test_delayed_events() {
        let mut provider = TestModelProvider::default();
        provider.set_delay(Duration::from_millis(1));
        provider.add_response(PresetResponse::text("slow"));

        let resp = provider.send_request(&request("hi")).await.unwrap();
        let (msg, _, _) = collect_response(resp).await;
        assert_eq!(msg, "slow");
    }
}
