use std::time::Duration;

/// The default bound on model rounds per turn.
pub const MAX_TOOL_ROUNDS: usize = 8;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(120);

/// Tunables of the agent loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig {
    max_tool_rounds: usize,
    history_limit: usize,
    turn_timeout: Duration,
    system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: MAX_TOOL_ROUNDS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    /// Bounds the number of model rounds in one turn.
    #[inline]
    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// Sets how many past messages are replayed to the model.
    #[inline]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Bounds the wall time of a whole turn.
    #[inline]
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    /// Sets the system prompt sent ahead of every request.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[inline]
    pub fn max_tool_rounds(&self) -> usize {
        self.max_tool_rounds
    }

    #[inline]
    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    #[inline]
    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout
    }

    #[inline]
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }
}
