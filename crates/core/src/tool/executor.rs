use std::collections::HashMap;
use std::fmt::{self, Debug};

use serde_json::Value;

use super::Tool;
use super::object::{BoxedToolFuture, ToolObject, ToolObjectImpl};

/// The functions that run tools for one request, keyed by tool name.
#[derive(Default)]
pub struct ToolExecutorSet {
    tools: HashMap<String, Box<dyn ToolObject>>,
}

impl ToolExecutorSet {
    /// Creates an empty set.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an executor, replacing any previous one with the same name.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        let name = tool.name().to_owned();
        self.tools.insert(name, Box::new(ToolObjectImpl(tool)));
        self
    }

    /// Returns whether an executor is bound for `name`.
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Starts executing the tool, or returns `None` if nothing is bound
    /// for `name`.
    pub(crate) fn execute(
        &self,
        name: &str,
        call_id: &str,
        arguments: Value,
    ) -> Option<BoxedToolFuture> {
        let tool = self.tools.get(name)?;
        trace!("spawning a tool ({call_id}) with args: {arguments:?}");
        Some(tool.execute(call_id, arguments))
    }
}

impl Debug for ToolExecutorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.tools.values().map(|tool| tool.name()))
            .finish()
    }
}
