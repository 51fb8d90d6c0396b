use std::collections::BTreeMap;
use std::fmt::{self, Debug};

use jsonschema::Validator;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use survey_agent_model::ModelTool;

/// One failing field of a tool input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// JSON pointer to the offending value, `""` for the root.
    pub path: String,
    /// What is wrong with the value.
    pub message: String,
}

/// A declared schema could not be compiled.
#[derive(Debug, thiserror::Error)]
#[error("invalid schema for tool `{tool}`: {reason}")]
pub struct SchemaError {
    tool: String,
    reason: String,
}

struct Entry {
    description: String,
    schema: Value,
    validator: Validator,
    confirmable: bool,
}

/// The static catalog of tools the model may call.
#[derive(Default)]
pub struct ToolRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ToolRegistry {
    /// Starts declaring tools.
    #[inline]
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Returns whether `name` is a declared tool.
    #[inline]
    pub fn is_valid_tool_name(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns whether `name` is declared as a confirmable tool.
    #[inline]
    pub fn is_confirmable(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|entry| entry.confirmable)
    }

    /// Returns the input schema of a declared tool.
    #[inline]
    pub fn schema_for(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|entry| &entry.schema)
    }

    /// Validates `input` against the schema of `name`.
    ///
    /// On failure every violation is reported, so the list is never empty.
    /// Validating against an undeclared tool reports a single root error.
    pub fn validate(
        &self,
        name: &str,
        input: &Value,
    ) -> Result<(), Vec<FieldError>> {
        let Some(entry) = self.entries.get(name) else {
            return Err(vec![FieldError {
                path: String::new(),
                message: format!("unknown tool: {name}"),
            }]);
        };

        let errors: Vec<_> = entry
            .validator
            .iter_errors(input)
            .map(|err| FieldError {
                path: err.instance_path.to_string(),
                message: err.to_string(),
            })
            .collect();
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Returns the definitions sent to the model, ordered by name.
    pub fn definitions(&self) -> Vec<ModelTool> {
        self.entries
            .iter()
            .map(|(name, entry)| ModelTool {
                name: name.clone(),
                description: entry.description.clone(),
                parameters: entry.schema.clone(),
            })
            .collect()
    }
}

impl Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(name, entry)| (name, entry.confirmable)),
            )
            .finish()
    }
}

/// [`ToolRegistry`] builder.
#[derive(Default)]
pub struct ToolRegistryBuilder {
    entries: Vec<(String, String, Value, bool)>,
}

impl ToolRegistryBuilder {
    /// Declares a read-only tool whose input is `I`.
    #[inline]
    pub fn with_tool<I: JsonSchema>(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let schema = schema_for!(I).to_value();
        self.with_schema(name, description, schema, false)
    }

    /// Declares a tool whose effect is deferred behind user confirmation.
    #[inline]
    pub fn with_confirmable_tool<I: JsonSchema>(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let schema = schema_for!(I).to_value();
        self.with_schema(name, description, schema, true)
    }

    /// Declares a tool with a hand-written schema.
    pub fn with_schema(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        confirmable: bool,
    ) -> Self {
        self.entries
            .push((name.into(), description.into(), schema, confirmable));
        self
    }

    /// Compiles all schemas.
    pub fn build(self) -> Result<ToolRegistry, SchemaError> {
        let mut entries = BTreeMap::new();
        for (name, description, schema, confirmable) in self.entries {
            let validator =
                Validator::new(&schema).map_err(|err| SchemaError {
                    tool: name.clone(),
                    reason: err.to_string(),
                })?;
            entries.insert(
                name,
                Entry {
                    description,
                    schema,
                    validator,
                    confirmable,
                },
            );
        }
        Ok(ToolRegistry { entries })
    }
}
