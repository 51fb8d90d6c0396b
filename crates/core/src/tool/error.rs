use std::borrow::Cow;
use std::fmt::{self, Display};

use serde_json::{Value, json};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The input provided to the tool was invalid.
    InvalidInput,
    /// The object the tool was asked about doesn't exist.
    NotFound,
    /// Error occurred while executing the tool.
    ExecutionError,
    /// The caller is not allowed to run the tool.
    PermissionDenied,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidInput => write!(f, "Invalid input"),
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::ExecutionError => write!(f, "Execution error"),
            ErrorKind::PermissionDenied => write!(f, "Permission denied"),
        }
    }
}

/// Describes a tool call error.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Error {
    kind: ErrorKind,
    reason: Option<String>,
    suggestions: Vec<String>,
}

impl Error {
    #[inline]
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            reason: None,
            suggestions: vec![],
        }
    }

    /// Creates a new error with the `InvalidInput` kind.
    #[inline]
    pub fn invalid_input() -> Self {
        Self::new(ErrorKind::InvalidInput)
    }

    /// Creates a new error with the `NotFound` kind.
    #[inline]
    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound)
    }

    /// Creates a new error with the `ExecutionError` kind.
    #[inline]
    pub fn execution_error() -> Self {
        Self::new(ErrorKind::ExecutionError)
    }

    /// Creates a new error with the `PermissionDenied` kind.
    #[inline]
    pub fn permission_denied() -> Self {
        Self::new(ErrorKind::PermissionDenied)
    }

    /// Attaches a reason to the error.
    #[inline]
    pub fn with_reason<S: Into<String>>(self, reason: S) -> Self {
        Self {
            reason: Some(reason.into()),
            ..self
        }
    }

    /// Attaches "did you mean" candidates, typically to a `NotFound` error.
    #[inline]
    pub fn with_suggestions<I, S>(self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            suggestions: suggestions.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Returns the kind of the error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the reason for the error.
    #[inline]
    pub fn reason(&self) -> Cow<'_, str> {
        match self.reason.as_deref() {
            Some(reason) => Cow::Borrowed(reason),
            None => Cow::Owned(format!("{}", self.kind)),
        }
    }

    /// Returns the suggestions attached to the error.
    #[inline]
    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    /// The tool-result payload the model sees for this error.
    pub(crate) fn model_payload(&self) -> Value {
        let mut payload = json!({
            "error": self.reason(),
            "kind": self.kind.to_string(),
        });
        if !self.suggestions.is_empty() {
            payload["suggestions"] = json!(self.suggestions);
        }
        payload
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {reason}", self.kind),
            None => Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_payload() {
        let err = Error::not_found()
            .with_reason("no survey matches `engagment`")
            .with_suggestions(["Engagement 2024"]);
        let payload = err.model_payload();
        assert_eq!(payload["error"], "no survey matches `engagment`");
        assert_eq!(payload["kind"], "Not found");
        assert_eq!(payload["suggestions"][0], "Engagement 2024");

        let payload = Error::execution_error().model_payload();
        assert_eq!(payload["error"], "Execution error");
        assert!(payload.get("suggestions").is_none());
    }
}
