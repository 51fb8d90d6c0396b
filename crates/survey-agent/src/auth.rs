use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

/// Resolves bearer tokens to user ids.
#[derive(Clone, Default)]
pub struct TokenAuth {
    tokens: Arc<HashMap<String, String>>,
}

impl TokenAuth {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            tokens: Arc::new(tokens),
        }
    }

    /// Returns the user behind the request's `Authorization` header.
    pub fn user_id(&self, headers: &HeaderMap) -> Option<&str> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, token) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        self.tokens.get(token.trim()).map(String::as_str)
    }
}

impl Debug for TokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuth")
            .field("tokens", &format_args!("<{} redacted>", self.tokens.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn test_user_id() {
        let auth = TokenAuth::new(HashMap::from([(
            "tok-a".to_owned(),
            "hr-1".to_owned(),
        )]));
        assert_eq!(auth.user_id(&headers("Bearer tok-a")), Some("hr-1"));
        assert_eq!(auth.user_id(&headers("bearer  tok-a")), Some("hr-1"));
        assert_eq!(auth.user_id(&headers("Bearer tok-b")), None);
        assert_eq!(auth.user_id(&headers("Basic tok-a")), None);
        assert_eq!(auth.user_id(&HeaderMap::new()), None);
        assert!(!format!("{auth:?}").contains("tok-a"));
    }
}
