//! Server configuration read from the environment.

use std::collections::HashMap;
use std::env;
use std::fmt::{self, Debug, Display};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use survey_agent_core::AgentConfig;
use survey_agent_openai_model::{OpenAIConfig, OpenAIConfigBuilder};

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// A variable that is missing or can't be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct ServerConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub addr: SocketAddr,
    /// Where the SQLite database lives. Without it nothing is persisted.
    pub db_path: Option<PathBuf>,
    /// A JSON array of surveys to load at startup.
    pub surveys_path: Option<PathBuf>,
    /// Bearer token to user id.
    pub tokens: HashMap<String, String>,
    pub turn_timeout: Option<Duration>,
    pub max_tool_rounds: Option<usize>,
}

impl ServerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through `lookup`. Blank values count as
    /// unset.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key =
            var("OPENAI_API_KEY").ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
        let addr = parse(
            "SURVEY_AGENT_ADDR",
            var("SURVEY_AGENT_ADDR").as_deref().unwrap_or(DEFAULT_ADDR),
        )?;
        let tokens = var("SURVEY_AGENT_TOKENS")
            .map(|v| parse_tokens(&v))
            .transpose()?
            .unwrap_or_default();
        let turn_timeout = var("SURVEY_AGENT_TURN_TIMEOUT_SECS")
            .map(|v| positive("SURVEY_AGENT_TURN_TIMEOUT_SECS", &v))
            .transpose()?
            .map(Duration::from_secs);
        let max_tool_rounds = var("SURVEY_AGENT_MAX_TOOL_ROUNDS")
            .map(|v| positive("SURVEY_AGENT_MAX_TOOL_ROUNDS", &v))
            .transpose()?;

        Ok(Self {
            api_key,
            base_url: var("OPENAI_BASE_URL"),
            model: var("OPENAI_MODEL"),
            addr,
            db_path: var("SURVEY_AGENT_DB").map(PathBuf::from),
            surveys_path: var("SURVEY_AGENT_SURVEYS").map(PathBuf::from),
            tokens,
            turn_timeout,
            max_tool_rounds,
        })
    }

    pub fn openai_config(&self) -> OpenAIConfig {
        let mut builder = OpenAIConfigBuilder::with_api_key(&self.api_key);
        if let Some(base_url) = &self.base_url {
            builder = builder.with_base_url(base_url);
        }
        if let Some(model) = &self.model {
            builder = builder.with_model(model);
        }
        builder.build()
    }

    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::default();
        if let Some(timeout) = self.turn_timeout {
            config = config.with_turn_timeout(timeout);
        }
        if let Some(rounds) = self.max_tool_rounds {
            config = config.with_max_tool_rounds(rounds);
        }
        config
    }
}

impl Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("addr", &self.addr)
            .field("db_path", &self.db_path)
            .field("surveys_path", &self.surveys_path)
            .field("tokens", &format_args!("<{} redacted>", self.tokens.len()))
            .field("turn_timeout", &self.turn_timeout)
            .field("max_tool_rounds", &self.max_tool_rounds)
            .finish()
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        name,
        reason: err.to_string(),
    })
}

fn positive<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialOrd,
    T::Err: Display,
{
    let parsed: T = parse(name, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_owned(),
        });
    }
    Ok(parsed)
}

/// Parses `token=user_id` pairs separated by commas.
fn parse_tokens(value: &str) -> Result<HashMap<String, String>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| -> Result<(String, String), ConfigError> {
            let (token, user_id) = pair
                .split_once('=')
                .map(|(t, u)| (t.trim(), u.trim()))
                .filter(|(t, u)| !t.is_empty() && !u.is_empty())
                .ok_or_else(|| ConfigError::Invalid {
                    name: "SURVEY_AGENT_TOKENS",
                    reason: "expected comma separated token=user_id pairs"
                        .to_owned(),
                })?;
            Ok((token.to_owned(), user_id.to_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(
        vars: &'a [(&'a str, &'a str)],
    ) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value).to_owned())
        }
    }

    #[test]
    fn test_defaults() {
        let config =
            ServerConfig::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-1")]))
                .unwrap();
        assert_eq!(config.addr, "127.0.0.1:8080".parse().unwrap());
        assert!(config.db_path.is_none());
        assert!(config.tokens.is_empty());

        let agent = config.agent_config();
        assert_eq!(agent.max_tool_rounds(), survey_agent_core::MAX_TOOL_ROUNDS);

        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-1"));
    }

    #[test]
    fn test_full() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-1"),
            ("OPENAI_MODEL", "gpt-4o"),
            ("SURVEY_AGENT_ADDR", "0.0.0.0:9000"),
            ("SURVEY_AGENT_DB", "/var/lib/survey-agent.db"),
            ("SURVEY_AGENT_TOKENS", "tok-a=hr-1, tok-b=hr-2,"),
            ("SURVEY_AGENT_TURN_TIMEOUT_SECS", "30"),
            ("SURVEY_AGENT_MAX_TOOL_ROUNDS", "4"),
        ]))
        .unwrap();
        assert_eq!(config.addr.port(), 9000);
        assert_eq!(config.tokens["tok-b"], "hr-2");
        assert_eq!(config.tokens.len(), 2);

        let agent = config.agent_config();
        assert_eq!(agent.turn_timeout(), Duration::from_secs(30));
        assert_eq!(agent.max_tool_rounds(), 4);
    }

    #[test]
    fn test_errors_name_the_variable() {
        let err = ServerConfig::from_lookup(lookup(&[("OPENAI_API_KEY", " ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("OPENAI_API_KEY")));

        let err = ServerConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-1"),
            ("SURVEY_AGENT_MAX_TOOL_ROUNDS", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().starts_with("SURVEY_AGENT_MAX_TOOL_ROUNDS"));

        let err = ServerConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-1"),
            ("SURVEY_AGENT_TOKENS", "tok-a"),
        ]))
        .unwrap_err();
        assert!(err.to_string().starts_with("SURVEY_AGENT_TOKENS"));
    }
}
