use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The language used for the canned messages the agent produces itself.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    /// English.
    #[default]
    En,
    /// Japanese.
    Ja,
}

impl Locale {
    /// Resolves a client hint such as `"ja-JP"`, falling back to English
    /// for anything unrecognized.
    pub fn from_hint(hint: Option<&str>) -> Self {
        hint.and_then(|hint| hint.parse().ok()).unwrap_or_default()
    }

    /// The answer used when the model produced no usable text.
    pub fn fallback_answer(self) -> &'static str {
        match self {
            Locale::En => {
                "Sorry, I couldn't complete that request. Could you rephrase it?"
            }
            Locale::Ja => {
                "申し訳ありません、リクエストを完了できませんでした。言い換えていただけますか？"
            }
        }
    }

    /// The reply to a canceled action.
    pub fn cancellation_message(self) -> &'static str {
        match self {
            Locale::En => "The action was canceled.",
            Locale::Ja => "操作をキャンセルしました。",
        }
    }
}

impl FromStr for Locale {
    type Err = UnknownLocale;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lang = s.split(['-', '_']).next().unwrap_or_default();
        match lang.to_ascii_lowercase().as_str() {
            "en" => Ok(Locale::En),
            "ja" => Ok(Locale::Ja),
            _ => Err(UnknownLocale),
        }
    }
}

impl Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locale::En => f.write_str("en"),
            Locale::Ja => f.write_str("ja"),
        }
    }
}

/// Error returned when parsing an unsupported locale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsupported locale")]
pub struct UnknownLocale;
