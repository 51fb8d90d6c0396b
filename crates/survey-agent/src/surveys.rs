//! The survey domain the assistant operates on.
//!
//! Surveys live in a [`SurveyDirectory`]. Reading tools query it directly,
//! mutating tools only propose tasks, and the mutation itself happens in
//! the confirmed actions once the user agrees.

mod actions;
mod tools;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use survey_agent_core::tool::{Error as ToolError, SchemaError, ToolRegistry};

pub use actions::actions;
pub use tools::{
    ListSurveysInput, ReminderInput, SurveyRef, SurveyTools,
};

const SUGGESTION_THRESHOLD: f64 = 0.6;
const MAX_SUGGESTIONS: usize = 3;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SurveyStatus {
    Draft,
    Active,
    Closed,
}

impl fmt::Display for SurveyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Closed => "closed",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Respondent {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub org_unit: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub reminded_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Survey {
    pub id: String,
    pub title: String,
    /// The HR user allowed to change the survey.
    pub owner_id: String,
    pub status: SurveyStatus,
    #[serde(default)]
    pub respondents: Vec<Respondent>,
}

impl Survey {
    pub fn responded(&self) -> usize {
        self.respondents.iter().filter(|r| r.completed).count()
    }

    pub fn pending_respondents(&self) -> impl Iterator<Item = &Respondent> {
        self.respondents.iter().filter(|r| !r.completed)
    }
}

/// The set of known surveys, keyed by id.
#[derive(Debug, Default)]
pub struct SurveyDirectory {
    surveys: RwLock<BTreeMap<String, Survey>>,
}

impl SurveyDirectory {
    pub fn new(surveys: impl IntoIterator<Item = Survey>) -> Self {
        let surveys = surveys
            .into_iter()
            .map(|survey| (survey.id.clone(), survey))
            .collect();
        Self {
            surveys: RwLock::new(surveys),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Survey>> {
        self.surveys.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Survey>> {
        self.surveys.write().unwrap_or_else(|err| err.into_inner())
    }

    pub fn list(&self, status: Option<SurveyStatus>) -> Vec<Survey> {
        self.read()
            .values()
            .filter(|survey| status.is_none_or(|s| survey.status == s))
            .cloned()
            .collect()
    }

    /// Finds a survey by id, or by title ignoring case.
    ///
    /// A miss is a `NotFound` error carrying the closest titles.
    pub fn find(&self, reference: &str) -> Result<Survey, ToolError> {
        let surveys = self.read();
        if let Some(survey) = surveys.get(reference) {
            return Ok(survey.clone());
        }
        let needle = reference.trim().to_lowercase();
        if let Some(survey) = surveys
            .values()
            .find(|survey| survey.title.to_lowercase() == needle)
        {
            return Ok(survey.clone());
        }

        let mut scored: Vec<_> = surveys
            .values()
            .map(|survey| {
                let title = survey.title.to_lowercase();
                let score = if title.contains(&needle) || needle.contains(&title)
                {
                    1.0
                } else {
                    strsim::normalized_levenshtein(&title, &needle)
                };
                (score, &survey.title)
            })
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        Err(ToolError::not_found()
            .with_reason(format!("no survey matches `{reference}`"))
            .with_suggestions(
                scored
                    .into_iter()
                    .take(MAX_SUGGESTIONS)
                    .map(|(_, title)| title.clone()),
            ))
    }

    /// Moves a survey from `from` to `to`, failing if it's elsewhere.
    pub fn transition(
        &self,
        id: &str,
        from: SurveyStatus,
        to: SurveyStatus,
    ) -> Result<Survey, ToolError> {
        let mut surveys = self.write();
        let survey = surveys.get_mut(id).ok_or_else(|| {
            ToolError::not_found().with_reason(format!("survey {id} is gone"))
        })?;
        if survey.status != from {
            return Err(ToolError::execution_error().with_reason(format!(
                "survey “{}” is {}, expected {}",
                survey.title, survey.status, from
            )));
        }
        survey.status = to;
        Ok(survey.clone())
    }

    /// Stamps every respondent who hasn't answered and returns how many
    /// were reminded.
    pub fn remind(&self, id: &str) -> Result<(Survey, usize), ToolError> {
        let mut surveys = self.write();
        let survey = surveys.get_mut(id).ok_or_else(|| {
            ToolError::not_found().with_reason(format!("survey {id} is gone"))
        })?;
        if survey.status != SurveyStatus::Active {
            return Err(ToolError::execution_error()
                .with_reason(format!("survey “{}” is not active", survey.title)));
        }
        let now = Utc::now();
        let mut reminded = 0;
        for respondent in survey.respondents.iter_mut().filter(|r| !r.completed)
        {
            respondent.reminded_at = Some(now);
            reminded += 1;
        }
        Ok((survey.clone(), reminded))
    }
}

/// Declares the survey tools.
pub fn registry() -> Result<ToolRegistry, SchemaError> {
    ToolRegistry::builder()
        .with_tool::<ListSurveysInput>(
            "list_surveys",
            "Lists surveys with their status and response counts. \
             Optionally filters by status.",
        )
        .with_tool::<SurveyRef>(
            "get_survey_progress",
            "Shows how many respondents answered a survey, overall and per \
             org unit. The survey may be given by id or by title.",
        )
        .with_confirmable_tool::<SurveyRef>(
            "activate_survey",
            "Proposes to activate a draft survey so respondents can answer. \
             The user has to confirm before anything happens.",
        )
        .with_confirmable_tool::<SurveyRef>(
            "close_survey",
            "Proposes to close an active survey. The user has to confirm \
             before anything happens.",
        )
        .with_confirmable_tool::<ReminderInput>(
            "send_survey_reminders",
            "Proposes to send a reminder to every respondent of an active \
             survey who hasn't answered yet. The user has to confirm before \
             anything is sent.",
        )
        .build()
}
