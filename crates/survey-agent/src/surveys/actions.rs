use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use survey_agent_core::Locale;
use survey_agent_core::gate::{ActionContext, ActionRegistry, ConfirmedAction};
use survey_agent_core::tool::Error as ToolError;

use super::{ReminderInput, Survey, SurveyDirectory, SurveyRef, SurveyStatus};

fn parse<T: DeserializeOwned>(input: Value) -> Result<T, ToolError> {
    serde_json::from_value(input)
        .map_err(|err| ToolError::invalid_input().with_reason(err.to_string()))
}

fn ensure_owner(
    directory: &SurveyDirectory,
    id: &str,
    ctx: &ActionContext,
) -> Result<Survey, ToolError> {
    let survey = directory.find(id)?;
    if survey.owner_id != ctx.user_id {
        return Err(ToolError::permission_denied()
            .with_reason(format!("{} doesn't own “{}”", ctx.user_id, survey.title)));
    }
    Ok(survey)
}

struct ActivateSurvey {
    directory: Arc<SurveyDirectory>,
}

#[async_trait]
impl ConfirmedAction for ActivateSurvey {
    async fn execute(
        &self,
        input: Value,
        ctx: &ActionContext,
    ) -> Result<String, ToolError> {
        let SurveyRef { survey } = parse(input)?;
        ensure_owner(&self.directory, &survey, ctx)?;
        let survey = self.directory.transition(
            &survey,
            SurveyStatus::Draft,
            SurveyStatus::Active,
        )?;
        info!("activated survey {}", survey.id);

        Ok(match ctx.locale {
            Locale::En => format!("“{}” is now open for answers.", survey.title),
            Locale::Ja => format!("「{}」を公開しました。", survey.title),
        })
    }
}

struct CloseSurvey {
    directory: Arc<SurveyDirectory>,
}

#[async_trait]
impl ConfirmedAction for CloseSurvey {
    async fn execute(
        &self,
        input: Value,
        ctx: &ActionContext,
    ) -> Result<String, ToolError> {
        let SurveyRef { survey } = parse(input)?;
        ensure_owner(&self.directory, &survey, ctx)?;
        let survey = self.directory.transition(
            &survey,
            SurveyStatus::Active,
            SurveyStatus::Closed,
        )?;
        info!("closed survey {}", survey.id);

        let (responded, total) = (survey.responded(), survey.respondents.len());
        Ok(match ctx.locale {
            Locale::En => format!(
                "“{}” is closed with {responded} of {total} answers.",
                survey.title
            ),
            Locale::Ja => format!(
                "「{}」を締め切りました（回答{responded}/{total}名）。",
                survey.title
            ),
        })
    }
}

struct SendReminders {
    directory: Arc<SurveyDirectory>,
}

#[async_trait]
impl ConfirmedAction for SendReminders {
    async fn execute(
        &self,
        input: Value,
        ctx: &ActionContext,
    ) -> Result<String, ToolError> {
        let ReminderInput { survey, note } = parse(input)?;
        ensure_owner(&self.directory, &survey, ctx)?;
        let (survey, reminded) = self.directory.remind(&survey)?;
        info!(
            has_note = note.is_some(),
            "reminded {reminded} respondents of {}", survey.id
        );

        Ok(match ctx.locale {
            Locale::En => format!(
                "Sent a reminder to {reminded} respondents of “{}”.",
                survey.title
            ),
            Locale::Ja => format!(
                "「{}」の未回答者{reminded}名にリマインドを送信しました。",
                survey.title
            ),
        })
    }
}

/// The routines behind the confirmable survey tools.
pub fn actions(directory: Arc<SurveyDirectory>) -> ActionRegistry {
    ActionRegistry::new()
        .with_action(
            "activate_survey",
            ActivateSurvey {
                directory: Arc::clone(&directory),
            },
        )
        .with_action(
            "close_survey",
            CloseSurvey {
                directory: Arc::clone(&directory),
            },
        )
        .with_action("send_survey_reminders", SendReminders { directory })
}
