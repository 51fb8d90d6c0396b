use std::collections::BTreeMap;
use std::future::ready;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use survey_agent_core::gate::{ConfirmationGate, TaskProposal};
use survey_agent_core::tool::{
    Error as ToolError, PendingAction, Tool, ToolExecutorSet, ToolOutput,
    ToolResult,
};
use survey_agent_core::{ExecutorFactory, Locale, ToolContext};

use super::{Survey, SurveyDirectory, SurveyStatus};

#[derive(Deserialize, JsonSchema)]
pub struct ListSurveysInput {
    #[schemars(description = "Only list surveys in this status.")]
    #[serde(default)]
    status: Option<SurveyStatus>,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct SurveyRef {
    #[schemars(description = "The survey id, or its exact title.")]
    pub survey: String,
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct ReminderInput {
    #[schemars(description = "The survey id, or its exact title.")]
    pub survey: String,
    #[schemars(description = "An optional note added to the reminder.")]
    #[serde(default)]
    pub note: Option<String>,
}

fn summary(survey: &Survey) -> Value {
    json!({
        "id": survey.id,
        "title": survey.title,
        "status": survey.status,
        "responded": survey.responded(),
        "total": survey.respondents.len(),
    })
}

struct ListSurveysTool {
    directory: Arc<SurveyDirectory>,
}

impl Tool for ListSurveysTool {
    type Input = ListSurveysInput;

    fn name(&self) -> &str {
        "list_surveys"
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let surveys: Vec<_> =
            self.directory.list(input.status).iter().map(summary).collect();
        ready(Ok(ToolOutput::Plain(Value::Array(surveys))))
    }
}

struct SurveyProgressTool {
    directory: Arc<SurveyDirectory>,
}

impl Tool for SurveyProgressTool {
    type Input = SurveyRef;

    fn name(&self) -> &str {
        "get_survey_progress"
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        ready(self.directory.find(&input.survey).map(|survey| {
            let mut units: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
            for respondent in &survey.respondents {
                let unit = respondent.org_unit.as_deref().unwrap_or("-");
                let counts = units.entry(unit).or_default();
                counts.1 += 1;
                if respondent.completed {
                    counts.0 += 1;
                }
            }
            let by_unit: Vec<_> = units
                .into_iter()
                .map(|(unit, (responded, total))| {
                    json!({ "unit": unit, "responded": responded, "total": total })
                })
                .collect();

            let mut progress = summary(&survey);
            progress["rate"] = json!(response_rate(&survey));
            progress["byUnit"] = Value::Array(by_unit);
            ToolOutput::Plain(progress)
        }))
    }
}

fn response_rate(survey: &Survey) -> f64 {
    if survey.respondents.is_empty() {
        return 0.0;
    }
    let rate = survey.responded() as f64 / survey.respondents.len() as f64;
    (rate * 1000.0).round() / 10.0
}

/// Proposes mutations on behalf of one caller.
#[derive(Clone)]
struct Proposer {
    directory: Arc<SurveyDirectory>,
    gate: Arc<ConfirmationGate>,
    ctx: ToolContext,
}

impl Proposer {
    fn owned_survey(&self, reference: &str) -> Result<Survey, ToolError> {
        let survey = self.directory.find(reference)?;
        if survey.owner_id != self.ctx.user_id {
            return Err(ToolError::permission_denied().with_reason(format!(
                "only the owner of “{}” can change it",
                survey.title
            )));
        }
        Ok(survey)
    }

    async fn propose(
        &self,
        tool_name: &str,
        survey: Survey,
        input: Value,
        title: String,
        message: String,
    ) -> ToolResult {
        let metadata = json!({
            "title": survey.title,
            "status": survey.status,
            "respondents": survey.respondents.len(),
        });
        let task_id = self
            .gate
            .create_pending_task(TaskProposal {
                session_id: self.ctx.session_id.clone(),
                creator_id: self.ctx.user_id.clone(),
                title,
                tool_name: tool_name.to_owned(),
                input,
                metadata: Some(metadata.clone()),
            })
            .await
            .map_err(|err| {
                ToolError::execution_error().with_reason(err.to_string())
            })?;

        Ok(ToolOutput::PendingConfirmation(PendingAction {
            task_id,
            action_type: tool_name.to_owned(),
            target: survey.id,
            message,
            metadata: Some(metadata),
        }))
    }
}

fn wrong_status(survey: &Survey, wanted: &str) -> ToolError {
    ToolError::execution_error().with_reason(format!(
        "survey “{}” is {}, only {wanted} surveys qualify",
        survey.title, survey.status
    ))
}

struct ActivateSurveyTool(Proposer);

impl Tool for ActivateSurveyTool {
    type Input = SurveyRef;

    fn name(&self) -> &str {
        "activate_survey"
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let proposer = self.0.clone();
        async move {
            let survey = proposer.owned_survey(&input.survey)?;
            if survey.status != SurveyStatus::Draft {
                return Err(wrong_status(&survey, "draft"));
            }
            let n = survey.respondents.len();
            let message = match proposer.ctx.locale {
                Locale::En => format!(
                    "Activate “{}”? {n} respondents will be able to answer.",
                    survey.title
                ),
                Locale::Ja => format!(
                    "「{}」を公開しますか？{n}名が回答できるようになります。",
                    survey.title
                ),
            };
            let title = format!("Activate survey “{}”", survey.title);
            let input = json!({ "survey": survey.id });
            proposer
                .propose("activate_survey", survey, input, title, message)
                .await
        }
    }
}

struct CloseSurveyTool(Proposer);

impl Tool for CloseSurveyTool {
    type Input = SurveyRef;

    fn name(&self) -> &str {
        "close_survey"
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let proposer = self.0.clone();
        async move {
            let survey = proposer.owned_survey(&input.survey)?;
            if survey.status != SurveyStatus::Active {
                return Err(wrong_status(&survey, "active"));
            }
            let (responded, total) =
                (survey.responded(), survey.respondents.len());
            let message = match proposer.ctx.locale {
                Locale::En => format!(
                    "Close “{}”? {responded} of {total} respondents have \
                     answered, no further answers will be accepted.",
                    survey.title
                ),
                Locale::Ja => format!(
                    "「{}」を締め切りますか？{total}名中{responded}名が回答済みです。",
                    survey.title
                ),
            };
            let title = format!("Close survey “{}”", survey.title);
            let input = json!({ "survey": survey.id });
            proposer
                .propose("close_survey", survey, input, title, message)
                .await
        }
    }
}

struct SendRemindersTool(Proposer);

impl Tool for SendRemindersTool {
    type Input = ReminderInput;

    fn name(&self) -> &str {
        "send_survey_reminders"
    }

    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let proposer = self.0.clone();
        async move {
            let survey = proposer.owned_survey(&input.survey)?;
            if survey.status != SurveyStatus::Active {
                return Err(wrong_status(&survey, "active"));
            }
            let pending = survey.pending_respondents().count();
            if pending == 0 {
                return Err(ToolError::execution_error().with_reason(format!(
                    "everyone has already answered “{}”",
                    survey.title
                )));
            }
            let message = match proposer.ctx.locale {
                Locale::En => format!(
                    "Send a reminder to the {pending} respondents of “{}” \
                     who haven't answered yet?",
                    survey.title
                ),
                Locale::Ja => format!(
                    "「{}」の未回答者{pending}名にリマインドを送信しますか？",
                    survey.title
                ),
            };
            let title = format!("Remind respondents of “{}”", survey.title);
            let input = json!({ "survey": survey.id, "note": input.note });
            proposer
                .propose("send_survey_reminders", survey, input, title, message)
                .await
        }
    }
}

/// Binds the survey tools to each request.
pub struct SurveyTools {
    directory: Arc<SurveyDirectory>,
    gate: Arc<ConfirmationGate>,
}

impl SurveyTools {
    pub fn new(
        directory: Arc<SurveyDirectory>,
        gate: Arc<ConfirmationGate>,
    ) -> Self {
        Self { directory, gate }
    }
}

impl ExecutorFactory for SurveyTools {
    fn executors(&self, ctx: &ToolContext) -> ToolExecutorSet {
        let proposer = Proposer {
            directory: Arc::clone(&self.directory),
            gate: Arc::clone(&self.gate),
            ctx: ctx.clone(),
        };
        ToolExecutorSet::new()
            .with_tool(ListSurveysTool {
                directory: Arc::clone(&self.directory),
            })
            .with_tool(SurveyProgressTool {
                directory: Arc::clone(&self.directory),
            })
            .with_tool(ActivateSurveyTool(proposer.clone()))
            .with_tool(CloseSurveyTool(proposer.clone()))
            .with_tool(SendRemindersTool(proposer))
    }
}
