//! Step executors.
//!
//! Each step turns (subject, completed earlier outputs, provider) into text.
//! Executors never touch the store; the supervisor persists what they return.

use thiserror::Error;

use super::task::{ResearchTask, Step, StepStatus};
use crate::llm::{PriorOutput, ProviderError, ResearchProvider, ResearchRequest};
use crate::subjects::Subject;

/// Output token ceiling per step.
const MAX_OUTPUT_TOKENS: [u64; 3] = [8_000, 8_000, 16_000];

const REPORT_SECTIONS: [&str; 6] = [
    "Executive Summary",
    "Company Overview",
    "Market Position",
    "Strategic Opportunities",
    "Risks",
    "Recommended Next Steps",
];

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{step} requires the completed output of {missing}")]
    MissingPriorOutput { step: Step, missing: Step },
}

/// What a step produced.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub text: String,
    pub continuation: Option<String>,
    pub cost_cents: u64,
    /// Output was cut short by the provider.
    pub truncated: bool,
    pub model: String,
}

/// Run `step` for `subject` against `provider`.
pub async fn execute(
    step: Step,
    subject: &Subject,
    task: &ResearchTask,
    provider: &dyn ResearchProvider,
) -> Result<StepOutput, StepError> {
    let request = build_request(step, subject, task)?;
    let response = provider.research(&request).await?;
    Ok(StepOutput {
        text: response.output,
        continuation: response.continuation,
        cost_cents: response.cost_cents,
        truncated: response.truncated,
        model: response.model,
    })
}

/// Build the provider request for a step. Pure.
pub fn build_request(
    step: Step,
    subject: &Subject,
    task: &ResearchTask,
) -> Result<ResearchRequest, StepError> {
    let prior_outputs = collect_prior_outputs(step, task)?;
    let (system_context, prompt) = match step {
        Step::Baseline => baseline_prompt(subject),
        Step::Strategy => strategy_prompt(subject),
        Step::Report => report_prompt(subject),
    };

    Ok(ResearchRequest {
        system_context,
        prior_outputs,
        prompt,
        continuation: task.continuation_handle.clone(),
        max_output_tokens: Some(MAX_OUTPUT_TOKENS[usize::from(step.index() - 1)]),
    })
}

fn collect_prior_outputs(step: Step, task: &ResearchTask) -> Result<Vec<PriorOutput>, StepError> {
    Step::ALL
        .into_iter()
        .filter(|s| *s < step)
        .map(|prior| {
            let state = task.step(prior);
            match (&state.status, &state.output) {
                (StepStatus::Completed, Some(output)) => Ok(PriorOutput {
                    label: prior.label().to_string(),
                    content: output.clone(),
                }),
                _ => Err(StepError::MissingPriorOutput {
                    step,
                    missing: prior,
                }),
            }
        })
        .collect()
}

fn baseline_prompt(subject: &Subject) -> (String, String) {
    let system = "You are a meticulous business research analyst. Gather verifiable, \
                  current facts about the company you are given. Cite sources inline \
                  where possible and say so explicitly when information could not be found."
        .to_string();
    let prompt = format!(
        "Research the following company.\n\n{}\n\n\
         Cover: what the company does, products and services, customers and markets, \
         size and funding, leadership, recent news from the last 12 months, and \
         technology or operational signals. Answer in markdown with one heading per topic.",
        subject.fact_sheet()
    );
    (system, prompt)
}

fn strategy_prompt(subject: &Subject) -> (String, String) {
    let system = "You are a strategy consultant. Build on the research you are given; \
                  do not repeat it. Be specific to this company and flag assumptions."
        .to_string();
    let prompt = format!(
        "Using the baseline research on {}, produce a strategic analysis: competitive \
         landscape, strengths and weaknesses, likely current priorities, pain points, \
         and the three most promising opportunities for a partner to help. Answer in markdown.",
        subject.name
    );
    (system, prompt)
}

fn report_prompt(subject: &Subject) -> (String, String) {
    let system = "You write concise executive research reports in markdown. Use only the \
                  research and analysis provided; do not invent facts."
        .to_string();
    let sections = REPORT_SECTIONS
        .iter()
        .map(|s| format!("## {}", s))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "Compile the research and strategic analysis on {} into a final report titled \
         \"# {} Research Report\" with exactly these sections:\n\n{}",
        subject.name, subject.name, sections
    );
    (system, prompt)
}
