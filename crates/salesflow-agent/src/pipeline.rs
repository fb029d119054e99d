//! The sales pipeline flow.
//!
//! ```text
//! fetch_leads -> score_leads -+-> store_leads_score
//!                             +-> filter_leads -> write_email -> send_email
//! ```
//!
//! `score_leads` and `write_email` fan a crew out over their input list.
//! Each writes its batch-level state keys once, after fan-in.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use salesflow_core::config::{AppConfig, EMAIL_WRITING_CREW, LEAD_SCORING_CREW};
use salesflow_core::error::{Result, SalesflowError};
use salesflow_core::lead::{EmailDraft, LeadRecord, LeadScoringResult};
use salesflow_flow::gate;
use salesflow_flow::{
    CollaboratorGateway, FanItem, FlowEngine, Step, StepContext, StepRegistry, UnitOutput,
};

use crate::output::parse_structured;

pub const FETCH_LEADS: &str = "fetch_leads";
pub const SCORE_LEADS: &str = "score_leads";
pub const STORE_LEADS_SCORE: &str = "store_leads_score";
pub const FILTER_LEADS: &str = "filter_leads";
pub const WRITE_EMAIL: &str = "write_email";
pub const SEND_EMAIL: &str = "send_email";

/// Validated scoring results, written by `score_leads`.
pub const SCORE_RESULTS_KEY: &str = "score_crews_results";
/// Per-lead scoring failures, present only when some lead failed.
pub const SCORE_FAILURES_KEY: &str = "score_crews_failures";
/// Per-lead email failures, present only when some email failed.
pub const EMAIL_FAILURES_KEY: &str = "email_failures";

const DEFAULT_SCORE_THRESHOLD: u8 = 70;

/// Builds the lead scoring / email writing flow over a collaborator gateway.
#[derive(Clone)]
pub struct SalesPipeline {
    gateway: Arc<dyn CollaboratorGateway>,
    score_threshold: u8,
}

impl SalesPipeline {
    pub fn new(gateway: Arc<dyn CollaboratorGateway>) -> Self {
        Self {
            gateway,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        }
    }

    pub fn from_config(config: &AppConfig, gateway: Arc<dyn CollaboratorGateway>) -> Self {
        Self::new(gateway).with_threshold(config.pipeline.score_threshold)
    }

    /// Leads must score strictly above `threshold` to get an email.
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.score_threshold = threshold;
        self
    }

    /// Seed value for a run: the lead list as JSON.
    pub fn seed(leads: &[LeadRecord]) -> Result<Value> {
        Ok(serde_json::to_value(leads)?)
    }

    /// Register the six steps; `send_email` is the terminal.
    pub fn registry(&self) -> Result<StepRegistry> {
        let mut registry = StepRegistry::new();

        registry.register(
            Step::initial(FETCH_LEADS, fetch_leads).with_description("Emit the lead list"),
        )?;

        let gateway = self.gateway.clone();
        registry.register(
            Step::after(SCORE_LEADS, FETCH_LEADS, move |input: Value, ctx: StepContext| {
                score_leads(gateway.clone(), input, ctx)
            })
            .with_description("Score every lead with the lead_scoring crew"),
        )?;

        registry.register(
            Step::after(STORE_LEADS_SCORE, SCORE_LEADS, store_leads_score)
                .with_description("Hand scores to storage"),
        )?;

        let threshold = self.score_threshold;
        registry.register(
            Step::after(FILTER_LEADS, SCORE_LEADS, move |input: Value, ctx: StepContext| {
                filter_leads(threshold, input, ctx)
            })
            .with_description(format!("Keep leads scoring above {}", threshold)),
        )?;

        let gateway = self.gateway.clone();
        registry.register(
            Step::after(WRITE_EMAIL, FILTER_LEADS, move |input: Value, ctx: StepContext| {
                write_email(gateway.clone(), input, ctx)
            })
            .with_description("Draft one email per qualifying lead"),
        )?;

        registry.register(
            Step::after(SEND_EMAIL, WRITE_EMAIL, send_email).with_description("Hand emails off"),
        )?;

        registry.designate_terminal(SEND_EMAIL);
        Ok(registry)
    }

    /// Registry wrapped in a validated engine.
    pub fn engine(&self) -> Result<FlowEngine> {
        FlowEngine::new(self.registry()?)
    }
}

async fn fetch_leads(input: Value, _ctx: StepContext) -> Result<Value> {
    let leads: Vec<LeadRecord> = serde_json::from_value(input.clone())
        .map_err(|e| SalesflowError::Config(format!("seed is not a lead list: {}", e)))?;
    info!(leads = leads.len(), "Fetched leads");
    Ok(input)
}

async fn score_leads(
    gateway: Arc<dyn CollaboratorGateway>,
    input: Value,
    ctx: StepContext,
) -> Result<Value> {
    let leads: Vec<LeadRecord> = serde_json::from_value(input)?;
    let items = leads.iter().map(LeadRecord::to_crew_input).collect();
    let batch = gateway.execute_batch(LEAD_SCORING_CREW, items).await?;

    let mut results: Vec<LeadScoringResult> = Vec::new();
    let mut failures: Vec<Value> = Vec::new();
    for (index, item) in batch.into_items().into_iter().enumerate() {
        let lead = leads.get(index).map(|l| l.name.as_str()).unwrap_or_default();
        let outcome = match item {
            FanItem::Ok(output) => scoring_result(&output),
            FanItem::Failed(err) => Err(SalesflowError::Execution(err.message)),
        };
        match outcome {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(index, lead, error = %e, "Lead could not be scored");
                failures.push(json!({ "index": index, "lead": lead, "error": e.to_string() }));
            }
        }
    }

    ctx.state().set_as(SCORE_RESULTS_KEY, &results)?;
    let failed = failures.len();
    if failed > 0 {
        ctx.state().set(SCORE_FAILURES_KEY, Value::Array(failures));
    }
    info!(scored = results.len(), failed, "Scored leads");

    if results.is_empty() && failed > 0 {
        return Err(SalesflowError::AggregateFan {
            failed,
            total: leads.len(),
        });
    }
    Ok(serde_json::to_value(&results)?)
}

/// Structured output of the scoring crew, validated as a scoring result.
fn scoring_result(output: &UnitOutput) -> Result<LeadScoringResult> {
    match &output.structured {
        Some(value) => LeadScoringResult::from_value(value),
        None => LeadScoringResult::from_value(&parse_structured(&output.raw, &[])?),
    }
}

async fn store_leads_score(input: Value, _ctx: StepContext) -> Result<Value> {
    Ok(input)
}

async fn filter_leads(threshold: u8, input: Value, _ctx: StepContext) -> Result<Value> {
    let scores: Vec<LeadScoringResult> = serde_json::from_value(input)?;
    let qualified = gate::above_threshold(&scores, threshold);
    info!(
        total = scores.len(),
        qualified = qualified.len(),
        threshold,
        "Filtered leads"
    );
    Ok(serde_json::to_value(&qualified)?)
}

async fn write_email(
    gateway: Arc<dyn CollaboratorGateway>,
    input: Value,
    ctx: StepContext,
) -> Result<Value> {
    let leads: Vec<LeadScoringResult> = serde_json::from_value(input)?;
    let items = leads
        .iter()
        .map(serde_json::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let batch = gateway.execute_batch(EMAIL_WRITING_CREW, items).await?;

    let mut drafts: Vec<EmailDraft> = Vec::new();
    let mut failures: Vec<Value> = Vec::new();
    for (index, item) in batch.into_items().into_iter().enumerate() {
        let lead_name = leads
            .get(index)
            .map(|l| l.personal_info.name.clone())
            .unwrap_or_default();
        match item {
            FanItem::Ok(output) => drafts.push(EmailDraft {
                lead_name,
                content: output.raw,
                token_usage: output.usage,
            }),
            FanItem::Failed(err) => {
                warn!(index, lead = %lead_name, error = %err.message, "Email could not be written");
                failures.push(json!({ "index": index, "lead": lead_name, "error": err.message }));
            }
        }
    }

    let failed = failures.len();
    if failed > 0 {
        ctx.state().set(EMAIL_FAILURES_KEY, Value::Array(failures));
    }
    info!(written = drafts.len(), failed, "Wrote emails");

    if drafts.is_empty() && failed > 0 {
        return Err(SalesflowError::AggregateFan {
            failed,
            total: leads.len(),
        });
    }
    Ok(serde_json::to_value(&drafts)?)
}

async fn send_email(input: Value, _ctx: StepContext) -> Result<Value> {
    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use salesflow_core::types::FlowStatus;
    use salesflow_test_utils::{sample_lead, scoring_result_json, StubGateway};

    fn scoring_and_email_stub(score_for: fn(&str) -> Option<u64>) -> StubGateway {
        StubGateway::new(move |unit, context| match unit {
            LEAD_SCORING_CREW => {
                let name = context["lead_data"]["name"].as_str().unwrap_or_default().to_string();
                match score_for(&name) {
                    Some(score) => {
                        let mut value = scoring_result_json(score);
                        value["personal_info"]["name"] = json!(name);
                        Ok(UnitOutput::structured(value.to_string(), value))
                    }
                    None => Err(SalesflowError::Execution(format!("no data for {}", name))),
                }
            }
            EMAIL_WRITING_CREW => {
                let name = context["personal_info"]["name"].as_str().unwrap_or_default();
                Ok(UnitOutput::text(format!("Hi {}", name)))
            }
            other => Err(SalesflowError::Config(format!("unknown crew '{}'", other))),
        })
    }

    fn lead(name: &str) -> LeadRecord {
        LeadRecord {
            name: name.to_string(),
            ..sample_lead()
        }
    }

    #[test]
    fn test_registry_shape() {
        let pipeline = SalesPipeline::new(Arc::new(scoring_and_email_stub(|_| Some(1))));
        let registry = pipeline.registry().unwrap();
        registry.validate().unwrap();
        assert_eq!(registry.len(), 6);
        assert_eq!(registry.terminals(), vec![SEND_EMAIL]);
        let listeners: Vec<&str> = registry
            .listeners(SCORE_LEADS)
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(listeners, vec![STORE_LEADS_SCORE, FILTER_LEADS]);
    }

    #[tokio::test]
    async fn test_partial_scoring_failure_keeps_other_leads() {
        let stub = scoring_and_email_stub(|name| match name {
            "Bo" => None,
            "Ana" => Some(90),
            _ => Some(40),
        });
        let engine = SalesPipeline::new(Arc::new(stub)).engine().unwrap();
        let seed = SalesPipeline::seed(&[lead("Ana"), lead("Bo"), lead("Cy")]).unwrap();

        let run = engine.kickoff(seed).await;
        assert_eq!(run.status, FlowStatus::Completed);

        let scored: Vec<LeadScoringResult> = run.state.get_as(SCORE_RESULTS_KEY).unwrap();
        assert_eq!(scored.len(), 2);
        let failures = run.state.get(SCORE_FAILURES_KEY).unwrap();
        assert_eq!(failures[0]["index"], json!(1));
        assert_eq!(failures[0]["lead"], json!("Bo"));

        let emails: Vec<EmailDraft> = serde_json::from_value(run.output().unwrap().clone()).unwrap();
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].lead_name, "Ana");
        assert!(!run.state.contains(EMAIL_FAILURES_KEY));
    }

    #[tokio::test]
    async fn test_no_qualifying_leads_completes_with_no_emails() {
        let engine = SalesPipeline::new(Arc::new(scoring_and_email_stub(|_| Some(70))))
            .engine()
            .unwrap();
        let run = engine
            .kickoff(SalesPipeline::seed(&[sample_lead()]).unwrap())
            .await;
        assert!(run.is_completed());
        assert_eq!(run.output(), Some(&json!([])));
    }

    #[tokio::test]
    async fn test_threshold_from_config() {
        let engine = SalesPipeline::new(Arc::new(scoring_and_email_stub(|_| Some(70))))
            .with_threshold(60)
            .engine()
            .unwrap();
        let run = engine
            .kickoff(SalesPipeline::seed(&[sample_lead()]).unwrap())
            .await;
        assert_eq!(run.output().unwrap().as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_all_scoring_failed_fails_run() {
        let engine = SalesPipeline::new(Arc::new(scoring_and_email_stub(|_| None)))
            .engine()
            .unwrap();
        let run = engine
            .kickoff(SalesPipeline::seed(&[sample_lead()]).unwrap())
            .await;
        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(run.failed_steps()[0].step, SCORE_LEADS);
        assert!(run.skipped.contains(&SEND_EMAIL.to_string()));
        // Diagnostics survive the failure
        assert_eq!(run.state.get(SCORE_RESULTS_KEY).unwrap(), json!([]));
        assert!(run.state.contains(SCORE_FAILURES_KEY));
    }

    #[tokio::test]
    async fn test_invalid_scoring_shape_is_captured_per_lead() {
        let stub = StubGateway::new(|unit, _context| match unit {
            LEAD_SCORING_CREW => {
                let mut value = scoring_result_json(150);
                value["personal_info"]["name"] = json!("Ana");
                Ok(UnitOutput::structured(value.to_string(), value))
            }
            _ => Ok(UnitOutput::text("unused")),
        });
        let engine = SalesPipeline::new(Arc::new(stub)).engine().unwrap();
        let run = engine
            .kickoff(SalesPipeline::seed(&[sample_lead()]).unwrap())
            .await;
        assert_eq!(run.status, FlowStatus::Failed);
        let failures = run.state.get(SCORE_FAILURES_KEY).unwrap();
        assert!(failures[0]["error"].as_str().unwrap().contains("exceeds 100"));
    }

    #[tokio::test]
    async fn test_bad_seed_fails_initial_step() {
        let engine = SalesPipeline::new(Arc::new(scoring_and_email_stub(|_| Some(90))))
            .engine()
            .unwrap();
        let run = engine.kickoff(json!({"not": "a list"})).await;
        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(run.failed_steps()[0].step, FETCH_LEADS);
    }
}
