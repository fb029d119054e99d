use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use salesflow_agent::pipeline::{SCORE_RESULTS_KEY, SEND_EMAIL, WRITE_EMAIL};
use salesflow_agent::{CrewGateway, SalesPipeline};
use salesflow_core::config::{AppConfig, FanConfig, FanMode, EMAIL_WRITING_CREW, LEAD_SCORING_CREW};
use salesflow_core::error::SalesflowError;
use salesflow_core::lead::EmailDraft;
use salesflow_core::types::{FlowEvent, FlowStatus};
use salesflow_core::EventBus;
use salesflow_flow::{FanExecutor, UnitOutput};
use salesflow_test_utils::{sample_lead, scoring_result_json, MockLlm, StubGateway};

fn example_config() -> AppConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("salesflow.example.toml");
    AppConfig::load(&path).expect("load example config")
}

#[tokio::test]
async fn test_single_lead_above_threshold_gets_one_email() {
    let stub = Arc::new(StubGateway::new(|unit, context| match unit {
        LEAD_SCORING_CREW => Ok(UnitOutput::structured("{}", scoring_result_json(85))),
        EMAIL_WRITING_CREW => {
            let name = context["personal_info"]["name"].as_str().unwrap_or_default();
            Ok(UnitOutput::text(format!("Hi {}, ...", name)))
        }
        other => Err(SalesflowError::Config(format!("unexpected unit {}", other))),
    }));

    let engine = SalesPipeline::new(stub.clone())
        .with_threshold(70)
        .engine()
        .unwrap();
    let seed = SalesPipeline::seed(&[sample_lead()]).unwrap();
    let run = engine.kickoff(seed).await;

    assert_eq!(run.status, FlowStatus::Completed);

    let results = run.state.get(SCORE_RESULTS_KEY).unwrap();
    assert_eq!(results.as_array().unwrap().len(), 1);
    assert_eq!(results[0]["lead_score"]["score"], json!(85));

    let emails = run.output().unwrap().as_array().unwrap();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0]["lead_name"], json!("Jo\u{e3}o Moura"));
    assert!(emails[0]["content"].as_str().unwrap().starts_with("Hi Jo\u{e3}o Moura"));

    // One scoring call, one email call
    let units: Vec<String> = stub.calls().into_iter().map(|(unit, _)| unit).collect();
    assert_eq!(units, vec![LEAD_SCORING_CREW, EMAIL_WRITING_CREW]);
}

#[tokio::test]
async fn test_lead_at_threshold_gets_no_email() {
    let stub = Arc::new(StubGateway::new(|unit, _context| match unit {
        LEAD_SCORING_CREW => Ok(UnitOutput::structured("{}", scoring_result_json(70))),
        _ => Ok(UnitOutput::text("unreachable")),
    }));

    let engine = SalesPipeline::new(stub.clone()).engine().unwrap();
    let run = engine
        .kickoff(SalesPipeline::seed(&[sample_lead()]).unwrap())
        .await;

    assert_eq!(run.status, FlowStatus::Completed);
    assert_eq!(run.output(), Some(&json!([])));
    assert_eq!(stub.calls().len(), 1);
}

#[tokio::test]
async fn test_example_crews_drive_full_run_over_mock_llm() {
    let config = example_config();
    let llm = Arc::new(MockLlm::new().with_usage(100, 20));
    llm.push_text("Jo\u{e3}o leads data engineering at Clearbit, ~250 staff.");
    llm.push_text("Strong fit: data enrichment is core to their product.");
    llm.push_text(format!(
        "Here is the assessment:\n```json\n{}\n```",
        scoring_result_json(85)
    ));
    llm.push_text("Subject: Enrichment agents\n\nHi Jo\u{e3}o, ...");
    llm.push_text("Subject: Agents for Clearbit's enrichment\n\nHi Jo\u{e3}o, ...");

    let gateway = CrewGateway::from_config(&config, llm.clone()).with_fan(FanExecutor::new(
        FanConfig {
            mode: FanMode::Sequential,
            ..FanConfig::default()
        },
    ));
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let engine = SalesPipeline::from_config(&config, Arc::new(gateway))
        .engine()
        .unwrap()
        .with_events(bus.clone());

    let run = engine
        .kickoff(SalesPipeline::seed(&config.leads).unwrap())
        .await;
    assert_eq!(run.status, FlowStatus::Completed, "records: {:?}", run.records);

    let drafts: Vec<EmailDraft> = serde_json::from_value(run.output().unwrap().clone()).unwrap();
    assert_eq!(drafts.len(), 1);
    assert!(drafts[0].content.contains("Agents for Clearbit"));
    assert_eq!(drafts[0].token_usage.requests, 2);
    assert_eq!(drafts[0].token_usage.input_tokens, 200);

    // Three scoring tasks then two email tasks
    assert_eq!(llm.requests().len(), 5);
    let scoring_prompt = &llm.requests()[0][1].content;
    assert!(scoring_prompt.contains("Clearbit"));

    let mut finished = None;
    while let Ok(event) = rx.try_recv() {
        if let FlowEvent::RunFinished { status, .. } = event {
            finished = Some(status);
        }
    }
    assert_eq!(finished, Some(FlowStatus::Completed));
}

#[tokio::test]
async fn test_email_failure_fails_run_but_keeps_scores() {
    let stub = Arc::new(StubGateway::new(|unit, _context| match unit {
        LEAD_SCORING_CREW => Ok(UnitOutput::structured("{}", scoring_result_json(95))),
        _ => Err(SalesflowError::LlmRequest("HTTP 500".into())),
    }));

    let engine = SalesPipeline::new(stub).engine().unwrap();
    let run = engine
        .kickoff(SalesPipeline::seed(&[sample_lead()]).unwrap())
        .await;

    assert_eq!(run.status, FlowStatus::Failed);
    assert!(run.output().is_none());
    assert!(!run.record(WRITE_EMAIL).unwrap().succeeded());
    assert!(run.skipped.iter().any(|s| s == SEND_EMAIL));

    let results: Vec<Value> = run.state.get_as(SCORE_RESULTS_KEY).unwrap();
    assert_eq!(results.len(), 1);
}
