use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use salesflow_agent::pipeline::{
    EMAIL_FAILURES_KEY, SCORE_FAILURES_KEY, SCORE_LEADS, SCORE_RESULTS_KEY, WRITE_EMAIL,
};
use salesflow_core::error::{Result, SalesflowError};
use salesflow_core::lead::{EmailDraft, LeadScoringResult};
use salesflow_core::traits::{ArtifactFormat, ArtifactSink};
use salesflow_core::types::FlowStatus;
use salesflow_flow::{FlowRun, StepOutcome};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Writes artifacts as files under one output directory.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactSink for FileSink {
    fn write(&self, artifact: &Value, logical_name: &str, format: ArtifactFormat) -> Result<PathBuf> {
        let persistence = |message: String| SalesflowError::Persistence {
            name: logical_name.to_string(),
            message,
        };

        let body = match format {
            ArtifactFormat::Tabular => to_csv(artifact).map_err(persistence)?,
            ArtifactFormat::Document => serde_json::to_string_pretty(artifact)?,
            ArtifactFormat::Text => match artifact {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };

        std::fs::create_dir_all(&self.dir).map_err(|e| persistence(e.to_string()))?;
        let path = self
            .dir
            .join(format!("{}.{}", logical_name, format.extension()));
        std::fs::write(&path, body).map_err(|e| persistence(e.to_string()))?;
        Ok(path)
    }
}

/// Render an array of flat objects as CSV.
///
/// The header is the union of keys in first-seen order; missing cells are empty.
fn to_csv(rows: &Value) -> std::result::Result<String, String> {
    let rows = rows
        .as_array()
        .ok_or_else(|| "tabular artifact must be an array of objects".to_string())?;

    let mut header: Vec<&str> = Vec::new();
    let mut objects: Vec<&Map<String, Value>> = Vec::with_capacity(rows.len());
    for row in rows {
        let obj = row
            .as_object()
            .ok_or_else(|| format!("tabular row is not an object: {}", row))?;
        for key in obj.keys() {
            if !header.contains(&key.as_str()) {
                header.push(key);
            }
        }
        objects.push(obj);
    }

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    writer.write_record(&header).map_err(|e| e.to_string())?;
    for obj in objects {
        writer
            .write_record(
                header
                    .iter()
                    .map(|key| obj.get(*key).map(cell).unwrap_or_default()),
            )
            .map_err(|e| e.to_string())?;
    }
    let bytes = writer.into_inner().map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Write every artifact of a finished run. Failures are logged and skipped.
///
/// Returns the paths that were written.
pub fn write_artifacts(run: &FlowRun, sink: &dyn ArtifactSink, now: DateTime<Utc>) -> Vec<PathBuf> {
    let ts = now.format(TIMESTAMP_FORMAT).to_string();
    let mut written = Vec::new();

    let mut emit = |artifact: Value, name: String, format: ArtifactFormat| {
        match sink.write(&artifact, &name, format) {
            Ok(path) => {
                info!(path = %path.display(), "Wrote artifact");
                written.push(path);
            }
            Err(e) => warn!(artifact = %name, error = %e, "Failed to write artifact"),
        }
    };

    let rows = scoring_rows(run);
    if !rows.is_empty() {
        emit(
            Value::Array(rows),
            format!("lead_scoring_results_{}", ts),
            ArtifactFormat::Tabular,
        );
    }

    let mut emails = emails(run);
    let total_emails = emails.len();
    emails.extend(email_failures(run, total_emails));
    if !emails.is_empty() {
        emit(
            Value::Array(emails),
            format!("generated_emails_{}", ts),
            ArtifactFormat::Document,
        );
    }

    emit(
        summary(run, &ts, total_emails),
        format!("pipeline_summary_{}", ts),
        ArtifactFormat::Document,
    );

    if run.status == FlowStatus::Failed {
        emit(
            error_report(run, &ts),
            format!("pipeline_error_{}", ts),
            ArtifactFormat::Document,
        );
    }

    written
}

/// One row per scored lead plus one `error` row per lead that failed scoring.
fn scoring_rows(run: &FlowRun) -> Vec<Value> {
    let mut rows: Vec<Value> = run
        .state
        .get_as::<Vec<LeadScoringResult>>(SCORE_RESULTS_KEY)
        .unwrap_or_default()
        .iter()
        .map(|r| Value::Object(r.to_row()))
        .collect();

    if let Ok(Value::Array(failures)) = run.state.get(SCORE_FAILURES_KEY) {
        rows.extend(failures.iter().map(|f| {
            json!({
                "name": f.get("lead").cloned().unwrap_or(Value::Null),
                "error": f.get("error").cloned().unwrap_or(Value::Null),
            })
        }));
    }
    rows
}

fn emails(run: &FlowRun) -> Vec<Value> {
    let Some(output) = run.output() else {
        return Vec::new();
    };
    let drafts: Vec<EmailDraft> = match serde_json::from_value(output.clone()) {
        Ok(drafts) => drafts,
        Err(e) => {
            warn!(error = %e, "Run output is not a list of emails");
            return Vec::new();
        }
    };
    drafts
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            json!({
                "email_id": i + 1,
                "lead_name": d.lead_name,
                "content": d.content,
                "token_usage": d.token_usage,
            })
        })
        .collect()
}

/// One `error` entry per lead whose email could not be written, numbered after the drafts.
fn email_failures(run: &FlowRun, drafted: usize) -> Vec<Value> {
    item_failures(run, EMAIL_FAILURES_KEY, WRITE_EMAIL)
        .iter()
        .enumerate()
        .map(|(i, f)| {
            json!({
                "email_id": drafted + i + 1,
                "lead_name": f.get("lead").cloned().unwrap_or(Value::Null),
                "error": f.get("error").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}

/// Per-item failures a step left in the state store, tagged with the step name.
fn item_failures(run: &FlowRun, key: &str, step: &str) -> Vec<Value> {
    let Ok(Value::Array(failures)) = run.state.get(key) else {
        return Vec::new();
    };
    failures
        .into_iter()
        .map(|mut failure| {
            if let Some(obj) = failure.as_object_mut() {
                obj.insert("step".into(), json!(step));
            }
            failure
        })
        .collect()
}

fn summary(run: &FlowRun, ts: &str, total_emails: usize) -> Value {
    let total_leads = run
        .state
        .get_as::<Vec<Value>>(SCORE_RESULTS_KEY)
        .map(|v| v.len())
        .unwrap_or(0)
        + run
            .state
            .get_as::<Vec<Value>>(SCORE_FAILURES_KEY)
            .map(|v| v.len())
            .unwrap_or(0);

    json!({
        "timestamp": ts,
        "run_id": run.run_id.to_string(),
        "total_leads_processed": total_leads,
        "total_emails_generated": total_emails,
        "total_email_failures": item_failures(run, EMAIL_FAILURES_KEY, WRITE_EMAIL).len(),
        "flow_state_keys": run.state.keys(),
        "status": run.status.to_string(),
        "failed_steps": run.failed_steps().iter().map(|r| r.step.clone()).collect::<Vec<_>>(),
        "skipped_steps": run.skipped,
        "elapsed_ms": run.elapsed_ms,
    })
}

fn error_report(run: &FlowRun, ts: &str) -> Value {
    let mut errors: Vec<Value> = run
        .failed_steps()
        .iter()
        .filter_map(|r| match &r.outcome {
            StepOutcome::Failed(message) => Some(json!({ "step": r.step, "error": message })),
            StepOutcome::Completed(_) => None,
        })
        .collect();
    errors.extend(item_failures(run, SCORE_FAILURES_KEY, SCORE_LEADS));
    errors.extend(item_failures(run, EMAIL_FAILURES_KEY, WRITE_EMAIL));

    json!({
        "timestamp": ts,
        "run_id": run.run_id.to_string(),
        "errors": errors,
        "status": "failed",
    })
}
