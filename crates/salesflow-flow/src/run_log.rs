use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use salesflow_core::event::EventBus;
use salesflow_core::types::{FlowEvent, RunId};

/// JSONL flow-run logger.
///
/// Subscribes to the EventBus and appends one JSON object per flow event to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run summary, 2 = per-step,
    /// 3 = per fan-out item.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Path the log for `run_id` is written to.
    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Write events until cancellation, bus closure, or `RunFinished`.
    ///
    /// The subscription is taken when this is called, not when the returned
    /// future is first polled, so events published right after spawning are kept.
    pub fn run(
        self,
        event_bus: Arc<EventBus>,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send {
        let rx = event_bus.subscribe();
        self.write_events(rx, run_id, cancel)
    }

    async fn write_events(
        self,
        mut rx: broadcast::Receiver<FlowEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.log_path(&run_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&run_id, &event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(event, FlowEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert a flow event to a log entry; `None` when filtered by level
    /// or when it belongs to another run.
    fn event_to_entry(&self, run_id: &RunId, event: &FlowEvent) -> Option<LogEntry> {
        let entry = |event_type, step: Option<&String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type,
            step: step.cloned(),
            detail,
        };

        match event {
            FlowEvent::RunStarted { run_id: id } if id == run_id => {
                Some(entry("run_started", None, None))
            }
            FlowEvent::RunFinished {
                run_id: id,
                status,
                elapsed_ms,
            } if id == run_id => Some(entry(
                "run_finished",
                None,
                Some(serde_json::json!({ "status": status, "elapsed_ms": elapsed_ms })),
            )),

            FlowEvent::StepStarted { run_id: id, step } if id == run_id && self.level >= 2 => {
                Some(entry("step_started", Some(step), None))
            }
            FlowEvent::StepCompleted {
                run_id: id,
                step,
                elapsed_ms,
            } if id == run_id && self.level >= 2 => Some(entry(
                "step_completed",
                Some(step),
                Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            )),
            FlowEvent::StepFailed {
                run_id: id,
                step,
                error,
            } if id == run_id && self.level >= 2 => Some(entry(
                "step_failed",
                Some(step),
                Some(serde_json::json!({ "error": error })),
            )),
            FlowEvent::StepSkipped { run_id: id, step } if id == run_id && self.level >= 2 => {
                Some(entry("step_skipped", Some(step), None))
            }

            FlowEvent::FanItemFailed { index, error } if self.level >= 3 => Some(entry(
                "fan_item_failed",
                None,
                Some(serde_json::json!({ "index": index, "error": truncate_str(error, 500) })),
            )),

            _ => None,
        }
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
