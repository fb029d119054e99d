use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use salesflow_core::config::FanConfig;
use salesflow_core::error::{Result, SalesflowError};
use salesflow_core::event::EventBus;
use salesflow_core::types::{FlowEvent, FlowStatus, RunId};

use crate::fan::FanExecutor;
use crate::registry::StepRegistry;
use crate::state::StateStore;
use crate::step::{Step, StepContext, Trigger};

/// How a fired step ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "value")]
pub enum StepOutcome {
    Completed(Value),
    Failed(String),
}

/// Record of one fired step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl StepRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, StepOutcome::Completed(_))
    }
}

/// One execution of a flow.
///
/// The state store stays readable after the run ends. A run abandoned
/// mid-flight (e.g. by a timeout around `kickoff`) is left `Running`.
#[derive(Debug)]
pub struct FlowRun {
    pub run_id: RunId,
    pub status: FlowStatus,
    pub state: StateStore,
    /// Fired steps in execution order.
    pub records: Vec<StepRecord>,
    /// Steps that never fired because something upstream failed.
    pub skipped: Vec<String>,
    pub artifact: Option<Value>,
    pub elapsed_ms: u64,
}

impl FlowRun {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            status: FlowStatus::Idle,
            state: StateStore::new(),
            records: Vec::new(),
            skipped: Vec::new(),
            artifact: None,
            elapsed_ms: 0,
        }
    }

    /// Output of the terminal step, or an object keyed by terminal name
    /// when several terminals completed.
    pub fn output(&self) -> Option<&Value> {
        self.artifact.as_ref()
    }

    pub fn step_output(&self, step: &str) -> Option<&Value> {
        self.records.iter().find(|r| r.step == step).and_then(|r| match &r.outcome {
            StepOutcome::Completed(value) => Some(value),
            StepOutcome::Failed(_) => None,
        })
    }

    pub fn record(&self, step: &str) -> Option<&StepRecord> {
        self.records.iter().find(|r| r.step == step)
    }

    pub fn failed_steps(&self) -> Vec<&StepRecord> {
        self.records.iter().filter(|r| !r.succeeded()).collect()
    }

    pub fn is_completed(&self) -> bool {
        self.status == FlowStatus::Completed
    }
}

/// Runs a validated step registry to a fixed point.
///
/// Steps are fired one at a time on the caller's task; parallelism lives
/// inside handlers, through the run's [`FanExecutor`].
pub struct FlowEngine {
    registry: StepRegistry,
    fan: FanConfig,
    events: Option<Arc<EventBus>>,
}

impl FlowEngine {
    /// Validate `registry` and wrap it.
    pub fn new(registry: StepRegistry) -> Result<Self> {
        registry.validate()?;
        Ok(Self {
            registry,
            fan: FanConfig::default(),
            events: None,
        })
    }

    pub fn with_fan(mut self, config: FanConfig) -> Self {
        self.fan = config;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Run the flow from `seed` under a fresh run id.
    pub async fn kickoff(&self, seed: Value) -> FlowRun {
        self.kickoff_as(RunId::new(), seed).await
    }

    /// Run the flow under a caller-chosen run id.
    pub async fn kickoff_as(&self, run_id: RunId, seed: Value) -> FlowRun {
        let start = Instant::now();
        let mut run = FlowRun::new(run_id);
        let mut fan = FanExecutor::new(self.fan.clone());
        if let Some(events) = &self.events {
            fan = fan.with_events(events.clone());
        }

        run.status = FlowStatus::Running;
        info!(run_id = %run.run_id, steps = self.registry.len(), "Flow run started");
        self.publish(FlowEvent::RunStarted {
            run_id: run.run_id.clone(),
        });

        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut fired: HashSet<String> = HashSet::new();

        loop {
            let ready: Vec<Step> = self
                .registry
                .resolve_ready(&completed, &fired)
                .into_iter()
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }

            for step in ready {
                fired.insert(step.name.clone());
                let input = match &step.trigger {
                    Trigger::Initial => seed.clone(),
                    Trigger::AfterOne(pred) => outputs.get(pred).cloned().unwrap_or(Value::Null),
                    Trigger::AfterAll(preds) => Value::Array(
                        preds
                            .iter()
                            .map(|p| outputs.get(p).cloned().unwrap_or(Value::Null))
                            .collect(),
                    ),
                };

                if let Some(output) = self.fire(&mut run, &fan, &step, input).await {
                    outputs.insert(step.name.clone(), output);
                    completed.insert(step.name.clone());
                }
            }
        }

        for step in self.registry.steps() {
            if !fired.contains(&step.name) {
                debug!(run_id = %run.run_id, step = %step.name, "Step starved by upstream failure");
                run.skipped.push(step.name.clone());
                self.publish(FlowEvent::StepSkipped {
                    run_id: run.run_id.clone(),
                    step: step.name.clone(),
                });
            }
        }

        let terminals = self.registry.terminals();
        let missing: Vec<&str> = terminals
            .iter()
            .copied()
            .filter(|t| !completed.contains(*t))
            .collect();

        let finished: Vec<&str> = terminals
            .iter()
            .copied()
            .filter(|t| completed.contains(*t))
            .collect();
        run.artifact = match finished.as_slice() {
            [] => None,
            [only] => outputs.get(*only).cloned(),
            many => Some(Value::Object(
                many.iter()
                    .filter_map(|t| outputs.get(*t).map(|v| (t.to_string(), v.clone())))
                    .collect(),
            )),
        };

        run.elapsed_ms = start.elapsed().as_millis() as u64;
        if missing.is_empty() {
            run.status = FlowStatus::Completed;
            info!(run_id = %run.run_id, elapsed_ms = run.elapsed_ms, "Flow run completed");
        } else {
            run.status = FlowStatus::Failed;
            warn!(
                run_id = %run.run_id,
                terminals = %missing.join(", "),
                elapsed_ms = run.elapsed_ms,
                "Flow run failed: terminal steps did not complete"
            );
        }

        self.publish(FlowEvent::RunFinished {
            run_id: run.run_id.clone(),
            status: run.status,
            elapsed_ms: run.elapsed_ms,
        });
        run
    }

    /// Invoke one step and record it. Returns the output on success.
    async fn fire(
        &self,
        run: &mut FlowRun,
        fan: &FanExecutor,
        step: &Step,
        input: Value,
    ) -> Option<Value> {
        info!(run_id = %run.run_id, step = %step.name, trigger = %step.trigger, "Executing flow step");
        self.publish(FlowEvent::StepStarted {
            run_id: run.run_id.clone(),
            step: step.name.clone(),
        });

        let ctx = StepContext::new(
            run.run_id.clone(),
            step.name.clone(),
            run.state.clone(),
            fan.clone(),
            self.events.clone(),
        );
        let started_at = Utc::now();
        let step_start = Instant::now();
        let result = step.invoke(input, ctx).await;
        let elapsed_ms = step_start.elapsed().as_millis() as u64;

        let (outcome, output) = match result {
            Ok(value) => {
                debug!(run_id = %run.run_id, step = %step.name, elapsed_ms, "Step complete");
                self.publish(FlowEvent::StepCompleted {
                    run_id: run.run_id.clone(),
                    step: step.name.clone(),
                    elapsed_ms,
                });
                (StepOutcome::Completed(value.clone()), Some(value))
            }
            Err(e) => {
                let e = SalesflowError::StepExecution {
                    step: step.name.clone(),
                    message: e.to_string(),
                };
                error!(run_id = %run.run_id, step = %step.name, error = %e, "Flow step failed");
                self.publish(FlowEvent::StepFailed {
                    run_id: run.run_id.clone(),
                    step: step.name.clone(),
                    error: e.to_string(),
                });
                (StepOutcome::Failed(e.to_string()), None)
            }
        };

        run.records.push(StepRecord {
            step: step.name.clone(),
            outcome,
            started_at,
            elapsed_ms,
        });
        output
    }

    fn publish(&self, event: FlowEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    async fn echo(input: Value, _ctx: StepContext) -> Result<Value> {
        Ok(input)
    }

    async fn boom(_input: Value, _ctx: StepContext) -> Result<Value> {
        Err(SalesflowError::Execution("model unavailable".into()))
    }

    async fn double(input: Value, _ctx: StepContext) -> Result<Value> {
        let n = input.as_i64().unwrap_or_default();
        Ok(json!(n * 2))
    }

    #[tokio::test]
    async fn test_linear_flow_completes() {
        let mut registry = StepRegistry::new();
        registry.register(Step::initial("start", echo)).unwrap();
        registry.register(Step::after("double", "start", double)).unwrap();
        let engine = FlowEngine::new(registry).unwrap();

        let run = engine.kickoff(json!(21)).await;
        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(run.output(), Some(&json!(42)));
        assert_eq!(run.records.len(), 2);
        assert!(run.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_registry() {
        let mut registry = StepRegistry::new();
        registry.register(Step::after("orphan", "ghost", echo)).unwrap();
        assert!(FlowEngine::new(registry).is_err());
    }

    #[tokio::test]
    async fn test_after_all_waits_for_slow_branch() {
        let order = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = |name: &'static str| {
            let order = order.clone();
            move |input: Value, _ctx: StepContext| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name.to_string());
                    Ok::<_, SalesflowError>(input)
                }
            }
        };

        let mut registry = StepRegistry::new();
        registry.register(Step::initial("a", log("a"))).unwrap();
        registry.register(Step::after("fast", "a", log("fast"))).unwrap();
        registry.register(Step::after("slow1", "a", log("slow1"))).unwrap();
        registry.register(Step::after("slow2", "slow1", log("slow2"))).unwrap();
        registry
            .register(Step::after_all("join", ["fast", "slow2"], log("join")))
            .unwrap();
        let engine = FlowEngine::new(registry).unwrap();

        let run = engine.kickoff(json!("seed")).await;
        assert!(run.is_completed());
        let order = order.lock().unwrap().clone();
        assert_eq!(order.iter().filter(|s| *s == "join").count(), 1);
        assert_eq!(order.last().map(String::as_str), Some("join"));
        assert_eq!(run.output(), Some(&json!(["seed", "seed"])));
    }

    #[tokio::test]
    async fn test_failure_starves_listeners_and_fails_run() {
        let mut registry = StepRegistry::new();
        registry.register(Step::initial("start", echo)).unwrap();
        registry.register(Step::after("score", "start", boom)).unwrap();
        registry.register(Step::after("email", "score", echo)).unwrap();
        let engine = FlowEngine::new(registry).unwrap();

        let run = engine.kickoff(json!(1)).await;
        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(run.skipped, vec!["email"]);
        assert!(run.output().is_none());
        let failed = run.failed_steps();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].step, "score");
        assert!(matches!(&failed[0].outcome, StepOutcome::Failed(m) if m.contains("model unavailable")));
    }

    #[tokio::test]
    async fn test_failed_step_recorded_as_step_execution_error() {
        let mut registry = StepRegistry::new();
        registry.register(Step::initial("start", echo)).unwrap();
        registry.register(Step::after("score", "start", boom)).unwrap();
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let engine = FlowEngine::new(registry).unwrap().with_events(bus.clone());

        let run = engine.kickoff(json!(1)).await;
        let expected = SalesflowError::StepExecution {
            step: "score".into(),
            message: "Execution failed: model unavailable".into(),
        }
        .to_string();
        assert!(matches!(&run.record("score").unwrap().outcome, StepOutcome::Failed(m) if *m == expected));

        let mut published = None;
        while let Ok(event) = rx.try_recv() {
            if let FlowEvent::StepFailed { error, .. } = event {
                published = Some(error);
            }
        }
        assert_eq!(published, Some(expected));
    }

    #[tokio::test]
    async fn test_off_path_failure_does_not_fail_run() {
        let mut registry = StepRegistry::new();
        registry.register(Step::initial("start", echo)).unwrap();
        registry.register(Step::after("audit", "start", boom)).unwrap();
        registry.register(Step::after("main", "start", double)).unwrap();
        registry.designate_terminal("main");
        let engine = FlowEngine::new(registry).unwrap();

        let run = engine.kickoff(json!(5)).await;
        assert_eq!(run.status, FlowStatus::Completed);
        assert_eq!(run.output(), Some(&json!(10)));
        assert_eq!(run.failed_steps().len(), 1);
    }

    #[tokio::test]
    async fn test_multiple_terminals_keyed_by_name() {
        let mut registry = StepRegistry::new();
        registry.register(Step::initial("start", echo)).unwrap();
        registry.register(Step::after("left", "start", echo)).unwrap();
        registry.register(Step::after("right", "start", double)).unwrap();
        let engine = FlowEngine::new(registry).unwrap();

        let run = engine.kickoff(json!(3)).await;
        assert_eq!(run.output(), Some(&json!({"left": 3, "right": 6})));
    }

    #[tokio::test]
    async fn test_state_persists_across_steps_and_after_run() {
        async fn write(input: Value, ctx: StepContext) -> Result<Value> {
            ctx.state().set("seen", input.clone());
            Ok(input)
        }
        async fn read(_input: Value, ctx: StepContext) -> Result<Value> {
            ctx.state().get("seen")
        }
        async fn read_missing(_input: Value, ctx: StepContext) -> Result<Value> {
            ctx.state().get("never_written")
        }

        let mut registry = StepRegistry::new();
        registry.register(Step::initial("write", write)).unwrap();
        registry.register(Step::after("read", "write", read)).unwrap();
        registry.register(Step::after("read_missing", "write", read_missing)).unwrap();
        registry.designate_terminal("read");
        let engine = FlowEngine::new(registry).unwrap();

        let run = engine.kickoff(json!("v")).await;
        assert!(run.is_completed());
        assert_eq!(run.state.get("seen").unwrap(), json!("v"));
        assert!(matches!(
            &run.record("read_missing").unwrap().outcome,
            StepOutcome::Failed(m) if m.contains("never_written")
        ));
    }

    #[tokio::test]
    async fn test_runs_do_not_share_state() {
        async fn count(_input: Value, ctx: StepContext) -> Result<Value> {
            let seen = ctx.state().contains("count");
            ctx.state().set("count", json!(1));
            Ok(json!(seen))
        }
        let mut registry = StepRegistry::new();
        registry.register(Step::initial("count", count)).unwrap();
        let engine = FlowEngine::new(registry).unwrap();

        let first = engine.kickoff(Value::Null).await;
        let second = engine.kickoff(Value::Null).await;
        assert_eq!(first.output(), Some(&json!(false)));
        assert_eq!(second.output(), Some(&json!(false)));
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn test_events_published_in_order() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();

        let mut registry = StepRegistry::new();
        registry.register(Step::initial("start", echo)).unwrap();
        registry.register(Step::after("bad", "start", boom)).unwrap();
        registry.register(Step::after("never", "bad", echo)).unwrap();
        registry.designate_terminal("start");
        let engine = FlowEngine::new(registry).unwrap().with_events(bus.clone());

        let run = engine.kickoff_as(RunId::from_str("run-7"), json!(0)).await;
        assert_eq!(run.status, FlowStatus::Completed);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                FlowEvent::RunStarted { .. } => "run_started".to_string(),
                FlowEvent::StepStarted { step, .. } => format!("started:{}", step),
                FlowEvent::StepCompleted { step, .. } => format!("completed:{}", step),
                FlowEvent::StepFailed { step, .. } => format!("failed:{}", step),
                FlowEvent::StepSkipped { step, .. } => format!("skipped:{}", step),
                FlowEvent::FanItemFailed { index, .. } => format!("item:{}", index),
                FlowEvent::RunFinished { run_id, status, .. } => {
                    format!("finished:{}:{}", run_id, status)
                }
            });
        }
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "started:start",
                "completed:start",
                "started:bad",
                "failed:bad",
                "skipped:never",
                "finished:run-7:completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_fan_out_inside_step_uses_run_config() {
        async fn fan(input: Value, ctx: StepContext) -> Result<Value> {
            let items: Vec<i64> = serde_json::from_value(input)?;
            let result = ctx
                .fan()
                .fan_out(items, |n| async move {
                    if n < 0 {
                        Err(SalesflowError::Execution("negative".into()))
                    } else {
                        Ok(n + 1)
                    }
                })
                .await?;
            ctx.state().set("fan_failures", json!(result.failures().len()));
            Ok(json!(result.into_successes()))
        }

        let mut registry = StepRegistry::new();
        registry.register(Step::initial("fan", fan)).unwrap();
        let engine = FlowEngine::new(registry).unwrap().with_fan(FanConfig {
            max_concurrency: 2,
            ..FanConfig::default()
        });

        let run = engine.kickoff(json!([1, -1, 3])).await;
        assert_eq!(run.output(), Some(&json!([2, 4])));
        assert_eq!(run.state.get("fan_failures").unwrap(), json!(1));
    }
}
