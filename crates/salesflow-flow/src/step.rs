use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use salesflow_core::error::Result;
use salesflow_core::event::EventBus;
use salesflow_core::types::RunId;

use crate::fan::FanExecutor;
use crate::state::StateStore;

/// Condition under which a step fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "steps")]
pub enum Trigger {
    /// Entry point; receives the run's seed.
    Initial,
    /// Fires when the named step completes, with that step's output.
    AfterOne(String),
    /// Fires once every listed step has completed. Input is a JSON array
    /// of their outputs in the order listed here.
    AfterAll(Vec<String>),
}

impl Trigger {
    /// Steps this trigger waits on.
    pub fn predecessors(&self) -> &[String] {
        match self {
            Self::Initial => &[],
            Self::AfterOne(step) => std::slice::from_ref(step),
            Self::AfterAll(steps) => steps,
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Initial)
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::AfterOne(step) => write!(f, "after {}", step),
            Self::AfterAll(steps) => write!(f, "after all of [{}]", steps.join(", ")),
        }
    }
}

/// Per-invocation handle a step handler works through.
///
/// The state store it carries is the run's store; writes are visible to
/// every later step of the same run and to the caller once the run ends.
#[derive(Clone)]
pub struct StepContext {
    run_id: RunId,
    step: String,
    state: StateStore,
    fan: FanExecutor,
    events: Option<Arc<EventBus>>,
}

impl StepContext {
    pub fn new(
        run_id: RunId,
        step: impl Into<String>,
        state: StateStore,
        fan: FanExecutor,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            run_id,
            step: step.into(),
            state,
            fan,
            events,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Name of the step being executed.
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Fan-out executor configured for this run.
    pub fn fan(&self) -> &FanExecutor {
        &self.fan
    }

    pub fn events(&self) -> Option<&Arc<EventBus>> {
        self.events.as_ref()
    }
}

/// A step's unit of work.
pub trait StepHandler: Send + Sync + 'static {
    fn call(&self, input: Value, ctx: StepContext) -> BoxFuture<'static, Result<Value>>;
}

impl<F, Fut> StepHandler for F
where
    F: Fn(Value, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn call(&self, input: Value, ctx: StepContext) -> BoxFuture<'static, Result<Value>> {
        Box::pin(self(input, ctx))
    }
}

/// A named node of the flow DAG.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub trigger: Trigger,
    pub description: Option<String>,
    pub(crate) handler: Arc<dyn StepHandler>,
}

impl Step {
    pub fn new(name: impl Into<String>, trigger: Trigger, handler: impl StepHandler) -> Self {
        Self {
            name: name.into(),
            trigger,
            description: None,
            handler: Arc::new(handler),
        }
    }

    pub fn initial(name: impl Into<String>, handler: impl StepHandler) -> Self {
        Self::new(name, Trigger::Initial, handler)
    }

    pub fn after(
        name: impl Into<String>,
        step: impl Into<String>,
        handler: impl StepHandler,
    ) -> Self {
        Self::new(name, Trigger::AfterOne(step.into()), handler)
    }

    pub fn after_all<I, S>(name: impl Into<String>, steps: I, handler: impl StepHandler) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps = steps.into_iter().map(Into::into).collect();
        Self::new(name, Trigger::AfterAll(steps), handler)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub(crate) fn invoke(&self, input: Value, ctx: StepContext) -> BoxFuture<'static, Result<Value>> {
        self.handler.call(input, ctx)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn echo(input: Value, _ctx: StepContext) -> Result<Value> {
        Ok(input)
    }

    #[test]
    fn test_trigger_predecessors() {
        assert!(Trigger::Initial.predecessors().is_empty());
        assert_eq!(Trigger::AfterOne("a".into()).predecessors(), ["a".to_string()]);
        let all = Trigger::AfterAll(vec!["a".into(), "b".into()]);
        assert_eq!(all.predecessors().len(), 2);
        assert_eq!(all.to_string(), "after all of [a, b]");
    }

    #[test]
    fn test_trigger_serde() {
        let json = serde_json::to_value(Trigger::AfterOne("score".into())).unwrap();
        assert_eq!(json, json!({"kind": "after_one", "steps": "score"}));
    }

    #[tokio::test]
    async fn test_fn_handler_invocation() {
        let step = Step::initial("start", echo).with_description("echoes its seed");
        let ctx = StepContext::new(
            RunId::from_str("r"),
            "start",
            StateStore::new(),
            FanExecutor::default(),
            None,
        );
        let out = step.invoke(json!([1, 2]), ctx).await.unwrap();
        assert_eq!(out, json!([1, 2]));
        assert!(format!("{:?}", step).contains("start"));
    }

    #[tokio::test]
    async fn test_closure_handler_writes_state() {
        let step = Step::after("mark", "start", |input: Value, ctx: StepContext| async move {
            ctx.state().set("seen", input.clone());
            Ok::<_, salesflow_core::SalesflowError>(input)
        });
        let state = StateStore::new();
        let ctx = StepContext::new(
            RunId::new(),
            "mark",
            state.clone(),
            FanExecutor::default(),
            None,
        );
        step.invoke(json!("x"), ctx).await.unwrap();
        assert_eq!(state.get("seen").unwrap(), json!("x"));
    }
}
