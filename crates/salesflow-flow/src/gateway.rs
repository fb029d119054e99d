use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use salesflow_core::error::Result;
use salesflow_core::types::TokenUsage;

use crate::fan::{FanExecutor, FanResult};

/// What one collaborator unit returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitOutput {
    /// Final text of the unit.
    pub raw: String,
    /// Parsed value, when the unit declares a structured output.
    #[serde(default)]
    pub structured: Option<Value>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl UnitOutput {
    pub fn text(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Self::default()
        }
    }

    pub fn structured(raw: impl Into<String>, value: Value) -> Self {
        Self {
            raw: raw.into(),
            structured: Some(value),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// The structured value if present, otherwise the raw text as a string.
    pub fn value(&self) -> Value {
        self.structured
            .clone()
            .unwrap_or_else(|| Value::String(self.raw.clone()))
    }
}

/// The seam between step handlers and the agent layer.
///
/// `unit` names a declared unit of work (a crew); `context` is whatever
/// prior output it needs. Transient model errors are surfaced, not retried.
pub trait CollaboratorGateway: Send + Sync + 'static {
    fn execute_unit<'a>(&'a self, unit: &'a str, context: Value) -> BoxFuture<'a, Result<UnitOutput>>;

    /// Run `unit` once per item. The default dispatches sequentially.
    fn execute_batch<'a>(
        &'a self,
        unit: &'a str,
        items: Vec<Value>,
    ) -> BoxFuture<'a, Result<FanResult<UnitOutput>>> {
        Box::pin(async move {
            FanExecutor::sequential()
                .fan_out(items, |item| self.execute_unit(unit, item))
                .await
        })
    }
}
