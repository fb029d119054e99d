//! Fan-out / fan-in over independent items.
//!
//! Every item runs its own unit of work; results are slotted back by input
//! index, so `result[i]` always belongs to `items[i]` whatever order the work
//! finished in. A failing item is captured in its slot and its siblings keep
//! running, unless the executor is configured fail-fast.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use salesflow_core::config::{FanConfig, FanMode};
use salesflow_core::error::{Result, SalesflowError};
use salesflow_core::event::EventBus;
use salesflow_core::types::FlowEvent;

/// Failure captured for one fanned-out item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanItemError {
    pub index: usize,
    pub message: String,
}

/// Outcome of one item.
#[derive(Debug, Clone, PartialEq)]
pub enum FanItem<O> {
    Ok(O),
    Failed(FanItemError),
}

impl<O> FanItem<O> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn as_ok(&self) -> Option<&O> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&FanItemError> {
        match self {
            Self::Ok(_) => None,
            Self::Failed(err) => Some(err),
        }
    }
}

/// Index-aligned outcomes of a fan-out. Length always equals the input length.
#[derive(Debug, Clone, PartialEq)]
pub struct FanResult<O> {
    items: Vec<FanItem<O>>,
}

impl<O> FanResult<O> {
    pub fn from_items(items: Vec<FanItem<O>>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FanItem<O>> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[FanItem<O>] {
        &self.items
    }

    pub fn into_items(self) -> Vec<FanItem<O>> {
        self.items
    }

    /// Successful outputs in input order.
    pub fn successes(&self) -> Vec<&O> {
        self.items.iter().filter_map(FanItem::as_ok).collect()
    }

    pub fn failures(&self) -> Vec<&FanItemError> {
        self.items.iter().filter_map(FanItem::error).collect()
    }

    pub fn into_successes(self) -> Vec<O> {
        self.items
            .into_iter()
            .filter_map(|item| match item {
                FanItem::Ok(value) => Some(value),
                FanItem::Failed(_) => None,
            })
            .collect()
    }

    /// `AggregateFan` when any item failed. Never raised by the executor itself.
    pub fn aggregate_error(&self) -> Option<SalesflowError> {
        let failed = self.failures().len();
        if failed == 0 {
            None
        } else {
            Some(SalesflowError::AggregateFan {
                failed,
                total: self.len(),
            })
        }
    }

    /// Transform successful outputs, keeping failures in place.
    pub fn map<T>(self, mut f: impl FnMut(O) -> T) -> FanResult<T> {
        FanResult {
            items: self
                .items
                .into_iter()
                .map(|item| match item {
                    FanItem::Ok(value) => FanItem::Ok(f(value)),
                    FanItem::Failed(err) => FanItem::Failed(err),
                })
                .collect(),
        }
    }
}

/// Dispatches per-item units of work sequentially or concurrently.
#[derive(Clone, Default)]
pub struct FanExecutor {
    config: FanConfig,
    events: Option<Arc<EventBus>>,
}

impl FanExecutor {
    pub fn new(config: FanConfig) -> Self {
        Self {
            config,
            events: None,
        }
    }

    /// One item at a time, never fail-fast.
    pub fn sequential() -> Self {
        Self::new(FanConfig {
            mode: FanMode::Sequential,
            ..FanConfig::default()
        })
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &FanConfig {
        &self.config
    }

    /// Run `unit` over every item.
    ///
    /// Returns `Err(FanAborted)` only in fail-fast mode, on the first failure;
    /// in-flight siblings are dropped. Otherwise every index gets an outcome.
    pub async fn fan_out<I, O, F, Fut>(&self, items: Vec<I>, unit: F) -> Result<FanResult<O>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<O>>,
    {
        let total = items.len();
        let mut slots: Vec<Option<FanItem<O>>> = (0..total).map(|_| None).collect();
        debug!(total, mode = ?self.config.mode, "Fanning out");

        match self.config.mode {
            FanMode::Sequential => {
                for (index, item) in items.into_iter().enumerate() {
                    let outcome = unit(item).await;
                    slots[index] = Some(self.settle(index, outcome)?);
                }
            }
            FanMode::Concurrent => {
                let unit = &unit;
                let limit = self.config.max_concurrency.max(1);
                let mut pending = stream::iter(items.into_iter().enumerate())
                    .map(|(index, item)| async move { (index, unit(item).await) })
                    .buffer_unordered(limit);

                while let Some((index, outcome)) = pending.next().await {
                    slots[index] = Some(self.settle(index, outcome)?);
                }
            }
        }

        let items = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    FanItem::Failed(FanItemError {
                        index,
                        message: "item produced no outcome".to_string(),
                    })
                })
            })
            .collect();
        Ok(FanResult { items })
    }

    fn settle<O>(&self, index: usize, outcome: Result<O>) -> Result<FanItem<O>> {
        match outcome {
            Ok(value) => Ok(FanItem::Ok(value)),
            Err(e) => {
                let message = e.to_string();
                warn!(index, error = %message, "Fan-out item failed");
                if let Some(events) = &self.events {
                    events.publish(FlowEvent::FanItemFailed {
                        index,
                        error: message.clone(),
                    });
                }
                if self.config.fail_fast {
                    return Err(SalesflowError::FanAborted { index, message });
                }
                Ok(FanItem::Failed(FanItemError { index, message }))
            }
        }
    }
}

impl std::fmt::Debug for FanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
