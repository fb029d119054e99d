//! Dependency-driven step orchestration.
//!
//! A flow is a DAG of named [`Step`]s wired by [`Trigger`]s and held in a
//! [`StepRegistry`]. The [`FlowEngine`] fires ready steps until none remain,
//! handing each one a [`StepContext`] with the run's [`StateStore`] and a
//! [`FanExecutor`] for per-item work.

pub mod engine;
pub mod fan;
pub mod gate;
pub mod gateway;
pub mod registry;
pub mod run_log;
pub mod state;
pub mod step;

pub use engine::{FlowEngine, FlowRun, StepOutcome, StepRecord};
pub use fan::{FanExecutor, FanItem, FanItemError, FanResult};
pub use gateway::{CollaboratorGateway, UnitOutput};
pub use registry::StepRegistry;
pub use run_log::RunLogger;
pub use state::StateStore;
pub use step::{Step, StepContext, StepHandler, Trigger};
