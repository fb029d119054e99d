pub mod crew;
pub mod gateway;
pub mod output;
pub mod pipeline;

pub use crew::{Crew, CrewOutput, TaskOutput};
pub use gateway::CrewGateway;
pub use output::OutputCleaner;
pub use pipeline::SalesPipeline;
