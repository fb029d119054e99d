use thiserror::Error;

#[derive(Debug, Error)]
pub enum SalesflowError {
    // Flow wiring errors (registration time)
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Step already registered: {0}")]
    DuplicateStep(String),

    #[error("Trigger of step '{step}' forms a cycle through '{via}'")]
    CyclicTrigger { step: String, via: String },

    // Run-time errors
    #[error("State key not found: {0}")]
    KeyNotFound(String),

    #[error("Step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    #[error("Fan-out finished with {failed} of {total} items failed")]
    AggregateFan { failed: usize, total: usize },

    #[error("Fan-out aborted at item {index}: {message}")]
    FanAborted { index: usize, message: String },

    // Collaborator errors
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Output does not match schema: {0}")]
    OutputSchema(String),

    #[error("Persistence failed for '{name}': {message}")]
    Persistence { name: String, message: String },

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM provider not supported: {0}")]
    UnsupportedProvider(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SalesflowError {
    /// Whether this error is raised while wiring a flow, before any run.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::DuplicateStep(_) | Self::CyclicTrigger { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SalesflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_errors_are_classified() {
        assert!(SalesflowError::DuplicateStep("a".into()).is_registration_error());
        assert!(SalesflowError::CyclicTrigger {
            step: "a".into(),
            via: "b".into()
        }
        .is_registration_error());
        assert!(!SalesflowError::KeyNotFound("k".into()).is_registration_error());
    }

    #[test]
    fn test_display_includes_context() {
        let err = SalesflowError::StepExecution {
            step: "score_leads".into(),
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "Step 'score_leads' failed: boom");
    }
}
