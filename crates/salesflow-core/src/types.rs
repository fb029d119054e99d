use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique flow run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Accumulated token usage across one or more LLM calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub requests: u32,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Add another usage record into this one.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.requests += other.requests;
    }
}

impl std::fmt::Display for TokenUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total_tokens={} prompt_tokens={} completion_tokens={} successful_requests={}",
            self.total_tokens(),
            self.input_tokens,
            self.output_tokens,
            self.requests
        )
    }
}

/// Final status of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Flow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Flow run started.
    RunStarted { run_id: RunId },
    /// A step handler was invoked.
    StepStarted { run_id: RunId, step: String },
    /// A step handler returned an output.
    StepCompleted {
        run_id: RunId,
        step: String,
        elapsed_ms: u64,
    },
    /// A step handler raised.
    StepFailed {
        run_id: RunId,
        step: String,
        error: String,
    },
    /// A step never fired because an upstream step failed.
    StepSkipped { run_id: RunId, step: String },
    /// One item of a fan-out failed; siblings keep running.
    FanItemFailed { index: usize, error: String },
    /// Flow run reached a final status.
    RunFinished {
        run_id: RunId,
        status: FlowStatus,
        elapsed_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_absorb_and_display() {
        let mut usage = TokenUsage::default();
        usage.absorb(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            requests: 1,
        });
        usage.absorb(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
            requests: 1,
        });
        assert_eq!(usage.total_tokens(), 18);
        assert_eq!(usage.requests, 2);
        assert!(usage.to_string().starts_with("total_tokens=18"));
    }

    #[test]
    fn test_flow_status_serializes_lowercase() {
        let json = serde_json::to_string(&FlowStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        assert_eq!(FlowStatus::Failed.to_string(), "failed");
    }
}
