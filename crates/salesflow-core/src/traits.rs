use std::path::PathBuf;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Streaming chat completion client.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Shape of a persisted artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Rows of flat records (CSV).
    Tabular,
    /// A nested record (JSON).
    Document,
    /// Plain text.
    Text,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Tabular => "csv",
            Self::Document => "json",
            Self::Text => "txt",
        }
    }
}

/// Persistence backend for run outputs.
pub trait ArtifactSink: Send + Sync + 'static {
    /// Write `artifact` under `logical_name` and return where it landed.
    fn write(
        &self,
        artifact: &serde_json::Value,
        logical_name: &str,
        format: ArtifactFormat,
    ) -> Result<PathBuf>;
}
