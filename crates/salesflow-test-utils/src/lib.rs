//! Mocks and fixtures shared by salesflow tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use serde_json::{json, Value};

use salesflow_core::config::ModelConfig;
use salesflow_core::error::{Result, SalesflowError};
use salesflow_core::lead::LeadRecord;
use salesflow_core::traits::LlmClient;
use salesflow_core::types::{ChatMessage, StopReason, StreamDelta};
use salesflow_flow::{CollaboratorGateway, UnitOutput};

enum Scripted {
    Text(String),
    Error(String),
}

/// Scripted LLM client.
///
/// Each `chat_stream` call pops the next scripted response and records the
/// messages and model it was called with. An exhausted script is an error.
#[derive(Clone, Default)]
pub struct MockLlm {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    models: Arc<Mutex<Vec<String>>>,
    usage: Option<(u64, u64)>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a usage delta of `(input, output)` tokens after every text response.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some((input_tokens, output_tokens));
        self
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.script.lock().unwrap().push_back(Scripted::Text(text.into()));
    }

    /// The next call fails before streaming.
    pub fn push_error(&self, message: impl Into<String>) {
        self.script.lock().unwrap().push_back(Scripted::Error(message.into()));
    }

    /// Messages of every call so far.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }

    /// Model id of every call so far.
    pub fn models(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }
}

impl LlmClient for MockLlm {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.requests.lock().unwrap().push(messages);
        self.models.lock().unwrap().push(config.model_id.clone());
        let next = self.script.lock().unwrap().pop_front();
        let usage = self.usage;

        Box::pin(async move {
            match next {
                Some(Scripted::Text(text)) => {
                    // Split so callers have to join deltas
                    let mid = text
                        .char_indices()
                        .map(|(i, _)| i)
                        .nth(text.chars().count() / 2)
                        .unwrap_or(0);
                    let mut deltas = vec![
                        Ok(StreamDelta::TextDelta(text[..mid].to_string())),
                        Ok(StreamDelta::TextDelta(text[mid..].to_string())),
                        Ok(StreamDelta::Stop(StopReason::EndTurn)),
                    ];
                    if let Some((input_tokens, output_tokens)) = usage {
                        deltas.push(Ok(StreamDelta::Usage {
                            input_tokens,
                            output_tokens,
                        }));
                    }
                    Ok(Box::pin(stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
                }
                Some(Scripted::Error(message)) => Err(SalesflowError::LlmRequest(message)),
                None => Err(SalesflowError::LlmRequest(
                    "no scripted response left".to_string(),
                )),
            }
        })
    }
}

type UnitFn = dyn Fn(&str, Value) -> Result<UnitOutput> + Send + Sync;

/// Collaborator gateway driven by a closure of `(unit, context)`.
///
/// Batches use the trait's sequential default.
pub struct StubGateway {
    handler: Box<UnitFn>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl StubGateway {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, Value) -> Result<UnitOutput> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(unit, context)` of every call so far.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CollaboratorGateway for StubGateway {
    fn execute_unit<'a>(&'a self, unit: &'a str, context: Value) -> BoxFuture<'a, Result<UnitOutput>> {
        self.calls
            .lock()
            .unwrap()
            .push((unit.to_string(), context.clone()));
        let result = (self.handler)(unit, context);
        Box::pin(async move { result })
    }
}

/// The lead used throughout the pipeline tests.
pub fn sample_lead() -> LeadRecord {
    LeadRecord {
        name: "Jo\u{e3}o Moura".to_string(),
        job_title: "Director of Engineering".to_string(),
        company: "Clearbit".to_string(),
        email: "joao@clearbit.com".to_string(),
        use_case: Some("Using AI Agent to do better data enrichment.".to_string()),
    }
}

/// A scoring crew result for [`sample_lead`] with the given score.
pub fn scoring_result_json(score: u64) -> Value {
    json!({
        "personal_info": {
            "name": "Jo\u{e3}o Moura",
            "job_title": "Director of Engineering",
            "role_relevance": 9,
            "professional_background": "Leads data engineering teams"
        },
        "company_info": {
            "company_name": "Clearbit",
            "industry": "Data enrichment",
            "company_size": 250,
            "revenue": null,
            "market_presence": 8
        },
        "lead_score": {
            "score": score,
            "scoring_criteria": ["Decision-making role", "Strong use case fit"],
            "validation_notes": "Verified via company site"
        }
    })
}
