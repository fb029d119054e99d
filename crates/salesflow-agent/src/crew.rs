use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info};

use salesflow_core::config::{AgentSpec, CrewSpec, ModelConfig, OutputFormat, TaskSpec};
use salesflow_core::error::{Result, SalesflowError};
use salesflow_core::traits::LlmClient;
use salesflow_core::types::{ChatMessage, StreamDelta, TokenUsage};
use salesflow_flow::UnitOutput;

use crate::output::parse_structured;

/// Output of one task.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub task: String,
    pub raw: String,
    pub structured: Option<Value>,
    pub usage: TokenUsage,
}

/// Output of a whole crew run; the last task's output is the crew's answer.
#[derive(Debug, Clone)]
pub struct CrewOutput {
    pub tasks: Vec<TaskOutput>,
    pub usage: TokenUsage,
}

impl CrewOutput {
    pub fn final_output(&self) -> Option<&TaskOutput> {
        self.tasks.last()
    }

    pub fn into_unit_output(mut self) -> UnitOutput {
        let usage = self.usage;
        match self.tasks.pop() {
            Some(last) => UnitOutput {
                raw: last.raw,
                structured: last.structured,
                usage,
            },
            None => UnitOutput::default().with_usage(usage),
        }
    }
}

/// A configured crew bound to an LLM client.
///
/// Tasks run in declaration order, one LLM call each.
pub struct Crew {
    name: String,
    spec: CrewSpec,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl Crew {
    pub fn new(
        name: impl Into<String>,
        spec: CrewSpec,
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            llm,
            model,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &CrewSpec {
        &self.spec
    }

    /// Run every task against `inputs`.
    pub async fn kickoff(&self, inputs: &Value) -> Result<CrewOutput> {
        info!(crew = %self.name, tasks = self.spec.tasks.len(), "Crew kickoff");
        let mut outputs: Vec<TaskOutput> = Vec::with_capacity(self.spec.tasks.len());
        let mut usage = TokenUsage::default();

        for task in &self.spec.tasks {
            let agent = self.agent(task)?;
            let messages = build_messages(agent, task, inputs, &outputs);
            let model = agent.model.as_ref().unwrap_or(&self.model);

            debug!(crew = %self.name, task = %task.name, agent = %task.agent, "Running task");
            let (raw, task_usage) = self.complete(model, messages).await.map_err(|e| {
                SalesflowError::Execution(format!(
                    "crew '{}' task '{}': {}",
                    self.name, task.name, e
                ))
            })?;
            usage.absorb(&task_usage);

            let structured = match task.output {
                OutputFormat::Json => Some(parse_structured(&raw, &task.required_keys).map_err(
                    |e| {
                        SalesflowError::OutputSchema(format!(
                            "crew '{}' task '{}': {}",
                            self.name, task.name, e
                        ))
                    },
                )?),
                OutputFormat::Raw => None,
            };

            outputs.push(TaskOutput {
                task: task.name.clone(),
                raw,
                structured,
                usage: task_usage,
            });
        }

        info!(crew = %self.name, %usage, "Crew finished");
        Ok(CrewOutput {
            tasks: outputs,
            usage,
        })
    }

    fn agent(&self, task: &TaskSpec) -> Result<&AgentSpec> {
        self.spec.agents.get(&task.agent).ok_or_else(|| {
            SalesflowError::Config(format!(
                "crew '{}': task '{}' uses unknown agent '{}'",
                self.name, task.name, task.agent
            ))
        })
    }

    /// One streamed completion, collected into text and usage.
    async fn complete(
        &self,
        model: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> Result<(String, TokenUsage)> {
        let mut stream = self.llm.chat_stream(model, messages).await?;
        let mut text = String::new();
        let mut usage = TokenUsage {
            requests: 1,
            ..TokenUsage::default()
        };

        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::TextDelta(chunk) => text.push_str(&chunk),
                StreamDelta::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    usage.input_tokens += input_tokens;
                    usage.output_tokens += output_tokens;
                }
                StreamDelta::Stop(_) => {}
            }
        }

        if text.trim().is_empty() {
            return Err(SalesflowError::LlmStream("empty response".to_string()));
        }
        Ok((text, usage))
    }
}

/// System persona plus the task prompt, with context from earlier tasks.
pub fn build_messages(
    agent: &AgentSpec,
    task: &TaskSpec,
    inputs: &Value,
    prior: &[TaskOutput],
) -> Vec<ChatMessage> {
    let system = format!(
        "You are {}. {}\nYour personal goal is: {}",
        agent.role.trim(),
        agent.backstory.trim(),
        agent.goal.trim()
    );

    let mut prompt = format!(
        "Current Task: {}\n\nThis is the expected criteria for your final answer: {}\n\
         You MUST return the actual complete content as the final answer, not a summary.",
        interpolate(&task.description, inputs),
        interpolate(&task.expected_output, inputs)
    );

    if task.output == OutputFormat::Json {
        prompt.push_str("\nRespond with a single JSON object and nothing else.");
        if !task.required_keys.is_empty() {
            prompt.push_str(&format!(
                " It must contain the top-level keys: {}.",
                task.required_keys.join(", ")
            ));
        }
    }

    let context: Vec<&str> = if task.context.is_empty() {
        prior.last().map(|o| o.raw.as_str()).into_iter().collect()
    } else {
        task.context
            .iter()
            .filter_map(|name| prior.iter().find(|o| &o.task == name))
            .map(|o| o.raw.as_str())
            .collect()
    };
    if !context.is_empty() {
        prompt.push_str("\n\nThis is the context you're working with:\n");
        prompt.push_str(&context.join("\n\n----------\n\n"));
    }

    vec![ChatMessage::system(system), ChatMessage::user(prompt)]
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"))
}

/// Replace `{key}` with the matching top-level input. Strings are inserted
/// verbatim, other values as compact JSON. Unknown keys are left untouched.
pub fn interpolate(template: &str, inputs: &Value) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures| {
            match inputs.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
