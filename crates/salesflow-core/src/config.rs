use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SalesflowError};
use crate::lead::LeadRecord;

/// Crew that scores each lead.
pub const LEAD_SCORING_CREW: &str = "lead_scoring";
/// Crew that drafts one email per qualifying lead.
pub const EMAIL_WRITING_CREW: &str = "email_writing";

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SALESFLOW_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "salesflow.toml";

/// Top-level salesflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub leads: Vec<LeadRecord>,
    #[serde(default)]
    pub crews: BTreeMap<String, CrewSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            extra_headers: HashMap::new(),
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model_id() -> String { "gpt-4o-mini".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Pipeline knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Leads must score strictly above this to get an email.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: u8,
    /// Directory for CSV/JSON artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub fan: FanConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
            output_dir: default_output_dir(),
            fan: FanConfig::default(),
        }
    }
}

fn default_score_threshold() -> u8 { 70 }
fn default_output_dir() -> String { "outputs".to_string() }

/// How per-item work is dispatched during a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    Sequential,
    #[default]
    Concurrent,
}

/// Fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FanConfig {
    #[serde(default)]
    pub mode: FanMode,
    /// Upper bound on in-flight items in concurrent mode.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Abort the whole fan-out on the first item failure.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            mode: FanMode::default(),
            max_concurrency: default_max_concurrency(),
            fail_fast: false,
        }
    }
}

fn default_max_concurrency() -> usize { 4 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <output_dir>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-step, 3 = per fan-out item (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// A crew: named agents plus an ordered task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrewSpec {
    #[serde(default)]
    pub description: Option<String>,
    pub agents: BTreeMap<String, AgentSpec>,
    pub tasks: Vec<TaskSpec>,
}

/// Persona of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub role: String,
    pub goal: String,
    pub backstory: String,
    /// Per-agent model override.
    #[serde(default)]
    pub model: Option<ModelConfig>,
}

/// Expected shape of a task's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Raw,
    Json,
}

/// One task within a crew.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub name: String,
    pub agent: String,
    pub description: String,
    pub expected_output: String,
    /// Earlier tasks whose output feeds this one. Empty = the previous task.
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub output: OutputFormat,
    /// Top-level keys a `json` output must carry.
    #[serde(default)]
    pub required_keys: Vec<String>,
}

impl CrewSpec {
    /// Check agent references and task ordering.
    pub fn validate(&self, crew: &str) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(SalesflowError::Config(format!(
                "crew '{}' declares no tasks",
                crew
            )));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for task in &self.tasks {
            if !self.agents.contains_key(&task.agent) {
                return Err(SalesflowError::Config(format!(
                    "crew '{}': task '{}' uses unknown agent '{}'",
                    crew, task.name, task.agent
                )));
            }
            for ctx in &task.context {
                if !seen.contains(ctx.as_str()) {
                    return Err(SalesflowError::Config(format!(
                        "crew '{}': task '{}' takes context from '{}', which is not an earlier task",
                        crew, task.name, ctx
                    )));
                }
            }
            if !task.required_keys.is_empty() && task.output != OutputFormat::Json {
                return Err(SalesflowError::Config(format!(
                    "crew '{}': task '{}' lists required_keys but its output is not json",
                    crew, task.name
                )));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(SalesflowError::Config(format!(
                    "crew '{}': duplicate task name '{}'",
                    crew, task.name
                )));
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SalesflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let mut config: Self =
            toml::from_str(&expanded).map_err(|e| SalesflowError::Config(e.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from the path in `SALESFLOW_CONFIG`, falling back to `salesflow.toml`.
    pub fn from_env() -> Result<Self> {
        Self::load(&Self::config_path())
    }

    /// The config path the environment points at.
    pub fn config_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// `SALESFLOW_MODEL` replaces the model id; `OPENAI_API_KEY` fills a missing key.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("SALESFLOW_MODEL") {
            if !model.is_empty() {
                self.model.model_id = model;
            }
        }
        let key_missing = self
            .model
            .api_key
            .as_ref()
            .map_or(true, |k| k.is_empty() || k.starts_with("${"));
        if key_missing {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.model.api_key = Some(key);
            }
        }
    }

    /// Fail fast on wiring the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.score_threshold > 100 {
            return Err(SalesflowError::Config(format!(
                "pipeline.score_threshold must be within 0..=100, got {}",
                self.pipeline.score_threshold
            )));
        }
        if self.pipeline.fan.max_concurrency == 0 {
            return Err(SalesflowError::Config(
                "pipeline.fan.max_concurrency must be at least 1".into(),
            ));
        }
        for required in [LEAD_SCORING_CREW, EMAIL_WRITING_CREW] {
            if !self.crews.contains_key(required) {
                return Err(SalesflowError::Config(format!(
                    "missing crew '{}'",
                    required
                )));
            }
        }
        for (name, crew) in &self.crews {
            crew.validate(name)?;
        }
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.pipeline.output_dir)
    }

    /// Resolve the run log directory, if run logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref()?;
        if !log.enabled {
            return None;
        }
        Some(
            log.log_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.output_dir().join("logs")),
        )
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
