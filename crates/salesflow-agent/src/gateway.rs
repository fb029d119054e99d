use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use salesflow_core::config::{AppConfig, CrewSpec, ModelConfig};
use salesflow_core::error::{Result, SalesflowError};
use salesflow_core::traits::LlmClient;
use salesflow_flow::{CollaboratorGateway, FanExecutor, FanResult, UnitOutput};

use crate::crew::Crew;

/// Collaborator gateway backed by LLM crews, one per declared crew name.
pub struct CrewGateway {
    crews: HashMap<String, Crew>,
    fan: FanExecutor,
}

impl CrewGateway {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: &ModelConfig,
        crews: &BTreeMap<String, CrewSpec>,
    ) -> Self {
        let crews = crews
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    Crew::new(name.clone(), spec.clone(), llm.clone(), model.clone()),
                )
            })
            .collect();
        Self {
            crews,
            fan: FanExecutor::default(),
        }
    }

    /// Build from the loaded config, fanning batches with `[pipeline.fan]`.
    pub fn from_config(config: &AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self::new(llm, &config.model, &config.crews)
            .with_fan(FanExecutor::new(config.pipeline.fan.clone()))
    }

    pub fn with_fan(mut self, fan: FanExecutor) -> Self {
        self.fan = fan;
        self
    }

    pub fn crew(&self, name: &str) -> Result<&Crew> {
        self.crews
            .get(name)
            .ok_or_else(|| SalesflowError::Config(format!("unknown crew '{}'", name)))
    }
}

impl CollaboratorGateway for CrewGateway {
    fn execute_unit<'a>(&'a self, unit: &'a str, context: Value) -> BoxFuture<'a, Result<UnitOutput>> {
        Box::pin(async move {
            let crew = self.crew(unit)?;
            let output = crew.kickoff(&context).await?;
            Ok(output.into_unit_output())
        })
    }

    fn execute_batch<'a>(
        &'a self,
        unit: &'a str,
        items: Vec<Value>,
    ) -> BoxFuture<'a, Result<FanResult<UnitOutput>>> {
        Box::pin(async move {
            let crew = self.crew(unit)?;
            debug!(crew = %unit, items = items.len(), "Crew batch");
            self.fan
                .fan_out(items, |item| async move {
                    crew.kickoff(&item).await.map(|o| o.into_unit_output())
                })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salesflow_core::config::{AgentSpec, FanConfig, FanMode, OutputFormat, TaskSpec};
    use salesflow_test_utils::MockLlm;
    use serde_json::json;

    fn one_task_crews() -> BTreeMap<String, CrewSpec> {
        let mut agents = BTreeMap::new();
        agents.insert(
            "writer".to_string(),
            AgentSpec {
                role: "Writer".into(),
                goal: "Write".into(),
                backstory: "Copywriter".into(),
                model: None,
            },
        );
        let spec = CrewSpec {
            description: None,
            agents,
            tasks: vec![TaskSpec {
                name: "draft".into(),
                agent: "writer".into(),
                description: "Write to {name}".into(),
                expected_output: "An email".into(),
                context: vec![],
                output: OutputFormat::Raw,
                required_keys: vec![],
            }],
        };
        let mut crews = BTreeMap::new();
        crews.insert("email_writing".to_string(), spec);
        crews
    }

    #[tokio::test]
    async fn test_unknown_crew_is_config_error() {
        let gateway = CrewGateway::new(Arc::new(MockLlm::new()), &ModelConfig::default(), &one_task_crews());
        let err = gateway.execute_unit("ghost", json!({})).await.unwrap_err();
        assert!(matches!(err, SalesflowError::Config(_)));
        assert!(gateway.execute_batch("ghost", vec![json!({})]).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_isolates_failing_item() {
        let llm = Arc::new(MockLlm::new());
        llm.push_text("Hi Ana");
        llm.push_error("rate limited");
        llm.push_text("Hi Bo");

        let gateway = CrewGateway::new(llm.clone(), &ModelConfig::default(), &one_task_crews())
            .with_fan(FanExecutor::new(FanConfig {
                mode: FanMode::Sequential,
                ..FanConfig::default()
            }));
        let result = gateway
            .execute_batch(
                "email_writing",
                vec![json!({"name": "Ana"}), json!({"name": "Cy"}), json!({"name": "Bo"})],
            )
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result.get(0).unwrap().as_ok().unwrap().raw, "Hi Ana");
        assert!(result.get(1).unwrap().error().unwrap().message.contains("rate limited"));
        assert_eq!(result.get(2).unwrap().as_ok().unwrap().raw, "Hi Bo");
        assert_eq!(llm.requests().len(), 3);
    }
}
