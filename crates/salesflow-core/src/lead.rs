//! Lead records exchanged between the pipeline's steps.
//!
//! Scoring output comes back from an LLM crew as JSON. It is deserialized
//! into [`LeadScoringResult`] and then range-checked with
//! [`LeadScoringResult::validate`] before anything downstream reads it.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SalesflowError};

/// A raw lead as pulled from the lead source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub name: String,
    pub job_title: String,
    pub company: String,
    pub email: String,
    #[serde(default)]
    pub use_case: Option<String>,
}

impl LeadRecord {
    /// The input object the scoring crew expects: `{"lead_data": {...}}`.
    pub fn to_crew_input(&self) -> serde_json::Value {
        serde_json::json!({ "lead_data": self })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadPersonalInfo {
    pub name: String,
    pub job_title: String,
    /// How relevant the lead's role is to the buying decision (0-10).
    pub role_relevance: u8,
    #[serde(default)]
    pub professional_background: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub company_name: String,
    pub industry: String,
    /// Employee count.
    pub company_size: u64,
    #[serde(default)]
    pub revenue: Option<f64>,
    /// Market presence score (0-10).
    pub market_presence: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadScore {
    /// Final score (0-100).
    pub score: u8,
    pub scoring_criteria: Vec<String>,
    #[serde(default)]
    pub validation_notes: Option<String>,
}

/// Structured result of the lead scoring crew.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadScoringResult {
    pub personal_info: LeadPersonalInfo,
    pub company_info: CompanyInfo,
    pub lead_score: LeadScore,
}

impl LeadScoringResult {
    /// Deserialize and validate a crew output.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let result: Self = serde_json::from_value(value.clone())
            .map_err(|e| SalesflowError::OutputSchema(format!("LeadScoringResult: {}", e)))?;
        result.validate()?;
        Ok(result)
    }

    /// Check the numeric ranges the schema declares.
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();
        if self.lead_score.score > 100 {
            issues.push(format!("score {} exceeds 100", self.lead_score.score));
        }
        if self.personal_info.role_relevance > 10 {
            issues.push(format!(
                "role_relevance {} exceeds 10",
                self.personal_info.role_relevance
            ));
        }
        if self.company_info.market_presence > 10 {
            issues.push(format!(
                "market_presence {} exceeds 10",
                self.company_info.market_presence
            ));
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(SalesflowError::OutputSchema(issues.join("; ")))
        }
    }

    pub fn score(&self) -> u8 {
        self.lead_score.score
    }

    /// One flat row for tabular output.
    pub fn to_row(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut row = serde_json::Map::new();
        let p = &self.personal_info;
        let c = &self.company_info;
        let s = &self.lead_score;
        row.insert("name".into(), p.name.clone().into());
        row.insert("job_title".into(), p.job_title.clone().into());
        row.insert("role_relevance".into(), p.role_relevance.into());
        row.insert(
            "professional_background".into(),
            p.professional_background.clone().into(),
        );
        row.insert("company_name".into(), c.company_name.clone().into());
        row.insert("industry".into(), c.industry.clone().into());
        row.insert("company_size".into(), c.company_size.into());
        row.insert("revenue".into(), c.revenue.into());
        row.insert("market_presence".into(), c.market_presence.into());
        row.insert("lead_score".into(), s.score.into());
        row.insert("scoring_criteria".into(), s.scoring_criteria.join(", ").into());
        row.insert("validation_notes".into(), s.validation_notes.clone().into());
        row
    }
}

/// One generated outreach email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub lead_name: String,
    pub content: String,
    #[serde(default)]
    pub token_usage: crate::types::TokenUsage,
}
