use serde_json::Value;

use salesflow_core::error::{Result, SalesflowError};

/// Heuristic clean-up of model output that should be JSON.
pub struct OutputCleaner;

impl OutputCleaner {
    /// - Strips markdown code fences
    /// - Drops prose around a lone JSON object
    /// - Balances unclosed braces and brackets
    pub fn heuristic_repair(output: &str) -> String {
        let mut result = strip_code_fences(output);

        if !(result.starts_with('{') || result.starts_with('[')) {
            if let (Some(start), Some(end)) = (result.find('{'), result.rfind('}')) {
                if start < end {
                    result = result[start..=end].to_string();
                }
            }
        }

        if result.starts_with('{') || result.starts_with('[') {
            result = balance_braces(&result);
        }
        result
    }
}

/// Parse a structured task output and check its top-level keys.
pub fn parse_structured(raw: &str, required_keys: &[String]) -> Result<Value> {
    let repaired = OutputCleaner::heuristic_repair(raw);
    let value: Value = serde_json::from_str(&repaired)
        .map_err(|e| SalesflowError::OutputSchema(format!("output is not valid JSON: {}", e)))?;

    if required_keys.is_empty() {
        return Ok(value);
    }
    let Some(obj) = value.as_object() else {
        return Err(SalesflowError::OutputSchema(
            "expected a JSON object".to_string(),
        ));
    };
    let missing: Vec<&str> = required_keys
        .iter()
        .filter(|k| !obj.contains_key(k.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(SalesflowError::OutputSchema(format!(
            "missing required keys: {}",
            missing.join(", ")
        )));
    }
    Ok(value)
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip the language tag line (```json, ```text, ...)
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

fn balance_braces(text: &str) -> String {
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    let mut result = text.to_string();
    if in_string {
        result.push('"');
    }
    while let Some(closer) = closers.pop() {
        result.push(closer);
    }
    result
}
