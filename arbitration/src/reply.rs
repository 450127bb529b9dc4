//! Parsing of free-text model replies
//!
//! Models are asked for JSON but frequently wrap it in a markdown fence or
//! surround it with prose. Anything that is not JSON is taken as plain
//! answer text.

use serde::Deserialize;
use serde_json::Value;

use crate::backend::{ModelCallError, ModelReply};
use crate::types::SolverDetails;

/// Strip a markdown code fence and parse the first JSON object in `raw`
pub fn extract_json(raw: &str) -> Option<Value> {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    let text = text.trim();

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    // Prose around the object: try the outermost braces
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct SolverJson {
    final_answer: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(flatten)]
    details: SolverDetails,
}

/// A solver's answer extracted from its reply
#[derive(Debug, Clone, PartialEq)]
pub struct SolverReply {
    pub answer: String,
    pub confidence: Option<f64>,
    pub details: SolverDetails,
}

impl SolverReply {
    /// Parse a solver reply. The structured confidence wins over the
    /// transport-level one.
    pub fn parse(reply: &ModelReply) -> Result<Self, ModelCallError> {
        let parsed = extract_json(&reply.text)
            .and_then(|value| serde_json::from_value::<SolverJson>(value).ok());

        let (answer, confidence, details) = match parsed {
            Some(json) => (
                json.final_answer,
                json.confidence.or(reply.confidence),
                json.details,
            ),
            None => (reply.text.clone(), reply.confidence, SolverDetails::default()),
        };

        let answer = answer.trim().to_string();
        if answer.is_empty() {
            return Err(ModelCallError::Malformed("empty answer".to_string()));
        }

        Ok(Self {
            answer,
            confidence: confidence.filter(|c| c.is_finite()).map(|c| c.clamp(0.0, 1.0)),
            details,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RebuttalJson {
    #[serde(default)]
    critique: Option<Value>,
    final_answer: String,
    #[serde(default)]
    confidence: Option<f64>,
}

/// A critique plus revised answer extracted from a rebuttal reply
#[derive(Debug, Clone, PartialEq)]
pub struct RebuttalReply {
    pub critique: String,
    pub answer: String,
    pub confidence: Option<f64>,
}

impl RebuttalReply {
    pub fn parse(reply: &ModelReply) -> Result<Self, ModelCallError> {
        let parsed = extract_json(&reply.text)
            .and_then(|value| serde_json::from_value::<RebuttalJson>(value).ok());

        let (critique, answer, confidence) = match parsed {
            Some(json) => (
                json.critique.map(critique_text).unwrap_or_default(),
                json.final_answer,
                json.confidence.or(reply.confidence),
            ),
            None => (String::new(), reply.text.clone(), reply.confidence),
        };

        let answer = answer.trim().to_string();
        if answer.is_empty() {
            return Err(ModelCallError::Malformed("empty revision".to_string()));
        }

        Ok(Self {
            critique,
            answer,
            confidence: confidence.filter(|c| c.is_finite()).map(|c| c.clamp(0.0, 1.0)),
        })
    }
}

// Critiques arrive either as a paragraph or as a list of points
fn critique_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Pull a score in `[0, 1]` out of an arbiter reply: either `{"score": x}`
/// or the first number in the text.
pub fn parse_score(text: &str) -> Option<f64> {
    if let Some(value) = extract_json(text) {
        if let Some(score) = value.get("score").and_then(Value::as_f64) {
            return Some(score);
        }
    }
    text.split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .filter(|tok| !tok.is_empty() && tok.chars().any(|c| c.is_ascii_digit()))
        .find_map(|tok| tok.parse::<f64>().ok())
}
