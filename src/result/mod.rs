//! Parsing of inference endpoint payloads.
//!
//! Two model deployments are in service and they reply differently:
//!
//! - [`ResultShape::Classes`]: `{"predicted_classes": [...], "probabilities": [...]}`,
//!   re-keyed to `{"predictionResult": [...], "probabilities": [...]}`.
//! - [`ResultShape::Ranked`]: a bare array of per-class objects, passed through.
//!
//! The shape is configured per deployment. Payloads are never sniffed, so a
//! reply in the other shape is a [`PipelineError::MalformedResult`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::warn;

use crate::error::PipelineError;
use crate::inference::InferenceResponse;

/// Expected layout of the endpoint's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// Object with parallel `predicted_classes` / `probabilities` arrays.
    Classes,
    /// Ordered array of per-class result objects.
    Ranked,
}

impl fmt::Display for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultShape::Classes => write!(f, "classes"),
            ResultShape::Ranked => write!(f, "ranked"),
        }
    }
}

impl FromStr for ResultShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "classes" | "a" => Ok(ResultShape::Classes),
            "ranked" | "b" => Ok(ResultShape::Ranked),
            other => Err(format!(
                "unknown result shape '{other}' (expected 'classes' or 'ranked')"
            )),
        }
    }
}

/// Labels with their scores, in the endpoint's order.
///
/// Scores stay as JSON numbers so they serialize exactly as the endpoint
/// wrote them (`1` stays `1`, long mantissas keep every digit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScores {
    #[serde(rename = "predictionResult")]
    pub labels: Vec<Value>,
    pub probabilities: Vec<Number>,
}

/// Normalized prediction, serialized exactly as downstream consumers read it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictionResult {
    Classes(ClassScores),
    Ranked(Vec<Value>),
}

impl PredictionResult {
    pub fn shape(&self) -> ResultShape {
        match self {
            PredictionResult::Classes(_) => ResultShape::Classes,
            PredictionResult::Ranked(_) => ResultShape::Ranked,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PredictionResult::Classes(scores) => serde_json::json!({
                "predictionResult": scores.labels,
                "probabilities": scores.probabilities,
            }),
            PredictionResult::Ranked(items) => Value::Array(items.clone()),
        }
    }

    pub fn to_json_string(&self) -> Result<String, PipelineError> {
        serde_json::to_string(self)
            .map_err(|e| PipelineError::MalformedResult(format!("failed to serialize result: {e}")))
    }
}

#[derive(Deserialize)]
struct RawClassScores {
    predicted_classes: Vec<Value>,
    probabilities: Vec<Number>,
}

/// Parse an endpoint reply in the given shape.
///
/// Either the whole payload is accepted or an error is returned; there is
/// no partial result.
pub fn parse(raw: &InferenceResponse, shape: ResultShape) -> Result<PredictionResult, PipelineError> {
    let value: Value = serde_json::from_str(raw.as_str())
        .map_err(|e| PipelineError::MalformedResult(format!("invalid JSON: {e}")))?;

    match shape {
        ResultShape::Classes => parse_classes(value).map(PredictionResult::Classes),
        ResultShape::Ranked => match value {
            Value::Array(items) => Ok(PredictionResult::Ranked(items)),
            other => Err(PipelineError::MalformedResult(format!(
                "expected a JSON array, got {}",
                json_type(&other)
            ))),
        },
    }
}

fn parse_classes(value: Value) -> Result<ClassScores, PipelineError> {
    if !value.is_object() {
        return Err(PipelineError::MalformedResult(format!(
            "expected a JSON object, got {}",
            json_type(&value)
        )));
    }
    let raw: RawClassScores = serde_json::from_value(value)
        .map_err(|e| PipelineError::MalformedResult(e.to_string()))?;

    if raw.predicted_classes.len() != raw.probabilities.len() {
        return Err(PipelineError::MalformedResult(format!(
            "{} predicted classes but {} probabilities",
            raw.predicted_classes.len(),
            raw.probabilities.len()
        )));
    }
    // Out-of-range scores are reported but accepted.
    let in_range = |p: &Number| p.as_f64().is_some_and(|p| (0.0..=1.0).contains(&p));
    if !raw.probabilities.iter().all(in_range) {
        let shown: Vec<String> = raw.probabilities.iter().map(ToString::to_string).collect();
        warn!(probabilities = ?shown, "probability outside [0, 1]");
    }

    Ok(ClassScores {
        labels: raw.predicted_classes,
        probabilities: raw.probabilities,
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
