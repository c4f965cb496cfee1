use crate::strategy_lb::InstanceStats;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A `(word, count)` pair, serialized as a two-element JSON array.
pub type WordCount = (String, u64);

/// Stage-specific body of a forward envelope.
///
/// Serialized flattened into the envelope, so a text payload is
/// `{"text": "...", "request_id": "..."}` and an analysis payload is
/// `{"analysis": {...}, "request_id": "..."}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Analysis(Analysis),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Analysis(_) => "analysis",
        }
    }

    /// Rough size used for logging.
    pub fn size_hint(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Analysis(analysis) => analysis.word_frequencies.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct Analysis {
    #[serde(default)]
    pub word_count: u64,
    #[serde(default)]
    pub top_words: Vec<WordCount>,
    /// Per-word counts in the order words first appeared.
    #[serde(default)]
    pub word_frequencies: IndexMap<String, u64>,
    #[serde(default)]
    pub unique_words: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ForwardEnvelope {
    #[serde(flatten)]
    pub payload: Payload,
    pub request_id: String,
}

impl ForwardEnvelope {
    pub fn text(text: impl Into<String>, request_id: impl Into<String>) -> Self {
        ForwardEnvelope {
            payload: Payload::Text(text.into()),
            request_id: request_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResultEnvelope {
    pub status: Status,
    pub message: String,
    pub word_count: u64,
    #[serde(default)]
    pub report: String,
    #[serde(default)]
    pub top_words: Vec<WordCount>,
}

/// A downstream response as parsed off the wire. Every field may be absent;
/// absent fields fall back to the receiving stage's own values.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DownstreamResult {
    pub status: Option<Status>,
    pub message: Option<String>,
    pub word_count: Option<u64>,
    pub report: Option<String>,
    pub top_words: Option<Vec<WordCount>>,
}

/// Fields a stage computed itself.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocalResult {
    pub message: String,
    pub word_count: Option<u64>,
    pub report: Option<String>,
    pub top_words: Option<Vec<WordCount>>,
}

impl LocalResult {
    pub fn message(message: impl Into<String>) -> Self {
        LocalResult {
            message: message.into(),
            ..Default::default()
        }
    }
}

impl ResultEnvelope {
    /// Downstream values win; local values fill whatever the downstream left out.
    pub fn merge(downstream: DownstreamResult, local: LocalResult) -> Self {
        ResultEnvelope {
            status: downstream.status.unwrap_or_default(),
            message: downstream.message.unwrap_or(local.message),
            word_count: downstream.word_count.or(local.word_count).unwrap_or(0),
            report: downstream.report.or(local.report).unwrap_or_default(),
            top_words: downstream.top_words.or(local.top_words).unwrap_or_default(),
        }
    }

    /// Result of a stage with nothing downstream.
    pub fn terminal(local: LocalResult) -> Self {
        ResultEnvelope {
            status: Status::Success,
            message: local.message,
            word_count: local.word_count.unwrap_or(0),
            report: local.report.unwrap_or_default(),
            top_words: local.top_words.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

impl HealthResponse {
    pub fn healthy(service: &str) -> Self {
        HealthResponse {
            status: "healthy".to_string(),
            service: service.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatsSnapshot {
    pub instances: Vec<String>,
    pub stats: BTreeMap<String, InstanceStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_envelope_shape() {
        let envelope = ForwardEnvelope::text("hello world", "abc123");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({"text": "hello world", "request_id": "abc123"}));

        let parsed: ForwardEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_analysis_envelope_parses_partial_analysis() {
        let parsed: ForwardEnvelope = serde_json::from_value(json!({
            "analysis": {"word_count": 3, "top_words": [["a", 2], ["b", 1]]},
            "request_id": "r1"
        }))
        .unwrap();

        match parsed.payload {
            Payload::Analysis(analysis) => {
                assert_eq!(analysis.word_count, 3);
                assert_eq!(analysis.top_words[0], ("a".to_string(), 2));
                assert_eq!(analysis.unique_words, 0);
                assert!(analysis.word_frequencies.is_empty());
            }
            other => panic!("expected analysis payload, got {}", other.kind()),
        }
    }

    #[test]
    fn test_envelope_without_request_id_is_rejected() {
        let parsed = serde_json::from_value::<ForwardEnvelope>(json!({"text": "x"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_merge_prefers_downstream_fields() {
        let downstream = DownstreamResult {
            status: Some(Status::Success),
            message: Some("Report generated successfully".to_string()),
            word_count: Some(9),
            report: Some("r".to_string()),
            top_words: Some(vec![("the".to_string(), 2)]),
        };
        let local = LocalResult {
            message: "Analysis completed".to_string(),
            word_count: Some(1),
            report: None,
            top_words: Some(vec![]),
        };

        let merged = ResultEnvelope::merge(downstream, local);
        assert_eq!(merged.message, "Report generated successfully");
        assert_eq!(merged.word_count, 9);
        assert_eq!(merged.report, "r");
        assert_eq!(merged.top_words, vec![("the".to_string(), 2)]);
    }

    #[test]
    fn test_merge_falls_back_to_local_fields() {
        let local = LocalResult {
            message: "Analysis completed".to_string(),
            word_count: Some(4),
            report: None,
            top_words: Some(vec![("x".to_string(), 4)]),
        };

        let merged = ResultEnvelope::merge(DownstreamResult::default(), local);
        assert_eq!(merged.status, Status::Success);
        assert_eq!(merged.message, "Analysis completed");
        assert_eq!(merged.word_count, 4);
        assert_eq!(merged.report, "");
        assert_eq!(merged.top_words.len(), 1);
    }

    #[test]
    fn test_result_envelope_serializes_top_words_as_pairs() {
        let result = ResultEnvelope::terminal(LocalResult {
            message: "done".to_string(),
            word_count: Some(2),
            report: Some("rep".to_string()),
            top_words: Some(vec![("a".to_string(), 2)]),
        });
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["top_words"], json!([["a", 2]]));
    }
}
