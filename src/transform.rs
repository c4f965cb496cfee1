//! Per-stage business logic.
//!
//! The dispatch core only sees the [`StageTransform`] capability; the four
//! implementations here are the stock text pipeline.

use crate::error::TransformError;
use crate::io_struct::{Analysis, LocalResult, Payload, WordCount};
use std::collections::HashMap;
use std::fmt::Debug;
use tracing::info;

pub const TOP_WORDS: usize = 10;

/// Output of a transform: the payload to forward plus whatever the stage
/// contributes to the result on the way back.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub payload: Payload,
    pub local: LocalResult,
}

pub trait StageTransform: Send + Sync + Debug {
    fn apply(&self, payload: Payload) -> Result<Transformed, TransformError>;
}

fn expect_text(payload: Payload) -> Result<String, TransformError> {
    match payload {
        Payload::Text(text) => Ok(text),
        other => Err(TransformError::WrongPayload {
            expected: "text",
            found: other.kind(),
        }),
    }
}

/// Ingress stage: forwards the raw text untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl StageTransform for Passthrough {
    fn apply(&self, payload: Payload) -> Result<Transformed, TransformError> {
        let text = expect_text(payload)?;
        Ok(Transformed {
            payload: Payload::Text(text),
            local: LocalResult::message("Pipeline completed"),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Clean;

impl StageTransform for Clean {
    fn apply(&self, payload: Payload) -> Result<Transformed, TransformError> {
        let text = expect_text(payload)?;
        let cleaned = clean_text(&text);
        info!(
            "Cleaned text: {} -> {} characters",
            text.len(),
            cleaned.len()
        );
        Ok(Transformed {
            payload: Payload::Text(cleaned),
            local: LocalResult::message("Preprocessing completed"),
        })
    }
}

/// Lowercases, keeps only `[a-z0-9]` and whitespace, and collapses whitespace runs.
pub fn clean_text(text: &str) -> String {
    let kept: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy)]
pub struct Analyze {
    pub top_n: usize,
}

impl Default for Analyze {
    fn default() -> Self {
        Analyze { top_n: TOP_WORDS }
    }
}

impl StageTransform for Analyze {
    fn apply(&self, payload: Payload) -> Result<Transformed, TransformError> {
        let text = expect_text(payload)?;
        let analysis = analyze_text(&text, self.top_n);
        info!(
            "Word count: {}, unique words: {}",
            analysis.word_count, analysis.unique_words
        );
        Ok(Transformed {
            local: LocalResult {
                message: "Analysis completed".to_string(),
                word_count: Some(analysis.word_count),
                report: None,
                top_words: Some(analysis.top_words.clone()),
            },
            payload: Payload::Analysis(analysis),
        })
    }
}

/// Counts whitespace-separated words. `top_words` is ordered by count,
/// descending; equal counts keep the order in which words first appeared.
pub fn analyze_text(text: &str, top_n: usize) -> Analysis {
    let mut order: Vec<WordCount> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut word_count = 0u64;

    for word in text.split_whitespace() {
        word_count += 1;
        match index.get(word) {
            Some(&i) => order[i].1 += 1,
            None => {
                index.insert(word, order.len());
                order.push((word.to_string(), 1));
            }
        }
    }

    let unique_words = order.len() as u64;
    let word_frequencies = order.iter().cloned().collect();
    let mut top_words = order;
    // stable: ties stay in first-seen order
    top_words.sort_by(|a, b| b.1.cmp(&a.1));
    top_words.truncate(top_n);

    Analysis {
        word_count,
        top_words,
        word_frequencies,
        unique_words,
    }
}

/// Terminal stage: renders the analysis as a text report.
#[derive(Debug, Default, Clone, Copy)]
pub struct Report;

impl StageTransform for Report {
    fn apply(&self, payload: Payload) -> Result<Transformed, TransformError> {
        let analysis = match payload {
            Payload::Analysis(analysis) => analysis,
            other => {
                return Err(TransformError::WrongPayload {
                    expected: "analysis",
                    found: other.kind(),
                });
            }
        };
        let report = generate_report(&analysis);
        info!("Generated report with {} top words", analysis.top_words.len());
        Ok(Transformed {
            local: LocalResult {
                message: "Report generated successfully".to_string(),
                word_count: Some(analysis.word_count),
                report: Some(report),
                top_words: Some(analysis.top_words.clone()),
            },
            payload: Payload::Analysis(analysis),
        })
    }
}

pub fn generate_report(analysis: &Analysis) -> String {
    let rule = "=".repeat(70);
    let mut lines = vec![
        rule.clone(),
        "TEXT ANALYSIS REPORT".to_string(),
        rule.clone(),
        format!("Total Words: {}", analysis.word_count),
        format!("Unique Words: {}", analysis.unique_words),
        String::new(),
    ];

    if !analysis.top_words.is_empty() {
        lines.push("Top 10 Most Frequent Words:".to_string());
        lines.push("-".repeat(70));
        for (i, (word, count)) in analysis.top_words.iter().enumerate() {
            let percentage = if analysis.word_count > 0 {
                *count as f64 / analysis.word_count as f64 * 100.0
            } else {
                0.0
            };
            lines.push(format!(
                "{:>2}. {:<20} - {:>5} occurrences ({:>5.2}%)",
                i + 1,
                word,
                count,
                percentage
            ));
        }
    }

    lines.push(rule);
    lines.join("\n")
}
