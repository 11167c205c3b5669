//! Pipeline run results: history entries, terminal results, and streamed
//! updates.
//!
//! [`HistoryEntry`] carries the canonical total order that makes merging
//! history branches from concurrently completing steps deterministic.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{ContentPart, OutputValue};
use crate::model::TokenUsage;

/// One executed step: the rendered prompt and the extracted output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Step-instance identifier (`id`, or `id#n` for loop iteration n > 1).
    pub step: String,
    pub prompt: Vec<ContentPart>,
    pub output: Vec<ContentPart>,
}

impl HistoryEntry {
    /// Canonical total order over history entries: by step id, then prompt
    /// length, then prompt parts element-by-element, then output by the
    /// same rule.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.step
            .cmp(&other.step)
            .then_with(|| cmp_parts(&self.prompt, &other.prompt))
            .then_with(|| cmp_parts(&self.output, &other.output))
    }
}

fn cmp_parts(a: &[ContentPart], b: &[ContentPart]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| {
        for (x, y) in a.iter().zip(b.iter()) {
            let ord = x.canonical_cmp(y);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    })
}

/// The terminal result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Final output of the single leaf step, absent on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputValue>,
    /// Terminal error message, absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Canonically ordered record of every executed step.
    pub history: Vec<HistoryEntry>,
    pub started_at: DateTime<Utc>,
    pub latency_millis: u64,
    pub token_usage: TokenUsage,
}

impl PipelineResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// An incremental chunk of streamed model output, tagged with the
/// step-instance identifier it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    pub instance: String,
    pub chunk: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(step: &str, prompt: &str, output: &str) -> HistoryEntry {
        HistoryEntry {
            step: step.to_string(),
            prompt: vec![ContentPart::text(prompt)],
            output: vec![ContentPart::text(output)],
        }
    }

    #[test]
    fn test_ordered_by_step_id_first() {
        let a = entry("alpha", "zzz", "zzz");
        let b = entry("beta", "aaa", "aaa");
        assert_eq!(a.canonical_cmp(&b), Ordering::Less);
    }

    #[test]
    fn test_prompt_length_breaks_ties() {
        let short = entry("s", "one", "x");
        let long = HistoryEntry {
            step: "s".into(),
            prompt: vec![ContentPart::text("one"), ContentPart::text("two")],
            output: vec![ContentPart::text("x")],
        };
        assert_eq!(short.canonical_cmp(&long), Ordering::Less);
    }

    #[test]
    fn test_prompt_content_breaks_ties() {
        let a = entry("s", "aaa", "x");
        let b = entry("s", "bbb", "x");
        assert_eq!(a.canonical_cmp(&b), Ordering::Less);
        assert_eq!(a.canonical_cmp(&a), Ordering::Equal);
    }

    #[test]
    fn test_output_compared_last() {
        let a = entry("s", "same", "aaa");
        let b = entry("s", "same", "bbb");
        assert_eq!(a.canonical_cmp(&b), Ordering::Less);
    }
}
