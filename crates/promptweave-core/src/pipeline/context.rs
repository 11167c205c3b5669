//! Branch-local execution context and the merge algebra over it.
//!
//! Each in-flight branch of a pipeline run carries a [`PipelineContext`]:
//! an opaque, mergeable accumulator. The scheduler combines contexts from
//! concurrently completing dependencies via a left-fold of `merge` in
//! canonical dependency order, so the result is independent of arrival
//! order. The scheduler never mutates a caller's context, only combines
//! copies.

use serde_json::{Map, Value};

use promptweave_types::result::HistoryEntry;

use super::merge::ordered_merge;

// ---------------------------------------------------------------------------
// PipelineContext
// ---------------------------------------------------------------------------

/// The caller-supplied mergeable accumulator flowing through a run.
pub trait PipelineContext: Clone + Send + Sync + 'static {
    /// Associative combination of two branch contexts. Folding the final
    /// per-dependency contexts in canonical order must yield the same value
    /// regardless of which dependency resolved first.
    fn merge(&self, other: &Self) -> Self;

    /// Variable view used for predicate evaluation and prompt rendering.
    fn variables(&self) -> &Map<String, Value>;
}

/// Overlay `over` onto `base`, key-wise; `over` wins on conflicts.
pub fn overlay_variables(base: &Map<String, Value>, over: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (k, v) in over {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// The runner's concrete context: executed-step history plus accumulated
/// variables.
///
/// History is kept in canonical order (see [`HistoryEntry::canonical_cmp`])
/// so that merging two branches is an ordered merge; variables combine by
/// key-wise overlay where the right side wins.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub history: Vec<HistoryEntry>,
    pub variables: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_variables(variables: Map<String, Value>) -> Self {
        Self {
            history: Vec::new(),
            variables,
        }
    }

    /// Record an executed step, keeping history in canonical order.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.history = ordered_merge(&self.history, &[entry], HistoryEntry::canonical_cmp);
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }
}

impl PipelineContext for ExecutionContext {
    fn merge(&self, other: &Self) -> Self {
        Self {
            history: ordered_merge(&self.history, &other.history, HistoryEntry::canonical_cmp),
            variables: overlay_variables(&self.variables, &other.variables),
        }
    }

    fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use promptweave_types::content::ContentPart;
    use serde_json::json;

    fn entry(step: &str) -> HistoryEntry {
        HistoryEntry {
            step: step.to_string(),
            prompt: vec![ContentPart::text("p")],
            output: vec![ContentPart::text("o")],
        }
    }

    #[test]
    fn test_record_keeps_canonical_order() {
        let mut ctx = ExecutionContext::new();
        ctx.record(entry("b"));
        ctx.record(entry("a"));
        let ids: Vec<&str> = ctx.history.iter().map(|e| e.step.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_merge_shared_prefix() {
        let mut base = ExecutionContext::new();
        base.record(entry("a"));

        let mut left = base.clone();
        left.record(entry("b"));
        let mut right = base.clone();
        right.record(entry("c"));

        let merged = left.merge(&right);
        let ids: Vec<&str> = merged.history.iter().map(|e| e.step.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        // Arrival order must not matter.
        let flipped = right.merge(&left);
        let flipped_ids: Vec<&str> = flipped.history.iter().map(|e| e.step.as_str()).collect();
        assert_eq!(ids, flipped_ids);
    }

    #[test]
    fn test_variable_overlay_right_wins() {
        let mut left = ExecutionContext::new();
        left.set_var("shared", json!("left"));
        left.set_var("only_left", json!(1));
        let mut right = ExecutionContext::new();
        right.set_var("shared", json!("right"));
        right.set_var("only_right", json!(2));

        let merged = left.merge(&right);
        assert_eq!(merged.variables["shared"], json!("right"));
        assert_eq!(merged.variables["only_left"], json!(1));
        assert_eq!(merged.variables["only_right"], json!(2));
    }

    #[test]
    fn test_merge_idempotent() {
        let mut a = ExecutionContext::new();
        a.record(entry("a"));
        a.set_var("k", json!(1));
        let merged = a.merge(&a);
        assert_eq!(merged.history.len(), 1);
        assert_eq!(merged.variables["k"], json!(1));
    }
}
