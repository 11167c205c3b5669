//! Activation predicates for conditional steps.
//!
//! A step's condition is an externally bound callable evaluated against the
//! merged variable set once all dependencies are satisfied. The scheduler
//! only sees the [`ActivationPredicate`] capability trait and never depends
//! on how the predicate is compiled or isolated.
//!
//! [`JexlPredicate`] is the built-in implementation, wrapping
//! `jexl_eval::Evaluator` with a small set of pre-registered transforms.
//! Variable values are always passed as a context object, NEVER interpolated
//! into the expression string.

use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during predicate evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("evaluation failed: {0}")]
    EvalFailed(String),

    /// A predicate must produce a boolean; anything else is a fatal
    /// configuration error, never coerced.
    #[error("condition did not evaluate to a boolean: got {value}")]
    NotBoolean { value: Value },
}

// ---------------------------------------------------------------------------
// ActivationPredicate
// ---------------------------------------------------------------------------

/// Capability interface for step conditions.
pub trait ActivationPredicate: Send + Sync {
    /// Evaluate the predicate against the merged variable set.
    fn evaluate(&self, vars: &Map<String, Value>) -> Result<bool, PredicateError>;
}

/// Plain closures work as predicates, which keeps tests and embedders free
/// of wrapper types.
impl<F> ActivationPredicate for F
where
    F: Fn(&Map<String, Value>) -> Result<bool, PredicateError> + Send + Sync,
{
    fn evaluate(&self, vars: &Map<String, Value>) -> Result<bool, PredicateError> {
        self(vars)
    }
}

// ---------------------------------------------------------------------------
// JexlPredicate
// ---------------------------------------------------------------------------

/// JEXL-backed activation predicate.
///
/// The evaluator is rebuilt per evaluation: transforms hold non-`Sync`
/// closures, and predicates must be shareable across concurrently completing
/// branches.
pub struct JexlPredicate {
    expression: String,
}

impl JexlPredicate {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl ActivationPredicate for JexlPredicate {
    fn evaluate(&self, vars: &Map<String, Value>) -> Result<bool, PredicateError> {
        let context = Value::Object(vars.clone());
        let result = evaluator()
            .eval_in_context(&self.expression, &context)
            .map_err(|e| PredicateError::EvalFailed(e.to_string()))?;

        match result {
            Value::Bool(b) => Ok(b),
            other => Err(PredicateError::NotBoolean { value: other }),
        }
    }
}

/// Build a JEXL evaluator with the standard transforms registered.
fn evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("lower", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_lowercase()))
        })
        .with_transform("upper", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_uppercase()))
        })
        .with_transform("trim", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.trim()))
        })
        .with_transform("contains", |args: &[Value]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.contains(search)))
        })
        .with_transform("length", |args: &[Value]| {
            let val = args.first().cloned().unwrap_or(Value::Null);
            let len = match &val {
                Value::String(s) => s.len(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
