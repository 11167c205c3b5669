//! Step definitions: the unit of work in a pipeline graph.

use std::fmt;
use std::sync::Arc;

use super::predicate::ActivationPredicate;

/// A unit of work in the pipeline graph.
///
/// `deps` of `None` means "depends on the previous step in declaration
/// order"; an explicit list names the output tokens this step waits for.
/// Virtual steps registered at run time (tool-call round trips) are ordinary
/// `Step`s with synthesized id/deps/output tokens.
#[derive(Clone)]
pub struct Step {
    /// Unique, immutable identity.
    pub id: String,
    /// Output tokens this step depends on; `None` infers the positional
    /// predecessor.
    pub deps: Option<Vec<String>>,
    /// Output token published when this step completes.
    pub output_as: Option<String>,
    /// Activation predicate, evaluated against the merged variable set once
    /// all deps are satisfied.
    pub condition: Option<Arc<dyn ActivationPredicate>>,
    /// Provider to invoke; falls back to the runner default.
    pub provider_label: Option<String>,
    /// Session name for multi-turn conversations spanning steps.
    pub session: Option<String>,
    /// Prompt template, rendered by the external formatter.
    pub prompt: String,
}

impl Step {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deps: None,
            output_as: None,
            condition: None,
            provider_label: None,
            session: None,
            prompt: String::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_deps<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.deps = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn publishes(mut self, token: impl Into<String>) -> Self {
        self.output_as = Some(token.into());
        self
    }

    pub fn when(mut self, condition: Arc<dyn ActivationPredicate>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn via_provider(mut self, label: impl Into<String>) -> Self {
        self.provider_label = Some(label.into());
        self
    }

    pub fn in_session(mut self, name: impl Into<String>) -> Self {
        self.session = Some(name.into());
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("deps", &self.deps)
            .field("output_as", &self.output_as)
            .field("has_condition", &self.condition.is_some())
            .field("provider_label", &self.provider_label)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::predicate::PredicateError;
    use serde_json::{Map, Value};

    #[test]
    fn test_builder_chain() {
        let step = Step::new("summarize")
            .with_prompt("Summarize {{ article }}")
            .with_deps(["article"])
            .publishes("summary")
            .via_provider("fast")
            .in_session("chat");

        assert_eq!(step.id, "summarize");
        assert_eq!(step.deps, Some(vec!["article".to_string()]));
        assert_eq!(step.output_as.as_deref(), Some("summary"));
        assert_eq!(step.provider_label.as_deref(), Some("fast"));
        assert_eq!(step.session.as_deref(), Some("chat"));
    }

    #[test]
    fn test_debug_hides_condition_body() {
        let step = Step::new("gate").when(Arc::new(
            |_: &Map<String, Value>| -> Result<bool, PredicateError> { Ok(true) },
        ));
        let debug = format!("{step:?}");
        assert!(debug.contains("has_condition: true"));
    }
}
