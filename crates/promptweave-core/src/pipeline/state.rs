//! Pipeline scheduler: dependency tracking, candidate computation, and leaf
//! detection.
//!
//! `PipelineState` tracks, per step, which dependencies have been satisfied
//! and with what context. Completing a step (or publishing its output token)
//! notifies every dependent; dependents whose requirements fill become
//! candidates, have their contexts merged, and are filtered by their
//! activation condition. The graph is deliberately allowed to be cyclic:
//! a step whose output token feeds its own dependencies re-arms after every
//! completion, which is how self-triggering loops work.
//!
//! Dependency accumulators reset to empty the moment a step becomes a
//! candidate; without the reset, loop re-entry would see stale satisfaction
//! and fire immediately.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::context::{overlay_variables, PipelineContext};
use super::predicate::PredicateError;
use super::step::Step;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from scheduler construction and transitions.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// Late registration cannot infer a positional predecessor.
    #[error("step '{0}' registered at run time must declare explicit dependencies")]
    LateRegistrationWithoutDeps(String),

    #[error("condition on step '{step}': {source}")]
    Predicate {
        step: String,
        #[source]
        source: PredicateError,
    },

    #[error("pipeline has no valid starting steps")]
    NoStartingSteps,
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// A step that is ready to run, with the context merged from its
/// dependencies.
#[derive(Debug, Clone)]
pub struct ReadyStep<S> {
    pub step: Arc<Step>,
    pub context: S,
}

/// The outcome of completing one step.
#[derive(Debug, Clone)]
pub struct Transition<S> {
    /// This completion ended a branch: nothing depends on the step, or
    /// every unlocked dependent failed its condition.
    pub is_leaf: bool,
    /// Candidates whose condition passed, ready to execute.
    pub next: Vec<ReadyStep<S>>,
}

// ---------------------------------------------------------------------------
// DependencyStatus
// ---------------------------------------------------------------------------

/// Per-step satisfaction bookkeeping: predecessor-step tokens and output
/// tokens accumulate independently, each against its originally required
/// set. Only the latest context per dependency is kept.
struct DependencyStatus<S> {
    required_steps: Vec<String>,
    required_outputs: Vec<String>,
    satisfied_steps: HashSet<String>,
    satisfied_outputs: HashSet<String>,
    collected: HashMap<String, S>,
}

impl<S: Clone> DependencyStatus<S> {
    fn new(required_steps: Vec<String>, required_outputs: Vec<String>) -> Self {
        Self {
            required_steps,
            required_outputs,
            satisfied_steps: HashSet::new(),
            satisfied_outputs: HashSet::new(),
            collected: HashMap::new(),
        }
    }

    fn satisfy_step(&mut self, token: &str, context: &S) {
        if self.required_steps.iter().any(|t| t == token) {
            self.satisfied_steps.insert(token.to_string());
            self.collected.insert(token.to_string(), context.clone());
        }
    }

    fn satisfy_output(&mut self, token: &str, context: &S) {
        if self.required_outputs.iter().any(|t| t == token) {
            self.satisfied_outputs.insert(token.to_string());
            self.collected.insert(token.to_string(), context.clone());
        }
    }

    fn is_candidate(&self) -> bool {
        self.satisfied_steps.len() == self.required_steps.len()
            && self.satisfied_outputs.len() == self.required_outputs.len()
    }

    /// Reset the accumulators and take the collected contexts in canonical
    /// (declared) dependency order.
    fn reset_and_collect(&mut self) -> Vec<S> {
        self.satisfied_steps.clear();
        self.satisfied_outputs.clear();
        let mut collected = std::mem::take(&mut self.collected);
        self.required_steps
            .iter()
            .chain(self.required_outputs.iter())
            .filter_map(|t| collected.remove(t))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// The DAG engine for one pipeline run.
///
/// Owns the step table (an arena-style map grown by [`register_step`]) and
/// two adjacency indices: step id → dependents (implicit declaration-order
/// edges) and output token → dependents (explicit `deps` edges).
///
/// All mutation must be serialized by the caller; the runner holds this
/// behind a single `tokio::sync::Mutex`.
///
/// [`register_step`]: PipelineState::register_step
pub struct PipelineState<S: PipelineContext> {
    steps: HashMap<String, Arc<Step>>,
    order: Vec<String>,
    step_dependents: HashMap<String, Vec<String>>,
    output_dependents: HashMap<String, Vec<String>>,
    status: HashMap<String, DependencyStatus<S>>,
}

impl<S: PipelineContext> PipelineState<S> {
    /// Build the scheduler from the declared step list.
    ///
    /// Duplicate step ids are fatal. A step without explicit `deps` depends
    /// on the step declared immediately before it; the first such step has
    /// no dependencies at all.
    pub fn new(steps: Vec<Step>) -> Result<Self, SchedulerError> {
        let mut state = Self {
            steps: HashMap::new(),
            order: Vec::new(),
            step_dependents: HashMap::new(),
            output_dependents: HashMap::new(),
            status: HashMap::new(),
        };

        let mut predecessor: Option<String> = None;
        for step in steps {
            let id = step.id.clone();
            state.insert_step(step, predecessor.take())?;
            predecessor = Some(id);
        }
        Ok(state)
    }

    /// Add a step at run time (virtual steps for tool-call round trips).
    ///
    /// Late registration requires explicit output-token dependencies: there
    /// is no positional "previous step" to infer.
    pub fn register_step(&mut self, step: Step) -> Result<(), SchedulerError> {
        match &step.deps {
            Some(deps) if !deps.is_empty() => {}
            _ => return Err(SchedulerError::LateRegistrationWithoutDeps(step.id)),
        }
        tracing::debug!(step = step.id.as_str(), "registering virtual step");
        self.insert_step(step, None)
    }

    fn insert_step(
        &mut self,
        step: Step,
        predecessor: Option<String>,
    ) -> Result<(), SchedulerError> {
        if self.steps.contains_key(&step.id) {
            return Err(SchedulerError::DuplicateStepId(step.id));
        }

        let mut required_steps = Vec::new();
        let mut required_outputs = Vec::new();
        match &step.deps {
            None => {
                if let Some(prev) = predecessor {
                    self.step_dependents
                        .entry(prev.clone())
                        .or_default()
                        .push(step.id.clone());
                    required_steps.push(prev);
                }
            }
            Some(tokens) => {
                for token in tokens {
                    if required_outputs.contains(token) {
                        continue;
                    }
                    self.output_dependents
                        .entry(token.clone())
                        .or_default()
                        .push(step.id.clone());
                    required_outputs.push(token.clone());
                }
            }
        }

        self.status.insert(
            step.id.clone(),
            DependencyStatus::new(required_steps, required_outputs),
        );
        self.order.push(step.id.clone());
        self.steps.insert(step.id.clone(), Arc::new(step));
        Ok(())
    }

    /// The steps a run begins with, in declaration order: every step with
    /// zero required dependencies, plus every step whose sole dependency is
    /// an output token already present as a key in `vars` (satisfied by the
    /// caller-supplied initial context). Candidates are filtered by their
    /// condition, tested against `vars`.
    pub fn starting_steps(
        &self,
        vars: &Map<String, Value>,
    ) -> Result<Vec<Arc<Step>>, SchedulerError> {
        let mut ready = Vec::new();
        for id in &self.order {
            let status = &self.status[id];
            let unconditional =
                status.required_steps.is_empty() && status.required_outputs.is_empty();
            let seeded = status.required_steps.is_empty()
                && status.required_outputs.len() == 1
                && vars.contains_key(&status.required_outputs[0]);
            if !(unconditional || seeded) {
                continue;
            }

            let step = &self.steps[id];
            if let Some(condition) = &step.condition {
                let pass = condition
                    .evaluate(vars)
                    .map_err(|source| SchedulerError::Predicate {
                        step: id.clone(),
                        source,
                    })?;
                if !pass {
                    continue;
                }
            }
            ready.push(Arc::clone(step));
        }
        Ok(ready)
    }

    /// Complete a step and compute the next ready set.
    ///
    /// Satisfies the step token for every implicit dependent of `step.id`
    /// and, when `output_as` is set, the output token for every dependent of
    /// that token, recording `context` as the dependency's collected value
    /// (later completions of the same dependency overwrite earlier ones).
    /// Every dependent whose requirements filled becomes a candidate: its
    /// accumulators reset, its collected contexts fold into one, and its
    /// condition runs against the merged variable set.
    ///
    /// Leaf rule: the completion ends a branch iff nothing was notified, or
    /// every notified dependent became a candidate and none passed its
    /// condition. The asymmetry is deliberate — it lets both dead-end steps
    /// and just-exited loops terminate the run, while a fan-in step still
    /// waiting on a sibling keeps the branch alive.
    pub fn mark_complete(
        &mut self,
        step: &Step,
        vars: &Map<String, Value>,
        context: &S,
    ) -> Result<Transition<S>, SchedulerError> {
        let mut notified: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        if let Some(dependents) = self.step_dependents.get(&step.id).cloned() {
            for id in dependents {
                if let Some(status) = self.status.get_mut(&id) {
                    status.satisfy_step(&step.id, context);
                    if seen.insert(id.clone()) {
                        notified.push(id);
                    }
                }
            }
        }
        if let Some(token) = &step.output_as {
            if let Some(dependents) = self.output_dependents.get(token).cloned() {
                for id in dependents {
                    if let Some(status) = self.status.get_mut(&id) {
                        status.satisfy_output(token, context);
                        if seen.insert(id.clone()) {
                            notified.push(id);
                        }
                    }
                }
            }
        }

        let num_deps = notified.len();

        let mut candidates: Vec<(Arc<Step>, S)> = Vec::new();
        for id in &notified {
            let contexts = match self.status.get_mut(id) {
                Some(status) if status.is_candidate() => status.reset_and_collect(),
                _ => continue,
            };
            let mut contexts = contexts.into_iter();
            let Some(first) = contexts.next() else {
                continue;
            };
            let merged = contexts.fold(first, |acc, c| acc.merge(&c));
            candidates.push((Arc::clone(&self.steps[id]), merged));
        }

        let num_candidates = candidates.len();
        let mut next = Vec::new();
        for (candidate, merged) in candidates {
            if let Some(condition) = &candidate.condition {
                let merged_vars = overlay_variables(vars, merged.variables());
                let pass =
                    condition
                        .evaluate(&merged_vars)
                        .map_err(|source| SchedulerError::Predicate {
                            step: candidate.id.clone(),
                            source,
                        })?;
                if !pass {
                    tracing::debug!(step = candidate.id.as_str(), "condition failed, skipping");
                    continue;
                }
            }
            next.push(ReadyStep {
                step: candidate,
                context: merged,
            });
        }

        let is_leaf = num_deps == 0 || (num_deps == num_candidates && next.is_empty());
        tracing::debug!(
            step = step.id.as_str(),
            num_deps,
            candidates = num_candidates,
            next = next.len(),
            is_leaf,
            "step completed"
        );
        Ok(Transition { is_leaf, next })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
