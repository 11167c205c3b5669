//! Dependency-driven execution engine for multi-step prompt pipelines.
//!
//! A pipeline is a directed graph of steps, each producing a named output
//! that other steps may depend on, with conditional branching,
//! self-triggering loops, fan-in over multiple outputs, concurrent branch
//! execution, and run-time graph mutation for tool-call round trips.
//!
//! The external collaborators -- model providers, prompt templating, the
//! response cache -- are consumed through the seams in [`provider`],
//! [`format`], and [`cache`]; this crate implements none of them beyond
//! minimal defaults.

pub mod cache;
pub mod format;
pub mod pipeline;
pub mod provider;

pub use cache::{BoxModelCache, MemoryCache, ModelCache};
pub use format::{PromptFormatter, SimpleFormatter};
pub use pipeline::context::{ExecutionContext, PipelineContext};
pub use pipeline::merge::ordered_merge;
pub use pipeline::predicate::{ActivationPredicate, JexlPredicate, PredicateError};
pub use pipeline::queue::{QueueAborted, TaskQueue};
pub use pipeline::runner::{PipelineHandle, PipelineRunner, RunContext, RunError};
pub use pipeline::state::{PipelineState, ReadyStep, SchedulerError, Transition};
pub use pipeline::step::Step;
pub use provider::{BoxModelProvider, InvocationContext, ModelProvider, ProviderRegistry};
