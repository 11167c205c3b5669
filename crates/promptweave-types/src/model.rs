//! Model provider data shapes: responses, streaming events, token usage.
//!
//! The core treats a provider response as opaque JSON; providers interpret
//! it through `extract_output` / `extract_token_usage` at the seam defined
//! in promptweave-core.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque conversational handle persisted between steps that share a
/// session name. Its content is meaningful only to the provider that
/// issued it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHandle(pub Value);

/// The final response of one model invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Raw provider response body.
    pub raw: Value,
    /// Session handle for continuing the conversation, if the provider
    /// keeps one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionHandle>,
}

impl ModelResponse {
    pub fn new(raw: Value) -> Self {
        Self { raw, session: None }
    }

    pub fn with_session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }
}

/// The canonical request for one invocation, produced by the provider
/// before the call is made. Used as the cache-key payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedRequest {
    pub request: Value,
}

/// Token accounting for one or many invocations. Summation is the only
/// cost arithmetic the core performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Events emitted while a model invocation is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// A chunk of incremental text output.
    Delta { text: String },

    /// The invocation finished; carries the final response.
    Completed { response: ModelResponse },
}
