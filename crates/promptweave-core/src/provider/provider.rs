//! ModelProvider trait definition.
//!
//! Uses RPITIT for `close_session` and `Pin<Box<dyn Stream>>` for `invoke`
//! (streams need to be object-safe for the BoxModelProvider wrapper).

use std::pin::Pin;

use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use promptweave_types::content::{ContentPart, ConversationPrompt};
use promptweave_types::error::ProviderError;
use promptweave_types::model::{
    ModelResponse, PreparedRequest, ProviderEvent, SessionHandle, TokenUsage,
};

/// Stream of events from one in-flight model invocation.
pub type ProviderStream =
    Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send + 'static>>;

/// Per-invocation state handed to the provider: the session to resume (if
/// any) and the run's abort token.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub session: Option<SessionHandle>,
    pub abort: CancellationToken,
}

impl InvocationContext {
    pub fn new(abort: CancellationToken) -> Self {
        Self {
            session: None,
            abort,
        }
    }

    pub fn with_session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }
}

/// Trait for model provider backends.
///
/// `prepare` produces the canonical request (also the cache-key payload);
/// `invoke` streams the call. The response stays opaque to the core and is
/// interpreted only through `extract_output` / `extract_token_usage`.
///
/// Concrete HTTP clients live outside this crate.
pub trait ModelProvider: Send + Sync {
    /// Stable provider name; scopes the request semaphore and cache keys.
    fn name(&self) -> &str;

    /// Mime types this provider accepts in file parts, if restricted.
    fn mime_types(&self) -> Option<&[String]> {
        None
    }

    /// Maximum concurrent in-flight requests, independent of queue width.
    fn concurrency_limit(&self) -> Option<usize> {
        None
    }

    /// Build the canonical request for a rendered conversation.
    fn prepare(
        &self,
        conversation: &ConversationPrompt,
        invocation: &InvocationContext,
    ) -> Result<PreparedRequest, ProviderError>;

    /// Execute the request, yielding incremental deltas and a final
    /// `Completed` event.
    fn invoke(&self, prepared: PreparedRequest, invocation: InvocationContext) -> ProviderStream;

    /// Interpret the opaque response into content parts.
    fn extract_output(&self, response: &ModelResponse) -> Result<Vec<ContentPart>, ProviderError>;

    /// Token accounting for the response.
    fn extract_token_usage(&self, response: &ModelResponse) -> TokenUsage;

    /// Release a transient session handle.
    fn close_session(
        &self,
        session: SessionHandle,
    ) -> impl std::future::Future<Output = Result<(), ProviderError>> + Send;
}
