//! BoxModelProvider -- object-safe dynamic dispatch wrapper for
//! ModelProvider.
//!
//! 1. Define an object-safe `ModelProviderDyn` trait with boxed futures
//! 2. Blanket-impl `ModelProviderDyn` for all `T: ModelProvider`
//! 3. `BoxModelProvider` wraps `Box<dyn ModelProviderDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use promptweave_types::content::{ContentPart, ConversationPrompt};
use promptweave_types::error::ProviderError;
use promptweave_types::model::{ModelResponse, PreparedRequest, SessionHandle, TokenUsage};

use super::provider::{InvocationContext, ModelProvider, ProviderStream};

/// Object-safe version of [`ModelProvider`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch; a blanket
/// implementation is provided for all types implementing `ModelProvider`.
pub trait ModelProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn mime_types(&self) -> Option<&[String]>;

    fn concurrency_limit(&self) -> Option<usize>;

    fn prepare(
        &self,
        conversation: &ConversationPrompt,
        invocation: &InvocationContext,
    ) -> Result<PreparedRequest, ProviderError>;

    fn invoke(&self, prepared: PreparedRequest, invocation: InvocationContext) -> ProviderStream;

    fn extract_output(&self, response: &ModelResponse) -> Result<Vec<ContentPart>, ProviderError>;

    fn extract_token_usage(&self, response: &ModelResponse) -> TokenUsage;

    fn close_session_boxed<'a>(
        &'a self,
        session: SessionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send + 'a>>;
}

/// Blanket implementation: any `ModelProvider` is a `ModelProviderDyn`.
impl<T: ModelProvider> ModelProviderDyn for T {
    fn name(&self) -> &str {
        ModelProvider::name(self)
    }

    fn mime_types(&self) -> Option<&[String]> {
        ModelProvider::mime_types(self)
    }

    fn concurrency_limit(&self) -> Option<usize> {
        ModelProvider::concurrency_limit(self)
    }

    fn prepare(
        &self,
        conversation: &ConversationPrompt,
        invocation: &InvocationContext,
    ) -> Result<PreparedRequest, ProviderError> {
        ModelProvider::prepare(self, conversation, invocation)
    }

    fn invoke(&self, prepared: PreparedRequest, invocation: InvocationContext) -> ProviderStream {
        ModelProvider::invoke(self, prepared, invocation)
    }

    fn extract_output(&self, response: &ModelResponse) -> Result<Vec<ContentPart>, ProviderError> {
        ModelProvider::extract_output(self, response)
    }

    fn extract_token_usage(&self, response: &ModelResponse) -> TokenUsage {
        ModelProvider::extract_token_usage(self, response)
    }

    fn close_session_boxed<'a>(
        &'a self,
        session: SessionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProviderError>> + Send + 'a>> {
        Box::pin(self.close_session(session))
    }
}

/// Type-erased model provider for runtime provider selection.
///
/// `ModelProvider` uses RPITIT and cannot be a trait object directly;
/// `BoxModelProvider` provides equivalent methods delegating to the inner
/// `ModelProviderDyn` trait object.
pub struct BoxModelProvider {
    inner: Box<dyn ModelProviderDyn + Send + Sync>,
}

impl BoxModelProvider {
    /// Wrap a concrete `ModelProvider` in a type-erased box.
    pub fn new<T: ModelProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn mime_types(&self) -> Option<&[String]> {
        self.inner.mime_types()
    }

    pub fn concurrency_limit(&self) -> Option<usize> {
        self.inner.concurrency_limit()
    }

    pub fn prepare(
        &self,
        conversation: &ConversationPrompt,
        invocation: &InvocationContext,
    ) -> Result<PreparedRequest, ProviderError> {
        self.inner.prepare(conversation, invocation)
    }

    pub fn invoke(
        &self,
        prepared: PreparedRequest,
        invocation: InvocationContext,
    ) -> ProviderStream {
        self.inner.invoke(prepared, invocation)
    }

    pub fn extract_output(
        &self,
        response: &ModelResponse,
    ) -> Result<Vec<ContentPart>, ProviderError> {
        self.inner.extract_output(response)
    }

    pub fn extract_token_usage(&self, response: &ModelResponse) -> TokenUsage {
        self.inner.extract_token_usage(response)
    }

    pub async fn close_session(&self, session: SessionHandle) -> Result<(), ProviderError> {
        self.inner.close_session_boxed(session).await
    }
}
