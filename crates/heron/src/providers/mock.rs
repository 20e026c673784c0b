use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::tool::Tool;
use crate::providers::base::{CompletionStream, Provider, StreamEvent, Usage};

/// A mock provider that returns pre-configured responses for testing
pub struct MockProvider {
    responses: Arc<Mutex<Vec<Message>>>,
    round_trips: Arc<AtomicUsize>,
    native_tools: bool,
    first_error: Mutex<Option<ProviderError>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Message>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            round_trips: Arc::new(AtomicUsize::new(0)),
            native_tools: true,
            first_error: Mutex::new(None),
        }
    }

    pub fn without_native_tools(mut self) -> Self {
        self.native_tools = false;
        self
    }

    /// Fail the first request with the given error, then serve the script
    pub fn with_first_error(self, error: ProviderError) -> Self {
        *self.first_error.lock().unwrap() = Some(error);
        self
    }

    /// How many requests this provider has served
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> Result<Message, ProviderError> {
        if let Some(error) = self.first_error.lock().unwrap().take() {
            return Err(error);
        }
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(Message::assistant().with_text(""))
        } else {
            Ok(responses.remove(0))
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn host(&self) -> &str {
        "mock://local"
    }

    fn supports_native_tools(&self) -> bool {
        self.native_tools
    }

    async fn complete(
        &self,
        _system: &str,
        _messages: &[Message],
        _tools: &[Tool],
    ) -> Result<(Message, Usage), ProviderError> {
        Ok((self.next_response()?, Usage::default()))
    }

    async fn stream(
        &self,
        _system: &str,
        _messages: &[Message],
        _tools: &[Tool],
        cancel: CancellationToken,
    ) -> Result<CompletionStream, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let message = self.next_response()?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for (index, content) in message.content.iter().enumerate() {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(ProviderError::Cancelled)).await;
                    return;
                }
                let event = match content {
                    MessageContent::Text(text) => StreamEvent::Text(text.clone()),
                    MessageContent::ToolRequest(request) => StreamEvent::ToolCallDelta {
                        index,
                        id: Some(request.id.clone()),
                        name: Some(request.tool_call.name.clone()),
                        arguments: Some(request.tool_call.arguments.to_string()),
                    },
                    MessageContent::ToolResponse(_) => continue,
                };
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(StreamEvent::Done)).await;
        });

        Ok(ReceiverStream::new(rx))
    }
}
