use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::base::{CompletionStream, Provider, StreamEvent, Usage};
use super::configs::OpenAiProviderConfig;
use super::decode::{SseDecoder, SseFrame};
use super::utils::{
    check_context_length_error, messages_to_openai_spec, openai_response_to_message, openai_usage,
    tools_to_openai_spec,
};
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;

/// Adapter for the OpenAI-compatible HTTP+SSE provider family.
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        )
    }

    fn build_payload(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        stream: bool,
    ) -> Result<Value, ProviderError> {
        let system_message = json!({
            "role": "system",
            "content": system
        });

        let messages_spec =
            messages_to_openai_spec(messages, self.config.exclusive_tool_turns);
        let tools_spec = if !tools.is_empty() && self.config.native_tool_calling {
            tools_to_openai_spec(tools)?
        } else {
            vec![]
        };

        let mut messages_array = vec![system_message];
        messages_array.extend(messages_spec);

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array,
            "stream": stream
        });

        let body = payload.as_object_mut().unwrap();
        if !tools_spec.is_empty() {
            body.insert("tools".to_string(), json!(tools_spec));
            body.insert("tool_choice".to_string(), json!("auto"));
        }
        if let Some(temp) = self.config.temperature {
            body.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.max_tokens {
            body.insert("max_tokens".to_string(), json!(tokens));
        }

        Ok(payload)
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
                if let Some(err) = parsed
                    .get("error")
                    .and_then(check_context_length_error)
                {
                    return Err(err);
                }
            }
            return Err(ProviderError::from_status("openai", status.as_u16(), body));
        }
        Ok(response)
    }

    /// Parse one SSE frame payload into stream events. Total: malformed
    /// frames yield nothing and the stream continues.
    fn parse_frame(data: &str) -> Vec<StreamEvent> {
        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "dropping malformed stream frame");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        let delta = &value["choices"][0]["delta"];

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                events.push(StreamEvent::Text(text.to_string()));
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for tool_call in tool_calls {
                let index = tool_call["index"].as_u64().unwrap_or(0) as usize;
                events.push(StreamEvent::ToolCallDelta {
                    index,
                    id: tool_call["id"].as_str().map(String::from),
                    name: tool_call["function"]["name"].as_str().map(String::from),
                    arguments: tool_call["function"]["arguments"]
                        .as_str()
                        .map(String::from),
                });
            }
        }

        if value.get("usage").map_or(false, |u| !u.is_null()) {
            events.push(StreamEvent::Usage(openai_usage(&value)));
        }

        events
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn host(&self) -> &str {
        &self.config.host
    }

    fn supports_native_tools(&self) -> bool {
        self.config.native_tool_calling
    }

    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage), ProviderError> {
        let payload = self.build_payload(system, messages, tools, false)?;
        let response: Value = self.send(&payload).await?.json().await?;

        if let Some(error) = response.get("error") {
            if let Some(err) = check_context_length_error(error) {
                return Err(err);
            }
            return Err(ProviderError::Internal(format!("API error: {}", error)));
        }

        let message = openai_response_to_message(&response);
        let usage = openai_usage(&response);
        Ok((message, usage))
    }

    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        cancel: CancellationToken,
    ) -> Result<CompletionStream, ProviderError> {
        let payload = self.build_payload(system, messages, tools, true)?;
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = self.send(&payload) => response?,
        };

        let mut body = response.bytes_stream();
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(ProviderError::Cancelled)).await;
                        return;
                    }
                    chunk = body.next() => chunk,
                };

                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ProviderError::Transport(e))).await;
                        return;
                    }
                    None => break,
                };

                for frame in decoder.push(&chunk) {
                    match frame {
                        SseFrame::Done => {
                            let _ = tx.send(Ok(StreamEvent::Done)).await;
                            return;
                        }
                        SseFrame::Data(data) => {
                            for event in Self::parse_frame(&data) {
                                if tx.send(Ok(event)).await.is_err() {
                                    debug!("receiver dropped, stopping stream");
                                    return;
                                }
                            }
                        }
                    }
                }
            }
            // Stream ended without the sentinel; still terminate cleanly
            let _ = tx.send(Ok(StreamEvent::Done)).await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::StreamingAccumulator;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(host: String) -> OpenAiProviderConfig {
        OpenAiProviderConfig {
            host,
            api_key: "test_api_key".to_string(),
            model: "gpt-4o".to_string(),
            temperature: Some(0.7),
            max_tokens: None,
            native_tool_calling: true,
            exclusive_tool_turns: false,
        }
    }

    async fn setup_mock_server(response_body: Value) -> (MockServer, OpenAiProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(test_config(mock_server.uri())).unwrap();
        (mock_server, provider)
    }

    #[tokio::test]
    async fn test_complete_basic() {
        let response_body = json!({
            "id": "chatcmpl-123",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello! How can I assist you today?",
                    "tool_calls": null
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 12,
                "completion_tokens": 15,
                "total_tokens": 27
            }
        });

        let (_, provider) = setup_mock_server(response_body).await;
        let messages = vec![Message::user().with_text("Hello?")];
        let (message, usage) = provider
            .complete("You are a helpful assistant.", &messages, &[])
            .await
            .unwrap();

        assert_eq!(message.text(), "Hello! How can I assist you today?");
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(15));
    }

    #[tokio::test]
    async fn test_complete_tool_request() {
        let response_body = json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_123",
                        "type": "function",
                        "function": {
                            "name": "get_weather",
                            "arguments": "{\"location\":\"San Francisco, CA\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 20, "completion_tokens": 15, "total_tokens": 35}
        });

        let (_, provider) = setup_mock_server(response_body).await;
        let messages = vec![Message::user().with_text("What's the weather in San Francisco?")];
        let tool = Tool::new(
            "get_weather",
            "Gets the current weather for a location",
            json!({
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }),
        );

        let (message, _) = provider
            .complete("You are a helpful assistant.", &messages, &[tool])
            .await
            .unwrap();

        let requests = message.tool_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, "call_123");
        assert_eq!(requests[0].tool_call.name, "get_weather");
        assert_eq!(
            requests[0].tool_call.arguments,
            json!({"location": "San Francisco, CA"})
        );
    }

    #[tokio::test]
    async fn test_auth_error_remediation() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(test_config(mock_server.uri())).unwrap();
        let messages = vec![Message::user().with_text("Hello?")];
        let err = provider
            .complete("system", &messages, &[])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Authentication failed"));
        assert!(err.to_string().contains("invalid api key"));
    }

    #[tokio::test]
    async fn test_stream_text_and_tool_calls() {
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_9\",\"function\":{\"name\":\"web_search\",\"arguments\":\"{\\\"qu\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"ery\\\":\\\"cats\\\"}\"}}]}}]}\n\n",
            "data: not json at all\n\n",
            "data: [DONE]\n\n",
        );

        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(test_config(mock_server.uri())).unwrap();
        let messages = vec![Message::user().with_text("search cats")];
        let mut stream = provider
            .stream("system", &messages, &[], CancellationToken::new())
            .await
            .unwrap();

        let mut acc = StreamingAccumulator::new();
        let mut streamed_text = String::new();
        while let Some(event) = futures::StreamExt::next(&mut stream).await {
            let event = event.unwrap();
            if let StreamEvent::Text(text) = &event {
                streamed_text.push_str(text);
            }
            if acc.apply(event) {
                break;
            }
        }

        assert_eq!(streamed_text, "Hello");
        let (message, _) = acc.finish();
        assert_eq!(message.text(), "Hello");
        let requests = message.tool_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, "call_9");
        assert_eq!(requests[0].tool_call.arguments, json!({"query": "cats"}));
    }

    #[tokio::test]
    async fn test_stream_cancellation() {
        let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body, "text/event-stream")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(test_config(mock_server.uri())).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let messages = vec![Message::user().with_text("hi")];
        // The response header may arrive before cancellation is observed;
        // either the stream call or the first event must report Cancelled.
        match provider.stream("system", &messages, &[], cancel).await {
            Err(err) => assert!(err.is_cancelled()),
            Ok(mut stream) => {
                let event = futures::StreamExt::next(&mut stream).await.unwrap();
                assert!(event.unwrap_err().is_cancelled());
            }
        }
    }

    #[tokio::test]
    async fn test_exclusive_tool_turns_payload() {
        let config = OpenAiProviderConfig {
            exclusive_tool_turns: true,
            ..test_config("http://localhost".to_string())
        };
        let provider = OpenAiProvider::new(config).unwrap();

        let call = crate::models::tool::ToolCall::new("t", json!({})).with_id("1");
        let messages = vec![Message::assistant()
            .with_text("checking")
            .with_tool_request("1", call)];
        let payload = provider.build_payload("sys", &messages, &[], false).unwrap();

        let assistant = &payload["messages"][1];
        assert!(assistant.get("content").is_none());
        assert!(assistant["tool_calls"].is_array());
    }
}
