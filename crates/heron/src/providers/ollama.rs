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
use super::configs::OllamaProviderConfig;
use super::decode::NdjsonDecoder;
use super::utils::tools_to_openai_spec;
use crate::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::tool::{Tool, ToolCall};

/// Adapter for a locally hosted model server speaking newline-delimited
/// JSON: one complete object per line, a terminal object flagged
/// `done: true` carrying cumulative token counters.
pub struct OllamaProvider {
    client: Client,
    config: OllamaProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!("{}/api/chat", self.config.host.trim_end_matches('/'))
    }

    fn build_payload(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        stream: bool,
    ) -> Result<Value, ProviderError> {
        let mut messages_array = vec![json!({
            "role": "system",
            "content": system
        })];
        messages_array.extend(native_messages(messages));

        let mut options = serde_json::Map::new();
        if let Some(temp) = self.config.temperature {
            options.insert("temperature".to_string(), json!(temp));
        }
        if let Some(tokens) = self.config.num_predict {
            // The native protocol takes options.num_predict, not max_tokens
            options.insert("num_predict".to_string(), json!(tokens));
        }

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array,
            "stream": stream
        });
        let body = payload.as_object_mut().unwrap();
        if !options.is_empty() {
            body.insert("options".to_string(), Value::Object(options));
        }
        if !tools.is_empty() {
            body.insert("tools".to_string(), json!(tools_to_openai_spec(tools)?));
        }

        Ok(payload)
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self.client.post(self.url()).json(payload).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("ollama", status.as_u16(), body));
        }
        Ok(response)
    }

    /// Parse one NDJSON frame. `next_index` numbers tool calls across the
    /// whole stream so the accumulator keeps them distinct.
    fn parse_frame(line: &str, next_index: &mut usize) -> Vec<StreamEvent> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "dropping malformed stream frame");
                return Vec::new();
            }
        };

        let mut events = Vec::new();

        if let Some(text) = value["message"]["content"].as_str() {
            if !text.is_empty() {
                events.push(StreamEvent::Text(text.to_string()));
            }
        }

        if let Some(tool_calls) = value["message"]["tool_calls"].as_array() {
            for tool_call in tool_calls {
                let name = tool_call["function"]["name"].as_str().unwrap_or_default();
                if name.is_empty() {
                    continue;
                }
                // Arguments arrive as a complete object, not a fragment
                let arguments = tool_call["function"]["arguments"].to_string();
                events.push(StreamEvent::ToolCallDelta {
                    index: *next_index,
                    id: None,
                    name: Some(name.to_string()),
                    arguments: Some(arguments),
                });
                *next_index += 1;
            }
        }

        if value["done"].as_bool() == Some(true) {
            events.push(StreamEvent::Usage(native_usage(&value)));
            events.push(StreamEvent::Done);
        }

        events
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn host(&self) -> &str {
        &self.config.host
    }

    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage), ProviderError> {
        let payload = self.build_payload(system, messages, tools, false)?;
        let response: Value = self.send(&payload).await?.json().await?;

        let mut message = Message::assistant();
        if let Some(text) = response["message"]["content"].as_str() {
            if !text.is_empty() {
                message = message.with_text(text);
            }
        }
        if let Some(tool_calls) = response["message"]["tool_calls"].as_array() {
            for tool_call in tool_calls {
                let name = tool_call["function"]["name"].as_str().unwrap_or_default();
                if name.is_empty() {
                    continue;
                }
                let arguments = tool_call["function"]["arguments"].clone();
                let id = format!("call_{}", uuid::Uuid::new_v4().simple());
                message = message
                    .with_tool_request(id.clone(), ToolCall::new(name, arguments).with_id(id));
            }
        }

        Ok((message, native_usage(&response)))
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
            let mut decoder = NdjsonDecoder::new();
            let mut next_index = 0usize;
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

                for line in decoder.push(&chunk) {
                    for event in Self::parse_frame(&line, &mut next_index) {
                        let done = event == StreamEvent::Done;
                        if tx.send(Ok(event)).await.is_err() {
                            debug!("receiver dropped, stopping stream");
                            return;
                        }
                        if done {
                            return;
                        }
                    }
                }
            }
            let _ = tx.send(Ok(StreamEvent::Done)).await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// Convert internal messages to the native chat shape. The native protocol
/// has no tool_call_id correlation; tool results are plain tool-role turns.
fn native_messages(messages: &[Message]) -> Vec<Value> {
    let mut spec = Vec::new();
    for message in messages {
        let mut converted = json!({
            "role": message.role,
            "content": message.text()
        });
        let mut output = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(_) => {}
                MessageContent::ToolRequest(request) => {
                    let tool_calls = converted
                        .as_object_mut()
                        .unwrap()
                        .entry("tool_calls")
                        .or_insert(json!([]));
                    tool_calls.as_array_mut().unwrap().push(json!({
                        "function": {
                            "name": request.tool_call.name,
                            "arguments": request.tool_call.arguments,
                        }
                    }));
                }
                MessageContent::ToolResponse(response) => {
                    let content = match &response.tool_result {
                        Ok(result) => result.clone(),
                        Err(e) => format!("The tool call returned the following error:\n{}", e),
                    };
                    output.push(json!({
                        "role": "tool",
                        "content": content
                    }));
                }
            }
        }

        let has_text = converted["content"].as_str().map_or(false, |t| !t.is_empty());
        if has_text || converted.get("tool_calls").is_some() {
            output.insert(0, converted);
        }
        spec.extend(output);
    }
    spec
}

/// Sum the native counters into usage: `prompt_eval_count` is the prompt
/// side, `eval_count` the completion side.
fn native_usage(value: &Value) -> Usage {
    let input_tokens = value
        .get("prompt_eval_count")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    let output_tokens = value
        .get("eval_count")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);
    let total_tokens = match (input_tokens, output_tokens) {
        (Some(input), Some(output)) => Some(input + output),
        _ => None,
    };
    Usage::new(input_tokens, output_tokens, total_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::StreamingAccumulator;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup_mock_server(template: ResponseTemplate) -> (MockServer, OllamaProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(template)
            .mount(&mock_server)
            .await;

        let provider =
            OllamaProvider::new(OllamaProviderConfig::new(mock_server.uri(), "qwen2.5")).unwrap();
        (mock_server, provider)
    }

    #[tokio::test]
    async fn test_complete_basic() {
        let response_body = json!({
            "model": "qwen2.5",
            "message": {"role": "assistant", "content": "Hello!"},
            "done": true,
            "prompt_eval_count": 12,
            "eval_count": 15
        });

        let (_, provider) =
            setup_mock_server(ResponseTemplate::new(200).set_body_json(response_body)).await;
        let messages = vec![Message::user().with_text("Hello?")];
        let (message, usage) = provider
            .complete("You are a helpful assistant.", &messages, &[])
            .await
            .unwrap();

        assert_eq!(message.text(), "Hello!");
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(15));
        assert_eq!(usage.total_tokens, Some(27));
    }

    #[tokio::test]
    async fn test_complete_native_tool_call() {
        let response_body = json!({
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{
                    "function": {
                        "name": "read_file",
                        "arguments": {"filename": "test.txt"}
                    }
                }]
            },
            "done": true,
            "prompt_eval_count": 63,
            "eval_count": 70
        });

        let (_, provider) =
            setup_mock_server(ResponseTemplate::new(200).set_body_json(response_body)).await;
        let messages = vec![Message::user().with_text("Read test.txt")];
        let (message, _) = provider
            .complete("system", &messages, &[])
            .await
            .unwrap();

        let requests = message.tool_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tool_call.name, "read_file");
        assert_eq!(
            requests[0].tool_call.arguments,
            json!({"filename": "test.txt"})
        );
        // Ids are synthesized locally since the protocol has none
        assert!(requests[0].tool_call.id.is_some());
    }

    #[tokio::test]
    async fn test_stream_ndjson() {
        let ndjson_body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "this line is not json\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"prompt_eval_count\":7,\"eval_count\":3}\n",
        );

        let (_, provider) = setup_mock_server(
            ResponseTemplate::new(200).set_body_raw(ndjson_body, "application/x-ndjson"),
        )
        .await;

        let messages = vec![Message::user().with_text("hi")];
        let mut stream = provider
            .stream("system", &messages, &[], CancellationToken::new())
            .await
            .unwrap();

        let mut acc = StreamingAccumulator::new();
        while let Some(event) = futures::StreamExt::next(&mut stream).await {
            if acc.apply(event.unwrap()) {
                break;
            }
        }

        let (message, usage) = acc.finish();
        assert_eq!(message.text(), "Hello");
        assert_eq!(usage.input_tokens, Some(7));
        assert_eq!(usage.output_tokens, Some(3));
        assert_eq!(usage.total_tokens, Some(10));
    }

    #[tokio::test]
    async fn test_num_predict_on_wire() {
        let config = OllamaProviderConfig {
            num_predict: Some(256),
            temperature: Some(0.2),
            ..OllamaProviderConfig::new("http://localhost:11434", "qwen2.5")
        };
        let provider = OllamaProvider::new(config).unwrap();
        let payload = provider
            .build_payload("sys", &[Message::user().with_text("hi")], &[], true)
            .unwrap();

        assert_eq!(payload["options"]["num_predict"], 256);
        assert!(payload.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn test_server_error() {
        let (_, provider) =
            setup_mock_server(ResponseTemplate::new(503).set_body_string("overloaded")).await;
        let messages = vec![Message::user().with_text("Hello?")];
        let err = provider
            .complete("system", &messages, &[])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("temporarily unavailable"));
    }
}
