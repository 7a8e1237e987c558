use futures::StreamExt;
use log::info;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::error::Error as StdError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ EventStream, LineBuffer, NormalizedEvent, ProviderAdapter, ProviderRequest };
use crate::models::chat::ChatTurn;
use crate::tools::web_search_tool_definition;

/// Adapter for the local-completion daemon (Ollama wire protocol).
///
/// Two response modes: a non-streaming probe when tools are allowed,
/// because detecting a tool-call intent from a partial token stream is too
/// fragile, and newline-delimited JSON streaming for the tool-free answer.
#[derive(Debug)]
pub struct OllamaAdapter {
    http: HttpClient,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<Value>,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: ChatOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Serialize)]
struct ChatOptions {
    num_ctx: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize, Default)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ToolCallEntry>,
}

#[derive(Deserialize)]
struct ToolCallEntry {
    function: ToolCallFunction,
}

#[derive(Deserialize)]
struct ToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    message: ResponseMessage,
    #[serde(default)]
    done: bool,
}

fn to_wire(turns: &[ChatTurn]) -> Vec<WireMessage> {
    turns
        .iter()
        .map(|turn| WireMessage {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
            images: turn.images.clone(),
            tool_calls: turn.tool_calls.clone(),
        })
        .collect()
}

impl OllamaAdapter {
    pub fn new() -> Self {
        Self { http: HttpClient::new() }
    }

    /// Non-streaming call carrying the tool definition: one full answer,
    /// inspected for a tool-call intent before anything is streamed.
    async fn probe(
        &self,
        request: &ProviderRequest
    ) -> Result<EventStream, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/api/chat", request.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: request.model.clone(),
            messages: to_wire(&request.turns),
            stream: false,
            options: ChatOptions { num_ctx: request.context_window },
            tools: Some(vec![web_search_tool_definition()]),
        };

        let resp = self.http
            .post(&url)
            .json(&body)
            .send().await?
            .error_for_status()?
            .json::<ChatResponse>().await?;

        let mut events = Vec::new();
        if let Some(call) = resp.message.tool_calls.into_iter().next() {
            events.push(NormalizedEvent::ToolCallRequested {
                id: None,
                name: call.function.name,
                arguments: call.function.arguments,
            });
        } else {
            if !resp.message.content.is_empty() {
                events.push(NormalizedEvent::TextDelta { text: resp.message.content });
            }
            events.push(NormalizedEvent::Completed);
        }

        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn stream(
        &self,
        request: &ProviderRequest
    ) -> Result<EventStream, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/api/chat", request.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: request.model.clone(),
            messages: to_wire(&request.turns),
            stream: true,
            options: ChatOptions { num_ctx: request.context_window },
            tools: None,
        };

        let resp = self.http.post(&url).json(&body).send().await?.error_for_status()?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = LineBuffer::new();

            while let Some(chunk_result) = bytes.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        for line in buffer.push(&chunk) {
                            match parse_stream_line(&line) {
                                Some(event) => {
                                    let done = matches!(event, NormalizedEvent::Completed);
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                    if done {
                                        return;
                                    }
                                }
                                None => continue,
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(NormalizedEvent::Failed {
                            reason: format!("upstream read error: {}", e),
                        }).await;
                        return;
                    }
                }
            }

            // Connection closed without a done marker; a final unterminated
            // line may still hold the closing object.
            if let Some(rest) = buffer.finish() {
                if let Some(event) = parse_stream_line(&rest) {
                    let _ = tx.send(event).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// One NDJSON line to at most one event. Upstream occasionally emits
/// keep-alive noise that is not valid JSON; those lines are logged and
/// skipped rather than aborting the stream.
fn parse_stream_line(line: &str) -> Option<NormalizedEvent> {
    match serde_json::from_str::<StreamChunk>(line) {
        Ok(chunk) => {
            if chunk.done {
                Some(NormalizedEvent::Completed)
            } else if !chunk.message.content.is_empty() {
                Some(NormalizedEvent::TextDelta { text: chunk.message.content })
            } else {
                None
            }
        }
        Err(e) => {
            info!("Skipping unparseable stream line: {} ({})", line, e);
            None
        }
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn invoke(
        &self,
        request: &ProviderRequest
    ) -> Result<EventStream, Box<dyn StdError + Send + Sync>> {
        if request.allow_tools {
            self.probe(request).await
        } else {
            self.stream(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Role;

    #[test]
    fn stream_line_maps_delta_and_done() {
        let delta = parse_stream_line(r#"{"message":{"content":"Hel"},"done":false}"#).unwrap();
        assert!(matches!(delta, NormalizedEvent::TextDelta { ref text } if text == "Hel"));

        let done = parse_stream_line(r#"{"message":{"content":""},"done":true}"#).unwrap();
        assert!(matches!(done, NormalizedEvent::Completed));
    }

    #[test]
    fn keep_alive_noise_is_skipped() {
        assert!(parse_stream_line("ping").is_none());
        assert!(parse_stream_line(r#"{"message":{"content":""},"done":false}"#).is_none());
    }

    #[test]
    fn wire_messages_carry_images_and_tool_calls() {
        let mut user = ChatTurn::new(Role::User, "describe this");
        user.images.push("aGVsbG8=".to_string());
        let mut assistant = ChatTurn::new(Role::Assistant, "");
        assistant.tool_calls.push(serde_json::json!({"function":{"name":"web_search"}}));

        let wire = to_wire(&[user, assistant]);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json[0]["role"], "user");
        assert_eq!(json[0]["images"][0], "aGVsbG8=");
        assert!(json[0].get("tool_calls").is_none());
        assert_eq!(json[1]["tool_calls"][0]["function"]["name"], "web_search");
    }
}
