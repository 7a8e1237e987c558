use futures::StreamExt;
use log::info;
use reqwest::{ Client as HttpClient, header::AUTHORIZATION };
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ EventStream, LineBuffer, NormalizedEvent, ProviderAdapter, ProviderRequest };
use crate::models::chat::ChatTurn;
use crate::tools::web_search_tool_definition;

/// Adapter for OpenAI-compatible chat-completion endpoints. Always
/// streams; frames are `data: <json>` lines terminated by a literal
/// `data: [DONE]` sentinel.
pub struct OpenAiAdapter {
    http: HttpClient,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    #[serde(default)]
    function: ToolCallFunctionDelta,
}

#[derive(Deserialize, Default)]
struct ToolCallFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Translates SSE `data:` lines into normalized events. The upstream
/// protocol splits one tool call's arguments across multiple delta events
/// keyed by an index integer; a slot only counts as requested once the
/// `[DONE]` sentinel arrives or the next non-tool delta begins.
struct DeltaParser {
    pending: BTreeMap<u32, PendingToolCall>,
}

/// A parsed line yields events plus whether the stream is finished.
struct ParseStep {
    events: Vec<NormalizedEvent>,
    terminal: bool,
}

impl DeltaParser {
    fn new() -> Self {
        Self { pending: BTreeMap::new() }
    }

    fn handle_line(&mut self, line: &str) -> ParseStep {
        if line == "data: [DONE]" {
            return ParseStep { events: self.flush_or_complete(), terminal: true };
        }

        let data = match line.strip_prefix("data: ") {
            Some(d) => d,
            None => {
                return ParseStep { events: Vec::new(), terminal: false };
            }
        };

        let chunk = match serde_json::from_str::<StreamChunk>(data) {
            Ok(c) => c,
            Err(e) => {
                info!("Skipping unparseable SSE data: {} ({})", data, e);
                return ParseStep { events: Vec::new(), terminal: false };
            }
        };

        for choice in chunk.choices {
            for fragment in choice.delta.tool_calls {
                let slot = self.pending.entry(fragment.index).or_default();
                if let Some(id) = fragment.id {
                    slot.id = Some(id);
                }
                if let Some(name) = fragment.function.name {
                    slot.name.push_str(&name);
                }
                if let Some(args) = fragment.function.arguments {
                    slot.arguments.push_str(&args);
                }
            }

            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    if !self.pending.is_empty() {
                        // A non-tool delta closes the pending slot.
                        return ParseStep { events: self.flush_tool_call(), terminal: true };
                    }
                    return ParseStep {
                        events: vec![NormalizedEvent::TextDelta { text: content }],
                        terminal: false,
                    };
                }
            }

            match choice.finish_reason.as_deref() {
                Some("tool_calls") => {
                    return ParseStep { events: self.flush_tool_call(), terminal: true };
                }
                Some("stop") => {
                    return ParseStep { events: self.flush_or_complete(), terminal: true };
                }
                _ => {}
            }
        }

        ParseStep { events: Vec::new(), terminal: false }
    }

    fn flush_or_complete(&mut self) -> Vec<NormalizedEvent> {
        if self.pending.is_empty() {
            vec![NormalizedEvent::Completed]
        } else {
            self.flush_tool_call()
        }
    }

    fn flush_tool_call(&mut self) -> Vec<NormalizedEvent> {
        let pending = std::mem::take(&mut self.pending);
        match pending.into_values().next() {
            Some(call) => {
                let arguments = serde_json
                    ::from_str::<Value>(&call.arguments)
                    .unwrap_or(Value::String(call.arguments));
                vec![NormalizedEvent::ToolCallRequested {
                    id: call.id,
                    name: call.name,
                    arguments,
                }]
            }
            None => vec![NormalizedEvent::Completed],
        }
    }
}

fn to_wire(turns: &[ChatTurn]) -> Vec<WireMessage> {
    turns
        .iter()
        .map(|turn| WireMessage {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
            tool_calls: turn.tool_calls.clone(),
            tool_call_id: turn.tool_call_id.clone(),
        })
        .collect()
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self { http: HttpClient::new() }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn invoke(
        &self,
        request: &ProviderRequest
    ) -> Result<EventStream, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/v1/chat/completions", request.base_url.trim_end_matches('/'));

        let body = ChatRequest {
            model: request.model.clone(),
            messages: to_wire(&request.turns),
            stream: true,
            max_tokens: request.context_window,
            tools: if request.allow_tools {
                Some(vec![web_search_tool_definition()])
            } else {
                None
            },
            tool_choice: if request.allow_tools {
                Some("auto".to_string())
            } else {
                None
            },
        };

        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &request.api_key {
            req = req.header(AUTHORIZATION, format!("Bearer {}", key));
        }

        let resp = req.send().await?.error_for_status()?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = LineBuffer::new();
            let mut parser = DeltaParser::new();

            while let Some(chunk_result) = bytes.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        for line in buffer.push(&chunk) {
                            let step = parser.handle_line(&line);
                            for event in step.events {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            if step.terminal {
                                return;
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

            // EOF without the [DONE] sentinel. A fully accumulated tool
            // call is still honored; otherwise the stream just ends and
            // the caller treats the exhaustion as best-effort completion.
            if !parser.pending.is_empty() {
                for event in parser.flush_tool_call() {
                    let _ = tx.send(event).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Role;

    fn collect(parser: &mut DeltaParser, lines: &[&str]) -> Vec<NormalizedEvent> {
        let mut out = Vec::new();
        for line in lines {
            let step = parser.handle_line(line);
            out.extend(step.events);
            if step.terminal {
                break;
            }
        }
        out
    }

    #[test]
    fn content_deltas_stream_in_order() {
        let mut parser = DeltaParser::new();
        let events = collect(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
                "data: [DONE]",
            ]
        );

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], NormalizedEvent::TextDelta { ref text } if text == "Hel"));
        assert!(matches!(events[1], NormalizedEvent::TextDelta { ref text } if text == "lo"));
        assert!(matches!(events[2], NormalizedEvent::Completed));
    }

    #[test]
    fn tool_call_arguments_accumulate_across_deltas() {
        let mut parser = DeltaParser::new();
        let events = collect(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"web_search","arguments":"{\"qu"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ery\":\"weather\"}"}}]}}]}"#,
                "data: [DONE]",
            ]
        );

        assert_eq!(events.len(), 1);
        match &events[0] {
            NormalizedEvent::ToolCallRequested { id, name, arguments } => {
                assert_eq!(id.as_deref(), Some("call_1"));
                assert_eq!(name, "web_search");
                assert_eq!(arguments["query"], "weather");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn non_tool_delta_closes_pending_slot() {
        let mut parser = DeltaParser::new();
        let events = collect(
            &mut parser,
            &[
                r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c","function":{"name":"web_search","arguments":"{}"}}]}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"text"}}]}"#,
            ]
        );

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], NormalizedEvent::ToolCallRequested { .. }));
    }

    #[test]
    fn finish_reason_stop_completes() {
        let mut parser = DeltaParser::new();
        let events = collect(
            &mut parser,
            &[r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#]
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], NormalizedEvent::Completed));
    }

    #[test]
    fn unparseable_data_lines_are_skipped() {
        let mut parser = DeltaParser::new();
        let step = parser.handle_line("data: not-json");
        assert!(step.events.is_empty());
        assert!(!step.terminal);
        let step = parser.handle_line(": keep-alive comment");
        assert!(step.events.is_empty());
    }

    #[test]
    fn tool_turn_serializes_tool_call_id() {
        let mut tool_turn = ChatTurn::new(Role::Tool, "result text");
        tool_turn.tool_call_id = Some("call_1".to_string());
        let wire = to_wire(&[tool_turn]);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json[0]["tool_call_id"], "call_1");
        assert!(json[0].get("tool_calls").is_none());
    }
}
