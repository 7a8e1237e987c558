pub mod ollama;
pub mod openai;

use crate::models::chat::ChatTurn;
use crate::models::provider::ProviderKind;
use async_trait::async_trait;
use futures::Stream;
use self::ollama::OllamaAdapter;
use self::openai::OpenAiAdapter;
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;

/// Provider-agnostic representation of one unit of upstream progress.
/// A stream of these is lazy, finite and non-restartable; `Completed` and
/// `Failed` are terminal. Text already delivered before a `Failed` is
/// still valid partial output.
#[derive(Clone, Debug)]
pub enum NormalizedEvent {
    TextDelta {
        text: String,
    },
    ToolCallRequested {
        id: Option<String>,
        name: String,
        arguments: serde_json::Value,
    },
    Completed,
    Failed {
        reason: String,
    },
}

pub type EventStream = Pin<Box<dyn Stream<Item = NormalizedEvent> + Send>>;

/// Everything an adapter needs for one upstream call. Built once per
/// invocation by the orchestrator; the API key is already decrypted.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub model: String,
    pub turns: Vec<ChatTurn>,
    pub base_url: String,
    pub api_key: Option<String>,
    pub context_window: u32,
    /// Whether the upstream may request the web-search tool. Disabled on
    /// the follow-up call after a tool round-trip to bound recursion.
    pub allow_tools: bool,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Start one upstream exchange. Errors returned here happened before
    /// any streaming began and map to an HTTP error for the caller;
    /// everything after the connection is up arrives as stream events.
    async fn invoke(
        &self,
        request: &ProviderRequest
    ) -> Result<EventStream, Box<dyn StdError + Send + Sync>>;
}

pub fn new_adapter(kind: ProviderKind) -> Arc<dyn ProviderAdapter> {
    match kind {
        ProviderKind::LocalCompletion => Arc::new(OllamaAdapter::new()),
        ProviderKind::OpenAiCompatible => Arc::new(OpenAiAdapter::new()),
    }
}

/// Reassembles complete lines from arbitrarily split byte chunks. Upstream
/// chunk boundaries do not respect line boundaries, so both wire formats
/// (NDJSON and SSE `data:` framing) feed their chunks through this.
///
/// Bytes are buffered raw and decoded per complete line: a chunk boundary
/// can fall inside a multi-byte UTF-8 sequence, while every whole line is
/// a JSON document and therefore valid UTF-8 on its own.
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let decoded = String::from_utf8_lossy(&raw);
            let line = decoded.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the connection closes without a trailing
    /// newline.
    pub fn finish(self) -> Option<String> {
        let decoded = String::from_utf8_lossy(&self.pending);
        let rest = decoded.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_survive_arbitrary_chunk_splits() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\n{\"b\":2}\n{\"c\""), vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buf.push(b":3}\n"), vec!["{\"c\":3}"]);
        assert!(buf.finish().is_none());
    }

    #[test]
    fn crlf_and_blank_lines_are_dropped() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"data: x\r\n\r\ndata: y\n"), vec!["data: x", "data: y"]);
    }

    #[test]
    fn trailing_fragment_is_returned_on_finish() {
        let mut buf = LineBuffer::new();
        buf.push(b"{\"done\":true}");
        assert_eq!(buf.finish().unwrap(), "{\"done\":true}");
    }

    #[test]
    fn multibyte_char_split_across_chunks_survives() {
        let line = r#"{"message":{"content":"café"},"done":false}"#;
        let bytes = line.as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let split = line.find('é').unwrap() + 1;

        let mut buf = LineBuffer::new();
        assert!(buf.push(&bytes[..split]).is_empty());
        let mut tail = bytes[split..].to_vec();
        tail.push(b'\n');
        assert_eq!(buf.push(&tail), vec![line]);
    }
}
