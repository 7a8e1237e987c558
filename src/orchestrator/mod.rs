use log::{ error, info, warn };
use serde_json::Value;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::extract::{ self, UploadedFile };
use crate::models::chat::{ derive_title, Attachment, ChatTurn, Role };
use crate::models::provider::ProviderKind;
use crate::providers::{ new_adapter, NormalizedEvent, ProviderAdapter, ProviderRequest };
use crate::registry::ModelRegistry;
use crate::store::{ ConversationStore, SessionMeta };
use crate::tools::SearchTool;
use crate::vault::Vault;

const FILE_CONTEXT_HEADING: &str = "\n\n--- Attached Files Analysis ---\n";

/// One validated chat request as handed over by the transport layer.
/// Authentication already happened: `caller_user_id` is resolved or None.
#[derive(Clone, Debug)]
pub struct ExchangeInput {
    pub model: String,
    pub session_id: Option<String>,
    pub turns: Vec<ChatTurn>,
    pub files: Vec<UploadedFile>,
    pub caller_user_id: Option<String>,
    pub personalization_prompt: Option<String>,
}

/// Client-facing frame, serialized by the transport as one SSE event.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    Session {
        id: String,
    },
    Delta {
        text: String,
    },
    Done,
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Caller contract violation; maps to a 400-class response.
    #[error("{0}")] BadRequest(String),
    /// Upstream unreachable before any streaming began. The client gets a
    /// generic message; the detail stays in the server log.
    #[error("Failed to connect to model provider")] Upstream(
        #[source] Box<dyn StdError + Send + Sync>,
    ),
}

/// Request-scoped buffer for the exchange in flight. One per request,
/// never shared; everything needed for the single persistence write at
/// stream end lives here.
struct StreamAccumulator {
    text: String,
    user_text: String,
    attachments: Vec<Attachment>,
    completed: bool,
}

type AdapterFactory = dyn (Fn(ProviderKind) -> Arc<dyn ProviderAdapter>) + Send + Sync;

/// Drives one end-to-end chat exchange from validated request to durable
/// record, independent of which upstream provider serves it. Collaborators
/// are injected at construction; there is no global state.
pub struct Orchestrator {
    registry: Arc<ModelRegistry>,
    store: Arc<dyn ConversationStore>,
    search: Arc<dyn SearchTool>,
    vault: Vault,
    adapter_factory: Box<AdapterFactory>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        store: Arc<dyn ConversationStore>,
        search: Arc<dyn SearchTool>,
        vault: Vault
    ) -> Self {
        Self {
            registry,
            store,
            search,
            vault,
            adapter_factory: Box::new(new_adapter),
        }
    }

    #[cfg(test)]
    pub fn with_adapter_factory(
        mut self,
        factory: impl (Fn(ProviderKind) -> Arc<dyn ProviderAdapter>) + Send + Sync + 'static
    ) -> Self {
        self.adapter_factory = Box::new(factory);
        self
    }

    /// Run one exchange. Errors returned here happened before any bytes
    /// were streamed and map to an HTTP error response; once this returns
    /// Ok, the exchange runs to completion on its own task regardless of
    /// whether the returned frames are consumed.
    pub async fn execute(
        self: &Arc<Self>,
        input: ExchangeInput
    ) -> Result<ReceiverStream<ClientFrame>, ExchangeError> {
        if input.model.is_empty() {
            return Err(ExchangeError::BadRequest("model and messages required".into()));
        }
        if input.turns.is_empty() {
            return Err(ExchangeError::BadRequest("model and messages required".into()));
        }

        let mut turns = input.turns;
        inject_personalization(&mut turns, input.personalization_prompt.as_deref());

        // Capture the user turn as persisted *before* attachment context is
        // folded into what the model sees.
        let user_text = turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.clone())
            .unwrap_or_default();

        let attachments = fold_attachments(&mut turns, &input.files)?;

        let is_new_session = input.session_id.is_none();
        let session_id = input.session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let config = self.registry.resolve(&input.model);
        let api_key = config.encrypted_api_key.as_deref().map(|c| self.vault.decrypt(c));

        let request = ProviderRequest {
            model: input.model.clone(),
            turns: turns.clone(),
            base_url: config.base_url.clone(),
            api_key,
            context_window: config.context_window,
            allow_tools: true,
        };

        let adapter = (self.adapter_factory)(config.kind);
        let stream = adapter
            .invoke(&request).await
            .map_err(|e| {
                error!("Provider error for model {}: {}", input.model, e);
                ExchangeError::Upstream(e)
            })?;

        let accumulator = StreamAccumulator {
            text: String::new(),
            user_text,
            attachments,
            completed: false,
        };
        let meta = SessionMeta {
            model: input.model,
            title: derive_title(&accumulator.user_text),
            user_id: input.caller_user_id,
        };

        let (tx, rx) = mpsc::channel(32);
        if is_new_session {
            let _ = tx.send(ClientFrame::Session { id: session_id.clone() }).await;
        }

        // Fire-and-forget: the drain and the final write survive a client
        // disconnect, and the stream is never restarted.
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator
                .drive(adapter, request, stream, accumulator, turns, session_id, meta, tx).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        adapter: Arc<dyn ProviderAdapter>,
        request: ProviderRequest,
        mut stream: crate::providers::EventStream,
        mut acc: StreamAccumulator,
        mut turns: Vec<ChatTurn>,
        session_id: String,
        meta: SessionMeta,
        tx: mpsc::Sender<ClientFrame>
    ) {
        let mut tool_hops = 0;

        'exchange: loop {
            while let Some(event) = stream.next().await {
                match event {
                    NormalizedEvent::TextDelta { text } => {
                        acc.text.push_str(&text);
                        // A dropped receiver means the client is gone; the
                        // upstream drain and the final write continue.
                        let _ = tx.send(ClientFrame::Delta { text }).await;
                    }
                    NormalizedEvent::ToolCallRequested { id, name, arguments } => {
                        if tool_hops >= 1 {
                            warn!("Ignoring tool call '{}' in follow-up stream", name);
                            continue;
                        }
                        tool_hops += 1;

                        let query = arguments
                            .get("query")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let _ = tx.send(ClientFrame::Delta {
                            text: format!("[Searching the web for \"{}\"...]\n\n", query),
                        }).await;

                        let result = self.search.search(&query).await;
                        append_tool_turns(&mut turns, id, &name, arguments, result);

                        let follow_up = ProviderRequest {
                            turns: turns.clone(),
                            allow_tools: false,
                            ..request.clone()
                        };
                        match adapter.invoke(&follow_up).await {
                            Ok(next) => {
                                stream = next;
                                continue 'exchange;
                            }
                            Err(e) => {
                                error!("Follow-up provider call failed: {}", e);
                                break 'exchange;
                            }
                        }
                    }
                    NormalizedEvent::Completed => {
                        acc.completed = true;
                        break 'exchange;
                    }
                    NormalizedEvent::Failed { reason } => {
                        // Text already forwarded stays valid partial output.
                        error!("Upstream stream failed mid-exchange: {}", reason);
                        break 'exchange;
                    }
                }
            }
            // Exhausted without a terminal event (terminated connection):
            // whatever was accumulated counts as the answer.
            break;
        }

        if acc.completed {
            let _ = tx.send(ClientFrame::Done).await;
        }

        // Persist before releasing the channel, so a consumer that drains
        // the stream to its end observes the write as already durable.
        self.persist(&session_id, meta, acc).await;
        drop(tx);
    }

    /// The single persistence write for this exchange. Runs exactly once,
    /// on every path out of the event loop that produced any output.
    async fn persist(&self, session_id: &str, meta: SessionMeta, acc: StreamAccumulator) {
        if acc.text.is_empty() && !acc.completed {
            info!("No output produced for session {}, skipping persistence", session_id);
            return;
        }

        let mut user_turn = ChatTurn::new(Role::User, acc.user_text);
        user_turn.attachments = acc.attachments;
        let assistant_turn = ChatTurn::new(Role::Assistant, acc.text);

        if let Err(e) = self.store.upsert_append(session_id, meta, vec![user_turn, assistant_turn]).await {
            // The client already has its answer; absence from history on
            // reload is the accepted failure mode here.
            error!("Error saving chat exchange for session {}: {}", session_id, e);
        }
    }
}

/// Inject the personalization prompt as a system turn, exactly once: grow
/// an existing leading system turn or prepend a new one.
fn inject_personalization(turns: &mut Vec<ChatTurn>, prompt: Option<&str>) {
    let prompt = match prompt {
        Some(p) if !p.is_empty() => p,
        _ => {
            return;
        }
    };

    match turns.first_mut() {
        Some(first) if first.role == Role::System => {
            first.content.push_str("\n\n");
            first.content.push_str(prompt);
        }
        _ => {
            turns.insert(0, ChatTurn::new(Role::System, prompt));
        }
    }
}

/// Process attachment files and fold their content into the last user
/// turn: images become base64 entries on the turn, everything else becomes
/// extracted text under a delimited heading. Attachments without a
/// trailing user turn are a caller contract violation, not a silent drop.
fn fold_attachments(
    turns: &mut [ChatTurn],
    files: &[UploadedFile]
) -> Result<Vec<Attachment>, ExchangeError> {
    if files.is_empty() {
        return Ok(Vec::new());
    }

    let last = turns.last_mut().ok_or_else(missing_user_turn)?;
    if last.role != Role::User {
        return Err(missing_user_turn());
    }

    let mut attachments = Vec::with_capacity(files.len());
    let mut file_context = String::new();
    let mut images = Vec::new();

    for file in files {
        attachments.push(Attachment {
            filename: file.original_name.clone(),
            path: file.path.clone(),
            mimetype: file.mimetype.clone(),
        });

        if extract::is_image(&file.mimetype) {
            if let Some(encoded) = extract::read_image_base64(file) {
                images.push(encoded);
            }
        } else {
            file_context.push_str(&extract::extract_text(file));
            file_context.push_str("\n\n");
        }
    }

    if !file_context.is_empty() {
        last.content.push_str(FILE_CONTEXT_HEADING);
        last.content.push_str(&file_context);
    }
    last.images.extend(images);

    Ok(attachments)
}

fn missing_user_turn() -> ExchangeError {
    ExchangeError::BadRequest("attachments require the last message to be a user message".into())
}

/// Record the tool round-trip in the turn sequence: the assistant's
/// tool-call turn followed by a tool-role turn carrying the result.
fn append_tool_turns(
    turns: &mut Vec<ChatTurn>,
    id: Option<String>,
    name: &str,
    arguments: Value,
    result: String
) {
    let mut call = serde_json::Map::new();
    if let Some(call_id) = &id {
        call.insert("id".into(), Value::String(call_id.clone()));
    }
    call.insert("type".into(), Value::String("function".into()));
    call.insert(
        "function".into(),
        serde_json::json!({ "name": name, "arguments": arguments })
    );

    let mut assistant = ChatTurn::new(Role::Assistant, "");
    assistant.tool_calls.push(Value::Object(call));
    turns.push(assistant);

    let mut tool = ChatTurn::new(Role::Tool, result);
    tool.tool_call_id = id;
    turns.push(tool);
}
