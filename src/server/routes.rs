use axum::extract::{ Multipart, Path, State };
use axum::http::{ header, HeaderMap, HeaderValue, StatusCode };
use axum::response::sse::{ Event, Sse };
use axum::response::{ IntoResponse, Response };
use axum::Json;
use log::error;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::AppState;
use crate::extract::UploadedFile;
use crate::models::chat::ChatTurn;
use crate::orchestrator::{ ClientFrame, ExchangeError, ExchangeInput };

const MAX_FILES: usize = 10;

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Resolve the caller from the Authorization header. Token validity is the
/// verifier's business; this layer only decides whether an anonymous
/// caller is acceptable.
fn resolve_caller(state: &AppState, headers: &HeaderMap) -> Result<Option<String>, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) => {
            match state.verifier.verify(token) {
                Some(user_id) => Ok(Some(user_id)),
                None if state.require_auth =>
                    Err(error_response(StatusCode::FORBIDDEN, "Invalid token")),
                None => Ok(None),
            }
        }
        None if state.require_auth =>
            Err(error_response(StatusCode::UNAUTHORIZED, "Authentication required")),
        None => Ok(None),
    }
}

fn require_caller(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    resolve_caller(state, headers)?.ok_or_else(||
        error_response(StatusCode::UNAUTHORIZED, "Authentication required")
    )
}

#[derive(Default)]
struct ChatForm {
    model: String,
    session_id: Option<String>,
    messages_json: Option<String>,
    personalization: Option<String>,
    files: Vec<UploadedFile>,
}

async fn read_chat_form(
    state: &AppState,
    mut multipart: Multipart
) -> Result<ChatForm, Response> {
    let mut form = ChatForm::default();

    while
        let Some(field) = multipart
            .next_field().await
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("Invalid form data: {}", e)))?
    {
        match field.name().unwrap_or_default() {
            "model" => {
                form.model = field.text().await.unwrap_or_default();
            }
            "sessionId" => {
                let value = field.text().await.unwrap_or_default();
                if !value.is_empty() {
                    form.session_id = Some(value);
                }
            }
            "messages" => {
                form.messages_json = Some(field.text().await.unwrap_or_default());
            }
            "personalization" => {
                let value = field.text().await.unwrap_or_default();
                if !value.is_empty() {
                    form.personalization = Some(value);
                }
            }
            "files" => {
                if form.files.len() >= MAX_FILES {
                    return Err(error_response(StatusCode::BAD_REQUEST, "Too many files"));
                }

                let original_name = field.file_name().unwrap_or("upload").to_string();
                let mimetype = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes().await
                    .map_err(|e|
                        error_response(StatusCode::BAD_REQUEST, &format!("Upload failed: {}", e))
                    )?;

                let stored_name = format!(
                    "files-{}-{}",
                    Uuid::new_v4().simple(),
                    original_name.replace(['/', '\\'], "_")
                );
                let path = std::path::Path::new(&state.upload_dir).join(stored_name);
                let stored = async {
                    tokio::fs::create_dir_all(&state.upload_dir).await?;
                    tokio::fs::write(&path, &bytes).await
                };
                stored.await.map_err(|e| {
                    error!("Failed to store upload {}: {}", original_name, e);
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload")
                })?;

                form.files.push(UploadedFile {
                    original_name,
                    mimetype,
                    path: path.to_string_lossy().into_owned(),
                });
            }
            _ => {}
        }
    }

    Ok(form)
}

fn frame_json(frame: &ClientFrame) -> String {
    let value = match frame {
        ClientFrame::Session { id } => json!({ "sessionId": id }),
        ClientFrame::Delta { text } => json!({ "message": { "content": text }, "done": false }),
        ClientFrame::Done => json!({ "message": { "content": "" }, "done": true }),
    };
    value.to_string()
}

pub async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart
) -> Response {
    let caller_user_id = match resolve_caller(&state, &headers) {
        Ok(user) => user,
        Err(resp) => {
            return resp;
        }
    };

    let form = match read_chat_form(&state, multipart).await {
        Ok(form) => form,
        Err(resp) => {
            return resp;
        }
    };

    let messages_json = match &form.messages_json {
        Some(json) => json,
        None => {
            return error_response(StatusCode::BAD_REQUEST, "model and messages required");
        }
    };
    let turns: Vec<ChatTurn> = match serde_json::from_str(messages_json) {
        Ok(turns) => turns,
        Err(_) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid messages JSON");
        }
    };

    let input = ExchangeInput {
        model: form.model,
        session_id: form.session_id,
        turns,
        files: form.files,
        caller_user_id,
        personalization_prompt: form.personalization,
    };

    match state.orchestrator.execute(input).await {
        Ok(frames) => {
            let events = frames.map(|frame|
                Ok::<Event, Infallible>(Event::default().data(frame_json(&frame)))
            );
            let mut response = Sse::new(events).into_response();
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            response
        }
        Err(ExchangeError::BadRequest(message)) =>
            error_response(StatusCode::BAD_REQUEST, &message),
        Err(err @ ExchangeError::Upstream(_)) =>
            error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    }
}

pub async fn history_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>
) -> Response {
    match state.store.get_turns(&session_id).await {
        Ok(turns) => Json(turns).into_response(),
        Err(e) => {
            error!("Failed to fetch history for {}: {}", session_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch history")
        }
    }
}

pub async fn list_sessions_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match require_caller(&state, &headers) {
        Ok(user) => user,
        Err(resp) => {
            return resp;
        }
    };

    match state.store.list_sessions(&user_id).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => {
            error!("Failed to fetch sessions for {}: {}", user_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch sessions")
        }
    }
}

#[derive(Deserialize)]
pub struct RenameBody {
    title: Option<String>,
}

pub async fn rename_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RenameBody>
) -> Response {
    let user_id = match require_caller(&state, &headers) {
        Ok(user) => user,
        Err(resp) => {
            return resp;
        }
    };

    let title = match body.title.as_deref().filter(|t| !t.is_empty()) {
        Some(title) => title,
        None => {
            return error_response(StatusCode::BAD_REQUEST, "title is required");
        }
    };

    match state.store.rename_session(&session_id, &user_id, title).await {
        Ok(true) => Json(json!({ "sessionId": session_id, "title": title })).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => {
            error!("Failed to rename session {}: {}", session_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update session title")
        }
    }
}

pub async fn delete_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap
) -> Response {
    let user_id = match require_caller(&state, &headers) {
        Ok(user) => user,
        Err(resp) => {
            return resp;
        }
    };

    match state.store.delete_session(&session_id, &user_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Session not found"),
        Err(e) => {
            error!("Failed to delete session {}: {}", session_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete session")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ AnonymousVerifier, HmacTokenVerifier };
    use crate::orchestrator::Orchestrator;
    use crate::registry::ModelRegistry;
    use crate::store::memory::MemoryStore;
    use crate::tools::SearchTool;
    use crate::vault::Vault;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoSearch;

    #[async_trait]
    impl SearchTool for NoSearch {
        async fn search(&self, _query: &str) -> String {
            String::new()
        }
    }

    fn state(require_auth: bool, verifier: Arc<dyn crate::auth::TokenVerifier>) -> AppState {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ModelRegistry::empty("http://localhost:11434".into()));
        let orchestrator = Arc::new(
            Orchestrator::new(registry, store.clone(), Arc::new(NoSearch), Vault::new("k"))
        );
        AppState {
            orchestrator,
            store,
            verifier,
            require_auth,
            upload_dir: "uploads".into(),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap()
        );
        headers
    }

    #[test]
    fn frames_serialize_to_the_client_wire_format() {
        assert_eq!(
            frame_json(&ClientFrame::Session { id: "s1".into() }),
            r#"{"sessionId":"s1"}"#
        );
        assert_eq!(
            frame_json(&ClientFrame::Delta { text: "Hel".into() }),
            r#"{"done":false,"message":{"content":"Hel"}}"#
        );
        assert_eq!(
            frame_json(&ClientFrame::Done),
            r#"{"done":true,"message":{"content":""}}"#
        );
    }

    #[test]
    fn anonymous_mode_accepts_missing_token() {
        let state = state(false, Arc::new(AnonymousVerifier));
        assert_eq!(resolve_caller(&state, &HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn auth_mode_rejects_missing_and_bad_tokens() {
        let verifier = Arc::new(HmacTokenVerifier::new("secret".into()));
        let state = state(true, verifier.clone());

        assert!(resolve_caller(&state, &HeaderMap::new()).is_err());
        assert!(resolve_caller(&state, &bearer("bogus")).is_err());

        let token = verifier.issue("u1");
        assert_eq!(
            resolve_caller(&state, &bearer(&token)).unwrap(),
            Some("u1".to_string())
        );
    }
}
