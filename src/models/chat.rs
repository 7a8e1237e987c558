use chrono::Utc;
use serde::{ Serialize, Deserialize };

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// Metadata about one uploaded file, kept alongside the turn it arrived with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub path: String,
    pub mimetype: String,
}

/// One message in a conversation. Turns are append-only: once written to a
/// session they are never reordered or mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Base64 image payloads, present only on user turns with image uploads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default = "now_ts")]
    pub timestamp: i64,
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: now_ts(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub user_id: Option<String>,
    pub title: String,
    pub model: String,
    pub turns: Vec<ChatTurn>,
    pub created_at: i64,
}

/// Listing view of a session for the sidebar, newest first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    pub title: String,
}

/// Derive a session title from the first user turn's content.
pub fn derive_title(content: &str) -> String {
    if content.is_empty() {
        return "Chat".to_string();
    }
    content.chars().take(30).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let role: Role = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(role, Role::Tool);
    }

    #[test]
    fn turn_defaults_fill_missing_fields() {
        let turn: ChatTurn = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(turn.role, Role::User);
        assert!(turn.attachments.is_empty());
        assert!(turn.images.is_empty());
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn title_truncates_to_thirty_chars() {
        let long = "a".repeat(50);
        assert_eq!(derive_title(&long).chars().count(), 30);
        assert_eq!(derive_title(""), "Chat");
        assert_eq!(derive_title("hello"), "hello");
    }
}
