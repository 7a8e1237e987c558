use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::error::Error;
use tokio::sync::Mutex;

use super::{ ConversationStore, SessionMeta };
use crate::models::chat::{ derive_title, ChatTurn, ConversationSession, Role, SessionSummary };

/// In-memory store for tests and single-process deployments without a
/// Redis instance. The mutex makes each upsert document-atomic, so the
/// set-on-insert fields cannot race between concurrent exchanges.
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, ConversationSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn upsert_append(
        &self,
        session_id: &str,
        meta: SessionMeta,
        turns: Vec<ChatTurn>
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ConversationSession {
                session_id: session_id.to_string(),
                user_id: meta.user_id.clone(),
                title: meta.title.clone(),
                model: meta.model.clone(),
                turns: Vec::new(),
                created_at: Utc::now().timestamp(),
            });
        session.turns.extend(turns);
        Ok(())
    }

    async fn get_turns(
        &self,
        session_id: &str
    ) -> Result<Vec<ChatTurn>, Box<dyn Error + Send + Sync>> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(session_id).map(|s| s.turns.clone()).unwrap_or_default())
    }

    async fn list_sessions(
        &self,
        user_id: &str
    ) -> Result<Vec<SessionSummary>, Box<dyn Error + Send + Sync>> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| s.user_id.as_deref() == Some(user_id))
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                created_at: s.created_at,
                title: if s.title.is_empty() {
                    s.turns
                        .iter()
                        .find(|t| t.role == Role::User)
                        .map(|t| derive_title(&t.content))
                        .unwrap_or_else(|| "New Chat".to_string())
                } else {
                    s.title.clone()
                },
            })
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn rename_session(
        &self,
        session_id: &str,
        user_id: &str,
        title: &str
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(session) if session.user_id.as_deref() == Some(user_id) => {
                session.title = title.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_session(
        &self,
        session_id: &str,
        user_id: &str
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some(session) if session.user_id.as_deref() == Some(user_id) => {
                sessions.remove(session_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(user: &str) -> SessionMeta {
        SessionMeta {
            model: "llama3".to_string(),
            title: "first message".to_string(),
            user_id: Some(user.to_string()),
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_only_appends() {
        let store = MemoryStore::new();
        store
            .upsert_append(
                "s1",
                meta("u1"),
                vec![ChatTurn::new(Role::User, "hi"), ChatTurn::new(Role::Assistant, "hello")]
            ).await
            .unwrap();

        // Second exchange with different meta must not rewrite title/owner.
        let mut second = meta("u2");
        second.title = "other title".to_string();
        store
            .upsert_append(
                "s1",
                second,
                vec![ChatTurn::new(Role::User, "more"), ChatTurn::new(Role::Assistant, "sure")]
            ).await
            .unwrap();

        let turns = store.get_turns("s1").await.unwrap();
        assert_eq!(turns.len(), 4);

        let list = store.list_sessions("u1").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "first message");
        assert!(store.list_sessions("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_reads_empty() {
        let store = MemoryStore::new();
        assert!(store.get_turns("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_and_delete_enforce_ownership() {
        let store = MemoryStore::new();
        store
            .upsert_append("s1", meta("u1"), vec![ChatTurn::new(Role::User, "hi")]).await
            .unwrap();

        assert!(!store.rename_session("s1", "intruder", "stolen").await.unwrap());
        assert!(store.rename_session("s1", "u1", "renamed").await.unwrap());
        assert_eq!(store.list_sessions("u1").await.unwrap()[0].title, "renamed");

        assert!(!store.delete_session("s1", "intruder").await.unwrap());
        assert!(store.delete_session("s1", "u1").await.unwrap());
        assert!(store.list_sessions("u1").await.unwrap().is_empty());
    }
}
