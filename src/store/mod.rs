pub mod memory;
pub mod redis;

use async_trait::async_trait;
use log::info;
use std::error::Error;
use std::sync::Arc;
use crate::cli::Args;
use crate::models::chat::{ ChatTurn, SessionSummary };

/// Session-level fields written only when the session document is being
/// created. An upsert against an existing session never overwrites them.
#[derive(Clone, Debug)]
pub struct SessionMeta {
    pub model: String,
    pub title: String,
    pub user_id: Option<String>,
}

/// Append-only persistence of conversation turns keyed by session id.
/// The orchestrator issues exactly one `upsert_append` per successful
/// exchange; the store must apply the set-on-insert fields and the turn
/// append as one atomic document update.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn upsert_append(
        &self,
        session_id: &str,
        meta: SessionMeta,
        turns: Vec<ChatTurn>
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Turns for one session, oldest first. Unknown session is an empty
    /// list, not an error.
    async fn get_turns(
        &self,
        session_id: &str
    ) -> Result<Vec<ChatTurn>, Box<dyn Error + Send + Sync>>;

    /// Sessions owned by one user, newest first.
    async fn list_sessions(
        &self,
        user_id: &str
    ) -> Result<Vec<SessionSummary>, Box<dyn Error + Send + Sync>>;

    /// Returns false when the session does not exist or belongs to
    /// another user.
    async fn rename_session(
        &self,
        session_id: &str,
        user_id: &str,
        title: &str
    ) -> Result<bool, Box<dyn Error + Send + Sync>>;

    async fn delete_session(
        &self,
        session_id: &str,
        user_id: &str
    ) -> Result<bool, Box<dyn Error + Send + Sync>>;
}

pub fn create_store(args: &Args) -> Result<Arc<dyn ConversationStore>, Box<dyn Error + Send + Sync>> {
    info!("Conversation history will be stored in: {} at {}", args.store_type, args.store_url);
    match args.store_type.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(memory::MemoryStore::new())),
        "redis" => {
            let store = redis::RedisStore::new(&args.store_url, args.store_redis_prefix.clone())?;
            Ok(Arc::new(store))
        }
        other =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported conversation store type: {}", other)
                    )
                )
            ),
    }
}
