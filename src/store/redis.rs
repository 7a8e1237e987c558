use async_trait::async_trait;
use chrono::Utc;
use log::error;
use redis::{ AsyncCommands, Client };
use std::collections::HashMap;
use std::error::Error;

use super::{ ConversationStore, SessionMeta };
use crate::models::chat::{ ChatTurn, SessionSummary };

/// Redis-backed conversation store. Layout per session:
///   {prefix}meta:{id}   hash  - set-on-insert fields + created_at
///   {prefix}turns:{id}  list  - JSON-encoded turns, append order
///   {prefix}user:{uid}  set   - session ids owned by the user
pub struct RedisStore {
    client: Client,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(url: &str, key_prefix: String) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(Self {
            client: Client::open(url)?,
            key_prefix,
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    fn meta_key(&self, session_id: &str) -> String {
        format!("{}meta:{}", self.key_prefix, session_id)
    }

    fn turns_key(&self, session_id: &str) -> String {
        format!("{}turns:{}", self.key_prefix, session_id)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}user:{}", self.key_prefix, user_id)
    }
}

#[async_trait]
impl ConversationStore for RedisStore {
    async fn upsert_append(
        &self,
        session_id: &str,
        meta: SessionMeta,
        turns: Vec<ChatTurn>
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let meta_key = self.meta_key(session_id);
        let turns_key = self.turns_key(session_id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        // HSETNX gives the set-on-insert semantics: only the exchange that
        // creates the session writes these fields.
        pipe.cmd("HSETNX").arg(&meta_key).arg("model").arg(&meta.model).ignore();
        pipe.cmd("HSETNX").arg(&meta_key).arg("title").arg(&meta.title).ignore();
        pipe.cmd("HSETNX")
            .arg(&meta_key)
            .arg("created_at")
            .arg(Utc::now().timestamp())
            .ignore();
        if let Some(user_id) = &meta.user_id {
            pipe.cmd("HSETNX").arg(&meta_key).arg("user_id").arg(user_id).ignore();
            pipe.cmd("SADD").arg(self.user_key(user_id)).arg(session_id).ignore();
        }
        for turn in &turns {
            pipe.cmd("RPUSH").arg(&turns_key).arg(serde_json::to_string(turn)?).ignore();
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get_turns(
        &self,
        session_id: &str
    ) -> Result<Vec<ChatTurn>, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let entries: Vec<String> = conn.lrange(self.turns_key(session_id), 0, -1).await?;

        let mut turns = Vec::with_capacity(entries.len());
        for entry in &entries {
            match serde_json::from_str::<ChatTurn>(entry) {
                Ok(turn) => turns.push(turn),
                Err(e) => {
                    error!("Error parsing stored turn: {}", e);
                }
            }
        }
        Ok(turns)
    }

    async fn list_sessions(
        &self,
        user_id: &str
    ) -> Result<Vec<SessionSummary>, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let session_ids: Vec<String> = conn.smembers(self.user_key(user_id)).await?;

        let mut list = Vec::with_capacity(session_ids.len());
        for session_id in &session_ids {
            let meta: HashMap<String, String> = conn.hgetall(self.meta_key(session_id)).await?;
            if meta.is_empty() {
                continue;
            }
            list.push(SessionSummary {
                session_id: session_id.clone(),
                created_at: meta
                    .get("created_at")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                title: meta
                    .get("title")
                    .filter(|t| !t.is_empty())
                    .cloned()
                    .unwrap_or_else(|| "New Chat".to_string()),
            });
        }
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn rename_session(
        &self,
        session_id: &str,
        user_id: &str,
        title: &str
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let owner: Option<String> = conn.hget(self.meta_key(session_id), "user_id").await?;
        if owner.as_deref() != Some(user_id) {
            return Ok(false);
        }
        let _: () = conn.hset(self.meta_key(session_id), "title", title).await?;
        Ok(true)
    }

    async fn delete_session(
        &self,
        session_id: &str,
        user_id: &str
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let mut conn = self.get_connection().await?;
        let owner: Option<String> = conn.hget(self.meta_key(session_id), "user_id").await?;
        if owner.as_deref() != Some(user_id) {
            return Ok(false);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(self.meta_key(session_id)).ignore();
        pipe.cmd("DEL").arg(self.turns_key(session_id)).ignore();
        pipe.cmd("SREM").arg(self.user_key(user_id)).arg(session_id).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(true)
    }
}
