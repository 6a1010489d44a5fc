//! Conversation Store (C12): one JSON file per conversation, written with
//! write-temp-then-rename so a crash mid-write never corrupts an existing
//! file, and a per-ID mutex registry so concurrent stage appends to the same
//! conversation serialize instead of racing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("conversation '{0}' was not found")]
    NotFound(String),
    #[error("I/O error accessing conversation store: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed conversation record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// One council member's Stage 1 answer, as persisted on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage1Entry {
    pub model: String,
    pub response: Option<String>,
}

/// One evaluator's Stage 2 ranking, as persisted on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2Entry {
    pub model: String,
    pub ranking: String,
    #[serde(rename = "parsedRanking")]
    pub parsed_ranking: Vec<String>,
}

/// The chairman's Stage 3 answer, as persisted on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage3Entry {
    pub model: String,
    pub response: String,
}

/// A conversation turn. A user message is just its text; an assistant
/// message is the full projection of the three deliberation stages rather
/// than a single flattened answer, so a client can render the whole
/// council's work, not just the chairman's synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User {
        content: String,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
    Assistant {
        stage1: Vec<Stage1Entry>,
        stage2: Vec<Stage2Entry>,
        stage3: Stage3Entry,
        #[serde(rename = "createdAt")]
        created_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub title: String,
    pub messages: Vec<Message>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: "New Conversation".to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persistence abstraction over conversations (C12). Kept as an
/// object-safe trait, mirroring the teacher's `Arc<dyn Backend>` pattern, so
/// the HTTP layer and the engine can depend on it without caring whether the
/// backing store is the filesystem or something else in a later deployment.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, StorageError>;
    async fn get(&self, id: &str) -> Result<Conversation, StorageError>;
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Conversation>, StorageError>;
    async fn append_user_message(
        &self,
        id: &str,
        content: String,
    ) -> Result<Conversation, StorageError>;
    async fn append_assistant_message(
        &self,
        id: &str,
        stage1: Vec<Stage1Entry>,
        stage2: Vec<Stage2Entry>,
        stage3: Stage3Entry,
    ) -> Result<Conversation, StorageError>;
    async fn update_title(&self, id: &str, title: String) -> Result<Conversation, StorageError>;
}

fn sanitize_id(id: &str) -> Option<&str> {
    if !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Some(id)
    } else {
        None
    }
}

/// File-backed store: one `<id>.json` file per conversation under `dir`.
pub struct FileConversationStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StorageError> {
        let safe = sanitize_id(id).ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Ok(self.dir.join(format!("{safe}.json")))
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read(&self, path: &Path) -> Result<Conversation, StorageError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|_| StorageError::NotFound(path.display().to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_atomic(&self, path: &Path, conversation: &Conversation) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(conversation)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Shared read-modify-write for the two append operations: the whole
    /// file is replaced, never appended to in place, since the schema
    /// requires one valid JSON document per conversation.
    async fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(&mut Conversation),
    ) -> Result<Conversation, StorageError> {
        let path = self.path_for(id)?;
        let guard = self.lock_for(id).await;
        let _permit = guard.lock().await;
        let mut conversation = self.read(&path).await?;
        f(&mut conversation);
        conversation.updated_at = Utc::now();
        self.write_atomic(&path, &conversation).await?;
        Ok(conversation)
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, StorageError> {
        let path = self.path_for(&conversation.id)?;
        let guard = self.lock_for(&conversation.id).await;
        let _permit = guard.lock().await;
        self.write_atomic(&path, &conversation).await?;
        Ok(conversation)
    }

    async fn get(&self, id: &str) -> Result<Conversation, StorageError> {
        let path = self.path_for(id)?;
        self.read(&path).await
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Conversation>, StorageError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let conversation = self.read(&path).await?;
                if conversation.user_id == user_id {
                    out.push(conversation);
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn append_user_message(
        &self,
        id: &str,
        content: String,
    ) -> Result<Conversation, StorageError> {
        self.mutate(id, |conversation| {
            conversation.messages.push(Message::User {
                content,
                created_at: Utc::now(),
            });
        })
        .await
    }

    async fn append_assistant_message(
        &self,
        id: &str,
        stage1: Vec<Stage1Entry>,
        stage2: Vec<Stage2Entry>,
        stage3: Stage3Entry,
    ) -> Result<Conversation, StorageError> {
        self.mutate(id, |conversation| {
            conversation.messages.push(Message::Assistant {
                stage1,
                stage2,
                stage3,
                created_at: Utc::now(),
            });
        })
        .await
    }

    async fn update_title(&self, id: &str, title: String) -> Result<Conversation, StorageError> {
        self.mutate(id, |conversation| {
            conversation.title = title;
        })
        .await
    }
}

/// No-op store used in engine-level tests that never touch persistence.
pub struct NullStore;

#[async_trait]
impl ConversationStore for NullStore {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, StorageError> {
        Ok(conversation)
    }
    async fn get(&self, id: &str) -> Result<Conversation, StorageError> {
        Err(StorageError::NotFound(id.to_string()))
    }
    async fn list_by_user(&self, _user_id: &str) -> Result<Vec<Conversation>, StorageError> {
        Ok(Vec::new())
    }
    async fn append_user_message(&self, id: &str, _content: String) -> Result<Conversation, StorageError> {
        Err(StorageError::NotFound(id.to_string()))
    }
    async fn append_assistant_message(
        &self,
        id: &str,
        _stage1: Vec<Stage1Entry>,
        _stage2: Vec<Stage2Entry>,
        _stage3: Stage3Entry,
    ) -> Result<Conversation, StorageError> {
        Err(StorageError::NotFound(id.to_string()))
    }
    async fn update_title(&self, id: &str, _title: String) -> Result<Conversation, StorageError> {
        Err(StorageError::NotFound(id.to_string()))
    }
}

pub fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("llm-council-store-test-{}", Uuid::new_v4()));
        dir
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = FileConversationStore::new(temp_dir());
        let conv = Conversation::new("conv-1", "user-1");
        store.create(conv.clone()).await.unwrap();
        let fetched = store.get("conv-1").await.unwrap();
        assert_eq!(fetched.id, "conv-1");
        assert_eq!(fetched.title, "New Conversation");
    }

    #[tokio::test]
    async fn get_missing_conversation_errors() {
        let store = FileConversationStore::new(temp_dir());
        let err = store.get("does-not-exist").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn append_user_message_persists_and_updates_timestamp() {
        let store = FileConversationStore::new(temp_dir());
        let conv = Conversation::new("conv-2", "user-1");
        let created_at = conv.created_at;
        store.create(conv).await.unwrap();

        let updated = store
            .append_user_message("conv-2", "hi".to_string())
            .await
            .unwrap();
        assert_eq!(updated.messages.len(), 1);
        assert!(updated.updated_at >= created_at);
        assert!(matches!(&updated.messages[0], Message::User { content, .. } if content == "hi"));
    }

    #[tokio::test]
    async fn append_assistant_message_persists_all_three_stages() {
        let store = FileConversationStore::new(temp_dir());
        store
            .create(Conversation::new("conv-3", "user-1"))
            .await
            .unwrap();
        let updated = store
            .append_assistant_message(
                "conv-3",
                vec![Stage1Entry {
                    model: "m1".to_string(),
                    response: Some("hi".to_string()),
                }],
                vec![Stage2Entry {
                    model: "m1".to_string(),
                    ranking: "FINAL RANKING:\n1. Response A".to_string(),
                    parsed_ranking: vec!["Response A".to_string()],
                }],
                Stage3Entry {
                    model: "chairman".to_string(),
                    response: "final".to_string(),
                },
            )
            .await
            .unwrap();
        match &updated.messages[0] {
            Message::Assistant { stage1, stage2, stage3, .. } => {
                assert_eq!(stage1.len(), 1);
                assert_eq!(stage2.len(), 1);
                assert_eq!(stage3.response, "final");
            }
            _ => panic!("expected assistant message"),
        }
    }

    #[tokio::test]
    async fn create_is_last_write_wins_for_duplicate_ids() {
        let store = FileConversationStore::new(temp_dir());
        let mut first = Conversation::new("dup", "user-1");
        first.title = "first".to_string();
        store.create(first).await.unwrap();
        let mut second = Conversation::new("dup", "user-1");
        second.title = "second".to_string();
        store.create(second).await.unwrap();
        let fetched = store.get("dup").await.unwrap();
        assert_eq!(fetched.title, "second");
    }

    #[tokio::test]
    async fn list_by_user_filters_to_owning_user() {
        let store = FileConversationStore::new(temp_dir());
        store.create(Conversation::new("a", "alice")).await.unwrap();
        store.create(Conversation::new("b", "bob")).await.unwrap();
        let alice_convos = store.list_by_user("alice").await.unwrap();
        assert_eq!(alice_convos.len(), 1);
        assert_eq!(alice_convos[0].id, "a");
    }

    #[tokio::test]
    async fn list_is_empty_for_missing_directory() {
        let store = FileConversationStore::new(temp_dir());
        assert!(store.list_by_user("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_path_traversal_in_conversation_id() {
        let store = FileConversationStore::new(temp_dir());
        let err = store.get("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_title_persists() {
        let store = FileConversationStore::new(temp_dir());
        store.create(Conversation::new("conv-4", "user-1")).await.unwrap();
        let updated = store
            .update_title("conv-4", "Renamed".to_string())
            .await
            .unwrap();
        assert_eq!(updated.title, "Renamed");
    }
}
