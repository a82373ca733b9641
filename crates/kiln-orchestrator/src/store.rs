//! Conversation store abstraction
//!
//! Messages are owned by the host application; jobs only read a project's
//! history and write their single outcome message.

use async_trait::async_trait;
use kiln_core::{KilnError, Message, MessageUpdate, NewMessage, Result};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Trait for conversation persistence (allows in-memory stores in tests)
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// All messages of a project, oldest first
    async fn messages_for_project(&self, project_id: &str) -> Result<Vec<Message>>;

    /// Insert a new message
    async fn create_message(&self, message: NewMessage) -> Result<Message>;

    /// Update an existing message by id
    async fn update_message(&self, id: &str, update: MessageUpdate) -> Result<Message>;
}

fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
}

/// Store keeping everything in memory
#[derive(Default)]
pub struct InMemoryConversationStore {
    messages: RwLock<Vec<Message>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored message, in insertion order
    pub async fn all(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn messages_for_project(&self, project_id: &str) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect();
        sort_chronologically(&mut messages);
        Ok(messages)
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        let message = Message::from_new(message);
        self.messages.write().await.push(message.clone());
        Ok(message)
    }

    async fn update_message(&self, id: &str, update: MessageUpdate) -> Result<Message> {
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| KilnError::MessageNotFound(id.to_string()))?;
        message.apply(update);
        Ok(message.clone())
    }
}

/// Store writing one JSON document per project
///
/// Layout: `<data_dir>/.kiln/conversations/<project_id>.json`
pub struct FileConversationStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: RwLock<()>,
}

impl FileConversationStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(".kiln").join("conversations"),
            lock: RwLock::new(()),
        }
    }

    fn project_path(&self, project_id: &str) -> Result<PathBuf> {
        let valid = !project_id.is_empty()
            && project_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !project_id.starts_with('.');
        if !valid {
            return Err(KilnError::Store(format!("Invalid project id: {}", project_id)));
        }
        Ok(self.dir.join(format!("{}.json", project_id)))
    }

    async fn load(&self, path: &Path) -> Result<Vec<Message>> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, path: &Path, messages: &[Message]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(messages)?;
        tokio::fs::write(path, json).await?;
        debug!("Saved {} message(s) to {}", messages.len(), path.display());
        Ok(())
    }

    async fn project_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn messages_for_project(&self, project_id: &str) -> Result<Vec<Message>> {
        let _guard = self.lock.read().await;
        let mut messages = self.load(&self.project_path(project_id)?).await?;
        sort_chronologically(&mut messages);
        Ok(messages)
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message> {
        let _guard = self.lock.write().await;
        let path = self.project_path(&message.project_id)?;
        let mut messages = self.load(&path).await?;
        let message = Message::from_new(message);
        messages.push(message.clone());
        self.save(&path, &messages).await?;
        Ok(message)
    }

    async fn update_message(&self, id: &str, update: MessageUpdate) -> Result<Message> {
        let _guard = self.lock.write().await;
        for path in self.project_files().await? {
            let mut messages = self.load(&path).await?;
            if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
                message.apply(update);
                let updated = message.clone();
                self.save(&path, &messages).await?;
                return Ok(updated);
            }
        }
        Err(KilnError::MessageNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{Fragment, MessageRole, MessageType};
    use tempfile::TempDir;

    async fn exercise(store: &dyn ConversationStore) {
        let first = store
            .create_message(NewMessage::user("p1", "build a blog"))
            .await
            .unwrap();
        store
            .create_message(NewMessage::user("p2", "other project"))
            .await
            .unwrap();
        let reply = store
            .create_message(NewMessage::assistant("p1", MessageType::Assistant, "..."))
            .await
            .unwrap();

        let history = store.messages_for_project("p1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first.id);
        assert_eq!(history[1].role, MessageRole::Assistant);

        let fragment = Fragment {
            title: "Blog".into(),
            preview_url: "https://3000-sb.e2b.app".into(),
            files: [("index.md".to_string(), "# Blog".to_string())].into(),
        };
        let updated = store
            .update_message(
                &reply.id,
                NewMessage::assistant("p1", MessageType::Result, "Here is your blog")
                    .with_fragment(fragment.clone())
                    .into(),
            )
            .await
            .unwrap();
        assert_eq!(updated.content, "Here is your blog");
        assert_eq!(updated.message_type, MessageType::Result);
        assert_eq!(updated.fragment, Some(fragment));

        let history = store.messages_for_project("p1").await.unwrap();
        assert_eq!(history[1].content, "Here is your blog");

        let missing = store
            .update_message(
                "nope",
                MessageUpdate {
                    content: "x".into(),
                    message_type: None,
                    fragment: None,
                },
            )
            .await;
        assert!(matches!(missing, Err(KilnError::MessageNotFound(_))));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryConversationStore::new();
        exercise(&store).await;
        assert_eq!(store.all().await.len(), 3);
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = TempDir::new().unwrap();
        let store = FileConversationStore::new(dir.path());
        exercise(&store).await;
        assert!(dir.path().join(".kiln/conversations/p1.json").exists());

        // a fresh instance reads the same data
        let reopened = FileConversationStore::new(dir.path());
        assert_eq!(reopened.messages_for_project("p1").await.unwrap().len(), 2);
        assert!(reopened.messages_for_project("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileConversationStore::new(dir.path());
        let err = store
            .create_message(NewMessage::user("../escape", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Store(_)));
    }
}
