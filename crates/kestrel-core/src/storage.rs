use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;

use kestrel_types::Message;

/// Where a conversation goes after every change.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()>;

    async fn load(&self, session_id: &str) -> anyhow::Result<Vec<Message>>;

    /// Per-session directory for session-scoped tool state such as the plan.
    fn session_dir(&self, _session_id: &str) -> Option<PathBuf> {
        None
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<String, Vec<Message>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn save(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), messages.to_vec());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// `<base>/<session_id>.json`, rewritten whole on every save. Session state
/// lives next to it under `<base>/<session_id>/`.
#[derive(Clone)]
pub struct JsonFileStore {
    base: PathBuf,
}

impl JsonFileStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    fn file_for(&self, session_id: &str) -> anyhow::Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            anyhow::bail!("invalid session id `{session_id}`");
        }
        Ok(self.base.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn save(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        let path = self.file_for(session_id)?;
        let payload = serde_json::to_string_pretty(messages)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        let path = self.file_for(session_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn session_dir(&self, session_id: &str) -> Option<PathBuf> {
        self.file_for(session_id)
            .ok()
            .map(|_| self.base.join(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_store_round_trips_a_conversation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path().join("sessions"))
            .await
            .expect("store");
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        store.save("s-1", &messages).await.expect("save");
        assert_eq!(store.load("s-1").await.expect("load"), messages);
        assert!(store.load("missing").await.expect("load").is_empty());
        assert_eq!(
            store.session_dir("s-1"),
            Some(dir.path().join("sessions").join("s-1"))
        );
    }

    #[tokio::test]
    async fn json_store_rejects_path_like_session_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(dir.path()).await.expect("store");
        assert!(store.save("../escape", &[]).await.is_err());
        assert!(store.session_dir("a/b").is_none());
    }
}
