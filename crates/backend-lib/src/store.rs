// ============================
// crates/backend-lib/src/store.rs
// ============================
//! Session persistence abstraction with a flat-file implementation.
//!
//! The store is deliberately dumb: whole-document reads and writes keyed by
//! session id, queryable by host and status. Read-modify-write cycles are
//! serialized per session by the lifecycle controller, not here.
use crate::error::AppError;
use crate::model::{LivestreamSession, SessionStatus};
use async_trait::async_trait;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::fs as tokio_fs;
use uuid::Uuid;

/// Trait for session storage backends
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session document. Fails if the id already exists.
    async fn insert(&self, session: &LivestreamSession) -> Result<(), AppError>;

    /// Fetch a session document by id.
    async fn get(&self, id: Uuid) -> Result<Option<LivestreamSession>, AppError>;

    /// Overwrite a session document.
    async fn save(&self, session: &LivestreamSession) -> Result<(), AppError>;

    /// List sessions, optionally filtered by host and/or status.
    async fn list(
        &self,
        host_id: Option<Uuid>,
        status: Option<SessionStatus>,
    ) -> Result<Vec<LivestreamSession>, AppError>;

    /// Move an ended session out of the active set.
    async fn archive(&self, id: Uuid) -> Result<(), AppError>;
}

/// Flat-file implementation: one JSON document per session under
/// `active-sessions/`, moved to `finished-sessions/` on archive.
#[derive(Clone)]
pub struct FlatFileStore {
    root: PathBuf,
}

impl FlatFileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("active-sessions"))?;
        fs::create_dir_all(root.join("finished-sessions"))?;
        Ok(Self { root })
    }

    fn doc_path(&self, id: Uuid) -> PathBuf {
        self.root.join("active-sessions").join(format!("{id}.json"))
    }

    fn archive_path(&self, id: Uuid) -> PathBuf {
        self.root
            .join("finished-sessions")
            .join(format!("{id}.json"))
    }

    async fn read_doc(&self, path: &Path) -> Result<Option<LivestreamSession>, AppError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio_fs::read_to_string(path)
            .await
            .map_err(|e| AppError::TransientIo(e.to_string()))?;
        let session = serde_json::from_str(&content)?;
        Ok(Some(session))
    }

    async fn write_doc(&self, path: &Path, session: &LivestreamSession) -> Result<(), AppError> {
        let json = serde_json::to_string_pretty(session)?;
        tokio_fs::write(path, json)
            .await
            .map_err(|e| AppError::TransientIo(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FlatFileStore {
    async fn insert(&self, session: &LivestreamSession) -> Result<(), AppError> {
        let path = self.doc_path(session.id);
        if path.exists() {
            return Err(AppError::InvalidState(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.write_doc(&path, session).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<LivestreamSession>, AppError> {
        if let Some(session) = self.read_doc(&self.doc_path(id)).await? {
            return Ok(Some(session));
        }
        // Ended sessions remain readable for replay/statistics surfaces.
        self.read_doc(&self.archive_path(id)).await
    }

    async fn save(&self, session: &LivestreamSession) -> Result<(), AppError> {
        let path = self.doc_path(session.id);
        let path = if path.exists() || !self.archive_path(session.id).exists() {
            path
        } else {
            self.archive_path(session.id)
        };
        self.write_doc(&path, session).await
    }

    async fn list(
        &self,
        host_id: Option<Uuid>,
        status: Option<SessionStatus>,
    ) -> Result<Vec<LivestreamSession>, AppError> {
        let dir = self.root.join("active-sessions");
        let mut out = Vec::new();

        let mut entries = tokio_fs::read_dir(&dir)
            .await
            .map_err(|e| AppError::TransientIo(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::TransientIo(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Some(session) = self.read_doc(&path).await? else {
                continue;
            };
            if host_id.is_some_and(|h| session.host_id != h) {
                continue;
            }
            if status.is_some_and(|s| session.status != s) {
                continue;
            }
            out.push(session);
        }

        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    async fn archive(&self, id: Uuid) -> Result<(), AppError> {
        let src = self.doc_path(id);
        if src.exists() {
            tokio_fs::rename(src, self.archive_path(id))
                .await
                .map_err(|e| AppError::TransientIo(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (FlatFileStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::new(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_insert_get_roundtrip() {
        let (store, _tmp) = store();
        let session = LivestreamSession::new(Uuid::new_v4(), "Rust 101".to_string());

        store.insert(&session).await.unwrap();
        let loaded = store.get(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.title, "Rust 101");

        assert!(matches!(
            store.insert(&session).await,
            Err(AppError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (store, _tmp) = store();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (store, _tmp) = store();
        let host = Uuid::new_v4();

        let mut live = LivestreamSession::new(host, "live".to_string());
        live.status = SessionStatus::Live;
        let created = LivestreamSession::new(host, "created".to_string());
        let other = LivestreamSession::new(Uuid::new_v4(), "other".to_string());

        for s in [&live, &created, &other] {
            store.insert(s).await.unwrap();
        }

        let by_host = store.list(Some(host), None).await.unwrap();
        assert_eq!(by_host.len(), 2);

        let live_only = store
            .list(Some(host), Some(SessionStatus::Live))
            .await
            .unwrap();
        assert_eq!(live_only.len(), 1);
        assert_eq!(live_only[0].title, "live");
    }

    #[tokio::test]
    async fn test_archive_keeps_session_readable() {
        let (store, _tmp) = store();
        let mut session = LivestreamSession::new(Uuid::new_v4(), "done".to_string());
        session.status = SessionStatus::Ended;
        store.insert(&session).await.unwrap();

        store.archive(session.id).await.unwrap();
        assert!(store.list(None, None).await.unwrap().is_empty());

        let loaded = store.get(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Ended);

        // saves after archive land on the archived document
        store.save(&loaded).await.unwrap();
        assert!(store.get(session.id).await.unwrap().is_some());
    }
}
