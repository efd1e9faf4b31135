//! 事件日志存储
//!
//! 每个会话一个只追加的事件序列。三种后端：
//! - NoopEventStore：丢弃所有事件（测试 / 无状态运行）
//! - InMemoryEventStore：进程内 HashMap
//! - FileEventStore：`<base>/<session_id>/events.jsonl`，每行一个事件，读取时跳过损坏行

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::session::event::{EventRecord, SessionEvent};

/// 文件后端默认目录
pub const DEFAULT_SESSION_DIR: &str = ".agent-sessions";

const EVENTS_FILE: &str = "events.jsonl";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// 事件存储 trait：追加、全量读取、存在性查询；同一会话内读出顺序等于追加顺序
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, session_id: &str, event: &SessionEvent) -> Result<(), StoreError>;

    /// 按追加顺序返回会话全部事件；会话不存在时返回空
    async fn read_events(&self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError>;

    async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError>;

    async fn flush(&self, _session_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError>;
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventStore;

#[async_trait]
impl EventStore for NoopEventStore {
    async fn append_event(&self, _session_id: &str, _event: &SessionEvent) -> Result<(), StoreError> {
        Ok(())
    }

    async fn read_events(&self, _session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        Ok(Vec::new())
    }

    async fn session_exists(&self, _session_id: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn delete_session(&self, _session_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    sessions: RwLock<HashMap<String, Vec<SessionEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clear(&self) {
        self.sessions.write().await.clear();
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_event(&self, session_id: &str, event: &SessionEvent) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn read_events(&self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.read().await.contains_key(session_id))
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// JSONL 文件存储；同一会话的追加由会话级锁串行化，不同会话互不阻塞
#[derive(Debug)]
pub struct FileEventStore {
    base_dir: PathBuf,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for FileEventStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_DIR)
    }
}

impl FileEventStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_session_id(session_id)?;
        Ok(self.base_dir.join(session_id))
    }

    fn events_path(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.session_dir(session_id)?.join(EVENTS_FILE))
    }

    async fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append_event(&self, session_id: &str, event: &SessionEvent) -> Result<(), StoreError> {
        let dir = self.session_dir(session_id)?;
        let path = dir.join(EVENTS_FILE);
        let mut line = serde_json::to_string(&event.to_record()?)?;
        line.push('\n');

        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.flush().await.map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    async fn read_events(&self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        let path = self.events_path(session_id)?;
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut events = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(line) {
                Ok(record) => events.push(SessionEvent::from_record(record)),
                Err(e) => {
                    tracing::warn!(
                        session_id,
                        line = line_no + 1,
                        error = %e,
                        "Skipping malformed event line"
                    );
                }
            }
        }
        Ok(events)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError> {
        let dir = self.session_dir(session_id)?;
        Ok(tokio::fs::try_exists(&dir).await.unwrap_or(false))
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;
        let removed = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir, e)),
        };
        self.write_locks.lock().await.remove(session_id);
        removed
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.base_dir, e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.base_dir, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// 会话 id 作为目录名使用：仅允许字母数字与 `_` `-` `.`，且不能是 `.` / `..`
pub fn validate_session_id(session_id: &str) -> Result<(), StoreError> {
    let valid = !session_id.is_empty()
        && session_id != "."
        && session_id != ".."
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidSessionId(session_id.to_string()))
    }
}
