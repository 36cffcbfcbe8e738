//! Project registry and deployment log storage.
//!
//! Both stores are traits so the orchestrator never depends on a concrete
//! backend. The in-memory implementations are the default; the Redis ones
//! survive a restart of the service.

mod memory;
mod redis_store;

pub use self::memory::{MemoryLogStore, MemoryRegistry};
pub use self::redis_store::{RedisLogStore, RedisRegistry};

use async_trait::async_trait;
use noskill_common::{LogEntry, ProjectRecord, ProjectUpdate, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::StorageBackend;

/// Authoritative store of project records.
///
/// Operations on the same id are linearized; operations on different ids
/// must not block each other.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Insert a new record. Fails if the id is already taken.
    async fn create(&self, record: &ProjectRecord) -> Result<()>;

    /// Get a record by id.
    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>>;

    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<ProjectRecord>>;

    /// Merge the mutable fields in `update`. Unknown ids are ignored.
    async fn update(&self, id: &str, update: &ProjectUpdate) -> Result<()>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Append-only, per-project deployment log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Timestamp `message` and append it to the project's log
    async fn append(&self, id: &str, message: &str) -> Result<()>;

    /// Ordered snapshot of the project's log. Unknown ids yield an empty log.
    async fn read_all(&self, id: &str) -> Result<Vec<LogEntry>>;

    /// Drop the project's log
    async fn clear(&self, id: &str) -> Result<()>;
}

/// Sort records oldest first, breaking ties by id
pub(crate) fn sort_records(records: &mut [ProjectRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Open the stores selected by configuration
pub async fn connect(backend: &StorageBackend) -> anyhow::Result<(Arc<dyn Registry>, Arc<dyn LogStore>)> {
    match backend {
        StorageBackend::Memory => {
            info!("Using in-memory project storage");
            Ok((Arc::new(MemoryRegistry::new()), Arc::new(MemoryLogStore::new())))
        }
        StorageBackend::Redis { url } => {
            let registry = RedisRegistry::new(url).await?;
            let logs = RedisLogStore::from_connection(registry.connection());
            Ok((Arc::new(registry), Arc::new(logs)))
        }
    }
}

/// Writes deployment progress for one project.
///
/// Every line is mirrored to tracing. A failing log backend never fails the
/// deployment that is writing to it.
#[derive(Clone)]
pub struct ProjectLog {
    store: Arc<dyn LogStore>,
    project_id: String,
}

impl ProjectLog {
    pub fn new(store: Arc<dyn LogStore>, project_id: impl Into<String>) -> Self {
        Self {
            store,
            project_id: project_id.into(),
        }
    }

    /// Append a progress message
    pub async fn line(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(project_id = %self.project_id, "{}", message);
        self.store_line(message).await;
    }

    /// Append a line of tool output (build steps and the like)
    pub async fn output(&self, line: &str) {
        debug!(project_id = %self.project_id, "{}", line);
        self.store_line(line).await;
    }

    async fn store_line(&self, message: &str) {
        if let Err(e) = self.store.append(&self.project_id, message).await {
            error!(project_id = %self.project_id, "Failed to append log line: {}", e);
        }
    }
}
