//! In-memory registry and log store.
//!
//! `DashMap` shards its locks, so writers to one project id serialize while
//! other ids proceed. Data is lost when the process exits.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use noskill_common::{Error, LogEntry, ProjectRecord, ProjectUpdate, Result};

use super::{sort_records, LogStore, Registry};

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    projects: DashMap<String, ProjectRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn create(&self, record: &ProjectRecord) -> Result<()> {
        match self.projects.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(Error::Storage(format!(
                "project {} already exists",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>> {
        Ok(self.projects.get(id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<ProjectRecord>> {
        let mut records: Vec<ProjectRecord> =
            self.projects.iter().map(|r| r.value().clone()).collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn update(&self, id: &str, update: &ProjectUpdate) -> Result<()> {
        if let Some(mut record) = self.projects.get_mut(id) {
            record.apply(update);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.projects.remove(id).is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLogStore {
    logs: DashMap<String, Vec<LogEntry>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, id: &str, message: &str) -> Result<()> {
        // Stamp under the entry lock so timestamps never run backwards
        self.logs
            .entry(id.to_string())
            .or_default()
            .push(LogEntry::now(message));
        Ok(())
    }

    async fn read_all(&self, id: &str) -> Result<Vec<LogEntry>> {
        Ok(self
            .logs
            .get(id)
            .map(|entries| entries.value().clone())
            .unwrap_or_default())
    }

    async fn clear(&self, id: &str) -> Result<()> {
        self.logs.remove(id);
        Ok(())
    }
}
