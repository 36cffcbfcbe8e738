//! Redis storage for project records and deployment logs
//!
//! Each record is a hash at `project:{id}` so partial updates touch only the
//! supplied fields. Creation and updates run as Lua scripts, which Redis
//! executes atomically. Logs are lists at `logs:{id}` of JSON entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use noskill_common::{
    ContainerBinding, DeploymentStatus, Error, LogEntry, ProjectRecord, ProjectUpdate, Result,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::{debug, info};

use super::{sort_records, LogStore, Registry};

const PROJECT_INDEX: &str = "projects:all";

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 2))
redis.call('SADD', KEYS[2], ARGV[1])
return 1
"#;

// ARGV[1] is "1" when the container binding must be cleared
const UPDATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if ARGV[1] == '1' then
    redis.call('HDEL', KEYS[1], 'container_id', 'port')
end
if #ARGV > 1 then
    redis.call('HSET', KEYS[1], unpack(ARGV, 2))
end
return 1
"#;

fn project_key(id: &str) -> String {
    format!("project:{}", id)
}

fn logs_key(id: &str) -> String {
    format!("logs:{}", id)
}

fn storage_err(err: redis::RedisError) -> Error {
    Error::Storage(err.to_string())
}

/// Redis-backed project registry
pub struct RedisRegistry {
    conn: ConnectionManager,
}

impl RedisRegistry {
    /// Connect to Redis
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Shared connection, for the log store
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn create(&self, record: &ProjectRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let script = Script::new(CREATE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(project_key(&record.id)).key(PROJECT_INDEX);
        invocation.arg(&record.id);
        for (field, value) in encode_record(record) {
            invocation.arg(field).arg(value);
        }

        let created: i32 = invocation.invoke_async(&mut conn).await.map_err(storage_err)?;
        if created == 0 {
            return Err(Error::Storage(format!("project {} already exists", record.id)));
        }

        debug!("Stored project: {}", record.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(project_key(id)).await.map_err(storage_err)?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode_record(&fields).map(Some)
    }

    async fn list(&self) -> Result<Vec<ProjectRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(PROJECT_INDEX).await.map_err(storage_err)?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&id).await? {
                records.push(record);
            }
        }
        sort_records(&mut records);
        Ok(records)
    }

    async fn update(&self, id: &str, update: &ProjectUpdate) -> Result<()> {
        let (clear_binding, fields) = encode_update(update);
        if !clear_binding && fields.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let script = Script::new(UPDATE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(project_key(id));
        invocation.arg(if clear_binding { "1" } else { "0" });
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let updated: i32 = invocation.invoke_async(&mut conn).await.map_err(storage_err)?;
        debug!("Updated project: {} (found: {})", id, updated == 1);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(project_key(id)).await.map_err(storage_err)?;
        let _: () = conn.srem(PROJECT_INDEX, id).await.map_err(storage_err)?;
        Ok(removed > 0)
    }
}

/// Redis-backed deployment log store
pub struct RedisLogStore {
    conn: ConnectionManager,
}

impl RedisLogStore {
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn append(&self, id: &str, message: &str) -> Result<()> {
        let json = serde_json::to_string(&LogEntry::now(message))?;
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(logs_key(id), json).await.map_err(storage_err)?;
        Ok(())
    }

    async fn read_all(&self, id: &str) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let lines: Vec<String> = conn.lrange(logs_key(id), 0, -1).await.map_err(storage_err)?;

        lines
            .iter()
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }

    async fn clear(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(logs_key(id)).await.map_err(storage_err)?;
        Ok(())
    }
}

fn encode_record(record: &ProjectRecord) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", record.id.clone()),
        ("name", record.name.clone()),
        ("github_url", record.github_url.clone()),
        ("domain", record.domain.clone()),
        ("status", record.status.as_str().to_string()),
        ("created_at", record.created_at.to_rfc3339()),
    ];
    if let Some(last_deployed) = record.last_deployed {
        fields.push(("last_deployed", last_deployed.to_rfc3339()));
    }
    if let Some(binding) = &record.binding {
        fields.push(("container_id", binding.container_id.clone()));
        fields.push(("port", binding.port.to_string()));
    }
    fields
}

/// Returns whether the binding must be cleared, and the fields to set
fn encode_update(update: &ProjectUpdate) -> (bool, Vec<(&'static str, String)>) {
    let mut fields = Vec::new();
    if let Some(status) = update.status {
        fields.push(("status", status.as_str().to_string()));
    }
    if let Some(last_deployed) = update.last_deployed {
        fields.push(("last_deployed", last_deployed.to_rfc3339()));
    }

    let mut clear_binding = false;
    match &update.binding {
        Some(Some(binding)) => {
            fields.push(("container_id", binding.container_id.clone()));
            fields.push(("port", binding.port.to_string()));
        }
        Some(None) => clear_binding = true,
        None => {}
    }
    (clear_binding, fields)
}

fn decode_record(fields: &HashMap<String, String>) -> Result<ProjectRecord> {
    let field = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("project hash is missing '{}'", name)))
    };
    let timestamp = |raw: &str| {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Storage(format!("bad timestamp '{}': {}", raw, e)))
    };

    let status: DeploymentStatus = field("status")?.parse().map_err(Error::Storage)?;
    let last_deployed = match fields.get("last_deployed") {
        Some(raw) => Some(timestamp(raw)?),
        None => None,
    };
    let binding = match (fields.get("container_id"), fields.get("port")) {
        (Some(container_id), Some(port)) => Some(ContainerBinding {
            container_id: container_id.clone(),
            port: port
                .parse()
                .map_err(|_| Error::Storage(format!("bad port '{}'", port)))?,
        }),
        _ => None,
    };

    Ok(ProjectRecord {
        id: field("id")?,
        name: field("name")?,
        github_url: field("github_url")?,
        domain: field("domain")?,
        status,
        created_at: timestamp(&field("created_at")?)?,
        last_deployed,
        binding,
    })
}
