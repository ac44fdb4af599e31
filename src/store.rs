//! Append-only audit persistence.
//!
//! The store is write-mostly: the control loops append rows and nothing in
//! the orchestrator reads them back to make decisions. Each table is a
//! sequence of JSON rows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::cluster::{CircuitState, WorkerInstance};
use crate::config::StoreConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTable {
    Jobs,
    SchedulingDecisions,
    ScalingDecisions,
    BreakerSnapshots,
    MetricsRollups,
}

impl AuditTable {
    pub const ALL: [AuditTable; 5] = [
        AuditTable::Jobs,
        AuditTable::SchedulingDecisions,
        AuditTable::ScalingDecisions,
        AuditTable::BreakerSnapshots,
        AuditTable::MetricsRollups,
    ];

    fn file_name(self) -> &'static str {
        match self {
            AuditTable::Jobs => "jobs.jsonl",
            AuditTable::SchedulingDecisions => "scheduling_decisions.jsonl",
            AuditTable::ScalingDecisions => "scaling_decisions.jsonl",
            AuditTable::BreakerSnapshots => "breaker_snapshots.jsonl",
            AuditTable::MetricsRollups => "metrics_rollups.jsonl",
        }
    }
}

/// Breaker state of one instance at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub instance_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub recorded_at: DateTime<Utc>,
}

impl BreakerSnapshot {
    pub fn capture(instance: &WorkerInstance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            state: instance.breaker.state(),
            failure_count: instance.breaker.failure_count(),
            success_count: instance.breaker.success_count(),
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, table: AuditTable, row: Value) -> Result<()>;

    /// Every row of `table` in append order.
    async fn rows(&self, table: AuditTable) -> Result<Vec<Value>>;
}

impl dyn AuditStore {
    pub async fn record<T: Serialize + Sync>(&self, table: AuditTable, row: &T) -> Result<()> {
        self.append(table, serde_json::to_value(row)?).await
    }

    pub async fn read<T: DeserializeOwned>(&self, table: AuditTable) -> Result<Vec<T>> {
        self.rows(table)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(Into::into))
            .collect()
    }
}

/// Builds the store named by the configuration.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn AuditStore>> {
    Ok(match config {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::Jsonl { path } => Arc::new(JsonlStore::open(path).await?),
    })
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<AuditTable, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, table: AuditTable, row: Value) -> Result<()> {
        self.tables.write().await.entry(table).or_default().push(row);
        Ok(())
    }

    async fn rows(&self, table: AuditTable) -> Result<Vec<Value>> {
        Ok(self.tables.read().await.get(&table).cloned().unwrap_or_default())
    }
}

/// One JSON-lines file per table under a directory.
pub struct JsonlStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Opened JSONL audit store");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self, table: AuditTable) -> PathBuf {
        self.dir.join(table.file_name())
    }
}

#[async_trait]
impl AuditStore for JsonlStore {
    async fn append(&self, table: AuditTable, row: Value) -> Result<()> {
        let mut line = serde_json::to_string(&row)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(table))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn rows(&self, table: AuditTable) -> Result<Vec<Value>> {
        let path = self.path(table);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let mut lines = BufReader::new(File::open(&path).await?).lines();
        let mut rows = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line)?);
        }
        Ok(rows)
    }
}
