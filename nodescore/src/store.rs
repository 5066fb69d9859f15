//! Durable metrics rows. The collector writes one row per cycle; the API reads the newest back.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::history::push_capped;
use crate::types::{MetricSample, NodeId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node {0} is not known to the store")]
    UnknownNode(NodeId),
    #[error("store i/o: {0}")]
    Io(#[from] io::Error),
    #[error("cannot encode row: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn save_metric_sample(&self, node: &NodeId, sample: &MetricSample) -> Result<(), StoreError>;

    /// Newest first, at most `limit` rows.
    async fn recent_samples(&self, node: &NodeId, limit: usize) -> Result<Vec<MetricSample>, StoreError>;
}

pub struct MemoryStore {
    max_rows: usize,
    rows: Mutex<HashMap<NodeId, VecDeque<MetricSample>>>,
}

impl MemoryStore {
    pub fn new(max_rows: usize) -> Self {
        Self {
            max_rows: max_rows.max(1),
            rows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn save_metric_sample(&self, node: &NodeId, sample: &MetricSample) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        let q = rows.entry(node.clone()).or_default();
        push_capped(q, sample.clone(), self.max_rows);
        Ok(())
    }

    async fn recent_samples(&self, node: &NodeId, limit: usize) -> Result<Vec<MetricSample>, StoreError> {
        let rows = self.rows.lock();
        let Some(q) = rows.get(node) else {
            return Err(StoreError::UnknownNode(node.clone()));
        };
        Ok(q.iter().rev().take(limit).cloned().collect())
    }
}

// Reads walk the file backwards in blocks of this size.
const READ_CHUNK: u64 = 64 * 1024;

/// Append-only JSON lines file, one `MetricSample` per line. Reads scan from the
/// end, so the cost of `recent_samples` follows `limit`, not the file size.
pub struct JsonlStore {
    path: PathBuf,
    // serializes appends so lines from concurrent cycles never interleave
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricsStore for JsonlStore {
    async fn save_metric_sample(&self, node: &NodeId, sample: &MetricSample) -> Result<(), StoreError> {
        debug_assert_eq!(node, &sample.node_id);
        let mut line = serde_json::to_vec(sample)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        f.write_all(&line).await?;
        f.flush().await?;
        Ok(())
    }

    async fn recent_samples(&self, node: &NodeId, limit: usize) -> Result<Vec<MetricSample>, StoreError> {
        let mut file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut pos = file.metadata().await?.len();
        // bytes of a line that started before the block read last
        let mut carry: Vec<u8> = Vec::new();
        let mut out: Vec<MetricSample> = Vec::new();

        while pos > 0 && out.len() < limit {
            let step = READ_CHUNK.min(pos);
            pos -= step;
            file.seek(SeekFrom::Start(pos)).await?;
            let mut buf = vec![0u8; step as usize];
            file.read_exact(&mut buf).await?;
            buf.extend_from_slice(&carry);

            // the first line of a block is only complete at the start of the file
            let start = if pos == 0 {
                0
            } else {
                match buf.iter().position(|b| *b == b'\n') {
                    Some(i) => i + 1,
                    None => {
                        carry = buf;
                        continue;
                    }
                }
            };
            for line in buf[start..].split(|b| *b == b'\n').rev() {
                if out.len() >= limit {
                    break;
                }
                // a torn last line from a crash is skipped, not fatal
                let Ok(s) = serde_json::from_slice::<MetricSample>(line) else {
                    continue;
                };
                if &s.node_id == node {
                    out.push(s);
                }
            }
            carry = if start == 0 {
                Vec::new()
            } else {
                buf[..start - 1].to_vec()
            };
        }
        Ok(out)
    }
}
