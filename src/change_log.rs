//! Change log
//!
//! Every node/edge mutation produces one [`ChangeTrx`] carrying the before
//! and after images. Records of one execution call share a transaction id
//! and reach the configured [`ChangeTraceSink`] only once the batch commits.
//!
//! File format of [`FileChangeLog`]:
//!
//! ```text
//! [magic u32 LE][version u32 LE]
//! [len u32 LE][bincode ChangeTrx] ...
//! ```

use crate::error::{GraphError, Result};
use crate::graph::{GraphEdge, GraphMap, GraphNode};
use crate::types::{new_id, now};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Change log file magic number
const LOG_MAGIC: u32 = 0x57A2_0001;

/// Change log format version
const LOG_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeTrxType {
    NodeAdd,
    NodeChange,
    NodeDelete,
    EdgeAdd,
    EdgeChange,
    EdgeDelete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEntity {
    Node(GraphNode),
    Edge(GraphEdge),
}

impl ChangeEntity {
    pub fn key(&self) -> &str {
        match self {
            ChangeEntity::Node(node) => &node.key,
            ChangeEntity::Edge(edge) => &edge.key,
        }
    }

    pub fn as_node(&self) -> Option<&GraphNode> {
        match self {
            ChangeEntity::Node(node) => Some(node),
            ChangeEntity::Edge(_) => None,
        }
    }

    pub fn as_edge(&self) -> Option<&GraphEdge> {
        match self {
            ChangeEntity::Edge(edge) => Some(edge),
            ChangeEntity::Node(_) => None,
        }
    }
}

/// Audit entry for one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeTrx {
    pub trx_type: ChangeTrxType,
    /// Shared by every record of one execution call.
    pub trx_id: String,
    /// Per-record correlation id.
    pub log_key: String,
    pub before: Option<ChangeEntity>,
    pub after: Option<ChangeEntity>,
    pub date: DateTime<Utc>,
}

impl ChangeTrx {
    fn new(trx_type: ChangeTrxType, trx_id: &str, before: Option<ChangeEntity>, after: Option<ChangeEntity>) -> Self {
        ChangeTrx {
            trx_type,
            trx_id: trx_id.to_string(),
            log_key: new_id(),
            before,
            after,
            date: now(),
        }
    }

    pub fn node_add(trx_id: &str, node: GraphNode) -> Self {
        Self::new(ChangeTrxType::NodeAdd, trx_id, None, Some(ChangeEntity::Node(node)))
    }

    pub fn node_change(trx_id: &str, before: GraphNode, after: GraphNode) -> Self {
        Self::new(
            ChangeTrxType::NodeChange,
            trx_id,
            Some(ChangeEntity::Node(before)),
            Some(ChangeEntity::Node(after)),
        )
    }

    pub fn node_delete(trx_id: &str, before: GraphNode) -> Self {
        Self::new(ChangeTrxType::NodeDelete, trx_id, Some(ChangeEntity::Node(before)), None)
    }

    pub fn edge_add(trx_id: &str, edge: GraphEdge) -> Self {
        Self::new(ChangeTrxType::EdgeAdd, trx_id, None, Some(ChangeEntity::Edge(edge)))
    }

    pub fn edge_change(trx_id: &str, before: GraphEdge, after: GraphEdge) -> Self {
        Self::new(
            ChangeTrxType::EdgeChange,
            trx_id,
            Some(ChangeEntity::Edge(before)),
            Some(ChangeEntity::Edge(after)),
        )
    }

    pub fn edge_delete(trx_id: &str, before: GraphEdge) -> Self {
        Self::new(ChangeTrxType::EdgeDelete, trx_id, Some(ChangeEntity::Edge(before)), None)
    }

    /// Key of the mutated entity (node key or edge id).
    pub fn entity_key(&self) -> &str {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(ChangeEntity::key)
            .unwrap_or("")
    }
}

/// Destination for committed change records.
pub trait ChangeTraceSink: Send + Sync {
    fn append(&self, records: &[ChangeTrx]) -> Result<()>;
}

/// Emits each record as a `tracing` event. Default sink of an engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingChangeSink;

impl ChangeTraceSink for TracingChangeSink {
    fn append(&self, records: &[ChangeTrx]) -> Result<()> {
        for record in records {
            debug!(
                trx_id = %record.trx_id,
                log_key = %record.log_key,
                trx_type = ?record.trx_type,
                key = record.entity_key(),
                "change recorded"
            );
        }
        Ok(())
    }
}

/// Keeps committed records in memory.
#[derive(Debug, Default)]
pub struct MemoryChangeLog {
    records: Mutex<Vec<ChangeTrx>>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ChangeTrx> {
        self.records.lock().clone()
    }

    /// Records of one transaction, in append order.
    pub fn transaction(&self, trx_id: &str) -> Vec<ChangeTrx> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.trx_id == trx_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl ChangeTraceSink for MemoryChangeLog {
    fn append(&self, records: &[ChangeTrx]) -> Result<()> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

/// Where appended log bytes go; a [`File`] outside tests.
trait LogTarget: Write + Send {
    fn end(&mut self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogTarget for File {
    fn end(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Append-only change log file. Each batch is written and synced before
/// `append` returns; a batch that fails part way is cut off again so the log
/// only ever holds whole batches.
pub struct FileChangeLog {
    target: Mutex<Box<dyn LogTarget>>,
    path: PathBuf,
}

impl FileChangeLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        // Write header if file is empty
        if file.metadata()?.len() == 0 {
            let mut header = Vec::with_capacity(HEADER_LEN);
            header.extend_from_slice(&LOG_MAGIC.to_le_bytes());
            header.extend_from_slice(&LOG_VERSION.to_le_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
        }

        info!(path = %path.display(), "change log opened");
        Ok(FileChangeLog {
            target: Mutex::new(Box::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_batch(records: &[ChangeTrx]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for record in records {
        let bytes = bincode::serialize(record)?;
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&bytes);
    }
    Ok(buf)
}

impl ChangeTraceSink for FileChangeLog {
    fn append(&self, records: &[ChangeTrx]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let buf = encode_batch(records)?;

        let mut target = self.target.lock();
        let start = target.end()?;

        let written = target.write_all(&buf).and_then(|_| target.flush()).and_then(|_| target.sync());
        if let Err(e) = written {
            match target.truncate(start) {
                Ok(()) => warn!(path = %self.path.display(), error = %e, "change log append failed, batch cut off"),
                Err(cut) => error!(
                    path = %self.path.display(),
                    error = %e,
                    truncate_error = %cut,
                    "change log append failed and could not be cut off"
                ),
            }
            return Err(e.into());
        }
        Ok(())
    }
}

/// Sequential reader over a [`FileChangeLog`] file.
pub struct ChangeLogReader {
    file: BufReader<File>,
}

impl ChangeLogReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if magic != LOG_MAGIC || version != LOG_VERSION {
            return Err(GraphError::Serialization("invalid change log header".to_string()));
        }

        Ok(ChangeLogReader { file: reader })
    }

    /// Next record, `None` at end of log. A torn final record (partial write)
    /// also ends the log.
    pub fn read_record(&mut self) -> Result<Option<ChangeTrx>> {
        let mut len_bytes = [0u8; 4];
        match self.file.read_exact(&mut len_bytes) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut bytes = vec![0u8; len];
        match self.file.read_exact(&mut bytes) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(expected = len, "truncated change log record ignored");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Some(bincode::deserialize(&bytes)?))
    }

    pub fn read_all(&mut self) -> Result<Vec<ChangeTrx>> {
        let mut records = Vec::new();
        while let Some(record) = self.read_record()? {
            records.push(record);
        }
        Ok(records)
    }
}

/// Redo `records` on top of `map` (typically a freshly loaded snapshot).
/// Returns the number of records applied.
pub fn replay(map: &mut GraphMap, records: &[ChangeTrx]) -> Result<usize> {
    for record in records {
        match record.trx_type {
            ChangeTrxType::NodeAdd | ChangeTrxType::NodeChange => {
                let node = after_image(record)?
                    .as_node()
                    .cloned()
                    .ok_or_else(|| mismatched(record))?;
                upsert_node(map, node)?;
            }
            ChangeTrxType::NodeDelete => {
                map.remove_node(record.entity_key());
            }
            ChangeTrxType::EdgeAdd | ChangeTrxType::EdgeChange => {
                let edge = after_image(record)?
                    .as_edge()
                    .cloned()
                    .ok_or_else(|| mismatched(record))?;
                upsert_edge(map, edge)?;
            }
            ChangeTrxType::EdgeDelete => {
                map.remove_edge(record.entity_key());
            }
        }
    }

    map.recompute_stats();
    debug!(records = records.len(), "change log replayed");
    Ok(records.len())
}

pub(crate) fn upsert_node(map: &mut GraphMap, node: GraphNode) -> Result<()> {
    if map.contains_node(&node.key) {
        map.update_node(node).map(|_| ())
    } else {
        map.add_node(node)
    }
}

pub(crate) fn upsert_edge(map: &mut GraphMap, edge: GraphEdge) -> Result<()> {
    if map.get_edge(&edge.key).is_some() {
        map.update_edge(edge).map(|_| ())
    } else {
        map.add_edge(edge, false)
    }
}

fn after_image(record: &ChangeTrx) -> Result<&ChangeEntity> {
    record.after.as_ref().ok_or_else(|| {
        GraphError::Serialization(format!(
            "{:?} record {} has no after image",
            record.trx_type, record.log_key
        ))
    })
}

fn mismatched(record: &ChangeTrx) -> GraphError {
    GraphError::Serialization(format!(
        "{:?} record {} carries the wrong entity kind",
        record.trx_type, record.log_key
    ))
}
