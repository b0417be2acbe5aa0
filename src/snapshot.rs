//! Snapshot codec
//!
//! A snapshot is the whole map serialized as one JSON document:
//!
//! ```text
//! { "version": 1, "created": ..., "node_count": 2, "edge_count": 1,
//!   "checksum": "<sha256 of payload>", "payload": { "nodes": [...], "edges": [...] } }
//! ```
//!
//! Optionally gzip-compressed; reads detect the gzip magic and decompress.

use crate::config::SnapshotConfig;
use crate::error::{GraphError, Result};
use crate::graph::{edge_order, GraphEdge, GraphMap, GraphNode};
use crate::store::ETag;
use crate::types::now;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use tracing::debug;

const SNAPSHOT_VERSION: u32 = 1;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Serialized map plus the store's concurrency token for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub data: Vec<u8>,
    /// `None` when the object does not exist yet.
    pub etag: Option<ETag>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Builds maps from snapshot bytes and back.
pub trait SnapshotFactory: Send + Sync {
    fn create_empty(&self) -> GraphMap;
    fn create_from_bytes(&self, bytes: &[u8]) -> Result<GraphMap>;
    fn to_bytes(&self, map: &GraphMap) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u32,
    pub created: DateTime<Utc>,
    pub node_count: usize,
    pub edge_count: usize,
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    #[serde(flatten)]
    metadata: SnapshotMetadata,
    payload: SnapshotPayload,
}

#[derive(Debug, Clone, Default)]
pub struct JsonSnapshotFactory {
    compress: bool,
}

impl JsonSnapshotFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compressed() -> Self {
        JsonSnapshotFactory { compress: true }
    }

    pub fn from_config(config: &SnapshotConfig) -> Self {
        JsonSnapshotFactory {
            compress: config.compress,
        }
    }

    /// Decode only the envelope metadata.
    pub fn read_metadata(&self, bytes: &[u8]) -> Result<SnapshotMetadata> {
        Ok(self.decode(bytes)?.metadata)
    }

    fn decode(&self, bytes: &[u8]) -> Result<SnapshotEnvelope> {
        let json = if bytes.starts_with(&GZIP_MAGIC) {
            decompress(bytes)?
        } else {
            bytes.to_vec()
        };

        let envelope: SnapshotEnvelope = serde_json::from_slice(&json)?;
        if envelope.metadata.version != SNAPSHOT_VERSION {
            return Err(GraphError::Serialization(format!(
                "unsupported snapshot version {}",
                envelope.metadata.version
            )));
        }

        let checksum = checksum(&serde_json::to_string(&envelope.payload)?);
        if checksum != envelope.metadata.checksum {
            return Err(GraphError::Serialization("snapshot checksum mismatch".to_string()));
        }

        Ok(envelope)
    }
}

impl SnapshotFactory for JsonSnapshotFactory {
    fn create_empty(&self) -> GraphMap {
        GraphMap::new()
    }

    /// Empty input is an empty map.
    fn create_from_bytes(&self, bytes: &[u8]) -> Result<GraphMap> {
        if bytes.is_empty() {
            return Ok(self.create_empty());
        }

        let envelope = self.decode(bytes)?;
        let map = GraphMap::from_parts(envelope.payload.nodes, envelope.payload.edges);
        debug!(
            nodes = map.node_count(),
            edges = map.edge_count(),
            "snapshot decoded"
        );
        Ok(map)
    }

    fn to_bytes(&self, map: &GraphMap) -> Result<Vec<u8>> {
        let mut nodes: Vec<GraphNode> = map.nodes().cloned().collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        let mut edges: Vec<GraphEdge> = map.edges().cloned().collect();
        edges.sort_by(edge_order);

        let payload = SnapshotPayload { nodes, edges };
        let envelope = SnapshotEnvelope {
            metadata: SnapshotMetadata {
                version: SNAPSHOT_VERSION,
                created: now(),
                node_count: payload.nodes.len(),
                edge_count: payload.edges.len(),
                checksum: checksum(&serde_json::to_string(&payload)?),
            },
            payload,
        };

        let json = serde_json::to_vec(&envelope)?;
        if self.compress {
            compress(&json)
        } else {
            Ok(json)
        }
    }
}

pub(crate) fn checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut result = Vec::new();
    decoder.read_to_end(&mut result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tags;

    fn sample_map() -> GraphMap {
        let mut map = GraphMap::new();
        map.add_node(GraphNode::new("a", Tags::parse("t1=v1")).with_links(vec!["payload".into()]))
            .unwrap();
        map.add_node(GraphNode::new("b", Tags::new())).unwrap();
        map.add_edge(GraphEdge::new("a", "b", "member", Tags::parse("w=1")), true)
            .unwrap();
        map
    }

    #[test]
    fn test_round_trip() {
        let factory = JsonSnapshotFactory::new();
        let bytes = factory.to_bytes(&sample_map()).unwrap();
        let map = factory.create_from_bytes(&bytes).unwrap();

        assert_eq!(map.node_count(), 2);
        assert_eq!(map.get_node("a").unwrap().links, vec!["payload"]);
        assert!(map.find_edge("a", "b", "member").is_some());
        assert_eq!(map.stats().edge_count, 1);

        let metadata = factory.read_metadata(&bytes).unwrap();
        assert_eq!(metadata.node_count, 2);
        assert_eq!(metadata.version, SNAPSHOT_VERSION);
    }

    #[test]
    fn test_compressed_snapshot_is_detected() {
        let bytes = JsonSnapshotFactory::compressed().to_bytes(&sample_map()).unwrap();
        assert!(bytes.starts_with(&GZIP_MAGIC));

        // A non-compressing factory still reads it
        let map = JsonSnapshotFactory::new().create_from_bytes(&bytes).unwrap();
        assert_eq!(map.edge_count(), 1);
    }

    #[test]
    fn test_empty_bytes_are_an_empty_map() {
        let map = JsonSnapshotFactory::new().create_from_bytes(&[]).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let factory = JsonSnapshotFactory::new();
        let bytes = factory.to_bytes(&sample_map()).unwrap();
        let tampered = String::from_utf8(bytes).unwrap().replace("t1=v1", "t1=v2");
        let err = factory.create_from_bytes(tampered.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let err = JsonSnapshotFactory::new().create_from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, GraphError::Serialization(_)));
    }
}
