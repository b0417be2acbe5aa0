//! Strand - embeddable graph data engine
//!
//! A keyed, tagged property graph driven by a small statement language and
//! persisted as whole-map snapshots behind leases.
//!
//! # Architecture
//!
//! - Grammar Layer: meta-grammar compiler and backtracking parser
//! - Command Layer: graph statements compiled into typed commands
//! - Graph Layer: in-memory map with adjacency and tag indexes
//! - Execution Layer: atomic statement batches with change records
//! - Persistence Layer: snapshots in a backing store, exclusive or shared leases
//! - Host Layer: one serialized worker per graph id
//!
//! ```no_run
//! use strand_core::GraphEngine;
//!
//! let mut engine = GraphEngine::new();
//! engine.execute("add node key=node1; add node key=node2; add unique edge fromKey=node1, toKey=node2;")?;
//! let result = engine.execute("select (key=node1) -> [*] -> (*);")?;
//! assert_eq!(result.nodes[0].key, "node2");
//! # Ok::<(), strand_core::GraphError>(())
//! ```

pub mod error;
pub mod types;

// Grammar modules
pub mod meta_lexer;
pub mod meta_grammar;
pub mod syntax_parser;

// Graph command language
pub mod gql_grammar;
pub mod gql_ast;
pub mod gql_compiler;
pub mod gql_executor;

// Graph and transaction modules
pub mod graph;
pub mod change_log;
pub mod transaction;

// Persistence modules
pub mod snapshot;
pub mod store;
pub mod access;
pub mod metrics;

pub mod config;
pub mod context;
pub mod graph_host;
pub mod schema_builder;

pub use error::{ErrorKind, GraphError, Result, SyntaxError};
pub use types::Tags;

// Grammar exports
pub use meta_grammar::Grammar;
pub use syntax_parser::{SyntaxNode, SyntaxParser, SyntaxTree};

// Command exports
pub use gql_ast::GraphCommand;
pub use gql_compiler::parse_commands;
pub use gql_executor::{AliasResult, GraphEngine, QueryResult, StagedBatch};

// Graph exports
pub use graph::{GraphEdge, GraphMap, GraphNode, GraphStats};
pub use change_log::{
    ChangeLogReader, ChangeTraceSink, ChangeTrx, ChangeTrxType, FileChangeLog, MemoryChangeLog,
};
pub use transaction::ExecutionState;

// Persistence exports
pub use snapshot::{JsonSnapshotFactory, Snapshot, SnapshotFactory};
pub use store::{BackingStore, ETag, FileBackingStore, Lease, LeaseKind, MemoryBackingStore, StoreError};
pub use access::{ExclusiveAccess, LeaseScope, SharedAccess, SharedScope};
pub use metrics::{LeaseMetrics, MetricsSnapshot};

pub use config::GraphConfig;
pub use context::{CancelHandle, RequestContext};
pub use graph_host::{GraphClient, GraphHost, HostedGraph, SharedGraphClient};
pub use schema_builder::{GraphSchema, GraphSchemaBuilder};
