//! Batch transactions
//!
//! One [`BatchTransaction`] spans one execution call. Change records are
//! buffered in it while statements apply; they double as the undo journal:
//! on failure the records are reverted newest first, on success they are
//! handed to the change-trace sink in one append.

use crate::change_log::{upsert_edge, upsert_node, ChangeEntity, ChangeTraceSink, ChangeTrx, ChangeTrxType};
use crate::error::Result;
use crate::graph::GraphMap;
use crate::types::{new_id, now};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Engine execution state
///
/// `Idle -> Parsing -> Applying -> Committed | Failed`, back to `Idle` before
/// the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Idle,
    Parsing,
    Applying,
    Committed,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Committed | ExecutionState::Failed)
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        ExecutionState::Idle
    }
}

#[derive(Debug)]
pub struct BatchTransaction {
    trx_id: String,
    records: Vec<ChangeTrx>,
    started_at: DateTime<Utc>,
}

impl BatchTransaction {
    pub fn begin() -> Self {
        BatchTransaction {
            trx_id: new_id(),
            records: Vec::new(),
            started_at: now(),
        }
    }

    pub fn trx_id(&self) -> &str {
        &self.trx_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record(&mut self, record: ChangeTrx) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ChangeTrx] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Deliver the buffered records to `sink`.
    pub fn commit(&self, sink: &dyn ChangeTraceSink) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        sink.append(&self.records)?;
        debug!(trx_id = %self.trx_id, records = self.records.len(), "batch committed");
        Ok(())
    }

    pub fn into_records(self) -> Vec<ChangeTrx> {
        self.records
    }

    /// Revert every buffered change on `map`, newest first. Returns the
    /// number of records reverted.
    pub fn rollback(self, map: &mut GraphMap) -> usize {
        let count = self.records.len();

        for record in self.records.iter().rev() {
            if let Err(e) = undo(map, record) {
                error!(
                    trx_id = %self.trx_id,
                    log_key = %record.log_key,
                    error = %e,
                    "failed to revert change"
                );
            }
        }

        debug!(trx_id = %self.trx_id, records = count, "batch rolled back");
        count
    }
}

fn undo(map: &mut GraphMap, record: &ChangeTrx) -> Result<()> {
    match (record.trx_type, &record.before) {
        (ChangeTrxType::NodeAdd, _) => {
            map.remove_node(record.entity_key());
        }
        (ChangeTrxType::EdgeAdd, _) => {
            map.remove_edge(record.entity_key());
        }
        (_, Some(ChangeEntity::Node(before))) => upsert_node(map, before.clone())?,
        (_, Some(ChangeEntity::Edge(before))) => upsert_edge(map, before.clone())?,
        (_, None) => {}
    }
    Ok(())
}
