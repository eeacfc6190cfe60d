//! Route handlers, one module per resource.

pub mod appointments;
pub mod cases;
pub mod health;
pub mod queues;

use caseflow_core::{CaseSnapshot, WriteReceipt};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Body returned by every successful conditional write.
#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub revision: u64,
    pub written_at: DateTime<Utc>,
    pub snapshot: CaseSnapshot,
}

impl From<WriteReceipt> for WriteResponse {
    fn from(receipt: WriteReceipt) -> Self {
        Self {
            revision: receipt.revision,
            written_at: receipt.written_at,
            snapshot: receipt.snapshot,
        }
    }
}
