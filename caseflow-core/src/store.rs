//! Case Store Port
//!
//! The store is the sole owner of durable case state and the only point of
//! serialization. Every eligibility-affecting write is a single conditional
//! write guarded by the per-case revision. Adapters: [`crate::memory`] and,
//! behind the `postgres` feature, [`crate::postgres`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;
use crate::payload::ResultRecord;
use crate::stage::{Stage, StageStatus};
use crate::state::{Appointment, AppointmentStatus, CaseSnapshot, StageMark};

/// Table a change event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Appointments,
    StageStates,
    Results(Stage),
}

impl Table {
    /// Only appointment and stage rows feed queue eligibility.
    pub fn affects_eligibility(&self) -> bool {
        matches!(self, Self::Appointments | Self::StageStates)
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Appointments => write!(f, "appointments"),
            Self::StageStates => write!(f, "stage_states"),
            Self::Results(stage) => write!(f, "{}", crate::payload::result_table(*stage)),
        }
    }
}

/// One entry of the store's change feed.
///
/// `revision` is the case revision after the write. Events for the same case
/// are emitted in write order; nothing is promised across cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub case_id: Uuid,
    pub revision: u64,
    pub changed_fields: Vec<String>,
    /// After-image at `revision`, when the adapter can supply it cheaply
    #[serde(default)]
    pub snapshot: Option<CaseSnapshot>,
    /// Whoever issued the write, if known
    #[serde(default)]
    pub written_by: Option<Uuid>,
}

pub type ChangeFeed = broadcast::Receiver<ChangeEvent>;

/// Appointment columns touched by a write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppointmentChange {
    pub status: Option<AppointmentStatus>,
    pub rejection_reason: Option<String>,
}

/// StageState columns touched by a write.
///
/// When the case has no StageState yet the store creates one with every
/// stage at `pending` before applying `statuses`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageChange {
    pub statuses: Vec<(Stage, StageStatus)>,
    pub assigned_doctor_id: Option<Uuid>,
    pub xray_artifact_key: Option<String>,
    /// Audit columns `<stage>_done_at` / `<stage>_done_by`
    pub mark: Option<(Stage, StageMark)>,
}

impl StageChange {
    pub fn status(stage: Stage, status: StageStatus) -> Self {
        Self {
            statuses: vec![(stage, status)],
            ..Default::default()
        }
    }

    /// Column names this change writes, in stable order.
    pub fn columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = self
            .statuses
            .iter()
            .map(|(stage, _)| format!("{}_status", stage))
            .collect();
        if self.assigned_doctor_id.is_some() {
            cols.push("assigned_doctor_id".into());
        }
        if self.xray_artifact_key.is_some() {
            cols.push("xray_artifact_key".into());
        }
        cols.extend(self.audit_columns());
        cols
    }

    pub fn audit_columns(&self) -> Vec<String> {
        match &self.mark {
            Some((stage, _)) => vec![format!("{}_done_at", stage), format!("{}_done_by", stage)],
            None => Vec::new(),
        }
    }

    pub fn without_audit(mut self) -> Self {
        self.mark = None;
        self
    }
}

/// A single atomic, revision-checked write over one case.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseWrite {
    pub case_id: Uuid,
    pub expected_revision: u64,
    pub appointment: Option<AppointmentChange>,
    pub stages: Option<StageChange>,
    pub result: Option<ResultRecord>,
    pub written_by: Option<Uuid>,
}

impl CaseWrite {
    pub fn new(case_id: Uuid, expected_revision: u64) -> Self {
        Self {
            case_id,
            expected_revision,
            appointment: None,
            stages: None,
            result: None,
            written_by: None,
        }
    }

    pub fn with_appointment(mut self, change: AppointmentChange) -> Self {
        self.appointment = Some(change);
        self
    }

    pub fn with_stages(mut self, change: StageChange) -> Self {
        self.stages = Some(change);
        self
    }

    pub fn with_result(mut self, record: ResultRecord) -> Self {
        self.result = Some(record);
        self
    }

    pub fn by(mut self, user_id: Uuid) -> Self {
        self.written_by = Some(user_id);
        self
    }
}

/// Outcome of a successful conditional write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    pub case_id: Uuid,
    pub revision: u64,
    pub snapshot: CaseSnapshot,
    pub written_at: DateTime<Utc>,
}

/// Persistence port for cases.
#[async_trait]
pub trait CaseStore: Send + Sync {
    // ── Reads ──

    /// Read-by-id. Fails with `NotFound` for unknown cases.
    async fn load_case(&self, case_id: Uuid) -> Result<CaseSnapshot, StoreError>;

    /// Current content of one stage's result record, if any.
    async fn load_result(
        &self,
        case_id: Uuid,
        stage: Stage,
    ) -> Result<Option<ResultRecord>, StoreError>;

    /// Read-by-predicate: every non-terminal case. Seeds queue projections.
    async fn list_open_cases(&self) -> Result<Vec<CaseSnapshot>, StoreError>;

    // ── Writes ──

    /// Insert a new appointment at revision 1.
    async fn insert_appointment(&self, appointment: Appointment)
        -> Result<CaseSnapshot, StoreError>;

    /// Apply `write` iff the case is still at `expected_revision`.
    ///
    /// All parts of the write land together and bump the revision once.
    /// A revision mismatch fails with `Conflict` and writes nothing.
    async fn conditional_write(&self, write: CaseWrite) -> Result<WriteReceipt, StoreError>;

    /// Upsert result content without touching status or revision.
    async fn save_draft(
        &self,
        case_id: Uuid,
        record: ResultRecord,
        written_by: Option<Uuid>,
    ) -> Result<(), StoreError>;

    // ── Change feed ──

    fn subscribe(&self) -> ChangeFeed;
}
