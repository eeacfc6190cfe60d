//! In-memory case store for tests and single-node development.
//!
//! Holds every case behind one tokio `RwLock`, so a conditional write is
//! trivially atomic. A [`SchemaCatalog`] can declare columns as missing to
//! exercise the schema-drift fallback, and an outage switch makes every call
//! fail with `Unavailable`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::payload::ResultRecord;
use crate::stage::Stage;
use crate::state::{Appointment, CaseSnapshot, StageState};
use crate::store::{CaseStore, CaseWrite, ChangeEvent, ChangeFeed, Table, WriteReceipt};

const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Table name used for StageState columns in drift reports.
pub const STAGE_TABLE: &str = "stage_states";

/// Columns the emulated schema does not have.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    missing: HashMap<String, HashSet<String>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_column(mut self, table: &str, column: &str) -> Self {
        self.missing
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string());
        self
    }

    /// Columns from `columns` that `table` lacks, in input order.
    pub fn unknown<'a>(
        &self,
        table: &str,
        columns: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        match self.missing.get(table) {
            Some(missing) => columns
                .into_iter()
                .filter(|c| missing.contains(*c))
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct CaseRow {
    appointment: Appointment,
    stages: Option<StageState>,
    revision: u64,
    results: HashMap<Stage, ResultRecord>,
}

impl CaseRow {
    fn snapshot(&self) -> CaseSnapshot {
        CaseSnapshot {
            appointment: self.appointment.clone(),
            stages: self.stages.clone(),
            revision: self.revision,
        }
    }
}

pub struct MemoryCaseStore {
    cases: RwLock<HashMap<Uuid, CaseRow>>,
    feed: broadcast::Sender<ChangeEvent>,
    catalog: SchemaCatalog,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryCaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            cases: RwLock::new(HashMap::new()),
            feed,
            catalog: SchemaCatalog::default(),
            unavailable: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    pub fn with_catalog(mut self, catalog: SchemaCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Make every subsequent call fail (or recover) as if the store were down.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Number of committed writes, drafts included.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }

    fn check_schema(&self, write: &CaseWrite) -> Result<(), StoreError> {
        if let Some(record) = &write.result {
            let unknown = self.catalog.unknown(&record.table, record.columns());
            if !unknown.is_empty() {
                return Err(drift(&record.table, unknown));
            }
        }
        if let Some(stages) = &write.stages {
            let cols = stages.columns();
            let unknown = self.catalog.unknown(STAGE_TABLE, cols.iter().map(String::as_str));
            if !unknown.is_empty() {
                return Err(drift(STAGE_TABLE, unknown));
            }
        }
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine; the feed is best-effort fan-in for relays.
        let _ = self.feed.send(event);
    }
}

fn drift(table: &str, columns: Vec<String>) -> StoreError {
    let message = format!(
        "Could not find the '{}' column of '{}' in the schema cache",
        columns.join("', '"),
        table
    );
    StoreError::SchemaDrift {
        table: table.to_string(),
        columns,
        message,
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn load_case(&self, case_id: Uuid) -> Result<CaseSnapshot, StoreError> {
        self.check_available()?;
        let cases = self.cases.read().await;
        cases
            .get(&case_id)
            .map(CaseRow::snapshot)
            .ok_or(StoreError::NotFound(case_id))
    }

    async fn load_result(
        &self,
        case_id: Uuid,
        stage: Stage,
    ) -> Result<Option<ResultRecord>, StoreError> {
        self.check_available()?;
        let cases = self.cases.read().await;
        let row = cases.get(&case_id).ok_or(StoreError::NotFound(case_id))?;
        Ok(row.results.get(&stage).cloned())
    }

    async fn list_open_cases(&self) -> Result<Vec<CaseSnapshot>, StoreError> {
        self.check_available()?;
        let cases = self.cases.read().await;
        Ok(cases
            .values()
            .filter(|row| !row.appointment.status.is_terminal())
            .map(CaseRow::snapshot)
            .collect())
    }

    async fn insert_appointment(
        &self,
        appointment: Appointment,
    ) -> Result<CaseSnapshot, StoreError> {
        self.check_available()?;
        let case_id = appointment.id;
        let snapshot = {
            let mut cases = self.cases.write().await;
            if cases.contains_key(&case_id) {
                return Err(StoreError::Internal(anyhow::anyhow!(
                    "appointment {} already exists",
                    case_id
                )));
            }
            let row = CaseRow {
                appointment,
                stages: None,
                revision: 1,
                results: HashMap::new(),
            };
            let snapshot = row.snapshot();
            cases.insert(case_id, row);
            snapshot
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(ChangeEvent {
            table: Table::Appointments,
            case_id,
            revision: snapshot.revision,
            changed_fields: vec!["status".into()],
            snapshot: Some(snapshot.clone()),
            written_by: None,
        });
        Ok(snapshot)
    }

    async fn conditional_write(&self, write: CaseWrite) -> Result<WriteReceipt, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let mut events = Vec::new();

        let receipt = {
            let mut cases = self.cases.write().await;
            let row = cases
                .get_mut(&write.case_id)
                .ok_or(StoreError::NotFound(write.case_id))?;

            if row.revision != write.expected_revision {
                return Err(StoreError::Conflict {
                    case_id: write.case_id,
                    expected: write.expected_revision,
                    current: row.revision,
                });
            }
            self.check_schema(&write)?;

            row.revision += 1;
            let revision = row.revision;

            if let Some(change) = &write.appointment {
                let mut fields = Vec::new();
                if let Some(status) = change.status {
                    row.appointment.status = status;
                    fields.push("status".to_string());
                }
                if let Some(reason) = &change.rejection_reason {
                    row.appointment.rejection_reason = Some(reason.clone());
                    fields.push("rejection_reason".to_string());
                }
                row.appointment.updated_at = now;
                events.push((Table::Appointments, fields));
            }

            if let Some(change) = &write.stages {
                let stages = row
                    .stages
                    .get_or_insert_with(|| StageState::activated(write.case_id, now));
                for (stage, status) in &change.statuses {
                    stages.set_status(*stage, *status);
                }
                if let Some(doctor) = change.assigned_doctor_id {
                    stages.assigned_doctor_id = Some(doctor);
                }
                if let Some(key) = &change.xray_artifact_key {
                    stages.xray_artifact_key = Some(key.clone());
                }
                if let Some((stage, mark)) = &change.mark {
                    stages.marks.insert(*stage, mark.clone());
                }
                stages.updated_at = now;
                events.push((Table::StageStates, change.columns()));
            }

            if let Some(record) = &write.result {
                if let Some(stage) = stage_for_table(&record.table) {
                    let fields = record.columns().map(str::to_string).collect();
                    upsert(&mut row.results, stage, record.clone());
                    events.push((Table::Results(stage), fields));
                }
            }

            WriteReceipt {
                case_id: write.case_id,
                revision,
                snapshot: row.snapshot(),
                written_at: now,
            }
        };

        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(case_id = %receipt.case_id, revision = receipt.revision, "memory store write");
        for (table, changed_fields) in events {
            self.publish(ChangeEvent {
                table,
                case_id: receipt.case_id,
                revision: receipt.revision,
                changed_fields,
                snapshot: Some(receipt.snapshot.clone()),
                written_by: write.written_by,
            });
        }
        Ok(receipt)
    }

    async fn save_draft(
        &self,
        case_id: Uuid,
        record: ResultRecord,
        written_by: Option<Uuid>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let stage = stage_for_table(&record.table).ok_or_else(|| {
            StoreError::Internal(anyhow::anyhow!("unknown result table {}", record.table))
        })?;
        let unknown = self.catalog.unknown(&record.table, record.columns());
        if !unknown.is_empty() {
            return Err(drift(&record.table, unknown));
        }

        let changed_fields: Vec<String> = record.columns().map(str::to_string).collect();
        let revision = {
            let mut cases = self.cases.write().await;
            let row = cases.get_mut(&case_id).ok_or(StoreError::NotFound(case_id))?;
            upsert(&mut row.results, stage, record);
            row.revision
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(ChangeEvent {
            table: Table::Results(stage),
            case_id,
            revision,
            changed_fields,
            snapshot: None,
            written_by,
        });
        Ok(())
    }

    fn subscribe(&self) -> ChangeFeed {
        self.feed.subscribe()
    }
}

/// Upsert keyed by case: incoming columns overwrite, others are kept.
fn upsert(results: &mut HashMap<Stage, ResultRecord>, stage: Stage, record: ResultRecord) {
    match results.get_mut(&stage) {
        Some(existing) => existing.fields.extend(record.fields),
        None => {
            results.insert(stage, record);
        }
    }
}

fn stage_for_table(table: &str) -> Option<Stage> {
    Stage::ALL
        .into_iter()
        .find(|s| crate::payload::result_table(*s) == table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{LabResult, StageResult};
    use crate::stage::StageStatus;
    use crate::store::StageChange;
    use chrono::NaiveDate;

    fn appointment() -> Appointment {
        Appointment::new(
            Uuid::new_v4(),
            "annual_physical",
            NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            None,
        )
    }

    #[tokio::test]
    async fn test_insert_starts_at_revision_one() {
        let store = MemoryCaseStore::new();
        let snap = store.insert_appointment(appointment()).await.unwrap();
        assert_eq!(snap.revision, 1);
        assert!(snap.stages.is_none());
    }

    #[tokio::test]
    async fn test_conditional_write_bumps_revision_and_creates_stages() {
        let store = MemoryCaseStore::new();
        let snap = store.insert_appointment(appointment()).await.unwrap();

        let write = CaseWrite::new(snap.case_id(), 1)
            .with_stages(StageChange::status(Stage::Payment, StageStatus::Completed));
        let receipt = store.conditional_write(write).await.unwrap();

        assert_eq!(receipt.revision, 2);
        let stages = receipt.snapshot.stages.unwrap();
        assert_eq!(stages.payment_status, StageStatus::Completed);
        assert_eq!(stages.lab_status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts_without_writing() {
        let store = MemoryCaseStore::new();
        let snap = store.insert_appointment(appointment()).await.unwrap();
        let before = store.write_count();

        let write = CaseWrite::new(snap.case_id(), 7)
            .with_stages(StageChange::status(Stage::Payment, StageStatus::Completed));
        let err = store.conditional_write(write).await.unwrap_err();

        assert!(matches!(err, StoreError::Conflict { expected: 7, current: 1, .. }));
        assert_eq!(store.write_count(), before);
        assert!(store.load_case(snap.case_id()).await.unwrap().stages.is_none());
    }

    #[tokio::test]
    async fn test_catalog_reports_missing_columns() {
        let catalog = SchemaCatalog::new().without_column("lab_results", "hbsag");
        let store = MemoryCaseStore::new().with_catalog(catalog);
        let snap = store.insert_appointment(appointment()).await.unwrap();

        let record = StageResult::Lab(LabResult::default()).to_record().unwrap();
        let err = store
            .save_draft(snap.case_id(), record, None)
            .await
            .unwrap_err();
        match err {
            StoreError::SchemaDrift { table, columns, message } => {
                assert_eq!(table, "lab_results");
                assert_eq!(columns, vec!["hbsag".to_string()]);
                assert!(StoreError::looks_like_drift(&message));
            }
            other => panic!("expected drift, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_draft_keeps_revision() {
        let store = MemoryCaseStore::new();
        let snap = store.insert_appointment(appointment()).await.unwrap();
        let mut feed = store.subscribe();

        let record = StageResult::Lab(LabResult {
            remarks: Some("hemolyzed sample, redraw".into()),
            ..Default::default()
        })
        .to_record()
        .unwrap();
        store.save_draft(snap.case_id(), record, None).await.unwrap();

        assert_eq!(store.load_case(snap.case_id()).await.unwrap().revision, 1);
        let ev = feed.recv().await.unwrap();
        assert_eq!(ev.table, Table::Results(Stage::Lab));
        assert!(ev.snapshot.is_none());
    }

    #[tokio::test]
    async fn test_outage_injection() {
        let store = MemoryCaseStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.list_open_cases().await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.list_open_cases().await.unwrap().is_empty());
    }
}
