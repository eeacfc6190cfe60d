//! Postgres case store (`postgres` feature).
//!
//! All SQL is runtime-checked (sqlx::query, not sqlx::query!) so the crate
//! builds without a database. Result rows are upserted through
//! `jsonb_populate_record` with an explicit column list, which makes a
//! column the schema lacks fail with SQLSTATE 42703 instead of being
//! silently dropped; that error is reported as [`StoreError::SchemaDrift`].
//!
//! Change events are published with `pg_notify` inside the write's
//! transaction, so they are only delivered once it commits.
//! [`PgChangeListener`] relays them into the store's broadcast feed.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::fanout::{FanoutMessage, NotificationFanout};
use crate::memory::STAGE_TABLE;
use crate::payload::{result_table, ResultRecord};
use crate::stage::{Stage, StageStatus};
use crate::state::{Appointment, AppointmentStatus, CaseSnapshot, StageMark, StageState};
use crate::store::{CaseStore, CaseWrite, ChangeEvent, ChangeFeed, StageChange, Table, WriteReceipt};

/// NOTIFY channel carrying JSON-encoded [`ChangeEvent`]s.
pub const CHANGE_CHANNEL: &str = "case_changes";

/// Postgres rejects NOTIFY payloads of 8000 bytes or more.
const NOTIFY_LIMIT: usize = 7900;

const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Backoff after a listener error
const LISTENER_BACKOFF_MS: u64 = 1000;

const SNAPSHOT_SELECT: &str = r#"
    SELECT a.id, a.patient_id, a.case_type, a.scheduled_date,
           a.assigned_physician_id, a.status, a.rejection_reason,
           a.revision, a.created_at, a.updated_at,
           to_jsonb(s) AS stages
    FROM appointments a
    LEFT JOIN stage_states s ON s.case_id = a.id
"#;

pub struct PgCaseStore {
    pool: PgPool,
    feed: broadcast::Sender<ChangeEvent>,
}

impl PgCaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_capacity(pool, DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(pool: PgPool, feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self { pool, feed }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Listener that feeds committed notifications into [`CaseStore::subscribe`].
    pub fn listener(&self) -> PgChangeListener {
        PgChangeListener {
            pool: self.pool.clone(),
            feed: self.feed.clone(),
            fanout: None,
        }
    }

    async fn current_revision(
        tx: &mut Transaction<'_, Postgres>,
        case_id: Uuid,
    ) -> Result<Option<u64>, StoreError> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM appointments WHERE id = $1")
                .bind(case_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| db_error("appointments", e))?;
        Ok(revision.map(to_revision))
    }

    async fn write_stages(
        tx: &mut Transaction<'_, Postgres>,
        case_id: Uuid,
        change: &StageChange,
    ) -> Result<(), StoreError> {
        let values = stage_values(change);
        let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO stage_states (case_id");
        for (col, _) in &values {
            qb.push(", ").push(ident(col)?);
        }
        qb.push(", updated_at) VALUES (").push_bind(case_id);
        for (_, value) in &values {
            qb.push(", ");
            match value {
                StageValue::Text(v) => qb.push_bind(v.clone()),
                StageValue::Id(v) => qb.push_bind(*v),
                StageValue::At(v) => qb.push_bind(*v),
            };
        }
        qb.push(", now()) ON CONFLICT (case_id) DO UPDATE SET updated_at = EXCLUDED.updated_at");
        for (col, _) in &values {
            let col = ident(col)?;
            qb.push(format!(", {col} = EXCLUDED.{col}"));
        }

        qb.build()
            .execute(&mut **tx)
            .await
            .map_err(|e| db_error(STAGE_TABLE, e))?;
        Ok(())
    }

    async fn upsert_result(
        tx: &mut Transaction<'_, Postgres>,
        case_id: Uuid,
        record: &ResultRecord,
    ) -> Result<(), StoreError> {
        let table = ident(&record.table)?;
        let columns = record
            .columns()
            .filter(|c| *c != "case_id")
            .map(ident)
            .collect::<Result<Vec<_>, _>>()?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("INSERT INTO {table} (case_id"));
        for col in &columns {
            qb.push(", ").push(*col);
        }
        qb.push(") SELECT ").push_bind(case_id);
        for col in &columns {
            qb.push(format!(", r.{col}"));
        }
        qb.push(format!(" FROM jsonb_populate_record(NULL::{table}, "))
            .push_bind(Value::Object(record.fields.clone()))
            .push("::jsonb) r ON CONFLICT (case_id) DO ");
        if columns.is_empty() {
            qb.push("NOTHING");
        } else {
            qb.push("UPDATE SET updated_at = now()");
            for col in &columns {
                qb.push(format!(", {col} = EXCLUDED.{col}"));
            }
        }

        qb.build()
            .execute(&mut **tx)
            .await
            .map_err(|e| db_error(table, e))?;
        Ok(())
    }

    async fn notify(
        tx: &mut Transaction<'_, Postgres>,
        event: &ChangeEvent,
    ) -> Result<(), StoreError> {
        let mut payload = serde_json::to_string(event).map_err(|e| anyhow!(e))?;
        if payload.len() > NOTIFY_LIMIT {
            // Listeners fetch the after-image themselves.
            let slim = ChangeEvent {
                snapshot: None,
                ..event.clone()
            };
            payload = serde_json::to_string(&slim).map_err(|e| anyhow!(e))?;
        }
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGE_CHANNEL)
            .bind(payload)
            .execute(&mut **tx)
            .await
            .map_err(|e| db_error("pg_notify", e))?;
        Ok(())
    }
}

#[async_trait]
impl CaseStore for PgCaseStore {
    async fn load_case(&self, case_id: Uuid) -> Result<CaseSnapshot, StoreError> {
        let row = sqlx::query(&format!("{SNAPSHOT_SELECT} WHERE a.id = $1"))
            .bind(case_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("appointments", e))?
            .ok_or(StoreError::NotFound(case_id))?;
        snapshot_from_row(&row)
    }

    async fn load_result(
        &self,
        case_id: Uuid,
        stage: Stage,
    ) -> Result<Option<ResultRecord>, StoreError> {
        let table = result_table(stage);
        let row: Option<Value> = sqlx::query_scalar(&format!(
            "SELECT to_jsonb(t) FROM {table} t WHERE t.case_id = $1"
        ))
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error(table, e))?;

        Ok(row.map(|value| {
            let mut fields = match value {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            fields.remove("case_id");
            fields.remove("updated_at");
            ResultRecord {
                table: table.to_string(),
                fields,
            }
        }))
    }

    async fn list_open_cases(&self) -> Result<Vec<CaseSnapshot>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SNAPSHOT_SELECT} WHERE a.status NOT IN ('rejected', 'cancelled') \
             ORDER BY a.created_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("appointments", e))?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn insert_appointment(
        &self,
        appointment: Appointment,
    ) -> Result<CaseSnapshot, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error("appointments", e))?;
        sqlx::query(
            r#"
            INSERT INTO appointments (
                id, patient_id, case_type, scheduled_date, assigned_physician_id,
                status, rejection_reason, revision, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 1, $8, $9)
            "#,
        )
        .bind(appointment.id)
        .bind(appointment.patient_id)
        .bind(&appointment.case_type)
        .bind(appointment.scheduled_date)
        .bind(appointment.assigned_physician_id)
        .bind(appointment.status.as_str())
        .bind(&appointment.rejection_reason)
        .bind(appointment.created_at)
        .bind(appointment.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("appointments", e))?;

        let snapshot = CaseSnapshot {
            appointment,
            stages: None,
            revision: 1,
        };
        Self::notify(
            &mut tx,
            &ChangeEvent {
                table: Table::Appointments,
                case_id: snapshot.case_id(),
                revision: 1,
                changed_fields: vec!["status".into()],
                snapshot: Some(snapshot.clone()),
                written_by: None,
            },
        )
        .await?;
        tx.commit().await.map_err(|e| db_error("appointments", e))?;
        Ok(snapshot)
    }

    async fn conditional_write(&self, write: CaseWrite) -> Result<WriteReceipt, StoreError> {
        let case_id = write.case_id;
        let mut tx = self.pool.begin().await.map_err(|e| db_error("appointments", e))?;

        // Revision gate: the only serialization point between operators.
        let mut qb = QueryBuilder::<Postgres>::new(
            "UPDATE appointments SET revision = revision + 1, updated_at = now()",
        );
        let mut appointment_fields = Vec::new();
        if let Some(change) = &write.appointment {
            if let Some(status) = change.status {
                qb.push(", status = ").push_bind(status.as_str());
                appointment_fields.push("status".to_string());
            }
            if let Some(reason) = &change.rejection_reason {
                qb.push(", rejection_reason = ").push_bind(reason.clone());
                appointment_fields.push("rejection_reason".to_string());
            }
        }
        qb.push(" WHERE id = ")
            .push_bind(case_id)
            .push(" AND revision = ")
            .push_bind(from_revision(write.expected_revision))
            .push(" RETURNING revision");

        let bumped: Option<i64> = qb
            .build_query_scalar::<i64>()
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("appointments", e))?;

        let revision = match bumped {
            Some(revision) => to_revision(revision),
            None => {
                return Err(match Self::current_revision(&mut tx, case_id).await? {
                    None => StoreError::NotFound(case_id),
                    Some(current) => StoreError::Conflict {
                        case_id,
                        expected: write.expected_revision,
                        current,
                    },
                });
            }
        };

        let mut events = Vec::new();
        if write.appointment.is_some() {
            events.push((Table::Appointments, appointment_fields));
        }
        if let Some(change) = &write.stages {
            Self::write_stages(&mut tx, case_id, change).await?;
            events.push((Table::StageStates, change.columns()));
        }
        if let Some(record) = &write.result {
            Self::upsert_result(&mut tx, case_id, record).await?;
            if let Some(stage) = stage_for_table(&record.table) {
                events.push((
                    Table::Results(stage),
                    record.columns().map(str::to_string).collect(),
                ));
            }
        }
        if events.is_empty() {
            events.push((Table::Appointments, vec!["revision".into()]));
        }

        let row = sqlx::query(&format!("{SNAPSHOT_SELECT} WHERE a.id = $1"))
            .bind(case_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("appointments", e))?;
        let snapshot = snapshot_from_row(&row)?;

        for (table, changed_fields) in events {
            Self::notify(
                &mut tx,
                &ChangeEvent {
                    table,
                    case_id,
                    revision,
                    changed_fields,
                    snapshot: Some(snapshot.clone()),
                    written_by: write.written_by,
                },
            )
            .await?;
        }
        tx.commit().await.map_err(|e| db_error("appointments", e))?;
        debug!(case_id = %case_id, revision, "postgres store write");

        Ok(WriteReceipt {
            case_id,
            revision,
            snapshot,
            written_at: Utc::now(),
        })
    }

    async fn save_draft(
        &self,
        case_id: Uuid,
        record: ResultRecord,
        written_by: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let stage = stage_for_table(&record.table).ok_or_else(|| {
            StoreError::Internal(anyhow!("unknown result table {}", record.table))
        })?;
        let mut tx = self.pool.begin().await.map_err(|e| db_error(&record.table, e))?;
        let revision = Self::current_revision(&mut tx, case_id)
            .await?
            .ok_or(StoreError::NotFound(case_id))?;

        Self::upsert_result(&mut tx, case_id, &record).await?;
        Self::notify(
            &mut tx,
            &ChangeEvent {
                table: Table::Results(stage),
                case_id,
                revision,
                changed_fields: record.columns().map(str::to_string).collect(),
                snapshot: None,
                written_by,
            },
        )
        .await?;
        tx.commit().await.map_err(|e| db_error(&record.table, e))?;
        Ok(())
    }

    fn subscribe(&self) -> ChangeFeed {
        self.feed.subscribe()
    }
}

// ── Change listener ───────────────────────────────────────────

/// Relays `LISTEN case_changes` into the store's change feed.
pub struct PgChangeListener {
    pool: PgPool,
    feed: broadcast::Sender<ChangeEvent>,
    fanout: Option<Arc<NotificationFanout>>,
}

impl PgChangeListener {
    /// Ask every session to resync when the listen connection drops, since
    /// notifications sent while disconnected are lost.
    pub fn with_fanout(mut self, fanout: Arc<NotificationFanout>) -> Self {
        self.fanout = Some(fanout);
        self
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| db_error(CHANGE_CHANNEL, e))?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .map_err(|e| db_error(CHANGE_CHANNEL, e))?;
        info!(channel = CHANGE_CHANNEL, "Change listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                received = listener.try_recv() => match received {
                    Ok(Some(notification)) => {
                        match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                            Ok(event) => {
                                // No receivers is fine; nobody is connected yet.
                                let _ = self.feed.send(event);
                            }
                            Err(e) => warn!(error = %e, "ignoring malformed change notification"),
                        }
                    }
                    Ok(None) => {
                        warn!("change listener connection lost, reconnecting");
                        if let Some(fanout) = &self.fanout {
                            fanout.publish(FanoutMessage::Resync);
                        }
                    }
                    Err(e) => {
                        error!(?e, "change listener error");
                        tokio::time::sleep(Duration::from_millis(LISTENER_BACKOFF_MS)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Change listener shutting down");
        Ok(())
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(shutdown).await {
                error!(error = %e, "change listener failed to start");
            }
        })
    }
}

// ── Row mapping ───────────────────────────────────────────────

enum StageValue {
    Text(String),
    Id(Option<Uuid>),
    At(DateTime<Utc>),
}

fn stage_values(change: &StageChange) -> Vec<(String, StageValue)> {
    let mut values: Vec<(String, StageValue)> = change
        .statuses
        .iter()
        .map(|(stage, status)| {
            (
                format!("{}_status", stage),
                StageValue::Text(status.as_str().to_string()),
            )
        })
        .collect();
    if let Some(doctor) = change.assigned_doctor_id {
        values.push(("assigned_doctor_id".into(), StageValue::Id(Some(doctor))));
    }
    if let Some(key) = &change.xray_artifact_key {
        values.push(("xray_artifact_key".into(), StageValue::Text(key.clone())));
    }
    if let Some((stage, mark)) = &change.mark {
        values.push((format!("{}_done_at", stage), StageValue::At(mark.at)));
        values.push((format!("{}_done_by", stage), StageValue::Id(mark.by)));
    }
    values
}

fn snapshot_from_row(row: &PgRow) -> Result<CaseSnapshot, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::Internal(anyhow!(e));
    let id: Uuid = row.try_get("id").map_err(get_err)?;
    let status: String = row.try_get("status").map_err(get_err)?;
    let scheduled_date: NaiveDate = row.try_get("scheduled_date").map_err(get_err)?;
    let revision: i64 = row.try_get("revision").map_err(get_err)?;
    let stages: Option<Value> = row.try_get("stages").map_err(get_err)?;

    let appointment = Appointment {
        id,
        patient_id: row.try_get("patient_id").map_err(get_err)?,
        case_type: row.try_get("case_type").map_err(get_err)?,
        scheduled_date,
        assigned_physician_id: row.try_get("assigned_physician_id").map_err(get_err)?,
        status: AppointmentStatus::from_str(&status).map_err(|e| anyhow!(e))?,
        rejection_reason: row.try_get("rejection_reason").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    };

    Ok(CaseSnapshot {
        appointment,
        stages: stages
            .filter(|v| !v.is_null())
            .map(|v| stage_state_from_json(id, &v))
            .transpose()?,
        revision: to_revision(revision),
    })
}

/// Decode a `to_jsonb(stage_states)` row. Columns the schema lacks (audit
/// columns on an older database) simply read as absent.
fn stage_state_from_json(case_id: Uuid, value: &Value) -> Result<StageState, StoreError> {
    let updated_at = value
        .get("updated_at")
        .cloned()
        .map(serde_json::from_value::<DateTime<Utc>>)
        .transpose()
        .map_err(|e| anyhow!(e))?
        .unwrap_or_else(Utc::now);
    let mut state = StageState::activated(case_id, updated_at);

    for stage in Stage::ALL {
        if let Some(raw) = value.get(format!("{}_status", stage)).and_then(Value::as_str) {
            let status = StageStatus::from_str(raw).map_err(|e| anyhow!(e))?;
            state.set_status(stage, status);
        }
        let at = value
            .get(format!("{}_done_at", stage))
            .filter(|v| !v.is_null())
            .cloned()
            .map(serde_json::from_value::<DateTime<Utc>>)
            .transpose()
            .map_err(|e| anyhow!(e))?;
        if let Some(at) = at {
            let by = value
                .get(format!("{}_done_by", stage))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok());
            state.marks.insert(stage, StageMark { at, by });
        }
    }
    state.assigned_doctor_id = value
        .get("assigned_doctor_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());
    state.xray_artifact_key = value
        .get("xray_artifact_key")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(state)
}

fn stage_for_table(table: &str) -> Option<Stage> {
    Stage::ALL.into_iter().find(|s| result_table(*s) == table)
}

fn to_revision(revision: i64) -> u64 {
    u64::try_from(revision).unwrap_or_default()
}

fn from_revision(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

/// Only plain snake_case identifiers are ever interpolated into SQL.
fn ident(name: &str) -> Result<&str, StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::Internal(anyhow!("refusing identifier {:?}", name)))
    }
}

// ── Error mapping ─────────────────────────────────────────────

/// SQLSTATE for `undefined_column`
const UNDEFINED_COLUMN: &str = "42703";

fn db_error(table: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            let undefined = db.code().as_deref() == Some(UNDEFINED_COLUMN);
            if undefined || StoreError::looks_like_drift(&message) {
                return StoreError::SchemaDrift {
                    table: table.to_string(),
                    columns: missing_column(&message).into_iter().collect(),
                    message,
                };
            }
            StoreError::Internal(anyhow!(err))
        }
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Internal(anyhow!(err)),
    }
}

/// Column named by an undefined-column message, e.g.
/// `column "impression" of relation "xray_results" does not exist` or
/// `column r.impression does not exist`.
fn missing_column(message: &str) -> Option<String> {
    let rest = message.strip_prefix("column ")?;
    let name = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next()?,
        None => rest.split_whitespace().next()?,
    };
    let name = name.rsplit('.').next()?.trim_matches('"');
    (!name.is_empty()).then(|| name.to_string())
}
