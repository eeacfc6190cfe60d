//! Transition Coordinator
//!
//! Executes stage advances, draft saves and appointment lifecycle changes.
//! Every precondition is re-checked against a fresh read; the conditional
//! write in the store is what actually arbitrates between operators.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactStore;
use crate::error::{CoordinatorError, StoreError};
use crate::identity::{Caller, Role};
use crate::payload::{ResultRecord, StageResult};
use crate::stage::{Stage, StageStatus};
use crate::state::{Appointment, AppointmentStatus, CaseSnapshot, StageMark};
use crate::store::{AppointmentChange, CaseStore, CaseWrite, StageChange, WriteReceipt};

/// Request to move one stage forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceRequest {
    pub case_id: Uuid,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub payload: Option<StageResult>,
    /// Case revision the caller last observed
    pub expected_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub patient_id: Uuid,
    pub case_type: String,
    pub scheduled_date: NaiveDate,
    #[serde(default)]
    pub assigned_physician_id: Option<Uuid>,
}

pub struct TransitionCoordinator {
    store: Arc<dyn CaseStore>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
}

impl TransitionCoordinator {
    pub fn new(store: Arc<dyn CaseStore>) -> Self {
        Self {
            store,
            artifacts: None,
        }
    }

    /// Check recorded X-ray keys against this store.
    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn store(&self) -> &Arc<dyn CaseStore> {
        &self.store
    }

    pub async fn load_case(&self, case_id: Uuid) -> Result<CaseSnapshot, CoordinatorError> {
        Ok(self.store.load_case(case_id).await?)
    }

    /// Advance `request.stage` to `request.status`, persisting the payload in
    /// the same write.
    pub async fn advance_stage(
        &self,
        caller: &Caller,
        request: AdvanceRequest,
    ) -> Result<WriteReceipt, CoordinatorError> {
        let artifact_key = match (&request.payload, request.stage, request.status) {
            (Some(StageResult::Xray(x)), Stage::Xray, StageStatus::Uploaded) => {
                x.artifact_key.clone()
            }
            _ => None,
        };
        self.transition(
            caller,
            request.case_id,
            request.stage,
            request.status,
            request.payload.as_ref(),
            artifact_key,
            request.expected_version,
        )
        .await
    }

    /// Record that a radiograph was stored under `artifact_key` and move the
    /// X-ray stage to `uploaded`. Existing reading content is left alone.
    pub async fn record_xray_upload(
        &self,
        caller: &Caller,
        case_id: Uuid,
        artifact_key: String,
        expected_version: u64,
    ) -> Result<WriteReceipt, CoordinatorError> {
        self.transition(
            caller,
            case_id,
            Stage::Xray,
            StageStatus::Uploaded,
            None,
            Some(artifact_key),
            expected_version,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        caller: &Caller,
        case_id: Uuid,
        stage: Stage,
        status: StageStatus,
        payload: Option<&StageResult>,
        artifact_key: Option<String>,
        expected_version: u64,
    ) -> Result<WriteReceipt, CoordinatorError> {
        let snapshot = self.store.load_case(case_id).await?;

        ensure_open(&snapshot)?;
        if snapshot.revision != expected_version {
            return Err(CoordinatorError::StaleTransition {
                case_id,
                expected: expected_version,
                current: snapshot.revision,
            });
        }
        if !caller.role.may_set(stage, status) {
            return Err(CoordinatorError::RoleNotPermitted {
                role: caller.role,
                action: format!("set {} to {}", stage, status),
            });
        }
        ensure_assigned(&snapshot, caller, stage)?;

        let from = snapshot.status(stage);
        stage
            .try_advance(from, status)
            .map_err(|(from, to)| CoordinatorError::InvalidTransition { stage, from, to })?;

        if status.is_work() {
            let missing = snapshot.unmet_prerequisites(stage);
            if !missing.is_empty() {
                return Err(CoordinatorError::PrerequisiteNotMet { stage, missing });
            }
        }

        match payload {
            Some(p) => p
                .validate_for(stage, status)
                .map_err(CoordinatorError::InvalidPayload)?,
            None if StageResult::required_for(stage, status) => {
                return Err(CoordinatorError::InvalidPayload(format!(
                    "{} {} requires result content",
                    stage, status
                )));
            }
            None => {}
        }

        if stage == Stage::Xray && status == StageStatus::Uploaded {
            match artifact_key.as_deref().map(str::trim) {
                Some(key) if !key.is_empty() => self.ensure_artifact(key).await?,
                _ => {
                    return Err(CoordinatorError::InvalidPayload(
                        "an uploaded X-ray needs an artifact key".into(),
                    ))
                }
            }
        }

        let now = Utc::now();
        let mut stages = StageChange::status(stage, status);
        stages.xray_artifact_key = artifact_key;
        if status.is_satisfied() {
            stages.mark = Some((
                stage,
                StageMark {
                    at: now,
                    by: Some(caller.user_id),
                },
            ));
        }

        let mut write = CaseWrite::new(case_id, expected_version)
            .with_stages(stages)
            .by(caller.user_id);
        if let Some(next) = coupled_appointment_status(&snapshot, stage, status) {
            write = write.with_appointment(AppointmentChange {
                status: Some(next),
                rejection_reason: None,
            });
        }
        if let Some(p) = payload {
            write = write.with_result(to_record(p)?);
        }

        let receipt = self.write_with_fallback(write, payload).await?;
        info!(
            case_id = %case_id,
            stage = %stage,
            from = %from,
            to = %status,
            revision = receipt.revision,
            user_id = %caller.user_id,
            "stage advanced"
        );
        Ok(receipt)
    }

    /// Persist stage content without changing status or revision.
    pub async fn save_draft_result(
        &self,
        caller: &Caller,
        case_id: Uuid,
        payload: StageResult,
    ) -> Result<(), CoordinatorError> {
        let stage = payload.stage();
        let snapshot = self.store.load_case(case_id).await?;

        ensure_open(&snapshot)?;
        if !caller.role.may_draft(stage) {
            return Err(CoordinatorError::RoleNotPermitted {
                role: caller.role,
                action: format!("edit {} results", stage),
            });
        }
        ensure_assigned(&snapshot, caller, stage)?;

        let current = snapshot.status(stage);
        if current == StageStatus::Released && caller.role != Role::Admin {
            return Err(CoordinatorError::InvalidTransition {
                stage,
                from: current,
                to: current,
            });
        }
        payload
            .validate_draft()
            .map_err(CoordinatorError::InvalidPayload)?;

        let record = to_record(&payload)?;
        match self
            .store
            .save_draft(case_id, record, Some(caller.user_id))
            .await
        {
            Ok(()) => {}
            Err(StoreError::SchemaDrift {
                table,
                columns,
                message,
            }) => {
                warn!(
                    case_id = %case_id,
                    table = %table,
                    columns = ?columns,
                    %message,
                    "schema drift on draft save, retrying with fallback shape"
                );
                let fallback = fallback_record(&payload)?.without_columns(&columns);
                self.store
                    .save_draft(case_id, fallback, Some(caller.user_id))
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }
        debug!(case_id = %case_id, stage = %stage, "draft saved");
        Ok(())
    }

    /// Book a new case in `pending`.
    pub async fn book_appointment(
        &self,
        request: BookingRequest,
    ) -> Result<CaseSnapshot, CoordinatorError> {
        let case_type = request.case_type.trim();
        if case_type.is_empty() {
            return Err(CoordinatorError::InvalidPayload(
                "case type is required".into(),
            ));
        }
        self.ensure_no_open_case(request.patient_id).await?;

        let appointment = Appointment::new(
            request.patient_id,
            case_type,
            request.scheduled_date,
            request.assigned_physician_id,
        );
        let snapshot = self.store.insert_appointment(appointment).await?;
        info!(
            case_id = %snapshot.case_id(),
            patient_id = %request.patient_id,
            scheduled_date = %request.scheduled_date,
            "appointment booked"
        );
        Ok(snapshot)
    }

    /// A patient books again only once their latest case is released or
    /// closed.
    async fn ensure_no_open_case(&self, patient_id: Uuid) -> Result<(), CoordinatorError> {
        let latest = self
            .store
            .list_open_cases()
            .await?
            .into_iter()
            .filter(|c| c.appointment.patient_id == patient_id)
            .max_by_key(|c| c.appointment.created_at);

        match latest {
            Some(case)
                if case.appointment.status != AppointmentStatus::Completed
                    && !case.status(Stage::Release).is_satisfied() =>
            {
                Err(CoordinatorError::OpenCaseExists {
                    patient_id,
                    case_id: case.case_id(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Administrative lifecycle change (approve, reject, cancel).
    pub async fn set_appointment_status(
        &self,
        caller: &Caller,
        case_id: Uuid,
        status: AppointmentStatus,
        reason: Option<String>,
        expected_version: u64,
    ) -> Result<WriteReceipt, CoordinatorError> {
        if caller.role != Role::Admin {
            return Err(CoordinatorError::RoleNotPermitted {
                role: caller.role,
                action: format!("set appointment status to {}", status),
            });
        }

        let snapshot = self.store.load_case(case_id).await?;
        ensure_open(&snapshot)?;
        if snapshot.revision != expected_version {
            return Err(CoordinatorError::StaleTransition {
                case_id,
                expected: expected_version,
                current: snapshot.revision,
            });
        }

        let from = snapshot.appointment.status;
        if !from.can_transition_to(status) {
            return Err(CoordinatorError::InvalidStatusChange { from, to: status });
        }
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        if status == AppointmentStatus::Rejected && reason.is_none() {
            return Err(CoordinatorError::InvalidPayload(
                "a rejection needs a reason".into(),
            ));
        }

        let write = CaseWrite::new(case_id, expected_version)
            .with_appointment(AppointmentChange {
                status: Some(status),
                rejection_reason: reason,
            })
            .by(caller.user_id);
        let receipt = self.store.conditional_write(write).await?;
        info!(
            case_id = %case_id,
            from = %from,
            to = %status,
            revision = receipt.revision,
            "appointment status changed"
        );
        Ok(receipt)
    }

    /// Pin an active case to a physician. Other physicians stop seeing it in
    /// their doctor and release queues.
    pub async fn assign_doctor(
        &self,
        caller: &Caller,
        case_id: Uuid,
        doctor_id: Uuid,
        expected_version: u64,
    ) -> Result<WriteReceipt, CoordinatorError> {
        if caller.role != Role::Admin {
            return Err(CoordinatorError::RoleNotPermitted {
                role: caller.role,
                action: "assign a physician".into(),
            });
        }

        let snapshot = self.store.load_case(case_id).await?;
        ensure_open(&snapshot)?;
        if snapshot.revision != expected_version {
            return Err(CoordinatorError::StaleTransition {
                case_id,
                expected: expected_version,
                current: snapshot.revision,
            });
        }
        // The pin lives on the stage row, which payment creates.
        if snapshot.stages.is_none() {
            return Err(CoordinatorError::PrerequisiteNotMet {
                stage: Stage::Doctor,
                missing: vec![Stage::Payment],
            });
        }

        let write = CaseWrite::new(case_id, expected_version)
            .with_stages(StageChange {
                assigned_doctor_id: Some(doctor_id),
                ..Default::default()
            })
            .by(caller.user_id);
        let receipt = self.store.conditional_write(write).await?;
        info!(
            case_id = %case_id,
            doctor_id = %doctor_id,
            revision = receipt.revision,
            "physician assigned"
        );
        Ok(receipt)
    }

    /// One conditional write; on schema drift, exactly one retry with the
    /// payload's fallback shape and no audit columns.
    async fn write_with_fallback(
        &self,
        write: CaseWrite,
        payload: Option<&StageResult>,
    ) -> Result<WriteReceipt, CoordinatorError> {
        let err = match self.store.conditional_write(write.clone()).await {
            Ok(receipt) => return Ok(receipt),
            Err(e) => e,
        };
        let StoreError::SchemaDrift {
            table,
            columns,
            message,
        } = err
        else {
            return Err(err.into());
        };

        warn!(
            case_id = %write.case_id,
            table = %table,
            columns = ?columns,
            %message,
            "schema drift, retrying with degraded payload"
        );

        let mut retry = write;
        retry.stages = retry.stages.map(StageChange::without_audit);
        if let Some(p) = payload {
            retry.result = Some(fallback_record(p)?.without_columns(&columns));
        }
        Ok(self.store.conditional_write(retry).await?)
    }

    async fn ensure_artifact(&self, key: &str) -> Result<(), CoordinatorError> {
        let Some(artifacts) = &self.artifacts else {
            return Ok(());
        };
        match artifacts.exists(key).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(CoordinatorError::InvalidPayload(format!(
                "artifact {} not found",
                key
            ))),
            Err(crate::artifact::ArtifactError::InvalidRef(r)) => Err(
                CoordinatorError::InvalidPayload(format!("invalid artifact reference {}", r)),
            ),
            Err(e) => Err(CoordinatorError::StoreUnavailable(e.to_string())),
        }
    }
}

fn ensure_open(snapshot: &CaseSnapshot) -> Result<(), CoordinatorError> {
    if snapshot.is_closed() {
        return Err(CoordinatorError::CaseClosed {
            case_id: snapshot.case_id(),
            status: snapshot.appointment.status,
        });
    }
    Ok(())
}

/// Physician stages honour the case pin; admins may correct any case.
fn ensure_assigned(
    snapshot: &CaseSnapshot,
    caller: &Caller,
    stage: Stage,
) -> Result<(), CoordinatorError> {
    if !matches!(stage, Stage::Doctor | Stage::Release) || caller.role == Role::Admin {
        return Ok(());
    }
    match snapshot.pinned_doctor() {
        Some(pinned) if pinned != caller.user_id => Err(CoordinatorError::NotAssigned {
            case_id: snapshot.case_id(),
        }),
        _ => Ok(()),
    }
}

/// Appointment status carried along with a stage write.
fn coupled_appointment_status(
    snapshot: &CaseSnapshot,
    stage: Stage,
    status: StageStatus,
) -> Option<AppointmentStatus> {
    let current = snapshot.appointment.status;
    let next = match (stage, status) {
        (Stage::Payment, StageStatus::Completed) if current == AppointmentStatus::Approved => {
            AppointmentStatus::InProgress
        }
        (Stage::Release, StageStatus::Completed) => AppointmentStatus::Completed,
        _ => return None,
    };
    current.can_transition_to(next).then_some(next)
}

fn to_record(payload: &StageResult) -> Result<ResultRecord, CoordinatorError> {
    payload
        .to_record()
        .map_err(|e| CoordinatorError::InvalidPayload(e.to_string()))
}

fn fallback_record(payload: &StageResult) -> Result<ResultRecord, CoordinatorError> {
    payload
        .fallback_record()
        .map_err(|e| CoordinatorError::InvalidPayload(e.to_string()))
}
