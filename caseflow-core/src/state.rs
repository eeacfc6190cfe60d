//! Case State Types
//!
//! Appointment, the per-case StageState record, and the joined snapshot the
//! eligibility rules and the coordinator both read.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::stage::{Stage, StageStatus};

/// Supervisory lifecycle of an appointment.
///
/// - `Pending` → `Approved` (admin)
/// - `Approved` → `InProgress` (payment completed)
/// - `InProgress` → `Completed` (report released)
/// - anything except `Completed` → `Rejected` | `Cancelled` (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Approved,
    InProgress,
    Completed,
    Rejected,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// Rejected and cancelled cases are closed for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        match (self, next) {
            (Rejected | Cancelled, _) => false,
            (Completed, _) => false,
            (_, Rejected | Cancelled) => true,
            (Pending, Approved) => true,
            (Approved, InProgress) => true,
            (InProgress, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown appointment status: {}", s)),
        }
    }
}

/// A booked patient case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    /// e.g. "pre_employment", "annual_physical"
    pub case_type: String,
    pub scheduled_date: NaiveDate,
    /// Physician chosen at booking, if any
    pub assigned_physician_id: Option<Uuid>,
    pub status: AppointmentStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn new(
        patient_id: Uuid,
        case_type: impl Into<String>,
        scheduled_date: NaiveDate,
        assigned_physician_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            patient_id,
            case_type: case_type.into(),
            scheduled_date,
            assigned_physician_id,
            status: AppointmentStatus::Pending,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Who finished a stage, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMark {
    pub at: DateTime<Utc>,
    pub by: Option<Uuid>,
}

/// Per-case stage record. Created lazily on first stage activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub case_id: Uuid,
    pub payment_status: StageStatus,
    pub triage_status: StageStatus,
    pub lab_status: StageStatus,
    pub xray_status: StageStatus,
    pub doctor_status: StageStatus,
    pub release_status: StageStatus,
    /// Pins the case to one physician when set
    pub assigned_doctor_id: Option<Uuid>,
    /// Storage key of the uploaded radiograph
    pub xray_artifact_key: Option<String>,
    #[serde(default)]
    pub marks: BTreeMap<Stage, StageMark>,
    pub updated_at: DateTime<Utc>,
}

impl StageState {
    /// Fresh record with every stage activated (`pending`).
    pub fn activated(case_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            case_id,
            payment_status: StageStatus::Pending,
            triage_status: StageStatus::Pending,
            lab_status: StageStatus::Pending,
            xray_status: StageStatus::Pending,
            doctor_status: StageStatus::Pending,
            release_status: StageStatus::Pending,
            assigned_doctor_id: None,
            xray_artifact_key: None,
            marks: BTreeMap::new(),
            updated_at: at,
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Payment => self.payment_status,
            Stage::Triage => self.triage_status,
            Stage::Lab => self.lab_status,
            Stage::Xray => self.xray_status,
            Stage::Doctor => self.doctor_status,
            Stage::Release => self.release_status,
        }
    }

    pub fn set_status(&mut self, stage: Stage, status: StageStatus) {
        let slot = match stage {
            Stage::Payment => &mut self.payment_status,
            Stage::Triage => &mut self.triage_status,
            Stage::Lab => &mut self.lab_status,
            Stage::Xray => &mut self.xray_status,
            Stage::Doctor => &mut self.doctor_status,
            Stage::Release => &mut self.release_status,
        };
        *slot = status;
    }

    /// Prerequisites of `stage` that are not yet satisfied.
    pub fn unmet_prerequisites(&self, stage: Stage) -> Vec<Stage> {
        stage
            .prerequisites()
            .iter()
            .copied()
            .filter(|pre| !self.status(*pre).is_satisfied())
            .collect()
    }
}

/// Joined (Appointment, StageState) view of one case at one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub appointment: Appointment,
    pub stages: Option<StageState>,
    /// Per-case revision; bumped by every eligibility-affecting write
    pub revision: u64,
}

impl CaseSnapshot {
    pub fn case_id(&self) -> Uuid {
        self.appointment.id
    }

    /// Status of `stage`, treating a missing record as all `unset`.
    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stages
            .as_ref()
            .map(|s| s.status(stage))
            .unwrap_or_default()
    }

    /// Effective physician pin: stage-level first, then booking-level.
    pub fn pinned_doctor(&self) -> Option<Uuid> {
        self.stages
            .as_ref()
            .and_then(|s| s.assigned_doctor_id)
            .or(self.appointment.assigned_physician_id)
    }

    pub fn unmet_prerequisites(&self, stage: Stage) -> Vec<Stage> {
        match &self.stages {
            Some(s) => s.unmet_prerequisites(stage),
            None => stage.prerequisites().to_vec(),
        }
    }

    /// Timestamp used for FIFO ordering.
    pub fn queued_at(&self) -> DateTime<Utc> {
        self.stages
            .as_ref()
            .map(|s| s.updated_at)
            .unwrap_or(self.appointment.updated_at)
    }

    pub fn is_closed(&self) -> bool {
        self.appointment.status.is_terminal()
    }
}
