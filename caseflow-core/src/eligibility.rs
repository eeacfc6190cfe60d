//! Eligibility Evaluator
//!
//! Decides whether a case belongs in a role's queue and where it sorts.
//! Every role rule is derived from [`Stage::prerequisites`]; no role
//! hand-codes another stage's status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Role;
use crate::stage::{Stage, StageStatus};
use crate::state::{AppointmentStatus, CaseSnapshot};

/// Which work-stage statuses keep a case in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWindow {
    /// Status ranked strictly below the bound
    Below(StageStatus),
    Exactly(StageStatus),
}

impl StatusWindow {
    pub fn contains(&self, status: StageStatus) -> bool {
        match self {
            Self::Below(bound) => status.rank() < bound.rank(),
            Self::Exactly(s) => status == *s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentGate {
    NotTerminal,
    Exactly(AppointmentStatus),
}

impl AppointmentGate {
    pub fn admits(&self, status: AppointmentStatus) -> bool {
        match self {
            Self::NotTerminal => !status.is_terminal(),
            Self::Exactly(s) => status == *s,
        }
    }
}

/// Queue predicate for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRule {
    pub role: Role,
    pub stage: Stage,
    pub window: StatusWindow,
    pub gate: AppointmentGate,
    /// The StageState row must already exist
    pub requires_stage_row: bool,
    /// An X-ray artifact key must be recorded
    pub requires_artifact: bool,
    /// Hide cases pinned to a different physician
    pub honours_pin: bool,
}

impl QueueRule {
    /// Rule for `role`, or `None` for roles without a work queue.
    pub fn for_role(role: Role) -> Option<Self> {
        let base = |stage| QueueRule {
            role,
            stage,
            window: StatusWindow::Below(StageStatus::Completed),
            gate: AppointmentGate::NotTerminal,
            requires_stage_row: true,
            requires_artifact: false,
            honours_pin: false,
        };
        let rule = match role {
            Role::Cashier => QueueRule {
                gate: AppointmentGate::Exactly(AppointmentStatus::Approved),
                requires_stage_row: false,
                ..base(Stage::Payment)
            },
            Role::Nurse => base(Stage::Triage),
            Role::Lab => base(Stage::Lab),
            Role::XrayTechnician => QueueRule {
                window: StatusWindow::Below(StageStatus::Released),
                ..base(Stage::Xray)
            },
            Role::Radiologist => QueueRule {
                window: StatusWindow::Exactly(StageStatus::Uploaded),
                requires_artifact: true,
                ..base(Stage::Xray)
            },
            Role::Physician => QueueRule {
                honours_pin: true,
                ..base(Stage::Doctor)
            },
            Role::Admin => return None,
        };
        Some(rule)
    }

    /// Ordering key if the case belongs in this queue for `viewer`.
    pub fn evaluate(&self, snapshot: &CaseSnapshot, viewer: Uuid) -> Option<QueueKey> {
        if !self.gate.admits(snapshot.appointment.status) {
            return None;
        }
        if self.requires_stage_row && snapshot.stages.is_none() {
            return None;
        }
        if !self.window.contains(snapshot.status(self.stage)) {
            return None;
        }
        if !snapshot.unmet_prerequisites(self.stage).is_empty() {
            return None;
        }
        if self.requires_artifact {
            let has_artifact = snapshot
                .stages
                .as_ref()
                .and_then(|s| s.xray_artifact_key.as_deref())
                .is_some_and(|k| !k.is_empty());
            if !has_artifact {
                return None;
            }
        }
        if self.honours_pin {
            if let Some(pinned) = snapshot.pinned_doctor() {
                if pinned != viewer {
                    return None;
                }
            }
        }
        Some(QueueKey::of(snapshot))
    }

    /// Whether a write moving the work stage to `status` finishes this
    /// queue's work on the case.
    pub fn is_finished_by(&self, stage: Stage, status: StageStatus) -> bool {
        stage == self.stage && !self.window.contains(status) && status.is_work()
    }
}

/// FIFO ordering key: oldest `updated_at` first, ties by case id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub queued_at: DateTime<Utc>,
    pub case_id: Uuid,
}

impl QueueKey {
    pub fn of(snapshot: &CaseSnapshot) -> Self {
        Self {
            queued_at: snapshot.queued_at(),
            case_id: snapshot.case_id(),
        }
    }
}

/// Convenience wrapper over [`QueueRule::for_role`] + [`QueueRule::evaluate`].
pub fn evaluate(role: Role, snapshot: &CaseSnapshot, viewer: Uuid) -> Option<QueueKey> {
    QueueRule::for_role(role)?.evaluate(snapshot, viewer)
}

/// Every queued role whose queue currently holds the case for `viewer`.
pub fn eligible_roles(snapshot: &CaseSnapshot, viewer: Uuid) -> Vec<Role> {
    Role::QUEUED
        .into_iter()
        .filter(|role| evaluate(*role, snapshot, viewer).is_some())
        .collect()
}
