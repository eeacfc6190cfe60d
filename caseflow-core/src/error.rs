use thiserror::Error;
use uuid::Uuid;

use crate::identity::Role;
use crate::stage::{Stage, StageStatus};
use crate::state::AppointmentStatus;

/// Failures surfaced by the transition coordinator to the calling session.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid transition for {stage}: {from} -> {to}")]
    InvalidTransition {
        stage: Stage,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("case {case_id} is closed ({status})")]
    CaseClosed {
        case_id: Uuid,
        status: AppointmentStatus,
    },

    #[error(
        "stale transition on case {case_id}: expected revision {expected}, store has {current}"
    )]
    StaleTransition {
        case_id: Uuid,
        expected: u64,
        current: u64,
    },

    #[error("prerequisite not met for {stage}: {}", fmt_stages(.missing))]
    PrerequisiteNotMet { stage: Stage, missing: Vec<Stage> },

    #[error("schema drift on {table}: {message}")]
    SchemaDrift { table: String, message: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("case not found: {0}")]
    CaseNotFound(Uuid),

    #[error("case {case_id} is assigned to another physician")]
    NotAssigned { case_id: Uuid },

    #[error("role {role} may not {action}")]
    RoleNotPermitted { role: Role, action: String },

    #[error("appointment cannot move from {from} to {to}")]
    InvalidStatusChange {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("patient {patient_id} already has open case {case_id}")]
    OpenCaseExists { patient_id: Uuid, case_id: Uuid },

    #[error("internal store error: {0}")]
    Internal(String),
}

fn fmt_stages(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(Stage::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl CoordinatorError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidTransition { .. } => 422,
            Self::CaseClosed { .. } => 409,
            Self::StaleTransition { .. } => 409,
            Self::PrerequisiteNotMet { .. } => 422,
            Self::SchemaDrift { .. } => 500,
            Self::StoreUnavailable(_) => 503,
            Self::CaseNotFound(_) => 404,
            Self::NotAssigned { .. } => 403,
            Self::RoleNotPermitted { .. } => 403,
            Self::InvalidStatusChange { .. } => 422,
            Self::InvalidPayload(_) => 400,
            Self::OpenCaseExists { .. } => 409,
            Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable tag for API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::CaseClosed { .. } => "case_closed",
            Self::StaleTransition { .. } => "stale_transition",
            Self::PrerequisiteNotMet { .. } => "prerequisite_not_met",
            Self::SchemaDrift { .. } => "schema_drift",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::CaseNotFound(_) => "case_not_found",
            Self::NotAssigned { .. } => "not_assigned",
            Self::RoleNotPermitted { .. } => "role_not_permitted",
            Self::InvalidStatusChange { .. } => "invalid_status_change",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::OpenCaseExists { .. } => "open_case_exists",
            Self::Internal(_) => "internal",
        }
    }

    /// The caller's view of the case is out of date and must be re-fetched.
    pub fn should_refresh(&self) -> bool {
        matches!(
            self,
            Self::StaleTransition { .. }
                | Self::CaseClosed { .. }
                | Self::CaseNotFound(_)
                | Self::NotAssigned { .. }
                | Self::PrerequisiteNotMet { .. }
        )
    }

    /// The operator may try again (after a refresh for stale writes).
    /// Nothing is retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StaleTransition { .. } | Self::StoreUnavailable(_)
        )
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::CaseNotFound(id),
            StoreError::Conflict {
                case_id,
                expected,
                current,
            } => Self::StaleTransition {
                case_id,
                expected,
                current,
            },
            StoreError::SchemaDrift { table, message, .. } => Self::SchemaDrift { table, message },
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Internal(e) => Self::Internal(format!("{e:#}")),
        }
    }
}

/// Failures reported by a case store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("case not found: {0}")]
    NotFound(Uuid),

    #[error("revision conflict on case {case_id}: expected {expected}, current {current}")]
    Conflict {
        case_id: Uuid,
        expected: u64,
        current: u64,
    },

    /// The store does not recognise one or more columns of the write.
    #[error("schema drift on {table} ({}): {message}", .columns.join(", "))]
    SchemaDrift {
        table: String,
        columns: Vec<String>,
        message: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Heuristic used on raw driver messages, e.g. "column \"lab_done_at\" does not exist".
    pub fn looks_like_drift(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("could not find")
            || lower.contains("does not exist")
            || lower.contains("schema cache")
    }
}

#[derive(Debug, Error)]
pub enum ProjectorError {
    #[error("reorder gap on case {case_id}: {buffered} events buffered past revision {applied}")]
    Gap {
        case_id: Uuid,
        applied: u64,
        buffered: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── http_status ──────────────────────────────────────────────

    #[test]
    fn http_status_stale_transition() {
        let e = CoordinatorError::StaleTransition {
            case_id: Uuid::nil(),
            expected: 3,
            current: 4,
        };
        assert_eq!(e.http_status(), 409);
    }

    #[test]
    fn http_status_prerequisite_not_met() {
        let e = CoordinatorError::PrerequisiteNotMet {
            stage: Stage::Lab,
            missing: vec![Stage::Triage],
        };
        assert_eq!(e.http_status(), 422);
    }

    #[test]
    fn http_status_store_unavailable() {
        assert_eq!(
            CoordinatorError::StoreUnavailable("down".into()).http_status(),
            503
        );
    }

    #[test]
    fn http_status_not_assigned() {
        let e = CoordinatorError::NotAssigned {
            case_id: Uuid::nil(),
        };
        assert_eq!(e.http_status(), 403);
    }

    #[test]
    fn http_status_role_not_permitted() {
        let e = CoordinatorError::RoleNotPermitted {
            role: Role::Lab,
            action: "set triage to completed".into(),
        };
        assert_eq!(e.http_status(), 403);
        assert_eq!(e.to_string(), "role lab may not set triage to completed");
    }

    #[test]
    fn http_status_invalid_payload() {
        assert_eq!(
            CoordinatorError::InvalidPayload("x".into()).http_status(),
            400
        );
    }

    #[test]
    fn store_internal_is_not_a_transport_failure() {
        let e: CoordinatorError =
            StoreError::Internal(anyhow::anyhow!("duplicate appointment id")).into();
        assert!(matches!(e, CoordinatorError::Internal(ref msg) if msg.contains("duplicate")));
        assert_eq!(e.http_status(), 500);
        assert_eq!(e.kind(), "internal");
        assert!(!e.is_retryable());

        let e: CoordinatorError = StoreError::Unavailable("pool timed out".into()).into();
        assert_eq!(e.http_status(), 503);
        assert!(e.is_retryable());
    }

    #[test]
    fn http_status_open_case_exists() {
        let e = CoordinatorError::OpenCaseExists {
            patient_id: Uuid::nil(),
            case_id: Uuid::nil(),
        };
        assert_eq!(e.http_status(), 409);
        assert!(!e.should_refresh());
    }

    // ── Display ──────────────────────────────────────────────────

    #[test]
    fn display_prerequisite_lists_missing() {
        let e = CoordinatorError::PrerequisiteNotMet {
            stage: Stage::Doctor,
            missing: vec![Stage::Lab, Stage::Xray],
        };
        assert_eq!(e.to_string(), "prerequisite not met for doctor: lab, xray");
    }

    #[test]
    fn display_invalid_transition() {
        let e = CoordinatorError::InvalidTransition {
            stage: Stage::Lab,
            from: StageStatus::Completed,
            to: StageStatus::Pending,
        };
        assert_eq!(e.to_string(), "invalid transition for lab: completed -> pending");
    }

    #[test]
    fn display_store_drift() {
        let e = StoreError::SchemaDrift {
            table: "lab_results".into(),
            columns: vec!["lab_done_at".into(), "lab_done_by".into()],
            message: "column does not exist".into(),
        };
        assert_eq!(
            e.to_string(),
            "schema drift on lab_results (lab_done_at, lab_done_by): column does not exist"
        );
    }

    // ── Classification ───────────────────────────────────────────

    #[test]
    fn stale_is_refresh_and_retry() {
        let e = CoordinatorError::StaleTransition {
            case_id: Uuid::nil(),
            expected: 1,
            current: 2,
        };
        assert!(e.should_refresh());
        assert!(e.is_retryable());
    }

    #[test]
    fn invalid_transition_is_not_retryable() {
        let e = CoordinatorError::InvalidTransition {
            stage: Stage::Lab,
            from: StageStatus::Completed,
            to: StageStatus::Pending,
        };
        assert!(!e.should_refresh());
        assert!(!e.is_retryable());
    }

    #[test]
    fn store_conflict_maps_to_stale() {
        let id = Uuid::new_v4();
        let e: CoordinatorError = StoreError::Conflict {
            case_id: id,
            expected: 5,
            current: 6,
        }
        .into();
        assert!(matches!(
            e,
            CoordinatorError::StaleTransition { case_id, expected: 5, current: 6 } if case_id == id
        ));
    }

    #[test]
    fn drift_heuristic() {
        assert!(StoreError::looks_like_drift(
            "column \"lab_done_at\" of relation \"lab_results\" does not exist"
        ));
        assert!(StoreError::looks_like_drift(
            "Could not find the 'impression' column in the schema cache"
        ));
        assert!(!StoreError::looks_like_drift("connection reset by peer"));
    }
}
