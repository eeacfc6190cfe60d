//! Caller identity as supplied by the upstream identity collaborator.
//!
//! Treated as trusted: authentication happens before a request reaches here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stage::{Stage, StageStatus};

/// Staff role operating one department terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Cashier,
    Nurse,
    Lab,
    XrayTechnician,
    Radiologist,
    Physician,
    Admin,
}

impl Role {
    pub const QUEUED: [Role; 6] = [
        Role::Cashier,
        Role::Nurse,
        Role::Lab,
        Role::XrayTechnician,
        Role::Radiologist,
        Role::Physician,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cashier => "cashier",
            Self::Nurse => "nurse",
            Self::Lab => "lab",
            Self::XrayTechnician => "xray_technician",
            Self::Radiologist => "radiologist",
            Self::Physician => "physician",
            Self::Admin => "admin",
        }
    }

    /// Whether this role may move `stage` to `status`.
    pub fn may_set(&self, stage: Stage, status: StageStatus) -> bool {
        use StageStatus::*;
        match self {
            Self::Admin => true,
            Self::Cashier => stage == Stage::Payment,
            Self::Nurse => stage == Stage::Triage,
            Self::Lab => stage == Stage::Lab,
            Self::XrayTechnician => {
                stage == Stage::Xray && matches!(status, Pending | Uploaded | Released)
            }
            Self::Radiologist => stage == Stage::Xray && status == Completed,
            Self::Physician => matches!(stage, Stage::Doctor | Stage::Release),
        }
    }

    /// Whether this role may save draft content for `stage`.
    pub fn may_draft(&self, stage: Stage) -> bool {
        match self {
            Self::XrayTechnician | Self::Radiologist => stage == Stage::Xray,
            _ => self.may_set(stage, StageStatus::Completed),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cashier" => Ok(Self::Cashier),
            "nurse" | "triage" => Ok(Self::Nurse),
            "lab" => Ok(Self::Lab),
            "xray_technician" | "xray" | "radtech" => Ok(Self::XrayTechnician),
            "radiologist" => Ok(Self::Radiologist),
            "physician" | "doctor" => Ok(Self::Physician),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Identity attached to every coordinator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }
}
