//! Stage State Machine
//!
//! The six clinical stages, the per-stage status ladder, and the single
//! prerequisite map every other component derives its rules from.
//! Pure logic, no I/O.

use serde::{Deserialize, Serialize};

/// One department's step in the case pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Payment,
    Triage,
    Lab,
    Xray,
    Doctor,
    Release,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Payment,
        Stage::Triage,
        Stage::Lab,
        Stage::Xray,
        Stage::Doctor,
        Stage::Release,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Triage => "triage",
            Self::Lab => "lab",
            Self::Xray => "xray",
            Self::Doctor => "doctor",
            Self::Release => "release",
        }
    }

    /// Stages that must be satisfied before this stage may move past `pending`.
    ///
    /// This is the only place stage ordering is written down. Queue rules and
    /// coordinator checks both read it.
    pub fn prerequisites(&self) -> &'static [Stage] {
        match self {
            Self::Payment => &[],
            Self::Triage => &[Stage::Payment],
            Self::Lab => &[Stage::Payment, Stage::Triage],
            Self::Xray => &[Stage::Payment],
            Self::Doctor => &[Stage::Lab, Stage::Xray],
            Self::Release => &[Stage::Doctor],
        }
    }

    /// Statuses this stage may hold, in ladder order.
    pub fn lifecycle(&self) -> &'static [StageStatus] {
        use StageStatus::*;
        match self {
            Self::Xray => &[Unset, Pending, Uploaded, Completed, Released],
            Self::Doctor => &[Unset, Pending, Completed, Released],
            Self::Payment | Self::Triage | Self::Lab | Self::Release => {
                &[Unset, Pending, Completed]
            }
        }
    }

    pub fn allows(&self, status: StageStatus) -> bool {
        self.lifecycle().contains(&status)
    }

    /// Statuses that cannot be skipped on the way to a higher one.
    fn is_mandatory(&self, status: StageStatus) -> bool {
        match (self, status) {
            (Self::Xray, StageStatus::Uploaded) => true,
            (Self::Xray | Self::Doctor, StageStatus::Completed) => true,
            _ => false,
        }
    }

    /// Check whether `from -> to` is a legal forward move for this stage.
    pub fn can_advance(&self, from: StageStatus, to: StageStatus) -> bool {
        if !self.allows(to) || to.rank() <= from.rank() {
            return false;
        }
        !self
            .lifecycle()
            .iter()
            .any(|s| s.rank() > from.rank() && s.rank() < to.rank() && self.is_mandatory(*s))
    }

    /// Attempt a forward move, returning the offending pair on failure.
    pub fn try_advance(
        &self,
        from: StageStatus,
        to: StageStatus,
    ) -> Result<StageStatus, (StageStatus, StageStatus)> {
        if self.can_advance(from, to) {
            Ok(to)
        } else {
            Err((from, to))
        }
    }

    /// Statuses reachable in one legal move from `from`.
    pub fn next_statuses(&self, from: StageStatus) -> Vec<StageStatus> {
        self.lifecycle()
            .iter()
            .copied()
            .filter(|to| self.can_advance(from, *to))
            .collect()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment" => Ok(Self::Payment),
            "triage" => Ok(Self::Triage),
            "lab" => Ok(Self::Lab),
            "xray" | "radiology" => Ok(Self::Xray),
            "doctor" | "physician" => Ok(Self::Doctor),
            "release" => Ok(Self::Release),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Status of a single stage.
///
/// Ladder: `Unset` → `Pending` → `Uploaded` → `Completed` → `Released`.
/// Moves are forward only; which rungs exist depends on the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Unset,
    Pending,
    Uploaded,
    Completed,
    Released,
}

impl StageStatus {
    pub fn rank(&self) -> u8 {
        match self {
            Self::Unset => 0,
            Self::Pending => 1,
            Self::Uploaded => 2,
            Self::Completed => 3,
            Self::Released => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Pending => "pending",
            Self::Uploaded => "uploaded",
            Self::Completed => "completed",
            Self::Released => "released",
        }
    }

    /// A prerequisite counts as met once it is completed or released.
    pub fn is_satisfied(&self) -> bool {
        self.rank() >= StageStatus::Completed.rank()
    }

    /// Moves above `pending` are stage work and need prerequisites.
    pub fn is_work(&self) -> bool {
        self.rank() > StageStatus::Pending.rank()
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "unset" => Ok(Self::Unset),
            "pending" => Ok(Self::Pending),
            "uploaded" => Ok(Self::Uploaded),
            "completed" => Ok(Self::Completed),
            "released" => Ok(Self::Released),
            _ => Err(format!("Unknown stage status: {}", s)),
        }
    }
}

impl TryFrom<String> for StageStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.to_lowercase().parse()
    }
}
