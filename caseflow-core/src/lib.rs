//! Clinic case workflow coordination.
//!
//! Each appointment ("case") moves through six stages: payment, triage,
//! lab, X-ray, physician review and release. This crate provides:
//! - `Stage` / `StageStatus` - the per-stage lifecycle and prerequisite map
//! - `QueueRule` - which role sees which case, derived from stage state
//! - `QueueProjector` / `QueueSession` - live per-role queues fed by change events
//! - `TransitionCoordinator` - optimistic, revision-checked stage advances
//! - `NotificationFanout` - broadcast of change events and editing presence
//! - `CaseStore` - the persistence port, with in-memory and Postgres adapters

pub mod artifact;
pub mod config;
pub mod coordinator;
pub mod eligibility;
pub mod error;
pub mod fanout;
pub mod identity;
pub mod memory;
pub mod payload;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod presence;
pub mod projector;
pub mod session;
pub mod stage;
pub mod state;
pub mod store;

pub use artifact::{ArtifactError, ArtifactStore, InMemoryArtifactStore, LocalArtifactStore};
pub use config::CaseflowConfig;
pub use coordinator::{AdvanceRequest, BookingRequest, TransitionCoordinator};
pub use eligibility::{QueueKey, QueueRule};
pub use error::{CoordinatorError, ProjectorError, StoreError};
pub use fanout::{FanoutMessage, FanoutStats, NotificationFanout};
pub use identity::{Caller, Role};
pub use memory::{MemoryCaseStore, SchemaCatalog};
pub use payload::{ResultRecord, StageResult};
pub use presence::{Editor, PresenceBoard, PresenceHint, PresenceState};
pub use projector::{EditingNotice, QueueDelta, QueueEntry, QueueProjector};
pub use session::{QueueSession, SessionOptions, SessionUpdate};
pub use stage::{Stage, StageStatus};
pub use state::{Appointment, AppointmentStatus, CaseSnapshot, StageMark, StageState};
pub use store::{CaseStore, CaseWrite, ChangeEvent, ChangeFeed, Table, WriteReceipt};

#[cfg(feature = "postgres")]
pub use postgres::{PgCaseStore, PgChangeListener};
