//! HTTP surface for the clinic case workflow coordinator.
//!
//! Thin axum layer over [`caseflow_core`]: handlers translate requests into
//! coordinator calls and map [`caseflow_core::CoordinatorError`] onto status
//! codes. Queue streams hold one [`caseflow_core::QueueSession`] per client.

pub mod error;
pub mod handlers;
pub mod identity;
pub mod router;
pub mod state;

pub use error::AppError;
pub use router::build_router;
pub use state::AppState;
