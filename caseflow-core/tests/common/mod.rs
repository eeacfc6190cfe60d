//! Shared harness: in-memory store, coordinator, fan-out relay and helpers
//! that walk a case through its stages.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use caseflow_core::payload::{
    DoctorReport, Fitness, LabResult, PaymentMethod, PaymentRecord, TriageRecord, XrayResult,
};
use caseflow_core::{
    AdvanceRequest, AppointmentStatus, BookingRequest, Caller, CaseSnapshot, CaseStore,
    MemoryCaseStore, NotificationFanout, QueueSession, Role, SessionOptions, SessionUpdate, Stage,
    StageResult, StageStatus, TransitionCoordinator,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::watch;
use uuid::Uuid;

pub struct Clinic {
    pub store: Arc<MemoryCaseStore>,
    pub coordinator: Arc<TransitionCoordinator>,
    pub fanout: Arc<NotificationFanout>,
    pub admin: Caller,
    shutdown: watch::Sender<bool>,
}

impl Clinic {
    pub fn new() -> Self {
        let store = Arc::new(MemoryCaseStore::new());
        let coordinator = Arc::new(TransitionCoordinator::new(store.clone()));
        let fanout = Arc::new(NotificationFanout::new(512));
        let (shutdown, rx) = watch::channel(false);
        fanout.spawn_relay(store.subscribe(), rx);
        Self {
            store,
            coordinator,
            fanout,
            admin: Caller::new(Uuid::new_v4(), Role::Admin),
            shutdown,
        }
    }

    pub async fn session(&self, role: Role) -> QueueSession {
        self.session_for(Caller::new(Uuid::new_v4(), role)).await
    }

    pub async fn session_for(&self, caller: Caller) -> QueueSession {
        QueueSession::connect(
            caller,
            self.coordinator.clone(),
            self.fanout.clone(),
            SessionOptions {
                reorder_limit: 16,
                debounce: Duration::from_millis(10),
            },
        )
        .await
        .expect("session connects")
    }

    /// Booked and approved, ready for the cashier.
    pub async fn approved_case(&self) -> CaseSnapshot {
        let snap = self
            .coordinator
            .book_appointment(BookingRequest {
                patient_id: Uuid::new_v4(),
                case_type: "pre_employment".into(),
                scheduled_date: NaiveDate::from_ymd_opt(2026, 9, 14).unwrap(),
                assigned_physician_id: None,
            })
            .await
            .unwrap();
        self.coordinator
            .set_appointment_status(
                &self.admin,
                snap.case_id(),
                AppointmentStatus::Approved,
                None,
                snap.revision,
            )
            .await
            .unwrap()
            .snapshot
    }

    pub async fn current(&self, case_id: Uuid) -> CaseSnapshot {
        self.store.load_case(case_id).await.unwrap()
    }

    /// Advance as admin from whatever revision the store holds now.
    pub async fn advance(
        &self,
        case_id: Uuid,
        stage: Stage,
        status: StageStatus,
        payload: Option<StageResult>,
    ) -> CaseSnapshot {
        let current = self.current(case_id).await;
        self.coordinator
            .advance_stage(
                &self.admin,
                AdvanceRequest {
                    case_id,
                    stage,
                    status,
                    payload,
                    expected_version: current.revision,
                },
            )
            .await
            .unwrap_or_else(|e| panic!("advance {stage} to {status}: {e}"))
            .snapshot
    }

    pub async fn pay(&self, case_id: Uuid) -> CaseSnapshot {
        self.advance(case_id, Stage::Payment, StageStatus::Completed, Some(payment()))
            .await
    }

    pub async fn triage(&self, case_id: Uuid) -> CaseSnapshot {
        self.advance(case_id, Stage::Triage, StageStatus::Completed, Some(triage()))
            .await
    }

    pub async fn lab(&self, case_id: Uuid) -> CaseSnapshot {
        self.advance(case_id, Stage::Lab, StageStatus::Completed, Some(lab()))
            .await
    }

    pub async fn xray(&self, case_id: Uuid) -> CaseSnapshot {
        let current = self.current(case_id).await;
        self.coordinator
            .record_xray_upload(
                &self.admin,
                case_id,
                format!("memory://xray/{case_id}/chest-pa.png"),
                current.revision,
            )
            .await
            .unwrap();
        self.advance(case_id, Stage::Xray, StageStatus::Completed, Some(reading()))
            .await
    }
}

impl Drop for Clinic {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn payment() -> StageResult {
    StageResult::Payment(PaymentRecord {
        or_number: "OR-20931".into(),
        amount: Decimal::new(185_000, 2),
        method: PaymentMethod::Cash,
        reference: None,
        notes: None,
    })
}

pub fn triage() -> StageResult {
    StageResult::Triage(TriageRecord {
        height_cm: Some(168.0),
        weight_kg: Some(64.5),
        systolic: Some(118.0),
        diastolic: Some(76.0),
        heart_rate: Some(72.0),
        temperature_c: Some(36.6),
        fit_for_exam: Some(true),
        ..Default::default()
    })
}

pub fn lab() -> StageResult {
    StageResult::Lab(LabResult {
        cbc_hemoglobin: Some(14.1),
        cbc_hematocrit: Some(0.42),
        fbs: Some(5.1),
        blood_typing: Some("O+".into()),
        ..Default::default()
    })
}

pub fn reading() -> StageResult {
    StageResult::Xray(XrayResult {
        findings: Some("Both lung fields are clear.".into()),
        impression: Some("Normal chest".into()),
        normal: Some(true),
        ..Default::default()
    })
}

pub fn doctor_report() -> StageResult {
    StageResult::Doctor(DoctorReport {
        evaluation: Some("Physically fit for employment.".into()),
        fitness: Some(Fitness::Fit),
        ..Default::default()
    })
}

/// Pull updates until `done` holds for the session, or fail after 2s.
pub async fn settle_until(
    session: &mut QueueSession,
    mut done: impl FnMut(&QueueSession) -> bool,
) -> Vec<SessionUpdate> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !done(session) {
        let update = tokio::time::timeout_at(deadline, session.next_update())
            .await
            .expect("queue did not converge in time")
            .expect("session update")
            .expect("fan-out open");
        seen.push(update);
    }
    seen
}
