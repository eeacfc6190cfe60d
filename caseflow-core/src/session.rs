//! Queue Session
//!
//! One per connected role client. Owns that client's projector, presence
//! board and editing pin; nothing here is shared between sessions.
//!
//! The receive loop mirrors a task-queue listener: wait on the fan-out,
//! coalesce whatever else arrives inside the debounce window, then apply.
//! Anything that leaves the projection in doubt (lag, a reorder gap, a
//! failed fetch) degrades to a full re-fetch of the role's eligible set.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{AdvanceRequest, TransitionCoordinator};
use crate::eligibility::QueueRule;
use crate::error::{CoordinatorError, ProjectorError};
use crate::fanout::{FanoutMessage, NotificationFanout};
use crate::identity::Caller;
use crate::payload::StageResult;
use crate::presence::{Editor, PresenceBoard, PresenceHint};
use crate::projector::{QueueDelta, QueueEntry, QueueProjector};
use crate::state::CaseSnapshot;
use crate::store::{CaseStore, ChangeEvent, WriteReceipt};

/// Everything one debounced batch changed for this session.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct SessionUpdate {
    pub deltas: Vec<QueueDelta>,
    /// Presence hints from other users
    pub presence: Vec<PresenceHint>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.presence.is_empty()
    }
}

/// Session tuning, usually taken from [`crate::config::CaseflowConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub reorder_limit: usize,
    pub debounce: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reorder_limit: 32,
            debounce: Duration::from_millis(300),
        }
    }
}

impl From<&crate::config::CaseflowConfig> for SessionOptions {
    fn from(config: &crate::config::CaseflowConfig) -> Self {
        Self {
            reorder_limit: config.reorder_limit,
            debounce: config.queue_debounce,
        }
    }
}

pub struct QueueSession {
    caller: Caller,
    projector: QueueProjector,
    coordinator: Arc<TransitionCoordinator>,
    fanout: Arc<NotificationFanout>,
    updates: broadcast::Receiver<FanoutMessage>,
    presence: PresenceBoard,
    debounce: Duration,
    editing: Option<Uuid>,
    batch: Batch,
}

/// Fan-out messages received but not yet applied.
#[derive(Default)]
struct Batch {
    messages: Vec<FanoutMessage>,
    resync: bool,
    closed: bool,
}

impl Batch {
    fn is_pending(&self) -> bool {
        !self.messages.is_empty() || self.resync || self.closed
    }
}

impl QueueSession {
    /// Subscribe to the fan-out and seed the queue from the open-case set.
    ///
    /// Subscribing happens before the seed read so no change can slip
    /// between the two; anything already reflected in the seed replays as a
    /// duplicate.
    pub async fn connect(
        caller: Caller,
        coordinator: Arc<TransitionCoordinator>,
        fanout: Arc<NotificationFanout>,
        options: SessionOptions,
    ) -> Result<Self, CoordinatorError> {
        let rule = QueueRule::for_role(caller.role).ok_or_else(|| {
            CoordinatorError::RoleNotPermitted {
                role: caller.role,
                action: "hold a work queue".into(),
            }
        })?;
        let updates = fanout.subscribe();
        let projector = QueueProjector::new(rule, caller.user_id, options.reorder_limit);

        let mut session = Self {
            caller,
            projector,
            coordinator,
            fanout,
            updates,
            presence: PresenceBoard::new(),
            debounce: options.debounce,
            editing: None,
            batch: Batch::default(),
        };
        session.resync().await?;

        info!(
            user_id = %session.caller.user_id,
            role = %session.caller.role,
            queued = session.projector.len(),
            "queue session connected"
        );
        Ok(session)
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.projector.entries()
    }

    pub fn case_ids(&self) -> Vec<Uuid> {
        self.projector.case_ids()
    }

    /// Case currently open in this session's editing view.
    pub fn editing(&self) -> Option<Uuid> {
        self.editing
    }

    /// Advisory: who else says they have `case_id` open.
    pub fn editors_of(&self, case_id: Uuid) -> Vec<Editor> {
        self.presence.editors_of(case_id)
    }

    /// Wait for the next non-empty batch of changes.
    ///
    /// Returns `Ok(None)` once the fan-out has shut down.
    pub async fn next_update(&mut self) -> Result<Option<SessionUpdate>, CoordinatorError> {
        loop {
            self.wait_for_changes().await;
            match self.apply_pending().await? {
                Some(update) if update.is_empty() => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Receive one debounced batch from the fan-out without applying it.
    ///
    /// Cancel-safe: whatever arrived before the future was dropped stays
    /// buffered for the next call or for [`Self::apply_pending`].
    pub async fn wait_for_changes(&mut self) {
        if self.batch.closed {
            return;
        }
        if !self.batch.is_pending() {
            let first = self.updates.recv().await;
            if self.absorb(first) {
                return;
            }
        }

        let deadline = Instant::now() + self.debounce;
        while let Ok(received) = tokio::time::timeout_at(deadline, self.updates.recv()).await {
            if self.absorb(received) {
                return;
            }
        }
    }

    /// Apply everything buffered by [`Self::wait_for_changes`].
    ///
    /// The update may be empty; `Ok(None)` means the fan-out has shut down.
    pub async fn apply_pending(&mut self) -> Result<Option<SessionUpdate>, CoordinatorError> {
        let Batch {
            messages,
            mut resync,
            closed,
        } = std::mem::take(&mut self.batch);

        let mut update = SessionUpdate::default();
        if !resync {
            for message in messages {
                match message {
                    FanoutMessage::Change(event) => match self.ingest(event).await {
                        Ok(deltas) => update.deltas.extend(deltas),
                        Err(e) => {
                            warn!(
                                user_id = %self.caller.user_id,
                                error = %e,
                                "projection out of step, resyncing"
                            );
                            resync = true;
                            break;
                        }
                    },
                    FanoutMessage::Presence(hint) => {
                        if hint.user_id != self.caller.user_id {
                            self.presence.apply(&hint);
                            update.presence.push(hint);
                        }
                    }
                    FanoutMessage::Resync => {
                        resync = true;
                        break;
                    }
                }
            }
        }

        if resync {
            update.deltas = self.resync().await?;
        } else {
            self.observe_closed_editing(&update.deltas);
        }

        if update.is_empty() && closed {
            return Ok(None);
        }
        Ok(Some(update))
    }

    /// Replace the projection with a fresh read of the open-case set.
    pub async fn resync(&mut self) -> Result<Vec<QueueDelta>, CoordinatorError> {
        let open = self.coordinator.store().list_open_cases().await?;
        let deltas = self.projector.reset(open);
        self.observe_closed_editing(&deltas);
        debug!(
            user_id = %self.caller.user_id,
            role = %self.caller.role,
            queued = self.projector.len(),
            "queue resynced"
        );
        Ok(deltas)
    }

    /// Open a case in the editing view. Its removal from the queue is held
    /// back until the view is closed, unless the work is finished elsewhere.
    pub async fn open_case(&mut self, case_id: Uuid) -> Result<CaseSnapshot, CoordinatorError> {
        let snapshot = self.coordinator.load_case(case_id).await?;
        if snapshot.is_closed() {
            return Err(CoordinatorError::CaseClosed {
                case_id,
                status: snapshot.appointment.status,
            });
        }
        if self.editing.is_some_and(|open| open != case_id) {
            self.close_case();
        }
        self.projector.pin(case_id);
        self.editing = Some(case_id);
        self.fanout.publish(FanoutMessage::Presence(PresenceHint::opened(
            case_id,
            self.caller.user_id,
            self.caller.role,
        )));
        Ok(snapshot)
    }

    /// Close the editing view, applying any held removal.
    pub fn close_case(&mut self) -> Vec<QueueDelta> {
        let Some(case_id) = self.editing.take() else {
            return Vec::new();
        };
        self.announce_closed(case_id);
        self.projector.unpin()
    }

    pub async fn advance(
        &mut self,
        request: AdvanceRequest,
    ) -> Result<(WriteReceipt, Vec<QueueDelta>), CoordinatorError> {
        let case_id = request.case_id;
        match self.coordinator.advance_stage(&self.caller, request).await {
            Ok(receipt) => {
                let deltas = self.after_own_write(case_id, Some(receipt.snapshot.clone()));
                Ok((receipt, deltas))
            }
            Err(e) => {
                if e.should_refresh() {
                    self.refresh_case(case_id).await;
                }
                Err(e)
            }
        }
    }

    pub async fn record_xray_upload(
        &mut self,
        case_id: Uuid,
        artifact_key: String,
        expected_version: u64,
    ) -> Result<(WriteReceipt, Vec<QueueDelta>), CoordinatorError> {
        match self
            .coordinator
            .record_xray_upload(&self.caller, case_id, artifact_key, expected_version)
            .await
        {
            Ok(receipt) => {
                let deltas = self.after_own_write(case_id, Some(receipt.snapshot.clone()));
                Ok((receipt, deltas))
            }
            Err(e) => {
                if e.should_refresh() {
                    self.refresh_case(case_id).await;
                }
                Err(e)
            }
        }
    }

    pub async fn save_draft(
        &mut self,
        case_id: Uuid,
        payload: StageResult,
    ) -> Result<Vec<QueueDelta>, CoordinatorError> {
        match self
            .coordinator
            .save_draft_result(&self.caller, case_id, payload)
            .await
        {
            Ok(()) => Ok(self.after_own_write(case_id, None)),
            Err(e) => {
                if e.should_refresh() {
                    self.refresh_case(case_id).await;
                }
                Err(e)
            }
        }
    }

    /// Returns true once the fan-out is closed.
    fn absorb(&mut self, received: Result<FanoutMessage, RecvError>) -> bool {
        match received {
            Ok(FanoutMessage::Resync) => self.batch.resync = true,
            Ok(message) => self.batch.messages.push(message),
            Err(RecvError::Lagged(missed)) => {
                warn!(
                    user_id = %self.caller.user_id,
                    missed,
                    "queue session lagged, resyncing"
                );
                self.batch.resync = true;
            }
            Err(RecvError::Closed) => {
                self.batch.closed = true;
                return true;
            }
        }
        false
    }

    async fn ingest(&mut self, event: ChangeEvent) -> Result<Vec<QueueDelta>, ProjectorError> {
        if !event.table.affects_eligibility() {
            return Ok(Vec::new());
        }
        if self
            .projector
            .applied_revision(event.case_id)
            .is_some_and(|applied| event.revision <= applied)
        {
            return Ok(Vec::new());
        }
        match event.snapshot {
            Some(snapshot) => {
                debug!(
                    case_id = %event.case_id,
                    table = %event.table,
                    revision = snapshot.revision,
                    "applying change"
                );
                self.projector.apply(snapshot, event.written_by)
            }
            None => {
                // The store copy may already be past this event.
                let snapshot = self.coordinator.store().load_case(event.case_id).await?;
                debug!(
                    case_id = %event.case_id,
                    table = %event.table,
                    event_revision = event.revision,
                    revision = snapshot.revision,
                    "applying fetched copy"
                );
                Ok(self.projector.apply_current(snapshot))
            }
        }
    }

    fn after_own_write(
        &mut self,
        case_id: Uuid,
        snapshot: Option<CaseSnapshot>,
    ) -> Vec<QueueDelta> {
        let mut deltas = Vec::new();
        if self.editing == Some(case_id) {
            deltas.extend(self.close_case());
        }
        if let Some(snapshot) = snapshot {
            match self.projector.apply(snapshot, Some(self.caller.user_id)) {
                Ok(applied) => deltas.extend(applied),
                // The fan-out delivery of the same write will catch up.
                Err(e) => debug!(case_id = %case_id, error = %e, "own write not applied"),
            }
        }
        deltas
    }

    async fn refresh_case(&mut self, case_id: Uuid) {
        let snapshot = match self.coordinator.load_case(case_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(case_id = %case_id, error = %e, "refresh after failed write skipped");
                return;
            }
        };
        let deltas = self.projector.apply_current(snapshot);
        self.observe_closed_editing(&deltas);
    }

    fn observe_closed_editing(&mut self, deltas: &[QueueDelta]) {
        for delta in deltas {
            if let QueueDelta::EditingClosed { case_id, notice } = delta {
                if self.editing == Some(*case_id) {
                    info!(
                        case_id = %case_id,
                        user_id = %self.caller.user_id,
                        ?notice,
                        "editing view closed"
                    );
                    self.editing = None;
                    self.announce_closed(*case_id);
                }
            }
        }
        if self.editing.is_some() && self.projector.pinned().is_none() {
            if let Some(case_id) = self.editing.take() {
                self.announce_closed(case_id);
            }
        }
    }

    fn announce_closed(&self, case_id: Uuid) {
        self.fanout.publish(FanoutMessage::Presence(PresenceHint::closed(
            case_id,
            self.caller.user_id,
            self.caller.role,
        )));
    }
}

impl Drop for QueueSession {
    fn drop(&mut self) {
        if let Some(case_id) = self.editing.take() {
            self.announce_closed(case_id);
        }
    }
}
