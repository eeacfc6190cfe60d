//! Queue Projector
//!
//! Pure, synchronous projection of one role's queue. Fed one case
//! after-image at a time; re-evaluates only that case and reports the
//! resulting deltas. Duplicate deliveries are no-ops and out-of-order
//! deliveries for a case are held in a per-case reorder buffer until the
//! missing revision arrives.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

use crate::eligibility::{QueueKey, QueueRule};
use crate::error::ProjectorError;
use crate::state::CaseSnapshot;

/// Reason an operator's editing view was closed under them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditingNotice {
    /// Another operator finished this stage first
    CaseAlreadyProcessed,
    /// The appointment was rejected or cancelled
    CaseClosed,
}

/// Change to a projected queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueDelta {
    Inserted { case_id: Uuid, position: usize },
    Removed { case_id: Uuid },
    Reordered { case_id: Uuid, position: usize },
    EditingClosed { case_id: Uuid, notice: EditingNotice },
    /// Whole queue replaced after a resync
    Reset { size: usize },
}

/// One visible queue row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub key: QueueKey,
    pub snapshot: CaseSnapshot,
}

#[derive(Debug, Clone)]
struct Pin {
    case_id: Uuid,
    /// Latest after-image seen while a removal was being held back
    held: Option<CaseSnapshot>,
}

pub struct QueueProjector {
    rule: QueueRule,
    viewer: Uuid,
    order: BTreeSet<QueueKey>,
    entries: HashMap<Uuid, QueueEntry>,
    applied: HashMap<Uuid, u64>,
    buffered: HashMap<Uuid, BTreeMap<u64, (CaseSnapshot, Option<Uuid>)>>,
    reorder_limit: usize,
    pin: Option<Pin>,
}

impl QueueProjector {
    pub fn new(rule: QueueRule, viewer: Uuid, reorder_limit: usize) -> Self {
        Self {
            rule,
            viewer,
            order: BTreeSet::new(),
            entries: HashMap::new(),
            applied: HashMap::new(),
            buffered: HashMap::new(),
            reorder_limit,
            pin: None,
        }
    }

    pub fn rule(&self) -> &QueueRule {
        &self.rule
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, case_id: Uuid) -> bool {
        self.entries.contains_key(&case_id)
    }

    /// Case ids in queue order.
    pub fn case_ids(&self) -> Vec<Uuid> {
        self.order.iter().map(|k| k.case_id).collect()
    }

    /// Queue rows in order.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(&k.case_id).cloned())
            .collect()
    }

    pub fn position(&self, case_id: Uuid) -> Option<usize> {
        let key = self.entries.get(&case_id)?.key;
        Some(self.order.range(..key).count())
    }

    pub fn applied_revision(&self, case_id: Uuid) -> Option<u64> {
        self.applied.get(&case_id).copied()
    }

    pub fn pinned(&self) -> Option<Uuid> {
        self.pin.as_ref().map(|p| p.case_id)
    }

    /// Pin a case open in the editing view. Removals are held back until
    /// [`QueueProjector::unpin`] unless the work was finished elsewhere.
    pub fn pin(&mut self, case_id: Uuid) {
        self.pin = Some(Pin {
            case_id,
            held: None,
        });
    }

    /// Release the pin and apply any removal that was held back.
    pub fn unpin(&mut self) -> Vec<QueueDelta> {
        let Some(pin) = self.pin.take() else {
            return Vec::new();
        };
        match pin.held {
            Some(snapshot) => self.place(snapshot),
            None => Vec::new(),
        }
    }

    /// Feed one after-image. `written_by` identifies who caused it, if known.
    pub fn apply(
        &mut self,
        snapshot: CaseSnapshot,
        written_by: Option<Uuid>,
    ) -> Result<Vec<QueueDelta>, ProjectorError> {
        let case_id = snapshot.case_id();
        let revision = snapshot.revision;

        let applied = match self.applied.get(&case_id) {
            Some(applied) if revision <= *applied => {
                debug!(%case_id, revision, "duplicate delivery ignored");
                return Ok(Vec::new());
            }
            Some(applied) if revision > applied + 1 => {
                let applied = *applied;
                let buffer = self.buffered.entry(case_id).or_default();
                buffer.insert(revision, (snapshot, written_by));
                if buffer.len() > self.reorder_limit {
                    let buffered = buffer.len();
                    self.buffered.remove(&case_id);
                    return Err(ProjectorError::Gap {
                        case_id,
                        applied,
                        buffered,
                    });
                }
                debug!(%case_id, revision, applied, "buffered out-of-order delivery");
                return Ok(Vec::new());
            }
            _ => revision,
        };

        let mut deltas = self.apply_one(snapshot, written_by);
        deltas.extend(self.drain_buffered(case_id, applied + 1));
        Ok(deltas)
    }

    /// Feed a copy read straight from the store.
    ///
    /// The copy is the newest state, so it may skip revisions: it is applied
    /// at once and any buffered deliveries it covers are discarded. Its
    /// writer is unknown.
    pub fn apply_current(&mut self, snapshot: CaseSnapshot) -> Vec<QueueDelta> {
        let case_id = snapshot.case_id();
        let revision = snapshot.revision;
        if self.applied.get(&case_id).is_some_and(|applied| revision <= *applied) {
            debug!(%case_id, revision, "fetched copy already applied");
            return Vec::new();
        }

        if let Some(buffer) = self.buffered.get_mut(&case_id) {
            buffer.retain(|buffered, _| *buffered > revision);
        }
        let mut deltas = self.apply_one(snapshot, None);
        deltas.extend(self.drain_buffered(case_id, revision + 1));
        deltas
    }

    /// Replace the projection with a freshly fetched open-case set.
    pub fn reset(&mut self, snapshots: Vec<CaseSnapshot>) -> Vec<QueueDelta> {
        let previous_pin = self.pin.as_ref().map(|p| {
            let prior = self.entries.get(&p.case_id).map(|e| e.snapshot.clone());
            (p.case_id, prior)
        });

        self.order.clear();
        self.entries.clear();
        self.applied.clear();
        self.buffered.clear();

        let mut pinned_fresh = None;
        for snapshot in snapshots {
            let case_id = snapshot.case_id();
            self.applied.insert(case_id, snapshot.revision);
            if previous_pin.as_ref().is_some_and(|(id, _)| *id == case_id) {
                pinned_fresh = Some(snapshot.clone());
            }
            if let Some(key) = self.rule.evaluate(&snapshot, self.viewer) {
                self.order.insert(key);
                self.entries.insert(case_id, QueueEntry { key, snapshot });
            }
        }

        let mut deltas = vec![QueueDelta::Reset {
            size: self.order.len(),
        }];

        if let Some((case_id, prior)) = previous_pin {
            match pinned_fresh {
                // Open-case listing omits terminal cases.
                None => {
                    self.pin = None;
                    deltas.push(QueueDelta::EditingClosed {
                        case_id,
                        notice: EditingNotice::CaseClosed,
                    });
                }
                Some(fresh) if !self.contains(case_id) => {
                    if self.work_finished(&fresh) {
                        self.pin = None;
                        deltas.push(QueueDelta::EditingClosed {
                            case_id,
                            notice: EditingNotice::CaseAlreadyProcessed,
                        });
                    } else {
                        // Keep showing the pinned case until it is closed.
                        if let Some(prior) = prior {
                            let key = QueueKey::of(&prior);
                            self.order.insert(key);
                            self.entries.insert(case_id, QueueEntry { key, snapshot: prior });
                        }
                        if let Some(pin) = self.pin.as_mut() {
                            pin.held = Some(fresh);
                        }
                    }
                }
                Some(_) => {}
            }
        }
        deltas
    }

    /// Apply buffered deliveries that now follow on, starting at `next`.
    fn drain_buffered(&mut self, case_id: Uuid, mut next: u64) -> Vec<QueueDelta> {
        let mut deltas = Vec::new();
        while let Some((snapshot, by)) = self
            .buffered
            .get_mut(&case_id)
            .and_then(|b| b.remove(&next))
        {
            deltas.extend(self.apply_one(snapshot, by));
            next += 1;
        }
        if self.buffered.get(&case_id).is_some_and(BTreeMap::is_empty) {
            self.buffered.remove(&case_id);
        }
        deltas
    }

    fn apply_one(&mut self, snapshot: CaseSnapshot, written_by: Option<Uuid>) -> Vec<QueueDelta> {
        let case_id = snapshot.case_id();
        self.applied.insert(case_id, snapshot.revision);

        let is_pinned = self.pin.as_ref().is_some_and(|p| p.case_id == case_id);
        if is_pinned && self.rule.evaluate(&snapshot, self.viewer).is_none() {
            let by_self = written_by == Some(self.viewer);
            let notice = if snapshot.is_closed() {
                Some(EditingNotice::CaseClosed)
            } else if self.work_finished(&snapshot) {
                Some(EditingNotice::CaseAlreadyProcessed)
            } else {
                None
            };

            match notice {
                Some(notice) => {
                    self.pin = None;
                    let mut deltas = Vec::new();
                    if !by_self {
                        deltas.push(QueueDelta::EditingClosed { case_id, notice });
                    }
                    deltas.extend(self.place(snapshot));
                    return deltas;
                }
                None => {
                    debug!(%case_id, revision = snapshot.revision, "removal held for pinned case");
                    if let Some(pin) = self.pin.as_mut() {
                        pin.held = Some(snapshot);
                    }
                    return Vec::new();
                }
            }
        }

        if is_pinned {
            if let Some(pin) = self.pin.as_mut() {
                pin.held = None;
            }
        }
        self.place(snapshot)
    }

    /// Insert, move, refresh or remove the case according to its rule outcome.
    fn place(&mut self, snapshot: CaseSnapshot) -> Vec<QueueDelta> {
        let case_id = snapshot.case_id();
        let new_key = self.rule.evaluate(&snapshot, self.viewer);
        let old_key = self.entries.get(&case_id).map(|e| e.key);

        match (old_key, new_key) {
            (None, None) => Vec::new(),
            (Some(old), None) => {
                self.order.remove(&old);
                self.entries.remove(&case_id);
                vec![QueueDelta::Removed { case_id }]
            }
            (None, Some(key)) => {
                self.order.insert(key);
                self.entries.insert(case_id, QueueEntry { key, snapshot });
                let position = self.order.range(..key).count();
                vec![QueueDelta::Inserted { case_id, position }]
            }
            (Some(old), Some(key)) if old != key => {
                self.order.remove(&old);
                self.order.insert(key);
                self.entries.insert(case_id, QueueEntry { key, snapshot });
                let position = self.order.range(..key).count();
                vec![QueueDelta::Reordered { case_id, position }]
            }
            (Some(_), Some(key)) => {
                self.entries.insert(case_id, QueueEntry { key, snapshot });
                Vec::new()
            }
        }
    }

    fn work_finished(&self, snapshot: &CaseSnapshot) -> bool {
        let status = snapshot.status(self.rule.stage);
        self.rule.is_finished_by(self.rule.stage, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use crate::stage::{Stage, StageStatus};
    use crate::state::{Appointment, AppointmentStatus, StageState};
    use chrono::{Duration, NaiveDate, Utc};

    fn lab_ready(revision: u64) -> CaseSnapshot {
        let mut appointment = Appointment::new(
            Uuid::new_v4(),
            "pre_employment",
            NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
            None,
        );
        appointment.status = AppointmentStatus::InProgress;
        let mut stages = StageState::activated(appointment.id, Utc::now());
        stages.set_status(Stage::Payment, StageStatus::Completed);
        stages.set_status(Stage::Triage, StageStatus::Completed);
        CaseSnapshot {
            appointment,
            stages: Some(stages),
            revision,
        }
    }

    fn next(snapshot: &CaseSnapshot, f: impl FnOnce(&mut CaseSnapshot)) -> CaseSnapshot {
        let mut s = snapshot.clone();
        s.revision += 1;
        if let Some(st) = s.stages.as_mut() {
            st.updated_at = st.updated_at + Duration::milliseconds(10);
        }
        f(&mut s);
        s
    }

    fn complete_lab(s: &mut CaseSnapshot) {
        if let Some(st) = s.stages.as_mut() {
            st.set_status(Stage::Lab, StageStatus::Completed);
        }
    }

    fn projector() -> QueueProjector {
        QueueProjector::new(QueueRule::for_role(Role::Lab).unwrap(), Uuid::new_v4(), 4)
    }

    #[test]
    fn test_insert_then_remove() {
        let mut p = projector();
        let c = lab_ready(3);
        let id = c.case_id();

        let d = p.apply(c.clone(), None).unwrap();
        assert_eq!(d, vec![QueueDelta::Inserted { case_id: id, position: 0 }]);

        let done = next(&c, complete_lab);
        let d = p.apply(done, None).unwrap();
        assert_eq!(d, vec![QueueDelta::Removed { case_id: id }]);
        assert!(p.is_empty());
    }

    #[test]
    fn test_duplicate_delivery_is_noop() {
        let mut p = projector();
        let c = lab_ready(3);
        p.apply(c.clone(), None).unwrap();
        let before = p.case_ids();

        assert!(p.apply(c.clone(), None).unwrap().is_empty());
        assert_eq!(p.case_ids(), before);
    }

    #[test]
    fn test_out_of_order_applied_in_revision_order() {
        let mut p = projector();
        let r3 = lab_ready(3);
        let id = r3.case_id();
        p.apply(r3.clone(), None).unwrap();

        let r4 = next(&r3, |_| {});
        let r5 = next(&r4, complete_lab);

        // r5 arrives first and is held.
        assert!(p.apply(r5, None).unwrap().is_empty());
        assert!(p.contains(id));

        let d = p.apply(r4, None).unwrap();
        assert_eq!(
            d,
            vec![
                QueueDelta::Reordered { case_id: id, position: 0 },
                QueueDelta::Removed { case_id: id },
            ]
        );
        assert_eq!(p.applied_revision(id), Some(5));
    }

    #[test]
    fn test_fetched_copy_skips_missing_revisions() {
        let mut p = projector();
        let r3 = lab_ready(3);
        let id = r3.case_id();
        p.apply(r3.clone(), None).unwrap();

        let r4 = next(&r3, complete_lab);
        let r5 = next(&r4, |_| {});
        let r6 = next(&r5, |_| {});
        // A delivered r6 waits on r4 and r5.
        assert!(p.apply(r6.clone(), None).unwrap().is_empty());

        // The store copy at r5 jumps over r4 and lets r6 through.
        let d = p.apply_current(r5);
        assert_eq!(d, vec![QueueDelta::Removed { case_id: id }]);
        assert_eq!(p.applied_revision(id), Some(6));
        assert!(!p.contains(id));

        // Stale copies are ignored.
        assert!(p.apply_current(r4).is_empty());
        assert_eq!(p.applied_revision(id), Some(6));
    }

    #[test]
    fn test_gap_past_reorder_limit() {
        let mut p = projector();
        let c = lab_ready(1);
        p.apply(c.clone(), None).unwrap();

        let mut err = None;
        for rev in 3..=8 {
            let mut s = c.clone();
            s.revision = rev;
            if let Err(e) = p.apply(s, None) {
                err = Some(e);
                break;
            }
        }
        assert!(matches!(err, Some(ProjectorError::Gap { applied: 1, .. })));
    }

    #[test]
    fn test_pinned_case_closed_when_processed_elsewhere() {
        let mut p = projector();
        let c = lab_ready(3);
        let id = c.case_id();
        p.apply(c.clone(), None).unwrap();
        p.pin(id);

        let done = next(&c, complete_lab);
        let d = p.apply(done, Some(Uuid::new_v4())).unwrap();
        assert_eq!(
            d,
            vec![
                QueueDelta::EditingClosed {
                    case_id: id,
                    notice: EditingNotice::CaseAlreadyProcessed
                },
                QueueDelta::Removed { case_id: id },
            ]
        );
        assert_eq!(p.pinned(), None);
    }

    #[test]
    fn test_pinned_case_cancelled() {
        let mut p = projector();
        let c = lab_ready(3);
        let id = c.case_id();
        p.apply(c.clone(), None).unwrap();
        p.pin(id);

        let cancelled = next(&c, |s| s.appointment.status = AppointmentStatus::Cancelled);
        let d = p.apply(cancelled, None).unwrap();
        assert!(d.contains(&QueueDelta::EditingClosed {
            case_id: id,
            notice: EditingNotice::CaseClosed
        }));
    }

    #[test]
    fn test_other_removals_held_while_pinned() {
        let viewer = Uuid::new_v4();
        let mut p = QueueProjector::new(QueueRule::for_role(Role::Physician).unwrap(), viewer, 4);
        let mut c = lab_ready(5);
        if let Some(st) = c.stages.as_mut() {
            st.set_status(Stage::Lab, StageStatus::Completed);
            st.set_status(Stage::Xray, StageStatus::Completed);
        }
        let id = c.case_id();
        p.apply(c.clone(), None).unwrap();
        p.pin(id);

        // Reassigned to a different physician: removal is held, not announced.
        let reassigned = next(&c, |s| {
            if let Some(st) = s.stages.as_mut() {
                st.assigned_doctor_id = Some(Uuid::new_v4());
            }
        });
        assert!(p.apply(reassigned, None).unwrap().is_empty());
        assert!(p.contains(id));

        assert_eq!(p.unpin(), vec![QueueDelta::Removed { case_id: id }]);
        assert!(!p.contains(id));
    }

    #[test]
    fn test_reset_drops_closed_pinned_case() {
        let mut p = projector();
        let c = lab_ready(3);
        let id = c.case_id();
        p.apply(c, None).unwrap();
        p.pin(id);

        let d = p.reset(Vec::new());
        assert_eq!(
            d,
            vec![
                QueueDelta::Reset { size: 0 },
                QueueDelta::EditingClosed {
                    case_id: id,
                    notice: EditingNotice::CaseClosed
                },
            ]
        );
    }
}
