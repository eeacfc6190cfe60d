//! Advisory editing presence ("being edited by ...").
//!
//! Hints only. Nothing here blocks or orders writes; the revision check in
//! the store stays the sole arbiter between operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::identity::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Opened,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceHint {
    pub case_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub state: PresenceState,
    pub at: DateTime<Utc>,
}

impl PresenceHint {
    pub fn opened(case_id: Uuid, user_id: Uuid, role: Role) -> Self {
        Self {
            case_id,
            user_id,
            role,
            state: PresenceState::Opened,
            at: Utc::now(),
        }
    }

    pub fn closed(case_id: Uuid, user_id: Uuid, role: Role) -> Self {
        Self {
            state: PresenceState::Closed,
            ..Self::opened(case_id, user_id, role)
        }
    }
}

/// Someone else currently has a case open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Editor {
    pub user_id: Uuid,
    pub role: Role,
    pub since: DateTime<Utc>,
}

/// Per-session view of who has which case open.
#[derive(Debug, Default)]
pub struct PresenceBoard {
    editors: HashMap<Uuid, HashMap<Uuid, Editor>>,
}

impl PresenceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, hint: &PresenceHint) {
        match hint.state {
            PresenceState::Opened => {
                // A user edits one case at a time.
                self.forget_user(hint.user_id);
                self.editors.entry(hint.case_id).or_default().insert(
                    hint.user_id,
                    Editor {
                        user_id: hint.user_id,
                        role: hint.role,
                        since: hint.at,
                    },
                );
            }
            PresenceState::Closed => {
                if let Some(users) = self.editors.get_mut(&hint.case_id) {
                    users.remove(&hint.user_id);
                    if users.is_empty() {
                        self.editors.remove(&hint.case_id);
                    }
                }
            }
        }
    }

    /// Current editors of `case_id`, oldest first.
    pub fn editors_of(&self, case_id: Uuid) -> Vec<Editor> {
        let mut editors: Vec<Editor> = self
            .editors
            .get(&case_id)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default();
        editors.sort_by_key(|e| (e.since, e.user_id));
        editors
    }

    /// Drop every hint for a case, e.g. once it leaves all queues.
    pub fn clear_case(&mut self, case_id: Uuid) {
        self.editors.remove(&case_id);
    }

    fn forget_user(&mut self, user_id: Uuid) {
        self.editors.retain(|_, users| {
            users.remove(&user_id);
            !users.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_close() {
        let mut board = PresenceBoard::new();
        let case_id = Uuid::new_v4();
        let a = Uuid::new_v4();

        board.apply(&PresenceHint::opened(case_id, a, Role::Physician));
        assert_eq!(board.editors_of(case_id).len(), 1);

        board.apply(&PresenceHint::closed(case_id, a, Role::Physician));
        assert!(board.editors_of(case_id).is_empty());
    }

    #[test]
    fn test_opening_another_case_moves_the_user() {
        let mut board = PresenceBoard::new();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        let a = Uuid::new_v4();

        board.apply(&PresenceHint::opened(c1, a, Role::Lab));
        board.apply(&PresenceHint::opened(c2, a, Role::Lab));
        assert!(board.editors_of(c1).is_empty());
        assert_eq!(board.editors_of(c2)[0].user_id, a);
    }
}
