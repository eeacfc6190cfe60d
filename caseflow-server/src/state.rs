//! Shared handler state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use caseflow_core::{
    AdvanceRequest, Caller, CaseSnapshot, CoordinatorError, NotificationFanout, QueueDelta,
    SessionOptions, TransitionCoordinator, WriteReceipt,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TransitionCoordinator>,
    pub fanout: Arc<NotificationFanout>,
    pub session: SessionOptions,
    pub streams: Arc<StreamRegistry>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<TransitionCoordinator>,
        fanout: Arc<NotificationFanout>,
        session: SessionOptions,
    ) -> Self {
        Self {
            coordinator,
            fanout,
            session,
            streams: Arc::new(StreamRegistry::default()),
        }
    }
}

/// Work a queue stream runs on its session between updates.
pub enum StreamCommand {
    Open {
        case_id: Uuid,
        reply: oneshot::Sender<Result<CaseSnapshot, CoordinatorError>>,
    },
    Close {
        reply: oneshot::Sender<Vec<QueueDelta>>,
    },
    Advance {
        request: AdvanceRequest,
        reply: oneshot::Sender<Result<WriteReceipt, CoordinatorError>>,
    },
}

#[derive(Clone)]
pub struct StreamHandle {
    pub caller: Caller,
    pub commands: mpsc::Sender<StreamCommand>,
}

/// Live queue streams by id. Entries leave when their stream is dropped.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<Uuid, StreamHandle>>,
}

impl StreamRegistry {
    pub fn register(self: &Arc<Self>, handle: StreamHandle) -> Registration {
        let id = Uuid::new_v4();
        if let Ok(mut streams) = self.streams.lock() {
            streams.insert(id, handle);
        }
        Registration {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<StreamHandle> {
        self.streams.lock().ok()?.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its stream from the registry on drop.
pub struct Registration {
    id: Uuid,
    registry: Arc<StreamRegistry>,
}

impl Registration {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Ok(mut streams) = self.registry.streams.lock() {
            streams.remove(&self.id);
        }
        tracing::debug!(stream_id = %self.id, "queue stream deregistered");
    }
}
