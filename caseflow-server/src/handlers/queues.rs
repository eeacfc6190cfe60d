//! Role work queues.
//!
//! GET  /api/queues/:role                          - current ordered queue
//! GET  /api/queues/:role/stream                   - SSE: one `snapshot` event carrying the
//!                                                   stream id, then `update` events carrying
//!                                                   debounced queue deltas
//! POST /api/queues/:role/stream/:stream/open/:id  - open a case in the stream's editing view
//! POST /api/queues/:role/stream/:stream/close     - close the editing view
//! POST /api/queues/:role/stream/:stream/advance   - advance a stage through the stream's session

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use caseflow_core::{
    AdvanceRequest, Caller, CaseSnapshot, CoordinatorError, QueueDelta, QueueEntry,
    QueueProjector, QueueRule, QueueSession, Role, SessionUpdate,
};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::WriteResponse;
use crate::error::{AppError, ErrorBody};
use crate::identity::Identity;
use crate::state::{AppState, Registration, StreamCommand, StreamHandle};

#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub role: Role,
    /// Id for addressing editing-view commands to this stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<Uuid>,
    pub entries: Vec<QueueEntry>,
}

fn parse_role(raw: &str) -> Result<Role, AppError> {
    raw.parse().map_err(AppError::BadRequest)
}

/// Staff see their own queue; admin may look at any.
fn ensure_may_view(caller: &Caller, role: Role) -> Result<(), AppError> {
    if caller.role == role || caller.role == Role::Admin {
        Ok(())
    } else {
        Err(CoordinatorError::RoleNotPermitted {
            role: caller.role,
            action: format!("view the {role} queue"),
        }
        .into())
    }
}

pub async fn get_queue(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(role): Path<String>,
) -> Result<Json<QueueSnapshot>, AppError> {
    let role = parse_role(&role)?;
    ensure_may_view(&caller, role)?;
    let rule = QueueRule::for_role(role).ok_or_else(|| CoordinatorError::RoleNotPermitted {
        role,
        action: "hold a work queue".into(),
    })?;

    let open = state
        .coordinator
        .store()
        .list_open_cases()
        .await
        .map_err(CoordinatorError::from)?;
    let mut projector = QueueProjector::new(rule, caller.user_id, state.session.reorder_limit);
    projector.reset(open);

    Ok(Json(QueueSnapshot {
        role,
        stream_id: None,
        entries: projector.entries(),
    }))
}

pub async fn stream_queue(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(role): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let role = parse_role(&role)?;
    if caller.role != role {
        return Err(CoordinatorError::RoleNotPermitted {
            role: caller.role,
            action: format!("stream the {role} queue"),
        }
        .into());
    }

    let session = QueueSession::connect(
        caller.clone(),
        state.coordinator.clone(),
        state.fanout.clone(),
        state.session,
    )
    .await?;
    let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
    let registration = state.streams.register(StreamHandle {
        caller,
        commands: commands_tx,
    });
    let initial = json_event(
        "snapshot",
        &QueueSnapshot {
            role,
            stream_id: Some(registration.id()),
            entries: session.entries(),
        },
    );
    tracing::debug!(stream_id = %registration.id(), %role, "queue stream opened");

    let task = StreamTask {
        session,
        commands,
        _registration: registration,
    };
    let updates = stream::unfold(Some(task), |task| async move {
        let mut task = task?;
        match task.next_step().await {
            Step::Update(update) => Some((json_event("update", &update), Some(task))),
            Step::Ended => None,
            Step::Failed(err) => {
                tracing::warn!(error = %err, "queue stream ended");
                let body = ErrorBody {
                    error: err.to_string(),
                    kind: err.kind(),
                    refresh: true,
                };
                Some((json_event("error", &body), None))
            }
        }
    });

    let events = stream::once(futures::future::ready(initial))
        .chain(updates)
        .map(Ok);

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

const COMMAND_CAPACITY: usize = 8;

/// A queue session plus the commands addressed to it over HTTP.
struct StreamTask {
    session: QueueSession,
    commands: mpsc::Receiver<StreamCommand>,
    _registration: Registration,
}

enum Step {
    Update(SessionUpdate),
    Ended,
    Failed(CoordinatorError),
}

impl StreamTask {
    async fn next_step(&mut self) -> Step {
        loop {
            tokio::select! {
                Some(command) = self.commands.recv() => {
                    if let Some(update) = self.run(command).await {
                        return Step::Update(update);
                    }
                }
                _ = self.session.wait_for_changes() => {
                    match self.session.apply_pending().await {
                        Ok(Some(update)) if update.is_empty() => {}
                        Ok(Some(update)) => return Step::Update(update),
                        Ok(None) => return Step::Ended,
                        Err(err) => return Step::Failed(err),
                    }
                }
            }
        }
    }

    /// Queue deltas caused by the command are also pushed down the stream.
    async fn run(&mut self, command: StreamCommand) -> Option<SessionUpdate> {
        let deltas = match command {
            StreamCommand::Open { case_id, reply } => {
                let opened = self.session.open_case(case_id).await;
                reply.send(opened).ok();
                Vec::new()
            }
            StreamCommand::Close { reply } => {
                let deltas = self.session.close_case();
                reply.send(deltas.clone()).ok();
                deltas
            }
            StreamCommand::Advance { request, reply } => {
                match self.session.advance(request).await {
                    Ok((receipt, deltas)) => {
                        reply.send(Ok(receipt)).ok();
                        deltas
                    }
                    Err(err) => {
                        reply.send(Err(err)).ok();
                        Vec::new()
                    }
                }
            }
        };
        (!deltas.is_empty()).then(|| SessionUpdate {
            deltas,
            presence: Vec::new(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct CloseResponse {
    pub deltas: Vec<QueueDelta>,
}

/// Look up a live stream owned by the caller.
fn owned_stream(
    state: &AppState,
    caller: &Caller,
    role: &str,
    stream_id: Uuid,
) -> Result<StreamHandle, AppError> {
    let role = parse_role(role)?;
    let handle = state
        .streams
        .get(stream_id)
        .ok_or_else(|| AppError::NotFound(format!("no live queue stream {stream_id}")))?;
    if handle.caller.user_id != caller.user_id || handle.caller.role != role {
        return Err(CoordinatorError::RoleNotPermitted {
            role: caller.role,
            action: format!("drive queue stream {stream_id}"),
        }
        .into());
    }
    Ok(handle)
}

async fn dispatch<T>(
    handle: &StreamHandle,
    command: impl FnOnce(oneshot::Sender<T>) -> StreamCommand,
) -> Result<T, AppError> {
    let (reply, response) = oneshot::channel();
    let ended = || AppError::NotFound("queue stream has ended".into());
    handle
        .commands
        .send(command(reply))
        .await
        .map_err(|_| ended())?;
    response.await.map_err(|_| ended())
}

pub async fn open_case(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path((role, stream_id, case_id)): Path<(String, Uuid, Uuid)>,
) -> Result<Json<CaseSnapshot>, AppError> {
    let handle = owned_stream(&state, &caller, &role, stream_id)?;
    let snapshot = dispatch(&handle, |reply| StreamCommand::Open { case_id, reply }).await??;
    Ok(Json(snapshot))
}

pub async fn close_case(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path((role, stream_id)): Path<(String, Uuid)>,
) -> Result<Json<CloseResponse>, AppError> {
    let handle = owned_stream(&state, &caller, &role, stream_id)?;
    let deltas = dispatch(&handle, |reply| StreamCommand::Close { reply }).await?;
    Ok(Json(CloseResponse { deltas }))
}

pub async fn advance(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path((role, stream_id)): Path<(String, Uuid)>,
    Json(request): Json<AdvanceRequest>,
) -> Result<Json<WriteResponse>, AppError> {
    let handle = owned_stream(&state, &caller, &role, stream_id)?;
    let receipt =
        dispatch(&handle, |reply| StreamCommand::Advance { request, reply }).await??;
    Ok(Json(receipt.into()))
}

fn json_event<T: Serialize>(name: &str, value: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(value)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}
