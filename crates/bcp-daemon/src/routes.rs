//! Axum router and all HTTP handlers for bcp-daemon.
//!
//! Everything routes through `build_router`; middleware is the binary's
//! concern. Handlers stay `pub(crate)` so the scenario suite can drive
//! the bare router in-process.
//!
//! Every handler resolves the actor first (401), authorizes the
//! (actor, org, permission) triple, then calls the core. Error →
//! status mapping lives in `api_types::ApiError`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use bcp_authz::{authorize, ActorContext, Permission};
use bcp_core::{validate_limit, CancelOutcome, CompleteOutcome, LimitResolver, NewQueueEntry};
use bcp_schemas::{ConcurrencyView, QueueEvent, QueueSummary};

use crate::api_types::{
    ApiError, HealthResponse, MessageResponse, QueueListResponse, RunScheduleRequest,
    RunScheduleResponse, UpdateConcurrencyRequest,
};
use crate::auth::Authenticated;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Wire every endpoint to the shared state. Deliberately free of
/// middleware: the binary layers CORS and tracing on top, and the tests
/// skip both.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/backup-queue", get(list_queue))
        .route("/api/v1/backup-queue/summary", get(queue_summary))
        .route("/api/v1/backup-queue/:id", delete(cancel_entry))
        .route(
            "/api/v1/organizations/:id/concurrency",
            get(get_org_concurrency).put(put_org_concurrency),
        )
        .route(
            "/api/v1/agents/:id/concurrency",
            get(get_agent_concurrency).put(put_agent_concurrency),
        )
        .route("/api/v1/schedules/:id/run", post(run_schedule))
        .route("/api/v1/backup-runs/:id/complete", post(complete_run))
        .route("/api/v1/events", get(events))
        .with_state(state)
}

/// Per-request token. Committed admissions are never undone by an
/// abandoned request; this token only guards not-yet-committed work.
fn request_token() -> CancellationToken {
    CancellationToken::new()
}

// ---------------------------------------------------------------------------
// GET /api/v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /api/v1/backup-queue
// ---------------------------------------------------------------------------

pub(crate) async fn list_queue(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
) -> Result<Json<QueueListResponse>, ApiError> {
    authorize(&actor, actor.org_id, Permission::QueueRead)?;

    let cancel = request_token();
    let queue = st
        .store
        .list_queued_with_details(&cancel, actor.org_id)
        .await?;
    Ok(Json(QueueListResponse { queue }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/backup-queue/summary
// ---------------------------------------------------------------------------

pub(crate) async fn queue_summary(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
) -> Result<Json<QueueSummary>, ApiError> {
    authorize(&actor, actor.org_id, Permission::QueueRead)?;

    let cancel = request_token();
    let summary = st.store.summary(&cancel, actor.org_id).await?;
    Ok(Json(summary))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/backup-queue/:id
// ---------------------------------------------------------------------------

/// Idempotent cancel. Both outcomes are 200: the entry is gone either
/// way, and whether it was ever there is not revealed across orgs.
pub(crate) async fn cancel_entry(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, ApiError> {
    authorize(&actor, actor.org_id, Permission::QueueCancel)?;

    let cancel = request_token();
    let outcome = st
        .store
        .cancel_by_id(&cancel, actor.org_id, entry_id)
        .await?;

    let message = match outcome {
        CancelOutcome::Canceled => {
            info!(org_id = %actor.org_id, %entry_id, "queue entry canceled");
            st.publish(QueueEvent::Canceled {
                org_id: actor.org_id,
                entry_id,
            });
            "queue entry canceled".to_string()
        }
        CancelOutcome::NoOp => "queue entry already gone; nothing to cancel".to_string(),
    };

    Ok(Json(MessageResponse { message }))
}

// ---------------------------------------------------------------------------
// GET/PUT /api/v1/organizations/:id/concurrency
// ---------------------------------------------------------------------------

pub(crate) async fn get_org_concurrency(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
    Path(org_id): Path<Uuid>,
) -> Result<Json<ConcurrencyView>, ApiError> {
    authorize(&actor, org_id, Permission::LimitRead)?;

    let cancel = request_token();
    let resolver = LimitResolver::new(st.store.as_ref());
    let effective = resolver.effective_org(&cancel, org_id).await?;
    Ok(Json(ConcurrencyView {
        max_concurrent_backups: effective.limit,
        running_count: effective.running,
        queued_count: effective.queued,
    }))
}

pub(crate) async fn put_org_concurrency(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
    Path(org_id): Path<Uuid>,
    Json(body): Json<UpdateConcurrencyRequest>,
) -> Result<Json<ConcurrencyView>, ApiError> {
    authorize(&actor, org_id, Permission::LimitWrite)?;
    validate_limit(body.max_concurrent_backups)?;

    let cancel = request_token();
    st.store
        .set_org_limit(&cancel, org_id, body.max_concurrent_backups)
        .await?;

    info!(%org_id, limit = ?body.max_concurrent_backups, "org concurrency updated");
    st.publish(QueueEvent::LimitChanged {
        org_id,
        agent_id: None,
    });
    st.scheduler.notify_limit_changed(org_id);

    let resolver = LimitResolver::new(st.store.as_ref());
    let effective = resolver.effective_org(&cancel, org_id).await?;
    Ok(Json(ConcurrencyView {
        max_concurrent_backups: effective.limit,
        running_count: effective.running,
        queued_count: effective.queued,
    }))
}

// ---------------------------------------------------------------------------
// GET/PUT /api/v1/agents/:id/concurrency
// ---------------------------------------------------------------------------

pub(crate) async fn get_agent_concurrency(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<ConcurrencyView>, ApiError> {
    let cancel = request_token();
    let org_id = st.store.agent_org(&cancel, agent_id).await?;
    authorize(&actor, org_id, Permission::LimitRead)?;

    let resolver = LimitResolver::new(st.store.as_ref());
    let effective = resolver.effective_agent(&cancel, agent_id).await?;
    Ok(Json(ConcurrencyView {
        max_concurrent_backups: effective.limit,
        running_count: effective.running,
        queued_count: effective.queued,
    }))
}

pub(crate) async fn put_agent_concurrency(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
    Path(agent_id): Path<Uuid>,
    Json(body): Json<UpdateConcurrencyRequest>,
) -> Result<Json<ConcurrencyView>, ApiError> {
    let cancel = request_token();
    let org_id = st.store.agent_org(&cancel, agent_id).await?;
    authorize(&actor, org_id, Permission::LimitWrite)?;
    validate_limit(body.max_concurrent_backups)?;

    st.store
        .set_agent_limit(&cancel, agent_id, body.max_concurrent_backups)
        .await?;

    info!(%agent_id, limit = ?body.max_concurrent_backups, "agent concurrency updated");
    st.publish(QueueEvent::LimitChanged {
        org_id,
        agent_id: Some(agent_id),
    });
    st.scheduler.notify_limit_changed(org_id);

    let resolver = LimitResolver::new(st.store.as_ref());
    let effective = resolver.effective_agent(&cancel, agent_id).await?;
    Ok(Json(ConcurrencyView {
        max_concurrent_backups: effective.limit,
        running_count: effective.running,
        queued_count: effective.queued,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/schedules/:id/run
// ---------------------------------------------------------------------------

/// Manual "run now": enqueue one entry for the schedule and wake the
/// scheduler. A caller-supplied `entry_id` makes retries idempotent; a
/// duplicate answers 409 instead of double-queueing.
pub(crate) async fn run_schedule(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
    Path(schedule_id): Path<Uuid>,
    body: Option<Json<RunScheduleRequest>>,
) -> Result<Json<RunScheduleResponse>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let cancel = request_token();
    let org_id = st.store.schedule_org(&cancel, schedule_id).await?;
    authorize(&actor, org_id, Permission::RunTrigger)?;

    if let Some(priority) = body.priority {
        if priority < 0 {
            return Err(
                bcp_core::CoreError::invalid(format!("priority must be >= 0, got {priority}"))
                    .into(),
            );
        }
    }

    let entry_id = body.entry_id.unwrap_or_else(Uuid::new_v4);
    let job = st
        .store
        .enqueue(
            &cancel,
            NewQueueEntry {
                entry_id,
                schedule_id,
                priority_override: body.priority,
            },
        )
        .await?;

    info!(%org_id, %schedule_id, %entry_id, "manual run queued");
    st.publish(QueueEvent::Enqueued {
        org_id,
        entry_id,
        agent_id: job.agent_id,
    });
    st.scheduler.notify_enqueued(org_id);

    Ok(Json(RunScheduleResponse {
        entry_id: job.entry_id,
        priority: job.priority,
        queued_at: job.queued_at,
    }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/backup-runs/:id/complete
// ---------------------------------------------------------------------------

/// Terminal-status report from the transport edge. Idempotent: a repeat
/// (or unknown) running id answers 200 with a no-op message.
pub(crate) async fn complete_run(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
    Path(running_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, ApiError> {
    let cancel = request_token();

    let Some(org_id) = st.store.running_org(&cancel, running_id).await? else {
        // Already gone: still needs *some* permission so unauthenticated
        // probing cannot enumerate ledger ids.
        authorize(&actor, actor.org_id, Permission::RunComplete)?;
        return Ok(Json(MessageResponse {
            message: "backup run already completed; nothing to do".to_string(),
        }));
    };

    authorize(&actor, org_id, Permission::RunComplete)?;

    let outcome = st.store.complete(&cancel, running_id).await?;
    let message = match outcome {
        CompleteOutcome::Completed => {
            info!(%org_id, %running_id, "backup run completed");
            st.publish(QueueEvent::Completed { org_id, running_id });
            st.scheduler.notify_completed(org_id);
            "backup run completed".to_string()
        }
        CompleteOutcome::NoOp => "backup run already completed; nothing to do".to_string(),
    };

    Ok(Json(MessageResponse { message }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/events  (SSE)
// ---------------------------------------------------------------------------

/// Live queue events for the actor's org. Platform admins see every org.
pub(crate) async fn events(
    State(st): State<Arc<AppState>>,
    Authenticated(actor): Authenticated,
) -> Result<Response, ApiError> {
    authorize(&actor, actor.org_id, Permission::QueueRead)?;

    let rx = st.events.subscribe();
    let stream = broadcast_to_sse(rx, actor);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()).into_response())
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<QueueEvent>,
    actor: ActorContext,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(move |msg| {
        let actor = actor.clone();
        async move {
            match msg {
                Ok(ev) if ev.org_id() == actor.org_id || actor.platform_admin => {
                    let data = serde_json::to_string(&ev).ok()?;
                    Some(Ok(Event::default().event(ev.event_name()).data(data)))
                }
                Ok(_) => None,  // another org's event
                Err(_) => None, // lagged / closed
            }
        }
    })
}
