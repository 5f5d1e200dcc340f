//! Scenario: Authentication And Authorization Gates
//!
//! # Invariant under test
//! Every control endpoint answers 401 without valid credentials and 403
//! when the actor's role or org scope does not grant the permission.
//! Cross-org access requires the platform-admin flag and never escalates
//! the role rank.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio::sync::broadcast;
use tower::ServiceExt; // oneshot
use uuid::Uuid;

use bcp_authz::Role;
use bcp_config::StaticToken;
use bcp_core::QueueStore;
use bcp_daemon::{routes, state::AppState};
use bcp_scheduler::{Scheduler, SchedulerConfig};
use bcp_testkit::{MemStore, RecordingTransport};

const ORG_A: Uuid = Uuid::from_u128(0x10);
const ORG_B: Uuid = Uuid::from_u128(0x11);
const AGENT_A: Uuid = Uuid::from_u128(0x20);

fn make_state() -> Arc<AppState> {
    let store = Arc::new(MemStore::new());
    store.add_organization(ORG_A, None);
    store.add_organization(ORG_B, None);
    store.add_agent(AGENT_A, ORG_A, "db01.acme.internal", None);
    store.add_schedule(Uuid::from_u128(0x30), AGENT_A, "nightly-pg", 0);

    let (events, _) = broadcast::channel(64);
    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn QueueStore>,
        Arc::new(RecordingTransport::new()),
        SchedulerConfig::test_defaults(),
    );
    let handle = scheduler.handle();
    drop(scheduler);

    let actor = |n: u128| Uuid::from_u128(0x900 + n);
    let tokens = vec![
        StaticToken {
            token: "tok-viewer".into(),
            actor_id: actor(1),
            org_id: ORG_A,
            role: Role::Viewer,
            platform_admin: false,
        },
        StaticToken {
            token: "tok-operator".into(),
            actor_id: actor(2),
            org_id: ORG_A,
            role: Role::Operator,
            platform_admin: false,
        },
        StaticToken {
            token: "tok-admin".into(),
            actor_id: actor(3),
            org_id: ORG_A,
            role: Role::Admin,
            platform_admin: false,
        },
        StaticToken {
            token: "tok-staff".into(),
            actor_id: actor(4),
            org_id: ORG_B,
            role: Role::Viewer,
            platform_admin: true,
        },
    ];

    Arc::new(AppState::new(
        store as Arc<dyn QueueStore>,
        handle,
        events,
        &tokens,
    ))
}

fn request(method: &str, uri: &str, token: Option<&str>) -> Request<axum::body::Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    if matches!(method, "PUT" | "POST") {
        builder = builder.header("Content-Type", "application/json");
        return builder
            .body(axum::body::Body::from("{}"))
            .unwrap();
    }
    builder.body(axum::body::Body::empty()).unwrap()
}

async fn status_of(req: Request<axum::body::Body>, st: Arc<AppState>) -> StatusCode {
    let resp = routes::build_router(st).oneshot(req).await.expect("oneshot");
    let status = resp.status();
    // Error bodies always carry {error}.
    if !status.is_success() {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json error body");
        assert!(json["error"].is_string(), "error body must carry {{error}}");
    }
    status
}

#[tokio::test]
async fn missing_and_unknown_tokens_get_401() {
    let st = make_state();

    for token in [None, Some("tok-forged")] {
        let status = status_of(request("GET", "/api/v1/backup-queue", token), Arc::clone(&st)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "token={token:?}");
    }
}

#[tokio::test]
async fn session_cookie_is_an_accepted_credential() {
    let st = make_state();

    let req = Request::builder()
        .method("GET")
        .uri("/api/v1/backup-queue")
        .header("Cookie", "theme=dark; bcp_session=tok-viewer")
        .body(axum::body::Body::empty())
        .unwrap();
    let status = status_of(req, st).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn viewer_reads_but_cannot_cancel_or_tune() {
    let st = make_state();

    let ok = status_of(
        request("GET", "/api/v1/backup-queue/summary", Some("tok-viewer")),
        Arc::clone(&st),
    )
    .await;
    assert_eq!(ok, StatusCode::OK);

    let cancel = status_of(
        request(
            "DELETE",
            &format!("/api/v1/backup-queue/{}", Uuid::from_u128(1)),
            Some("tok-viewer"),
        ),
        Arc::clone(&st),
    )
    .await;
    assert_eq!(cancel, StatusCode::FORBIDDEN);

    let tune = status_of(
        request(
            "PUT",
            &format!("/api/v1/organizations/{ORG_A}/concurrency"),
            Some("tok-viewer"),
        ),
        st,
    )
    .await;
    assert_eq!(tune, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn operator_cannot_write_limits() {
    let st = make_state();

    let status = status_of(
        request(
            "PUT",
            &format!("/api/v1/agents/{AGENT_A}/concurrency"),
            Some("tok-operator"),
        ),
        st,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn cross_org_access_looks_like_not_found() {
    let st = make_state();

    // Org-A admin probing org B: answers like a missing entity so
    // tenants cannot confirm each other's existence.
    let status = status_of(
        request(
            "GET",
            &format!("/api/v1/organizations/{ORG_B}/concurrency"),
            Some("tok-admin"),
        ),
        Arc::clone(&st),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Platform staff (home org B) reading org A: allowed.
    let status = status_of(
        request(
            "GET",
            &format!("/api/v1/organizations/{ORG_A}/concurrency"),
            Some("tok-staff"),
        ),
        Arc::clone(&st),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // But the platform flag does not escalate the role: staff is a
    // viewer, so limit writes stay forbidden.
    let status = status_of(
        request(
            "PUT",
            &format!("/api/v1/organizations/{ORG_A}/concurrency"),
            Some("tok-staff"),
        ),
        st,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
