//! Integration tests for the initialization handshake, driven against the
//! scripted daemon from idelink-test-utils.

use std::time::Duration;

use pretty_assertions::assert_eq;

use idelink_core::protocol::{Hover, Notification};
use idelink_core::service::{NOTIFICATION_BEFORE_INIT, SAVED_STATE_LOAD_FAILED};
use idelink_core::telemetry::events;
use idelink_core::{LifecycleState, ServiceError, Status, StopReason};
use idelink_test_utils::MockDaemon;
use idelink_test_utils::tracing_setup::capture_telemetry;

fn hover() -> Hover {
    Hover {
        path: "src/main.rs".into(),
        line: 1,
        column: 1,
    }
}

// ── Successful handshake ──────────────────────────────────────────

#[tokio::test]
async fn test_init_success_becomes_ready() {
    let (telemetry, _guard) = capture_telemetry();

    let (service, daemon) = MockDaemon::new().spawn("init-1");
    assert_eq!(service.status(), Status::Initializing);

    service
        .initialize_from_saved_state("/project".into(), Some("/tmp/state".into()), false, true)
        .await
        .unwrap();

    assert_eq!(
        service.state(),
        LifecycleState::Initialized {
            status: Status::Ready
        }
    );
    assert_eq!(service.status(), Status::Ready);
    assert!(telemetry.contains(events::INIT_SUCCEEDED));

    let received = daemon.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].method, "initialize_from_saved_state");
    assert_eq!(received[0].tracking_id, "init-1");
    assert!(received[0].expects_reply);
    assert_eq!(received[0].params["root"], "/project");
    assert_eq!(received[0].params["saved_state_path"], "/tmp/state");
    assert_eq!(received[0].params["use_ranked_autocomplete"], true);
}

#[test_log::test(tokio::test)]
async fn test_wait_for_initialization_resolves_after_handshake() {
    let (service, _daemon) = MockDaemon::new().spawn("init-1");

    let waiter = {
        let service = service.clone();
        tokio::spawn(async move { service.wait_for_initialization().await })
    };
    service
        .initialize_from_saved_state(".".into(), None, false, false)
        .await
        .unwrap();

    waiter.await.unwrap().unwrap();
}

// ── Failed handshake ──────────────────────────────────────────────

#[tokio::test]
async fn test_init_rejected_by_daemon() {
    let (telemetry, _guard) = capture_telemetry();

    let (service, _daemon) = MockDaemon::new().reject_init("no saved state").spawn("init-1");

    let err = service
        .initialize_from_saved_state(".".into(), None, false, false)
        .await
        .unwrap_err();

    assert!(matches!(&err, ServiceError::Daemon(msg) if msg == "no saved state"));
    assert_eq!(
        service.state(),
        LifecycleState::FailedToInitialize {
            reason: SAVED_STATE_LOAD_FAILED.to_string()
        }
    );
    assert_eq!(
        service.status(),
        Status::Stopped(SAVED_STATE_LOAD_FAILED.to_string())
    );
    assert!(telemetry.contains(events::INIT_FAILED));
    assert!(!telemetry.contains(events::INIT_SUCCEEDED));
}

#[test_log::test(tokio::test)]
async fn test_notification_before_init_response_fails_handshake() {
    let (service, _daemon) = MockDaemon::new()
        .notify_before_init(Notification::Initializing)
        .spawn("init-1");

    let err = service
        .initialize_from_saved_state(".".into(), None, false, false)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Protocol(_)));
    assert_eq!(
        service.state(),
        LifecycleState::FailedToInitialize {
            reason: NOTIFICATION_BEFORE_INIT.to_string()
        }
    );
}

#[test_log::test(tokio::test)]
async fn test_init_against_dead_daemon_fails() {
    let (service, daemon) = MockDaemon::new().spawn("init-1");
    daemon.crash();

    let err = service
        .initialize_from_saved_state(".".into(), None, false, false)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Codec(_)));
    match service.state() {
        LifecycleState::FailedToInitialize { reason } => {
            assert!(reason.starts_with("could not reach daemon"), "{reason}");
        }
        other => panic!("expected FailedToInitialize, got {other:?}"),
    }
}

// ── Repeated handshakes ───────────────────────────────────────────

#[tokio::test]
async fn test_failed_handshake_is_terminal_even_if_daemon_would_accept_retry() {
    let (telemetry, _guard) = capture_telemetry();

    let (service, daemon) = MockDaemon::new()
        .reject_init_once("no saved state")
        .spawn("init-1");

    let first = service
        .initialize_from_saved_state(".".into(), None, false, false)
        .await
        .unwrap_err();
    assert!(matches!(&first, ServiceError::Daemon(msg) if msg == "no saved state"));

    let second = service
        .initialize_from_saved_state(".".into(), None, false, false)
        .await
        .unwrap_err();
    assert!(
        matches!(&second, ServiceError::FailedToInitialize(reason) if reason == SAVED_STATE_LOAD_FAILED)
    );

    assert_eq!(
        service.state(),
        LifecycleState::FailedToInitialize {
            reason: SAVED_STATE_LOAD_FAILED.to_string()
        }
    );
    assert_eq!(daemon.received().len(), 1);
    assert!(!telemetry.contains(events::INIT_SUCCEEDED));
}

#[test_log::test(tokio::test)]
async fn test_handshake_while_serving_is_refused() {
    let (service, daemon, serve) = MockDaemon::new().start("init-1").await;

    let second = tokio::time::timeout(
        Duration::from_secs(5),
        service.initialize_from_saved_state(".".into(), None, false, false),
    )
    .await
    .expect("second handshake hung on the serve loop");
    assert!(matches!(second, Err(ServiceError::AlreadyInitialized)));
    assert_eq!(service.status(), Status::Ready);
    assert_eq!(
        daemon
            .methods()
            .iter()
            .filter(|m| *m == "initialize_from_saved_state")
            .count(),
        1
    );

    service.stop("t-stop", StopReason::Testing).await;
    serve.await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_handshake_after_stop_is_refused() {
    let (service, daemon) = MockDaemon::new().spawn("init-1");
    service.stop("t-stop", StopReason::EditorExited).await;

    let err = service
        .initialize_from_saved_state(".".into(), None, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Stopped(StopReason::EditorExited)));
    assert!(daemon.received().is_empty());
}

// ── RPC gating by lifecycle state ─────────────────────────────────

#[test_log::test(tokio::test)]
async fn test_rpc_before_init_is_rejected() {
    let (service, daemon) = MockDaemon::new().spawn("init-1");

    let err = service.rpc("t1", hover()).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotInitialized));
    assert_eq!(err.to_string(), "not yet initialized");
    assert!(daemon.received().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_rpc_after_failed_init_reports_reason() {
    let (service, _daemon) = MockDaemon::new().reject_init("corrupt").spawn("init-1");
    let _ = service
        .initialize_from_saved_state(".".into(), None, false, false)
        .await;

    let err = service.rpc("t1", hover()).await.unwrap_err();
    assert!(
        matches!(&err, ServiceError::FailedToInitialize(reason) if reason == SAVED_STATE_LOAD_FAILED)
    );
}

#[test_log::test(tokio::test)]
async fn test_rpc_waits_for_init_when_requested() {
    let (service, daemon) = MockDaemon::new()
        .with_handler(|req| {
            let path = req.params["path"].as_str().unwrap_or_default();
            Some(Ok(serde_json::json!(format!("hover for {path}"))))
        })
        .spawn("init-1");

    let initializer = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .initialize_from_saved_state(".".into(), None, true, false)
                .await
                .unwrap();
            service.serve().await;
        })
    };

    // Only call once the handshake has announced that callers may wait.
    service
        .subscribe()
        .wait_for(|state| {
            matches!(
                state,
                LifecycleState::Uninitialized {
                    wait_for_init: true
                } | LifecycleState::Initialized { .. }
            )
        })
        .await
        .unwrap();

    let reply = service.rpc("t1", hover()).await.unwrap();
    assert_eq!(reply.as_deref(), Some("hover for src/main.rs"));
    assert_eq!(
        daemon.methods(),
        vec!["initialize_from_saved_state".to_string(), "hover".to_string()]
    );

    service.stop("t-stop", StopReason::Testing).await;
    initializer.await.unwrap();
}
