//! Integration tests for stop/destroy and crash handling.

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::Instant;

use idelink_core::protocol::Hover;
use idelink_core::service::QueueKind;
use idelink_core::telemetry::events;
use idelink_core::{LifecycleState, ServiceError, Status, StopReason};
use idelink_test_utils::MockDaemon;
use idelink_test_utils::tracing_setup::capture_telemetry;

fn hover() -> Hover {
    Hover {
        path: "src/lib.rs".into(),
        line: 2,
        column: 8,
    }
}

// ── Graceful shutdown ─────────────────────────────────────────────

#[tokio::test]
async fn test_stop_shuts_daemon_down_gracefully() {
    let (telemetry, _guard) = capture_telemetry();

    let (service, daemon, serve) = MockDaemon::new().start("init-1").await;

    service.stop("t-stop", StopReason::EditorExited).await;
    serve.await.unwrap();

    assert_eq!(
        service.state(),
        LifecycleState::Stopped {
            reason: StopReason::EditorExited
        }
    );
    assert_eq!(service.status(), Status::Stopped("editor exited".to_string()));
    assert!(daemon.methods().contains(&"shutdown".to_string()));
    assert!(daemon.was_killed());
    assert!(telemetry.contains(events::SHUTDOWN_COMPLETE));
    assert!(!telemetry.contains(events::SHUTDOWN_TIMEOUT));
    assert!(!telemetry.contains(events::SERVE_FAULT));
}

#[tokio::test(start_paused = true)]
async fn test_slow_acknowledgement_within_timeout_is_graceful() {
    let (telemetry, _guard) = capture_telemetry();

    let (service, _daemon, serve) = MockDaemon::new()
        .shutdown_ack_after(Duration::from_secs(2))
        .start("init-1")
        .await;

    let started = Instant::now();
    service.stop("t-stop", StopReason::Restarting).await;
    serve.await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(telemetry.contains(events::SHUTDOWN_COMPLETE));
    assert!(!telemetry.contains(events::SHUTDOWN_TIMEOUT));
}

#[test_log::test(tokio::test)]
async fn test_second_stop_is_a_no_op() {
    let (service, daemon, serve) = MockDaemon::new().start("init-1").await;

    service.stop("t-stop", StopReason::Testing).await;
    service.stop("t-stop-again", StopReason::Crashed).await;
    serve.await.unwrap();

    assert_eq!(
        service.state(),
        LifecycleState::Stopped {
            reason: StopReason::Testing
        }
    );
    assert_eq!(daemon.kill_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_stop_before_init_kills_daemon() {
    let (service, daemon) = MockDaemon::new().spawn("init-1");

    service.stop("t-stop", StopReason::Testing).await;

    assert!(daemon.was_killed());
    assert!(daemon.received().is_empty());
    assert_eq!(
        service.state(),
        LifecycleState::Stopped {
            reason: StopReason::Testing
        }
    );
}

#[test_log::test(tokio::test)]
async fn test_stop_after_failed_init() {
    let (service, daemon) = MockDaemon::new().reject_init("corrupt").spawn("init-1");
    let _ = service
        .initialize_from_saved_state(".".into(), None, false, false)
        .await;

    service.stop("t-stop", StopReason::Restarting).await;

    assert!(daemon.was_killed());
    assert_eq!(
        service.state(),
        LifecycleState::Stopped {
            reason: StopReason::Restarting
        }
    );
}

#[test_log::test(tokio::test)]
async fn test_wait_for_initialization_on_stopped_connection_errors() {
    let (service, _daemon) = MockDaemon::new().spawn("init-1");
    service.stop("t-stop", StopReason::Testing).await;

    let err = service.wait_for_initialization().await.unwrap_err();
    assert!(matches!(err, ServiceError::WaitedOnStopped(StopReason::Testing)));
}

#[tokio::test]
async fn test_kill_failure_is_reported() {
    let (telemetry, _guard) = capture_telemetry();

    let (service, _daemon, serve) = MockDaemon::new().kill_fails().start("init-1").await;

    service.stop("t-stop", StopReason::Testing).await;
    serve.await.unwrap();

    assert!(telemetry.contains(events::SHUTDOWN_FAULT));
    assert!(service.state().is_stopped());
}

#[tokio::test]
async fn test_destroy_under_serve_loop_is_not_a_fault() {
    let (telemetry, _guard) = capture_telemetry();

    let (service, daemon, serve) = MockDaemon::new().start("init-1").await;

    service.destroy("t-destroy").await;
    serve.await.unwrap();

    assert!(daemon.was_killed());
    assert!(telemetry.contains(events::SHUTDOWN_COMPLETE));
    assert!(!telemetry.contains(events::SERVE_FAULT));
    assert_eq!(
        service.state(),
        LifecycleState::Stopped {
            reason: StopReason::Crashed
        }
    );
}

// ── Shutdown timeout ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unresponsive_daemon_is_killed_after_timeout() {
    let (telemetry, _guard) = capture_telemetry();

    let (service, daemon, serve) = MockDaemon::new().never_ack_shutdown().start("init-1").await;

    let started = Instant::now();
    service.stop("t-stop", StopReason::EditorExited).await;
    let elapsed = started.elapsed();
    serve.await.unwrap();

    assert!(elapsed >= Duration::from_secs(5), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");
    assert!(daemon.was_killed());
    assert!(telemetry.contains(events::SHUTDOWN_TIMEOUT));
    assert!(!telemetry.contains(events::SHUTDOWN_COMPLETE));
    assert_eq!(
        service.state(),
        LifecycleState::Stopped {
            reason: StopReason::EditorExited
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_is_configurable() {
    let (service, _daemon, serve) = MockDaemon::new()
        .never_ack_shutdown()
        .shutdown_timeout(Duration::from_secs(1))
        .start("init-1")
        .await;

    let started = Instant::now();
    service.stop("t-stop", StopReason::Testing).await;
    serve.await.unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_hung_rpc_is_released_by_shutdown_timeout() {
    let (service, daemon, serve) = MockDaemon::new()
        .with_handler(|_| None)
        .start("init-1")
        .await;

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.rpc("t1", hover()).await })
    };
    daemon.wait_for_method("hover").await;

    let started = Instant::now();
    service.stop("t-stop", StopReason::Testing).await;
    assert!(started.elapsed() >= Duration::from_secs(5));

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ServiceError::QueueClosed(QueueKind::Response)));
    serve.await.unwrap();
}

// ── Crashes ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_daemon_crash_stops_connection() {
    let (telemetry, _guard) = capture_telemetry();

    let (service, daemon, serve) = MockDaemon::new().start("init-1").await;
    let notifications = service.notifications();

    daemon.crash();
    serve.await.unwrap();

    assert_eq!(
        service.state(),
        LifecycleState::Stopped {
            reason: StopReason::Crashed
        }
    );
    assert!(telemetry.contains(events::SERVE_FAULT));
    assert!(notifications.is_closed());

    let err = service.rpc("t1", hover()).await.unwrap_err();
    assert!(matches!(err, ServiceError::Stopped(StopReason::Crashed)));
}

#[tokio::test(start_paused = true)]
async fn test_crash_releases_in_flight_rpc_immediately() {
    let (service, daemon, serve) = MockDaemon::new()
        .with_handler(|_| None)
        .start("init-1")
        .await;

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.rpc("t1", hover()).await })
    };
    daemon.wait_for_method("hover").await;

    let started = Instant::now();
    daemon.crash();
    serve.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ServiceError::QueueClosed(QueueKind::Response)));
    assert!(service.state().is_stopped());
}
