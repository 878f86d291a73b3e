//! End-to-end behaviour of the session core with real processes.

use std::sync::Arc;
use std::time::Duration;

use termstream::broadcaster::{StreamEvent, Subscription};
use termstream::config::AppConfig;
use termstream::input::InputRequest;
use termstream::metrics::ServerMetrics;
use termstream::registry::SessionRegistry;
use termstream::supervisor::SupervisorState;
use termstream::{ExitReason, SessionError, SessionSpec, SessionStatus};

fn registry() -> SessionRegistry {
    SessionRegistry::new(
        Arc::new(AppConfig::default()),
        Arc::new(ServerMetrics::new()),
    )
}

fn sh(script: &str) -> SessionSpec {
    SessionSpec::command(&["/bin/sh", "-c", script])
}

async fn wait_for_exit(registry: &SessionRegistry, id: &str) -> termstream::SessionInfo {
    for _ in 0..100 {
        let info = registry.get(id).await.unwrap();
        if info.status == SessionStatus::Exited {
            return info;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session {} did not exit", id);
}

async fn next_event(sub: &mut Subscription) -> Option<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(5), sub.events.recv())
        .await
        .expect("timed out waiting for stream event")
}

/// Collect events until `needle` shows up in the streamed output.
async fn read_until(sub: &mut Subscription, needle: &str) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let mut seen = String::new();
    while !seen.contains(needle) {
        match next_event(sub).await {
            Some(event) => {
                match &event {
                    StreamEvent::Frame(f) => seen.push_str(&String::from_utf8_lossy(&f.payload)),
                    StreamEvent::Snapshot(s) => seen.push_str(&String::from_utf8_lossy(&s.payload)),
                    _ => {}
                }
                events.push(event);
            }
            None => break,
        }
    }
    events
}

#[tokio::test]
async fn echo_session_runs_then_exits_with_final_snapshot() {
    let registry = registry();
    let info = registry.create_session(sh("echo hello")).await.unwrap();
    assert_eq!(info.status, SessionStatus::Running);

    let exited = wait_for_exit(&registry, &info.id).await;
    assert_eq!(exited.exit_code, Some(0));
    assert_eq!(exited.exit_reason, Some(ExitReason::ProcessExited));
    assert!(exited.exited_at.is_some());

    let snapshot = registry.snapshot(&info.id).await.unwrap();
    assert!(String::from_utf8_lossy(&snapshot.payload).contains("hello"));

    // Late joiners still get the final snapshot, then the exit notice
    let mut late = registry.subscribe(&info.id, "late").await.unwrap();
    assert!(matches!(next_event(&mut late).await, Some(StreamEvent::Snapshot(_))));
    match next_event(&mut late).await {
        Some(StreamEvent::Exit(notice)) => assert_eq!(notice.exit_code, Some(0)),
        other => panic!("expected exit notice, got {:?}", other),
    }
    assert!(next_event(&mut late).await.is_none());
}

#[tokio::test]
async fn subscriber_sees_snapshot_then_increasing_frames() {
    let registry = registry();
    let info = registry
        .create_session(sh("read line; echo got:$line; sleep 5"))
        .await
        .unwrap();
    let mut sub = registry.subscribe(&info.id, "c1").await.unwrap();

    let first = next_event(&mut sub).await;
    let mut last_seq = match first {
        Some(StreamEvent::Snapshot(s)) => s.seq,
        other => panic!("first event must be a snapshot, got {:?}", other),
    };

    registry
        .send_input(&info.id, &InputRequest::text("ping\n"))
        .await
        .unwrap();
    let events = read_until(&mut sub, "got:ping").await;
    for event in events {
        if let StreamEvent::Frame(frame) = event {
            assert!(frame.seq > last_seq, "seq {} after {}", frame.seq, last_seq);
            last_seq = frame.seq;
        }
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn three_errors_sever_without_ending_session() {
    let registry = registry();
    let info = registry
        .create_session(sh("echo ready; sleep 5"))
        .await
        .unwrap();
    let mut sub = registry.subscribe(&info.id, "c1").await.unwrap();
    read_until(&mut sub, "ready").await;

    assert_eq!(
        registry.report_transport_error(&info.id, sub.id).await,
        Some(SupervisorState::Degraded)
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    registry.report_transport_error(&info.id, sub.id).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        registry.report_transport_error(&info.id, sub.id).await,
        Some(SupervisorState::Severed)
    );
    assert!(sub.severed.is_cancelled());

    let current = registry.get(&info.id).await.unwrap();
    assert_eq!(current.status, SessionStatus::Running);

    let mut again = registry.subscribe(&info.id, "c1").await.unwrap();
    match next_event(&mut again).await {
        Some(StreamEvent::Snapshot(s)) => {
            assert!(String::from_utf8_lossy(&s.payload).contains("ready"))
        }
        other => panic!("expected fresh snapshot, got {:?}", other),
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn immediate_resever_ends_session_for_excessive_reconnection() {
    let registry = registry();
    let info = registry.create_session(sh("sleep 30")).await.unwrap();

    let first = registry.subscribe(&info.id, "flappy").await.unwrap();
    for _ in 0..3 {
        registry.report_transport_error(&info.id, first.id).await;
    }
    let mut second = registry.subscribe(&info.id, "flappy").await.unwrap();
    for _ in 0..3 {
        registry.report_transport_error(&info.id, second.id).await;
    }

    let exited = wait_for_exit(&registry, &info.id).await;
    assert_eq!(exited.exit_reason, Some(ExitReason::ExcessiveReconnection));

    // The severed subscription was dropped before the exit, so it sees no notice
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), second.events.recv()).await
    {
        assert!(!matches!(event, StreamEvent::Exit(_)));
    }

    let mut late = registry.subscribe(&info.id, "other").await.unwrap();
    next_event(&mut late).await;
    match next_event(&mut late).await {
        Some(StreamEvent::Exit(notice)) => {
            assert_eq!(notice.reason, ExitReason::ExcessiveReconnection)
        }
        other => panic!("expected exit notice, got {:?}", other),
    }
}

#[tokio::test]
async fn anonymous_viewers_severed_back_to_back_do_not_end_session() {
    let registry = registry();
    let info = registry.create_session(sh("sleep 30")).await.unwrap();

    let first = registry.subscribe(&info.id, "").await.unwrap();
    for _ in 0..3 {
        registry.report_transport_error(&info.id, first.id).await;
    }
    let second = registry.subscribe(&info.id, "").await.unwrap();
    for _ in 0..3 {
        registry.report_transport_error(&info.id, second.id).await;
    }
    assert!(first.severed.is_cancelled());
    assert!(second.severed.is_cancelled());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let current = registry.get(&info.id).await.unwrap();
    assert_eq!(current.status, SessionStatus::Running);
    assert_eq!(current.exit_reason, None);
    registry.shutdown().await;
}

#[tokio::test]
async fn output_from_a_lingering_background_job_reaches_the_final_snapshot() {
    let registry = registry();
    // The job outlives the shell and keeps the terminal open past its exit
    let info = registry
        .create_session(sh("(trap '' HUP; sleep 0.7; echo trailing) & exit 0"))
        .await
        .unwrap();
    let mut sub = registry.subscribe(&info.id, "c1").await.unwrap();

    let exited = wait_for_exit(&registry, &info.id).await;
    assert_eq!(exited.exit_code, Some(0));
    let snapshot = registry.snapshot(&info.id).await.unwrap();
    assert!(String::from_utf8_lossy(&snapshot.payload).contains("trailing"));

    // Streamed before the exit notice, never after it
    let mut streamed = String::new();
    loop {
        match next_event(&mut sub).await {
            Some(StreamEvent::Frame(f)) => streamed.push_str(&String::from_utf8_lossy(&f.payload)),
            Some(StreamEvent::Exit(_)) => break,
            Some(_) => {}
            None => panic!("stream closed without an exit notice"),
        }
    }
    assert!(streamed.contains("trailing"));
}

#[tokio::test]
async fn resize_is_reflected_in_snapshot_and_next_frame() {
    let registry = registry();
    let info = registry.create_session(sh("sleep 5")).await.unwrap();
    let mut sub = registry.subscribe(&info.id, "c1").await.unwrap();
    next_event(&mut sub).await;

    registry.resize(&info.id, 120, 40).await.unwrap();
    let snapshot = registry.snapshot(&info.id).await.unwrap();
    assert_eq!((snapshot.cols, snapshot.rows), (120, 40));
    assert_eq!(registry.get(&info.id).await.unwrap().cols, 120);

    match next_event(&mut sub).await {
        Some(StreamEvent::Frame(frame)) => assert_eq!(frame.size, Some((120, 40))),
        other => panic!("expected size frame, got {:?}", other),
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn input_after_exit_is_rejected() {
    let registry = registry();
    let info = registry.create_session(sh("true")).await.unwrap();
    wait_for_exit(&registry, &info.id).await;

    let err = registry
        .send_input(&info.id, &InputRequest::text("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotRunning(_)));
    assert!(matches!(
        registry.resize(&info.id, 100, 30).await,
        Err(SessionError::NotRunning(_))
    ));
}

#[tokio::test]
async fn killing_one_session_leaves_another_streaming() {
    let registry = registry();
    let a = registry.create_session(sh("sleep 30")).await.unwrap();
    let b = registry
        .create_session(sh("while read l; do echo b:$l; done"))
        .await
        .unwrap();
    let mut sub_b = registry.subscribe(&b.id, "c1").await.unwrap();
    next_event(&mut sub_b).await;

    registry.kill(&a.id, Some("SIGKILL")).await.unwrap();
    let a_exit = wait_for_exit(&registry, &a.id).await;
    assert_eq!(a_exit.exit_reason, Some(ExitReason::Killed));

    registry
        .send_input(&b.id, &InputRequest::text("still here\n"))
        .await
        .unwrap();
    read_until(&mut sub_b, "b:still here").await;
    assert_eq!(
        registry.get(&b.id).await.unwrap().status,
        SessionStatus::Running
    );
    registry.shutdown().await;
}

#[tokio::test]
async fn cwd_and_env_reach_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let spec = SessionSpec {
        cwd: Some(dir.path().to_path_buf()),
        env: vec![("GREETING".to_string(), "howdy".to_string())],
        ..sh("echo $GREETING from $(pwd)")
    };
    let info = registry.create_session(spec).await.unwrap();
    wait_for_exit(&registry, &info.id).await;

    let text = String::from_utf8_lossy(&registry.snapshot(&info.id).await.unwrap().payload)
        .to_string();
    assert!(text.contains("howdy from"));
    let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
    assert!(text.contains(&dir_name));
}
