//! Stream lifecycle scenarios driven end to end over loopback UDP.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{Behavior, Harness, ScriptedEngine, assert_valid_path, eventually, states};
use live_relay::domain::{ReasonCode, Ssrc, StreamState};

#[tokio::test]
async fn test_stream_goes_live_and_serves_viewers() {
    let harness = Harness::start(ScriptedEngine::streaming());
    let stream = harness.create("rtsp://cam1");
    assert_eq!(stream.state, StreamState::Initializing);

    harness.wait_for_state(&stream.id, StreamState::Live).await;

    let records = harness.transitions(&stream.id).await;
    assert_valid_path(&records);
    assert_eq!(
        states(&records),
        vec![StreamState::Initializing, StreamState::Ready, StreamState::Live]
    );
    assert_eq!(records[1].reason, ReasonCode::SourceIdentified);
    assert_eq!(records[2].reason, ReasonCode::ThroughputConfirmed);

    let controller = harness.relay.controller();
    let a = controller
        .attach_consumer(&stream.id, "viewer-a", json!({"codecs": ["h264"]}))
        .await
        .unwrap();
    let b = controller
        .attach_consumer(&stream.id, "viewer-b", json!({}))
        .await
        .unwrap();
    assert_eq!(a.session["producer_id"], b.session["producer_id"]);
    controller
        .complete_handshake(&b.consumer.id, &json!({"dtls": "fingerprint"}))
        .await
        .unwrap();

    let detached = controller.detach_consumer(&a.consumer.id).await.unwrap();
    assert_eq!(detached.close_reason.as_deref(), Some("detached"));

    assert_eq!(harness.state(&stream.id), StreamState::Live);
    let remaining = controller.list_consumers(&stream.id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, b.consumer.id);
    assert!(controller.producer(&stream.id).unwrap().is_active());

    // A live stream cannot be advanced again.
    let err = controller
        .advance_to_ready(&stream.id, Ssrc(0xDEAD_BEEF))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_state_transition");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_rapid_crashes_exhaust_retries() {
    let engine = ScriptedEngine::new(Behavior::CrashImmediately);
    let harness = Harness::start(engine);
    let stream = harness.create("rtsp://cam-crashy");

    let closed = harness.wait_for_state(&stream.id, StreamState::Closed).await;
    assert_eq!(closed.last_fault, Some(ReasonCode::IngestionRetryExhausted));

    let records = harness.transitions(&stream.id).await;
    assert_valid_path(&records);
    let stopped = records
        .iter()
        .find(|r| r.to_state == StreamState::Stopped)
        .unwrap();
    assert_eq!(stopped.reason, ReasonCode::IngestionRetryExhausted);
    assert!(!states(&records).contains(&StreamState::Ready));

    assert_eq!(harness.engine.launches(), 4);
    assert!(harness.relay.controller().producer(&stream.id).is_none());
    assert_eq!(harness.boundary.active_producer_count(), 0);
    assert_eq!(harness.boundary.ingress_count(), 0);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_share_one_stream() {
    let harness = Harness::start(ScriptedEngine::streaming());
    let controller = Arc::clone(harness.relay.controller());

    let creates = (0..8).map(|_| {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .create("rtsp://cam-shared/live", None, Default::default())
                .unwrap()
        })
    });
    let outcomes: Vec<_> = futures::future::join_all(creates)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let ids: HashSet<_> = outcomes.iter().map(|o| o.stream.id.clone()).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(outcomes.iter().filter(|o| !o.reused).count(), 1);

    let id = ids.into_iter().next().unwrap();
    harness.wait_for_state(&id, StreamState::Live).await;

    let records = harness.transitions(&id).await;
    let initializing = records
        .iter()
        .filter(|r| r.to_state == StreamState::Initializing)
        .count();
    assert_eq!(initializing, 1);
    assert_eq!(harness.engine.launches(), 1);
    assert_eq!(harness.boundary.active_producer_count(), 1);
    assert_eq!(controller.list(None).len(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stop_twice_records_one_teardown() {
    let harness = Harness::start(ScriptedEngine::streaming());
    let stream = harness.create("rtsp://cam-stop");
    harness.wait_for_state(&stream.id, StreamState::Live).await;

    let controller = harness.relay.controller();
    let viewer = controller
        .attach_consumer(&stream.id, "viewer", json!({}))
        .await
        .unwrap();

    let first = controller.stop(&stream.id).await.unwrap();
    let second = controller.stop(&stream.id).await.unwrap();
    assert_eq!(first.state, StreamState::Closed);
    assert_eq!(second.state, StreamState::Closed);

    let records = harness.transitions(&stream.id).await;
    assert_valid_path(&records);
    let stopped: Vec<_> = records
        .iter()
        .filter(|r| r.to_state == StreamState::Stopped)
        .collect();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].reason, ReasonCode::StopRequested);

    assert!(harness.relay.registry().get(&viewer.consumer.id).is_none());
    assert_eq!(harness.boundary.active_producer_count(), 0);
    assert!(!harness.relay.controller().supervisor().is_supervising(&stream.id));

    // A stopped source can be created again as a new stream.
    let again = harness.create("rtsp://cam-stop");
    assert_ne!(again.id, stream.id);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_crash_recovers_with_new_producer() {
    let harness = Harness::start(ScriptedEngine::streaming());
    let stream = harness.create("rtsp://cam-recover");
    harness.wait_for_state(&stream.id, StreamState::Live).await;

    let controller = harness.relay.controller();
    let first = controller.producer(&stream.id).unwrap();
    let viewer = controller
        .attach_consumer(&stream.id, "viewer", json!({}))
        .await
        .unwrap();

    harness.engine.crash_latest();
    harness
        .wait_until(&stream.id, Duration::from_secs(10), |s| {
            s.state == StreamState::Live && s.last_fault == Some(ReasonCode::ProcessCrashed)
        })
        .await;

    let second = controller.producer(&stream.id).unwrap();
    assert_ne!(second.id, first.id);
    assert_ne!(second.ssrc, first.ssrc);
    assert_eq!(harness.engine.launches(), 2);
    let issued = harness.boundary.producer_ids();
    assert_eq!(issued.len(), 2);
    assert!(issued.contains(&first.id) && issued.contains(&second.id));
    assert!(!harness.boundary.is_producer_active(&first.id));
    let handle = controller.supervisor().handle(&stream.id).unwrap();
    assert_eq!(handle.generation, 2);
    assert_eq!(handle.ssrc, Some(second.ssrc));

    // Viewers of the replaced producer were released.
    let old = harness.relay.registry().get(&viewer.consumer.id);
    assert!(old.is_none());

    let records = harness.transitions(&stream.id).await;
    assert_valid_path(&records);
    assert_eq!(
        states(&records),
        vec![
            StreamState::Initializing,
            StreamState::Ready,
            StreamState::Live,
            StreamState::Error,
            StreamState::Ready,
            StreamState::Live,
        ]
    );
    assert_eq!(records[3].reason, ReasonCode::ProcessCrashed);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stalled_source_is_restarted_by_health_monitor() {
    let harness = Harness::start_with(ScriptedEngine::streaming(), |config| {
        config.ingest.stall_timeout_ms = 300;
    });
    let stream = harness.create("rtsp://cam-stall");
    harness.wait_for_state(&stream.id, StreamState::Live).await;

    let mut health = harness.relay.monitor().subscribe();
    harness.engine.silence_latest();

    harness
        .wait_until(&stream.id, Duration::from_secs(10), |s| {
            s.state == StreamState::Live && s.last_fault == Some(ReasonCode::StalledSource)
        })
        .await;

    let records = harness.transitions(&stream.id).await;
    assert_valid_path(&records);
    assert!(
        records
            .iter()
            .any(|r| r.to_state == StreamState::Error && r.reason == ReasonCode::StalledSource)
    );
    assert_eq!(harness.engine.launches(), 2);

    let snapshot = tokio::time::timeout(Duration::from_secs(2), health.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.stream_id, stream.id);
    assert!(harness.relay.monitor().last_published(&stream.id).is_some());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_launch_failure_then_recovery() {
    let engine = ScriptedEngine::streaming();
    engine.script([Behavior::FailLaunch]);
    let harness = Harness::start(engine);
    let stream = harness.create("rtsp://cam-flaky");

    harness.wait_for_state(&stream.id, StreamState::Live).await;

    let records = harness.transitions(&stream.id).await;
    assert_valid_path(&records);
    assert_eq!(records[1].to_state, StreamState::Error);
    assert_eq!(records[1].reason, ReasonCode::IngestionStartFailed);
    assert_eq!(
        states(&records[2..]),
        vec![StreamState::Ready, StreamState::Live]
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_every_stream() {
    let harness = Harness::start(ScriptedEngine::streaming());
    let a = harness.create("rtsp://cam-a");
    let b = harness.create("rtsp://cam-b");
    harness.wait_for_state(&a.id, StreamState::Live).await;

    let relay = harness.relay.clone();
    relay.shutdown().await;

    for id in [&a.id, &b.id] {
        let stream = relay.controller().snapshot(id).unwrap();
        assert_eq!(stream.state, StreamState::Closed);
        let records = relay.controller().transitions(id).await.unwrap();
        let stopped = records
            .iter()
            .find(|r| r.to_state == StreamState::Stopped)
            .unwrap();
        assert_eq!(stopped.reason, ReasonCode::Shutdown);
    }
    assert_eq!(relay.controller().supervisor().active_count(), 0);
    assert!(matches!(
        relay.controller().create("rtsp://cam-c", None, Default::default()),
        Err(live_relay::Error::Shutdown)
    ));
}

#[tokio::test]
async fn test_rejected_registration_releases_ingestion() {
    let harness = Harness::start(ScriptedEngine::streaming());
    harness.boundary.set_reject_registrations(true);
    let stream = harness.create("rtsp://cam-rejected");

    let failed = harness.wait_for_state(&stream.id, StreamState::Error).await;
    assert_eq!(failed.last_fault, Some(ReasonCode::ProducerRegistrationFailed));

    let supervisor = harness.relay.controller().supervisor().clone();
    let boundary = harness.boundary.clone();
    let id = stream.id.clone();
    eventually(Duration::from_secs(5), "ingestion and ingress release", || {
        !supervisor.is_supervising(&id) && boundary.ingress_count() == 0
    })
    .await;
    assert_eq!(harness.engine.launches(), 1);
    assert_eq!(harness.boundary.active_producer_count(), 0);

    // The errored stream still owns its source.
    let again = harness
        .relay
        .controller()
        .create("rtsp://cam-rejected", None, Default::default())
        .unwrap();
    assert!(again.reused);
    assert_eq!(again.stream.id, stream.id);

    harness.boundary.set_reject_registrations(false);
    let retried = harness.relay.controller().reconnect(&stream.id).await.unwrap();
    assert_eq!(retried.state, StreamState::Error);
    harness.wait_for_state(&stream.id, StreamState::Live).await;

    let records = harness.transitions(&stream.id).await;
    assert_valid_path(&records);
    assert_eq!(
        states(&records),
        vec![
            StreamState::Initializing,
            StreamState::Error,
            StreamState::Ready,
            StreamState::Live
        ]
    );
    assert_eq!(records[1].reason, ReasonCode::ProducerRegistrationFailed);
    assert_eq!(harness.engine.launches(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_requires_error_state() {
    let harness = Harness::start(ScriptedEngine::streaming());
    let stream = harness.create("rtsp://cam-healthy");
    harness.wait_for_state(&stream.id, StreamState::Live).await;

    let controller = harness.relay.controller();
    let err = controller.reconnect(&stream.id).await.unwrap_err();
    assert_eq!(err.code(), "invalid_state_transition");

    controller.stop(&stream.id).await.unwrap();
    let err = controller.reconnect(&stream.id).await.unwrap_err();
    assert_eq!(err.code(), "invalid_state_transition");

    let err = controller.reconnect("missing").await.unwrap_err();
    assert_eq!(err.code(), "not_found");

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_racing_fault_tears_down_once() {
    let harness = Harness::start(ScriptedEngine::streaming());
    let stream = harness.create("rtsp://cam-race");
    harness.wait_for_state(&stream.id, StreamState::Live).await;

    let controller = harness.relay.controller().clone();
    let (stopped, faulted) = tokio::join!(
        controller.stop(&stream.id),
        controller.fault(
            &stream.id,
            ReasonCode::StalledSource,
            Some("no packets".into())
        ),
    );
    stopped.unwrap();
    faulted.unwrap();

    let records = harness.transitions(&stream.id).await;
    assert_valid_path(&records);
    assert_eq!(records.last().map(|r| r.to_state), Some(StreamState::Closed));
    assert_eq!(
        records
            .iter()
            .filter(|r| r.to_state == StreamState::Stopped)
            .count(),
        1
    );
    assert!(!controller.supervisor().is_supervising(&stream.id));
    assert_eq!(harness.boundary.active_producer_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stop_during_discovery_does_not_wait() {
    let harness = Harness::start_with(ScriptedEngine::new(Behavior::Silent), |config| {
        config.ingest.discovery_window_ms = 60_000;
    });
    let stream = harness.create("rtsp://cam-quiet");

    let supervisor = harness.relay.controller().supervisor().clone();
    let id = stream.id.clone();
    eventually(Duration::from_secs(5), "ingestion start", || {
        supervisor.is_supervising(&id)
    })
    .await;

    let stopped = tokio::time::timeout(
        Duration::from_secs(2),
        harness.relay.controller().stop(&stream.id),
    )
    .await
    .expect("stop returned while discovery was pending")
    .unwrap();
    assert_eq!(stopped.state, StreamState::Closed);

    let records = harness.transitions(&stream.id).await;
    assert_eq!(
        states(&records),
        vec![
            StreamState::Initializing,
            StreamState::Stopped,
            StreamState::Closed
        ]
    );
    assert_eq!(records[1].reason, ReasonCode::StopRequested);
    assert_eq!(harness.boundary.ingress_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stop_during_registration_answers_waiter() {
    let harness = Harness::start_with(ScriptedEngine::new(Behavior::Silent), |config| {
        config.ingest.discovery_window_ms = 60_000;
        config.router.observe_grace_ms = 30_000;
        config.router.request_timeout_ms = 60_000;
        config.controller.reply_timeout_ms = 60_000;
    });
    let stream = harness.create("rtsp://cam-unseen");

    let supervisor = harness.relay.controller().supervisor().clone();
    let id = stream.id.clone();
    eventually(Duration::from_secs(5), "ingestion start", || {
        supervisor.is_supervising(&id)
    })
    .await;

    // Nothing is ever sent with this SSRC, so the boundary keeps waiting.
    let waiter = {
        let controller = harness.relay.controller().clone();
        let id = stream.id.clone();
        tokio::spawn(async move { controller.advance_to_ready(&id, Ssrc(0x0BAD_CAFE)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.state(&stream.id), StreamState::Initializing);

    let stopped = tokio::time::timeout(
        Duration::from_secs(2),
        harness.relay.controller().stop(&stream.id),
    )
    .await
    .expect("stop returned while registration was pending")
    .unwrap();
    assert_eq!(stopped.state, StreamState::Closed);

    let answered = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(answered.state, StreamState::Closed);
    assert_eq!(harness.boundary.active_producer_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_closed_streams_leave_memory() {
    let harness = Harness::start_with(ScriptedEngine::streaming(), |config| {
        config.controller.closed_retention_ms = 0;
        config.health.interval_ms = 60_000;
    });
    let controller = harness.relay.controller().clone();

    let mut ids = Vec::new();
    for n in 0..3 {
        let stream = harness.create(&format!("rtsp://cam-evict-{n}"));
        harness.wait_for_state(&stream.id, StreamState::Live).await;
        controller.stop(&stream.id).await.unwrap();
        ids.push(stream.id);
    }
    // Each actor task ends just after its stop reply.
    let monitor = harness.relay.monitor();
    for _ in 0..50 {
        monitor.sweep().await;
        if controller.stream_ids().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(controller.stream_ids().is_empty());
    assert!(controller.list(None).is_empty());
    for id in &ids {
        assert!(controller.snapshot(id).is_none());
        assert!(monitor.last_published(id).is_none());

        // Stored history outlives the in-memory view.
        let stored = controller.get(id).await.unwrap();
        assert_eq!(stored.state, StreamState::Closed);
        let records = controller.transitions(id).await.unwrap();
        assert_valid_path(&records);
        assert_eq!(records.last().map(|r| r.to_state), Some(StreamState::Closed));

        let stopped = controller.stop(id).await.unwrap();
        assert_eq!(stopped.state, StreamState::Closed);
    }
    assert_eq!(harness.relay.metrics().snapshot().streams_evicted, 3);

    // The source is free for a new stream.
    let fresh = harness.create("rtsp://cam-evict-0");
    assert!(!ids.contains(&fresh.id));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_closed_streams_are_kept_for_retention() {
    let harness = Harness::start_with(ScriptedEngine::streaming(), |config| {
        config.health.interval_ms = 60_000;
    });
    let stream = harness.create("rtsp://cam-retained");
    harness.relay.controller().stop(&stream.id).await.unwrap();

    harness.relay.monitor().sweep().await;

    assert_eq!(harness.state(&stream.id), StreamState::Closed);
    let published = harness.relay.monitor().last_published(&stream.id).unwrap();
    assert_eq!(published.state, StreamState::Closed);

    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_reports_faults_concurrently() {
    let harness = Harness::start_with(ScriptedEngine::streaming(), |config| {
        config.ingest.stall_timeout_ms = 200;
        config.health.interval_ms = 60_000;
    });
    let streams: Vec<_> = (0..4)
        .map(|n| harness.create(&format!("rtsp://cam-stalled-{n}")))
        .collect();
    for stream in &streams {
        harness.wait_for_state(&stream.id, StreamState::Live).await;
    }

    harness.engine.silence_all();
    harness.boundary.set_close_delay(Duration::from_millis(400));
    tokio::time::sleep(Duration::from_millis(600)).await;

    let started = std::time::Instant::now();
    harness.relay.monitor().sweep().await;
    let elapsed = started.elapsed();

    // One slow producer close per stream; sequential dispatch would take
    // at least four of them.
    assert!(
        elapsed < Duration::from_millis(1_200),
        "sweep took {elapsed:?}"
    );
    for stream in &streams {
        let records = harness.transitions(&stream.id).await;
        assert_valid_path(&records);
        assert!(
            records
                .iter()
                .any(|r| r.to_state == StreamState::Error && r.reason == ReasonCode::StalledSource)
        );
    }
    let metrics = harness.relay.metrics().snapshot();
    assert_eq!(metrics.stream_faults.get("stalled_source"), Some(&4));

    harness.boundary.set_close_delay(Duration::ZERO);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_sweep_feeds_metrics() {
    let harness = Harness::start_with(ScriptedEngine::streaming(), |config| {
        config.health.interval_ms = 60_000;
    });
    let live = harness.create("rtsp://cam-metrics");
    let stopped = harness.create("rtsp://cam-metrics-stopped");
    harness.wait_for_state(&live.id, StreamState::Live).await;
    harness.relay.controller().stop(&stopped.id).await.unwrap();

    let controller = harness.relay.controller();
    controller
        .attach_consumer(&live.id, "viewer-a", json!({}))
        .await
        .unwrap();

    harness.relay.monitor().sweep().await;

    let snapshot = harness.relay.metrics().snapshot();
    assert_eq!(snapshot.streams_by_state.get("LIVE"), Some(&1));
    assert_eq!(snapshot.streams_by_state.get("CLOSED"), Some(&1));
    assert_eq!(snapshot.producers_active, 1);
    assert_eq!(snapshot.ingest_processes, 1);
    assert_eq!(snapshot.consumers_connecting, 1);
    assert_eq!(snapshot.sweeps, 1);
    assert_eq!(snapshot.streams.get(&live.id).map(|g| g.consumers), Some(1));

    let text = live_relay::metrics::PrometheusExporter::new(harness.relay.metrics().clone())
        .export();
    assert!(text.contains("live_relay_streams_by_state{state=\"LIVE\"} 1"));
    assert!(text.contains(&format!(
        "live_relay_active_consumers{{stream_id=\"{}\"}} 1",
        live.id
    )));

    harness.shutdown().await;
}
