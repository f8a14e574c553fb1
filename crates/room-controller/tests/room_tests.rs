//! Coordinator driving real session controllers through `LocalCluster`.
//!
//! All workers share one `MockEngine`, so `engine.connection(n)` counts
//! connections across the whole room in creation order.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::signaling::{SignalingMessage, SignalingStream};
use common::types::{PublisherId, SubscriberId, WorkerId};
use room_controller::{Config, Coordinator, CoordinatorHandle, RoomError, RoomEvent, SubscribeOptions};
use session_controller::engine::{ConnectionState, EngineEvent};
use session_controller::LocalCluster;
use sfu_test_utils::*;

fn pid(id: &str) -> PublisherId {
    PublisherId::from(id)
}

fn sid(id: &str) -> SubscriberId {
    SubscriberId::from(id)
}

fn room(engine: &MockEngine, keepalive_interval: Duration) -> (CoordinatorHandle, Arc<LocalCluster>) {
    init_test_tracing();
    let cluster = Arc::new(LocalCluster::new(
        test_worker_config(),
        engine.as_engine(),
        None,
    ));
    let config = Config {
        room_id: "room-e2e".to_string(),
        keepalive_interval,
    };
    let (coordinator, _task) =
        Coordinator::spawn(config, cluster.clone(), cluster.clone());
    (coordinator, cluster)
}

async fn next(stream: &mut SignalingStream) -> SignalingMessage {
    tokio::time::timeout(Duration::from_secs(1), stream.recv())
        .await
        .expect("timed out waiting for signaling message")
        .expect("signaling stream closed")
}

async fn worker_of(coordinator: &CoordinatorHandle, publisher_id: &str) -> Option<WorkerId> {
    coordinator
        .get_state()
        .await
        .unwrap()
        .worker_of(&pid(publisher_id))
        .cloned()
}

#[tokio::test]
async fn test_new_publisher_negotiates_on_fresh_worker() {
    let engine = MockEngine::new();
    let (coordinator, cluster) = room(&engine, Duration::from_secs(3600));

    let mut stream = coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();
    assert_eq!(next(&mut stream).await, SignalingMessage::Initializing);

    engine.connection(0).negotiate("answer-sdp", candidate(1));

    assert_eq!(next(&mut stream).await, SignalingMessage::Started);
    assert_eq!(
        next(&mut stream).await,
        SignalingMessage::Answer {
            sdp: "answer-sdp".to_string()
        }
    );
    assert_eq!(next(&mut stream).await, candidate_message(1));

    let worker_id = worker_of(&coordinator, "p1").await.unwrap();
    assert_eq!(cluster.running_workers().await, vec![worker_id]);
}

#[tokio::test]
async fn test_each_publisher_gets_its_own_worker() {
    let engine = MockEngine::new();
    let (coordinator, cluster) = room(&engine, Duration::from_secs(3600));

    coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();
    coordinator.add_publisher(pid("p2")).await.unwrap().unwrap();

    let first = worker_of(&coordinator, "p1").await.unwrap();
    let second = worker_of(&coordinator, "p2").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(cluster.running_workers().await.len(), 2);
}

#[tokio::test]
async fn test_subscriber_receives_keyframe_once_both_ready() {
    let engine = MockEngine::new();
    let (coordinator, _cluster) = room(&engine, Duration::from_secs(3600));

    coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();
    let mut subscriber = coordinator
        .add_subscriber(sid("s1"), pid("p1"), SubscribeOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next(&mut subscriber).await, SignalingMessage::Initializing);

    engine.connection(1).negotiate("sub-answer", candidate(2));
    assert_eq!(next(&mut subscriber).await, SignalingMessage::Started);
    assert_eq!(engine.fan_out("p1").fir_count(), 0);

    engine
        .connection(0)
        .emit(EngineEvent::State(ConnectionState::Ready));
    eventually(|| engine.fan_out("p1").fir_count() == 1).await;
    assert_eq!(engine.fan_out("p1").subscribers(), vec![sid("s1")]);
}

#[tokio::test]
async fn test_subscriber_signaling_reaches_subscriber_connection() {
    let engine = MockEngine::new();
    let (coordinator, _cluster) = room(&engine, Duration::from_secs(3600));

    coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();
    // Issued back to back: the worker must know s1 before the candidate.
    let (added, sent) = tokio::join!(
        coordinator.add_subscriber(sid("s1"), pid("p1"), SubscribeOptions::default()),
        async {
            tokio::task::yield_now().await;
            coordinator
                .process_signaling(pid("p1"), Some(sid("s1")), candidate_message(5))
                .await
        }
    );
    assert!(added.unwrap().is_some());
    sent.unwrap();

    eventually(|| engine.connection(1).remote_candidates() == vec![candidate(5)]).await;
    assert!(engine.connection(0).remote_candidates().is_empty());
}

#[tokio::test]
async fn test_moved_publisher_replays_candidates_and_routes_to_new_worker() {
    let engine = MockEngine::new();
    let (coordinator, cluster) = room(&engine, Duration::from_secs(3600));

    let mut original = coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();
    assert_eq!(next(&mut original).await, SignalingMessage::Initializing);
    let old_connection = engine.connection(0);
    old_connection.set_local_srtp(test_srtp_session());

    let sdp = test_sdp("client-offer");
    coordinator
        .process_signaling(pid("p1"), None, offer(&sdp))
        .await
        .unwrap();
    for n in [1, 2] {
        coordinator
            .process_signaling(pid("p1"), None, candidate_message(n))
            .await
            .unwrap();
    }
    eventually(|| old_connection.remote_candidates().len() == 2).await;
    let old_worker = worker_of(&coordinator, "p1").await.unwrap();

    let mut moved = coordinator.move_publisher(pid("p1")).await.unwrap().unwrap();
    assert_eq!(next(&mut moved).await, SignalingMessage::Initializing);

    let new_worker = worker_of(&coordinator, "p1").await.unwrap();
    assert_ne!(new_worker, old_worker);

    let new_connection = engine.connection(1);
    assert_eq!(new_connection.remote_sdps(), vec![sdp]);
    assert_eq!(new_connection.applied_srtp(), vec![test_srtp_session()]);
    assert!(new_connection.remote_candidates().is_empty());

    new_connection.emit(EngineEvent::State(ConnectionState::Initial));
    new_connection.emit(EngineEvent::SdpReady("restored-answer".to_string()));
    new_connection.emit(EngineEvent::Candidate(candidate(9)));

    assert_eq!(next(&mut moved).await, SignalingMessage::Started);
    assert_eq!(next(&mut moved).await, candidate_message(9));
    assert_eq!(
        new_connection.remote_candidates(),
        vec![candidate(1), candidate(2)]
    );

    new_connection.emit(EngineEvent::Candidate(candidate(10)));
    assert_eq!(next(&mut moved).await, candidate_message(10));

    coordinator
        .process_signaling(pid("p1"), Some(sid("late-peer")), candidate_message(3))
        .await
        .unwrap();
    eventually(|| new_connection.remote_candidates().len() == 3).await;
    assert_eq!(
        new_connection.remote_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );
    assert_eq!(old_connection.remote_candidates().len(), 2);

    // The old worker keeps running until its own publisher goes away.
    assert!(cluster.running_workers().await.contains(&old_worker));
}

#[tokio::test]
async fn test_external_output_attached_to_publisher_fan_out() {
    let engine = MockEngine::new();
    let (coordinator, _cluster) = room(&engine, Duration::from_secs(3600));
    coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();

    coordinator
        .add_external_output(pid("p1"), "file:///rec/p1.mkv".to_string())
        .await
        .unwrap();
    eventually(|| engine.fan_out("p1").outputs() == vec!["file:///rec/p1.mkv".to_string()]).await;

    coordinator
        .remove_external_output("file:///rec/p1.mkv".to_string())
        .await
        .unwrap();
    eventually(|| engine.fan_out("p1").outputs().is_empty()).await;

    let again = coordinator
        .remove_external_output("file:///rec/p1.mkv".to_string())
        .await;
    assert!(matches!(again, Err(RoomError::NotRecorded)));
}

#[tokio::test]
async fn test_external_input_status_relayed() {
    let engine = MockEngine::new().with_input_init_code(-3);
    let (coordinator, _cluster) = room(&engine, Duration::from_secs(3600));

    let status = coordinator
        .add_external_input(pid("cam"), "rtsp://camera/1".to_string())
        .await
        .unwrap()
        .unwrap();

    assert!(!status.is_success());
    assert_eq!(status, common::signaling::InitStatus::Failed { code: -3 });
    assert!(worker_of(&coordinator, "cam").await.is_some());
}

#[tokio::test]
async fn test_removed_publisher_lets_worker_exit() {
    let engine = MockEngine::new();
    let (coordinator, cluster) = room(&engine, Duration::from_secs(3600));
    coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();
    let worker_id = worker_of(&coordinator, "p1").await.unwrap();

    coordinator.remove_publisher(pid("p1")).await.unwrap();

    let handle = cluster.worker(&worker_id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle.cancelled())
        .await
        .unwrap();
    assert!(cluster.running_workers().await.is_empty());
    assert!(coordinator.get_state().await.unwrap().publishers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dead_worker_unpublished_to_listeners_in_order() {
    let engine = MockEngine::new();
    let (coordinator, cluster) = room(&engine, Duration::from_secs(1));

    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let seen = Arc::clone(&seen);
        coordinator
            .add_event_listener(move |event_type, event| {
                seen.lock()
                    .unwrap()
                    .push((name, event_type.to_string(), event.clone()));
            })
            .await
            .unwrap();
    }

    coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();
    coordinator.add_publisher(pid("p2")).await.unwrap().unwrap();
    let dead = worker_of(&coordinator, "p1").await.unwrap();
    let alive = worker_of(&coordinator, "p2").await.unwrap();

    cluster.worker(&dead).await.unwrap().cancel();

    eventually(|| seen.lock().unwrap().len() == 2).await;
    let event = RoomEvent::Unpublish {
        worker_id: dead.clone(),
    };
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("first", "unpublish".to_string(), event.clone()),
            ("second", "unpublish".to_string(), event),
        ]
    );

    wait_until_deleted(&cluster, &dead).await;
    assert_eq!(cluster.running_workers().await, vec![alive.clone()]);

    let state = coordinator.get_state().await.unwrap();
    assert_eq!(state.worker_of(&pid("p1")), None);
    assert_eq!(state.worker_of(&pid("p2")), Some(&alive));

    // Further rounds leave the healthy worker alone.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(seen.lock().unwrap().len(), 2);
}

/// Wait until the cluster forgot `worker_id`.
async fn wait_until_deleted(cluster: &LocalCluster, worker_id: &WorkerId) {
    for _ in 0..400 {
        if cluster.worker(worker_id).await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(
        cluster.worker(worker_id).await.is_none(),
        "worker {worker_id} was never deleted"
    );
}
