use std::sync::Arc;
use std::time::Duration;

use flotilla::coordinator::Coordinator;
use flotilla::directory::ConnectionPurpose;
use flotilla::directory::ChannelHandle;
use flotilla::election::{ElectionListener, EngineRegistry};
use flotilla::envelope::{ElectionAction, Envelope, WireMessage};


use test_harness::{assert_eventually, test_config, RecordingDirectory, TestCluster};

fn coordinator_with_recording(
    node_id: u64,
    peers: &[u64],
) -> (Arc<Coordinator>, Arc<RecordingDirectory>) {
    let directory = Arc::new(RecordingDirectory::new());
    let coordinator = Coordinator::new(
        test_config(node_id, peers),
        directory.clone(),
        EngineRegistry::with_builtins(),
    );
    (coordinator, directory)
}

#[tokio::test]
async fn append_entry_advances_log_indexes() {
    let (coordinator, _directory) = coordinator_with_recording(1, &[2, 3]);

    assert_eq!(coordinator.log_index(), 0);
    assert_eq!(coordinator.append_entry("first"), 1);
    assert_eq!(coordinator.append_entry("second"), 2);
    assert_eq!(coordinator.append_entry("third"), 3);

    assert_eq!(coordinator.log_index(), 3);
    assert_eq!(coordinator.prev_log_index(), 2);
    assert_eq!(coordinator.log_entry(2).as_deref(), Some("second"));
    assert_eq!(coordinator.log_entry(9), None);

    // Appending lazily created the election session.
    assert!(coordinator.has_session());
    assert_eq!(coordinator.election_cycle(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_session_creation_yields_one_session() {
    let (coordinator, _directory) = coordinator_with_recording(1, &[2, 3]);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.ensure_election_session().map(|_| ())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(coordinator.has_session());
    assert_eq!(coordinator.election_cycle(), 1);
}

#[tokio::test]
async fn conclusion_updates_leader_only_on_success() {
    let (coordinator, _directory) = coordinator_with_recording(1, &[2, 3]);
    coordinator.start().unwrap();
    assert_eq!(coordinator.query_leader(), None);

    coordinator.conclude_election(true, Some(2));
    assert_eq!(coordinator.query_leader(), Some(2));
    assert!(!coordinator.has_session());

    // A failed cycle releases the session but leaves the leader alone.
    coordinator.start().unwrap();
    coordinator.conclude_election(false, Some(9));
    assert_eq!(coordinator.query_leader(), Some(2));
    assert!(!coordinator.has_session());
    assert_eq!(coordinator.election_cycle(), 2);
}

#[tokio::test]
async fn leader_health_burns_discovery_budget_before_escalating() {
    let directory = Arc::new(RecordingDirectory::new());
    let mut config = test_config(1, &[2, 3]);
    config.discovery_retry_budget = 2;
    let coordinator = Coordinator::new(config, directory.clone(), EngineRegistry::with_builtins());

    assert!(!coordinator.assess_leader_health());
    assert_eq!(directory.broadcast_count(), 1);
    assert!(!coordinator.assess_leader_health());
    assert_eq!(directory.broadcast_count(), 2);
    for envelope in directory.broadcasts.lock().iter() {
        assert_eq!(envelope.action(), Some(ElectionAction::WhoIsLeader));
    }

    // Budget exhausted; the leader is presumed dead and no query goes out.
    assert!(coordinator.assess_leader_health());
    assert_eq!(directory.broadcast_count(), 2);

    // Learning a leader refills the budget.
    coordinator.conclude_election(true, Some(3));
    assert!(!coordinator.assess_leader_health());
    assert_eq!(directory.broadcast_count(), 3);
}

#[tokio::test]
async fn leader_query_is_declined_silently_when_leader_unknown() {
    let (coordinator, directory) = coordinator_with_recording(1, &[2, 3]);
    let (handle, mut rx) = ChannelHandle::new(8);
    directory.register(3, ConnectionPurpose::Management, handle);

    let query = Envelope::who_is_leader(3);
    coordinator.handle_envelope(&query);
    assert!(rx.try_recv().is_err());
    // Discovery queries never reach the engine.
    assert!(!coordinator.has_session());

    coordinator.conclude_election(true, Some(2));
    coordinator.handle_envelope(&query);
    let Ok(WireMessage::Management(reply)) = rx.try_recv() else {
        panic!("expected a leader response");
    };
    assert_eq!(reply.header.originator, 1);
    assert_eq!(reply.action(), Some(ElectionAction::LeaderIs));
    assert_eq!(reply.election.unwrap().leader, Some(2));
}

#[tokio::test]
async fn peer_learns_leader_through_discovery() {
    let cluster = TestCluster::new(3);
    cluster.node(1).coordinator.conclude_election(true, Some(2));

    // Node 3's health check broadcasts a WhoIsLeader round; node 1 answers.
    assert!(!cluster.node(3).coordinator.assess_leader_health());
    assert_eventually("node 3 to learn the leader", Duration::from_secs(2), || {
        cluster.node(3).coordinator.query_leader() == Some(2)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_elects_a_single_leader() {
    let cluster = TestCluster::new(3);
    cluster.start_all();

    assert_eventually(
        "all nodes to agree on a leader",
        Duration::from_secs(5),
        || {
            let leaders: Vec<_> = cluster
                .nodes
                .iter()
                .map(|n| n.coordinator.query_leader())
                .collect();
            leaders[0].is_some() && leaders.iter().all(|l| *l == leaders[0])
        },
    )
    .await;
}

#[tokio::test]
async fn unknown_election_impl_disables_election_paths() {
    let directory = Arc::new(RecordingDirectory::new());
    let mut config = test_config(1, &[2]);
    config.election_impl = "zab".to_string();
    let coordinator = Coordinator::new(config, directory, EngineRegistry::with_builtins());

    assert!(coordinator.start().is_err());

    // Engine-bound envelopes are dropped without panicking.
    coordinator.handle_envelope(&Envelope::heartbeat(2));
    assert!(!coordinator.has_session());
    assert_eq!(coordinator.election_cycle(), 0);
}
