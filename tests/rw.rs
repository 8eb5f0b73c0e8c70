//! Write-path tests over an in-process cluster.

mod common;

use common::{admitted, digest, TestCluster, START_MS};
use keystone::cluster::{RecordStore, ReplicaSet};
use keystone::config::{CommitLevel, NamespaceConfig};
use keystone::error::{KeystoneError, ResultCode};
use keystone::observability::metrics;
use keystone::record::{Bin, Particle, Record, RecordMetadata, RequestKey};
use keystone::rw::{Admission, WriteRequest};
use keystone::wire::{InfoFlags, RwMessage, RwOp};

fn namespace(rf: u32) -> NamespaceConfig {
    let mut ns = NamespaceConfig::named("test");
    ns.replication_factor = rf;
    ns
}

fn put(seed: u8, bin: &str, value: i64) -> WriteRequest {
    WriteRequest::new("test", digest(seed)).put(bin, Particle::Integer(value))
}

fn seed(cluster: &TestCluster, seed: u8, generation: u16, value: i64) {
    let mut record = Record::new(RequestKey::new(0, digest(seed)));
    record.meta = RecordMetadata::new(generation, START_MS - 10, 0);
    record.put_bin(Bin::new("a", Particle::Integer(value), 0));
    for node in cluster.nodes() {
        node.store.write(&record).unwrap();
    }
}

// ============================================================================
// Replication
// ============================================================================

#[test]
fn write_replicates_to_every_replica() {
    let cluster = TestCluster::new(3, namespace(3));
    let (_, mut response) = admitted(cluster.write(put(1, "a", 10)));
    assert!(response.try_take().is_none(), "commit-all waits for acks");
    assert_eq!(cluster.master().coordinator.in_flight(), 1);

    // REPL_WRITE to two replicas, then two WRITE_ACKs.
    assert_eq!(cluster.deliver_all(), 4);

    let response = response.expect();
    assert_eq!(response.result, ResultCode::Ok);
    assert_eq!(response.generation, 1);
    assert_eq!(response.last_update_time, START_MS);
    for node in cluster.nodes() {
        let record = node.record(digest(1)).expect("replicated");
        assert_eq!(record.meta.generation, 1);
        assert_eq!(record.value("a"), Some(&Particle::Integer(10)));
        assert_eq!(node.sindex.changes(), 1);
    }
    assert_eq!(cluster.master().coordinator.in_flight(), 0);
}

#[test]
fn generation_check_passes_and_replicas_follow() {
    let cluster = TestCluster::new(3, namespace(3));
    for value in 0..5 {
        admitted(cluster.write(put(2, "a", value)));
        cluster.deliver_all();
    }
    assert_eq!(cluster.master().record(digest(2)).unwrap().meta.generation, 5);

    let (_, mut response) =
        admitted(cluster.write(put(2, "a", 99).expect_generation(5)));
    cluster.deliver_all();
    let response = response.expect();
    assert_eq!(response.result, ResultCode::Ok);
    assert_eq!(response.generation, 6);

    for node in cluster.nodes() {
        let record = node.record(digest(2)).unwrap();
        assert_eq!(record.meta.generation, 6);
        assert_eq!(record.value("a"), Some(&Particle::Integer(99)));
    }
}

#[test]
fn generation_mismatch_sends_nothing() {
    let cluster = TestCluster::new(2, namespace(2));
    admitted(cluster.write(put(3, "a", 1)));
    cluster.deliver_all();

    let (_, mut response) = admitted(cluster.write(put(3, "a", 2).expect_generation(4)));
    assert_eq!(response.expect().result, ResultCode::Generation);
    assert_eq!(cluster.master().transport.pending(), 0);
    assert_eq!(
        cluster.node(2).record(digest(3)).unwrap().value("a"),
        Some(&Particle::Integer(1))
    );
}

#[test]
fn generation_wraps_past_the_top_and_replicas_accept_it() {
    let cluster = TestCluster::new(2, namespace(2));
    seed(&cluster, 20, u16::MAX, 1);

    let (_, mut response) = admitted(cluster.write(put(20, "a", 2)));
    assert_eq!(cluster.deliver_all(), 2);

    let response = response.expect();
    assert_eq!(response.result, ResultCode::Ok);
    assert_eq!(response.generation, 1);
    for node in cluster.nodes() {
        let record = node.record(digest(20)).unwrap();
        assert_eq!(record.meta.generation, 1);
        assert_eq!(record.value("a"), Some(&Particle::Integer(2)));
    }
}

#[test]
fn timed_out_write_leaves_master_copy_unchanged() {
    let cluster = TestCluster::new(2, namespace(2));
    seed(&cluster, 21, 2, 1);

    let (_, mut response) = admitted(cluster.write(put(21, "a", 5)));
    let during = cluster.master().record(digest(21)).unwrap();
    assert_eq!(during.meta.generation, 3);
    cluster.drop_all();
    for step in [100, 200, 400, 800] {
        cluster.tick(step);
        cluster.drop_all();
    }
    assert_eq!(response.expect().result, ResultCode::Timeout);

    let record = cluster.master().record(digest(21)).unwrap();
    assert_eq!(record.meta.generation, 2);
    assert_eq!(record.meta.last_update_time, START_MS - 10);
    assert_eq!(record.value("a"), Some(&Particle::Integer(1)));
    assert_eq!(cluster.master().coordinator.in_flight(), 0);
}

#[test]
fn second_write_ships_a_delta() {
    let cluster = TestCluster::new(2, namespace(2));
    admitted(cluster.write(put(4, "a", 1).put("b", Particle::Integer(2))));
    cluster.deliver_all();

    admitted(cluster.write(put(4, "b", 3)));
    let outbox = cluster.take_outbox(1);
    assert_eq!(outbox.len(), 1);
    let msg = RwMessage::decode(&outbox[0].1).unwrap();
    assert_eq!(msg.op, RwOp::ReplWrite);
    let pickle = keystone::rw::policy::Pickle::decode(msg.record.as_ref().unwrap()).unwrap();
    assert!(!pickle.is_full());
    assert_eq!(pickle.bins.len(), 1);

    cluster.deliver(1, 2, &outbox[0].1);
    cluster.deliver_all();
    let replica = cluster.node(2).record(digest(4)).unwrap();
    assert_eq!(replica.value("a"), Some(&Particle::Integer(1)));
    assert_eq!(replica.value("b"), Some(&Particle::Integer(3)));
}

#[test]
fn commit_master_answers_before_acks() {
    let cluster = TestCluster::new(2, namespace(2));
    let (_, mut response) =
        admitted(cluster.write(put(5, "a", 1).with_commit_level(CommitLevel::Master)));
    assert_eq!(response.expect().result, ResultCode::Ok);
    assert_eq!(cluster.master().coordinator.in_flight(), 1);

    cluster.deliver_all();
    assert_eq!(cluster.master().coordinator.in_flight(), 0);
    assert!(cluster.node(2).record(digest(5)).is_some());
}

// ============================================================================
// Deletes
// ============================================================================

#[test]
fn delete_drops_everywhere_without_acks() {
    let cluster = TestCluster::new(3, namespace(3));
    admitted(cluster.write(put(6, "a", 1)));
    cluster.deliver_all();

    let (_, mut response) =
        admitted(cluster.write(WriteRequest::new("test", digest(6)).delete_record(false)));
    let response = response.expect();
    assert_eq!(response.result, ResultCode::Ok);
    assert_eq!(response.generation, 0);
    assert_eq!(response.last_update_time, 0);
    assert_eq!(cluster.master().coordinator.in_flight(), 0);

    let outbox = cluster.take_outbox(1);
    assert_eq!(outbox.len(), 2);
    for (to, frame) in &outbox {
        let msg = RwMessage::decode(frame).unwrap();
        assert!(msg.info.contains(InfoFlags::NO_REPL_ACK));
        cluster.deliver(1, *to, frame);
    }
    // Replicas do not answer a drop.
    assert_eq!(cluster.deliver_all(), 0);
    for node in cluster.nodes() {
        assert!(node.record(digest(6)).is_none());
        assert_eq!(node.sindex.removals(), 1);
    }
}

#[test]
fn durable_delete_leaves_tombstones() {
    let cluster = TestCluster::new(2, namespace(2));
    admitted(cluster.write(put(7, "a", 1)));
    cluster.deliver_all();

    let (_, mut response) =
        admitted(cluster.write(WriteRequest::new("test", digest(7)).delete_record(true)));
    cluster.deliver_all();
    assert_eq!(response.expect().result, ResultCode::Ok);

    for node in cluster.nodes() {
        let record = node.record(digest(7)).expect("tombstone kept");
        assert!(record.meta.is_tombstone());
        assert!(record.is_empty());
        assert_eq!(record.meta.generation, 2);
    }
}

#[test]
fn deleting_a_missing_record_is_not_found() {
    let cluster = TestCluster::new(2, namespace(2));
    let (_, mut response) =
        admitted(cluster.write(WriteRequest::new("test", digest(8)).delete_record(false)));
    assert_eq!(response.expect().result, ResultCode::NotFound);
    assert_eq!(cluster.master().transport.pending(), 0);
}

// ============================================================================
// Confirmation
// ============================================================================

#[test]
fn confirmed_write_clears_unreplicated_marks() {
    let mut ns = namespace(2);
    ns.confirm_replica_writes = true;
    let cluster = TestCluster::new(2, ns);

    let (_, mut response) = admitted(cluster.write(put(9, "a", 1)));
    assert!(cluster.master().record(digest(9)).unwrap().meta.is_unreplicated());

    let writes = cluster.take_outbox(1);
    assert_eq!(writes.len(), 1);
    cluster.deliver(1, 2, &writes[0].1);
    assert!(cluster.node(2).record(digest(9)).unwrap().meta.is_unreplicated());

    let acks = cluster.take_outbox(2);
    cluster.deliver(2, 1, &acks[0].1);
    assert!(response.try_take().is_none(), "still confirming");

    // REPL_CONFIRM and its reply.
    assert_eq!(cluster.deliver_all(), 2);
    assert_eq!(response.expect().result, ResultCode::Ok);
    for node in cluster.nodes() {
        assert!(!node.record(digest(9)).unwrap().meta.is_unreplicated());
    }
}

// ============================================================================
// Admission
// ============================================================================

#[test]
fn second_write_to_a_busy_key_is_refused() {
    let cluster = TestCluster::new(2, namespace(2));
    let (first, mut response) = admitted(cluster.write(put(10, "a", 1)));

    match cluster.write(put(10, "a", 2)) {
        Admission::AlreadyInFlight { existing } => assert_eq!(existing, first),
        other => panic!("unexpected admission {:?}", other),
    }
    assert_eq!(
        cluster
            .master()
            .metrics
            .registry()
            .counter_get(metrics::RW_ALREADY_IN_FLIGHT_TOTAL),
        1
    );

    // Other keys are independent.
    let (_, mut other) = admitted(cluster.write(put(11, "a", 1)));
    cluster.deliver_all();
    assert_eq!(response.expect().result, ResultCode::Ok);
    assert_eq!(other.expect().result, ResultCode::Ok);

    // The key is free again.
    admitted(cluster.write(put(10, "a", 3)));
}

#[test]
fn insufficient_replicas_is_rejected_up_front() {
    let mut ns = namespace(3);
    ns.required_replicas = 2;
    let cluster = TestCluster::new(3, ns);
    cluster
        .master()
        .partitions
        .set_default(ReplicaSet::new(1, vec![2]));

    let err = cluster
        .master()
        .coordinator
        .write(put(12, "a", 1))
        .unwrap_err();
    assert!(matches!(
        err,
        KeystoneError::InsufficientReplicas {
            available: 1,
            required: 2
        }
    ));
    assert_eq!(err.result_code(), ResultCode::Unavailable);
    assert_eq!(cluster.master().coordinator.in_flight(), 0);
}

#[test]
fn replica_refuses_writes_as_master() {
    let cluster = TestCluster::new(2, namespace(2));
    let err = cluster
        .node(2)
        .coordinator
        .write(put(13, "a", 1))
        .unwrap_err();
    assert!(matches!(err, KeystoneError::NotMaster { .. }));
}

#[test]
fn abandoned_transaction_still_replicates() {
    let cluster = TestCluster::new(2, namespace(2));
    let (id, mut response) = admitted(cluster.write(put(14, "a", 1)));
    let key = keystone::record::RequestKey::new(0, digest(14));
    assert!(cluster.master().coordinator.abandon(&key, id));

    cluster.deliver_all();
    assert!(response.try_take().is_none());
    assert_eq!(cluster.master().coordinator.in_flight(), 0);
    assert!(cluster.node(2).record(digest(14)).is_some());
}

// ============================================================================
// Ping
// ============================================================================

#[test]
fn ping_checks_replica_regimes() {
    let cluster = TestCluster::new(3, namespace(3));
    let (_, mut response) = admitted(cluster.master().coordinator.ping("test", digest(15)).unwrap());
    cluster.deliver_all();
    assert_eq!(response.expect().result, ResultCode::Ok);

    cluster.node(3).partitions.bump_regime();
    let (_, mut response) = admitted(cluster.master().coordinator.ping("test", digest(15)).unwrap());
    cluster.deliver_all();
    assert_eq!(response.expect().result, ResultCode::ClusterKeyMismatch);
}
