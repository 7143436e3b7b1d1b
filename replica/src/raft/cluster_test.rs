//! Multi-node scenarios over an in-process network.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{o, Discard, Logger};
use tokio::time::{sleep, Instant};

use crate::error::{RaftError, Result};
use crate::raft::context::tests::Recorder;
use crate::raft::{
    Consistency, FileLog, LocalNetwork, LogStore, Member, MemberId, MemoryLog, Node, NodeHandle,
    RaftConfig, StateType,
};

const WAIT: Duration = Duration::from_secs(10);

fn logger() -> Logger {
    Logger::root(Discard, o!())
}

fn config(id: MemberId, seeds: &[MemberId]) -> RaftConfig {
    let members = seeds
        .iter()
        .map(|i| Member::active(*i, format!("n{}", i)))
        .collect();
    let mut config = RaftConfig::new(id, format!("n{}", id), members);
    config.rpc_timeout = Duration::from_secs(1);
    config
}

fn applied_count(output: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&output[..8]);
    u64::from_le_bytes(bytes)
}

struct Cluster {
    network: LocalNetwork,
    seeds: Vec<MemberId>,
    nodes: Vec<Node>,
}

impl Cluster {
    async fn start(size: u64) -> Cluster {
        let seeds: Vec<MemberId> = (1..=size).collect();
        let mut cluster = Cluster {
            network: LocalNetwork::new(),
            seeds: seeds.clone(),
            nodes: Vec::new(),
        };
        for id in seeds {
            cluster.add(id).await;
        }
        cluster
    }

    /// Starts member `id` with the cluster's seed membership.
    async fn add(&mut self, id: MemberId) {
        let node = Node::start(
            config(id, &self.seeds),
            Box::new(MemoryLog::new()),
            Box::<Recorder>::default(),
            Arc::new(self.network.transport(id)),
            &logger(),
            None,
        )
        .await
        .unwrap();
        self.nodes.push(node);
    }

    fn handle(&self, id: MemberId) -> NodeHandle {
        self.nodes
            .iter()
            .find(|n| n.id() == id)
            .map(Node::handle)
            .unwrap()
    }

    /// Waits until a leader is elected among `ids` and all of them follow it.
    async fn leader_of(&self, ids: &[MemberId]) -> NodeHandle {
        let deadline = Instant::now() + WAIT;
        loop {
            let statuses: Vec<_> = ids.iter().map(|id| self.handle(*id).status()).collect();
            if let Some(leader) = statuses.iter().find(|s| s.is_leader()) {
                if statuses
                    .iter()
                    .all(|s| s.term == leader.term && s.leader == Some(leader.id))
                {
                    return self.handle(leader.id);
                }
            }
            assert!(Instant::now() < deadline, "no stable leader: {:?}", statuses);
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn leader(&self) -> NodeHandle {
        let ids: Vec<MemberId> = self.nodes.iter().map(Node::id).collect();
        self.leader_of(&ids).await
    }

    async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await.unwrap();
        }
    }
}

/// Retries `f` while it fails with a retryable error.
async fn retry<T, F, Fut>(f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let deadline = Instant::now() + WAIT;
    loop {
        match f().await {
            Err(e) if e.is_retryable() && Instant::now() < deadline => {
                sleep(Duration::from_millis(50)).await
            }
            result => return result,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_elects_one_leader() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;
    let status = leader.status();
    assert!(status.term >= 1);

    let leaders = cluster
        .nodes
        .iter()
        .filter(|n| n.handle().status().is_leader())
        .count();
    assert_eq!(leaders, 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commands_replicate_to_all() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;

    for i in 0..5u8 {
        assert_eq!(leader.command(vec![i]).await.unwrap(), vec![i]);
    }
    let commit = leader.status().commit_index;
    for node in &cluster.nodes {
        node.handle()
            .wait_for(WAIT, |s| s.last_applied >= commit)
            .await
            .unwrap();
    }

    let output = leader.query(vec![], Consistency::Linearizable).await.unwrap();
    assert_eq!(applied_count(&output), 5);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_followers_forward_to_leader() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;
    let follower = cluster
        .nodes
        .iter()
        .map(Node::handle)
        .find(|h| h.id() != leader.id())
        .unwrap();

    assert_eq!(follower.command(b"fwd".to_vec()).await.unwrap(), b"fwd".to_vec());
    let output = follower.query(vec![], Consistency::Weak).await.unwrap();
    assert_eq!(applied_count(&output), 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partitioned_leader_steps_down() {
    let cluster = Cluster::start(3).await;
    let old = cluster.leader().await;
    old.command(b"before".to_vec()).await.unwrap();
    let old_term = old.status().term;

    cluster.network.partition(old.id());
    let rest: Vec<MemberId> = cluster
        .nodes
        .iter()
        .map(Node::id)
        .filter(|id| *id != old.id())
        .collect();
    let new = cluster.leader_of(&rest).await;
    assert!(new.status().term > old_term);

    // The isolated leader cannot commit anything.
    let lost = tokio::time::timeout(Duration::from_millis(500), old.command(b"lost".to_vec())).await;
    assert!(!matches!(lost, Ok(Ok(_))));
    new.command(b"after".to_vec()).await.unwrap();

    cluster.network.heal(old.id());
    let commit = new.status().commit_index;
    let status = old
        .wait_for(WAIT, |s| !s.is_leader() && s.last_applied >= commit)
        .await
        .unwrap();
    assert_eq!(status.leader, Some(new.id()));

    let output = new.query(vec![], Consistency::Linearizable).await.unwrap();
    assert_eq!(applied_count(&output), 2);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_passive_joins_and_is_promoted() {
    let mut cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;
    leader.command(b"x".to_vec()).await.unwrap();

    cluster.add(4).await;
    let joiner = cluster.handle(4);
    let status = joiner
        .wait_for(WAIT, |s| s.members.iter().any(|m| m.id() == 4))
        .await
        .unwrap();
    assert_eq!(status.state, StateType::Passive);

    let leader = cluster.leader_of(&[1, 2, 3]).await;
    let response = retry(|| leader.promote(4)).await.unwrap();
    assert!(response.members().iter().any(|m| m.id() == 4 && m.is_active()));

    let status = joiner
        .wait_for(WAIT, |s| s.state.is_active())
        .await
        .unwrap();
    assert!(status.last_applied >= 2);
    cluster.leader().await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_member_becomes_passive() {
    let cluster = Cluster::start(3).await;
    let leader = cluster.leader().await;
    let removed = cluster
        .nodes
        .iter()
        .map(Node::id)
        .find(|id| *id != leader.id())
        .unwrap();

    let response = retry(|| leader.leave(removed)).await.unwrap();
    assert!(response.members().iter().all(|m| m.id() != removed));

    let status = cluster
        .handle(removed)
        .wait_for(WAIT, |s| s.state == StateType::Passive)
        .await
        .unwrap();
    assert!(status.members.iter().all(|m| m.id() != removed));

    // Leaving twice is a no-op.
    leader.leave(removed).await.unwrap();
    leader.command(b"y".to_vec()).await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transitions_are_reported() {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let recorded = transitions.clone();
    let network = LocalNetwork::new();
    let node = Node::start(
        config(1, &[1]),
        Box::new(MemoryLog::new()),
        Box::<Recorder>::default(),
        Arc::new(network.transport(1)),
        &logger(),
        Some(Box::new(move |from, to| {
            recorded.lock().unwrap().push((from, to))
        })),
    )
    .await
    .unwrap();

    node.handle()
        .wait_for(WAIT, |s| s.is_leader())
        .await
        .unwrap();
    assert_eq!(
        transitions.lock().unwrap()[..3],
        [
            (StateType::Start, StateType::Follower),
            (StateType::Follower, StateType::Candidate),
            (StateType::Candidate, StateType::Leader),
        ]
    );
    node.shutdown().await.unwrap();
}

async fn start_on_disk(path: &std::path::Path, network: &LocalNetwork) -> Result<Node> {
    let log: Box<dyn LogStore> = Box::new(FileLog::open(path)?);
    Node::start(
        config(1, &[1]),
        log,
        Box::<Recorder>::default(),
        Arc::new(network.transport(1)),
        &logger(),
        None,
    )
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_restores_log() {
    let dir = tempfile::tempdir().unwrap();
    let network = LocalNetwork::new();

    let node = start_on_disk(dir.path(), &network).await.unwrap();
    let handle = node.handle();
    handle.wait_for(WAIT, |s| s.is_leader()).await.unwrap();
    handle.command(b"a".to_vec()).await.unwrap();
    handle.command(b"b".to_vec()).await.unwrap();
    let before = handle.status();
    node.shutdown().await.unwrap();
    assert_eq!(
        handle.command(b"c".to_vec()).await,
        Err(RaftError::Shutdown)
    );

    let node = start_on_disk(dir.path(), &network).await.unwrap();
    let handle = node.handle();
    let status = handle
        .wait_for(WAIT, |s| s.is_leader() && s.last_applied > before.commit_index)
        .await
        .unwrap();
    assert!(status.term > before.term);

    // Both commands were applied again, each exactly once.
    let output = handle.query(vec![], Consistency::Linearizable).await.unwrap();
    assert_eq!(applied_count(&output), 2);
    node.shutdown().await.unwrap();
}
