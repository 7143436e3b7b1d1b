//! Raft consensus
//!
//! A replica is a single actor task that owns the `RaftContext` and the
//! active `State`. Inbound requests, outbound responses and timers are all
//! delivered to that task as events, so context mutation is never concurrent.

use std::time::Duration;

use rand::Rng;

pub mod cluster;
pub mod context;
pub mod log;
pub mod node;
pub mod proposal;
pub mod protocol;
mod segment;
pub mod state;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod cluster_test;

pub use cluster::{Member, MemberId, MemberRole, Membership};
pub use context::RaftContext;
pub use log::{Entry, EntryKind, HardState, LogStore, MemoryLog};
pub use node::{Node, NodeHandle, NodeStatus, TransitionHandler};
pub use protocol::{Consistency, Request, RequestKind, Response, Status};
pub use state::StateType;
pub use storage::FileLog;
pub use transport::{LocalNetwork, LocalTransport, RequestHandler, Transport};

// Constants
const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(150);
const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(300);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
const RPC_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_ENTRIES_PER_APPEND: usize = 100;
#[cfg(feature = "slog-term")]
const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer

/// The replicated state machine driven by committed USER entries.
pub trait StateMachine: Send + 'static {
    /// Applies the command committed at `index` and returns its result.
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8>;

    /// Answers a read-only query against the applied state.
    fn query(&self, query: &[u8]) -> Vec<u8>;
}

/// Node identity, seed membership and timing.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Id of the local member.
    pub id: MemberId,
    /// Address other members use to reach the local member.
    pub address: String,
    /// Membership the cluster starts from. A node absent from it, or listed
    /// as passive, starts as a passive member and asks to join.
    pub members: Vec<Member>,
    /// Election timeouts are drawn uniformly from `[min, max]`.
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Interval between leader heartbeats (must be << election timeout).
    pub heartbeat_interval: Duration,
    /// Deadline for any outbound request.
    pub rpc_timeout: Duration,
    pub max_entries_per_append: usize,
}

impl RaftConfig {
    pub fn new(id: MemberId, address: impl Into<String>, members: Vec<Member>) -> Self {
        RaftConfig {
            id,
            address: address.into(),
            members,
            election_timeout_min: ELECTION_TIMEOUT_MIN,
            election_timeout_max: ELECTION_TIMEOUT_MAX,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            rpc_timeout: RPC_TIMEOUT,
            max_entries_per_append: MAX_ENTRIES_PER_APPEND,
        }
    }

    /// Returns a randomized election timeout.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = (self.election_timeout_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// The local member as it would appear in a membership.
    pub fn local_member(&self) -> Member {
        self.members
            .iter()
            .find(|m| m.id() == self.id)
            .cloned()
            .unwrap_or_else(|| Member::passive(self.id, self.address.clone()))
    }
}

/// Builds the terminal logger used by the node process.
#[cfg(feature = "slog-term")]
pub fn default_logger() -> slog::Logger {
    use slog::Drain;

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}
