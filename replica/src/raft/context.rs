//! Replica context
//!
//! Everything a state needs that outlives the state itself: persistent term
//! and vote, the log, the state machine, the applied membership, timers and
//! the outbound side of the transport. The context is owned by the node's
//! actor task and is only ever touched from there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, info, warn, Logger};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{RaftError, Result};
use crate::raft::cluster::{Member, MemberId, Membership};
use crate::raft::log::{EntryKind, HardState, LogStore};
use crate::raft::proposal::Responder;
use crate::raft::protocol::{AppendRequest, AppendResponse, Request, RequestKind, Response};
use crate::raft::transport::Transport;
use crate::raft::{RaftConfig, StateMachine};

/// Input of the node's actor loop.
pub enum Event {
    /// An inbound request.
    Request {
        request: Request,
        responder: Responder,
    },
    /// The outcome of a request this replica sent.
    Reply {
        epoch: u64,
        from: MemberId,
        kind: RequestKind,
        tag: u64,
        result: Result<Response>,
    },
    Timer {
        epoch: u64,
        timer: Timer,
        seq: u64,
    },
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    Election,
    Heartbeat,
    Join,
}

/// An entry handed to the state machine (or to the membership).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub index: u64,
    pub kind: EntryKind,
    pub output: Vec<u8>,
}

pub struct RaftContext {
    config: RaftConfig,
    term: u64,
    voted_for: Option<MemberId>,
    leader: Option<MemberId>,
    commit_index: u64,
    last_applied: u64,
    membership: Membership,
    // Set once the local member shows up in an applied membership.
    was_member: bool,
    log: Box<dyn LogStore>,
    state_machine: Box<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<Event>,
    // Bumped on every transition; replies and timers from older epochs are dropped.
    epoch: u64,
    timer_seq: u64,
    timers: HashMap<Timer, (u64, JoinHandle<()>)>,
    logger: Logger,
}

impl RaftContext {
    pub(crate) fn new(
        config: RaftConfig,
        log: Box<dyn LogStore>,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<Event>,
        logger: Logger,
    ) -> Self {
        let membership = Membership::new(config.members.clone());
        let was_member = membership.contains(config.id);
        RaftContext {
            config,
            term: 0,
            voted_for: None,
            leader: None,
            commit_index: 0,
            last_applied: 0,
            membership,
            was_member,
            log,
            state_machine,
            transport,
            events,
            epoch: 0,
            timer_seq: 0,
            timers: HashMap::new(),
            logger,
        }
    }

    pub fn id(&self) -> MemberId {
        self.config.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn voted_for(&self) -> Option<MemberId> {
        self.voted_for
    }

    pub fn leader(&self) -> Option<MemberId> {
        self.leader
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn was_member(&self) -> bool {
        self.was_member
    }

    pub fn log(&self) -> &dyn LogStore {
        self.log.as_ref()
    }

    pub fn log_mut(&mut self) -> &mut dyn LogStore {
        self.log.as_mut()
    }

    pub fn state_machine(&self) -> &dyn StateMachine {
        self.state_machine.as_ref()
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    /// The local member as currently known to the cluster.
    pub fn local_member(&self) -> Member {
        self.membership
            .get(self.id())
            .cloned()
            .unwrap_or_else(|| self.config.local_member())
    }

    pub fn leader_member(&self) -> Option<Member> {
        self.leader.and_then(|id| self.membership.get(id).cloned())
    }

    /// The error returned to clients that reached a non-leader.
    pub fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader: self.leader,
            address: self.leader_member().map(|m| m.address().clone()),
        }
    }

    /// Loads term, vote and commit index from the log store.
    pub fn restore(&mut self) -> Result<()> {
        let hard_state = self.log.hard_state()?;
        self.term = hard_state.term;
        self.voted_for = hard_state.voted_for;
        self.commit_index = hard_state.commit_index.min(self.log.last_index());
        info!(self.logger, "Restored state";
            "term" => self.term,
            "voted_for" => ?self.voted_for,
            "commit_index" => self.commit_index,
            "last_index" => self.log.last_index());
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        self.log.save_hard_state(HardState {
            term: self.term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
        })
    }

    /// Moves to a newer `term`, forgetting the vote and the leader.
    /// Older or equal terms are ignored.
    pub fn set_term(&mut self, term: u64) -> Result<()> {
        if term > self.term {
            info!(self.logger, "Advancing term"; "from" => self.term, "to" => term);
            self.term = term;
            self.voted_for = None;
            self.leader = None;
            self.persist()?;
        }
        Ok(())
    }

    pub fn set_voted_for(&mut self, candidate: Option<MemberId>) -> Result<()> {
        if self.voted_for != candidate {
            self.voted_for = candidate;
            self.persist()?;
        }
        Ok(())
    }

    pub fn set_leader(&mut self, leader: Option<MemberId>) {
        if self.leader != leader {
            info!(self.logger, "Leader changed"; "leader" => ?leader, "term" => self.term);
            self.leader = leader;
        }
    }

    /// Advances the commit index to `index` (bounded by the last log index)
    /// and applies everything newly committed.
    pub fn commit(&mut self, index: u64) -> Result<Vec<Applied>> {
        let index = index.min(self.log.last_index());
        if index > self.commit_index {
            debug!(self.logger, "Committed"; "index" => index);
            self.commit_index = index;
            self.persist()?;
        }
        self.apply_committed()
    }

    /// Applies committed entries in index order, each exactly once.
    pub fn apply_committed(&mut self) -> Result<Vec<Applied>> {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.get(index)?.ok_or_else(|| {
                RaftError::Storage(format!("committed entry {} is missing", index))
            })?;
            let output = match entry.kind() {
                EntryKind::User => self.state_machine.apply(index, entry.payload()),
                EntryKind::Config => {
                    self.apply_membership(entry.membership()?);
                    Vec::new()
                }
            };
            self.last_applied = index;
            applied.push(Applied {
                index,
                kind: entry.kind(),
                output,
            });
        }
        Ok(applied)
    }

    fn apply_membership(&mut self, membership: Membership) {
        if membership.contains(self.id()) {
            self.was_member = true;
        }
        info!(self.logger, "Applied membership";
            "active" => ?membership.active_ids(),
            "members" => membership.len());
        self.membership = membership;
    }

    /// Whether a log ending at (`last_index`, `last_term`) is at least as up
    /// to date as the local log.
    pub fn is_log_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let local_term = self.last_log_term();
        last_term > local_term || (last_term == local_term && last_index >= self.last_log_index())
    }

    /// Whether the local member would grant a vote to `candidate` for `term`.
    pub fn would_vote(
        &self,
        term: u64,
        candidate: MemberId,
        last_index: u64,
        last_term: u64,
    ) -> bool {
        if term < self.term {
            return false;
        }
        if term == self.term && self.voted_for.map_or(false, |v| v != candidate) {
            return false;
        }
        self.is_log_up_to_date(last_index, last_term)
    }

    fn append_response(&self, succeeded: bool, last_log_index: u64) -> AppendResponse {
        AppendResponse::builder()
            .term(self.term)
            .succeeded(succeeded)
            .last_log_index(last_log_index)
            .build()
    }

    /// Rejects an append without looking at it.
    pub fn reject_append(&self) -> AppendResponse {
        self.append_response(false, self.last_log_index())
    }

    /// Matches `request` against the local log, appends its new entries and
    /// advances the commit index. The caller has already recognised the
    /// sender as leader of the current term.
    pub fn accept_append(&mut self, request: &AppendRequest) -> Result<AppendResponse> {
        if request.term() < self.term {
            return Ok(self.reject_append());
        }

        let prev = request.prev_log_index();
        match self.log.term(prev)? {
            Some(term) if term == request.prev_log_term() => {}
            Some(_) => {
                debug!(self.logger, "Append conflicts at previous entry"; "prev" => prev);
                return Ok(self.append_response(false, prev.saturating_sub(1)));
            }
            None => {
                debug!(self.logger, "Append is ahead of the log";
                    "prev" => prev, "last_index" => self.last_log_index());
                return Ok(self.append_response(false, self.last_log_index()));
            }
        }

        for (offset, entry) in request.entries().iter().enumerate() {
            let index = prev + 1 + offset as u64;
            if entry.index() != index {
                return Err(RaftError::Codec(format!(
                    "append carries entry {} at position {}",
                    entry.index(),
                    index
                )));
            }
            match self.log.term(index)? {
                Some(term) if term == entry.term() => continue,
                Some(_) => {
                    if index <= self.commit_index {
                        return Err(RaftError::Storage(format!(
                            "refusing to overwrite committed entry {}",
                            index
                        )));
                    }
                    warn!(self.logger, "Truncating conflicting entries"; "from" => index);
                    self.log.truncate_after(index - 1)?;
                    self.log.append(entry.clone())?;
                }
                None => {
                    self.log.append(entry.clone())?;
                }
            }
        }

        let last_new = prev + request.entries().len() as u64;
        self.commit(request.commit_index().min(last_new))?;
        Ok(self.append_response(true, last_new))
    }

    /// Starts a new epoch: pending timers are cancelled and in-flight
    /// replies will be ignored.
    pub(crate) fn begin_epoch(&mut self) {
        self.cancel_timers();
        self.epoch += 1;
    }

    /// (Re)arms `timer` to fire after `delay`.
    pub fn schedule(&mut self, timer: Timer, delay: Duration) {
        self.cancel(timer);
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let epoch = self.epoch;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Timer { epoch, timer, seq }).await;
        });
        self.timers.insert(timer, (seq, handle));
    }

    pub fn cancel(&mut self, timer: Timer) {
        if let Some((_, handle)) = self.timers.remove(&timer) {
            handle.abort();
        }
    }

    pub fn cancel_timers(&mut self) {
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
    }

    /// Consumes a fired timer. Returns false if it was re-armed or cancelled
    /// after firing.
    pub(crate) fn fire(&mut self, timer: Timer, seq: u64) -> bool {
        match self.timers.get(&timer) {
            Some((current, _)) if *current == seq => {
                self.timers.remove(&timer);
                true
            }
            _ => false,
        }
    }

    /// Sends `request` to `member`; the outcome comes back as an
    /// `Event::Reply` tagged with `tag`.
    pub fn send(&self, member: &Member, request: Request, tag: u64) {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let member = member.clone();
        let epoch = self.epoch;
        let timeout = self.config.rpc_timeout;
        let kind = request.kind();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.send(&member, request)).await
            {
                Ok(result) => result,
                Err(_) => Err(RaftError::Timeout),
            };
            let _ = events
                .send(Event::Reply {
                    epoch,
                    from: member.id(),
                    kind,
                    tag,
                    result,
                })
                .await;
        });
    }

    /// Relays a client request to `member` and completes `responder` with
    /// whatever comes back.
    pub fn forward(&self, member: &Member, request: Request, responder: Responder) {
        let transport = self.transport.clone();
        let member = member.clone();
        let timeout = self.config.rpc_timeout;
        let kind = request.kind();
        debug!(self.logger, "Forwarding request"; "kind" => %kind, "to" => member.id());
        tokio::spawn(async move {
            let response = match tokio::time::timeout(timeout, transport.send(&member, request)).await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => Response::failed(kind, e),
                Err(_) => Response::failed(kind, RaftError::Timeout),
            };
            responder.respond(response);
        });
    }
}
