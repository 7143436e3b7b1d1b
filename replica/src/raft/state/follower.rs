use slog::debug;
use tokio::time::Instant;

use super::{handle_poll, handle_vote, Next};
use crate::error::{RaftError, Result};
use crate::raft::context::{RaftContext, Timer};
use crate::raft::proposal::Responder;
use crate::raft::protocol::{AppendRequest, PollRequest, Request, Response, VoteRequest};

/// Replicates the leader's log and votes; becomes a candidate when the
/// leader goes quiet for an election timeout.
#[derive(Default)]
pub struct Follower {
    // Last time an append from the current leader was accepted.
    last_heard: Option<Instant>,
}

impl Follower {
    pub fn open(&mut self, ctx: &mut RaftContext) -> Next {
        self.reset_election_timer(ctx);
        Ok(None)
    }

    fn reset_election_timer(&self, ctx: &mut RaftContext) {
        let timeout = ctx.config().random_election_timeout();
        ctx.schedule(Timer::Election, timeout);
    }

    /// Whether a leader was heard from recently enough that an election is
    /// not warranted.
    fn leader_alive(&self, ctx: &RaftContext) -> bool {
        self.last_heard
            .map(|at| at.elapsed() < ctx.config().election_timeout_min)
            .unwrap_or(false)
    }

    pub fn append(&mut self, ctx: &mut RaftContext, request: AppendRequest) -> Result<Response> {
        if request.term() >= ctx.term() {
            ctx.set_leader(Some(request.leader()));
            self.last_heard = Some(Instant::now());
            self.reset_election_timer(ctx);
        }
        ctx.accept_append(&request).map(Response::Append)
    }

    pub fn poll(&mut self, ctx: &mut RaftContext, request: PollRequest) -> Result<Response> {
        let leader_alive = self.leader_alive(ctx);
        if leader_alive {
            debug!(ctx.logger(), "Rejecting poll, leader is alive"; "candidate" => request.candidate());
        }
        Ok(Response::Poll(handle_poll(ctx, &request, leader_alive)))
    }

    pub fn vote(&mut self, ctx: &mut RaftContext, request: VoteRequest) -> Result<Response> {
        let response = handle_vote(ctx, &request)?;
        if response.voted() {
            self.reset_election_timer(ctx);
        }
        Ok(Response::Vote(response))
    }

    /// Relays a client request to the leader.
    pub fn forward(&mut self, ctx: &mut RaftContext, request: Request, responder: Responder) {
        match ctx.leader_member() {
            Some(leader) => ctx.forward(&leader, request, responder),
            None => responder.fail(request.kind(), RaftError::NoLeader),
        }
    }
}
