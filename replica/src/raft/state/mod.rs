//! Replica states
//!
//! Each role is its own type. `State` wraps the active role and routes
//! requests to it; anything a role does not serve is answered with
//! `IllegalState`.

use std::fmt;

use serde::{Deserialize, Serialize};
use slog::debug;

use crate::error::{RaftError, Result};
use crate::raft::cluster::MemberId;
use crate::raft::context::{RaftContext, Timer};
use crate::raft::proposal::Responder;
use crate::raft::protocol::{
    PollRequest, PollResponse, Request, RequestKind, Response, VoteRequest, VoteResponse,
};

mod candidate;
mod follower;
mod leader;
mod passive;
mod start;

use candidate::Candidate;
use follower::Follower;
use leader::Leader;
use passive::Passive;
use start::Start;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    Start,
    Passive,
    Follower,
    Candidate,
    Leader,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Start => "start",
            StateType::Passive => "passive",
            StateType::Follower => "follower",
            StateType::Candidate => "candidate",
            StateType::Leader => "leader",
        }
    }

    /// States that take part in elections.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StateType::Follower | StateType::Candidate | StateType::Leader
        )
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) enum Role {
    Start(Start),
    Passive(Passive),
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

/// The active role plus its open flag.
pub(crate) struct State {
    role: Role,
    open: bool,
}

/// What a role asks the node to do after handling an event.
pub(crate) type Next = Result<Option<StateType>>;

impl State {
    pub fn new(state: StateType) -> Self {
        let role = match state {
            StateType::Start => Role::Start(Start),
            StateType::Passive => Role::Passive(Passive::default()),
            StateType::Follower => Role::Follower(Follower::default()),
            StateType::Candidate => Role::Candidate(Candidate::default()),
            StateType::Leader => Role::Leader(Leader::default()),
        };
        State { role, open: false }
    }

    pub fn state_type(&self) -> StateType {
        match self.role {
            Role::Start(_) => StateType::Start,
            Role::Passive(_) => StateType::Passive,
            Role::Follower(_) => StateType::Follower,
            Role::Candidate(_) => StateType::Candidate,
            Role::Leader(_) => StateType::Leader,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open(&mut self, ctx: &mut RaftContext) -> Next {
        self.open = true;
        match &mut self.role {
            Role::Start(s) => s.open(ctx),
            Role::Passive(s) => s.open(ctx),
            Role::Follower(s) => s.open(ctx),
            Role::Candidate(s) => s.open(ctx),
            Role::Leader(s) => s.open(ctx),
        }
    }

    pub fn close(&mut self, ctx: &mut RaftContext) {
        if !self.open {
            return;
        }
        self.open = false;
        ctx.cancel_timers();
        if let Role::Leader(s) = &mut self.role {
            s.close(ctx);
        }
    }

    pub fn handle(&mut self, ctx: &mut RaftContext, request: Request, responder: Responder) {
        let state = self.state_type();
        let kind = request.kind();
        if !self.open {
            responder.fail(kind, RaftError::IllegalState { state, kind });
            return;
        }

        let result = match (&mut self.role, request) {
            (Role::Passive(s), Request::Append(r)) => s.append(ctx, r),
            (Role::Passive(s), Request::Sync(r)) => s.sync(ctx, r),
            (Role::Passive(_), Request::Command(_) | Request::Query(_)) => Err(ctx.not_leader()),

            (Role::Follower(s), Request::Append(r)) => s.append(ctx, r),
            (Role::Follower(s), Request::Poll(r)) => s.poll(ctx, r),
            (Role::Follower(s), Request::Vote(r)) => s.vote(ctx, r),
            (
                Role::Follower(s),
                request @ (Request::Command(_)
                | Request::Query(_)
                | Request::Join(_)
                | Request::Leave(_)
                | Request::Promote(_)),
            ) => return s.forward(ctx, request, responder),

            // Current-term appends were routed to a follower already.
            (Role::Candidate(_), Request::Append(_)) => Ok(Response::Append(ctx.reject_append())),
            (Role::Candidate(_), Request::Poll(r)) => {
                Ok(Response::Poll(handle_poll(ctx, &r, false)))
            }
            (Role::Candidate(_), Request::Vote(r)) => handle_vote(ctx, &r).map(Response::Vote),
            (
                Role::Candidate(_),
                Request::Command(_)
                | Request::Query(_)
                | Request::Join(_)
                | Request::Leave(_)
                | Request::Promote(_),
            ) => Err(RaftError::NoLeader),

            (Role::Leader(_), Request::Append(_)) => Ok(Response::Append(ctx.reject_append())),
            (Role::Leader(_), Request::Poll(r)) => Ok(Response::Poll(handle_poll(ctx, &r, true))),
            (Role::Leader(_), Request::Vote(r)) => handle_vote(ctx, &r).map(Response::Vote),
            (Role::Leader(s), Request::Command(r)) => return s.command(ctx, r, responder),
            (Role::Leader(s), Request::Query(r)) => return s.query(ctx, r, responder),
            (Role::Leader(s), Request::Join(r)) => return s.join(ctx, r, responder),
            (Role::Leader(s), Request::Leave(r)) => return s.leave(ctx, r, responder),
            (Role::Leader(s), Request::Promote(r)) => return s.promote(ctx, r, responder),

            (_, _) => Err(RaftError::IllegalState { state, kind }),
        };

        match result {
            Ok(response) => responder.respond(response),
            Err(e) => {
                debug!(ctx.logger(), "Request failed"; "kind" => %kind, "error" => %e);
                responder.fail(kind, e)
            }
        }
    }

    pub fn on_reply(
        &mut self,
        ctx: &mut RaftContext,
        from: MemberId,
        kind: RequestKind,
        tag: u64,
        result: Result<Response>,
    ) -> Next {
        match &mut self.role {
            Role::Passive(s) => s.on_reply(ctx, result),
            Role::Candidate(s) => s.on_reply(ctx, from, tag, result),
            Role::Leader(s) => s.on_reply(ctx, from, kind, tag, result),
            Role::Start(_) | Role::Follower(_) => Ok(None),
        }
    }

    pub fn on_timer(&mut self, ctx: &mut RaftContext, timer: Timer) -> Next {
        match (&mut self.role, timer) {
            (Role::Passive(s), Timer::Join) => s.join_cluster(ctx),
            (Role::Follower(_), Timer::Election) => Ok(Some(StateType::Candidate)),
            (Role::Candidate(_), Timer::Election) => Ok(Some(StateType::Candidate)),
            (Role::Leader(s), Timer::Heartbeat) => s.heartbeat(ctx),
            _ => Ok(None),
        }
    }
}

/// Answers a pre-vote. Never changes term or vote.
pub(crate) fn handle_poll(ctx: &RaftContext, request: &PollRequest, leader_alive: bool) -> PollResponse {
    let accepted = !leader_alive
        && ctx.would_vote(
            request.term(),
            request.candidate(),
            request.last_log_index(),
            request.last_log_term(),
        );
    PollResponse::builder()
        .term(ctx.term())
        .accepted(accepted)
        .build()
}

/// Answers a vote request. Newer terms were adopted before getting here.
pub(crate) fn handle_vote(ctx: &mut RaftContext, request: &VoteRequest) -> Result<VoteResponse> {
    let voted = request.term() == ctx.term()
        && ctx.would_vote(
            request.term(),
            request.candidate(),
            request.last_log_index(),
            request.last_log_term(),
        );
    if voted {
        ctx.set_voted_for(Some(request.candidate()))?;
    }
    Ok(VoteResponse::builder().term(ctx.term()).voted(voted).build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::context::tests::context;
    use crate::raft::log::Entry;
    use crate::raft::protocol::{CommandRequest, Status};
    use tokio::sync::oneshot;

    fn responder() -> (Responder, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (Responder::new(tx, slog::Logger::root(slog::Discard, slog::o!())), rx)
    }

    #[test]
    fn test_poll_does_not_mutate() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.set_term(2).unwrap();

        let request = PollRequest::builder().term(5).candidate(2).build();
        let response = handle_poll(&ctx, &request, false);
        assert!(response.accepted());
        assert_eq!(response.term(), 2);
        assert_eq!(ctx.term(), 2);
        assert_eq!(ctx.voted_for(), None);

        assert!(!handle_poll(&ctx, &request, true).accepted());
    }

    #[test]
    fn test_vote_once_per_term() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.set_term(3).unwrap();

        let vote = |candidate| VoteRequest::builder().term(3).candidate(candidate).build();
        assert!(handle_vote(&mut ctx, &vote(2)).unwrap().voted());
        assert!(handle_vote(&mut ctx, &vote(2)).unwrap().voted());
        assert!(!handle_vote(&mut ctx, &vote(3)).unwrap().voted());
        assert_eq!(ctx.voted_for(), Some(2));
    }

    #[test]
    fn test_vote_rejects_stale_log() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.log_mut().append(Entry::user(1, 2, vec![])).unwrap();
        ctx.set_term(2).unwrap();

        let request = VoteRequest::builder()
            .term(2)
            .candidate(2)
            .last_log_index(5)
            .last_log_term(1)
            .build();
        assert!(!handle_vote(&mut ctx, &request).unwrap().voted());
        assert_eq!(ctx.voted_for(), None);
    }

    #[test]
    fn test_closed_state_rejects() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        let mut state = State::new(StateType::Follower);
        assert!(!state.is_open());

        let (responder, mut rx) = responder();
        let request = Request::Command(CommandRequest::builder().command(vec![1]).build());
        state.handle(&mut ctx, request, responder);

        let response = rx.try_recv().unwrap();
        assert_eq!(response.status(), Status::Error);
        assert_eq!(
            response.error(),
            Some(&RaftError::IllegalState {
                state: StateType::Follower,
                kind: RequestKind::Command
            })
        );
    }

    #[tokio::test]
    async fn test_passive_rejects_votes() {
        let (mut ctx, _rx) = context(1, &[2, 3]);
        let mut state = State::new(StateType::Passive);
        state.open(&mut ctx).unwrap();

        let (responder, mut rx) = responder();
        state.handle(
            &mut ctx,
            Request::Vote(VoteRequest::builder().term(1).candidate(2).build()),
            responder,
        );
        let response = rx.try_recv().unwrap();
        assert!(matches!(
            response.error(),
            Some(RaftError::IllegalState {
                state: StateType::Passive,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_candidate_rejects_commands() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        let mut state = State::new(StateType::Candidate);
        assert_eq!(state.open(&mut ctx).unwrap(), None);
        assert_eq!(ctx.term(), 1);
        assert_eq!(ctx.voted_for(), Some(1));

        let (responder, mut rx) = responder();
        let request = Request::Command(CommandRequest::builder().command(vec![1]).build());
        state.handle(&mut ctx, request, responder);
        assert_eq!(rx.try_recv().unwrap().error(), Some(&RaftError::NoLeader));
    }
}
