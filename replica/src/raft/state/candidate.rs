use std::collections::BTreeSet;

use slog::{debug, info};

use super::{Next, StateType};
use crate::error::Result;
use crate::raft::cluster::{Member, MemberId};
use crate::raft::context::{RaftContext, Timer};
use crate::raft::protocol::{PollRequest, Request, Response, VoteRequest};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Round {
    #[default]
    Poll,
    Vote,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Pending,
    Won,
    Lost,
}

/// Runs one election: a poll round first, then a vote round if a majority
/// would vote for us.
#[derive(Default)]
pub struct Candidate {
    round: Round,
    granted: BTreeSet<MemberId>,
    rejected: BTreeSet<MemberId>,
}

impl Candidate {
    pub fn open(&mut self, ctx: &mut RaftContext) -> Next {
        let term = ctx.term() + 1;
        ctx.set_term(term)?;
        ctx.set_voted_for(Some(ctx.id()))?;
        ctx.set_leader(None);
        let timeout = ctx.config().random_election_timeout();
        ctx.schedule(Timer::Election, timeout);

        info!(ctx.logger(), "Starting election"; "term" => term);
        self.start_round(ctx, Round::Poll)
    }

    fn start_round(&mut self, ctx: &mut RaftContext, round: Round) -> Next {
        self.round = round;
        self.granted.clear();
        self.rejected.clear();
        self.granted.insert(ctx.id());
        if self.tally(ctx) == Outcome::Won {
            return self.round_won(ctx);
        }

        let peers: Vec<Member> = ctx
            .membership()
            .active()
            .filter(|m| m.id() != ctx.id())
            .cloned()
            .collect();
        for peer in peers {
            let request = match round {
                Round::Poll => Request::Poll(
                    PollRequest::builder()
                        .term(ctx.term())
                        .candidate(ctx.id())
                        .last_log_index(ctx.last_log_index())
                        .last_log_term(ctx.last_log_term())
                        .build(),
                ),
                Round::Vote => Request::Vote(
                    VoteRequest::builder()
                        .term(ctx.term())
                        .candidate(ctx.id())
                        .last_log_index(ctx.last_log_index())
                        .last_log_term(ctx.last_log_term())
                        .build(),
                ),
            };
            ctx.send(&peer, request, ctx.term());
        }
        Ok(None)
    }

    fn round_won(&mut self, ctx: &mut RaftContext) -> Next {
        match self.round {
            Round::Poll => {
                debug!(ctx.logger(), "Poll succeeded"; "term" => ctx.term());
                self.start_round(ctx, Round::Vote)
            }
            Round::Vote => Ok(Some(StateType::Leader)),
        }
    }

    fn tally(&self, ctx: &RaftContext) -> Outcome {
        let voters = ctx.membership().active().count();
        let quorum = ctx.membership().quorum();
        if self.granted.len() >= quorum {
            Outcome::Won
        } else if self.rejected.len() > voters.saturating_sub(quorum) {
            Outcome::Lost
        } else {
            Outcome::Pending
        }
    }

    pub fn on_reply(
        &mut self,
        ctx: &mut RaftContext,
        from: MemberId,
        tag: u64,
        result: Result<Response>,
    ) -> Next {
        if tag != ctx.term() || !ctx.membership().is_active(from) {
            return Ok(None);
        }

        let granted = match (self.round, result) {
            (Round::Poll, Ok(Response::Poll(r))) if r.is_ok() => r.accepted(),
            (Round::Vote, Ok(Response::Vote(r))) if r.is_ok() => r.voted(),
            (_, Err(e)) => {
                debug!(ctx.logger(), "No answer from voter"; "member" => from, "error" => %e);
                return Ok(None);
            }
            _ => return Ok(None),
        };
        if granted {
            self.granted.insert(from);
        } else {
            self.rejected.insert(from);
        }

        match self.tally(ctx) {
            Outcome::Won => self.round_won(ctx),
            Outcome::Lost => {
                info!(ctx.logger(), "Lost election"; "term" => ctx.term(), "round" => ?self.round);
                Ok(Some(StateType::Follower))
            }
            Outcome::Pending => Ok(None),
        }
    }
}
