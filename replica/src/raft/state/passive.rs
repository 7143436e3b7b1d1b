use slog::{debug, info, warn};

use super::Next;
use crate::error::{RaftError, Result};
use crate::raft::cluster::Member;
use crate::raft::context::{RaftContext, Timer};
use crate::raft::protocol::{
    expect_response, AppendRequest, JoinRequest, Request, Response, SyncRequest, SyncResponse,
};

/// A non-voting replica. Receives the log from the leader; a node that has
/// never been a member keeps asking the cluster to let it join.
#[derive(Default)]
pub struct Passive {
    // Next seed to try.
    seed: usize,
    // Leader learned from a redirect.
    redirect: Option<Member>,
}

impl Passive {
    pub fn open(&mut self, ctx: &mut RaftContext) -> Next {
        if !ctx.was_member() {
            ctx.schedule(Timer::Join, ctx.config().heartbeat_interval);
        }
        Ok(None)
    }

    pub fn append(&mut self, ctx: &mut RaftContext, request: AppendRequest) -> Result<Response> {
        if request.term() >= ctx.term() {
            ctx.set_leader(Some(request.leader()));
        }
        ctx.accept_append(&request).map(Response::Append)
    }

    /// Reports how far the local log has caught up. A stale sender only
    /// learns the current term.
    pub fn sync(&mut self, ctx: &mut RaftContext, request: SyncRequest) -> Result<Response> {
        if request.term() >= ctx.term() {
            ctx.set_leader(Some(request.leader()));
        }
        Ok(Response::Sync(
            SyncResponse::builder()
                .term(ctx.term())
                .last_index(ctx.last_log_index())
                .commit_index(ctx.commit_index())
                .build(),
        ))
    }

    /// Sends a join request to the leader, or to the next seed member.
    pub fn join_cluster(&mut self, ctx: &mut RaftContext) -> Next {
        if ctx.was_member() {
            return Ok(None);
        }

        let target = self
            .redirect
            .take()
            .or_else(|| ctx.leader_member())
            .or_else(|| {
                let seeds: Vec<&Member> = ctx
                    .config()
                    .members
                    .iter()
                    .filter(|m| m.id() != ctx.id())
                    .collect();
                if seeds.is_empty() {
                    return None;
                }
                let seed = seeds[self.seed % seeds.len()].clone();
                self.seed += 1;
                Some(seed)
            });

        match target {
            Some(member) => {
                debug!(ctx.logger(), "Requesting to join"; "via" => member.id());
                let request = JoinRequest::builder().member(ctx.local_member()).build();
                ctx.send(&member, Request::Join(request), 0);
            }
            None => warn!(ctx.logger(), "No seed members to join through"),
        }
        ctx.schedule(Timer::Join, ctx.config().election_timeout_max);
        Ok(None)
    }

    pub fn on_reply(&mut self, ctx: &mut RaftContext, result: Result<Response>) -> Next {
        let result = match result {
            Ok(response @ Response::Join(_)) => expect_response!(response, Join),
            _ => return Ok(None),
        };

        match result {
            Ok(response) => {
                info!(ctx.logger(), "Joined the cluster"; "leader" => ?response.leader());
            }
            Err(RaftError::NotLeader {
                leader: Some(leader),
                address: Some(address),
            }) => {
                self.redirect = Some(Member::active(leader, address));
                ctx.schedule(Timer::Join, std::time::Duration::ZERO);
            }
            Err(e) => debug!(ctx.logger(), "Join attempt failed"; "error" => %e),
        }
        Ok(None)
    }
}
