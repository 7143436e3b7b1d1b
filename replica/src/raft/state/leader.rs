use fxhash::FxHashMap;
use slog::{debug, error, info};

use super::{Next, StateType};
use crate::error::{RaftError, Result};
use crate::raft::cluster::{Member, MemberId, Membership};
use crate::raft::context::{Applied, RaftContext, Timer};
use crate::raft::log::{Entry, EntryKind};
use crate::raft::proposal::{Proposal, Proposals, Responder};
use crate::raft::protocol::{
    expect_response, AppendRequest, CommandRequest, CommandResponse, Consistency, JoinRequest,
    JoinResponse, LeaveRequest, LeaveResponse, PromoteRequest, PromoteResponse, QueryRequest,
    QueryResponse, Request, RequestKind, Response, SyncRequest,
};

/// Replication progress of one member.
struct Replica {
    member: Member,
    next_index: u64,
    match_index: u64,
    in_flight: bool,
    // Latest heartbeat round the member acknowledged in the current term.
    acked_round: u64,
}

impl Replica {
    fn new(member: Member, next_index: u64) -> Self {
        Replica {
            member,
            next_index,
            match_index: 0,
            in_flight: false,
            acked_round: 0,
        }
    }
}

/// A linearizable read waiting for leadership to be confirmed.
struct PendingQuery {
    round: u64,
    read_index: u64,
    request: QueryRequest,
    responder: Responder,
}

/// A promotion waiting for the member's sync response.
struct PendingPromotion {
    required: u64,
    responder: Responder,
}

/// Accepts client requests, replicates the log and decides what is
/// committed.
#[derive(Default)]
pub struct Leader {
    replicas: FxHashMap<MemberId, Replica>,
    proposals: Proposals,
    queries: Vec<PendingQuery>,
    promotions: FxHashMap<MemberId, PendingPromotion>,
    round: u64,
    // Index of the first entry of this term.
    term_start: u64,
    // Latest membership, committed or not, and where it was appended.
    config: Membership,
    config_index: u64,
}

impl Leader {
    pub fn open(&mut self, ctx: &mut RaftContext) -> Next {
        ctx.set_leader(Some(ctx.id()));
        self.config = Self::latest_config(ctx)?;
        self.sync_replicas(ctx);

        // Committing the first entry of the term commits everything before it.
        let index = ctx.last_log_index() + 1;
        let entry = Entry::config(index, ctx.term(), &self.config)?;
        ctx.log_mut().append(entry)?;
        self.term_start = index;
        self.config_index = index;
        info!(ctx.logger(), "Became leader"; "term" => ctx.term(), "index" => index);

        ctx.schedule(Timer::Heartbeat, ctx.config().heartbeat_interval);
        self.broadcast(ctx)?;
        self.advance_commit(ctx)?;
        Ok(None)
    }

    /// The newest membership in the log. An inherited change that is not
    /// applied yet is carried forward rather than overwritten.
    fn latest_config(ctx: &RaftContext) -> Result<Membership> {
        let mut index = ctx.last_log_index();
        while index > ctx.last_applied() {
            if let Some(entry) = ctx.log().get(index)? {
                if entry.kind() == EntryKind::Config {
                    return entry.membership();
                }
            }
            index -= 1;
        }
        Ok(ctx.membership().clone())
    }

    /// Fails everything still waiting on this leader.
    pub fn close(&mut self, ctx: &mut RaftContext) {
        if ctx.leader() == Some(ctx.id()) {
            ctx.set_leader(None);
        }
        let error = ctx.not_leader();
        self.proposals.fail_all(error.clone());
        for query in self.queries.drain(..) {
            query.responder.fail(RequestKind::Query, error.clone());
        }
        for (_, promotion) in self.promotions.drain() {
            promotion.responder.fail(RequestKind::Promote, error.clone());
        }
    }

    /// Tracks every member of the latest membership, and keeps tracking
    /// removed members until their removal is committed.
    fn sync_replicas(&mut self, ctx: &RaftContext) {
        let next_index = ctx.last_log_index() + 1;
        for member in self.config.members() {
            if member.id() == ctx.id() {
                continue;
            }
            self.replicas
                .entry(member.id())
                .and_modify(|r| r.member = member.clone())
                .or_insert_with(|| Replica::new(member.clone(), next_index));
        }
        let config = &self.config;
        let committed = ctx.membership();
        self.replicas
            .retain(|id, _| config.contains(*id) || committed.contains(*id));
    }

    pub fn heartbeat(&mut self, ctx: &mut RaftContext) -> Next {
        self.broadcast(ctx)?;
        ctx.schedule(Timer::Heartbeat, ctx.config().heartbeat_interval);
        Ok(None)
    }

    /// Starts a new round: every member gets an append, in flight or not.
    fn broadcast(&mut self, ctx: &mut RaftContext) -> Result<()> {
        self.round += 1;
        let ids: Vec<MemberId> = self.replicas.keys().copied().collect();
        for id in ids {
            self.replicate(ctx, id, true)?;
        }
        Ok(())
    }

    /// Sends new entries to members that are not already busy.
    fn propagate(&mut self, ctx: &mut RaftContext) -> Result<()> {
        let ids: Vec<MemberId> = self.replicas.keys().copied().collect();
        for id in ids {
            self.replicate(ctx, id, false)?;
        }
        self.advance_commit(ctx)
    }

    fn replicate(&mut self, ctx: &mut RaftContext, id: MemberId, force: bool) -> Result<()> {
        let replica = match self.replicas.get_mut(&id) {
            Some(replica) => replica,
            None => return Ok(()),
        };
        let last_index = ctx.last_log_index();
        if replica.in_flight && !force {
            return Ok(());
        }
        if !force && replica.next_index > last_index {
            return Ok(());
        }

        let prev_log_index = replica.next_index - 1;
        let prev_log_term = ctx.log().term(prev_log_index)?.unwrap_or(0);
        let batch = ctx.config().max_entries_per_append as u64;
        let end = (last_index + 1).min(replica.next_index + batch);
        let entries = ctx.log().entries(replica.next_index, end)?;
        let request = AppendRequest::builder()
            .term(ctx.term())
            .leader(ctx.id())
            .prev_log_index(prev_log_index)
            .prev_log_term(prev_log_term)
            .entries(entries)
            .commit_index(ctx.commit_index())
            .build();

        replica.in_flight = true;
        ctx.send(&replica.member, Request::Append(request), self.round);
        Ok(())
    }

    pub fn on_reply(
        &mut self,
        ctx: &mut RaftContext,
        from: MemberId,
        kind: RequestKind,
        tag: u64,
        result: Result<Response>,
    ) -> Next {
        match kind {
            RequestKind::Append => self.on_append_reply(ctx, from, tag, result)?,
            RequestKind::Sync => self.on_sync_reply(ctx, from, result)?,
            _ => {}
        }
        Ok(None)
    }

    fn on_append_reply(
        &mut self,
        ctx: &mut RaftContext,
        from: MemberId,
        round: u64,
        result: Result<Response>,
    ) -> Result<()> {
        let replica = match self.replicas.get_mut(&from) {
            Some(replica) => replica,
            None => return Ok(()),
        };
        replica.in_flight = false;
        let response = match result.and_then(|r| expect_response!(r, Append)) {
            Ok(response) => response,
            Err(e) => {
                debug!(ctx.logger(), "Append failed"; "member" => from, "error" => %e);
                return Ok(());
            }
        };

        if response.term() == ctx.term() {
            replica.acked_round = replica.acked_round.max(round);
        }
        if response.succeeded() {
            replica.match_index = replica.match_index.max(response.last_log_index());
            replica.next_index = replica.next_index.max(replica.match_index + 1);
        } else {
            replica.next_index = replica
                .next_index
                .saturating_sub(1)
                .min(response.last_log_index() + 1)
                .max(replica.match_index + 1);
            debug!(ctx.logger(), "Append rejected";
                "member" => from, "next_index" => replica.next_index);
        }
        let behind = replica.next_index <= ctx.last_log_index();

        if response.succeeded() {
            self.advance_commit(ctx)?;
        }
        self.serve_queries(ctx);
        if behind {
            self.replicate(ctx, from, false)?;
        }
        Ok(())
    }

    /// Match index of every voter, the leader's own log included.
    fn matched(&self, ctx: &RaftContext) -> Vec<u64> {
        ctx.membership()
            .active()
            .map(|m| {
                if m.id() == ctx.id() {
                    ctx.last_log_index()
                } else {
                    self.replicas.get(&m.id()).map_or(0, |r| r.match_index)
                }
            })
            .collect()
    }

    /// Commits the highest index stored on a majority of voters, provided
    /// it belongs to the current term.
    fn advance_commit(&mut self, ctx: &mut RaftContext) -> Result<()> {
        let quorum = ctx.membership().quorum();
        let mut matched = self.matched(ctx);
        if matched.len() < quorum {
            return Ok(());
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let index = matched[quorum - 1];
        if index <= ctx.commit_index() || ctx.log().term(index)? != Some(ctx.term()) {
            return Ok(());
        }

        let applied = ctx.commit(index)?;
        self.on_applied(ctx, applied)
    }

    fn on_applied(&mut self, ctx: &mut RaftContext, applied: Vec<Applied>) -> Result<()> {
        let mut config_applied = false;
        for entry in applied {
            config_applied |= entry.kind == EntryKind::Config;
            let proposal = match self.proposals.take(entry.index, || RaftError::NoLeader) {
                Some(proposal) => proposal,
                None => continue,
            };
            let response = match proposal.kind {
                RequestKind::Command => Response::Command(
                    CommandResponse::builder().result(entry.output).build(),
                ),
                kind => self.membership_response(ctx, kind),
            };
            proposal.responder.respond(response);
        }

        if config_applied {
            // Tell every member about the new commit index, including any
            // member that was just removed, before forgetting removed members.
            self.broadcast(ctx)?;
            self.sync_replicas(ctx);
            if !ctx.membership().is_active(ctx.id()) {
                info!(ctx.logger(), "Leader is no longer a voting member");
            }
        }
        self.serve_queries(ctx);
        Ok(())
    }

    fn membership_response(&self, ctx: &RaftContext, kind: RequestKind) -> Response {
        let members = self.config.to_vec();
        let leader = ctx.leader();
        match kind {
            RequestKind::Join => Response::Join(
                JoinResponse::builder()
                    .term(ctx.term())
                    .leader(leader)
                    .members(members)
                    .build(),
            ),
            RequestKind::Promote => Response::Promote(
                PromoteResponse::builder()
                    .term(ctx.term())
                    .leader(leader)
                    .members(members)
                    .build(),
            ),
            RequestKind::Leave => Response::Leave(
                LeaveResponse::builder()
                    .term(ctx.term())
                    .leader(leader)
                    .members(members)
                    .build(),
            ),
            kind => Response::failed(
                kind,
                RaftError::IllegalState {
                    state: StateType::Leader,
                    kind,
                },
            ),
        }
    }

    /// Highest round acknowledged by a majority of voters.
    fn quorum_round(&self, ctx: &RaftContext) -> u64 {
        let quorum = ctx.membership().quorum();
        let mut rounds: Vec<u64> = ctx
            .membership()
            .active()
            .map(|m| {
                if m.id() == ctx.id() {
                    self.round
                } else {
                    self.replicas.get(&m.id()).map_or(0, |r| r.acked_round)
                }
            })
            .collect();
        if rounds.len() < quorum {
            return 0;
        }
        rounds.sort_unstable_by(|a, b| b.cmp(a));
        rounds[quorum - 1]
    }

    fn serve_queries(&mut self, ctx: &RaftContext) {
        if self.queries.is_empty() || ctx.commit_index() < self.term_start {
            return;
        }
        let confirmed = self.quorum_round(ctx);
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queries)
            .into_iter()
            .partition(|q| q.round <= confirmed && ctx.last_applied() >= q.read_index);
        self.queries = waiting;
        for query in ready {
            let result = ctx.state_machine().query(query.request.query());
            query
                .responder
                .respond(Response::Query(QueryResponse::builder().result(result).build()));
        }
    }

    fn report(&self, ctx: &RaftContext, result: Result<()>) {
        if let Err(e) = result {
            error!(ctx.logger(), "Replication failed"; "error" => %e);
        }
    }

    pub fn command(&mut self, ctx: &mut RaftContext, request: CommandRequest, responder: Responder) {
        let index = ctx.last_log_index() + 1;
        let entry = Entry::user(index, ctx.term(), request.command().clone());
        if let Err(e) = ctx.log_mut().append(entry) {
            error!(ctx.logger(), "Failed to append command"; "error" => %e);
            responder.fail(RequestKind::Command, e);
            return;
        }
        self.proposals
            .push(Proposal::new(RequestKind::Command, index, responder));
        let result = self.propagate(ctx);
        self.report(ctx, result);
    }

    pub fn query(&mut self, ctx: &mut RaftContext, request: QueryRequest, responder: Responder) {
        if request.consistency() == Consistency::Weak {
            let result = ctx.state_machine().query(request.query());
            responder.respond(Response::Query(QueryResponse::builder().result(result).build()));
            return;
        }

        self.queries.push(PendingQuery {
            round: self.round + 1,
            read_index: ctx.commit_index().max(self.term_start),
            request,
            responder,
        });
        let result = self.broadcast(ctx);
        self.report(ctx, result);
        self.serve_queries(ctx);
    }

    pub fn join(&mut self, ctx: &mut RaftContext, request: JoinRequest, responder: Responder) {
        let member = request.member();
        if self.config.contains(member.id()) {
            responder.respond(self.membership_response(ctx, RequestKind::Join));
            return;
        }
        let next = self.config.join(member);
        self.change_config(ctx, next, RequestKind::Join, responder);
    }

    pub fn leave(&mut self, ctx: &mut RaftContext, request: LeaveRequest, responder: Responder) {
        if !self.config.contains(request.member()) {
            responder.respond(self.membership_response(ctx, RequestKind::Leave));
            return;
        }
        let next = self.config.leave(request.member());
        self.change_config(ctx, next, RequestKind::Leave, responder);
    }

    /// Confirms the member has caught up with a sync request before
    /// appending the promotion.
    pub fn promote(&mut self, ctx: &mut RaftContext, request: PromoteRequest, responder: Responder) {
        let id = request.member();
        let member = match self.config.get(id) {
            Some(member) => member.clone(),
            None => return responder.fail(RequestKind::Promote, RaftError::UnknownMember(id)),
        };
        if member.is_active() {
            responder.respond(self.membership_response(ctx, RequestKind::Promote));
            return;
        }
        if self.config_index > ctx.commit_index() || self.promotions.contains_key(&id) {
            return responder.fail(RequestKind::Promote, RaftError::ConfigurationInProgress);
        }

        self.promotions.insert(
            id,
            PendingPromotion {
                required: ctx.commit_index(),
                responder,
            },
        );
        let request = SyncRequest::builder()
            .term(ctx.term())
            .leader(ctx.id())
            .build();
        ctx.send(&member, Request::Sync(request), self.round);
    }

    fn on_sync_reply(
        &mut self,
        ctx: &mut RaftContext,
        from: MemberId,
        result: Result<Response>,
    ) -> Result<()> {
        let pending = match self.promotions.remove(&from) {
            Some(pending) => pending,
            None => return Ok(()),
        };
        let response = match result.and_then(|r| expect_response!(r, Sync)) {
            Ok(response) => response,
            Err(e) => {
                pending.responder.fail(RequestKind::Promote, e);
                return Ok(());
            }
        };

        if response.commit_index() < pending.required {
            info!(ctx.logger(), "Member not caught up for promotion";
                "member" => from,
                "commit_index" => response.commit_index(),
                "required" => pending.required);
            pending.responder.fail(
                RequestKind::Promote,
                RaftError::NotCaughtUp {
                    member: from,
                    index: response.commit_index(),
                    required: pending.required,
                },
            );
            return Ok(());
        }

        match self.config.promote(from) {
            Some(next) => self.change_config(ctx, next, RequestKind::Promote, pending.responder),
            None => pending
                .responder
                .fail(RequestKind::Promote, RaftError::UnknownMember(from)),
        }
        Ok(())
    }

    /// Appends a CONFIG entry for `next`. Only one change may be
    /// uncommitted at a time.
    fn change_config(
        &mut self,
        ctx: &mut RaftContext,
        next: Membership,
        kind: RequestKind,
        responder: Responder,
    ) {
        if self.config_index > ctx.commit_index() {
            return responder.fail(kind, RaftError::ConfigurationInProgress);
        }

        let index = ctx.last_log_index() + 1;
        let appended = Entry::config(index, ctx.term(), &next)
            .and_then(|entry| ctx.log_mut().append(entry));
        if let Err(e) = appended {
            error!(ctx.logger(), "Failed to append configuration"; "error" => %e);
            return responder.fail(kind, e);
        }

        info!(ctx.logger(), "Appended configuration";
            "index" => index,
            "change" => %kind,
            "active" => ?next.active_ids(),
            "members" => next.len());
        self.config = next;
        self.config_index = index;
        self.sync_replicas(ctx);
        self.proposals.push(Proposal::new(kind, index, responder));
        let result = self.propagate(ctx);
        self.report(ctx, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::context::tests::context;
    use crate::raft::protocol::{AppendResponse, Status, SyncResponse};
    use tokio::sync::oneshot;

    fn responder(ctx: &RaftContext) -> (Responder, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (Responder::new(tx, ctx.logger().clone()), rx)
    }

    fn acked(term: u64, last_log_index: u64) -> Result<Response> {
        Ok(Response::Append(
            AppendResponse::builder()
                .term(term)
                .succeeded(true)
                .last_log_index(last_log_index)
                .build(),
        ))
    }

    fn leader(ctx: &mut RaftContext) -> Leader {
        let mut leader = Leader::default();
        assert_eq!(leader.open(ctx).unwrap(), None);
        leader
    }

    #[tokio::test]
    async fn test_only_current_term_entries_commit_by_count() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.log_mut().append(Entry::user(1, 1, b"old".to_vec())).unwrap();
        ctx.set_term(2).unwrap();
        let mut leader = leader(&mut ctx);
        assert_eq!(ctx.last_log_index(), 2);

        // A majority holds the old entry, but it is from an earlier term.
        leader
            .on_reply(&mut ctx, 2, RequestKind::Append, 1, acked(2, 1))
            .unwrap();
        assert_eq!(ctx.commit_index(), 0);

        leader
            .on_reply(&mut ctx, 2, RequestKind::Append, 1, acked(2, 2))
            .unwrap();
        assert_eq!(ctx.commit_index(), 2);
        assert_eq!(ctx.last_applied(), 2);
    }

    #[tokio::test]
    async fn test_inherited_join_is_carried_forward() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        let joined = ctx.membership().join(&Member::passive(4, "n4"));
        ctx.log_mut()
            .append(Entry::config(1, 1, &joined).unwrap())
            .unwrap();
        ctx.set_term(2).unwrap();
        let mut leader = leader(&mut ctx);

        let first = ctx.log().get(2).unwrap().unwrap();
        assert!(first.membership().unwrap().contains(4));
        assert!(leader.replicas.contains_key(&4));
        assert_eq!(leader.config_index, 2);

        leader
            .on_reply(&mut ctx, 2, RequestKind::Append, 1, acked(2, 2))
            .unwrap();
        assert_eq!(ctx.commit_index(), 2);
        assert!(ctx.membership().contains(4));
        assert!(!ctx.membership().is_active(4));
    }

    #[tokio::test]
    async fn test_inherited_leave_is_carried_forward() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        let left = ctx.membership().leave(3);
        ctx.log_mut()
            .append(Entry::config(1, 1, &left).unwrap())
            .unwrap();
        ctx.set_term(2).unwrap();
        let mut leader = leader(&mut ctx);

        let first = ctx.log().get(2).unwrap().unwrap();
        assert!(!first.membership().unwrap().contains(3));
        // Still replicated to until the removal commits.
        assert!(leader.replicas.contains_key(&3));

        leader
            .on_reply(&mut ctx, 2, RequestKind::Append, 1, acked(2, 2))
            .unwrap();
        assert_eq!(ctx.commit_index(), 2);
        assert!(!ctx.membership().contains(3));
        assert!(!leader.replicas.contains_key(&3));
    }

    #[tokio::test]
    async fn test_command_completes_on_commit() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.set_term(1).unwrap();
        let mut leader = leader(&mut ctx);

        let (tx, mut rx) = responder(&ctx);
        let request = CommandRequest::builder().command(b"cmd".to_vec()).build();
        leader.command(&mut ctx, request, tx);
        assert!(rx.try_recv().is_err());

        leader
            .on_reply(&mut ctx, 3, RequestKind::Append, 1, acked(1, 2))
            .unwrap();
        match rx.try_recv().unwrap() {
            Response::Command(r) => {
                assert_eq!(r.status(), Status::Ok);
                assert_eq!(r.result(), b"cmd");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_voter_commits_alone() {
        let (mut ctx, _rx) = context(1, &[1]);
        ctx.set_term(1).unwrap();
        let mut leader = leader(&mut ctx);
        assert_eq!(ctx.commit_index(), 1);

        let (tx, mut rx) = responder(&ctx);
        leader.command(&mut ctx, CommandRequest::builder().command(vec![7]).build(), tx);
        assert_eq!(ctx.commit_index(), 2);
        assert!(rx.try_recv().unwrap().status() == Status::Ok);

        let (tx, mut rx) = responder(&ctx);
        leader.query(&mut ctx, QueryRequest::builder().query(vec![]).build(), tx);
        assert!(rx.try_recv().unwrap().status() == Status::Ok);
    }

    #[tokio::test]
    async fn test_rejection_rewinds_next_index() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        for i in 1..=5 {
            ctx.log_mut().append(Entry::user(i, 1, vec![])).unwrap();
        }
        ctx.set_term(2).unwrap();
        let mut leader = leader(&mut ctx);
        assert_eq!(leader.replicas[&2].next_index, 6);

        let rejected = Ok(Response::Append(
            AppendResponse::builder()
                .term(2)
                .succeeded(false)
                .last_log_index(2)
                .build(),
        ));
        leader
            .on_reply(&mut ctx, 2, RequestKind::Append, 1, rejected)
            .unwrap();
        assert_eq!(leader.replicas[&2].next_index, 3);
        assert!(leader.replicas[&2].in_flight);
    }

    #[tokio::test]
    async fn test_linearizable_query_waits_for_quorum() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.set_term(1).unwrap();
        let mut leader = leader(&mut ctx);
        leader
            .on_reply(&mut ctx, 2, RequestKind::Append, 1, acked(1, 1))
            .unwrap();
        assert_eq!(ctx.commit_index(), 1);

        let (tx, mut rx) = responder(&ctx);
        let request = QueryRequest::builder()
            .query(vec![])
            .consistency(Consistency::Linearizable)
            .build();
        leader.query(&mut ctx, request, tx);
        let round = leader.round;

        // An acknowledgement from before the query does not count.
        leader
            .on_reply(&mut ctx, 2, RequestKind::Append, round - 1, acked(1, 1))
            .unwrap();
        assert!(rx.try_recv().is_err());

        leader
            .on_reply(&mut ctx, 3, RequestKind::Append, round, acked(1, 1))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().status(), Status::Ok);
    }

    #[tokio::test]
    async fn test_weak_query_is_immediate() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.set_term(1).unwrap();
        let mut leader = leader(&mut ctx);

        let (tx, mut rx) = responder(&ctx);
        let request = QueryRequest::builder()
            .query(vec![])
            .consistency(Consistency::Weak)
            .build();
        leader.query(&mut ctx, request, tx);
        assert_eq!(rx.try_recv().unwrap().status(), Status::Ok);
    }

    #[tokio::test]
    async fn test_join_then_promote() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.set_term(1).unwrap();
        let mut leader = leader(&mut ctx);
        leader
            .on_reply(&mut ctx, 2, RequestKind::Append, 1, acked(1, 1))
            .unwrap();

        let (tx, mut rx) = responder(&ctx);
        let request = JoinRequest::builder().member(Member::passive(4, "n4")).build();
        leader.join(&mut ctx, request, tx);
        assert!(leader.replicas.contains_key(&4));

        // A second change must wait for the first.
        let (tx, mut busy) = responder(&ctx);
        leader.leave(&mut ctx, LeaveRequest::builder().member(3).build(), tx);
        assert_eq!(
            busy.try_recv().unwrap().error(),
            Some(&RaftError::ConfigurationInProgress)
        );

        leader
            .on_reply(&mut ctx, 2, RequestKind::Append, 1, acked(1, 2))
            .unwrap();
        match rx.try_recv().unwrap() {
            Response::Join(r) => assert_eq!(r.members().len(), 4),
            other => panic!("unexpected {:?}", other),
        }
        assert!(ctx.membership().contains(4));
        assert!(!ctx.membership().is_active(4));

        // Not caught up yet.
        let (tx, mut rx) = responder(&ctx);
        leader.promote(&mut ctx, PromoteRequest::builder().member(4).build(), tx);
        let behind = Ok(Response::Sync(
            SyncResponse::builder().term(1).commit_index(0).build(),
        ));
        leader
            .on_reply(&mut ctx, 4, RequestKind::Sync, 0, behind)
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap().error(),
            Some(RaftError::NotCaughtUp { member: 4, .. })
        ));

        let (tx, mut rx) = responder(&ctx);
        leader.promote(&mut ctx, PromoteRequest::builder().member(4).build(), tx);
        let caught_up = Ok(Response::Sync(
            SyncResponse::builder().term(1).last_index(2).commit_index(2).build(),
        ));
        leader
            .on_reply(&mut ctx, 4, RequestKind::Sync, 0, caught_up)
            .unwrap();
        assert_eq!(ctx.last_log_index(), 3);

        leader
            .on_reply(&mut ctx, 3, RequestKind::Append, 2, acked(1, 3))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().status(), Status::Ok);
        assert!(ctx.membership().is_active(4));
        assert_eq!(ctx.membership().quorum(), 3);
    }

    #[tokio::test]
    async fn test_unknown_promotion() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.set_term(1).unwrap();
        let mut leader = leader(&mut ctx);

        let (tx, mut rx) = responder(&ctx);
        leader.promote(&mut ctx, PromoteRequest::builder().member(9).build(), tx);
        assert_eq!(
            rx.try_recv().unwrap().error(),
            Some(&RaftError::UnknownMember(9))
        );
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let (mut ctx, _rx) = context(1, &[1, 2, 3]);
        ctx.set_term(1).unwrap();
        let mut leader = leader(&mut ctx);

        let (tx, mut rx) = responder(&ctx);
        leader.command(&mut ctx, CommandRequest::builder().command(vec![1]).build(), tx);
        leader.close(&mut ctx);

        assert!(matches!(
            rx.try_recv().unwrap().error(),
            Some(RaftError::NotLeader { .. })
        ));
        assert_eq!(ctx.leader(), None);
    }
}
