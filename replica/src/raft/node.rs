//! Raft node implementation
//!
//! A node runs one replica as an actor task. The task owns the context and
//! the active state; requests, replies and timers reach it as events. The
//! node also enforces the term rules that apply to every state before a
//! request or reply is handed to it, and moves the replica between states.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slog::{crit, debug, error, info, o, Logger};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{RaftError, Result};
use crate::metrics::{
    COMMIT_GAUGE_VEC, METHOD_HISTOGRAM_VEC, REQ_COUNTER_VEC, TERM_GAUGE_VEC,
    TRANSITION_COUNTER_VEC,
};
use crate::raft::cluster::{Member, MemberId};
use crate::raft::context::{Event, RaftContext, Timer};
use crate::raft::log::LogStore;
use crate::raft::proposal::Responder;
use crate::raft::protocol::{
    expect_response, CommandRequest, Consistency, JoinRequest, JoinResponse, LeaveRequest,
    LeaveResponse, PromoteRequest, PromoteResponse, QueryRequest, Request, RequestKind, Response,
};
use crate::raft::state::{Next, State, StateType};
use crate::raft::transport::{RequestHandler, Transport};
use crate::raft::{RaftConfig, StateMachine};

const EVENT_CHANNEL_SIZE: usize = 1000; // Size of the actor's event queue

/// Called with `(from, to)` on every state transition.
pub type TransitionHandler = Box<dyn Fn(StateType, StateType) + Send + Sync>;

/// A snapshot of a replica's progress, published after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: MemberId,
    pub state: StateType,
    pub term: u64,
    pub leader: Option<MemberId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub members: Vec<Member>,
}

impl NodeStatus {
    fn of(ctx: &RaftContext, state: StateType) -> Self {
        NodeStatus {
            id: ctx.id(),
            state,
            term: ctx.term(),
            leader: ctx.leader(),
            commit_index: ctx.commit_index(),
            last_applied: ctx.last_applied(),
            last_log_index: ctx.last_log_index(),
            members: ctx.membership().to_vec(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == StateType::Leader
    }
}

/// Cloneable client side of a running node.
#[derive(Clone)]
pub struct NodeHandle {
    id: MemberId,
    events: mpsc::Sender<Event>,
    status: watch::Receiver<NodeStatus>,
    logger: Logger,
}

impl NodeHandle {
    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Submits a request to the replica and waits for its response.
    pub async fn request(&self, request: Request) -> Response {
        let kind = request.kind();
        let (tx, rx) = oneshot::channel();
        let responder = Responder::new(tx, self.logger.clone());
        if self
            .events
            .send(Event::Request { request, responder })
            .await
            .is_err()
        {
            return Response::failed(kind, RaftError::Shutdown);
        }
        rx.await
            .unwrap_or_else(|_| Response::failed(kind, RaftError::Shutdown))
    }

    /// Replicates `command` and returns the state machine's output.
    pub async fn command(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        let request = CommandRequest::builder().command(command).build();
        let response = expect_response!(self.request(Request::Command(request)).await, Command)?;
        Ok(response.result().clone())
    }

    pub async fn query(&self, query: Vec<u8>, consistency: Consistency) -> Result<Vec<u8>> {
        let request = QueryRequest::builder()
            .query(query)
            .consistency(consistency)
            .build();
        let response = expect_response!(self.request(Request::Query(request)).await, Query)?;
        Ok(response.result().clone())
    }

    pub async fn join(&self, member: Member) -> Result<JoinResponse> {
        let request = JoinRequest::builder().member(member).build();
        expect_response!(self.request(Request::Join(request)).await, Join)
    }

    pub async fn leave(&self, member: MemberId) -> Result<LeaveResponse> {
        let request = LeaveRequest::builder().member(member).build();
        expect_response!(self.request(Request::Leave(request)).await, Leave)
    }

    pub async fn promote(&self, member: MemberId) -> Result<PromoteResponse> {
        let request = PromoteRequest::builder().member(member).build();
        expect_response!(self.request(Request::Promote(request)).await, Promote)
    }

    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    /// Waits until the published status satisfies `condition`.
    pub async fn wait_for<F>(&self, timeout: Duration, condition: F) -> Result<NodeStatus>
    where
        F: Fn(&NodeStatus) -> bool,
    {
        let mut status = self.status.clone();
        let wait = async move {
            loop {
                {
                    let current = status.borrow_and_update();
                    if condition(&current) {
                        return Ok(current.clone());
                    }
                }
                if status.changed().await.is_err() {
                    return Err(RaftError::Shutdown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(RaftError::Timeout))
    }
}

#[async_trait]
impl RequestHandler for NodeHandle {
    async fn handle(&self, request: Request) -> Response {
        self.request(request).await
    }
}

/// A running replica.
pub struct Node {
    handle: NodeHandle,
    transport: Arc<dyn Transport>,
    task: JoinHandle<()>,
}

impl Node {
    /// Starts a replica and registers it with `transport`.
    pub async fn start(
        config: RaftConfig,
        log: Box<dyn LogStore>,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        logger: &Logger,
        on_transition: Option<TransitionHandler>,
    ) -> Result<Node> {
        let id = config.id;
        let logger = logger.new(o!("tag" => format!("peer_{}", id)));
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let ctx = RaftContext::new(
            config,
            log,
            state_machine,
            transport.clone(),
            tx.clone(),
            logger.clone(),
        );
        let (status_tx, status_rx) = watch::channel(NodeStatus::of(&ctx, StateType::Start));

        let handle = NodeHandle {
            id,
            events: tx,
            status: status_rx,
            logger: logger.clone(),
        };
        transport.start(Arc::new(handle.clone())).await?;

        let actor = Actor {
            ctx,
            state: State::new(StateType::Start),
            status: status_tx,
            on_transition,
            logger,
        };
        let task = tokio::spawn(actor.run(rx));

        Ok(Node {
            handle,
            transport,
            task,
        })
    }

    pub fn id(&self) -> MemberId {
        self.handle.id
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Stops serving requests and waits for the replica to close its state.
    pub async fn shutdown(self) -> Result<()> {
        self.transport.stop().await?;
        let (tx, rx) = oneshot::channel();
        if self.handle.events.send(Event::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        self.task
            .await
            .map_err(|e| RaftError::Transport(format!("replica task failed: {}", e)))
    }
}

struct Actor {
    ctx: RaftContext,
    state: State,
    status: watch::Sender<NodeStatus>,
    on_transition: Option<TransitionHandler>,
    logger: Logger,
}

impl Actor {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        info!(self.logger, "Replica starting"; "address" => self.ctx.config().address.clone());
        self.open_state();
        self.after_event();

        while let Some(event) = events.recv().await {
            match event {
                Event::Request { request, responder } => self.on_request(request, responder),
                Event::Reply {
                    epoch,
                    from,
                    kind,
                    tag,
                    result,
                } => {
                    if epoch != self.ctx.epoch() {
                        continue;
                    }
                    self.on_reply(from, kind, tag, result);
                }
                Event::Timer { epoch, timer, seq } => {
                    if epoch != self.ctx.epoch() || !self.ctx.fire(timer, seq) {
                        continue;
                    }
                    self.on_timer(timer);
                }
                Event::Shutdown(done) => {
                    info!(self.logger, "Replica shutting down");
                    self.state.close(&mut self.ctx);
                    self.publish();
                    let _ = done.send(());
                    break;
                }
            }
            self.after_event();
        }
    }

    fn on_request(&mut self, request: Request, responder: Responder) {
        let kind = request.kind();
        debug!(self.logger, "Received request"; "kind" => %kind, "term" => ?request.term());
        REQ_COUNTER_VEC.with_label_values(&[kind.as_str()]).inc();
        let _timer = METHOD_HISTOGRAM_VEC
            .with_label_values(&[kind.as_str()])
            .start_timer();

        if let Some(term) = request.term() {
            if let Err(e) = self.check_request_term(kind, term) {
                error!(self.logger, "Failed to adopt term"; "term" => term, "error" => %e);
                responder.fail(kind, e);
                return;
            }
        }
        self.state.handle(&mut self.ctx, request, responder);
    }

    /// A newer term always wins; an append or sync for the current term
    /// means some other member already won this term's election.
    fn check_request_term(&mut self, kind: RequestKind, term: u64) -> Result<()> {
        // Polls never change anything.
        if kind == RequestKind::Poll {
            return Ok(());
        }
        let current = self.state.state_type();
        if term > self.ctx.term() {
            self.ctx.set_term(term)?;
            if matches!(current, StateType::Candidate | StateType::Leader) {
                self.transition(StateType::Follower);
            }
        } else if term == self.ctx.term()
            && current == StateType::Candidate
            && matches!(kind, RequestKind::Append | RequestKind::Sync)
        {
            self.transition(StateType::Follower);
        }
        Ok(())
    }

    fn on_reply(&mut self, from: MemberId, kind: RequestKind, tag: u64, result: Result<Response>) {
        if let Some(term) = result.as_ref().ok().and_then(Response::term) {
            if term > self.ctx.term() {
                info!(self.logger, "Discovered newer term"; "term" => term, "from" => from);
                if let Err(e) = self.ctx.set_term(term) {
                    error!(self.logger, "Failed to adopt term"; "term" => term, "error" => %e);
                    return;
                }
                if matches!(
                    self.state.state_type(),
                    StateType::Candidate | StateType::Leader
                ) {
                    self.transition(StateType::Follower);
                }
                return;
            }
        }
        let next = self.state.on_reply(&mut self.ctx, from, kind, tag, result);
        self.apply(next);
    }

    fn on_timer(&mut self, timer: Timer) {
        let next = self.state.on_timer(&mut self.ctx, timer);
        self.apply(next);
    }

    fn apply(&mut self, next: Next) {
        match next {
            Ok(Some(to)) => self.transition(to),
            Ok(None) => {}
            Err(e) => {
                error!(self.logger, "State failed"; "state" => %self.state.state_type(), "error" => %e)
            }
        }
    }

    fn transition(&mut self, to: StateType) {
        let from = self.state.state_type();
        self.state.close(&mut self.ctx);
        self.ctx.begin_epoch();
        info!(self.logger, "Transitioning";
            "from" => %from, "to" => %to, "term" => self.ctx.term());
        TRANSITION_COUNTER_VEC
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();

        self.state = State::new(to);
        if let Some(handler) = &self.on_transition {
            handler(from, to);
        }
        self.open_state();
    }

    fn open_state(&mut self) {
        match self.state.open(&mut self.ctx) {
            Ok(Some(to)) => self.transition(to),
            Ok(None) => {}
            Err(e) => crit!(self.logger, "Failed to open state";
                "state" => %self.state.state_type(), "error" => %e),
        }
    }

    fn after_event(&mut self) {
        self.check_membership();
        self.publish();
    }

    /// Moves between the voting and non-voting states as the applied
    /// membership changes.
    fn check_membership(&mut self) {
        let active = self.ctx.membership().is_active(self.ctx.id());
        match self.state.state_type() {
            StateType::Passive if active => {
                info!(self.logger, "Became a voting member");
                self.transition(StateType::Follower);
            }
            state if state.is_active() && !active => {
                info!(self.logger, "No longer a voting member");
                self.transition(StateType::Passive);
            }
            _ => {}
        }
    }

    fn publish(&self) {
        let status = NodeStatus::of(&self.ctx, self.state.state_type());
        let member = status.id.to_string();
        TERM_GAUGE_VEC
            .with_label_values(&[&member])
            .set(status.term as i64);
        COMMIT_GAUGE_VEC
            .with_label_values(&[&member])
            .set(status.commit_index as i64);
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
