//! Transport abstraction
//!
//! The consensus core only needs request/response delivery between members.
//! `LocalNetwork` connects nodes living in one process and can cut links,
//! which is what the cluster tests run on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{RaftError, Result};
use crate::raft::cluster::{Member, MemberId};
use crate::raft::protocol::{Request, Response};

/// Receives inbound requests. Implemented by `NodeHandle`.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Delivers requests to other members.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` to `member` and waits for its response.
    async fn send(&self, member: &Member, request: Request) -> Result<Response>;

    /// Starts delivering inbound requests to `handler`.
    async fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

#[derive(Default)]
struct LocalNetworkInner {
    handlers: HashMap<MemberId, Arc<dyn RequestHandler>>,
    partitioned: HashSet<MemberId>,
}

/// An in-process network shared by a set of `LocalTransport`s.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<LocalNetworkInner>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transport for member `id`.
    pub fn transport(&self, id: MemberId) -> LocalTransport {
        LocalTransport {
            id,
            network: self.clone(),
        }
    }

    /// Cuts every link to and from `id`.
    pub fn partition(&self, id: MemberId) {
        self.lock().partitioned.insert(id);
    }

    /// Restores the links of `id`.
    pub fn heal(&self, id: MemberId) {
        self.lock().partitioned.remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalNetworkInner> {
        // A poisoned lock only means a test panicked while holding it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn route(&self, from: MemberId, to: MemberId) -> Result<Arc<dyn RequestHandler>> {
        let inner = self.lock();
        if inner.partitioned.contains(&from) || inner.partitioned.contains(&to) {
            return Err(RaftError::Transport(format!(
                "member {} unreachable from {}",
                to, from
            )));
        }
        inner
            .handlers
            .get(&to)
            .cloned()
            .ok_or_else(|| RaftError::Transport(format!("member {} is not listening", to)))
    }
}

/// One member's view of a `LocalNetwork`.
#[derive(Clone)]
pub struct LocalTransport {
    id: MemberId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, member: &Member, request: Request) -> Result<Response> {
        let handler = self.network.route(self.id, member.id())?;
        let response = handler.handle(request).await;
        // The link may have been cut while the request was in flight.
        self.network.route(self.id, member.id())?;
        Ok(response)
    }

    async fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        self.network.lock().handlers.insert(self.id, handler);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.network.lock().handlers.remove(&self.id);
        Ok(())
    }
}
