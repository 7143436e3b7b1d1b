//! gRPC transport
//!
//! Outbound requests go through one cached client per member address;
//! inbound requests are served by the gRPC server started in `start`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use pb::raft_service_client::RaftServiceClient;
use pb::CallRequest;
use tokio::sync::{oneshot, Mutex};
use tonic::transport::Channel;

use crate::error::{RaftError, Result};
use crate::raft::{Member, Request, RequestHandler, Response, Transport};
use crate::raft_service::{pb, start_grpc_server};

pub struct GrpcTransport {
    listen: SocketAddr,
    clients: Mutex<HashMap<String, RaftServiceClient<Channel>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl GrpcTransport {
    pub fn new(listen: SocketAddr) -> Self {
        GrpcTransport {
            listen,
            clients: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(None),
        }
    }

    /// Gets or creates the client for `addr`.
    async fn client(&self, addr: &str) -> Result<RaftServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(addr) {
            return Ok(client.clone());
        }
        let client = RaftServiceClient::connect(addr.to_string())
            .await
            .map_err(|e| RaftError::Transport(format!("connect {}: {}", addr, e)))?;
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn send(&self, member: &Member, request: Request) -> Result<Response> {
        let mut client = self.client(member.address()).await?;
        let data = bincode::serialize(&request)?;
        match client.call(CallRequest { data }).await {
            Ok(response) => Ok(bincode::deserialize(&response.into_inner().data)?),
            Err(status) => {
                // Reconnect on the next request.
                self.clients.lock().await.remove(member.address());
                Err(RaftError::Transport(format!(
                    "call {}: {}",
                    member.address(),
                    status
                )))
            }
        }
    }

    async fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        *self.shutdown.lock().await = Some(tx);
        start_grpc_server(self.listen, handler, rx);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        self.clients.lock().await.clear();
        Ok(())
    }
}
