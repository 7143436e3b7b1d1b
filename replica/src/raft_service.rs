use std::net::SocketAddr;
use std::sync::Arc;

use crate::raft::{Request, RequestHandler, Response};
use pb::raft_service_server::{RaftService, RaftServiceServer};
use pb::{CallRequest, CallResponse};
use tokio::sync::oneshot;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

/// Serves protocol requests for the local replica.
#[derive(Clone)]
pub struct RaftServiceSVC {
    handler: Arc<dyn RequestHandler>,
}

impl RaftServiceSVC {
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        RaftServiceSVC { handler }
    }

    async fn dispatch(&self, data: &[u8]) -> Result<Response, tonic::Status> {
        let request: Request = bincode::deserialize(data).map_err(|e| {
            log::warn!("raft parse error: {}", e);
            tonic::Status::invalid_argument(e.to_string())
        })?;
        Ok(self.handler.handle(request).await)
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn call(
        &self,
        request: tonic::Request<CallRequest>,
    ) -> Result<tonic::Response<CallResponse>, tonic::Status> {
        let response = self.dispatch(&request.into_inner().data).await?;
        let data =
            bincode::serialize(&response).map_err(|e| tonic::Status::internal(e.to_string()))?;
        Ok(tonic::Response::new(CallResponse { data }))
    }
}

/// Runs the gRPC server on `addr` until `shutdown` fires.
pub fn start_grpc_server(
    addr: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    shutdown: oneshot::Receiver<()>,
) {
    let grpc_server = tonic::transport::Server::builder()
        .add_service(RaftServiceServer::new(RaftServiceSVC::new(handler)))
        .serve_with_shutdown(addr, async {
            let _ = shutdown.await;
        });
    tokio::spawn(async move {
        if let Err(e) = grpc_server.await {
            log::error!("grpc server on {} failed: {}", addr, e);
        }
    });
    log::info!("grpc server started on {}", addr);
}
