use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use tokio::sync::Mutex;

use crate::config::{self, RuntimeConfig};
use crate::kv::KvStore;
use crate::metrics;
use crate::raft::{default_logger, FileLog, Node, NodeHandle, StateType};
use crate::raft_client::GrpcTransport;

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

/// Hosts one replica of the key-value store.
pub struct Server {
    node: Option<Node>,
}

impl Server {
    fn builder() -> Self {
        Server { node: None }
    }

    pub fn node(&self) -> Option<NodeHandle> {
        self.node.as_ref().map(Node::handle)
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        let config = config::instance()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.start_metrics_server(&config)?;
        self.start_node(&config).await?;
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(node) = self.node.take() {
            if let Err(e) = node.shutdown().await {
                log::warn!("replica shutdown failed: {}", e);
            }
        }
        log::info!("server stop");
    }

    async fn start_node(&mut self, config: &RuntimeConfig) -> anyhow::Result<()> {
        let listen: SocketAddr = config.addr.parse()?;
        let log = FileLog::open(&config.base_path)?;
        let transport = Arc::new(GrpcTransport::new(listen));
        let logger = default_logger();
        let node = Node::start(
            config.raft_config(),
            Box::new(log),
            Box::new(KvStore::new()),
            transport,
            &logger,
            Some(Box::new(|from: StateType, to: StateType| {
                log::info!("replica moved from {} to {}", from, to)
            })),
        )
        .await?;
        log::info!("replica {} started on {}", node.id(), listen);
        self.node = Some(node);
        Ok(())
    }

    fn start_metrics_server(&mut self, config: &RuntimeConfig) -> anyhow::Result<()> {
        let addr: SocketAddr = config.metrics_addr.parse()?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            log::warn!("metrics encode failed: {}", e);
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
        Ok(())
    }
}
