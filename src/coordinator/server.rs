//! Master server

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Config, Result};
use crate::coordinator::directory::ReplicaDirectory;
use crate::coordinator::dynconfig::ConfigSnapshot;
use crate::coordinator::ground::{open_ground, GroundStore};
use crate::coordinator::http::create_router;
use crate::coordinator::mirror::{GroundMirror, MirrorHandle};
use crate::coordinator::reconciler::{Reconciler, ReconcilerHandle};
use crate::coordinator::registry::LocationRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_REQUEST_BODY: usize = 1 << 20;

/// Everything the HTTP handlers and background tasks share
#[derive(Clone)]
pub struct MasterState {
    pub node_id: String,
    pub registry: Arc<LocationRegistry>,
    pub directory: Arc<ReplicaDirectory>,
    pub ground: Arc<dyn GroundStore>,
    pub mirror: MirrorHandle,
    pub reconciler: ReconcilerHandle,
    pub config: Arc<ConfigSnapshot>,
    /// Default threshold of the degraded chunk listing
    pub degraded_after: Duration,
    shutdown: Arc<watch::Sender<bool>>,
}

impl MasterState {
    /// Wire the directory to `ground` and spawn the mirror and the
    /// reconciliation loop on the current runtime.
    pub fn start(config: &Config, ground: Arc<dyn GroundStore>) -> Self {
        let registry = Arc::new(LocationRegistry::new(&config.master.media));
        let snapshot = Arc::new(ConfigSnapshot::new(config.chunk_manager.clone()));

        let (mirror, mirror_requests) = MirrorHandle::channel();
        let directory = Arc::new(ReplicaDirectory::new(
            registry.clone(),
            snapshot.clone(),
            ground.clone(),
            mirror.clone(),
        ));

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let worker = GroundMirror::new(directory.clone(), ground.clone(), mirror_requests, ack_tx);
        tokio::spawn(worker.run());

        let (reconciler, reconciler_handle) = Reconciler::new(
            directory.clone(),
            ground.clone(),
            mirror.clone(),
            config.reconciler.clone(),
            ack_rx,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(reconciler.run(shutdown_rx));

        Self {
            node_id: config.node_id.clone(),
            registry,
            directory,
            ground,
            mirror,
            reconciler: reconciler_handle,
            config: snapshot,
            degraded_after: config.reconciler.degraded_after(),
            shutdown: Arc::new(shutdown_tx),
        }
    }

    /// Stop the background tasks; queued projections are applied first
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.mirror.flush().await {
            tracing::debug!("Mirror already stopped: {}", e);
        }
        self.mirror.shutdown();
        if let Err(e) = self.ground.flush() {
            tracing::warn!("Ground flush on shutdown failed: {}", e);
        }
    }
}

pub struct Master {
    config: Config,
}

impl Master {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting master: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.master.bind_addr);
        tracing::info!(
            "  Ground: {:?} at {}",
            self.config.master.ground.backend,
            self.config.master.ground.path.display()
        );
        tracing::info!(
            "  Sequoia rollout: {}%",
            self.config.chunk_manager.sequoia_chunk_replicas_percentage
        );

        let ground = open_ground(&self.config.master.ground)?;
        let state = MasterState::start(&self.config, ground);

        let router = create_router(state.clone())
            .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY))
            .layer(axum::middleware::from_fn(request_tracing_middleware))
            .layer(TraceLayer::new_for_http());

        let listener = tokio::net::TcpListener::bind(self.config.master.bind_addr).await?;
        tracing::info!("Master ready");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown requested");
            })
            .await;

        state.shutdown().await;
        if let Err(e) = served {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}
