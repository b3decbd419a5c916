//! Process bootstrap and teardown.

use std::sync::Arc;

use lattice_ledger::{ConvergenceLedger, Storage};
use lattice_node::LinearRecurrence;
use lattice_protocol::ResponseSigner;
use tracing::{error, info, warn};

use crate::api;
use crate::config::LatticeConfig;
use crate::error::Result;
use crate::router::DirectiveRouter;

/// Name of the coordinator identity key in storage, and the `signer` of
/// every response.
pub const SIGNER_NAME: &str = "coordinator";

/// A running coordinator: storage, ledger, node workers and HTTP API.
pub struct Coordinator {
    config: LatticeConfig,
    router: Arc<DirectiveRouter>,
}

impl Coordinator {
    /// Open storage, recover the ledger and start every node worker.
    pub async fn new(config: LatticeConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        // One storage instance for ledger, replay counters and identity key
        let storage = Arc::new(Storage::open(config.data_dir.join("ledger"))?);
        let signing_key = storage.get_or_create_signing_key(SIGNER_NAME)?;
        info!(
            public_key = %hex::encode(signing_key.verifying_key().as_bytes()),
            data_dir = %config.data_dir.display(),
            "coordinator identity loaded"
        );

        let registry = Arc::new(config.registry()?);
        let ledger = Arc::new(ConvergenceLedger::open(
            storage.clone(),
            config.policy()?,
            signing_key.clone(),
            registry.clone(),
        )?);
        if let Some(reason) = ledger.halt_reason() {
            warn!(reason = %reason, "ledger opened halted; commits refused until repaired");
        }

        let model = Arc::new(LinearRecurrence::with_bound(
            config.model.state_dim,
            config.model.input_dim,
            config.model.output_dim,
            config.model.bound,
        ));

        let mut builder = DirectiveRouter::builder(registry, ledger, ResponseSigner::new(SIGNER_NAME, signing_key))
            .guard_config(config.guard_config())
            .counter_store(storage)
            .dispatch_timeout(config.dispatch_timeout())
            .mailbox_capacity(config.dispatch.mailbox_capacity)
            .audit_window(config.audit_window())
            .default_model(model);
        for node in &config.nodes {
            if let Some(initial) = &node.initial_state {
                builder = builder.initial_state(&node.id, initial.clone());
            }
        }
        let router = Arc::new(builder.build()?);

        Ok(Self { config, router })
    }

    pub fn router(&self) -> Arc<DirectiveRouter> {
        self.router.clone()
    }

    pub fn config(&self) -> &LatticeConfig {
        &self.config
    }

    /// Serve the API until Ctrl-C, then drain and flush.
    pub async fn run(self) -> Result<()> {
        let app = api::build_router(self.router.clone());
        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        info!(addr = %self.config.api_addr, nodes = self.config.nodes.len(), "HTTP API listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.router.shutdown().await;
        info!("coordinator stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
