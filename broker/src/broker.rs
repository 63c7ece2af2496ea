//! Broker orchestrator
//!
//! Wires the pieces together and owns the lifecycle: initialize the backend,
//! spawn the long-running tasks (backend reader, ingest server, status
//! reconciler), connect the configuration source to the ingest server and
//! the subscription manager, and drain everything on termination.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::Backend;
use crate::config::{self, FileConfigSource};
use crate::error::{BrokerError, Result};
use crate::ingest::IngestServer;
use crate::status::{StatusBackend, StatusManager, StatusManagerConfig};
use crate::subscriptions::SubscriptionManager;

/// Lifecycle phases of a broker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Where trigger configuration comes from.
pub enum ConfigSourceSpec {
    /// Watch a file, reacting quickly to changes.
    Watcher(PathBuf),
    /// Poll a file on a fixed period.
    Poller(PathBuf, Duration),
    /// A single inline snapshot applied at startup.
    Inline(String),
    /// No triggers; useful for pure-ingest deployments and tests.
    None,
}

pub struct Instance {
    backend: Arc<dyn Backend>,
    ingest: Arc<IngestServer>,
    subscriptions: Arc<SubscriptionManager>,
    status_manager: StatusManager,
    config_source: Mutex<Option<ConfigSourceSpec>>,
    status: Mutex<BrokerStatus>,
}

impl Instance {
    pub fn new(
        backend: Arc<dyn Backend>,
        port: u16,
        config_source: ConfigSourceSpec,
        status_config: StatusManagerConfig,
        status_backends: Vec<Arc<dyn StatusBackend>>,
    ) -> Self {
        debug!("creating subscription manager");
        let status_manager = StatusManager::new(status_config);
        for status_backend in status_backends {
            status_manager.register_backend(status_backend);
        }

        let subscriptions = Arc::new(SubscriptionManager::new(
            backend.clone(),
            status_manager.clone(),
        ));

        debug!("creating HTTP ingest server");
        let ingest = Arc::new(IngestServer::new(port, status_manager.clone()));

        Self {
            backend,
            ingest,
            subscriptions,
            status_manager,
            config_source: Mutex::new(Some(config_source)),
            status: Mutex::new(BrokerStatus::Stopped),
        }
    }

    pub fn status(&self) -> BrokerStatus {
        *self.status.lock()
    }

    /// The subscription manager, for probes and tests.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Run the broker until the context is cancelled or a task fails.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        info!(backend = self.backend.info().name, "starting broker instance");
        *self.status.lock() = BrokerStatus::Starting;

        // Termination signals cancel the same token that cancels every
        // subsystem, so one path drains everything.
        let sigctx = ctx.child_token();
        spawn_signal_handler(sigctx.clone());

        let probe_backend = self.backend.clone();
        self.ingest.register_probe_handler(Arc::new(move || {
            let backend = probe_backend.clone();
            async move { backend.probe().await.map_err(|e| e.to_string()) }.boxed()
        }));

        // Initialization connects and may run migrations; failure is fatal.
        debug!("initializing backend");
        self.backend.init(sigctx.clone()).await?;

        let mut group: JoinSet<Result<()>> = JoinSet::new();

        debug!("starting backend routine");
        let backend = self.backend.clone();
        let backend_ctx = sigctx.clone();
        group.spawn(async move { backend.start(backend_ctx).await });

        let status_manager = self.status_manager.clone();
        let status_ctx = sigctx.clone();
        group.spawn(async move {
            status_manager.run(status_ctx).await;
            Ok(())
        });

        // Configuration reaches the ingest server (credentials) and the
        // subscription manager (triggers), in that order.
        let config_source = self.config_source.lock().take();
        match config_source {
            Some(ConfigSourceSpec::Watcher(path)) => {
                debug!("starting broker configuration watcher");
                let mut source = FileConfigSource::watcher(path);
                source.add_callback(self.ingest.config_callback());
                source.add_callback(self.subscriptions.config_callback());
                source.start(sigctx.clone()).await?;
            }
            Some(ConfigSourceSpec::Poller(path, period)) => {
                debug!("starting broker configuration poller");
                let mut source = FileConfigSource::poller(path, period);
                source.add_callback(self.ingest.config_callback());
                source.add_callback(self.subscriptions.config_callback());
                source.start(sigctx.clone()).await?;
            }
            Some(ConfigSourceSpec::Inline(content)) => {
                let snapshot = config::parse(&content)?;
                self.ingest.update_from_config(&snapshot);
                self.subscriptions.update_from_config(&snapshot).await;
            }
            Some(ConfigSourceSpec::None) => {}
            None => return Err(BrokerError::Config("broker instance started twice".to_string())),
        }

        // Register the producer for received events before serving.
        let produce_backend = self.backend.clone();
        self.ingest.register_cloudevent_handler(Arc::new(move |event| {
            let backend = produce_backend.clone();
            async move { backend.produce(&event).await }.boxed()
        }));

        let ingest = self.ingest.clone();
        let ingest_ctx = sigctx.clone();
        group.spawn(async move { ingest.start(ingest_ctx).await });

        *self.status.lock() = BrokerStatus::Running;
        info!("broker instance running");

        // Errgroup semantics: the first failure cancels the rest; shutdown
        // then waits for every task to settle.
        let mut first_error = None;
        while let Some(joined) = group.join_next().await {
            *self.status.lock() = BrokerStatus::Stopping;
            sigctx.cancel();
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "broker task failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "broker task panicked");
                    first_error
                        .get_or_insert_with(|| BrokerError::Transport(e.to_string()));
                }
            }
        }

        *self.status.lock() = BrokerStatus::Stopped;
        info!("broker instance stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Cancel the token on SIGINT or SIGTERM.
fn spawn_signal_handler(ctx: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!(error = %e, "could not install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
                _ = ctx.cancelled() => return,
            }
        }
        #[cfg(not(unix))]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = ctx.cancelled() => return,
        }

        info!("termination signal received, draining");
        ctx.cancel();
    });
}
