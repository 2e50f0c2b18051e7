//! Background eviction of idle nodes
//!
//! The sweeper calls [`NodesRegistry::clean`] on a fixed interval until it
//! is stopped. Eviction runs on the blocking pool since registry backends may
//! block.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::node::NodesRegistry;

/// Spawns the periodic `clean()` task
pub struct Sweeper;

impl Sweeper {
    /// Start sweeping `registry` every `interval`; must be called inside a tokio runtime
    pub fn spawn(registry: Arc<dyn NodesRegistry>, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(Self::run(registry, interval, shutdown_rx));
        SweeperHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }

    async fn run(registry: Arc<dyn NodesRegistry>, interval: Duration, mut shutdown_rx: oneshot::Receiver<()>) -> usize {
        info!(?interval, "Sweeper starting");
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        let mut total = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let registry = registry.clone();
                    match tokio::task::spawn_blocking(move || registry.clean()).await {
                        Ok(Ok(evicted)) => {
                            debug!(evicted, "Sweeper: pass done");
                            total += evicted;
                        }
                        Ok(Err(e)) => warn!(error = %e, "Sweeper: clean failed"),
                        Err(e) => warn!(error = %e, "Sweeper: clean task panicked"),
                    }
                }
                _ = &mut shutdown_rx => {
                    info!(total, "Sweeper stopping");
                    break;
                }
            }
        }
        total
    }
}

/// Handle to a running sweeper
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<usize>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it, returning how many nodes it evicted
    pub async fn stop(mut self) -> usize {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.join.await {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, "Sweeper task failed");
                0
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
