//! Debounced IdP rollout
//!
//! Every successful write wants the IdP pods restarted so they pick up the
//! new users file, but a burst of writes must not produce a burst of
//! restarts. Requests are coalesced: the first one opens a window, and a
//! single restart fires once the window closes. The window bounds how far
//! the running IdP lags the bucket.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::kubernetes::ClusterClient;

/// Default coalescing window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Handle for requesting a rollout.
pub struct RolloutCoalescer {
    tx: mpsc::Sender<()>,
}

impl RolloutCoalescer {
    /// Spawn the coalescing task targeting one DaemonSet.
    #[must_use]
    pub fn spawn(
        cluster: Arc<dyn ClusterClient>,
        namespace: String,
        daemonset: String,
        window: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<()>(16);

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Let the window fill up, then fold everything queued
                // meanwhile into this one restart
                tokio::time::sleep(window).await;
                while rx.try_recv().is_ok() {}

                debug!(daemonset = %daemonset, "triggering idp rollout");
                if let Err(e) = cluster.restart_daemonset(&namespace, &daemonset).await {
                    // The next write requests another rollout; nothing to
                    // retry here
                    warn!(error = %e, daemonset = %daemonset, "idp rollout failed");
                }
            }
        });

        Self { tx }
    }

    /// Request a rollout. Requests inside an open window coalesce into the
    /// window's single restart.
    pub fn request(&self) {
        // A full queue means a restart is already pending
        let _ = self.tx.try_send(());
    }
}
