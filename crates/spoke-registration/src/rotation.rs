//! Hub client certificate rotation watch
//!
//! Hub clients read the certificate pair once, when they are built. After the
//! registration sub-process writes a rotated certificate the clients keep
//! presenting the old one until they are rebuilt. [`CredentialWatcher`]
//! reports when the certificate on disk differs from the one the clients were
//! built with and the new one is trusted.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cert_store::{HubKubeconfigDir, TrustProbe};
use crate::identity::AgentIdentity;

/// Default interval between rotation checks
pub const DEFAULT_ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Certificate the hub clients were built with
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialSnapshot(Option<Vec<u8>>);

impl CredentialSnapshot {
    /// Whether a certificate was on disk when the snapshot was taken
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

/// Watches the hub kubeconfig directory for a rotated client certificate
pub struct CredentialWatcher {
    probe: Arc<dyn TrustProbe>,
    dir: HubKubeconfigDir,
    expected: AgentIdentity,
    interval: Duration,
}

impl CredentialWatcher {
    /// Watcher over `dir`, accepting only certificates issued to `expected`
    pub fn new(probe: Arc<dyn TrustProbe>, dir: HubKubeconfigDir, expected: AgentIdentity) -> Self {
        Self {
            probe,
            dir,
            expected,
            interval: DEFAULT_ROTATION_CHECK_INTERVAL,
        }
    }

    /// Override the check interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Certificate currently on disk
    pub fn snapshot(&self) -> CredentialSnapshot {
        CredentialSnapshot(std::fs::read(self.dir.cert_path()).ok())
    }

    /// Wait until a trusted certificate other than `since` is on disk.
    ///
    /// Returns `false` when `token` is cancelled first. A changed certificate
    /// that is not yet trusted (mid-rotation, wrong identity) is ignored until
    /// it becomes valid.
    pub async fn wait_for_rotation(
        &self,
        since: &CredentialSnapshot,
        token: &CancellationToken,
    ) -> bool {
        let rotated = spoke_common::wait::poll_immediate_until(self.interval, token, || {
            let current = self.snapshot();
            let ready = !current.is_empty() && current != *since && {
                let state = self.probe.probe(&self.expected);
                if !state.is_valid() {
                    debug!(state = %state, "rotated certificate not yet trusted");
                }
                state.is_valid()
            };
            std::future::ready(ready.then_some(()))
        })
        .await;

        if rotated.is_some() {
            info!(identity = %self.expected, "hub client certificate rotated");
        }
        rotated.is_some()
    }
}
