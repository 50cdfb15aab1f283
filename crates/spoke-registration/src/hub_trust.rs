//! Hub trust bootstrapper
//!
//! Blocks the agent's startup path until the certificate store reports a
//! valid, identity-matching client certificate. The probe runs immediately
//! and then at a fixed interval with no retry cap: credential issuance
//! happens on an external timescale (a hub admin approving a CSR), so the
//! wait is expected to be long and must survive hub outages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cert_store::{HubKubeconfigDir, TrustProbe, TrustState};
use crate::error::TrustError;
use crate::identity::AgentIdentity;

/// Default interval between trust probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Trusted connection descriptor for the hub.
///
/// Only constructed from a `Valid` trust state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubConnection {
    /// Hub kubeconfig referencing the trusted certificate pair
    pub kubeconfig_path: PathBuf,
    /// Identity the certificate was verified against
    pub identity: AgentIdentity,
}

/// Waits for the hub client certificate to become trusted
pub struct HubTrustBootstrapper {
    probe: Arc<dyn TrustProbe>,
    dir: HubKubeconfigDir,
    expected: AgentIdentity,
    interval: Duration,
}

impl HubTrustBootstrapper {
    /// Bootstrapper probing `dir` for a certificate issued to `expected`
    pub fn new(probe: Arc<dyn TrustProbe>, dir: HubKubeconfigDir, expected: AgentIdentity) -> Self {
        Self {
            probe,
            dir,
            expected,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until the trust state is `Valid` or `token` is cancelled.
    ///
    /// Non-valid states are logged at debug level and retried. Cancellation
    /// interrupts the sleep between probes.
    pub async fn wait_for_trust(
        &self,
        token: &CancellationToken,
    ) -> Result<HubConnection, TrustError> {
        info!(
            identity = %self.expected,
            dir = %self.dir.path().display(),
            "waiting for hub kubeconfig"
        );
        let mut last: Option<TrustState> = None;
        let mut attempt: u64 = 0;

        let trusted = spoke_common::wait::poll_immediate_until(self.interval, token, || {
            attempt += 1;
            let state = self.probe.probe(&self.expected);
            let ready = state.is_valid();
            if !ready {
                debug!(attempt, state = %state, "hub kubeconfig not ready");
            }
            last = Some(state);
            std::future::ready(ready.then_some(()))
        })
        .await;

        match trusted {
            Some(()) => {
                info!(identity = %self.expected, attempts = attempt, "hub kubeconfig is valid");
                Ok(HubConnection {
                    kubeconfig_path: self.dir.kubeconfig_path(),
                    identity: self.expected.clone(),
                })
            }
            None => Err(TrustError::Cancelled {
                last_state: last.map_or_else(|| "not probed".to_string(), |s| s.to_string()),
            }),
        }
    }
}
