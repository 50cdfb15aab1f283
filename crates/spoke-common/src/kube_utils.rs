//! Kubernetes client construction and small API helpers shared by the agent
//!
//! Every client the agent builds goes through [`client_with_rate_limit`] so
//! the configured QPS and burst apply to hub and spoke traffic alike.

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::client::ClientBuilder;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower::limit::RateLimitLayer;
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side request throttling
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimit {
    /// Sustained requests per second
    pub qps: f32,
    /// Requests allowed in one burst
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            qps: 50.0,
            burst: 100,
        }
    }
}

impl RateLimit {
    /// Window over which `burst` requests are allowed.
    ///
    /// A full burst refills in `burst / qps` seconds, which keeps the long run
    /// rate at `qps`.
    pub fn window(&self) -> Duration {
        if self.qps <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64(f64::from(self.burst.max(1)) / f64::from(self.qps))
    }

    fn layer(&self) -> RateLimitLayer {
        RateLimitLayer::new(u64::from(self.burst.max(1)), self.window())
    }
}

/// Load a client config from a kubeconfig file, or infer it when `None`.
///
/// Timeouts are set to the agent defaults.
pub async fn load_config(kubeconfig: Option<&Path>) -> Result<Config, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "load_config",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "load_config",
                        format!("failed to load kubeconfig {}: {}", path.display(), e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("load_config", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}

/// Build a client that throttles requests to the given rate
pub fn client_with_rate_limit(config: Config, rate: RateLimit) -> Result<Client, Error> {
    debug!(
        cluster_url = %config.cluster_url,
        qps = rate.qps,
        burst = rate.burst,
        "building rate limited client"
    );
    let builder = ClientBuilder::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })?;
    Ok(builder.with_layer(&rate.layer()).build())
}

/// Load a config and build a rate limited client in one step
pub async fn create_client(kubeconfig: Option<&Path>, rate: RateLimit) -> Result<Client, Error> {
    let config = load_config(kubeconfig).await?;
    client_with_rate_limit(config, rate)
}

/// Lowercase hex SHA-256 of the hub server URL.
///
/// Used to name AppliedManifestWorks so works from different hubs with the
/// same name never collide on one spoke.
pub fn hub_hash(server: &str) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, server.as_bytes());
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Patch a resource's status subresource with a merge patch
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<K, Error>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    Ok(api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

/// Finalizer list with `finalizer` added, or `None` if already present
pub fn with_finalizer(existing: Option<&[String]>, finalizer: &str) -> Option<Vec<String>> {
    let current = existing.unwrap_or_default();
    if current.iter().any(|f| f == finalizer) {
        return None;
    }
    let mut updated = current.to_vec();
    updated.push(finalizer.to_string());
    Some(updated)
}

/// Finalizer list with `finalizer` removed, or `None` if it was absent
pub fn without_finalizer(existing: Option<&[String]>, finalizer: &str) -> Option<Vec<String>> {
    let current = existing.unwrap_or_default();
    if !current.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(
        current
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect(),
    )
}

/// Replace an object's finalizer list.
///
/// The patch carries the observed resourceVersion so a concurrent finalizer
/// change by another controller fails with a conflict instead of being lost.
pub async fn patch_finalizers<K>(
    api: &Api<K>,
    name: &str,
    resource_version: Option<&str>,
    finalizers: Vec<String>,
) -> Result<(), Error>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    let mut metadata = serde_json::json!({ "finalizers": finalizers });
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = serde_json::Value::String(rv.to_string());
    }
    let patch = serde_json::json!({ "metadata": metadata });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_hash_is_stable_sha256_hex() {
        let hash = hub_hash("https://hub.example.com:6443");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, hub_hash("https://hub.example.com:6443"));
        assert_ne!(hash, hub_hash("https://other-hub.example.com:6443"));
        assert_eq!(
            hub_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn rate_limit_window_matches_qps() {
        let rate = RateLimit::default();
        assert_eq!(rate.window(), Duration::from_secs(2));

        let slow = RateLimit { qps: 5.0, burst: 10 };
        assert_eq!(slow.window(), Duration::from_secs(2));

        let disabled = RateLimit { qps: 0.0, burst: 10 };
        assert_eq!(disabled.window(), Duration::from_secs(1));
    }

    #[test]
    fn with_finalizer_is_idempotent() {
        let added = with_finalizer(None, "a").unwrap();
        assert_eq!(added, vec!["a".to_string()]);
        assert!(with_finalizer(Some(added.as_slice()), "a").is_none());

        let more = with_finalizer(Some(added.as_slice()), "b").unwrap();
        assert_eq!(more, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn without_finalizer_keeps_others() {
        let existing = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            without_finalizer(Some(existing.as_slice()), "a").unwrap(),
            vec!["b".to_string()]
        );
        assert!(without_finalizer(Some(existing.as_slice()), "c").is_none());
        assert!(without_finalizer(None, "a").is_none());
    }
}
