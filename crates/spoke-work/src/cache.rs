//! Shared informer caches
//!
//! One watch per resource type feeds a shared reflector store. Every
//! controller that cares about the type subscribes to the same stream, so the
//! agent holds a single watch per type regardless of controller count.
//! Subscriptions must be taken before the cache task is started.

use std::fmt::Debug;
use std::future::Future;

use futures::StreamExt;
use kube::runtime::reflector::{self, ReflectHandle, Store};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use spoke_common::{Error, Result};

/// Watch timeout in seconds, kept below the client read timeout so idle
/// watches are closed by the server first
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Events buffered per subscriber before the watch applies backpressure
const SUBSCRIBER_BUFFER: usize = 256;

/// A watch-backed store shared by several controllers
pub struct SharedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    name: &'static str,
    api: Api<K>,
    config: watcher::Config,
    reader: Store<K>,
    writer: reflector::store::Writer<K>,
}

impl<K> SharedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Cache over every object `api` can list
    pub fn new(name: &'static str, api: Api<K>) -> Self {
        let (reader, writer) = reflector::store_shared(SUBSCRIBER_BUFFER);
        Self {
            name,
            api,
            config: watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
            reader,
            writer,
        }
    }

    /// Read handle on the cached objects
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Change notifications for one controller
    pub fn subscribe(&self) -> Result<ReflectHandle<K>> {
        self.writer.subscribe().ok_or_else(|| {
            Error::internal_with_context(self.name, "cache does not support subscriptions")
        })
    }

    /// Watch task that fills the store and feeds subscribers until `token`
    /// is cancelled
    pub fn into_task(self, token: CancellationToken) -> impl Future<Output = ()> + Send + 'static {
        let name = self.name;
        let stream = watcher(self.api, self.config)
            .default_backoff()
            .reflect_shared(self.writer)
            .for_each(move |event| {
                if let Err(e) = event {
                    warn!(cache = name, error = %e, "watch error");
                }
                std::future::ready(())
            });
        async move {
            info!(cache = name, "starting cache");
            tokio::select! {
                _ = stream => warn!(cache = name, "watch stream ended"),
                _ = token.cancelled() => debug!(cache = name, "cache stopped"),
            }
        }
    }
}

/// Wait until the initial list of `store` has completed
pub async fn wait_for_sync<K>(name: &str, store: &Store<K>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store
        .wait_until_ready()
        .await
        .map_err(|_| Error::internal_with_context(name, "cache writer dropped before sync"))?;
    info!(cache = name, objects = store.state().len(), "cache synced");
    Ok(())
}
