//! Controller runner - builds the work controller futures
//!
//! Every controller reads from the two shared caches instead of opening its
//! own watch. The returned futures do nothing until polled, and must be
//! polled after the cache tasks have been started.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use spoke_common::crd::{AppliedManifestWork, ManifestWork};
use spoke_common::Result;

use crate::cache::SharedCache;
use crate::context::AgentContext;
use crate::controllers::{
    add_finalizer, applied_finalize, applied_sync, apply, availability, error_policy, unmanaged,
    work_finalize,
};

/// Default number of objects each controller reconciles concurrently
pub const DEFAULT_WORKERS: u16 = 1;

/// A controller future with the name it logs under
pub type NamedTask = (&'static str, Pin<Box<dyn Future<Output = ()> + Send>>);

/// Build every work controller.
///
/// Each controller reconciles up to `workers` objects at once and stops
/// accepting new work once `token` is cancelled.
pub fn build_work_controllers(
    ctx: Arc<AgentContext>,
    works: &SharedCache<ManifestWork>,
    applied_works: &SharedCache<AppliedManifestWork>,
    workers: u16,
    token: &CancellationToken,
) -> Result<Vec<NamedTask>> {
    let config = controller::Config::default().concurrency(workers);
    let mut tasks: Vec<NamedTask> = Vec::new();

    info!("- add-finalizer controller");
    tasks.push((
        "add-finalizer",
        Box::pin(
            Controller::for_shared_stream(works.subscribe()?, works.store())
                .with_config(config.clone())
                .graceful_shutdown_on(token.clone().cancelled_owned())
                .run(add_finalizer::reconcile, error_policy, ctx.clone())
                .for_each(log_reconcile_result("AddFinalizer")),
        ),
    ));

    info!("- manifestwork controller");
    tasks.push((
        "manifestwork",
        Box::pin(
            Controller::for_shared_stream(works.subscribe()?, works.store())
                .with_config(config.clone())
                .graceful_shutdown_on(token.clone().cancelled_owned())
                .run(apply::reconcile, error_policy, ctx.clone())
                .for_each(log_reconcile_result("ManifestWork")),
        ),
    ));

    info!("- manifestwork-finalize controller");
    let hub_hash = ctx.hub_hash.clone();
    let cluster = ctx.cluster_name.clone();
    tasks.push((
        "manifestwork-finalize",
        Box::pin(
            Controller::for_shared_stream(works.subscribe()?, works.store())
                .watches_shared_stream(applied_works.subscribe()?, move |applied| {
                    (applied.spec.hub_hash == hub_hash).then(|| {
                        ObjectRef::<ManifestWork>::new(&applied.spec.manifest_work_name)
                            .within(&cluster)
                    })
                })
                .with_config(config.clone())
                .graceful_shutdown_on(token.clone().cancelled_owned())
                .run(work_finalize::reconcile, error_policy, ctx.clone())
                .for_each(log_reconcile_result("ManifestWorkFinalize")),
        ),
    ));

    info!("- appliedmanifestwork controller");
    let sync_ctx = ctx.clone();
    tasks.push((
        "appliedmanifestwork",
        Box::pin(
            Controller::for_shared_stream(applied_works.subscribe()?, applied_works.store())
                .watches_shared_stream(works.subscribe()?, move |work| {
                    Some(applied_ref(&sync_ctx, &work))
                })
                .with_config(config.clone())
                .graceful_shutdown_on(token.clone().cancelled_owned())
                .run(applied_sync::reconcile, error_policy, ctx.clone())
                .for_each(log_reconcile_result("AppliedManifestWork")),
        ),
    ));

    info!("- appliedmanifestwork-finalize controller");
    tasks.push((
        "appliedmanifestwork-finalize",
        Box::pin(
            Controller::for_shared_stream(applied_works.subscribe()?, applied_works.store())
                .with_config(config.clone())
                .graceful_shutdown_on(token.clone().cancelled_owned())
                .run(applied_finalize::reconcile, error_policy, ctx.clone())
                .for_each(log_reconcile_result("AppliedManifestWorkFinalize")),
        ),
    ));

    info!("- unmanaged-appliedmanifestwork controller");
    let eviction_ctx = ctx.clone();
    tasks.push((
        "unmanaged-appliedmanifestwork",
        Box::pin(
            Controller::for_shared_stream(applied_works.subscribe()?, applied_works.store())
                .watches_shared_stream(works.subscribe()?, move |work| {
                    Some(applied_ref(&eviction_ctx, &work))
                })
                .with_config(config.clone())
                .graceful_shutdown_on(token.clone().cancelled_owned())
                .run(unmanaged::reconcile, error_policy, ctx.clone())
                .for_each(log_reconcile_result("UnmanagedAppliedManifestWork")),
        ),
    ));

    info!("- availability-status controller");
    tasks.push((
        "availability-status",
        Box::pin(
            Controller::for_shared_stream(works.subscribe()?, works.store())
                .with_config(config)
                .graceful_shutdown_on(token.clone().cancelled_owned())
                .run(availability::reconcile, error_policy, ctx)
                .for_each(log_reconcile_result("AvailabilityStatus")),
        ),
    ));

    Ok(tasks)
}

fn applied_ref(ctx: &AgentContext, work: &ManifestWork) -> ObjectRef<AppliedManifestWork> {
    ObjectRef::new(&ctx.applied_work_name(&work.name_any()))
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::test_support::Mocks;
    use kube::{Api, Client};

    /// Client that is never polled; building controllers does not connect
    fn idle_client() -> Client {
        // Both ring and aws-lc-rs are enabled in the dependency graph, so
        // pick the same provider the binary installs at startup.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        Client::try_from(kube::Config::new("http://127.0.0.1:9".parse().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn builds_every_work_controller_once() {
        let client = idle_client();
        let works = SharedCache::new(
            "manifestworks",
            Api::<ManifestWork>::namespaced(client.clone(), "cluster1"),
        );
        let applied_works = SharedCache::new(
            "appliedmanifestworks",
            Api::<AppliedManifestWork>::all(client),
        );

        let tasks = build_work_controllers(
            Mocks::new().into_context(),
            &works,
            &applied_works,
            DEFAULT_WORKERS,
            &CancellationToken::new(),
        )
        .unwrap();

        let names: Vec<_> = tasks.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec![
                "add-finalizer",
                "manifestwork",
                "manifestwork-finalize",
                "appliedmanifestwork",
                "appliedmanifestwork-finalize",
                "unmanaged-appliedmanifestwork",
                "availability-status",
            ]
        );
    }

    #[test]
    fn applied_work_ref_uses_hub_hash_prefix() {
        let ctx = Mocks::new().into_context();
        let work = crate::controllers::test_support::work("work-a", vec![]);
        assert_eq!(applied_ref(&ctx, &work).name, "hubhash-work-a");
    }
}
