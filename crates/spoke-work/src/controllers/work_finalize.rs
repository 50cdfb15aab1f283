//! Releases a deleted ManifestWork once its AppliedManifestWork is gone.
//!
//! Deleting the AppliedManifestWork hands resource cleanup to the spoke side
//! (applied_finalize); the hub finalizer is only removed after that finishes.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};

use spoke_common::crd::ManifestWork;
use spoke_common::kube_utils::without_finalizer;
use spoke_common::{Result, MANIFEST_WORK_FINALIZER};

use crate::context::AgentContext;
use crate::controllers::REQUEUE_DELETION;

/// Drive a deleted ManifestWork to finalizer removal
pub async fn reconcile(work: Arc<ManifestWork>, ctx: Arc<AgentContext>) -> Result<Action> {
    if !work.is_deleting() || !work.has_finalizer(MANIFEST_WORK_FINALIZER) {
        return Ok(Action::await_change());
    }
    let name = work.name_any();
    let applied_name = ctx.applied_work_name(&name);

    if let Some(applied) = ctx.spoke.get(&applied_name).await? {
        if !applied.is_deleting() {
            ctx.spoke.delete(&applied_name).await?;
            info!(work = %name, applied_work = %applied_name, "deleting applied manifest work");
        } else {
            debug!(work = %name, "waiting for applied manifest work cleanup");
        }
        return Ok(Action::requeue(REQUEUE_DELETION));
    }

    if let Some(finalizers) =
        without_finalizer(work.metadata.finalizers.as_deref(), MANIFEST_WORK_FINALIZER)
    {
        ctx.hub
            .patch_finalizers(&name, work.resource_version(), finalizers)
            .await?;
        info!(work = %name, "removed cleanup finalizer");
    }
    Ok(Action::await_change())
}
