//! Cleans up the resources of a deleted AppliedManifestWork.
//!
//! Every recorded resource is deleted with background propagation. The
//! finalizer is only removed once none of them exist any more, so the
//! record survives until the spoke is actually clean.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use spoke_common::crd::{AppliedManifestWork, AppliedManifestWorkStatus};
use spoke_common::events::{actions, reasons};
use spoke_common::kube_utils::without_finalizer;
use spoke_common::{Result, APPLIED_MANIFEST_WORK_FINALIZER};

use crate::context::{event_ref, AgentContext};
use crate::controllers::REQUEUE_DELETION;

/// Delete applied resources, then release the spoke finalizer
pub async fn reconcile(applied: Arc<AppliedManifestWork>, ctx: Arc<AgentContext>) -> Result<Action> {
    if !applied.is_deleting()
        || !applied.has_finalizer(APPLIED_MANIFEST_WORK_FINALIZER)
        || !ctx.owns(&applied)
    {
        return Ok(Action::await_change());
    }
    let name = applied.name_any();
    let recorded = applied.applied_resources();

    let mut remaining = Vec::new();
    for resource in recorded {
        if ctx.applier.delete(resource).await? {
            remaining.push(resource.clone());
        }
    }

    if !remaining.is_empty() {
        debug!(applied_work = %name, remaining = remaining.len(), "waiting for applied resources to go away");
        if remaining.len() != recorded.len() {
            ctx.spoke
                .patch_applied_resources(
                    &name,
                    &AppliedManifestWorkStatus {
                        applied_resources: remaining,
                        eviction_start_time: applied.eviction_start_time(),
                    },
                )
                .await?;
        }
        return Ok(Action::requeue(REQUEUE_DELETION));
    }

    if let Some(finalizers) = without_finalizer(
        applied.metadata.finalizers.as_deref(),
        APPLIED_MANIFEST_WORK_FINALIZER,
    ) {
        ctx.spoke
            .patch_finalizers(&name, applied.resource_version(), finalizers)
            .await?;
    }
    info!(applied_work = %name, resources = recorded.len(), "applied resources deleted");
    ctx.spoke_events
        .publish(
            &event_ref(applied.as_ref()),
            EventType::Normal,
            reasons::RESOURCES_DELETED,
            actions::DELETE,
            None,
        )
        .await;
    Ok(Action::await_change())
}
