//! Prunes applied resources a ManifestWork no longer declares.
//!
//! The apply controller keeps old records on the AppliedManifestWork; this
//! controller compares them against the work's reported resource status and
//! deletes what dropped out. Deletes are guarded by the recorded UID so an
//! object recreated by someone else under the same name is left alone.

use std::collections::HashSet;
use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use spoke_common::crd::{
    find_condition, AppliedManifestResourceMeta, AppliedManifestWork, AppliedManifestWorkStatus,
    ManifestWork, WORK_APPLIED,
};
use spoke_common::events::{actions, reasons};
use spoke_common::Result;

use crate::context::{event_ref, AgentContext};
use crate::controllers::REQUEUE_ERROR;

/// Delete and forget resources missing from the ManifestWork's status
pub async fn reconcile(applied: Arc<AppliedManifestWork>, ctx: Arc<AgentContext>) -> Result<Action> {
    if applied.is_deleting() || applied.spec.hub_hash != ctx.hub_hash || !ctx.owns(&applied) {
        return Ok(Action::await_change());
    }
    let Some(work) = ctx.work(&applied.spec.manifest_work_name) else {
        return Ok(Action::await_change());
    };
    if !status_is_current(&work) {
        debug!(work = %work.name_any(), "work status not yet reported for this generation");
        return Ok(Action::requeue(REQUEUE_ERROR));
    }
    if !status_is_resolved(&work) {
        debug!(work = %work.name_any(), "work status has unresolved manifests");
        return Ok(Action::requeue(REQUEUE_ERROR));
    }

    let (keep, stale) = partition_stale(&work, applied.applied_resources());
    if stale.is_empty() {
        return Ok(Action::await_change());
    }

    let name = applied.name_any();
    for resource in &stale {
        ctx.applier.delete(resource).await?;
        info!(applied_work = %name, resource = %resource.identifier(), "pruned resource");
    }
    ctx.spoke
        .patch_applied_resources(
            &name,
            &AppliedManifestWorkStatus {
                applied_resources: keep,
                eviction_start_time: applied.eviction_start_time(),
            },
        )
        .await?;
    ctx.spoke_events
        .publish(
            &event_ref(applied.as_ref()),
            EventType::Normal,
            reasons::RESOURCES_PRUNED,
            actions::DELETE,
            Some(format!("{} resources no longer declared", stale.len())),
        )
        .await;
    Ok(Action::await_change())
}

/// Whether the work's `Applied` condition reflects its current generation
pub fn status_is_current(work: &ManifestWork) -> bool {
    work.status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, WORK_APPLIED))
        .is_some_and(|c| c.observed_generation == work.metadata.generation)
}

/// Whether every manifest in the work's status names its resource.
///
/// An unresolved manifest cannot be matched against applied records, so
/// pruning waits until it resolves.
pub fn status_is_resolved(work: &ManifestWork) -> bool {
    work.status.as_ref().is_some_and(|s| {
        s.resource_status
            .manifests
            .iter()
            .all(|m| !m.resource_meta.resource.is_empty())
    })
}

/// Split applied records into those still declared and those to prune
pub fn partition_stale(
    work: &ManifestWork,
    applied: &[AppliedManifestResourceMeta],
) -> (Vec<AppliedManifestResourceMeta>, Vec<AppliedManifestResourceMeta>) {
    let declared: HashSet<_> = work.declared_resources().into_iter().collect();
    applied
        .iter()
        .cloned()
        .partition(|r| declared.contains(&r.identifier()))
}
