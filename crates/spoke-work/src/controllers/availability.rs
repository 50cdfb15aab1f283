//! Availability status controller
//!
//! Every `status_sync_interval` each manifest reported in a ManifestWork's
//! status is checked against the spoke: the object recorded on the
//! AppliedManifestWork must still exist with its recorded UID. The result is
//! written as a per-manifest `Available` condition plus an aggregate one.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::debug;

use spoke_common::crd::{
    set_condition, AppliedManifestResourceMeta, Condition, ConditionStatus, ManifestWork,
    WORK_AVAILABLE,
};
use spoke_common::{Result, MANIFEST_WORK_FINALIZER};

use crate::context::AgentContext;

/// Per-manifest and aggregate condition reasons
pub mod reason {
    /// The object exists on the spoke
    pub const AVAILABLE: &str = "ResourceAvailable";
    /// The object was applied but is gone
    pub const MISSING: &str = "ResourceMissing";
    /// Nothing was recorded for the manifest
    pub const NOT_APPLIED: &str = "ResourceNotApplied";
    /// The existence check failed
    pub const FETCH_FAILED: &str = "FetchingResourceFailed";
    /// Every manifest is available
    pub const ALL_AVAILABLE: &str = "ResourcesAvailable";
    /// At least one manifest is missing
    pub const SOME_MISSING: &str = "ResourcesNotAvailable";
    /// Availability of some manifest is not known
    pub const UNKNOWN: &str = "ResourcesStatusUnknown";
}

/// Refresh `Available` conditions of a ManifestWork
pub async fn reconcile(work: Arc<ManifestWork>, ctx: Arc<AgentContext>) -> Result<Action> {
    let requeue = Action::requeue(ctx.status_sync_interval);
    if work.is_deleting() || !work.has_finalizer(MANIFEST_WORK_FINALIZER) {
        return Ok(Action::await_change());
    }
    let Some(previous) = work.status.clone() else {
        return Ok(requeue);
    };
    if previous.resource_status.manifests.is_empty() {
        return Ok(requeue);
    }
    let name = work.name_any();
    let applied = ctx.applied_work(&ctx.applied_work_name(&name));
    let recorded = applied
        .as_ref()
        .map(|a| a.applied_resources())
        .unwrap_or_default();

    let mut status = previous.clone();
    let mut statuses = Vec::with_capacity(status.resource_status.manifests.len());
    for manifest in &mut status.resource_status.manifests {
        let id = manifest.resource_meta.identifier();
        let condition = check(&ctx, recorded.iter().find(|r| r.identifier() == id)).await;
        statuses.push(condition.status.clone());
        set_condition(&mut manifest.conditions, condition);
    }
    set_condition(
        &mut status.conditions,
        aggregate(&statuses).with_generation(work.metadata.generation),
    );

    if status != previous {
        debug!(work = %name, "availability changed");
        ctx.hub.patch_status(&name, &status).await?;
    }
    Ok(requeue)
}

async fn check(ctx: &AgentContext, recorded: Option<&AppliedManifestResourceMeta>) -> Condition {
    let Some(resource) = recorded else {
        return Condition::new(
            WORK_AVAILABLE,
            ConditionStatus::Unknown,
            reason::NOT_APPLIED,
            "Manifest has not been applied",
        );
    };
    match ctx.applier.exists(resource).await {
        Ok(true) => Condition::new(
            WORK_AVAILABLE,
            ConditionStatus::True,
            reason::AVAILABLE,
            "Resource is available",
        ),
        Ok(false) => Condition::new(
            WORK_AVAILABLE,
            ConditionStatus::False,
            reason::MISSING,
            "Resource is not available",
        ),
        Err(e) => Condition::new(
            WORK_AVAILABLE,
            ConditionStatus::Unknown,
            reason::FETCH_FAILED,
            format!("Failed to get resource: {}", e),
        ),
    }
}

/// Work-level `Available` condition from the per-manifest statuses
pub fn aggregate(statuses: &[ConditionStatus]) -> Condition {
    let missing = statuses
        .iter()
        .filter(|s| **s == ConditionStatus::False)
        .count();
    let unknown = statuses
        .iter()
        .filter(|s| **s == ConditionStatus::Unknown)
        .count();
    if missing > 0 {
        Condition::new(
            WORK_AVAILABLE,
            ConditionStatus::False,
            reason::SOME_MISSING,
            format!("{} of {} resources are not available", missing, statuses.len()),
        )
    } else if unknown > 0 {
        Condition::new(
            WORK_AVAILABLE,
            ConditionStatus::Unknown,
            reason::UNKNOWN,
            format!("{} of {} resources have unknown status", unknown, statuses.len()),
        )
    } else {
        Condition::new(
            WORK_AVAILABLE,
            ConditionStatus::True,
            reason::ALL_AVAILABLE,
            "All resources are available",
        )
    }
}
