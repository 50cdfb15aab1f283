//! Evicts AppliedManifestWorks whose ManifestWork is gone.
//!
//! An AppliedManifestWork owned by this agent is unmanaged when it was
//! created for another hub or its ManifestWork is absent from the hub cache.
//! The first time that is observed the eviction clock starts
//! (`status.evictionStartTime`); once the grace period has elapsed the
//! record is deleted, which removes its resources through applied_finalize.
//! If the ManifestWork comes back in the meantime the clock is cleared.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::info;

use spoke_common::crd::AppliedManifestWork;
use spoke_common::events::{actions, reasons};
use spoke_common::Result;

use crate::context::{event_ref, AgentContext};

/// What to do with an unmanaged AppliedManifestWork
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionDecision {
    /// Record now as the eviction start
    StartClock,
    /// Grace period still running for this long
    Wait(Duration),
    /// Grace period elapsed
    Evict,
}

/// Decide based on when eviction started and the grace period
pub fn eviction_decision(
    started: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: Duration,
) -> EvictionDecision {
    let Some(started) = started else {
        return EvictionDecision::StartClock;
    };
    // A start time in the future counts as just started.
    let elapsed = (now - started).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= grace {
        EvictionDecision::Evict
    } else {
        EvictionDecision::Wait(grace - elapsed)
    }
}

/// Start, wait out, clear or complete eviction of an AppliedManifestWork
pub async fn reconcile(applied: Arc<AppliedManifestWork>, ctx: Arc<AgentContext>) -> Result<Action> {
    if !ctx.owns(&applied) || applied.is_deleting() {
        return Ok(Action::await_change());
    }
    let name = applied.name_any();
    let managed = applied.spec.hub_hash == ctx.hub_hash
        && ctx.work(&applied.spec.manifest_work_name).is_some();

    if managed {
        if applied.eviction_start_time().is_some() {
            ctx.spoke.set_eviction_start_time(&name, None).await?;
            info!(applied_work = %name, "manifest work is back, eviction cancelled");
        }
        return Ok(Action::await_change());
    }

    let now = Utc::now();
    match eviction_decision(applied.eviction_start_time(), now, ctx.eviction_grace_period) {
        EvictionDecision::StartClock => {
            ctx.spoke.set_eviction_start_time(&name, Some(now)).await?;
            info!(
                applied_work = %name,
                grace = ?ctx.eviction_grace_period,
                "manifest work missing, eviction clock started"
            );
            ctx.spoke_events
                .publish(
                    &event_ref(applied.as_ref()),
                    EventType::Normal,
                    reasons::EVICTION_STARTED,
                    actions::EVICT,
                    None,
                )
                .await;
            Ok(Action::requeue(ctx.eviction_grace_period))
        }
        EvictionDecision::Wait(remaining) => Ok(Action::requeue(remaining)),
        EvictionDecision::Evict => {
            ctx.spoke.delete(&name).await?;
            info!(applied_work = %name, "evicted unmanaged applied manifest work");
            ctx.spoke_events
                .publish(
                    &event_ref(applied.as_ref()),
                    EventType::Normal,
                    reasons::EVICTED,
                    actions::EVICT,
                    None,
                )
                .await;
            Ok(Action::await_change())
        }
    }
}
