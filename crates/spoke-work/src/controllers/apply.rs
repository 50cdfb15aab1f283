//! Apply controller
//!
//! For each finalized, live ManifestWork:
//! 1. ensure its AppliedManifestWork exists on the spoke
//! 2. check the executor may write each manifest
//! 3. server-side apply each manifest, owned by the AppliedManifestWork
//! 4. report per-manifest `Applied` conditions and the aggregate condition
//!    to the hub, and record what was applied on the AppliedManifestWork
//!
//! A failed manifest does not stop the others; the work is retried after a
//! short delay until every manifest applies.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use spoke_common::crd::{
    find_condition, set_condition, AppliedManifestResourceMeta, AppliedManifestWork,
    AppliedManifestWorkSpec, AppliedManifestWorkStatus, Condition, ConditionStatus, Manifest,
    ManifestCondition, ManifestResourceMeta, ManifestResourceStatus, ManifestWork,
    ManifestWorkStatus, WORK_APPLIED,
};
use spoke_common::events::{actions, reasons};
use spoke_common::{Error, Result, APPLIED_MANIFEST_WORK_FINALIZER, MANIFEST_WORK_FINALIZER};

use crate::applier::ManifestHeader;
use crate::context::{event_ref, AgentContext};
use crate::controllers::{HUB_RESYNC_PERIOD, REQUEUE_DELETION, REQUEUE_ERROR};
use crate::validator::ExecutorDecision;

/// Per-manifest condition reasons
pub mod reason {
    /// The manifest was applied
    pub const APPLIED: &str = "AppliedManifestComplete";
    /// The manifest could not be applied
    pub const FAILED: &str = "AppliedManifestFailed";
    /// The executor may not write the manifest
    pub const EXECUTOR_DENIED: &str = "ExecutorDenied";
}

/// Outcome of applying one manifest
#[derive(Clone, Debug)]
pub struct ManifestOutcome {
    /// Status metadata of the manifest
    pub meta: ManifestResourceMeta,
    /// `Applied` condition for the manifest
    pub condition: Condition,
    /// Record of the applied object, when the apply succeeded
    pub applied: Option<AppliedManifestResourceMeta>,
}

impl ManifestOutcome {
    fn failed(meta: ManifestResourceMeta, reason: &str, message: impl Into<String>) -> Self {
        Self {
            meta,
            condition: Condition::new(WORK_APPLIED, ConditionStatus::False, reason, message),
            applied: None,
        }
    }
}

/// Apply every manifest of `work` to the spoke
#[instrument(skip(work, ctx), fields(work = %work.name_any()))]
pub async fn reconcile(work: Arc<ManifestWork>, ctx: Arc<AgentContext>) -> Result<Action> {
    if work.is_deleting() || !work.has_finalizer(MANIFEST_WORK_FINALIZER) {
        return Ok(Action::await_change());
    }
    let name = work.name_any();

    let applied_work = ensure_applied_work(&work, &ctx).await?;
    if applied_work.is_deleting() {
        debug!("applied work is being deleted, waiting");
        return Ok(Action::requeue(REQUEUE_DELETION));
    }
    let owner = applied_work.owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context("apply", format!("{} has no uid", applied_work.name_any()))
    })?;

    let mut outcomes = Vec::with_capacity(work.spec.workload.manifests.len());
    for (ordinal, manifest) in work.spec.workload.manifests.iter().enumerate() {
        outcomes.push(apply_manifest(&ctx, &work, ordinal as i32, manifest, &owner).await);
    }
    let failed = outcomes.iter().filter(|o| !o.condition.is_true()).count();

    let fresh: Vec<_> = outcomes.iter().filter_map(|o| o.applied.clone()).collect();
    let recorded = merge_applied(applied_work.applied_resources(), fresh);
    if recorded != applied_work.applied_resources() {
        let status = AppliedManifestWorkStatus {
            applied_resources: recorded,
            eviction_start_time: applied_work.eviction_start_time(),
        };
        ctx.spoke
            .patch_applied_resources(&applied_work.name_any(), &status)
            .await?;
    }

    let previous = work.status.clone().unwrap_or_default();
    let status = build_status(&previous, outcomes, work.metadata.generation);
    if status != previous {
        ctx.hub.patch_status(&name, &status).await?;
    }

    let reference: ObjectReference = event_ref(work.as_ref());
    if failed == 0 {
        info!(manifests = work.spec.workload.manifests.len(), "manifest work applied");
        if !was_applied(&previous) {
            ctx.hub_events
                .publish(
                    &reference,
                    EventType::Normal,
                    reasons::APPLIED_MANIFEST_WORK_COMPLETE,
                    actions::APPLY,
                    None,
                )
                .await;
        }
        Ok(Action::requeue(HUB_RESYNC_PERIOD))
    } else {
        warn!(failed, "some manifests failed to apply");
        ctx.hub_events
            .publish(
                &reference,
                EventType::Warning,
                reasons::APPLIED_MANIFEST_WORK_FAILED,
                actions::APPLY,
                Some(format!(
                    "{} of {} manifests failed",
                    failed,
                    work.spec.workload.manifests.len()
                )),
            )
            .await;
        Ok(Action::requeue(REQUEUE_ERROR))
    }
}

async fn ensure_applied_work(
    work: &ManifestWork,
    ctx: &AgentContext,
) -> Result<Arc<AppliedManifestWork>> {
    let work_name = work.name_any();
    let name = ctx.applied_work_name(&work_name);
    if let Some(existing) = ctx.applied_work(&name) {
        return Ok(existing);
    }
    // The cache may lag behind a create from an earlier reconcile.
    if let Some(existing) = ctx.spoke.get(&name).await? {
        return Ok(Arc::new(existing));
    }

    let mut applied = AppliedManifestWork::new(
        &name,
        AppliedManifestWorkSpec {
            hub_hash: ctx.hub_hash.clone(),
            agent_id: ctx.agent_id.clone(),
            manifest_work_name: work_name,
        },
    );
    applied.metadata.finalizers = Some(vec![APPLIED_MANIFEST_WORK_FINALIZER.to_string()]);
    let created = ctx.spoke.create(applied).await?;
    info!(applied_work = %name, "created applied manifest work");
    Ok(Arc::new(created))
}

async fn apply_manifest(
    ctx: &AgentContext,
    work: &ManifestWork,
    ordinal: i32,
    manifest: &Manifest,
    owner: &OwnerReference,
) -> ManifestOutcome {
    let header_meta = ManifestHeader::parse(manifest)
        .map(|h| h.unresolved_meta(ordinal))
        .unwrap_or(ManifestResourceMeta {
            ordinal,
            ..Default::default()
        });

    let target = match ctx.applier.resolve(manifest).await {
        Ok(target) => target,
        Err(e) => {
            let meta = previous_meta(work, &header_meta).unwrap_or(header_meta);
            return ManifestOutcome::failed(meta, reason::FAILED, e.to_string());
        }
    };
    let meta = target.resource_meta(ordinal);

    if let Some(executor) = &work.spec.executor {
        match ctx.validator.validate(executor, &target).await {
            Ok(ExecutorDecision::Allowed) => {}
            Ok(ExecutorDecision::Denied(message)) => {
                warn!(resource = %target.identifier(), %message, "executor denied");
                ctx.hub_events
                    .publish(
                        &event_ref(work),
                        EventType::Warning,
                        reasons::EXECUTOR_DENIED,
                        actions::APPLY,
                        Some(message.clone()),
                    )
                    .await;
                return ManifestOutcome::failed(meta, reason::EXECUTOR_DENIED, message);
            }
            Err(e) => return ManifestOutcome::failed(meta, reason::FAILED, e.to_string()),
        }
    }

    match ctx.applier.apply(&target, manifest, owner).await {
        Ok(uid) => ManifestOutcome {
            meta,
            condition: Condition::new(
                WORK_APPLIED,
                ConditionStatus::True,
                reason::APPLIED,
                "Apply manifest complete",
            ),
            applied: Some(target.applied(uid)),
        },
        Err(e) => {
            warn!(resource = %target.identifier(), error = %e, "apply failed");
            ManifestOutcome::failed(meta, reason::FAILED, e.to_string())
        }
    }
}

/// Resolved metadata an earlier pass reported for the same manifest.
///
/// A failed resolve leaves the resource name empty. Reporting that would make
/// the applied object look undeclared, so the last resolved entry is kept as
/// long as the manifest still names the same object.
pub fn previous_meta(
    work: &ManifestWork,
    unresolved: &ManifestResourceMeta,
) -> Option<ManifestResourceMeta> {
    work.status
        .as_ref()?
        .resource_status
        .manifests
        .iter()
        .map(|m| &m.resource_meta)
        .find(|m| {
            m.ordinal == unresolved.ordinal
                && !m.resource.is_empty()
                && m.group == unresolved.group
                && m.kind == unresolved.kind
                && m.namespace == unresolved.namespace
                && m.name == unresolved.name
        })
        .cloned()
}

/// New work status from the outcomes of one apply pass.
///
/// Conditions other than `Applied` (set by the availability controller) are
/// carried over from `previous` for manifests whose metadata is unchanged.
pub fn build_status(
    previous: &ManifestWorkStatus,
    outcomes: Vec<ManifestOutcome>,
    generation: Option<i64>,
) -> ManifestWorkStatus {
    let total = outcomes.len();
    let failed = outcomes.iter().filter(|o| !o.condition.is_true()).count();

    let manifests = outcomes
        .into_iter()
        .map(|outcome| {
            let mut conditions = previous
                .resource_status
                .manifests
                .iter()
                .find(|m| m.resource_meta == outcome.meta)
                .map(|m| m.conditions.clone())
                .unwrap_or_default();
            set_condition(&mut conditions, outcome.condition);
            ManifestCondition {
                resource_meta: outcome.meta,
                conditions,
            }
        })
        .collect();

    let aggregate = if failed == 0 {
        Condition::new(
            WORK_APPLIED,
            ConditionStatus::True,
            reasons::APPLIED_MANIFEST_WORK_COMPLETE,
            "Apply manifest work complete",
        )
    } else {
        Condition::new(
            WORK_APPLIED,
            ConditionStatus::False,
            reasons::APPLIED_MANIFEST_WORK_FAILED,
            format!("Failed to apply {} of {} manifests", failed, total),
        )
    };
    let mut conditions = previous.conditions.clone();
    set_condition(&mut conditions, aggregate.with_generation(generation));

    ManifestWorkStatus {
        conditions,
        resource_status: ManifestResourceStatus { manifests },
    }
}

/// Freshly applied records first, then earlier records for other objects.
///
/// Records the work no longer declares stay until the applied-work sync
/// controller has deleted them.
pub fn merge_applied(
    existing: &[AppliedManifestResourceMeta],
    fresh: Vec<AppliedManifestResourceMeta>,
) -> Vec<AppliedManifestResourceMeta> {
    let mut merged = fresh;
    for old in existing {
        if !merged.iter().any(|r| r.identifier() == old.identifier()) {
            merged.push(old.clone());
        }
    }
    merged
}

fn was_applied(status: &ManifestWorkStatus) -> bool {
    find_condition(&status.conditions, WORK_APPLIED).is_some_and(|c| c.is_true())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::ResolvedManifest;
    use crate::controllers::test_support::*;
    use spoke_common::crd::{
        ExecutorSubjectType, ManifestWorkExecutor, ManifestWorkExecutorSubject,
        ServiceAccountSubject,
    };

    fn resolved(name: &str) -> ResolvedManifest {
        ResolvedManifest {
            group: String::new(),
            version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            resource: "configmaps".to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    fn resolve_by_name(mocks: &mut Mocks) {
        mocks.applier.expect_resolve().returning(|manifest| {
            let name = manifest.0["metadata"]["name"].as_str().unwrap_or_default();
            Ok(resolved(name))
        });
    }

    #[tokio::test]
    async fn applies_manifests_and_reports_status() {
        let w = work("work-a", vec![configmap("cm1"), configmap("cm2")]);
        let mut mocks = Mocks::new();
        mocks.applied.push(applied("work-a", vec![]));
        resolve_by_name(&mut mocks);
        mocks
            .applier
            .expect_apply()
            .withf(|_, _, owner| owner.uid == "amw-uid" && owner.kind == "AppliedManifestWork")
            .times(2)
            .returning(|target, _, _| Ok(format!("uid-{}", target.name)));
        mocks
            .spoke
            .expect_patch_applied_resources()
            .withf(|name, status| {
                name == "hubhash-work-a"
                    && status.applied_resources
                        == vec![applied_configmap("cm1", "uid-cm1"), applied_configmap("cm2", "uid-cm2")]
            })
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .hub
            .expect_patch_status()
            .withf(|name, status| {
                let applied = find_condition(&status.conditions, WORK_APPLIED).unwrap();
                name == "work-a"
                    && applied.is_true()
                    && applied.observed_generation == Some(1)
                    && status.resource_status.manifests.len() == 2
                    && status.resource_status.manifests[1].resource_meta.ordinal == 1
                    && status.resource_status.manifests[1].resource_meta.resource == "configmaps"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(w), mocks.into_context()).await.unwrap();
        assert_eq!(action, Action::requeue(HUB_RESYNC_PERIOD));
    }

    #[tokio::test]
    async fn missing_applied_work_is_created_with_finalizer() {
        let w = work("work-a", vec![]);
        let mut mocks = Mocks::new();
        mocks.spoke.expect_get().returning(|_| Ok(None));
        mocks
            .spoke
            .expect_create()
            .withf(|amw| {
                amw.metadata.name.as_deref() == Some("hubhash-work-a")
                    && amw.spec.manifest_work_name == "work-a"
                    && amw.spec.agent_id == "hubhash"
                    && amw.has_finalizer(APPLIED_MANIFEST_WORK_FINALIZER)
            })
            .times(1)
            .returning(|mut amw| {
                amw.metadata.uid = Some("amw-uid".to_string());
                Ok(amw)
            });
        mocks.hub.expect_patch_status().returning(|_, _| Ok(()));

        reconcile(Arc::new(w), mocks.into_context()).await.unwrap();
    }

    #[tokio::test]
    async fn denied_executor_blocks_apply() {
        let mut w = work("work-a", vec![configmap("cm1")]);
        w.spec.executor = Some(ManifestWorkExecutor {
            subject: ManifestWorkExecutorSubject {
                type_: ExecutorSubjectType::ServiceAccount,
                service_account: Some(ServiceAccountSubject {
                    namespace: "default".to_string(),
                    name: "deployer".to_string(),
                }),
            },
        });

        let mut mocks = Mocks::new();
        mocks.applied.push(applied("work-a", vec![]));
        resolve_by_name(&mut mocks);
        mocks
            .validator
            .expect_validate()
            .times(1)
            .returning(|_, _| Ok(ExecutorDecision::Denied("no create".to_string())));
        mocks.applier.expect_apply().never();
        mocks
            .hub
            .expect_patch_status()
            .withf(|_, status| {
                let manifest = &status.resource_status.manifests[0];
                let cond = find_condition(&manifest.conditions, WORK_APPLIED).unwrap();
                cond.status == ConditionStatus::False && cond.reason == reason::EXECUTOR_DENIED
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(w), mocks.into_context()).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_ERROR));
    }

    #[tokio::test]
    async fn unfinalized_work_is_skipped() {
        let mut w = work("work-a", vec![configmap("cm1")]);
        w.metadata.finalizers = None;
        let action = reconcile(Arc::new(w), Mocks::new().into_context()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deleting_applied_work_defers_apply() {
        let mut amw = applied("work-a", vec![]);
        amw.metadata = deleting(amw.metadata);
        let mut mocks = Mocks::new();
        mocks.applied.push(amw);

        let action = reconcile(
            Arc::new(work("work-a", vec![configmap("cm1")])),
            mocks.into_context(),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_DELETION));
    }

    /// Status as reported after `names` were applied at generation 1
    fn reported(names: &[&str]) -> ManifestWorkStatus {
        let outcomes = names
            .iter()
            .enumerate()
            .map(|(i, name)| ManifestOutcome {
                meta: resolved(name).resource_meta(i as i32),
                condition: Condition::new(WORK_APPLIED, ConditionStatus::True, reason::APPLIED, ""),
                applied: Some(resolved(name).applied(&format!("uid-{}", name))),
            })
            .collect();
        build_status(&ManifestWorkStatus::default(), outcomes, Some(1))
    }

    #[tokio::test]
    async fn failed_resolve_reports_last_resolved_meta() {
        let mut w = work("work-a", vec![configmap("cm1")]);
        w.status = Some(reported(&["cm1"]));

        let mut mocks = Mocks::new();
        mocks
            .applied
            .push(applied("work-a", vec![applied_configmap("cm1", "uid-cm1")]));
        mocks
            .applier
            .expect_resolve()
            .returning(|_| Err(Error::internal("discovery: connection reset")));
        mocks.applier.expect_apply().never();
        mocks.spoke.expect_patch_applied_resources().never();
        mocks
            .hub
            .expect_patch_status()
            .withf(|_, status| {
                let manifest = &status.resource_status.manifests[0];
                let cond = find_condition(&manifest.conditions, WORK_APPLIED).unwrap();
                manifest.resource_meta.resource == "configmaps"
                    && manifest.resource_meta.name == "cm1"
                    && cond.status == ConditionStatus::False
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(w), mocks.into_context()).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_ERROR));
    }

    mod carried_meta {
        use super::*;

        #[test]
        fn same_object_keeps_resolved_meta() {
            let mut w = work("work-a", vec![configmap("cm1")]);
            w.status = Some(reported(&["cm1"]));
            let header = ManifestHeader::parse(&configmap("cm1"))
                .unwrap()
                .unresolved_meta(0);

            let meta = previous_meta(&w, &header).unwrap();
            assert_eq!(meta.resource, "configmaps");
        }

        #[test]
        fn renamed_or_moved_manifest_is_not_carried() {
            let mut w = work("work-a", vec![configmap("cm2")]);
            w.status = Some(reported(&["cm1"]));
            let renamed = ManifestHeader::parse(&configmap("cm2"))
                .unwrap()
                .unresolved_meta(0);
            let moved = ManifestHeader::parse(&configmap("cm1"))
                .unwrap()
                .unresolved_meta(1);

            assert!(previous_meta(&w, &renamed).is_none());
            assert!(previous_meta(&w, &moved).is_none());
        }

        #[test]
        fn nothing_to_carry_without_status() {
            let header = ManifestHeader::parse(&configmap("cm1"))
                .unwrap()
                .unresolved_meta(0);
            assert!(previous_meta(&work("work-a", vec![]), &header).is_none());
        }
    }

    mod status {
        use super::*;

        fn outcome(name: &str, ok: bool) -> ManifestOutcome {
            let meta = resolved(name).resource_meta(0);
            if ok {
                ManifestOutcome {
                    meta,
                    condition: Condition::new(WORK_APPLIED, ConditionStatus::True, reason::APPLIED, ""),
                    applied: Some(resolved(name).applied("uid")),
                }
            } else {
                ManifestOutcome::failed(meta, reason::FAILED, "boom")
            }
        }

        #[test]
        fn any_failure_makes_the_work_not_applied() {
            let status = build_status(
                &ManifestWorkStatus::default(),
                vec![outcome("cm1", true), outcome("cm2", false)],
                Some(3),
            );
            let cond = find_condition(&status.conditions, WORK_APPLIED).unwrap();
            assert_eq!(cond.status, ConditionStatus::False);
            assert_eq!(cond.message, "Failed to apply 1 of 2 manifests");
            assert_eq!(cond.observed_generation, Some(3));
        }

        #[test]
        fn availability_conditions_are_kept() {
            let first = build_status(&ManifestWorkStatus::default(), vec![outcome("cm1", true)], Some(1));
            let mut previous = first.clone();
            previous.resource_status.manifests[0].conditions.push(Condition::new(
                "Available",
                ConditionStatus::True,
                "ResourceAvailable",
                "",
            ));

            let second = build_status(&previous, vec![outcome("cm1", true)], Some(1));
            let conditions = &second.resource_status.manifests[0].conditions;
            assert!(find_condition(conditions, "Available").is_some());
            // Unchanged status keeps the original transition time.
            assert_eq!(
                find_condition(conditions, WORK_APPLIED).unwrap().last_transition_time,
                find_condition(&first.resource_status.manifests[0].conditions, WORK_APPLIED)
                    .unwrap()
                    .last_transition_time
            );
        }

        #[test]
        fn merge_prefers_fresh_records_and_keeps_others() {
            let existing = vec![applied_configmap("cm1", "old"), applied_configmap("gone", "g")];
            let merged = merge_applied(&existing, vec![applied_configmap("cm1", "new")]);
            assert_eq!(
                merged,
                vec![applied_configmap("cm1", "new"), applied_configmap("gone", "g")]
            );
        }
    }
}
