//! Puts the cleanup finalizer on every live ManifestWork, so the hub cannot
//! drop a work before the agent has removed what it applied.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::info;

use spoke_common::crd::ManifestWork;
use spoke_common::kube_utils::with_finalizer;
use spoke_common::{Result, MANIFEST_WORK_FINALIZER};

use crate::context::AgentContext;

/// Add the cleanup finalizer if it is missing
pub async fn reconcile(work: Arc<ManifestWork>, ctx: Arc<AgentContext>) -> Result<Action> {
    if work.is_deleting() {
        return Ok(Action::await_change());
    }
    let Some(finalizers) =
        with_finalizer(work.metadata.finalizers.as_deref(), MANIFEST_WORK_FINALIZER)
    else {
        return Ok(Action::await_change());
    };

    let name = work.name_any();
    ctx.hub
        .patch_finalizers(&name, work.resource_version(), finalizers)
        .await?;
    info!(work = %name, "added cleanup finalizer");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::test_support::*;

    #[tokio::test]
    async fn missing_finalizer_is_added() {
        let mut w = work("work-a", vec![]);
        w.metadata.finalizers = Some(vec!["other/finalizer".to_string()]);

        let mut mocks = Mocks::new();
        mocks
            .hub
            .expect_patch_finalizers()
            .withf(|name, rv, finalizers| {
                name == "work-a"
                    && rv.as_deref() == Some("10")
                    && finalizers == &vec![
                        "other/finalizer".to_string(),
                        MANIFEST_WORK_FINALIZER.to_string(),
                    ]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(w), mocks.into_context()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn present_finalizer_is_left_alone() {
        let mocks = Mocks::new();
        reconcile(Arc::new(work("work-a", vec![])), mocks.into_context())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deleting_work_gets_no_finalizer() {
        let mut w = work("work-a", vec![]);
        w.metadata.finalizers = None;
        w.metadata = deleting(w.metadata);
        reconcile(Arc::new(w), Mocks::new().into_context())
            .await
            .unwrap();
    }
}
