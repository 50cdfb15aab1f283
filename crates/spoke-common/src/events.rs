//! Kubernetes Event recording for the work controllers.
//!
//! Controllers publish events against the ManifestWork or AppliedManifestWork
//! they act on. Publishing never fails the caller: errors are logged and
//! dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given object.
    ///
    /// * `resource_ref` - The object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What the controller did (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production publisher backed by `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`.
    ///
    /// `instance` is usually the agent name so events from several agents on
    /// one hub can be told apart.
    pub fn new(client: Client, controller_name: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops everything, for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`.
pub mod reasons {
    /// Every manifest of a ManifestWork was applied
    pub const APPLIED_MANIFEST_WORK_COMPLETE: &str = "AppliedManifestWorkComplete";
    /// At least one manifest failed to apply
    pub const APPLIED_MANIFEST_WORK_FAILED: &str = "AppliedManifestWorkFailed";
    /// The executor is not allowed to apply a manifest
    pub const EXECUTOR_DENIED: &str = "ExecutorDenied";
    /// Resources no longer declared by the work were removed
    pub const RESOURCES_PRUNED: &str = "ResourcesPruned";
    /// All applied resources were removed
    pub const RESOURCES_DELETED: &str = "ResourcesDeleted";
    /// An orphaned AppliedManifestWork started its grace period
    pub const EVICTION_STARTED: &str = "AppliedManifestWorkEvictionStarted";
    /// An orphaned AppliedManifestWork was removed
    pub const EVICTED: &str = "AppliedManifestWorkEvicted";
}

/// Event actions, shown in the ACTION column of `kubectl get events`.
pub mod actions {
    /// Applying manifests
    pub const APPLY: &str = "Apply";
    /// Deleting resources
    pub const DELETE: &str = "Delete";
    /// Evicting an orphan
    pub const EVICT: &str = "Evict";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[tokio::test]
    async fn noop_publisher_accepts_events() {
        NoopEventPublisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::EXECUTOR_DENIED,
                actions::APPLY,
                Some("denied".to_string()),
            )
            .await;
    }
}
