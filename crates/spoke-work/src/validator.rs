//! Executor permission checks
//!
//! A ManifestWork may name an executor service account. Before applying a
//! manifest the agent asks the spoke API server, through a
//! SubjectAccessReview, whether that account may write the target object.
//! Works without an executor are applied with the agent's own identity.

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use spoke_common::crd::{ExecutorSubjectType, ManifestWorkExecutor};
use spoke_common::{Error, Result};

use crate::applier::ResolvedManifest;

/// Verbs the executor needs on every applied object
pub const REQUIRED_VERBS: &[&str] = &["create", "update", "patch", "delete"];

/// Result of an executor check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorDecision {
    /// The executor may apply the manifest
    Allowed,
    /// The executor lacks a permission
    Denied(String),
}

/// Checks whether an executor may apply a manifest
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutorValidator: Send + Sync {
    /// Decide for one resolved manifest
    async fn validate(
        &self,
        executor: &ManifestWorkExecutor,
        target: &ResolvedManifest,
    ) -> Result<ExecutorDecision>;
}

/// [`ExecutorValidator`] issuing SubjectAccessReviews on the spoke
pub struct SubjectAccessReviewValidator {
    api: Api<SubjectAccessReview>,
}

impl SubjectAccessReviewValidator {
    /// Validator using the spoke client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ExecutorValidator for SubjectAccessReviewValidator {
    async fn validate(
        &self,
        executor: &ManifestWorkExecutor,
        target: &ResolvedManifest,
    ) -> Result<ExecutorDecision> {
        let account = match (&executor.subject.type_, &executor.subject.service_account) {
            (ExecutorSubjectType::ServiceAccount, Some(account)) => account,
            (ExecutorSubjectType::ServiceAccount, None) => {
                return Ok(ExecutorDecision::Denied(
                    "executor subject has no service account".to_string(),
                ))
            }
        };

        for verb in REQUIRED_VERBS {
            let review = access_review(&account.username(), &account.namespace, target, verb);
            let result = self
                .api
                .create(&PostParams::default(), &review)
                .await
                .map_err(Error::from)?;
            let allowed = result.status.as_ref().is_some_and(|s| s.allowed);
            debug!(
                executor = %account.username(),
                resource = %target.identifier(),
                verb,
                allowed,
                "executor access review"
            );
            if !allowed {
                return Ok(ExecutorDecision::Denied(format!(
                    "{} cannot {} {}",
                    account.username(),
                    verb,
                    target.identifier()
                )));
            }
        }
        Ok(ExecutorDecision::Allowed)
    }
}

/// SubjectAccessReview for `user` performing `verb` on `target`
pub fn access_review(
    user: &str,
    sa_namespace: &str,
    target: &ResolvedManifest,
    verb: &str,
) -> SubjectAccessReview {
    SubjectAccessReview {
        spec: SubjectAccessReviewSpec {
            user: Some(user.to_string()),
            groups: Some(vec![
                "system:serviceaccounts".to_string(),
                format!("system:serviceaccounts:{}", sa_namespace),
                "system:authenticated".to_string(),
            ]),
            resource_attributes: Some(ResourceAttributes {
                group: Some(target.group.clone()),
                version: Some(target.version.clone()),
                resource: Some(target.resource.clone()),
                namespace: (!target.namespace.is_empty()).then(|| target.namespace.clone()),
                name: Some(target.name.clone()),
                verb: Some(verb.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}
