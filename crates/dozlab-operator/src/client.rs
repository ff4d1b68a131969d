//! Kubernetes API access for the operator
//!
//! The reconciler, reaper and garbage collector talk to the cluster only
//! through [`ClusterClient`], so their decision logic can be exercised against
//! a mock without an API server.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::CONTROLLER_NAME;
use crate::labsession::{LabSession, LabSessionStatus};

/// Child resource types managed per session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildKind {
    Pod,
    Service,
    Secret,
}

impl ChildKind {
    pub const ALL: [ChildKind; 3] = [ChildKind::Pod, ChildKind::Service, ChildKind::Secret];

    pub fn as_str(self) -> &'static str {
        match self {
            ChildKind::Pod => "Pod",
            ChildKind::Service => "Service",
            ChildKind::Secret => "Secret",
        }
    }
}

impl std::fmt::Display for ChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A child resource as read from or written to the cluster
#[derive(Clone, Debug)]
pub enum ChildObject {
    Pod(Pod),
    Service(Service),
    Secret(Secret),
}

impl ChildObject {
    pub fn kind(&self) -> ChildKind {
        match self {
            ChildObject::Pod(_) => ChildKind::Pod,
            ChildObject::Service(_) => ChildKind::Service,
            ChildObject::Secret(_) => ChildKind::Secret,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ChildObject::Pod(p) => &p.metadata,
            ChildObject::Service(s) => &s.metadata,
            ChildObject::Secret(s) => &s.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Whether this object is controlled by the session with `uid`
    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.metadata()
            .owner_references
            .iter()
            .flatten()
            .any(|o| o.uid == uid && o.controller == Some(true))
    }

    /// Controlled by the session `uid` and labelled with its `session_id`
    pub fn belongs_to(&self, uid: &str, session_id: &str) -> bool {
        self.is_owned_by(uid) && self.label(crate::config::labels::SESSION_ID) == Some(session_id)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata()
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl ClientError {
    /// HTTP status code of an API error response
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Kube(kube::Error::Api(resp)) => Some(resp.code),
            ClientError::Kube(_) => None,
        }
    }

    /// 409: object already exists, or a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// Namespace quota or admission limits refused the object
    pub fn is_exhausted(&self) -> bool {
        match self {
            ClientError::Kube(kube::Error::Api(resp)) => {
                let message = resp.message.to_ascii_lowercase();
                (resp.code == 403 && message.contains("quota"))
                    || (resp.code == 422 && message.contains("exceeded"))
            }
            ClientError::Kube(_) => false,
        }
    }

    /// Rate limiting, server-side failures, and transport errors
    pub fn is_transient(&self) -> bool {
        match self.status_code() {
            Some(code) => code == 429 || code >= 500,
            None => true,
        }
    }
}

/// Cluster operations used by the controllers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a session, `None` when it no longer exists
    async fn get_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<LabSession>, ClientError>;

    /// List every session in the watched scope
    async fn list_sessions(&self) -> Result<Vec<LabSession>, ClientError>;

    /// Merge-patch the status subresource
    ///
    /// With `resource_version` set the write is optimistic and fails with 409
    /// when the object changed since it was read.
    async fn patch_session_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LabSessionStatus,
        resource_version: Option<String>,
    ) -> Result<LabSession, ClientError>;

    /// Replace the finalizer list, conditioned on `resource_version` when given
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<(), ClientError>;

    /// Delete a session; already-gone counts as success
    async fn delete_session(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn get_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChildObject>, ClientError>;

    async fn create_child(&self, namespace: &str, child: &ChildObject) -> Result<(), ClientError>;

    /// Merge-patch a child with a partial object
    async fn patch_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), ClientError>;

    /// Delete a child; already-gone counts as success
    async fn delete_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;

    async fn list_children(
        &self,
        kind: ChildKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ChildObject>, ClientError>;

    /// Check that the API server answers
    async fn check_readiness(&self) -> Result<bool, ClientError>;
}

/// [`ClusterClient`] backed by a kube [`Client`]
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    /// Namespace scope for session listing; `None` lists cluster-wide
    namespace: Option<String>,
}

impl KubeClusterClient {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn sessions(&self, namespace: &str) -> Api<LabSession> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        }
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>, ClientError>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn delete_ignoring_missing<K>(api: Api<K>, name: &str) -> Result<(), ClientError>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            debug!(name, "Object already deleted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Merge patch for the status subresource
///
/// Absent optional fields are left alone by a merge patch, so a cleared
/// `reason` is sent as an explicit null.
pub(crate) fn status_patch(
    status: &LabSessionStatus,
    resource_version: Option<String>,
) -> serde_json::Value {
    let mut patch = serde_json::json!({ "status": status });
    if status.reason.is_none() {
        patch["status"]["reason"] = serde_json::Value::Null;
    }
    if let Some(rv) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    patch
}

/// Merge patch replacing the finalizer list; a resourceVersion makes a concurrent edit a 409
pub(crate) fn finalizer_patch(
    finalizers: Vec<String>,
    resource_version: Option<String>,
) -> serde_json::Value {
    let mut patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    if let Some(rv) = resource_version {
        patch["metadata"]["resourceVersion"] = serde_json::Value::String(rv);
    }
    patch
}

async fn merge_patch<K, P>(api: Api<K>, name: &str, patch: &P) -> Result<(), ClientError>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
    P: Serialize + std::fmt::Debug,
{
    api.patch(name, &KubeClusterClient::patch_params(), &Patch::Merge(patch))
        .await?;
    Ok(())
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    #[instrument(skip(self))]
    async fn get_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<LabSession>, ClientError> {
        get_opt(self.sessions(namespace), name).await
    }

    #[instrument(skip(self))]
    async fn list_sessions(&self) -> Result<Vec<LabSession>, ClientError> {
        let api: Api<LabSession> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    #[instrument(skip(self, status), fields(phase = %status.phase))]
    async fn patch_session_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LabSessionStatus,
        resource_version: Option<String>,
    ) -> Result<LabSession, ClientError> {
        let patch = status_patch(status, resource_version);
        let updated = self
            .sessions(namespace)
            .patch_status(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<(), ClientError> {
        let patch = finalizer_patch(finalizers, resource_version);
        merge_patch(self.sessions(namespace), name, &patch).await
    }

    #[instrument(skip(self))]
    async fn delete_session(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        delete_ignoring_missing(self.sessions(namespace), name).await
    }

    #[instrument(skip(self))]
    async fn get_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChildObject>, ClientError> {
        let client = self.client.clone();
        Ok(match kind {
            ChildKind::Pod => get_opt(Api::<Pod>::namespaced(client, namespace), name)
                .await?
                .map(ChildObject::Pod),
            ChildKind::Service => get_opt(Api::<Service>::namespaced(client, namespace), name)
                .await?
                .map(ChildObject::Service),
            ChildKind::Secret => get_opt(Api::<Secret>::namespaced(client, namespace), name)
                .await?
                .map(ChildObject::Secret),
        })
    }

    #[instrument(skip(self, child), fields(kind = %child.kind(), name = %child.name()))]
    async fn create_child(&self, namespace: &str, child: &ChildObject) -> Result<(), ClientError> {
        let client = self.client.clone();
        let pp = PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        };
        match child {
            ChildObject::Pod(pod) => {
                Api::<Pod>::namespaced(client, namespace).create(&pp, pod).await?;
            }
            ChildObject::Service(svc) => {
                Api::<Service>::namespaced(client, namespace)
                    .create(&pp, svc)
                    .await?;
            }
            ChildObject::Secret(secret) => {
                Api::<Secret>::namespaced(client, namespace)
                    .create(&pp, secret)
                    .await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn patch_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), ClientError> {
        let client = self.client.clone();
        match kind {
            ChildKind::Pod => merge_patch(Api::<Pod>::namespaced(client, namespace), name, &patch).await,
            ChildKind::Service => {
                merge_patch(Api::<Service>::namespaced(client, namespace), name, &patch).await
            }
            ChildKind::Secret => {
                merge_patch(Api::<Secret>::namespaced(client, namespace), name, &patch).await
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        let client = self.client.clone();
        match kind {
            ChildKind::Pod => delete_ignoring_missing(Api::<Pod>::namespaced(client, namespace), name).await,
            ChildKind::Service => {
                delete_ignoring_missing(Api::<Service>::namespaced(client, namespace), name).await
            }
            ChildKind::Secret => {
                delete_ignoring_missing(Api::<Secret>::namespaced(client, namespace), name).await
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_children(
        &self,
        kind: ChildKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ChildObject>, ClientError> {
        let client = self.client.clone();
        let lp = ListParams::default().labels(selector);
        Ok(match kind {
            ChildKind::Pod => Api::<Pod>::namespaced(client, namespace)
                .list(&lp)
                .await?
                .items
                .into_iter()
                .map(ChildObject::Pod)
                .collect(),
            ChildKind::Service => Api::<Service>::namespaced(client, namespace)
                .list(&lp)
                .await?
                .items
                .into_iter()
                .map(ChildObject::Service)
                .collect(),
            ChildKind::Secret => Api::<Secret>::namespaced(client, namespace)
                .list(&lp)
                .await?
                .items
                .into_iter()
                .map(ChildObject::Secret)
                .collect(),
        })
    }

    async fn check_readiness(&self) -> Result<bool, ClientError> {
        self.client.apiserver_version().await?;
        Ok(true)
    }
}

// Allow sharing a client between the controller, reaper and health server
#[async_trait]
impl<T: ClusterClient + ?Sized> ClusterClient for Arc<T> {
    async fn get_session(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<LabSession>, ClientError> {
        (**self).get_session(namespace, name).await
    }

    async fn list_sessions(&self) -> Result<Vec<LabSession>, ClientError> {
        (**self).list_sessions().await
    }

    async fn patch_session_status(
        &self,
        namespace: &str,
        name: &str,
        status: &LabSessionStatus,
        resource_version: Option<String>,
    ) -> Result<LabSession, ClientError> {
        (**self)
            .patch_session_status(namespace, name, status, resource_version)
            .await
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<(), ClientError> {
        (**self)
            .set_finalizers(namespace, name, finalizers, resource_version)
            .await
    }

    async fn delete_session(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        (**self).delete_session(namespace, name).await
    }

    async fn get_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ChildObject>, ClientError> {
        (**self).get_child(kind, namespace, name).await
    }

    async fn create_child(&self, namespace: &str, child: &ChildObject) -> Result<(), ClientError> {
        (**self).create_child(namespace, child).await
    }

    async fn patch_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), ClientError> {
        (**self).patch_child(kind, namespace, name, patch).await
    }

    async fn delete_child(
        &self,
        kind: ChildKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        (**self).delete_child(kind, namespace, name).await
    }

    async fn list_children(
        &self,
        kind: ChildKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ChildObject>, ClientError> {
        (**self).list_children(kind, namespace, selector).await
    }

    async fn check_readiness(&self) -> Result<bool, ClientError> {
        (**self).check_readiness().await
    }
}
