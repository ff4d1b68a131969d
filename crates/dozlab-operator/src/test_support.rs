//! In-memory cluster behind a `MockClusterClient` for controller tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use k8s_openapi::api::core::v1::{
    ContainerStatus, Pod, PodStatus, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use crate::builder::{child_labels, owner_reference};
use crate::client::tests::api_error;
use crate::client::{status_patch, ChildKind, ChildObject, ClientError, MockClusterClient};
use crate::config::labels;
use crate::labsession::{LabSession, LabSessionStatus};

#[derive(Default)]
pub(crate) struct State {
    pub children: HashMap<(ChildKind, String), ChildObject>,
    /// Children whose deletion never completes
    pub sticky: HashSet<(ChildKind, String)>,
    pub sessions: HashMap<String, LabSession>,
    pub status_writes: Vec<LabSessionStatus>,
    pub finalizer_writes: Vec<Vec<String>>,
    pub deleted_sessions: Vec<String>,
    pub created: Vec<String>,
    pub deleted_children: Vec<String>,
    pub patched_children: Vec<(ChildKind, String, serde_json::Value)>,
    /// Optimistic status writes rejected with 409 before succeeding
    pub status_conflicts: u32,
    /// Errors returned by the next `create_child` calls
    pub create_errors: Vec<ClientError>,
    /// Children that a concurrent writer creates right after our first read misses them
    pub racing: HashSet<(ChildKind, String)>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, child: ChildObject) {
        let key = (child.kind(), child.name().to_string());
        self.state().children.insert(key, child);
    }

    pub fn contains(&self, kind: ChildKind, name: &str) -> bool {
        self.state().children.contains_key(&(kind, name.to_string()))
    }

    pub fn children(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .children
            .keys()
            .map(|(k, n)| format!("{k}/{n}"))
            .collect();
        names.sort();
        names
    }

    pub fn make_sticky(&self, kind: ChildKind, name: &str) {
        self.state().sticky.insert((kind, name.to_string()));
    }

    /// Store `child`, but let the next read of it miss as if it were created concurrently
    pub fn insert_racing(&self, child: ChildObject) {
        let key = (child.kind(), child.name().to_string());
        let mut state = self.state();
        state.racing.insert(key.clone());
        state.children.insert(key, child);
    }

    /// Store a session; assigns a resourceVersion
    pub fn insert_session(&self, mut session: LabSession) -> LabSession {
        let mut state = self.state();
        session.metadata.resource_version = Some(state.bump());
        let name = session.metadata.name.clone().unwrap_or_default();
        state.sessions.insert(name, session.clone());
        session
    }

    pub fn session(&self, name: &str) -> Option<LabSession> {
        self.state().sessions.get(name).cloned()
    }

    pub fn set_pod_status(&self, name: &str, status: PodStatus) {
        let mut state = self.state();
        if let Some(ChildObject::Pod(pod)) = state.children.get_mut(&(ChildKind::Pod, name.to_string())) {
            pod.status = Some(status);
        }
    }

    pub fn client(&self) -> MockClusterClient {
        let mut mock = MockClusterClient::new();

        let state = self.state.clone();
        mock.expect_get_session()
            .returning(move |_ns: &str, name: &str| Ok(state.lock().unwrap().sessions.get(name).cloned()));

        let state = self.state.clone();
        mock.expect_list_sessions()
            .returning(move || Ok(state.lock().unwrap().sessions.values().cloned().collect()));

        let state = self.state.clone();
        mock.expect_patch_session_status().returning(
            move |_ns: &str, name: &str, status: &LabSessionStatus, rv: Option<String>| {
                let mut state = state.lock().unwrap();
                if rv.is_some() && state.status_conflicts > 0 {
                    state.status_conflicts -= 1;
                    // Someone else wrote in between
                    let version = state.bump();
                    if let Some(s) = state.sessions.get_mut(name) {
                        s.metadata.resource_version = Some(version);
                    }
                    return Err(api_error(409, "the object has been modified"));
                }
                let version = state.bump();
                let Some(session) = state.sessions.get_mut(name) else {
                    return Err(api_error(404, "not found"));
                };
                if let Some(rv) = rv {
                    if session.metadata.resource_version.as_deref() != Some(rv.as_str()) {
                        return Err(api_error(409, "the object has been modified"));
                    }
                }
                // Apply the same merge patch the API server would receive
                let patch = status_patch(status, None);
                let mut merged = serde_json::to_value(&session.status).unwrap();
                merge(&mut merged, &patch["status"]);
                session.status = Some(serde_json::from_value(merged).unwrap());
                session.metadata.resource_version = Some(version);
                let updated = session.clone();
                state.status_writes.push(status.clone());
                Ok(updated)
            },
        );

        let state = self.state.clone();
        mock.expect_set_finalizers().returning(
            move |_ns: &str, name: &str, finalizers: Vec<String>, rv: Option<String>| {
                let mut state = state.lock().unwrap();
                let version = state.bump();
                if let Some(session) = state.sessions.get_mut(name) {
                    if rv.is_some() && session.metadata.resource_version != rv {
                        return Err(api_error(409, "the object has been modified"));
                    }
                    session.metadata.finalizers = Some(finalizers.clone());
                    session.metadata.resource_version = Some(version);
                }
                state.finalizer_writes.push(finalizers);
                Ok(())
            },
        );

        let state = self.state.clone();
        mock.expect_delete_session().returning(move |_ns: &str, name: &str| {
            let mut state = state.lock().unwrap();
            state.sessions.remove(name);
            state.deleted_sessions.push(name.to_string());
            Ok(())
        });

        let state = self.state.clone();
        mock.expect_get_child()
            .returning(move |kind: ChildKind, _ns: &str, name: &str| {
                let mut state = state.lock().unwrap();
                let key = (kind, name.to_string());
                if state.racing.remove(&key) {
                    return Ok(None);
                }
                Ok(state.children.get(&key).cloned())
            });

        let state = self.state.clone();
        mock.expect_create_child()
            .returning(move |_ns: &str, child: &ChildObject| {
                let mut state = state.lock().unwrap();
                if !state.create_errors.is_empty() {
                    return Err(state.create_errors.remove(0));
                }
                let key = (child.kind(), child.name().to_string());
                if state.children.contains_key(&key) {
                    return Err(api_error(409, "already exists"));
                }
                state.created.push(format!("{}/{}", key.0, key.1));
                state.children.insert(key, child.clone());
                Ok(())
            });

        let state = self.state.clone();
        mock.expect_patch_child().returning(
            move |kind: ChildKind, _ns: &str, name: &str, patch: serde_json::Value| {
                let mut state = state.lock().unwrap();
                state.patched_children.push((kind, name.to_string(), patch));
                Ok(())
            },
        );

        let state = self.state.clone();
        mock.expect_delete_child()
            .returning(move |kind: ChildKind, _ns: &str, name: &str| {
                let mut state = state.lock().unwrap();
                let key = (kind, name.to_string());
                state.deleted_children.push(format!("{kind}/{name}"));
                if state.sticky.contains(&key) {
                    if let Some(child) = state.children.get_mut(&key) {
                        set_deletion_timestamp(child);
                    }
                } else {
                    state.children.remove(&key);
                }
                Ok(())
            });

        let state = self.state.clone();
        mock.expect_list_children()
            .returning(move |kind: ChildKind, _ns: &str, selector: &str| {
                let wanted = selector
                    .split(',')
                    .find_map(|term| term.strip_prefix(&format!("{}=", labels::SESSION_ID)))
                    .map(str::to_string);
                let state = state.lock().unwrap();
                Ok(state
                    .children
                    .iter()
                    .filter(|((k, _), child)| {
                        *k == kind && child.label(labels::SESSION_ID) == wanted.as_deref()
                    })
                    .map(|(_, child)| child.clone())
                    .collect())
            });

        mock.expect_check_readiness().returning(|| Ok(true));

        mock
    }
}

/// JSON merge patch (RFC 7386): objects merge key by key, null removes, anything else replaces
fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(target) = target {
        for (key, value) in fields {
            if value.is_null() {
                target.remove(key);
            } else {
                merge(target.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
    }
}

fn set_deletion_timestamp(child: &mut ChildObject) {
    let meta = match child {
        ChildObject::Pod(p) => &mut p.metadata,
        ChildObject::Service(s) => &mut s.metadata,
        ChildObject::Secret(s) => &mut s.metadata,
    };
    meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
}

/// A bare child owned by `session` and carrying its labels
pub(crate) fn owned_child(kind: ChildKind, name: &str, session: &LabSession) -> ChildObject {
    let metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: session.metadata.namespace.clone(),
        labels: Some(child_labels(&session.spec)),
        owner_references: Some(vec![owner_reference(session).unwrap()]),
        ..Default::default()
    };
    bare(kind, metadata)
}

/// A child with the right name but no owner
pub(crate) fn foreign_child(kind: ChildKind, name: &str) -> ChildObject {
    bare(
        kind,
        ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
    )
}

fn bare(kind: ChildKind, metadata: ObjectMeta) -> ChildObject {
    match kind {
        ChildKind::Pod => ChildObject::Pod(Pod {
            metadata,
            ..Default::default()
        }),
        ChildKind::Service => ChildObject::Service(Service {
            metadata,
            ..Default::default()
        }),
        ChildKind::Secret => ChildObject::Secret(Secret {
            metadata,
            ..Default::default()
        }),
    }
}

/// Pod status with the given main containers all ready
pub(crate) fn ready_pod_status(containers: &[&str]) -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        container_statuses: Some(
            containers
                .iter()
                .map(|name| ContainerStatus {
                    name: name.to_string(),
                    ready: true,
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}
