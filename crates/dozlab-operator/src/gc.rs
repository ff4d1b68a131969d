//! Child garbage collection
//!
//! Removes every child a session owns and reports whether anything is left.
//! Used on deletion, before the finalizer is released, and for sessions that
//! failed for good. An object is only ever deleted when it carries both a
//! controller owner reference to the session's uid and the session's
//! `session-id` label.

use std::collections::HashSet;

use tracing::{debug, info, instrument, warn};

use crate::builder::{session_selector, ChildNames};
use crate::client::{ChildKind, ClientError, ClusterClient};
use crate::labsession::LabSession;

/// Result of one collection pass, children named `Kind/name`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcOutcome {
    pub deleted: Vec<String>,
    /// Owned children still present after the pass (e.g. pods terminating)
    pub remaining: Vec<String>,
    /// Objects matching a child name or selector that belong to someone else
    pub skipped_foreign: Vec<String>,
}

impl GcOutcome {
    /// No owned child is left; the finalizer may be removed
    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }
}

fn display(kind: ChildKind, name: &str) -> String {
    format!("{kind}/{name}")
}

/// Delete the session's children and confirm their absence
#[instrument(
    skip(client, session),
    fields(
        name = %session.metadata.name.as_deref().unwrap_or("unknown"),
        session_id = %session.spec.session_id
    )
)]
pub async fn collect(
    client: &dyn ClusterClient,
    session: &LabSession,
) -> Result<GcOutcome, ClientError> {
    let mut outcome = GcOutcome::default();
    let (Some(namespace), Some(uid)) = (
        session.metadata.namespace.as_deref(),
        session.metadata.uid.as_deref(),
    ) else {
        // Without a namespace or uid nothing can be proven ours
        warn!("Session has no namespace or uid, nothing to collect");
        return Ok(outcome);
    };
    let session_id = session.spec.session_id.as_str();
    let names = ChildNames::for_session(session_id);

    let mut targets: Vec<(ChildKind, String)> = vec![
        (ChildKind::Pod, names.pod),
        (ChildKind::Service, names.service),
        (ChildKind::Secret, names.secret),
    ];

    // Label-selected leftovers owned by the same session
    if !session_id.is_empty() {
        let selector = session_selector(session_id);
        for kind in ChildKind::ALL {
            for child in client.list_children(kind, namespace, &selector).await? {
                let name = child.name().to_string();
                if !targets.iter().any(|(k, n)| *k == kind && *n == name) {
                    targets.push((kind, name));
                }
            }
        }
    }

    let mut issued: HashSet<(ChildKind, String)> = HashSet::new();
    for (kind, name) in &targets {
        let Some(child) = client.get_child(*kind, namespace, name).await? else {
            continue;
        };
        if !child.belongs_to(uid, session_id) {
            warn!(kind = %kind, child = %name, "Skipping object not owned by this session");
            outcome.skipped_foreign.push(display(*kind, name));
            continue;
        }
        if child.metadata().deletion_timestamp.is_none() {
            client.delete_child(*kind, namespace, name).await?;
            debug!(kind = %kind, child = %name, "Deleted child");
        }
        issued.insert((*kind, name.clone()));
    }

    // Confirm absence
    for (kind, name) in &targets {
        if !issued.contains(&(*kind, name.clone())) {
            continue;
        }
        match client.get_child(*kind, namespace, name).await? {
            None => outcome.deleted.push(display(*kind, name)),
            Some(_) => outcome.remaining.push(display(*kind, name)),
        }
    }

    info!(
        deleted = outcome.deleted.len(),
        remaining = outcome.remaining.len(),
        skipped_foreign = outcome.skipped_foreign.len(),
        "Garbage collection pass complete"
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tests::test_session;
    use crate::test_support::{owned_child, FakeCluster};

    #[tokio::test]
    async fn test_collect_deletes_owned_children() {
        let session = test_session("abc", "alice");
        let cluster = FakeCluster::new();
        cluster.insert(owned_child(ChildKind::Pod, "lab-session-abc", &session));
        cluster.insert(owned_child(ChildKind::Service, "lab-service-abc", &session));
        cluster.insert(owned_child(ChildKind::Secret, "lab-session-abc-secrets", &session));

        let client = cluster.client();
        let outcome = collect(&client, &session).await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.deleted.len(), 3);
        assert!(outcome.skipped_foreign.is_empty());
        assert!(cluster.children().is_empty());
    }

    #[tokio::test]
    async fn test_collect_skips_foreign_objects() {
        let session = test_session("abc", "alice");
        let other = test_session("zzz", "mallory");
        let cluster = FakeCluster::new();
        // Same name, owned by another session
        cluster.insert(owned_child(ChildKind::Pod, "lab-session-abc", &other));
        cluster.insert(owned_child(ChildKind::Secret, "lab-session-abc-secrets", &session));

        let client = cluster.client();
        let outcome = collect(&client, &session).await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.deleted, vec!["Secret/lab-session-abc-secrets"]);
        assert_eq!(outcome.skipped_foreign, vec!["Pod/lab-session-abc"]);
        assert!(cluster.contains(ChildKind::Pod, "lab-session-abc"));
    }

    #[tokio::test]
    async fn test_collect_reports_lingering_children() {
        let session = test_session("abc", "alice");
        let cluster = FakeCluster::new();
        cluster.insert(owned_child(ChildKind::Pod, "lab-session-abc", &session));
        cluster.make_sticky(ChildKind::Pod, "lab-session-abc");

        let client = cluster.client();
        let outcome = collect(&client, &session).await.unwrap();

        assert!(!outcome.is_complete());
        assert_eq!(outcome.remaining, vec!["Pod/lab-session-abc"]);
    }

    #[tokio::test]
    async fn test_collect_removes_labelled_leftovers() {
        let session = test_session("abc", "alice");
        let cluster = FakeCluster::new();
        cluster.insert(owned_child(ChildKind::Pod, "lab-session-abc-old", &session));

        let client = cluster.client();
        let outcome = collect(&client, &session).await.unwrap();

        assert_eq!(outcome.deleted, vec!["Pod/lab-session-abc-old"]);
        assert!(cluster.children().is_empty());
    }

    #[tokio::test]
    async fn test_collect_without_children_is_complete() {
        let session = test_session("abc", "alice");
        let cluster = FakeCluster::new();
        let client = cluster.client();

        let outcome = collect(&client, &session).await.unwrap();
        assert!(outcome.is_complete());
        assert!(outcome.deleted.is_empty());
    }
}
