//! Session expiry
//!
//! Periodically lists sessions, marks those past their timeout as `Expired`
//! and deletes them. Deletion then runs through the controller's finalizer,
//! which removes the children. The status write is conditioned on the
//! resourceVersion the reaper read, so it never races a controller transition.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use kube::runtime::events::EventType;
use kube::Resource;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, ClusterClient};
use crate::controllers::events::{actions, reasons};
use crate::controllers::ControllerContext;
use crate::labsession::{LabSession, Phase};
use crate::phase::{is_expired, parse_timeout};

/// Counters for one reaper pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    pub expired: usize,
    pub errors: usize,
    /// Retry tracker entries dropped for sessions that no longer exist
    pub pruned: usize,
}

/// Whether `session` is past its timeout and still ours to expire
fn is_due(session: &LabSession, now: DateTime<Utc>) -> bool {
    if session.metadata.deletion_timestamp.is_some() || session.phase().is_final() {
        return false;
    }
    let Some(created_at) = session.created_at() else {
        return false;
    };
    match parse_timeout(&session.spec.timeout) {
        Ok(timeout) => is_expired(created_at, timeout, now),
        Err(e) => {
            debug!(
                name = %session.metadata.name.as_deref().unwrap_or("unknown"),
                error = %e,
                "Skipping session with unusable timeout"
            );
            false
        }
    }
}

/// Sessions past their timeout that are not already being deleted
pub fn find_expired(sessions: &[LabSession], now: DateTime<Utc>) -> Vec<&LabSession> {
    sessions.iter().filter(|s| is_due(s, now)).collect()
}

/// `Expired` sessions whose delete never went through
fn find_stranded(sessions: &[LabSession]) -> Vec<&LabSession> {
    sessions
        .iter()
        .filter(|s| s.phase() == Phase::Expired && s.metadata.deletion_timestamp.is_none())
        .collect()
}

async fn write_expired(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
    session: &LabSession,
    now: DateTime<Utc>,
) -> Result<(), ClientError> {
    let mut status = session.status.clone().unwrap_or_default();
    status.last_transition_time = Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));
    status.phase = Phase::Expired;
    status.message = format!("session exceeded its timeout of {}", session.spec.timeout);
    status.reason = None;
    client
        .patch_session_status(
            namespace,
            name,
            &status,
            session.metadata.resource_version.clone(),
        )
        .await?;
    Ok(())
}

/// Mark one session `Expired` and delete it
///
/// A conflicting status write is retried once against a fresh read, after
/// re-checking that the session is still due. Returns whether the session
/// was deleted.
pub async fn expire_session(
    client: &dyn ClusterClient,
    session: &LabSession,
    now: DateTime<Utc>,
) -> Result<bool, ClientError> {
    let (Some(namespace), Some(name)) = (
        session.metadata.namespace.as_deref(),
        session.metadata.name.as_deref(),
    ) else {
        return Ok(false);
    };

    if session.phase() != Phase::Expired {
        match write_expired(client, namespace, name, session, now).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(name, "Session changed while expiring, re-reading");
                let Some(fresh) = client.get_session(namespace, name).await? else {
                    return Ok(false);
                };
                if !is_due(&fresh, now) {
                    return Ok(false);
                }
                if fresh.phase() != Phase::Expired {
                    write_expired(client, namespace, name, &fresh, now).await?;
                }
            }
            Err(e) => return Err(e),
        }
    }

    client.delete_session(namespace, name).await?;
    info!(
        name,
        namespace,
        session_id = %session.spec.session_id,
        "Expired session deleted"
    );
    Ok(true)
}

/// One reaper pass over every visible session
pub async fn run_cycle(
    ctx: &ControllerContext,
    now: DateTime<Utc>,
) -> Result<ReapOutcome, ClientError> {
    let sessions = ctx.client.list_sessions().await?;

    let live: Vec<String> = sessions
        .iter()
        .filter_map(|s| s.metadata.uid.clone())
        .collect();
    let mut outcome = ReapOutcome {
        pruned: ctx.retry_tracker.cleanup(&live),
        ..Default::default()
    };

    for session in find_expired(&sessions, now) {
        match expire_session(ctx.client.as_ref(), session, now).await {
            Ok(true) => {
                outcome.expired += 1;
                ctx.events
                    .publish(
                        &session.object_ref(&()),
                        EventType::Normal,
                        reasons::SESSION_EXPIRED,
                        actions::DELETE,
                        Some(format!("timeout {} elapsed", session.spec.timeout)),
                    )
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    name = %session.metadata.name.as_deref().unwrap_or("unknown"),
                    error = %e,
                    "Failed to expire session"
                );
                outcome.errors += 1;
            }
        }
    }

    for session in find_stranded(&sessions) {
        if let Err(e) = expire_session(ctx.client.as_ref(), session, now).await {
            warn!(
                name = %session.metadata.name.as_deref().unwrap_or("unknown"),
                error = %e,
                "Failed to delete expired session"
            );
            outcome.errors += 1;
        }
    }

    Ok(outcome)
}

/// Run the reaper loop until the task is dropped
pub async fn run(ctx: Arc<ControllerContext>) {
    let mut ticker = interval(ctx.config.reaper_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = ctx.config.reaper_interval.as_secs(),
        "Starting session reaper"
    );

    loop {
        ticker.tick().await;

        match run_cycle(&ctx, Utc::now()).await {
            Ok(outcome) if outcome.expired > 0 || outcome.errors > 0 => {
                info!(
                    expired = outcome.expired,
                    errors = outcome.errors,
                    pruned = outcome.pruned,
                    "Reaper cycle complete"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Reaper cycle failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use crate::builder::tests::test_session;
    use crate::config::OperatorConfig;
    use crate::controllers::events::NoopEventPublisher;
    use crate::controllers::retry::RetryTracker;
    use crate::labsession::LabSessionStatus;
    use crate::test_support::FakeCluster;

    fn session_created(id: &str, ago: Duration) -> LabSession {
        let mut session = test_session(id, "alice");
        session.metadata.creation_timestamp = Some(Time(Utc::now() - ago));
        session
    }

    fn context(cluster: &FakeCluster) -> ControllerContext {
        ControllerContext {
            client: Arc::new(cluster.client()),
            config: Arc::new(OperatorConfig::default()),
            retry_tracker: Arc::new(RetryTracker::new()),
            events: Arc::new(NoopEventPublisher),
        }
    }

    #[test]
    fn test_find_expired_filters() {
        let now = Utc::now();
        let fresh = session_created("fresh", Duration::minutes(5));
        let old = session_created("old", Duration::hours(1));
        let mut deleting = session_created("deleting", Duration::hours(1));
        deleting.metadata.deletion_timestamp = Some(Time(now));
        let mut bad_timeout = session_created("bad", Duration::hours(1));
        bad_timeout.spec.timeout = "soon".to_string();
        let mut no_timestamp = test_session("unknown", "alice");
        no_timestamp.metadata.creation_timestamp = None;
        let mut expired = session_created("expired", Duration::hours(1));
        expired.status = Some(LabSessionStatus {
            phase: Phase::Expired,
            ..Default::default()
        });

        let sessions = vec![fresh, old, deleting, bad_timeout, no_timestamp, expired];
        let expired = find_expired(&sessions, now);

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].spec.session_id, "old");
    }

    #[test]
    fn test_status_created_at_wins_over_metadata() {
        let now = Utc::now();
        let mut session = session_created("abc", Duration::minutes(5));
        session.status = Some(LabSessionStatus {
            created_at: Some(
                (now - Duration::hours(2)).to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ..Default::default()
        });

        assert_eq!(find_expired(std::slice::from_ref(&session), now).len(), 1);
    }

    #[tokio::test]
    async fn test_expire_marks_then_deletes() {
        let cluster = FakeCluster::new();
        let session = cluster.insert_session(session_created("abc", Duration::hours(1)));
        let client = cluster.client();

        let deleted = expire_session(&client, &session, Utc::now()).await.unwrap();

        assert!(deleted);
        let state = cluster.state();
        assert_eq!(state.status_writes.len(), 1);
        assert_eq!(state.status_writes[0].phase, Phase::Expired);
        assert!(state.status_writes[0].message.contains("30m"));
        assert_eq!(state.deleted_sessions, vec!["session-abc"]);
    }

    #[tokio::test]
    async fn test_expire_retries_once_after_conflict() {
        let cluster = FakeCluster::new();
        let session = cluster.insert_session(session_created("abc", Duration::hours(1)));
        cluster.state().status_conflicts = 1;
        let client = cluster.client();

        let deleted = expire_session(&client, &session, Utc::now()).await.unwrap();

        assert!(deleted);
        let state = cluster.state();
        assert_eq!(state.status_writes.len(), 1);
        assert_eq!(state.deleted_sessions, vec!["session-abc"]);
    }

    #[tokio::test]
    async fn test_expire_gives_up_on_repeated_conflict() {
        let cluster = FakeCluster::new();
        let session = cluster.insert_session(session_created("abc", Duration::hours(1)));
        cluster.state().status_conflicts = 2;
        let client = cluster.client();

        let err = expire_session(&client, &session, Utc::now()).await.unwrap_err();

        assert!(err.is_conflict());
        assert!(cluster.state().deleted_sessions.is_empty());
    }

    #[tokio::test]
    async fn test_already_expired_session_is_only_deleted() {
        let cluster = FakeCluster::new();
        let mut session = session_created("abc", Duration::hours(1));
        session.status = Some(LabSessionStatus {
            phase: Phase::Expired,
            ..Default::default()
        });
        let session = cluster.insert_session(session);
        let client = cluster.client();

        assert!(expire_session(&client, &session, Utc::now()).await.unwrap());
        assert!(cluster.state().status_writes.is_empty());
        assert_eq!(cluster.state().deleted_sessions, vec!["session-abc"]);
    }

    #[tokio::test]
    async fn test_run_cycle_expires_and_prunes() {
        let cluster = FakeCluster::new();
        cluster.insert_session(session_created("old", Duration::hours(1)));
        cluster.insert_session(session_created("fresh", Duration::minutes(1)));
        let ctx = context(&cluster);
        ctx.retry_tracker.increment("uid-fresh", "boom");
        ctx.retry_tracker.increment("uid-gone", "boom");

        let outcome = run_cycle(&ctx, Utc::now()).await.unwrap();

        assert_eq!(
            outcome,
            ReapOutcome {
                expired: 1,
                errors: 0,
                pruned: 1
            }
        );
        assert_eq!(cluster.state().deleted_sessions, vec!["session-old"]);
        assert_eq!(ctx.retry_tracker.get("uid-fresh"), 1);
        assert!(cluster.session("session-fresh").is_some());
    }

    #[tokio::test]
    async fn test_run_cycle_retries_stranded_deletes() {
        let cluster = FakeCluster::new();
        let mut session = session_created("abc", Duration::hours(1));
        session.status = Some(LabSessionStatus {
            phase: Phase::Expired,
            ..Default::default()
        });
        cluster.insert_session(session);
        let ctx = context(&cluster);

        let outcome = run_cycle(&ctx, Utc::now()).await.unwrap();

        assert_eq!(outcome.expired, 0);
        assert_eq!(outcome.errors, 0);
        assert_eq!(cluster.state().deleted_sessions, vec!["session-abc"]);
    }
}
