//! LabSession controller
//!
//! Watches dozlab.io/v1alpha1 LabSession resources and converges each one to
//! a running lab environment: a Pod, a Service and a Secret, all owned by the
//! session.
//!
//! ## Lifecycle
//!
//! - A finalizer is added before any child exists, so deletion always passes
//!   through child garbage collection.
//! - Phase is derived from the observed Pod by [`crate::phase::evaluate`].
//! - `Failed` sessions with a retryable reason are moved back to `Creating` a
//!   bounded number of times; the rest have their children collected.
//! - Expiry is owned by the reaper; this controller only leaves `Expired`
//!   sessions alone until their deletion arrives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::Api;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::events::EventType;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client as KubeClient, Resource};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::builder::{self, password_from_secret, ChildNames, ChildResources};
use crate::client::{ChildKind, ChildObject, ClusterClient};
use crate::config::{annotations, labels, FINALIZER};
use crate::error::SessionError;
use crate::gc;
use crate::labsession::{FailureReason, LabSession, LabSessionStatus, Phase};
use crate::phase::{self, Observation, PodHealth};

use super::events::{actions, reasons};
use super::retry::{backoff_delay, compute_backoff, session_retry_delay, ErrorKind};
use super::ControllerContext;

/// Floor for requeues scheduled from a deadline
const MIN_REQUEUE: Duration = Duration::from_secs(1);

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Time since `since`, zero when it lies in the future
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

fn has_finalizer(session: &LabSession) -> bool {
    session
        .metadata
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == FINALIZER)
}

/// Copy of `current` moved to `phase`; the transition time only moves with the phase
fn with_phase(
    current: &LabSessionStatus,
    phase: Phase,
    message: String,
    reason: Option<FailureReason>,
    now: DateTime<Utc>,
) -> LabSessionStatus {
    let mut next = current.clone();
    if next.phase != phase || next.last_transition_time.is_none() {
        next.last_transition_time = Some(timestamp(now));
    }
    next.phase = phase;
    next.message = message;
    next.reason = reason;
    next
}

struct SessionKey<'a> {
    name: &'a str,
    namespace: &'a str,
    uid: &'a str,
}

impl<'a> SessionKey<'a> {
    fn of(session: &'a LabSession) -> Result<Self, SessionError> {
        Ok(Self {
            name: session
                .metadata
                .name
                .as_deref()
                .ok_or(SessionError::MissingField("metadata.name"))?,
            namespace: session
                .metadata
                .namespace
                .as_deref()
                .ok_or(SessionError::MissingField("metadata.namespace"))?,
            uid: session
                .metadata
                .uid
                .as_deref()
                .ok_or(SessionError::MissingField("metadata.uid"))?,
        })
    }
}

/// Patch status when it differs from what the session already carries
///
/// The write is conditioned on the resourceVersion we reconciled from, so a
/// concurrent reaper transition is never overwritten.
///
/// Returns the updated session when a write happened.
async fn write_status(
    ctx: &ControllerContext,
    session: &LabSession,
    status: LabSessionStatus,
) -> Result<Option<LabSession>, SessionError> {
    if session.status.as_ref() == Some(&status) {
        return Ok(None);
    }
    let key = SessionKey::of(session)?;
    let updated = ctx
        .client
        .patch_session_status(
            key.namespace,
            key.name,
            &status,
            session.metadata.resource_version.clone(),
        )
        .await?;
    debug!(phase = %status.phase, message = %status.message, "Updated session status");
    Ok(Some(updated))
}

async fn publish(
    ctx: &ControllerContext,
    session: &LabSession,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    let reference = session.object_ref(&());
    ctx.events
        .publish(&reference, type_, reason, action, Some(note))
        .await;
}

/// Move a session to `Failed`
async fn mark_failed(
    ctx: &ControllerContext,
    session: &LabSession,
    reason: FailureReason,
    message: String,
    now: DateTime<Utc>,
) -> Result<(), SessionError> {
    let current = session.status.clone().unwrap_or_default();
    let next = with_phase(&current, Phase::Failed, message.clone(), Some(reason), now);
    if write_status(ctx, session, next).await?.is_some() {
        let event_reason = match reason {
            FailureReason::ChildResourceConflict => reasons::CHILD_CONFLICT,
            _ => reasons::SESSION_FAILED,
        };
        publish(
            ctx,
            session,
            EventType::Warning,
            event_reason,
            actions::RECONCILE,
            message,
        )
        .await;
    }
    Ok(())
}

/// Reconcile a single LabSession
#[instrument(
    skip(ctx, session),
    fields(
        name = %session.metadata.name.as_deref().unwrap_or("unknown"),
        namespace = %session.metadata.namespace.as_deref().unwrap_or("default"),
        session_id = %session.spec.session_id
    )
)]
pub async fn reconcile(
    session: Arc<LabSession>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, SessionError> {
    let now = Utc::now();
    match reconcile_session(&session, &ctx, now).await {
        Err(e)
            if e.fails_session()
                && session.metadata.deletion_timestamp.is_none()
                && matches!(
                    session.phase(),
                    Phase::Pending | Phase::Creating | Phase::Running
                ) =>
        {
            warn!(error = %e, reason = ?e.reason(), "Session failed");
            mark_failed(&ctx, &session, e.reason(), e.to_string(), now).await?;
            Ok(Action::await_change())
        }
        other => other,
    }
}

async fn reconcile_session(
    session: &LabSession,
    ctx: &ControllerContext,
    now: DateTime<Utc>,
) -> Result<Action, SessionError> {
    let key = SessionKey::of(session)?;

    if session.metadata.deletion_timestamp.is_some() {
        return finalize(session, ctx, now).await;
    }

    if !has_finalizer(session) {
        let mut finalizers = session.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(FINALIZER.to_string());
        ctx.client
            .set_finalizers(
                key.namespace,
                key.name,
                finalizers,
                session.metadata.resource_version.clone(),
            )
            .await?;
        debug!("Added finalizer");
        // The metadata write produces a fresh watch event for this session
        return Ok(Action::await_change());
    }

    let current = session.status.clone().unwrap_or_default();

    if current.phase.is_final() {
        debug!(phase = %current.phase, "Waiting for deletion");
        return Ok(Action::await_change());
    }

    let attempts = ctx.retry_tracker.get(key.uid);
    if current.phase != Phase::Failed && attempts >= ctx.config.max_transient_attempts {
        let last = ctx
            .retry_tracker
            .last_error(key.uid)
            .unwrap_or_else(|| "unknown error".to_string());
        ctx.retry_tracker.reset(key.uid);
        warn!(attempts, error = %last, "Transient retry budget exhausted");
        mark_failed(
            ctx,
            session,
            FailureReason::TransientApiError,
            format!("giving up after {attempts} consecutive API errors: {last}"),
            now,
        )
        .await?;
        return Ok(Action::await_change());
    }

    if current.phase == Phase::Failed {
        return recover_failed(session, ctx, &current, now).await;
    }

    let password = resolve_password(ctx, session, &key).await?;
    let children = builder::build(session, &ctx.config.defaults, &password)?;
    let names = children.plan.names.clone();
    let timeout = children.plan.timeout;

    // A pod that vanished under a running session is reported, not silently replaced
    let recreate_pod = current.phase != Phase::Running;
    let applied = apply_children(ctx.client.as_ref(), &key, session, children, recreate_pod).await?;

    let observation = Observation {
        current: current.phase,
        pod: applied.pod.as_ref().map(PodHealth::from_pod),
        service_present: applied.service,
        secret_present: applied.secret,
        restart_budget: ctx.config.container_restart_budget,
    };
    let transition = phase::evaluate(&observation);

    let created_at = session.created_at().unwrap_or(now);
    let expires = phase::expires_at(created_at, timeout);

    let mut next = if transition.is_hold() {
        current.clone()
    } else {
        with_phase(
            &current,
            transition.phase,
            transition.message.clone(),
            transition.reason,
            now,
        )
    };
    next.child_refs = Some(names.into());
    next.created_at = Some(timestamp(created_at));
    next.expires_at = Some(timestamp(expires));
    next.observed_generation = session.metadata.generation;

    let entered = (next.phase != current.phase).then_some(next.phase);
    write_status(ctx, session, next).await?;

    match entered {
        Some(Phase::Running) => {
            info!("Session running");
            publish(
                ctx,
                session,
                EventType::Normal,
                reasons::SESSION_RUNNING,
                actions::RECONCILE,
                "All containers ready".to_string(),
            )
            .await;
        }
        Some(Phase::Failed) => {
            warn!(message = %transition.message, "Session failed");
            publish(
                ctx,
                session,
                EventType::Warning,
                reasons::SESSION_FAILED,
                actions::RECONCILE,
                transition.message,
            )
            .await;
        }
        Some(phase) => info!(phase = %phase, "Session phase changed"),
        None => {}
    }

    ctx.retry_tracker.reset(key.uid);

    let until_expiry = if expires > now {
        elapsed(now, expires)
    } else {
        Duration::ZERO
    };
    Ok(Action::requeue(
        ctx.config.resync_interval.min(until_expiry.max(MIN_REQUEUE)),
    ))
}

/// Password order: spec, then the existing session Secret, then a fresh one
async fn resolve_password(
    ctx: &ControllerContext,
    session: &LabSession,
    key: &SessionKey<'_>,
) -> Result<String, SessionError> {
    if let Some(password) = session
        .spec
        .config
        .vs_code_password
        .as_deref()
        .filter(|p| !p.is_empty())
    {
        return Ok(password.to_string());
    }

    let names = ChildNames::for_session(&session.spec.session_id);
    if let Some(existing) = ctx
        .client
        .get_child(ChildKind::Secret, key.namespace, &names.secret)
        .await?
    {
        if let ChildObject::Secret(secret) = &existing {
            if existing.belongs_to(key.uid, &session.spec.session_id) {
                if let Some(password) = password_from_secret(secret) {
                    return Ok(password);
                }
            }
        }
    }

    debug!("Generating IDE password");
    Ok(builder::generate_password())
}

/// What exists after applying the desired children
struct Applied {
    pod: Option<Pod>,
    service: bool,
    secret: bool,
}

async fn apply_children(
    client: &dyn ClusterClient,
    key: &SessionKey<'_>,
    session: &LabSession,
    children: ChildResources,
    recreate_pod: bool,
) -> Result<Applied, SessionError> {
    let session_id = session.spec.session_id.as_str();

    // Secret first so the pod's secretKeyRef resolves on admission
    let secret = apply_child(client, key, session_id, ChildObject::Secret(children.secret), true).await?;
    let service = apply_child(client, key, session_id, ChildObject::Service(children.service), true).await?;
    let pod = apply_child(client, key, session_id, ChildObject::Pod(children.pod), recreate_pod).await?;

    Ok(Applied {
        pod: match pod {
            Some(ChildObject::Pod(pod)) => Some(pod),
            _ => None,
        },
        service: service.is_some(),
        secret: secret.is_some(),
    })
}

/// Converge one child; returns the live object, `None` when absent or going away
async fn apply_child(
    client: &dyn ClusterClient,
    key: &SessionKey<'_>,
    session_id: &str,
    desired: ChildObject,
    create_missing: bool,
) -> Result<Option<ChildObject>, SessionError> {
    let kind = desired.kind();
    let name = desired.name().to_string();

    let existing = match client.get_child(kind, key.namespace, &name).await? {
        Some(existing) => existing,
        None if !create_missing => return Ok(None),
        None => match client.create_child(key.namespace, &desired).await {
            Ok(()) => {
                info!(kind = %kind, child = %name, "Created child");
                return Ok(Some(desired));
            }
            Err(e) if e.is_conflict() => {
                // Lost a race with another writer; adopt only what is ours
                match client.get_child(kind, key.namespace, &name).await? {
                    Some(existing) => existing,
                    None => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        },
    };

    if !existing.belongs_to(key.uid, session_id) {
        return Err(SessionError::ChildResourceConflict { kind, name });
    }
    if existing.metadata().deletion_timestamp.is_some() {
        debug!(kind = %kind, child = %name, "Child is terminating");
        return Ok(None);
    }

    if let Some(patch) = drift_patch(&existing, &desired) {
        info!(kind = %kind, child = %name, "Patching drifted child");
        client.patch_child(kind, key.namespace, &name, patch).await?;
    }
    Ok(Some(existing))
}

/// Field-scoped merge patch bringing `existing` back to `desired`
fn drift_patch(existing: &ChildObject, desired: &ChildObject) -> Option<Value> {
    let mut metadata = Map::new();
    let mut patch = Map::new();

    let want_labels = desired.metadata().labels.clone().unwrap_or_default();
    let have_labels = existing.metadata().labels.clone().unwrap_or_default();
    if want_labels.iter().any(|(k, v)| have_labels.get(k) != Some(v)) {
        metadata.insert("labels".to_string(), json!(want_labels));
    }

    let spec_hash = |obj: &ChildObject| {
        obj.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::SPEC_HASH))
            .cloned()
    };

    match (existing, desired) {
        (ChildObject::Service(have), ChildObject::Service(want)) => {
            if service_drifted(have, want) {
                let spec = want.spec.clone().unwrap_or_default();
                patch.insert(
                    "spec".to_string(),
                    json!({ "ports": spec.ports, "selector": spec.selector }),
                );
                if let Some(hash) = spec_hash(desired) {
                    metadata.insert(
                        "annotations".to_string(),
                        json!({ annotations::SPEC_HASH: hash }),
                    );
                }
            }
        }
        (ChildObject::Secret(have), ChildObject::Secret(want)) => {
            if have.data != want.data {
                patch.insert("data".to_string(), json!(want.data));
            }
        }
        (ChildObject::Pod(_), ChildObject::Pod(_)) => {
            if spec_hash(existing) != spec_hash(desired) {
                // Pod specs are immutable; the change lands when the pod is next recreated
                warn!(pod = %existing.name(), "Pod spec differs from desired");
            }
        }
        _ => {}
    }

    if !metadata.is_empty() {
        patch.insert("metadata".to_string(), Value::Object(metadata));
    }
    (!patch.is_empty()).then_some(Value::Object(patch))
}

fn service_drifted(have: &Service, want: &Service) -> bool {
    let ports = |svc: &Service| -> Vec<(Option<String>, i32)> {
        svc.spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| ports.iter().map(|p| (p.name.clone(), p.port)).collect())
            .unwrap_or_default()
    };
    let selector = |svc: &Service| svc.spec.as_ref().and_then(|s| s.selector.clone());
    ports(have) != ports(want) || selector(have) != selector(want)
}

/// Failed sessions: bounded retry for retryable reasons, cleanup otherwise
async fn recover_failed(
    session: &LabSession,
    ctx: &ControllerContext,
    current: &LabSessionStatus,
    now: DateTime<Utc>,
) -> Result<Action, SessionError> {
    let key = SessionKey::of(session)?;
    let retryable = current.reason.is_some_and(FailureReason::is_retryable);
    let max_retries = ctx.config.max_session_retries;

    if !retryable || current.retry_count >= max_retries {
        let outcome = gc::collect(ctx.client.as_ref(), session).await?;
        debug!(
            reason = ?current.reason,
            retry_count = current.retry_count,
            deleted = outcome.deleted.len(),
            "Session failed permanently, children collected"
        );
        return Ok(Action::await_change());
    }

    let wait = session_retry_delay(current.retry_count);
    if let Some(failed_at) = parse_timestamp(current.last_transition_time.as_deref()) {
        let waited = elapsed(failed_at, now);
        if waited < wait {
            return Ok(Action::requeue(wait - waited));
        }
    }

    let names = ChildNames::for_session(&session.spec.session_id);
    if let Some(pod) = ctx
        .client
        .get_child(ChildKind::Pod, key.namespace, &names.pod)
        .await?
    {
        if pod.belongs_to(key.uid, &session.spec.session_id) {
            ctx.client
                .delete_child(ChildKind::Pod, key.namespace, &names.pod)
                .await?;
            debug!(pod = %names.pod, "Deleted failed pod");
        }
    }

    let attempt = current.retry_count + 1;
    let message = format!(
        "retry {attempt}/{max_retries} after failure: {}",
        current.message
    );
    let mut next = with_phase(current, Phase::Creating, message.clone(), None, now);
    next.retry_count = attempt;
    write_status(ctx, session, next).await?;

    info!(attempt, max_retries, "Retrying failed session");
    publish(
        ctx,
        session,
        EventType::Normal,
        reasons::SESSION_RETRY,
        actions::RECONCILE,
        message,
    )
    .await;

    Ok(Action::requeue(backoff_delay(attempt)))
}

/// Offset from the start of termination at which GC pass `attempts + 1` is due
fn next_pass_due(ctx: &ControllerContext, attempts: u32) -> Duration {
    let regular = attempts.min(ctx.config.gc_max_attempts.saturating_sub(1));
    let stuck = attempts - regular;
    ctx.config.gc_requeue_interval * regular + ctx.config.stuck_requeue_interval * stuck
}

/// Deletion path: collect children, then release the finalizer
async fn finalize(
    session: &LabSession,
    ctx: &ControllerContext,
    now: DateTime<Utc>,
) -> Result<Action, SessionError> {
    let key = SessionKey::of(session)?;
    if !has_finalizer(session) {
        return Ok(Action::await_change());
    }

    let mut current = session.status.clone().unwrap_or_default();

    // Report teardown before the first pass; later writes build on this version
    let entered;
    let session = if current.phase == Phase::Terminating {
        session
    } else {
        let mut next = with_phase(
            &current,
            Phase::Terminating,
            "removing session children".to_string(),
            None,
            now,
        );
        next.termination_attempts = 0;
        entered = write_status(ctx, session, next).await?;
        match &entered {
            Some(updated) => {
                current = updated.status.clone().unwrap_or_default();
                updated
            }
            None => session,
        }
    };

    // Our own status writes trigger reconciles; keep passes on schedule
    if current.phase == Phase::Terminating && current.termination_attempts > 0 {
        if let Some(started) = parse_timestamp(current.last_transition_time.as_deref()) {
            let due = next_pass_due(ctx, current.termination_attempts);
            let waited = elapsed(started, now);
            if waited < due {
                return Ok(Action::requeue(due - waited));
            }
        }
    }

    let outcome = gc::collect(ctx.client.as_ref(), session).await?;

    if outcome.is_complete() {
        let finalizers: Vec<String> = session
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        ctx.client
            .set_finalizers(
                key.namespace,
                key.name,
                finalizers,
                session.metadata.resource_version.clone(),
            )
            .await?;
        ctx.retry_tracker.reset(key.uid);
        info!(
            deleted = outcome.deleted.len(),
            skipped_foreign = outcome.skipped_foreign.len(),
            "Children removed, finalizer released"
        );
        return Ok(Action::await_change());
    }

    let attempts = current.termination_attempts + 1;
    let stuck = attempts >= ctx.config.gc_max_attempts;
    let remaining = outcome.remaining.join(", ");
    let message = if stuck {
        format!("termination stuck after {attempts} cleanup attempts; remaining: {remaining}")
    } else {
        format!("waiting for children to terminate: {remaining}")
    };

    let mut next = with_phase(
        &current,
        Phase::Terminating,
        message.clone(),
        stuck.then_some(FailureReason::TerminationStuck),
        now,
    );
    next.termination_attempts = attempts;
    write_status(ctx, session, next).await?;

    if stuck {
        error!(attempts, remaining = %remaining, "Session termination stuck");
        publish(
            ctx,
            session,
            EventType::Warning,
            reasons::TERMINATION_STUCK,
            actions::DELETE,
            message,
        )
        .await;
        Ok(Action::requeue(ctx.config.stuck_requeue_interval))
    } else {
        debug!(attempts, remaining = %remaining, "Children still terminating");
        Ok(Action::requeue(ctx.config.gc_requeue_interval))
    }
}

/// Error policy: transient errors consume the retry budget and back off
fn error_policy(session: Arc<LabSession>, error: &SessionError, ctx: Arc<ControllerContext>) -> Action {
    let uid = session.metadata.uid.as_deref().unwrap_or("unknown");
    let kind = error.kind();

    // RetryTracker uses std::sync::Mutex so we can call this synchronously
    let attempt = match kind {
        ErrorKind::Transient => ctx.retry_tracker.increment(uid, &error.to_string()),
        ErrorKind::Permanent => ctx.retry_tracker.get(uid),
    };

    warn!(
        name = %session.metadata.name.as_deref().unwrap_or("unknown"),
        error = %error,
        attempt,
        error_kind = ?kind,
        "LabSession reconciliation failed"
    );

    compute_backoff(attempt, kind)
}

/// Start the LabSession controller
pub async fn run(client: KubeClient, ctx: Arc<ControllerContext>) {
    let namespace = ctx.config.namespace.clone();
    let (sessions, pods, services, secrets) = match namespace.as_deref() {
        Some(ns) => (
            Api::<LabSession>::namespaced(client.clone(), ns),
            Api::<Pod>::namespaced(client.clone(), ns),
            Api::<Service>::namespaced(client.clone(), ns),
            Api::<Secret>::namespaced(client, ns),
        ),
        None => (
            Api::<LabSession>::all(client.clone()),
            Api::<Pod>::all(client.clone()),
            Api::<Service>::all(client.clone()),
            Api::<Secret>::all(client),
        ),
    };
    let children = WatcherConfig::default().labels(labels::CHILD_SELECTOR);

    info!(
        namespace = namespace.as_deref().unwrap_or("<all>"),
        workers = ctx.config.workers,
        "Starting LabSession controller"
    );

    Controller::new(sessions, WatcherConfig::default())
        .owns(pods, children.clone())
        .owns(services, children.clone())
        .owns(secrets, children)
        .with_config(ControllerConfig::default().concurrency(ctx.config.workers))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(name = %obj.name, "LabSession reconciled successfully");
                }
                Err(e) => {
                    warn!(error = %e, "LabSession controller error");
                }
            }
        })
        .await;
}
