//! Phase state machine
//!
//! Pure mapping from what the reconciler observed in the cluster to the next
//! session phase. No I/O happens here; the reconciler gathers an
//! [`Observation`] and writes whatever [`evaluate`] returns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use thiserror::Error;

use crate::labsession::{FailureReason, Phase};

#[derive(Debug, Error)]
pub enum TimeoutError {
    #[error("{0}")]
    Invalid(#[from] humantime::DurationError),
    #[error("timeout must be greater than zero")]
    Zero,
}

/// Parse a session timeout such as "30m" or "1h 30m"
pub fn parse_timeout(s: &str) -> Result<Duration, TimeoutError> {
    let timeout = humantime::parse_duration(s.trim())?;
    if timeout.is_zero() {
        return Err(TimeoutError::Zero);
    }
    Ok(timeout)
}

/// Deadline after which the session is reaped
pub fn expires_at(created_at: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|ttl| created_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn is_expired(created_at: DateTime<Utc>, timeout: Duration, now: DateTime<Utc>) -> bool {
    now >= expires_at(created_at, timeout)
}

/// Condensed state of one container
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerHealth {
    pub name: String,
    pub ready: bool,
    pub restarts: i32,
    /// Reason of the current waiting state (e.g. `CrashLoopBackOff`)
    pub waiting_reason: Option<String>,
    /// Exit code of the current terminated state
    pub exit_code: Option<i32>,
    /// Most recent non-zero termination, current or previous
    pub last_error: Option<String>,
}

impl ContainerHealth {
    fn from_status(status: &ContainerStatus) -> Self {
        let state = status.state.as_ref();
        let waiting_reason = state
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.clone());
        let terminated = state.and_then(|s| s.terminated.as_ref());
        let previous = status.last_state.as_ref().and_then(|s| s.terminated.as_ref());

        let last_error = terminated
            .into_iter()
            .chain(previous)
            .find(|t| t.exit_code != 0)
            .map(|t| {
                let detail = t
                    .message
                    .clone()
                    .or_else(|| t.reason.clone())
                    .unwrap_or_else(|| "terminated".to_string());
                format!("exit code {}: {}", t.exit_code, detail.trim())
            });

        Self {
            name: status.name.clone(),
            ready: status.ready,
            restarts: status.restart_count,
            waiting_reason,
            exit_code: terminated.map(|t| t.exit_code),
            last_error,
        }
    }

    fn completed(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn crash_looping(&self) -> bool {
        self.waiting_reason.as_deref() == Some("CrashLoopBackOff")
            || self.exit_code.is_some_and(|code| code != 0)
    }

    /// Failed past the restart budget
    fn exhausted(&self, budget: i32) -> bool {
        self.restarts >= budget && self.crash_looping() && self.last_error.is_some()
    }

    fn describe_failure(&self, stage: &str) -> String {
        format!(
            "{stage} container {} failed after {} restarts: {}",
            self.name,
            self.restarts,
            self.last_error.as_deref().unwrap_or("crash loop"),
        )
    }
}

/// Pod summary the state machine works from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodHealth {
    /// Pod phase as reported by the kubelet (`Pending`, `Running`, `Failed`, ...)
    pub phase: String,
    pub message: Option<String>,
    pub init_containers: Vec<ContainerHealth>,
    pub containers: Vec<ContainerHealth>,
    /// Main containers declared in the pod spec
    pub expected_containers: Vec<String>,
}

impl PodHealth {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let collect = |statuses: Option<&Vec<ContainerStatus>>| {
            statuses
                .map(|s| s.iter().map(ContainerHealth::from_status).collect())
                .unwrap_or_default()
        };

        Self {
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Pending".to_string()),
            message: status.and_then(|s| s.message.clone().or_else(|| s.reason.clone())),
            init_containers: collect(status.and_then(|s| s.init_container_statuses.as_ref())),
            containers: collect(status.and_then(|s| s.container_statuses.as_ref())),
            expected_containers: pod
                .spec
                .as_ref()
                .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
        }
    }

    /// Every declared main container reports ready
    pub fn all_ready(&self) -> bool {
        !self.expected_containers.is_empty()
            && self.expected_containers.iter().all(|name| {
                self.containers
                    .iter()
                    .any(|c| &c.name == name && c.ready)
            })
    }

    fn not_ready(&self) -> Vec<&str> {
        self.expected_containers
            .iter()
            .filter(|name| !self.containers.iter().any(|c| &c.name == *name && c.ready))
            .map(String::as_str)
            .collect()
    }
}

/// Everything the state machine needs to decide the next phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub current: Phase,
    pub pod: Option<PodHealth>,
    pub service_present: bool,
    pub secret_present: bool,
    /// Restarts tolerated per container before the session fails
    pub restart_budget: i32,
}

impl Observation {
    pub fn was_running(&self) -> bool {
        self.current == Phase::Running
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub phase: Phase,
    pub message: String,
    pub reason: Option<FailureReason>,
}

impl Transition {
    fn to(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            reason: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            phase: Phase::Failed,
            message: message.into(),
            reason: Some(FailureReason::ContainerFailure),
        }
    }

    fn unchanged(phase: Phase) -> Option<Self> {
        matches!(phase, Phase::Expired | Phase::Terminating | Phase::Failed).then_some(Self {
            phase,
            message: String::new(),
            reason: None,
        })
    }

    /// Whether this transition leaves the phase untouched
    pub fn is_hold(&self) -> bool {
        self.message.is_empty() && self.reason.is_none()
    }
}

/// Decide the next phase. First matching rule wins.
///
/// `Expired`, `Terminating` and `Failed` are returned as a hold (empty message);
/// only the reaper, the deletion path or an explicit retry moves them.
pub fn evaluate(obs: &Observation) -> Transition {
    if let Some(hold) = Transition::unchanged(obs.current) {
        return hold;
    }

    let Some(pod) = &obs.pod else {
        return match obs.current {
            Phase::Running => Transition::failed("pod disappeared"),
            Phase::Pending => Transition::to(Phase::Pending, "waiting for pod to be created"),
            _ => Transition::to(Phase::Creating, "waiting for pod to be created"),
        };
    };

    if pod.phase == "Failed" {
        return Transition::failed(format!(
            "pod failed: {}",
            pod.message.as_deref().unwrap_or("no reason reported")
        ));
    }
    if let Some(init) = pod
        .init_containers
        .iter()
        .find(|c| c.exhausted(obs.restart_budget))
    {
        return Transition::failed(init.describe_failure("init"));
    }
    if let Some(main) = pod
        .containers
        .iter()
        .find(|c| c.exhausted(obs.restart_budget))
    {
        return Transition::failed(main.describe_failure("main"));
    }

    if pod.phase == "Running" && pod.all_ready() && obs.service_present && obs.secret_present {
        return Transition::to(Phase::Running, "all containers ready");
    }

    if obs.was_running() {
        let lost = pod.not_ready();
        let message = if lost.is_empty() {
            format!("readiness lost: pod phase {}", pod.phase)
        } else {
            format!("readiness lost: {}", lost.join(", "))
        };
        return Transition::failed(message);
    }

    Transition::to(Phase::Creating, progress(obs, pod))
}

fn progress(obs: &Observation, pod: &PodHealth) -> String {
    if !obs.secret_present || !obs.service_present {
        return "waiting for session service and secret".to_string();
    }
    // Init containers run in order; report the first one not done yet
    if let Some(init) = pod.init_containers.iter().find(|c| !c.completed()) {
        return match &init.waiting_reason {
            Some(reason) => format!("init {}: {reason}", init.name),
            None => format!("running init {}", init.name),
        };
    }
    if pod.init_containers.is_empty() && pod.containers.is_empty() {
        return match &pod.message {
            Some(message) => format!("pod {}: {message}", pod.phase),
            None => format!("pod {}", pod.phase),
        };
    }
    let pending = pod.not_ready();
    if pending.is_empty() {
        format!("pod {}", pod.phase)
    } else {
        format!("waiting for containers: {}", pending.join(", "))
    }
}
