//! LabSession CRD describing one ephemeral lab environment

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// LabSession spec - desired state supplied by the creating actor
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dozlab.io",
    version = "v1alpha1",
    kind = "LabSession",
    plural = "labsessions",
    shortname = "ls",
    namespaced = true,
    status = "LabSessionStatus",
    printcolumn = r#"{"name":"Session", "type":"string", "jsonPath":".spec.sessionId"}"#,
    printcolumn = r#"{"name":"User", "type":"string", "jsonPath":".spec.userId"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Expires", "type":"string", "jsonPath":".status.expiresAt"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LabSessionSpec {
    /// Immutable session identifier, used in child names and labels
    pub session_id: String,
    /// Immutable owning user identifier
    pub user_id: String,
    /// URL of the ext4 guest root filesystem image
    pub rootfs_image_url: String,
    /// Optional SHA-256 of the rootfs image, verified after download
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_sha256: Option<String>,
    /// Quantities bounding the guest VM and its working volume
    #[serde(default)]
    pub resources: SessionResources,
    /// Sidecar toggles and IDE credentials
    #[serde(default)]
    pub config: SessionConfig,
    /// Time-to-live from creation (e.g. "30m", "1h30m")
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

fn default_timeout() -> String {
    "30m".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionResources {
    /// Guest memory plus runtime overhead (Kubernetes quantity)
    #[serde(default = "default_memory")]
    pub memory: String,
    /// Guest CPU (cores or millicores)
    #[serde(default = "default_cpu")]
    pub cpu: String,
    /// Guest root disk size
    #[serde(default = "default_storage")]
    pub storage: String,
}

fn default_memory() -> String {
    "2Gi".to_string()
}

fn default_cpu() -> String {
    "1".to_string()
}

fn default_storage() -> String {
    "4Gi".to_string()
}

impl Default for SessionResources {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
            storage: default_storage(),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// IDE password; generated by the operator when omitted
    #[serde(
        default,
        rename = "vsCodePassword",
        skip_serializing_if = "Option::is_none"
    )]
    pub vs_code_password: Option<String>,
    #[serde(default = "default_true")]
    pub enable_terminal: bool,
    #[serde(default = "default_true", rename = "enableVSCode")]
    pub enable_vs_code: bool,
    #[serde(default = "default_true", rename = "enableSSH")]
    pub enable_ssh: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vs_code_password: None,
            enable_terminal: true,
            enable_vs_code: true,
            enable_ssh: true,
        }
    }
}

// Keeps the password out of logs and error messages
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field(
                "vs_code_password",
                &self.vs_code_password.as_ref().map(|_| "<redacted>"),
            )
            .field("enable_terminal", &self.enable_terminal)
            .field("enable_vs_code", &self.enable_vs_code)
            .field("enable_ssh", &self.enable_ssh)
            .finish()
    }
}

/// Coarse-grained lifecycle phase of a LabSession
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Creating,
    Running,
    Failed,
    Expired,
    Terminating,
}

impl Phase {
    /// Phases the reaper never touches
    pub fn is_final(self) -> bool {
        matches!(self, Phase::Expired | Phase::Terminating)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Creating => "Creating",
            Phase::Running => "Running",
            Phase::Failed => "Failed",
            Phase::Expired => "Expired",
            Phase::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable failure class recorded alongside `Failed`/`Terminating`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FailureReason {
    InvalidSpec,
    ContainerFailure,
    ChildResourceConflict,
    ResourceExhausted,
    TransientApiError,
    TerminationStuck,
}

impl FailureReason {
    /// Whether a `Failed` session with this reason may be moved back to `Creating`
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureReason::ContainerFailure
                | FailureReason::ResourceExhausted
                | FailureReason::TransientApiError
        )
    }
}

/// Names of the child resources created for a session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChildRefs {
    pub pod: String,
    pub service: String,
    pub secret: String,
}

/// LabSession status, written only by the controller
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LabSessionStatus {
    #[serde(default)]
    pub phase: Phase,
    /// Human-readable explanation of the last transition
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_refs: Option<ChildRefs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Failed -> Creating recoveries consumed
    #[serde(default)]
    pub retry_count: u32,
    /// Garbage collection passes that still found children present
    #[serde(default)]
    pub termination_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl LabSession {
    /// Current phase, `Pending` when no status has been written yet
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Creation instant: status.createdAt, falling back to the API server timestamp
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.created_at.as_deref())
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&chrono::Utc))
            .or_else(|| self.metadata.creation_timestamp.as_ref().map(|t| t.0))
    }
}
