//! Resource builder
//!
//! Maps a [`LabSession`] to the Pod, Service and Secret that make up one lab
//! environment. Everything here is pure: the same session, defaults and
//! password always render identical objects, so the reconciler can diff the
//! output against the cluster and the mapping can be tested without a cluster.

pub mod network;
pub mod pod;
pub mod quantity;

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::Resource;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;

use crate::config::{annotations, labels, BuilderDefaults};
use crate::labsession::{ChildRefs, LabSession, LabSessionSpec};
use crate::phase::parse_timeout;

use self::network::NetworkPlan;

/// Secret key holding the IDE password
pub const PASSWORD_KEY: &str = "vscode-password";

pub const VSCODE_PORT: i32 = 8080;
pub const TERMINAL_PORT: i32 = 8081;
pub const SSH_PORT: i32 = 22;

/// Smallest guest the VM runtime will boot
const MIN_GUEST_MEMORY: i64 = 256 * 1024 * 1024;

/// Longest session id that keeps every derived child name a valid DNS label
const MAX_SESSION_ID_LEN: usize = 40;

const GENERATED_PASSWORD_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl BuildError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        BuildError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Children rendered for one session
#[derive(Clone, Debug)]
pub struct ChildResources {
    pub pod: Pod,
    pub service: Service,
    pub secret: Secret,
    /// Validated values the children were rendered from
    pub plan: SessionPlan,
}

/// Deterministic child names for a session id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildNames {
    pub pod: String,
    pub service: String,
    pub secret: String,
}

impl ChildNames {
    pub fn for_session(session_id: &str) -> Self {
        Self {
            pod: format!("lab-session-{session_id}"),
            service: format!("lab-service-{session_id}"),
            secret: format!("lab-session-{session_id}-secrets"),
        }
    }
}

impl From<ChildNames> for ChildRefs {
    fn from(names: ChildNames) -> Self {
        ChildRefs {
            pod: names.pod,
            service: names.service,
            secret: names.secret,
        }
    }
}

/// Parsed and validated view of a session spec
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPlan {
    pub memory_bytes: i64,
    pub cpu_millicores: i64,
    pub storage_bytes: i64,
    pub timeout: Duration,
    pub network: NetworkPlan,
    pub names: ChildNames,
}

/// Validate a spec against the builder defaults
pub fn validate(
    spec: &LabSessionSpec,
    defaults: &BuilderDefaults,
) -> Result<SessionPlan, BuildError> {
    if spec.session_id.is_empty() {
        return Err(BuildError::MissingField("sessionId"));
    }
    if spec.user_id.is_empty() {
        return Err(BuildError::MissingField("userId"));
    }
    if spec.rootfs_image_url.is_empty() {
        return Err(BuildError::MissingField("rootfsImageUrl"));
    }

    if !is_dns_label(&spec.session_id) || spec.session_id.len() > MAX_SESSION_ID_LEN {
        return Err(BuildError::invalid(
            "sessionId",
            format!(
                "must be lowercase alphanumeric or '-', start and end alphanumeric, at most {MAX_SESSION_ID_LEN} characters"
            ),
        ));
    }
    if !is_label_value(&spec.user_id) {
        return Err(BuildError::invalid(
            "userId",
            "must be a valid label value (alphanumeric, '-', '_' or '.', at most 63 characters)",
        ));
    }

    let url = &spec.rootfs_image_url;
    let has_host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .is_some_and(|rest| !rest.is_empty());
    if !has_host {
        return Err(BuildError::invalid(
            "rootfsImageUrl",
            "must be an http(s) URL",
        ));
    }

    if let Some(sha) = &spec.rootfs_sha256 {
        if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BuildError::invalid(
                "rootfsSha256",
                "must be 64 hexadecimal characters",
            ));
        }
    }

    let memory_bytes = quantity::parse_memory(&spec.resources.memory)
        .map_err(|e| BuildError::invalid("resources.memory", e.to_string()))?;
    let cpu_millicores = quantity::parse_cpu(&spec.resources.cpu)
        .map_err(|e| BuildError::invalid("resources.cpu", e.to_string()))?;
    let storage_bytes = quantity::parse_memory(&spec.resources.storage)
        .map_err(|e| BuildError::invalid("resources.storage", e.to_string()))?;

    let overhead = quantity::parse_memory(&defaults.vm_memory_overhead)
        .map_err(|e| BuildError::invalid("vmMemoryOverhead", e.to_string()))?;
    let floor = overhead.saturating_add(MIN_GUEST_MEMORY);
    if memory_bytes < floor {
        return Err(BuildError::invalid(
            "resources.memory",
            format!(
                "must be at least {} (VM overhead plus minimum guest memory)",
                quantity::format_mebibytes(floor)
            ),
        ));
    }

    let timeout = parse_timeout(&spec.timeout)
        .map_err(|e| BuildError::invalid("timeout", e.to_string()))?;

    Ok(SessionPlan {
        memory_bytes,
        cpu_millicores,
        storage_bytes,
        timeout,
        network: NetworkPlan::for_session(&spec.session_id),
        names: ChildNames::for_session(&spec.session_id),
    })
}

/// Render the child resources for a session
pub fn build(
    session: &LabSession,
    defaults: &BuilderDefaults,
    password: &str,
) -> Result<ChildResources, BuildError> {
    let plan = validate(&session.spec, defaults)?;
    if password.is_empty() {
        return Err(BuildError::MissingField("config.vsCodePassword"));
    }

    let owner = owner_reference(session)?;
    let labels = child_labels(&session.spec);
    let namespace = session.metadata.namespace.clone();

    let pod = pod::build_pod(session, &plan, defaults, &labels, &owner)?;
    let service = build_service(session, &plan, &labels, &owner, namespace.clone());
    let secret = build_secret(&plan, &labels, &owner, namespace, password);

    Ok(ChildResources {
        pod,
        service,
        secret,
        plan,
    })
}

/// Controller owner reference pointing back at the session
pub fn owner_reference(session: &LabSession) -> Result<OwnerReference, BuildError> {
    if session.metadata.uid.is_none() {
        return Err(BuildError::MissingField("metadata.uid"));
    }
    let mut owner = session
        .controller_owner_ref(&())
        .ok_or(BuildError::MissingField("metadata.name"))?;
    owner.block_owner_deletion = Some(true);
    Ok(owner)
}

/// Label set carried by every child
pub fn child_labels(spec: &LabSessionSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::APP.to_string(), labels::APP_VALUE.to_string()),
        (labels::SESSION_ID.to_string(), spec.session_id.clone()),
        (labels::USER_ID.to_string(), spec.user_id.clone()),
        (
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        ),
    ])
}

/// Selector matching the session's pod
pub fn pod_selector(spec: &LabSessionSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::APP.to_string(), labels::APP_VALUE.to_string()),
        (labels::SESSION_ID.to_string(), spec.session_id.clone()),
    ])
}

/// Label selector string for listing a session's children
pub fn session_selector(session_id: &str) -> String {
    format!("{}={},{}", labels::SESSION_ID, session_id, labels::CHILD_SELECTOR)
}

fn child_meta(
    name: &str,
    namespace: Option<String>,
    labels: &BTreeMap<String, String>,
    owner: &OwnerReference,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace,
        labels: Some(labels.clone()),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

fn build_service(
    session: &LabSession,
    plan: &SessionPlan,
    labels: &BTreeMap<String, String>,
    owner: &OwnerReference,
    namespace: Option<String>,
) -> Service {
    let config = &session.spec.config;
    let mut ports = Vec::new();
    if config.enable_vs_code {
        ports.push(tcp_port("vscode", VSCODE_PORT));
    }
    if config.enable_terminal {
        ports.push(tcp_port("terminal", TERMINAL_PORT));
    }
    if config.enable_ssh {
        ports.push(tcp_port("ssh", SSH_PORT));
    }

    let spec = ServiceSpec {
        type_: Some("ClusterIP".to_string()),
        selector: Some(pod_selector(&session.spec)),
        ports: Some(ports),
        ..Default::default()
    };

    let mut metadata = child_meta(&plan.names.service, namespace, labels, owner);
    metadata.annotations = Some(BTreeMap::from([(
        annotations::SPEC_HASH.to_string(),
        spec_hash(&spec),
    )]));

    Service {
        metadata,
        spec: Some(spec),
        ..Default::default()
    }
}

fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn build_secret(
    plan: &SessionPlan,
    labels: &BTreeMap<String, String>,
    owner: &OwnerReference,
    namespace: Option<String>,
    password: &str,
) -> Secret {
    Secret {
        metadata: child_meta(&plan.names.secret, namespace, labels, owner),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            PASSWORD_KEY.to_string(),
            ByteString(password.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Stable short hash of a serializable spec
pub fn spec_hash<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("{:08x}", network::fnv1a(&bytes))
}

/// Random alphanumeric IDE password
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Read the IDE password stored in an existing session secret
pub fn password_from_secret(secret: &Secret) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(PASSWORD_KEY))
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
        .filter(|password| !password.is_empty())
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends
fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Kubernetes label value (non-empty form)
fn is_label_value(s: &str) -> bool {
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    !s.is_empty()
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && edge_ok(s.chars().next())
        && edge_ok(s.chars().last())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::labsession::{SessionConfig, SessionResources};

    pub(crate) fn test_session(session_id: &str, user_id: &str) -> LabSession {
        let mut session = LabSession::new(
            &format!("session-{session_id}"),
            LabSessionSpec {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                rootfs_image_url: "https://example.com/dozlab-k8s.ext4".to_string(),
                rootfs_sha256: None,
                resources: SessionResources::default(),
                config: SessionConfig::default(),
                timeout: "30m".to_string(),
            },
        );
        session.metadata.namespace = Some("labs".to_string());
        session.metadata.uid = Some(format!("uid-{session_id}"));
        session
    }

    #[test]
    fn test_build_is_deterministic() {
        let session = test_session("abc123", "alice");
        let defaults = BuilderDefaults::default();

        let a = build(&session, &defaults, "pw").unwrap();
        let b = build(&session, &defaults, "pw").unwrap();

        assert_eq!(
            serde_json::to_string(&a.pod).unwrap(),
            serde_json::to_string(&b.pod).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&a.service).unwrap(),
            serde_json::to_string(&b.service).unwrap()
        );
        assert_eq!(a.secret, b.secret);
    }

    #[test]
    fn test_empty_user_id_is_rejected() {
        let session = test_session("abc123", "");
        let err = build(&session, &BuilderDefaults::default(), "pw").unwrap_err();
        assert_eq!(err, BuildError::MissingField("userId"));
        assert!(err.to_string().contains("userId"));
    }

    #[test]
    fn test_empty_session_id_and_rootfs_rejected() {
        let session = test_session("", "alice");
        assert_eq!(
            validate(&session.spec, &BuilderDefaults::default()).unwrap_err(),
            BuildError::MissingField("sessionId")
        );

        let mut session = test_session("abc", "alice");
        session.spec.rootfs_image_url.clear();
        assert_eq!(
            validate(&session.spec, &BuilderDefaults::default()).unwrap_err(),
            BuildError::MissingField("rootfsImageUrl")
        );
    }

    #[test]
    fn test_invalid_session_id() {
        let too_long = "a".repeat(41);
        let cases: [&str; 5] = ["Upper", "-lead", "trail-", "has_underscore", &too_long];
        for bad in cases {
            let session = test_session(bad, "alice");
            let err = validate(&session.spec, &BuilderDefaults::default()).unwrap_err();
            assert!(
                matches!(err, BuildError::InvalidField { field: "sessionId", .. }),
                "{bad}: {err:?}"
            );
        }
    }

    #[test]
    fn test_invalid_quantities() {
        let defaults = BuilderDefaults::default();

        let mut session = test_session("abc", "alice");
        session.spec.resources.memory = "lots".to_string();
        assert!(matches!(
            validate(&session.spec, &defaults).unwrap_err(),
            BuildError::InvalidField { field: "resources.memory", .. }
        ));

        let mut session = test_session("abc", "alice");
        session.spec.resources.cpu = "fast".to_string();
        assert!(matches!(
            validate(&session.spec, &defaults).unwrap_err(),
            BuildError::InvalidField { field: "resources.cpu", .. }
        ));

        let mut session = test_session("abc", "alice");
        session.spec.resources.memory = "256Mi".to_string();
        assert!(matches!(
            validate(&session.spec, &defaults).unwrap_err(),
            BuildError::InvalidField { field: "resources.memory", .. }
        ));
    }

    #[test]
    fn test_oversized_resources_are_invalid() {
        let defaults = BuilderDefaults::default();

        let mut session = test_session("abc", "alice");
        session.spec.resources.memory = "9999999Ti".to_string();
        assert!(matches!(
            build(&session, &defaults, "pw").unwrap_err(),
            BuildError::InvalidField { field: "resources.memory", .. }
        ));

        let mut session = test_session("abc", "alice");
        session.spec.resources.storage = "9999999Ti".to_string();
        assert!(matches!(
            build(&session, &defaults, "pw").unwrap_err(),
            BuildError::InvalidField { field: "resources.storage", .. }
        ));

        let mut session = test_session("abc", "alice");
        session.spec.resources.cpu = "99999999999999m".to_string();
        assert!(matches!(
            build(&session, &defaults, "pw").unwrap_err(),
            BuildError::InvalidField { field: "resources.cpu", .. }
        ));
    }

    #[test]
    fn test_invalid_timeout_and_url() {
        let defaults = BuilderDefaults::default();

        let mut session = test_session("abc", "alice");
        session.spec.timeout = "soon".to_string();
        assert!(matches!(
            validate(&session.spec, &defaults).unwrap_err(),
            BuildError::InvalidField { field: "timeout", .. }
        ));

        let mut session = test_session("abc", "alice");
        session.spec.rootfs_image_url = "ftp://example.com/rootfs".to_string();
        assert!(matches!(
            validate(&session.spec, &defaults).unwrap_err(),
            BuildError::InvalidField { field: "rootfsImageUrl", .. }
        ));

        let mut session = test_session("abc", "alice");
        session.spec.rootfs_sha256 = Some("not-a-digest".to_string());
        assert!(matches!(
            validate(&session.spec, &defaults).unwrap_err(),
            BuildError::InvalidField { field: "rootfsSha256", .. }
        ));
    }

    #[test]
    fn test_missing_uid_is_rejected() {
        let mut session = test_session("abc", "alice");
        session.metadata.uid = None;
        assert_eq!(
            build(&session, &BuilderDefaults::default(), "pw").unwrap_err(),
            BuildError::MissingField("metadata.uid")
        );
    }

    #[test]
    fn test_children_carry_labels_and_owner() {
        let session = test_session("abc123", "alice");
        let children = build(&session, &BuilderDefaults::default(), "pw").unwrap();

        for meta in [
            &children.pod.metadata,
            &children.service.metadata,
            &children.secret.metadata,
        ] {
            let labels = meta.labels.as_ref().unwrap();
            assert_eq!(labels.get("app").unwrap(), "lab-environment");
            assert_eq!(labels.get("session-id").unwrap(), "abc123");
            assert_eq!(labels.get("user-id").unwrap(), "alice");

            let owners = meta.owner_references.as_ref().unwrap();
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].uid, "uid-abc123");
            assert_eq!(owners[0].kind, "LabSession");
            assert_eq!(owners[0].controller, Some(true));
            assert_eq!(meta.namespace.as_deref(), Some("labs"));
        }

        assert_eq!(children.pod.metadata.name.as_deref(), Some("lab-session-abc123"));
        assert_eq!(
            children.service.metadata.name.as_deref(),
            Some("lab-service-abc123")
        );
        assert_eq!(
            children.secret.metadata.name.as_deref(),
            Some("lab-session-abc123-secrets")
        );
    }

    #[test]
    fn test_service_ports_follow_toggles() {
        let mut session = test_session("abc", "alice");
        let children = build(&session, &BuilderDefaults::default(), "pw").unwrap();
        let ports: Vec<i32> = children
            .service
            .spec
            .unwrap()
            .ports
            .unwrap()
            .iter()
            .map(|p| p.port)
            .collect();
        assert_eq!(ports, vec![8080, 8081, 22]);

        session.spec.config.enable_ssh = false;
        session.spec.config.enable_terminal = false;
        let children = build(&session, &BuilderDefaults::default(), "pw").unwrap();
        let ports: Vec<i32> = children
            .service
            .spec
            .unwrap()
            .ports
            .unwrap()
            .iter()
            .map(|p| p.port)
            .collect();
        assert_eq!(ports, vec![8080]);
    }

    #[test]
    fn test_secret_holds_password() {
        let session = test_session("abc", "alice");
        let children = build(&session, &BuilderDefaults::default(), "s3cret").unwrap();
        assert_eq!(password_from_secret(&children.secret).as_deref(), Some("s3cret"));
        assert_eq!(children.secret.type_.as_deref(), Some("Opaque"));
    }

    #[test]
    fn test_empty_password_rejected() {
        let session = test_session("abc", "alice");
        assert!(build(&session, &BuilderDefaults::default(), "").is_err());
    }

    #[test]
    fn test_generate_password() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_label_value_rules() {
        assert!(is_label_value("alice"));
        assert!(is_label_value("user.name_01"));
        assert!(!is_label_value("-alice"));
        assert!(!is_label_value("alice@example.com"));
        assert!(!is_label_value(&"a".repeat(64)));
    }

    #[test]
    fn test_session_selector() {
        assert_eq!(
            session_selector("abc"),
            "session-id=abc,app=lab-environment"
        );
    }
}
