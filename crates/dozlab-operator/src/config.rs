//! Operator configuration and builder defaults

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::builder::quantity;

/// Image and sizing defaults applied by the resource builder
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuilderDefaults {
    pub rootfs_init_image: String,
    pub network_init_image: String,
    pub vm_runtime_image: String,
    pub terminal_image: String,
    pub vscode_image: String,
    pub image_pull_policy: String,
    /// Hard ceiling on the VM runtime container CPU
    pub vm_cpu_limit: String,
    pub vm_cpu_request: String,
    pub vm_memory_request: String,
    /// Memory reserved for the VMM itself; the guest receives the remainder
    pub vm_memory_overhead: String,
    pub kernel_size_limit: String,
    /// Extra space on the vm-data volume beyond the requested disk size
    pub vm_data_headroom: String,
    pub vscode_data_size_limit: String,
    pub sidecar_cpu_limit: String,
    pub sidecar_memory_limit: String,
    pub kvm_device_path: String,
    pub tun_device_path: String,
    /// UID/GID the IDE container runs as
    pub vscode_uid: i64,
    pub docker_port: u16,
}

impl Default for BuilderDefaults {
    fn default() -> Self {
        Self {
            rootfs_init_image: "dozman99/dozlab-init:latest".to_string(),
            network_init_image: "busybox:1.36".to_string(),
            vm_runtime_image: "dozman99/dozlab-vm:latest".to_string(),
            terminal_image: "dozman99/dozlab-terminal:latest".to_string(),
            vscode_image: "codercom/code-server:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            vm_cpu_limit: "1500m".to_string(),
            vm_cpu_request: "500m".to_string(),
            vm_memory_request: "1Gi".to_string(),
            vm_memory_overhead: "256Mi".to_string(),
            kernel_size_limit: "2Gi".to_string(),
            vm_data_headroom: "1Gi".to_string(),
            vscode_data_size_limit: "1Gi".to_string(),
            sidecar_cpu_limit: "500m".to_string(),
            sidecar_memory_limit: "512Mi".to_string(),
            kvm_device_path: "/dev/kvm".to_string(),
            tun_device_path: "/dev/net/tun".to_string(),
            vscode_uid: 1000,
            docker_port: 2375,
        }
    }
}

impl BuilderDefaults {
    /// Load defaults from a YAML file; missing keys keep their default value
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read defaults file {}", path.display()))?;
        let defaults: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse defaults file {}", path.display()))?;
        defaults.validate()?;
        Ok(defaults)
    }

    /// Reject quantities the builder could never render
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("vmMemoryRequest", &self.vm_memory_request),
            ("vmMemoryOverhead", &self.vm_memory_overhead),
            ("kernelSizeLimit", &self.kernel_size_limit),
            ("vmDataHeadroom", &self.vm_data_headroom),
            ("vscodeDataSizeLimit", &self.vscode_data_size_limit),
            ("sidecarMemoryLimit", &self.sidecar_memory_limit),
        ] {
            quantity::parse_memory(value)
                .with_context(|| format!("Invalid memory quantity for {field}: {value}"))?;
        }
        for (field, value) in [
            ("vmCpuLimit", &self.vm_cpu_limit),
            ("vmCpuRequest", &self.vm_cpu_request),
            ("sidecarCpuLimit", &self.sidecar_cpu_limit),
        ] {
            quantity::parse_cpu(value)
                .with_context(|| format!("Invalid CPU quantity for {field}: {value}"))?;
        }
        ensure!(self.vscode_uid > 0, "vscodeUid must be a non-root UID");
        Ok(())
    }
}

/// Runtime configuration of the operator process
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Restrict watches to one namespace; `None` watches the whole cluster
    pub namespace: Option<String>,
    /// Maximum sessions reconciled concurrently
    pub workers: u16,
    /// Periodic fallback re-check for every session
    pub resync_interval: Duration,
    pub reaper_interval: Duration,
    /// Failed -> Creating recoveries allowed per session
    pub max_session_retries: u32,
    /// Consecutive transient API failures before a session is marked Failed
    pub max_transient_attempts: u32,
    /// Garbage collection passes before termination is reported as stuck
    pub gc_max_attempts: u32,
    pub gc_requeue_interval: Duration,
    pub stuck_requeue_interval: Duration,
    /// Restarts tolerated per container before the session is Failed
    pub container_restart_budget: i32,
    pub health_port: u16,
    pub defaults: BuilderDefaults,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 8,
            resync_interval: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(15),
            max_session_retries: 3,
            max_transient_attempts: 5,
            gc_max_attempts: 12,
            gc_requeue_interval: Duration::from_secs(5),
            stuck_requeue_interval: Duration::from_secs(300),
            container_restart_budget: 3,
            health_port: crate::health::DEFAULT_HEALTH_PORT,
            defaults: BuilderDefaults::default(),
        }
    }
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.workers > 0, "workers must be at least 1");
        ensure!(
            !self.resync_interval.is_zero(),
            "resync interval must be non-zero"
        );
        ensure!(
            !self.reaper_interval.is_zero(),
            "reaper interval must be non-zero"
        );
        ensure!(self.gc_max_attempts > 0, "gc max attempts must be at least 1");
        ensure!(
            self.container_restart_budget >= 0,
            "container restart budget cannot be negative"
        );
        self.defaults.validate()
    }
}

/// Labels placed on every child resource
pub mod labels {
    /// Fixed application label consumed by external tooling
    pub const APP: &str = "app";
    pub const APP_VALUE: &str = "lab-environment";
    pub const SESSION_ID: &str = "session-id";
    pub const USER_ID: &str = "user-id";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "dozlab-operator";
    /// Selector matching every child the operator owns
    pub const CHILD_SELECTOR: &str = "app=lab-environment";
}

/// Annotations used by the operator
pub mod annotations {
    /// Stable hash of the rendered child spec
    pub const SPEC_HASH: &str = "dozlab.io/spec-hash";
}

/// Finalizer guarding child cleanup
pub const FINALIZER: &str = "dozlab.io/session-cleanup";

/// Field manager / reporting component name
pub const CONTROLLER_NAME: &str = "dozlab-operator";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_partial_defaults() {
        let yaml = r#"
terminalImage: registry.local/terminal:v2
vmCpuLimit: "2"
vscodeDataSizeLimit: 2Gi
"#;
        let defaults: BuilderDefaults = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(defaults.terminal_image, "registry.local/terminal:v2");
        assert_eq!(defaults.vm_cpu_limit, "2");
        assert_eq!(defaults.vscode_data_size_limit, "2Gi");
        // Untouched keys keep their defaults
        assert_eq!(defaults.kernel_size_limit, "2Gi");
        assert_eq!(defaults.vm_memory_request, "1Gi");
        assert!(defaults.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_quantity() {
        let defaults = BuilderDefaults {
            kernel_size_limit: "two gigs".to_string(),
            ..Default::default()
        };
        let err = defaults.validate().unwrap_err();
        assert!(err.to_string().contains("kernelSizeLimit"));
    }

    #[test]
    fn test_validate_rejects_root_uid() {
        let defaults = BuilderDefaults {
            vscode_uid: 0,
            ..Default::default()
        };
        assert!(defaults.validate().is_err());
    }

    #[test]
    fn test_operator_config_validation() {
        assert!(OperatorConfig::default().validate().is_ok());

        let config = OperatorConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OperatorConfig {
            reaper_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let result = BuilderDefaults::from_file(Path::new("/nonexistent/defaults.yaml"));
        assert!(result.is_err());
    }
}
