//! Pod rendering for a lab session
//!
//! Layout:
//! - init `rootfs-prep`: download, verify and grow the guest root filesystem
//! - init `network-config`: create the tap device and publish `network.env`
//! - `vm`: microVM runtime (guest with sshd and dockerd)
//! - `terminal`, `vscode`: optional sidecars talking to the guest over the tap link

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, HostPathVolumeSource, Pod, PodSecurityContext, PodSpec, Probe,
    ResourceRequirements, SecretKeySelector, SecurityContext, TCPSocketAction, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::network::{NetworkPlan, NETMASK, TAP_DEVICE};
use super::quantity;
use super::{spec_hash, BuildError, SessionPlan, PASSWORD_KEY, SSH_PORT, TERMINAL_PORT, VSCODE_PORT};
use crate::config::{annotations, BuilderDefaults};
use crate::labsession::LabSession;

pub const ROOTFS_PREP: &str = "rootfs-prep";
pub const NETWORK_CONFIG: &str = "network-config";
pub const VM: &str = "vm";
pub const TERMINAL: &str = "terminal";
pub const VSCODE: &str = "vscode";

const VM_DATA_DIR: &str = "/vm-data";
const KERNEL_DIR: &str = "/kernel";
const NETWORK_DIR: &str = "/run/dozlab";
const VSCODE_HOME: &str = "/home/coder";

const ROOTFS_SCRIPT: &str = r#"set -eu
if [ -f "$ROOTFS_PATH" ]; then
  echo "rootfs already prepared"
  exit 0
fi
curl -fSL --retry 3 -o "$ROOTFS_PATH.partial" "$ROOTFS_IMAGE_URL"
if [ -n "${ROOTFS_SHA256:-}" ]; then
  echo "$ROOTFS_SHA256  $ROOTFS_PATH.partial" | sha256sum -c -
fi
e2fsck -fy "$ROOTFS_PATH.partial" || [ $? -le 1 ]
resize2fs "$ROOTFS_PATH.partial" "$DISK_SIZE"
cp /opt/dozlab/vmlinux "$KERNEL_PATH"
mv "$ROOTFS_PATH.partial" "$ROOTFS_PATH"
"#;

const NETWORK_SCRIPT: &str = r#"set -eu
ip tuntap add dev "$TAP_DEVICE" mode tap 2>/dev/null || true
ip addr replace "$GATEWAY_IP/30" dev "$TAP_DEVICE"
ip link set "$TAP_DEVICE" up
printf '%s' "$NETWORK_ENV" > "$NETWORK_ENV_PATH"
"#;

pub(super) fn build_pod(
    session: &LabSession,
    plan: &SessionPlan,
    defaults: &BuilderDefaults,
    labels: &BTreeMap<String, String>,
    owner: &OwnerReference,
) -> Result<Pod, BuildError> {
    let config = &session.spec.config;
    let net = &plan.network;

    let mut containers = vec![vm_container(session, plan, defaults)?];
    if config.enable_terminal {
        containers.push(terminal_container(session, net, defaults));
    }
    if config.enable_vs_code {
        containers.push(vscode_container(plan, net, defaults));
    }

    let spec = PodSpec {
        init_containers: Some(vec![
            rootfs_container(session, plan, defaults),
            network_container(net, defaults),
        ]),
        containers,
        volumes: Some(volumes(plan, defaults, config.enable_vs_code)?),
        restart_policy: Some("Always".to_string()),
        automount_service_account_token: Some(false),
        enable_service_links: Some(false),
        termination_grace_period_seconds: Some(30),
        security_context: Some(PodSecurityContext {
            fs_group: Some(defaults.vscode_uid),
            ..Default::default()
        }),
        ..Default::default()
    };

    let metadata = ObjectMeta {
        name: Some(plan.names.pod.clone()),
        namespace: session.metadata.namespace.clone(),
        labels: Some(labels.clone()),
        annotations: Some(BTreeMap::from([(
            annotations::SPEC_HASH.to_string(),
            spec_hash(&spec),
        )])),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    };

    Ok(Pod {
        metadata,
        spec: Some(spec),
        ..Default::default()
    })
}

fn rootfs_container(session: &LabSession, plan: &SessionPlan, defaults: &BuilderDefaults) -> Container {
    let mut vars = vec![
        env("ROOTFS_IMAGE_URL", &session.spec.rootfs_image_url),
        env("ROOTFS_PATH", &format!("{VM_DATA_DIR}/rootfs.ext4")),
        env("KERNEL_PATH", &format!("{KERNEL_DIR}/vmlinux")),
        env("DISK_SIZE", &format!("{}M", quantity::to_mebibytes(plan.storage_bytes))),
    ];
    if let Some(sha) = &session.spec.rootfs_sha256 {
        vars.push(env("ROOTFS_SHA256", sha));
    }

    Container {
        name: ROOTFS_PREP.to_string(),
        image: Some(defaults.rootfs_init_image.clone()),
        image_pull_policy: Some(defaults.image_pull_policy.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), ROOTFS_SCRIPT.to_string()]),
        env: Some(vars),
        volume_mounts: Some(vec![
            mount("vm-data", VM_DATA_DIR, false),
            mount("kernel", KERNEL_DIR, false),
        ]),
        resources: Some(limits(&defaults.sidecar_cpu_limit, &defaults.sidecar_memory_limit)),
        security_context: Some(restricted(&[])),
        ..Default::default()
    }
}

fn network_container(net: &NetworkPlan, defaults: &BuilderDefaults) -> Container {
    Container {
        name: NETWORK_CONFIG.to_string(),
        image: Some(defaults.network_init_image.clone()),
        image_pull_policy: Some(defaults.image_pull_policy.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), NETWORK_SCRIPT.to_string()]),
        env: Some(vec![
            env("TAP_DEVICE", TAP_DEVICE),
            env("GATEWAY_IP", &net.gateway_ip.to_string()),
            env("NETWORK_ENV", &net.env_file()),
            env("NETWORK_ENV_PATH", &format!("{NETWORK_DIR}/network.env")),
        ]),
        volume_mounts: Some(vec![
            mount("network", NETWORK_DIR, false),
            mount("dev-tun", &defaults.tun_device_path, false),
        ]),
        resources: Some(limits(&defaults.sidecar_cpu_limit, &defaults.sidecar_memory_limit)),
        security_context: Some(restricted(&["NET_ADMIN", "NET_RAW"])),
        ..Default::default()
    }
}

fn vm_container(
    session: &LabSession,
    plan: &SessionPlan,
    defaults: &BuilderDefaults,
) -> Result<Container, BuildError> {
    let invalid = |field: &'static str| {
        move |e: quantity::QuantityError| BuildError::InvalidField {
            field,
            reason: e.to_string(),
        }
    };
    let overhead = quantity::parse_memory(&defaults.vm_memory_overhead).map_err(invalid("vmMemoryOverhead"))?;
    let cpu_ceiling = quantity::parse_cpu(&defaults.vm_cpu_limit).map_err(invalid("vmCpuLimit"))?;
    let cpu_request = quantity::parse_cpu(&defaults.vm_cpu_request).map_err(invalid("vmCpuRequest"))?;
    let memory_request = quantity::parse_memory(&defaults.vm_memory_request).map_err(invalid("vmMemoryRequest"))?;

    // The container limit covers the guest plus VMM; requests never exceed limits
    let cpu_limit = plan.cpu_millicores.max(cpu_ceiling);
    let guest_memory = plan.memory_bytes - overhead;

    let resources = ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(quantity::format_millicores(cpu_limit))),
            ("memory".to_string(), Quantity(quantity::format_mebibytes(plan.memory_bytes))),
        ])),
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(quantity::format_millicores(cpu_request.min(cpu_limit)))),
            (
                "memory".to_string(),
                Quantity(quantity::format_mebibytes(memory_request.min(plan.memory_bytes))),
            ),
        ])),
        ..Default::default()
    };

    Ok(Container {
        name: VM.to_string(),
        image: Some(defaults.vm_runtime_image.clone()),
        image_pull_policy: Some(defaults.image_pull_policy.clone()),
        env: Some(vec![
            env("VM_CPU", &quantity::to_vcpus(plan.cpu_millicores).to_string()),
            env("VM_MEMORY", &quantity::to_mebibytes(guest_memory).to_string()),
            env("ROOTFS_PATH", &format!("{VM_DATA_DIR}/rootfs.ext4")),
            env("KERNEL_PATH", &format!("{KERNEL_DIR}/vmlinux")),
            env("NETWORK_ENV_PATH", &format!("{NETWORK_DIR}/network.env")),
            env("VM_IP", &plan.network.vm_ip.to_string()),
            env("VM_NETMASK", NETMASK),
            env("SSH_ENABLED", &session.spec.config.enable_ssh.to_string()),
        ]),
        ports: Some(vec![port("ssh", SSH_PORT)]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(SSH_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        resources: Some(resources),
        volume_mounts: Some(vec![
            mount("vm-data", VM_DATA_DIR, false),
            mount("kernel", KERNEL_DIR, true),
            mount("network", NETWORK_DIR, true),
            mount("dev-kvm", &defaults.kvm_device_path, false),
            mount("dev-tun", &defaults.tun_device_path, false),
        ]),
        security_context: Some(restricted(&["NET_ADMIN", "NET_RAW"])),
        ..Default::default()
    })
}

fn terminal_container(session: &LabSession, net: &NetworkPlan, defaults: &BuilderDefaults) -> Container {
    Container {
        name: TERMINAL.to_string(),
        image: Some(defaults.terminal_image.clone()),
        image_pull_policy: Some(defaults.image_pull_policy.clone()),
        env: Some(vec![
            env("SESSION_ID", &session.spec.session_id),
            env("SSH_HOST", &net.vm_ip.to_string()),
            env("SSH_PORT", &SSH_PORT.to_string()),
            env("DOCKER_HOST", &docker_host(net, defaults)),
        ]),
        ports: Some(vec![port("terminal", TERMINAL_PORT)]),
        readiness_probe: Some(http_probe("/", TERMINAL_PORT)),
        resources: Some(limits(&defaults.sidecar_cpu_limit, &defaults.sidecar_memory_limit)),
        security_context: Some(restricted(&[])),
        ..Default::default()
    }
}

fn vscode_container(plan: &SessionPlan, net: &NetworkPlan, defaults: &BuilderDefaults) -> Container {
    let password = EnvVar {
        name: "PASSWORD".to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: plan.names.secret.clone(),
                key: PASSWORD_KEY.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut security = restricted(&[]);
    security.run_as_user = Some(defaults.vscode_uid);
    security.run_as_group = Some(defaults.vscode_uid);
    security.run_as_non_root = Some(true);

    Container {
        name: VSCODE.to_string(),
        image: Some(defaults.vscode_image.clone()),
        image_pull_policy: Some(defaults.image_pull_policy.clone()),
        args: Some(vec![
            "--bind-addr".to_string(),
            format!("0.0.0.0:{VSCODE_PORT}"),
            "--auth".to_string(),
            "password".to_string(),
            format!("{VSCODE_HOME}/workspace"),
        ]),
        env: Some(vec![
            password,
            env("DOCKER_HOST", &docker_host(net, defaults)),
            env("SSH_HOST", &net.vm_ip.to_string()),
        ]),
        ports: Some(vec![port("vscode", VSCODE_PORT)]),
        readiness_probe: Some(http_probe("/healthz", VSCODE_PORT)),
        resources: Some(limits(&defaults.sidecar_cpu_limit, &defaults.sidecar_memory_limit)),
        volume_mounts: Some(vec![mount("vscode-data", VSCODE_HOME, false)]),
        security_context: Some(security),
        ..Default::default()
    }
}

fn volumes(
    plan: &SessionPlan,
    defaults: &BuilderDefaults,
    with_vscode: bool,
) -> Result<Vec<Volume>, BuildError> {
    let headroom = quantity::parse_memory(&defaults.vm_data_headroom).map_err(|e| {
        BuildError::InvalidField {
            field: "vmDataHeadroom",
            reason: e.to_string(),
        }
    })?;

    let mut volumes = vec![
        empty_dir("kernel", None, &defaults.kernel_size_limit),
        empty_dir(
            "vm-data",
            None,
            &quantity::format_mebibytes(plan.storage_bytes.saturating_add(headroom)),
        ),
        empty_dir("network", Some("Memory"), "1Mi"),
        char_device("dev-kvm", &defaults.kvm_device_path),
        char_device("dev-tun", &defaults.tun_device_path),
    ];
    if with_vscode {
        volumes.push(empty_dir("vscode-data", None, &defaults.vscode_data_size_limit));
    }
    Ok(volumes)
}

fn empty_dir(name: &str, medium: Option<&str>, size_limit: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: medium.map(str::to_string),
            size_limit: Some(Quantity(size_limit.to_string())),
        }),
        ..Default::default()
    }
}

fn char_device(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("CharDevice".to_string()),
        }),
        ..Default::default()
    }
}

/// Drop every capability, then add back only `add`
fn restricted(add: &[&str]) -> SecurityContext {
    SecurityContext {
        privileged: Some(false),
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            add: (!add.is_empty()).then(|| add.iter().map(|c| c.to_string()).collect()),
        }),
        ..Default::default()
    }
}

fn limits(cpu: &str, memory: &str) -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn docker_host(net: &NetworkPlan, defaults: &BuilderDefaults) -> String {
    format!("tcp://{}:{}", net.vm_ip, defaults.docker_port)
}

fn port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}
