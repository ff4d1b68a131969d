//! Per-session guest network addressing
//!
//! Each session gets a point-to-point /30 inside 172.16.0.0/16 between the
//! tap device in the pod (gateway) and the microVM. The subnet is chosen from a
//! stable hash of the session id so the same session always renders the same
//! addresses, independent of process restarts.

use std::net::Ipv4Addr;

/// Tap device created by the network-config stage
pub const TAP_DEVICE: &str = "tap0";

/// Netmask of the point-to-point link
pub const NETMASK: &str = "255.255.255.252";

/// Number of /30 blocks in 172.16.0.0/16
const BLOCKS: u32 = 1 << 14;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkPlan {
    pub offset: u32,
    pub gateway_ip: Ipv4Addr,
    pub vm_ip: Ipv4Addr,
}

impl NetworkPlan {
    pub fn for_session(session_id: &str) -> Self {
        let offset = fnv1a(session_id.as_bytes()) % BLOCKS;
        let base = u32::from(Ipv4Addr::new(172, 16, 0, 0)) + offset * 4;

        Self {
            offset,
            gateway_ip: Ipv4Addr::from(base + 1),
            vm_ip: Ipv4Addr::from(base + 2),
        }
    }

    /// Contents of the shared `network.env` file
    pub fn env_file(&self) -> String {
        format!(
            "TAP_DEVICE={TAP_DEVICE}\nGATEWAY_IP={}\nVM_IP={}\nNETMASK={NETMASK}\n",
            self.gateway_ip, self.vm_ip
        )
    }
}

/// 32-bit FNV-1a
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
