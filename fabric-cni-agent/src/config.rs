use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;
use ipnetwork::Ipv4Network;
use macaddr::MacAddr6;

use crate::ovsdb::DEFAULT_OVSDB_SOCKET;
use crate::ovsdb::bridge::TunnelType;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct AgentArgs {
    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// IPv4 subnet this node allocates pod addresses from
    #[arg(long, env = "POD_CIDR")]
    pub pod_cidr: Ipv4Network,

    /// Integration bridge name
    #[arg(long, default_value = "br-int")]
    pub bridge: String,

    /// OVSDB Unix socket path
    #[arg(long, default_value = DEFAULT_OVSDB_SOCKET)]
    pub ovsdb_socket: PathBuf,

    /// CNI server socket path
    #[arg(
        long,
        env = "CNI_SOCKET_PATH",
        default_value = "/var/run/fabric/cni.sock"
    )]
    pub cni_socket_path: PathBuf,

    /// Directory holding the CNI executables (IPAM plugins included)
    #[arg(long, env = "CNI_BIN_DIR", default_value = "/opt/cni/bin")]
    pub cni_bin_dir: PathBuf,

    /// Name of the gateway port created on the bridge
    #[arg(long, default_value = "gw0")]
    pub gateway_iface: String,

    /// Name of the tunnel port created on the bridge
    #[arg(long, default_value = "tun0")]
    pub tunnel_iface: String,

    /// Tunnel encapsulation, vxlan or geneve
    #[arg(long, default_value = "vxlan")]
    pub tunnel_type: TunnelType,

    /// Node uplink interface, when one is attached to the bridge
    #[arg(long)]
    pub uplink_iface: Option<String>,

    /// Default MTU for pod interfaces
    #[arg(long, default_value_t = 1450)]
    pub default_mtu: u32,

    /// Prefix prepended to netns paths when the agent runs inside a
    /// container with the host /proc mounted elsewhere
    #[arg(long, env = "HOST_PROC_PREFIX", default_value = "")]
    pub host_proc_prefix: String,
}

/// Node facts the CNI handlers read but never mutate.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub pod_cidr: Ipv4Network,
    pub gateway: GatewayConfig,
    pub bridge: String,
    pub default_mtu: u32,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub name: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddr6,
}

/// The node gateway sits on the first host address of the pod subnet.
pub fn gateway_ip(pod_cidr: Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(pod_cidr.network()) + 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_gateway_ip_is_first_host() {
        let cidr: Ipv4Network = "10.1.2.0/24".parse().unwrap();
        assert_eq!(gateway_ip(cidr), Ipv4Addr::new(10, 1, 2, 1));

        let wide: Ipv4Network = "192.168.0.0/16".parse().unwrap();
        assert_eq!(gateway_ip(wide), Ipv4Addr::new(192, 168, 0, 1));
    }
}
