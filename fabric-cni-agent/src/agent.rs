//! Agent bootstrap: bring up the bridge and its fixed ports, rebuild
//! the interface store from OVSDB, reconcile against the pod list, and
//! only then open the CNI socket.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cniserver::ipam::IpamRegistry;
use crate::cniserver::{self, CniServer};
use crate::config::{AgentArgs, GatewayConfig, NodeConfig, gateway_ip};
use crate::interface_store::InterfaceStore;
use crate::kubernetes::KubePodLister;
use crate::netdev::{NetDeviceClient, NetlinkClient};
use crate::openflow::OvsOfctlClient;
use crate::ovsdb::OvsdbConnection;
use crate::ovsdb::bridge::{OvsBridge, OvsBridgeClient};
use crate::{Error, Result};

// OpenFlow port numbers requested for the fixed bridge ports.
const TUNNEL_OFPORT_REQUEST: i32 = 1;
const GATEWAY_OFPORT_REQUEST: i32 = 2;

pub async fn start(args: AgentArgs, cancel: CancellationToken) -> Result<()> {
    let conn = OvsdbConnection::dial(&args.ovsdb_socket).await;
    let bridge: Arc<dyn OvsBridgeClient> = Arc::new(OvsBridge::new(conn, &args.bridge));
    bridge.create().await?;
    setup_bridge_ports(&args, bridge.as_ref()).await?;

    let netdev: Arc<dyn NetDeviceClient> = Arc::new(NetlinkClient::new()?);
    let gateway_link = netdev
        .host_link(&args.gateway_iface)
        .await?
        .ok_or_else(|| {
            Error::InvalidConfig(format!(
                "gateway interface {} missing after port creation",
                args.gateway_iface
            ))
        })?;
    let node_config = NodeConfig {
        name: args.node_name.clone(),
        pod_cidr: args.pod_cidr,
        gateway: GatewayConfig {
            name: args.gateway_iface.clone(),
            ip: gateway_ip(args.pod_cidr),
            mac: gateway_link.mac,
        },
        bridge: args.bridge.clone(),
        default_mtu: args.default_mtu,
    };

    info!("initializing the interface store from OVSDB");
    let store = Arc::new(InterfaceStore::new());
    store
        .initialize(
            bridge.as_ref(),
            args.uplink_iface.as_deref().unwrap_or(""),
            &args.gateway_iface,
        )
        .await?;
    info!("loaded {} container interface(s)", store.len());

    info!("loading the cluster config");
    let kube_client = kube::Client::try_default().await?;
    let pods = Arc::new(KubePodLister::new(kube_client, args.node_name.clone()));

    let of_client = Arc::new(OvsOfctlClient::new(&args.bridge));
    let ipam = Arc::new(IpamRegistry::with_defaults(&args.cni_bin_dir));

    let server = CniServer::new(
        node_config,
        args.host_proc_prefix.clone(),
        bridge,
        of_client,
        netdev,
        store,
        ipam,
        pods,
    );

    // Reconciliation must finish before the socket opens; a racing ADD
    // could otherwise be mistaken for an orphan.
    server.reconcile().await?;

    cniserver::serve(server, &args.cni_socket_path, cancel).await
}

async fn setup_bridge_ports(args: &AgentArgs, bridge: &dyn OvsBridgeClient) -> Result<()> {
    let existing = bridge.port_list().await?;
    if !existing.iter().any(|port| port.name == args.gateway_iface) {
        info!("creating gateway port {}", args.gateway_iface);
        bridge
            .create_internal_port(&args.gateway_iface, GATEWAY_OFPORT_REQUEST, &HashMap::new())
            .await?;
    }
    bridge
        .set_interface_mtu(&args.gateway_iface, args.default_mtu)
        .await?;
    if !existing.iter().any(|port| port.name == args.tunnel_iface) {
        info!(
            "creating {} tunnel port {}",
            args.tunnel_type.as_str(),
            args.tunnel_iface
        );
        bridge
            .create_tunnel_port(&args.tunnel_iface, args.tunnel_type, TUNNEL_OFPORT_REQUEST, None)
            .await?;
    }
    Ok(())
}
