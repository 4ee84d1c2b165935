//! Joins the veth, OVS and flow layers into the attach/detach/verify
//! steps used by the CNI handlers and the startup reconciler.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{debug, error};

use crate::interface_store::{InterfaceConfig, InterfaceStore, build_ovs_port_external_ids};
use crate::netdev::{NetDeviceClient, RouteSpec, generate_container_interface_name};
use crate::openflow::FlowClient;
use crate::ovsdb::OvsdbError;
use crate::ovsdb::bridge::OvsBridgeClient;

use super::types::{CniResult, ResultInterface};

/// A failed interface operation, split by whether a retry can help; the
/// RPC boundary maps this onto TRY_AGAIN_LATER vs the hard failure
/// codes.
#[derive(Debug)]
pub(super) enum InterfaceFailure {
    Transient(String),
    Permanent(String),
}

impl std::fmt::Display for InterfaceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceFailure::Transient(msg) | InterfaceFailure::Permanent(msg) => f.write_str(msg),
        }
    }
}

impl From<OvsdbError> for InterfaceFailure {
    fn from(err: OvsdbError) -> Self {
        if err.is_transient() {
            InterfaceFailure::Transient(err.to_string())
        } else {
            InterfaceFailure::Permanent(err.to_string())
        }
    }
}

impl From<crate::netdev::InterfaceError> for InterfaceFailure {
    fn from(err: crate::netdev::InterfaceError) -> Self {
        InterfaceFailure::Permanent(err.to_string())
    }
}

pub(super) fn mac_string(mac: macaddr::MacAddr6) -> String {
    mac.to_string().to_ascii_lowercase()
}

/// The attach sequence: veth into the pod, OVS port with the pod
/// identity pinned to it, store record, datapath flows. The caller owns
/// rollback; any error here leaves the already-created pieces for DEL
/// semantics to sweep up.
#[allow(clippy::too_many_arguments)]
pub(super) async fn configure_interfaces(
    ovs: &dyn OvsBridgeClient,
    of_client: &dyn FlowClient,
    netdev: &dyn NetDeviceClient,
    store: &InterfaceStore,
    gateway_mac: macaddr::MacAddr6,
    pod_name: &str,
    pod_namespace: &str,
    container_id: &str,
    netns: &str,
    ifname: &str,
    mtu: u32,
    result: &mut CniResult,
) -> Result<(), InterfaceFailure> {
    let host_ifname = generate_container_interface_name(pod_name, pod_namespace);
    let addresses: Vec<IpNetwork> = result.ips.iter().map(|ip| ip.address).collect();
    let routes: Vec<RouteSpec> = result
        .routes
        .iter()
        .map(|route| RouteSpec {
            destination: route.dst,
            gateway: route.gw,
        })
        .collect();
    let container_ip: IpAddr = addresses
        .first()
        .map(|network| network.ip())
        .ok_or_else(|| InterfaceFailure::Permanent("IPAM returned no addresses".to_owned()))?;

    let pair = netdev
        .setup_veth(netns, ifname, &host_ifname, mtu, &addresses, &routes)
        .await?;
    result.interfaces = vec![
        ResultInterface {
            name: host_ifname.clone(),
            mac: mac_string(pair.host_mac),
            sandbox: None,
        },
        ResultInterface {
            name: ifname.to_owned(),
            mac: mac_string(pair.container_mac),
            sandbox: Some(netns.to_owned()),
        },
    ];

    let mut config = InterfaceConfig::new(
        container_id,
        pod_name,
        pod_namespace,
        netns,
        pair.container_mac,
        container_ip,
    );
    let external_ids = build_ovs_port_external_ids(&config);
    config.port_uuid = ovs
        .create_port(&host_ifname, &host_ifname, &external_ids)
        .await?;
    // The record goes in as soon as the port insert returns: rollback
    // keys OVS cleanup on the stored port UUID, so a failure from here
    // on must still find it.
    store.add_interface(config.clone());
    // 0 means OVS has not materialized the number yet; the reconciler
    // or a later CHECK picks the real value up from OVSDB.
    config.ofport = ovs.ofport(&host_ifname).await?;
    let ofport = config.ofport;
    store.add_interface(config);

    of_client
        .install_pod_flows(
            &host_ifname,
            container_ip,
            pair.container_mac,
            gateway_mac,
            ofport as u32,
        )
        .await
        .map_err(|e| InterfaceFailure::Permanent(e.to_string()))?;
    Ok(())
}

/// The detach sequence. Every step runs even when an earlier one fails;
/// the first error is returned and the store record is kept on failure
/// so a retry (or the reconciler) still finds the port.
pub(super) async fn remove_interfaces(
    ovs: &dyn OvsBridgeClient,
    of_client: &dyn FlowClient,
    netdev: &dyn NetDeviceClient,
    store: &InterfaceStore,
    pod_name: &str,
    pod_namespace: &str,
    container_id: &str,
) -> Result<(), InterfaceFailure> {
    let Some(config) = store.get_container_interface(pod_name, pod_namespace) else {
        // A partially attached container has no record yet (it is only
        // written after the OVS port insert); the deterministic name
        // still finds a leftover veth.
        let host_ifname = generate_container_interface_name(pod_name, pod_namespace);
        debug!(
            "no stored interface for {pod_namespace}/{pod_name}, removing {host_ifname} if present"
        );
        netdev.delete_host_link(&host_ifname).await?;
        return Ok(());
    };

    if config.container_id != container_id {
        debug!(
            "stored interface for {pod_namespace}/{pod_name} belongs to container {}, requested {container_id}",
            config.container_id
        );
    }

    let mut first_error: Option<InterfaceFailure> = None;
    if let Err(e) = of_client.uninstall_pod_flows(&config.iface_name).await {
        error!("failed to uninstall flows for {}: {e}", config.iface_name);
        first_error.get_or_insert(InterfaceFailure::Permanent(e.to_string()));
    }
    if let Err(e) = ovs.delete_port(&config.port_uuid).await {
        error!("failed to delete OVS port {}: {e}", config.port_uuid);
        first_error.get_or_insert(e.into());
    }
    if let Err(e) = netdev.delete_host_link(&config.iface_name).await {
        error!("failed to delete host link {}: {e}", config.iface_name);
        first_error.get_or_insert(e.into());
    }
    match first_error {
        None => {
            store.delete_interface(&config.iface_name);
            Ok(())
        }
        Some(e) => Err(e),
    }
}

/// CHECK: the prevResult claims are compared against the store record
/// and the live links, by name and MAC.
pub(super) async fn check_interfaces(
    netdev: &dyn NetDeviceClient,
    store: &InterfaceStore,
    container_id: &str,
    netns: &str,
    container_intf: &ResultInterface,
    host_intf: &ResultInterface,
) -> Result<(), String> {
    let Some(config) = store.get_interface_by_container_id(container_id) else {
        return Err(format!("container {container_id} has no stored interface"));
    };
    if config.iface_name != host_intf.name {
        return Err(format!(
            "host interface name {} does not match the stored {}",
            host_intf.name, config.iface_name
        ));
    }
    if mac_string(config.mac) != container_intf.mac.to_ascii_lowercase() {
        return Err(format!(
            "container MAC {} does not match the stored {}",
            container_intf.mac, config.mac
        ));
    }

    let link = netdev
        .container_link(netns, &container_intf.name)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| {
            format!(
                "container interface {} not found in {netns}",
                container_intf.name
            )
        })?;
    if mac_string(link.mac) != container_intf.mac.to_ascii_lowercase() {
        return Err(format!(
            "container interface {} has MAC {}, prevResult claims {}",
            container_intf.name, link.mac, container_intf.mac
        ));
    }

    let host_link = netdev
        .host_link(&host_intf.name)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("host interface {} not found", host_intf.name))?;
    if mac_string(host_link.mac) != host_intf.mac.to_ascii_lowercase() {
        return Err(format!(
            "host interface {} has MAC {}, prevResult claims {}",
            host_intf.name, host_link.mac, host_intf.mac
        ));
    }
    Ok(())
}
