//! The CNI request server: ADD/DEL/CHECK over a gRPC Unix socket, plus
//! the startup reconciliation that runs before the socket opens.

pub mod arbitrator;
pub mod ipam;
mod pod_configuration;
pub mod types;

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use fabric_cni_api::cni::v1::cni_server::{Cni as CniApi, CniServer as CniServiceServer};
use fabric_cni_api::cni::v1::{CniCmdArgs, CniCmdRequest, CniCmdResponse, ErrorCode};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::interface_store::InterfaceStore;
use crate::kubernetes::PodLister;
use crate::netdev::{NetDeviceClient, generate_container_interface_name};
use crate::openflow::FlowClient;
use crate::ovsdb::bridge::OvsBridgeClient;
use crate::{Error, Result};

use arbitrator::ContainerArbitrator;
use ipam::{IpamError, IpamRegistry};
use pod_configuration::{
    InterfaceFailure, check_interfaces, configure_interfaces, remove_interfaces,
};
use types::{
    CniConfig, CniResult, ResultInterface, SUPPORTED_CNI_VERSIONS, parse_k8s_args,
    update_result_iface_config,
};

#[derive(Clone)]
pub struct CniServer {
    node_config: NodeConfig,
    host_proc_prefix: String,
    ovs: Arc<dyn OvsBridgeClient>,
    of_client: Arc<dyn FlowClient>,
    netdev: Arc<dyn NetDeviceClient>,
    store: Arc<InterfaceStore>,
    ipam: Arc<IpamRegistry>,
    pods: Arc<dyn PodLister>,
    containers: Arc<ContainerArbitrator>,
}

/// A handler failure on the way to a typed response.
enum Failure {
    Ipam(IpamError),
    Transient(String),
    ConfigInterface(String),
}

impl From<InterfaceFailure> for Failure {
    fn from(failure: InterfaceFailure) -> Self {
        match failure {
            InterfaceFailure::Transient(msg) => Failure::Transient(msg),
            InterfaceFailure::Permanent(msg) => Failure::ConfigInterface(msg),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Ipam(e) => write!(f, "IPAM failure: {e}"),
            Failure::Transient(msg) | Failure::ConfigInterface(msg) => f.write_str(msg),
        }
    }
}

fn error_response(code: ErrorCode, message: impl Into<String>) -> CniCmdResponse {
    CniCmdResponse {
        cni_result: Vec::new(),
        error: Some(fabric_cni_api::cni::v1::Error {
            code: code as i32,
            message: message.into(),
        }),
    }
}

fn success_response(cni_result: Vec<u8>) -> CniCmdResponse {
    CniCmdResponse {
        cni_result,
        error: None,
    }
}

fn decoding_failure_response(what: &str) -> CniCmdResponse {
    error_response(
        ErrorCode::DecodingFailure,
        format!("failed to decode {what}"),
    )
}

fn incompatible_cni_version_response(version: &str) -> CniCmdResponse {
    error_response(
        ErrorCode::IncompatibleCniVersion,
        format!(
            "unsupported CNI version [{version}], supported versions {SUPPORTED_CNI_VERSIONS:?}"
        ),
    )
}

fn unsupported_field_response(key: &str, value: &str) -> CniCmdResponse {
    error_response(
        ErrorCode::UnsupportedField,
        format!("network configuration does not support key {key} with value {value}"),
    )
}

fn invalid_network_config_response(message: impl Into<String>) -> CniCmdResponse {
    error_response(ErrorCode::InvalidNetworkConfig, message)
}

fn cni_version_at_least(version: &str, major: u64, minor: u64) -> bool {
    semver::Version::parse(version)
        .map(|v| v >= semver::Version::new(major, minor, 0))
        .unwrap_or(false)
}

impl CniServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_config: NodeConfig,
        host_proc_prefix: impl Into<String>,
        ovs: Arc<dyn OvsBridgeClient>,
        of_client: Arc<dyn FlowClient>,
        netdev: Arc<dyn NetDeviceClient>,
        store: Arc<InterfaceStore>,
        ipam: Arc<IpamRegistry>,
        pods: Arc<dyn PodLister>,
    ) -> Self {
        Self {
            node_config,
            host_proc_prefix: host_proc_prefix.into(),
            ovs,
            of_client,
            netdev,
            store,
            ipam,
            pods,
            containers: Arc::new(ContainerArbitrator::new()),
        }
    }

    /// When the agent runs in a container the host /proc is mounted
    /// under a prefix; netns paths from the runtime need it prepended.
    fn host_netns_path(&self, netns: &str) -> String {
        if netns.is_empty() {
            return String::new();
        }
        format!("{}{netns}", self.host_proc_prefix)
    }

    /// Parses and validates a request. User and configuration errors
    /// surface here, before any lock is taken or state touched.
    fn check_request(&self, args: &CniCmdArgs) -> Result<CniConfig, Box<CniCmdResponse>> {
        let mut network: types::NetworkConfig =
            match serde_json::from_slice(&args.network_configuration) {
                Ok(config) => config,
                Err(e) => {
                    error!("failed to parse network configuration: {e}");
                    return Err(Box::new(decoding_failure_response("network config")));
                }
            };
        let k8s = match parse_k8s_args(&args.args) {
            Ok(k8s) => k8s,
            Err(e) => {
                error!("failed to parse CNI args: {e}");
                return Err(Box::new(decoding_failure_response("CNI args")));
            }
        };

        if !SUPPORTED_CNI_VERSIONS.contains(&network.cni_version.as_str()) {
            error!("unsupported CNI version [{}]", network.cni_version);
            return Err(Box::new(incompatible_cni_version_response(
                &network.cni_version,
            )));
        }
        if !self.ipam.is_valid(&network.ipam.r#type) {
            error!("unsupported IPAM type {}", network.ipam.r#type);
            return Err(Box::new(unsupported_field_response(
                "ipam/type",
                &network.ipam.r#type,
            )));
        }

        // The caller's subnet is irrelevant on this node: IPAM always
        // draws from the node's pod CIDR behind its gateway.
        network.ipam.subnet = Some(self.node_config.pod_cidr.to_string());
        network.ipam.gateway = Some(self.node_config.gateway.ip.to_string());
        if network.mtu == 0 {
            network.mtu = self.node_config.default_mtu;
        }
        let network_configuration = match serde_json::to_vec(&network) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to re-encode network configuration: {e}");
                return Err(Box::new(decoding_failure_response("network config")));
            }
        };
        debug!(
            "loaded network configuration for container {}: {}",
            args.container_id,
            String::from_utf8_lossy(&network_configuration)
        );

        Ok(CniConfig {
            container_id: args.container_id.clone(),
            ifname: args.ifname.clone(),
            netns: self.host_netns_path(&args.netns),
            args: args.args.clone(),
            k8s,
            network,
            network_configuration,
        })
    }

    fn failure_response(&self, failure: Failure) -> CniCmdResponse {
        match failure {
            Failure::Ipam(e) => error_response(ErrorCode::IpamFailure, e.to_string()),
            Failure::Transient(msg) => error_response(ErrorCode::TryAgainLater, msg),
            Failure::ConfigInterface(msg) => {
                error_response(ErrorCode::ConfigInterfaceFailure, msg)
            }
        }
    }

    async fn add(&self, args: &CniCmdArgs) -> CniCmdResponse {
        let config = match self.check_request(args) {
            Ok(config) => config,
            Err(response) => return *response,
        };
        info!(
            "received ADD for container {} (pod {}/{})",
            config.container_id, config.k8s.pod_namespace, config.k8s.pod_name
        );

        let outcome = {
            let _guard = self.containers.lock(&config.container_id).await;
            self.add_locked(&config).await
        };
        match outcome {
            Ok(response) => {
                info!("ADD for container {} succeeded", config.container_id);
                response
            }
            Err(failure) => {
                warn!(
                    "ADD for container {} failed ({failure}), rolling back",
                    config.container_id
                );
                self.rollback(&config).await;
                self.failure_response(failure)
            }
        }
    }

    async fn add_locked(&self, config: &CniConfig) -> Result<CniCmdResponse, Failure> {
        let driver = self
            .ipam
            .driver(&config.network.ipam.r#type)
            .ok_or_else(|| Failure::Ipam(IpamError("IPAM driver disappeared".to_owned())))?;
        let ipam_result = driver.add(config).await.map_err(Failure::Ipam)?;
        debug!(
            "IPAM assigned {} address(es) to container {}",
            ipam_result.ips.len(),
            config.container_id
        );

        let mut result = CniResult {
            cni_version: config.network.cni_version.clone(),
            interfaces: Vec::new(),
            ips: ipam_result.ips,
            routes: ipam_result.routes,
            dns: config.network.dns.clone(),
        };
        update_result_iface_config(&mut result, self.node_config.gateway.ip);

        configure_interfaces(
            self.ovs.as_ref(),
            self.of_client.as_ref(),
            self.netdev.as_ref(),
            &self.store,
            self.node_config.gateway.mac,
            &config.k8s.pod_name,
            &config.k8s.pod_namespace,
            &config.container_id,
            &config.netns,
            &config.ifname,
            config.network.mtu,
            &mut result,
        )
        .await?;

        let bytes = serde_json::to_vec(&result)
            .map_err(|e| Failure::ConfigInterface(format!("failed to encode CNI result: {e}")))?;
        Ok(success_response(bytes))
    }

    /// A failed ADD must leave nothing behind: run DEL semantics on the
    /// same request, best effort. The original failure is what the
    /// caller sees.
    async fn rollback(&self, config: &CniConfig) {
        let _guard = self.containers.lock(&config.container_id).await;
        if let Err(e) = self.del_locked(config).await {
            warn!(
                "rollback of container {} failed: {e}",
                config.container_id
            );
        }
    }

    async fn del(&self, args: &CniCmdArgs) -> CniCmdResponse {
        let config = match self.check_request(args) {
            Ok(config) => config,
            Err(response) => return *response,
        };
        info!(
            "received DEL for container {} (pod {}/{})",
            config.container_id, config.k8s.pod_namespace, config.k8s.pod_name
        );

        let _guard = self.containers.lock(&config.container_id).await;
        match self.del_locked(&config).await {
            Ok(()) => success_response(Vec::new()),
            Err(failure) => {
                error!(
                    "DEL for container {} failed: {failure}",
                    config.container_id
                );
                self.failure_response(failure)
            }
        }
    }

    async fn del_locked(&self, config: &CniConfig) -> Result<(), Failure> {
        let driver = self
            .ipam
            .driver(&config.network.ipam.r#type)
            .ok_or_else(|| Failure::Ipam(IpamError("IPAM driver disappeared".to_owned())))?;
        driver.del(config).await.map_err(Failure::Ipam)?;

        remove_interfaces(
            self.ovs.as_ref(),
            self.of_client.as_ref(),
            self.netdev.as_ref(),
            &self.store,
            &config.k8s.pod_name,
            &config.k8s.pod_namespace,
            &config.container_id,
        )
        .await?;
        Ok(())
    }

    async fn check(&self, args: &CniCmdArgs) -> CniCmdResponse {
        let config = match self.check_request(args) {
            Ok(config) => config,
            Err(response) => return *response,
        };
        info!(
            "received CHECK for container {} (pod {}/{})",
            config.container_id, config.k8s.pod_namespace, config.k8s.pod_name
        );

        let _guard = self.containers.lock(&config.container_id).await;

        let driver = match self.ipam.driver(&config.network.ipam.r#type) {
            Some(driver) => driver,
            None => {
                return error_response(ErrorCode::IpamFailure, "IPAM driver disappeared");
            }
        };
        if let Err(e) = driver.check(&config).await {
            error!("IPAM check failed: {e}");
            return error_response(ErrorCode::IpamFailure, e.to_string());
        }

        // prevResult only exists from 0.4.0 on.
        if cni_version_at_least(&config.network.cni_version, 0, 4) {
            if let Some(response) = self.validate_prev_result(&config).await {
                return response;
            }
        }
        info!("CHECK for container {} succeeded", config.container_id);
        success_response(Vec::new())
    }

    /// Returns the failure response when prevResult does not hold up
    /// against live state, `None` when everything matches.
    async fn validate_prev_result(&self, config: &CniConfig) -> Option<CniCmdResponse> {
        let Some(prev_value) = &config.network.prev_result else {
            error!("previous result not specified");
            return Some(unsupported_field_response("prevResult", ""));
        };
        let prev: CniResult = match serde_json::from_value(prev_value.clone()) {
            Ok(prev) => prev,
            Err(e) => {
                error!("failed to parse prevResult: {e}");
                return Some(decoding_failure_response("prevResult"));
            }
        };

        let host_ifname =
            generate_container_interface_name(&config.k8s.pod_name, &config.k8s.pod_namespace);
        let mut container_intf: Option<&ResultInterface> = None;
        let mut host_intf: Option<&ResultInterface> = None;
        for intf in &prev.interfaces {
            if intf.name == config.ifname {
                container_intf = Some(intf);
            } else if intf.name == host_ifname {
                host_intf = Some(intf);
            } else {
                error!("unknown interface name {} in prevResult", intf.name);
            }
        }
        let (Some(container_intf), Some(host_intf)) = (container_intf, host_intf) else {
            error!(
                "prevResult of container {} names neither {} nor {host_ifname}",
                config.container_id, config.ifname
            );
            return Some(invalid_network_config_response(
                "prevResult does not match network configuration",
            ));
        };

        if let Err(e) = check_interfaces(
            self.netdev.as_ref(),
            &self.store,
            &config.container_id,
            &config.netns,
            container_intf,
            host_intf,
        )
        .await
        {
            error!("CHECK failed for container {}: {e}", config.container_id);
            return Some(error_response(ErrorCode::CheckInterfaceFailure, e));
        }
        None
    }

    /// Startup reconciliation: intent is re-derived from the pods bound
    /// to this node, flows are replayed for survivors and orphaned
    /// ports are detached. Runs to completion through per-pod errors;
    /// only a failed pod list is fatal. Must finish before the server
    /// accepts traffic, or a racing ADD could be mistaken for an
    /// orphan.
    pub async fn reconcile(&self) -> Result<()> {
        info!("reconciling interfaces against the node's pod list");
        let pods = self
            .pods
            .list_node_pods()
            .await
            .map_err(|e| Error::Reconcile(format!("failed to list pods: {e}")))?;

        let mut desired: HashSet<String> = HashSet::new();
        for pod in pods.iter().filter(|pod| !pod.host_network) {
            let Some(config) = self
                .store
                .get_container_interface(&pod.name, &pod.namespace)
            else {
                // OVSDB is persisted on the node, so this means the
                // attach never completed; without the original CNI
                // arguments there is nothing to repair.
                warn!(
                    "interface for pod {}/{} not found in the store",
                    pod.namespace, pod.name
                );
                continue;
            };
            debug!(
                "syncing interface {} for pod {}/{}",
                config.iface_name, pod.namespace, pod.name
            );
            if let Err(e) = self
                .of_client
                .install_pod_flows(
                    &config.iface_name,
                    config.ip,
                    config.mac,
                    self.node_config.gateway.mac,
                    config.ofport as u32,
                )
                .await
            {
                error!(
                    "failed to re-install flows for pod {}/{}: {e}",
                    pod.namespace, pod.name
                );
                continue;
            }
            desired.insert(config.iface_name.clone());
        }

        for iface_id in self.store.interface_ids() {
            if desired.contains(&iface_id) {
                continue;
            }
            let Some(config) = self.store.get_interface(&iface_id) else {
                // Nothing else mutates the store before the server runs.
                error!("interface {iface_id} vanished from the store");
                continue;
            };
            if config.pod_name.is_empty() {
                // Not a container interface.
                continue;
            }
            debug!("deleting orphaned interface {iface_id}");
            if let Err(e) = remove_interfaces(
                self.ovs.as_ref(),
                self.of_client.as_ref(),
                self.netdev.as_ref(),
                &self.store,
                &config.pod_name,
                &config.pod_namespace,
                &config.container_id,
            )
            .await
            {
                error!("failed to remove orphaned interface {iface_id}: {e}");
            }
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl CniApi for CniServer {
    async fn cmd_add(
        &self,
        request: Request<CniCmdRequest>,
    ) -> Result<Response<CniCmdResponse>, Status> {
        let Some(args) = request.into_inner().cni_args else {
            return Ok(Response::new(decoding_failure_response("request")));
        };
        Ok(Response::new(self.add(&args).await))
    }

    async fn cmd_del(
        &self,
        request: Request<CniCmdRequest>,
    ) -> Result<Response<CniCmdResponse>, Status> {
        let Some(args) = request.into_inner().cni_args else {
            return Ok(Response::new(decoding_failure_response("request")));
        };
        Ok(Response::new(self.del(&args).await))
    }

    async fn cmd_check(
        &self,
        request: Request<CniCmdRequest>,
    ) -> Result<Response<CniCmdResponse>, Status> {
        let Some(args) = request.into_inner().cni_args else {
            return Ok(Response::new(decoding_failure_response("request")));
        };
        Ok(Response::new(self.check(&args).await))
    }
}

/// Binds the CNI socket and serves until cancelled. The reconciler must
/// have completed by the time this is called.
pub async fn serve(server: CniServer, path: &Path, cancel: CancellationToken) -> Result<()> {
    // Remove before bind to avoid "address already in use".
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    let Some(parent) = path.parent() else {
        return Err(std::io::Error::new(
            ErrorKind::NotFound,
            format!("parent of path {} could not resolve", path.display()),
        )
        .into());
    };
    std::fs::create_dir_all(parent)?;
    let listener = UnixListener::bind(path)?;
    let stream = UnixListenerStream::new(listener);

    info!("CNI server listening on {}", path.display());
    Server::builder()
        .add_service(CniServiceServer::new(server))
        .serve_with_incoming_shutdown(stream, shutdown(cancel))
        .await?;
    Ok(())
}

async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}

#[cfg(test)]
mod test {
    use std::collections::{HashMap, VecDeque};
    use std::net::IpAddr;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ipnetwork::IpNetwork;
    use macaddr::MacAddr6;
    use serde_json::json;

    use super::types::{ResultIp, ResultRoute};
    use super::*;
    use crate::config::GatewayConfig;
    use crate::interface_store::{EXTERNAL_ID_CONTAINER_ID, EXTERNAL_ID_POD_NAME, InterfaceConfig};
    use crate::kubernetes::NodePod;
    use crate::netdev::{InterfaceError, LinkInfo, RouteSpec, VethPair};
    use crate::ovsdb::OvsdbError;
    use crate::ovsdb::testing::MockOvsBridgeClient;

    const CONTAINER_ID: &str = "dummy-0";
    const IFNAME: &str = "eth0";
    const NETNS: &str = "/var/run/netns/test";
    const POD_NAME: &str = "test-1";
    const POD_NAMESPACE: &str = "t1";
    const CONTAINER_MAC: &str = "aa:bb:cc:dd:ee:02";
    const HOST_MAC: &str = "aa:bb:cc:dd:ee:01";

    #[derive(Default)]
    struct MockIpam {
        add_results: Mutex<VecDeque<Result<CniResult, IpamError>>>,
        add_requests: Mutex<Vec<CniConfig>>,
        del_requests: Mutex<Vec<CniConfig>>,
        check_requests: Mutex<Vec<CniConfig>>,
    }

    impl MockIpam {
        fn default_result() -> CniResult {
            CniResult {
                cni_version: "0.4.0".to_owned(),
                ips: vec![ResultIp {
                    version: "4".to_owned(),
                    address: "10.1.2.100/24".parse().unwrap(),
                    gateway: None,
                    interface: None,
                }],
                routes: vec![ResultRoute {
                    dst: "0.0.0.0/0".parse().unwrap(),
                    gw: Some("10.1.2.1".parse().unwrap()),
                }],
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ipam::IpamDriver for MockIpam {
        async fn add(&self, request: &CniConfig) -> Result<CniResult, IpamError> {
            self.add_requests.lock().unwrap().push(request.clone());
            self.add_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::default_result()))
        }

        async fn del(&self, request: &CniConfig) -> Result<(), IpamError> {
            self.del_requests.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn check(&self, request: &CniConfig) -> Result<(), IpamError> {
            self.check_requests.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFlows {
        installed: Mutex<Vec<(String, u32)>>,
        uninstalled: Mutex<Vec<String>>,
        fail_installs: Mutex<bool>,
    }

    #[async_trait]
    impl FlowClient for MockFlows {
        async fn install_pod_flows(
            &self,
            iface_name: &str,
            _ip: IpAddr,
            _mac: MacAddr6,
            _gateway_mac: MacAddr6,
            ofport: u32,
        ) -> Result<()> {
            if *self.fail_installs.lock().unwrap() {
                return Err(Error::OpenFlow("flow programming failed".to_owned()));
            }
            self.installed
                .lock()
                .unwrap()
                .push((iface_name.to_owned(), ofport));
            Ok(())
        }

        async fn uninstall_pod_flows(&self, iface_name: &str) -> Result<()> {
            self.uninstalled.lock().unwrap().push(iface_name.to_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockNetDevice {
        setups: Mutex<Vec<(String, String, u32, Vec<IpNetwork>, Vec<RouteSpec>)>>,
        host_links: Mutex<HashMap<String, LinkInfo>>,
        container_links: Mutex<HashMap<(String, String), LinkInfo>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NetDeviceClient for MockNetDevice {
        async fn setup_veth(
            &self,
            netns: &str,
            container_ifname: &str,
            host_ifname: &str,
            mtu: u32,
            addresses: &[IpNetwork],
            routes: &[RouteSpec],
        ) -> Result<VethPair, InterfaceError> {
            self.setups.lock().unwrap().push((
                container_ifname.to_owned(),
                host_ifname.to_owned(),
                mtu,
                addresses.to_vec(),
                routes.to_vec(),
            ));
            let host_mac: MacAddr6 = HOST_MAC.parse().unwrap();
            let container_mac: MacAddr6 = CONTAINER_MAC.parse().unwrap();
            self.host_links.lock().unwrap().insert(
                host_ifname.to_owned(),
                LinkInfo {
                    name: host_ifname.to_owned(),
                    mac: host_mac,
                    mtu,
                },
            );
            self.container_links.lock().unwrap().insert(
                (netns.to_owned(), container_ifname.to_owned()),
                LinkInfo {
                    name: container_ifname.to_owned(),
                    mac: container_mac,
                    mtu,
                },
            );
            Ok(VethPair {
                container_mac,
                host_mac,
            })
        }

        async fn delete_host_link(&self, name: &str) -> Result<(), InterfaceError> {
            self.deleted.lock().unwrap().push(name.to_owned());
            self.host_links.lock().unwrap().remove(name);
            Ok(())
        }

        async fn host_link(&self, name: &str) -> Result<Option<LinkInfo>, InterfaceError> {
            Ok(self.host_links.lock().unwrap().get(name).cloned())
        }

        async fn container_link(
            &self,
            netns: &str,
            name: &str,
        ) -> Result<Option<LinkInfo>, InterfaceError> {
            Ok(self
                .container_links
                .lock()
                .unwrap()
                .get(&(netns.to_owned(), name.to_owned()))
                .cloned())
        }
    }

    #[derive(Default)]
    struct MockPods {
        pods: Mutex<Vec<NodePod>>,
    }

    #[async_trait]
    impl PodLister for MockPods {
        async fn list_node_pods(&self) -> Result<Vec<NodePod>> {
            Ok(self.pods.lock().unwrap().clone())
        }
    }

    struct Fixture {
        server: CniServer,
        ovs: Arc<MockOvsBridgeClient>,
        flows: Arc<MockFlows>,
        netdev: Arc<MockNetDevice>,
        ipam: Arc<MockIpam>,
        store: Arc<InterfaceStore>,
        pods: Arc<MockPods>,
    }

    fn fixture() -> Fixture {
        let ovs = Arc::new(MockOvsBridgeClient::new());
        let flows = Arc::new(MockFlows::default());
        let netdev = Arc::new(MockNetDevice::default());
        let ipam_driver = Arc::new(MockIpam::default());
        let store = Arc::new(InterfaceStore::new());
        let pods = Arc::new(MockPods::default());

        let registry = Arc::new(IpamRegistry::new());
        registry.register("mock", Arc::clone(&ipam_driver) as Arc<dyn ipam::IpamDriver>);

        let node_config = NodeConfig {
            name: "node1".to_owned(),
            pod_cidr: "10.1.2.0/24".parse().unwrap(),
            gateway: GatewayConfig {
                name: "gw0".to_owned(),
                ip: "10.1.2.1".parse().unwrap(),
                mac: "11:11:11:11:11:11".parse().unwrap(),
            },
            bridge: "br-int".to_owned(),
            default_mtu: 1450,
        };
        let server = CniServer::new(
            node_config,
            "",
            Arc::clone(&ovs) as Arc<dyn OvsBridgeClient>,
            Arc::clone(&flows) as Arc<dyn FlowClient>,
            Arc::clone(&netdev) as Arc<dyn NetDeviceClient>,
            Arc::clone(&store),
            registry,
            Arc::clone(&pods) as Arc<dyn PodLister>,
        );
        Fixture {
            server,
            ovs,
            flows,
            netdev,
            ipam: ipam_driver,
            store,
            pods,
        }
    }

    fn network_config_json(cni_version: &str, ipam_type: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "cniVersion": cni_version,
            "name": "testConfig",
            "type": "fabric",
            "ipam": {"type": ipam_type, "subnet": "192.168.0.0/24"},
        }))
        .unwrap()
    }

    fn request(cni_version: &str, ipam_type: &str) -> CniCmdArgs {
        CniCmdArgs {
            container_id: CONTAINER_ID.to_owned(),
            ifname: IFNAME.to_owned(),
            netns: NETNS.to_owned(),
            args: format!(
                "K8S_POD_NAME={POD_NAME};K8S_POD_NAMESPACE={POD_NAMESPACE};K8S_POD_INFRA_CONTAINER_ID=test-111111"
            ),
            network_configuration: network_config_json(cni_version, ipam_type),
        }
    }

    fn response_code(response: &CniCmdResponse) -> Option<i32> {
        response.error.as_ref().map(|e| e.code)
    }

    #[tokio::test]
    async fn test_add_happy_path() {
        let fx = fixture();
        fx.ovs.queue_ofport(Ok(10));

        let response = fx.server.add(&request("0.4.0", "mock")).await;
        assert_eq!(response_code(&response), None, "{:?}", response.error);

        let result: CniResult = serde_json::from_slice(&response.cni_result).unwrap();
        let host_ifname = generate_container_interface_name(POD_NAME, POD_NAMESPACE);
        assert_eq!(result.interfaces.len(), 2);
        assert_eq!(result.interfaces[0].name, host_ifname);
        assert_eq!(result.interfaces[0].mac.len(), 17);
        assert_eq!(result.interfaces[0].sandbox, None);
        assert_eq!(result.interfaces[1].name, IFNAME);
        assert_eq!(result.interfaces[1].mac, CONTAINER_MAC);
        assert_eq!(result.interfaces[1].sandbox.as_deref(), Some(NETNS));
        assert_eq!(result.ips[0].interface, Some(1));
        assert_eq!(result.ips[0].gateway, Some("10.1.2.1".parse().unwrap()));
        assert!(result.routes.iter().any(|r| r.dst.prefix() == 0));

        // The veth was programmed with the assigned address and routes.
        let setups = fx.netdev.setups.lock().unwrap();
        assert_eq!(setups.len(), 1);
        let (container_ifname, setup_host, mtu, addresses, routes) = &setups[0];
        assert_eq!(container_ifname, IFNAME);
        assert_eq!(setup_host, &host_ifname);
        assert_eq!(*mtu, 1450);
        assert_eq!(addresses[0].to_string(), "10.1.2.100/24");
        assert!(!routes.is_empty());

        // The OVS port carries the pod identity.
        let created = fx.ovs.created_ports.lock().unwrap();
        assert_eq!(created.len(), 1);
        let (port_name, port_ifname, external_ids) = &created[0];
        assert_eq!(port_name, &host_ifname);
        assert_eq!(port_ifname, &host_ifname);
        assert_eq!(external_ids[EXTERNAL_ID_CONTAINER_ID], CONTAINER_ID);
        assert_eq!(external_ids[EXTERNAL_ID_POD_NAME], POD_NAME);
        assert_eq!(external_ids["ip"], "10.1.2.100");
        assert_eq!(external_ids["mac"].to_lowercase(), CONTAINER_MAC);

        // Flows installed exactly once, with the materialized ofport.
        assert_eq!(
            fx.flows.installed.lock().unwrap().as_slice(),
            &[(host_ifname.clone(), 10)]
        );

        // The store is the fourth leg of the attach.
        let config = fx
            .store
            .get_container_interface(POD_NAME, POD_NAMESPACE)
            .expect("store record must exist after ADD");
        assert_eq!(config.container_id, CONTAINER_ID);
        assert_eq!(config.ofport, 10);
        assert_eq!(config.ip.to_string(), "10.1.2.100");
        assert_eq!(config.port_uuid, format!("uuid-{host_ifname}"));

        // And the IPAM saw the node-local subnet, not the caller's.
        let ipam_requests = fx.ipam.add_requests.lock().unwrap();
        let rewritten: serde_json::Value =
            serde_json::from_slice(&ipam_requests[0].network_configuration).unwrap();
        assert_eq!(rewritten["ipam"]["subnet"], "10.1.2.0/24");
        assert_eq!(rewritten["ipam"]["gateway"], "10.1.2.1");
    }

    #[tokio::test]
    async fn test_validation_failures_touch_nothing() {
        let fx = fixture();

        let mut bad_json = request("0.4.0", "mock");
        bad_json.network_configuration = b"{not json".to_vec();
        let response = fx.server.add(&bad_json).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::DecodingFailure as i32)
        );

        let response = fx.server.add(&request("0.5.0", "mock")).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::IncompatibleCniVersion as i32)
        );

        let response = fx.server.add(&request("0.4.0", "dhcp")).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::UnsupportedField as i32)
        );

        let mut bad_args = request("0.4.0", "mock");
        bad_args.args = "K8S_POD_NAME=only".to_owned();
        let response = fx.server.add(&bad_args).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::DecodingFailure as i32)
        );

        assert!(fx.ipam.add_requests.lock().unwrap().is_empty());
        assert!(fx.netdev.setups.lock().unwrap().is_empty());
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_add_rolls_back_everything() {
        let fx = fixture();
        *fx.flows.fail_installs.lock().unwrap() = true;

        let response = fx.server.add(&request("0.4.0", "mock")).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::ConfigInterfaceFailure as i32)
        );

        let host_ifname = generate_container_interface_name(POD_NAME, POD_NAMESPACE);
        // IPAM allocation released, OVS port gone, veth gone, store empty.
        assert_eq!(fx.ipam.del_requests.lock().unwrap().len(), 1);
        assert_eq!(
            fx.ovs.deleted_ports.lock().unwrap().as_slice(),
            &[format!("uuid-{host_ifname}")]
        );
        assert!(fx.netdev.deleted.lock().unwrap().contains(&host_ifname));
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_ofport_error_after_port_creation_rolls_back_the_port() {
        let fx = fixture();
        fx.ovs
            .queue_ofport(Err(OvsdbError::transient("OVSDB connection closed")));

        let response = fx.server.add(&request("0.4.0", "mock")).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::TryAgainLater as i32)
        );

        // The OVS port already existed when the ofport wait failed, so
        // rollback must find its UUID through the store and delete it.
        let host_ifname = generate_container_interface_name(POD_NAME, POD_NAMESPACE);
        assert_eq!(
            fx.ovs.deleted_ports.lock().unwrap().as_slice(),
            &[format!("uuid-{host_ifname}")]
        );
        assert_eq!(fx.ipam.del_requests.lock().unwrap().len(), 1);
        assert!(fx.netdev.deleted.lock().unwrap().contains(&host_ifname));
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_transient_ovsdb_error_maps_to_try_again_later() {
        let fx = fixture();
        fx.ovs
            .queue_create_port(Err(OvsdbError::transient("commit conflict")));

        let response = fx.server.add(&request("0.4.0", "mock")).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::TryAgainLater as i32)
        );
        // Rollback still ran.
        assert_eq!(fx.ipam.del_requests.lock().unwrap().len(), 1);
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn test_del_after_add() {
        let fx = fixture();
        fx.ovs.queue_ofport(Ok(10));
        let response = fx.server.add(&request("0.4.0", "mock")).await;
        assert_eq!(response_code(&response), None);

        let response = fx.server.del(&request("0.4.0", "mock")).await;
        assert_eq!(response_code(&response), None, "{:?}", response.error);

        let host_ifname = generate_container_interface_name(POD_NAME, POD_NAMESPACE);
        assert_eq!(fx.ipam.del_requests.lock().unwrap().len(), 1);
        assert_eq!(
            fx.flows.uninstalled.lock().unwrap().as_slice(),
            &[host_ifname.clone()]
        );
        assert_eq!(
            fx.ovs.deleted_ports.lock().unwrap().as_slice(),
            &[format!("uuid-{host_ifname}")]
        );
        assert!(fx.netdev.deleted.lock().unwrap().contains(&host_ifname));
        assert!(fx.store.is_empty());
        assert!(fx.netdev.host_links.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_del_without_record_is_clean() {
        let fx = fixture();
        let response = fx.server.del(&request("0.4.0", "mock")).await;
        assert_eq!(response_code(&response), None);
        // Only the deterministic host veth cleanup runs.
        let host_ifname = generate_container_interface_name(POD_NAME, POD_NAMESPACE);
        assert_eq!(
            fx.netdev.deleted.lock().unwrap().as_slice(),
            &[host_ifname]
        );
        assert!(fx.ovs.deleted_ports.lock().unwrap().is_empty());
    }

    fn check_request_with_prev(prev: &CniResult) -> CniCmdArgs {
        let mut args = request("0.4.0", "mock");
        args.network_configuration = serde_json::to_vec(&json!({
            "cniVersion": "0.4.0",
            "name": "testConfig",
            "type": "fabric",
            "ipam": {"type": "mock", "subnet": "192.168.0.0/24"},
            "prevResult": serde_json::to_value(prev).unwrap(),
        }))
        .unwrap();
        args
    }

    #[tokio::test]
    async fn test_check_after_add() {
        let fx = fixture();
        fx.ovs.queue_ofport(Ok(10));
        let response = fx.server.add(&request("0.4.0", "mock")).await;
        let prev: CniResult = serde_json::from_slice(&response.cni_result).unwrap();

        let response = fx.server.check(&check_request_with_prev(&prev)).await;
        assert_eq!(response_code(&response), None, "{:?}", response.error);
        assert_eq!(fx.ipam.check_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_check_detects_mac_mismatch() {
        let fx = fixture();
        fx.ovs.queue_ofport(Ok(10));
        let response = fx.server.add(&request("0.4.0", "mock")).await;
        let mut prev: CniResult = serde_json::from_slice(&response.cni_result).unwrap();
        prev.interfaces[1].mac = "ff:ff:ff:ff:ff:ff".to_owned();

        let response = fx.server.check(&check_request_with_prev(&prev)).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::CheckInterfaceFailure as i32)
        );
    }

    #[tokio::test]
    async fn test_check_requires_prev_result_from_040() {
        let fx = fixture();
        let response = fx.server.check(&request("0.4.0", "mock")).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::UnsupportedField as i32)
        );

        // Below 0.4.0 there is no prevResult to validate.
        let response = fx.server.check(&request("0.3.1", "mock")).await;
        assert_eq!(response_code(&response), None);
    }

    #[tokio::test]
    async fn test_check_rejects_foreign_prev_result() {
        let fx = fixture();
        fx.ovs.queue_ofport(Ok(10));
        let response = fx.server.add(&request("0.4.0", "mock")).await;
        let mut prev: CniResult = serde_json::from_slice(&response.cni_result).unwrap();
        prev.interfaces[0].name = "someone-elses".to_owned();

        let response = fx.server.check(&check_request_with_prev(&prev)).await;
        assert_eq!(
            response_code(&response),
            Some(ErrorCode::InvalidNetworkConfig as i32)
        );
    }

    #[tokio::test]
    async fn test_reconcile_replays_survivors_and_deletes_orphans() {
        let fx = fixture();

        let live_mac: MacAddr6 = "aa:bb:cc:dd:ee:10".parse().unwrap();
        let mut live = InterfaceConfig::new(
            "live-container",
            "live",
            "test",
            "",
            live_mac,
            "10.1.2.10".parse::<IpAddr>().unwrap(),
        );
        live.port_uuid = "uuid-live".to_owned();
        live.ofport = 5;
        let live_ifname = live.iface_name.clone();
        fx.store.add_interface(live);

        let ghost_mac: MacAddr6 = "aa:bb:cc:dd:ee:20".parse().unwrap();
        let mut ghost = InterfaceConfig::new(
            "ghost-container",
            "ghost",
            "test",
            "",
            ghost_mac,
            "10.1.2.20".parse::<IpAddr>().unwrap(),
        );
        ghost.port_uuid = "uuid-ghost".to_owned();
        ghost.ofport = 6;
        fx.store.add_interface(ghost);

        *fx.pods.pods.lock().unwrap() = vec![
            NodePod {
                name: "live".to_owned(),
                namespace: "test".to_owned(),
                host_network: false,
            },
            NodePod {
                name: "hostnet".to_owned(),
                namespace: "test".to_owned(),
                host_network: true,
            },
        ];

        fx.server.reconcile().await.unwrap();

        // The survivor got its flows replayed; the orphan was detached.
        assert_eq!(
            fx.flows.installed.lock().unwrap().as_slice(),
            &[(live_ifname.clone(), 5)]
        );
        assert_eq!(
            fx.ovs.deleted_ports.lock().unwrap().as_slice(),
            &["uuid-ghost".to_owned()]
        );
        assert!(fx.store.get_container_interface("ghost", "test").is_none());
        assert!(fx.store.get_container_interface("live", "test").is_some());
        assert_eq!(fx.store.len(), 1);
    }
}
