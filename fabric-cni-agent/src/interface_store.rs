//! In-memory authoritative map of attached container interfaces.
//!
//! OVSDB is the persistent truth: the store is rebuilt from the bridge's
//! port rows on every agent start, using the pod identity pinned to each
//! port through its external ids.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use macaddr::MacAddr6;
use tracing::{debug, warn};

use crate::netdev::generate_container_interface_name;
use crate::ovsdb::OvsdbError;
use crate::ovsdb::bridge::{OvsBridgeClient, OvsPortData};

pub const EXTERNAL_ID_CONTAINER_ID: &str = "fabric-iface-id";
pub const EXTERNAL_ID_POD_NAME: &str = "pod-name";
pub const EXTERNAL_ID_POD_NAMESPACE: &str = "pod-namespace";
pub const EXTERNAL_ID_IP: &str = "ip";
pub const EXTERNAL_ID_MAC: &str = "mac";

/// Everything the agent knows about one attached container interface.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub container_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    /// Host-side veth name; the store's primary key.
    pub iface_name: String,
    pub netns: String,
    pub ip: IpAddr,
    pub mac: MacAddr6,
    pub port_uuid: String,
    /// 0 until OVS materializes the OpenFlow port number.
    pub ofport: i32,
}

impl InterfaceConfig {
    pub fn new(
        container_id: impl Into<String>,
        pod_name: &str,
        pod_namespace: &str,
        netns: impl Into<String>,
        mac: MacAddr6,
        ip: IpAddr,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            pod_name: pod_name.to_owned(),
            pod_namespace: pod_namespace.to_owned(),
            iface_name: generate_container_interface_name(pod_name, pod_namespace),
            netns: netns.into(),
            ip,
            mac,
            port_uuid: String::new(),
            ofport: 0,
        }
    }
}

/// Encodes the pod identity carried by an OVS Port row's external ids.
pub fn build_ovs_port_external_ids(config: &InterfaceConfig) -> HashMap<String, String> {
    let mut ids = HashMap::new();
    ids.insert(EXTERNAL_ID_CONTAINER_ID.to_owned(), config.container_id.clone());
    ids.insert(EXTERNAL_ID_POD_NAME.to_owned(), config.pod_name.clone());
    ids.insert(
        EXTERNAL_ID_POD_NAMESPACE.to_owned(),
        config.pod_namespace.clone(),
    );
    ids.insert(EXTERNAL_ID_IP.to_owned(), config.ip.to_string());
    ids.insert(EXTERNAL_ID_MAC.to_owned(), config.mac.to_string());
    ids
}

/// Rebuilds an interface record from a persisted port row. Returns
/// `None` for rows without the container marker (gateway, tunnel,
/// uplink) and rows whose identity does not parse.
fn interface_config_from_port_data(port: &OvsPortData) -> Option<InterfaceConfig> {
    let container_id = port.external_ids.get(EXTERNAL_ID_CONTAINER_ID)?;
    if container_id.is_empty() {
        return None;
    }
    let mac: MacAddr6 = match port.external_ids.get(EXTERNAL_ID_MAC).map(|m| m.parse()) {
        Some(Ok(mac)) => mac,
        _ => {
            warn!("port {} has an unparseable mac external id", port.name);
            return None;
        }
    };
    let ip: IpAddr = match port.external_ids.get(EXTERNAL_ID_IP).map(|ip| ip.parse()) {
        Some(Ok(ip)) => ip,
        _ => {
            warn!("port {} has an unparseable ip external id", port.name);
            return None;
        }
    };
    Some(InterfaceConfig {
        container_id: container_id.clone(),
        pod_name: port
            .external_ids
            .get(EXTERNAL_ID_POD_NAME)
            .cloned()
            .unwrap_or_default(),
        pod_namespace: port
            .external_ids
            .get(EXTERNAL_ID_POD_NAMESPACE)
            .cloned()
            .unwrap_or_default(),
        iface_name: port.ifname.clone(),
        netns: String::new(),
        ip,
        mac,
        port_uuid: port.uuid.clone(),
        ofport: port.ofport,
    })
}

#[derive(Default)]
struct Indices {
    by_name: HashMap<String, Arc<InterfaceConfig>>,
    by_container_id: HashMap<String, String>,
    by_pod: HashMap<(String, String), String>,
}

impl Indices {
    fn insert(&mut self, config: InterfaceConfig) {
        let name = config.iface_name.clone();
        self.by_container_id
            .insert(config.container_id.clone(), name.clone());
        self.by_pod.insert(
            (config.pod_name.clone(), config.pod_namespace.clone()),
            name.clone(),
        );
        self.by_name.insert(name, Arc::new(config));
    }

    fn remove(&mut self, iface_name: &str) {
        if let Some(config) = self.by_name.remove(iface_name) {
            self.by_container_id.remove(&config.container_id);
            self.by_pod
                .remove(&(config.pod_name.clone(), config.pod_namespace.clone()));
        }
    }
}

/// Writers always hold the container arbitrator lock for the id they
/// touch, so index mutations never race each other; the inner lock
/// keeps concurrent readers (the reconciler, queued handlers) safe.
#[derive(Default)]
pub struct InterfaceStore {
    indices: RwLock<Indices>,
}

impl InterfaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the store from the bridge's persisted port rows. On any
    /// OVSDB error the store is emptied and the error propagated.
    pub async fn initialize(
        &self,
        ovs: &dyn OvsBridgeClient,
        uplink_ifname: &str,
        gateway_ifname: &str,
    ) -> Result<(), OvsdbError> {
        let ports = match ovs.port_list().await {
            Ok(ports) => ports,
            Err(e) => {
                *self.indices.write().unwrap() = Indices::default();
                return Err(e);
            }
        };
        let mut indices = Indices::default();
        for port in &ports {
            match interface_config_from_port_data(port) {
                Some(config) => indices.insert(config),
                None => {
                    if port.name != gateway_ifname && port.name != uplink_ifname {
                        debug!("skipping non-container port {}", port.name);
                    }
                }
            }
        }
        *self.indices.write().unwrap() = indices;
        Ok(())
    }

    pub fn add_interface(&self, config: InterfaceConfig) {
        self.indices.write().unwrap().insert(config);
    }

    pub fn delete_interface(&self, iface_name: &str) {
        self.indices.write().unwrap().remove(iface_name);
    }

    pub fn get_interface(&self, iface_name: &str) -> Option<Arc<InterfaceConfig>> {
        self.indices.read().unwrap().by_name.get(iface_name).cloned()
    }

    pub fn get_interface_by_container_id(
        &self,
        container_id: &str,
    ) -> Option<Arc<InterfaceConfig>> {
        let indices = self.indices.read().unwrap();
        let name = indices.by_container_id.get(container_id)?;
        indices.by_name.get(name).cloned()
    }

    pub fn get_container_interface(
        &self,
        pod_name: &str,
        pod_namespace: &str,
    ) -> Option<Arc<InterfaceConfig>> {
        let indices = self.indices.read().unwrap();
        let name = indices
            .by_pod
            .get(&(pod_name.to_owned(), pod_namespace.to_owned()))?;
        indices.by_name.get(name).cloned()
    }

    /// Names of every interface currently in the store.
    pub fn interface_ids(&self) -> Vec<String> {
        self.indices
            .read()
            .unwrap()
            .by_name
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.indices.read().unwrap().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use uuid::Uuid;

    use super::*;
    use crate::ovsdb::testing::MockOvsBridgeClient;

    fn container_port(
        name: &str,
        ofport: i32,
        container_id: &str,
        mac: &str,
        ip: &str,
        pod_name: &str,
        pod_namespace: &str,
    ) -> OvsPortData {
        let mut external_ids = HashMap::new();
        external_ids.insert(EXTERNAL_ID_CONTAINER_ID.to_owned(), container_id.to_owned());
        external_ids.insert(EXTERNAL_ID_MAC.to_owned(), mac.to_owned());
        external_ids.insert(EXTERNAL_ID_IP.to_owned(), ip.to_owned());
        external_ids.insert(EXTERNAL_ID_POD_NAME.to_owned(), pod_name.to_owned());
        external_ids.insert(EXTERNAL_ID_POD_NAMESPACE.to_owned(), pod_namespace.to_owned());
        OvsPortData {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            ifname: name.to_owned(),
            ofport,
            external_ids,
        }
    }

    #[tokio::test]
    async fn test_initialize() {
        let ovs = MockOvsBridgeClient::new();
        let store = InterfaceStore::new();

        // A failed port list empties the store and surfaces the error.
        ovs.queue_port_list(Err(OvsdbError::transient("failed to list OVS ports")));
        let err = store.initialize(&ovs, "", "").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.len(), 0);

        let port1 = container_port(
            "p1",
            1,
            &Uuid::new_v4().to_string(),
            "11:22:33:44:55:66",
            "1.1.1.1",
            "pod1",
            "test",
        );
        let port2 = container_port(
            "p2",
            2,
            &Uuid::new_v4().to_string(),
            "11:22:33:44:55:77",
            "1.1.1.2",
            "pod2",
            "test",
        );

        ovs.queue_port_list(Ok(vec![port1.clone(), port2.clone()]));
        store.initialize(&ovs, "", "").await.unwrap();
        assert_eq!(store.len(), 2);

        let config = store.get_interface("p1").expect("p1 should be loaded");
        assert_eq!(config.ofport, 1);
        assert_eq!(config.ip.to_string(), "1.1.1.1");
        assert_eq!(config.mac.to_string().to_lowercase(), "11:22:33:44:55:66");
        assert_eq!(config.iface_name, "p1");
        assert!(store.get_interface("p2").is_some());

        let by_pod = store.get_container_interface("pod2", "test").unwrap();
        assert_eq!(by_pod.iface_name, "p2");

        // Initialize replaces previous content wholesale.
        ovs.queue_port_list(Ok(vec![port2]));
        store.initialize(&ovs, "", "").await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get_interface("p1").is_none());
    }

    #[tokio::test]
    async fn test_initialize_skips_unmarked_ports() {
        let ovs = MockOvsBridgeClient::new();
        let store = InterfaceStore::new();

        let gateway = OvsPortData {
            uuid: Uuid::new_v4().to_string(),
            name: "gw0".to_owned(),
            ifname: "gw0".to_owned(),
            ofport: 2,
            external_ids: HashMap::new(),
        };
        let pod = container_port(
            "p1",
            1,
            "container-1",
            "11:22:33:44:55:66",
            "1.1.1.1",
            "pod1",
            "test",
        );
        ovs.queue_port_list(Ok(vec![gateway, pod]));
        store.initialize(&ovs, "eth0", "gw0").await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get_interface("gw0").is_none());
    }

    #[test]
    fn test_parse_container_attach_info() {
        let container_id = Uuid::new_v4().to_string();
        let mac: MacAddr6 = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let ip: IpAddr = "10.1.2.100".parse().unwrap();
        let config = InterfaceConfig::new(container_id.clone(), "test-1", "t1", "", mac, ip);

        let external_ids = build_ovs_port_external_ids(&config);
        assert_eq!(external_ids[EXTERNAL_ID_IP], "10.1.2.100");
        assert_eq!(
            external_ids[EXTERNAL_ID_MAC].to_lowercase(),
            "aa:bb:cc:dd:ee:ff"
        );
        assert_eq!(external_ids[EXTERNAL_ID_CONTAINER_ID], container_id);
        assert_eq!(external_ids[EXTERNAL_ID_POD_NAME], "test-1");
        assert_eq!(external_ids[EXTERNAL_ID_POD_NAMESPACE], "t1");
    }

    #[test]
    fn test_indices_stay_consistent() {
        let store = InterfaceStore::new();
        let mac: MacAddr6 = "aa:bb:cc:dd:ee:01".parse().unwrap();
        let ip: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        let mut config = InterfaceConfig::new("container-1", "pod1", "ns1", "", mac, ip);
        config.port_uuid = "uuid-1".to_owned();
        let name = config.iface_name.clone();
        store.add_interface(config);

        assert_eq!(store.len(), 1);
        assert!(store.get_interface(&name).is_some());
        assert!(store.get_interface_by_container_id("container-1").is_some());
        assert!(store.get_container_interface("pod1", "ns1").is_some());
        assert_eq!(store.interface_ids(), vec![name.clone()]);

        store.delete_interface(&name);
        assert!(store.is_empty());
        assert!(store.get_interface_by_container_id("container-1").is_none());
        assert!(store.get_container_interface("pod1", "ns1").is_none());
    }
}
