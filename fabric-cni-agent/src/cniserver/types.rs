//! CNI wire types: the network configuration handed to the plugin, the
//! CNI result, and the Kubernetes args side channel.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const SUPPORTED_CNI_VERSIONS: [&str; 5] = ["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0"];

pub(crate) fn serialize_to_string<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub(crate) fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// The network configuration document from the plugin's stdin. Unknown
/// keys are preserved so the rewritten document handed to IPAM loses
/// nothing the caller supplied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(default)]
    pub cni_version: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub r#type: String,

    #[serde(default)]
    pub mtu: u32,

    #[serde(default)]
    pub dns: Dns,

    #[serde(default)]
    pub ipam: IpamConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<Value>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
    #[serde(default)]
    pub r#type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    pub fn is_empty(&self) -> bool {
        *self == Dns::default()
    }
}

/// The CNI 0.4.0 result document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    pub cni_version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<ResultInterface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<ResultIp>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<ResultRoute>,

    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultInterface {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultIp {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(
        serialize_with = "serialize_to_string",
        deserialize_with = "deserialize_from_str"
    )]
    pub address: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    /// Index into `interfaces`; the container end is index 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRoute {
    #[serde(
        serialize_with = "serialize_to_string",
        deserialize_with = "deserialize_from_str"
    )]
    pub dst: IpNetwork,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// Pod identity carried through `CNI_ARGS` as semicolon separated
/// key=value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct K8sArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    pub infra_container_id: String,
}

pub fn parse_k8s_args(args: &str) -> Result<K8sArgs, String> {
    let mut out = K8sArgs::default();
    for pair in args.split(';') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "K8S_POD_NAME" => out.pod_name = value.to_owned(),
            "K8S_POD_NAMESPACE" => out.pod_namespace = value.to_owned(),
            "K8S_POD_INFRA_CONTAINER_ID" => out.infra_container_id = value.to_owned(),
            _ => {}
        }
    }
    if out.pod_name.is_empty() || out.pod_namespace.is_empty() {
        return Err(format!(
            "CNI args missing pod identity: {args}"
        ));
    }
    Ok(out)
}

/// A fully validated request: everything a handler needs, with the
/// netns path host-prefixed and the IPAM section already rewritten.
#[derive(Debug, Clone)]
pub struct CniConfig {
    pub container_id: String,
    pub ifname: String,
    pub netns: String,
    /// Raw `CNI_ARGS`, forwarded verbatim to the IPAM executable.
    pub args: String,
    pub k8s: K8sArgs,
    pub network: NetworkConfig,
    /// The rewritten configuration document handed to IPAM.
    pub network_configuration: Vec<u8>,
}

/// Normalizes the IPAM result for this agent's single-veth topology:
/// every address belongs to the container end (interface index 1), a
/// missing per-address gateway defaults to the first host of its
/// subnet, and a default route via the node gateway is appended when
/// the IPAM plugin supplied none.
pub fn update_result_iface_config(result: &mut CniResult, default_gateway: Ipv4Addr) {
    for ip in &mut result.ips {
        ip.interface = Some(1);
        if ip.gateway.is_none() {
            ip.gateway = Some(first_subnet_host(ip.address));
        }
    }

    let has_default_route = result
        .routes
        .iter()
        .any(|route| matches!(route.dst, IpNetwork::V4(dst) if dst.prefix() == 0));
    if !has_default_route {
        result.routes.push(ResultRoute {
            dst: default_route_v4(),
            gw: Some(IpAddr::V4(default_gateway)),
        });
    }
}

fn default_route_v4() -> IpNetwork {
    IpNetwork::V4(Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).expect("0.0.0.0/0 is a valid network"))
}

/// Network address plus one.
fn first_subnet_host(network: IpNetwork) -> IpAddr {
    match network {
        IpNetwork::V4(network) => {
            IpAddr::V4(Ipv4Addr::from(u32::from(network.network()) + 1))
        }
        IpNetwork::V6(network) => {
            IpAddr::V6(Ipv6Addr::from(u128::from(network.network()) + 1))
        }
    }
}
