//! Host and container link programming over netlink.
//!
//! The veth pair is created in the host namespace under a temporary
//! container-side name, then the container end is moved into the pod's
//! network namespace and renamed to the requested ifname in a single
//! netlink set. Address and route programming runs on a short-lived
//! thread joined to the target namespace, since netlink sockets are
//! scoped to the namespace they were opened in.

use std::fs::File;
use std::net::IpAddr;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;

use async_trait::async_trait;
use futures::TryStreamExt;
use futures::future::BoxFuture;
use ipnetwork::IpNetwork;
use macaddr::MacAddr6;
use nix::sched::{CloneFlags, setns};
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::{Handle, LinkUnspec, LinkVeth, RouteMessageBuilder};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

const IFNAME_MAX_LEN: usize = 15; // IFNAMSIZ minus the trailing NUL
const IFNAME_PREFIX_LEN: usize = 6;
const IFNAME_HASH_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("netns error: {0}")]
    Netns(#[from] nix::Error),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("network namespace task failed")]
    NamespaceTask,
}

/// Derives the host-side veth name for a pod. Pure: the same pod always
/// maps to the same name, across restarts and across processes, which
/// is what lets DEL and the reconciler find the link without the
/// original ADD arguments.
pub fn generate_container_interface_name(pod_name: &str, pod_namespace: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pod_namespace.as_bytes());
    hasher.update(b"/");
    hasher.update(pod_name.as_bytes());
    let digest = hasher.finalize();
    let hash: String = digest[..IFNAME_HASH_LEN / 2]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();

    let prefix: String = pod_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(IFNAME_PREFIX_LEN)
        .collect();
    if prefix.is_empty() {
        format!("pod-{hash}")
    } else {
        format!("{prefix}-{hash}")
    }
}

/// Name the container end carries while it still lives in the host
/// namespace. Sharing the host name's hash suffix keeps it unique per
/// pod without risking a clash with the host name itself.
fn temporary_container_name(host_ifname: &str) -> String {
    let suffix = &host_ifname[host_ifname.len().saturating_sub(IFNAME_HASH_LEN)..];
    format!("tmp{suffix}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub mac: MacAddr6,
    pub mtu: u32,
}

#[derive(Debug, Clone)]
pub struct VethPair {
    pub container_mac: MacAddr6,
    pub host_mac: MacAddr6,
}

#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
}

/// Seam between the CNI handlers and the kernel; tests substitute their
/// own implementation, production uses [`NetlinkClient`].
#[async_trait]
pub trait NetDeviceClient: Send + Sync {
    /// Creates the veth pair, moves the container end into `netns` as
    /// `container_ifname`, assigns addresses and routes inside the
    /// namespace and brings both ends up.
    async fn setup_veth(
        &self,
        netns: &str,
        container_ifname: &str,
        host_ifname: &str,
        mtu: u32,
        addresses: &[IpNetwork],
        routes: &[RouteSpec],
    ) -> Result<VethPair, InterfaceError>;

    /// Removes the host end of a pair; the peer dies with it. A link
    /// that is already gone is not an error.
    async fn delete_host_link(&self, name: &str) -> Result<(), InterfaceError>;

    async fn host_link(&self, name: &str) -> Result<Option<LinkInfo>, InterfaceError>;

    /// Inspects a link inside a pod namespace. A namespace that no
    /// longer exists reads as "no link".
    async fn container_link(
        &self,
        netns: &str,
        name: &str,
    ) -> Result<Option<LinkInfo>, InterfaceError>;
}

pub struct NetlinkClient {
    handle: Handle,
}

impl NetlinkClient {
    pub fn new() -> Result<Self, InterfaceError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

#[async_trait]
impl NetDeviceClient for NetlinkClient {
    async fn setup_veth(
        &self,
        netns: &str,
        container_ifname: &str,
        host_ifname: &str,
        mtu: u32,
        addresses: &[IpNetwork],
        routes: &[RouteSpec],
    ) -> Result<VethPair, InterfaceError> {
        let tmp_ifname = temporary_container_name(host_ifname);
        self.handle
            .link()
            .add(LinkVeth::new(&tmp_ifname, host_ifname).mtu(mtu).build())
            .execute()
            .await?;

        let container_end = link_by_name(&self.handle, &tmp_ifname)
            .await?
            .ok_or_else(|| InterfaceError::LinkNotFound(tmp_ifname.clone()))?;
        let host_end = link_by_name(&self.handle, host_ifname)
            .await?
            .ok_or_else(|| InterfaceError::LinkNotFound(host_ifname.to_owned()))?;
        let pair = VethPair {
            container_mac: link_mac(&container_end)
                .ok_or_else(|| InterfaceError::LinkNotFound(tmp_ifname.clone()))?,
            host_mac: link_mac(&host_end)
                .ok_or_else(|| InterfaceError::LinkNotFound(host_ifname.to_owned()))?,
        };

        // Move and rename in one message; the kernel applies both
        // atomically, so the temporary name never appears in the pod.
        let ns_file = File::open(netns)?;
        let mut move_msg = LinkUnspec::new_with_index(container_end.header.index)
            .name(container_ifname.to_owned())
            .mtu(mtu)
            .build();
        move_msg
            .attributes
            .push(LinkAttribute::NetNsFd(ns_file.as_raw_fd()));
        self.handle.link().set(move_msg).execute().await?;

        self.handle
            .link()
            .set(LinkUnspec::new_with_index(host_end.header.index).up().build())
            .execute()
            .await?;

        let netns = netns.to_owned();
        let container_ifname = container_ifname.to_owned();
        let addresses = addresses.to_vec();
        let routes = routes.to_vec();
        tokio::task::spawn_blocking(move || {
            with_netns(Path::new(&netns), move |handle| {
                Box::pin(async move {
                    let link = link_by_name(&handle, &container_ifname)
                        .await?
                        .ok_or(InterfaceError::LinkNotFound(container_ifname))?;
                    let index = link.header.index;
                    for address in addresses {
                        handle
                            .address()
                            .add(index, address.ip(), address.prefix())
                            .execute()
                            .await?;
                    }
                    handle
                        .link()
                        .set(LinkUnspec::new_with_index(index).up().build())
                        .execute()
                        .await?;
                    for route in routes {
                        add_route(&handle, &route).await?;
                    }
                    Ok(())
                })
            })
        })
        .await
        .map_err(|_| InterfaceError::NamespaceTask)??;

        Ok(pair)
    }

    async fn delete_host_link(&self, name: &str) -> Result<(), InterfaceError> {
        match link_by_name(&self.handle, name).await? {
            Some(link) => {
                self.handle.link().del(link.header.index).execute().await?;
                Ok(())
            }
            None => {
                debug!("host link {name} already absent");
                Ok(())
            }
        }
    }

    async fn host_link(&self, name: &str) -> Result<Option<LinkInfo>, InterfaceError> {
        Ok(link_by_name(&self.handle, name).await?.and_then(link_info))
    }

    async fn container_link(
        &self,
        netns: &str,
        name: &str,
    ) -> Result<Option<LinkInfo>, InterfaceError> {
        let netns = netns.to_owned();
        let name = name.to_owned();
        let looked_up = tokio::task::spawn_blocking(move || {
            with_netns(Path::new(&netns), move |handle| {
                Box::pin(async move { Ok(link_by_name(&handle, &name).await?.and_then(link_info)) })
            })
        })
        .await
        .map_err(|_| InterfaceError::NamespaceTask)?;
        match looked_up {
            Ok(info) => Ok(info),
            // The pod namespace can be gone already; report "no link".
            Err(InterfaceError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

async fn add_route(handle: &Handle, route: &RouteSpec) -> Result<(), InterfaceError> {
    match (route.destination, route.gateway) {
        (IpNetwork::V4(dst), Some(IpAddr::V4(gw))) => {
            let message = RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                .destination_prefix(dst.ip(), dst.prefix())
                .gateway(gw)
                .build();
            handle.route().add(message).execute().await?;
        }
        (IpNetwork::V4(dst), None) => {
            let message = RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                .destination_prefix(dst.ip(), dst.prefix())
                .build();
            handle.route().add(message).execute().await?;
        }
        (IpNetwork::V6(dst), _) => {
            warn!("skipping IPv6 route to {dst}: not supported");
        }
        (dst, gw) => {
            warn!("skipping route to {dst:?} via {gw:?}: address family mismatch");
        }
    }
    Ok(())
}

/// Runs an async netlink closure on a dedicated thread joined to the
/// given network namespace. The thread is discarded afterwards, so the
/// caller's namespace is never disturbed.
fn with_netns<T, F>(netns: &Path, f: F) -> Result<T, InterfaceError>
where
    T: Send + 'static,
    F: FnOnce(Handle) -> BoxFuture<'static, Result<T, InterfaceError>> + Send + 'static,
{
    let ns_file = File::open(netns)?;
    let worker = std::thread::spawn(move || -> Result<T, InterfaceError> {
        setns(ns_file.as_fd(), CloneFlags::CLONE_NEWNET)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()?;
        runtime.block_on(async move {
            let (connection, handle, _) = rtnetlink::new_connection()?;
            tokio::spawn(connection);
            f(handle).await
        })
    });
    worker.join().map_err(|_| InterfaceError::NamespaceTask)?
}

async fn link_by_name(handle: &Handle, name: &str) -> Result<Option<LinkMessage>, InterfaceError> {
    let mut links = handle.link().get().match_name(name.to_owned()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_not_found(err: &rtnetlink::Error) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(e) if e.raw_code() == -nix::libc::ENODEV)
}

fn link_mac(link: &LinkMessage) -> Option<MacAddr6> {
    link.attributes.iter().find_map(|attribute| {
        if let LinkAttribute::Address(bytes) = attribute {
            let octets: [u8; 6] = bytes.as_slice().try_into().ok()?;
            Some(MacAddr6::from(octets))
        } else {
            None
        }
    })
}

fn link_mtu(link: &LinkMessage) -> u32 {
    link.attributes
        .iter()
        .find_map(|attribute| {
            if let LinkAttribute::Mtu(mtu) = attribute {
                Some(*mtu)
            } else {
                None
            }
        })
        .unwrap_or(0)
}

fn link_name(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attribute| {
        if let LinkAttribute::IfName(name) = attribute {
            Some(name.clone())
        } else {
            None
        }
    })
}

fn link_info(link: LinkMessage) -> Option<LinkInfo> {
    Some(LinkInfo {
        name: link_name(&link)?,
        mac: link_mac(&link)?,
        mtu: link_mtu(&link),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_generated_name_is_stable_and_bounded() {
        let first = generate_container_interface_name("nginx-deployment-76bf4969df-p2xyz", "prod");
        let second = generate_container_interface_name("nginx-deployment-76bf4969df-p2xyz", "prod");
        assert_eq!(first, second);
        assert!(first.len() <= IFNAME_MAX_LEN, "{first} exceeds IFNAMSIZ");
        assert!(first.starts_with("nginxd-"));
    }

    #[test]
    fn test_generated_name_distinguishes_pods() {
        let a = generate_container_interface_name("pod", "ns1");
        let b = generate_container_interface_name("pod", "ns2");
        let c = generate_container_interface_name("pod2", "ns1");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn test_generated_name_survives_odd_pod_names() {
        let name = generate_container_interface_name("--..--", "ns");
        assert!(name.starts_with("pod-"));
        assert!(name.len() <= IFNAME_MAX_LEN);

        let short = generate_container_interface_name("a", "ns");
        assert!(short.starts_with("a-"));
    }

    #[test]
    fn test_temporary_name_tracks_hash_suffix() {
        let host = generate_container_interface_name("test-1", "t1");
        let tmp = temporary_container_name(&host);
        assert!(tmp.len() <= IFNAME_MAX_LEN);
        assert_ne!(tmp, host);
        assert!(tmp.starts_with("tmp"));
        assert!(host.ends_with(&tmp[3..]));
    }
}
