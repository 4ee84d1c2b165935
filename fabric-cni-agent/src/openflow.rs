//! Per-pod OpenFlow programming.
//!
//! The datapath pipeline itself is a peer of this agent; handlers and
//! the reconciler only need install/uninstall keyed by the host-side
//! interface. Flows carry a cookie derived from the interface name so
//! they can be withdrawn without re-deriving their matches, including
//! after an agent restart.

use std::net::IpAddr;

use async_trait::async_trait;
use macaddr::MacAddr6;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

#[async_trait]
pub trait FlowClient: Send + Sync {
    async fn install_pod_flows(
        &self,
        iface_name: &str,
        ip: IpAddr,
        mac: MacAddr6,
        gateway_mac: MacAddr6,
        ofport: u32,
    ) -> Result<()>;

    async fn uninstall_pod_flows(&self, iface_name: &str) -> Result<()>;
}

/// Programs the bridge through `ovs-ofctl`.
pub struct OvsOfctlClient {
    bridge: String,
}

impl OvsOfctlClient {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
        }
    }

    async fn ovs_ofctl(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("ovs-ofctl")
            .args(["-O", "OpenFlow13"])
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::OpenFlow(format!(
                "ovs-ofctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Stable per-interface cookie tagging every flow owned by that pod.
fn iface_cookie(iface_name: &str) -> u64 {
    let digest = Sha256::digest(iface_name.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is long enough"))
}

#[async_trait]
impl FlowClient for OvsOfctlClient {
    async fn install_pod_flows(
        &self,
        iface_name: &str,
        ip: IpAddr,
        mac: MacAddr6,
        gateway_mac: MacAddr6,
        ofport: u32,
    ) -> Result<()> {
        let cookie = iface_cookie(iface_name);
        let flows = [
            // Spoof guard: traffic entering from the pod must carry its
            // assigned source addresses.
            format!(
                "cookie=0x{cookie:x},priority=200,ip,in_port={ofport},dl_src={mac},nw_src={ip},actions=NORMAL"
            ),
            format!(
                "cookie=0x{cookie:x},priority=200,arp,in_port={ofport},arp_spa={ip},arp_sha={mac},actions=NORMAL"
            ),
            // Routed traffic to the pod: rewrite L2 as the gateway and
            // deliver on the pod's port.
            format!(
                "cookie=0x{cookie:x},priority=200,ip,nw_dst={ip},actions=mod_dl_src:{gateway_mac},mod_dl_dst:{mac},output:{ofport}"
            ),
        ];
        for flow in &flows {
            self.ovs_ofctl(&["add-flow", &self.bridge, flow]).await?;
        }
        debug!("installed {} flows for {iface_name}", flows.len());
        Ok(())
    }

    async fn uninstall_pod_flows(&self, iface_name: &str) -> Result<()> {
        let cookie = iface_cookie(iface_name);
        let matcher = format!("cookie=0x{cookie:x}/-1");
        self.ovs_ofctl(&["del-flows", &self.bridge, &matcher]).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cookie_is_stable_per_interface() {
        assert_eq!(iface_cookie("p1"), iface_cookie("p1"));
        assert_ne!(iface_cookie("p1"), iface_cookie("p2"));
    }
}
