//! IPAM drivers: address management is delegated to an external CNI
//! IPAM executable speaking the standard env + stdin contract. Drivers
//! are looked up by the `ipam.type` field of the network configuration;
//! an unregistered type fails request validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::types::{CniConfig, CniResult};

pub const HOST_LOCAL_IPAM: &str = "host-local";

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct IpamError(pub String);

#[async_trait]
pub trait IpamDriver: Send + Sync {
    async fn add(&self, request: &CniConfig) -> Result<CniResult, IpamError>;
    async fn del(&self, request: &CniConfig) -> Result<(), IpamError>;
    async fn check(&self, request: &CniConfig) -> Result<(), IpamError>;
}

#[derive(Default)]
pub struct IpamRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn IpamDriver>>>,
}

impl IpamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production registry: `host-local` backed by the executable
    /// of the same name in the CNI binary directory.
    pub fn with_defaults(cni_bin_dir: impl Into<PathBuf>) -> Self {
        let registry = Self::new();
        registry.register(
            HOST_LOCAL_IPAM,
            Arc::new(ExecIpamDriver::new(cni_bin_dir)),
        );
        registry
    }

    pub fn register(&self, ipam_type: impl Into<String>, driver: Arc<dyn IpamDriver>) {
        self.drivers
            .write()
            .unwrap()
            .insert(ipam_type.into(), driver);
    }

    pub fn is_valid(&self, ipam_type: &str) -> bool {
        self.drivers.read().unwrap().contains_key(ipam_type)
    }

    pub fn driver(&self, ipam_type: &str) -> Option<Arc<dyn IpamDriver>> {
        self.drivers.read().unwrap().get(ipam_type).cloned()
    }
}

/// Invokes the IPAM plugin binary with the rewritten network
/// configuration on stdin and the request's CNI environment.
pub struct ExecIpamDriver {
    cni_bin_dir: PathBuf,
}

impl ExecIpamDriver {
    pub fn new(cni_bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            cni_bin_dir: cni_bin_dir.into(),
        }
    }

    async fn exec(&self, command: &str, request: &CniConfig) -> Result<Vec<u8>, IpamError> {
        let binary = self.cni_bin_dir.join(&request.network.ipam.r#type);
        debug!(
            "running IPAM {} {command} for container {}",
            binary.display(),
            request.container_id
        );
        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &request.container_id)
            .env("CNI_NETNS", &request.netns)
            .env("CNI_IFNAME", &request.ifname)
            .env("CNI_ARGS", &request.args)
            .env("CNI_PATH", &self.cni_bin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IpamError(format!("failed to run {}: {e}", binary.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request.network_configuration)
                .await
                .map_err(|e| IpamError(format!("failed to feed IPAM stdin: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| IpamError(format!("failed to wait for IPAM: {e}")))?;

        if !output.status.success() {
            return Err(IpamError(ipam_failure_message(&output.stdout, &output.stderr)));
        }
        Ok(output.stdout)
    }
}

/// A failing plugin prints a CNI error document on stdout; fall back to
/// stderr when it did not.
fn ipam_failure_message(stdout: &[u8], stderr: &[u8]) -> String {
    if let Ok(error) = serde_json::from_slice::<serde_json::Value>(stdout) {
        if let Some(msg) = error.get("msg").and_then(serde_json::Value::as_str) {
            return msg.to_owned();
        }
    }
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        "IPAM plugin failed".to_owned()
    } else {
        stderr.to_owned()
    }
}

#[async_trait]
impl IpamDriver for ExecIpamDriver {
    async fn add(&self, request: &CniConfig) -> Result<CniResult, IpamError> {
        let stdout = self.exec("ADD", request).await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| IpamError(format!("unparseable IPAM result: {e}")))
    }

    async fn del(&self, request: &CniConfig) -> Result<(), IpamError> {
        self.exec("DEL", request).await.map(|_| ())
    }

    async fn check(&self, request: &CniConfig) -> Result<(), IpamError> {
        self.exec("CHECK", request).await.map(|_| ())
    }
}
