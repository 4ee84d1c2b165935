pub mod agent;
pub mod cniserver;
pub mod config;
pub mod interface_store;
pub mod kubernetes;
pub mod netdev;
pub mod openflow;
pub mod ovsdb;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Ovsdb(#[from] ovsdb::OvsdbError),

    #[error(transparent)]
    Interface(#[from] netdev::InterfaceError),

    #[error("openflow error: {0}")]
    OpenFlow(String),

    #[error("transport error: {0}")]
    TonicTransport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("reconciliation failed: {0}")]
    Reconcile(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
