//! The only Kubernetes access this agent needs: the list of pods
//! scheduled to this node, consumed once by the startup reconciler.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, ResourceExt};

use crate::Result;

#[derive(Debug, Clone)]
pub struct NodePod {
    pub name: String,
    pub namespace: String,
    pub host_network: bool,
}

#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list_node_pods(&self) -> Result<Vec<NodePod>>;
}

pub struct KubePodLister {
    client: kube::Client,
    node_name: String,
}

impl KubePodLister {
    pub fn new(client: kube::Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn list_node_pods(&self) -> Result<Vec<NodePod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let list = pods.list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .map(|pod| NodePod {
                name: pod.name_any(),
                namespace: pod.namespace().unwrap_or_default(),
                host_network: pod
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.host_network)
                    .unwrap_or(false),
            })
            .collect())
    }
}
