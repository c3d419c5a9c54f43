//! Kubernetes client wrapper
//!
//! A thin layer over the kube client exposing exactly the verbs the agent
//! is granted: get, watch, and merge-patch on nodes and nodes/status. The
//! [`NodeApi`] trait is the seam the reconciler is tested through.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams, WatchEvent, WatchParams};
use kube::Client;
use tracing::info;

/// The node operations the reconciler needs. A fake with an in-memory store
/// stands in for the API server in tests.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Merge-patch the node spec. The body carries the full replacement of
    /// the taints array, nothing else.
    async fn patch_spec(&self, name: &str, patch: serde_json::Value) -> Result<()>;

    /// Merge-patch the node status subresource. The body carries the full
    /// replacement of the conditions array, nothing else.
    async fn patch_status(&self, name: &str, patch: serde_json::Value) -> Result<()>;
}

/// Client wrapper over the real API server.
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Infer configuration from the environment: in-cluster service account
    /// when running as a DaemonSet, kubeconfig otherwise.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("create Kubernetes client")?;
        info!("connected to Kubernetes API server");
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Open a watch on the node collection narrowed to a single node name.
    pub async fn watch_node(
        &self,
        name: &str,
    ) -> Result<impl Stream<Item = kube::Result<WatchEvent<Node>>>> {
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        self.nodes()
            .watch(&params, "0")
            .await
            .with_context(|| format!("watch node {name}"))
    }
}

#[async_trait]
impl NodeApi for K8sClient {
    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes()
            .get(name)
            .await
            .with_context(|| format!("get node {name}"))
    }

    async fn patch_spec(&self, name: &str, patch: serde_json::Value) -> Result<()> {
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patch node spec {name}"))?;
        Ok(())
    }

    async fn patch_status(&self, name: &str, patch: serde_json::Value) -> Result<()> {
        self.nodes()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patch node status {name}"))?;
        Ok(())
    }
}
