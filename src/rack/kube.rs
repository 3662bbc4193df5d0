// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{
    node::{NodeName, RackName},
    syscall::{Invocation, SyscallError},
};

use serde::Deserialize;
use std::{collections::BTreeMap, future::Future, time::Duration};
use tracing::{debug, instrument};

/// Node as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Parsed node name, domain suffix stripped.
    pub name: NodeName,

    /// Value of the `Ready` condition, [`None`] if unknown or absent.
    pub ready: Option<bool>,

    pub labels: BTreeMap<String, String>,

    /// Node is cordoned.
    pub unschedulable: bool,

    /// Keys of all taints on the node.
    pub taints: Vec<String>,
}

/// Read-only view of cluster node state.
pub trait ClusterSource: Send + Sync {
    /// List every node the cluster knows inside target rack.
    fn rack_nodes(&self, rack: RackName) -> impl Future<Output = Result<Vec<NodeRecord>>> + Send;
}

/// Query node state through `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlSource {
    context: Option<String>,
    timeout: Duration,
}

impl KubectlSource {
    /// Construct new kubectl source.
    ///
    /// Without a context, the current context of kubeconfig is used.
    pub fn new(context: Option<String>, timeout: Duration) -> Self {
        Self { context, timeout }
    }

    pub(crate) fn invocation(&self) -> Invocation {
        let mut call = Invocation::new("kubectl").timeout(self.timeout);
        if let Some(context) = &self.context {
            call = call.arg("--context").arg(context);
        }

        call.args(["get", "nodes", "-o", "json"])
    }
}

impl ClusterSource for KubectlSource {
    #[instrument(skip(self), level = "debug")]
    async fn rack_nodes(&self, rack: RackName) -> Result<Vec<NodeRecord>> {
        let output = self.invocation().run().await?;
        parse_node_list(&output, rack)
    }
}

/// Extract nodes of target rack from `kubectl get nodes -o json` output.
///
/// Nodes whose names do not follow the fleet naming scheme are skipped.
pub(crate) fn parse_node_list(json: &str, rack: RackName) -> Result<Vec<NodeRecord>> {
    let list: NodeList = serde_json::from_str(json)?;
    let mut records = Vec::new();

    for item in list.items {
        let short = item.metadata.name.split('.').next().unwrap_or_default();
        let name = match short.parse::<NodeName>() {
            Ok(name) if name.rack() == rack => name,
            Ok(_) => continue,
            Err(_) => {
                debug!("skip foreign node {:?}", item.metadata.name);
                continue;
            }
        };

        let ready = item
            .status
            .conditions
            .iter()
            .find(|condition| condition.kind == "Ready")
            .and_then(|condition| match condition.status.as_str() {
                "True" => Some(true),
                "False" => Some(false),
                _ => None,
            });

        records.push(NodeRecord {
            name,
            ready,
            labels: item.metadata.labels,
            unschedulable: item.spec.unschedulable,
            taints: item.spec.taints.into_iter().map(|taint| taint.key).collect(),
        });
    }

    records.sort_by_key(|record| record.name);
    Ok(records)
}

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<KubeNode>,
}

#[derive(Debug, Deserialize)]
struct KubeNode {
    metadata: Metadata,

    #[serde(default)]
    spec: Spec,

    #[serde(default)]
    status: Status,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,

    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct Spec {
    #[serde(default)]
    unschedulable: bool,

    #[serde(default)]
    taints: Vec<Taint>,
}

#[derive(Debug, Deserialize)]
struct Taint {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

/// Cluster query error types.
#[derive(Debug, thiserror::Error)]
pub enum ClusterQueryError {
    #[error(transparent)]
    Syscall(#[from] SyscallError),

    #[error("failed to decode node list")]
    Decode(#[from] serde_json::Error),
}

/// Friendly result alias :3
type Result<T, E = ClusterQueryError> = std::result::Result<T, E>;
