//! Commanders acting through the Kubernetes API

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node as KubeNode;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use serde_json::json;
use tracing::{info, warn};

use kestrel_common::{
    Command, Node, ResourceDefinition, Result, Taint, TaintEffect, ANNOTATION_MANAGED_TAINTS,
};
use kestrel_infra::Infrastructure;

use crate::operator::Commander;
use crate::probe::kube_node_status;

/// Taint key put on control plane nodes when the cluster asks for it
pub const CONTROL_PLANE_TAINT: &str = "node-role.kubernetes.io/control-plane";

/// Label identifying control plane nodes
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Taints under these prefixes belong to Kubernetes controllers
const SYSTEM_TAINT_PREFIXES: [&str; 2] = ["node.kubernetes.io/", "node.cloudprovider.kubernetes.io/"];

fn is_system_taint(key: &str) -> bool {
    SYSTEM_TAINT_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Labels a node object should carry
pub fn desired_labels(node: &Node) -> BTreeMap<String, String> {
    let mut labels = node.labels.clone();
    if node.control_plane {
        labels.insert(CONTROL_PLANE_LABEL.to_string(), String::new());
    }
    labels
}

/// Taints a node object should carry
pub fn desired_taints(node: &Node, taint_control_plane: bool) -> Vec<Taint> {
    let mut taints: Vec<Taint> = node
        .taints
        .iter()
        .filter(|t| !is_system_taint(&t.key))
        .cloned()
        .collect();
    if node.control_plane && taint_control_plane && !taints.iter().any(|t| t.key == CONTROL_PLANE_TAINT) {
        taints.push(Taint {
            key: CONTROL_PLANE_TAINT.to_string(),
            value: String::new(),
            effect: TaintEffect::NoSchedule,
        });
    }
    taints
}

/// Annotations a node object should carry, including the owned taint keys
pub fn desired_annotations(node: &Node, taint_control_plane: bool) -> BTreeMap<String, String> {
    let keys: BTreeSet<String> = desired_taints(node, taint_control_plane)
        .into_iter()
        .map(|t| t.key)
        .collect();
    let mut annotations = node.annotations.clone();
    annotations.insert(
        ANNOTATION_MANAGED_TAINTS.to_string(),
        keys.into_iter().collect::<Vec<_>>().join(","),
    );
    annotations
}

/// Taint keys kestrel may add or remove on a node object
///
/// Covers the desired keys, the control plane taint and every key recorded
/// by an earlier update. System taints are never owned.
pub fn managed_taint_keys(desired: &[Taint], annotations: &BTreeMap<String, String>) -> BTreeSet<String> {
    let recorded = annotations
        .get(ANNOTATION_MANAGED_TAINTS)
        .map(|v| v.split(',').filter(|k| !k.is_empty()).map(str::to_string).collect::<Vec<_>>())
        .unwrap_or_default();
    desired
        .iter()
        .map(|t| t.key.clone())
        .chain(recorded)
        .chain([CONTROL_PLANE_TAINT.to_string()])
        .filter(|k| !is_system_taint(k))
        .collect()
}

/// Live taints with every managed one replaced by the desired set
pub fn merge_taints(live: &[Taint], desired: &[Taint], managed: &BTreeSet<String>) -> Vec<Taint> {
    live.iter()
        .filter(|t| !managed.contains(&t.key))
        .chain(desired.iter())
        .cloned()
        .collect()
}

/// Merge labels and annotations into a Node object and reconcile the
/// taints kestrel owns, leaving foreign taints in place
#[derive(Debug)]
pub struct UpdateKubeNode {
    /// Desired node
    pub node: Node,
    /// Whether control plane nodes get the NoSchedule taint
    pub taint_control_plane: bool,
}

impl UpdateKubeNode {
    /// Merge patch against the live taints and annotations
    ///
    /// The resource version makes the patch fail if a controller changed the
    /// node in between, so its taints are never lost.
    fn patch(
        &self,
        live_taints: &[Taint],
        live_annotations: &BTreeMap<String, String>,
        resource_version: Option<&str>,
    ) -> serde_json::Value {
        let desired = desired_taints(&self.node, self.taint_control_plane);
        let managed = managed_taint_keys(&desired, live_annotations);
        let taints: Vec<serde_json::Value> = merge_taints(live_taints, &desired, &managed)
            .iter()
            .map(|t| {
                let mut taint = json!({ "key": t.key, "effect": t.effect.to_string() });
                if !t.value.is_empty() {
                    taint["value"] = json!(t.value);
                }
                taint
            })
            .collect();
        let mut patch = json!({
            "metadata": {
                "labels": desired_labels(&self.node),
                "annotations": desired_annotations(&self.node, self.taint_control_plane),
            },
            "spec": { "taints": taints },
        });
        if let Some(version) = resource_version {
            patch["metadata"]["resourceVersion"] = json!(version);
        }
        patch
    }
}

#[async_trait]
impl Commander for UpdateKubeNode {
    fn command(&self) -> Command {
        Command::new("kube-node-update", self.node.nodename())
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let api: Api<KubeNode> = Api::all(infra.kube_client().await?);
        let live = api.get(self.node.nodename()).await?;
        let current = kube_node_status(&live);
        let patch = self.patch(
            &current.taints,
            &current.annotations,
            live.metadata.resource_version.as_deref(),
        );
        api.patch(self.node.nodename(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(node = %self.node.nodename(), "kubernetes node updated");
        Ok(())
    }
}

/// Delete a Node object that no longer belongs to the cluster
#[derive(Debug)]
pub struct RemoveKubeNode {
    /// Node object name
    pub name: String,
}

#[async_trait]
impl Commander for RemoveKubeNode {
    fn command(&self) -> Command {
        Command::new("kube-node-remove", &self.name)
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let api: Api<KubeNode> = Api::all(infra.kube_client().await?);
        match api.delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => {
                warn!(node = %self.name, "kubernetes node removed");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Create or update one user resource
#[derive(Debug)]
pub struct ApplyResource {
    /// Stored definition
    pub definition: ResourceDefinition,
}

#[async_trait]
impl Commander for ApplyResource {
    fn command(&self) -> Command {
        Command::new("resource-apply", &self.definition.key)
            .with_detail(self.definition.revision.to_string())
    }

    async fn run(&self, infra: &Infrastructure) -> Result<()> {
        let client = infra.kube_client().await?;
        kestrel_resource::apply(&client, &self.definition).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::node;

    #[test]
    fn control_plane_taint_is_added_once() {
        let mut cp = node("10.0.0.1", true);
        assert!(desired_taints(&cp, false).is_empty());
        assert_eq!(desired_taints(&cp, true).len(), 1);

        cp.taints.push(Taint {
            key: CONTROL_PLANE_TAINT.to_string(),
            value: String::new(),
            effect: TaintEffect::NoExecute,
        });
        let taints = desired_taints(&cp, true);
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].effect, TaintEffect::NoExecute);

        assert!(desired_taints(&node("10.0.0.4", false), true).is_empty());
    }

    fn taint(key: &str, effect: TaintEffect) -> Taint {
        Taint {
            key: key.to_string(),
            value: String::new(),
            effect,
        }
    }

    #[test]
    fn patch_carries_labels_annotations_and_taints() {
        let mut n = node("10.0.0.4", false);
        n.labels.insert("zone".to_string(), "a".to_string());
        n.annotations.insert("owner".to_string(), "ops".to_string());
        n.taints.push(Taint {
            key: "gpu".to_string(),
            value: "true".to_string(),
            effect: TaintEffect::PreferNoSchedule,
        });
        let patch = UpdateKubeNode {
            node: n,
            taint_control_plane: true,
        }
        .patch(&[], &BTreeMap::new(), Some("42"));

        assert_eq!(patch["metadata"]["labels"]["zone"], "a");
        assert_eq!(patch["metadata"]["annotations"]["owner"], "ops");
        assert_eq!(patch["metadata"]["annotations"][ANNOTATION_MANAGED_TAINTS], "gpu");
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(
            patch["spec"]["taints"],
            json!([{ "key": "gpu", "value": "true", "effect": "PreferNoSchedule" }])
        );
    }

    #[test]
    fn patch_keeps_system_taints_and_drops_released_ones() {
        let update = UpdateKubeNode {
            node: node("10.0.0.1", true),
            taint_control_plane: false,
        };
        let live = vec![
            taint("node.kubernetes.io/not-ready", TaintEffect::NoSchedule),
            taint("dedicated", TaintEffect::NoSchedule),
            taint("team", TaintEffect::NoExecute),
            taint(CONTROL_PLANE_TAINT, TaintEffect::NoSchedule),
        ];
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_MANAGED_TAINTS.to_string(), "dedicated".to_string());

        let patch = update.patch(&live, &annotations, None);
        assert_eq!(
            patch["spec"]["taints"],
            json!([
                { "key": "node.kubernetes.io/not-ready", "effect": "NoSchedule" },
                { "key": "team", "effect": "NoExecute" },
            ])
        );
        assert_eq!(patch["metadata"]["annotations"][ANNOTATION_MANAGED_TAINTS], "");
        assert!(patch["metadata"].get("resourceVersion").is_none());
    }

    #[test]
    fn system_taints_are_never_managed() {
        let mut n = node("10.0.0.4", false);
        n.taints.push(taint("node.kubernetes.io/unreachable", TaintEffect::NoExecute));
        assert!(desired_taints(&n, true).is_empty());

        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_MANAGED_TAINTS.to_string(),
            "node.cloudprovider.kubernetes.io/uninitialized,gpu".to_string(),
        );
        let managed = managed_taint_keys(&[], &annotations);
        assert_eq!(
            managed.into_iter().collect::<Vec<_>>(),
            vec!["gpu".to_string(), CONTROL_PLANE_TAINT.to_string()]
        );
    }

    #[test]
    fn control_plane_nodes_get_the_role_label() {
        let labels = desired_labels(&node("10.0.0.1", true));
        assert_eq!(labels.get(CONTROL_PLANE_LABEL).map(String::as_str), Some(""));
        assert!(desired_labels(&node("10.0.0.4", false)).is_empty());
    }
}
