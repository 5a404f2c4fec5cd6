//! User-managed Kubernetes resource definitions
//!
//! Definitions are stored under `resource/<kind>/[<namespace>/]<name>`. The
//! storage mod-revision of the latest write is the definition's revision and
//! is stamped on the applied object as an annotation, so a changed revision is
//! the only signal that an object needs to be re-applied.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::{Error, ANNOTATION_IMAGE, ANNOTATION_REVISION};

/// The closed set of supported resource kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// v1 Namespace
    Namespace,
    /// v1 ServiceAccount
    ServiceAccount,
    /// policy/v1beta1 PodSecurityPolicy
    PodSecurityPolicy,
    /// networking.k8s.io/v1 NetworkPolicy
    NetworkPolicy,
    /// rbac.authorization.k8s.io/v1 ClusterRole
    ClusterRole,
    /// rbac.authorization.k8s.io/v1 Role
    Role,
    /// rbac.authorization.k8s.io/v1 ClusterRoleBinding
    ClusterRoleBinding,
    /// rbac.authorization.k8s.io/v1 RoleBinding
    RoleBinding,
    /// v1 ConfigMap
    ConfigMap,
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// batch/v1 CronJob
    CronJob,
    /// v1 Service
    Service,
}

impl ResourceKind {
    /// Every supported kind, in creation order
    pub const ALL: [ResourceKind; 13] = [
        Self::Namespace,
        Self::ServiceAccount,
        Self::PodSecurityPolicy,
        Self::NetworkPolicy,
        Self::ClusterRole,
        Self::Role,
        Self::ClusterRoleBinding,
        Self::RoleBinding,
        Self::ConfigMap,
        Self::Deployment,
        Self::DaemonSet,
        Self::CronJob,
        Self::Service,
    ];

    /// Creation precedence; lower values are created first
    pub fn order(&self) -> u32 {
        match self {
            Self::Namespace => 10,
            Self::ServiceAccount => 20,
            Self::PodSecurityPolicy => 30,
            Self::NetworkPolicy => 40,
            Self::ClusterRole => 50,
            Self::Role => 60,
            Self::ClusterRoleBinding => 70,
            Self::RoleBinding => 80,
            Self::ConfigMap => 90,
            Self::Deployment => 100,
            Self::DaemonSet => 110,
            Self::CronJob => 120,
            Self::Service => 130,
        }
    }

    /// Kind name as written in manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::ServiceAccount => "ServiceAccount",
            Self::PodSecurityPolicy => "PodSecurityPolicy",
            Self::NetworkPolicy => "NetworkPolicy",
            Self::ClusterRole => "ClusterRole",
            Self::Role => "Role",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::RoleBinding => "RoleBinding",
            Self::ConfigMap => "ConfigMap",
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::CronJob => "CronJob",
            Self::Service => "Service",
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            Self::Namespace | Self::PodSecurityPolicy | Self::ClusterRole | Self::ClusterRoleBinding
        )
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::decode(s, "unsupported resource kind"))
    }
}

/// Build the storage key for a resource
pub fn resource_key(kind: ResourceKind, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if kind.is_namespaced() => format!("{kind}/{ns}/{name}"),
        _ => format!("{kind}/{name}"),
    }
}

/// A stored resource definition
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDefinition {
    /// `kind/[namespace/]name`
    pub key: String,
    /// Kind parsed from the key
    pub kind: ResourceKind,
    /// Namespace for namespaced kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
    /// Storage mod-revision of the latest write
    pub revision: i64,
    /// Image hint taken from the definition's own annotations
    pub image: Option<String>,
    /// Raw manifest (JSON or YAML)
    pub definition: Vec<u8>,
}

#[derive(Deserialize, Default)]
struct ManifestHead {
    #[serde(default)]
    metadata: ManifestMeta,
}

#[derive(Deserialize, Default)]
struct ManifestMeta {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl ResourceDefinition {
    /// Parse a `kind/[namespace/]name` key into its parts
    pub fn parse_key(key: &str) -> Result<(ResourceKind, Option<String>, String), Error> {
        let parts: Vec<&str> = key.split('/').collect();
        let kind: ResourceKind = parts
            .first()
            .ok_or_else(|| Error::decode(key, "empty resource key"))?
            .parse()?;
        match (kind.is_namespaced(), parts.as_slice()) {
            (true, [_, ns, name]) if !ns.is_empty() && !name.is_empty() => {
                Ok((kind, Some(ns.to_string()), name.to_string()))
            }
            (false, [_, name]) if !name.is_empty() => Ok((kind, None, name.to_string())),
            _ => Err(Error::decode(
                kind.as_str(),
                format!("malformed resource key {key:?}"),
            )),
        }
    }

    /// Build a definition from a stored key/value pair
    pub fn from_stored(key: &str, definition: Vec<u8>, revision: i64) -> Result<Self, Error> {
        let (kind, namespace, name) = Self::parse_key(key)?;
        let image = serde_yaml::from_slice::<ManifestHead>(&definition)
            .ok()
            .and_then(|head| head.metadata.annotations.get(ANNOTATION_IMAGE).cloned());
        Ok(Self {
            key: key.to_string(),
            kind,
            namespace,
            name,
            revision,
            image,
            definition,
        })
    }

    /// Whether an existing object carrying `annotations` must be re-applied
    ///
    /// A missing object should be passed as `None` and always needs applying.
    pub fn need_update(&self, annotations: Option<&BTreeMap<String, String>>) -> bool {
        let Some(annotations) = annotations else {
            return true;
        };
        let Some(current) = annotations.get(ANNOTATION_REVISION) else {
            return true;
        };
        if current.parse::<i64>().ok() != Some(self.revision) {
            return true;
        }
        match &self.image {
            Some(image) => annotations.get(ANNOTATION_IMAGE) != Some(image),
            None => false,
        }
    }

    fn sort_key(&self) -> (u32, &str, &str) {
        (
            self.kind.order(),
            self.namespace.as_deref().unwrap_or(""),
            self.name.as_str(),
        )
    }
}

/// Order definitions so that dependencies are created first
///
/// Sorts by kind precedence, then namespace, then name.
pub fn sort_resources(resources: &mut [ResourceDefinition]) {
    resources.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(key: &str, revision: i64) -> ResourceDefinition {
        ResourceDefinition::from_stored(key, b"{}".to_vec(), revision).unwrap()
    }

    #[test]
    fn keys_parse_by_scope() {
        let (kind, ns, name) = ResourceDefinition::parse_key("Deployment/kube-system/coredns").unwrap();
        assert_eq!(kind, ResourceKind::Deployment);
        assert_eq!(ns.as_deref(), Some("kube-system"));
        assert_eq!(name, "coredns");

        let (kind, ns, name) = ResourceDefinition::parse_key("ClusterRole/system:psp").unwrap();
        assert_eq!(kind, ResourceKind::ClusterRole);
        assert_eq!(ns, None);
        assert_eq!(name, "system:psp");

        assert!(ResourceDefinition::parse_key("Deployment/coredns").is_err());
        assert!(ResourceDefinition::parse_key("Namespace/a/b").is_err());
        assert!(ResourceDefinition::parse_key("Ingress/default/web").is_err());
    }

    #[test]
    fn sort_orders_by_kind_first() {
        let mut defs = vec![
            def("Service/default/web", 3),
            def("Namespace/apps", 5),
            def("ClusterRoleBinding/admin", 4),
        ];
        sort_resources(&mut defs);
        let kinds: Vec<_> = defs.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Namespace,
                ResourceKind::ClusterRoleBinding,
                ResourceKind::Service
            ]
        );
    }

    #[test]
    fn sort_is_idempotent_and_breaks_ties_by_namespace_then_name() {
        let mut defs = vec![
            def("ConfigMap/b/x", 1),
            def("ConfigMap/a/z", 1),
            def("ConfigMap/a/y", 1),
            def("Namespace/b", 1),
            def("Namespace/a", 1),
        ];
        sort_resources(&mut defs);
        let keys: Vec<_> = defs.iter().map(|d| d.key.clone()).collect();
        assert_eq!(
            keys,
            vec!["Namespace/a", "Namespace/b", "ConfigMap/a/y", "ConfigMap/a/z", "ConfigMap/b/x"]
        );
        let mut again = defs.clone();
        sort_resources(&mut again);
        assert_eq!(again, defs);
    }

    #[test]
    fn every_kind_has_a_distinct_order() {
        let mut orders: Vec<u32> = ResourceKind::ALL.iter().map(|k| k.order()).collect();
        let sorted = orders.clone();
        orders.sort();
        orders.dedup();
        assert_eq!(orders, sorted);
    }

    #[test]
    fn need_update_follows_revision_annotation() {
        let d = def("ConfigMap/default/settings", 42);
        assert!(d.need_update(None));

        let mut annotations = BTreeMap::new();
        assert!(d.need_update(Some(&annotations)));

        annotations.insert(ANNOTATION_REVISION.to_string(), "41".to_string());
        assert!(d.need_update(Some(&annotations)));

        annotations.insert(ANNOTATION_REVISION.to_string(), "42".to_string());
        assert!(!d.need_update(Some(&annotations)));
    }

    #[test]
    fn need_update_compares_image_hint() {
        let manifest = br#"{"metadata":{"name":"dns","namespace":"kube-system","annotations":{"kestrel.io/image":"coredns:1.11"}}}"#;
        let d = ResourceDefinition::from_stored("Deployment/kube-system/dns", manifest.to_vec(), 9)
            .unwrap();
        assert_eq!(d.image.as_deref(), Some("coredns:1.11"));

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_REVISION.to_string(), "9".to_string());
        assert!(d.need_update(Some(&annotations)));

        annotations.insert(ANNOTATION_IMAGE.to_string(), "coredns:1.10".to_string());
        assert!(d.need_update(Some(&annotations)));

        annotations.insert(ANNOTATION_IMAGE.to_string(), "coredns:1.11".to_string());
        assert!(!d.need_update(Some(&annotations)));
    }

    #[test]
    fn keys_are_built_by_scope() {
        assert_eq!(
            resource_key(ResourceKind::Role, Some("ns"), "reader"),
            "Role/ns/reader"
        );
        assert_eq!(
            resource_key(ResourceKind::Namespace, Some("ignored"), "apps"),
            "Namespace/apps"
        );
    }
}
