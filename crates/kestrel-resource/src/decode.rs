//! Decoding stored manifests into typed objects

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde_json::Value;

use kestrel_common::{
    Error, ResourceDefinition, ResourceKind, Result, ANNOTATION_IMAGE, ANNOTATION_REVISION,
};

/// A decoded resource, one variant per supported kind
///
/// PodSecurityPolicy is no longer part of the typed API bindings and is
/// carried as a dynamic object.
#[derive(Clone, Debug)]
pub enum KubeResource {
    /// v1 Namespace
    Namespace(Namespace),
    /// v1 ServiceAccount
    ServiceAccount(ServiceAccount),
    /// policy/v1beta1 PodSecurityPolicy
    PodSecurityPolicy(DynamicObject),
    /// networking.k8s.io/v1 NetworkPolicy
    NetworkPolicy(NetworkPolicy),
    /// rbac.authorization.k8s.io/v1 ClusterRole
    ClusterRole(ClusterRole),
    /// rbac.authorization.k8s.io/v1 Role
    Role(Role),
    /// rbac.authorization.k8s.io/v1 ClusterRoleBinding
    ClusterRoleBinding(ClusterRoleBinding),
    /// rbac.authorization.k8s.io/v1 RoleBinding
    RoleBinding(RoleBinding),
    /// v1 ConfigMap
    ConfigMap(ConfigMap),
    /// apps/v1 Deployment
    Deployment(Deployment),
    /// apps/v1 DaemonSet
    DaemonSet(DaemonSet),
    /// batch/v1 CronJob
    CronJob(CronJob),
    /// v1 Service
    Service(Service),
}

/// Evaluate `$body` with `$obj` bound to the variant's payload
macro_rules! with_object {
    ($resource:expr, $obj:ident => $body:expr) => {
        match $resource {
            KubeResource::Namespace($obj) => $body,
            KubeResource::ServiceAccount($obj) => $body,
            KubeResource::PodSecurityPolicy($obj) => $body,
            KubeResource::NetworkPolicy($obj) => $body,
            KubeResource::ClusterRole($obj) => $body,
            KubeResource::Role($obj) => $body,
            KubeResource::ClusterRoleBinding($obj) => $body,
            KubeResource::RoleBinding($obj) => $body,
            KubeResource::ConfigMap($obj) => $body,
            KubeResource::Deployment($obj) => $body,
            KubeResource::DaemonSet($obj) => $body,
            KubeResource::CronJob($obj) => $body,
            KubeResource::Service($obj) => $body,
        }
    };
}

impl KubeResource {
    /// Kind of the payload
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Namespace(_) => ResourceKind::Namespace,
            Self::ServiceAccount(_) => ResourceKind::ServiceAccount,
            Self::PodSecurityPolicy(_) => ResourceKind::PodSecurityPolicy,
            Self::NetworkPolicy(_) => ResourceKind::NetworkPolicy,
            Self::ClusterRole(_) => ResourceKind::ClusterRole,
            Self::Role(_) => ResourceKind::Role,
            Self::ClusterRoleBinding(_) => ResourceKind::ClusterRoleBinding,
            Self::RoleBinding(_) => ResourceKind::RoleBinding,
            Self::ConfigMap(_) => ResourceKind::ConfigMap,
            Self::Deployment(_) => ResourceKind::Deployment,
            Self::DaemonSet(_) => ResourceKind::DaemonSet,
            Self::CronJob(_) => ResourceKind::CronJob,
            Self::Service(_) => ResourceKind::Service,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        with_object!(self, obj => &obj.metadata)
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        with_object!(self, obj => &mut obj.metadata)
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace, for namespaced kinds
    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    /// Record the definition's revision (and image hint) on the object
    pub fn stamp(&mut self, definition: &ResourceDefinition) {
        let annotations = self.meta_mut().annotations.get_or_insert_with(Default::default);
        annotations.insert(
            ANNOTATION_REVISION.to_string(),
            definition.revision.to_string(),
        );
        if let Some(image) = &definition.image {
            annotations.insert(ANNOTATION_IMAGE.to_string(), image.clone());
        }
    }
}

fn typed<T: DeserializeOwned>(kind: ResourceKind, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::decode(kind.as_str(), e.to_string()))
}

/// Decode a stored definition into its typed object
///
/// The manifest's kind, name and namespace must agree with the storage key.
/// A namespaced object without a namespace gets the one from the key.
pub fn decode(definition: &ResourceDefinition) -> Result<KubeResource> {
    let kind = definition.kind;
    let value: Value = serde_yaml::from_slice(&definition.definition)
        .map_err(|e| Error::decode(kind.as_str(), format!("invalid manifest: {e}")))?;

    let manifest_kind: ResourceKind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::decode(kind.as_str(), "manifest has no kind"))?
        .parse()?;
    if manifest_kind != kind {
        return Err(Error::decode(
            manifest_kind.as_str(),
            format!("manifest kind does not match key {}", definition.key),
        ));
    }

    let name = value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if name != definition.name {
        return Err(Error::decode(
            kind.as_str(),
            format!("manifest name {name:?} does not match key {}", definition.key),
        ));
    }
    if let Some(ns) = value.pointer("/metadata/namespace").and_then(Value::as_str) {
        if kind.is_namespaced() && Some(ns) != definition.namespace.as_deref() {
            return Err(Error::decode(
                kind.as_str(),
                format!("manifest namespace {ns:?} does not match key {}", definition.key),
            ));
        }
    }

    let mut resource = match kind {
        ResourceKind::Namespace => KubeResource::Namespace(typed(kind, value)?),
        ResourceKind::ServiceAccount => KubeResource::ServiceAccount(typed(kind, value)?),
        ResourceKind::PodSecurityPolicy => KubeResource::PodSecurityPolicy(typed(kind, value)?),
        ResourceKind::NetworkPolicy => KubeResource::NetworkPolicy(typed(kind, value)?),
        ResourceKind::ClusterRole => KubeResource::ClusterRole(typed(kind, value)?),
        ResourceKind::Role => KubeResource::Role(typed(kind, value)?),
        ResourceKind::ClusterRoleBinding => KubeResource::ClusterRoleBinding(typed(kind, value)?),
        ResourceKind::RoleBinding => KubeResource::RoleBinding(typed(kind, value)?),
        ResourceKind::ConfigMap => KubeResource::ConfigMap(typed(kind, value)?),
        ResourceKind::Deployment => KubeResource::Deployment(typed(kind, value)?),
        ResourceKind::DaemonSet => KubeResource::DaemonSet(typed(kind, value)?),
        ResourceKind::CronJob => KubeResource::CronJob(typed(kind, value)?),
        ResourceKind::Service => KubeResource::Service(typed(kind, value)?),
    };

    if kind.is_namespaced() {
        resource.meta_mut().namespace = definition.namespace.clone();
    } else {
        resource.meta_mut().namespace = None;
    }
    Ok(resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(key: &str, manifest: &str, revision: i64) -> ResourceDefinition {
        ResourceDefinition::from_stored(key, manifest.as_bytes().to_vec(), revision).unwrap()
    }

    #[test]
    fn decodes_yaml_deployment() {
        let def = definition(
            "Deployment/kube-system/coredns",
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: coredns
  namespace: kube-system
spec:
  selector:
    matchLabels:
      app: coredns
  template:
    metadata:
      labels:
        app: coredns
    spec:
      containers:
        - name: coredns
          image: coredns/coredns:1.11.1
"#,
            12,
        );
        let resource = decode(&def).unwrap();
        assert_eq!(resource.kind(), ResourceKind::Deployment);
        assert_eq!(resource.name(), "coredns");
        assert_eq!(resource.namespace(), Some("kube-system"));
        let KubeResource::Deployment(deployment) = resource else {
            panic!("expected a Deployment");
        };
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("coredns/coredns:1.11.1"));
    }

    #[test]
    fn fills_namespace_from_key() {
        let def = definition(
            "ConfigMap/apps/settings",
            r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"settings"},"data":{"a":"b"}}"#,
            3,
        );
        let resource = decode(&def).unwrap();
        assert_eq!(resource.namespace(), Some("apps"));
    }

    #[test]
    fn pod_security_policy_is_dynamic() {
        let def = definition(
            "PodSecurityPolicy/restricted",
            r#"{"apiVersion":"policy/v1beta1","kind":"PodSecurityPolicy","metadata":{"name":"restricted"},"spec":{"privileged":false}}"#,
            1,
        );
        let resource = decode(&def).unwrap();
        let KubeResource::PodSecurityPolicy(psp) = resource else {
            panic!("expected a PodSecurityPolicy");
        };
        assert_eq!(psp.data["spec"]["privileged"], Value::Bool(false));
    }

    #[test]
    fn unsupported_kind_is_a_decode_error() {
        let def = definition(
            "ConfigMap/default/web",
            r#"{"apiVersion":"networking.k8s.io/v1","kind":"Ingress","metadata":{"name":"web"}}"#,
            1,
        );
        let err = decode(&def).unwrap_err();
        assert!(matches!(err, Error::Decode { ref kind, .. } if kind == "Ingress"));
    }

    #[test]
    fn mismatched_identity_is_rejected() {
        let wrong_kind = definition(
            "ConfigMap/default/web",
            r#"{"apiVersion":"v1","kind":"Service","metadata":{"name":"web"}}"#,
            1,
        );
        assert!(decode(&wrong_kind).is_err());

        let wrong_name = definition(
            "ConfigMap/default/web",
            r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"api"}}"#,
            1,
        );
        assert!(decode(&wrong_name).is_err());

        let wrong_ns = definition(
            "ConfigMap/default/web",
            r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"web","namespace":"other"}}"#,
            1,
        );
        assert!(decode(&wrong_ns).is_err());
    }

    #[test]
    fn stamp_sets_revision_and_image() {
        let def = definition(
            "Namespace/apps",
            r#"{"apiVersion":"v1","kind":"Namespace","metadata":{"name":"apps","annotations":{"kestrel.io/image":"busybox:1.36","owner":"ops"}}}"#,
            77,
        );
        let mut resource = decode(&def).unwrap();
        resource.stamp(&def);

        let annotations = resource.meta().annotations.clone().unwrap();
        assert_eq!(annotations[ANNOTATION_REVISION], "77");
        assert_eq!(annotations[ANNOTATION_IMAGE], "busybox:1.36");
        assert_eq!(annotations["owner"], "ops");
        assert!(!def.need_update(Some(&annotations)));
    }
}
