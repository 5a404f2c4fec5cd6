//! Server-side apply and annotation lookup

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use kestrel_common::{Error, ResourceDefinition, ResourceKind, Result, FIELD_MANAGER};

use crate::decode::{decode, KubeResource};

type Annotations = BTreeMap<String, String>;

fn pod_security_policy() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "policy",
        "v1beta1",
        "PodSecurityPolicy",
    ))
}

async fn patch<K>(api: &Api<K>, obj: &K, params: &PatchParams) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::decode(K::kind(&()), "object has no name"))?;
    api.patch(&name, params, &Patch::Apply(obj)).await?;
    Ok(())
}

async fn apply_cluster<K>(client: &Client, obj: &K, params: &PatchParams) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug,
{
    patch(&Api::<K>::all(client.clone()), obj, params).await
}

async fn apply_namespaced<K>(client: &Client, obj: &K, params: &PatchParams) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug,
{
    let namespace = obj.meta().namespace.as_deref().unwrap_or("default");
    patch(&Api::<K>::namespaced(client.clone(), namespace), obj, params).await
}

/// Decode `definition` and create or update the object with server-side apply
///
/// The applied object carries the definition's revision annotation, and its
/// image annotation when the definition has one.
pub async fn apply(client: &Client, definition: &ResourceDefinition) -> Result<()> {
    let mut resource = decode(definition)?;
    resource.stamp(definition);
    let params = PatchParams::apply(FIELD_MANAGER).force();

    debug!(key = %definition.key, revision = definition.revision, "applying resource");
    match &resource {
        KubeResource::Namespace(o) => apply_cluster(client, o, &params).await,
        KubeResource::ServiceAccount(o) => apply_namespaced(client, o, &params).await,
        KubeResource::PodSecurityPolicy(o) => {
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &pod_security_policy());
            let name = o
                .metadata
                .name
                .clone()
                .ok_or_else(|| Error::decode(ResourceKind::PodSecurityPolicy.as_str(), "object has no name"))?;
            api.patch(&name, &params, &Patch::Apply(o)).await?;
            Ok(())
        }
        KubeResource::NetworkPolicy(o) => apply_namespaced(client, o, &params).await,
        KubeResource::ClusterRole(o) => apply_cluster(client, o, &params).await,
        KubeResource::Role(o) => apply_namespaced(client, o, &params).await,
        KubeResource::ClusterRoleBinding(o) => apply_cluster(client, o, &params).await,
        KubeResource::RoleBinding(o) => apply_namespaced(client, o, &params).await,
        KubeResource::ConfigMap(o) => apply_namespaced(client, o, &params).await,
        KubeResource::Deployment(o) => apply_namespaced(client, o, &params).await,
        KubeResource::DaemonSet(o) => apply_namespaced(client, o, &params).await,
        KubeResource::CronJob(o) => apply_namespaced(client, o, &params).await,
        KubeResource::Service(o) => apply_namespaced(client, o, &params).await,
    }?;

    info!(key = %definition.key, revision = definition.revision, "resource applied");
    Ok(())
}

async fn annotations_of<K>(api: Api<K>, name: &str) -> Result<Option<Annotations>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?.map(|obj| obj.annotations().clone()))
}

async fn cluster_annotations<K>(client: &Client, name: &str) -> Result<Option<Annotations>>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope> + Clone + DeserializeOwned + Debug,
{
    annotations_of(Api::<K>::all(client.clone()), name).await
}

async fn namespaced_annotations<K>(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<Annotations>>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
{
    annotations_of(Api::<K>::namespaced(client.clone(), namespace), name).await
}

/// Annotations of the live object for `definition`; `None` when it does not exist
pub async fn fetch_annotations(
    client: &Client,
    definition: &ResourceDefinition,
) -> Result<Option<Annotations>> {
    let name = definition.name.as_str();
    let ns = definition.namespace.as_deref().unwrap_or("default");
    match definition.kind {
        ResourceKind::Namespace => cluster_annotations::<Namespace>(client, name).await,
        ResourceKind::ServiceAccount => {
            namespaced_annotations::<ServiceAccount>(client, ns, name).await
        }
        ResourceKind::PodSecurityPolicy => {
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &pod_security_policy());
            annotations_of(api, name).await
        }
        ResourceKind::NetworkPolicy => {
            namespaced_annotations::<NetworkPolicy>(client, ns, name).await
        }
        ResourceKind::ClusterRole => cluster_annotations::<ClusterRole>(client, name).await,
        ResourceKind::Role => namespaced_annotations::<Role>(client, ns, name).await,
        ResourceKind::ClusterRoleBinding => {
            cluster_annotations::<ClusterRoleBinding>(client, name).await
        }
        ResourceKind::RoleBinding => namespaced_annotations::<RoleBinding>(client, ns, name).await,
        ResourceKind::ConfigMap => namespaced_annotations::<ConfigMap>(client, ns, name).await,
        ResourceKind::Deployment => namespaced_annotations::<Deployment>(client, ns, name).await,
        ResourceKind::DaemonSet => namespaced_annotations::<DaemonSet>(client, ns, name).await,
        ResourceKind::CronJob => namespaced_annotations::<CronJob>(client, ns, name).await,
        ResourceKind::Service => namespaced_annotations::<Service>(client, ns, name).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_security_policy_resource_is_cluster_wide_policy_group() {
        let ar = pod_security_policy();
        assert_eq!(ar.group, "policy");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.plural, "podsecuritypolicies");
        assert_eq!(ar.api_version, "policy/v1beta1");
    }
}
