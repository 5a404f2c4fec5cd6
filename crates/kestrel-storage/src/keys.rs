//! Key layout below the storage prefix

/// JSON cluster definition
pub const CLUSTER: &str = "cluster";
/// Decimal counter bumped on every cluster write
pub const CLUSTER_REVISION: &str = "cluster-revision";
/// JSON constraints
pub const CONSTRAINTS: &str = "constraints";
/// Layout version of stored configuration
pub const CONFIG_VERSION: &str = "config-version";
/// Marker written once etcd bootstrap finished
pub const ETCD_BOOTSTRAPPED: &str = "etcd-bootstrapped";
/// PEM root certificates, `ca/<name>`
pub const CA_PREFIX: &str = "ca/";
/// JSON secrets backend settings
pub const VAULT: &str = "vault";
/// Ephemeral leader keys, `leader/<id>`
pub const LEADER_PREFIX: &str = "leader/";
/// Next record ID counter
pub const RECORDS: &str = "records";
/// Record entries, `records/<16 hex digits>`
pub const RECORD_PREFIX: &str = "records/";
/// User resource definitions, `resource/<kind>/[<namespace>/]<name>`
pub const RESOURCE_PREFIX: &str = "resource/";
/// PEM service-account signing certificate
pub const SERVICE_ACCOUNT_CERT: &str = "service-account/certificate";
/// PEM service-account signing key
pub const SERVICE_ACCOUNT_KEY: &str = "service-account/key";
/// Machine inventory service URL
pub const INVENTORY_URL: &str = "inventory/url";
/// Cluster template used with the inventory
pub const INVENTORY_TEMPLATE: &str = "inventory/template";
/// Inventory integration switch
pub const INVENTORY_DISABLED: &str = "inventory/disabled";

/// Relative key of a record
pub fn record(id: i64) -> String {
    format!("{RECORD_PREFIX}{id:016x}")
}

/// Relative key of a CA certificate
pub fn ca(name: &str) -> String {
    format!("{CA_PREFIX}{name}")
}

/// Relative key of a resource definition
pub fn resource(key: &str) -> String {
    format!("{RESOURCE_PREFIX}{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_keys_sort_numerically() {
        let mut keys: Vec<String> = [255, 9, 4096, 10].iter().map(|id| record(*id)).collect();
        keys.sort();
        assert_eq!(keys[0], "records/0000000000000009");
        assert_eq!(keys[3], "records/0000000000001000");
    }
}
