use crate::host::Host;
use crate::inventory::{ApiClient, ApiEnvelope};
use crate::remote::RemoteExec;
use crate::{CaravanError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Usable placement targets on a host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetResources {
    pub storages: Vec<String>,
    pub bridges: Vec<String>,
}

/// Destination identifier choice for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdTarget {
    Explicit(u32),
    Auto,
}

impl Default for IdTarget {
    fn default() -> Self {
        IdTarget::Auto
    }
}

/// Destination storage pool choice. `KeepSource` means the source pool
/// name passes through the rewrite untouched; it is never substituted
/// with a default behind the user's back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageTarget {
    Explicit(String),
    KeepSource,
}

impl Default for StorageTarget {
    fn default() -> Self {
        StorageTarget::KeepSource
    }
}

/// Destination bridge choice for one network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeTarget {
    Explicit(String),
    Auto,
}

impl Default for BridgeTarget {
    fn default() -> Self {
        BridgeTarget::Auto
    }
}

/// Per-unit migration plan. Built at planning time from inventory plus
/// user input; immutable once the task starts running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitMapping {
    #[serde(default)]
    pub id: IdTarget,
    #[serde(default)]
    pub storage: StorageTarget,
    /// Interface name to bridge choice. Interfaces absent from the map
    /// are treated as `Auto`.
    #[serde(default)]
    pub nics: BTreeMap<String, BridgeTarget>,
}

/// The conventional default bridge, preferred by auto resolution when the
/// target has it.
const DEFAULT_BRIDGE: &str = "vmbr0";

/// Resolved target storage: `Some(pool)` for an explicit choice,
/// `None` for "preserve the source value, let the target decide at
/// import time".
pub fn resolve_storage(
    mapping: &UnitMapping,
    resources: &TargetResources,
) -> Result<Option<String>> {
    match &mapping.storage {
        StorageTarget::KeepSource => Ok(None),
        StorageTarget::Explicit(pool) => {
            if resources.storages.iter().any(|s| s == pool) {
                Ok(Some(pool.clone()))
            } else {
                Err(CaravanError::MappingUnresolved(format!(
                    "storage pool '{}' does not exist on the target",
                    pool
                )))
            }
        }
    }
}

/// Resolved interface-to-bridge bindings for a unit. Fails fast with
/// `NoBridgesAvailable` when the unit has interfaces but the target has
/// no bridges at all, so the problem never surfaces at cutover.
pub fn resolve_network(
    target_host: &str,
    unit_nics: &[String],
    mapping: &UnitMapping,
    resources: &TargetResources,
) -> Result<BTreeMap<String, String>> {
    if unit_nics.is_empty() {
        return Ok(BTreeMap::new());
    }
    if resources.bridges.is_empty() {
        return Err(CaravanError::NoBridgesAvailable(target_host.to_string()));
    }
    let fallback = if resources.bridges.iter().any(|b| b == DEFAULT_BRIDGE) {
        DEFAULT_BRIDGE.to_string()
    } else {
        let mut sorted = resources.bridges.clone();
        sorted.sort();
        sorted[0].clone()
    };

    let mut bindings = BTreeMap::new();
    for nic in unit_nics {
        let bridge = match mapping.nics.get(nic) {
            Some(BridgeTarget::Explicit(bridge)) => {
                if !resources.bridges.iter().any(|b| b == bridge) {
                    return Err(CaravanError::MappingUnresolved(format!(
                        "bridge '{}' for interface '{}' does not exist on the target",
                        bridge, nic
                    )));
                }
                bridge.clone()
            }
            Some(BridgeTarget::Auto) | None => fallback.clone(),
        };
        bindings.insert(nic.clone(), bridge);
    }
    Ok(bindings)
}

#[derive(Deserialize)]
struct ApiStorageRow {
    storage: String,
    #[serde(default)]
    active: Option<u8>,
    #[serde(default)]
    enabled: Option<u8>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiNetworkRow {
    iface: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Computes the usable storage pools and bridges of a target host.
pub struct ResourceMapper {
    api: ApiClient,
}

impl Default for ResourceMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMapper {
    pub fn new() -> Self {
        Self {
            api: ApiClient::new(),
        }
    }

    pub async fn target_resources(
        &self,
        host: &Host,
        session: &dyn RemoteExec,
    ) -> Result<TargetResources> {
        let resources = if host.has_api() {
            TargetResources {
                storages: self.api_storages(host).await?,
                bridges: self.api_bridges(host).await?,
            }
        } else {
            TargetResources {
                storages: shell_storages(session).await?,
                bridges: shell_bridges(session).await?,
            }
        };
        debug!(
            host = %host.name,
            storages = resources.storages.len(),
            bridges = resources.bridges.len(),
            "target resources fetched"
        );
        Ok(resources)
    }

    async fn api_storages(&self, host: &Host) -> Result<Vec<String>> {
        let path = format!("/api2/json/nodes/{}/storage", host.name);
        let response = self.api.get(host, &path).await?;
        let envelope: ApiEnvelope<Vec<ApiStorageRow>> = response
            .json()
            .await
            .map_err(|e| CaravanError::Api(e.to_string()))?;
        Ok(envelope
            .data
            .into_iter()
            .filter(|row| row.active.unwrap_or(1) != 0 && row.enabled.unwrap_or(1) != 0)
            // Pools that cannot hold unit volumes are not placement targets.
            .filter(|row| {
                row.content
                    .as_deref()
                    .map(|c| c.contains("images") || c.contains("rootdir"))
                    .unwrap_or(true)
            })
            .map(|row| row.storage)
            .collect())
    }

    async fn api_bridges(&self, host: &Host) -> Result<Vec<String>> {
        let path = format!("/api2/json/nodes/{}/network", host.name);
        let response = self.api.get(host, &path).await?;
        let envelope: ApiEnvelope<Vec<ApiNetworkRow>> = response
            .json()
            .await
            .map_err(|e| CaravanError::Api(e.to_string()))?;
        Ok(envelope
            .data
            .into_iter()
            .filter(|row| row.kind == "bridge")
            .map(|row| row.iface)
            .collect())
    }
}

/// `pvesm status` fallback: NAME TYPE STATUS TOTAL USED AVAIL %.
async fn shell_storages(session: &dyn RemoteExec) -> Result<Vec<String>> {
    let output = session.exec("pvesm status").await?;
    Ok(output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match (fields.first(), fields.get(2)) {
                (Some(name), Some(&"active")) => Some(name.to_string()),
                _ => None,
            }
        })
        .collect())
}

async fn shell_bridges(session: &dyn RemoteExec) -> Result<Vec<String>> {
    let output = session.exec("ip -br link show type bridge").await?;
    Ok(output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| name.split('@').next().unwrap_or(name).to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(storages: &[&str], bridges: &[&str]) -> TargetResources {
        TargetResources {
            storages: storages.iter().map(|s| s.to_string()).collect(),
            bridges: bridges.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn keep_source_never_substitutes() {
        let mapping = UnitMapping::default();
        let resolved = resolve_storage(&mapping, &resources(&["local-lvm"], &[])).unwrap();
        assert_eq!(resolved, None);
    }

    #[test]
    fn explicit_storage_must_exist() {
        let mapping = UnitMapping {
            storage: StorageTarget::Explicit("tank".into()),
            ..Default::default()
        };
        assert!(resolve_storage(&mapping, &resources(&["tank"], &[])).is_ok());
        let err = resolve_storage(&mapping, &resources(&["local"], &[])).unwrap_err();
        assert!(matches!(err, CaravanError::MappingUnresolved(_)));
    }

    #[test]
    fn auto_prefers_the_default_bridge() {
        let mapping = UnitMapping::default();
        let nics = vec!["net0".to_string(), "net1".to_string()];
        let bound = resolve_network(
            "pve2",
            &nics,
            &mapping,
            &resources(&[], &["vmbr9", "vmbr0"]),
        )
        .unwrap();
        assert_eq!(bound["net0"], "vmbr0");
        assert_eq!(bound["net1"], "vmbr0");
    }

    #[test]
    fn auto_without_default_takes_first_sorted() {
        let mapping = UnitMapping::default();
        let nics = vec!["net0".to_string()];
        let bound =
            resolve_network("pve2", &nics, &mapping, &resources(&[], &["vmbr7", "vmbr2"])).unwrap();
        assert_eq!(bound["net0"], "vmbr2");
    }

    #[test]
    fn explicit_bridge_must_exist() {
        let mut mapping = UnitMapping::default();
        mapping
            .nics
            .insert("net0".into(), BridgeTarget::Explicit("vmbr5".into()));
        let nics = vec!["net0".to_string()];
        let err =
            resolve_network("pve2", &nics, &mapping, &resources(&[], &["vmbr0"])).unwrap_err();
        assert!(matches!(err, CaravanError::MappingUnresolved(_)));
    }

    #[test]
    fn nics_without_bridges_fail_at_validation() {
        let mapping = UnitMapping::default();
        let nics = vec!["net0".to_string()];
        let err = resolve_network("pve2", &nics, &mapping, &resources(&[], &[])).unwrap_err();
        assert!(matches!(err, CaravanError::NoBridgesAvailable(_)));
    }

    #[test]
    fn unit_without_nics_ignores_missing_bridges() {
        let mapping = UnitMapping::default();
        let bound = resolve_network("pve2", &[], &mapping, &resources(&[], &[])).unwrap();
        assert!(bound.is_empty());
    }
}
