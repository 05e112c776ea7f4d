use crate::host::Host;
use crate::remote::RemoteExec;
use crate::{CaravanError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// The two compute-unit tiers a hypervisor host manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Vm,
    Container,
}

impl UnitKind {
    /// Host-side management CLI for this tier.
    pub fn cli(&self) -> &'static str {
        match self {
            UnitKind::Vm => "qm",
            UnitKind::Container => "pct",
        }
    }

    /// Path segment in the management API.
    pub fn api_segment(&self) -> &'static str {
        match self {
            UnitKind::Vm => "qemu",
            UnitKind::Container => "lxc",
        }
    }

    pub fn config_path(&self, id: u32) -> String {
        match self {
            UnitKind::Vm => format!("/etc/pve/qemu-server/{}.conf", id),
            UnitKind::Container => format!("/etc/pve/lxc/{}.conf", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
    Other(String),
}

impl RunState {
    fn parse(s: &str) -> Self {
        match s {
            "running" => RunState::Running,
            "stopped" => RunState::Stopped,
            other => RunState::Other(other.to_string()),
        }
    }
}

/// Snapshot of one VM/container definition, fetched per planning session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeUnit {
    pub id: u32,
    pub kind: UnitKind,
    pub name: String,
    pub state: RunState,
    /// Attached network interface names (net0, net1, ...).
    pub nics: Vec<String>,
    /// Storage pools backing the unit's volumes.
    pub storages: Vec<String>,
}

/// Thin wrapper over the hosts' management REST API. Shared by the
/// inventory reader and the resource mapper.
#[derive(Clone)]
pub(crate) struct ApiClient {
    http: reqwest::Client,
}

#[derive(Deserialize)]
pub(crate) struct ApiEnvelope<T> {
    pub(crate) data: T,
}

impl ApiClient {
    pub(crate) fn new() -> Self {
        // Management APIs in the fleet commonly run self-signed certs.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("http client");
        Self { http }
    }

    pub(crate) async fn get(&self, host: &Host, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", host.api_url.as_deref().unwrap_or_default(), path);
        let token = host.api_token.as_deref().unwrap_or_default();
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("PVEAPIToken={}", token))
            .send()
            .await
            .map_err(|_| CaravanError::HostUnreachable(host.name.clone()))?;
        // Auth failures count as "host down" for retry purposes: the unit
        // may well exist, we just cannot see it.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(CaravanError::HostUnreachable(host.name.clone()));
        }
        Ok(response)
    }
}

/// Reads VM/container definitions off a host, via the management REST API
/// when the host has one configured and over the remote shell otherwise.
pub struct InventoryReader {
    api: ApiClient,
}

impl Default for InventoryReader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct ApiUnitRow {
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    status: String,
}

impl InventoryReader {
    pub fn new() -> Self {
        Self {
            api: ApiClient::new(),
        }
    }

    /// Enumerate all compute units on a host, both tiers, with their
    /// interface and storage attachments resolved from config.
    pub async fn list_units(
        &self,
        host: &Host,
        session: &dyn RemoteExec,
    ) -> Result<Vec<ComputeUnit>> {
        let mut units = Vec::new();
        for kind in [UnitKind::Vm, UnitKind::Container] {
            let rows = if host.has_api() {
                self.api_list(host, kind).await?
            } else {
                shell_list(session, kind).await?
            };
            for (id, name, state) in rows {
                let config = self.get_config(host, session, id, kind).await?;
                units.push(ComputeUnit {
                    id,
                    kind,
                    name,
                    state,
                    nics: parse_nics(&config),
                    storages: parse_storages(&config),
                });
            }
        }
        units.sort_by_key(|u| u.id);
        debug!(host = %host.name, count = units.len(), "inventory fetched");
        Ok(units)
    }

    /// Raw configuration text for one unit. A missing unit is
    /// `UnitNotFound`, never an empty result; a host that cannot be
    /// reached is `HostUnreachable`.
    pub async fn get_config(
        &self,
        host: &Host,
        session: &dyn RemoteExec,
        id: u32,
        kind: UnitKind,
    ) -> Result<String> {
        if host.has_api() {
            return self.api_config(host, id, kind).await;
        }
        match session.exec(&format!("cat {}", kind.config_path(id))).await {
            Ok(text) => Ok(text),
            Err(CaravanError::Command { stderr, .. })
                if stderr.contains("No such file") || stderr.contains("does not exist") =>
            {
                Err(CaravanError::UnitNotFound(id))
            }
            Err(CaravanError::Command { exit_code: 255, stderr }) => {
                debug!(host = %host.name, %stderr, "ssh transport failure");
                Err(CaravanError::HostUnreachable(host.name.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn api_list(
        &self,
        host: &Host,
        kind: UnitKind,
    ) -> Result<Vec<(u32, String, RunState)>> {
        let path = format!("/api2/json/nodes/{}/{}", host.name, kind.api_segment());
        let response = self.api.get(host, &path).await?;
        let envelope: ApiEnvelope<Vec<ApiUnitRow>> = response
            .json()
            .await
            .map_err(|e| CaravanError::Api(e.to_string()))?;
        Ok(envelope
            .data
            .into_iter()
            .map(|row| {
                let name = row.name.unwrap_or_else(|| row.vmid.to_string());
                (row.vmid, name, RunState::parse(&row.status))
            })
            .collect())
    }

    async fn api_config(&self, host: &Host, id: u32, kind: UnitKind) -> Result<String> {
        let path = format!(
            "/api2/json/nodes/{}/{}/{}/config",
            host.name,
            kind.api_segment(),
            id
        );
        let response = self.api.get(host, &path).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CaravanError::UnitNotFound(id));
        }
        let envelope: ApiEnvelope<serde_json::Map<String, serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| CaravanError::Api(e.to_string()))?;
        // Reassemble the key/value map into the on-disk text form so both
        // backends hand identical material to the rewrite step.
        let mut keys: Vec<&String> = envelope.data.keys().collect();
        keys.sort();
        let mut text = String::new();
        for key in keys {
            if key == "digest" {
                continue;
            }
            let value = &envelope.data[key];
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text.push_str(&format!("{}: {}\n", key, rendered));
        }
        Ok(text)
    }

}

/// `qm list` / `pct list` fallback when the host has no API endpoint.
async fn shell_list(
    session: &dyn RemoteExec,
    kind: UnitKind,
) -> Result<Vec<(u32, String, RunState)>> {
    let output = match session.exec(&format!("{} list", kind.cli())).await {
        Ok(o) => o,
        Err(CaravanError::Command { exit_code: 255, .. }) => {
            return Err(CaravanError::HostUnreachable(session.host_name().to_string()));
        }
        Err(e) => return Err(e),
    };
    let mut rows = Vec::new();
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let Ok(id) = fields[0].parse::<u32>() else {
            continue;
        };
        let (name, status) = match kind {
            // qm list: VMID NAME STATUS ...
            UnitKind::Vm => (
                fields.get(1).unwrap_or(&"").to_string(),
                fields.get(2).unwrap_or(&"").to_string(),
            ),
            // pct list: VMID STATUS [LOCK] NAME
            UnitKind::Container => (
                fields.last().unwrap_or(&"").to_string(),
                fields.get(1).unwrap_or(&"").to_string(),
            ),
        };
        rows.push((id, name, RunState::parse(&status)));
    }
    Ok(rows)
}

const VOLUME_KEYS: [&str; 9] = [
    "scsi", "ide", "sata", "virtio", "efidisk", "tpmstate", "rootfs", "mp", "unused",
];

pub(crate) fn is_volume_key(key: &str) -> bool {
    VOLUME_KEYS.iter().any(|prefix| {
        key.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.chars().all(|c| c.is_ascii_digit()))
    })
}

fn is_nic_key(key: &str) -> bool {
    key.strip_prefix("net")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Network interface names declared in a unit's config text.
pub fn parse_nics(config: &str) -> Vec<String> {
    let mut nics = Vec::new();
    for line in config.lines() {
        if let Some((key, _)) = line.split_once(':') {
            let key = key.trim();
            if is_nic_key(key) {
                nics.push(key.to_string());
            }
        }
    }
    nics.sort();
    nics
}

/// Storage pools referenced by a unit's volume entries. A volume value
/// looks like `local-lvm:vm-100-disk-0,size=32G`; the pool is the part
/// before the first colon.
pub fn parse_storages(config: &str) -> Vec<String> {
    let mut pools = Vec::new();
    for line in config.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !is_volume_key(key.trim()) {
            continue;
        }
        let spec = value.trim().split(',').next().unwrap_or_default();
        if spec == "none" || spec.contains("media=cdrom") {
            continue;
        }
        if let Some((pool, _volume)) = spec.split_once(':') {
            if !pool.is_empty() && !pools.contains(&pool.to_string()) {
                pools.push(pool.to_string());
            }
        }
    }
    pools
}

#[cfg(test)]
mod tests {
    use super::*;

    const VM_CONFIG: &str = "\
boot: order=scsi0
cores: 4
memory: 8192
name: web01
net0: virtio=BC:24:11:7A:30:01,bridge=vmbr0,firewall=1
net1: virtio=BC:24:11:7A:30:02,bridge=vmbr1
scsi0: local-lvm:vm-100-disk-0,size=32G
efidisk0: local-lvm:vm-100-disk-1,size=4M
ide2: none,media=cdrom
smbios1: uuid=7c9e4a2e
";

    const CT_CONFIG: &str = "\
arch: amd64
hostname: cache01
memory: 2048
net0: name=eth0,bridge=vmbr0,ip=dhcp
rootfs: local:subvol-101-disk-0,size=8G
mp0: tank:subvol-101-disk-1,mp=/data
";

    #[test]
    fn nics_come_back_sorted() {
        assert_eq!(parse_nics(VM_CONFIG), vec!["net0", "net1"]);
        assert_eq!(parse_nics(CT_CONFIG), vec!["net0"]);
    }

    #[test]
    fn storages_skip_cdrom_and_dedupe() {
        assert_eq!(parse_storages(VM_CONFIG), vec!["local-lvm"]);
        assert_eq!(parse_storages(CT_CONFIG), vec!["local", "tank"]);
    }

    #[test]
    fn volume_keys_do_not_match_lookalikes() {
        assert!(is_volume_key("scsi0"));
        assert!(is_volume_key("rootfs"));
        assert!(!is_volume_key("scsihw"));
        assert!(!is_volume_key("netword"));
        assert!(is_nic_key("net12"));
        assert!(!is_nic_key("net"));
    }

    #[test]
    fn container_list_parses_name_last() {
        // pct list has status before name, qm list the other way around.
        let line = "101        running                 cache01";
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields.last().unwrap(), &"cache01");
    }
}
