use crate::host::{Host, HostKind};
use crate::{CaravanError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Fleet configuration, loaded from a `Caravanfile` (TOML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaravanConfig {
    /// Where task records, job records, spools and backups live.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub migration: MigrationDefaults,
    #[serde(default, rename = "host")]
    pub hosts: Vec<Host>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Polling interval of the job ticker, in seconds.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDefaults {
    /// Lowest identifier the arbiter will hand out in auto mode.
    #[serde(default = "default_id_floor")]
    pub id_floor: u32,
    /// Scratch directory on the remote hosts for export archives.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

impl Default for MigrationDefaults {
    fn default() -> Self {
        Self {
            id_floor: default_id_floor(),
            export_dir: default_export_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/caravan")
}

fn default_tick_seconds() -> u64 {
    30
}

fn default_id_floor() -> u32 {
    100
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("/var/tmp/caravan")
}

impl Default for CaravanConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            scheduler: SchedulerConfig::default(),
            migration: MigrationDefaults::default(),
            hosts: Vec::new(),
        }
    }
}

impl CaravanConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            CaravanError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: CaravanConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// `./Caravanfile` when present, otherwise the user config directory.
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from("Caravanfile");
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("caravan")
            .join("Caravanfile")
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if !seen.insert(host.name.as_str()) {
                return Err(CaravanError::Config(format!(
                    "duplicate host name '{}'",
                    host.name
                )));
            }
        }
        Ok(())
    }

    pub fn host(&self, name: &str) -> Result<&Host> {
        self.hosts
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| CaravanError::HostNotFound(name.to_string()))
    }

    /// Hosts that can act as migration endpoints.
    pub fn hypervisors(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter().filter(|h| h.kind == HostKind::Hypervisor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_fleet_file() {
        let text = r#"
state_dir = "/tmp/caravan-test"

[[host]]
name = "pve1"
kind = "hypervisor"
address = "10.0.0.11"
auth = { key = { path = "/root/.ssh/id_ed25519" } }

[[host]]
name = "pbs1"
kind = "backup"
address = "10.0.0.20"
user = "backup"
auth = { password = { password = "hunter2" } }
"#;
        let config: CaravanConfig = toml::from_str(text).unwrap();
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.host("pve1").unwrap().kind, HostKind::Hypervisor);
        assert_eq!(config.host("pbs1").unwrap().ssh.user, "backup");
        assert_eq!(config.host("pve1").unwrap().ssh.port, 22);
        assert_eq!(config.scheduler.tick_seconds, 30);
        assert_eq!(config.migration.id_floor, 100);
        assert!(config.host("nope").is_err());
    }
}
