use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Role a fleet host plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKind {
    /// Runs compute units (VMs and containers).
    Hypervisor,
    /// Holds configuration backups; never a migration endpoint.
    Backup,
}

/// How the remote shell session authenticates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Key { path: PathBuf },
    Password { password: String },
}

/// Remote shell credentials for one host. Sessions snapshot these at
/// connect time, so edits only take effect on the next connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshCredentials {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    pub auth: AuthMethod,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

impl SshCredentials {
    /// user@address form used by the ssh/scp command lines.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// A managed fleet host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub kind: HostKind,
    #[serde(flatten)]
    pub ssh: SshCredentials,
    /// Management API endpoint, e.g. "https://pve1:8006". When absent the
    /// inventory reader falls back to remote-shell introspection.
    #[serde(default)]
    pub api_url: Option<String>,
    /// API token in "user@realm!tokenid=secret" form.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Host {
    pub fn has_api(&self) -> bool {
        self.api_url.is_some() && self.api_token.is_some()
    }
}
