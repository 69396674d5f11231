// Inventory module - host and group directories

mod resolver;
mod static_inv;

pub use resolver::*;
pub use static_inv::*;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::output::errors::Result;

pub type HostId = String;
pub type GroupId = String;

/// How to authenticate an SSH session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    Password {
        password: String,
    },
    /// PEM-encoded private key held in memory
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
    KeyFile {
        path: String,
        passphrase: Option<String>,
    },
    Agent,
}

impl AuthMethod {
    fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::PrivateKey { .. } => "private_key",
            AuthMethod::KeyFile { .. } => "key_file",
            AuthMethod::Agent => "agent",
        }
    }

    /// Secret bytes that distinguish one credential from another
    fn material(&self) -> Vec<&str> {
        match self {
            AuthMethod::Password { password } => vec![password.as_str()],
            AuthMethod::PrivateKey { key, passphrase } => {
                vec![key.as_str(), passphrase.as_deref().unwrap_or("")]
            }
            AuthMethod::KeyFile { path, passphrase } => {
                vec![path.as_str(), passphrase.as_deref().unwrap_or("")]
            }
            AuthMethod::Agent => vec![],
        }
    }
}

// Never print credentials
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::KeyFile { path, .. } => write!(f, "key_file({})", path),
            other => write!(f, "{}(..)", other.kind()),
        }
    }
}

/// Everything needed to open an SSH session to one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

impl ConnectionParams {
    pub fn new(address: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        ConnectionParams {
            address: address.into(),
            port: 22,
            username: username.into(),
            auth,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// SSH connection string (user@host:port)
    pub fn ssh_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.address, self.port)
    }

    /// Canonical pool key over (address, port, username, auth material).
    /// Secrets only enter through the digest.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.address.to_ascii_lowercase().as_bytes());
        hasher.update([0]);
        hasher.update(self.port.to_be_bytes());
        hasher.update(self.username.as_bytes());
        hasher.update([0]);
        hasher.update(self.auth.kind().as_bytes());
        for part in self.auth.material() {
            hasher.update([0]);
            hasher.update(part.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A target host after expansion, consumed once per batch run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub id: HostId,
    pub name: String,
    pub params: ConnectionParams,
}

impl ResolvedHost {
    #[cfg(test)]
    pub(crate) fn for_test(id: &str) -> Self {
        ResolvedHost {
            id: id.to_string(),
            name: format!("host-{}", id),
            params: ConnectionParams::new(format!("{}.test", id), "root", AuthMethod::Agent),
        }
    }
}

/// Looks up connection parameters by host id
#[async_trait]
pub trait HostDirectory: Send + Sync {
    async fn resolve_host(&self, id: &str) -> Result<Option<ResolvedHost>>;
}

/// Looks up the current members of a server group
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn resolve_group_members(&self, group: &str) -> Result<Option<Vec<HostId>>>;
}

/// A static set of hosts and groups, usually loaded from YAML
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub hosts: HashMap<HostId, ResolvedHost>,
    /// Group name -> member ids, in declaration order
    pub groups: HashMap<GroupId, Vec<HostId>>,
}

impl Inventory {
    pub fn new() -> Self {
        Inventory::default()
    }

    pub fn add_host(&mut self, host: ResolvedHost) {
        self.hosts.insert(host.id.clone(), host);
    }

    pub fn add_group(&mut self, name: impl Into<GroupId>, members: Vec<HostId>) {
        self.groups.insert(name.into(), members);
    }

    /// Host ids sorted for display
    pub fn host_ids(&self) -> Vec<&HostId> {
        let mut ids: Vec<_> = self.hosts.keys().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl HostDirectory for Inventory {
    async fn resolve_host(&self, id: &str) -> Result<Option<ResolvedHost>> {
        Ok(self.hosts.get(id).cloned())
    }
}

#[async_trait]
impl GroupDirectory for Inventory {
    async fn resolve_group_members(&self, group: &str) -> Result<Option<Vec<HostId>>> {
        Ok(self.groups.get(group).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(auth: AuthMethod) -> ConnectionParams {
        ConnectionParams::new("web1.example.com", "deploy", auth)
    }

    #[test]
    fn test_fingerprint_is_stable_and_case_insensitive_on_address() {
        let a = params(AuthMethod::Agent);
        let mut b = params(AuthMethod::Agent);
        b.address = "WEB1.example.com".into();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_credentials() {
        let one = params(AuthMethod::Password {
            password: "one".into(),
        });
        let two = params(AuthMethod::Password {
            password: "two".into(),
        });
        assert_ne!(one.fingerprint(), two.fingerprint());
        assert_ne!(
            one.fingerprint(),
            params(AuthMethod::Agent).fingerprint()
        );
        assert_ne!(
            one.fingerprint(),
            params(AuthMethod::Agent).with_port(2222).fingerprint()
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let auth = AuthMethod::Password {
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }

    #[tokio::test]
    async fn test_inventory_directories() {
        let mut inv = Inventory::new();
        inv.add_host(ResolvedHost::for_test("1"));
        inv.add_group("web", vec!["1".into()]);

        assert!(inv.resolve_host("1").await.unwrap().is_some());
        assert!(inv.resolve_host("9").await.unwrap().is_none());
        assert_eq!(
            inv.resolve_group_members("web").await.unwrap(),
            Some(vec!["1".to_string()])
        );
        assert!(inv.resolve_group_members("db").await.unwrap().is_none());
    }
}
