// Static YAML inventory parser
//
// Format:
//
//   defaults:
//     user: deploy
//     port: 22
//     private_key_file: ~/.ssh/id_ed25519
//   hosts:
//     1:
//       name: web-1
//       address: 10.0.0.11
//       password: secret
//     2: { address: 10.0.0.12, port: 2222 }
//   groups:
//     web: [1, 2]

use std::path::Path;

use serde_yaml::Value as YamlValue;

use super::{AuthMethod, ConnectionParams, Inventory, ResolvedHost};
use crate::output::errors::{BatchError, Result};

/// Per-file fallbacks applied to every host
#[derive(Debug, Clone, Default)]
struct Defaults {
    user: Option<String>,
    port: Option<u16>,
    auth: Option<AuthMethod>,
}

/// Parse inventory from a YAML file
pub fn parse_inventory_file(path: &Path) -> Result<Inventory> {
    let content = std::fs::read_to_string(path).map_err(|source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse_inventory(&content)
}

/// Parse inventory from a YAML string
pub fn parse_inventory(content: &str) -> Result<Inventory> {
    let yaml: YamlValue = serde_yaml::from_str(content)
        .map_err(|e| BatchError::Config(format!("Invalid inventory YAML: {}", e)))?;

    if !yaml.is_mapping() {
        return Err(BatchError::Config(
            "Inventory must be a YAML mapping with 'hosts' and 'groups'".to_string(),
        ));
    }

    let defaults = match yaml.get("defaults") {
        Some(value) => parse_defaults(value)?,
        None => Defaults::default(),
    };

    let mut inventory = Inventory::new();

    if let Some(hosts) = yaml.get("hosts").and_then(|h| h.as_mapping()) {
        for (key, value) in hosts {
            let id = key_to_string(key)?;
            let host = parse_host(&id, value, &defaults)?;
            inventory.add_host(host);
        }
    }

    if let Some(groups) = yaml.get("groups").and_then(|g| g.as_mapping()) {
        for (key, value) in groups {
            let name = key_to_string(key)?;
            let members = value
                .as_sequence()
                .ok_or_else(|| {
                    BatchError::Config(format!("Group '{}' must be a list of host ids", name))
                })?
                .iter()
                .map(key_to_string)
                .collect::<Result<Vec<_>>>()?;

            for member in &members {
                if !inventory.hosts.contains_key(member) {
                    tracing::warn!(group = %name, host = %member, "group member not defined in hosts");
                }
            }

            inventory.add_group(name, members);
        }
    }

    Ok(inventory)
}

fn parse_defaults(value: &YamlValue) -> Result<Defaults> {
    Ok(Defaults {
        user: value.get("user").and_then(|u| u.as_str()).map(String::from),
        port: value.get("port").map(parse_port).transpose()?,
        auth: parse_auth(value),
    })
}

fn parse_host(id: &str, value: &YamlValue, defaults: &Defaults) -> Result<ResolvedHost> {
    // A bare `web1:` entry uses the id as its address
    let address = value
        .get("address")
        .and_then(|a| a.as_str())
        .map(String::from)
        .unwrap_or_else(|| id.to_string());

    let name = value
        .get("name")
        .and_then(|n| n.as_str())
        .map(String::from)
        .unwrap_or_else(|| address.clone());

    let username = value
        .get("user")
        .and_then(|u| u.as_str())
        .map(String::from)
        .or_else(|| defaults.user.clone())
        // Empty means "let the connection pool pick its default user"
        .unwrap_or_default();

    let port = match value.get("port") {
        Some(port) => parse_port(port)?,
        None => defaults.port.unwrap_or(22),
    };

    let auth = parse_auth(value)
        .or_else(|| defaults.auth.clone())
        .unwrap_or(AuthMethod::Agent);

    Ok(ResolvedHost {
        id: id.to_string(),
        name,
        params: ConnectionParams::new(address, username, auth).with_port(port),
    })
}

/// Password wins over an inline key, which wins over a key file
fn parse_auth(value: &YamlValue) -> Option<AuthMethod> {
    let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(String::from);
    let passphrase = field("passphrase");

    if let Some(password) = field("password") {
        return Some(AuthMethod::Password { password });
    }
    if let Some(key) = field("private_key") {
        return Some(AuthMethod::PrivateKey { key, passphrase });
    }
    if let Some(path) = field("private_key_file") {
        return Some(AuthMethod::KeyFile {
            path: expand_home(&path),
            passphrase,
        });
    }
    if value.get("agent").and_then(|a| a.as_bool()) == Some(true) {
        return Some(AuthMethod::Agent);
    }
    None
}

fn parse_port(value: &YamlValue) -> Result<u16> {
    value
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| BatchError::Config(format!("Invalid port: {:?}", value)))
}

/// Host ids are often numeric in YAML; accept both forms
fn key_to_string(key: &YamlValue) -> Result<String> {
    match key {
        YamlValue::String(s) => Ok(s.clone()),
        YamlValue::Number(n) => Ok(n.to_string()),
        other => Err(BatchError::Config(format!(
            "Expected a host or group id, got {:?}",
            other
        ))),
    }
}

fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
defaults:
  user: deploy
  private_key_file: /keys/fleet
hosts:
  1:
    name: web-1
    address: 10.0.0.11
  2:
    address: 10.0.0.12
    port: 2222
    user: root
    password: s3cret
  db1: {}
groups:
  web: [1, 2]
  all: [1, 2, db1]
"#;

    #[test]
    fn test_parse_hosts_with_defaults() {
        let inv = parse_inventory(SAMPLE).unwrap();
        assert_eq!(inv.hosts.len(), 3);

        let web1 = &inv.hosts["1"];
        assert_eq!(web1.name, "web-1");
        assert_eq!(web1.params.username, "deploy");
        assert_eq!(web1.params.port, 22);
        assert_eq!(
            web1.params.auth,
            AuthMethod::KeyFile {
                path: "/keys/fleet".into(),
                passphrase: None
            }
        );

        let web2 = &inv.hosts["2"];
        assert_eq!(web2.params.port, 2222);
        assert_eq!(web2.params.username, "root");
        assert!(matches!(web2.params.auth, AuthMethod::Password { .. }));

        assert_eq!(inv.hosts["db1"].params.address, "db1");
    }

    #[test]
    fn test_parse_groups_keep_order() {
        let inv = parse_inventory(SAMPLE).unwrap();
        assert_eq!(inv.groups["web"], vec!["1".to_string(), "2".to_string()]);
        assert_eq!(inv.groups["all"].len(), 3);
    }

    #[test]
    fn test_rejects_non_mapping() {
        assert!(parse_inventory("- a\n- b\n").is_err());
        assert!(parse_inventory("hosts:\n  a: { port: 99999 }\n").is_err());
    }

    #[test]
    fn test_parse_inventory_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let inv = parse_inventory_file(file.path()).unwrap();
        assert_eq!(inv.host_ids(), vec!["1", "2", "db1"]);
    }

    #[test]
    fn test_missing_file() {
        let err = parse_inventory_file(Path::new("/nonexistent/inventory.yml")).unwrap_err();
        assert!(matches!(err, BatchError::Io { .. }));
    }
}
