//! Parses an Ansible-style inventory (YAML or line-per-host) into hosts and
//! groups, and watches the source file for changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

use crate::db::models::NewHost;

/// One resolved host, with groups already expanded to their transitive
/// closure (§9 "Cyclic groups").
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHost {
    pub name: String,
    pub addr: String,
    pub vars: HashMap<String, String>,
    pub groups: Vec<String>,
    pub owner: String,
}

impl ResolvedHost {
    pub fn into_new_host(self) -> NewHost {
        NewHost {
            name: self.name,
            addr: self.addr,
            vars: self.vars,
            groups: self.groups,
            owner: self.owner,
        }
    }
}

/// Everything the Inventory Provider produced from one load.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub hosts: Vec<ResolvedHost>,
    pub groups: BTreeMap<String, Vec<String>>,
}

// --- YAML shape -------------------------------------------------------

#[derive(Debug, Deserialize, Serialize, Default)]
struct YamlInventory {
    all: YamlGroup,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct YamlGroup {
    #[serde(default)]
    hosts: BTreeMap<String, YamlHostVars>,
    #[serde(default)]
    children: BTreeMap<String, YamlGroup>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct YamlHostVars {
    ansible_host: Option<String>,
    #[serde(flatten)]
    vars: BTreeMap<String, serde_yaml::Value>,
}

fn yaml_value_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

struct RawHost {
    addr: String,
    vars: HashMap<String, String>,
    direct_groups: Vec<String>,
}

/// Walk the YAML group tree, collecting each host's directly-containing
/// group names and raw vars.
fn walk_group(name: &str, group: &YamlGroup, raw_hosts: &mut BTreeMap<String, RawHost>, groups: &mut BTreeMap<String, Vec<String>>) {
    let mut members: Vec<String> = group.hosts.keys().cloned().collect();

    for (host_name, host_vars) in &group.hosts {
        let mut vars: HashMap<String, String> = host_vars
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), yaml_value_to_string(v)))
            .collect();
        let addr = host_vars
            .ansible_host
            .clone()
            .unwrap_or_else(|| host_name.clone());

        raw_hosts
            .entry(host_name.clone())
            .and_modify(|existing| {
                existing.direct_groups.push(name.to_string());
                for (k, v) in vars.clone() {
                    existing.vars.entry(k).or_insert(v);
                }
            })
            .or_insert_with(|| {
                let direct_groups = vec![name.to_string()];
                vars.drain();
                RawHost {
                    addr,
                    vars: host_vars
                        .vars
                        .iter()
                        .map(|(k, v)| (k.clone(), yaml_value_to_string(v)))
                        .collect(),
                    direct_groups,
                }
            });
    }

    for (child_name, child_group) in &group.children {
        members.push(child_name.clone());
        walk_group(child_name, child_group, raw_hosts, groups);
    }

    groups.insert(name.to_string(), members);
}

/// Transitive closure of group membership: a host's groups include every
/// group that (directly or through nested `children`) contains it.
fn expand_groups(direct_groups: &[String], group_parents: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = direct_groups.to_vec();
    while let Some(g) = stack.pop() {
        if seen.insert(g.clone()) {
            if let Some(parents) = group_parents.get(&g) {
                stack.extend(parents.clone());
            }
        }
    }
    let mut result: Vec<String> = seen.into_iter().collect();
    result.sort();
    result
}

fn parse_yaml(content: &str, default_owner: &str) -> Result<Inventory> {
    let doc: YamlInventory = serde_yaml::from_str(content).context("failed to parse YAML inventory")?;

    let mut raw_hosts: BTreeMap<String, RawHost> = BTreeMap::new();
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    walk_group("all", &doc.all, &mut raw_hosts, &mut groups);

    // child -> parents, for transitive closure
    let mut group_parents: HashMap<String, Vec<String>> = HashMap::new();
    for (parent, members) in &groups {
        for member in members {
            group_parents.entry(member.clone()).or_default().push(parent.clone());
        }
    }

    let mut hosts = Vec::new();
    for (name, raw) in raw_hosts {
        let owner = raw
            .vars
            .get("owner")
            .cloned()
            .unwrap_or_else(|| default_owner.to_string());
        let groups = expand_groups(&raw.direct_groups, &group_parents);
        hosts.push(ResolvedHost {
            name,
            addr: raw.addr,
            vars: raw.vars,
            groups,
            owner,
        });
    }

    Ok(Inventory { hosts, groups })
}

/// Minimal line-per-host format: `name key=value key2=value2 ...`.
fn parse_line_format(content: &str, default_owner: &str) -> Result<Inventory> {
    let mut hosts = Vec::new();

    for (lineno, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .with_context(|| format!("line {}: missing host name", lineno + 1))?
            .to_string();

        let mut vars = HashMap::new();
        for token in parts {
            if let Some((k, v)) = token.split_once('=') {
                vars.insert(k.to_string(), v.to_string());
            } else {
                warn!("inventory line {}: ignoring malformed token '{}'", lineno + 1, token);
            }
        }

        let addr = vars
            .get("ansible_host")
            .cloned()
            .unwrap_or_else(|| name.clone());
        let owner = vars
            .get("owner")
            .cloned()
            .unwrap_or_else(|| default_owner.to_string());
        let groups = vars
            .get("groups")
            .map(|g| g.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        hosts.push(ResolvedHost { name, addr, vars, groups, owner });
    }

    Ok(Inventory { hosts, groups: BTreeMap::new() })
}

/// Load an inventory file, dispatching on extension/content shape.
pub fn load(path: impl AsRef<Path>, default_owner: &str) -> Result<Inventory> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read inventory file {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    );

    if is_yaml {
        parse_yaml(&content, default_owner)
    } else {
        parse_line_format(&content, default_owner)
    }
}

/// Poll `path`'s mtime and invoke `on_change` whenever it advances. Runs
/// until the task is aborted by its caller.
pub async fn watch<F>(path: PathBuf, default_owner: String, poll_interval: std::time::Duration, mut on_change: F)
where
    F: FnMut(Result<Inventory>) + Send,
{
    let mut last_seen: Option<SystemTime> = None;
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        ticker.tick().await;
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!("inventory watch: failed to stat {}: {e}", path.display());
                continue;
            }
        };
        let modified = match metadata.modified() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if last_seen == Some(modified) {
            continue;
        }
        last_seen = Some(modified);
        info!("inventory file changed, reloading");
        on_change(load(&path, &default_owner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_basic_host() {
        let yaml = r#"
all:
  hosts:
    anchorage:
      ansible_host: 10.30.1.122
      owner: infra
"#;
        let inv = parse_yaml(yaml, "unassigned").unwrap();
        assert_eq!(inv.hosts.len(), 1);
        let host = &inv.hosts[0];
        assert_eq!(host.name, "anchorage");
        assert_eq!(host.addr, "10.30.1.122");
        assert_eq!(host.owner, "infra");
        assert_eq!(host.groups, vec!["all".to_string()]);
    }

    #[test]
    fn test_parse_yaml_applies_default_owner() {
        let yaml = r#"
all:
  hosts:
    anchorage:
      ansible_host: 10.30.1.122
"#;
        let inv = parse_yaml(yaml, "team-x").unwrap();
        assert_eq!(inv.hosts[0].owner, "team-x");
    }

    #[test]
    fn test_parse_yaml_expands_nested_groups() {
        let yaml = r#"
all:
  children:
    edge:
      hosts:
        anchorage:
          ansible_host: 10.30.1.122
      children:
        coastal:
          hosts:
            harbor:
              ansible_host: 10.30.1.200
"#;
        let inv = parse_yaml(yaml, "unassigned").unwrap();
        let harbor = inv.hosts.iter().find(|h| h.name == "harbor").unwrap();
        // harbor belongs to coastal directly, and transitively to edge and all
        assert!(harbor.groups.contains(&"coastal".to_string()));
        assert!(harbor.groups.contains(&"edge".to_string()));
        assert!(harbor.groups.contains(&"all".to_string()));
    }

    #[test]
    fn test_parse_line_format() {
        let content = "anchorage ansible_host=10.30.1.122 owner=infra groups=edge,coastal\n# a comment\n\nharbor ansible_host=10.30.1.200\n";
        let inv = parse_line_format(content, "unassigned").unwrap();
        assert_eq!(inv.hosts.len(), 2);
        let anchorage = &inv.hosts[0];
        assert_eq!(anchorage.addr, "10.30.1.122");
        assert_eq!(anchorage.owner, "infra");
        assert_eq!(anchorage.groups, vec!["edge".to_string(), "coastal".to_string()]);

        let harbor = &inv.hosts[1];
        assert_eq!(harbor.owner, "unassigned");
    }

    #[test]
    fn test_load_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("inventory.yml");
        std::fs::write(&yaml_path, "all:\n  hosts:\n    anchorage:\n      ansible_host: 10.0.0.1\n").unwrap();
        let inv = load(&yaml_path, "unassigned").unwrap();
        assert_eq!(inv.hosts.len(), 1);

        let line_path = dir.path().join("inventory.ini");
        std::fs::write(&line_path, "anchorage ansible_host=10.0.0.1\n").unwrap();
        let inv = load(&line_path, "unassigned").unwrap();
        assert_eq!(inv.hosts.len(), 1);
    }
}
