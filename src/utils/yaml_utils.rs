//! Manual `${VAR}`/`${VAR:-default}` interpolation, used only as a fallback
//! when `docker compose config` itself is unavailable (§9 "Variable
//! interpolation in Compose" — the CLI's own rendering is always preferred).

use anyhow::{Context, Result};
use std::collections::HashMap;

/// Substitute `${VAR}` / `$VAR` occurrences in a single string.
pub fn envsubst(s: &str, variables: &HashMap<String, String>) -> String {
    envsubst::substitute(s, variables).unwrap_or_else(|_| s.to_string())
}

/// Parse `content` as YAML, substitute variables in every string scalar,
/// and re-serialize. Used to pre-render a compose document's `${VAR}`
/// references before hashing, when the CLI's `config --hash` path isn't
/// available.
pub fn envsubst_yaml(content: &str, env: &HashMap<String, String>) -> Result<String> {
    let value: serde_yaml::Value = serde_yaml::from_str(content).context("failed to parse YAML")?;
    let substituted = traverse(value, env);
    serde_yaml::to_string(&substituted).context("failed to emit YAML")
}

fn traverse(value: serde_yaml::Value, env: &HashMap<String, String>) -> serde_yaml::Value {
    use serde_yaml::Value;
    match value {
        Value::String(s) => Value::String(envsubst(&s, env)),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(|v| traverse(v, env)).collect()),
        Value::Mapping(map) => {
            let mut new_map = serde_yaml::Mapping::new();
            for (k, v) in map {
                new_map.insert(traverse(k, env), traverse(v, env));
            }
            Value::Mapping(new_map)
        }
        other => other,
    }
}
