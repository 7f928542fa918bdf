//! Typed Compose document model. `BTreeMap` gives lexicographic iteration
//! order for free, satisfying the "parse services in lexicographic order"
//! requirement without a manual sort.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::db::models::DiscoveredService;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: BTreeMap<String, ComposeService>,
}

/// Accepts both shapes Compose allows: a list of `KEY=VAL` strings or a
/// mapping of key to scalar.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(untagged)]
pub enum StringOrList {
    #[default]
    Empty,
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl StringOrList {
    fn keys(&self) -> Vec<String> {
        match self {
            StringOrList::Empty => vec![],
            StringOrList::List(items) => items
                .iter()
                .filter_map(|entry| entry.split_once('=').map(|(k, _)| k.to_string()))
                .collect(),
            StringOrList::Map(map) => map.keys().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(untagged)]
pub enum StringOrSingle {
    #[default]
    Empty,
    Single(String),
    List(Vec<String>),
}

impl StringOrSingle {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrSingle::Empty => vec![],
            StringOrSingle::Single(s) => vec![s],
            StringOrSingle::List(items) => items,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ComposeService {
    pub image: Option<String>,
    pub container_name: Option<String>,
    #[serde(default)]
    pub labels: StringOrList,
    #[serde(default)]
    pub environment: StringOrList,
    #[serde(default)]
    pub env_file: StringOrSingle,
    #[serde(default)]
    pub ports: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub volumes: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub deploy: Option<serde_yaml::Value>,
}

pub fn parse_compose(content: &str) -> Result<ComposeFile> {
    serde_yaml::from_str(content).context("invalid compose document")
}

fn yaml_value_to_json(v: &serde_yaml::Value) -> JsonValue {
    serde_json::to_value(v).unwrap_or(JsonValue::Null)
}

pub fn to_discovered_service(name: &str, service: &ComposeService) -> DiscoveredService {
    let labels_json = match &service.labels {
        StringOrList::Map(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), yaml_value_to_json(v)))
                .collect(),
        ),
        StringOrList::List(items) => JsonValue::Object(
            items
                .iter()
                .filter_map(|entry| entry.split_once('='))
                .map(|(k, v)| (k.to_string(), JsonValue::String(v.to_string())))
                .collect(),
        ),
        StringOrList::Empty => JsonValue::Object(Default::default()),
    };

    let ports_json: Vec<JsonValue> = service.ports.iter().map(yaml_value_to_json).collect();
    let volumes_json: Vec<JsonValue> = service.volumes.iter().map(yaml_value_to_json).collect();
    let deploy_json = service
        .deploy
        .as_ref()
        .map(yaml_value_to_json)
        .unwrap_or(JsonValue::Object(Default::default()));

    DiscoveredService {
        service_name: name.to_string(),
        container_name: service.container_name.clone(),
        image: service.image.clone(),
        labels: labels_json,
        env_keys: service.environment.keys(),
        env_files: service.env_file.clone().into_vec(),
        ports: JsonValue::Array(ports_json),
        volumes: JsonValue::Array(volumes_json),
        deploy: deploy_json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compose_lexicographic_order() {
        let doc = "services:\n  web:\n    image: nginx\n  api:\n    image: myapp\n";
        let compose = parse_compose(doc).unwrap();
        let names: Vec<&String> = compose.services.keys().collect();
        assert_eq!(names, vec!["api", "web"]);
    }

    #[test]
    fn test_environment_list_form_keys() {
        let doc = "services:\n  web:\n    image: nginx\n    environment:\n      - DATABASE_URL=postgres://x\n      - DEBUG=true\n";
        let compose = parse_compose(doc).unwrap();
        let discovered = to_discovered_service("web", &compose.services["web"]);
        assert_eq!(discovered.env_keys, vec!["DATABASE_URL".to_string(), "DEBUG".to_string()]);
    }

    #[test]
    fn test_env_file_single_and_list_forms() {
        let single = parse_compose("services:\n  web:\n    env_file: .env\n").unwrap();
        assert_eq!(
            to_discovered_service("web", &single.services["web"]).env_files,
            vec![".env".to_string()]
        );

        let list = parse_compose("services:\n  web:\n    env_file:\n      - .env\n      - .env.local\n").unwrap();
        assert_eq!(
            to_discovered_service("web", &list.services["web"]).env_files,
            vec![".env".to_string(), ".env.local".to_string()]
        );
    }
}
