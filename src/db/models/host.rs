use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::HashMap;

/// Row shape returned by sqlx, kept separate from the app-facing `Host` so
/// the `vars`/`groups` columns can be reshaped on the way out.
#[derive(Debug, sqlx::FromRow)]
struct HostRow {
    id: i64,
    name: String,
    addr: String,
    vars: JsonValue,
    groups: Vec<String>,
    owner: String,
}

/// A host known to the inventory, with its transitively-closed group list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub addr: String,
    pub vars: HashMap<String, String>,
    pub groups: Vec<String>,
    pub owner: String,
}

impl From<HostRow> for Host {
    fn from(row: HostRow) -> Self {
        let vars = match row.vars {
            JsonValue::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k, json_value_to_string(v)))
                .collect(),
            _ => HashMap::new(),
        };
        Host {
            id: row.id,
            name: row.name,
            addr: row.addr,
            vars,
            groups: row.groups,
            owner: row.owner,
        }
    }
}

fn json_value_to_string(v: JsonValue) -> String {
    match v {
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

/// A host as produced fresh by the Inventory Provider, before it has an id.
#[derive(Debug, Clone)]
pub struct NewHost {
    pub name: String,
    pub addr: String,
    pub vars: HashMap<String, String>,
    pub groups: Vec<String>,
    pub owner: String,
}

impl Host {
    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Host>> {
        let row = sqlx::query_as::<_, HostRow>(
            "SELECT id, name, addr, vars, groups, owner FROM hosts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to query host by id")?;
        Ok(row.map(Host::from))
    }

    pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<Host>> {
        let row = sqlx::query_as::<_, HostRow>(
            "SELECT id, name, addr, vars, groups, owner FROM hosts WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to query host by name")?;
        Ok(row.map(Host::from))
    }

    pub async fn find_all(pool: &PgPool) -> Result<Vec<Host>> {
        let rows = sqlx::query_as::<_, HostRow>(
            "SELECT id, name, addr, vars, groups, owner FROM hosts ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .context("failed to query hosts")?;
        Ok(rows.into_iter().map(Host::from).collect())
    }

    /// Insert a host that doesn't exist yet, by name.
    pub async fn create(pool: &PgPool, new: &NewHost) -> Result<Host> {
        let vars_json = JsonValue::Object(
            new.vars
                .iter()
                .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                .collect(),
        );
        let row = sqlx::query_as::<_, HostRow>(
            "INSERT INTO hosts (name, addr, vars, groups, owner)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, name, addr, vars, groups, owner",
        )
        .bind(&new.name)
        .bind(&new.addr)
        .bind(vars_json)
        .bind(&new.groups)
        .bind(&new.owner)
        .fetch_one(pool)
        .await
        .context("failed to create host")?;
        Ok(Host::from(row))
    }

    /// Overwrite an existing host's fields. Inventory reimport is the only
    /// writer; nothing else mutates a host after import.
    pub async fn update(pool: &PgPool, id: i64, new: &NewHost) -> Result<Host> {
        let vars_json = JsonValue::Object(
            new.vars
                .iter()
                .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                .collect(),
        );
        let row = sqlx::query_as::<_, HostRow>(
            "UPDATE hosts SET addr = $2, vars = $3, groups = $4, owner = $5
             WHERE id = $1
             RETURNING id, name, addr, vars, groups, owner",
        )
        .bind(id)
        .bind(&new.addr)
        .bind(vars_json)
        .bind(&new.groups)
        .bind(&new.owner)
        .fetch_one(pool)
        .await
        .context("failed to update host")?;
        Ok(Host::from(row))
    }

    /// Upsert by name: update in place if known, otherwise insert.
    pub async fn upsert(pool: &PgPool, new: &NewHost) -> Result<Host> {
        match Host::find_by_name(pool, &new.name).await? {
            Some(existing) => Host::update(pool, existing.id, new).await,
            None => Host::create(pool, new).await,
        }
    }

    /// Delete hosts absent from the latest inventory reimport. Cascades to
    /// stacks and containers on that host.
    pub async fn delete_absent(pool: &PgPool, known_names: &[String]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM hosts WHERE NOT (name = ANY($1))")
            .bind(known_names)
            .execute(pool)
            .await
            .context("failed to prune absent hosts")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_database_url() -> Option<String> {
        std::env::var("DDUI_TEST_DATABASE_URL").ok()
    }

    async fn setup() -> Option<PgPool> {
        let url = test_database_url()?;
        let pool = PgPool::connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        sqlx::query("TRUNCATE hosts CASCADE")
            .execute(&pool)
            .await
            .unwrap();
        Some(pool)
    }

    #[tokio::test]
    async fn test_create_and_find_host() {
        let Some(pool) = setup().await else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };

        let mut vars = HashMap::new();
        vars.insert("owner".to_string(), "infra".to_string());

        let new = NewHost {
            name: "anchorage".to_string(),
            addr: "10.30.1.122".to_string(),
            vars,
            groups: vec!["edge".to_string()],
            owner: "infra".to_string(),
        };

        let created = Host::create(&pool, &new).await.unwrap();
        assert_eq!(created.name, "anchorage");
        assert_eq!(created.vars.get("owner"), Some(&"infra".to_string()));

        let found = Host::find_by_name(&pool, "anchorage").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.groups, vec!["edge".to_string()]);
    }

    #[tokio::test]
    async fn test_upsert_updates_existing() {
        let Some(pool) = setup().await else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };

        let new = NewHost {
            name: "anchorage".to_string(),
            addr: "10.30.1.122".to_string(),
            vars: HashMap::new(),
            groups: vec![],
            owner: "unassigned".to_string(),
        };
        let first = Host::upsert(&pool, &new).await.unwrap();

        let updated = NewHost {
            addr: "10.30.1.200".to_string(),
            ..new
        };
        let second = Host::upsert(&pool, &updated).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.addr, "10.30.1.200");
    }

    #[tokio::test]
    async fn test_delete_absent_prunes_missing_hosts() {
        let Some(pool) = setup().await else {
            eprintln!("skipping: DDUI_TEST_DATABASE_URL not set");
            return;
        };

        for name in ["anchorage", "harbor"] {
            Host::create(
                &pool,
                &NewHost {
                    name: name.to_string(),
                    addr: "10.0.0.1".to_string(),
                    vars: HashMap::new(),
                    groups: vec![],
                    owner: "unassigned".to_string(),
                },
            )
            .await
            .unwrap();
        }

        Host::delete_absent(&pool, &["anchorage".to_string()]).await.unwrap();

        assert!(Host::find_by_name(&pool, "harbor").await.unwrap().is_none());
        assert!(Host::find_by_name(&pool, "anchorage").await.unwrap().is_some());
    }
}
