//! Policy Engine: decides whether a stack may be auto-deployed, walking the
//! override hierarchy stack -> host -> group(s) -> global setting -> env
//! fallback and returning the first defined value.

use crate::config::Config;
use crate::db::models::{GroupSetting, Host, HostSetting, IacStack, ScopeKind, SettingsCache};
use anyhow::Result;
use sqlx::PgPool;

const DEVOPS_APPLY_KEY: &str = "devops_apply";
const AUTO_APPLY_KEY: &str = "auto_apply";

/// Evaluate the first non-null override along the hierarchy in spec §4.6.
pub async fn should_auto_apply(
    pool: &PgPool,
    cache: &SettingsCache,
    config: &Config,
    stack: &IacStack,
) -> Result<bool> {
    if let Some(stack_override) = stack.auto_apply_override {
        return Ok(stack_override);
    }

    match stack.scope_kind.as_str() {
        "host" => {
            if let Some(host) = Host::find_by_name(pool, &stack.scope_name).await? {
                if let Some(value) = HostSetting::get(pool, cache, host.id, AUTO_APPLY_KEY).await? {
                    if let Some(b) = value.as_bool() {
                        return Ok(b);
                    }
                }
                let mut groups: Vec<String> = host.groups.clone();
                groups.sort();
                for group in &groups {
                    if let Some(value) = GroupSetting::get(pool, cache, group, AUTO_APPLY_KEY).await? {
                        if let Some(b) = value.as_bool() {
                            return Ok(b);
                        }
                    }
                }
            }
        }
        _ => {
            if let Some(value) = GroupSetting::get(pool, cache, &stack.scope_name, AUTO_APPLY_KEY).await? {
                if let Some(b) = value.as_bool() {
                    return Ok(b);
                }
            }
        }
    }

    if let Some(value) = crate::db::models::AppSetting::get(pool, cache, DEVOPS_APPLY_KEY).await? {
        if let Some(b) = value.as_bool() {
            return Ok(b);
        }
    }

    Ok(config.auto_apply_default)
}
