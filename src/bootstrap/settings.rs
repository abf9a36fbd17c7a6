//! Cluster-wide settings lookup
//!
//! Settings live in cluster-scoped `management.cattle.io/v3` `Setting`
//! objects with top-level `value` and `default` fields. They are read through
//! the [`SettingsReader`] trait so tests can substitute fixed values.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Setting holding the externally reachable URL of the management server
pub const SERVER_URL_SETTING: &str = "server-url";

/// Setting holding the PEM CA bundle agents should trust
pub const CA_CERTS_SETTING: &str = "cacerts";

/// Read-only access to cluster-wide settings
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SettingsReader: Send + Sync {
    /// Effective value of a setting, `None` if unset or missing
    async fn get(&self, name: &str) -> Result<Option<String>>;
}

/// Settings backed by `Setting` objects in the management API group
pub struct KubeSettings {
    client: Client,
    resource: ApiResource,
}

impl KubeSettings {
    /// Create a reader using the given client
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("management.cattle.io", "v3", "Setting");
        Self {
            client,
            resource: ApiResource::from_gvk_with_plural(&gvk, "settings"),
        }
    }
}

#[async_trait]
impl SettingsReader for KubeSettings {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.resource);
        let setting = api.get_opt(name).await?;
        let value = setting.as_ref().and_then(|s| effective_value(&s.data));
        trace!(setting = %name, present = value.is_some(), "read setting");
        Ok(value)
    }
}

/// `value` if non-empty, else `default` if non-empty
pub fn effective_value(data: &serde_json::Value) -> Option<String> {
    ["value", "default"]
        .iter()
        .filter_map(|field| data.get(field).and_then(|v| v.as_str()))
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_wins_over_default() {
        let data = json!({"value": "https://rancher.example.com", "default": "https://x"});
        assert_eq!(
            effective_value(&data).as_deref(),
            Some("https://rancher.example.com")
        );
    }

    #[test]
    fn test_empty_value_falls_back_to_default() {
        let data = json!({"value": "", "default": "https://fallback"});
        assert_eq!(effective_value(&data).as_deref(), Some("https://fallback"));
    }

    #[test]
    fn test_unset_setting_is_none() {
        assert_eq!(effective_value(&json!({"value": "", "default": ""})), None);
        assert_eq!(effective_value(&json!({})), None);
    }
}
