//! Bootstrap payload resolution
//!
//! A machine's bootstrap service account is declared by the reconciler, but
//! its token secret is attached later by Kubernetes. [`BootstrapResolver`]
//! turns that token into the computed bootstrap secret once it exists, and
//! reports "nothing yet" until then.

pub mod content;
pub mod settings;
pub mod token;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

pub use content::{BootstrapContent, InstallScript};
pub use settings::{KubeSettings, SettingsReader};
pub use token::{token_hash, JoinToken, TOKEN_KEY};

use crate::{Error, Result, BOOTSTRAP_DATA_KEY, BOOTSTRAP_SECRET_TYPE};

/// Read access to service accounts and their token secrets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Get a service account, `None` if it does not exist
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>>;

    /// Get a secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// Derives a machine's bootstrap secret from its service account token
pub struct BootstrapResolver {
    credentials: Arc<dyn CredentialSource>,
    content: Arc<dyn BootstrapContent>,
}

impl BootstrapResolver {
    /// Create a resolver over the given credential source and content provider
    pub fn new(credentials: Arc<dyn CredentialSource>, content: Arc<dyn BootstrapContent>) -> Self {
        Self {
            credentials,
            content,
        }
    }

    /// Compute the bootstrap secret for service account `namespace/name`.
    ///
    /// Returns `Ok(None)` while the service account or its token reference
    /// does not exist. A referenced secret that is missing, or references
    /// that carry no token at all, are errors: a broken payload must not be
    /// masked as "not ready".
    pub async fn resolve(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let Some(sa) = self.credentials.get_service_account(namespace, name).await? else {
            debug!(namespace = %namespace, service_account = %name, "bootstrap service account not created yet");
            return Ok(None);
        };

        let refs = sa.secrets.unwrap_or_default();
        if refs.is_empty() {
            debug!(namespace = %namespace, service_account = %name, "no token secret attached yet");
            return Ok(None);
        }

        let Some(token) = self.first_token(namespace, name, &refs).await? else {
            return Err(Error::bootstrap(
                name,
                format!("none of {} referenced secrets has a {TOKEN_KEY} key", refs.len()),
            ));
        };

        let payload = self.content.render(&token.hash()).await?;
        Ok(Some(bootstrap_secret(namespace, name, payload)))
    }

    async fn first_token(
        &self,
        namespace: &str,
        name: &str,
        refs: &[k8s_openapi::api::core::v1::ObjectReference],
    ) -> Result<Option<JoinToken>> {
        for secret_ref in refs {
            let Some(secret_name) = secret_ref.name.as_deref() else {
                continue;
            };
            let secret = self
                .credentials
                .get_secret(namespace, secret_name)
                .await?
                .ok_or_else(|| Error::not_found("Secret", namespace, secret_name))?;

            if let Some(token) = secret.data.as_ref().and_then(|d| d.get(TOKEN_KEY)) {
                debug!(service_account = %name, secret = %secret_name, "found token secret");
                return Ok(Some(JoinToken::new(token.0.clone())));
            }
        }
        Ok(None)
    }
}

/// Computed secret holding a bootstrap payload under [`BOOTSTRAP_DATA_KEY`]
pub fn bootstrap_secret(namespace: &str, name: &str, payload: Vec<u8>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            BOOTSTRAP_DATA_KEY.to_string(),
            ByteString(payload),
        )])),
        type_: Some(BOOTSTRAP_SECRET_TYPE.to_string()),
        ..Default::default()
    }
}
