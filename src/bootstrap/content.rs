//! Bootstrap payload content
//!
//! The payload is opaque to the reconciler. The default provider renders a
//! shell script that installs the system agent from the management server
//! and registers with the token fingerprint, so the agent can later prove it
//! holds the matching credential.

use std::sync::Arc;

use async_trait::async_trait;
use aws_lc_rs::digest::{digest, SHA256};
use minijinja::{context, Environment};

#[cfg(test)]
use mockall::automock;

use super::settings::{SettingsReader, CA_CERTS_SETTING, SERVER_URL_SETTING};
use crate::{Error, Result};

const INSTALL_TEMPLATE_NAME: &str = "install.sh";

const INSTALL_TEMPLATE: &str = r#"#!/usr/bin/env sh
set -eu

curl -sfL '{{ server_url }}/system-agent-install.sh' | sh -s - \
  --server '{{ server_url }}' \
  --label 'cattle.io/os=linux' \
  --token '{{ token }}'{% if ca_checksum %} \
  --ca-checksum '{{ ca_checksum }}'{% endif %}
"#;

/// Produces the bootstrap payload for a token fingerprint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapContent: Send + Sync {
    /// Render the payload embedding `token_hash`
    async fn render(&self, token_hash: &str) -> Result<Vec<u8>>;
}

/// Agent install script keyed by the `server-url` and `cacerts` settings
pub struct InstallScript {
    settings: Arc<dyn SettingsReader>,
}

impl InstallScript {
    /// Create a provider reading settings from `settings`
    pub fn new(settings: Arc<dyn SettingsReader>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BootstrapContent for InstallScript {
    async fn render(&self, token_hash: &str) -> Result<Vec<u8>> {
        let server_url = self
            .settings
            .get(SERVER_URL_SETTING)
            .await?
            .ok_or_else(|| {
                Error::internal(
                    "bootstrap-content",
                    format!("setting {SERVER_URL_SETTING} is not configured"),
                )
            })?;
        let ca_checksum = self
            .settings
            .get(CA_CERTS_SETTING)
            .await?
            .map(|pem| ca_checksum(&pem));

        render_install_script(&server_url, token_hash, ca_checksum.as_deref())
    }
}

/// Hex SHA-256 of the CA bundle, as checked by the agent installer
pub fn ca_checksum(pem: &str) -> String {
    digest(&SHA256, pem.as_bytes())
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn render_install_script(
    server_url: &str,
    token_hash: &str,
    ca_checksum: Option<&str>,
) -> Result<Vec<u8>> {
    // Values are single-quoted in the script and cannot close the quote.
    for (field, value) in [("server URL", server_url), ("token hash", token_hash)] {
        if value.contains('\'') {
            return Err(Error::validation(format!(
                "{field} contains a single quote: {value}"
            )));
        }
    }

    let mut env = Environment::new();
    env.add_template(INSTALL_TEMPLATE_NAME, INSTALL_TEMPLATE)
        .map_err(|e| Error::internal("bootstrap-content", e.to_string()))?;

    let rendered = env
        .get_template(INSTALL_TEMPLATE_NAME)
        .and_then(|t| {
            t.render(context! {
                server_url => server_url.trim_end_matches('/'),
                token => token_hash,
                ca_checksum => ca_checksum,
            })
        })
        .map_err(|e| Error::internal("bootstrap-content", e.to_string()))?;

    Ok(rendered.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::settings::MockSettingsReader;

    fn settings(server_url: Option<&str>, cacerts: Option<&str>) -> Arc<dyn SettingsReader> {
        let server_url = server_url.map(str::to_string);
        let cacerts = cacerts.map(str::to_string);
        let mut mock = MockSettingsReader::new();
        mock.expect_get().returning(move |name| {
            Ok(match name {
                SERVER_URL_SETTING => server_url.clone(),
                CA_CERTS_SETTING => cacerts.clone(),
                _ => None,
            })
        });
        Arc::new(mock)
    }

    /// Story: a new node runs the script and registers with the fingerprint
    #[tokio::test]
    async fn story_script_embeds_server_and_token_hash() {
        let provider = InstallScript::new(settings(Some("https://rancher.example.com/"), None));
        let script = String::from_utf8(provider.render("abc123=").await.unwrap()).unwrap();

        assert!(script.starts_with("#!/usr/bin/env sh"));
        assert!(script.contains(
            "curl -sfL 'https://rancher.example.com/system-agent-install.sh' | sh -s -"
        ));
        assert!(script.contains("--server 'https://rancher.example.com' \\"));
        assert!(script.contains("--token 'abc123='"));
        assert!(!script.contains("--ca-checksum"));
    }

    /// Story: with a private CA the node verifies the bundle it downloads
    #[tokio::test]
    async fn story_private_ca_adds_checksum() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let provider = InstallScript::new(settings(Some("https://r.example"), Some(pem)));
        let script = String::from_utf8(provider.render("t").await.unwrap()).unwrap();

        let checksum = ca_checksum(pem);
        assert_eq!(checksum.len(), 64);
        assert!(script.contains(&format!("--ca-checksum '{checksum}'")));
    }

    /// Story: without a server URL there is nothing a node could call back to
    #[tokio::test]
    async fn story_missing_server_url_is_an_error() {
        let provider = InstallScript::new(settings(None, None));
        let err = provider.render("t").await.unwrap_err();
        assert!(err.to_string().contains("server-url"));
    }

    /// Story: a server-url setting with shell syntax in it never reaches a node
    #[tokio::test]
    async fn story_server_url_cannot_break_out_of_quotes() {
        let provider = InstallScript::new(settings(
            Some("https://r.example/'; id; echo '"),
            None,
        ));
        let err = provider.render("t").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_url_with_shell_metacharacters_stays_quoted() {
        let provider = InstallScript::new(settings(Some("https://r.example/a$(id)&b"), None));
        let script = String::from_utf8(provider.render("t").await.unwrap()).unwrap();
        assert!(script.contains("--server 'https://r.example/a$(id)&b' \\"));
    }

    #[tokio::test]
    async fn test_same_inputs_render_identical_bytes() {
        let provider = InstallScript::new(settings(Some("https://r.example"), Some("ca")));
        let first = provider.render("h").await.unwrap();
        let second = provider.render("h").await.unwrap();
        assert_eq!(first, second);
    }
}
