//! Configuration types for the VBMS client.

use crate::error::{VbmsError, VbmsResult};
use crate::namespaces::Endpoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the VBMS client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service base URL; endpoint paths are appended to it
    pub base_url: String,

    /// Station user id sent in the `vbmsext:userId` header of claim calls
    pub user_id: String,

    /// Mutual TLS and SAML material
    pub credentials: CredentialsConfig,

    /// Endpoint paths per service category
    pub endpoints: EndpointsConfig,

    /// HTTP transport settings
    pub transport: TransportConfig,

    /// External signing program
    pub signing: CommandConfig,

    /// External decryption program
    pub decryption: CommandConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user_id: "dslogon.1011239249".to_string(),
            credentials: CredentialsConfig::default(),
            endpoints: EndpointsConfig::default(),
            transport: TransportConfig::default(),
            signing: CommandConfig::signing_default(),
            decryption: CommandConfig::decryption_default(),
        }
    }
}

impl ClientConfig {
    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> VbmsResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| VbmsError::Config(format!("Invalid YAML: {}", e)))
    }

    /// Build a configuration for the named environment from `CONNECT_VBMS_*`
    /// variables. File entries are resolved against `$CONNECT_VBMS_ENV_DIR/<env>`.
    pub fn from_env(env_name: &str) -> VbmsResult<Self> {
        Self::from_lookup(env_name, |key| std::env::var(key).ok())
    }

    fn from_lookup(env_name: &str, lookup: impl Fn(&str) -> Option<String>) -> VbmsResult<Self> {
        let env_root = lookup("CONNECT_VBMS_ENV_DIR").ok_or_else(|| {
            VbmsError::Config("CONNECT_VBMS_ENV_DIR is not set".to_string())
        })?;
        let env_dir = Path::new(&env_root).join(env_name);
        let file = |key: &str| -> VbmsResult<Option<PathBuf>> {
            lookup(key)
                .filter(|v| !v.is_empty())
                .map(|v| absolutize(&env_dir.join(v)))
                .transpose()
        };

        let mut config = Self {
            base_url: lookup("CONNECT_VBMS_URL").unwrap_or_default(),
            credentials: CredentialsConfig {
                key_file: file("CONNECT_VBMS_KEY")?,
                key_password: lookup("CONNECT_VBMS_KEYPASS"),
                cert_file: file("CONNECT_VBMS_CERT")?,
                ca_cert_file: file("CONNECT_VBMS_CACERT")?,
                saml_assertion: file("CONNECT_VBMS_SAML")?,
            },
            ..Default::default()
        };

        let keystore = file("CONNECT_VBMS_KEYFILE")?;
        config.signing.keystore = keystore.clone();
        config.decryption.keystore = keystore;
        Ok(config)
    }

    /// Check the configuration is usable before a client is built from it.
    pub fn validate(&self) -> VbmsResult<()> {
        if self.base_url.is_empty() {
            return Err(VbmsError::Config("base_url is required".to_string()));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| VbmsError::Config(format!("Invalid base_url '{}': {}", self.base_url, e)))?;
        self.credentials.bundle()?;
        if self.transport.retry.max_attempts == 0 {
            return Err(VbmsError::Config(
                "transport.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.signing.program.is_empty() {
            return Err(VbmsError::Config("signing.program is required".to_string()));
        }
        Ok(())
    }

    /// Full URL for an endpoint category.
    pub fn endpoint_url(&self, endpoint: Endpoint) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.endpoints.path(endpoint)
        )
    }
}

fn absolutize(path: &Path) -> VbmsResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Credential settings as they appear in configuration. Either every field
/// is set or none is.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Client private key (PEM, optionally encrypted) or PKCS#12 bundle
    pub key_file: Option<PathBuf>,
    /// Passphrase for the key
    pub key_password: Option<String>,
    /// Client certificate (PEM)
    pub cert_file: Option<PathBuf>,
    /// CA certificate trusted for the service (PEM)
    pub ca_cert_file: Option<PathBuf>,
    /// SAML assertion injected into the WS-Security header
    pub saml_assertion: Option<PathBuf>,
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("key_file", &self.key_file)
            .field("key_password", &self.key_password.as_ref().map(|_| "<redacted>"))
            .field("cert_file", &self.cert_file)
            .field("ca_cert_file", &self.ca_cert_file)
            .field("saml_assertion", &self.saml_assertion)
            .finish()
    }
}

impl CredentialsConfig {
    /// Resolve into a bundle. `Ok(None)` means unauthenticated mode.
    pub fn bundle(&self) -> VbmsResult<Option<CredentialBundle>> {
        match (
            &self.key_file,
            &self.key_password,
            &self.cert_file,
            &self.ca_cert_file,
            &self.saml_assertion,
        ) {
            (None, None, None, None, None) => Ok(None),
            (Some(key), Some(pass), Some(cert), Some(ca), Some(saml)) => {
                Ok(Some(CredentialBundle {
                    key_file: key.clone(),
                    key_password: pass.clone(),
                    cert_file: cert.clone(),
                    ca_cert_file: ca.clone(),
                    saml_assertion_path: saml.clone(),
                }))
            }
            _ => {
                let missing: Vec<&str> = [
                    ("key_file", self.key_file.is_none()),
                    ("key_password", self.key_password.is_none()),
                    ("cert_file", self.cert_file.is_none()),
                    ("ca_cert_file", self.ca_cert_file.is_none()),
                    ("saml_assertion", self.saml_assertion.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, absent)| absent.then_some(name))
                .collect();
                Err(VbmsError::Config(format!(
                    "Partial credentials, missing: {}",
                    missing.join(", ")
                )))
            }
        }
    }
}

/// A complete set of credentials for mutual TLS and the SAML header.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub key_file: PathBuf,
    pub key_password: String,
    pub cert_file: PathBuf,
    pub ca_cert_file: PathBuf,
    pub saml_assertion_path: PathBuf,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("key_file", &self.key_file)
            .field("key_password", &"<redacted>")
            .field("cert_file", &self.cert_file)
            .field("ca_cert_file", &self.ca_cert_file)
            .field("saml_assertion_path", &self.saml_assertion_path)
            .finish()
    }
}

/// Endpoint paths, appended to `base_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub claims: String,
    pub efolder_read_inline: String,
    pub edocument: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            claims: Endpoint::Claims.default_path().to_string(),
            efolder_read_inline: Endpoint::EfolderReadInline.default_path().to_string(),
            edocument: Endpoint::Edocument.default_path().to_string(),
        }
    }
}

impl EndpointsConfig {
    pub fn path(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Claims => &self.claims,
            Endpoint::EfolderReadInline => &self.efolder_read_inline,
            Endpoint::Edocument => &self.edocument,
        }
    }
}

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP/TLS connect timeout
    pub connect_timeout_secs: u64,

    /// Whole-request timeout, overridable per call
    pub request_timeout_secs: u64,

    /// Retry policy for connection failures
    pub retry: RetryConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            request_timeout_secs: 120,
            retry: RetryConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Retry policy. Only connection failures are retried; TLS failures and
/// SOAP faults never are. The default is a single attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Base delay, doubled after each failed attempt
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 500,
        }
    }
}

/// An external program invoked as a signing or decryption collaborator.
///
/// Arguments may contain `{input}`, `{marks}`, `{keyfile}`, `{keypass}` and
/// `{operation}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Directory the program runs in
    pub working_dir: Option<PathBuf>,
    /// Keystore handed to the program as `{keyfile}`; falls back to the
    /// credential bundle's key file
    pub keystore: Option<PathBuf>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self::signing_default()
    }
}

impl CommandConfig {
    pub fn signing_default() -> Self {
        Self {
            program: "java".to_string(),
            args: [
                "-classpath",
                ".:../lib/*",
                "EncryptSOAPDocument",
                "{input}",
                "{keyfile}",
                "{keypass}",
                "{operation}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            working_dir: None,
            keystore: None,
        }
    }

    pub fn decryption_default() -> Self {
        Self {
            program: "java".to_string(),
            args: ["-classpath", ".:../lib/*", "DecryptMessage", "{input}", "{keyfile}", "{keypass}"]
                .into_iter()
                .map(String::from)
                .collect(),
            working_dir: None,
            keystore: None,
        }
    }
}
