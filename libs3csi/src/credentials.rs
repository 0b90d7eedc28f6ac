//! Credential resolution.
//!
//! A volume's S3 credentials come either from a secret referenced in the
//! volume context (`secretNamespace` + `secretName`) or from the secrets sent
//! inline with the request.  The referenced secret always wins.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument};
use url::Url;

use crate::error::CsiError;
use crate::mounter::MounterKind;
use crate::secrets::SecretStore;

pub const SECRET_NAMESPACE_KEY: &str = "secretNamespace";
pub const SECRET_NAME_KEY: &str = "secretName";

const ACCESS_KEY_ID_KEY: &str = "accessKeyID";
const SECRET_ACCESS_KEY_KEY: &str = "secretAccessKey";
const ENDPOINT_KEY: &str = "endpoint";
const REGION_KEY: &str = "region";
const MOUNTER_KEY: &str = "mounter";

pub const DEFAULT_REGION: &str = "us-east-1";

/// S3 credentials and the client settings derived from them.
///
/// Built once per request and never mutated afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Endpoint URL as supplied, e.g. `https://s3.example.com:9000`.
    pub endpoint: String,
    pub region: String,
    /// Preferred mount backend, if the secret names one.
    pub mounter: Option<MounterKind>,
    /// `true` when the endpoint scheme is `https`.
    pub use_ssl: bool,
    /// `host[:port]` part of the endpoint.
    pub host: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("mounter", &self.mounter)
            .finish()
    }
}

fn required<'a>(secrets: &'a HashMap<String, String>, key: &str) -> Result<&'a str, CsiError> {
    match secrets.get(key).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(CsiError::Configuration(format!(
            "credential field {key} is missing"
        ))),
    }
}

impl Credentials {
    /// Build credentials from a secret's key/value pairs.
    pub fn from_secrets(secrets: &HashMap<String, String>) -> Result<Self, CsiError> {
        let access_key_id = required(secrets, ACCESS_KEY_ID_KEY)?.to_owned();
        let secret_access_key = required(secrets, SECRET_ACCESS_KEY_KEY)?.to_owned();
        let endpoint = required(secrets, ENDPOINT_KEY)?.to_owned();

        let url = Url::parse(&endpoint)
            .map_err(|e| CsiError::Configuration(format!("invalid endpoint {endpoint:?}: {e}")))?;
        let use_ssl = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(CsiError::Configuration(format!(
                    "unsupported endpoint scheme {other:?}"
                )));
            }
        };
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_owned(),
            (None, _) => {
                return Err(CsiError::Configuration(format!(
                    "endpoint {endpoint:?} has no host"
                )));
            }
        };

        let region = secrets
            .get(REGION_KEY)
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
            .to_owned();

        let mounter = secrets
            .get(MOUNTER_KEY)
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(str::parse::<MounterKind>)
            .transpose()?;

        Ok(Self {
            access_key_id,
            secret_access_key,
            endpoint,
            region,
            mounter,
            use_ssl,
            host,
        })
    }
}

/// Where a volume's credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// A secret named in the volume context.
    SecretRef { namespace: String, name: String },
    /// The secrets sent with the request.
    Inline,
}

impl CredentialSource {
    /// Pick the source: the referenced secret if both keys are present and
    /// non-empty, the inline secrets otherwise.
    pub fn for_context(volume_context: &HashMap<String, String>) -> Self {
        let namespace = volume_context.get(SECRET_NAMESPACE_KEY).filter(|v| !v.is_empty());
        let name = volume_context.get(SECRET_NAME_KEY).filter(|v| !v.is_empty());
        match (namespace, name) {
            (Some(namespace), Some(name)) => Self::SecretRef {
                namespace: namespace.clone(),
                name: name.clone(),
            },
            _ => Self::Inline,
        }
    }
}

/// Resolves [`Credentials`] for a request.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn SecretStore>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all)]
    pub async fn resolve(
        &self,
        volume_context: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<Credentials, CsiError> {
        match CredentialSource::for_context(volume_context) {
            CredentialSource::SecretRef { namespace, name } => {
                debug!(%namespace, %name, "using referenced secret");
                let data = self.store.get(&namespace, &name).await.map_err(|e| match e {
                    CsiError::Configuration(_) => e,
                    other => CsiError::Configuration(format!(
                        "fetch secret {namespace}/{name}: {other}"
                    )),
                })?;
                Credentials::from_secrets(&data)
            }
            CredentialSource::Inline => {
                debug!("using inline request secrets");
                Credentials::from_secrets(secrets)
            }
        }
    }
}
