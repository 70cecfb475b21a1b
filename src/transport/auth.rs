//! Per-provider request authentication.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use gcp_auth::{CustomServiceAccount, TokenProvider};
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;

use super::TransportError;

const GCE_SCOPE: &str = "https://www.googleapis.com/auth/compute";
const AZURE_LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";
const AZURE_MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Authentication scheme applied to every outgoing request.
#[derive(Clone)]
pub enum Auth {
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// A single static header such as `X-Auth-Token`.
    Header {
        /// Header name.
        name: &'static str,
        /// Header value.
        value: String,
    },
    /// OAuth2 access tokens minted from a Google service account.
    Google(Arc<CustomServiceAccount>),
    /// OAuth2 client-credentials tokens for Azure Resource Manager.
    Azure(Arc<AzureCredentials>),
    /// OVH application signatures.
    Ovh(OvhCredentials),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self {
            Self::Bearer(_) => "Bearer",
            Self::Header { name, .. } => *name,
            Self::Google(_) => "Google",
            Self::Azure(_) => "Azure",
            Self::Ovh(_) => "Ovh",
        };
        f.debug_tuple("Auth").field(&scheme).finish()
    }
}

impl Auth {
    /// Parses a Google service account key.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Auth`] when the key is not valid JSON.
    pub fn google_service_account(key_json: &str) -> Result<Self, TransportError> {
        let account =
            CustomServiceAccount::from_json(key_json).map_err(|err| TransportError::Auth {
                message: format!("invalid service account key: {err}"),
            })?;
        Ok(Self::Google(Arc::new(account)))
    }

    pub(super) async fn headers(
        &self,
        client: &reqwest::Client,
        request: &reqwest::Request,
    ) -> Result<Vec<(String, String)>, TransportError> {
        match self {
            Self::Bearer(token) => Ok(vec![bearer(token)]),
            Self::Header { name, value } => Ok(vec![((*name).to_owned(), value.clone())]),
            Self::Google(account) => {
                let token = account
                    .token(&[GCE_SCOPE])
                    .await
                    .map_err(|err| TransportError::Auth {
                        message: err.to_string(),
                    })?;
                Ok(vec![bearer(token.as_str())])
            }
            Self::Azure(credentials) => {
                let token = credentials.access_token(client).await?;
                Ok(vec![bearer(&token)])
            }
            Self::Ovh(credentials) => Ok(credentials.sign(request, unix_now())),
        }
    }
}

fn bearer(token: &str) -> (String, String) {
    (String::from("Authorization"), format!("Bearer {token}"))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureAuthFile {
    client_id: String,
    client_secret: String,
    tenant_id: String,
    subscription_id: String,
    #[serde(default)]
    active_directory_endpoint_url: Option<String>,
}

#[derive(Deserialize)]
struct AzureTokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Service principal credentials read from an Azure SDK auth file.
pub struct AzureCredentials {
    client_id: String,
    client_secret: String,
    tenant_id: String,
    subscription_id: String,
    login_endpoint: String,
    cached: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("client_id", &self.client_id)
            .field("tenant_id", &self.tenant_id)
            .field("subscription_id", &self.subscription_id)
            .finish_non_exhaustive()
    }
}

impl AzureCredentials {
    /// Parses the JSON produced by `az ad sp create-for-rbac --sdk-auth`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Auth`] when required keys are missing.
    pub fn from_auth_file(contents: &str) -> Result<Self, TransportError> {
        let file: AzureAuthFile =
            serde_json::from_str(contents).map_err(|err| TransportError::Auth {
                message: format!("invalid Azure auth file: {err}"),
            })?;
        Ok(Self {
            client_id: file.client_id,
            client_secret: file.client_secret,
            tenant_id: file.tenant_id,
            subscription_id: file.subscription_id,
            login_endpoint: file
                .active_directory_endpoint_url
                .map_or_else(|| AZURE_LOGIN_ENDPOINT.to_owned(), |url| {
                    url.trim_end_matches('/').to_owned()
                }),
            cached: Mutex::new(None),
        })
    }

    /// Returns the subscription named in the auth file.
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    async fn access_token(&self, client: &reqwest::Client) -> Result<String, TransportError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN
        {
            return Ok(token.value.clone());
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.login_endpoint, self.tenant_id);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", AZURE_MANAGEMENT_SCOPE),
        ];
        let response = client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|err| TransportError::Auth {
                message: err.to_string(),
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| TransportError::Auth {
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(TransportError::Auth {
                message: format!("token endpoint returned {status}: {body}"),
            });
        }
        let parsed: AzureTokenResponse =
            serde_json::from_str(&body).map_err(|err| TransportError::Auth {
                message: err.to_string(),
            })?;
        let value = parsed.access_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(parsed.expires_in),
        });
        Ok(value)
    }
}

/// Application credentials for the OVH API.
#[derive(Clone)]
pub struct OvhCredentials {
    application_key: String,
    application_secret: String,
    consumer_key: String,
}

impl fmt::Debug for OvhCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OvhCredentials")
            .field("application_key", &self.application_key)
            .finish_non_exhaustive()
    }
}

impl OvhCredentials {
    /// Creates OVH credentials.
    #[must_use]
    pub fn new(
        application_key: impl Into<String>,
        application_secret: impl Into<String>,
        consumer_key: impl Into<String>,
    ) -> Self {
        Self {
            application_key: application_key.into(),
            application_secret: application_secret.into(),
            consumer_key: consumer_key.into(),
        }
    }

    fn sign(&self, request: &reqwest::Request, timestamp: u64) -> Vec<(String, String)> {
        let body = request
            .body()
            .and_then(reqwest::Body::as_bytes)
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        let signature = self.signature(
            request.method().as_str(),
            request.url().as_str(),
            &body,
            timestamp,
        );
        vec![
            (
                String::from("X-Ovh-Application"),
                self.application_key.clone(),
            ),
            (String::from("X-Ovh-Consumer"), self.consumer_key.clone()),
            (String::from("X-Ovh-Timestamp"), timestamp.to_string()),
            (String::from("X-Ovh-Signature"), signature),
        ]
    }

    fn signature(&self, method: &str, url: &str, body: &str, timestamp: u64) -> String {
        let payload = format!(
            "{}+{}+{method}+{url}+{body}+{timestamp}",
            self.application_secret, self.consumer_key
        );
        let digest = Sha1::digest(payload.as_bytes());
        let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        format!("$1${hex}")
    }
}
