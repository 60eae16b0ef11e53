use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::config::AzureConfig;

const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::minutes(5);

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: OffsetDateTime,
}

impl AccessToken {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.expires_on - REFRESH_MARGIN > now
    }
}

/// Source of bearer tokens for the management API.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self) -> Result<AccessToken>;

    fn name(&self) -> &'static str;
}

/// Picks the credential for the deployment environment: the platform
/// managed identity in production, the default chain everywhere else.
pub fn for_environment(config: &AzureConfig, http: Client) -> Arc<dyn TokenCredential> {
    let managed =
        ManagedIdentityCredential::from_env(http.clone(), config.managed_identity_client_id.clone());
    if config.is_production() {
        return Arc::new(managed);
    }

    let mut chain: Vec<Box<dyn TokenCredential>> = Vec::new();
    if let Some(secret) = ClientSecretCredential::from_env(http) {
        chain.push(Box::new(secret));
    }
    chain.push(Box::new(AzureCliCredential::new()));
    chain.push(Box::new(managed));
    Arc::new(DefaultCredential::new(chain))
}

#[derive(Default)]
struct TokenCache {
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<AccessToken>>,
    {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if token.is_fresh(OffsetDateTime::now_utc()) {
                return Ok(token.clone());
            }
        }

        let token = fetch().await?;
        *current = Some(token.clone());
        Ok(token)
    }
}

// Managed identity

pub struct ManagedIdentityCredential {
    http: Client,
    client_id: Option<String>,
    app_service: Option<(String, String)>,
    cache: TokenCache,
}

impl ManagedIdentityCredential {
    /// Uses the App Service identity endpoint when the platform exposes one,
    /// otherwise the instance metadata service.
    pub fn from_env(http: Client, client_id: Option<String>) -> Self {
        let app_service = match (
            std::env::var("IDENTITY_ENDPOINT"),
            std::env::var("IDENTITY_HEADER"),
        ) {
            (Ok(endpoint), Ok(header)) => Some((endpoint, header)),
            _ => None,
        };

        Self {
            http,
            client_id,
            app_service,
            cache: TokenCache::default(),
        }
    }

    async fn fetch(&self) -> Result<AccessToken> {
        let mut query = vec![("resource", MANAGEMENT_RESOURCE)];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let request = match &self.app_service {
            Some((endpoint, header)) => {
                query.push(("api-version", "2019-08-01"));
                self.http.get(endpoint).header("X-IDENTITY-HEADER", header)
            }
            None => {
                query.push(("api-version", "2018-02-01"));
                self.http.get(IMDS_ENDPOINT).header("Metadata", "true")
            }
        };

        let response = request
            .query(&query)
            .send()
            .await
            .context("Failed to reach managed identity endpoint")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Managed identity endpoint returned {}: {}", status, body);
        }

        let token: ManagedIdentityToken = response
            .json()
            .await
            .context("Failed to parse managed identity token response")?;
        token.into_access_token()
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self) -> Result<AccessToken> {
        self.cache.get_or_fetch(|| self.fetch()).await
    }

    fn name(&self) -> &'static str {
        "managed identity"
    }
}

#[derive(Debug, Deserialize)]
struct ManagedIdentityToken {
    access_token: String,
    expires_on: NumberOrString,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

impl ManagedIdentityToken {
    fn into_access_token(self) -> Result<AccessToken> {
        let seconds = match self.expires_on {
            NumberOrString::Number(n) => n,
            NumberOrString::String(s) => s
                .trim()
                .parse()
                .with_context(|| format!("Invalid expires_on value: {}", s))?,
        };
        Ok(AccessToken {
            token: self.access_token,
            expires_on: OffsetDateTime::from_unix_timestamp(seconds)
                .context("expires_on out of range")?,
        })
    }
}

// Service principal with client secret

pub struct ClientSecretCredential {
    http: Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    cache: TokenCache,
}

impl ClientSecretCredential {
    /// Reads `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`.
    pub fn from_env(http: Client) -> Option<Self> {
        let var = |key: &str| std::env::var(key).ok().filter(|v: &String| !v.is_empty());
        Some(Self {
            http,
            tenant_id: var("AZURE_TENANT_ID")?,
            client_id: var("AZURE_CLIENT_ID")?,
            client_secret: var("AZURE_CLIENT_SECRET")?,
            cache: TokenCache::default(),
        })
    }

    async fn fetch(&self) -> Result<AccessToken> {
        let url = format!("{}/{}/oauth2/v2.0/token", AUTHORITY_HOST, self.tenant_id);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", MANAGEMENT_SCOPE),
        ];

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .context("Failed to send token request to Microsoft Entra ID")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Token request failed with {}: {}", status, body);
        }

        let token: ClientSecretToken = response
            .json()
            .await
            .context("Failed to parse token response")?;
        Ok(AccessToken {
            token: token.access_token,
            expires_on: OffsetDateTime::now_utc() + Duration::seconds(token.expires_in),
        })
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self) -> Result<AccessToken> {
        self.cache.get_or_fetch(|| self.fetch()).await
    }

    fn name(&self) -> &'static str {
        "client secret"
    }
}

#[derive(Debug, Deserialize)]
struct ClientSecretToken {
    access_token: String,
    expires_in: i64,
}

// Azure CLI

#[derive(Default)]
pub struct AzureCliCredential {
    cache: TokenCache,
}

impl AzureCliCredential {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `az` invocation; the child is killed if the fetch is dropped.
    fn command() -> tokio::process::Command {
        let mut command = tokio::process::Command::new("az");
        command
            .args([
                "account",
                "get-access-token",
                "--resource",
                MANAGEMENT_RESOURCE,
                "--output",
                "json",
            ])
            .kill_on_drop(true);
        command
    }

    async fn fetch(&self) -> Result<AccessToken> {
        let output = Self::command()
            .output()
            .await
            .context("Failed to run the Azure CLI")?;

        if !output.status.success() {
            bail!(
                "Azure CLI exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let token: CliToken =
            serde_json::from_slice(&output.stdout).context("Failed to parse Azure CLI output")?;
        token.into_access_token(OffsetDateTime::now_utc())
    }
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    async fn get_token(&self) -> Result<AccessToken> {
        self.cache.get_or_fetch(|| self.fetch()).await
    }

    fn name(&self) -> &'static str {
        "azure cli"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    #[serde(rename = "expires_on", default)]
    expires_on: Option<i64>,
}

impl CliToken {
    /// Older CLI versions only report a local-time `expiresOn`; those tokens
    /// are treated as short-lived.
    fn into_access_token(self, now: OffsetDateTime) -> Result<AccessToken> {
        let expires_on = match self.expires_on {
            Some(seconds) => OffsetDateTime::from_unix_timestamp(seconds)
                .context("expires_on out of range")?,
            None => now + REFRESH_MARGIN + Duration::minutes(5),
        };
        Ok(AccessToken {
            token: self.access_token,
            expires_on,
        })
    }
}

// Default chain

/// Tries each credential in order and sticks with the first that works.
pub struct DefaultCredential {
    chain: Vec<Box<dyn TokenCredential>>,
    selected: AtomicUsize,
}

impl DefaultCredential {
    pub fn new(chain: Vec<Box<dyn TokenCredential>>) -> Self {
        Self {
            chain,
            selected: AtomicUsize::new(usize::MAX),
        }
    }
}

#[async_trait]
impl TokenCredential for DefaultCredential {
    async fn get_token(&self) -> Result<AccessToken> {
        if let Some(credential) = self.chain.get(self.selected.load(Ordering::Acquire)) {
            return credential.get_token().await;
        }

        let mut failures = Vec::with_capacity(self.chain.len());
        for (idx, credential) in self.chain.iter().enumerate() {
            match credential.get_token().await {
                Ok(token) => {
                    info!("Authenticating with {} credential", credential.name());
                    self.selected.store(idx, Ordering::Release);
                    return Ok(token);
                }
                Err(e) => {
                    debug!("{} credential unavailable: {:#}", credential.name(), e);
                    failures.push(format!("{}: {:#}", credential.name(), e));
                }
            }
        }

        bail!("No credential in the chain could authenticate ({})", failures.join("; "))
    }

    fn name(&self) -> &'static str {
        "default"
    }
}
