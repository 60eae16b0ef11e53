use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Url};
use serde::Deserialize;

use super::{DnsClient, RecordSet, RecordType};
use crate::credential::TokenCredential;

const API_VERSION: &str = "2018-05-01";

/// Azure DNS record-set operations over the Resource Manager REST API.
pub struct AzureDnsClient {
    http: Client,
    credential: Arc<dyn TokenCredential>,
    endpoint: Url,
    subscription_id: String,
}

impl AzureDnsClient {
    pub fn new(
        http: Client,
        credential: Arc<dyn TokenCredential>,
        endpoint: &str,
        subscription_id: impl Into<String>,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid management endpoint: {}", endpoint))?;
        if endpoint.cannot_be_a_base() {
            bail!("Invalid management endpoint: {}", endpoint);
        }

        Ok(Self {
            http,
            credential,
            endpoint,
            subscription_id: subscription_id.into(),
        })
    }

    fn record_set_url(
        &self,
        resource_group: &str,
        zone: &str,
        name: &str,
        record_type: RecordType,
    ) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Invalid management endpoint: {}", self.endpoint))?
            .pop_if_empty()
            .extend([
                "subscriptions",
                self.subscription_id.as_str(),
                "resourceGroups",
                resource_group,
                "providers",
                "Microsoft.Network",
                "dnsZones",
                zone,
                record_type.as_str(),
                name,
            ]);
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }
}

#[async_trait]
impl DnsClient for AzureDnsClient {
    async fn create_or_update_record_set(
        &self,
        resource_group: &str,
        zone: &str,
        name: &str,
        record_type: RecordType,
        record_set: &RecordSet,
    ) -> Result<RecordSet> {
        let url = self.record_set_url(resource_group, zone, name, record_type)?;
        let token = self
            .credential
            .get_token()
            .await
            .context("Failed to acquire management API token")?;

        debug!("PUT {}", url);
        let response = self
            .http
            .put(url)
            .bearer_auth(&token.token)
            .json(record_set)
            .send()
            .await
            .context("Failed to send request to Azure DNS")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Azure DNS API error ({}): {}", status, describe_error(&body));
        }

        response
            .json()
            .await
            .context("Failed to parse Azure DNS response")
    }
}

// Resource Manager error envelope

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

fn describe_error(body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(response) => format!("{}: {}", response.error.code, response.error.message),
        Err(_) if body.trim().is_empty() => "no response body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}
