use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub azure: AzureConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureConfig {
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub resource_group_name: String,
    #[serde(default)]
    pub zone_name: String,
    /// Deployment environment; `Production` selects the managed identity credential.
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Client id of a user-assigned managed identity.
    #[serde(default)]
    pub managed_identity_client_id: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "Development".to_string()
}

fn default_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            resource_group_name: String::new(),
            zone_name: String::new(),
            environment: default_environment(),
            endpoint: default_endpoint(),
            managed_identity_client_id: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl AzureConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

impl Config {
    /// Loads the configuration file (if any), applies environment overrides
    /// and checks that the zone scope is complete.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let azure = &mut self.azure;
        let overrides: [(&str, &mut String); 4] = [
            ("DDNS_SUBSCRIPTION_ID", &mut azure.subscription_id),
            ("DDNS_RESOURCE_GROUP", &mut azure.resource_group_name),
            ("DDNS_ZONE_NAME", &mut azure.zone_name),
            ("DDNS_ENVIRONMENT", &mut azure.environment),
        ];
        for (key, field) in overrides {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *field = value.trim().to_string();
            }
        }

        if let Some(client_id) =
            lookup("DDNS_MANAGED_IDENTITY_CLIENT_ID").filter(|v| !v.trim().is_empty())
        {
            azure.managed_identity_client_id = Some(client_id.trim().to_string());
        }
    }

    fn validate(&self) -> Result<()> {
        let required = [
            ("azure.subscription_id", &self.azure.subscription_id),
            ("azure.resource_group_name", &self.azure.resource_group_name),
            ("azure.zone_name", &self.azure.zone_name),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(key, _)| *key)
            .collect();

        if !missing.is_empty() {
            bail!("Missing required configuration: {}", missing.join(", "));
        }
        if self.azure.request_timeout_secs == 0 {
            bail!("azure.request_timeout_secs must be greater than zero");
        }

        Ok(())
    }
}
