//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

/// Main federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    pub instance: InstanceConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Local instance identity
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Public domain (e.g., "events.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
    /// Human-readable instance name
    #[serde(default = "default_instance_name")]
    pub name: String,
}

impl InstanceConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://events.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

fn default_instance_name() -> String {
    "Almanac".to_string()
}

/// Actor resolution settings
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Cached actor TTL in seconds (default: 86400 = 24h)
    #[serde(default = "default_actor_ttl_seconds")]
    pub actor_ttl_seconds: u64,
    /// Per-request timeout for discovery lookups, in seconds
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            actor_ttl_seconds: default_actor_ttl_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl ResolverConfig {
    pub fn actor_ttl(&self) -> Duration {
        Duration::from_secs(self.actor_ttl_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn default_actor_ttl_seconds() -> u64 {
    86_400
}

fn default_request_timeout_seconds() -> u64 {
    5
}

/// Outbound delivery settings
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Initial retry delay in seconds (default: 30)
    #[serde(default = "default_base_delay_seconds")]
    pub base_delay_seconds: u64,
    /// Ceiling for the retry delay in seconds (default: 3600)
    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: u64,
    /// Total delivery attempts before an item is dropped (default: 8)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Multiplier applied to the delay between attempts (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: default_base_delay_seconds(),
            max_delay_seconds: default_max_delay_seconds(),
            max_attempts: default_max_attempts(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_base_delay_seconds() -> u64 {
    30
}

fn default_max_delay_seconds() -> u64 {
    3_600
}

fn default_max_attempts() -> u32 {
    8
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl FederationConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (ALMANAC_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::FederationError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("instance.protocol", "https")?
            .set_default("instance.name", default_instance_name())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("ALMANAC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let federation_config: Self = config.try_deserialize()?;
        federation_config.validate()?;
        Ok(federation_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::FederationError> {
        use crate::error::FederationError;

        if !self.instance.protocol.eq_ignore_ascii_case("http")
            && !self.instance.protocol.eq_ignore_ascii_case("https")
        {
            return Err(FederationError::Validation(format!(
                "instance.protocol must be http or https, got {}",
                self.instance.protocol
            )));
        }

        if !is_local_instance_domain(&self.instance.domain)
            && !self.instance.protocol.eq_ignore_ascii_case("https")
        {
            return Err(FederationError::Validation(
                "instance.protocol must be https for non-local domains".to_string(),
            ));
        }

        if self.delivery.max_attempts == 0 {
            return Err(FederationError::Validation(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.delivery.backoff_multiplier < 1.0 {
            return Err(FederationError::Validation(
                "delivery.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        if self.resolver.actor_ttl_seconds == 0 {
            return Err(FederationError::Validation(
                "resolver.actor_ttl_seconds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_instance_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_instance_domain(domain: &str) -> bool {
    let host = normalized_instance_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
