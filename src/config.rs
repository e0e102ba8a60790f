//! Configuration management
//!
//! Everything is environment-driven in deployment (the variable names are
//! part of the service contract); an optional YAML file covers local runs.
//! Precedence: file, then environment.

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Message bus connection
    pub nats: NatsConfig,
    /// Which identity-provider adapter to construct at startup
    pub provider: ProviderKind,
    /// Hosted-provider settings (used when `provider = hosted`)
    pub hosted: HostedConfig,
    /// Local-provider settings (used when `provider = local`)
    pub local: LocalConfig,
    /// Liveness/readiness sidecar
    pub sidecar: SidecarConfig,
    /// How long in-flight handlers get to drain on shutdown.
    /// Must exceed the bus request timeout and stay below the container's
    /// termination grace period.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nats: NatsConfig::default(),
            provider: ProviderKind::default(),
            hosted: HostedConfig::default(),
            local: LocalConfig::default(),
            sidecar: SidecarConfig::default(),
            shutdown_timeout: Duration::from_secs(25),
        }
    }
}

/// Identity-provider selector (`USER_REPOSITORY_TYPE`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-memory provider for development and tests
    #[default]
    Mock,
    /// Hosted identity provider behind a management API
    Hosted,
    /// Local identity provider fed from a KV bucket
    Local,
}

/// Message bus connection settings (`NATS_*`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,
    /// Connect and request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Reconnect attempts before giving up
    pub max_reconnect: usize,
    /// Delay between reconnect attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_wait: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            timeout: Duration::from_secs(10),
            max_reconnect: 3,
            reconnect_wait: Duration::from_secs(2),
        }
    }
}

/// Hosted-provider settings (`IDP_*`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostedConfig {
    /// Tenant name; required when the hosted provider is selected
    pub tenant: String,
    /// Tenant domain; defaults to `{tenant}.auth0.com`
    pub domain: String,
    /// Machine client id
    pub client_id: String,
    /// Base64-encoded PEM RSA private key for client assertions
    pub private_base64_key: String,
    /// Management API audience; defaults to `https://{domain}/api/v2/`
    pub audience: String,
}

impl HostedConfig {
    /// The tenant domain, derived from the tenant name when unset.
    #[must_use]
    pub fn resolved_domain(&self) -> String {
        if self.domain.is_empty() {
            format!("{}.auth0.com", self.tenant)
        } else {
            self.domain.clone()
        }
    }

    /// The management audience, derived from the domain when unset.
    #[must_use]
    pub fn resolved_audience(&self) -> String {
        if self.audience.is_empty() {
            format!("https://{}/api/v2/", self.resolved_domain())
        } else {
            self.audience.clone()
        }
    }

    /// Fail fast on settings the adapter cannot start without.
    pub fn validate(&self) -> Result<()> {
        if self.tenant.is_empty() {
            return Err(Error::Validation("IDP_TENANT is required".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(Error::Validation("IDP_CLIENT_ID is required".to_string()));
        }
        if self.private_base64_key.is_empty() {
            return Err(Error::Validation(
                "IDP_PRIVATE_BASE64_KEY is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local-provider settings (`CONFIGMAP_*`, `DAEMONSET_NAME`, `SECRET_NAME`,
/// `OIDC_USERINFO_URL`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// ConfigMap receiving the hash-free projection index
    pub configmap_name: String,
    /// Namespace of the projected artifacts and the IdP daemonset
    pub configmap_namespace: String,
    /// DaemonSet to restart after a projection
    pub daemonset_name: String,
    /// Secret receiving the full users document
    pub secret_name: String,
    /// Userinfo endpoint used to resolve inbound bearer tokens
    pub oidc_userinfo_url: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            configmap_name: "authelia-users".to_string(),
            configmap_namespace: "lfx".to_string(),
            daemonset_name: "lfx-platform-authelia".to_string(),
            secret_name: "authelia-users".to_string(),
            oidc_userinfo_url: "https://auth.k8s.orb.local/api/oidc/userinfo".to_string(),
        }
    }
}

/// Liveness/readiness sidecar settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Variables mapped into the `local` section.
const LOCAL_VARS: &[&str] = &[
    "CONFIGMAP_NAME",
    "CONFIGMAP_NAMESPACE",
    "DAEMONSET_NAME",
    "SECRET_NAME",
    "OIDC_USERINFO_URL",
];

impl Config {
    /// Load configuration from an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Validation(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment
            .merge(Env::prefixed("NATS_").map(|k| format!("nats.{k}").into()).split("."))
            .merge(Env::prefixed("IDP_").map(|k| format!("hosted.{k}").into()).split("."))
            .merge(
                Env::raw()
                    .only(LOCAL_VARS)
                    .map(|k| format!("local.{k}").into())
                    .split("."),
            )
            .merge(
                Env::raw()
                    .only(&["USER_REPOSITORY_TYPE"])
                    .map(|_| "provider".into()),
            )
            .merge(
                Env::prefixed("SIDECAR_")
                    .map(|k| format!("sidecar.{k}").into())
                    .split("."),
            );

        figment
            .extract()
            .map_err(|e| Error::Validation(e.to_string()))
    }
}
