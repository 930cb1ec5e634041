//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! email = "ops@example.com"
//! domain = "zone.example.com"
//! cert_file = "/etc/zone/tls/cert.pem"
//! key_file = "/etc/zone/tls/key.pem"
//! production = false
//!
//! [renewal]
//! renew_before_hours = 720
//! check_interval_hours = 24
//!
//! [dns]
//! resolvers = ["8.8.8.8:53", "1.1.1.1:53"]
//!
//! [dns.provider]
//! kind = "zonefile"
//! zones_path = "/etc/coredns/zones"
//! ```

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    backoff::Environment,
    dns::CleaningWaits,
    domains::{DEFAULT_DOMAIN_BACKUP_COUNT, DEFAULT_DOMAIN_STORAGE_PATH},
    DirectoryUrl,
};

pub const CLOUDFLARE_TOKEN_ENV: &str = "CLOUDFLARE_API_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} is required but not provided")]
    Missing(&'static str),

    #[error("invalid DNS resolver address {0:?}; expected ip:port")]
    InvalidResolver(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// ACME account contact.
    pub email: String,

    /// Base domain of the certificate.
    pub domain: String,

    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    /// Overrides the Let's Encrypt directory picked by `production`.
    #[serde(default)]
    pub ca_dir_url: Option<String>,

    #[serde(default, alias = "use_production_certs")]
    pub production: bool,

    /// Skip TLS verification of the ACME server (test CAs only).
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Where `acme_user.json` and `acme_key.pem` live; defaults to the directory of `cert_file`.
    #[serde(default)]
    pub account_dir: Option<PathBuf>,

    #[serde(default)]
    pub renewal: RenewalConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenewalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_renew_before_hours")]
    pub renew_before_hours: u64,

    #[serde(default = "default_check_interval_hours")]
    pub check_interval_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Resolvers polled directly for propagation, as `ip:port`.
    #[serde(default = "default_resolvers")]
    pub resolvers: Vec<String>,

    /// Per-query timeout.
    #[serde(default = "default_dns_timeout_secs")]
    pub timeout_secs: u64,

    /// Overrides the environment default wait after purging stale records.
    #[serde(default)]
    pub cleanup_wait_secs: Option<u64>,

    /// Overrides the environment default wait before creating the challenge record.
    #[serde(default)]
    pub creation_wait_secs: Option<u64>,

    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Backend that publishes challenge records.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// One zone file per challenge, for the self-hosted DNS server.
    Zonefile { zones_path: PathBuf },

    /// Cloudflare v4 API. The token may come from `CLOUDFLARE_API_TOKEN` instead.
    Cloudflare {
        #[serde(default)]
        api_token: Option<String>,

        #[serde(default)]
        api_url: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_domain_storage_path")]
    pub domain_storage_path: PathBuf,

    #[serde(default = "default_domain_backup_count")]
    pub domain_backup_count: usize,
}

fn default_true() -> bool {
    true
}
fn default_renew_before_hours() -> u64 {
    720
}
fn default_check_interval_hours() -> u64 {
    24
}
fn default_resolvers() -> Vec<String> {
    vec!["8.8.8.8:53".to_owned(), "1.1.1.1:53".to_owned()]
}
fn default_dns_timeout_secs() -> u64 {
    10
}
fn default_domain_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_DOMAIN_STORAGE_PATH)
}
fn default_domain_backup_count() -> usize {
    DEFAULT_DOMAIN_BACKUP_COUNT
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            renew_before_hours: default_renew_before_hours(),
            check_interval_hours: default_check_interval_hours(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            resolvers: default_resolvers(),
            timeout_secs: default_dns_timeout_secs(),
            cleanup_wait_secs: None,
            creation_wait_secs: None,
            provider: ProviderConfig::default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Zonefile {
            zones_path: PathBuf::from("data/zones"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            domain_storage_path: default_domain_storage_path(),
            domain_backup_count: default_domain_backup_count(),
        }
    }
}

impl Config {
    /// Configuration with defaults for everything but the required fields.
    pub fn new(
        email: impl Into<String>,
        domain: impl Into<String>,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            email: email.into(),
            domain: domain.into(),
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ca_dir_url: None,
            production: false,
            insecure_skip_verify: false,
            account_dir: None,
            renewal: RenewalConfig::default(),
            dns: DnsConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses, applies environment overrides and validates.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let ProviderConfig::Cloudflare { api_token, .. } = &mut self.dns.provider {
            if let Some(token) = lookup(CLOUDFLARE_TOKEN_ENV).filter(|t| !t.is_empty()) {
                *api_token = Some(token);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.email.trim().is_empty() {
            return Err(ConfigError::Missing("email"));
        }
        if self.domain.trim().is_empty() {
            return Err(ConfigError::Missing("domain"));
        }
        if self.cert_file.as_os_str().is_empty() {
            return Err(ConfigError::Missing("cert_file"));
        }
        if self.key_file.as_os_str().is_empty() {
            return Err(ConfigError::Missing("key_file"));
        }
        if self.renewal.check_interval_hours == 0 {
            return Err(ConfigError::Zero("renewal.check_interval_hours"));
        }
        if self.dns.timeout_secs == 0 {
            return Err(ConfigError::Zero("dns.timeout_secs"));
        }

        if let ProviderConfig::Cloudflare { api_token, .. } = &self.dns.provider {
            if api_token.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Missing("dns.provider.api_token"));
            }
        }

        self.resolver_addrs()?;
        Ok(())
    }

    pub fn environment(&self) -> Environment {
        if self.production {
            Environment::Production
        } else {
            Environment::Staging
        }
    }

    pub fn directory_url(&self) -> DirectoryUrl<'_> {
        match (&self.ca_dir_url, self.environment()) {
            (Some(url), _) if !url.is_empty() => DirectoryUrl::Other(url),
            (_, Environment::Production) => DirectoryUrl::LetsEncrypt,
            (_, Environment::Staging) => DirectoryUrl::LetsEncryptStaging,
        }
    }

    pub fn account_dir(&self) -> PathBuf {
        match &self.account_dir {
            Some(dir) => dir.clone(),
            None => self
                .cert_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }

    pub fn renew_before(&self) -> Duration {
        hours(self.renewal.renew_before_hours)
    }

    pub fn check_interval(&self) -> Duration {
        hours(self.renewal.check_interval_hours)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns.timeout_secs)
    }

    /// Wait after stale challenge records were deleted, defaulting per environment.
    pub fn cleanup_wait(&self) -> Duration {
        match self.dns.cleanup_wait_secs {
            Some(secs) => Duration::from_secs(secs),
            None => CleaningWaits::for_environment(self.environment()).cleanup,
        }
    }

    /// Wait before creating the challenge record, defaulting per environment.
    pub fn creation_wait(&self) -> Duration {
        match self.dns.creation_wait_secs {
            Some(secs) => Duration::from_secs(secs),
            None => CleaningWaits::for_environment(self.environment()).creation,
        }
    }

    pub fn resolver_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.dns
            .resolvers
            .iter()
            .map(|r| {
                r.parse::<SocketAddr>()
                    .map_err(|_| ConfigError::InvalidResolver(r.clone()))
            })
            .collect()
    }
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        email = "ops@example.com"
        domain = "zone.example.com"
        cert_file = "/tls/cert.pem"
        key_file = "/tls/key.pem"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.environment(), Environment::Staging);
        assert!(matches!(config.directory_url(), DirectoryUrl::LetsEncryptStaging));
        assert!(config.renewal.enabled);
        assert_eq!(config.account_dir(), PathBuf::from("/tls"));
        assert_eq!(config.renew_before(), Duration::from_secs(720 * 3600));
        assert_eq!(config.check_interval(), Duration::from_secs(24 * 3600));
        assert_eq!(config.cleanup_wait(), Duration::from_secs(90));
        assert_eq!(config.creation_wait(), Duration::from_secs(60));
        assert_eq!(config.dns_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.resolver_addrs().unwrap(),
            ["8.8.8.8:53".parse().unwrap(), "1.1.1.1:53".parse().unwrap()]
        );
        assert_eq!(
            config.storage.domain_storage_path,
            PathBuf::from("data/certificate_domains.json")
        );
        assert_eq!(config.storage.domain_backup_count, 5);
    }

    #[test]
    fn production_waits_and_overrides() {
        let config = Config::from_toml_str(&format!(
            r#"{MINIMAL}
            use_production_certs = true
            ca_dir_url = "https://pebble:14000/dir"

            [dns]
            cleanup_wait_secs = 5
            "#
        ))
        .unwrap();

        assert_eq!(config.environment(), Environment::Production);
        assert_eq!(config.directory_url().to_url(), "https://pebble:14000/dir");
        assert_eq!(config.cleanup_wait(), Duration::from_secs(5));
        assert_eq!(config.creation_wait(), Duration::from_secs(90));
    }

    #[test]
    fn default_waits_follow_cleaning_provider() {
        let mut config = Config::new("ops@example.com", "zone.example.com", "c", "k");

        for production in [false, true] {
            config.production = production;
            let waits = CleaningWaits::for_environment(config.environment());

            assert_eq!(config.cleanup_wait(), waits.cleanup);
            assert_eq!(config.creation_wait(), waits.creation);
            assert_eq!(CleaningWaits::from_config(&config), waits);
        }
    }

    #[test]
    fn missing_fields_are_rejected() {
        let err = Config::from_toml_str(
            r#"
            email = ""
            domain = "zone.example.com"
            cert_file = "c"
            key_file = "k"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("email")));

        assert!(matches!(
            Config::from_toml_str("email = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn bad_resolver_is_rejected() {
        let err = Config::from_toml_str(&format!(
            "{MINIMAL}\n[dns]\nresolvers = [\"8.8.8.8\"]\n"
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidResolver(r) if r == "8.8.8.8"));
    }

    #[test]
    fn cloudflare_token_from_environment() {
        let mut config: Config = toml::from_str(&format!(
            "{MINIMAL}\n[dns.provider]\nkind = \"cloudflare\"\n"
        ))
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("dns.provider.api_token"))
        ));

        config.apply_env_overrides(|key| {
            (key == CLOUDFLARE_TOKEN_ENV).then(|| "secret-token".to_owned())
        });
        config.validate().unwrap();

        assert_eq!(
            config.dns.provider,
            ProviderConfig::Cloudflare {
                api_token: Some("secret-token".to_owned()),
                api_url: None,
            }
        );
    }
}
