//! Publishing `dns-01` challenge records.
//!
//! A [`ChallengeProvider`] puts the proof for one domain into DNS and takes it out again. Two
//! backends exist:
//!
//! - [`ZoneFileProvider`] writes a zone file per challenge for the self-hosted DNS server;
//! - [`RecordApiProvider`] drives a [`RecordApi`] such as [`CloudflareApi`], and is wrapped in a
//!   [`CleaningProvider`] that purges stale records and waits for propagation first.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::eyre;

use crate::config::{Config, ProviderConfig};

mod cleaning;
mod cloudflare;
mod propagation;
mod record_api;
mod zonefile;

pub use self::{
    cleaning::{CleaningProvider, CleaningWaits},
    cloudflare::CloudflareApi,
    propagation::ResolverPropagation,
    record_api::RecordApiProvider,
    zonefile::ZoneFileProvider,
};

/// TTL of challenge TXT records.
pub const CHALLENGE_TTL: u32 = 60;

/// `_acme-challenge.<domain>`, with any wildcard prefix or trailing dot removed.
pub fn challenge_fqdn(domain: &str) -> String {
    let domain = domain.trim_end_matches('.');
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    format!("_acme-challenge.{domain}")
}

/// The TXT record proving control over `domain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub domain: String,
    pub fqdn: String,
    /// base64url(SHA-256(key authorization))
    pub value: String,
}

impl ChallengeRecord {
    pub fn new(domain: impl Into<String>, value: impl Into<String>) -> Self {
        let domain = domain.into();
        ChallengeRecord {
            fqdn: challenge_fqdn(&domain),
            domain,
            value: value.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DnsApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DNS API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no DNS zone found for {0}")]
    ZoneNotFound(String),

    #[error("API token contains invalid characters")]
    InvalidToken,
}

/// A record as the DNS API reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRecord {
    pub id: String,
    pub name: String,
    pub record_type: String,
    pub content: String,
}

/// A record to create through a [`RecordApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord<'a> {
    pub record_type: &'a str,
    pub name: &'a str,
    pub content: &'a str,
    pub ttl: u32,
}

/// CRUD over the records of one zone.
#[async_trait]
pub trait RecordApi: Send + Sync {
    /// Records named `name`, optionally only those of `record_type`.
    async fn list_records(
        &self,
        name: &str,
        record_type: Option<&str>,
    ) -> Result<Vec<ApiRecord>, DnsApiError>;

    async fn create_record(&self, record: &NewRecord<'_>) -> Result<ApiRecord, DnsApiError>;

    async fn delete_record(&self, id: &str) -> Result<(), DnsApiError>;
}

/// Publishes and withdraws challenge records.
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    async fn present(&self, record: &ChallengeRecord) -> eyre::Result<()>;

    async fn clean_up(&self, record: &ChallengeRecord) -> eyre::Result<()>;
}

/// Whether a TXT value is visible to the outside world yet.
#[async_trait]
pub trait PropagationCheck: Send + Sync {
    async fn is_visible(&self, fqdn: &str, expected: &str) -> bool;
}

/// A record of the served zone, relative to the base domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// Leftmost label(s); empty for the zone apex.
    pub name: String,
    pub record_type: String,
}

impl DnsRecord {
    pub fn new(name: impl Into<String>, record_type: impl Into<String>) -> Self {
        DnsRecord {
            name: name.into(),
            record_type: record_type.into(),
        }
    }
}

/// Lists the records currently served, for SAN reconciliation.
#[async_trait]
pub trait RecordLister: Send + Sync {
    async fn list_records(&self) -> eyre::Result<Vec<DnsRecord>>;
}

/// Builds the challenge provider selected by `config.dns.provider`.
///
/// The Cloudflare backend discovers its zone from `config.domain`, so this talks to the API.
pub async fn provider_from_config(config: &Config) -> eyre::Result<Arc<dyn ChallengeProvider>> {
    match &config.dns.provider {
        ProviderConfig::Zonefile { zones_path } => {
            log::info!("Using zone files in {} for DNS-01", zones_path.display());
            Ok(Arc::new(ZoneFileProvider::new(zones_path)))
        }

        ProviderConfig::Cloudflare { api_token, api_url } => {
            let token = api_token
                .as_deref()
                .filter(|token| !token.is_empty())
                .ok_or_else(|| eyre!("Cloudflare provider needs an API token"))?;

            let api = Arc::new(
                CloudflareApi::discover(token.to_owned(), api_url.as_deref(), &config.domain)
                    .await?,
            );
            log::info!("Using Cloudflare zone {} for DNS-01", api.zone_id());

            let propagation =
                ResolverPropagation::new(&config.resolver_addrs()?, config.dns_timeout());

            Ok(Arc::new(CleaningProvider::new(
                Arc::new(RecordApiProvider::new(Arc::clone(&api) as Arc<dyn RecordApi>)),
                api,
                Arc::new(propagation),
                CleaningWaits::from_config(config),
            )))
        }
    }
}
