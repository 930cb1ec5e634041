//! Durable record of which hostnames the certificate must cover.

use std::{path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::persist::{BlobStore, FileStore, PersistError};

pub const DEFAULT_DOMAIN_STORAGE_PATH: &str = "data/certificate_domains.json";
pub const DEFAULT_DOMAIN_BACKUP_COUNT: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum DomainStoreError {
    #[error("certificate domains have not been initialized")]
    NotFound,

    #[error("cannot remove base domain {0} from certificate")]
    CannotRemoveBaseDomain(String),

    #[error("invalid domain {0:?}")]
    InvalidDomain(String),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("malformed certificate domains document: {0}")]
    Json(#[from] serde_json::Error),
}

/// The certificate's base domain and its additional SANs.
///
/// `base_domain` is never part of `san_domains`, and `san_domains` holds no duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDomains {
    pub base_domain: String,

    #[serde(default)]
    pub san_domains: Vec<String>,

    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl CertificateDomains {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            san_domains: Vec::new(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Base domain first, then SANs in insertion order.
    pub fn all_domains(&self) -> Vec<String> {
        std::iter::once(&self.base_domain)
            .chain(&self.san_domains)
            .cloned()
            .collect()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.base_domain == domain || self.san_domains.iter().any(|d| d == domain)
    }

    /// Drops duplicates and the base domain from the SAN list, keeping first occurrences.
    fn normalize(&mut self) {
        let base = &self.base_domain;
        let mut seen = std::collections::HashSet::new();
        self.san_domains
            .retain(|d| d != base && seen.insert(d.clone()));
    }
}

/// Serialized access to the persisted [`CertificateDomains`].
pub struct DomainStore {
    blob: Box<dyn BlobStore>,
    // held across each read-modify-write
    lock: Mutex<()>,
}

impl DomainStore {
    pub fn new(blob: impl BlobStore + 'static) -> Self {
        Self {
            blob: Box::new(blob),
            lock: Mutex::new(()),
        }
    }

    /// A store at `path` keeping `backup_count` numbered backups.
    pub fn open(path: impl Into<PathBuf>, backup_count: usize) -> Arc<Self> {
        Arc::new(Self::new(FileStore::new(path, backup_count)))
    }

    pub fn exists(&self) -> bool {
        self.blob.exists()
    }

    pub fn load(&self) -> Result<CertificateDomains, DomainStoreError> {
        let _guard = self.lock.lock();
        self.load_unlocked()
    }

    /// Persists `domains`, stamping `updated_at` with the current time.
    pub fn save(&self, domains: &mut CertificateDomains) -> Result<(), DomainStoreError> {
        let _guard = self.lock.lock();
        self.save_unlocked(domains)
    }

    /// Creates the document with an empty SAN list unless one already exists.
    pub fn ensure_initialized(
        &self,
        base_domain: &str,
    ) -> Result<CertificateDomains, DomainStoreError> {
        let _guard = self.lock.lock();

        match self.load_unlocked() {
            Ok(existing) => {
                if existing.base_domain != base_domain {
                    log::warn!(
                        "Stored base domain {} differs from configured {base_domain}",
                        existing.base_domain
                    );
                }
                Ok(existing)
            }
            Err(DomainStoreError::NotFound) => {
                log::info!("Initializing certificate domains with base domain {base_domain}");
                let mut domains = CertificateDomains::new(base_domain);
                self.save_unlocked(&mut domains)?;
                Ok(domains)
            }
            Err(err) => Err(err),
        }
    }

    /// Appends `domain` to the SANs. Returns whether the store changed.
    pub fn add_domain(&self, domain: &str) -> Result<bool, DomainStoreError> {
        let domain = clean_domain(domain)?;

        let _guard = self.lock.lock();
        let mut domains = self.load_unlocked()?;

        if domains.contains(domain) {
            log::debug!("Domain {domain} already covered");
            return Ok(false);
        }

        domains.san_domains.push(domain.to_owned());
        self.save_unlocked(&mut domains)?;
        log::info!("Added {domain} to certificate SANs");
        Ok(true)
    }

    /// Removes `domain` from the SANs. Returns whether the store changed.
    pub fn remove_domain(&self, domain: &str) -> Result<bool, DomainStoreError> {
        let domain = clean_domain(domain)?;

        let _guard = self.lock.lock();
        let mut domains = self.load_unlocked()?;

        if domains.base_domain == domain {
            return Err(DomainStoreError::CannotRemoveBaseDomain(domain.to_owned()));
        }

        let before = domains.san_domains.len();
        domains.san_domains.retain(|d| d != domain);

        if domains.san_domains.len() == before {
            log::debug!("Domain {domain} not in certificate SANs");
            return Ok(false);
        }

        self.save_unlocked(&mut domains)?;
        log::info!("Removed {domain} from certificate SANs");
        Ok(true)
    }

    fn load_unlocked(&self) -> Result<CertificateDomains, DomainStoreError> {
        let data = self.blob.read()?.ok_or(DomainStoreError::NotFound)?;
        let mut domains: CertificateDomains = serde_json::from_slice(&data)?;
        domains.normalize();
        Ok(domains)
    }

    fn save_unlocked(&self, domains: &mut CertificateDomains) -> Result<(), DomainStoreError> {
        domains.normalize();
        domains.updated_at = OffsetDateTime::now_utc();

        let data = serde_json::to_vec_pretty(domains)?;
        self.blob.write(&data)?;
        Ok(())
    }
}

/// Surrounding whitespace is not part of a name.
fn clean_domain(domain: &str) -> Result<&str, DomainStoreError> {
    let domain = domain.trim();
    if domain.is_empty() {
        return Err(DomainStoreError::InvalidDomain(domain.to_owned()));
    }
    Ok(domain)
}

impl std::fmt::Debug for DomainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainStore").finish_non_exhaustive()
    }
}
