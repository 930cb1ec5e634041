//! Certificate lifecycle for the served zone.
//!
//! [`CertificateManager`] owns the ACME account, the certificate files on disk and the SAN list.
//! It obtains certificates through `dns-01`, renews them ahead of expiry and hands the result to a
//! [`TlsNotifier`].

use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::{bail, eyre, WrapErr as _};
use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    backoff,
    cert::{create_p256_key, CertificateInfo},
    config::Config,
    dns::{provider_from_config, ChallengeProvider, ChallengeRecord, RecordLister},
    domains::DomainStore,
    order::DnsChallenge,
    Account, Directory,
};

mod storage;
mod user;

pub use self::storage::CertificateFiles;
use self::user::{AccountStore, Registration};

/// Refreshes of an order or authorization before giving up on it.
const MAX_ORDER_POLLS: usize = 60;

const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(5);

/// Receives freshly obtained or restored certificates, typically to (re)load a TLS listener.
#[async_trait]
pub trait TlsNotifier: Send + Sync {
    async fn enable_tls(&self, domain: &str, cert_path: &Path, key_path: &Path)
        -> eyre::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    Uninitialized,
    Obtaining,
    Valid,
    Renewing,
    Failed,
}

pub struct CertificateManager {
    config: Config,
    files: CertificateFiles,
    accounts: AccountStore,
    provider: Arc<dyn ChallengeProvider>,
    domains: Option<Arc<DomainStore>>,
    notifier: RwLock<Option<Arc<dyn TlsNotifier>>>,
    lister: RwLock<Option<Arc<dyn RecordLister>>>,
    state: Mutex<CertState>,
    // held for the whole obtain, so issuances never overlap
    account: tokio::sync::Mutex<Option<Account>>,
    // held across SAN mutation plus re-obtain
    san_lock: tokio::sync::Mutex<()>,
    poll_delay: Duration,
}

impl CertificateManager {
    pub fn new(config: Config, provider: Arc<dyn ChallengeProvider>) -> eyre::Result<Self> {
        config.validate().wrap_err("invalid certificate configuration")?;

        let files = CertificateFiles::new(&config.cert_file, &config.key_file);
        let accounts = AccountStore::new(&config.account_dir());

        Ok(Self {
            config,
            files,
            accounts,
            provider,
            domains: None,
            notifier: RwLock::new(None),
            lister: RwLock::new(None),
            state: Mutex::new(CertState::Uninitialized),
            account: tokio::sync::Mutex::new(None),
            san_lock: tokio::sync::Mutex::new(()),
            poll_delay: DEFAULT_POLL_DELAY,
        })
    }

    /// Builds the configured challenge provider and opens the SAN store, creating it with just
    /// the base domain if it does not exist yet.
    pub async fn from_config(config: Config) -> eyre::Result<Self> {
        let provider = provider_from_config(&config).await?;

        let store = DomainStore::open(
            &config.storage.domain_storage_path,
            config.storage.domain_backup_count,
        );
        store.ensure_initialized(&config.domain)?;

        Ok(Self::new(config, provider)?.with_domain_store(store))
    }

    pub fn with_domain_store(mut self, store: Arc<DomainStore>) -> Self {
        self.domains = Some(store);
        self
    }

    /// Interval between order and authorization polls.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn files(&self) -> &CertificateFiles {
        &self.files
    }

    pub fn domain_store(&self) -> Option<&Arc<DomainStore>> {
        self.domains.as_ref()
    }

    pub fn set_tls_notifier(&self, notifier: Arc<dyn TlsNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    pub fn set_record_lister(&self, lister: Arc<dyn RecordLister>) {
        *self.lister.write() = Some(lister);
    }

    pub fn state(&self) -> CertState {
        *self.state.lock()
    }

    fn set_state(&self, state: CertState) {
        let mut current = self.state.lock();
        if *current != state {
            log::debug!("Certificate state {:?} -> {state:?}", *current);
            *current = state;
        }
    }

    /// The certificate currently on disk.
    pub fn certificate_info(&self) -> eyre::Result<CertificateInfo> {
        self.files.info()
    }

    /// Names to order for `domain`: the stored base domain and SANs, or just `domain` when no
    /// store is attached or it cannot be read.
    pub fn domains_for_certificate(&self, domain: &str) -> Vec<String> {
        let Some(store) = &self.domains else {
            return vec![domain.to_owned()];
        };

        match store.load() {
            Ok(domains) => {
                if domains.base_domain != domain {
                    log::warn!(
                        "Requested {domain} but stored base domain is {}; using stored domains",
                        domains.base_domain
                    );
                }
                domains.all_domains()
            }
            Err(err) => {
                log::warn!("Could not read certificate domains, using {domain} only: {err}");
                vec![domain.to_owned()]
            }
        }
    }

    /// Runs one complete issuance and installs the result.
    ///
    /// Challenge records are withdrawn whether or not validation succeeds. Nothing is written to
    /// the certificate files unless the whole order completes.
    pub async fn obtain_certificate(&self, domain: &str) -> eyre::Result<()> {
        let mut account = self.account.lock().await;

        self.set_state(match self.state() {
            CertState::Valid => CertState::Renewing,
            _ => CertState::Obtaining,
        });

        if let Err(err) = self.issue(&mut account, domain).await {
            self.set_state(CertState::Failed);
            return Err(err);
        }
        self.set_state(CertState::Valid);
        drop(account);

        if let Err(err) = self.notify_tls(domain).await {
            log::error!("Certificate for {domain} saved but enabling TLS failed: {err:#}");
        }

        Ok(())
    }

    /// [`obtain_certificate`](Self::obtain_certificate) under the CA-friendly retry schedule of
    /// the configured environment.
    pub async fn obtain_certificate_with_retry_rate_limit(&self, domain: &str) -> eyre::Result<()> {
        backoff::retry_with_rate_limit(self.config.environment(), || {
            self.obtain_certificate(domain)
        })
        .await
    }

    async fn issue(&self, cached: &mut Option<Account>, domain: &str) -> eyre::Result<()> {
        let domains = self.domains_for_certificate(domain);
        let (primary, alt_names) = domains
            .split_first()
            .ok_or_else(|| eyre!("no domains to certify"))?;
        let alt_names = alt_names.iter().map(String::as_str).collect::<Vec<_>>();

        log::info!("Obtaining certificate for {domains:?}");

        let account = self.acme_account(cached).await?;
        let order = account
            .new_order(primary, &alt_names)
            .await
            .wrap_err("failed to create order")?;

        for auth in order.authorizations().await? {
            if !auth.need_challenge() {
                log::debug!("Authorization for {} already valid", auth.domain_name());
                continue;
            }

            let challenge = auth
                .dns_challenge()
                .ok_or_else(|| eyre!("no dns-01 challenge offered for {}", auth.domain_name()))?;
            let record = ChallengeRecord::new(auth.domain_name(), challenge.dns_proof()?);

            let res = self.complete_challenge(&challenge, &record).await;

            if let Err(err) = self.provider.clean_up(&record).await {
                log::warn!("Failed to clean up challenge record {}: {err:#}", record.fqdn);
            }

            res?;
        }

        let order = order
            .wait_until_ready(self.poll_delay, MAX_ORDER_POLLS)
            .await?;
        let order = order
            .finalize_signing_key(create_p256_key(), self.poll_delay, MAX_ORDER_POLLS)
            .await?;
        let material = order.download_cert().await?;

        self.files.save(&material)?;

        let info = material.info()?;
        log::info!(
            "Obtained certificate for {primary}, valid until {}",
            info.not_after
        );
        Ok(())
    }

    async fn complete_challenge(
        &self,
        challenge: &DnsChallenge,
        record: &ChallengeRecord,
    ) -> eyre::Result<()> {
        self.provider
            .present(record)
            .await
            .wrap_err_with(|| format!("failed to publish challenge for {}", record.domain))?;

        if challenge.need_validate() {
            challenge.validate(self.poll_delay).await?;
        }

        log::info!("Validated {}", record.domain);
        Ok(())
    }

    /// The ACME account, registering and persisting it on first use.
    async fn acme_account(&self, cached: &mut Option<Account>) -> eyre::Result<Account> {
        if let Some(account) = cached {
            return Ok(account.clone());
        }

        let dir = Directory::fetch_insecure(
            self.config.directory_url(),
            self.config.insecure_skip_verify,
        )
        .await
        .wrap_err("failed to fetch ACME directory")?;

        let (mut user, key_pem) = self.accounts.load_or_create(&self.config.email)?;

        let account = match user.registration.clone() {
            Some(reg) => {
                log::info!("Using existing ACME account {}", reg.uri);
                dir.restore_account(&key_pem, &reg.uri, reg.body.clone())?
            }

            None => {
                log::info!("Registering ACME account for {}", user.email);
                let account = dir
                    .register_account_with_key(&key_pem, user.contact())
                    .await
                    .wrap_err("failed to register ACME account")?;

                user.registration = Some(Registration {
                    uri: account.key_id()?.to_owned(),
                    body: account.api_account().clone(),
                });

                if let Err(err) = self.accounts.save(&user, &key_pem) {
                    log::warn!("Failed to persist ACME account: {err:#}");
                }

                account
            }
        };

        *cached = Some(account.clone());
        Ok(account)
    }

    /// Returns `Ok(false)` when no notifier is set.
    async fn notify_tls(&self, domain: &str) -> eyre::Result<bool> {
        let notifier = self.notifier.read().clone();
        let Some(notifier) = notifier else {
            log::debug!("No TLS notifier set");
            return Ok(false);
        };

        notifier
            .enable_tls(domain, self.files.cert_path(), self.files.key_path())
            .await?;
        Ok(true)
    }

    fn required_store(&self) -> eyre::Result<&Arc<DomainStore>> {
        self.domains
            .as_ref()
            .ok_or_else(|| eyre!("no certificate domain store configured"))
    }

    /// Adds `domain` to the SANs and re-issues, also when the domain was already stored.
    ///
    /// The store keeps the new domain even if issuance fails; the next renewal picks it up.
    pub async fn add_domain_to_san(&self, domain: &str) -> eyre::Result<()> {
        let store = self.required_store()?;
        let _guard = self.san_lock.lock().await;

        if !store.add_domain(domain)? {
            log::debug!("{domain} already in SANs, re-issuing anyway");
        }

        self.obtain_certificate(&self.config.domain)
            .await
            .wrap_err_with(|| format!("added {domain} to SANs but re-issuing failed"))
    }

    /// Removes `domain` from the SANs and re-issues. The base domain cannot be removed.
    pub async fn remove_domain_from_san(&self, domain: &str) -> eyre::Result<()> {
        let store = self.required_store()?;
        let _guard = self.san_lock.lock().await;

        if !store.remove_domain(domain)? {
            log::debug!("{domain} not in SANs, re-issuing anyway");
        }

        self.obtain_certificate(&self.config.domain)
            .await
            .wrap_err_with(|| format!("removed {domain} from SANs but re-issuing failed"))
    }

    /// Renews when the certificate is missing or unreadable, expires within the configured
    /// window, or lacks a stored SAN. Returns whether a new certificate was obtained.
    pub async fn check_and_renew(&self, domain: &str) -> eyre::Result<bool> {
        let due = match self.files.info() {
            Ok(info) => {
                let left = info.time_until_expiry();
                let window = time::Duration::try_from(self.config.renew_before())
                    .unwrap_or(time::Duration::MAX);

                if let Some(missing) = self.first_uncovered(&info, domain) {
                    log::info!("Certificate for {domain} does not cover {missing}, re-issuing");
                    true
                } else if left > window {
                    log::info!(
                        "Certificate for {domain} not due for renewal, {} days left",
                        info.valid_days_left()
                    );
                    false
                } else {
                    log::info!(
                        "Certificate for {domain} due for renewal, expires {}",
                        info.not_after
                    );
                    true
                }
            }

            Err(err) => {
                log::warn!("No usable certificate for {domain}, obtaining one: {err:#}");
                true
            }
        };

        if !due {
            return Ok(false);
        }

        self.obtain_certificate_with_retry_rate_limit(domain)
            .await?;
        Ok(true)
    }

    /// Checks for renewal every check interval, forever. The first check happens one interval
    /// after the call.
    pub async fn start_renewal_loop(&self, domain: &str) {
        let period = self.config.check_interval();
        log::info!(
            "Starting renewal loop for {domain}, checking every {}h",
            period.as_secs() / 3600
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.check_and_renew(domain).await {
                Ok(true) => log::info!("Renewed certificate for {domain}"),
                Ok(false) => {}
                Err(err) => log::error!("Certificate renewal for {domain} failed: {err:#}"),
            }
        }
    }

    /// Reuses the certificate on disk if it is intact, unexpired and covers every wanted domain.
    /// The CA is not contacted.
    pub async fn restore_tls_with_existing_certificates(&self, domain: &str) -> eyre::Result<()> {
        if !self.files.exists() {
            bail!(
                "no certificate at {} and {}",
                self.files.cert_path().display(),
                self.files.key_path().display()
            );
        }

        let material = self.files.load()?;
        let info = material.info()?;

        if info.is_expired() {
            bail!("existing certificate expired at {}", info.not_after);
        }

        if let Some(missing) = self.first_uncovered(&info, domain) {
            bail!("existing certificate does not cover {missing}");
        }

        if !self.notify_tls(domain).await? {
            bail!("no TLS notifier set, cannot enable TLS for {domain}");
        }

        self.set_state(CertState::Valid);
        log::info!(
            "Restored certificate for {domain}, {} days left",
            info.valid_days_left()
        );
        Ok(())
    }

    fn first_uncovered(&self, info: &CertificateInfo, domain: &str) -> Option<String> {
        self.domains_for_certificate(domain)
            .into_iter()
            .find(|d| !info.covers(d))
    }

    /// Whether the certificate on disk covers `domain`. Without a certificate file the SAN store
    /// answers instead.
    pub fn check_domain_coverage(&self, domain: &str) -> bool {
        if !self.files.cert_path().exists() {
            return match &self.domains {
                Some(store) => store.load().is_ok_and(|domains| domains.contains(domain)),
                None => false,
            };
        }

        match self.files.info() {
            Ok(info) => info.covers(domain),
            Err(err) => {
                log::warn!("Cannot read certificate for coverage check: {err:#}");
                false
            }
        }
    }

    /// Adds a SAN for every named record of the zone that is not yet in the store, then
    /// re-issues once. Does nothing without a record lister or SAN store.
    pub async fn validate_and_update_san_domains(&self) -> eyre::Result<()> {
        let lister = self.lister.read().clone();
        let (Some(lister), Some(store)) = (lister, &self.domains) else {
            log::debug!("Skipping SAN reconciliation, no record lister or domain store");
            return Ok(());
        };

        let records = lister
            .list_records()
            .await
            .wrap_err("failed to list DNS records")?;

        let _guard = self.san_lock.lock().await;
        let current = store.load()?;

        let mut seen = HashSet::new();
        let mut added = Vec::new();

        for record in records {
            let name = record.name.trim();
            if name.is_empty() {
                continue;
            }

            let fqdn = format!("{name}.{}", current.base_domain);
            if current.contains(&fqdn) || !seen.insert(fqdn.clone()) {
                continue;
            }

            if store.add_domain(&fqdn)? {
                added.push(fqdn);
            }
        }

        let uncovered = self
            .files
            .info()
            .ok()
            .and_then(|info| self.first_uncovered(&info, &self.config.domain));

        if added.is_empty() {
            let Some(missing) = uncovered else {
                log::debug!("Certificate SANs already match DNS records");
                return Ok(());
            };

            log::info!("Certificate does not cover stored SAN {missing}, re-issuing");
            return self
                .obtain_certificate(&self.config.domain)
                .await
                .wrap_err_with(|| format!("re-issuing to cover {missing} failed"));
        }

        log::info!("Adding {added:?} to certificate SANs");
        self.obtain_certificate(&self.config.domain)
            .await
            .wrap_err_with(|| format!("added {added:?} to SANs but re-issuing failed"))
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("domain", &self.config.domain)
            .field("files", &self.files)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use time::OffsetDateTime;

    use super::*;
    use crate::{
        backoff::is_rate_limit_error,
        cert::CertificateMaterial,
        dns::DnsRecord,
        domains::DomainStoreError,
        test::{self_signed, MockCa},
    };

    const DOMAIN: &str = "zone.example.com";

    #[derive(Debug, Default)]
    pub(crate) struct RecordingProvider {
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChallengeProvider for RecordingProvider {
        async fn present(&self, record: &ChallengeRecord) -> eyre::Result<()> {
            self.calls.lock().push(format!("present {}", record.fqdn));
            Ok(())
        }

        async fn clean_up(&self, record: &ChallengeRecord) -> eyre::Result<()> {
            self.calls.lock().push(format!("clean_up {}", record.fqdn));
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingNotifier {
        pub enabled: Mutex<Vec<(String, PathBuf, PathBuf)>>,
    }

    #[async_trait]
    impl TlsNotifier for RecordingNotifier {
        async fn enable_tls(
            &self,
            domain: &str,
            cert_path: &Path,
            key_path: &Path,
        ) -> eyre::Result<()> {
            self.enabled
                .lock()
                .push((domain.to_owned(), cert_path.to_owned(), key_path.to_owned()));
            Ok(())
        }
    }

    struct StaticLister(Vec<DnsRecord>);

    #[async_trait]
    impl RecordLister for StaticLister {
        async fn list_records(&self) -> eyre::Result<Vec<DnsRecord>> {
            Ok(self.0.clone())
        }
    }

    pub(crate) fn test_config(dir: &Path, dir_url: &str) -> Config {
        let mut config = Config::new(
            "ops@example.com",
            DOMAIN,
            dir.join("tls/cert.pem"),
            dir.join("tls/key.pem"),
        );
        config.ca_dir_url = Some(dir_url.to_owned());
        config
    }

    pub(crate) fn test_manager(
        dir: &Path,
        dir_url: &str,
        provider: Arc<RecordingProvider>,
    ) -> CertificateManager {
        test_manager_with_config(dir, test_config(dir, dir_url), provider)
    }

    pub(crate) fn test_manager_with_config(
        dir: &Path,
        config: Config,
        provider: Arc<RecordingProvider>,
    ) -> CertificateManager {
        let store = DomainStore::open(dir.join("certificate_domains.json"), 5);
        store.ensure_initialized(DOMAIN).unwrap();

        CertificateManager::new(config, provider)
            .unwrap()
            .with_domain_store(store)
            .with_poll_delay(Duration::from_millis(1))
    }

    /// Writes a self-signed certificate for `sans` expiring `days` from now.
    pub(crate) fn install_certificate(manager: &CertificateManager, sans: &[&str], days: i64) {
        let (cert, key) = self_signed(
            sans[0],
            sans,
            OffsetDateTime::now_utc() + time::Duration::days(days),
        );
        let material = CertificateMaterial::parse(key, cert).unwrap();
        manager.files().save(&material).unwrap();
    }

    #[tokio::test]
    async fn obtain_certificate_end_to_end() {
        let ca = MockCa::start();
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(RecordingProvider::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let manager = test_manager(dir.path(), &ca.dir_url, Arc::clone(&provider));
        manager.set_tls_notifier(notifier.clone());
        assert_eq!(manager.state(), CertState::Uninitialized);

        manager.obtain_certificate(DOMAIN).await.unwrap();

        assert_eq!(manager.state(), CertState::Valid);
        assert_eq!(ca.ordered_domains(), [DOMAIN]);
        assert_eq!(
            *provider.calls.lock(),
            [
                "present _acme-challenge.zone.example.com",
                "clean_up _acme-challenge.zone.example.com",
            ]
        );

        let info = manager.certificate_info().unwrap();
        assert!(info.covers(DOMAIN));
        assert!(!info.is_expired());
        assert!(manager.check_domain_coverage(DOMAIN));

        let enabled = notifier.enabled.lock().clone();
        assert_eq!(
            enabled,
            [(
                DOMAIN.to_owned(),
                dir.path().join("tls/cert.pem"),
                dir.path().join("tls/key.pem"),
            )]
        );

        // account persisted next to the certificate
        assert!(dir.path().join("tls/acme_user.json").exists());
        assert!(dir.path().join("tls/acme_key.pem").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;

            let mode = std::fs::metadata(dir.path().join("tls/key.pem"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // second issuance reuses the cached account
        manager.obtain_certificate(DOMAIN).await.unwrap();
        assert_eq!(ca.orders_created(), 2);
        assert_eq!(ca.account_registrations(), 1);
    }

    #[tokio::test]
    async fn account_survives_restart() {
        let ca = MockCa::start();
        let dir = tempfile::tempdir().unwrap();

        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());
        manager.obtain_certificate(DOMAIN).await.unwrap();
        drop(manager);

        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());
        manager.obtain_certificate(DOMAIN).await.unwrap();

        assert_eq!(ca.account_registrations(), 1);
        assert_eq!(ca.orders_created(), 2);
    }

    #[tokio::test]
    async fn failed_validation_cleans_up_and_writes_nothing() {
        let ca = MockCa::start();
        ca.fail_challenges_for(DOMAIN);

        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(RecordingProvider::default());
        let manager = test_manager(dir.path(), &ca.dir_url, Arc::clone(&provider));

        let err = manager.obtain_certificate(DOMAIN).await.unwrap_err();
        assert!(format!("{err:#}").contains("validation of zone.example.com failed"));

        assert_eq!(manager.state(), CertState::Failed);
        assert_eq!(
            provider.calls.lock().last().unwrap(),
            "clean_up _acme-challenge.zone.example.com"
        );
        assert!(!manager.files().cert_path().exists());
        assert!(!manager.files().key_path().exists());
    }

    #[tokio::test]
    async fn rate_limited_order_is_recognized() {
        let ca = MockCa::start();
        ca.rate_limit_orders(1);

        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());

        let err = manager.obtain_certificate(DOMAIN).await.unwrap_err();
        assert!(is_rate_limit_error(&err), "{err:#}");
        assert_eq!(manager.state(), CertState::Failed);

        // the limit has passed
        manager.obtain_certificate(DOMAIN).await.unwrap();
        assert_eq!(manager.state(), CertState::Valid);
    }

    #[tokio::test]
    async fn san_add_and_remove_reissue() {
        let ca = MockCa::start();
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());

        manager.add_domain_to_san("api.zone.example.com").await.unwrap();
        assert_eq!(ca.ordered_domains(), [DOMAIN, "api.zone.example.com"]);
        assert!(manager.check_domain_coverage("api.zone.example.com"));

        // already present: still re-issued
        manager.add_domain_to_san("api.zone.example.com").await.unwrap();
        assert_eq!(ca.orders_created(), 2);

        manager
            .remove_domain_from_san("api.zone.example.com")
            .await
            .unwrap();
        assert_eq!(ca.ordered_domains(), [DOMAIN]);
        assert!(!manager.check_domain_coverage("api.zone.example.com"));
        assert_eq!(ca.orders_created(), 3);

        let err = manager.remove_domain_from_san(DOMAIN).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DomainStoreError>(),
            Some(DomainStoreError::CannotRemoveBaseDomain(_))
        ));
        assert_eq!(ca.orders_created(), 3);
    }

    #[tokio::test]
    async fn failed_san_reissue_is_repaired_by_adding_again() {
        let ca = MockCa::start();
        ca.rate_limit_orders(1);

        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());
        install_certificate(&manager, &[DOMAIN], 60);

        let err = manager
            .add_domain_to_san("api.zone.example.com")
            .await
            .unwrap_err();
        assert!(is_rate_limit_error(&err), "{err:#}");

        // stored but not on the certificate
        assert!(manager
            .domain_store()
            .unwrap()
            .load()
            .unwrap()
            .contains("api.zone.example.com"));
        assert!(!manager.check_domain_coverage("api.zone.example.com"));

        manager.add_domain_to_san("api.zone.example.com").await.unwrap();
        assert!(manager.check_domain_coverage("api.zone.example.com"));
        assert_eq!(ca.ordered_domains(), [DOMAIN, "api.zone.example.com"]);
        assert_eq!(ca.orders_created(), 1);
    }

    #[tokio::test]
    async fn san_mutation_without_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(
            test_config(dir.path(), "http://127.0.0.1:1/directory"),
            Arc::new(RecordingProvider::default()),
        )
        .unwrap();

        assert!(manager.add_domain_to_san("api.zone.example.com").await.is_err());
        assert_eq!(manager.domains_for_certificate(DOMAIN), [DOMAIN]);
    }

    #[tokio::test]
    async fn coverage_follows_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), "http://127.0.0.1:1/directory", Arc::default());

        install_certificate(
            &manager,
            &[
                "internal.example.com",
                "dns.internal.example.com",
                "api.internal.example.com",
            ],
            60,
        );

        assert!(manager.check_domain_coverage("internal.example.com"));
        assert!(manager.check_domain_coverage("dns.internal.example.com"));
        assert!(manager.check_domain_coverage("api.internal.example.com"));
        assert!(!manager.check_domain_coverage("new.internal.example.com"));
    }

    #[tokio::test]
    async fn coverage_without_certificate_uses_store() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), "http://127.0.0.1:1/directory", Arc::default());
        manager
            .domain_store()
            .unwrap()
            .add_domain("api.zone.example.com")
            .unwrap();

        assert!(manager.check_domain_coverage(DOMAIN));
        assert!(manager.check_domain_coverage("api.zone.example.com"));
        assert!(!manager.check_domain_coverage("new.zone.example.com"));
    }

    #[tokio::test]
    async fn restore_reuses_valid_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), "http://127.0.0.1:1/directory", Arc::default());
        let notifier = Arc::new(RecordingNotifier::default());
        manager.set_tls_notifier(notifier.clone());

        install_certificate(&manager, &[DOMAIN], 60);

        manager
            .restore_tls_with_existing_certificates(DOMAIN)
            .await
            .unwrap();
        assert_eq!(manager.state(), CertState::Valid);
        assert_eq!(notifier.enabled.lock().len(), 1);
    }

    #[tokio::test]
    async fn restore_without_notifier_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), "http://127.0.0.1:1/directory", Arc::default());

        install_certificate(&manager, &[DOMAIN], 60);

        let err = manager
            .restore_tls_with_existing_certificates(DOMAIN)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no TLS notifier"), "{err}");
        assert_eq!(manager.state(), CertState::Uninitialized);
    }

    #[tokio::test]
    async fn restore_rejects_missing_expired_or_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), "http://127.0.0.1:1/directory", Arc::default());

        assert!(manager
            .restore_tls_with_existing_certificates(DOMAIN)
            .await
            .is_err());

        install_certificate(&manager, &[DOMAIN], -2);
        let err = manager
            .restore_tls_with_existing_certificates(DOMAIN)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expired"), "{err}");

        manager
            .domain_store()
            .unwrap()
            .add_domain("api.zone.example.com")
            .unwrap();
        install_certificate(&manager, &[DOMAIN], 60);
        let err = manager
            .restore_tls_with_existing_certificates(DOMAIN)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("api.zone.example.com"), "{err}");

        assert_eq!(manager.state(), CertState::Uninitialized);
    }

    #[tokio::test]
    async fn expired_certificate_is_renewed() {
        let ca = MockCa::start();
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());

        install_certificate(&manager, &[DOMAIN], -2);

        assert!(manager.check_and_renew(DOMAIN).await.unwrap());
        assert_eq!(ca.orders_created(), 1);
        assert!(!manager.certificate_info().unwrap().is_expired());
    }

    #[tokio::test]
    async fn missing_certificate_is_obtained() {
        let ca = MockCa::start();
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());

        assert!(manager.check_and_renew(DOMAIN).await.unwrap());
        assert!(manager.files().exists());
    }

    #[tokio::test]
    async fn fresh_certificate_is_not_renewed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), "http://127.0.0.1:1/directory", Arc::default());

        install_certificate(&manager, &[DOMAIN], 89);

        assert!(!manager.check_and_renew(DOMAIN).await.unwrap());
    }

    #[tokio::test]
    async fn uncovered_stored_san_makes_renewal_due() {
        let ca = MockCa::start();
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());

        install_certificate(&manager, &[DOMAIN], 89);
        manager
            .domain_store()
            .unwrap()
            .add_domain("api.zone.example.com")
            .unwrap();

        assert!(manager.check_and_renew(DOMAIN).await.unwrap());
        assert!(manager.check_domain_coverage("api.zone.example.com"));
        assert_eq!(ca.orders_created(), 1);

        assert!(!manager.check_and_renew(DOMAIN).await.unwrap());
        assert_eq!(ca.orders_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_loop_renews_after_check_interval() {
        let ca = MockCa::start();
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(test_manager(dir.path(), &ca.dir_url, Arc::default()));
        install_certificate(&manager, &[DOMAIN], -2);

        let renewal = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.start_renewal_loop(DOMAIN).await }
        });

        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(ca.orders_created(), 0);

        tokio::time::advance(manager.config().check_interval() + Duration::from_secs(1)).await;
        // real time from here on, the HTTP client has its own timeouts
        tokio::time::resume();

        for _ in 0..500 {
            if manager.state() == CertState::Valid {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(manager.state(), CertState::Valid);
        assert_eq!(ca.orders_created(), 1);
        assert!(!manager.certificate_info().unwrap().is_expired());

        renewal.abort();
    }

    #[tokio::test]
    async fn reconciliation_adds_missing_record_names() {
        let ca = MockCa::start();
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());
        let store = Arc::clone(manager.domain_store().unwrap());
        store.add_domain("api.zone.example.com").unwrap();

        // no lister yet
        manager.validate_and_update_san_domains().await.unwrap();
        assert_eq!(ca.orders_created(), 0);

        manager.set_record_lister(Arc::new(StaticLister(vec![
            DnsRecord::new("api", "A"),
            DnsRecord::new("api", "A"),
            DnsRecord::new("dns", "A"),
            DnsRecord::new("", "A"),
        ])));
        manager.validate_and_update_san_domains().await.unwrap();

        assert_eq!(
            store.load().unwrap().san_domains,
            ["api.zone.example.com", "dns.zone.example.com"]
        );
        assert_eq!(
            ca.ordered_domains(),
            [DOMAIN, "api.zone.example.com", "dns.zone.example.com"]
        );
        assert_eq!(ca.orders_created(), 1);

        // second pass finds nothing new
        manager.validate_and_update_san_domains().await.unwrap();
        assert_eq!(ca.orders_created(), 1);
    }

    #[tokio::test]
    async fn reconciliation_reissues_for_stored_but_uncovered_san() {
        let ca = MockCa::start();
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path(), &ca.dir_url, Arc::default());
        install_certificate(&manager, &[DOMAIN], 60);
        manager
            .domain_store()
            .unwrap()
            .add_domain("api.zone.example.com")
            .unwrap();

        manager.set_record_lister(Arc::new(StaticLister(vec![DnsRecord::new("api", "A")])));
        manager.validate_and_update_san_domains().await.unwrap();

        assert_eq!(ca.orders_created(), 1);
        assert!(manager.check_domain_coverage("api.zone.example.com"));
    }
}
