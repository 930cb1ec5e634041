use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use super::{ChallengeProvider, ChallengeRecord, NewRecord, PropagationCheck, RecordApi};
use crate::{backoff::Environment, config::Config};

/// Sleeps taken by [`CleaningProvider::present`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleaningWaits {
    /// After stale records were deleted.
    pub cleanup: Duration,
    /// Before the new record is created.
    pub creation: Duration,
    pub propagation_timeout: Duration,
    pub propagation_interval: Duration,
}

impl CleaningWaits {
    pub fn for_environment(env: Environment) -> Self {
        let (cleanup, creation) = match env {
            Environment::Production => (120, 90),
            Environment::Staging => (90, 60),
        };

        CleaningWaits {
            cleanup: Duration::from_secs(cleanup),
            creation: Duration::from_secs(creation),
            propagation_timeout: Duration::from_secs(5 * 60),
            propagation_interval: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        CleaningWaits {
            cleanup: config.cleanup_wait(),
            creation: config.creation_wait(),
            ..Self::for_environment(config.environment())
        }
    }
}

/// Wraps a provider so each challenge starts from a clean slate.
///
/// Before delegating [`present`](ChallengeProvider::present) it makes sure the domain resolves,
/// deletes stale TXT records at the challenge name and waits for both to settle. Afterwards it
/// polls resolvers until the new value shows up or the propagation timeout passes; a timeout is
/// logged and the challenge proceeds anyway.
pub struct CleaningProvider {
    inner: Arc<dyn ChallengeProvider>,
    api: Arc<dyn RecordApi>,
    propagation: Arc<dyn PropagationCheck>,
    waits: CleaningWaits,
}

impl CleaningProvider {
    pub fn new(
        inner: Arc<dyn ChallengeProvider>,
        api: Arc<dyn RecordApi>,
        propagation: Arc<dyn PropagationCheck>,
        waits: CleaningWaits,
    ) -> Self {
        Self {
            inner,
            api,
            propagation,
            waits,
        }
    }

    /// Adds a placeholder A record when nothing exists at `domain`.
    async fn ensure_resolvable(&self, domain: &str) -> eyre::Result<()> {
        let existing = self.api.list_records(domain, None).await?;
        if !existing.is_empty() {
            log::debug!("{domain} already has {} records", existing.len());
            return Ok(());
        }

        log::info!("Creating placeholder A record for {domain}");
        self.api
            .create_record(&NewRecord {
                record_type: "A",
                name: domain,
                content: "127.0.0.1",
                ttl: 300,
            })
            .await?;
        Ok(())
    }

    /// Deletes every TXT record at `fqdn`; returns how many deletions succeeded.
    async fn purge_stale(&self, fqdn: &str) -> eyre::Result<usize> {
        let records = self.api.list_records(fqdn, Some("TXT")).await?;
        if records.is_empty() {
            log::debug!("No stale TXT records at {fqdn}");
            return Ok(0);
        }

        log::info!("Deleting {} stale TXT records at {fqdn}", records.len());

        let mut deleted = 0;
        for record in &records {
            match self.api.delete_record(&record.id).await {
                Ok(()) => deleted += 1,
                Err(err) => log::error!("Failed to delete TXT record {}: {err}", record.id),
            }
        }

        log::info!("Deleted {deleted}/{} stale TXT records at {fqdn}", records.len());
        Ok(deleted)
    }

    async fn await_propagation(&self, record: &ChallengeRecord) {
        let deadline = Instant::now() + self.waits.propagation_timeout;

        while Instant::now() < deadline {
            if self.propagation.is_visible(&record.fqdn, &record.value).await {
                log::info!("{} propagated", record.fqdn);
                return;
            }

            log::debug!(
                "{} not propagated yet, checking again in {}s",
                record.fqdn,
                self.waits.propagation_interval.as_secs()
            );
            sleep(self.waits.propagation_interval).await;
        }

        log::warn!(
            "{} not visible after {}s, proceeding with the challenge",
            record.fqdn,
            self.waits.propagation_timeout.as_secs()
        );
    }
}

#[async_trait]
impl ChallengeProvider for CleaningProvider {
    async fn present(&self, record: &ChallengeRecord) -> eyre::Result<()> {
        log::info!("Presenting DNS-01 challenge for {}", record.domain);

        if let Err(err) = self.ensure_resolvable(&record.domain).await {
            log::error!("Failed to ensure {} resolves: {err:#}", record.domain);
        }

        match self.purge_stale(&record.fqdn).await {
            Ok(0) => {}
            Ok(_) => {
                log::info!("Waiting {}s for deletions to propagate", self.waits.cleanup.as_secs());
                sleep(self.waits.cleanup).await;
            }
            Err(err) => log::error!("Failed to clean up {}: {err:#}", record.fqdn),
        }

        log::info!(
            "Waiting {}s before creating {}",
            self.waits.creation.as_secs(),
            record.fqdn
        );
        sleep(self.waits.creation).await;

        self.inner.present(record).await?;

        self.await_propagation(record).await;
        Ok(())
    }

    async fn clean_up(&self, record: &ChallengeRecord) -> eyre::Result<()> {
        self.inner.clean_up(record).await
    }
}
