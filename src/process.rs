//! Background startup of the certificate manager.
//!
//! The DNS server should not serve DNS-over-TLS before a certificate exists, but it should not
//! block on issuance either. [`ProcessManager`] runs restore-or-obtain on a task and publishes
//! readiness through a [`watch`] channel.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::manager::CertificateManager;

/// Drives a [`CertificateManager`] from startup into its renewal loop.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    manager: Arc<CertificateManager>,
    domain: String,
}

impl ProcessManager {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        let domain = manager.config().domain.clone();
        Self { manager, domain }
    }

    pub fn manager(&self) -> &Arc<CertificateManager> {
        &self.manager
    }

    /// Restores or obtains a certificate in the background, retrying after `retry_interval`
    /// until it succeeds.
    ///
    /// The returned receiver flips to `true` once a certificate is in place; afterwards the
    /// renewal loop starts if enabled.
    pub fn start_with_retry(&self, retry_interval: Duration) -> watch::Receiver<bool> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let this = self.clone();

        tokio::spawn(async move {
            while let Err(err) = this.run().await {
                log::error!(
                    "Certificate process failed, retrying in {}s: {err:#}",
                    retry_interval.as_secs()
                );
                tokio::time::sleep(retry_interval).await;
            }

            ready_tx.send_replace(true);
            this.spawn_renewal();
        });

        ready_rx
    }

    /// Single attempt at restore-or-obtain in the background.
    ///
    /// On success the readiness receiver flips to `true`. On failure the error is sent on the
    /// second channel and the readiness sender is dropped without flipping, so
    /// [`wait_until_ready`] returns `false`.
    pub fn start(&self) -> (watch::Receiver<bool>, oneshot::Receiver<eyre::Report>) {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (err_tx, err_rx) = oneshot::channel();
        let this = self.clone();

        tokio::spawn(async move {
            match this.run().await {
                Ok(()) => {
                    ready_tx.send_replace(true);
                    this.spawn_renewal();
                }
                Err(err) => {
                    let _ = err_tx.send(err);
                }
            }
        });

        (ready_rx, err_rx)
    }

    /// Waits for readiness, then reconciles certificate SANs with the served records once.
    pub fn spawn_san_reconciliation(&self, mut ready: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);

        tokio::spawn(async move {
            if !wait_until_ready(&mut ready).await {
                log::warn!("Certificate never became ready, skipping SAN reconciliation");
                return;
            }

            if let Err(err) = manager.validate_and_update_san_domains().await {
                log::error!("SAN reconciliation failed: {err:#}");
            }
        })
    }

    async fn run(&self) -> eyre::Result<()> {
        log::info!("Starting certificate process for {}", self.domain);

        match self
            .manager
            .restore_tls_with_existing_certificates(&self.domain)
            .await
        {
            Ok(()) => log::info!("Restored TLS with existing certificate"),

            Err(err) => {
                log::warn!("Could not restore existing certificate: {err:#}");
                log::info!("Obtaining new certificate");

                self.manager
                    .obtain_certificate_with_retry_rate_limit(&self.domain)
                    .await?;
            }
        }

        log::info!("Certificate process completed for {}", self.domain);
        Ok(())
    }

    fn spawn_renewal(&self) {
        if !self.manager.config().renewal.enabled {
            log::info!("Certificate renewal disabled");
            return;
        }

        let manager = Arc::clone(&self.manager);
        let domain = self.domain.clone();

        tokio::spawn(async move { manager.start_renewal_loop(&domain).await });
    }
}

/// Resolves to `true` once `ready` flips, or `false` if its sender went away first.
pub async fn wait_until_ready(ready: &mut watch::Receiver<bool>) -> bool {
    ready.wait_for(|ready| *ready).await.is_ok()
}
