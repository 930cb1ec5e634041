use std::{env, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use zone_acme::{
    process::wait_until_ready, CertificateManager, Config, ProcessManager, TlsNotifier,
};

/// Stands in for the DNS server's DNS-over-TLS listener.
struct PrintingListener;

#[async_trait]
impl TlsNotifier for PrintingListener {
    async fn enable_tls(&self, domain: &str, cert_path: &Path, key_path: &Path) -> eyre::Result<()> {
        println!(
            "serving {domain} with {} and {}",
            cert_path.display(),
            key_path.display()
        );
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Leave `production` unset (staging) while trying this out.
    let path = env::args().nth(1).unwrap_or_else(|| "zone-acme.toml".to_owned());
    let config = Config::from_file(&path)?;

    // Creates the SAN store on first run and, for Cloudflare, looks up the zone.
    let manager = CertificateManager::from_config(config).await?;
    manager.set_tls_notifier(Arc::new(PrintingListener));

    let process = ProcessManager::new(Arc::new(manager));

    // Restores the certificate on disk if it is still good, otherwise obtains one. Retries every
    // five minutes until one of the two works.
    let mut ready = process.start_with_retry(Duration::from_secs(5 * 60));
    process.spawn_san_reconciliation(ready.clone());

    wait_until_ready(&mut ready).await;

    let info = process.manager().certificate_info()?;
    println!(
        "certificate for {:?} valid until {}",
        info.dns_names, info.not_after
    );

    // The renewal loop keeps running in the background.
    tokio::signal::ctrl_c().await?;

    Ok(())
}
