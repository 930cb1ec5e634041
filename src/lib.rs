//! Certificate lifecycle for a self-hosted DNS server, using ACME `dns-01` challenges against
//! providers such as [Let's Encrypt](https://letsencrypt.org/).
//!
//! It follows the [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555) spec, using ACME v2 to
//! issue/renew certificates.
//!
//! # Usage
//!
//! Build a [`CertificateManager`] from a [`Config`], hand it to a [`ProcessManager`] and wait for
//! the readiness signal before starting anything that serves TLS:
//!
//! ```no_run
//! # async fn run() -> eyre::Result<()> {
//! use std::{sync::Arc, time::Duration};
//!
//! use zone_acme::{process::wait_until_ready, CertificateManager, Config, ProcessManager};
//!
//! let config = Config::from_file("zone-acme.toml")?;
//! let manager = Arc::new(CertificateManager::from_config(config).await?);
//!
//! let process = ProcessManager::new(manager);
//! let mut ready = process.start_with_retry(Duration::from_secs(300));
//! wait_until_ready(&mut ready).await;
//! # Ok(())
//! # }
//! ```
//!
//! A complete program lives in `demos/dns-01.rs`.
//!
//! # Domain Ownership
//!
//! Every name on the certificate is proven through a TXT record at `_acme-challenge.<name>`. The
//! record is published by a [`dns::ChallengeProvider`]: zone files for the local server, or a DNS
//! hosting API such as Cloudflare.
//!
//! ## Multiple Domains
//!
//! The certificate covers the base domain plus the SANs kept in the [`DomainStore`]. Adding or
//! removing a SAN re-issues the certificate, and the ACME API requires proof for every name on
//! each order. See [`order::NewOrder::authorizations()`].
//!
//! # Rate Limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being abused.
//! Retries follow the schedule in [`backoff`], which pauses for a long cool-off whenever the CA
//! reports a rate limit.
//!
//! ## Use Staging For Development!
//!
//! Especially take care to use the Let's Encrypt staging environment for development where the rate
//! limits are more relaxed. It is the default unless `production` is set.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod acc;
mod cert;
mod dir;
mod jws;
mod persist;
mod req;
mod trans;
mod util;

pub mod api;
pub mod backoff;
pub mod config;
pub mod dns;
pub mod domains;
pub mod manager;
pub mod order;
pub mod process;


pub use crate::{
    acc::Account,
    cert::{create_p256_key, CertificateInfo, CertificateMaterial},
    config::Config,
    dir::{Directory, DirectoryUrl},
    domains::{CertificateDomains, DomainStore},
    manager::{CertState, CertificateManager, TlsNotifier},
    persist::{BlobStore, FileStore, PersistError},
    process::ProcessManager,
};
