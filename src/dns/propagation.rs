use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    proto::rr::rdata::TXT,
    TokioAsyncResolver,
};

use super::PropagationCheck;

const DEFAULT_RESOLVERS: [&str; 2] = ["8.8.8.8:53", "1.1.1.1:53"];

/// Asks each configured resolver directly, bypassing the system resolver and any cache.
///
/// A value counts as propagated only once every resolver returns it.
pub struct ResolverPropagation {
    resolvers: Vec<(SocketAddr, TokioAsyncResolver)>,
}

impl ResolverPropagation {
    /// An empty `addrs` falls back to Google and Cloudflare public DNS.
    pub fn new(addrs: &[SocketAddr], timeout: Duration) -> Self {
        let addrs = if addrs.is_empty() {
            DEFAULT_RESOLVERS
                .iter()
                .filter_map(|addr| addr.parse().ok())
                .collect()
        } else {
            addrs.to_vec()
        };

        let resolvers = addrs
            .into_iter()
            .map(|addr| {
                let mut config = ResolverConfig::new();
                config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));

                let mut opts = ResolverOpts::default();
                opts.timeout = timeout;
                opts.attempts = 1;
                opts.cache_size = 0;

                (addr, TokioAsyncResolver::tokio(config, opts))
            })
            .collect();

        Self { resolvers }
    }

    async fn visible_on(
        resolver: &TokioAsyncResolver,
        addr: SocketAddr,
        fqdn: &str,
        expected: &str,
    ) -> bool {
        // absolute name, so no search domains are appended
        let name = format!("{}.", fqdn.trim_end_matches('.'));

        match resolver.txt_lookup(name.as_str()).await {
            Ok(lookup) => {
                let found = lookup.iter().any(|txt| txt_value(txt) == expected);
                if !found {
                    log::debug!("Expected TXT value not yet on {addr} for {fqdn}");
                }
                found
            }
            Err(err) => {
                log::debug!("TXT lookup of {fqdn} on {addr} failed: {err}");
                false
            }
        }
    }
}

/// Character strings of one TXT record, concatenated.
fn txt_value(txt: &TXT) -> String {
    txt.txt_data()
        .iter()
        .map(|data| String::from_utf8_lossy(data))
        .collect()
}

#[async_trait]
impl PropagationCheck for ResolverPropagation {
    async fn is_visible(&self, fqdn: &str, expected: &str) -> bool {
        for (addr, resolver) in &self.resolvers {
            log::debug!("Checking {fqdn} on {addr}");
            if !Self::visible_on(resolver, *addr, fqdn, expected).await {
                return false;
            }
        }

        log::info!("{fqdn} visible on all {} resolvers", self.resolvers.len());
        true
    }
}
