use std::{collections::HashSet, iter, sync::Arc};

use zeroize::Zeroizing;

use crate::{
    api,
    order::{NewOrder, Order},
    req::req_expect_header,
    trans::Transport,
    util::read_json,
};

mod acme_key;

pub(crate) use self::acme_key::AcmeKey;

#[derive(Debug, Clone)]
pub(crate) struct AccountInner {
    pub transport: Transport,
    pub api_account: api::Account,
    pub api_directory: api::Directory,
}

/// Registered account with an ACME provider.
///
/// Obtained from [`Directory::register_account()`] or, for a registration persisted earlier,
/// [`Directory::restore_account()`]. The account key is an elliptic curve P-256 key.
///
/// [`Directory::register_account()`]: crate::Directory::register_account()
/// [`Directory::restore_account()`]: crate::Directory::restore_account()
#[derive(Debug, Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

impl Account {
    pub(crate) fn new(
        transport: Transport,
        api_account: api::Account,
        api_directory: api::Directory,
    ) -> Self {
        Self {
            inner: Arc::new(AccountInner {
                transport,
                api_account,
                api_directory,
            }),
        }
    }

    /// Account key in PKCS #8 PEM.
    pub fn acme_private_key_pem(&self) -> eyre::Result<Zeroizing<String>> {
        self.inner.transport.acme_key().to_pem()
    }

    /// Account URL assigned by the server.
    pub fn key_id(&self) -> eyre::Result<&str> {
        self.inner.transport.acme_key().key_id()
    }

    /// Creates an order for `primary_name` (the certificate CN) plus `alt_names`.
    ///
    /// Duplicate names are dropped, keeping the first occurrence. Every call creates a new order
    /// with the server.
    pub async fn new_order(
        &self,
        primary_name: &str,
        alt_names: &[&str],
    ) -> eyre::Result<NewOrder> {
        let mut identifiers = Vec::new();
        let mut dedup = HashSet::new();

        for domain in iter::once(primary_name).chain(alt_names.iter().copied()) {
            if dedup.insert(domain) {
                identifiers.push(api::Identifier::dns(domain));
            }
        }

        let order = api::Order::from_identifiers(identifiers);
        let new_order_url = self.inner.api_directory.new_order.as_str();

        let res = self.inner.transport.call_kid(new_order_url, &order).await?;
        let order_url = req_expect_header(&res, "location")?;
        let api_order = read_json::<api::Order>(res).await?;

        let mut order = Order::new(&self.inner, order, order_url);
        order.api_order.overwrite(api_order)?;

        log::debug!(
            "Created order {} for {:?}",
            order.url,
            order.api_order.domains()
        );

        Ok(NewOrder { order })
    }

    pub fn api_account(&self) -> &api::Account {
        &self.inner.api_account
    }
}

#[cfg(test)]
mod tests {
    use crate::{test::MockCa, Directory, DirectoryUrl};

    #[tokio::test]
    async fn new_order_dedups_and_keeps_primary_first() {
        let ca = MockCa::start();
        let dir = Directory::fetch(DirectoryUrl::Other(&ca.dir_url))
            .await
            .unwrap();
        let acc = dir
            .register_account(Some(vec!["mailto:ops@example.com".to_owned()]))
            .await
            .unwrap();

        assert!(acc.key_id().unwrap().ends_with("/acme/acct/1"));

        let order = acc
            .new_order(
                "zone.example.com",
                &["app.zone.example.com", "zone.example.com"],
            )
            .await
            .unwrap();

        assert_eq!(
            order.api_order().domains(),
            ["zone.example.com", "app.zone.example.com"]
        );
        assert_eq!(ca.ordered_domains(), ["zone.example.com", "app.zone.example.com"]);
    }
}
