//! Order life cycle.
//!
//! Each stage of an order is a separate façade over [`api::Order`], so only the calls valid for
//! that stage are available:
//!
//! 1. prove control of every domain: [`NewOrder`] → [`Auth`] → [`DnsChallenge`]
//! 2. submit the CSR and download: [`NewOrder`] → [`CsrOrder`] → [`CertOrder`]

use std::{sync::Arc, time::Duration};

use der::Encode as _;
use eyre::eyre;
use pkcs8::EncodePrivateKey as _;

use crate::{
    acc::AccountInner,
    api,
    cert::{create_csr, CertificateMaterial},
    req::req_safe_read_body,
    util::{base64url, read_json},
};

mod auth;

pub use self::auth::{Auth, DnsChallenge};

pub(crate) struct Order {
    inner: Arc<AccountInner>,
    pub(crate) api_order: api::Order,
    pub(crate) url: String,
}

impl Order {
    pub(crate) fn new(inner: &Arc<AccountInner>, api_order: api::Order, url: String) -> Self {
        Order {
            inner: Arc::clone(inner),
            api_order,
            url,
        }
    }

    /// POST-as-GET the order URL, keeping the requested identifier order.
    async fn refresh(&mut self) -> eyre::Result<()> {
        let res = self
            .inner
            .transport
            .call_kid(&self.url, &api::EmptyString)
            .await?;
        let api_order = read_json::<api::Order>(res).await?;
        self.api_order.overwrite(api_order)
    }

    fn fail_if_invalid(&self) -> eyre::Result<()> {
        if !self.api_order.is_status(api::OrderStatus::Invalid) {
            return Ok(());
        }

        Err(match &self.api_order.error {
            Some(problem) => eyre!("order {} is invalid: {problem}", self.url),
            None => eyre!("order {} is invalid", self.url),
        })
    }
}

/// An order created by [`Account::new_order()`](crate::Account::new_order()).
///
/// Every domain needs a valid authorization before the order accepts a CSR. The server may
/// remember recent authorizations, so some (or all) may already be valid.
pub struct NewOrder {
    pub(crate) order: Order,
}

impl NewOrder {
    /// Whether all authorizations are done, according to the last refresh.
    pub fn is_validated(&self) -> bool {
        self.order.api_order.is_validated()
    }

    /// Moves on to CSR submission if [`is_validated`](Self::is_validated) holds.
    pub fn confirm_validations(self) -> Result<CsrOrder, NewOrder> {
        if self.is_validated() {
            Ok(CsrOrder { order: self.order })
        } else {
            Err(self)
        }
    }

    /// Refreshes the order state from the server.
    pub async fn refresh(&mut self) -> eyre::Result<()> {
        self.order.refresh().await?;
        self.order.fail_if_invalid()
    }

    /// Polls until the order leaves `pending`, giving up after `max_polls` refreshes.
    pub async fn wait_until_ready(
        mut self,
        delay: Duration,
        max_polls: usize,
    ) -> eyre::Result<CsrOrder> {
        for _ in 0..max_polls {
            self.refresh().await?;

            self = match self.confirm_validations() {
                Ok(csr_order) => return Ok(csr_order),
                Err(new_order) => new_order,
            };

            tokio::time::sleep(delay).await;
        }

        Err(eyre!(
            "order {} still {:?} after {max_polls} polls",
            self.order.url,
            self.order.api_order.status
        ))
    }

    /// Fetches one authorization per domain of the order.
    pub async fn authorizations(&self) -> eyre::Result<Vec<Auth>> {
        let mut result = vec![];

        for auth_url in self.order.api_order.authorizations.iter().flatten() {
            let res = self
                .order
                .inner
                .transport
                .call_kid(auth_url, &api::EmptyString)
                .await?;
            let api_auth = read_json::<api::Authorization>(res).await?;
            result.push(Auth::new(&self.order.inner, api_auth, auth_url));
        }

        Ok(result)
    }

    pub fn api_order(&self) -> &api::Order {
        &self.order.api_order
    }
}

/// An order ready for its CSR.
pub struct CsrOrder {
    pub(crate) order: Order,
}

impl CsrOrder {
    /// Submits a CSR signed by `signing_key` and polls until the server stops processing.
    pub async fn finalize_signing_key(
        mut self,
        signing_key: p256::ecdsa::SigningKey,
        delay: Duration,
        max_polls: usize,
    ) -> eyre::Result<CertOrder> {
        let domains = self.order.api_order.domains();
        let csr = create_csr(&signing_key, &domains)?;

        // base64url DER, not PEM
        let finalize = api::Finalize {
            csr: base64url(&csr.to_der()?),
        };

        let inner = Arc::clone(&self.order.inner);
        let res = inner
            .transport
            .call_kid(&self.order.api_order.finalize, &finalize)
            .await?;
        let api_order = read_json::<api::Order>(res).await?;
        self.order.api_order.overwrite(api_order)?;

        for _ in 0..max_polls {
            self.order.fail_if_invalid()?;

            if self.order.api_order.is_status(api::OrderStatus::Valid) {
                return Ok(CertOrder {
                    signing_key,
                    order: self.order,
                });
            }

            tokio::time::sleep(delay).await;
            self.order.refresh().await?;
        }

        Err(eyre!(
            "order {} not issued after {max_polls} polls (status {:?})",
            self.order.url,
            self.order.api_order.status
        ))
    }

    pub fn api_order(&self) -> &api::Order {
        &self.order.api_order
    }
}

/// An order whose certificate has been issued.
pub struct CertOrder {
    signing_key: p256::ecdsa::SigningKey,
    order: Order,
}

impl CertOrder {
    /// Downloads the issued chain and pairs it with the CSR key.
    pub async fn download_cert(self) -> eyre::Result<CertificateMaterial> {
        let url = self
            .order
            .api_order
            .certificate
            .as_deref()
            .ok_or_else(|| eyre!("valid order {} has no certificate URL", self.order.url))?;

        let res = self
            .order
            .inner
            .transport
            .call_kid(url, &api::EmptyString)
            .await?;
        let certificate = req_safe_read_body(res).await;

        let private_key_pem = self
            .signing_key
            .to_pkcs8_pem(pem::LineEnding::LF)?;

        CertificateMaterial::parse(private_key_pem, certificate)
    }

    pub fn api_order(&self) -> &api::Order {
        &self.order.api_order
    }
}
