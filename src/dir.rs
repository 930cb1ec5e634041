use std::sync::Arc;

use reqwest::Client;

use crate::{
    acc::AcmeKey,
    api,
    req::{http_client, req_expect_header, req_get, req_handle_error},
    trans::{NoncePool, Transport},
    util::read_json,
    Account,
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Known ACME directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// Let's Encrypt production. Subject to strict rate limits.
    LetsEncrypt,

    /// Let's Encrypt staging. Issues untrusted certificates under relaxed limits.
    LetsEncryptStaging,

    /// Any other directory URL.
    Other(&'a str),
}

impl<'a> DirectoryUrl<'a> {
    pub fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

/// Entry point for accessing an ACME API.
#[derive(Clone)]
pub struct Directory {
    nonce_pool: Arc<NoncePool>,
    api_directory: api::Directory,
}

impl Directory {
    /// Fetches the directory with a default (verifying) HTTP client.
    pub async fn fetch(url: DirectoryUrl<'_>) -> eyre::Result<Directory> {
        Self::fetch_with_client(http_client(false)?, url).await
    }

    /// Fetches the directory; `insecure` skips TLS verification of the ACME server.
    pub async fn fetch_insecure(url: DirectoryUrl<'_>, insecure: bool) -> eyre::Result<Directory> {
        Self::fetch_with_client(http_client(insecure)?, url).await
    }

    async fn fetch_with_client(client: Client, url: DirectoryUrl<'_>) -> eyre::Result<Directory> {
        let res = req_handle_error(req_get(&client, url.to_url()).await).await?;
        let api_directory = read_json::<api::Directory>(res).await?;

        if api_directory
            .meta
            .as_ref()
            .is_some_and(api::DirectoryMeta::external_account_required)
        {
            return Err(eyre::eyre!(
                "ACME directory {} requires external account binding, which is not supported",
                url.to_url()
            ));
        }

        let nonce_pool = Arc::new(NoncePool::new(client, &api_directory.new_nonce));

        Ok(Directory {
            nonce_pool,
            api_directory,
        })
    }

    /// Registers (or looks up) the account for the PEM-encoded key.
    ///
    /// The server answers with the existing account when the key is already registered.
    pub async fn register_account_with_key(
        &self,
        private_key_pem: &str,
        contact: Option<Vec<String>>,
    ) -> eyre::Result<Account> {
        let acme_key = AcmeKey::from_pem(private_key_pem)?;
        self.upsert_account(acme_key, contact).await
    }

    /// Registers a new account under a freshly generated key.
    pub async fn register_account(&self, contact: Option<Vec<String>>) -> eyre::Result<Account> {
        self.upsert_account(AcmeKey::new(), contact).await
    }

    /// Rebuilds a registered account from persisted state, without contacting the server.
    pub fn restore_account(
        &self,
        private_key_pem: &str,
        key_id: &str,
        api_account: api::Account,
    ) -> eyre::Result<Account> {
        let mut transport =
            Transport::new(Arc::clone(&self.nonce_pool), AcmeKey::from_pem(private_key_pem)?);
        transport.set_key_id(key_id.to_owned());

        Ok(Account::new(
            transport,
            api_account,
            self.api_directory.clone(),
        ))
    }

    async fn upsert_account(
        &self,
        acme_key: AcmeKey,
        contact: Option<Vec<String>>,
    ) -> eyre::Result<Account> {
        let acc = api::Account {
            contact,
            terms_of_service_agreed: Some(true),
            ..Default::default()
        };

        let mut transport = Transport::new(Arc::clone(&self.nonce_pool), acme_key);
        let res = transport
            .call_jwk(&self.api_directory.new_account, &acc)
            .await?;

        let kid = req_expect_header(&res, "location")?;
        log::debug!("Key ID is: {kid}");
        let api_account = read_json::<api::Account>(res).await?;

        transport.set_key_id(kid);

        Ok(Account::new(
            transport,
            api_account,
            self.api_directory.clone(),
        ))
    }

    pub fn api_directory(&self) -> &api::Directory {
        &self.api_directory
    }
}
