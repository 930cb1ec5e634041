use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;

use crate::{
    acc::AcmeKey,
    api::Problem,
    backoff::jittered_backoff,
    jws::{self, Jwk, KeyRef, ProtectedHeader},
    req::{req_expect_header, req_handle_error, req_head, req_post},
};

/// Nonce-invalidating problems are retried at most this many times per call.
const MAX_NONCE_RETRIES: usize = 5;

/// Signs request bodies and keeps nonces flowing between calls.
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against the newAccount URL
/// 3. `set_key_id()` with the returned `Location` header
/// 4. `call_kid()` for everything after that
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    acme_key: AcmeKey,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub fn new(nonce_pool: Arc<NoncePool>, acme_key: AcmeKey) -> Self {
        Transport {
            acme_key,
            nonce_pool,
        }
    }

    pub fn set_key_id(&mut self, kid: String) {
        self.acme_key.set_key_id(kid);
    }

    pub fn acme_key(&self) -> &AcmeKey {
        &self.acme_key
    }

    /// Call signed with the full public key; only used for newAccount.
    pub async fn call_jwk<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, |key| Ok(KeyRef::Jwk(Jwk::from_key(key)?)))
            .await
    }

    /// Call signed with the account URL as key ID.
    pub async fn call_kid<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, |key| Ok(KeyRef::Kid(key.key_id()?.to_owned())))
            .await
    }

    async fn do_call<T, F>(&self, url: &str, body: &T, key_ref: F) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
        F: Fn(&AcmeKey) -> eyre::Result<KeyRef>,
    {
        let mut retries = 0;

        loop {
            let nonce = self.nonce_pool.get_nonce().await?;
            let protected = ProtectedHeader::new(key_ref(&self.acme_key)?, url, nonce);
            let signed = jws::sign(&protected, &self.acme_key, body)?;

            log::debug!("Call endpoint: {url}");
            let response = req_post(self.nonce_pool.client(), url, signed).await;

            // failed responses carry a fresh nonce too
            if let Ok(res) = &response {
                self.nonce_pool.extract_nonce(res);
            }

            let problem = match req_handle_error(response).await {
                Ok(res) => return Ok(res),
                Err(problem) => problem,
            };

            let retryable = problem.is_bad_nonce() || problem.is_jws_verification_error();

            if retryable && retries < MAX_NONCE_RETRIES {
                // first retry is immediate
                let delay = jittered_backoff(i32::try_from(retries).unwrap_or(i32::MAX));
                retries += 1;
                log::debug!(
                    "Retrying {url} ({retries}/{MAX_NONCE_RETRIES}) in {delay:?} after: {problem}"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(problem.into());
        }
    }
}

/// Nonces handed out by the server, shared by every transport of a directory.
#[derive(Debug)]
pub(crate) struct NoncePool {
    client: Client,
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    const CAPACITY: usize = 10;

    pub fn new(client: Client, nonce_url: &str) -> Self {
        NoncePool {
            client,
            nonce_url: nonce_url.to_owned(),
            pool: Mutex::default(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn extract_nonce(&self, res: &reqwest::Response) {
        let Some(nonce) = res
            .headers()
            .get("replay-nonce")
            .and_then(|nonce| nonce.to_str().ok())
        else {
            return;
        };

        log::trace!("Extracting new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce.to_owned());

        if pool.len() > Self::CAPACITY {
            pool.pop_front();
        }
    }

    async fn get_nonce(&self) -> Result<String, Problem> {
        let pooled = self.pool.lock().pop_front();

        if let Some(nonce) = pooled {
            log::trace!("Use previous nonce");
            return Ok(nonce);
        }

        log::debug!("Request new nonce");
        let res = req_handle_error(req_head(&self.client, &self.nonce_url).await).await?;
        req_expect_header(&res, "replay-nonce")
    }
}
