use std::{sync::Arc, time::Duration};

use sha2::{Digest as _, Sha256};

use crate::{
    acc::{AccountInner, AcmeKey},
    api,
    jws::Jwk,
    util::{base64url, read_json},
};

/// Authorization polls before a challenge is reported as stuck.
const MAX_AUTHORIZATION_POLLS: usize = 60;

/// Proof of control over one domain of an order.
///
/// Authorizations may already be valid when the account proved control recently; check
/// [`need_challenge`](Self::need_challenge) before publishing anything.
#[derive(Debug)]
pub struct Auth {
    inner: Arc<AccountInner>,
    api_auth: api::Authorization,
    auth_url: String,
}

impl Auth {
    pub(crate) fn new(
        inner: &Arc<AccountInner>,
        api_auth: api::Authorization,
        auth_url: &str,
    ) -> Self {
        Auth {
            inner: Arc::clone(inner),
            api_auth,
            auth_url: auth_url.to_owned(),
        }
    }

    /// Domain name for this authorization, without any `*.` prefix.
    pub fn domain_name(&self) -> &str {
        &self.api_auth.identifier.value
    }

    pub fn need_challenge(&self) -> bool {
        !matches!(self.api_auth.status, api::AuthorizationStatus::Valid)
    }

    /// The `dns-01` challenge of this authorization.
    ///
    /// Its proof goes into a TXT record:
    ///
    /// ```text
    /// _acme-challenge.<domain>.  TXT  <proof>
    /// ```
    pub fn dns_challenge(&self) -> Option<DnsChallenge> {
        self.api_auth.dns_challenge().map(|c| DnsChallenge {
            inner: Arc::clone(&self.inner),
            api_challenge: c.clone(),
            auth_url: self.auth_url.clone(),
        })
    }

    pub fn api_auth(&self) -> &api::Authorization {
        &self.api_auth
    }
}

/// A `dns-01` challenge (RFC 8555 §8.4).
pub struct DnsChallenge {
    inner: Arc<AccountInner>,
    api_challenge: api::Challenge,
    auth_url: String,
}

impl DnsChallenge {
    /// TXT record value: base64url(SHA-256(key authorization)).
    pub fn dns_proof(&self) -> eyre::Result<String> {
        let key_auth = key_authorization(&self.api_challenge.token, self.inner.transport.acme_key())?;
        Ok(base64url(&Sha256::digest(key_auth)))
    }

    pub fn need_validate(&self) -> bool {
        matches!(self.api_challenge.status, api::ChallengeStatus::Pending)
    }

    /// Asks the server to check the published proof, then polls the authorization every
    /// `delay` until it leaves `pending`.
    pub async fn validate(&self, delay: Duration) -> eyre::Result<()> {
        let res = self
            .inner
            .transport
            .call_kid(&self.api_challenge.url, &api::EmptyObject)
            .await?;
        let _api_challenge = read_json::<api::Challenge>(res).await?;

        let auth = poll_authorization_result(&self.inner, &self.auth_url, delay).await?;

        if !matches!(auth.status, api::AuthorizationStatus::Valid) {
            let reason = match auth.challenge_error() {
                Some(problem) => problem.to_string(),
                None => format!("authorization is {:?} without an error", auth.status),
            };

            return Err(eyre::eyre!(
                "validation of {} failed: {reason}",
                auth.identifier.value
            ));
        }

        Ok(())
    }

    pub fn api_challenge(&self) -> &api::Challenge {
        &self.api_challenge
    }
}

fn key_authorization(token: &str, key: &AcmeKey) -> eyre::Result<String> {
    let thumbprint = Jwk::from_key(key)?.thumbprint()?;
    Ok(format!("{token}.{thumbprint}"))
}

async fn poll_authorization_result(
    acc: &AccountInner,
    auth_url: &str,
    delay: Duration,
) -> eyre::Result<api::Authorization> {
    for _ in 0..MAX_AUTHORIZATION_POLLS {
        let res = acc.transport.call_kid(auth_url, &api::EmptyString).await?;
        let auth = read_json::<api::Authorization>(res).await?;

        if !matches!(auth.status, api::AuthorizationStatus::Pending) {
            return Ok(auth);
        }

        tokio::time::sleep(delay).await;
    }

    Err(eyre::eyre!(
        "authorization {auth_url} still pending after {MAX_AUTHORIZATION_POLLS} polls"
    ))
}
