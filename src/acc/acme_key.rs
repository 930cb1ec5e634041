use eyre::WrapErr as _;
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use zeroize::Zeroizing;

/// Account signing key plus the account URL once the server assigned one.
#[derive(Clone, Debug)]
pub(crate) struct AcmeKey {
    signing_key: p256::ecdsa::SigningKey,
    key_id: Option<String>,
}

impl AcmeKey {
    pub(crate) fn new() -> AcmeKey {
        Self::from_key(crate::create_p256_key())
    }

    pub(crate) fn from_pem(pem: &str) -> eyre::Result<AcmeKey> {
        let signing_key = p256::ecdsa::SigningKey::from_pkcs8_pem(pem)
            .wrap_err("failed to read account key PEM")?;
        Ok(Self::from_key(signing_key))
    }

    fn from_key(signing_key: p256::ecdsa::SigningKey) -> AcmeKey {
        AcmeKey {
            signing_key,
            key_id: None,
        }
    }

    pub(crate) fn to_pem(&self) -> eyre::Result<Zeroizing<String>> {
        self.signing_key
            .to_pkcs8_pem(pem::LineEnding::LF)
            .wrap_err("failed to encode account key PEM")
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }

    pub(crate) fn key_id(&self) -> eyre::Result<&str> {
        self.key_id
            .as_deref()
            .ok_or_else(|| eyre::eyre!("account key has no key ID; register the account first"))
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid)
    }
}
