use std::{
    io,
    path::{Path, PathBuf},
};

use eyre::WrapErr as _;
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    api,
    create_p256_key,
    persist::{commit, ensure_parent_dir, stage},
};

/// The ACME account owner, as persisted in `acme_user.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AcmeUser {
    pub email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<Registration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Registration {
    /// Account URL, used as JWS key ID.
    pub uri: String,
    pub body: api::Account,
}

impl AcmeUser {
    pub fn new(email: &str) -> Self {
        AcmeUser {
            email: email.to_owned(),
            registration: None,
        }
    }

    pub fn contact(&self) -> Option<Vec<String>> {
        (!self.email.is_empty()).then(|| vec![format!("mailto:{}", self.email)])
    }
}

/// `acme_user.json` and `acme_key.pem`, both owner-readable only.
#[derive(Debug, Clone)]
pub(crate) struct AccountStore {
    user_path: PathBuf,
    key_path: PathBuf,
}

impl AccountStore {
    pub fn new(dir: &Path) -> Self {
        AccountStore {
            user_path: dir.join("acme_user.json"),
            key_path: dir.join("acme_key.pem"),
        }
    }

    /// The persisted user and account key, or `None` when either file is missing.
    pub fn load(&self) -> eyre::Result<Option<(AcmeUser, Zeroizing<String>)>> {
        let Some(user) = read_optional(&self.user_path)? else {
            return Ok(None);
        };
        let Some(key_pem) = read_optional(&self.key_path)? else {
            return Ok(None);
        };

        let user = serde_json::from_str::<AcmeUser>(&user)
            .wrap_err_with(|| format!("malformed ACME user file {}", self.user_path.display()))?;

        p256::ecdsa::SigningKey::from_pkcs8_pem(&key_pem)
            .wrap_err_with(|| format!("unreadable ACME key {}", self.key_path.display()))?;

        Ok(Some((user, key_pem)))
    }

    /// Loads the persisted user, or makes a new unregistered one with a fresh key.
    pub fn load_or_create(&self, email: &str) -> eyre::Result<(AcmeUser, Zeroizing<String>)> {
        if let Some((user, key_pem)) = self.load()? {
            log::info!("Loaded ACME user from {}", self.user_path.display());
            return Ok((user, key_pem));
        }

        log::info!("No ACME user found, creating a new one");
        let key_pem = create_p256_key()
            .to_pkcs8_pem(pem::LineEnding::LF)
            .wrap_err("failed to encode ACME account key")?;

        Ok((AcmeUser::new(email), key_pem))
    }

    /// Writes both files, replacing neither until both are staged.
    pub fn save(&self, user: &AcmeUser, key_pem: &str) -> eyre::Result<()> {
        let json = serde_json::to_vec_pretty(user)?;

        ensure_parent_dir(&self.user_path)?;
        ensure_parent_dir(&self.key_path)?;

        let staged_user = stage(&self.user_path, &json, Some(0o600))?;
        let staged_key = stage(&self.key_path, key_pem.as_bytes(), Some(0o600))?;

        commit(&staged_user, &self.user_path)?;
        commit(&staged_key, &self.key_path)?;

        log::info!(
            "Saved ACME user to {} and {}",
            self.user_path.display(),
            self.key_path.display()
        );
        Ok(())
    }
}

fn read_optional(path: &Path) -> eyre::Result<Option<Zeroizing<String>>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(Zeroizing::new(content))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).wrap_err_with(|| format!("failed to read {}", path.display())),
    }
}
