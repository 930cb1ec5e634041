use std::path::{Path, PathBuf};

use eyre::WrapErr as _;
use zeroize::Zeroizing;

use crate::{
    cert::{CertificateInfo, CertificateMaterial},
    persist::{commit, ensure_parent_dir, stage},
};

/// The certificate chain and private key the DNS server serves from.
#[derive(Debug, Clone)]
pub struct CertificateFiles {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl CertificateFiles {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }

    /// Parses the end-entity certificate on disk.
    pub fn info(&self) -> eyre::Result<CertificateInfo> {
        let pem = std::fs::read_to_string(&self.cert_path)
            .wrap_err_with(|| format!("failed to read certificate {}", self.cert_path.display()))?;
        CertificateInfo::from_pem(&pem)
    }

    /// Reads and validates both files.
    pub fn load(&self) -> eyre::Result<CertificateMaterial> {
        let certificate = std::fs::read_to_string(&self.cert_path)
            .wrap_err_with(|| format!("failed to read certificate {}", self.cert_path.display()))?;
        let private_key = std::fs::read_to_string(&self.key_path)
            .wrap_err_with(|| format!("failed to read private key {}", self.key_path.display()))?;

        CertificateMaterial::parse(Zeroizing::new(private_key), certificate)
    }

    /// Replaces both files. The pair is staged completely before either is renamed into place.
    pub fn save(&self, material: &CertificateMaterial) -> eyre::Result<()> {
        ensure_parent_dir(&self.cert_path)?;
        ensure_parent_dir(&self.key_path)?;

        let staged_cert = stage(&self.cert_path, material.certificate().as_bytes(), Some(0o644))?;
        let staged_key = match stage(&self.key_path, material.private_key().as_bytes(), Some(0o600))
        {
            Ok(staged) => staged,
            Err(err) => {
                let _ = std::fs::remove_file(&staged_cert);
                return Err(err.into());
            }
        };

        commit(&staged_cert, &self.cert_path)?;
        commit(&staged_key, &self.key_path)?;

        log::info!(
            "Saved certificate to {} and key to {}",
            self.cert_path.display(),
            self.key_path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::test::self_signed;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let files = CertificateFiles::new(dir.path().join("tls/cert.pem"), dir.path().join("tls/key.pem"));
        assert!(!files.exists());
        assert!(files.info().is_err());

        let (cert, key) = self_signed(
            "zone.example.com",
            &["zone.example.com"],
            OffsetDateTime::now_utc() + Duration::days(30),
        );
        let material = CertificateMaterial::parse(key, cert).unwrap();
        files.save(&material).unwrap();

        assert!(files.exists());
        assert_eq!(files.load().unwrap(), material);
        assert!(files.info().unwrap().covers("zone.example.com"));
        assert!(!dir.path().join("tls/cert.pem.tmp").exists());
        assert!(!dir.path().join("tls/key.pem.tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;

            let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode(files.cert_path()), 0o644);
            assert_eq!(mode(files.key_path()), 0o600);
        }
    }

    #[test]
    fn mismatched_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = CertificateFiles::new(dir.path().join("cert.pem"), dir.path().join("key.pem"));

        let (cert, _key) = self_signed(
            "zone.example.com",
            &["zone.example.com"],
            OffsetDateTime::now_utc() + Duration::days(30),
        );
        std::fs::write(files.cert_path(), cert).unwrap();
        std::fs::write(files.key_path(), "garbage").unwrap();

        assert!(files.info().is_ok());
        assert!(files.load().is_err());
    }
}
