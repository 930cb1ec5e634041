use std::{
    fs, io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use eyre::WrapErr as _;

use super::{ChallengeProvider, ChallengeRecord, CHALLENGE_TTL};
use crate::persist::{commit, ensure_parent_dir, stage};

/// Serves challenges from the self-hosted DNS server's zone directory.
///
/// Each challenge becomes `<zones_path>/<fqdn>.zone`, a one-record zone the server picks up on
/// reload.
#[derive(Debug, Clone)]
pub struct ZoneFileProvider {
    zones_path: PathBuf,
}

impl ZoneFileProvider {
    pub fn new(zones_path: impl Into<PathBuf>) -> Self {
        Self {
            zones_path: zones_path.into(),
        }
    }

    pub fn zone_file(&self, record: &ChallengeRecord) -> PathBuf {
        self.zones_path.join(format!("{}.zone", record.fqdn))
    }
}

fn zone_contents(record: &ChallengeRecord) -> String {
    format!(
        "$ORIGIN {}.\n@\t{CHALLENGE_TTL} IN\tTXT\t\"{}\"\n",
        record.fqdn, record.value
    )
}

fn write_zone(path: &Path, contents: &str) -> eyre::Result<()> {
    ensure_parent_dir(path)?;
    let staged = stage(path, contents.as_bytes(), Some(0o644))?;
    commit(&staged, path)?;
    Ok(())
}

#[async_trait]
impl ChallengeProvider for ZoneFileProvider {
    async fn present(&self, record: &ChallengeRecord) -> eyre::Result<()> {
        let path = self.zone_file(record);
        log::info!("Presenting DNS challenge for {} in {}", record.domain, path.display());

        write_zone(&path, &zone_contents(record))
            .wrap_err_with(|| format!("failed to write challenge zone for {}", record.domain))
    }

    async fn clean_up(&self, record: &ChallengeRecord) -> eyre::Result<()> {
        let path = self.zone_file(record);
        log::info!("Cleaning up DNS challenge for {}", record.domain);

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("Challenge zone {} already gone", path.display());
                Ok(())
            }
            Err(err) => Err::<(), _>(err)
                .wrap_err_with(|| format!("failed to remove challenge zone {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn present_writes_single_txt_zone() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ZoneFileProvider::new(dir.path().join("zones"));
        let record = ChallengeRecord::new("app.zone.example.com", "c2VjcmV0LXByb29m");

        provider.present(&record).await.unwrap();

        let path = dir
            .path()
            .join("zones/_acme-challenge.app.zone.example.com.zone");
        assert_eq!(provider.zone_file(&record), path);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "$ORIGIN _acme-challenge.app.zone.example.com.\n@\t60 IN\tTXT\t\"c2VjcmV0LXByb29m\"\n"
        );

        provider.clean_up(&record).await.unwrap();
        assert!(!path.exists());

        // second clean-up is harmless
        provider.clean_up(&record).await.unwrap();
    }
}
