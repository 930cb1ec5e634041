use std::sync::Arc;

use async_trait::async_trait;
use eyre::WrapErr as _;

use super::{ChallengeProvider, ChallengeRecord, NewRecord, RecordApi, CHALLENGE_TTL};

/// Publishes challenges as TXT records through a [`RecordApi`].
pub struct RecordApiProvider {
    api: Arc<dyn RecordApi>,
}

impl RecordApiProvider {
    pub fn new(api: Arc<dyn RecordApi>) -> Self {
        Self { api }
    }
}

/// Some APIs hand TXT content back wrapped in quotes.
fn txt_content_eq(content: &str, value: &str) -> bool {
    content.trim_matches('"') == value
}

#[async_trait]
impl ChallengeProvider for RecordApiProvider {
    async fn present(&self, record: &ChallengeRecord) -> eyre::Result<()> {
        let created = self
            .api
            .create_record(&NewRecord {
                record_type: "TXT",
                name: &record.fqdn,
                content: &record.value,
                ttl: CHALLENGE_TTL,
            })
            .await
            .wrap_err_with(|| format!("failed to create TXT record {}", record.fqdn))?;

        log::debug!("Created TXT record {} ({})", record.fqdn, created.id);
        Ok(())
    }

    async fn clean_up(&self, record: &ChallengeRecord) -> eyre::Result<()> {
        let records = self
            .api
            .list_records(&record.fqdn, Some("TXT"))
            .await
            .wrap_err_with(|| format!("failed to list TXT records {}", record.fqdn))?;

        for stale in records
            .iter()
            .filter(|r| txt_content_eq(&r.content, &record.value))
        {
            self.api
                .delete_record(&stale.id)
                .await
                .wrap_err_with(|| format!("failed to delete TXT record {}", stale.id))?;
            log::debug!("Deleted TXT record {} ({})", record.fqdn, stale.id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::MockRecordApi;

    #[tokio::test]
    async fn cleanup_only_removes_own_value() {
        let api = Arc::new(MockRecordApi::with_records(&[
            ("_acme-challenge.zone.example.com", "TXT", "\"other-proof\""),
            ("zone.example.com", "A", "10.0.0.1"),
        ]));
        let provider = RecordApiProvider::new(Arc::clone(&api) as Arc<dyn RecordApi>);
        let record = ChallengeRecord::new("zone.example.com", "proof");

        provider.present(&record).await.unwrap();
        assert_eq!(api.records.lock().len(), 3);

        provider.clean_up(&record).await.unwrap();

        let left = api.records.lock().clone();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|r| r.content != "proof"));
        assert_eq!(
            api.calls(),
            [
                "create _acme-challenge.zone.example.com TXT proof",
                "list _acme-challenge.zone.example.com TXT",
                "delete rec-3",
            ]
        );
    }

    #[test]
    fn quoted_txt_content_matches() {
        assert!(txt_content_eq("\"abc\"", "abc"));
        assert!(txt_content_eq("abc", "abc"));
        assert!(!txt_content_eq("abcd", "abc"));
    }
}
