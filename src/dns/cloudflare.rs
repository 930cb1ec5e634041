//! Cloudflare API v4 as a [`RecordApi`].
//!
//! - `GET /zones?name={zone}` finds the zone id
//! - `GET /zones/{zone_id}/dns_records?name=..&type=..` lists records
//! - `POST /zones/{zone_id}/dns_records` creates one
//! - `DELETE /zones/{zone_id}/dns_records/{id}` deletes one
//!
//! The token needs `Zone:DNS:Edit` on the zone.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{ApiRecord, DnsApiError, NewRecord, RecordApi};

const CLOUDFLARE_API_URL: &str = "https://api.cloudflare.com/client/v4";

/// Records of one Cloudflare zone.
#[derive(Debug, Clone)]
pub struct CloudflareApi {
    client: reqwest::Client,
    base_url: String,
    zone_id: String,
}

impl CloudflareApi {
    pub fn new(api_token: String, zone_id: String) -> Result<Self, DnsApiError> {
        Self::with_base_url(api_token, zone_id, CLOUDFLARE_API_URL)
    }

    pub fn with_base_url(
        api_token: String,
        zone_id: String,
        base_url: &str,
    ) -> Result<Self, DnsApiError> {
        Ok(Self {
            client: client(&api_token)?,
            base_url: base_url.trim_end_matches('/').to_owned(),
            zone_id,
        })
    }

    /// Finds the zone serving `domain` by trying ever shorter suffixes of it.
    pub async fn discover(
        api_token: String,
        base_url: Option<&str>,
        domain: &str,
    ) -> Result<Self, DnsApiError> {
        let mut api = Self::with_base_url(
            api_token,
            String::new(),
            base_url.unwrap_or(CLOUDFLARE_API_URL),
        )?;
        api.zone_id = api.lookup_zone_id(domain).await?;
        Ok(api)
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    async fn lookup_zone_id(&self, domain: &str) -> Result<String, DnsApiError> {
        let labels = domain.trim_end_matches('.').split('.').collect::<Vec<_>>();

        // stop before the bare TLD
        for idx in 0..labels.len().saturating_sub(1) {
            let zone_name = labels[idx..].join(".");
            log::debug!("Looking up Cloudflare zone {zone_name}");

            let res = self
                .client
                .get(format!("{}/zones", self.base_url))
                .query(&[("name", zone_name.as_str())])
                .send()
                .await?;
            let zones = read_result::<Vec<Zone>>(res).await?;

            if let Some(zone) = zones.into_iter().find(|z| z.name == zone_name) {
                log::debug!("Found Cloudflare zone {} for {domain}", zone.id);
                return Ok(zone.id);
            }
        }

        Err(DnsApiError::ZoneNotFound(domain.to_owned()))
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", self.base_url, self.zone_id)
    }
}

fn client(api_token: &str) -> Result<reqwest::Client, DnsApiError> {
    let mut auth =
        HeaderValue::from_str(&format!("Bearer {api_token}")).map_err(|_| DnsApiError::InvalidToken)?;
    auth.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, auth);

    Ok(reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(30))
        .build()?)
}

async fn read_result<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, DnsApiError> {
    let status = res.status();
    let body = res.json::<CloudflareResponse<T>>().await?;

    match body.result {
        Some(result) if body.success => Ok(result),
        _ => Err(DnsApiError::Api {
            status: status.as_u16(),
            message: body
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

#[async_trait]
impl RecordApi for CloudflareApi {
    async fn list_records(
        &self,
        name: &str,
        record_type: Option<&str>,
    ) -> Result<Vec<ApiRecord>, DnsApiError> {
        let mut query = vec![("name", name), ("per_page", "100")];
        if let Some(record_type) = record_type {
            query.push(("type", record_type));
        }

        let res = self
            .client
            .get(self.records_url())
            .query(&query)
            .send()
            .await?;

        Ok(read_result::<Vec<CfRecord>>(res)
            .await?
            .into_iter()
            .map(ApiRecord::from)
            .collect())
    }

    async fn create_record(&self, record: &NewRecord<'_>) -> Result<ApiRecord, DnsApiError> {
        log::debug!("Creating Cloudflare {} record {}", record.record_type, record.name);

        let res = self
            .client
            .post(self.records_url())
            .json(&CreateRecord {
                record_type: record.record_type,
                name: record.name,
                content: record.content,
                ttl: record.ttl,
                comment: "managed by zone-acme",
            })
            .send()
            .await?;

        read_result::<CfRecord>(res).await.map(ApiRecord::from)
    }

    async fn delete_record(&self, id: &str) -> Result<(), DnsApiError> {
        let res = self
            .client
            .delete(format!("{}/{id}", self.records_url()))
            .send()
            .await?;

        if res.status() == StatusCode::NOT_FOUND {
            log::debug!("Cloudflare record {id} already deleted");
            return Ok(());
        }

        read_result::<DeletedRecord>(res).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CloudflareError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CfRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    #[serde(default)]
    content: String,
}

impl From<CfRecord> for ApiRecord {
    fn from(record: CfRecord) -> Self {
        ApiRecord {
            id: record.id,
            name: record.name,
            record_type: record.record_type,
            content: record.content,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    comment: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeletedRecord {}
