use serde::{Deserialize, Serialize};

/// An ACME account resource (RFC 8555 §7.1.2).
///
/// Persisted alongside the account key so that a registration survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

impl Account {
    pub fn is_status_valid(&self) -> bool {
        self.status.as_deref() == Some("valid")
    }
}
