use serde::{Deserialize, Serialize};

/// Directory object used for client self-configuration (RFC 8555 §7.1.1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_cert: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub caa_identities: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_required: Option<bool>,
}

impl DirectoryMeta {
    /// External account binding is not supported; such directories are rejected up front.
    pub fn external_account_required(&self) -> bool {
        self.external_account_required.unwrap_or(false)
    }
}
