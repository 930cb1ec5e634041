use serde::{Deserialize, Serialize};

use crate::api;

/// See RFC 8555 §7.1.6 for the transitions between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// An ACME order object (RFC 8555 §7.1.3).
///
/// ```json
/// {
///   "status": "pending",
///   "expires": "2025-01-09T08:26:43Z",
///   "identifiers": [
///     { "type": "dns", "value": "zone.example.com" },
///     { "type": "dns", "value": "app.zone.example.com" }
///   ],
///   "authorizations": [
///     "https://ca.example/acme/authz/0",
///     "https://ca.example/acme/authz/1"
///   ],
///   "finalize": "https://ca.example/acme/order/1/finalize"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    pub identifiers: Vec<api::Identifier>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<api::Problem>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorizations: Option<Vec<String>>,

    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub finalize: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl Order {
    pub(crate) fn from_identifiers(identifiers: Vec<api::Identifier>) -> Self {
        Self {
            identifiers,
            ..Default::default()
        }
    }

    /// Domains of the order, in request order.
    pub fn domains(&self) -> Vec<&str> {
        self.identifiers
            .iter()
            .map(|identifier| identifier.value.as_str())
            .collect()
    }

    /// Authorizations are done; the order accepts (or has accepted) a CSR.
    pub fn is_validated(&self) -> bool {
        matches!(
            self.status,
            Some(OrderStatus::Ready | OrderStatus::Processing | OrderStatus::Valid)
        )
    }

    pub fn is_status(&self, status: OrderStatus) -> bool {
        self.status == Some(status)
    }

    /// Replaces `self` with the server's view while keeping the requested identifier order.
    ///
    /// Servers may return identifiers reordered, which would swap the CN with a SAN.
    pub(crate) fn overwrite(&mut self, mut from_api: Self) -> eyre::Result<()> {
        if from_api.identifiers.len() != self.identifiers.len()
            || from_api
                .identifiers
                .iter()
                .any(|id| !self.identifiers.contains(id))
        {
            return Err(eyre::eyre!(
                "order identifiers mismatch: requested {:?}, server returned {:?}",
                self.domains(),
                from_api.domains()
            ));
        }

        from_api.identifiers = std::mem::take(&mut self.identifiers);
        *self = from_api;
        Ok(())
    }
}

/// Finalize request carrying a base64url-encoded DER CSR (RFC 8555 §7.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalize {
    pub csr: String,
}
