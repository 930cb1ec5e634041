//! JSON payloads exchanged with the ACME server.
//!
//! Only the subset needed to obtain certificates through `dns-01` challenges is modelled.

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

mod account;
mod authorization;
mod directory;
mod order;

pub use self::{
    account::Account,
    authorization::{Authorization, AuthorizationStatus, Challenge, ChallengeStatus},
    directory::{Directory, DirectoryMeta},
    order::{Finalize, Order, OrderStatus},
};

/// Body of a POST-as-GET request. Serializes to `""`.
pub struct EmptyString;

impl Serialize for EmptyString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

/// Body used to trigger challenge validation. Serializes to `{}`.
pub struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// A `dns` identifier as carried by orders and authorizations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub(crate) fn dns(value: &str) -> Self {
        Self {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }
}

/// Problem document (RFC 7807) returned by the server on errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    pub(crate) fn new(_type: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            _type: _type.into(),
            detail,
            subproblems: None,
        }
    }

    fn has_type(&self, short: &str) -> bool {
        self._type == short
            || self
                ._type
                .strip_prefix("urn:ietf:params:acme:error:")
                .is_some_and(|t| t == short)
    }

    /// Returns true if the server rejected the request nonce.
    pub fn is_bad_nonce(&self) -> bool {
        self.has_type("badNonce")
    }

    /// Returns true if the server refused the request because of a rate limit.
    pub fn is_rate_limited(&self) -> bool {
        self.has_type("rateLimited")
    }

    /// Returns true if problem details indicate that JWS verification failed.
    pub fn is_jws_verification_error(&self) -> bool {
        (self.has_type("malformed") || self._type == "urn:acme:error:malformed")
            && self
                .detail
                .as_deref()
                .is_some_and(|detail| detail == "JWS verification error")
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type)?,
            None => write!(f, "{}", self._type)?,
        }

        for sub in self.subproblems.iter().flatten() {
            write!(f, "; {sub}")?;
        }

        Ok(())
    }
}

impl std::error::Error for Problem {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}

impl fmt::Display for Subproblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.identifier {
            write!(f, "[{}] ", id.value)?;
        }

        write!(f, "{}", self._type)?;

        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }

        Ok(())
    }
}
