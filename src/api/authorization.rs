use serde::{Deserialize, Serialize};

use crate::api;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// An ACME authorization object (RFC 8555 §7.1.4).
///
/// When a `dns-01` challenge fails, the server reports why on the challenge:
///
/// ```json
/// {
///   "type": "dns-01",
///   "status": "invalid",
///   "error": {
///     "type": "urn:ietf:params:acme:error:dns",
///     "detail": "DNS problem: NXDOMAIN looking up TXT for _acme-challenge.app.zone.example.com"
///   },
///   "url": "https://ca.example/acme/chall/1",
///   "token": "YsNqBWZnyYjDun3aUC2CkCopOaqZRrI5hp3tUjxPLQU"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: api::Identifier,
    pub status: AuthorizationStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,

    pub challenges: Vec<Challenge>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<bool>,
}

impl Authorization {
    pub fn is_wildcard(&self) -> bool {
        self.wildcard.unwrap_or(false)
    }

    /// Returns the `dns-01` challenge, if the server offered one.
    pub fn dns_challenge(&self) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c._type == "dns-01")
    }

    /// First error reported on any of the challenges.
    pub fn challenge_error(&self) -> Option<&api::Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// An ACME challenge object (RFC 8555 §7.1.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub _type: String,

    pub url: String,
    pub status: ChallengeStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<api::Problem>,

    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_dns_challenge_and_error() {
        let auth: Authorization = serde_json::from_str(
            r#"{
                "identifier": { "type": "dns", "value": "app.zone.example.com" },
                "status": "invalid",
                "challenges": [
                    {
                        "type": "http-01",
                        "status": "pending",
                        "url": "https://ca.example/acme/chall/0",
                        "token": "a"
                    },
                    {
                        "type": "dns-01",
                        "status": "invalid",
                        "url": "https://ca.example/acme/chall/1",
                        "token": "b",
                        "error": {
                            "type": "urn:ietf:params:acme:error:dns",
                            "detail": "NXDOMAIN"
                        }
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(auth.dns_challenge().unwrap().token, "b");
        assert_eq!(auth.challenge_error().unwrap().detail.as_deref(), Some("NXDOMAIN"));
        assert!(!auth.is_wildcard());
    }
}
