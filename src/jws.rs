//! Flattened JWS construction for ACME requests (RFC 8555 §6.2, RFC 7515).

use ecdsa::signature::Signer as _;
use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::{acc::AcmeKey, util::base64url};

/// Identifies the signing key in the protected header.
///
/// `newAccount` carries the full public key; every later request uses the account URL.
#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum KeyRef {
    Jwk(Jwk),
    Kid(String),
}

#[derive(Debug, Serialize)]
pub(crate) struct ProtectedHeader<'a> {
    alg: &'static str,
    nonce: String,
    url: &'a str,
    #[serde(flatten)]
    key: KeyRef,
}

impl<'a> ProtectedHeader<'a> {
    pub(crate) fn new(key: KeyRef, url: &'a str, nonce: String) -> Self {
        Self {
            alg: "ES256",
            nonce,
            url,
            key,
        }
    }
}

/// Public part of the P-256 account key.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Jwk {
    alg: &'static str,
    crv: &'static str,
    kty: &'static str,
    #[serde(rename = "use")]
    use_: &'static str,
    x: String,
    y: String,
}

impl Jwk {
    pub(crate) fn from_key(key: &AcmeKey) -> eyre::Result<Self> {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(eyre::eyre!("account key has no affine coordinates"));
        };

        Ok(Jwk {
            alg: "ES256",
            crv: "P-256",
            kty: "EC",
            use_: "sig",
            x: base64url(x),
            y: base64url(y),
        })
    }

    /// RFC 7638 thumbprint: SHA-256 over the required members in lexical order.
    pub(crate) fn thumbprint(&self) -> eyre::Result<String> {
        #[derive(Serialize)]
        struct Thumb<'a> {
            crv: &'a str,
            kty: &'a str,
            x: &'a str,
            y: &'a str,
        }

        let json = serde_json::to_string(&Thumb {
            crv: self.crv,
            kty: self.kty,
            x: &self.x,
            y: &self.y,
        })?;

        Ok(base64url(&Sha256::digest(json)))
    }
}

#[derive(Debug, Serialize)]
struct FlattenedJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Serializes and signs `payload` into a flattened JSON JWS.
///
/// A payload serializing to `""` (POST-as-GET) yields an empty payload member.
pub(crate) fn sign<T: Serialize + ?Sized>(
    protected: &ProtectedHeader<'_>,
    key: &AcmeKey,
    payload: &T,
) -> eyre::Result<String> {
    let protected = base64url(&serde_json::to_string(protected)?);

    let payload = match serde_json::to_string(payload)? {
        json if json == "\"\"" => String::new(),
        json => base64url(&json),
    };

    let signature: p256::ecdsa::Signature = key
        .signing_key()
        .try_sign(format!("{protected}.{payload}").as_bytes())?;

    let jws = FlattenedJws {
        protected,
        payload,
        signature: base64url(&signature.to_bytes()),
    };

    Ok(serde_json::to_string(&jws)?)
}

#[cfg(test)]
mod tests {
    use base64::prelude::*;
    use ecdsa::signature::Verifier as _;

    use super::*;
    use crate::api;

    fn decode_json(part: &str) -> serde_json::Value {
        serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(part).unwrap()).unwrap()
    }

    #[test]
    fn kid_header_and_verifiable_signature() {
        let key = AcmeKey::new();
        let header = ProtectedHeader::new(
            KeyRef::Kid("https://ca.example/acct/1".to_owned()),
            "https://ca.example/new-order",
            "nonce-1".to_owned(),
        );

        let jws = sign(&header, &key, &serde_json::json!({ "a": 1 })).unwrap();
        let jws: serde_json::Value = serde_json::from_str(&jws).unwrap();

        let protected = jws["protected"].as_str().unwrap();
        let payload = jws["payload"].as_str().unwrap();

        let header = decode_json(protected);
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["kid"], "https://ca.example/acct/1");
        assert_eq!(header["nonce"], "nonce-1");
        assert!(header.get("jwk").is_none());
        assert_eq!(decode_json(payload)["a"], 1);

        let sig_bytes = BASE64_URL_SAFE_NO_PAD
            .decode(jws["signature"].as_str().unwrap())
            .unwrap();
        let sig = p256::ecdsa::Signature::from_slice(&sig_bytes).unwrap();
        key.signing_key()
            .verifying_key()
            .verify(format!("{protected}.{payload}").as_bytes(), &sig)
            .unwrap();
    }

    #[test]
    fn jwk_header_and_post_as_get() {
        let key = AcmeKey::new();
        let jwk = Jwk::from_key(&key).unwrap();
        let header = ProtectedHeader::new(KeyRef::Jwk(jwk), "https://ca.example/x", "n".to_owned());

        let jws = sign(&header, &key, &api::EmptyString).unwrap();
        let jws: serde_json::Value = serde_json::from_str(&jws).unwrap();

        assert_eq!(jws["payload"], "");
        let header = decode_json(jws["protected"].as_str().unwrap());
        assert_eq!(header["jwk"]["crv"], "P-256");
        assert!(header.get("kid").is_none());
    }

    #[test]
    fn thumbprint_is_stable_per_key() {
        let key = AcmeKey::new();
        let a = Jwk::from_key(&key).unwrap().thumbprint().unwrap();
        let b = Jwk::from_key(&key).unwrap().thumbprint().unwrap();
        assert_eq!(a, b);
        // base64url of a 32 byte digest, unpadded
        assert_eq!(a.len(), 43);

        let other = Jwk::from_key(&AcmeKey::new()).unwrap().thumbprint().unwrap();
        assert_ne!(a, other);
    }
}
