use std::io::{BufReader, Cursor};

use der::{
    asn1::Ia5String,
    oid::AssociatedOid as _,
    time::{Duration, OffsetDateTime, PrimitiveDateTime},
    Decode as _,
};
use eyre::{eyre, WrapErr as _};
use pkcs8::DecodePrivateKey as _;
use x509_cert::{
    builder::{Builder, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
};
use zeroize::Zeroizing;

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Creates a CSR for `domains`, signed with `signer`.
///
/// The first domain becomes the Common Name. All domains go into the SAN extension.
pub(crate) fn create_csr(
    signer: &p256::ecdsa::SigningKey,
    domains: &[&str],
) -> eyre::Result<x509_cert::request::CertReq> {
    let primary_domain = domains
        .first()
        .ok_or_else(|| eyre!("cannot create a CSR without domains"))?;

    let subject = format!("CN={primary_domain}")
        .parse::<Name>()
        .wrap_err("invalid subject name")?;

    let mut csr = CsrBuilder::new(subject, signer).wrap_err("csr builder")?;

    let names = domains
        .iter()
        .map(|domain| Ia5String::new(domain).map(GeneralName::DnsName))
        .collect::<Result<Vec<_>, _>>()
        .wrap_err("domain is not a valid IA5 string")?;

    csr.add_extension(&SubjectAltName(names))
        .wrap_err("add SAN extension")?;

    csr.build::<p256::ecdsa::DerSignature>()
        .wrap_err("build csr")
}

/// An issued certificate chain and its private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    private_key_pem: Zeroizing<String>,
    certificate: String,
}

impl CertificateMaterial {
    /// Validates both halves before accepting them.
    pub fn parse(private_key_pem: Zeroizing<String>, certificate: String) -> eyre::Result<Self> {
        CertificateInfo::from_pem(&certificate)?;
        p256::ecdsa::SigningKey::from_pkcs8_pem(&private_key_pem)
            .wrap_err("private key is not a PKCS #8 P-256 key")?;

        Ok(CertificateMaterial {
            private_key_pem,
            certificate,
        })
    }

    pub fn private_key(&self) -> &str {
        &self.private_key_pem
    }

    /// The certificate chain, end-entity first.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    pub fn info(&self) -> eyre::Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.certificate)
    }
}

/// Facts read from the end-entity certificate of a PEM chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub not_after: OffsetDateTime,
}

impl CertificateInfo {
    pub fn from_pem(pem: &str) -> eyre::Result<Self> {
        let mut rdr = BufReader::new(Cursor::new(pem));

        let cert_ee = rustls_pemfile::certs(&mut rdr)
            .next()
            .ok_or_else(|| eyre!("no certificates in PEM"))?
            .wrap_err("unreadable PEM certificate")?;

        let cert = x509_cert::Certificate::from_der(&cert_ee).wrap_err("malformed certificate")?;
        let tbs = &cert.tbs_certificate;

        let not_after = tbs.validity.not_after.to_date_time();
        let not_after = PrimitiveDateTime::try_from(not_after)
            .map_err(|err| eyre!("certificate expiry out of range: {err}"))?
            // X.509 validity times are UTC
            .assume_utc();

        let common_name = tbs
            .subject
            .to_string()
            .split(',')
            .find_map(|rdn| rdn.trim().strip_prefix("CN="))
            .map(ToOwned::to_owned);

        let mut dns_names = Vec::new();

        for ext in tbs.extensions.iter().flatten() {
            if ext.extn_id != SubjectAltName::OID {
                continue;
            }

            let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
                .wrap_err("malformed SAN extension")?;

            dns_names.extend(san.0.iter().filter_map(|name| match name {
                GeneralName::DnsName(dns) => Some(dns.to_string()),
                _ => None,
            }));
        }

        Ok(CertificateInfo {
            common_name,
            dns_names,
            not_after,
        })
    }

    /// Time left until `not_after`; negative once expired.
    pub fn time_until_expiry(&self) -> Duration {
        self.not_after - OffsetDateTime::now_utc()
    }

    pub fn is_expired(&self) -> bool {
        self.time_until_expiry() <= Duration::ZERO
    }

    /// Whole days of validity left, as Let's Encrypt counts them.
    pub fn valid_days_left(&self) -> i64 {
        self.time_until_expiry().whole_days()
    }

    /// Whether the CN or one of the DNS SANs matches `domain`.
    pub fn covers(&self, domain: &str) -> bool {
        self.common_name
            .iter()
            .chain(&self.dns_names)
            .any(|name| name_matches(name, domain))
    }
}

/// Case-insensitive host match; `*.` patterns cover exactly one extra leftmost label.
pub(crate) fn name_matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let domain = domain.trim_end_matches('.');

    if pattern.eq_ignore_ascii_case(domain) {
        return true;
    }

    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };

    match domain.split_once('.') {
        Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use der::Encode as _;

    use super::*;
    use crate::test::self_signed;

    #[test]
    fn csr_carries_cn_and_all_sans() {
        let key = create_p256_key();
        let csr = create_csr(&key, &["zone.example.com", "app.zone.example.com"]).unwrap();

        assert!(csr.info.subject.to_string().contains("CN=zone.example.com"));
        let der = csr.to_der().unwrap();
        assert!(!der.is_empty());

        assert!(create_csr(&key, &[]).is_err());
    }

    #[test]
    fn parses_names_and_expiry() {
        let not_after = OffsetDateTime::now_utc() + Duration::days(60);
        let (cert, key) = self_signed(
            "zone.example.com",
            &["zone.example.com", "app.zone.example.com"],
            not_after,
        );

        let info = CertificateInfo::from_pem(&cert).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("zone.example.com"));
        assert_eq!(info.dns_names, ["zone.example.com", "app.zone.example.com"]);
        assert!(!info.is_expired());
        assert!((58..=60).contains(&info.valid_days_left()));

        let material = CertificateMaterial::parse(key, cert).unwrap();
        assert_eq!(material.info().unwrap(), info);
    }

    #[test]
    fn expired_certificate_is_reported() {
        let not_after = OffsetDateTime::now_utc() - Duration::hours(1);
        let (cert, _key) = self_signed("zone.example.com", &["zone.example.com"], not_after);

        let info = CertificateInfo::from_pem(&cert).unwrap();
        assert!(info.is_expired());
        assert!(info.time_until_expiry() < Duration::hours(720));
    }

    #[test]
    fn coverage_uses_cn_sans_and_wildcards() {
        let not_after = OffsetDateTime::now_utc() + Duration::days(30);
        let (cert, _key) = self_signed(
            "Zone.Example.com",
            &["app.zone.example.com", "*.lab.zone.example.com"],
            not_after,
        );
        let info = CertificateInfo::from_pem(&cert).unwrap();

        assert!(info.covers("zone.example.com"));
        assert!(info.covers("APP.zone.example.com"));
        assert!(info.covers("nas.lab.zone.example.com"));
        assert!(!info.covers("a.b.lab.zone.example.com"));
        assert!(!info.covers("lab.zone.example.com"));
        assert!(!info.covers("other.zone.example.com"));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(CertificateInfo::from_pem("").is_err());
        assert!(CertificateInfo::from_pem("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n").is_err());
    }
}
