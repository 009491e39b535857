//! CMS signature inspection
//!
//! Uses the cryptographic-message-syntax crate to parse the SignedData
//! stored in the signature slot, and x509-certificate to summarise each
//! embedded certificate. Nothing here checks signatures or trust.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use cryptographic_message_syntax::SignedData;
use x509_certificate::X509Certificate;

/// Display fields of one certificate from the CMS certificate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub issuer_organization: Option<String>,
    pub issuer_organizational_unit: Option<String>,
    pub subject_common_name: Option<String>,
    /// Team ID on Apple developer certificates
    pub subject_organizational_unit: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    fn from_certificate(cert: &X509Certificate) -> Self {
        let issuer = cert.issuer_name();
        let subject = cert.subject_name();
        Self {
            issuer_organization: first_value(issuer.iter_organization()),
            issuer_organizational_unit: first_value(issuer.iter_organizational_unit()),
            subject_common_name: cert.subject_common_name(),
            subject_organizational_unit: first_value(subject.iter_organizational_unit()),
            not_before: cert.validity_not_before(),
            not_after: cert.validity_not_after(),
        }
    }

    /// Whether `at` falls inside the validity window. Informational only.
    pub fn is_current(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

/// First attribute in an RDN iterator that renders as a string.
fn first_value<'a, I>(mut atavs: I) -> Option<String>
where
    I: Iterator<Item = &'a x509_certificate::rfc3280::AttributeTypeAndValue>,
{
    atavs.find_map(|atav| atav.to_string().ok())
}

/// Summary of a CMS SignedData signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmsSignature {
    /// DER length of the SignedData
    pub length: usize,
    /// Number of SignerInfos
    pub signer_count: usize,
    /// Certificates in the order they appear
    pub certificates: Vec<CertificateInfo>,
}

/// Parse a CMS SignedData (the blob wrapper payload) and extract its
/// certificate list.
///
/// # Errors
///
/// Returns [`Error::MalformedSignature`] if the payload is not SignedData.
pub fn parse_signed_data(der: &[u8]) -> Result<CmsSignature> {
    let signed = SignedData::parse_ber(der)
        .map_err(|e| Error::MalformedSignature(format!("CMS: {}", e)))?;

    let certificates: Vec<CertificateInfo> = signed
        .certificates()
        .map(|cert| CertificateInfo::from_certificate(cert))
        .collect();

    tracing::debug!(certificates = certificates.len(), "parsed CMS signature");
    Ok(CmsSignature {
        length: der.len(),
        signer_count: signed.signers().count(),
        certificates,
    })
}

/// Self-signed signing material for tests.
#[cfg(test)]
pub(crate) mod test_support {
    use cryptographic_message_syntax::{SignedDataBuilder, SignerBuilder};
    use x509_certificate::{EcdsaCurve, KeyAlgorithm, X509CertificateBuilder};

    pub const COMMON_NAME: &str = "Apple Development: Jane Appleseed (ABCDE12345)";
    pub const TEAM_ID: &str = "ABCDE12345";
    pub const ORGANIZATION: &str = "Example Corp";
    pub const VALID_DAYS: i64 = 365;

    /// DER SignedData over `content`, signed by a fresh self-signed P-256
    /// certificate that is also the only entry of the certificate list.
    pub fn signed_data(content: &[u8]) -> Vec<u8> {
        let mut builder = X509CertificateBuilder::default();
        let subject = builder.subject();
        subject.append_common_name_utf8_string(COMMON_NAME).unwrap();
        subject.append_organizational_unit_utf8_string(TEAM_ID).unwrap();
        subject.append_organization_utf8_string(ORGANIZATION).unwrap();
        builder.validity_duration(chrono::Duration::days(VALID_DAYS));
        let (cert, key) = builder
            .create_with_random_keypair(KeyAlgorithm::Ecdsa(EcdsaCurve::Secp256r1))
            .unwrap();

        SignedDataBuilder::default()
            .content_external(content.to_vec())
            .signer(SignerBuilder::new(&key, cert.clone()))
            .certificate(cert)
            .build_der()
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_certificate_fields_from_signed_data() {
        let der = signed_data(b"code directory");
        let cms = parse_signed_data(&der).unwrap();
        assert_eq!(cms.length, der.len());
        assert_eq!(cms.signer_count, 1);

        let cert = &cms.certificates[0];
        assert_eq!(cert.subject_common_name.as_deref(), Some(COMMON_NAME));
        assert_eq!(cert.subject_organizational_unit.as_deref(), Some(TEAM_ID));
        // self-signed: the issuer is the subject
        assert_eq!(cert.issuer_organization.as_deref(), Some(ORGANIZATION));
        assert_eq!(cert.issuer_organizational_unit.as_deref(), Some(TEAM_ID));
        assert_eq!(cert.not_after - cert.not_before, chrono::Duration::days(VALID_DAYS));
        assert!(cert.not_before <= Utc::now());
        assert!(cert.is_current(cert.not_before));
        assert!(!cert.is_current(cert.not_after + chrono::Duration::days(1)));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = parse_signed_data(&[0x30, 0x03, 0x02, 0x01, 0x01]).unwrap_err();
        assert_eq!(err.tag(), "MalformedSignatureError");
    }

    #[test]
    fn test_empty_is_malformed() {
        assert!(matches!(parse_signed_data(&[]), Err(Error::MalformedSignature(_))));
    }
}
