//! Cryptographic helpers for signature inspection.

pub mod cms;

pub use cms::{parse_signed_data, CertificateInfo, CmsSignature};
