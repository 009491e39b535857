//! Code signature decoding for Mach-O binaries
//!
//! [`CodeSignature::parse`] walks the embedded signature superblob and
//! decodes each sub-blob it understands: CodeDirectories, the requirement
//! set, XML and DER entitlements, and the CMS signature. Anything else is
//! kept as an [`OtherBlob`].

pub mod code_directory;
pub mod constants;
pub mod der;
pub mod requirements;
pub mod superblob;

pub use code_directory::{CodeDirectory, ExecSegment, HashSlot, Linkage};
pub use requirements::{Requirement, RequirementSet};
pub use superblob::{BlobIndex, SuperBlob};

use crate::crypto::{parse_signed_data, CmsSignature};
use crate::Result;
use constants::*;

/// A superblob entry this crate does not decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtherBlob {
    pub slot: u32,
    pub magic: u32,
    pub length: u32,
}

impl OtherBlob {
    pub fn slot_name(&self) -> &'static str {
        slot_name(self.slot)
    }
}

/// A decoded embedded code signature.
#[derive(Debug, Clone)]
pub struct CodeSignature {
    /// Declared superblob length
    pub length: u32,
    /// Primary and alternate directories, in index order
    pub code_directories: Vec<CodeDirectory>,
    pub requirements: Option<RequirementSet>,
    /// XML entitlements payload, verbatim
    pub entitlements: Option<Vec<u8>>,
    /// DER entitlements payload, verbatim
    pub der_entitlements: Option<Vec<u8>>,
    /// CMS signature; `None` for ad-hoc signatures
    pub cms: Option<CmsSignature>,
    /// Whether the signature slot exists (possibly empty)
    pub has_signature_slot: bool,
    pub other_blobs: Vec<OtherBlob>,
}

impl CodeSignature {
    /// Decode a signature superblob.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedSignature`] for a malformed superblob
    /// index or sub-blob, and [`crate::Error::UnsupportedFormatVariant`]
    /// for CodeDirectory versions or hash types that are not handled.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let superblob = SuperBlob::parse(blob)?;
        let mut sig = CodeSignature {
            length: superblob.length,
            code_directories: Vec::new(),
            requirements: None,
            entitlements: None,
            der_entitlements: None,
            cms: None,
            has_signature_slot: false,
            other_blobs: Vec::new(),
        };

        for entry in superblob.entries() {
            let data = superblob.blob(entry);
            let payload = &data[BLOB_HEADER_SIZE..];
            match entry.slot {
                s if is_code_directory_slot(s) => {
                    sig.code_directories.push(CodeDirectory::parse(s, data)?);
                }
                CSSLOT_REQUIREMENTS => sig.requirements = Some(RequirementSet::parse(data)?),
                CSSLOT_ENTITLEMENTS => sig.entitlements = Some(payload.to_vec()),
                CSSLOT_DER_ENTITLEMENTS => sig.der_entitlements = Some(payload.to_vec()),
                CSSLOT_SIGNATURESLOT => {
                    sig.has_signature_slot = true;
                    if !payload.is_empty() {
                        sig.cms = Some(parse_signed_data(payload)?);
                    }
                }
                _ => sig.other_blobs.push(OtherBlob {
                    slot: entry.slot,
                    magic: entry.magic,
                    length: entry.length,
                }),
            }
        }

        tracing::debug!(
            directories = sig.code_directories.len(),
            adhoc = sig.is_adhoc(),
            "decoded code signature"
        );
        Ok(sig)
    }

    /// The directory in the primary slot, else the first alternate.
    pub fn code_directory(&self) -> Option<&CodeDirectory> {
        self.code_directories
            .iter()
            .find(|cd| cd.slot == CSSLOT_CODEDIRECTORY)
            .or_else(|| self.code_directories.first())
    }

    /// The directory using the strongest hash type.
    pub fn best_code_directory(&self) -> Option<&CodeDirectory> {
        self.code_directories.iter().max_by_key(|cd| match cd.hash_type {
            CS_HASHTYPE_SHA384 => 3,
            CS_HASHTYPE_SHA256 => 2,
            CS_HASHTYPE_SHA256_TRUNCATED => 1,
            _ => 0,
        })
    }

    /// Ad-hoc: no CMS payload, or the directory says so.
    pub fn is_adhoc(&self) -> bool {
        self.cms.is_none()
            || self
                .code_directory()
                .is_some_and(|cd| cd.flags & CS_ADHOC != 0)
    }

    /// XML entitlements parsed as a property list.
    pub fn entitlements_plist(&self) -> Result<Option<plist::Value>> {
        self.entitlements
            .as_deref()
            .map(|xml| plist::Value::from_reader_xml(xml).map_err(Into::into))
            .transpose()
    }

    /// DER entitlements decoded into a property list.
    pub fn der_entitlements_plist(&self) -> Result<Option<plist::Value>> {
        self.der_entitlements.as_deref().map(der::der_to_plist).transpose()
    }
}
