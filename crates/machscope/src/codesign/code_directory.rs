//! CodeDirectory blob decoding
//!
//! The CodeDirectory is the core data structure of an Apple code signature.
//! It holds the hashes of every code page plus the special slots
//! (Info.plist, requirements, resources, entitlements), and its own digest,
//! the CDHash, is the identity of the signed code.
//!
//! Header fields are version-gated:
//!
//! | version  | adds                                          |
//! |----------|-----------------------------------------------|
//! | 0x20001  | base header (44 bytes)                        |
//! | 0x20100  | scatterOffset                                 |
//! | 0x20200  | teamOffset                                    |
//! | 0x20300  | codeLimit64                                   |
//! | 0x20400  | execSegBase, execSegLimit, execSegFlags       |
//! | 0x20500  | runtime, preEncryptOffset                     |
//! | 0x20600  | linkage hash type, application type, range    |

use super::constants::*;
use crate::macho::Version;
use crate::{Error, Result};
use scroll::{Pread, BE};
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384};

// CodeDirectory header field offsets:
// magic: 0, length: 4, version: 8, flags: 12
// hashOffset: 16, identOffset: 20, nSpecialSlots: 24, nCodeSlots: 28
// codeLimit: 32, hashSize: 36, hashType: 37, platform: 38, pageSize: 39
// spare2: 40, scatterOffset: 44, teamOffset: 48, spare3: 52
// codeLimit64: 56, execSegBase: 64, execSegLimit: 72, execSegFlags: 80
// runtime: 88, preEncryptOffset: 92
// linkageHashType: 96, linkageApplicationType: 97, linkageApplicationSubType: 98,
// linkageOffset: 100, linkageSize: 104
const BASE_HEADER_SIZE: usize = 44;

/// Largest page size exponent accepted (4 GiB pages)
const MAX_PAGE_SHIFT: u8 = 32;

/// One hash slot. Special slots have negative indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashSlot {
    pub index: i64,
    pub hash: Vec<u8>,
}

impl HashSlot {
    /// Whether every byte of the hash is zero (an unused special slot).
    pub fn is_empty(&self) -> bool {
        self.hash.iter().all(|&b| b == 0)
    }
}

/// Executable segment description (version 0x20400+).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecSegment {
    pub base: u64,
    pub limit: u64,
    pub flags: u64,
}

/// Linkage hash description (version 0x20600+).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linkage {
    pub hash_type: u8,
    pub application_type: u8,
    pub application_subtype: u16,
    pub offset: u32,
    pub size: u32,
}

/// A decoded CodeDirectory.
#[derive(Debug, Clone)]
pub struct CodeDirectory {
    /// Superblob slot the directory was found in
    pub slot: u32,
    pub version: u32,
    pub flags: u32,
    pub hash_type: u8,
    pub hash_size: u8,
    pub platform: u8,
    /// log2 of the page size; 0 means the whole code limit is one page
    pub page_size_log2: u8,
    pub code_limit: u64,
    pub n_special_slots: u32,
    pub n_code_slots: u32,
    pub hash_offset: u32,
    pub identifier: String,
    pub team_id: Option<String>,
    pub scatter_offset: Option<u32>,
    pub exec_segment: Option<ExecSegment>,
    pub runtime: Option<Version>,
    pub pre_encrypt_offset: Option<u32>,
    pub linkage: Option<Linkage>,
    /// Special slots (`-n..=-1`) followed by code slots (`0..`)
    pub slots: Vec<HashSlot>,
    /// Digest of the raw directory bytes
    pub cdhash: Vec<u8>,
    raw: Vec<u8>,
}

/// Digest size of a CodeDirectory hash type.
pub fn hash_type_size(hash_type: u8) -> Option<usize> {
    match hash_type {
        CS_HASHTYPE_SHA1 | CS_HASHTYPE_SHA256_TRUNCATED => Some(CS_SHA1_LEN),
        CS_HASHTYPE_SHA256 => Some(CS_SHA256_LEN),
        CS_HASHTYPE_SHA384 => Some(CS_SHA384_LEN),
        _ => None,
    }
}

/// Name of a CodeDirectory hash type.
pub fn hash_type_name(hash_type: u8) -> &'static str {
    match hash_type {
        CS_HASHTYPE_NOHASH => "none",
        CS_HASHTYPE_SHA1 => "sha1",
        CS_HASHTYPE_SHA256 => "sha256",
        CS_HASHTYPE_SHA256_TRUNCATED => "sha256-truncated",
        CS_HASHTYPE_SHA384 => "sha384",
        _ => "unknown",
    }
}

/// Hash `data` with the algorithm of `hash_type`, truncated to the type's size.
pub fn digest(hash_type: u8, data: &[u8]) -> Option<Vec<u8>> {
    let full = match hash_type {
        CS_HASHTYPE_SHA1 => Sha1::digest(data).to_vec(),
        CS_HASHTYPE_SHA256 | CS_HASHTYPE_SHA256_TRUNCATED => Sha256::digest(data).to_vec(),
        CS_HASHTYPE_SHA384 => Sha384::digest(data).to_vec(),
        _ => return None,
    };
    let size = hash_type_size(hash_type)?;
    Some(full[..size].to_vec())
}

fn malformed(msg: String) -> Error {
    Error::MalformedSignature(format!("CodeDirectory: {}", msg))
}

impl CodeDirectory {
    /// Decode a CodeDirectory blob found in `slot`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedFormatVariant`] for versions below 0x20001 or
    ///   unknown hash types
    /// - [`Error::MalformedSignature`] for a short header, a hash size that
    ///   contradicts the hash type, strings or slots outside the blob, or a
    ///   slot count that does not cover the code limit
    pub fn parse(slot: u32, blob: &[u8]) -> Result<Self> {
        let u8_at = |off: usize| -> Result<u8> {
            blob.pread_with::<u8>(off, BE)
                .map_err(|e| malformed(format!("read at {:#x}: {}", off, e)))
        };
        let u16_at = |off: usize| -> Result<u16> {
            blob.pread_with::<u16>(off, BE)
                .map_err(|e| malformed(format!("read at {:#x}: {}", off, e)))
        };
        let u32_at = |off: usize| -> Result<u32> {
            blob.pread_with::<u32>(off, BE)
                .map_err(|e| malformed(format!("read at {:#x}: {}", off, e)))
        };
        let u64_at = |off: usize| -> Result<u64> {
            blob.pread_with::<u64>(off, BE)
                .map_err(|e| malformed(format!("read at {:#x}: {}", off, e)))
        };

        if blob.len() < BASE_HEADER_SIZE {
            return Err(malformed(format!("{} bytes is shorter than the header", blob.len())));
        }
        let magic = u32_at(0)?;
        if magic != CSMAGIC_CODEDIRECTORY {
            return Err(malformed(format!("bad magic {:#010x}", magic)));
        }
        let length = u32_at(4)? as usize;
        if length > blob.len() || length < BASE_HEADER_SIZE {
            return Err(malformed(format!("length {:#x} outside blob of {:#x}", length, blob.len())));
        }
        let raw = &blob[..length];

        let version = u32_at(8)?;
        if version < CODEDIRECTORY_VERSION_EARLIEST {
            return Err(Error::UnsupportedFormatVariant(format!(
                "CodeDirectory version {:#x}",
                version
            )));
        }
        let flags = u32_at(12)?;
        let hash_offset = u32_at(16)?;
        let ident_offset = u32_at(20)?;
        let n_special_slots = u32_at(24)?;
        let n_code_slots = u32_at(28)?;
        let code_limit32 = u32_at(32)?;
        let hash_size = u8_at(36)?;
        let hash_type = u8_at(37)?;
        let platform = u8_at(38)?;
        let page_size_log2 = u8_at(39)?;

        let expected_size = hash_type_size(hash_type).ok_or_else(|| {
            Error::UnsupportedFormatVariant(format!("CodeDirectory hash type {}", hash_type))
        })?;
        if hash_size as usize != expected_size {
            return Err(malformed(format!(
                "hash size {} contradicts {} ({} bytes)",
                hash_size,
                hash_type_name(hash_type),
                expected_size
            )));
        }
        if page_size_log2 > MAX_PAGE_SHIFT {
            return Err(malformed(format!("page size 2^{}", page_size_log2)));
        }

        // later fields only exist when the header is long enough to hold them
        let gated = |min_version: u32, end: usize| version >= min_version && length >= end;

        let scatter_offset = if gated(CODEDIRECTORY_VERSION_SCATTER, 48) {
            Some(u32_at(44)?).filter(|&o| o != 0)
        } else {
            None
        };
        let team_offset = if gated(CODEDIRECTORY_VERSION_TEAMID, 52) {
            u32_at(48)?
        } else {
            0
        };
        let code_limit64 = if gated(CODEDIRECTORY_VERSION_CODELIMIT64, 64) {
            u64_at(56)?
        } else {
            0
        };
        let exec_segment = if gated(CODEDIRECTORY_VERSION_EXECSEG, 88) {
            Some(ExecSegment {
                base: u64_at(64)?,
                limit: u64_at(72)?,
                flags: u64_at(80)?,
            })
        } else {
            None
        };
        let (runtime, pre_encrypt_offset) = if gated(CODEDIRECTORY_VERSION_RUNTIME, 96) {
            (Some(Version(u32_at(88)?)), Some(u32_at(92)?).filter(|&o| o != 0))
        } else {
            (None, None)
        };
        let linkage = if gated(CODEDIRECTORY_VERSION_LINKAGE, 108) {
            Some(Linkage {
                hash_type: u8_at(96)?,
                application_type: u8_at(97)?,
                application_subtype: u16_at(98)?,
                offset: u32_at(100)?,
                size: u32_at(104)?,
            })
        } else {
            None
        };

        let code_limit = if code_limit64 != 0 {
            code_limit64
        } else {
            code_limit32 as u64
        };

        let expected_slots = if page_size_log2 == 0 {
            u64::from(code_limit > 0)
        } else {
            code_limit.div_ceil(1u64 << page_size_log2)
        };
        if expected_slots != n_code_slots as u64 {
            return Err(malformed(format!(
                "{} code slots but code limit {:#x} with 2^{} pages needs {}",
                n_code_slots, code_limit, page_size_log2, expected_slots
            )));
        }

        let identifier = read_string(raw, ident_offset)
            .ok_or_else(|| malformed(format!("identifier offset {:#x} outside blob", ident_offset)))?;
        let team_id = if team_offset != 0 {
            Some(
                read_string(raw, team_offset)
                    .ok_or_else(|| malformed(format!("team offset {:#x} outside blob", team_offset)))?,
            )
        } else {
            None
        };

        let size = hash_size as usize;
        let specials_len = n_special_slots as usize * size;
        let first = (hash_offset as usize)
            .checked_sub(specials_len)
            .filter(|&start| start >= BASE_HEADER_SIZE)
            .ok_or_else(|| {
                malformed(format!(
                    "{} special slots do not fit before hash offset {:#x}",
                    n_special_slots, hash_offset
                ))
            })?;
        let end = (n_code_slots as usize)
            .checked_mul(size)
            .and_then(|n| n.checked_add(hash_offset as usize))
            .filter(|&end| end <= length)
            .ok_or_else(|| {
                malformed(format!(
                    "{} code slots at {:#x} run past length {:#x}",
                    n_code_slots, hash_offset, length
                ))
            })?;

        let slots = raw[first..end]
            .chunks_exact(size)
            .enumerate()
            .map(|(i, hash)| HashSlot {
                index: i as i64 - n_special_slots as i64,
                hash: hash.to_vec(),
            })
            .collect();

        let cdhash = digest(hash_type, raw).ok_or_else(|| {
            Error::UnsupportedFormatVariant(format!("CodeDirectory hash type {}", hash_type))
        })?;

        tracing::debug!(
            slot,
            version = format_args!("{:#x}", version),
            hash = hash_type_name(hash_type),
            %identifier,
            "decoded code directory"
        );

        Ok(Self {
            slot,
            version,
            flags,
            hash_type,
            hash_size,
            platform,
            page_size_log2,
            code_limit,
            n_special_slots,
            n_code_slots,
            hash_offset,
            identifier,
            team_id,
            scatter_offset,
            exec_segment,
            runtime,
            pre_encrypt_offset,
            linkage,
            slots,
            cdhash,
            raw: raw.to_vec(),
        })
    }

    /// Raw directory bytes, exactly `length` long.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Page size in bytes; `None` when the code is a single unpaged block.
    pub fn page_size(&self) -> Option<u64> {
        (self.page_size_log2 != 0).then(|| 1u64 << self.page_size_log2)
    }

    pub fn hash_type_name(&self) -> &'static str {
        hash_type_name(self.hash_type)
    }

    /// The 20-byte CDHash form used by the kernel and in requirements.
    pub fn cdhash_truncated(&self) -> &[u8] {
        &self.cdhash[..CS_CDHASH_LEN.min(self.cdhash.len())]
    }

    pub fn special_slots(&self) -> &[HashSlot] {
        &self.slots[..self.n_special_slots as usize]
    }

    pub fn code_slots(&self) -> &[HashSlot] {
        &self.slots[self.n_special_slots as usize..]
    }

    pub fn flag_names(&self) -> Vec<&'static str> {
        cs_flag_names(self.flags)
    }

    /// Recompute every code page hash over `code` (the image bytes from
    /// offset 0) and return the indices of slots that do not match.
    ///
    /// Pages beyond the end of `code` count as mismatches.
    pub fn verify_pages(&self, code: &[u8]) -> Vec<i64> {
        let limit = self.code_limit.min(usize::MAX as u64) as usize;
        let page = self.page_size().map_or(limit, |p| p as usize).max(1);
        self.code_slots()
            .iter()
            .filter(|slot| {
                let start = slot.index as usize * page;
                let end = (start + page).min(limit);
                match code.get(start..end).and_then(|bytes| digest(self.hash_type, bytes)) {
                    Some(hash) => hash != slot.hash,
                    None => true,
                }
            })
            .map(|slot| slot.index)
            .collect()
    }
}

/// NUL-terminated string at `offset` within the directory.
fn read_string(raw: &[u8], offset: u32) -> Option<String> {
    let rest = raw.get(offset as usize..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a version 0x20400 directory over `code` with 4 KiB pages.
    fn build(code: &[u8], hash_type: u8, team: Option<&str>) -> Vec<u8> {
        let size = hash_type_size(hash_type).unwrap();
        let n_code = code.len().div_ceil(4096);
        let n_special = 2usize;
        let ident = b"com.example.tool\0";
        let header = 88usize;
        let team_bytes = team.map(|t| format!("{}\0", t).into_bytes()).unwrap_or_default();
        let ident_offset = header;
        let team_offset = if team.is_some() { header + ident.len() } else { 0 };
        let hash_offset = header + ident.len() + team_bytes.len() + n_special * size;
        let total = hash_offset + n_code * size;

        let mut buf = Vec::new();
        for v in [
            CSMAGIC_CODEDIRECTORY,
            total as u32,
            CODEDIRECTORY_VERSION_EXECSEG,
            CS_ADHOC,
            hash_offset as u32,
            ident_offset as u32,
            n_special as u32,
            n_code as u32,
            code.len() as u32,
        ] {
            buf.extend(&v.to_be_bytes());
        }
        buf.extend(&[size as u8, hash_type, 0, 12]);
        buf.extend(&0u32.to_be_bytes()); // spare2
        buf.extend(&0u32.to_be_bytes()); // scatter
        buf.extend(&(team_offset as u32).to_be_bytes());
        buf.extend(&0u32.to_be_bytes()); // spare3
        buf.extend(&0u64.to_be_bytes()); // codeLimit64
        buf.extend(&0u64.to_be_bytes());
        buf.extend(&0x4000u64.to_be_bytes());
        buf.extend(&CS_EXECSEG_MAIN_BINARY.to_be_bytes());
        buf.extend(ident);
        buf.extend(&team_bytes);
        buf.extend(vec![0u8; size]);
        buf.extend(vec![0xaau8; size]);
        for page in code.chunks(4096) {
            buf.extend(digest(hash_type, page).unwrap());
        }
        assert_eq!(buf.len(), total);
        buf
    }

    #[test]
    fn test_parse_sha256_directory() {
        let code = vec![0x11u8; 4096 * 2 + 100];
        let blob = build(&code, CS_HASHTYPE_SHA256, Some("TEAMID1234"));
        let cd = CodeDirectory::parse(0x1000, &blob).unwrap();

        assert_eq!(cd.identifier, "com.example.tool");
        assert_eq!(cd.team_id.as_deref(), Some("TEAMID1234"));
        assert_eq!(cd.hash_type_name(), "sha256");
        assert_eq!(cd.page_size(), Some(4096));
        assert_eq!(cd.n_code_slots, 3);
        assert_eq!(cd.special_slots()[0].index, -2);
        assert!(cd.special_slots()[0].is_empty());
        assert_eq!(cd.code_slots()[0].index, 0);
        assert_eq!(cd.exec_segment.map(|e| e.limit), Some(0x4000));
        assert_eq!(cd.runtime, None);
        assert_eq!(cd.cdhash, Sha256::digest(&blob).to_vec());
        assert_eq!(cd.cdhash_truncated().len(), 20);
        assert!(cd.verify_pages(&code).is_empty());
    }

    #[test]
    fn test_verify_pages_reports_mismatch() {
        let mut code = vec![0u8; 4096 * 2];
        let blob = build(&code, CS_HASHTYPE_SHA1, None);
        let cd = CodeDirectory::parse(0, &blob).unwrap();
        code[4096 + 5] = 1;
        assert_eq!(cd.verify_pages(&code), vec![1]);
        assert_eq!(cd.verify_pages(&code[..100]), vec![0, 1]);
    }

    #[test]
    fn test_code_slot_invariant() {
        let code = vec![0u8; 4096 * 3];
        let mut blob = build(&code, CS_HASHTYPE_SHA1, None);
        // claim a larger code limit than the slots cover
        blob[32..36].copy_from_slice(&(4096u32 * 4).to_be_bytes());
        assert!(matches!(CodeDirectory::parse(0, &blob), Err(Error::MalformedSignature(_))));
    }

    #[test]
    fn test_hash_size_mismatch() {
        let blob = {
            let mut b = build(&[0u8; 10], CS_HASHTYPE_SHA256, None);
            b[36] = 20;
            b
        };
        assert!(matches!(CodeDirectory::parse(0, &blob), Err(Error::MalformedSignature(_))));
    }

    #[test]
    fn test_unknown_hash_type_and_old_version() {
        let mut blob = build(&[0u8; 10], CS_HASHTYPE_SHA1, None);
        blob[37] = 9;
        assert!(matches!(CodeDirectory::parse(0, &blob), Err(Error::UnsupportedFormatVariant(_))));

        let mut blob = build(&[0u8; 10], CS_HASHTYPE_SHA1, None);
        blob[8..12].copy_from_slice(&0x20000u32.to_be_bytes());
        assert!(matches!(CodeDirectory::parse(0, &blob), Err(Error::UnsupportedFormatVariant(_))));
    }

    #[test]
    fn test_slots_past_length() {
        let mut blob = build(&[0u8; 10], CS_HASHTYPE_SHA1, None);
        let len = blob.len() as u32;
        blob[16..20].copy_from_slice(&(len - 4).to_be_bytes());
        assert!(matches!(CodeDirectory::parse(0, &blob), Err(Error::MalformedSignature(_))));
    }
}
