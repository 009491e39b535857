//! Synthetic Mach-O images for the integration tests.
//!
//! Every image uses the same fixed layout so tests can address content by
//! virtual address:
//!
//! | segment      | vmaddr            | file range        |
//! |--------------|-------------------|-------------------|
//! | `__TEXT`     | `BASE`            | `0x0000..0x4000`  |
//! | `__DATA`     | `BASE + 0x4000`   | `0x4000..0x8000`  |
//! | `__LINKEDIT` | `BASE + 0x8000`   | `0x8000..`        |
//!
//! Load commands live below `0x1000`, so section content must start there
//! or later.

#![allow(dead_code)]

use goblin::mach::cputype::{CPU_TYPE_ARM64, CPU_TYPE_X86_64};
use goblin::mach::header::MH_MAGIC_64;
use goblin::mach::load_command::{
    LC_CODE_SIGNATURE, LC_DYLD_CHAINED_FIXUPS, LC_FUNCTION_STARTS, LC_SEGMENT_64, LC_SYMTAB,
};
use machscope::codesign::constants::*;
use machscope::macho::constants::{CPU_SUBTYPE_ARM64E, CPU_SUBTYPE_X86_ALL};
use sha2::{Digest, Sha256};

pub const BASE: u64 = 0x1_0000_0000;
pub const TEXT_SIZE: u64 = 0x4000;
pub const DATA_OFF: u64 = 0x4000;
pub const DATA_SIZE: u64 = 0x4000;
pub const LINKEDIT_OFF: u64 = 0x8000;
pub const PAGE: usize = 4096;

const MH_EXECUTE: u32 = 2;
const MH_PIE: u32 = 0x0020_0000;

/// Content of one section.
struct SectionSpec {
    segment: &'static str,
    name: String,
    addr: u64,
    bytes: Vec<u8>,
}

/// Signature options for [`ImageBuilder::sign`].
#[derive(Debug, Clone, Default)]
pub struct SigningSpec {
    pub identifier: String,
    pub team_id: Option<String>,
    /// Requirement expression for the designated requirement.
    pub designated: Option<Vec<u8>>,
    pub entitlements: Option<String>,
}

/// Builds a 64-bit little-endian image.
pub struct ImageBuilder {
    cpu_type: u32,
    cpu_subtype: u32,
    sections: Vec<SectionSpec>,
    linkedit: Vec<(u32, Vec<u8>)>,
    symbols: Vec<(String, u8, u8, u64)>,
    signing: Option<SigningSpec>,
}

impl ImageBuilder {
    pub fn arm64() -> Self {
        Self::new(CPU_TYPE_ARM64, 0)
    }

    pub fn arm64e() -> Self {
        Self::new(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E)
    }

    pub fn x86_64() -> Self {
        Self::new(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_ALL)
    }

    pub fn new(cpu_type: u32, cpu_subtype: u32) -> Self {
        ImageBuilder {
            cpu_type,
            cpu_subtype,
            sections: Vec::new(),
            linkedit: Vec::new(),
            symbols: Vec::new(),
            signing: None,
        }
    }

    /// Add a `__TEXT` section at `addr`.
    pub fn text_section(mut self, name: &str, addr: u64, bytes: &[u8]) -> Self {
        assert!(addr >= BASE + 0x1000 && addr + bytes.len() as u64 <= BASE + TEXT_SIZE);
        self.sections.push(SectionSpec {
            segment: "__TEXT",
            name: name.to_string(),
            addr,
            bytes: bytes.to_vec(),
        });
        self
    }

    /// Add a `__DATA` section at `addr`.
    pub fn data_section(mut self, name: &str, addr: u64, bytes: &[u8]) -> Self {
        assert!(addr >= BASE + DATA_OFF && addr + bytes.len() as u64 <= BASE + DATA_OFF + DATA_SIZE);
        self.sections.push(SectionSpec {
            segment: "__DATA",
            name: name.to_string(),
            addr,
            bytes: bytes.to_vec(),
        });
        self
    }

    pub fn function_starts(mut self, table: &[u8]) -> Self {
        self.linkedit.push((LC_FUNCTION_STARTS, table.to_vec()));
        self
    }

    pub fn chained_fixups(mut self, blob: &[u8]) -> Self {
        self.linkedit.push((LC_DYLD_CHAINED_FIXUPS, blob.to_vec()));
        self
    }

    /// Add an `nlist_64` entry; `sect` is 1-based, 0 for undefined.
    pub fn symbol(mut self, name: &str, n_type: u8, sect: u8, value: u64) -> Self {
        self.symbols.push((name.to_string(), n_type, sect, value));
        self
    }

    pub fn sign(mut self, spec: SigningSpec) -> Self {
        self.signing = Some(spec);
        self
    }

    pub fn build(self) -> Vec<u8> {
        // __LINKEDIT content: data blobs, then the symbol table, then the signature.
        let mut linkedit = Vec::new();
        let mut locations = Vec::new();
        for (cmd, blob) in &self.linkedit {
            align(&mut linkedit, 8);
            locations.push((*cmd, LINKEDIT_OFF as u32 + linkedit.len() as u32, blob.len() as u32));
            linkedit.extend(blob);
        }

        let symtab = if self.symbols.is_empty() {
            None
        } else {
            align(&mut linkedit, 8);
            let symoff = LINKEDIT_OFF as u32 + linkedit.len() as u32;
            let mut strings = vec![0u8];
            for (name, n_type, sect, value) in &self.symbols {
                linkedit.extend(&(strings.len() as u32).to_le_bytes());
                linkedit.push(*n_type);
                linkedit.push(*sect);
                linkedit.extend(&0u16.to_le_bytes());
                linkedit.extend(&value.to_le_bytes());
                strings.extend(name.as_bytes());
                strings.push(0);
            }
            let stroff = LINKEDIT_OFF as u32 + linkedit.len() as u32;
            let strsize = strings.len() as u32;
            linkedit.extend(strings);
            Some([symoff, self.symbols.len() as u32, stroff, strsize])
        };

        let signature = self.signing.as_ref().map(|spec| {
            align(&mut linkedit, 16);
            let offset = LINKEDIT_OFF as usize + linkedit.len();
            // Hashes are filled in once the rest of the image is final.
            let blob = signature_blob(spec, &vec![0u8; offset]);
            linkedit.extend(vec![0u8; blob.len()]);
            (offset, blob.len())
        });

        let mut cmds = Vec::new();
        let mut ncmds = 0u32;
        for (name, vmaddr, fileoff, filesize) in [
            ("__TEXT", BASE, 0, TEXT_SIZE),
            ("__DATA", BASE + DATA_OFF, DATA_OFF, DATA_SIZE),
            ("__LINKEDIT", BASE + LINKEDIT_OFF, LINKEDIT_OFF, linkedit.len() as u64),
        ] {
            let sections: Vec<&SectionSpec> = self.sections.iter().filter(|s| s.segment == name).collect();
            cmds.extend(segment_command(name, vmaddr, fileoff, filesize, &sections));
            ncmds += 1;
        }
        for (cmd, offset, size) in &locations {
            cmds.extend(linkedit_command(*cmd, *offset, *size));
            ncmds += 1;
        }
        if let Some(fields) = symtab {
            cmds.extend(&LC_SYMTAB.to_le_bytes());
            cmds.extend(&24u32.to_le_bytes());
            for v in fields {
                cmds.extend(&v.to_le_bytes());
            }
            ncmds += 1;
        }
        if let Some((offset, size)) = signature {
            cmds.extend(linkedit_command(LC_CODE_SIGNATURE, offset as u32, size as u32));
            ncmds += 1;
        }
        assert!(32 + cmds.len() <= 0x1000, "load commands overlap section content");

        let mut out = Vec::new();
        for v in [
            MH_MAGIC_64,
            self.cpu_type,
            self.cpu_subtype,
            MH_EXECUTE,
            ncmds,
            cmds.len() as u32,
            MH_PIE,
            0,
        ] {
            out.extend(&v.to_le_bytes());
        }
        out.extend(&cmds);
        out.resize(LINKEDIT_OFF as usize, 0);
        for s in &self.sections {
            let at = (s.addr - BASE) as usize;
            out[at..at + s.bytes.len()].copy_from_slice(&s.bytes);
        }
        out.extend(&linkedit);

        if let (Some(spec), Some((offset, size))) = (&self.signing, signature) {
            let blob = signature_blob(spec, &out[..offset]);
            assert_eq!(blob.len(), size);
            out[offset..offset + size].copy_from_slice(&blob);
        }
        out
    }
}

fn align(buf: &mut Vec<u8>, to: usize) {
    while buf.len() % to != 0 {
        buf.push(0);
    }
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn segment_command(name: &str, vmaddr: u64, fileoff: u64, filesize: u64, sections: &[&SectionSpec]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend(&LC_SEGMENT_64.to_le_bytes());
    buf.extend(&(72 + 80 * sections.len() as u32).to_le_bytes());
    buf.extend(&name16(name));
    let vmsize = filesize.div_ceil(0x4000).max(1) * 0x4000;
    for v in [vmaddr, vmsize, fileoff, filesize] {
        buf.extend(&v.to_le_bytes());
    }
    let prot = if name == "__TEXT" { 5u32 } else { 3 };
    for v in [prot, prot, sections.len() as u32, 0] {
        buf.extend(&v.to_le_bytes());
    }
    for s in sections {
        buf.extend(&name16(&s.name));
        buf.extend(&name16(name));
        buf.extend(&s.addr.to_le_bytes());
        buf.extend(&(s.bytes.len() as u64).to_le_bytes());
        buf.extend(&((s.addr - BASE) as u32).to_le_bytes());
        buf.extend(&[0u8; 28]);
    }
    buf
}

fn linkedit_command(cmd: u32, offset: u32, size: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    for v in [cmd, 16, offset, size] {
        buf.extend(&v.to_le_bytes());
    }
    buf
}

/// Big-endian blob with the standard `magic, length` header.
fn wrap_blob(magic: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = magic.to_be_bytes().to_vec();
    out.extend(&(8 + payload.len() as u32).to_be_bytes());
    out.extend(payload);
    out
}

/// Length-prefixed, 4-byte padded requirement operand.
pub fn req_data(bytes: &[u8]) -> Vec<u8> {
    let mut out = (bytes.len() as u32).to_be_bytes().to_vec();
    out.extend(bytes);
    align(&mut out, 4);
    out
}

/// `identifier "<id>" and anchor apple generic`.
pub fn identifier_requirement(identifier: &str) -> Vec<u8> {
    let mut expr = Vec::new();
    expr.extend(&OP_AND.to_be_bytes());
    expr.extend(&OP_IDENT.to_be_bytes());
    expr.extend(req_data(identifier.as_bytes()));
    expr.extend(&OP_APPLE_GENERIC_ANCHOR.to_be_bytes());
    expr
}

fn requirements_blob(designated: Option<&[u8]>) -> Vec<u8> {
    let Some(expr) = designated else {
        return wrap_blob(CSMAGIC_REQUIREMENTS, &0u32.to_be_bytes());
    };
    let mut requirement = 1u32.to_be_bytes().to_vec();
    requirement.extend(expr);
    let requirement = wrap_blob(CSMAGIC_REQUIREMENT, &requirement);

    let mut payload = Vec::new();
    payload.extend(&1u32.to_be_bytes());
    payload.extend(&CSREQ_DESIGNATED.to_be_bytes());
    payload.extend(&20u32.to_be_bytes());
    payload.extend(requirement);
    wrap_blob(CSMAGIC_REQUIREMENTS, &payload)
}

/// Version 0x20400 SHA-256 CodeDirectory over `code` with 4 KiB pages.
fn code_directory(spec: &SigningSpec, code: &[u8], specials: &[Vec<u8>]) -> Vec<u8> {
    let hash_size = 32usize;
    let n_code = code.len().div_ceil(PAGE);
    let header = 88usize;
    let ident = format!("{}\0", spec.identifier).into_bytes();
    let team = spec.team_id.as_ref().map(|t| format!("{}\0", t).into_bytes()).unwrap_or_default();
    let team_offset = if spec.team_id.is_some() { header + ident.len() } else { 0 };
    let hash_offset = header + ident.len() + team.len() + specials.len() * hash_size;
    let total = hash_offset + n_code * hash_size;

    let mut buf = Vec::new();
    for v in [
        CSMAGIC_CODEDIRECTORY,
        total as u32,
        CODEDIRECTORY_VERSION_EXECSEG,
        CS_ADHOC,
        hash_offset as u32,
        header as u32,
        specials.len() as u32,
        n_code as u32,
        code.len() as u32,
    ] {
        buf.extend(&v.to_be_bytes());
    }
    buf.extend(&[hash_size as u8, CS_HASHTYPE_SHA256, 0, 12]);
    buf.extend(&0u32.to_be_bytes());
    buf.extend(&0u32.to_be_bytes());
    buf.extend(&(team_offset as u32).to_be_bytes());
    buf.extend(&0u32.to_be_bytes());
    buf.extend(&0u64.to_be_bytes());
    buf.extend(&0u64.to_be_bytes());
    buf.extend(&TEXT_SIZE.to_be_bytes());
    buf.extend(&CS_EXECSEG_MAIN_BINARY.to_be_bytes());
    buf.extend(ident);
    buf.extend(team);
    // special slots are stored highest index first
    for hash in specials.iter().rev() {
        buf.extend(hash);
    }
    for page in code.chunks(PAGE) {
        buf.extend(Sha256::digest(page));
    }
    assert_eq!(buf.len(), total);
    buf
}

/// Embedded signature superblob for `code`, the image bytes before it.
pub fn signature_blob(spec: &SigningSpec, code: &[u8]) -> Vec<u8> {
    let requirements = requirements_blob(spec.designated.as_deref());
    let entitlements = spec
        .entitlements
        .as_ref()
        .map(|xml| wrap_blob(CSMAGIC_EMBEDDED_ENTITLEMENTS, xml.as_bytes()));

    // specials[i] is slot -(i + 1)
    let mut specials = vec![vec![0u8; 32], Sha256::digest(&requirements).to_vec()];
    if let Some(ent) = &entitlements {
        specials.push(vec![0u8; 32]);
        specials.push(vec![0u8; 32]);
        specials.push(Sha256::digest(ent).to_vec());
    }
    let cd = code_directory(spec, code, &specials);
    let cms = wrap_blob(CSMAGIC_BLOBWRAPPER, &[]);

    let mut blobs = vec![
        (CSSLOT_CODEDIRECTORY, cd),
        (CSSLOT_REQUIREMENTS, requirements),
    ];
    if let Some(ent) = entitlements {
        blobs.push((CSSLOT_ENTITLEMENTS, ent));
    }
    blobs.push((CSSLOT_SIGNATURESLOT, cms));

    let index_end = 12 + 8 * blobs.len();
    let total = index_end + blobs.iter().map(|(_, b)| b.len()).sum::<usize>();
    let mut out = Vec::new();
    out.extend(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    out.extend(&(total as u32).to_be_bytes());
    out.extend(&(blobs.len() as u32).to_be_bytes());
    let mut offset = index_end;
    for (slot, blob) in &blobs {
        out.extend(&slot.to_be_bytes());
        out.extend(&(offset as u32).to_be_bytes());
        offset += blob.len();
    }
    for (_, blob) in blobs {
        out.extend(blob);
    }
    out
}

/// ULEB128 encoding of `value`.
pub fn uleb128(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Function starts table for ascending `addrs`, relative to `BASE`.
pub fn function_starts_table(addrs: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut last = BASE;
    for &addr in addrs {
        out.extend(uleb128(addr - last));
        last = addr;
    }
    out.push(0);
    align(&mut out, 8);
    out
}

/// Fat container over `(cpu_type, cpu_subtype, image)` slices, each
/// aligned to 2^14.
pub fn fat(slices: &[(u32, u32, &[u8])]) -> Vec<u8> {
    const ALIGN: u32 = 14;
    let mut out = Vec::new();
    out.extend(&0xcafe_babeu32.to_be_bytes());
    out.extend(&(slices.len() as u32).to_be_bytes());

    let mut offset = 1usize << ALIGN;
    let mut placed = Vec::new();
    for (cpu_type, cpu_subtype, image) in slices {
        for v in [*cpu_type, *cpu_subtype, offset as u32, image.len() as u32, ALIGN] {
            out.extend(&v.to_be_bytes());
        }
        placed.push((offset, *image));
        offset = (offset + image.len()).div_ceil(1 << ALIGN) * (1 << ALIGN);
    }
    for (at, image) in placed {
        out.resize(at, 0);
        out.extend(image);
    }
    out
}

pub fn le64(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn le32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Chained fixups blob with starts for `__DATA` only (segment 1 of 3),
/// 4 KiB pages, and format-1 imports of `(library ordinal, name)`.
pub fn chained_fixups_blob(format: u16, page_starts: &[u16], imports: &[(u8, &str)]) -> Vec<u8> {
    let starts_offset = 28u32;
    let seg_info_size = 4 + 3 * 4;
    let seg_size = 22 + 2 * page_starts.len() as u32;
    let imports_offset = starts_offset + seg_info_size + seg_size;
    let imports_offset = imports_offset.div_ceil(4) * 4;
    let symbols_offset = imports_offset + 4 * imports.len() as u32;

    let mut b = Vec::new();
    for v in [0, starts_offset, imports_offset, symbols_offset, imports.len() as u32, 1, 0] {
        b.extend(&v.to_le_bytes());
    }
    b.extend(&3u32.to_le_bytes());
    for v in [0u32, seg_info_size, 0] {
        b.extend(&v.to_le_bytes());
    }
    b.extend(&seg_size.to_le_bytes());
    b.extend(&(PAGE as u16).to_le_bytes());
    b.extend(&format.to_le_bytes());
    b.extend(&DATA_OFF.to_le_bytes());
    b.extend(&0u32.to_le_bytes());
    b.extend(&(page_starts.len() as u16).to_le_bytes());
    for s in page_starts {
        b.extend(&s.to_le_bytes());
    }
    b.resize(imports_offset as usize, 0);

    let mut pool = vec![0u8];
    for (lib, name) in imports {
        let raw = u32::from(*lib) | ((pool.len() as u32) << 9);
        b.extend(&raw.to_le_bytes());
        pool.extend(name.as_bytes());
        pool.push(0);
    }
    b.extend(&pool);
    b
}

/// arm64e userland rebase to `BASE + target`, `next` 8-byte strides on.
pub fn userland_rebase(target: u64, next: u64) -> u64 {
    (next << 51) | target
}

/// arm64e userland bind to import `ordinal`.
pub fn userland_bind(ordinal: u64, next: u64) -> u64 {
    (1 << 62) | (next << 51) | ordinal
}
