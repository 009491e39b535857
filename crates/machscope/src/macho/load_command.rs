//! Typed load command records.
//!
//! Every command in the load-command stream becomes a [`LoadCommandRecord`]
//! carrying its raw `(cmd, offset, size)` plus a [`LoadCommand`] variant.
//! Commands this crate does not model are kept as [`LoadCommand::Unknown`]
//! so they can still be located.

use super::constants::{build_tool_name, platform_name};
use crate::{Error, Result};
use goblin::mach::load_command::{
    cmd_to_str as load_command_to_str, BuildVersionCommand, DyldInfoCommand, DylibCommand, DylinkerCommand,
    DysymtabCommand, EncryptionInfoCommand32, EncryptionInfoCommand64, EntryPointCommand,
    LinkeditDataCommand, RpathCommand, SegmentCommand32, SegmentCommand64, SourceVersionCommand,
    SymtabCommand, UuidCommand, VersionMinCommand, LC_BUILD_VERSION, LC_CODE_SIGNATURE,
    LC_DATA_IN_CODE, LC_DYLD_CHAINED_FIXUPS, LC_DYLD_ENVIRONMENT, LC_DYLD_EXPORTS_TRIE,
    LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_DYSYMTAB, LC_ENCRYPTION_INFO, LC_ENCRYPTION_INFO_64,
    LC_FUNCTION_STARTS, LC_ID_DYLIB, LC_ID_DYLINKER, LC_LAZY_LOAD_DYLIB, LC_LOAD_DYLIB,
    LC_LOAD_DYLINKER, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_MAIN, LC_REEXPORT_DYLIB,
    LC_RPATH, LC_SEGMENT, LC_SEGMENT_64, LC_SEGMENT_SPLIT_INFO, LC_SOURCE_VERSION, LC_SYMTAB,
    LC_UUID, LC_VERSION_MIN_IPHONEOS, LC_VERSION_MIN_MACOSX, LC_VERSION_MIN_TVOS,
    LC_VERSION_MIN_WATCHOS, SIZEOF_SEGMENT_COMMAND_32, SIZEOF_SEGMENT_COMMAND_64,
};
use scroll::{ctx::TryFromCtx, Endian, Pread};
use std::fmt;

/// Size of a 32-bit `section` record.
const SIZEOF_SECTION_32: usize = 68;

/// Size of a 64-bit `section_64` record.
const SIZEOF_SECTION_64: usize = 80;

/// A load command with its location in the command stream.
#[derive(Debug, Clone)]
pub struct LoadCommandRecord {
    /// Raw command identifier
    pub cmd: u32,
    /// File offset of the command within the image
    pub offset: usize,
    /// Declared command size
    pub size: u32,
    /// Decoded command
    pub command: LoadCommand,
}

impl LoadCommandRecord {
    /// Symbolic name of the command, e.g. `LC_SEGMENT_64`.
    pub fn name(&self) -> &'static str {
        load_command_to_str(self.cmd)
    }
}

/// Closed set of load command kinds.
#[derive(Debug, Clone)]
pub enum LoadCommand {
    /// `LC_SEGMENT`/`LC_SEGMENT_64`; index into [`super::MachOImage::segments`]
    Segment(usize),
    Symtab(Symtab),
    Dysymtab(Dysymtab),
    CodeSignature(LinkeditData),
    FunctionStarts(LinkeditData),
    DataInCode(LinkeditData),
    ChainedFixups(LinkeditData),
    ExportsTrie(LinkeditData),
    SegmentSplitInfo(LinkeditData),
    DyldInfo(DyldInfo),
    BuildVersion(BuildVersion),
    VersionMin(VersionMin),
    Uuid([u8; 16]),
    /// Any dependent library command (`LC_LOAD_DYLIB`, weak, reexport, ...)
    Dylib(Dylib),
    IdDylib(Dylib),
    Dylinker(String),
    Rpath(String),
    Main {
        entry_offset: u64,
        stack_size: u64,
    },
    SourceVersion(SourceVersion),
    EncryptionInfo {
        offset: u32,
        size: u32,
        id: u32,
    },
    /// A command this crate does not decode
    Unknown { cmd: u32 },
}

/// Location of a blob in `__LINKEDIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkeditData {
    /// File offset, relative to the image start
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Symtab {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Dysymtab {
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DyldInfo {
    pub rebase: LinkeditData,
    pub bind: LinkeditData,
    pub weak_bind: LinkeditData,
    pub lazy_bind: LinkeditData,
    pub export: LinkeditData,
}

/// `LC_BUILD_VERSION` contents.
#[derive(Debug, Clone)]
pub struct BuildVersion {
    pub platform: u32,
    pub minos: Version,
    pub sdk: Version,
    /// `(tool, version)` pairs
    pub tools: Vec<(u32, Version)>,
}

impl BuildVersion {
    pub fn platform_name(&self) -> &'static str {
        platform_name(self.platform)
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Platform: {}, MinOS: {}, SDK: {}", self.platform_name(), self.minos, self.sdk)?;
        for (tool, version) in &self.tools {
            write!(f, ", {}: {}", build_tool_name(*tool), version)?;
        }
        Ok(())
    }
}

/// `LC_VERSION_MIN_*` contents.
#[derive(Debug, Clone, Copy)]
pub struct VersionMin {
    pub cmd: u32,
    pub version: Version,
    pub sdk: Version,
}

/// A dependent (or identifying) dylib.
#[derive(Debug, Clone)]
pub struct Dylib {
    pub kind: DylibKind,
    pub name: String,
    pub timestamp: u32,
    pub current_version: Version,
    pub compatibility_version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DylibKind {
    Load,
    Weak,
    Reexport,
    Upward,
    Lazy,
    Id,
}

/// Packed `xxxx.yy.zz` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = self.0 >> 16;
        let minor = (self.0 >> 8) & 0xff;
        let patch = self.0 & 0xff;
        if patch == 0 {
            write!(f, "{}.{}", major, minor)
        } else {
            write!(f, "{}.{}.{}", major, minor, patch)
        }
    }
}

/// Packed `a.b.c.d.e` source version (24.10.10.10.10 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceVersion(pub u64);

impl fmt::Display for SourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        let parts = [
            v >> 40,
            (v >> 30) & 0x3ff,
            (v >> 20) & 0x3ff,
            (v >> 10) & 0x3ff,
            v & 0x3ff,
        ];
        // trailing zero components are omitted, like ld64 does
        let keep = parts.iter().rposition(|&p| p != 0).map_or(1, |i| i + 1).max(2);
        let text: Vec<String> = parts[..keep].iter().map(|p| p.to_string()).collect();
        write!(f, "{}", text.join("."))
    }
}

/// A segment and its sections.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub flags: u32,
    pub sections: Vec<Section>,
}

impl Segment {
    /// Whether `addr` lies inside the segment's VM range.
    pub fn contains_vmaddr(&self, addr: u64) -> bool {
        addr >= self.vmaddr && addr - self.vmaddr < self.vmsize
    }
}

/// A section; always owned by exactly one [`Segment`].
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub segment_name: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl Section {
    /// Whether `addr` lies inside the section's VM range.
    pub fn contains_vmaddr(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.size
    }

    /// Section type (low byte of flags).
    pub fn section_type(&self) -> u32 {
        self.flags & 0xff
    }

    /// Zero-fill sections have no file bytes.
    pub fn is_zerofill(&self) -> bool {
        matches!(self.section_type(), 0x1 | 0xc | 0x12)
    }
}

/// Read a fixed-size command struct, mapping short reads to [`Error::TruncatedHeader`].
fn read_command<'a, T>(data: &'a [u8], offset: usize, endian: Endian) -> Result<T>
where
    T: TryFromCtx<'a, Endian, Error = scroll::Error>,
{
    data.pread_with::<T>(offset, endian).map_err(|e| {
        Error::TruncatedHeader(format!("load command at {:#x}: {}", offset, e))
    })
}

/// Read a NUL-terminated name inside `[cmd_start + name_off, cmd_end)`.
fn read_lc_str(data: &[u8], cmd_start: usize, cmd_size: usize, name_off: u32) -> String {
    let start = cmd_start.saturating_add(name_off as usize);
    let end = cmd_start.saturating_add(cmd_size).min(data.len());
    if start >= end {
        return String::new();
    }
    fixed_str(&data[start..end])
}

/// String of a fixed or bounded byte field up to the first NUL.
pub(crate) fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn linkedit(cmd: LinkeditDataCommand) -> LinkeditData {
    LinkeditData {
        offset: cmd.dataoff,
        size: cmd.datasize,
    }
}

/// Decode one command. `data` is the whole image; `segments` receives
/// parsed segments.
pub(crate) fn parse_command(
    data: &[u8],
    offset: usize,
    cmd: u32,
    cmdsize: u32,
    endian: Endian,
    segments: &mut Vec<Segment>,
) -> Result<LoadCommand> {
    let size = cmdsize as usize;
    let image_len = data.len();
    // reads never leave the command itself
    let data = &data[..(offset + size).min(image_len)];
    let command = match cmd {
        LC_SEGMENT_64 => {
            let seg: SegmentCommand64 = read_command(data, offset, endian)?;
            let segment = parse_segment(
                data,
                image_len,
                offset,
                size,
                endian,
                SegmentFields {
                    name: fixed_str(&seg.segname),
                    vmaddr: seg.vmaddr,
                    vmsize: seg.vmsize,
                    fileoff: seg.fileoff,
                    filesize: seg.filesize,
                    maxprot: seg.maxprot,
                    initprot: seg.initprot,
                    nsects: seg.nsects,
                    flags: seg.flags,
                },
                true,
            )?;
            segments.push(segment);
            LoadCommand::Segment(segments.len() - 1)
        }
        LC_SEGMENT => {
            let seg: SegmentCommand32 = read_command(data, offset, endian)?;
            let segment = parse_segment(
                data,
                image_len,
                offset,
                size,
                endian,
                SegmentFields {
                    name: fixed_str(&seg.segname),
                    vmaddr: seg.vmaddr as u64,
                    vmsize: seg.vmsize as u64,
                    fileoff: seg.fileoff as u64,
                    filesize: seg.filesize as u64,
                    maxprot: seg.maxprot,
                    initprot: seg.initprot,
                    nsects: seg.nsects,
                    flags: seg.flags,
                },
                false,
            )?;
            segments.push(segment);
            LoadCommand::Segment(segments.len() - 1)
        }
        LC_SYMTAB => {
            let st: SymtabCommand = read_command(data, offset, endian)?;
            LoadCommand::Symtab(Symtab {
                symoff: st.symoff,
                nsyms: st.nsyms,
                stroff: st.stroff,
                strsize: st.strsize,
            })
        }
        LC_DYSYMTAB => {
            let ds: DysymtabCommand = read_command(data, offset, endian)?;
            LoadCommand::Dysymtab(Dysymtab {
                ilocalsym: ds.ilocalsym,
                nlocalsym: ds.nlocalsym,
                iextdefsym: ds.iextdefsym,
                nextdefsym: ds.nextdefsym,
                iundefsym: ds.iundefsym,
                nundefsym: ds.nundefsym,
                indirectsymoff: ds.indirectsymoff,
                nindirectsyms: ds.nindirectsyms,
            })
        }
        LC_CODE_SIGNATURE => LoadCommand::CodeSignature(linkedit(read_command(data, offset, endian)?)),
        LC_FUNCTION_STARTS => LoadCommand::FunctionStarts(linkedit(read_command(data, offset, endian)?)),
        LC_DATA_IN_CODE => LoadCommand::DataInCode(linkedit(read_command(data, offset, endian)?)),
        LC_DYLD_CHAINED_FIXUPS => LoadCommand::ChainedFixups(linkedit(read_command(data, offset, endian)?)),
        LC_DYLD_EXPORTS_TRIE => LoadCommand::ExportsTrie(linkedit(read_command(data, offset, endian)?)),
        LC_SEGMENT_SPLIT_INFO => {
            LoadCommand::SegmentSplitInfo(linkedit(read_command(data, offset, endian)?))
        }
        LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
            let di: DyldInfoCommand = read_command(data, offset, endian)?;
            let pair = |off, size| LinkeditData { offset: off, size };
            LoadCommand::DyldInfo(DyldInfo {
                rebase: pair(di.rebase_off, di.rebase_size),
                bind: pair(di.bind_off, di.bind_size),
                weak_bind: pair(di.weak_bind_off, di.weak_bind_size),
                lazy_bind: pair(di.lazy_bind_off, di.lazy_bind_size),
                export: pair(di.export_off, di.export_size),
            })
        }
        LC_BUILD_VERSION => {
            let bv: BuildVersionCommand = read_command(data, offset, endian)?;
            let mut tools = Vec::new();
            // each build_tool_version is 8 bytes after the 24-byte command
            for i in 0..bv.ntools as usize {
                let at = offset + 24 + i * 8;
                if at + 8 > offset + size {
                    break;
                }
                let tool: u32 = read_command(data, at, endian)?;
                let version: u32 = read_command(data, at + 4, endian)?;
                tools.push((tool, Version(version)));
            }
            LoadCommand::BuildVersion(BuildVersion {
                platform: bv.platform,
                minos: Version(bv.minos),
                sdk: Version(bv.sdk),
                tools,
            })
        }
        LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS | LC_VERSION_MIN_TVOS
        | LC_VERSION_MIN_WATCHOS => {
            let vm: VersionMinCommand = read_command(data, offset, endian)?;
            LoadCommand::VersionMin(VersionMin {
                cmd,
                version: Version(vm.version),
                sdk: Version(vm.sdk),
            })
        }
        LC_UUID => {
            let uc: UuidCommand = read_command(data, offset, endian)?;
            LoadCommand::Uuid(uc.uuid)
        }
        LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB
        | LC_LAZY_LOAD_DYLIB | LC_ID_DYLIB => {
            let dc: DylibCommand = read_command(data, offset, endian)?;
            let kind = match cmd {
                LC_LOAD_WEAK_DYLIB => DylibKind::Weak,
                LC_REEXPORT_DYLIB => DylibKind::Reexport,
                LC_LOAD_UPWARD_DYLIB => DylibKind::Upward,
                LC_LAZY_LOAD_DYLIB => DylibKind::Lazy,
                LC_ID_DYLIB => DylibKind::Id,
                _ => DylibKind::Load,
            };
            let dylib = Dylib {
                kind,
                name: read_lc_str(data, offset, size, dc.dylib.name),
                timestamp: dc.dylib.timestamp,
                current_version: Version(dc.dylib.current_version),
                compatibility_version: Version(dc.dylib.compatibility_version),
            };
            if kind == DylibKind::Id {
                LoadCommand::IdDylib(dylib)
            } else {
                LoadCommand::Dylib(dylib)
            }
        }
        LC_LOAD_DYLINKER | LC_ID_DYLINKER | LC_DYLD_ENVIRONMENT => {
            let dl: DylinkerCommand = read_command(data, offset, endian)?;
            LoadCommand::Dylinker(read_lc_str(data, offset, size, dl.name))
        }
        LC_RPATH => {
            let rp: RpathCommand = read_command(data, offset, endian)?;
            LoadCommand::Rpath(read_lc_str(data, offset, size, rp.path))
        }
        LC_MAIN => {
            let ep: EntryPointCommand = read_command(data, offset, endian)?;
            LoadCommand::Main {
                entry_offset: ep.entryoff,
                stack_size: ep.stacksize,
            }
        }
        LC_SOURCE_VERSION => {
            let sv: SourceVersionCommand = read_command(data, offset, endian)?;
            LoadCommand::SourceVersion(SourceVersion(sv.version))
        }
        LC_ENCRYPTION_INFO => {
            let ei: EncryptionInfoCommand32 = read_command(data, offset, endian)?;
            LoadCommand::EncryptionInfo {
                offset: ei.cryptoff,
                size: ei.cryptsize,
                id: ei.cryptid,
            }
        }
        LC_ENCRYPTION_INFO_64 => {
            let ei: EncryptionInfoCommand64 = read_command(data, offset, endian)?;
            LoadCommand::EncryptionInfo {
                offset: ei.cryptoff,
                size: ei.cryptsize,
                id: ei.cryptid,
            }
        }
        _ => LoadCommand::Unknown { cmd },
    };
    Ok(command)
}

struct SegmentFields {
    name: String,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    maxprot: u32,
    initprot: u32,
    nsects: u32,
    flags: u32,
}

fn parse_segment(
    data: &[u8],
    image_len: usize,
    offset: usize,
    size: usize,
    endian: Endian,
    f: SegmentFields,
    is_64: bool,
) -> Result<Segment> {
    let end = f.fileoff.checked_add(f.filesize).ok_or_else(|| {
        Error::MalformedSegment(format!("{}: file range overflows", f.name))
    })?;
    if end > image_len as u64 {
        return Err(Error::MalformedSegment(format!(
            "{}: file range {:#x}..{:#x} exceeds image size {:#x}",
            f.name, f.fileoff, end, image_len
        )));
    }

    let (header_size, section_size) = if is_64 {
        (SIZEOF_SEGMENT_COMMAND_64, SIZEOF_SECTION_64)
    } else {
        (SIZEOF_SEGMENT_COMMAND_32, SIZEOF_SECTION_32)
    };
    let table_size = (f.nsects as usize)
        .checked_mul(section_size)
        .and_then(|n| n.checked_add(header_size))
        .ok_or_else(|| Error::TruncatedHeader(format!("{}: section count overflows", f.name)))?;
    if table_size > size {
        return Err(Error::TruncatedHeader(format!(
            "{}: {} sections do not fit in a {} byte command",
            f.name, f.nsects, size
        )));
    }

    let mut sections = Vec::with_capacity(f.nsects as usize);
    for i in 0..f.nsects as usize {
        let at = offset + header_size + i * section_size;
        sections.push(parse_section(data, at, endian, is_64, &f.name)?);
    }

    Ok(Segment {
        name: f.name,
        vmaddr: f.vmaddr,
        vmsize: f.vmsize,
        fileoff: f.fileoff,
        filesize: f.filesize,
        maxprot: f.maxprot,
        initprot: f.initprot,
        flags: f.flags,
        sections,
    })
}

fn parse_section(data: &[u8], at: usize, endian: Endian, is_64: bool, segment: &str) -> Result<Section> {
    let names = data.get(at..at + 32).ok_or_else(|| {
        Error::TruncatedHeader(format!("{}: section record at {:#x} is cut short", segment, at))
    })?;
    let (sectname, segname) = names.split_at(16);
    let (addr, size, rest) = if is_64 {
        let addr: u64 = read_command(data, at + 32, endian)?;
        let size: u64 = read_command(data, at + 40, endian)?;
        (addr, size, at + 48)
    } else {
        let addr: u32 = read_command(data, at + 32, endian)?;
        let size: u32 = read_command(data, at + 36, endian)?;
        (addr as u64, size as u64, at + 40)
    };
    let field = |i: usize| read_command::<u32>(data, rest + i * 4, endian);

    let mut segment_name = fixed_str(segname);
    if segment_name.is_empty() {
        segment_name = segment.to_string();
    }
    Ok(Section {
        name: fixed_str(sectname),
        segment_name,
        addr,
        size,
        offset: field(0)?,
        align: field(1)?,
        // reloff and nreloc at 2 and 3
        flags: field(4)?,
        reserved1: field(5)?,
        reserved2: field(6)?,
    })
}
