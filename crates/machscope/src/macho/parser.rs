//! Mach-O header and load command parsing.
//!
//! [`MachOImage`] borrows the bytes of one thin image and decodes the
//! header plus every load command. Segment file ranges are validated
//! against the image, so later readers can slice segment bytes without
//! re-checking.
//!
//! ```text
//! ┌──────────────────────┐ 0
//! │ mach_header(_64)     │
//! ├──────────────────────┤ 28 / 32
//! │ load commands        │ ncmds × (cmd, cmdsize, ...)
//! ├──────────────────────┤ header + sizeofcmds
//! │ segment contents     │
//! │ ...                  │
//! │ __LINKEDIT           │ symtab, fixups, function starts, signature
//! └──────────────────────┘
//! ```

use super::constants::{
    header_flag_names, BIND_SPECIAL_DYLIB_FLAT_LOOKUP, BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE,
    BIND_SPECIAL_DYLIB_SELF, BIND_SPECIAL_DYLIB_WEAK_LOOKUP,
};
use super::fat::is_fat;
use super::load_command::{
    parse_command, BuildVersion, Dylib, Dysymtab, LinkeditData, LoadCommand, LoadCommandRecord,
    Section, Segment, SourceVersion, Symtab,
};
use crate::codesign::CodeSignature;
use crate::{function_starts, Error, Result};
use goblin::mach::header::{
    filetype_to_str, Header32, Header64, MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64,
    SIZEOF_HEADER_32, SIZEOF_HEADER_64,
};
use goblin::mach::symbols::{Nlist32, Nlist64, SIZEOF_NLIST_32, SIZEOF_NLIST_64};
use scroll::{Endian, Pread, BE, LE};

/// Decoded Mach-O header.
#[derive(Debug, Clone, Copy)]
pub struct MachHeader {
    pub magic: u32,
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub is_64: bool,
    pub little_endian: bool,
}

impl MachHeader {
    /// File type name, e.g. `EXECUTE`.
    pub fn filetype_name(&self) -> &'static str {
        filetype_to_str(self.filetype)
    }

    /// Names of the header flags that are set.
    pub fn flag_names(&self) -> Vec<&'static str> {
        header_flag_names(self.flags)
    }

    /// Size of the header itself.
    pub fn size(&self) -> usize {
        if self.is_64 {
            SIZEOF_HEADER_64
        } else {
            SIZEOF_HEADER_32
        }
    }
}

/// One nlist entry with its resolved name.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub value: u64,
    /// `segment.section` owning the symbol, for section-defined symbols
    pub section: Option<String>,
}

impl Symbol {
    /// Debugging (stab) entry.
    pub fn is_stab(&self) -> bool {
        self.n_type & 0xe0 != 0
    }

    /// Undefined, i.e. imported.
    pub fn is_undefined(&self) -> bool {
        self.n_type & 0x0e == 0 && !self.is_stab()
    }

    /// External linkage.
    pub fn is_external(&self) -> bool {
        self.n_type & 0x01 != 0
    }
}

/// A parsed thin Mach-O image.
#[derive(Debug, Clone)]
pub struct MachOImage<'a> {
    data: &'a [u8],
    endian: Endian,
    pub header: MachHeader,
    load_commands: Vec<LoadCommandRecord>,
    segments: Vec<Segment>,
}

impl<'a> MachOImage<'a> {
    /// Parse the header and load commands of a thin image.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedFormatVariant`] for a fat container or an unknown magic
    /// - [`Error::TruncatedHeader`] if the header or any command runs past the
    ///   command stream
    /// - [`Error::MalformedSegment`] if a segment's file range is invalid
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if is_fat(data) {
            return Err(Error::UnsupportedFormatVariant(
                "fat container; select a slice first".into(),
            ));
        }
        let magic: u32 = data
            .pread_with(0, LE)
            .map_err(|_| Error::TruncatedHeader("image too small for a magic".into()))?;
        let (endian, is_64) = match magic {
            MH_MAGIC => (LE, false),
            MH_CIGAM => (BE, false),
            MH_MAGIC_64 => (LE, true),
            MH_CIGAM_64 => (BE, true),
            other => {
                return Err(Error::UnsupportedFormatVariant(format!(
                    "unknown Mach-O magic {:#010x}",
                    other
                )))
            }
        };

        let header = read_header(data, endian, is_64)?;
        let cmds_start = header.size();
        let cmds_end = cmds_start + header.sizeofcmds as usize;
        if cmds_end > data.len() {
            return Err(Error::TruncatedHeader(format!(
                "load commands end at {:#x} beyond image size {:#x}",
                cmds_end,
                data.len()
            )));
        }

        let mut load_commands = Vec::with_capacity(header.ncmds as usize);
        let mut segments = Vec::new();
        let mut offset = cmds_start;
        for i in 0..header.ncmds {
            if offset + 8 > cmds_end {
                return Err(Error::TruncatedHeader(format!(
                    "load command {} at {:#x} starts past the command stream",
                    i, offset
                )));
            }
            let cmd: u32 = data
                .pread_with(offset, endian)
                .map_err(|e: scroll::Error| Error::TruncatedHeader(e.to_string()))?;
            let cmdsize: u32 = data
                .pread_with(offset + 4, endian)
                .map_err(|e: scroll::Error| Error::TruncatedHeader(e.to_string()))?;
            if cmdsize < 8 || offset + cmdsize as usize > cmds_end {
                return Err(Error::TruncatedHeader(format!(
                    "load command {} ({:#x}) at {:#x} declares size {:#x} past the command stream",
                    i, cmd, offset, cmdsize
                )));
            }

            let command = parse_command(data, offset, cmd, cmdsize, endian, &mut segments)?;
            load_commands.push(LoadCommandRecord {
                cmd,
                offset,
                size: cmdsize,
                command,
            });
            offset += cmdsize as usize;
        }

        tracing::debug!(
            ncmds = load_commands.len(),
            segments = segments.len(),
            filetype = header.filetype_name(),
            "parsed Mach-O header"
        );

        Ok(Self {
            data,
            endian,
            header,
            load_commands,
            segments,
        })
    }

    /// Raw bytes of the image.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn is_64(&self) -> bool {
        self.header.is_64
    }

    pub fn pointer_size(&self) -> usize {
        if self.header.is_64 {
            8
        } else {
            4
        }
    }

    /// Load commands in file order.
    pub fn load_commands(&self) -> &[LoadCommandRecord] {
        &self.load_commands
    }

    /// Segments in file order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn section(&self, segment: &str, section: &str) -> Option<&Section> {
        self.segment(segment)?.sections.iter().find(|s| s.name == section)
    }

    /// First section with the given name in any segment.
    pub fn section_by_name(&self, section: &str) -> Option<&Section> {
        self.sections().find(|s| s.name == section)
    }

    /// All sections in file order; index + 1 is the nlist `n_sect`.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.segments.iter().flat_map(|s| s.sections.iter())
    }

    pub fn segment_for_vmaddr(&self, addr: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains_vmaddr(addr))
    }

    pub fn section_for_vmaddr(&self, addr: u64) -> Option<&Section> {
        self.sections().find(|s| s.contains_vmaddr(addr))
    }

    /// File offset backing a virtual address, if the address has file bytes.
    pub fn vmaddr_to_offset(&self, addr: u64) -> Option<u64> {
        self.segments.iter().find_map(|s| {
            let delta = addr.checked_sub(s.vmaddr)?;
            (delta < s.filesize).then(|| s.fileoff + delta)
        })
    }

    /// Virtual address mapped from a file offset.
    pub fn offset_to_vmaddr(&self, offset: u64) -> Option<u64> {
        self.segments.iter().find_map(|s| {
            let delta = offset.checked_sub(s.fileoff)?;
            (delta < s.filesize && s.filesize > 0).then(|| s.vmaddr + delta)
        })
    }

    /// Preferred load address: `__TEXT`, else the segment mapping file
    /// offset 0, else 0.
    pub fn base_address(&self) -> u64 {
        if let Some(text) = self.segment("__TEXT") {
            return text.vmaddr;
        }
        self.segments
            .iter()
            .find(|s| s.fileoff == 0 && s.filesize > 0)
            .map_or(0, |s| s.vmaddr)
    }

    /// Bytes at `[offset, offset + len)`, or `None` outside the image.
    pub fn bytes(&self, offset: u64, len: usize) -> Option<&'a [u8]> {
        let start = usize::try_from(offset).ok()?;
        self.data.get(start..start.checked_add(len)?)
    }

    pub fn read_u32(&self, offset: u64) -> Option<u32> {
        self.data.pread_with(usize::try_from(offset).ok()?, self.endian).ok()
    }

    pub fn read_u64(&self, offset: u64) -> Option<u64> {
        self.data.pread_with(usize::try_from(offset).ok()?, self.endian).ok()
    }

    /// Pointer-sized value at a file offset, widened to u64.
    pub fn read_pointer(&self, offset: u64) -> Option<u64> {
        if self.header.is_64 {
            self.read_u64(offset)
        } else {
            self.read_u32(offset).map(u64::from)
        }
    }

    /// NUL-terminated string at a file offset, bounded by the image end.
    pub fn read_cstring(&self, offset: u64) -> Option<&'a str> {
        let start = usize::try_from(offset).ok()?;
        let rest = self.data.get(start..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&rest[..end]).ok()
    }

    /// Bytes of a `__LINKEDIT` blob, if it lies inside the image.
    pub fn linkedit_data(&self, location: LinkeditData) -> Option<&'a [u8]> {
        self.bytes(location.offset as u64, location.size as usize)
    }

    fn find_command<T>(&self, pick: impl Fn(&LoadCommand) -> Option<T>) -> Option<T> {
        self.load_commands.iter().find_map(|lc| pick(&lc.command))
    }

    pub fn symtab(&self) -> Option<Symtab> {
        self.find_command(|c| match c {
            LoadCommand::Symtab(st) => Some(*st),
            _ => None,
        })
    }

    pub fn dysymtab(&self) -> Option<Dysymtab> {
        self.find_command(|c| match c {
            LoadCommand::Dysymtab(ds) => Some(*ds),
            _ => None,
        })
    }

    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.find_command(|c| match c {
            LoadCommand::Uuid(uuid) => Some(*uuid),
            _ => None,
        })
    }

    pub fn build_version(&self) -> Option<&BuildVersion> {
        self.load_commands.iter().find_map(|lc| match &lc.command {
            LoadCommand::BuildVersion(bv) => Some(bv),
            _ => None,
        })
    }

    pub fn source_version(&self) -> Option<SourceVersion> {
        self.find_command(|c| match c {
            LoadCommand::SourceVersion(sv) => Some(*sv),
            _ => None,
        })
    }

    /// `LC_MAIN` entry point as a file offset.
    pub fn entry_offset(&self) -> Option<u64> {
        self.find_command(|c| match c {
            LoadCommand::Main { entry_offset, .. } => Some(*entry_offset),
            _ => None,
        })
    }

    pub fn code_signature_location(&self) -> Option<LinkeditData> {
        self.find_command(|c| match c {
            LoadCommand::CodeSignature(loc) => Some(*loc),
            _ => None,
        })
    }

    pub fn function_starts_location(&self) -> Option<LinkeditData> {
        self.find_command(|c| match c {
            LoadCommand::FunctionStarts(loc) => Some(*loc),
            _ => None,
        })
    }

    pub fn chained_fixups_location(&self) -> Option<LinkeditData> {
        self.find_command(|c| match c {
            LoadCommand::ChainedFixups(loc) => Some(*loc),
            _ => None,
        })
    }

    pub fn exports_trie_location(&self) -> Option<LinkeditData> {
        self.find_command(|c| match c {
            LoadCommand::ExportsTrie(loc) => Some(*loc),
            _ => None,
        })
    }

    pub fn data_in_code_location(&self) -> Option<LinkeditData> {
        self.find_command(|c| match c {
            LoadCommand::DataInCode(loc) => Some(*loc),
            _ => None,
        })
    }

    /// Dependent libraries in ordinal order (ordinal 1 is the first).
    pub fn libraries(&self) -> Vec<&Dylib> {
        self.load_commands
            .iter()
            .filter_map(|lc| match &lc.command {
                LoadCommand::Dylib(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    /// Name of the library a bind ordinal refers to.
    pub fn library_ordinal_name(&self, ordinal: i32) -> Option<String> {
        let name = match ordinal {
            BIND_SPECIAL_DYLIB_SELF => "this-image",
            BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => "main-executable",
            BIND_SPECIAL_DYLIB_FLAT_LOOKUP => "flat-namespace",
            BIND_SPECIAL_DYLIB_WEAK_LOOKUP => "weak",
            n if n > 0 => return self.libraries().get(n as usize - 1).map(|d| d.name.clone()),
            _ => return None,
        };
        Some(name.to_string())
    }

    /// Decode the nlist symbol table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSymbolTable`] if the symbol or string
    /// table lies outside the image.
    pub fn symbols(&self) -> Result<Vec<Symbol>> {
        let Some(st) = self.symtab() else {
            return Ok(Vec::new());
        };
        let entry_size = if self.header.is_64 {
            SIZEOF_NLIST_64
        } else {
            SIZEOF_NLIST_32
        };
        let table_len = (st.nsyms as usize)
            .checked_mul(entry_size)
            .ok_or_else(|| Error::MalformedSymbolTable("symbol count overflows".into()))?;
        let table = self.bytes(st.symoff as u64, table_len).ok_or_else(|| {
            Error::MalformedSymbolTable(format!(
                "{} symbols at {:#x} exceed the image",
                st.nsyms, st.symoff
            ))
        })?;
        let strings = self.bytes(st.stroff as u64, st.strsize as usize).ok_or_else(|| {
            Error::MalformedSymbolTable(format!(
                "string table at {:#x}+{:#x} exceeds the image",
                st.stroff, st.strsize
            ))
        })?;

        let sections: Vec<&Section> = self.sections().collect();
        let mut symbols = Vec::with_capacity(st.nsyms as usize);
        for i in 0..st.nsyms as usize {
            let at = i * entry_size;
            let (strx, n_type, n_sect, n_desc, value) = if self.header.is_64 {
                let nl: Nlist64 = table
                    .pread_with(at, self.endian)
                    .map_err(|e: scroll::Error| Error::MalformedSymbolTable(e.to_string()))?;
                (nl.n_strx, nl.n_type, nl.n_sect, nl.n_desc, nl.n_value)
            } else {
                let nl: Nlist32 = table
                    .pread_with(at, self.endian)
                    .map_err(|e: scroll::Error| Error::MalformedSymbolTable(e.to_string()))?;
                (nl.n_strx, nl.n_type, nl.n_sect, nl.n_desc, nl.n_value as u64)
            };
            let name = strings
                .get(strx as usize..)
                .map(|s| {
                    let end = s.iter().position(|&b| b == 0).unwrap_or(s.len());
                    String::from_utf8_lossy(&s[..end]).into_owned()
                })
                .unwrap_or_default();
            let section = (n_sect as usize)
                .checked_sub(1)
                .and_then(|idx| sections.get(idx))
                .map(|s| format!("{}.{}", s.segment_name, s.name));
            symbols.push(Symbol {
                name,
                n_type,
                n_sect,
                n_desc,
                value,
                section,
            });
        }
        Ok(symbols)
    }

    /// Decode the embedded code signature, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSignature`] if the blob location lies
    /// outside the image or the superblob is malformed.
    pub fn code_signature(&self) -> Result<Option<CodeSignature>> {
        let Some(loc) = self.code_signature_location() else {
            return Ok(None);
        };
        let blob = self.linkedit_data(loc).ok_or_else(|| {
            Error::MalformedSignature(format!(
                "signature at {:#x}+{:#x} exceeds image size {:#x}",
                loc.offset,
                loc.size,
                self.data.len()
            ))
        })?;
        CodeSignature::parse(blob).map(Some)
    }

    /// Decode `LC_FUNCTION_STARTS` relative to [`Self::base_address`].
    pub fn function_starts(&self) -> Result<Option<Vec<u64>>> {
        let Some(loc) = self.function_starts_location() else {
            return Ok(None);
        };
        let bytes = self.linkedit_data(loc).ok_or_else(|| {
            Error::TruncatedFunctionStarts(format!(
                "table at {:#x}+{:#x} exceeds the image",
                loc.offset, loc.size
            ))
        })?;
        function_starts::decode(bytes, self.base_address()).map(Some)
    }

    /// Whether any `__objc_*` metadata section is present.
    pub fn has_objc(&self) -> bool {
        self.sections().any(|s| {
            s.name.starts_with("__objc_")
                && (s.segment_name.starts_with("__DATA") || s.segment_name.starts_with("__TEXT"))
        })
    }
}

fn read_header(data: &[u8], endian: Endian, is_64: bool) -> Result<MachHeader> {
    let short = |_| {
        Error::TruncatedHeader(format!(
            "image of {:#x} bytes is smaller than a Mach-O header",
            data.len()
        ))
    };
    let header = if is_64 {
        let h: Header64 = data.pread_with(0, endian).map_err(short)?;
        MachHeader {
            magic: h.magic,
            cpu_type: h.cputype,
            cpu_subtype: h.cpusubtype,
            filetype: h.filetype,
            ncmds: h.ncmds as u32,
            sizeofcmds: h.sizeofcmds,
            flags: h.flags,
            is_64,
            little_endian: endian == LE,
        }
    } else {
        let h: Header32 = data.pread_with(0, endian).map_err(short)?;
        MachHeader {
            magic: h.magic,
            cpu_type: h.cputype,
            cpu_subtype: h.cpusubtype,
            filetype: h.filetype,
            ncmds: h.ncmds as u32,
            sizeofcmds: h.sizeofcmds,
            flags: h.flags,
            is_64,
            little_endian: endian == LE,
        }
    };
    Ok(header)
}
