//! `LC_DYLD_CHAINED_FIXUPS` resolution.
//!
//! ```text
//! dyld_chained_fixups_header
//!   ├── starts_offset ──► starts_in_image { seg_count, seg_info_offset[] }
//!   │                        └──► starts_in_segment { page_size, pointer_format,
//!   │                                                 segment_offset, page_start[] }
//!   ├── imports_offset ─► import[imports_count]   (format 1, 2 or 3)
//!   └── symbols_offset ─► NUL-terminated names
//! ```
//!
//! [`ChainedFixups::parse`] validates the tables up front. Walking the
//! chains is deferred to [`ChainedFixups::iter`], which decodes one page at
//! a time and reports a bad page as an `Err` item before moving on.

pub mod pointer;

pub use pointer::{ChainedPointer, PointerAuth};

use std::collections::VecDeque;

use scroll::{Endian, Pread};

use crate::macho::MachOImage;
use crate::{Error, Result};
use pointer::DYLD_CHAINED_PTR_32;

/// `dyld_chained_fixups_header` size.
const HEADER_SIZE: usize = 28;
/// Fixed part of `dyld_chained_starts_in_segment`.
const SEGMENT_STARTS_SIZE: usize = 22;

pub const DYLD_CHAINED_IMPORT: u32 = 1;
pub const DYLD_CHAINED_IMPORT_ADDEND: u32 = 2;
pub const DYLD_CHAINED_IMPORT_ADDEND64: u32 = 3;

pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xFFFF;
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;
pub const DYLD_CHAINED_PTR_START_LAST: u16 = 0x8000;

/// One entry of the imports table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedImport {
    /// Signed: negative values are the special lookup ordinals.
    pub library_ordinal: i32,
    pub weak: bool,
    pub name: String,
    pub addend: i64,
}

/// Chain starts for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStarts {
    /// Index into [`MachOImage::segments`].
    pub segment_index: usize,
    pub page_size: u16,
    pub pointer_format: u16,
    pub segment_offset: u64,
    pub max_valid_pointer: u32,
    /// In-page chain start offsets for each page; empty when the page has
    /// no fixups.
    pub pages: Vec<Vec<u16>>,
}

impl SegmentStarts {
    pub fn pointer_format_name(&self) -> &'static str {
        pointer::pointer_format_name(self.pointer_format)
    }
}

/// One resolved pointer slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixupRecord {
    Bind {
        vmaddr: u64,
        file_offset: u64,
        ordinal: u32,
        symbol: String,
        library_ordinal: i32,
        /// Import addend plus inline addend.
        addend: i64,
        weak: bool,
        auth: Option<PointerAuth>,
        /// `segment.section` containing `vmaddr`
        section: Option<String>,
    },
    Rebase {
        vmaddr: u64,
        file_offset: u64,
        target: u64,
        auth: Option<PointerAuth>,
        section: Option<String>,
    },
}

impl FixupRecord {
    pub fn vmaddr(&self) -> u64 {
        match self {
            FixupRecord::Bind { vmaddr, .. } | FixupRecord::Rebase { vmaddr, .. } => *vmaddr,
        }
    }

    pub fn section(&self) -> Option<&str> {
        match self {
            FixupRecord::Bind { section, .. } | FixupRecord::Rebase { section, .. } => {
                section.as_deref()
            }
        }
    }
}

/// Parsed chained fixups tables of an image.
#[derive(Debug, Clone)]
pub struct ChainedFixups<'a> {
    image: &'a MachOImage<'a>,
    pub version: u32,
    pub imports_format: u32,
    pub imports: Vec<ChainedImport>,
    pub starts: Vec<SegmentStarts>,
}

fn read<T>(blob: &[u8], offset: usize, endian: Endian, what: &str) -> Result<T>
where
    T: for<'b> scroll::ctx::TryFromCtx<'b, Endian, Error = scroll::Error>,
{
    blob.pread_with(offset, endian).map_err(|_| {
        Error::fixup_blob(format!(
            "{} at {:#x} exceeds blob of {:#x} bytes",
            what,
            offset,
            blob.len()
        ))
    })
}

fn cstr_at(blob: &[u8], offset: usize) -> Option<&str> {
    let rest = blob.get(offset..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}

impl<'a> ChainedFixups<'a> {
    /// Read the fixups blob of `image`. `Ok(None)` if the image has no
    /// `LC_DYLD_CHAINED_FIXUPS`.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedFixupChain`] if the blob or any of its tables is
    ///   out of bounds
    /// - [`Error::UnsupportedFormatVariant`] for unknown header version,
    ///   imports format or symbols format
    pub fn parse(image: &'a MachOImage<'a>) -> Result<Option<Self>> {
        let Some(loc) = image.chained_fixups_location() else {
            return Ok(None);
        };
        let blob = image.linkedit_data(loc).ok_or_else(|| {
            Error::fixup_blob(format!(
                "blob at {:#x}+{:#x} exceeds the image",
                loc.offset, loc.size
            ))
        })?;
        let endian = image.endian();
        if blob.len() < HEADER_SIZE {
            return Err(Error::fixup_blob(format!(
                "blob of {} bytes is smaller than its header",
                blob.len()
            )));
        }

        let version: u32 = read(blob, 0, endian, "header")?;
        let starts_offset: u32 = read(blob, 4, endian, "header")?;
        let imports_offset: u32 = read(blob, 8, endian, "header")?;
        let symbols_offset: u32 = read(blob, 12, endian, "header")?;
        let imports_count: u32 = read(blob, 16, endian, "header")?;
        let imports_format: u32 = read(blob, 20, endian, "header")?;
        let symbols_format: u32 = read(blob, 24, endian, "header")?;

        if version != 0 {
            return Err(Error::UnsupportedFormatVariant(format!(
                "chained fixups version {}",
                version
            )));
        }
        if symbols_format != 0 {
            return Err(Error::UnsupportedFormatVariant(format!(
                "compressed chained fixups symbols (format {})",
                symbols_format
            )));
        }

        let imports = parse_imports(
            blob,
            endian,
            imports_offset as usize,
            imports_count as usize,
            imports_format,
            symbols_offset as usize,
        )?;
        let starts = parse_starts(image, blob, endian, starts_offset as usize)?;

        tracing::debug!(
            imports = imports.len(),
            segments = starts.len(),
            "parsed chained fixups"
        );
        Ok(Some(ChainedFixups {
            image,
            version,
            imports_format,
            imports,
            starts,
        }))
    }

    /// Lazily walk every chain. Bad pages and unsupported segments come out
    /// as `Err` items; the walk carries on past them.
    pub fn iter(&self) -> FixupIter<'_, 'a> {
        FixupIter {
            fixups: self,
            segment: 0,
            page: 0,
            pending: VecDeque::new(),
        }
    }

    fn walk_page(&self, starts: &SegmentStarts, page: usize, out: &mut VecDeque<Result<FixupRecord>>) {
        let image = self.image;
        let seg_index = starts.segment_index;
        let bad = |reason: String| Error::MalformedFixupChain {
            segment: seg_index,
            page,
            reason,
        };
        let Some(segment) = image.segments().get(seg_index) else {
            out.push_back(Err(bad("segment index has no load command".into())));
            return;
        };
        let Some(stride) = pointer::stride(starts.pointer_format) else {
            return;
        };

        let page_size = u64::from(starts.page_size);
        let page_delta = page as u64 * page_size;
        if page_delta >= segment.filesize {
            out.push_back(Err(bad(format!(
                "page at {:#x} is past segment {} file size {:#x}",
                page_delta, segment.name, segment.filesize
            ))));
            return;
        }
        let extent = page_size.min(segment.filesize - page_delta);
        let page_file = segment.fileoff + page_delta;
        let page_vm = segment.vmaddr.wrapping_add(page_delta);
        let Some(bytes) = image.bytes(page_file, extent as usize) else {
            out.push_back(Err(bad(format!(
                "page at file offset {:#x} is past the image",
                page_file
            ))));
            return;
        };

        let width = pointer::slot_width(starts.pointer_format) as u64;
        let base = image.base_address();
        let endian = image.endian();

        for &start in &starts.pages[page] {
            let mut offset = u64::from(start);
            if offset >= extent {
                out.push_back(Err(bad(format!(
                    "page start {:#x} is past the page extent {:#x}",
                    offset, extent
                ))));
                return;
            }
            loop {
                if offset + width > extent {
                    out.push_back(Err(bad(format!(
                        "chain slot at {:#x} runs past the page extent {:#x}",
                        offset, extent
                    ))));
                    return;
                }
                let at = offset as usize;
                let read = if width == 4 {
                    bytes.pread_with::<u32>(at, endian).map(u64::from)
                } else {
                    bytes.pread_with::<u64>(at, endian)
                };
                let raw = read.unwrap_or_default();

                let decoded = match pointer::decode(starts.pointer_format, raw, base, starts.max_valid_pointer) {
                    Ok(d) => d,
                    Err(e) => {
                        out.push_back(Err(e));
                        return;
                    }
                };
                let vmaddr = page_vm.wrapping_add(offset);
                let file_offset = page_file + offset;
                let section = image
                    .section_for_vmaddr(vmaddr)
                    .map(|s| format!("{}.{}", s.segment_name, s.name));

                let record = match decoded {
                    ChainedPointer::Value { .. } => None,
                    ChainedPointer::Rebase { target, auth, .. } => Some(FixupRecord::Rebase {
                        vmaddr,
                        file_offset,
                        target,
                        auth,
                        section,
                    }),
                    ChainedPointer::Bind {
                        ordinal,
                        addend,
                        auth,
                        ..
                    } => {
                        let Some(import) = self.imports.get(ordinal as usize) else {
                            out.push_back(Err(bad(format!(
                                "bind ordinal {} at {:#x} outside {} imports",
                                ordinal,
                                vmaddr,
                                self.imports.len()
                            ))));
                            return;
                        };
                        Some(FixupRecord::Bind {
                            vmaddr,
                            file_offset,
                            ordinal,
                            symbol: import.name.clone(),
                            library_ordinal: import.library_ordinal,
                            addend: import.addend.wrapping_add(addend),
                            weak: import.weak,
                            auth,
                            section,
                        })
                    }
                };
                if let Some(record) = record {
                    out.push_back(Ok(record));
                }

                let next = decoded.next();
                if next == 0 {
                    break;
                }
                offset += next * stride;
            }
        }
    }
}

fn parse_imports(
    blob: &[u8],
    endian: Endian,
    offset: usize,
    count: usize,
    format: u32,
    symbols_offset: usize,
) -> Result<Vec<ChainedImport>> {
    let entry_size = match format {
        DYLD_CHAINED_IMPORT => 4,
        DYLD_CHAINED_IMPORT_ADDEND => 8,
        DYLD_CHAINED_IMPORT_ADDEND64 => 16,
        other => {
            return Err(Error::UnsupportedFormatVariant(format!(
                "chained imports format {}",
                other
            )))
        }
    };
    count
        .checked_mul(entry_size)
        .and_then(|len| len.checked_add(offset))
        .filter(|&end| end <= blob.len())
        .ok_or_else(|| {
            Error::fixup_blob(format!(
                "{} imports at {:#x} exceed blob of {:#x} bytes",
                count,
                offset,
                blob.len()
            ))
        })?;

    let mut imports = Vec::with_capacity(count);
    for i in 0..count {
        let at = offset + i * entry_size;
        let (library_ordinal, weak, name_offset, addend) = if format == DYLD_CHAINED_IMPORT_ADDEND64 {
            let raw: u64 = read(blob, at, endian, "import")?;
            let addend: u64 = read(blob, at + 8, endian, "import")?;
            (
                (raw & 0xFFFF) as u16 as i16 as i32,
                (raw >> 16) & 1 != 0,
                (raw >> 32) as usize,
                addend as i64,
            )
        } else {
            let raw: u32 = read(blob, at, endian, "import")?;
            let addend = if format == DYLD_CHAINED_IMPORT_ADDEND {
                i64::from(read::<i32>(blob, at + 4, endian, "import")?)
            } else {
                0
            };
            (
                (raw & 0xFF) as u8 as i8 as i32,
                (raw >> 8) & 1 != 0,
                (raw >> 9) as usize,
                addend,
            )
        };
        let name = symbols_offset
            .checked_add(name_offset)
            .and_then(|at| cstr_at(blob, at))
            .ok_or_else(|| {
                Error::fixup_blob(format!(
                    "import {} name offset {:#x} is outside the symbol pool",
                    i, name_offset
                ))
            })?;
        imports.push(ChainedImport {
            library_ordinal,
            weak,
            name: name.to_string(),
            addend,
        });
    }
    Ok(imports)
}

fn parse_starts(
    image: &MachOImage<'_>,
    blob: &[u8],
    endian: Endian,
    starts_offset: usize,
) -> Result<Vec<SegmentStarts>> {
    let seg_count: u32 = read(blob, starts_offset, endian, "starts_in_image")?;
    if seg_count as usize > image.segments().len() {
        return Err(Error::fixup_blob(format!(
            "starts table lists {} segments but the image has {}",
            seg_count,
            image.segments().len()
        )));
    }

    let mut starts = Vec::new();
    for index in 0..seg_count as usize {
        let info_offset: u32 = read(blob, starts_offset + 4 + index * 4, endian, "seg_info_offset")?;
        if info_offset == 0 {
            continue;
        }
        let at = starts_offset
            .checked_add(info_offset as usize)
            .filter(|at| at + SEGMENT_STARTS_SIZE <= blob.len())
            .ok_or_else(|| {
                Error::fixup_blob(format!(
                    "starts for segment {} at {:#x} exceed the blob",
                    index, info_offset
                ))
            })?;

        let size: u32 = read(blob, at, endian, "starts_in_segment")?;
        let page_size: u16 = read(blob, at + 4, endian, "starts_in_segment")?;
        let pointer_format: u16 = read(blob, at + 6, endian, "starts_in_segment")?;
        let segment_offset: u64 = read(blob, at + 8, endian, "starts_in_segment")?;
        let max_valid_pointer: u32 = read(blob, at + 16, endian, "starts_in_segment")?;
        let page_count: u16 = read(blob, at + 20, endian, "starts_in_segment")?;

        if page_size == 0 && page_count > 0 {
            return Err(Error::fixup_blob(format!(
                "segment {} has a zero page size",
                index
            )));
        }
        let record_end = at + (size as usize).max(SEGMENT_STARTS_SIZE + page_count as usize * 2);
        if record_end > blob.len() {
            return Err(Error::fixup_blob(format!(
                "starts for segment {} ({} pages) exceed the blob",
                index, page_count
            )));
        }

        let page_table = at + SEGMENT_STARTS_SIZE;
        let mut pages = Vec::with_capacity(page_count as usize);
        for page in 0..page_count as usize {
            let start: u16 = read(blob, page_table + page * 2, endian, "page_start")?;
            pages.push(match start {
                DYLD_CHAINED_PTR_START_NONE => Vec::new(),
                s if pointer_format == DYLD_CHAINED_PTR_32 && s & DYLD_CHAINED_PTR_START_MULTI != 0 => {
                    read_multi_starts(blob, endian, page_table, s & !DYLD_CHAINED_PTR_START_MULTI, record_end)
                        .ok_or_else(|| {
                            Error::fixup_blob(format!(
                                "overflow starts for segment {} page {} exceed the record",
                                index, page
                            ))
                        })?
                }
                s => vec![s],
            });
        }

        starts.push(SegmentStarts {
            segment_index: index,
            page_size,
            pointer_format,
            segment_offset,
            max_valid_pointer,
            pages,
        });
    }
    Ok(starts)
}

fn read_multi_starts(blob: &[u8], endian: Endian, page_table: usize, index: u16, end: usize) -> Option<Vec<u16>> {
    let mut starts = Vec::new();
    let mut at = page_table + index as usize * 2;
    loop {
        if at + 2 > end {
            return None;
        }
        let value: u16 = blob.pread_with(at, endian).ok()?;
        starts.push(value & !DYLD_CHAINED_PTR_START_LAST);
        if value & DYLD_CHAINED_PTR_START_LAST != 0 {
            return Some(starts);
        }
        at += 2;
    }
}

/// Lazy walk over every page of every segment with chains.
pub struct FixupIter<'f, 'a> {
    fixups: &'f ChainedFixups<'a>,
    segment: usize,
    page: usize,
    pending: VecDeque<Result<FixupRecord>>,
}

impl Iterator for FixupIter<'_, '_> {
    type Item = Result<FixupRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            let starts = self.fixups.starts.get(self.segment)?;

            if self.page == 0 && pointer::stride(starts.pointer_format).is_none() {
                self.segment += 1;
                return Some(Err(Error::UnsupportedFormatVariant(format!(
                    "chained pointer format {} ({}) in segment {}",
                    starts.pointer_format,
                    starts.pointer_format_name(),
                    starts.segment_index
                ))));
            }
            if self.page >= starts.pages.len() {
                self.segment += 1;
                self.page = 0;
                continue;
            }

            let page = self.page;
            self.page += 1;
            if !starts.pages[page].is_empty() {
                self.fixups.walk_page(starts, page, &mut self.pending);
            }
        }
    }
}

/// A fully walked fixups table, detached from the image.
#[derive(Debug, Default)]
pub struct FixupReport {
    pub imports: Vec<ChainedImport>,
    pub starts: Vec<SegmentStarts>,
    pub records: Vec<FixupRecord>,
    /// Per-page and per-segment failures, in walk order.
    pub errors: Vec<Error>,
}

impl FixupReport {
    pub fn collect(fixups: &ChainedFixups<'_>) -> Self {
        let (mut records, mut errors) = (Vec::new(), Vec::new());
        for item in fixups.iter() {
            match item {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping fixup page");
                    errors.push(e);
                }
            }
        }
        FixupReport {
            imports: fixups.imports.clone(),
            starts: fixups.starts.clone(),
            records,
            errors,
        }
    }

    pub fn binds(&self) -> impl Iterator<Item = &FixupRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r, FixupRecord::Bind { .. }))
    }

    pub fn rebases(&self) -> impl Iterator<Item = &FixupRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r, FixupRecord::Rebase { .. }))
    }
}

/// A pointer slot value after fixup decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPointer {
    Address(u64),
    Bind { symbol: String, addend: i64 },
}

/// VM range of one segment with chains, and how its slots are encoded.
#[derive(Debug, Clone, Copy)]
struct ChainedRange {
    start: u64,
    end: u64,
    format: u16,
    max_valid_pointer: u32,
}

/// Turns raw pointer slot values into addresses or bound symbols.
///
/// Images without chained fixups store plain addresses; images with them
/// store chain entries that must be decoded with the format of the segment
/// holding the slot.
#[derive(Debug, Clone, Default)]
pub struct PointerDecoder {
    ranges: Vec<ChainedRange>,
    base: u64,
    imports: Vec<String>,
}

impl PointerDecoder {
    /// Decoder for images without chained fixups.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn from_fixups(fixups: &ChainedFixups<'_>) -> Self {
        let segments = fixups.image.segments();
        let ranges = fixups
            .starts
            .iter()
            .filter_map(|starts| {
                let segment = segments.get(starts.segment_index)?;
                Some(ChainedRange {
                    start: segment.vmaddr,
                    end: segment.vmaddr.saturating_add(segment.vmsize),
                    format: starts.pointer_format,
                    max_valid_pointer: starts.max_valid_pointer,
                })
            })
            .collect();
        PointerDecoder {
            ranges,
            base: fixups.image.base_address(),
            imports: fixups.imports.iter().map(|i| i.name.clone()).collect(),
        }
    }

    /// Decode the value `raw` read from the slot at `vmaddr`. Slots outside
    /// every chained segment, and undecodable entries, keep the raw value.
    pub fn decode(&self, vmaddr: u64, raw: u64) -> DecodedPointer {
        let Some(range) = self.ranges.iter().find(|r| (r.start..r.end).contains(&vmaddr)) else {
            return DecodedPointer::Address(raw);
        };
        // nil slots are left out of every chain
        if raw == 0 {
            return DecodedPointer::Address(0);
        }
        match pointer::decode(range.format, raw, self.base, range.max_valid_pointer) {
            Ok(ChainedPointer::Rebase { target, .. }) => DecodedPointer::Address(target & 0x00FF_FFFF_FFFF_FFFF),
            Ok(ChainedPointer::Value { value, .. }) => DecodedPointer::Address(value),
            Ok(ChainedPointer::Bind { ordinal, addend, .. }) => match self.imports.get(ordinal as usize) {
                Some(name) => DecodedPointer::Bind {
                    symbol: name.clone(),
                    addend,
                },
                None => DecodedPointer::Address(raw),
            },
            Err(_) => DecodedPointer::Address(raw),
        }
    }

    /// Decode a slot expected to hold an address inside this image.
    pub fn address(&self, vmaddr: u64, raw: u64) -> Option<u64> {
        match self.decode(vmaddr, raw) {
            DecodedPointer::Address(addr) => Some(addr),
            DecodedPointer::Bind { .. } => None,
        }
    }
}
