//! Objective-C metadata reconstruction
//!
//! Walks the `__objc_*` sections of an image and rebuilds classes,
//! categories, protocols, selector references and method names. A list entry
//! that cannot be decoded is recorded as a [`SkippedEntry`] and the walk
//! moves on to the next one.

mod reader;
pub mod types;

pub use types::*;

use crate::fixups::{DecodedPointer, PointerDecoder};
use crate::macho::{MachOImage, Section};
use crate::{Error, Result};
use reader::Reader;

/// Everything recovered from an image's ObjC sections.
#[derive(Debug, Clone, Default)]
pub struct ObjCMetadata {
    pub image_info: Option<ObjCImageInfo>,
    pub classes: Vec<ObjCClass>,
    pub categories: Vec<ObjCCategory>,
    pub protocols: Vec<ObjCProtocol>,
    pub selector_refs: Vec<SelectorReference>,
    pub method_names: Vec<MethodName>,
    pub skipped: Vec<SkippedEntry>,
}

impl ObjCMetadata {
    /// Reconstruct the metadata of `image`. `Ok(None)` when the image has
    /// no ObjC sections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedObjC`] if an ObjC section's file range lies
    /// outside the image. Bad list entries are not errors; they end up in
    /// [`ObjCMetadata::skipped`].
    pub fn parse(image: &MachOImage<'_>, decoder: &PointerDecoder) -> Result<Option<Self>> {
        if !image.has_objc() {
            return Ok(None);
        }
        let reader = Reader::new(image, decoder);
        let mut meta = ObjCMetadata::default();

        for section in objc_sections(image, "__objc_imageinfo") {
            let bytes = section_bytes(image, section)?;
            match (read_u32(image, bytes, 0), read_u32(image, bytes, 4)) {
                (Some(version), Some(flags)) => {
                    meta.image_info = Some(ObjCImageInfo::new(version, flags));
                }
                _ => meta.skip(section, 0, section.addr, "image info shorter than 8 bytes".into()),
            }
        }

        for (list, non_lazy) in [("__objc_classlist", false), ("__objc_nlclslist", true)] {
            meta.walk_list(image, &reader, list, |meta, addr| {
                let mut class = reader.class(addr)?;
                class.non_lazy = non_lazy;
                meta.classes.push(class);
                Ok(())
            })?;
        }
        for (list, non_lazy) in [("__objc_catlist", false), ("__objc_nlcatlist", true)] {
            meta.walk_list(image, &reader, list, |meta, addr| {
                let mut category = reader.category(addr)?;
                category.non_lazy = non_lazy;
                meta.categories.push(category);
                Ok(())
            })?;
        }
        meta.walk_list(image, &reader, "__objc_protolist", |meta, addr| {
            meta.protocols.push(reader.protocol(addr)?);
            Ok(())
        })?;
        meta.walk_selrefs(image, &reader)?;
        meta.walk_method_names(image)?;

        tracing::debug!(
            classes = meta.classes.len(),
            categories = meta.categories.len(),
            protocols = meta.protocols.len(),
            selrefs = meta.selector_refs.len(),
            skipped = meta.skipped.len(),
            "reconstructed objc metadata"
        );
        Ok(Some(meta))
    }

    /// Class with the given name.
    pub fn class(&self, name: &str) -> Option<&ObjCClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Categories extending the named class.
    pub fn categories_of<'s>(&'s self, class: &'s str) -> impl Iterator<Item = &'s ObjCCategory> {
        self.categories
            .iter()
            .filter(move |c| c.class_name.as_deref() == Some(class))
    }

    pub fn protocol(&self, name: &str) -> Option<&ObjCProtocol> {
        self.protocols.iter().find(|p| p.name == name)
    }

    fn skip(&mut self, section: &Section, index: usize, vmaddr: u64, reason: String) {
        tracing::warn!(
            section = %section.name,
            index,
            vmaddr = format_args!("{:#x}", vmaddr),
            %reason,
            "skipping objc entry"
        );
        self.skipped.push(SkippedEntry {
            section: section.name.clone(),
            index,
            vmaddr,
            reason,
        });
    }

    /// Visit every pointer of a pointer-list section.
    fn walk_list(
        &mut self,
        image: &MachOImage<'_>,
        reader: &Reader<'_, '_>,
        name: &str,
        mut visit: impl FnMut(&mut Self, u64) -> Result<()>,
    ) -> Result<()> {
        let ptr = reader.pointer_size();
        for section in objc_sections(image, name) {
            section_bytes(image, section)?;
            for index in 0..(section.size / ptr) as usize {
                let slot = section.addr + index as u64 * ptr;
                let outcome = match reader.pointer_at(slot) {
                    Ok(DecodedPointer::Address(addr)) => visit(self, addr),
                    Ok(DecodedPointer::Bind { symbol, .. }) => Err(Error::MalformedObjC(format!(
                        "list slot binds to external {}",
                        symbol
                    ))),
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    self.skip(section, index, slot, e.to_string());
                }
            }
        }
        Ok(())
    }

    fn walk_selrefs(&mut self, image: &MachOImage<'_>, reader: &Reader<'_, '_>) -> Result<()> {
        let ptr = reader.pointer_size();
        for section in objc_sections(image, "__objc_selrefs") {
            section_bytes(image, section)?;
            for index in 0..(section.size / ptr) as usize {
                let slot = section.addr + index as u64 * ptr;
                let resolved = reader.pointer_at(slot).and_then(|p| match p {
                    DecodedPointer::Address(addr) => {
                        Ok((reader.offset(slot)?, addr, reader.cstring(addr)?))
                    }
                    DecodedPointer::Bind { symbol, .. } => Err(Error::MalformedObjC(format!(
                        "selector reference binds to external {}",
                        symbol
                    ))),
                });
                match resolved {
                    Ok((file_offset, vmaddr, name)) => self.selector_refs.push(SelectorReference {
                        file_offset,
                        vmaddr,
                        name,
                    }),
                    Err(e) => self.skip(section, index, slot, e.to_string()),
                }
            }
        }
        Ok(())
    }

    fn walk_method_names(&mut self, image: &MachOImage<'_>) -> Result<()> {
        for section in objc_sections(image, "__objc_methname") {
            let bytes = section_bytes(image, section)?;
            let mut start = 0;
            for (index, chunk) in bytes.split(|&b| b == 0).enumerate() {
                let vmaddr = section.addr + start as u64;
                start += chunk.len() + 1;
                if chunk.is_empty() {
                    continue;
                }
                match std::str::from_utf8(chunk) {
                    Ok(name) => self.method_names.push(MethodName {
                        vmaddr,
                        name: name.to_string(),
                    }),
                    Err(_) => self.skip(section, index, vmaddr, "method name is not UTF-8".into()),
                }
            }
        }
        Ok(())
    }
}

fn objc_sections<'i>(image: &'i MachOImage<'_>, name: &'i str) -> impl Iterator<Item = &'i Section> {
    image
        .sections()
        .filter(move |s| s.name == name && !s.is_zerofill())
}

fn section_bytes<'a>(image: &MachOImage<'a>, section: &Section) -> Result<&'a [u8]> {
    image
        .bytes(u64::from(section.offset), section.size as usize)
        .ok_or_else(|| {
            Error::MalformedObjC(format!(
                "{}.{} at {:#x}+{:#x} exceeds the image",
                section.segment_name, section.name, section.offset, section.size
            ))
        })
}

fn read_u32(image: &MachOImage<'_>, bytes: &[u8], at: usize) -> Option<u32> {
    use scroll::Pread;
    bytes.pread_with(at, image.endian()).ok()
}
