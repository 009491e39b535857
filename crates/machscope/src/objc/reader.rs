//! Runtime structure decoding.
//!
//! ```text
//! class_t            class_ro_t                method_list_t
//! ┌────────────┐     ┌─────────────────┐      ┌──────────────────┐
//! │ isa        │──►  │ flags           │      │ entsize | flags  │
//! │ superclass │     │ instanceStart   │      │ count            │
//! │ cache      │     │ instanceSize    │      ├──────────────────┤
//! │ vtable     │     │ ivarLayout      │      │ name  types  imp │ pointers, or
//! │ data ──────┼───► │ name            │      │ ...              │ i32 offsets when
//! └────────────┘     │ baseMethods ────┼────► └──────────────────┘ relative
//!                    │ baseProtocols   │
//!                    │ ivars           │
//!                    │ weakIvarLayout  │
//!                    │ baseProperties  │
//!                    └─────────────────┘
//! ```
//!
//! Every pointer slot is read through the [`PointerDecoder`], so chained
//! fixup entries resolve to addresses or to bound symbol names.

use crate::fixups::{DecodedPointer, PointerDecoder};
use crate::macho::MachOImage;
use crate::{Error, Result};

use super::types::*;

const FAST_DATA_MASK_64: u64 = 0x0000_7fff_ffff_fff8;
const FAST_DATA_MASK_32: u64 = 0xffff_fffc;
const FAST_IS_SWIFT: u64 = 0b11;

const METHOD_LIST_RELATIVE_FLAG: u32 = 0x8000_0000;
const METHOD_LIST_SELECTORS_DIRECT_FLAG: u32 = 0x4000_0000;
const METHOD_LIST_FLAGS_MASK: u32 = 0xffff_0003;

const CLASS_SYMBOL_PREFIX: &str = "_OBJC_CLASS_$_";
const METACLASS_SYMBOL_PREFIX: &str = "_OBJC_METACLASS_$_";
const PROTOCOL_SYMBOL_PREFIX: &str = "_OBJC_PROTOCOL_$_";

/// Symbol name without its ObjC runtime prefix.
pub(crate) fn strip_symbol_prefix(symbol: &str) -> &str {
    [CLASS_SYMBOL_PREFIX, METACLASS_SYMBOL_PREFIX, PROTOCOL_SYMBOL_PREFIX]
        .iter()
        .find_map(|p| symbol.strip_prefix(p))
        .unwrap_or(symbol)
}

fn malformed(msg: String) -> Error {
    Error::MalformedObjC(msg)
}

pub(crate) struct Reader<'i, 'a> {
    image: &'i MachOImage<'a>,
    decoder: &'i PointerDecoder,
    ptr: u64,
}

impl<'i, 'a> Reader<'i, 'a> {
    pub fn new(image: &'i MachOImage<'a>, decoder: &'i PointerDecoder) -> Self {
        Reader {
            image,
            decoder,
            ptr: image.pointer_size() as u64,
        }
    }

    pub fn pointer_size(&self) -> u64 {
        self.ptr
    }

    pub fn offset(&self, vmaddr: u64) -> Result<u64> {
        self.image
            .vmaddr_to_offset(vmaddr)
            .ok_or_else(|| malformed(format!("address {:#x} is not backed by any segment", vmaddr)))
    }

    fn u32_at(&self, vmaddr: u64) -> Result<u32> {
        let off = self.offset(vmaddr)?;
        self.image
            .read_u32(off)
            .ok_or_else(|| malformed(format!("u32 at {:#x} runs past the image", vmaddr)))
    }

    /// Decoded pointer slot at `vmaddr`.
    pub fn pointer_at(&self, vmaddr: u64) -> Result<DecodedPointer> {
        let off = self.offset(vmaddr)?;
        let raw = self
            .image
            .read_pointer(off)
            .ok_or_else(|| malformed(format!("pointer at {:#x} runs past the image", vmaddr)))?;
        Ok(self.decoder.decode(vmaddr, raw))
    }

    /// Pointer slot that must hold a local address (0 for nil).
    fn address_at(&self, vmaddr: u64) -> Result<u64> {
        match self.pointer_at(vmaddr)? {
            DecodedPointer::Address(addr) => Ok(addr),
            DecodedPointer::Bind { symbol, .. } => Err(malformed(format!(
                "pointer at {:#x} binds to external {}",
                vmaddr, symbol
            ))),
        }
    }

    pub fn cstring(&self, vmaddr: u64) -> Result<String> {
        let off = self.offset(vmaddr)?;
        self.image
            .read_cstring(off)
            .map(str::to_string)
            .ok_or_else(|| malformed(format!("no string at {:#x}", vmaddr)))
    }

    /// String referenced by the pointer slot at `vmaddr`; empty for nil.
    fn string_ptr(&self, vmaddr: u64) -> Result<String> {
        match self.address_at(vmaddr)? {
            0 => Ok(String::new()),
            addr => self.cstring(addr),
        }
    }

    /// Bytes available from `vmaddr` to the end of its segment's file data.
    fn available(&self, vmaddr: u64) -> u64 {
        self.image
            .segment_for_vmaddr(vmaddr)
            .map_or(0, |s| s.filesize.saturating_sub(vmaddr - s.vmaddr))
    }

    /// `(entsize, count)` header shared by the method, ivar and property
    /// lists, with the count checked against the bytes behind it.
    fn list_header(&self, list: u64, entsize_mask: u32, min_entsize: u64) -> Result<(u32, u64, u64)> {
        let raw = self.u32_at(list)?;
        let count = u64::from(self.u32_at(list.wrapping_add(4))?);
        let entsize = u64::from(raw & entsize_mask);
        if entsize < min_entsize {
            return Err(malformed(format!(
                "list at {:#x} has entry size {} (< {})",
                list, entsize, min_entsize
            )));
        }
        let needed = count
            .checked_mul(entsize)
            .and_then(|n| n.checked_add(8))
            .unwrap_or(u64::MAX);
        if needed > self.available(list) {
            return Err(malformed(format!(
                "list at {:#x} claims {} entries of {} bytes past the segment end",
                list, count, entsize
            )));
        }
        Ok((raw, entsize, count))
    }

    pub fn method_list(&self, list: u64) -> Result<Vec<ObjCMethod>> {
        if list == 0 {
            return Ok(Vec::new());
        }
        let raw = self.u32_at(list)?;
        let relative = raw & METHOD_LIST_RELATIVE_FLAG != 0;
        let min = if relative { 12 } else { 3 * self.ptr };
        let (flags, entsize, count) = self.list_header(list, !METHOD_LIST_FLAGS_MASK, min)?;
        let direct = flags & METHOD_LIST_SELECTORS_DIRECT_FLAG != 0;

        let mut methods = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry = list.wrapping_add(8 + i * entsize);
            let method = if relative {
                let rel = |field: u64| -> Result<u64> {
                    let delta = self.u32_at(entry.wrapping_add(field))? as i32;
                    Ok(entry.wrapping_add(field).wrapping_add_signed(i64::from(delta)))
                };
                let name_ref = rel(0)?;
                let name = if direct {
                    self.cstring(name_ref)?
                } else {
                    self.string_ptr(name_ref)?
                };
                // a zero imp offset means the method has no implementation
                let imp = match self.u32_at(entry.wrapping_add(8))? {
                    0 => 0,
                    _ => rel(8)?,
                };
                ObjCMethod {
                    name,
                    types: self.cstring(rel(4)?)?,
                    imp,
                }
            } else {
                ObjCMethod {
                    name: self.string_ptr(entry)?,
                    types: self.string_ptr(entry.wrapping_add(self.ptr))?,
                    imp: self.address_at(entry.wrapping_add(2 * self.ptr)).unwrap_or(0),
                }
            };
            methods.push(method);
        }
        Ok(methods)
    }

    pub fn ivar_list(&self, list: u64) -> Result<Vec<ObjCIvar>> {
        if list == 0 {
            return Ok(Vec::new());
        }
        let (_, entsize, count) = self.list_header(list, u32::MAX, 3 * self.ptr + 8)?;
        let mut ivars = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry = list.wrapping_add(8 + i * entsize);
            let offset = match self.address_at(entry)? {
                0 => 0,
                slot => self.u32_at(slot)?,
            };
            ivars.push(ObjCIvar {
                name: self.string_ptr(entry.wrapping_add(self.ptr))?,
                types: self.string_ptr(entry.wrapping_add(2 * self.ptr))?,
                offset,
                size: self.u32_at(entry.wrapping_add(3 * self.ptr + 4))?,
            });
        }
        Ok(ivars)
    }

    pub fn property_list(&self, list: u64) -> Result<Vec<ObjCProperty>> {
        if list == 0 {
            return Ok(Vec::new());
        }
        let (_, entsize, count) = self.list_header(list, u32::MAX, 2 * self.ptr)?;
        let mut props = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry = list.wrapping_add(8 + i * entsize);
            props.push(ObjCProperty {
                name: self.string_ptr(entry)?,
                attributes: self.string_ptr(entry.wrapping_add(self.ptr))?,
            });
        }
        Ok(props)
    }

    /// Names of the protocols in a `protocol_list_t`.
    pub fn protocol_names(&self, list: u64) -> Result<Vec<String>> {
        if list == 0 {
            return Ok(Vec::new());
        }
        let count = match self.pointer_at(list)? {
            DecodedPointer::Address(n) => n,
            DecodedPointer::Bind { .. } => {
                return Err(malformed(format!("protocol list at {:#x} has a bound count", list)))
            }
        };
        if count.saturating_add(1).saturating_mul(self.ptr) > self.available(list) {
            return Err(malformed(format!(
                "protocol list at {:#x} claims {} entries past the segment end",
                list, count
            )));
        }
        (0..count)
            .map(|i| match self.pointer_at(list.wrapping_add((i + 1) * self.ptr))? {
                DecodedPointer::Bind { symbol, .. } => Ok(strip_symbol_prefix(&symbol).to_string()),
                DecodedPointer::Address(addr) => self.string_ptr(addr.wrapping_add(self.ptr)),
            })
            .collect()
    }

    pub fn protocol(&self, vmaddr: u64) -> Result<ObjCProtocol> {
        let p = self.ptr;
        Ok(ObjCProtocol {
            vmaddr,
            file_offset: self.offset(vmaddr)?,
            name: self.string_ptr(vmaddr.wrapping_add(p))?,
            protocols: self.protocol_names(self.address_at(vmaddr.wrapping_add(2 * p))?)?,
            instance_methods: self.method_list(self.address_at(vmaddr.wrapping_add(3 * p))?)?,
            class_methods: self.method_list(self.address_at(vmaddr.wrapping_add(4 * p))?)?,
            optional_instance_methods: self.method_list(self.address_at(vmaddr.wrapping_add(5 * p))?)?,
            optional_class_methods: self.method_list(self.address_at(vmaddr.wrapping_add(6 * p))?)?,
            properties: self.property_list(self.address_at(vmaddr.wrapping_add(7 * p))?)?,
        })
    }

    /// `class_t.data` resolved to its `class_ro_t` address and Swift bit.
    fn class_data(&self, class: u64) -> Result<(u64, bool)> {
        let data = self.address_at(class.wrapping_add(4 * self.ptr))?;
        let mask = if self.ptr == 8 {
            FAST_DATA_MASK_64
        } else {
            FAST_DATA_MASK_32
        };
        let ro = data & mask;
        if ro == 0 {
            return Err(malformed(format!("class at {:#x} has no read-only data", class)));
        }
        Ok((ro, data & FAST_IS_SWIFT != 0))
    }

    /// Address of field `index` (counted in pointers) after the fixed
    /// `class_ro_t` integer header.
    fn ro_field(&self, ro: u64, index: u64) -> u64 {
        let header = if self.ptr == 8 { 16 } else { 12 };
        ro.wrapping_add(header + index * self.ptr)
    }

    fn class_name(&self, class: u64) -> Result<String> {
        let (ro, _) = self.class_data(class)?;
        self.string_ptr(self.ro_field(ro, 1))
    }

    fn superclass_name(&self, class: u64) -> Option<String> {
        match self.pointer_at(class.wrapping_add(self.ptr)).ok()? {
            DecodedPointer::Bind { symbol, .. } => Some(strip_symbol_prefix(&symbol).to_string()),
            DecodedPointer::Address(0) => None,
            DecodedPointer::Address(addr) => self.class_name(addr).ok(),
        }
    }

    pub fn class(&self, vmaddr: u64) -> Result<ObjCClass> {
        let (ro, is_swift) = self.class_data(vmaddr)?;
        let mut class = ObjCClass {
            vmaddr,
            file_offset: self.offset(vmaddr)?,
            name: self.string_ptr(self.ro_field(ro, 1))?,
            superclass: self.superclass_name(vmaddr),
            flags: self.u32_at(ro)?,
            instance_start: self.u32_at(ro.wrapping_add(4))?,
            instance_size: self.u32_at(ro.wrapping_add(8))?,
            is_swift,
            instance_methods: self.method_list(self.address_at(self.ro_field(ro, 2))?)?,
            protocols: self.protocol_names(self.address_at(self.ro_field(ro, 3))?)?,
            ivars: self.ivar_list(self.address_at(self.ro_field(ro, 4))?)?,
            properties: self.property_list(self.address_at(self.ro_field(ro, 6))?)?,
            ..Default::default()
        };

        match self.metaclass_methods(vmaddr) {
            Ok(methods) => class.class_methods = methods,
            Err(e) => tracing::debug!(class = %class.name, error = %e, "no class methods"),
        }
        Ok(class)
    }

    fn metaclass_methods(&self, class: u64) -> Result<Vec<ObjCMethod>> {
        match self.address_at(class)? {
            0 => Ok(Vec::new()),
            meta => {
                let (ro, _) = self.class_data(meta)?;
                self.method_list(self.address_at(self.ro_field(ro, 2))?)
            }
        }
    }

    pub fn category(&self, vmaddr: u64) -> Result<ObjCCategory> {
        let p = self.ptr;
        let class_name = match self.pointer_at(vmaddr.wrapping_add(p))? {
            DecodedPointer::Bind { symbol, .. } => Some(strip_symbol_prefix(&symbol).to_string()),
            DecodedPointer::Address(0) => None,
            DecodedPointer::Address(addr) => self.class_name(addr).ok(),
        };
        Ok(ObjCCategory {
            vmaddr,
            file_offset: self.offset(vmaddr)?,
            name: self.string_ptr(vmaddr)?,
            class_name,
            non_lazy: false,
            instance_methods: self.method_list(self.address_at(vmaddr.wrapping_add(2 * p))?)?,
            class_methods: self.method_list(self.address_at(vmaddr.wrapping_add(3 * p))?)?,
            protocols: self.protocol_names(self.address_at(vmaddr.wrapping_add(4 * p))?)?,
            properties: self.property_list(self.address_at(vmaddr.wrapping_add(5 * p))?)?,
        })
    }
}
