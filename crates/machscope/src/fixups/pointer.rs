//! Chained pointer formats.
//!
//! Each pointer slot in a chained page packs either a rebase target or a
//! bind ordinal together with the stride to the next slot. The layout
//! depends on the segment's pointer format:
//!
//! ```text
//! arm64e (1, 7, 9, 10, 12)
//!  63  62  61..51  50 ........................................ 0
//! auth bind  next  rebase: high8(8) target(43)
//!                  bind:   addend(19) ... ordinal(16 | 24)
//!                  auth rebase: key(2) addrDiv(1) diversity(16) target(32)
//!                  auth bind:   key(2) addrDiv(1) diversity(16) ordinal(16 | 24)
//!
//! 64 / 64_offset (2, 6)
//!  63  62..51  50..44  43..36  35 ........ 0
//! bind  next   rsvd    high8   target(36)
//! bind: addend(8) at 24..31, ordinal(24)
//!
//! 64_kernel_cache / x86_64_kernel_cache (8, 11), rebase only
//!  63   62..51  50..49  48      47..32     31..30      29 ...... 0
//! auth  next    key     addrDiv diversity  cacheLevel  target(30)
//!
//! 32 (3)
//!  31  30..26  25 ..... 0
//! bind  next   target(26)
//! bind: addend(6) at 20..25, ordinal(20)
//! ```
//!
//! A 32-bit rebase whose target exceeds the segment's `max_valid_pointer`
//! is a plain value threaded through the chain, not a pointer.

use crate::{Error, Result};

pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;
pub const DYLD_CHAINED_PTR_64: u16 = 2;
pub const DYLD_CHAINED_PTR_32: u16 = 3;
pub const DYLD_CHAINED_PTR_32_CACHE: u16 = 4;
pub const DYLD_CHAINED_PTR_32_FIRMWARE: u16 = 5;
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
pub const DYLD_CHAINED_PTR_ARM64E_KERNEL: u16 = 7;
pub const DYLD_CHAINED_PTR_64_KERNEL_CACHE: u16 = 8;
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND: u16 = 9;
pub const DYLD_CHAINED_PTR_ARM64E_FIRMWARE: u16 = 10;
pub const DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE: u16 = 11;
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;

/// Name of a pointer format.
pub fn pointer_format_name(format: u16) -> &'static str {
    match format {
        DYLD_CHAINED_PTR_ARM64E => "arm64e",
        DYLD_CHAINED_PTR_64 => "64",
        DYLD_CHAINED_PTR_32 => "32",
        DYLD_CHAINED_PTR_32_CACHE => "32_cache",
        DYLD_CHAINED_PTR_32_FIRMWARE => "32_firmware",
        DYLD_CHAINED_PTR_64_OFFSET => "64_offset",
        DYLD_CHAINED_PTR_ARM64E_KERNEL => "arm64e_kernel",
        DYLD_CHAINED_PTR_64_KERNEL_CACHE => "64_kernel_cache",
        DYLD_CHAINED_PTR_ARM64E_USERLAND => "arm64e_userland",
        DYLD_CHAINED_PTR_ARM64E_FIRMWARE => "arm64e_firmware",
        DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE => "x86_64_kernel_cache",
        DYLD_CHAINED_PTR_ARM64E_USERLAND24 => "arm64e_userland24",
        _ => "unknown",
    }
}

/// Byte stride of one `next` unit, for the formats this crate walks.
pub fn stride(format: u16) -> Option<u64> {
    match format {
        DYLD_CHAINED_PTR_ARM64E | DYLD_CHAINED_PTR_ARM64E_USERLAND
        | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => Some(8),
        DYLD_CHAINED_PTR_64
        | DYLD_CHAINED_PTR_64_OFFSET
        | DYLD_CHAINED_PTR_32
        | DYLD_CHAINED_PTR_ARM64E_KERNEL
        | DYLD_CHAINED_PTR_ARM64E_FIRMWARE
        | DYLD_CHAINED_PTR_64_KERNEL_CACHE => Some(4),
        DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE => Some(1),
        _ => None,
    }
}

/// Width in bytes of a pointer slot.
pub fn slot_width(format: u16) -> usize {
    if format == DYLD_CHAINED_PTR_32 {
        4
    } else {
        8
    }
}

/// Pointer authentication parameters of an arm64e slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerAuth {
    pub key: u8,
    pub diversity: u16,
    pub addr_div: bool,
}

impl PointerAuth {
    pub fn key_name(&self) -> &'static str {
        match self.key {
            0 => "IA",
            1 => "IB",
            2 => "DA",
            _ => "DB",
        }
    }
}

/// A decoded pointer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainedPointer {
    /// `target` is absolute: high8 restored, image base added where the
    /// format stores offsets.
    Rebase {
        target: u64,
        auth: Option<PointerAuth>,
        /// Kernel cache level the target is relative to; 0 for every other
        /// format.
        cache_level: u8,
        next: u64,
    },
    Bind {
        ordinal: u32,
        addend: i64,
        auth: Option<PointerAuth>,
        next: u64,
    },
    /// 32-bit slot holding a non-pointer value.
    Value { value: u64, next: u64 },
}

impl ChainedPointer {
    /// Stride to the next slot in `next` units; 0 ends the chain.
    pub fn next(&self) -> u64 {
        match self {
            ChainedPointer::Rebase { next, .. }
            | ChainedPointer::Bind { next, .. }
            | ChainedPointer::Value { next, .. } => *next,
        }
    }
}

#[inline]
fn bits(raw: u64, shift: u32, width: u32) -> u64 {
    (raw >> shift) & ((1u64 << width) - 1)
}

fn sign_extend(value: u64, width: u32) -> i64 {
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

fn auth_fields(raw: u64) -> PointerAuth {
    PointerAuth {
        diversity: bits(raw, 32, 16) as u16,
        addr_div: bits(raw, 48, 1) != 0,
        key: bits(raw, 49, 2) as u8,
    }
}

/// Decode one raw slot value. `base` is the image's preferred load address;
/// `max_valid_pointer` comes from the segment's starts and only matters for
/// 32-bit chains.
///
/// # Errors
///
/// Returns [`Error::UnsupportedFormatVariant`] for formats this crate does
/// not decode.
pub fn decode(format: u16, raw: u64, base: u64, max_valid_pointer: u32) -> Result<ChainedPointer> {
    match format {
        DYLD_CHAINED_PTR_ARM64E
        | DYLD_CHAINED_PTR_ARM64E_KERNEL
        | DYLD_CHAINED_PTR_ARM64E_USERLAND
        | DYLD_CHAINED_PTR_ARM64E_FIRMWARE
        | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => Ok(decode_arm64e(format, raw, base)),
        DYLD_CHAINED_PTR_64_KERNEL_CACHE | DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE => {
            // targets are offsets from the cache level's base; only the
            // image's own base is known here
            Ok(ChainedPointer::Rebase {
                target: base.wrapping_add(bits(raw, 0, 30)),
                auth: (bits(raw, 63, 1) != 0).then(|| auth_fields(raw)),
                cache_level: bits(raw, 30, 2) as u8,
                next: bits(raw, 51, 12),
            })
        }
        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
            let next = bits(raw, 51, 12);
            if bits(raw, 63, 1) != 0 {
                Ok(ChainedPointer::Bind {
                    ordinal: bits(raw, 0, 24) as u32,
                    addend: bits(raw, 24, 8) as i64,
                    auth: None,
                    next,
                })
            } else {
                let mut target = bits(raw, 0, 36);
                if format == DYLD_CHAINED_PTR_64_OFFSET {
                    target = target.wrapping_add(base);
                }
                Ok(ChainedPointer::Rebase {
                    target: target | (bits(raw, 36, 8) << 56),
                    auth: None,
                    cache_level: 0,
                    next,
                })
            }
        }
        DYLD_CHAINED_PTR_32 => {
            let next = bits(raw, 26, 5);
            if bits(raw, 31, 1) != 0 {
                Ok(ChainedPointer::Bind {
                    ordinal: bits(raw, 0, 20) as u32,
                    addend: bits(raw, 20, 6) as i64,
                    auth: None,
                    next,
                })
            } else {
                let target = bits(raw, 0, 26);
                let max = u64::from(max_valid_pointer);
                if target > max {
                    let bias = (0x0400_0000 + max) / 2;
                    return Ok(ChainedPointer::Value {
                        value: target.wrapping_sub(bias) & 0xffff_ffff,
                        next,
                    });
                }
                Ok(ChainedPointer::Rebase {
                    target,
                    auth: None,
                    cache_level: 0,
                    next,
                })
            }
        }
        other => Err(Error::UnsupportedFormatVariant(format!(
            "chained pointer format {} ({})",
            other,
            pointer_format_name(other)
        ))),
    }
}

fn decode_arm64e(format: u16, raw: u64, base: u64) -> ChainedPointer {
    let next = bits(raw, 51, 11);
    let is_auth = bits(raw, 63, 1) != 0;
    let is_bind = bits(raw, 62, 1) != 0;
    let ordinal_width = if format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
        24
    } else {
        16
    };
    let auth = is_auth.then(|| auth_fields(raw));

    match (is_bind, is_auth) {
        (true, true) => ChainedPointer::Bind {
            ordinal: bits(raw, 0, ordinal_width) as u32,
            addend: 0,
            auth,
            next,
        },
        (true, false) => ChainedPointer::Bind {
            ordinal: bits(raw, 0, ordinal_width) as u32,
            addend: sign_extend(bits(raw, 32, 19), 19),
            auth: None,
            next,
        },
        (false, true) => ChainedPointer::Rebase {
            // auth rebase targets are always offsets from the base
            target: base.wrapping_add(bits(raw, 0, 32)),
            auth,
            cache_level: 0,
            next,
        },
        (false, false) => {
            let target = bits(raw, 0, 43);
            let target = match format {
                DYLD_CHAINED_PTR_ARM64E | DYLD_CHAINED_PTR_ARM64E_FIRMWARE => target,
                _ => base.wrapping_add(target),
            };
            ChainedPointer::Rebase {
                target: target | (bits(raw, 43, 8) << 56),
                auth: None,
                cache_level: 0,
                next,
            }
        }
    }
}
