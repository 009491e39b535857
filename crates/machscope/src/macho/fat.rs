//! Fat/universal container detection and architecture selection.
//!
//! A fat container starts with a big-endian header (`magic`, `nfat_arch`)
//! followed by one arch entry per slice. `FAT_MAGIC` uses 20-byte
//! `fat_arch` entries with 32-bit offsets, `FAT_MAGIC_64` uses 32-byte
//! `fat_arch_64` entries with 64-bit offsets.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ magic (4)  nfat_arch (4)     │
//! ├──────────────────────────────┤
//! │ cputype cpusubtype offset    │  × nfat_arch
//! │ size align [reserved]        │
//! ├──────────────────────────────┤
//! │ slice 0 ... slice n          │
//! └──────────────────────────────┘
//! ```

use super::constants::{cpu_subtype_name, cpu_type_name, FAT_MAGIC_64, MAX_FAT_ARCHES, SIZEOF_FAT_ARCH_64};
use crate::{Error, Result};
use goblin::mach::fat::{FatArch, FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER};
use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};
use scroll::{Pread, BE};

/// One architecture slice inside a fat container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchitectureSlice {
    /// CPU type
    pub cpu_type: u32,
    /// CPU subtype (capability bits included)
    pub cpu_subtype: u32,
    /// Offset of the slice in the container
    pub offset: u64,
    /// Size of the slice
    pub size: u64,
    /// Alignment as a power of two
    pub align: u32,
}

impl ArchitectureSlice {
    /// Canonical "cputype, subtype" name, e.g. `ARM64, ARM64E`.
    pub fn name(&self) -> String {
        format!(
            "{}, {}",
            cpu_type_name(self.cpu_type),
            cpu_subtype_name(self.cpu_type, self.cpu_subtype)
        )
    }

    /// Lower-case CPU name, e.g. `arm64`.
    pub fn short_name(&self) -> String {
        cpu_type_name(self.cpu_type).to_lowercase()
    }

    /// Byte range of this slice within the container.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

/// A parsed fat container.
#[derive(Debug, Clone)]
pub struct FatContainer {
    /// Fat magic (`FAT_MAGIC` or `FAT_MAGIC_64`)
    pub magic: u32,
    arches: Vec<ArchitectureSlice>,
}

/// Returns true if `data` starts with a fat magic.
pub fn is_fat(data: &[u8]) -> bool {
    matches!(data.pread_with::<u32>(0, BE), Ok(FAT_MAGIC) | Ok(FAT_MAGIC_64))
}

impl FatContainer {
    /// Parse the fat header and arch table.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFat`] if `data` is a thin Mach-O image
    /// - [`Error::UnsupportedFormatVariant`] if the magic is neither fat nor Mach-O
    /// - [`Error::MalformedFat`] if the table or a slice lies outside the
    ///   container, or two slices overlap
    pub fn parse(data: &[u8]) -> Result<Self> {
        let magic = data
            .pread_with::<u32>(0, BE)
            .map_err(|_| Error::MalformedFat("file too small for a magic".into()))?;

        let entry_size = match magic {
            FAT_MAGIC => SIZEOF_FAT_ARCH,
            FAT_MAGIC_64 => SIZEOF_FAT_ARCH_64,
            MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64 => return Err(Error::NotFat),
            other => {
                return Err(Error::UnsupportedFormatVariant(format!(
                    "unknown magic {:#010x}",
                    other
                )))
            }
        };

        let nfat_arch = data
            .pread_with::<u32>(4, BE)
            .map_err(|_| Error::MalformedFat("truncated fat header".into()))?;
        if nfat_arch == 0 || nfat_arch > MAX_FAT_ARCHES {
            return Err(Error::MalformedFat(format!("implausible arch count {}", nfat_arch)));
        }

        let table_end = SIZEOF_FAT_HEADER + nfat_arch as usize * entry_size;
        if table_end > data.len() {
            return Err(Error::MalformedFat(format!(
                "arch table ends at {:#x} beyond file size {:#x}",
                table_end,
                data.len()
            )));
        }

        let mut arches = Vec::with_capacity(nfat_arch as usize);
        for i in 0..nfat_arch as usize {
            let at = SIZEOF_FAT_HEADER + i * entry_size;
            let arch = if magic == FAT_MAGIC {
                let raw: FatArch = data
                    .pread_with(at, BE)
                    .map_err(|e| Error::MalformedFat(format!("arch {}: {}", i, e)))?;
                ArchitectureSlice {
                    cpu_type: raw.cputype,
                    cpu_subtype: raw.cpusubtype,
                    offset: raw.offset as u64,
                    size: raw.size as u64,
                    align: raw.align,
                }
            } else {
                read_fat_arch_64(data, at)
                    .map_err(|e| Error::MalformedFat(format!("arch {}: {}", i, e)))?
            };

            let end = arch
                .offset
                .checked_add(arch.size)
                .ok_or_else(|| Error::MalformedFat(format!("arch {} range overflows", i)))?;
            if arch.offset < table_end as u64 || end > data.len() as u64 {
                return Err(Error::MalformedFat(format!(
                    "arch {} range {:#x}..{:#x} outside container of {:#x} bytes",
                    i,
                    arch.offset,
                    end,
                    data.len()
                )));
            }
            arches.push(arch);
        }

        let mut sorted: Vec<&ArchitectureSlice> = arches.iter().collect();
        sorted.sort_by_key(|a| a.offset);
        for pair in sorted.windows(2) {
            if pair[0].offset + pair[0].size > pair[1].offset {
                return Err(Error::MalformedFat(format!(
                    "slices '{}' and '{}' overlap",
                    pair[0].name(),
                    pair[1].name()
                )));
            }
        }

        tracing::debug!(count = arches.len(), "parsed fat container");
        Ok(Self { magic, arches })
    }

    /// Architecture slices in table order.
    pub fn arches(&self) -> &[ArchitectureSlice] {
        &self.arches
    }

    /// Short names of every slice, in table order.
    pub fn short_names(&self) -> Vec<String> {
        self.arches.iter().map(|a| a.short_name()).collect()
    }

    /// Select a slice by a case-insensitive partial match against its
    /// canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArchNotFound`] listing every short name when nothing matches.
    pub fn select(&self, token: &str) -> Result<&ArchitectureSlice> {
        let needle = token.to_lowercase();
        self.arches
            .iter()
            .find(|a| a.name().to_lowercase().contains(&needle))
            .ok_or_else(|| Error::ArchNotFound {
                token: token.to_string(),
                available: self.short_names(),
            })
    }

    /// Select a slice through an external choice, e.g. an interactive prompt.
    ///
    /// The chooser receives every slice and returns the chosen index.
    pub fn select_with<F>(&self, chooser: F) -> Result<&ArchitectureSlice>
    where
        F: FnOnce(&[ArchitectureSlice]) -> usize,
    {
        let idx = chooser(&self.arches);
        self.arches.get(idx).ok_or_else(|| Error::ArchNotFound {
            token: format!("#{}", idx),
            available: self.short_names(),
        })
    }

    /// Bytes of a slice. Bounds were validated by [`FatContainer::parse`].
    pub fn slice_bytes<'a>(&self, data: &'a [u8], arch: &ArchitectureSlice) -> &'a [u8] {
        &data[arch.range()]
    }
}

fn read_fat_arch_64(data: &[u8], at: usize) -> std::result::Result<ArchitectureSlice, scroll::Error> {
    Ok(ArchitectureSlice {
        cpu_type: data.pread_with(at, BE)?,
        cpu_subtype: data.pread_with(at + 4, BE)?,
        offset: data.pread_with(at + 8, BE)?,
        size: data.pread_with(at + 16, BE)?,
        align: data.pread_with(at + 24, BE)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::mach::cputype::{CPU_TYPE_ARM64, CPU_TYPE_X86_64};

    fn fat_with(arches: &[(u32, u32, u32, u32)], total: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend(&FAT_MAGIC.to_be_bytes());
        buf.extend(&(arches.len() as u32).to_be_bytes());
        for &(cpu, sub, off, size) in arches {
            buf.extend(&cpu.to_be_bytes());
            buf.extend(&sub.to_be_bytes());
            buf.extend(&off.to_be_bytes());
            buf.extend(&size.to_be_bytes());
            buf.extend(&14u32.to_be_bytes());
        }
        buf.resize(total, 0);
        buf
    }

    #[test]
    fn test_thin_image_is_not_fat() {
        let data = MH_MAGIC_64.to_le_bytes();
        assert!(matches!(FatContainer::parse(&data), Err(Error::NotFat)));
        assert!(!is_fat(&data));
    }

    #[test]
    fn test_select_by_partial_token() {
        let data = fat_with(
            &[(CPU_TYPE_X86_64, 3, 0x4000, 0x1000), (CPU_TYPE_ARM64, 2, 0x8000, 0x1000)],
            0x9000,
        );
        let fat = FatContainer::parse(&data).unwrap();
        assert_eq!(fat.arches()[1].name(), "ARM64, ARM64E");

        let arm = fat.select("ARM64e").unwrap();
        assert_eq!(arm.offset, 0x8000);
        assert_eq!(fat.slice_bytes(&data, arm).len(), 0x1000);
    }

    #[test]
    fn test_unmatched_token_lists_short_names() {
        let data = fat_with(
            &[(CPU_TYPE_X86_64, 3, 0x4000, 0x1000), (CPU_TYPE_ARM64, 0, 0x8000, 0x1000)],
            0x9000,
        );
        let fat = FatContainer::parse(&data).unwrap();
        match fat.select("ppc") {
            Err(Error::ArchNotFound { available, .. }) => {
                assert_eq!(available, vec!["x86_64".to_string(), "arm64".to_string()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_slice_past_end_rejected() {
        let data = fat_with(&[(CPU_TYPE_ARM64, 0, 0x4000, 0x2000)], 0x5000);
        assert!(matches!(FatContainer::parse(&data), Err(Error::MalformedFat(_))));
    }

    #[test]
    fn test_overlapping_slices_rejected() {
        let data = fat_with(
            &[(CPU_TYPE_X86_64, 3, 0x4000, 0x2000), (CPU_TYPE_ARM64, 0, 0x5000, 0x1000)],
            0x8000,
        );
        assert!(matches!(FatContainer::parse(&data), Err(Error::MalformedFat(_))));
    }

    #[test]
    fn test_chooser_out_of_range() {
        let data = fat_with(&[(CPU_TYPE_ARM64, 0, 0x4000, 0x1000)], 0x5000);
        let fat = FatContainer::parse(&data).unwrap();
        assert!(fat.select_with(|_| 0).is_ok());
        assert!(matches!(fat.select_with(|_| 3), Err(Error::ArchNotFound { .. })));
    }
}
