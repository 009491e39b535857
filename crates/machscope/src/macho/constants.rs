//! Mach-O constants not covered by goblin, plus naming tables.
//!
//! Magic numbers, load command identifiers and CPU types come from
//! [`goblin::mach`]; this module adds the fat-64 magic, CPU subtypes,
//! header flag names and the special dylib ordinals.

use goblin::mach::cputype::{
    CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_POWERPC, CPU_TYPE_POWERPC64,
    CPU_TYPE_X86, CPU_TYPE_X86_64,
};

// =============================================================================
// Fat containers
// =============================================================================

/// Fat header magic with 64-bit `fat_arch_64` entries.
pub const FAT_MAGIC_64: u32 = 0xcafe_babf;

/// Size of a `fat_arch_64` entry in bytes.
pub const SIZEOF_FAT_ARCH_64: usize = 32;

/// Upper bound on fat arch entries accepted before the table is considered bogus.
pub const MAX_FAT_ARCHES: u32 = 64;

// =============================================================================
// CPU subtypes
// =============================================================================

/// Mask for the capability bits in the high byte of a CPU subtype.
pub const CPU_SUBTYPE_MASK: u32 = 0xff00_0000;

pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
pub const CPU_SUBTYPE_ARM64_V8: u32 = 1;
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

pub const CPU_SUBTYPE_ARM_ALL: u32 = 0;
pub const CPU_SUBTYPE_ARM_V6: u32 = 6;
pub const CPU_SUBTYPE_ARM_V7: u32 = 9;
pub const CPU_SUBTYPE_ARM_V7S: u32 = 11;
pub const CPU_SUBTYPE_ARM_V7K: u32 = 12;

pub const CPU_SUBTYPE_X86_ALL: u32 = 3;
pub const CPU_SUBTYPE_X86_64_H: u32 = 8;

/// Canonical upper-case name of a CPU type.
pub fn cpu_type_name(cpu_type: u32) -> &'static str {
    match cpu_type {
        CPU_TYPE_ARM64 => "ARM64",
        CPU_TYPE_ARM64_32 => "ARM64_32",
        CPU_TYPE_ARM => "ARM",
        CPU_TYPE_X86_64 => "X86_64",
        CPU_TYPE_X86 => "I386",
        CPU_TYPE_POWERPC => "POWERPC",
        CPU_TYPE_POWERPC64 => "POWERPC64",
        _ => "UNKNOWN",
    }
}

/// Canonical upper-case name of a CPU subtype for the given CPU type.
pub fn cpu_subtype_name(cpu_type: u32, cpu_subtype: u32) -> String {
    let sub = cpu_subtype & !CPU_SUBTYPE_MASK;
    let name = match (cpu_type, sub) {
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL) => "ARM64",
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_V8) => "ARM64_V8",
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E) => "ARM64E",
        (CPU_TYPE_ARM64_32, _) => "ARM64_32_V8",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_ALL) => "ARM",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6) => "ARMV6",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7) => "ARMV7",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7S) => "ARMV7S",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7K) => "ARMV7K",
        (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_ALL) => "X86_64",
        (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H) => "X86_64H",
        (CPU_TYPE_X86, CPU_SUBTYPE_X86_ALL) => "I386",
        _ => return format!("{:#x}", sub),
    };
    name.to_string()
}

// =============================================================================
// Header flags
// =============================================================================

/// Mach header flag bits and their names, in bit order.
pub const MH_FLAG_NAMES: &[(u32, &str)] = &[
    (0x1, "NoUndefs"),
    (0x2, "IncrLink"),
    (0x4, "DyldLink"),
    (0x8, "BindAtLoad"),
    (0x10, "Prebound"),
    (0x20, "SplitSegs"),
    (0x40, "LazyInit"),
    (0x80, "TwoLevel"),
    (0x100, "ForceFlat"),
    (0x200, "NoMultiDefs"),
    (0x400, "NoFixPrebinding"),
    (0x800, "Prebindable"),
    (0x1000, "AllModsBound"),
    (0x2000, "SubsectionsViaSymbols"),
    (0x4000, "Canonical"),
    (0x8000, "WeakDefines"),
    (0x10000, "BindsToWeak"),
    (0x20000, "AllowStackExecution"),
    (0x40000, "RootSafe"),
    (0x80000, "SetuidSafe"),
    (0x100000, "NoReexportedDylibs"),
    (0x200000, "PIE"),
    (0x400000, "DeadStrippableDylib"),
    (0x800000, "HasTLVDescriptors"),
    (0x1000000, "NoHeapExecution"),
    (0x2000000, "AppExtensionSafe"),
    (0x4000000, "NlistOutofsyncWithDyldinfo"),
    (0x8000000, "SimSupport"),
    (0x80000000, "DylibInCache"),
];

/// Names of every flag set in a header `flags` word.
pub fn header_flag_names(flags: u32) -> Vec<&'static str> {
    MH_FLAG_NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

// =============================================================================
// Dylib ordinals
// =============================================================================

pub const BIND_SPECIAL_DYLIB_SELF: i32 = 0;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i32 = -1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i32 = -2;
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i32 = -3;

// =============================================================================
// Build platforms
// =============================================================================

/// Name of an `LC_BUILD_VERSION` platform.
pub fn platform_name(platform: u32) -> &'static str {
    match platform {
        1 => "macOS",
        2 => "iOS",
        3 => "tvOS",
        4 => "watchOS",
        5 => "bridgeOS",
        6 => "macCatalyst",
        7 => "iOSSimulator",
        8 => "tvOSSimulator",
        9 => "watchOSSimulator",
        10 => "DriverKit",
        11 => "visionOS",
        12 => "visionOSSimulator",
        13 => "firmware",
        14 => "sepOS",
        _ => "unknown",
    }
}

/// Name of an `LC_BUILD_VERSION` tool entry.
pub fn build_tool_name(tool: u32) -> &'static str {
    match tool {
        1 => "clang",
        2 => "swift",
        3 => "ld",
        4 => "lld",
        1024 => "metal",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm64e_subtype_ignores_capability_bits() {
        assert_eq!(cpu_subtype_name(CPU_TYPE_ARM64, 0x8000_0002), "ARM64E");
        assert_eq!(cpu_type_name(CPU_TYPE_ARM64), "ARM64");
    }

    #[test]
    fn test_unknown_subtype_is_hex() {
        assert_eq!(cpu_subtype_name(CPU_TYPE_ARM64, 7), "0x7");
    }

    #[test]
    fn test_header_flag_names() {
        assert_eq!(
            header_flag_names(0x0020_0085),
            vec!["NoUndefs", "DyldLink", "TwoLevel", "PIE"]
        );
    }
}
