//! Apple code signing constants and magic numbers
//!
//! These constants describe the on-disk format of embedded code signatures:
//! blob magics, superblob slot numbers, CodeDirectory versions, hash types,
//! signature flags and requirement language opcodes.

// =============================================================================
// Blob Magic Numbers
// =============================================================================

/// SuperBlob containing all signature components (embedded signature)
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;

/// CodeDirectory blob magic
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;

/// Requirements blob magic
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;

/// Single requirement blob magic
pub const CSMAGIC_REQUIREMENT: u32 = 0xfade0c00;

/// Embedded entitlements (XML plist format)
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;

/// Embedded DER entitlements (ASN.1 DER format)
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;

/// CMS signature wrapper blob
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

/// Launch constraint blob
pub const CSMAGIC_EMBEDDED_LAUNCH_CONSTRAINT: u32 = 0xfade8181;

/// Size of a generic blob header (magic + length)
pub const BLOB_HEADER_SIZE: usize = 8;

// =============================================================================
// Slot Types (for SuperBlob index)
// =============================================================================

/// Main code directory slot
pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;

/// Info.plist slot
pub const CSSLOT_INFOSLOT: u32 = 0x0001;

/// Code requirements slot
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;

/// Resource directory (CodeResources) slot
pub const CSSLOT_RESOURCEDIR: u32 = 0x0003;

/// Application-specific slot
pub const CSSLOT_APPLICATION: u32 = 0x0004;

/// Entitlements slot (XML format)
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;

/// Rep-specific slot
pub const CSSLOT_REP_SPECIFIC: u32 = 0x0006;

/// DER entitlements slot
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;

/// Launch constraints (self)
pub const CSSLOT_LAUNCH_CONSTRAINT_SELF: u32 = 0x0008;

/// Launch constraints (parent)
pub const CSSLOT_LAUNCH_CONSTRAINT_PARENT: u32 = 0x0009;

/// Launch constraints (responsible)
pub const CSSLOT_LAUNCH_CONSTRAINT_RESPONSIBLE: u32 = 0x000a;

/// Library constraints
pub const CSSLOT_LIBRARY_CONSTRAINT: u32 = 0x000b;

/// Alternate code directories start (SHA-256, SHA-384, etc.)
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;

/// Maximum number of alternate code directories
pub const CSSLOT_ALTERNATE_CODEDIRECTORY_MAX: u32 = 5;

/// Limit for alternate code directory slots
pub const CSSLOT_ALTERNATE_CODEDIRECTORY_LIMIT: u32 =
    CSSLOT_ALTERNATE_CODEDIRECTORIES + CSSLOT_ALTERNATE_CODEDIRECTORY_MAX;

/// CMS signature slot
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

/// Ticket/notarization slot
pub const CSSLOT_TICKETSLOT: u32 = 0x10001;

/// Whether a superblob slot holds a CodeDirectory.
pub fn is_code_directory_slot(slot: u32) -> bool {
    slot == CSSLOT_CODEDIRECTORY
        || (CSSLOT_ALTERNATE_CODEDIRECTORIES..CSSLOT_ALTERNATE_CODEDIRECTORY_LIMIT).contains(&slot)
}

/// Human-readable superblob slot name.
pub fn slot_name(slot: u32) -> &'static str {
    match slot {
        CSSLOT_CODEDIRECTORY => "CodeDirectory",
        CSSLOT_INFOSLOT => "Info.plist",
        CSSLOT_REQUIREMENTS => "Requirements",
        CSSLOT_RESOURCEDIR => "CodeResources",
        CSSLOT_APPLICATION => "Application",
        CSSLOT_ENTITLEMENTS => "Entitlements",
        CSSLOT_REP_SPECIFIC => "RepSpecific",
        CSSLOT_DER_ENTITLEMENTS => "DER Entitlements",
        CSSLOT_LAUNCH_CONSTRAINT_SELF => "Launch Constraint (self)",
        CSSLOT_LAUNCH_CONSTRAINT_PARENT => "Launch Constraint (parent)",
        CSSLOT_LAUNCH_CONSTRAINT_RESPONSIBLE => "Launch Constraint (responsible)",
        CSSLOT_LIBRARY_CONSTRAINT => "Library Constraint",
        CSSLOT_SIGNATURESLOT => "CMS Signature",
        CSSLOT_TICKETSLOT => "Ticket",
        s if is_code_directory_slot(s) => "Alternate CodeDirectory",
        _ => "Unknown",
    }
}

/// Blob magic a slot must carry, where the slot fixes it.
pub fn expected_magic(slot: u32) -> Option<u32> {
    match slot {
        CSSLOT_REQUIREMENTS => Some(CSMAGIC_REQUIREMENTS),
        CSSLOT_ENTITLEMENTS => Some(CSMAGIC_EMBEDDED_ENTITLEMENTS),
        CSSLOT_DER_ENTITLEMENTS => Some(CSMAGIC_EMBEDDED_DER_ENTITLEMENTS),
        CSSLOT_SIGNATURESLOT => Some(CSMAGIC_BLOBWRAPPER),
        CSSLOT_LAUNCH_CONSTRAINT_SELF
        | CSSLOT_LAUNCH_CONSTRAINT_PARENT
        | CSSLOT_LAUNCH_CONSTRAINT_RESPONSIBLE
        | CSSLOT_LIBRARY_CONSTRAINT => Some(CSMAGIC_EMBEDDED_LAUNCH_CONSTRAINT),
        s if is_code_directory_slot(s) => Some(CSMAGIC_CODEDIRECTORY),
        _ => None,
    }
}

// =============================================================================
// Special Slot Indices (negative, for CodeDirectory)
// =============================================================================

/// Name of a negative CodeDirectory special slot.
pub fn special_slot_name(index: i64) -> &'static str {
    match index {
        -1 => "Info.plist",
        -2 => "Requirements",
        -3 => "CodeResources",
        -4 => "Application",
        -5 => "Entitlements",
        -6 => "RepSpecific",
        -7 => "DER Entitlements",
        -8 => "Launch Constraint (self)",
        -9 => "Launch Constraint (parent)",
        -10 => "Launch Constraint (responsible)",
        -11 => "Library Constraint",
        _ => "Unknown",
    }
}

// =============================================================================
// Hash Types
// =============================================================================

/// No hash (placeholder)
pub const CS_HASHTYPE_NOHASH: u8 = 0;

/// SHA-1 hash (160-bit / 20 bytes)
pub const CS_HASHTYPE_SHA1: u8 = 1;

/// SHA-256 hash (256-bit / 32 bytes)
pub const CS_HASHTYPE_SHA256: u8 = 2;

/// SHA-256 truncated to 20 bytes (legacy compatibility)
pub const CS_HASHTYPE_SHA256_TRUNCATED: u8 = 3;

/// SHA-384 hash (384-bit / 48 bytes)
pub const CS_HASHTYPE_SHA384: u8 = 4;

/// SHA-1 hash size in bytes
pub const CS_SHA1_LEN: usize = 20;

/// SHA-256 hash size in bytes
pub const CS_SHA256_LEN: usize = 32;

/// SHA-384 hash size in bytes
pub const CS_SHA384_LEN: usize = 48;

/// Length of a truncated CDHash as used by the kernel and in requirements
pub const CS_CDHASH_LEN: usize = 20;

// =============================================================================
// Code Signature Flags
// =============================================================================

pub const CS_VALID: u32 = 0x0000_0001;
pub const CS_ADHOC: u32 = 0x0000_0002;
pub const CS_GET_TASK_ALLOW: u32 = 0x0000_0004;
pub const CS_INSTALLER: u32 = 0x0000_0008;
pub const CS_FORCED_LV: u32 = 0x0000_0010;
pub const CS_INVALID_ALLOWED: u32 = 0x0000_0020;
pub const CS_HARD: u32 = 0x0000_0100;
pub const CS_KILL: u32 = 0x0000_0200;
pub const CS_CHECK_EXPIRATION: u32 = 0x0000_0400;
pub const CS_RESTRICT: u32 = 0x0000_0800;
pub const CS_ENFORCEMENT: u32 = 0x0000_1000;
pub const CS_REQUIRE_LV: u32 = 0x0000_2000;
pub const CS_ENTITLEMENTS_VALIDATED: u32 = 0x0000_4000;
pub const CS_NVRAM_UNRESTRICTED: u32 = 0x0000_8000;
pub const CS_RUNTIME: u32 = 0x0001_0000;
pub const CS_LINKER_SIGNED: u32 = 0x0002_0000;

const CS_FLAG_NAMES: &[(u32, &str)] = &[
    (CS_VALID, "valid"),
    (CS_ADHOC, "adhoc"),
    (CS_GET_TASK_ALLOW, "get-task-allow"),
    (CS_INSTALLER, "installer"),
    (CS_FORCED_LV, "forced-library-validation"),
    (CS_INVALID_ALLOWED, "invalid-allowed"),
    (CS_HARD, "hard"),
    (CS_KILL, "kill"),
    (CS_CHECK_EXPIRATION, "check-expiration"),
    (CS_RESTRICT, "restrict"),
    (CS_ENFORCEMENT, "enforcement"),
    (CS_REQUIRE_LV, "library-validation"),
    (CS_ENTITLEMENTS_VALIDATED, "entitlements-validated"),
    (CS_NVRAM_UNRESTRICTED, "nvram-unrestricted"),
    (CS_RUNTIME, "runtime"),
    (CS_LINKER_SIGNED, "linker-signed"),
];

/// Names of the CodeDirectory flags that are set.
pub fn cs_flag_names(flags: u32) -> Vec<&'static str> {
    CS_FLAG_NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

// =============================================================================
// Exec Segment Flags
// =============================================================================

pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x0001;
pub const CS_EXECSEG_ALLOW_UNSIGNED: u64 = 0x0010;
pub const CS_EXECSEG_DEBUGGER: u64 = 0x0020;
pub const CS_EXECSEG_JIT: u64 = 0x0040;
pub const CS_EXECSEG_SKIP_LV: u64 = 0x0080;
pub const CS_EXECSEG_CAN_LOAD_CDHASH: u64 = 0x0100;
pub const CS_EXECSEG_CAN_EXEC_CDHASH: u64 = 0x0200;

const EXECSEG_FLAG_NAMES: &[(u64, &str)] = &[
    (CS_EXECSEG_MAIN_BINARY, "main-binary"),
    (CS_EXECSEG_ALLOW_UNSIGNED, "allow-unsigned"),
    (CS_EXECSEG_DEBUGGER, "debugger"),
    (CS_EXECSEG_JIT, "jit"),
    (CS_EXECSEG_SKIP_LV, "skip-library-validation"),
    (CS_EXECSEG_CAN_LOAD_CDHASH, "can-load-cdhash"),
    (CS_EXECSEG_CAN_EXEC_CDHASH, "can-exec-cdhash"),
];

/// Names of the exec segment flags that are set.
pub fn exec_seg_flag_names(flags: u64) -> Vec<&'static str> {
    EXECSEG_FLAG_NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

// =============================================================================
// CodeDirectory Version
// =============================================================================

/// Earliest supported CodeDirectory version
pub const CODEDIRECTORY_VERSION_EARLIEST: u32 = 0x20001;

/// Version with scatter support
pub const CODEDIRECTORY_VERSION_SCATTER: u32 = 0x20100;

/// Version with team ID support
pub const CODEDIRECTORY_VERSION_TEAMID: u32 = 0x20200;

/// Version with code limit 64 support
pub const CODEDIRECTORY_VERSION_CODELIMIT64: u32 = 0x20300;

/// Version with exec segment support
pub const CODEDIRECTORY_VERSION_EXECSEG: u32 = 0x20400;

/// Version with runtime version and pre-encrypt hashes
pub const CODEDIRECTORY_VERSION_RUNTIME: u32 = 0x20500;

/// Version with linkage hashes
pub const CODEDIRECTORY_VERSION_LINKAGE: u32 = 0x20600;

// =============================================================================
// Requirements Opcodes
// =============================================================================

pub const OP_FALSE: u32 = 0;
pub const OP_TRUE: u32 = 1;
pub const OP_IDENT: u32 = 2;
pub const OP_APPLE_ANCHOR: u32 = 3;
pub const OP_ANCHOR_HASH: u32 = 4;
pub const OP_INFO_KEY_VALUE: u32 = 5;
pub const OP_AND: u32 = 6;
pub const OP_OR: u32 = 7;
pub const OP_CDHASH: u32 = 8;
pub const OP_NOT: u32 = 9;
pub const OP_INFO_KEY_FIELD: u32 = 10;
pub const OP_CERT_FIELD: u32 = 11;
pub const OP_TRUSTED_CERT: u32 = 12;
pub const OP_TRUSTED_CERTS: u32 = 13;
pub const OP_CERT_GENERIC: u32 = 14;
pub const OP_APPLE_GENERIC_ANCHOR: u32 = 15;
pub const OP_ENTITLEMENT_FIELD: u32 = 16;
pub const OP_CERT_POLICY: u32 = 17;
pub const OP_NAMED_ANCHOR: u32 = 18;
pub const OP_NAMED_CODE: u32 = 19;
pub const OP_PLATFORM: u32 = 20;
pub const OP_NOTARIZED: u32 = 21;
pub const OP_CERT_FIELD_DATE: u32 = 22;
pub const OP_LEGACY_DEV_ID: u32 = 23;

/// Flag bit marking an opcode the evaluator may skip if unknown
pub const OP_FLAG_DEFAULT_FALSE: u32 = 0x8000_0000;

/// Flag bit marking an opcode whose operands carry a skip length
pub const OP_FLAG_SKIP: u32 = 0x4000_0000;

/// Mask selecting the opcode number
pub const OP_TYPE_MASK: u32 = 0x00ff_ffff;

// =============================================================================
// Requirements Types
// =============================================================================

pub const CSREQ_HOST: u32 = 0x0001;
pub const CSREQ_GUEST: u32 = 0x0002;
pub const CSREQ_DESIGNATED: u32 = 0x0003;
pub const CSREQ_LIBRARY: u32 = 0x0004;
pub const CSREQ_PLUGIN: u32 = 0x0005;

/// Name of a requirement type as used in requirement source text.
pub fn requirement_type_name(kind: u32) -> &'static str {
    match kind {
        CSREQ_HOST => "host",
        CSREQ_GUEST => "guest",
        CSREQ_DESIGNATED => "designated",
        CSREQ_LIBRARY => "library",
        CSREQ_PLUGIN => "plugin",
        _ => "unknown",
    }
}

// =============================================================================
// Match Operations (for requirements expressions)
// =============================================================================

pub const MATCH_EXISTS: u32 = 0;
pub const MATCH_EQUAL: u32 = 1;
pub const MATCH_CONTAINS: u32 = 2;
pub const MATCH_BEGINS_WITH: u32 = 3;
pub const MATCH_ENDS_WITH: u32 = 4;
pub const MATCH_LESS_THAN: u32 = 5;
pub const MATCH_GREATER_THAN: u32 = 6;
pub const MATCH_LESS_THAN_OR_EQUAL: u32 = 7;
pub const MATCH_GREATER_THAN_OR_EQUAL: u32 = 8;
pub const MATCH_ON: u32 = 9;
pub const MATCH_BEFORE: u32 = 10;
pub const MATCH_AFTER: u32 = 11;
pub const MATCH_ON_OR_BEFORE: u32 = 12;
pub const MATCH_ON_OR_AFTER: u32 = 13;
pub const MATCH_ABSENT: u32 = 14;
