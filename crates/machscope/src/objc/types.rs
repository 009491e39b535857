//! Reconstructed Objective-C metadata records.
//!
//! Records refer to each other by name only: a class names its superclass
//! and protocols, a category names the class it extends.

/// ObjC image info flags.
pub const OBJC_IMAGE_IS_REPLACEMENT: u32 = 1 << 0;
pub const OBJC_IMAGE_SUPPORTS_GC: u32 = 1 << 1;
pub const OBJC_IMAGE_REQUIRES_GC: u32 = 1 << 2;
pub const OBJC_IMAGE_OPTIMIZED_BY_DYLD: u32 = 1 << 3;
pub const OBJC_IMAGE_SIGNED_CLASS_RO: u32 = 1 << 4;
pub const OBJC_IMAGE_IS_SIMULATED: u32 = 1 << 5;
pub const OBJC_IMAGE_HAS_CATEGORY_CLASS_PROPERTIES: u32 = 1 << 6;

const IMAGE_INFO_FLAG_NAMES: &[(u32, &str)] = &[
    (OBJC_IMAGE_IS_REPLACEMENT, "IsReplacement"),
    (OBJC_IMAGE_SUPPORTS_GC, "SupportsGC"),
    (OBJC_IMAGE_REQUIRES_GC, "RequiresGC"),
    (OBJC_IMAGE_OPTIMIZED_BY_DYLD, "OptimizedByDyld"),
    (OBJC_IMAGE_SIGNED_CLASS_RO, "SignedClassRO"),
    (OBJC_IMAGE_IS_SIMULATED, "IsSimulated"),
    (OBJC_IMAGE_HAS_CATEGORY_CLASS_PROPERTIES, "HasCategoryClassProperties"),
];

/// Contents of `__objc_imageinfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjCImageInfo {
    pub version: u32,
    pub flags: u32,
    /// Swift ABI version packed in bits 8..16 of the flags; 0 for pure ObjC.
    pub swift_version: u8,
}

impl ObjCImageInfo {
    pub fn new(version: u32, flags: u32) -> Self {
        ObjCImageInfo {
            version,
            flags,
            swift_version: ((flags >> 8) & 0xff) as u8,
        }
    }

    pub fn flag_names(&self) -> Vec<&'static str> {
        IMAGE_INFO_FLAG_NAMES
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjCMethod {
    pub name: String,
    /// Type encoding, e.g. `v16@0:8`
    pub types: String,
    /// Implementation address; 0 when absent.
    pub imp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjCIvar {
    pub name: String,
    pub types: String,
    /// Byte offset within the instance, read through the ivar offset slot.
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjCProperty {
    pub name: String,
    /// Attribute string, e.g. `T@"NSString",C,N,V_name`
    pub attributes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjCProtocol {
    pub vmaddr: u64,
    pub file_offset: u64,
    pub name: String,
    /// Adopted protocols, by name.
    pub protocols: Vec<String>,
    pub instance_methods: Vec<ObjCMethod>,
    pub class_methods: Vec<ObjCMethod>,
    pub optional_instance_methods: Vec<ObjCMethod>,
    pub optional_class_methods: Vec<ObjCMethod>,
    pub properties: Vec<ObjCProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjCClass {
    pub vmaddr: u64,
    pub file_offset: u64,
    pub name: String,
    /// `None` for root classes or when the superclass cannot be named.
    pub superclass: Option<String>,
    /// `class_ro_t` flags
    pub flags: u32,
    pub instance_start: u32,
    pub instance_size: u32,
    pub is_swift: bool,
    /// Listed in `__objc_nlclslist` (has `+load`)
    pub non_lazy: bool,
    pub instance_methods: Vec<ObjCMethod>,
    /// From the metaclass.
    pub class_methods: Vec<ObjCMethod>,
    pub ivars: Vec<ObjCIvar>,
    pub properties: Vec<ObjCProperty>,
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjCCategory {
    pub vmaddr: u64,
    pub file_offset: u64,
    pub name: String,
    /// Extended class, by name.
    pub class_name: Option<String>,
    pub non_lazy: bool,
    pub instance_methods: Vec<ObjCMethod>,
    pub class_methods: Vec<ObjCMethod>,
    pub protocols: Vec<String>,
    pub properties: Vec<ObjCProperty>,
}

/// One `__objc_selrefs` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorReference {
    /// File offset of the slot; unique per image.
    pub file_offset: u64,
    /// Address of the selector string.
    pub vmaddr: u64,
    pub name: String,
}

/// One C string of `__objc_methname`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodName {
    pub vmaddr: u64,
    pub name: String,
}

/// A list entry that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// Section the entry was listed in, e.g. `__objc_classlist`
    pub section: String,
    pub index: usize,
    /// Address of the list slot.
    pub vmaddr: u64,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_info_swift_version() {
        let info = ObjCImageInfo::new(0, 0x0000_0740);
        assert_eq!(info.swift_version, 7);
        assert_eq!(info.flag_names(), vec!["HasCategoryClassProperties"]);
    }
}
