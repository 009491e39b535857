//! Objective-C metadata reconstruction over synthetic images.

mod common;

use common::*;
use machscope::fixups::PointerDecoder;
use machscope::{Analyzer, Error, MachOImage, ObjCMetadata};

const METHNAME: u64 = BASE + 0x2000;
const CLASSNAME: u64 = BASE + 0x2100;
const METHTYPE: u64 = BASE + 0x2200;

const CLASSLIST: u64 = BASE + DATA_OFF;
const CLASS: u64 = BASE + DATA_OFF + 0x100;
const METACLASS: u64 = CLASS + 0x28;
const CONST: u64 = BASE + DATA_OFF + 0x200;
const RO: u64 = CONST;
const META_RO: u64 = CONST + 0x80;
const METHODS: u64 = CONST + 0x100;
const META_METHODS: u64 = CONST + 0x140;
const SELREFS: u64 = BASE + DATA_OFF + 0x400;
const IMAGEINFO: u64 = BASE + DATA_OFF + 0x500;

/// `__DATA` content: plain words plus pointer slots that are written
/// either as raw addresses or as one arm64e rebase chain.
#[derive(Default)]
struct Data {
    words: Vec<(u64, Vec<u8>)>,
    pointers: Vec<(u64, u64)>,
}

impl Data {
    fn put(&mut self, vmaddr: u64, bytes: Vec<u8>) {
        self.words.push((vmaddr, bytes));
    }

    /// Pointer slot at `vmaddr`; nil targets are skipped.
    fn ptr(&mut self, vmaddr: u64, target: u64) {
        if target != 0 {
            self.pointers.push((vmaddr, target));
        }
    }

    fn render(&self, chained: bool) -> Vec<u8> {
        let mut out = vec![0u8; DATA_SIZE as usize];
        let at = |vmaddr: u64| (vmaddr - BASE - DATA_OFF) as usize;
        for (vmaddr, bytes) in &self.words {
            out[at(*vmaddr)..at(*vmaddr) + bytes.len()].copy_from_slice(bytes);
        }
        let mut pointers = self.pointers.clone();
        pointers.sort();
        for (i, &(slot, target)) in pointers.iter().enumerate() {
            let value = if chained {
                let next = pointers.get(i + 1).map_or(0, |&(n, _)| (n - slot) / 8);
                userland_rebase(target - BASE, next)
            } else {
                target
            };
            out[at(slot)..at(slot) + 8].copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

/// `class_ro_t` at `ro` with a name and method list.
fn class_ro(data: &mut Data, ro: u64, flags: u32, methods: u64) {
    data.put(ro, le32(&[flags, 8, 16, 0]));
    data.ptr(ro + 24, CLASSNAME);
    data.ptr(ro + 32, methods);
}

/// One-entry pointer-based method list.
fn method_list(data: &mut Data, list: u64, name: u64, imp: u64) {
    data.put(list, le32(&[24, 1]));
    data.ptr(list + 8, name);
    data.ptr(list + 16, METHTYPE);
    data.ptr(list + 24, imp);
}

/// One `Widget` class with an instance and a class method, listed by
/// `classlist`, plus a selector reference and image info.
fn widget(classlist: &[u64]) -> Data {
    let mut data = Data::default();
    for (i, &class) in classlist.iter().enumerate() {
        data.ptr(CLASSLIST + 8 * i as u64, class);
    }
    // class_t: isa, superclass, cache, vtable, data
    data.ptr(CLASS, METACLASS);
    data.ptr(CLASS + 32, RO);
    data.ptr(METACLASS + 32, META_RO);
    class_ro(&mut data, RO, 0, METHODS);
    class_ro(&mut data, META_RO, 1, META_METHODS);
    method_list(&mut data, METHODS, METHNAME, BASE + 0x1000);
    method_list(&mut data, META_METHODS, METHNAME + 5, BASE + 0x1010);
    data.ptr(SELREFS, METHNAME + 9);
    data.put(IMAGEINFO, le32(&[0, 0x40 | (5 << 8)]));
    data
}

fn objc_image(builder: ImageBuilder, data: &Data, classes: usize, chained: bool) -> Vec<u8> {
    let bytes = data.render(chained);
    let range = |from: u64, len: u64| &bytes[(from - BASE - DATA_OFF) as usize..][..len as usize];
    builder
        .text_section("__objc_methname", METHNAME, b"init\0new\0description\0")
        .text_section("__objc_classname", CLASSNAME, b"Widget\0")
        .text_section("__objc_methtype", METHTYPE, b"@16@0:8\0")
        .data_section("__objc_classlist", CLASSLIST, range(CLASSLIST, 8 * classes as u64))
        .data_section("__objc_data", CLASS, range(CLASS, 0x50))
        .data_section("__objc_const", CONST, range(CONST, 0x160))
        .data_section("__objc_selrefs", SELREFS, range(SELREFS, 8))
        .data_section("__objc_imageinfo", IMAGEINFO, range(IMAGEINFO, 8))
        .build()
}

fn plain_image(classlist: &[u64]) -> Vec<u8> {
    objc_image(ImageBuilder::arm64(), &widget(classlist), classlist.len(), false)
}

fn parse(data: &[u8]) -> ObjCMetadata {
    let image = MachOImage::parse(data).unwrap();
    ObjCMetadata::parse(&image, &PointerDecoder::plain()).unwrap().unwrap()
}

#[test]
fn test_reconstruct_class() {
    let meta = parse(&plain_image(&[CLASS]));
    assert!(meta.skipped.is_empty(), "{:?}", meta.skipped);
    assert_eq!(meta.classes.len(), 1);

    let widget = meta.class("Widget").unwrap();
    assert_eq!(widget.vmaddr, CLASS);
    assert_eq!(widget.file_offset, CLASS - BASE);
    assert_eq!(widget.superclass, None);
    assert_eq!(widget.instance_start, 8);
    assert_eq!(widget.instance_size, 16);
    assert!(!widget.is_swift);
    assert!(!widget.non_lazy);

    assert_eq!(widget.instance_methods.len(), 1);
    assert_eq!(widget.instance_methods[0].name, "init");
    assert_eq!(widget.instance_methods[0].types, "@16@0:8");
    assert_eq!(widget.instance_methods[0].imp, BASE + 0x1000);
    assert_eq!(widget.class_methods.len(), 1);
    assert_eq!(widget.class_methods[0].name, "new");
    assert_eq!(widget.class_methods[0].imp, BASE + 0x1010);
}

#[test]
fn test_selectors_method_names_and_image_info() {
    let meta = parse(&plain_image(&[CLASS]));
    assert_eq!(meta.selector_refs.len(), 1);
    assert_eq!(meta.selector_refs[0].name, "description");
    assert_eq!(meta.selector_refs[0].file_offset, SELREFS - BASE);

    let names: Vec<_> = meta.method_names.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["init", "new", "description"]);
    assert_eq!(meta.method_names[1].vmaddr, METHNAME + 5);

    let info = meta.image_info.unwrap();
    assert_eq!(info.swift_version, 5);
    assert_eq!(info.flag_names(), vec!["HasCategoryClassProperties"]);
}

#[test]
fn test_bad_class_pointer_is_skipped() {
    let meta = parse(&plain_image(&[CLASS, 0xdead_0000_0000]));
    assert_eq!(meta.classes.len(), 1);
    assert_eq!(meta.skipped.len(), 1);

    let skipped = &meta.skipped[0];
    assert_eq!(skipped.section, "__objc_classlist");
    assert_eq!(skipped.index, 1);
    assert_eq!(skipped.vmaddr, CLASSLIST + 8);
}

#[test]
fn test_method_list_past_segment_is_skipped() {
    let mut data = plain_image(&[CLASS]);
    // claim 0x10000 methods
    let count_at = (METHODS - BASE + 4) as usize;
    data[count_at..count_at + 4].copy_from_slice(&0x10000u32.to_le_bytes());
    let meta = parse(&data);
    assert!(meta.classes.is_empty());
    assert_eq!(meta.skipped.len(), 1);
}

#[test]
fn test_relative_method_list() {
    let mut data = widget(&[CLASS]);
    data.pointers.retain(|&(slot, _)| !(METHODS..METHODS + 0x20).contains(&slot));
    // i32 offset from the field to its target
    let rel = |field: u64, target: u64| target.wrapping_sub(field) as u32;
    let first = METHODS + 8;
    let second = first + 12;
    data.put(
        METHODS,
        le32(&[
            0x8000_0000 | 0x4000_0000 | 12,
            2,
            rel(first, METHNAME),
            rel(first + 4, METHTYPE),
            rel(first + 8, BASE + 0x1000),
            rel(second, METHNAME + 9),
            rel(second + 4, METHTYPE),
            0,
        ]),
    );

    let meta = parse(&objc_image(ImageBuilder::arm64(), &data, 1, false));
    assert!(meta.skipped.is_empty(), "{:?}", meta.skipped);
    let methods = &meta.class("Widget").unwrap().instance_methods;
    assert_eq!(methods.len(), 2);
    assert_eq!(methods[0].name, "init");
    assert_eq!(methods[0].types, "@16@0:8");
    assert_eq!(methods[0].imp, BASE + 0x1000);
    assert_eq!(methods[1].name, "description");
    // zero offset: no implementation
    assert_eq!(methods[1].imp, 0);
}

#[test]
fn test_no_objc_sections() {
    let data = ImageBuilder::arm64().build();
    let image = MachOImage::parse(&data).unwrap();
    assert!(ObjCMetadata::parse(&image, &PointerDecoder::plain()).unwrap().is_none());
}

#[test]
fn test_section_outside_image_is_whole_feature_error() {
    let mut data = plain_image(&[CLASS]);
    // keep only the start of __DATA
    data.truncate((DATA_OFF + 0x100) as usize);
    // the header may already reject the truncated segments
    if let Ok(image) = MachOImage::parse(&data) {
        let err = ObjCMetadata::parse(&image, &PointerDecoder::plain()).unwrap_err();
        assert!(matches!(err, Error::MalformedObjC(_)));
    }
}

#[test]
fn test_objc_through_chained_fixups() {
    let data = widget(&[CLASS]);
    let fixups = chained_fixups_blob(9, &[0, 0xFFFF, 0xFFFF, 0xFFFF], &[]);
    let image = objc_image(ImageBuilder::arm64e().chained_fixups(&fixups), &data, 1, true);

    let analysis = Analyzer::new().analyze(&image).unwrap();
    let meta = analysis.objc.present().unwrap();
    assert!(meta.skipped.is_empty(), "{:?}", meta.skipped);
    let widget = meta.class("Widget").unwrap();
    assert_eq!(widget.superclass, None);
    assert_eq!(widget.instance_methods[0].imp, BASE + 0x1000);
    assert_eq!(widget.class_methods[0].name, "new");
    assert_eq!(meta.selector_refs[0].name, "description");

    let report = analysis.fixups.present().unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.rebases().count(), data.pointers.len());
    assert_eq!(report.records[0].vmaddr(), CLASSLIST);
    assert_eq!(report.records[0].section(), Some("__DATA.__objc_classlist"));
}
