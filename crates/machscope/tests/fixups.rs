//! Chained fixup walking through the analyzer.

mod common;

use common::*;
use machscope::{Analyzer, ChainedFixups, Error, FixupRecord, MachOImage};

const ARM64E_USERLAND: u16 = 9;
const NONE: u16 = 0xFFFF;

/// `__DATA` with pointer `values` written at segment offsets.
fn image(page_starts: &[u16], imports: &[(u8, &str)], values: &[(u64, u64)]) -> Vec<u8> {
    let mut got = vec![0u8; 0x2000];
    for &(off, value) in values {
        got[off as usize..off as usize + 8].copy_from_slice(&value.to_le_bytes());
    }
    ImageBuilder::arm64e()
        .data_section("__got", BASE + DATA_OFF, &got[..0x100])
        .data_section("__data", BASE + DATA_OFF + 0x100, &got[0x100..])
        .chained_fixups(&chained_fixups_blob(ARM64E_USERLAND, page_starts, imports))
        .build()
}

#[test]
fn test_binds_and_rebases() {
    let data = image(
        &[0, 0x10, NONE, NONE],
        &[(1, "_objc_msgSend"), (2, "_OBJC_CLASS_$_NSObject")],
        &[
            (0, userland_bind(0, 1)),
            (8, userland_bind(1, 0)),
            (0x1010, userland_rebase(0x1000, 0)),
        ],
    );
    let analysis = Analyzer::new().analyze(&data).unwrap();
    let report = analysis.fixups.present().unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(report.imports.len(), 2);
    assert_eq!(report.imports[1].library_ordinal, 2);

    let binds: Vec<_> = report.binds().collect();
    assert_eq!(binds.len(), 2);
    match binds[1] {
        FixupRecord::Bind { symbol, section, file_offset, .. } => {
            assert_eq!(symbol, "_OBJC_CLASS_$_NSObject");
            assert_eq!(section.as_deref(), Some("__DATA.__got"));
            assert_eq!(*file_offset, DATA_OFF + 8);
        }
        other => panic!("unexpected {:?}", other),
    }

    let rebase = report.rebases().next().unwrap();
    assert_eq!(rebase.vmaddr(), BASE + DATA_OFF + 0x1010);
    assert_eq!(rebase.section(), Some("__DATA.__data"));
    assert!(matches!(rebase, FixupRecord::Rebase { target, .. } if *target == BASE + 0x1000));

    // every attributed section contains its record
    for record in &report.records {
        let name = record.section().unwrap();
        let (seg, sect) = name.split_once('.').unwrap();
        assert!(analysis.image.section(seg, sect).unwrap().contains_vmaddr(record.vmaddr()));
    }
}

#[test]
fn test_single_entry_chain_terminates() {
    // next = 0 on the first entry ends the page
    let data = image(&[8, NONE, NONE, NONE], &[(1, "_a")], &[(8, userland_rebase(8, 0))]);
    let image = MachOImage::parse(&data).unwrap();
    let fixups = ChainedFixups::parse(&image).unwrap().unwrap();
    let records: Vec<_> = fixups.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(records.len(), 1);
}

#[test]
fn test_bad_page_does_not_stop_the_walk() {
    let data = image(
        &[0x1000, 0, NONE, 0],
        &[(1, "_a")],
        &[(0x1000, userland_bind(0, 0)), (0x3000, userland_rebase(0x10, 0))],
    );
    let analysis = Analyzer::new().analyze(&data).unwrap();
    let report = analysis.fixups.present().unwrap();
    assert_eq!(report.records.len(), 2);
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(
        report.errors[0],
        Error::MalformedFixupChain { segment: 1, page: 0, .. }
    ));
}

#[test]
fn test_chain_overrunning_its_page_is_scoped() {
    // the last slot of page 0 strides past the page end
    let data = image(
        &[0xff8, 0, NONE, NONE],
        &[(1, "_a")],
        &[(0xff8, userland_rebase(0x10, 1)), (0x1000, userland_bind(0, 0))],
    );
    let analysis = Analyzer::new().analyze(&data).unwrap();
    let report = analysis.fixups.present().unwrap();
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(
        report.errors[0],
        Error::MalformedFixupChain { segment: 1, page: 0, .. }
    ));

    let addrs: Vec<_> = report.records.iter().map(FixupRecord::vmaddr).collect();
    assert_eq!(addrs, [BASE + DATA_OFF + 0xff8, BASE + DATA_OFF + 0x1000]);
    assert!(matches!(&report.records[1], FixupRecord::Bind { symbol, .. } if symbol == "_a"));
}

#[test]
fn test_broken_header_is_whole_feature_error() {
    let mut data = image(&[0, NONE, NONE, NONE], &[], &[(0, userland_rebase(0, 0))]);
    let loc = MachOImage::parse(&data).unwrap().chained_fixups_location().unwrap();
    // starts_offset past the blob
    let at = loc.offset as usize + 4;
    data[at..at + 4].copy_from_slice(&0xffffu32.to_le_bytes());

    let analysis = Analyzer::new().analyze(&data).unwrap();
    assert!(matches!(
        analysis.fixups.error(),
        Some(Error::MalformedFixupChain { .. })
    ));
}

#[test]
fn test_image_without_fixups() {
    let data = ImageBuilder::arm64().build();
    let analysis = Analyzer::new().analyze(&data).unwrap();
    assert!(analysis.fixups.is_absent());
}
