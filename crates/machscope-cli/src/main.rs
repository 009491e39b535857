//! Command-line reporter for machscope.
//!
//! Decodes one Mach-O image (or one slice of a fat container) and prints
//! the requested views. With no view flags the load commands are listed.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use machscope::codesign::CodeSignature;
use machscope::macho::{LoadCommand, LoadCommandRecord, MachOImage};
use machscope::objc::{ObjCCategory, ObjCClass, ObjCMethod, ObjCProperty, ObjCProtocol};
use machscope::{Analysis, Analyzer, Feature, FixupRecord, FixupReport, MappedFile, ObjCMetadata};

#[derive(Parser)]
#[command(name = "machscope")]
#[command(about = "Parse a Mach-O file", version)]
struct Cli {
    /// Mach-O file or fat container
    input: PathBuf,

    /// Architecture to analyze in a fat file (e.g. arm64e, x86_64)
    #[arg(short, long, env = "MACHSCOPE_ARCH")]
    arch: Option<String>,

    /// Print the mach header
    #[arg(short = 'd', long)]
    header: bool,

    /// Print the load commands
    #[arg(short, long)]
    loads: bool,

    /// Print the code signature
    #[arg(short, long)]
    sig: bool,

    /// Print the entitlements
    #[arg(short, long)]
    ent: bool,

    /// Print ObjC info
    #[arg(short, long)]
    objc: bool,

    /// Print symbols
    #[arg(short = 'n', long)]
    symbols: bool,

    /// Print function starts
    #[arg(short = 'f', long)]
    starts: bool,

    /// Print fixup chains
    #[arg(short = 'x', long)]
    fixups: bool,

    /// Verbose output (debug logging, hash slots)
    #[arg(short = 'V', long)]
    verbose: bool,
}

impl Cli {
    fn views(&self) -> usize {
        [
            self.header,
            self.loads,
            self.sig,
            self.ent,
            self.objc,
            self.symbols,
            self.starts,
            self.fixups,
        ]
        .iter()
        .filter(|&&v| v)
        .count()
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "machscope=debug" } else { "machscope=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file = MappedFile::open(&cli.input)?;

    let mut analyzer = Analyzer::new()
        .signature(cli.sig || cli.ent)
        .objc(cli.objc)
        .fixups(cli.fixups)
        .function_starts(cli.starts)
        .symbols(cli.symbols);
    if let Some(arch) = &cli.arch {
        analyzer = analyzer.arch(arch);
    }

    let analysis = match analyzer.analyze(file.bytes()) {
        Ok(analysis) => analysis,
        Err(machscope::Error::ArchNotFound { token, available }) => {
            return Err(format!("--arch '{}' not found in: {}", token, available.join(", ")).into());
        }
        Err(e) => return Err(e.into()),
    };

    // A single view prints without its banner.
    let banners = cli.views() > 1;
    let banner = |title: &str| {
        if banners {
            println!("{}", title);
            println!("{}", "=".repeat(title.len()));
        }
    };

    if cli.header && !cli.loads {
        print_header(&analysis);
    }
    if cli.loads || cli.views() == 0 {
        print_header(&analysis);
        print_load_commands(&analysis.image);
    }
    if cli.sig {
        banner("Code Signature");
        print_signature(&analysis.signature, cli.verbose);
        println!();
    }
    if cli.ent {
        banner("Entitlements");
        print_entitlements(&analysis.signature);
    }
    if cli.objc {
        banner("Objective-C");
        print_objc(&analysis.objc);
        println!();
    }
    if cli.starts {
        banner("FUNCTION STARTS");
        match &analysis.function_starts {
            Feature::Present(starts) => {
                for addr in starts {
                    println!("0x{:016X}", addr);
                }
            }
            Feature::Absent => println!("  - no function starts"),
            Feature::Malformed(e) => println!("  - [{}] {}", e.tag(), e),
        }
    }
    if cli.symbols {
        banner("SYMBOLS");
        print_symbols(&analysis);
    }
    if cli.fixups {
        banner("FIXUPS");
        match &analysis.fixups {
            Feature::Present(report) => print_fixups(&analysis.image, report),
            Feature::Absent => println!("  - no fixups"),
            Feature::Malformed(e) => println!("  - [{}] {}", e.tag(), e),
        }
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn print_header(analysis: &Analysis<'_>) {
    let h = &analysis.image.header;
    if let Some(slice) = &analysis.slice {
        println!("Slice: {} (offset {:#x}, size {:#x})", slice.name(), slice.offset, slice.size);
    }
    println!(
        "Magic         = {}-bit MachO ({})",
        if h.is_64 { 64 } else { 32 },
        if h.little_endian { "little endian" } else { "big endian" }
    );
    println!(
        "Type          = {}\nCPU           = {:#x}, {:#x}\nCommands      = {} (Size: {})\nFlags         = {}",
        h.filetype_name(),
        h.cpu_type,
        h.cpu_subtype,
        h.ncmds,
        h.sizeofcmds,
        h.flag_names().join(", ")
    );
}

fn print_load_commands(image: &MachOImage<'_>) {
    for (i, record) in image.load_commands().iter().enumerate() {
        println!("{:03}: {:<28}{}", i, record.name(), describe(image, record));
        if let LoadCommand::Segment(index) = record.command {
            if let Some(segment) = image.segments().get(index) {
                for section in &segment.sections {
                    println!(
                        "        sz={:#010x} off={:#010x}-{:#010x} addr={:#011x}-{:#011x}\t\t{}.{}",
                        section.size,
                        section.offset,
                        u64::from(section.offset).wrapping_add(section.size),
                        section.addr,
                        section.addr.wrapping_add(section.size),
                        section.segment_name,
                        section.name
                    );
                }
            }
        }
    }
}

fn describe(image: &MachOImage<'_>, record: &LoadCommandRecord) -> String {
    match &record.command {
        LoadCommand::Segment(index) => match image.segments().get(*index) {
            Some(s) => format!(
                "sz={:#010x} off={:#010x}-{:#010x} addr={:#011x}-{:#011x} {}",
                s.filesize,
                s.fileoff,
                s.fileoff + s.filesize,
                s.vmaddr,
                s.vmaddr.wrapping_add(s.vmsize),
                s.name
            ),
            None => String::new(),
        },
        LoadCommand::Symtab(st) => format!(
            "Symbol table is at offset {:#x} ({}), {} nsyms",
            st.symoff, st.symoff, st.nsyms
        ),
        LoadCommand::Dysymtab(d) => format!(
            "{} local, {} external, {} undefined, {} indirect",
            d.nlocalsym, d.nextdefsym, d.nundefsym, d.nindirectsyms
        ),
        LoadCommand::CodeSignature(loc)
        | LoadCommand::FunctionStarts(loc)
        | LoadCommand::DataInCode(loc)
        | LoadCommand::ChainedFixups(loc)
        | LoadCommand::ExportsTrie(loc)
        | LoadCommand::SegmentSplitInfo(loc) => format!(
            "offset={:#010x}-{:#010x} size={:5}",
            loc.offset,
            u64::from(loc.offset) + u64::from(loc.size),
            loc.size
        ),
        LoadCommand::DyldInfo(info) => format!(
            "rebase={:#x} bind={:#x} lazy_bind={:#x} export={:#x}",
            info.rebase.size, info.bind.size, info.lazy_bind.size, info.export.size
        ),
        LoadCommand::BuildVersion(bv) => bv.to_string(),
        LoadCommand::VersionMin(vm) => format!("Version={}, SDK={}", vm.version, vm.sdk),
        LoadCommand::Uuid(uuid) => format_uuid(uuid),
        LoadCommand::Dylib(d) | LoadCommand::IdDylib(d) => {
            format!("{} ({})", d.name, d.current_version)
        }
        LoadCommand::Dylinker(path) | LoadCommand::Rpath(path) => path.clone(),
        LoadCommand::Main {
            entry_offset,
            stack_size,
        } => format!("Entry Point: {:#x}, Stack Size: {:#x}", entry_offset, stack_size),
        LoadCommand::SourceVersion(v) => format!("Version: {}", v),
        LoadCommand::EncryptionInfo { offset, size, id } => {
            format!("Offset: {:#x}, Size: {:#x} (CryptID: {:#x})", offset, size, id)
        }
        LoadCommand::Unknown { cmd } => format!("{:#x}", cmd),
    }
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let h = hex(uuid).to_uppercase();
    format!("{}-{}-{}-{}-{}", &h[..8], &h[8..12], &h[12..16], &h[16..20], &h[20..])
}

fn print_signature(signature: &Feature<CodeSignature>, verbose: bool) {
    let sig = match signature {
        Feature::Present(sig) => sig,
        Feature::Absent => {
            println!("  - no code signature data");
            return;
        }
        Feature::Malformed(e) => {
            println!("  - [{}] {}", e.tag(), e);
            return;
        }
    };

    for cd in &sig.code_directories {
        println!("Code Directory ({} bytes)", cd.raw().len());
        println!("\tVersion:     {:#x}", cd.version);
        println!("\tFlags:       {}", cd.flag_names().join(", "));
        println!("\tCodeLimit:   {:#x}", cd.code_limit);
        println!("\tIdentifier:  {}", cd.identifier);
        println!("\tTeamID:      {}", cd.team_id.as_deref().unwrap_or(""));
        println!("\tCDHash:      {} (computed)", hex(&cd.cdhash));
        println!(
            "\t# of hashes: {} code (page size {}) + {} special",
            cd.n_code_slots,
            cd.page_size().unwrap_or(0),
            cd.n_special_slots
        );
        println!(
            "\tHashes @{} size: {} Type: {}",
            cd.hash_offset,
            cd.hash_size,
            cd.hash_type_name()
        );
        if verbose {
            for slot in cd.special_slots().iter().chain(cd.code_slots()) {
                println!("\t\t{:>4}: {}", slot.index, hex(&slot.hash));
            }
        }
    }

    if let Some(reqs) = &sig.requirements {
        println!(
            "Requirement Set ({} bytes) with {} requirement",
            reqs.length,
            reqs.requirements.len()
        );
        for (i, req) in reqs.requirements.iter().enumerate() {
            println!(
                "\t{}: {} (@{}, {} bytes): {}",
                i,
                req.kind_name(),
                req.offset,
                req.length,
                req.detail
            );
        }
    }

    match &sig.cms {
        Some(cms) => {
            println!("CMS (RFC3852) signature:");
            for cert in &cms.certificates {
                let ou = cert
                    .issuer_organizational_unit
                    .as_deref()
                    .or(cert.issuer_organization.as_deref())
                    .unwrap_or("");
                println!(
                    "        OU: {} CN: {} ({} thru {})",
                    ou,
                    cert.subject_common_name.as_deref().unwrap_or(""),
                    cert.not_before.format("%Y-%m-%d"),
                    cert.not_after.format("%Y-%m-%d")
                );
            }
        }
        None if sig.has_signature_slot => println!("CMS (RFC3852) signature: empty (ad-hoc)"),
        None => {}
    }
}

fn print_entitlements(signature: &Feature<CodeSignature>) {
    let Feature::Present(sig) = signature else {
        println!("  - no entitlements");
        return;
    };
    if let Some(xml) = &sig.entitlements {
        println!("{}", String::from_utf8_lossy(xml));
        return;
    }
    match sig.der_entitlements_plist() {
        Ok(Some(value)) => {
            let mut out = Vec::new();
            match value.to_writer_xml(&mut out) {
                Ok(()) => println!("{}", String::from_utf8_lossy(&out)),
                Err(e) => println!("  - [PlistError] {}", e),
            }
        }
        Ok(None) => println!("  - no entitlements"),
        Err(e) => println!("  - [{}] {}", e.tag(), e),
    }
}

fn print_methods(sign: char, class: &str, methods: &[ObjCMethod]) {
    for m in methods {
        if m.imp != 0 {
            println!("0x{:011x}: {}[{} {}]", m.imp, sign, class, m.name);
        } else {
            println!("{}[{} {}]", sign, class, m.name);
        }
    }
}

fn print_properties(props: &[ObjCProperty]) {
    for p in props {
        println!("@property ({}) {};", p.attributes, p.name);
    }
}

fn adopted(protocols: &[String]) -> String {
    if protocols.is_empty() {
        String::new()
    } else {
        format!(" <{}>", protocols.join(", "))
    }
}

fn print_protocol(p: &ObjCProtocol) {
    println!("@protocol {}{}", p.name, adopted(&p.protocols));
    print_properties(&p.properties);
    print_methods('+', &p.name, &p.class_methods);
    print_methods('-', &p.name, &p.instance_methods);
    if !p.optional_class_methods.is_empty() || !p.optional_instance_methods.is_empty() {
        println!("@optional");
        print_methods('+', &p.name, &p.optional_class_methods);
        print_methods('-', &p.name, &p.optional_instance_methods);
    }
    println!("@end\n");
}

fn print_class(c: &ObjCClass) {
    let superclass = c
        .superclass
        .as_deref()
        .map(|s| format!(" : {}", s))
        .unwrap_or_default();
    println!(
        "0x{:011x} @interface {}{}{}{}",
        c.vmaddr,
        c.name,
        superclass,
        adopted(&c.protocols),
        if c.is_swift { " // swift" } else { "" }
    );
    if !c.ivars.is_empty() {
        println!("  {{");
        println!("    // instance size: {:#x}", c.instance_size);
        for ivar in &c.ivars {
            println!("    +{:#x} {} {}; // {:#x}", ivar.offset, ivar.types, ivar.name, ivar.size);
        }
        println!("  }}");
    }
    print_properties(&c.properties);
    print_methods('+', &c.name, &c.class_methods);
    print_methods('-', &c.name, &c.instance_methods);
    println!("@end\n");
}

fn print_category(c: &ObjCCategory) {
    println!(
        "0x{:011x} @interface {}({}){}",
        c.vmaddr,
        c.class_name.as_deref().unwrap_or("?"),
        c.name,
        adopted(&c.protocols)
    );
    let class = c.class_name.as_deref().unwrap_or(&c.name);
    print_properties(&c.properties);
    print_methods('+', class, &c.class_methods);
    print_methods('-', class, &c.instance_methods);
    println!("@end\n");
}

fn print_objc(objc: &Feature<ObjCMetadata>) {
    let meta = match objc {
        Feature::Present(meta) => meta,
        Feature::Absent => {
            println!("  - no objc");
            return;
        }
        Feature::Malformed(e) => {
            println!("  - [{}] {}", e.tag(), e);
            return;
        }
    };

    if let Some(info) = &meta.image_info {
        println!(
            "// image info: version {}, flags {}, swift {}",
            info.version,
            info.flag_names().join("|"),
            info.swift_version
        );
    }
    meta.protocols.iter().for_each(print_protocol);
    meta.classes.iter().for_each(print_class);
    meta.categories.iter().for_each(print_category);

    println!("@selectors refs");
    for sel in &meta.selector_refs {
        println!("0x{:011x} => 0x{:011x}: {}", sel.file_offset, sel.vmaddr, sel.name);
    }
    println!("\n@methods");
    for name in &meta.method_names {
        println!("0x{:011x}: {}", name.vmaddr, name.name);
    }
    for skipped in &meta.skipped {
        println!(
            "// skipped {}[{}] @ 0x{:011x}: {}",
            skipped.section, skipped.index, skipped.vmaddr, skipped.reason
        );
    }
}

fn print_symbols(analysis: &Analysis<'_>) {
    let symbols = match &analysis.symbols {
        Feature::Present(symbols) => symbols,
        Feature::Absent => {
            println!("  - no symbol table");
            return;
        }
        Feature::Malformed(e) => {
            println!("  - [{}] {}", e.tag(), e);
            return;
        }
    };
    for sym in symbols {
        let kind = if sym.is_stab() {
            "stab".to_string()
        } else if sym.is_undefined() {
            "undefined".to_string()
        } else {
            sym.section.clone().unwrap_or_else(|| "absolute".to_string())
        };
        let scope = if sym.is_external() { "|external" } else { "" };
        println!("{:#018x}:  <{}{}> \t {}", sym.value, kind, scope, sym.name);
    }
}

fn print_fixups(image: &MachOImage<'_>, report: &FixupReport) {
    let mut last_section: Option<&str> = None;
    for record in &report.records {
        if record.section() != last_section {
            println!("{}", record.section().unwrap_or("<no section>"));
            last_section = record.section();
        }
        match record {
            FixupRecord::Bind {
                vmaddr,
                symbol,
                library_ordinal,
                addend,
                weak,
                auth,
                ..
            } => {
                let lib = image
                    .library_ordinal_name(*library_ordinal)
                    .unwrap_or_else(|| format!("ordinal({})", library_ordinal));
                let addend = if *addend != 0 {
                    format!(" + {:#x}", addend)
                } else {
                    String::new()
                };
                let auth = auth
                    .map(|a| format!(" (auth key: {}, div: {:#06x})", a.key_name(), a.diversity))
                    .unwrap_or_default();
                println!(
                    "{:#011x}:  bind{}\t{}/{}{}{}",
                    vmaddr,
                    if *weak { " (weak)" } else { "" },
                    lib,
                    symbol,
                    addend,
                    auth
                );
            }
            FixupRecord::Rebase {
                vmaddr,
                target,
                auth,
                ..
            } => {
                let auth = auth
                    .map(|a| format!(" (auth key: {}, div: {:#06x})", a.key_name(), a.diversity))
                    .unwrap_or_default();
                println!("{:#011x}:  rebase\t{:#011x}{}", vmaddr, target, auth);
            }
        }
    }
    for e in &report.errors {
        println!("  - [{}] {}", e.tag(), e);
    }
}
