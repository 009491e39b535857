//! Mach-O introspection.
//!
//! `machscope` reads a Mach-O image, or one slice of a fat container, and
//! reconstructs its header and load commands, embedded code signature,
//! Objective-C metadata, chained fixups, function starts and symbols.
//! Everything is decoded from untrusted bytes; malformed input surfaces as
//! an [`Error`], never a panic.

pub mod analysis;
pub mod codesign;
pub mod crypto;
pub mod error;
pub mod fixups;
pub mod function_starts;
pub mod macho;
pub mod objc;
pub mod source;

pub use analysis::{Analysis, Analyzer, Feature};
pub use codesign::{CodeDirectory, CodeSignature, Requirement, RequirementSet};
pub use crypto::{CertificateInfo, CmsSignature};
pub use error::Error;
pub use fixups::{ChainedFixups, FixupRecord, FixupReport, PointerDecoder};
pub use macho::{ArchitectureSlice, FatContainer, MachOImage};
pub use objc::ObjCMetadata;
pub use source::MappedFile;

pub type Result<T> = std::result::Result<T, Error>;
