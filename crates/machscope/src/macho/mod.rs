//! Mach-O container and image parsing.

pub mod constants;
pub mod fat;
pub mod load_command;
pub mod parser;

pub use fat::{is_fat, ArchitectureSlice, FatContainer};
pub use load_command::{
    BuildVersion, Dylib, DylibKind, LinkeditData, LoadCommand, LoadCommandRecord, Section, Segment,
    SourceVersion, Version,
};
pub use parser::{MachHeader, MachOImage, Symbol};
