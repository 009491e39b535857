//! Memory-mapped input files.

use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::Result;

/// A read-only mapping of an input file.
///
/// The mapping is released when the value drops.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    map: Option<Mmap>,
}

impl MappedFile {
    /// Map `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the file does not exist or cannot be mapped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // Zero-length files cannot be mapped on every platform.
        let map = if file.metadata()?.len() == 0 {
            None
        } else {
            // SAFETY: the map is read-only and callers only see it as &[u8].
            // Truncating the file while mapped is outside what this crate guards.
            Some(unsafe { Mmap::map(&file)? })
        };
        tracing::debug!(path = %path.display(), len = map.as_ref().map_or(0, |m| m.len()), "mapped input");

        Ok(MappedFile {
            path: path.to_path_buf(),
            map,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}
