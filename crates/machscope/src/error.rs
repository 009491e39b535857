//! Error types for machscope operations.
//!
//! This module defines the [`enum@Error`] enum covering every failure the
//! engine can report, from fat container selection down to a single bad
//! fixup page. Each variant maps to one stable taxonomy tag (see
//! [`Error::tag`]) so a reporter can always tell failures apart.
//!
//! # Propagation
//!
//! - Header failures ([`Error::TruncatedHeader`], [`Error::MalformedSegment`])
//!   abort the whole analysis.
//! - Feature failures (signature, ObjC, fixups, function starts, symbols) are
//!   scoped into [`crate::Feature::Malformed`].
//! - Per-entry failures inside bulk walks are recorded next to the results.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use thiserror::Error;

/// Error type for machscope operations.
///
/// # Examples
///
/// ```no_run
/// use machscope::{Analyzer, Error};
///
/// let data = std::fs::read("Payload/App.app/App")?;
/// match Analyzer::new().arch("arm64e").analyze(&data) {
///     Ok(analysis) => println!("{} load commands", analysis.image.load_commands().len()),
///     Err(Error::ArchNotFound { available, .. }) => eprintln!("pick one of: {}", available.join(", ")),
///     Err(e) => eprintln!("[{}] {e}", e.tag()),
/// }
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    ///
    /// Only raised while acquiring a byte source (see [`crate::source`]).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The input is a thin Mach-O image, not a fat container.
    ///
    /// Informational: callers retry with [`crate::MachOImage::parse`].
    #[error("not a fat Mach-O container")]
    NotFat,

    /// No architecture slice matched the requested token.
    ///
    /// `available` lists the short names of every slice in the container.
    #[error("arch '{token}' not found in: {}", available.join(", "))]
    ArchNotFound {
        /// Token that was requested.
        token: String,
        /// Short names of the available slices.
        available: Vec<String>,
    },

    /// The fat header or arch table is inconsistent with the container.
    #[error("Malformed fat container: {0}")]
    MalformedFat(String),

    /// The Mach-O header or a load command runs past the command stream.
    #[error("Truncated header: {0}")]
    TruncatedHeader(String),

    /// A segment's file range overflows or exceeds the image.
    #[error("Malformed segment: {0}")]
    MalformedSegment(String),

    /// The symbol or string table lies outside the image.
    #[error("Malformed symbol table: {0}")]
    MalformedSymbolTable(String),

    /// The code signature superblob or one of its sub-blobs is malformed.
    #[error("Malformed code signature: {0}")]
    MalformedSignature(String),

    /// An Objective-C metadata record could not be decoded.
    #[error("Malformed ObjC metadata: {0}")]
    MalformedObjC(String),

    /// A chained fixup structure or a single fixup page is malformed.
    ///
    /// `segment` and `page` are `usize::MAX` when the failure concerns the
    /// fixups blob as a whole.
    #[error("Malformed fixup chain (segment {segment}, page {page}): {reason}")]
    MalformedFixupChain {
        /// Segment index within the starts table.
        segment: usize,
        /// Page index within the segment.
        page: usize,
        /// What was wrong.
        reason: String,
    },

    /// The function starts stream ended in the middle of a varint.
    #[error("Truncated function starts: {0}")]
    TruncatedFunctionStarts(String),

    /// A recognised sub-format version or variant that is not handled.
    #[error("Unsupported format variant: {0}")]
    UnsupportedFormatVariant(String),

    /// Property list parsing failed.
    ///
    /// Raised when entitlements are requested as a [`plist::Value`].
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),
}

impl Error {
    /// Stable taxonomy name of this error.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::Io(_) => "IoError",
            Error::NotFat => "NotFatError",
            Error::ArchNotFound { .. } => "ArchNotFoundError",
            Error::MalformedFat(_) => "MalformedFatError",
            Error::TruncatedHeader(_) => "TruncatedHeaderError",
            Error::MalformedSegment(_) => "MalformedSegmentError",
            Error::MalformedSymbolTable(_) => "MalformedSymbolTableError",
            Error::MalformedSignature(_) => "MalformedSignatureError",
            Error::MalformedObjC(_) => "MalformedObjCError",
            Error::MalformedFixupChain { .. } => "MalformedFixupChainError",
            Error::TruncatedFunctionStarts(_) => "TruncatedFunctionStartsError",
            Error::UnsupportedFormatVariant(_) => "UnsupportedFormatVariantError",
            Error::Plist(_) => "PlistError",
        }
    }

    /// Whether this error invalidates the whole analysis.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ArchNotFound { .. }
                | Error::MalformedFat(_)
                | Error::TruncatedHeader(_)
                | Error::MalformedSegment(_)
        )
    }

    pub(crate) fn fixup_blob(reason: impl Into<String>) -> Self {
        Error::MalformedFixupChain {
            segment: usize::MAX,
            page: usize::MAX,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_not_found_lists_names() {
        let err = Error::ArchNotFound {
            token: "ppc".into(),
            available: vec!["x86_64".into(), "arm64".into()],
        };
        assert_eq!(err.to_string(), "arch 'ppc' not found in: x86_64, arm64");
        assert_eq!(err.tag(), "ArchNotFoundError");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_feature_errors_are_not_fatal() {
        assert!(!Error::MalformedSignature("bad".into()).is_fatal());
        assert!(!Error::TruncatedFunctionStarts("eof".into()).is_fatal());
        assert!(!Error::fixup_blob("bad header").is_fatal());
    }
}
