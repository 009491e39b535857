//! One analysis session over an input image.
//!
//! ```text
//!   bytes ──► slice selection ──► MachOImage::parse ──┬─► code signature
//!             (fat only)          (fatal on error)    ├─► ObjC metadata
//!                                                     ├─► chained fixups
//!                                                     ├─► function starts
//!                                                     └─► symbols
//! ```
//!
//! The optional features read the parsed image only, so they run in
//! parallel on the rayon pool. Each ends up in its own [`Feature`]; a
//! failure in one does not affect the others.

use std::fmt;

use crate::codesign::CodeSignature;
use crate::fixups::{ChainedFixups, FixupReport, PointerDecoder};
use crate::macho::{is_fat, ArchitectureSlice, FatContainer, MachOImage, Symbol};
use crate::objc::ObjCMetadata;
use crate::{Error, Result};

/// Outcome of one optional feature.
#[derive(Debug)]
pub enum Feature<T> {
    /// Not present in the image, or not requested.
    Absent,
    Present(T),
    /// Present but undecodable; the rest of the analysis is unaffected.
    Malformed(Error),
}

impl<T> Feature<T> {
    fn from_result(name: &str, result: Result<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Feature::Present(value),
            Ok(None) => Feature::Absent,
            Err(e) => {
                tracing::warn!(feature = name, error = %e, "feature is malformed");
                Feature::Malformed(e)
            }
        }
    }

    pub fn present(&self) -> Option<&T> {
        match self {
            Feature::Present(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Feature::Malformed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Feature::Absent)
    }
}

type Chooser = Box<dyn Fn(&[ArchitectureSlice]) -> usize + Send + Sync>;

/// Configures and runs an analysis.
///
/// Every feature is enabled by default.
///
/// # Examples
///
/// ```no_run
/// use machscope::Analyzer;
///
/// let data = std::fs::read("/usr/lib/dyld")?;
/// let analysis = Analyzer::new().arch("arm64e").objc(false).analyze(&data)?;
/// if let Some(starts) = analysis.function_starts.present() {
///     println!("{} functions", starts.len());
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Analyzer {
    arch: Option<String>,
    chooser: Option<Chooser>,
    signature: bool,
    objc: bool,
    fixups: bool,
    function_starts: bool,
    symbols: bool,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyzer")
            .field("arch", &self.arch)
            .field("chooser", &self.chooser.is_some())
            .field("signature", &self.signature)
            .field("objc", &self.objc)
            .field("fixups", &self.fixups)
            .field("function_starts", &self.function_starts)
            .field("symbols", &self.symbols)
            .finish()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Analyzer {
            arch: None,
            chooser: None,
            signature: true,
            objc: true,
            fixups: true,
            function_starts: true,
            symbols: true,
        }
    }

    /// Select a fat slice by partial, case-insensitive name ("arm64e",
    /// "x86"). Takes precedence over [`Analyzer::chooser`].
    pub fn arch(mut self, token: impl Into<String>) -> Self {
        self.arch = Some(token.into());
        self
    }

    /// Select a fat slice with a callback returning an index into the
    /// slices it is given.
    pub fn chooser<F>(mut self, chooser: F) -> Self
    where
        F: Fn(&[ArchitectureSlice]) -> usize + Send + Sync + 'static,
    {
        self.chooser = Some(Box::new(chooser));
        self
    }

    pub fn signature(mut self, enabled: bool) -> Self {
        self.signature = enabled;
        self
    }

    pub fn objc(mut self, enabled: bool) -> Self {
        self.objc = enabled;
        self
    }

    pub fn fixups(mut self, enabled: bool) -> Self {
        self.fixups = enabled;
        self
    }

    pub fn function_starts(mut self, enabled: bool) -> Self {
        self.function_starts = enabled;
        self
    }

    pub fn symbols(mut self, enabled: bool) -> Self {
        self.symbols = enabled;
        self
    }

    /// Resolve the slice to analyze. Thin inputs are returned whole.
    fn select<'a>(&self, data: &'a [u8]) -> Result<(&'a [u8], Option<ArchitectureSlice>, Vec<ArchitectureSlice>)> {
        if !is_fat(data) {
            if let Some(token) = &self.arch {
                tracing::debug!(%token, "thin image, ignoring arch selection");
            }
            return Ok((data, None, Vec::new()));
        }

        let container = FatContainer::parse(data)?;
        let slice = match (&self.arch, &self.chooser) {
            (Some(token), _) => *container.select(token)?,
            (None, Some(chooser)) => *container.select_with(|arches| chooser(arches))?,
            (None, None) => {
                let first = *container
                    .arches()
                    .first()
                    .ok_or_else(|| Error::MalformedFat("container lists no slices".into()))?;
                tracing::info!(
                    arch = %first.name(),
                    available = ?container.short_names(),
                    "fat input without an arch selection; using the first slice"
                );
                first
            }
        };
        tracing::debug!(arch = %slice.name(), offset = slice.offset, size = slice.size, "selected slice");
        Ok((
            container.slice_bytes(data, &slice),
            Some(slice),
            container.arches().to_vec(),
        ))
    }

    /// Run the analysis over `data`, a thin image or a fat container.
    ///
    /// # Errors
    ///
    /// Only slice selection and header failures are returned here:
    /// [`Error::MalformedFat`], [`Error::ArchNotFound`],
    /// [`Error::TruncatedHeader`], [`Error::MalformedSegment`] and
    /// [`Error::UnsupportedFormatVariant`] for unknown magics. Feature
    /// failures are reported through each [`Feature`].
    pub fn analyze<'a>(&self, data: &'a [u8]) -> Result<Analysis<'a>> {
        let (bytes, slice, arches) = self.select(data)?;
        let image = MachOImage::parse(bytes)?;
        tracing::debug!(
            ncmds = image.load_commands().len(),
            segments = image.segments().len(),
            "parsed image header"
        );

        let (chained, chained_err) = match ChainedFixups::parse(&image) {
            Ok(chained) => (chained, None),
            Err(e) => (None, Some(e)),
        };
        let decoder = chained
            .as_ref()
            .map_or_else(PointerDecoder::plain, PointerDecoder::from_fixups);

        let ((signature, objc), (fixups, (function_starts, symbols))) = rayon::join(
            || {
                rayon::join(
                    || self.signature.then(|| image.code_signature()),
                    || self.objc.then(|| ObjCMetadata::parse(&image, &decoder)),
                )
            },
            || {
                rayon::join(
                    || self.fixups.then(|| chained.as_ref().map(FixupReport::collect)),
                    || {
                        rayon::join(
                            || self.function_starts.then(|| image.function_starts()),
                            || {
                                self.symbols.then(|| match image.symtab() {
                                    Some(_) => image.symbols().map(Some),
                                    None => Ok(None),
                                })
                            },
                        )
                    },
                )
            },
        );
        let fixups = fixups.map(|report| match chained_err {
            Some(e) => Err(e),
            None => Ok(report),
        });
        drop(chained);

        Ok(Analysis {
            slice,
            arches,
            image,
            signature: feature("signature", signature),
            objc: feature("objc", objc),
            fixups: feature("fixups", fixups),
            function_starts: feature("function starts", function_starts),
            symbols: feature("symbols", symbols),
        })
    }
}

fn feature<T>(name: &str, outcome: Option<Result<Option<T>>>) -> Feature<T> {
    outcome.map_or(Feature::Absent, |r| Feature::from_result(name, r))
}

/// Result of [`Analyzer::analyze`].
#[derive(Debug)]
pub struct Analysis<'a> {
    /// Selected slice, for fat inputs.
    pub slice: Option<ArchitectureSlice>,
    /// Every slice of a fat input; empty for thin inputs.
    pub arches: Vec<ArchitectureSlice>,
    pub image: MachOImage<'a>,
    pub signature: Feature<CodeSignature>,
    pub objc: Feature<ObjCMetadata>,
    pub fixups: Feature<FixupReport>,
    pub function_starts: Feature<Vec<u64>>,
    pub symbols: Feature<Vec<Symbol>>,
}
