//! Loader diagnostics.
//!
//! Unlike [`crate::Error`], a [`LoaderError`] does not stop anything: it records that the
//! Windows loader would have complained about the image at that point. The
//! [`crate::ImageLoader`] keeps capturing and mapping after recording one, so callers still
//! get a best-effort image to inspect.

use strum::{EnumCount, EnumIter, IntoStaticStr};
use thiserror::Error;

/// A condition the Windows image loader would reject or flag.
///
/// Only [`LoaderError::FileIsCutLoadable`] and [`LoaderError::RawDataOutOfFile`] are
/// informational; every other value means the OS would refuse to create an image section
/// from the file (see [`LoaderError::is_fatal`]).
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq, Hash, EnumCount, EnumIter, IntoStaticStr)]
pub enum LoaderError {
    /// The input exceeds 4 GiB.
    #[error("The file is bigger than 4 GB")]
    FileTooBig,
    /// `e_lfanew` is not a multiple of 4.
    #[error("The value of e_lfanew is not aligned to 4 bytes")]
    ELfanewUnaligned,
    /// `e_lfanew` points past the end of the file.
    #[error("The value of e_lfanew points outside the file")]
    ELfanewOutOfFile,
    /// The NT headers offset wraps around the address space.
    #[error("The offset of the NT headers overflows")]
    NtHeaderOffsetOverflow,
    /// The NT headers do not fit into the file.
    #[error("The NT headers are outside the file")]
    NtHeaderOutOfFile,
    /// `e_lfanew` does not point to `PE\0\0`.
    #[error("The NT signature is missing")]
    NoNtSignature,
    /// The file header is zeroed out.
    #[error("The file header is invalid")]
    FileHeaderInvalid,
    /// The image is not marked executable, has too many sections or violates the
    /// app-container rule.
    #[error("The image is not executable")]
    ImageNonExecutable,
    /// The optional header magic is neither PE32 nor PE32+.
    #[error("The optional header magic is invalid")]
    NoOptionalHeaderMagic,
    /// `SizeOfHeaders` is zero.
    #[error("SizeOfHeaders is zero")]
    SizeOfHeadersZero,
    /// `FileAlignment` is zero.
    #[error("FileAlignment is zero")]
    FileAlignmentZero,
    /// `FileAlignment` is not a power of two.
    #[error("FileAlignment is not a power of two")]
    FileAlignmentNotPow2,
    /// `SectionAlignment` is zero.
    #[error("SectionAlignment is zero")]
    SectionAlignmentZero,
    /// `SectionAlignment` is not a power of two.
    #[error("SectionAlignment is not a power of two")]
    SectionAlignmentNotPow2,
    /// `SectionAlignment` is smaller than `FileAlignment`.
    #[error("SectionAlignment is smaller than FileAlignment")]
    SectionAlignmentTooSmall,
    /// `FileAlignment` is not sector aligned while differing from `SectionAlignment`.
    #[error("SectionAlignment must equal FileAlignment if FileAlignment is not sector aligned")]
    SectionAlignmentInvalid,
    /// `SizeOfImage` exceeds the largest image the memory manager maps.
    #[error("SizeOfImage is too big")]
    SizeOfImageTooBig,
    /// A PE32 image has a machine type the emulated loader does not accept.
    #[error("The machine type is not valid for a 32-bit image")]
    InvalidMachine32,
    /// A PE32+ image has a machine type the emulated loader does not accept.
    #[error("The machine type is not valid for a 64-bit image")]
    InvalidMachine64,
    /// `SizeOfHeaders` exceeds `SizeOfImage`.
    #[error("SizeOfHeaders is bigger than SizeOfImage")]
    SizeOfHeadersInvalid,
    /// `SizeOfOptionalHeader` is not a multiple of 8 on 64-bit Windows.
    #[error("SizeOfOptionalHeader is not aligned to 8 bytes")]
    SizeOfOptionalHeaderNotAligned,
    /// `SizeOfImage` rounds to zero pages.
    #[error("SizeOfImage is zero")]
    SizeOfImageZero,
    /// `ImageBase` is not aligned to 64 KiB.
    #[error("ImageBase is not aligned to 64 KB")]
    ImageBaseNotAligned,
    /// The raw data extent of a section wraps around.
    #[error("The raw data of a section overflows")]
    RawDataOverflow,
    /// The section table starts past the end of the file.
    #[error("The section headers are outside the file")]
    SectionHeadersOutOfImage,
    /// The image headers do not fit into `SizeOfImage`.
    #[error("The section headers overflow the image headers")]
    SectionHeadersOverflow,
    /// A section of a single-subsection image is not mapped one to one.
    #[error("The raw and virtual layout of a section do not match")]
    SectionSizeMismatch,
    /// A section does not start where the previous one ended, or starts past the image.
    #[error("The virtual address of a section is invalid")]
    InvalidSectionVa,
    /// A section does not fit into `SizeOfImage`.
    #[error("The virtual size of a section is invalid")]
    InvalidSectionVsize,
    /// A section has an invalid raw size.
    #[error("The raw size of a section is invalid")]
    InvalidSectionRawSize,
    /// `SizeOfImage` is larger than the headers and sections need.
    #[error("SizeOfImage does not match the sections")]
    InvalidSizeOfImage,
    /// The raw data of the last section lies past the end of the file.
    #[error("The file is cut and cannot be loaded")]
    FileIsCut,
    /// The file is cut, but the loader still maps it.
    #[error("The file is cut but still loadable")]
    FileIsCutLoadable,
    /// A section points to raw data entirely past the end of the file; its pages stay invalid.
    #[error("The raw data of a section lies outside the file")]
    RawDataOutOfFile,
}

impl LoaderError {
    /// Returns true if the Windows loader would refuse to map the image.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            LoaderError::FileIsCutLoadable | LoaderError::RawDataOutOfFile
        )
    }

    /// Short, stable identifier of the error, e.g. `"FileIsCut"`.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}
