//! Emulation of the Windows image loader.
//!
//! [`ImageLoader`] takes the raw bytes of a PE file and rebuilds the page-granular view the
//! Windows memory manager creates when the file is mapped as an image section. The work is
//! split the way the OS splits it:
//!
//! - [`capture`] - DOS header, NT headers and section table are captured and checked
//! - [`mapper`] - the header and every section are copied into [`page::FilePage`]s
//! - [`access`] - RVA translation and bounds-checked read/write accessors over the pages
//! - [`rules`] - the acceptance rules of the emulated Windows version
//! - [`relocation`] - rebasing of the mapped image
//! - [`compare`] - diffing against an image actually mapped by Windows
//!
//! Problems found on the way are recorded as [`LoaderError`]s and never stop capture on their
//! own; see [`ImageLoader::loader_error`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use peloader::{ImageLoader, LoaderConfig, LoaderMode};
//!
//! let mut loader = ImageLoader::new(LoaderConfig::new(LoaderMode::Windows10).with_64bit_windows());
//! loader.load_file("sample.exe", false)?;
//!
//! if !loader.is_image_loadable() {
//!     println!("Windows would refuse this image: {:?}", loader.loader_error());
//! }
//!
//! let mut entry = [0u8; 16];
//! loader.read_image(&mut entry, loader.optional_header().address_of_entry_point);
//! # Ok::<(), peloader::Error>(())
//! ```

pub mod access;
pub mod capture;
pub mod compare;
pub mod config;
pub mod headers;
pub mod mapper;
pub mod page;
pub mod relocation;
pub mod rules;
pub mod status;

use std::{
    io::{Read, Seek},
    path::Path,
};

use log::{debug, warn};

use crate::{
    file::{File, MAX_FILE_SIZE},
    Error, Result,
};
use config::LoaderConfig;
use headers::{
    DataDirectory, DosHeader, FileHeader, OptionalHeader, SectionHeader,
    IMAGE_NUMBEROF_DIRECTORY_ENTRIES,
};
use mapper::SectionMapper;
use page::{align_to_size, bytes_to_pages, FilePage, PAGE_SIZE, SECTOR_SIZE};
use status::LoaderError;

/// Storage of the captured image.
#[derive(Clone, Debug, Default)]
pub(crate) enum ImageContent {
    /// Nothing captured yet, or the load stopped before mapping
    #[default]
    Empty,
    /// The image, page by page
    Mapped(Vec<FilePage>),
    /// The file bytes as they are, when no page layout could be derived
    AsIs(Vec<u8>),
}

/// An emulated image section: captured headers plus the mapped pages.
///
/// One instance holds one image at a time; every `load*` call discards the previous state.
/// The loader owns everything it captured, so the input buffer may be dropped after loading.
#[derive(Clone, Default)]
pub struct ImageLoader {
    pub(crate) config: LoaderConfig,
    pub(crate) dos_header: DosHeader,
    pub(crate) nt_signature: u32,
    pub(crate) file_header: FileHeader,
    pub(crate) optional_header: OptionalHeader,
    pub(crate) sections: Vec<SectionHeader>,
    pub(crate) image: ImageContent,
    pub(crate) checksum_file_offset: u32,
    pub(crate) security_dir_file_offset: u32,
    pub(crate) real_number_of_rva_and_sizes: u32,
    pub(crate) headers_captured: bool,
    pub(crate) loader_errors: Vec<LoaderError>,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("config", &self.config)
            .field("image_base", &self.optional_header.image_base)
            .field("size_of_image", &self.optional_header.size_of_image)
            .field("sections", &self.sections.len())
            .field("pages", &self.page_count())
            .field("loader_errors", &self.loader_errors)
            .finish_non_exhaustive()
    }
}

impl ImageLoader {
    /// Creates an empty loader emulating the given configuration.
    #[must_use]
    pub fn new(config: LoaderConfig) -> Self {
        ImageLoader {
            config,
            ..ImageLoader::default()
        }
    }

    /// Captures and maps an image from a byte buffer.
    ///
    /// With `headers_only`, only the pages covering `SizeOfHeaders` are mapped.
    ///
    /// Only inputs that are not PE images at all fail; every other problem is recorded and
    /// can be queried with [`ImageLoader::loader_error`] afterwards.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the input is too small for a DOS header,
    /// [`crate::Error::NotSupported`] if the `MZ` or `PE\0\0` signature is missing and
    /// [`crate::Error::FileTooBig`] for inputs above 4 GiB.
    pub fn load(&mut self, data: &[u8], headers_only: bool) -> Result<()> {
        self.reset();

        if data.len() as u64 > MAX_FILE_SIZE {
            self.set_loader_error(LoaderError::FileTooBig);
            return Err(Error::FileTooBig(data.len() as u64));
        }

        debug!(
            "Loading image of {} bytes{}",
            data.len(),
            if headers_only { " (headers only)" } else { "" }
        );

        self.capture_dos_header(data)?;
        if self.capture_nt_headers(data)?.is_break() {
            debug!("NT headers are out of file, nothing mapped");
            return Ok(());
        }

        self.capture_section_headers(data);
        self.map_image(data, headers_only);

        debug!(
            "Loaded image: {} sections, {} pages, loader error {:?}",
            self.sections.len(),
            self.page_count(),
            self.loader_error()
        );
        Ok(())
    }

    /// Captures and maps an image stored in a stream, starting at `offset`.
    ///
    /// # Errors
    /// Everything [`ImageLoader::load`] returns, plus [`crate::Error::OutOfBounds`] if
    /// `offset` lies past the end of the stream and [`crate::Error::FileError`] for I/O
    /// failures. Streams with more than 4 GiB left also record [`LoaderError::FileTooBig`].
    pub fn load_reader<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        offset: u64,
        headers_only: bool,
    ) -> Result<()> {
        self.reset();

        let file = match File::from_reader(reader, offset) {
            Ok(file) => file,
            Err(Error::FileTooBig(size)) => {
                self.set_loader_error(LoaderError::FileTooBig);
                return Err(Error::FileTooBig(size));
            }
            Err(error) => return Err(error),
        };

        self.load(file.data(), headers_only)
    }

    /// Memory-maps a file from disk and captures the image from it.
    ///
    /// # Errors
    /// Everything [`ImageLoader::load`] returns, plus [`crate::Error::FileError`] if the
    /// file cannot be opened or mapped.
    pub fn load_file(&mut self, path: impl AsRef<Path>, headers_only: bool) -> Result<()> {
        self.reset();

        let file = File::from_file(path)?;
        self.load(file.data(), headers_only)
    }

    fn reset(&mut self) {
        *self = ImageLoader::new(self.config.clone());
    }

    /// Builds the page layout, or keeps the file as it is if no layout can be derived.
    fn map_image(&mut self, data: &[u8], headers_only: bool) {
        let section_alignment = self.optional_header.section_alignment;
        let size_of_image = self.optional_header.size_of_image;
        let size_of_headers = self.optional_header.size_of_headers;

        if section_alignment == 0 || !section_alignment.is_power_of_two() {
            debug!("Unusable SectionAlignment {section_alignment:#x}, keeping the file as-is");
            self.image = ImageContent::AsIs(data.to_vec());
            return;
        }

        if section_alignment < PAGE_SIZE {
            let granularity = if self.config.is_64bit_windows {
                PAGE_SIZE
            } else {
                SECTOR_SIZE
            };
            let mapped_size = if headers_only {
                size_of_headers
            } else {
                size_of_image
            };
            let image_size = align_to_size(mapped_size, granularity);
            let page_count = bytes_to_pages(image_size).max(1);

            debug!("Single-subsection image, mapping {page_count} pages flat");
            let mut mapper = SectionMapper::new(data, page_count as usize, section_alignment);
            mapper.map_flat(image_size);
            self.finish_mapping(mapper);
            return;
        }

        let page_count = if headers_only {
            bytes_to_pages(size_of_headers)
        } else {
            bytes_to_pages(size_of_image)
        };
        if page_count == 0 {
            debug!("SizeOfImage maps to no pages, keeping the file as-is");
            self.image = ImageContent::AsIs(data.to_vec());
            return;
        }

        let mut mapper = SectionMapper::new(data, page_count as usize, section_alignment);
        mapper.map_header(size_of_headers);
        if !headers_only {
            for section in &self.sections {
                mapper.map_section(section);
            }
        }
        self.finish_mapping(mapper);
    }

    fn finish_mapping(&mut self, mapper: SectionMapper) {
        let (pages, errors) = mapper.finish();
        for error in errors {
            self.set_loader_error(error);
        }
        self.image = ImageContent::Mapped(pages);
    }

    /// The configuration this loader emulates.
    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Records a loader error.
    ///
    /// The first error recorded since the last load stays the current one (see
    /// [`ImageLoader::loader_error`]); later ones are only appended to
    /// [`ImageLoader::loader_errors`]. Recording the same error twice has no effect.
    pub fn set_loader_error(&mut self, error: LoaderError) {
        if self.loader_errors.contains(&error) {
            return;
        }

        if self.loader_errors.is_empty() {
            warn!("Loader error: {error} ({})", error.name());
        } else {
            debug!("Additional loader error: {error} ({})", error.name());
        }
        self.loader_errors.push(error);
    }

    /// The first loader error recorded since the last load, if any.
    #[must_use]
    pub fn loader_error(&self) -> Option<LoaderError> {
        self.loader_errors.first().copied()
    }

    /// Every distinct loader error recorded since the last load, in order of detection.
    #[must_use]
    pub fn loader_errors(&self) -> &[LoaderError] {
        &self.loader_errors
    }

    /// The captured MS-DOS header.
    #[must_use]
    pub fn dos_header(&self) -> &DosHeader {
        &self.dos_header
    }

    /// The captured COFF file header.
    #[must_use]
    pub fn file_header(&self) -> &FileHeader {
        &self.file_header
    }

    /// The captured optional header.
    ///
    /// Data directory slots beyond [`ImageLoader::real_number_of_data_directories`] are zero.
    #[must_use]
    pub fn optional_header(&self) -> &OptionalHeader {
        &self.optional_header
    }

    /// The captured section table, in file order.
    #[must_use]
    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    /// The section table entry at `index`.
    #[must_use]
    pub fn section_header(&self, index: usize) -> Option<&SectionHeader> {
        self.sections.get(index)
    }

    /// Number of captured section headers. May be lower than the declared count.
    #[must_use]
    pub fn number_of_sections(&self) -> usize {
        self.sections.len()
    }

    /// File offset of the NT headers (`e_lfanew`).
    #[must_use]
    pub fn pe_header_offset(&self) -> u32 {
        self.dos_header.e_lfanew
    }

    /// The captured NT signature.
    #[must_use]
    pub fn nt_signature(&self) -> u32 {
        self.nt_signature
    }

    /// `IMAGE_FILE_HEADER::Machine`
    #[must_use]
    pub fn machine(&self) -> u16 {
        self.file_header.machine
    }

    /// `IMAGE_FILE_HEADER::Characteristics`
    #[must_use]
    pub fn characteristics(&self) -> u16 {
        self.file_header.characteristics
    }

    /// `IMAGE_FILE_HEADER::PointerToSymbolTable`
    #[must_use]
    pub fn pointer_to_symbol_table(&self) -> u32 {
        self.file_header.pointer_to_symbol_table
    }

    /// `IMAGE_FILE_HEADER::NumberOfSymbols`
    #[must_use]
    pub fn number_of_symbols(&self) -> u32 {
        self.file_header.number_of_symbols
    }

    /// `IMAGE_OPTIONAL_HEADER::Magic`
    #[must_use]
    pub fn magic(&self) -> u16 {
        self.optional_header.magic
    }

    /// The current image base; updated by [`ImageLoader::relocate_image`].
    #[must_use]
    pub fn image_base(&self) -> u64 {
        self.optional_header.image_base
    }

    /// `IMAGE_OPTIONAL_HEADER::AddressOfEntryPoint`
    #[must_use]
    pub fn address_of_entry_point(&self) -> u32 {
        self.optional_header.address_of_entry_point
    }

    /// `IMAGE_OPTIONAL_HEADER::SizeOfHeaders`
    #[must_use]
    pub fn size_of_headers(&self) -> u32 {
        self.optional_header.size_of_headers
    }

    /// `IMAGE_OPTIONAL_HEADER::SizeOfImage`
    #[must_use]
    pub fn size_of_image(&self) -> u32 {
        self.optional_header.size_of_image
    }

    /// `SizeOfImage` rounded up to a page, wrapping to zero above `0xFFFF_F000`.
    #[must_use]
    pub fn size_of_image_aligned(&self) -> u32 {
        align_to_size(self.optional_header.size_of_image, PAGE_SIZE)
    }

    /// `IMAGE_OPTIONAL_HEADER::SectionAlignment`
    #[must_use]
    pub fn section_alignment(&self) -> u32 {
        self.optional_header.section_alignment
    }

    /// `IMAGE_OPTIONAL_HEADER::FileAlignment`
    #[must_use]
    pub fn file_alignment(&self) -> u32 {
        self.optional_header.file_alignment
    }

    /// File offset of the `CheckSum` field.
    #[must_use]
    pub fn checksum_file_offset(&self) -> u32 {
        self.checksum_file_offset
    }

    /// File offset of the certificate table data directory entry.
    #[must_use]
    pub fn security_dir_file_offset(&self) -> u32 {
        self.security_dir_file_offset
    }

    /// Number of data directories actually present in the optional header.
    #[must_use]
    pub fn real_number_of_data_directories(&self) -> u32 {
        self.real_number_of_rva_and_sizes
    }

    fn data_directory(&self, index: usize) -> DataDirectory {
        if index < self.real_number_of_rva_and_sizes as usize {
            self.optional_header.data_directory[index]
        } else {
            DataDirectory::default()
        }
    }

    /// RVA of data directory `index`, zero if the directory is not present.
    #[must_use]
    pub fn data_dir_rva(&self, index: usize) -> u32 {
        self.data_directory(index).virtual_address
    }

    /// Size of data directory `index`, zero if the directory is not present.
    #[must_use]
    pub fn data_dir_size(&self, index: usize) -> u32 {
        self.data_directory(index).size
    }

    /// Sets data directory `index`, growing the directory count if needed.
    ///
    /// Returns false if `index` is not a valid directory slot.
    pub fn set_data_directory(&mut self, index: usize, rva: u32, size: u32) -> bool {
        if index >= IMAGE_NUMBEROF_DIRECTORY_ENTRIES {
            return false;
        }

        #[allow(clippy::cast_possible_truncation)]
        let count = (index + 1) as u32;
        self.real_number_of_rva_and_sizes = self.real_number_of_rva_and_sizes.max(count);
        self.optional_header.number_of_rva_and_sizes =
            self.optional_header.number_of_rva_and_sizes.max(count);
        self.optional_header.data_directory[index] = DataDirectory {
            virtual_address: rva,
            size,
        };
        true
    }

    /// Number of pages of the mapped image; zero in the as-is fallback.
    #[must_use]
    pub fn page_count(&self) -> usize {
        match &self.image {
            ImageContent::Mapped(pages) => pages.len(),
            _ => 0,
        }
    }

    /// The page at `index` of the mapped image.
    #[must_use]
    pub fn page(&self, index: usize) -> Option<&FilePage> {
        match &self.image {
            ImageContent::Mapped(pages) => pages.get(index),
            _ => None,
        }
    }

    /// Returns true if the image is kept as the raw file because it could not be mapped.
    #[must_use]
    pub fn is_loaded_as_is(&self) -> bool {
        matches!(self.image, ImageContent::AsIs(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::PeBuilder;

    #[test]
    fn test_load_rejects_non_pe() {
        let mut loader = ImageLoader::default();
        assert!(matches!(
            loader.load(&[0u8; 64], false),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            loader.load(&[0u8; 0x200], false),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn test_load_resets_previous_state() {
        let mut loader = ImageLoader::default();
        loader.load(&PeBuilder::new_64bit().build(), false).unwrap();
        assert!(loader.page_count() > 0);
        loader.set_loader_error(LoaderError::FileIsCut);

        let mut broken = PeBuilder::new_64bit().build();
        broken[0x80..0x84].copy_from_slice(b"XX\0\0");
        assert!(loader.load(&broken, false).is_err());
        assert_eq!(loader.page_count(), 0);
        assert_eq!(loader.loader_error(), Some(LoaderError::NoNtSignature));
    }

    #[test]
    fn test_first_loader_error_wins() {
        let mut loader = ImageLoader::default();
        loader.set_loader_error(LoaderError::ELfanewUnaligned);
        loader.set_loader_error(LoaderError::InvalidMachine64);
        loader.set_loader_error(LoaderError::ELfanewUnaligned);

        assert_eq!(loader.loader_error(), Some(LoaderError::ELfanewUnaligned));
        assert_eq!(
            loader.loader_errors(),
            &[LoaderError::ELfanewUnaligned, LoaderError::InvalidMachine64]
        );
    }

    #[test]
    fn test_headers_only_maps_header_pages() {
        let data = PeBuilder::new_64bit().build();
        let mut loader = ImageLoader::default();
        loader.load(&data, true).unwrap();

        assert_eq!(loader.page_count(), 1);
        assert_eq!(loader.number_of_sections(), 1);
        let mut mz = [0u8; 2];
        assert_eq!(loader.read_image(&mut mz, 0), 2);
        assert_eq!(&mz, b"MZ");
    }

    #[test]
    fn test_headers_only_single_subsection() {
        let data = PeBuilder::new_64bit().single_subsection().build();

        let mut loader = ImageLoader::default();
        loader.load(&data, false).unwrap();
        assert_eq!(loader.page_count(), 2);
        assert_eq!(loader.read_value::<u8>(0x400), Some(data[0x400]));

        loader.load(&data, true).unwrap();
        assert_eq!(loader.page_count(), 1);
        assert_eq!(loader.read_value::<u16>(0), Some(0x5A4D));
        assert_ne!(data[0x400], 0);
        assert_eq!(loader.read_value::<u8>(0x400), Some(0));
    }

    #[test]
    fn test_set_data_directory_grows_count() {
        let mut loader = ImageLoader::default();
        loader
            .load(&PeBuilder::new_64bit().data_directories(2).build(), false)
            .unwrap();
        assert_eq!(loader.real_number_of_data_directories(), 2);

        assert!(loader.set_data_directory(6, 0x1000, 0x1C));
        assert_eq!(loader.real_number_of_data_directories(), 7);
        assert_eq!(loader.data_dir_rva(6), 0x1000);
        assert_eq!(loader.data_dir_size(6), 0x1C);
        assert!(!loader.set_data_directory(16, 0, 0));
    }

    #[test]
    fn test_load_reader_with_offset() {
        let mut data = vec![0xEEu8; 0x100];
        data.extend_from_slice(&PeBuilder::new_32bit().build());
        let mut cursor = std::io::Cursor::new(data);

        let mut loader = ImageLoader::default();
        loader.load_reader(&mut cursor, 0x100, false).unwrap();
        assert_eq!(loader.image_base(), 0x40_0000);
        assert!(loader.is_image_loadable());
    }
}
