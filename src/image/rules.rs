//! Loader acceptance rules.
//!
//! The checks the memory manager applies to the NT headers before it creates an image
//! section, plus the predicates that summarize a finished load.

use super::{
    headers::{machine, DllCharacteristics},
    page::{PAGE_SIZE, PAGE_SIZE_SHIFT, SECTOR_SIZE},
    status::LoaderError,
    ImageContent, ImageLoader,
};

/// Largest `SizeOfImage` the memory manager accepts.
pub const MAX_SIZE_OF_IMAGE: u32 = 0x7700_0000;

/// Machine types of the historical NT ports.
const LEGACY_MACHINES: &[u16] = &[
    machine::R3000,
    machine::R4000,
    machine::R10000,
    machine::WCEMIPSV2,
    machine::ALPHA,
    machine::SH3,
    machine::SH3DSP,
    machine::SH4,
    machine::SH5,
    machine::ARM,
    machine::THUMB,
    machine::AM33,
    machine::POWERPC,
    machine::POWERPCFP,
    machine::MIPS16,
    machine::MIPSFPU,
    machine::MIPSFPU16,
    machine::TRICORE,
    machine::M32R,
];

impl ImageLoader {
    /// Every rule the captured NT headers violate, in the order the loader checks them.
    pub(crate) fn nt_header_violations(&self) -> Vec<LoaderError> {
        let header = &self.optional_header;
        let mut violations = Vec::new();

        if self.config.app_container_check && self.is_bad_app_container() {
            violations.push(LoaderError::ImageNonExecutable);
        }

        if header.file_alignment == 0 {
            violations.push(LoaderError::FileAlignmentZero);
        } else if !header.file_alignment.is_power_of_two() {
            violations.push(LoaderError::FileAlignmentNotPow2);
        }

        if header.section_alignment == 0 {
            violations.push(LoaderError::SectionAlignmentZero);
        } else if !header.section_alignment.is_power_of_two() {
            violations.push(LoaderError::SectionAlignmentNotPow2);
        }

        if header.section_alignment < header.file_alignment {
            violations.push(LoaderError::SectionAlignmentTooSmall);
        }

        if header.file_alignment & (SECTOR_SIZE - 1) != 0
            && header.section_alignment != header.file_alignment
        {
            violations.push(LoaderError::SectionAlignmentInvalid);
        }

        if header.size_of_headers == 0 && header.section_alignment >= PAGE_SIZE {
            violations.push(LoaderError::SizeOfHeadersZero);
        }

        if header.size_of_image > MAX_SIZE_OF_IMAGE {
            violations.push(LoaderError::SizeOfImageTooBig);
        }

        if header.is_64bit() {
            if !self.is_valid_64bit_machine() {
                violations.push(LoaderError::InvalidMachine64);
            }
        } else if !self.is_valid_32bit_machine() {
            violations.push(LoaderError::InvalidMachine32);
        }

        if header.size_of_headers > header.size_of_image {
            violations.push(LoaderError::SizeOfHeadersInvalid);
        }

        if self.config.is_64bit_windows && self.file_header.size_of_optional_header & 7 != 0 {
            violations.push(LoaderError::SizeOfOptionalHeaderNotAligned);
        }

        if header.size_of_image >> PAGE_SIZE_SHIFT == 0 {
            violations.push(LoaderError::SizeOfImageZero);
        }

        if header.image_base & 0xFFFF != 0 {
            violations.push(LoaderError::ImageBaseNotAligned);
        }

        violations
    }

    /// Returns true if the machine type is accepted for a PE32 image.
    #[must_use]
    pub fn is_valid_32bit_machine(&self) -> bool {
        match self.file_header.machine {
            machine::I386 => true,
            machine::ARMNT => self.config.load_arm_images,
            other => self.config.legacy_architectures && Self::is_legacy_image_architecture(other),
        }
    }

    /// Returns true if the machine type is accepted for a PE32+ image.
    #[must_use]
    pub fn is_valid_64bit_machine(&self) -> bool {
        match self.file_header.machine {
            machine::AMD64 | machine::IA64 => true,
            machine::ARM64 => self.config.load_arm_images,
            machine::ALPHA64 => self.config.legacy_architectures,
            _ => false,
        }
    }

    /// Returns true for the machine types of the historical MIPS, Alpha, PowerPC and SH ports.
    #[must_use]
    pub fn is_legacy_image_architecture(machine: u16) -> bool {
        LEGACY_MACHINES.contains(&machine)
    }

    /// App-container images need per-page protection, which single-subsection images
    /// cannot get.
    #[must_use]
    pub fn is_bad_app_container(&self) -> bool {
        self.optional_header
            .dll_flags()
            .contains(DllCharacteristics::APPCONTAINER)
            && self.optional_header.section_alignment < PAGE_SIZE
    }

    /// Returns true if the Windows loader would create an image section from the file.
    ///
    /// This says nothing about whether the image would run; imports, relocations and the
    /// rest of the directories are not looked at.
    #[must_use]
    pub fn is_image_loadable(&self) -> bool {
        self.headers_captured && !self.loader_errors.iter().any(|error| error.is_fatal())
    }

    /// Returns true if headers were captured and a page layout exists, whether or not the
    /// image is loadable.
    #[must_use]
    pub fn is_image_mapped_ok(&self) -> bool {
        self.headers_captured && self.page_count() != 0
    }

    /// Returns true if `rva..rva + size` lies within `SizeOfImage`.
    #[must_use]
    pub fn is_valid_image_block(&self, rva: u32, size: u32) -> bool {
        let size_of_image = self.optional_header.size_of_image;
        match rva.checked_add(size) {
            Some(end) => rva < size_of_image && size < size_of_image && end <= size_of_image,
            None => false,
        }
    }

    /// Returns true if the page containing `rva` is backed by file data or zero-filled.
    #[must_use]
    pub fn is_good_mapped_page(&self, rva: u32) -> bool {
        match &self.image {
            ImageContent::Mapped(pages) => pages
                .get((rva >> PAGE_SIZE_SHIFT) as usize)
                .is_some_and(|page| page.is_accessible()),
            ImageContent::AsIs(data) => (rva as usize) < data.len(),
            ImageContent::Empty => false,
        }
    }

    /// Returns true if the page containing `rva` is a zero page.
    #[must_use]
    pub fn is_zero_page(&self, rva: u32) -> bool {
        self.page((rva >> PAGE_SIZE_SHIFT) as usize)
            .is_some_and(|page| page.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::config::{LoaderConfig, LoaderMode},
        test::PeBuilder,
    };

    fn load(config: LoaderConfig, data: &[u8]) -> ImageLoader {
        let mut loader = ImageLoader::new(config);
        loader.load(data, false).unwrap();
        loader
    }

    #[test]
    fn test_valid_image_has_no_violations() {
        let loader = load(LoaderConfig::default(), &PeBuilder::new_64bit().build());
        assert!(loader.nt_header_violations().is_empty());
        assert!(loader.is_image_loadable());
        assert!(loader.is_image_mapped_ok());
    }

    #[test]
    fn test_alignment_rules() {
        let data = PeBuilder::new_64bit().file_alignment(0x300).build();
        let loader = load(LoaderConfig::default(), &data);
        assert_eq!(loader.loader_error(), Some(LoaderError::FileAlignmentNotPow2));
        assert!(loader.loader_errors().contains(&LoaderError::SectionAlignmentInvalid));

        let data = PeBuilder::new_64bit().file_alignment(0x2000).build();
        let loader = load(LoaderConfig::default(), &data);
        assert_eq!(loader.loader_error(), Some(LoaderError::SectionAlignmentTooSmall));

        let data = PeBuilder::new_64bit().file_alignment(0).build();
        let loader = load(LoaderConfig::default(), &data);
        assert_eq!(loader.loader_error(), Some(LoaderError::FileAlignmentZero));
    }

    #[test]
    fn test_image_base_alignment() {
        let data = PeBuilder::new_32bit().image_base(0x40_1000).build();
        let loader = load(LoaderConfig::default(), &data);
        assert_eq!(loader.loader_error(), Some(LoaderError::ImageBaseNotAligned));
        assert!(!loader.is_image_loadable());
        assert!(loader.is_image_mapped_ok());
    }

    #[test]
    fn test_size_of_image_limits() {
        let data = PeBuilder::new_64bit().size_of_image(0x7800_0000).build();
        let loader = load(LoaderConfig::default(), &data);
        assert_eq!(loader.loader_error(), Some(LoaderError::SizeOfImageTooBig));

        let data = PeBuilder::new_64bit().size_of_image(0x300).build();
        let loader = load(LoaderConfig::default(), &data);
        assert_eq!(loader.loader_error(), Some(LoaderError::SizeOfHeadersInvalid));
        assert!(loader.loader_errors().contains(&LoaderError::SizeOfImageZero));
    }

    #[test]
    fn test_machine_allow_lists() {
        let arm64 = PeBuilder::new_64bit().machine(machine::ARM64).build();
        assert!(load(LoaderConfig::default(), &arm64).is_image_loadable());
        assert_eq!(
            load(LoaderConfig::new(LoaderMode::Windows7), &arm64).loader_error(),
            Some(LoaderError::InvalidMachine64)
        );
        assert!(load(LoaderConfig::new(LoaderMode::Windows10), &arm64).is_image_loadable());

        let mips = PeBuilder::new_32bit().machine(machine::R4000).build();
        assert!(load(LoaderConfig::default(), &mips).is_image_loadable());
        assert_eq!(
            load(LoaderConfig::new(LoaderMode::Windows10), &mips).loader_error(),
            Some(LoaderError::InvalidMachine32)
        );

        let i386_as_64 = PeBuilder::new_64bit().machine(machine::I386).build();
        assert_eq!(
            load(LoaderConfig::default(), &i386_as_64).loader_error(),
            Some(LoaderError::InvalidMachine64)
        );
        assert!(ImageLoader::is_legacy_image_architecture(machine::ALPHA));
        assert!(!ImageLoader::is_legacy_image_architecture(machine::AMD64));
    }

    #[test]
    fn test_app_container_rule() {
        let data = PeBuilder::new_64bit()
            .dll_characteristics(DllCharacteristics::APPCONTAINER.bits())
            .single_subsection()
            .build();

        let win10 = load(LoaderConfig::new(LoaderMode::Windows10), &data);
        assert!(win10.is_bad_app_container());
        assert_eq!(win10.loader_error(), Some(LoaderError::ImageNonExecutable));

        let benevolent = load(LoaderConfig::default(), &data);
        assert!(benevolent.is_image_loadable());
    }

    #[test]
    fn test_optional_header_alignment_on_64bit_windows() {
        let data = PeBuilder::new_64bit().size_of_optional_header(0xF4).build();
        let loader = load(LoaderConfig::default().with_64bit_windows(), &data);
        assert!(loader
            .loader_errors()
            .contains(&LoaderError::SizeOfOptionalHeaderNotAligned));

        let loader = load(LoaderConfig::default(), &data);
        assert!(!loader
            .loader_errors()
            .contains(&LoaderError::SizeOfOptionalHeaderNotAligned));
    }

    #[test]
    fn test_image_block_and_pages() {
        let loader = load(LoaderConfig::default(), &PeBuilder::new_64bit().build());

        assert!(loader.is_valid_image_block(0x1000, 0x100));
        assert!(loader.is_valid_image_block(0x1F00, 0x100));
        assert!(!loader.is_valid_image_block(0x1F00, 0x101));
        assert!(!loader.is_valid_image_block(0x2000, 0));
        assert!(!loader.is_valid_image_block(0x10, u32::MAX));

        assert!(loader.is_good_mapped_page(0));
        assert!(loader.is_good_mapped_page(0x1fff));
        assert!(!loader.is_good_mapped_page(0x2000));
        assert!(!loader.is_zero_page(0x1000));
    }
}
