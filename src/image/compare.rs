//! Comparison against an image mapped by Windows.
//!
//! Test harnesses running on Windows map a file with `NtCreateSection(SEC_IMAGE)` and hand
//! the resulting view to [`ImageLoader::compare_with_windows_mapped_image`], which walks both
//! images page by page and reports the first divergence. Which pages of the Windows view are
//! accessible is decided by a caller supplied [`PageVerifier`].

use std::path::PathBuf;

use log::{debug, info};

use super::{
    headers::{IMAGE_FILE_HEADER_SIZE, IMAGE_SECTION_HEADER_SIZE, SECTION_HEADER_POINTER_TO_RAW_DATA_OFFSET},
    page::PAGE_SIZE,
    ImageContent, ImageLoader,
};
use crate::Result;

/// Decides whether a page of the Windows mapped image can be read.
pub trait PageVerifier {
    /// Returns true if the page at `rva` of the Windows image is accessible.
    fn is_accessible(&self, rva: u32) -> bool;
}

impl<F: Fn(u32) -> bool> PageVerifier for F {
    fn is_accessible(&self, rva: u32) -> bool {
        self(rva)
    }
}

/// Receives progress notifications while pages are compared.
pub trait CompareProgress {
    /// Called after each page with the number of bytes compared so far and the total
    /// number of bytes to compare.
    fn on_page(&mut self, compared: usize, total: usize);
}

impl<F: FnMut(usize, usize)> CompareProgress for F {
    fn on_page(&mut self, compared: usize, total: usize) {
        self(compared, total);
    }
}

/// Outcome of a comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareResult {
    /// Both loaders produced the same image, or both refused the file
    ImagesEqual,
    /// Windows mapped the file, the emulation refused it
    ImagesWindowsLoadedWeDidnt,
    /// The emulation mapped the file, Windows refused it
    ImagesWindowsDidntLoadWeDid,
    /// The images have different sizes
    ImagesDifferentSize,
    /// A page is accessible in one image only
    ImagesDifferentPageAccess,
    /// A page differs in content
    ImagesDifferentPageValue,
    /// The emulated image has no page layout to compare
    ImagesCompareInvalid,
}

/// Result of [`ImageLoader::compare_with_windows_mapped_image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompareReport {
    /// What was found
    pub result: CompareResult,
    /// RVA of the first differing byte, or of the first differing page for access mismatches
    pub difference_offset: Option<u32>,
}

impl CompareReport {
    fn new(result: CompareResult, difference_offset: Option<u32>) -> Self {
        CompareReport {
            result,
            difference_offset,
        }
    }
}

/// Options of one comparison.
#[derive(Default)]
pub struct ImageCompare<'a> {
    verifier: Option<&'a dyn PageVerifier>,
    progress: Option<&'a mut dyn CompareProgress>,
    dump_path: Option<PathBuf>,
}

impl<'a> ImageCompare<'a> {
    /// A comparison that treats every page of the Windows image as accessible.
    #[must_use]
    pub fn new() -> Self {
        ImageCompare::default()
    }

    /// Use `verifier` to probe the pages of the Windows image.
    #[must_use]
    pub fn with_verifier(mut self, verifier: &'a dyn PageVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Report progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: &'a mut dyn CompareProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Dump the emulated image to `path` if the images differ.
    #[must_use]
    pub fn dump_if_not_equal(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_path = Some(path.into());
        self
    }
}

impl ImageLoader {
    /// Compares the emulated image with `windows`, the image Windows mapped from the same
    /// file, or `None` if Windows refused to map it.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the images differ and dumping the emulated
    /// image fails.
    pub fn compare_with_windows_mapped_image(
        &self,
        windows: Option<&[u8]>,
        mut compare: ImageCompare,
    ) -> Result<CompareReport> {
        let report = self.compare_images(windows, &mut compare);

        if report.result != CompareResult::ImagesEqual {
            info!(
                "Image mismatch: {:?} at {:?}",
                report.result, report.difference_offset
            );
            if let Some(path) = &compare.dump_path {
                self.dump_image(path)?;
            }
        }
        Ok(report)
    }

    fn compare_images(&self, windows: Option<&[u8]>, compare: &mut ImageCompare) -> CompareReport {
        let loadable = self.is_image_loadable();
        let Some(windows) = windows else {
            let result = if loadable {
                CompareResult::ImagesWindowsDidntLoadWeDid
            } else {
                CompareResult::ImagesEqual
            };
            return CompareReport::new(result, None);
        };

        if !loadable {
            return CompareReport::new(CompareResult::ImagesWindowsLoadedWeDidnt, None);
        }

        let ImageContent::Mapped(pages) = &self.image else {
            return CompareReport::new(CompareResult::ImagesCompareInvalid, None);
        };

        let image_size = self.size_of_image_aligned() as usize;
        if windows.len() != image_size || pages.len() * (PAGE_SIZE as usize) < image_size {
            debug!(
                "Image sizes differ: windows {:#x}, emulated {image_size:#x}",
                windows.len()
            );
            return CompareReport::new(CompareResult::ImagesDifferentSize, None);
        }

        let mut ours = vec![0u8; PAGE_SIZE as usize];
        for (index, theirs) in windows.chunks(PAGE_SIZE as usize).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let rva = (index * PAGE_SIZE as usize) as u32;
            let page = &pages[index];

            let windows_accessible = compare
                .verifier
                .map_or(true, |verifier| verifier.is_accessible(rva));
            if page.is_accessible() != windows_accessible {
                return CompareReport::new(CompareResult::ImagesDifferentPageAccess, Some(rva));
            }

            if windows_accessible {
                page.read(0, &mut ours[..theirs.len()]);
                if let Some(offset) = self.mismatch_offset(&ours[..theirs.len()], theirs, rva) {
                    #[allow(clippy::cast_possible_truncation)]
                    let offset = rva + offset as u32;
                    return CompareReport::new(CompareResult::ImagesDifferentPageValue, Some(offset));
                }
            }

            if let Some(progress) = compare.progress.as_mut() {
                progress.on_page(index * (PAGE_SIZE as usize) + theirs.len(), image_size);
            }
        }

        CompareReport::new(CompareResult::ImagesEqual, None)
    }

    /// Offset of the first byte where `ours` and `theirs` differ, both starting at `rva`.
    ///
    /// The `PointerToRawData` fields of the section table are skipped; Windows rewrites them
    /// in the mapped header.
    #[must_use]
    pub fn mismatch_offset(&self, ours: &[u8], theirs: &[u8], rva: u32) -> Option<usize> {
        ours.iter()
            .zip(theirs)
            .enumerate()
            .find(|(offset, (a, b))| {
                a != b && {
                    #[allow(clippy::cast_possible_truncation)]
                    let address = rva.wrapping_add(*offset as u32);
                    !self.is_rva_of_section_pointer_to_raw_data(address)
                }
            })
            .map(|(offset, _)| offset)
            .or_else(|| (ours.len() != theirs.len()).then_some(ours.len().min(theirs.len())))
    }

    fn is_rva_of_section_pointer_to_raw_data(&self, rva: u32) -> bool {
        let table = u64::from(self.dos_header.e_lfanew)
            + 4
            + u64::from(IMAGE_FILE_HEADER_SIZE)
            + u64::from(self.file_header.size_of_optional_header);
        let rva = u64::from(rva);

        (0..self.sections.len() as u64).any(|index| {
            let field = table
                + index * u64::from(IMAGE_SECTION_HEADER_SIZE)
                + u64::from(SECTION_HEADER_POINTER_TO_RAW_DATA_OFFSET);
            (field..field + 4).contains(&rva)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::PeBuilder;

    fn mapped() -> (ImageLoader, Vec<u8>) {
        let mut loader = ImageLoader::default();
        loader.load(&PeBuilder::new_64bit().build(), false).unwrap();

        let mut image = vec![0u8; loader.size_of_image_aligned() as usize];
        loader.read_image(&mut image, 0);
        (loader, image)
    }

    #[test]
    fn test_identical_images() {
        let (loader, image) = mapped();
        let mut pages = Vec::new();
        let mut progress = |compared: usize, total: usize| pages.push((compared, total));

        let report = loader
            .compare_with_windows_mapped_image(
                Some(image.as_slice()),
                ImageCompare::new().with_progress(&mut progress),
            )
            .unwrap();
        assert_eq!(report.result, CompareResult::ImagesEqual);
        assert_eq!(report.difference_offset, None);
        assert_eq!(pages, vec![(0x1000, 0x2000), (0x2000, 0x2000)]);
    }

    #[test]
    fn test_value_mismatch() {
        let (loader, mut image) = mapped();
        image[0x1234] ^= 0xFF;

        let report = loader
            .compare_with_windows_mapped_image(Some(image.as_slice()), ImageCompare::new())
            .unwrap();
        assert_eq!(report.result, CompareResult::ImagesDifferentPageValue);
        assert_eq!(report.difference_offset, Some(0x1234));
    }

    #[test]
    fn test_pointer_to_raw_data_is_ignored() {
        let (loader, mut image) = mapped();
        // e_lfanew + signature + file header + optional header + PointerToRawData
        let field = 0x80 + 4 + 20 + 240 + 20;
        image[field..field + 4].copy_from_slice(&0x1000u32.to_le_bytes());

        let report = loader
            .compare_with_windows_mapped_image(Some(image.as_slice()), ImageCompare::new())
            .unwrap();
        assert_eq!(report.result, CompareResult::ImagesEqual);
    }

    #[test]
    fn test_access_and_size_mismatch() {
        let (loader, image) = mapped();
        let verifier = |rva: u32| rva == 0;

        let report = loader
            .compare_with_windows_mapped_image(
                Some(image.as_slice()),
                ImageCompare::new().with_verifier(&verifier),
            )
            .unwrap();
        assert_eq!(report.result, CompareResult::ImagesDifferentPageAccess);
        assert_eq!(report.difference_offset, Some(0x1000));

        let report = loader
            .compare_with_windows_mapped_image(Some(&image[..0x1000]), ImageCompare::new())
            .unwrap();
        assert_eq!(report.result, CompareResult::ImagesDifferentSize);
    }

    #[test]
    fn test_load_disagreement() {
        let (loader, _) = mapped();
        let report = loader
            .compare_with_windows_mapped_image(None, ImageCompare::new())
            .unwrap();
        assert_eq!(report.result, CompareResult::ImagesWindowsDidntLoadWeDid);

        let mut refused = ImageLoader::default();
        refused
            .load(&PeBuilder::new_64bit().image_base(0x1_4000_1000).build(), false)
            .unwrap();
        let report = refused
            .compare_with_windows_mapped_image(Some(&[0u8; 0x2000][..]), ImageCompare::new())
            .unwrap();
        assert_eq!(report.result, CompareResult::ImagesWindowsLoadedWeDidnt);

        let report = refused
            .compare_with_windows_mapped_image(None, ImageCompare::new())
            .unwrap();
        assert_eq!(report.result, CompareResult::ImagesEqual);
    }

    #[test]
    fn test_dump_on_mismatch() {
        let (loader, mut image) = mapped();
        image[0] = b'X';
        let path = std::env::temp_dir().join(format!("peloader_cmp_{}.bin", std::process::id()));

        let report = loader
            .compare_with_windows_mapped_image(
                Some(image.as_slice()),
                ImageCompare::new().dump_if_not_equal(&path),
            )
            .unwrap();
        assert_eq!(report.difference_offset, Some(0));
        assert_eq!(std::fs::read(&path).unwrap().len(), 0x2000);
        std::fs::remove_file(&path).unwrap();
    }
}
