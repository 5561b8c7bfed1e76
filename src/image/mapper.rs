//! Section mapping.
//!
//! Turns the captured header and section table into the page sequence of the mapped image.
//! Pages covered by raw file data become [`FilePage::Valid`], the rest of a section's
//! virtual extent (rounded to a page) becomes [`FilePage::Zero`], and everything no section
//! claims stays [`FilePage::Invalid`]. With a section alignment above the page size, the
//! pages between a section's last page and the next alignment boundary are such a gap.

use log::trace;

use super::{
    headers::SectionHeader,
    page::{FilePage, PAGE_SIZE, SECTOR_SIZE},
    status::LoaderError,
};

/// Builds the page sequence of one image.
pub(crate) struct SectionMapper<'a> {
    data: &'a [u8],
    section_alignment: u32,
    pages: Vec<FilePage>,
    errors: Vec<LoaderError>,
}

impl<'a> SectionMapper<'a> {
    /// A mapper for an image of `page_count` pages, all invalid until claimed.
    pub(crate) fn new(data: &'a [u8], page_count: usize, section_alignment: u32) -> Self {
        SectionMapper {
            data,
            section_alignment,
            pages: vec![FilePage::Invalid; page_count],
            errors: Vec::new(),
        }
    }

    fn image_end(&self) -> u64 {
        self.pages.len() as u64 * u64::from(PAGE_SIZE)
    }

    /// Maps the headers as a pseudo-section starting at RVA 0.
    pub(crate) fn map_header(&mut self, size_of_headers: u32) {
        self.map_range(0, size_of_headers, 0, size_of_headers, true);
    }

    /// Maps one entry of the section table.
    pub(crate) fn map_section(&mut self, section: &SectionHeader) {
        self.map_range(
            section.virtual_address,
            section.virtual_size,
            section.pointer_to_raw_data,
            section.size_of_raw_data,
            false,
        );
    }

    /// Maps the file one to one, as the loader does for images whose section alignment is
    /// below the page size.
    pub(crate) fn map_flat(&mut self, image_size: u32) {
        let size = (image_size as usize).min(self.data.len());
        for (index, page) in self.pages.iter_mut().enumerate() {
            let start = index * PAGE_SIZE as usize;
            *page = if start < size {
                let end = (start + PAGE_SIZE as usize).min(size);
                FilePage::from_bytes(&self.data[start..end])
            } else {
                FilePage::Zero
            };
        }
    }

    fn map_range(
        &mut self,
        virtual_address: u32,
        virtual_size: u32,
        pointer_to_raw_data: u32,
        size_of_raw_data: u32,
        is_header: bool,
    ) {
        let page_size = u64::from(PAGE_SIZE);
        let image_end = self.image_end();
        let start = u64::from(virtual_address);

        if !is_header && (start % page_size != 0 || start >= image_end) {
            trace!("Section at {virtual_address:#x} lies outside the image, skipped");
            self.errors.push(LoaderError::InvalidSectionVa);
            return;
        }

        let virtual_size = if virtual_size == 0 {
            size_of_raw_data
        } else {
            virtual_size
        };
        let virtual_size = u64::from(virtual_size).div_ceil(page_size) * page_size;
        let end = (start + virtual_size).min(image_end);

        let raw_size = u64::from(size_of_raw_data).min(virtual_size);
        let raw_start = u64::from(pointer_to_raw_data & !(SECTOR_SIZE - 1));
        let file_size = self.data.len() as u64;

        if !is_header && raw_size != 0 && raw_start >= file_size {
            trace!(
                "Raw data of section at {virtual_address:#x} starts at {raw_start:#x}, past the end of the file"
            );
            self.errors.push(LoaderError::RawDataOutOfFile);
            return;
        }
        let raw_end = (raw_start + raw_size).min(file_size);

        #[allow(clippy::cast_possible_truncation)]
        for rva in (start..end).step_by(PAGE_SIZE as usize) {
            let offset = rva - start;
            let page_start = raw_start + offset;
            let page = if offset < raw_size && page_start < raw_end {
                let page_end = (page_start + page_size).min(raw_end);
                FilePage::from_bytes(&self.data[page_start as usize..page_end as usize])
            } else {
                FilePage::Zero
            };
            self.pages[(rva / page_size) as usize] = page;
        }

        trace!(
            "Mapped {} at {virtual_address:#x}..{end:#x} (alignment {:#x})",
            if is_header { "headers" } else { "section" },
            self.section_alignment
        );
    }

    /// Hands out the page sequence and the errors found while mapping.
    pub(crate) fn finish(self) -> (Vec<FilePage>, Vec<LoaderError>) {
        (self.pages, self.errors)
    }
}
