//! RVA accessors.
//!
//! Everything downstream code needs to read or patch the mapped image: raw reads and
//! writes, typed values, strings, pointers and the RVA to file offset translation.
//! No accessor fails on an out-of-range RVA. Reads outside the image transfer fewer bytes,
//! reads of invalid or zero pages return zeros, and writes to invalid pages are dropped.

use std::path::Path;

use bitflags::bitflags;
use log::debug;
use widestring::U16Str;

use super::{
    headers::{machine, SectionFlags, IMAGE_NT_OPTIONAL_HDR64_MAGIC},
    page::{PageChunks, PAGE_SIZE, SECTOR_SIZE},
    ImageContent, ImageLoader,
};
use crate::{
    file::io::{read_le, PeIO},
    Result,
};

bitflags! {
    /// Restrictions [`ImageLoader::read_string_raw`] applies to the bytes it reads.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StringPolicy: u32 {
        /// Every character must be printable ASCII
        const PRINTABLE = 0x1;
        /// The string must end with a NUL within the maximum length
        const TERMINATED = 0x2;
    }
}

bitflags! {
    /// Windows page protection constants (`PAGE_*`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageProtection: u32 {
        /// PAGE_NOACCESS
        const NOACCESS = 0x01;
        /// PAGE_READONLY
        const READONLY = 0x02;
        /// PAGE_READWRITE
        const READWRITE = 0x04;
        /// PAGE_WRITECOPY
        const WRITECOPY = 0x08;
        /// PAGE_EXECUTE
        const EXECUTE = 0x10;
        /// PAGE_EXECUTE_READ
        const EXECUTE_READ = 0x20;
        /// PAGE_EXECUTE_READWRITE
        const EXECUTE_READWRITE = 0x40;
        /// PAGE_EXECUTE_WRITECOPY
        const EXECUTE_WRITECOPY = 0x80;
    }
}

/// Protection of a section, indexed by its execute (1), read (2), write (4) and shared (8)
/// bits.
const PROTECTION_TABLE: [PageProtection; 16] = [
    PageProtection::NOACCESS,
    PageProtection::EXECUTE,
    PageProtection::READONLY,
    PageProtection::EXECUTE_READ,
    PageProtection::WRITECOPY,
    PageProtection::EXECUTE_WRITECOPY,
    PageProtection::WRITECOPY,
    PageProtection::EXECUTE_WRITECOPY,
    PageProtection::NOACCESS,
    PageProtection::EXECUTE,
    PageProtection::READONLY,
    PageProtection::EXECUTE_READ,
    PageProtection::READWRITE,
    PageProtection::EXECUTE_READWRITE,
    PageProtection::READWRITE,
    PageProtection::EXECUTE_READWRITE,
];

impl ImageLoader {
    /// End of the addressable image: `SizeOfImage` rounded to a page, but never past the
    /// mapped pages.
    fn image_limit(&self, page_count: usize) -> u64 {
        let page_size = u64::from(PAGE_SIZE);
        let image_size = u64::from(self.optional_header.size_of_image).div_ceil(page_size) * page_size;
        image_size.min(page_count as u64 * page_size)
    }

    /// Copies image bytes starting at `rva` into `buffer`.
    ///
    /// Returns the number of bytes transferred, which is less than `buffer.len()` if the
    /// range runs past the end of the image. Bytes of invalid and zero pages read as zero.
    pub fn read_image(&self, buffer: &mut [u8], rva: u32) -> usize {
        match &self.image {
            ImageContent::Mapped(pages) => {
                let chunks = PageChunks::new(rva, buffer.len(), self.image_limit(pages.len()));
                let total = chunks.total();
                for chunk in chunks {
                    let out = &mut buffer[chunk.buffer_offset..chunk.buffer_offset + chunk.len];
                    match pages.get(chunk.page) {
                        Some(page) => page.read(chunk.page_offset, out),
                        None => out.fill(0),
                    }
                }
                total
            }
            ImageContent::AsIs(data) => {
                let Some(offset) = self.file_offset_from_rva(rva) else {
                    return 0;
                };
                let offset = offset as usize;
                let len = buffer.len().min(data.len().saturating_sub(offset));
                if len != 0 {
                    buffer[..len].copy_from_slice(&data[offset..offset + len]);
                }
                len
            }
            ImageContent::Empty => 0,
        }
    }

    /// Copies `buffer` into the image at `rva`.
    ///
    /// Returns the number of bytes actually written. The range is truncated at the end of
    /// the image, and the parts landing on invalid pages are dropped.
    pub fn write_image(&mut self, buffer: &[u8], rva: u32) -> usize {
        let file_offset = self.file_offset_from_rva(rva);
        let limit = self.image_limit(self.page_count());

        match &mut self.image {
            ImageContent::Mapped(pages) => {
                let mut written = 0;
                for chunk in PageChunks::new(rva, buffer.len(), limit) {
                    let Some(page) = pages.get_mut(chunk.page) else {
                        continue;
                    };
                    if !page.is_accessible() {
                        continue;
                    }
                    page.write(
                        chunk.page_offset,
                        &buffer[chunk.buffer_offset..chunk.buffer_offset + chunk.len],
                    );
                    written += chunk.len;
                }
                written
            }
            ImageContent::AsIs(data) => {
                let Some(offset) = file_offset else {
                    return 0;
                };
                let offset = offset as usize;
                let len = buffer.len().min(data.len().saturating_sub(offset));
                if len != 0 {
                    data[offset..offset + len].copy_from_slice(&buffer[..len]);
                }
                len
            }
            ImageContent::Empty => 0,
        }
    }

    /// Reads a little-endian value at `rva`, or `None` if it does not fit into the image.
    #[must_use]
    pub fn read_value<T: PeIO>(&self, rva: u32) -> Option<T> {
        let mut buffer = [0u8; 8];
        let size = std::mem::size_of::<T>();
        if self.read_image(&mut buffer[..size], rva) != size {
            return None;
        }
        read_le::<T>(&buffer[..size]).ok()
    }

    /// Writes a little-endian value at `rva`. Returns false if it does not fit into the image.
    pub fn write_value<T: PeIO>(&mut self, rva: u32, value: T) -> bool {
        let bytes = value.to_le_bytes();
        let bytes = bytes.as_ref();
        self.write_image(bytes, rva) == bytes.len()
    }

    /// Length of the NUL-terminated string at `rva`, at most `max_length`.
    #[must_use]
    pub fn string_length(&self, rva: u32, max_length: usize) -> usize {
        let mut length = 0;
        let mut byte = [0u8; 1];

        while length < max_length {
            let Some(address) = u32::try_from(length)
                .ok()
                .and_then(|delta| rva.checked_add(delta))
            else {
                break;
            };
            if self.read_image(&mut byte, address) != 1 || byte[0] == 0 {
                break;
            }
            length += 1;
        }
        length
    }

    /// Reads the NUL-terminated string at `rva`, at most `max_length` bytes of it.
    #[must_use]
    pub fn read_string(&self, rva: u32, max_length: usize) -> String {
        let length = self.string_length(rva, max_length);
        let mut buffer = vec![0u8; length];
        let read = self.read_image(&mut buffer, rva);
        buffer.truncate(read);
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Reads a resource string: a 16-bit character count followed by UTF-16LE characters.
    #[must_use]
    pub fn read_string_rc(&self, rva: u32) -> String {
        let Some(count) = self.read_value::<u16>(rva) else {
            return String::new();
        };

        let mut bytes = vec![0u8; usize::from(count) * 2];
        let read = self.read_image(&mut bytes, rva.wrapping_add(2));
        let units: Vec<u16> = bytes[..read - read % 2]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        U16Str::from_slice(&units).to_string_lossy()
    }

    /// Reads a string straight from a file buffer at `offset`, applying `policy`.
    ///
    /// At most `max_length` bytes are examined. Returns `None` if `offset` is outside
    /// `data` or the bytes violate the policy.
    #[must_use]
    pub fn read_string_raw(
        data: &[u8],
        offset: usize,
        max_length: usize,
        policy: StringPolicy,
    ) -> Option<String> {
        let available = data.get(offset..)?;
        let window = &available[..available.len().min(max_length)];

        let (text, terminated) = match window.iter().position(|&b| b == 0) {
            Some(end) => (&window[..end], true),
            None => (window, false),
        };

        if policy.contains(StringPolicy::TERMINATED) && !terminated {
            return None;
        }
        if policy.contains(StringPolicy::PRINTABLE)
            && !text.iter().all(|&b| (0x20..0x7F).contains(&b))
        {
            return None;
        }

        Some(String::from_utf8_lossy(text).into_owned())
    }

    /// Reads a pointer-sized value at `rva`.
    #[must_use]
    pub fn read_pointer(&self, rva: u32) -> Option<u64> {
        if self.image_bitability() == 64 {
            self.read_value::<u64>(rva)
        } else {
            self.read_value::<u32>(rva).map(u64::from)
        }
    }

    /// Size of a pointer in the image, 4 or 8.
    #[must_use]
    pub fn pointer_size(&self) -> u32 {
        self.image_bitability() / 8
    }

    /// 64 for PE32+ images and 64-bit machine types, 32 otherwise.
    #[must_use]
    pub fn image_bitability(&self) -> u32 {
        if self.optional_header.magic == IMAGE_NT_OPTIONAL_HDR64_MAGIC {
            return 64;
        }

        match self.file_header.machine {
            machine::AMD64 | machine::IA64 | machine::ARM64 => 64,
            _ => 32,
        }
    }

    /// The import-by-ordinal flag of a thunk in this image.
    #[must_use]
    pub fn ordinal_mask(&self) -> u64 {
        if self.image_bitability() == 64 {
            1 << 63
        } else {
            1 << 31
        }
    }

    /// `ImageBase + rva`, truncated to 32 bits for 32-bit images.
    #[must_use]
    pub fn virtual_address_masked(&self, rva: u32) -> u64 {
        let address = self.optional_header.image_base.wrapping_add(u64::from(rva));
        if self.image_bitability() == 64 {
            address
        } else {
            address & u64::from(u32::MAX)
        }
    }

    /// Translates an RVA into an offset into the file.
    ///
    /// Looks for the first section whose raw data covers `rva`; RVAs inside the headers
    /// translate to themselves. Returns `None` for RVAs that have no file backing.
    #[must_use]
    pub fn file_offset_from_rva(&self, rva: u32) -> Option<u32> {
        if self.sections.is_empty() {
            return Some(rva);
        }

        for (index, section) in self.sections.iter().enumerate() {
            if section.pointer_to_raw_data == 0 || section.size_of_raw_data == 0 {
                continue;
            }

            let extent = if section.virtual_size == 0 {
                section.size_of_raw_data
            } else {
                section.virtual_size
            };
            let start = u64::from(section.virtual_address);
            let rva64 = u64::from(rva);
            if start <= rva64 && rva64 < start + u64::from(extent) {
                let delta = rva - section.virtual_address;
                if delta >= section.size_of_raw_data {
                    return None;
                }
                return self
                    .real_pointer_to_raw_data(index)
                    .and_then(|pointer| pointer.checked_add(delta));
            }
        }

        (rva < self.optional_header.size_of_headers).then_some(rva)
    }

    /// The raw data pointer of section `index` as the loader uses it.
    ///
    /// Section-aligned images read raw data from sector boundaries, so the pointer is
    /// rounded down to a sector. Single-subsection images are mapped flat and keep it as is.
    #[must_use]
    pub fn real_pointer_to_raw_data(&self, index: usize) -> Option<u32> {
        let section = self.sections.get(index)?;
        if self.optional_header.section_alignment >= PAGE_SIZE {
            Some(section.pointer_to_raw_data & !(SECTOR_SIZE - 1))
        } else {
            Some(section.pointer_to_raw_data)
        }
    }

    /// The page protection the loader gives a section with the given characteristics.
    #[must_use]
    pub fn image_protection(characteristics: u32) -> PageProtection {
        let flags = SectionFlags::from_bits_truncate(characteristics);
        let mut index = 0;
        if flags.contains(SectionFlags::MEM_EXECUTE) {
            index |= 1;
        }
        if flags.contains(SectionFlags::MEM_READ) {
            index |= 2;
        }
        if flags.contains(SectionFlags::MEM_WRITE) {
            index |= 4;
        }
        if flags.contains(SectionFlags::MEM_SHARED) {
            index |= 8;
        }
        PROTECTION_TABLE[index]
    }

    /// Writes the mapped image to `path` as one flat buffer.
    ///
    /// Invalid and zero pages are written as zeros. Returns the number of bytes written.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be written.
    pub fn dump_image(&self, path: impl AsRef<Path>) -> Result<usize> {
        let image = match &self.image {
            ImageContent::Mapped(pages) => {
                let mut image = vec![0u8; pages.len() * PAGE_SIZE as usize];
                for (page, out) in pages.iter().zip(image.chunks_exact_mut(PAGE_SIZE as usize)) {
                    page.read(0, out);
                }
                image
            }
            ImageContent::AsIs(data) => data.clone(),
            ImageContent::Empty => Vec::new(),
        };

        std::fs::write(path.as_ref(), &image)?;
        debug!("Dumped {} bytes to {}", image.len(), path.as_ref().display());
        Ok(image.len())
    }
}
