//! The page store of a mapped image.
//!
//! A mapped image is a sequence of [`FilePage`]s, each covering [`PAGE_SIZE`] bytes of
//! virtual address space starting at RVA `index * PAGE_SIZE`. A page is either not part of
//! the image at all ([`FilePage::Invalid`]), logically present but never backed by file bytes
//! ([`FilePage::Zero`]), or backed by its own copy of the data ([`FilePage::Valid`]).
//!
//! This module also hosts the alignment helpers shared by capture, mapping and the
//! accessors, and the [`PageChunks`] walker that splits an RVA range at page boundaries.

/// Size of one page of the mapped image.
pub const PAGE_SIZE: u32 = 0x1000;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SIZE_SHIFT: u32 = 12;

/// Granularity the raw data pointers of sections are rounded down to.
pub const SECTOR_SIZE: u32 = 0x200;

/// Rounds `value` up to a multiple of `alignment`.
///
/// `alignment` is expected to be a power of two. The arithmetic wraps, so a zero alignment
/// yields zero and values near `u32::MAX` wrap around, exactly as the 32-bit loader
/// computes them.
#[must_use]
pub fn align_to_size(value: u32, alignment: u32) -> u32 {
    let mask = alignment.wrapping_sub(1);
    value.wrapping_add(mask) & !mask
}

/// Number of pages needed to hold `size` bytes.
#[must_use]
pub fn bytes_to_pages(size: u32) -> u32 {
    (size >> PAGE_SIZE_SHIFT) + u32::from((size & (PAGE_SIZE - 1)) != 0)
}

/// One page of a mapped image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FilePage {
    /// Not covered by the header or any section. Reads return zeros, writes are dropped.
    #[default]
    Invalid,
    /// Part of the image, but not backed by file data. Reads return zeros; the first write
    /// turns it into a [`FilePage::Valid`] page.
    Zero,
    /// Backed by exactly [`PAGE_SIZE`] bytes.
    Valid(Box<[u8]>),
}

impl FilePage {
    /// Creates a valid page from up to one page of `bytes`, zero-padding the tail.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> FilePage {
        let mut data = vec![0u8; PAGE_SIZE as usize].into_boxed_slice();
        let len = bytes.len().min(data.len());
        data[..len].copy_from_slice(&bytes[..len]);
        FilePage::Valid(data)
    }

    /// Returns true unless the page is [`FilePage::Invalid`].
    #[must_use]
    pub fn is_accessible(&self) -> bool {
        !matches!(self, FilePage::Invalid)
    }

    /// Returns true for a [`FilePage::Zero`] page.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        matches!(self, FilePage::Zero)
    }

    /// Returns the page contents of a [`FilePage::Valid`] page.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            FilePage::Valid(data) => Some(data),
            _ => None,
        }
    }

    /// Copies page bytes starting at `offset` into `out`; unbacked bytes read as zero.
    ///
    /// The range `offset..offset + out.len()` must lie within the page.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        match self {
            FilePage::Valid(data) => out.copy_from_slice(&data[offset..offset + out.len()]),
            FilePage::Zero | FilePage::Invalid => out.fill(0),
        }
    }

    /// Copies `bytes` into the page at `offset`.
    ///
    /// Writes to an invalid page are ignored; a zero page is materialized first. The range
    /// `offset..offset + bytes.len()` must lie within the page.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        if self.is_zero() {
            *self = FilePage::from_bytes(&[]);
        }

        if let FilePage::Valid(data) = self {
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }
}

/// A piece of an RVA range that lies within a single page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageChunk {
    /// Index of the page
    pub page: usize,
    /// Offset of the chunk within the page
    pub page_offset: usize,
    /// Offset of the chunk within the caller's buffer
    pub buffer_offset: usize,
    /// Length of the chunk
    pub len: usize,
}

/// Splits `rva..rva + len` into per-page chunks, truncated at `limit`.
///
/// This is the single place where an RVA range is mapped onto the page store. Ranges that
/// start at or beyond `limit` yield nothing.
#[derive(Clone, Debug)]
pub struct PageChunks {
    start: u64,
    next: u64,
    end: u64,
}

impl PageChunks {
    /// Walks `len` bytes starting at `rva`, never past `limit`.
    #[must_use]
    pub fn new(rva: u32, len: usize, limit: u64) -> PageChunks {
        let start = u64::from(rva);
        let end = start.saturating_add(len as u64).min(limit);
        PageChunks {
            start,
            next: start,
            end,
        }
    }

    /// Number of bytes the walk covers in total.
    #[must_use]
    pub fn total(&self) -> usize {
        usize::try_from(self.end.saturating_sub(self.start)).unwrap_or(usize::MAX)
    }
}

impl Iterator for PageChunks {
    type Item = PageChunk;

    #[allow(clippy::cast_possible_truncation)]
    fn next(&mut self) -> Option<PageChunk> {
        if self.next >= self.end {
            return None;
        }

        let page_size = u64::from(PAGE_SIZE);
        let page_offset = self.next % page_size;
        let len = (page_size - page_offset).min(self.end - self.next);
        let chunk = PageChunk {
            page: (self.next / page_size) as usize,
            page_offset: page_offset as usize,
            buffer_offset: (self.next - self.start) as usize,
            len: len as usize,
        };

        self.next += len;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to_size() {
        assert_eq!(align_to_size(0x50, PAGE_SIZE), 0x1000);
        assert_eq!(align_to_size(0x1000, PAGE_SIZE), 0x1000);
        assert_eq!(align_to_size(0, PAGE_SIZE), 0);
        assert_eq!(align_to_size(0x201, SECTOR_SIZE), 0x400);
        assert_eq!(align_to_size(0x1234, 0), 0);
        assert_eq!(align_to_size(0xFFFF_F001, PAGE_SIZE), 0);
    }

    #[test]
    fn test_bytes_to_pages() {
        assert_eq!(bytes_to_pages(0), 0);
        assert_eq!(bytes_to_pages(1), 1);
        assert_eq!(bytes_to_pages(0x1000), 1);
        assert_eq!(bytes_to_pages(0x1001), 2);
        assert_eq!(bytes_to_pages(u32::MAX), 0x10_0000);
    }

    #[test]
    fn test_page_states() {
        let mut buffer = [0xFFu8; 4];

        let invalid = FilePage::Invalid;
        invalid.read(0, &mut buffer);
        assert_eq!(buffer, [0; 4]);
        assert!(!invalid.is_accessible());

        let zero = FilePage::Zero;
        assert!(zero.is_accessible());
        assert!(zero.data().is_none());

        let valid = FilePage::from_bytes(&[1, 2, 3]);
        valid.read(1, &mut buffer);
        assert_eq!(buffer, [2, 3, 0, 0]);
        assert_eq!(valid.data().unwrap().len(), PAGE_SIZE as usize);
    }

    #[test]
    fn test_page_write() {
        let mut invalid = FilePage::Invalid;
        invalid.write(0, &[1, 2]);
        assert_eq!(invalid, FilePage::Invalid);

        let mut zero = FilePage::Zero;
        zero.write(0xFFE, &[0xAA, 0xBB]);
        let data = zero.data().unwrap();
        assert_eq!(&data[0xFFE..], &[0xAA, 0xBB]);
        assert!(data[..0xFFE].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_chunks_split() {
        let chunks: Vec<PageChunk> = PageChunks::new(0xFF0, 0x20, 0x3000).collect();
        assert_eq!(
            chunks,
            vec![
                PageChunk {
                    page: 0,
                    page_offset: 0xFF0,
                    buffer_offset: 0,
                    len: 0x10
                },
                PageChunk {
                    page: 1,
                    page_offset: 0,
                    buffer_offset: 0x10,
                    len: 0x10
                },
            ]
        );
    }

    #[test]
    fn test_page_chunks_truncated() {
        let chunks = PageChunks::new(0x1FF8, 0x100, 0x2000);
        assert_eq!(chunks.total(), 8);
        assert_eq!(chunks.count(), 1);

        let beyond = PageChunks::new(0x3000, 0x10, 0x2000);
        assert_eq!(beyond.total(), 0);
        assert_eq!(beyond.count(), 0);
    }
}
