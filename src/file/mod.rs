//! Input sources for the image loader.
//!
//! The loader captures an image from one contiguous, read-only byte buffer. This module
//! abstracts over where that buffer comes from and provides the low-level reading utilities
//! the header capture is built on.
//!
//! # Key Components
//!
//! ## Core Types
//! - [`crate::file::File`] - A loaded input buffer, independent of its origin
//! - [`crate::file::Backend`] - Trait for different data sources (disk files, memory buffers)
//!
//! ## Parsing Infrastructure
//! - [`crate::file::parser::Parser`] - Cursor used to decode fixed-layout headers
//! - [`crate::file::io`] - Little-endian, bounds-checked read and write helpers
//!
//! # Data Sources
//!
//! - **Physical files** - Memory-mapped with `memmap2`, see [`crate::File::from_file`]
//! - **Memory buffers** - Owned buffers, see [`crate::File::from_mem`]
//! - **Streams** - Any `Read + Seek`, buffered from an offset, see [`crate::File::from_reader`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use peloader::File;
//!
//! let file = File::from_file("sample.exe")?;
//! println!("{} bytes, starts with {:?}", file.len(), file.data_slice(0, 2)?);
//! # Ok::<(), peloader::Error>(())
//! ```

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::{
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use crate::{
    Error::{Empty, FileTooBig},
    Result,
};
use memory::Memory;
use physical::Physical;

/// Largest input the loader accepts, matching the 32-bit size fields of the PE format.
pub const MAX_FILE_SIZE: u64 = 0xFFFF_FFFF;

/// Backend trait for the different input data sources.
///
/// Implementations hand out read-only views of the whole input. They must be `Send` and
/// `Sync` so that a loaded [`File`] can move between threads.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the full data.
    fn data(&self) -> &[u8];

    /// Returns the length of the data.
    fn len(&self) -> usize;
}

/// A loaded input buffer.
///
/// `File` only owns bytes; it does not interpret them. The [`crate::ImageLoader`] captures
/// headers and pages from [`File::data`] and does not keep the `File` afterwards.
pub struct File {
    data: Box<dyn Backend>,
}

impl File {
    /// Memory-map a file from disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or mapped,
    /// [`crate::Error::Empty`] for an empty file and [`crate::Error::FileTooBig`] above 4 GiB.
    pub fn from_file(path: impl AsRef<Path>) -> Result<File> {
        Self::load(Physical::new(path)?)
    }

    /// Wrap an owned buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] for an empty buffer and [`crate::Error::FileTooBig`]
    /// above 4 GiB.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        Self::load(Memory::new(data))
    }

    /// Buffer everything from `offset` to the end of a seekable stream.
    ///
    /// The size is checked before anything is read, so oversized streams are rejected
    /// without buffering them.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset` lies past the end of the stream,
    /// [`crate::Error::FileTooBig`] if more than 4 GiB remain, and
    /// [`crate::Error::FileError`] for I/O failures.
    pub fn from_reader<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<File> {
        let size = reader.seek(SeekFrom::End(0))?;
        if offset > size {
            return Err(out_of_bounds_error!());
        }

        let remaining = size - offset;
        if remaining > MAX_FILE_SIZE {
            return Err(FileTooBig(remaining));
        }

        reader.seek(SeekFrom::Start(offset))?;

        #[allow(clippy::cast_possible_truncation)]
        let mut data = Vec::with_capacity(remaining as usize);
        reader.read_to_end(&mut data)?;

        Self::load(Memory::new(data))
    }

    fn load<T: Backend + 'static>(backend: T) -> Result<File> {
        if backend.len() == 0 {
            return Err(Empty);
        }

        if backend.len() as u64 > MAX_FILE_SIZE {
            return Err(FileTooBig(backend.len() as u64));
        }

        Ok(File {
            data: Box::new(backend),
        })
    }

    /// Returns the size of the input in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the input holds no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Returns the whole input.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the input.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data.data_slice(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::Error;

    #[test]
    fn test_from_mem_empty() {
        assert!(matches!(File::from_mem(vec![]), Err(Error::Empty)));
    }

    #[test]
    fn test_from_reader_offset() {
        let mut stream = Cursor::new(vec![0xEE, 0xEE, 0x4D, 0x5A, 0x00]);
        let file = File::from_reader(&mut stream, 2).unwrap();
        assert_eq!(file.len(), 3);
        assert_eq!(file.data_slice(0, 2).unwrap(), b"MZ");
    }

    #[test]
    fn test_from_reader_offset_past_end() {
        let mut stream = Cursor::new(vec![0u8; 4]);
        assert!(matches!(
            File::from_reader(&mut stream, 5),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_from_reader_offset_at_end_is_empty() {
        let mut stream = Cursor::new(vec![0u8; 4]);
        assert!(matches!(File::from_reader(&mut stream, 4), Err(Error::Empty)));
    }
}
