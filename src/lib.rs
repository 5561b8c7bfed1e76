// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # peloader
//!
//! An emulation of the Windows image loader. Given the raw bytes of a Portable Executable,
//! `peloader` reconstructs the page-granular memory layout Windows produces when it maps the
//! file as an image section, decides whether a given Windows version would accept the file at
//! all, and can rebase the mapped image to another address.
//!
//! The emulation is not a parser for PE directories. Imports, exports, resources and the like
//! are left to downstream code, which reads them through the RVA accessors of
//! [`ImageLoader`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peloader::prelude::*;
//!
//! let mut loader = ImageLoader::new(LoaderConfig::new(LoaderMode::Windows10));
//! loader.load_file("tests/samples/sample.exe", false)?;
//!
//! if loader.is_image_loadable() {
//!     let mut entry = [0u8; 16];
//!     loader.read_image(&mut entry, loader.address_of_entry_point());
//! } else {
//!     println!("Rejected: {:?}", loader.loader_error());
//! }
//! # Ok::<(), peloader::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`file`] - Input backends and little-endian primitives
//! - [`image`] - Header capture, section mapping, accessors, loader rules, relocation and
//!   the comparison against real Windows mappings
//! - [`Error`] and [`Result`] - Hard failures; soft loader complaints are [`LoaderError`]s

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use peloader::prelude::*;
///
/// let mut loader = ImageLoader::default();
/// loader.load_file("tests/samples/sample.dll", true)?;
/// println!("Machine: {:#x}", loader.machine());
/// # Ok::<(), peloader::Error>(())
/// ```
pub mod prelude;

/// Input handling: file and memory backends, the byte [`Parser`] and little-endian helpers.
///
/// # Example
///
/// ```rust
/// use peloader::File;
///
/// let file = File::from_mem(b"MZ\x90\x00".to_vec())?;
/// assert_eq!(file.len(), 4);
/// # Ok::<(), peloader::Error>(())
/// ```
pub mod file;

/// The image loader emulation.
///
/// # Key Components
///
/// - [`ImageLoader`] - Captured headers, mapped pages and every operation on them
/// - [`image::config`] - Windows version selection and loader strictness
/// - [`image::status`] - The [`LoaderError`] catalogue
/// - [`image::page`] - The page store and alignment helpers
/// - [`image::compare`] - Verification against images mapped by Windows
///
/// # Example
///
/// ```rust,no_run
/// use peloader::{ImageLoader, LoaderConfig, LoaderMode};
///
/// let data = std::fs::read("tests/samples/sample.dll")?;
/// let mut loader = ImageLoader::new(LoaderConfig::new(LoaderMode::Windows7).with_64bit_windows());
/// loader.load(&data, false)?;
///
/// for section in loader.sections() {
///     println!("{:8} {:#010x} {:#010x}", section.section_name, section.virtual_address, section.virtual_size);
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub mod image;

/// `peloader` Result type.
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `peloader` Error type.
///
/// # Example
///
/// ```rust,no_run
/// use peloader::{Error, ImageLoader};
///
/// let mut loader = ImageLoader::default();
/// match loader.load_file("tests/samples/sample.exe", false) {
///     Ok(()) => println!("Captured, loader error: {:?}", loader.loader_error()),
///     Err(Error::NotSupported) => println!("Not a PE image"),
///     Err(Error::Malformed { message, .. }) => println!("Malformed: {}", message),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

/// The emulated image section and its configuration.
pub use image::{
    config::{LoaderConfig, LoaderMode},
    status::LoaderError,
    ImageLoader,
};

/// Types of the captured headers and the page store.
pub use image::{
    access::{PageProtection, StringPolicy},
    compare::{CompareProgress, CompareReport, CompareResult, ImageCompare, PageVerifier},
    headers::{DataDirectory, DosHeader, FileHeader, OptionalHeader, SectionHeader},
    page::FilePage,
};

/// Provides access to low-level file and memory parsing utilities.
pub use file::{parser::Parser, File};
