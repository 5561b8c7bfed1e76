//! # peloader Prelude
//!
//! The types needed for almost every use of the loader emulation: load an image, check
//! whether Windows would accept it, read from it and rebase it.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all peloader operations
pub use crate::Error;

/// The result type used throughout peloader
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The emulated image section
pub use crate::ImageLoader;

/// Loader settings and Windows version selection
pub use crate::{LoaderConfig, LoaderMode};

/// Conditions the Windows loader would complain about
pub use crate::LoaderError;

// ================================================================================================
// Headers and Pages
// ================================================================================================

/// Captured PE headers
pub use crate::{DataDirectory, DosHeader, FileHeader, OptionalHeader, SectionHeader};

/// Pages of the mapped image
pub use crate::FilePage;

/// Accessor policies and section protection
pub use crate::{PageProtection, StringPolicy};

// ================================================================================================
// Verification
// ================================================================================================

/// Comparison against images mapped by Windows
pub use crate::{CompareProgress, CompareReport, CompareResult, ImageCompare, PageVerifier};

/// Low-level file parsing utilities
pub use crate::{File, Parser};
