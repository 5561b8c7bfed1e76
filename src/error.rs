use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which covers every hard failure this library can return.
///
/// Hard failures are the cases where an operation cannot produce a result at all: the input
/// is not a PE image, the input could not be read, or a relocation request has to be refused.
/// Everything the Windows loader itself would merely complain about is *not* an [`Error`]; those
/// conditions are recorded as [`crate::LoaderError`] values on the [`crate::ImageLoader`] and the
/// load continues in a degraded, best-effort state.
///
/// # Error Categories
///
/// ## Input Errors
/// - [`Error::NotSupported`] - The input is not a PE image
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::Malformed`] - The input is too damaged to be captured at all
/// - [`Error::OutOfBounds`] - Attempted to read beyond the input buffer
/// - [`Error::FileTooBig`] - The input exceeds the 4 GiB PE limit
///
/// ## I/O Errors
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// ## Image Errors
/// - [`Error::Relocation`] - The mapped image cannot be moved to a new base
///
/// # Examples
///
/// ```rust,no_run
/// use peloader::{Error, ImageLoader};
///
/// let mut loader = ImageLoader::default();
/// match loader.load_file("sample.exe", false) {
///     Ok(()) => println!("mapped {} pages", loader.page_count()),
///     Err(Error::NotSupported) => eprintln!("not a PE image"),
///     Err(Error::FileError(io_err)) => eprintln!("I/O error: {}", io_err),
///     Err(e) => eprintln!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input does not carry the `MZ` or `PE\0\0` signatures.
    ///
    /// The Windows loader refuses such a file before looking at anything else, so no
    /// partial image is produced.
    #[error("This file type is not supported")]
    NotSupported,

    /// The input is damaged beyond the point where headers can be captured.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading the input.
    #[error("Out of Bound read would have occurred! - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// The input is larger than the 4 GiB a PE image can describe.
    #[error("The input is too big to be a PE image - {0} bytes")]
    FileTooBig(u64),

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that occur while opening, memory-mapping or
    /// reading the input, and while dumping the mapped image.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The image cannot be relocated.
    ///
    /// Returned by [`crate::ImageLoader::relocate_image`] when the image carries no usable
    /// relocation information, when it may not be moved, or when a relocation block is
    /// damaged. The mapped image is left untouched in every case.
    #[error("Relocation failed - {0}")]
    Relocation(String),
}
