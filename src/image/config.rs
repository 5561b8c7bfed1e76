//! Loader emulation settings.
//!
//! A [`LoaderConfig`] selects which Windows loader is emulated and how strict the header
//! checks are. [`LoaderConfig::new`] fills in the defaults of the chosen [`LoaderMode`];
//! the `with_*` methods override single checks afterwards.
//!
//! # Examples
//!
//! ```rust
//! use peloader::{LoaderConfig, LoaderMode};
//!
//! let config = LoaderConfig::new(LoaderMode::Windows7)
//!     .with_64bit_windows()
//!     .with_sizeof_image_must_match(false);
//!
//! assert_eq!(config.max_section_count, 192);
//! assert!(config.nt_headers_size_check);
//! assert!(!config.sizeof_image_must_match);
//! ```

use strum::EnumIter;

/// Mask selecting the Windows version of a packed loader flags value.
pub const LOADER_MODE_VERSION_MASK: u32 = 0x0FFF;

/// Bit of a packed loader flags value that selects 64-bit Windows.
pub const LOADER_MODE_64BIT_WINDOWS: u32 = 0x1000;

/// The Windows version whose image loader is emulated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, EnumIter)]
#[repr(u32)]
pub enum LoaderMode {
    /// No particular version; accept everything any version would map
    #[default]
    Benevolent = 0,
    /// Windows XP
    WindowsXP = 0x51,
    /// Windows 7
    Windows7 = 0x61,
    /// Windows 10
    Windows10 = 0xA0,
}

/// Settings of one [`crate::ImageLoader`].
///
/// Every field is public; the builder methods exist for readable call sites.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoaderConfig {
    /// The emulated Windows version
    pub mode: LoaderMode,

    /// Emulate the 64-bit flavor of the Windows version.
    ///
    /// Changes the rounding of single-subsection images and requires 8-byte aligned
    /// optional headers.
    pub is_64bit_windows: bool,

    /// Images with more sections are rejected as non-executable.
    pub max_section_count: u16,

    /// Require the file to hold a complete PE32-sized NT header.
    pub nt_headers_size_check: bool,

    /// Require `SizeOfImage` to be fully covered by the header and the sections.
    pub sizeof_image_must_match: bool,

    /// Reject app-container images that cannot get per-page protection.
    pub app_container_check: bool,

    /// Accept ARMNT and ARM64 images.
    pub load_arm_images: bool,

    /// Accept the machine types of the historical NT ports (MIPS, Alpha, PowerPC, SH, ...).
    pub legacy_architectures: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig::new(LoaderMode::Benevolent)
    }
}

impl LoaderConfig {
    /// Creates the default configuration of `mode`.
    #[must_use]
    pub fn new(mode: LoaderMode) -> Self {
        let benevolent = LoaderConfig {
            mode,
            is_64bit_windows: false,
            max_section_count: 255,
            nt_headers_size_check: false,
            sizeof_image_must_match: false,
            app_container_check: false,
            load_arm_images: true,
            legacy_architectures: true,
        };

        match mode {
            LoaderMode::Benevolent => benevolent,
            LoaderMode::WindowsXP => LoaderConfig {
                max_section_count: 96,
                sizeof_image_must_match: true,
                load_arm_images: false,
                legacy_architectures: false,
                ..benevolent
            },
            LoaderMode::Windows7 => LoaderConfig {
                max_section_count: 192,
                nt_headers_size_check: true,
                sizeof_image_must_match: true,
                load_arm_images: false,
                legacy_architectures: false,
                ..benevolent
            },
            LoaderMode::Windows10 => LoaderConfig {
                max_section_count: 192,
                nt_headers_size_check: true,
                app_container_check: true,
                legacy_architectures: false,
                ..benevolent
            },
        }
    }

    /// Decodes a packed flags value: the low 12 bits select the Windows version
    /// (0x51, 0x61 or 0xA0), [`LOADER_MODE_64BIT_WINDOWS`] selects 64-bit Windows.
    ///
    /// Unknown versions fall back to [`LoaderMode::Benevolent`].
    #[must_use]
    pub fn from_flags(flags: u32) -> Self {
        let mode = match flags & LOADER_MODE_VERSION_MASK {
            0x51 => LoaderMode::WindowsXP,
            0x61 => LoaderMode::Windows7,
            0xA0 => LoaderMode::Windows10,
            _ => LoaderMode::Benevolent,
        };

        let config = LoaderConfig::new(mode);
        if flags & LOADER_MODE_64BIT_WINDOWS != 0 {
            config.with_64bit_windows()
        } else {
            config
        }
    }

    /// The packed flags value of this configuration.
    #[must_use]
    pub fn flags(&self) -> u32 {
        let bitness = if self.is_64bit_windows {
            LOADER_MODE_64BIT_WINDOWS
        } else {
            0
        };
        self.mode as u32 | bitness
    }

    /// Emulate 64-bit Windows.
    #[must_use]
    pub fn with_64bit_windows(mut self) -> Self {
        self.is_64bit_windows = true;
        self
    }

    /// Override the maximum number of sections.
    #[must_use]
    pub fn with_max_section_count(mut self, count: u16) -> Self {
        self.max_section_count = count;
        self
    }

    /// Enable or disable the minimum NT header size check.
    #[must_use]
    pub fn with_nt_headers_size_check(mut self, enabled: bool) -> Self {
        self.nt_headers_size_check = enabled;
        self
    }

    /// Enable or disable the `SizeOfImage` coverage check.
    #[must_use]
    pub fn with_sizeof_image_must_match(mut self, enabled: bool) -> Self {
        self.sizeof_image_must_match = enabled;
        self
    }

    /// Enable or disable the app-container check.
    #[must_use]
    pub fn with_app_container_check(mut self, enabled: bool) -> Self {
        self.app_container_check = enabled;
        self
    }

    /// Accept or reject ARM images.
    #[must_use]
    pub fn with_arm_images(mut self, enabled: bool) -> Self {
        self.load_arm_images = enabled;
        self
    }

    /// Accept or reject legacy machine types.
    #[must_use]
    pub fn with_legacy_architectures(mut self, enabled: bool) -> Self {
        self.legacy_architectures = enabled;
        self
    }
}
