//! Fixed-layout PE header structures.
//!
//! These are plain captured values: every field holds exactly what the file declares. All
//! validation happens in [`crate::image::capture`]; decoding here only moves bytes into
//! fields. The 32-bit and 64-bit optional headers are decoded into one [`OptionalHeader`]
//! whose `u64` fields are zero-extended for PE32 images.

use bitflags::bitflags;
use goblin::pe::{header, optional_header, section_table};

use crate::{file::parser::Parser, Result};

/// `MZ`
pub const IMAGE_DOS_SIGNATURE: u16 = header::DOS_MAGIC;
/// `PE\0\0`
pub const IMAGE_NT_SIGNATURE: u32 = header::PE_MAGIC;
/// Magic of a PE32 optional header.
pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = optional_header::MAGIC_32;
/// Magic of a PE32+ optional header.
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = optional_header::MAGIC_64;

/// Size of the MS-DOS header.
pub const IMAGE_DOS_HEADER_SIZE: u32 = 0x40;
/// Size of the COFF file header.
pub const IMAGE_FILE_HEADER_SIZE: u32 = 20;
/// Size of a complete PE32 optional header.
pub const IMAGE_OPTIONAL_HEADER32_SIZE: u32 = 224;
/// Size of a complete PE32+ optional header.
pub const IMAGE_OPTIONAL_HEADER64_SIZE: u32 = 240;
/// Size of one section table entry.
pub const IMAGE_SECTION_HEADER_SIZE: u32 = 40;
/// Size of one data directory entry.
pub const IMAGE_DATA_DIRECTORY_SIZE: u32 = 8;
/// Size of one COFF symbol table record.
pub const IMAGE_SIZEOF_COFF_SYMBOL: u32 = 18;
/// Number of data directory slots an optional header can hold.
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

/// Index of the certificate table directory.
pub const IMAGE_DIRECTORY_ENTRY_SECURITY: usize = 4;
/// Index of the base relocation directory.
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;

/// Offset of `CheckSum` within both optional header variants.
pub const OPTIONAL_HEADER_CHECKSUM_OFFSET: u32 = 64;
/// Offset of the data directory array within a PE32 optional header.
pub const OPTIONAL_HEADER32_DIRECTORY_OFFSET: u32 = 96;
/// Offset of the data directory array within a PE32+ optional header.
pub const OPTIONAL_HEADER64_DIRECTORY_OFFSET: u32 = 112;
/// Offset of `ImageBase` within a PE32 optional header.
pub const OPTIONAL_HEADER32_IMAGE_BASE_OFFSET: u32 = 28;
/// Offset of `ImageBase` within a PE32+ optional header.
pub const OPTIONAL_HEADER64_IMAGE_BASE_OFFSET: u32 = 24;
/// Offset of `PointerToRawData` within a section table entry.
pub const SECTION_HEADER_POINTER_TO_RAW_DATA_OFFSET: u32 = 20;

/// `IMAGE_FILE_HEADER::Machine` values the loader knows about.
#[allow(missing_docs)]
pub mod machine {
    use goblin::pe::header;

    pub const UNKNOWN: u16 = 0;
    pub const I386: u16 = header::COFF_MACHINE_X86;
    pub const R3000: u16 = 0x0162;
    pub const R4000: u16 = 0x0166;
    pub const R10000: u16 = 0x0168;
    pub const WCEMIPSV2: u16 = 0x0169;
    pub const ALPHA: u16 = 0x0184;
    pub const SH3: u16 = 0x01a2;
    pub const SH3DSP: u16 = 0x01a3;
    pub const SH4: u16 = 0x01a6;
    pub const SH5: u16 = 0x01a8;
    pub const ARM: u16 = 0x01c0;
    pub const THUMB: u16 = 0x01c2;
    pub const ARMNT: u16 = header::COFF_MACHINE_ARMNT;
    pub const AM33: u16 = 0x01d3;
    pub const POWERPC: u16 = 0x01f0;
    pub const POWERPCFP: u16 = 0x01f1;
    pub const IA64: u16 = header::COFF_MACHINE_IA64;
    pub const MIPS16: u16 = 0x0266;
    pub const ALPHA64: u16 = 0x0284;
    pub const MIPSFPU: u16 = 0x0366;
    pub const MIPSFPU16: u16 = 0x0466;
    pub const TRICORE: u16 = 0x0520;
    pub const AMD64: u16 = header::COFF_MACHINE_X86_64;
    pub const M32R: u16 = 0x9041;
    pub const ARM64: u16 = header::COFF_MACHINE_ARM64;
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// `IMAGE_FILE_HEADER::Characteristics`
    pub struct FileCharacteristics: u16 {
        /// Relocation information was stripped from the file
        const RELOCS_STRIPPED = 0x0001;
        /// The file is executable
        const EXECUTABLE_IMAGE = 0x0002;
        /// The application can handle addresses above 2 GiB
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// The computer supports 32-bit words
        const MACHINE_32BIT = 0x0100;
        /// The image is a system file
        const SYSTEM = 0x1000;
        /// The image is a DLL
        const DLL = 0x2000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// `IMAGE_OPTIONAL_HEADER::DllCharacteristics`
    pub struct DllCharacteristics: u16 {
        /// The image can handle a high entropy 64-bit address space
        const HIGH_ENTROPY_VA = 0x0020;
        /// The image can be relocated at load time
        const DYNAMIC_BASE = 0x0040;
        /// Code integrity checks are enforced
        const FORCE_INTEGRITY = 0x0080;
        /// The image is compatible with data execution prevention
        const NX_COMPAT = 0x0100;
        /// The image must run inside an app container
        const APPCONTAINER = 0x1000;
        /// The image supports control flow guard
        const GUARD_CF = 0x4000;
        /// The image is terminal server aware
        const TERMINAL_SERVER_AWARE = 0x8000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Memory access bits of `IMAGE_SECTION_HEADER::Characteristics`
    pub struct SectionFlags: u32 {
        /// The section can be shared in memory
        const MEM_SHARED = section_table::IMAGE_SCN_MEM_SHARED;
        /// The section can be executed as code
        const MEM_EXECUTE = section_table::IMAGE_SCN_MEM_EXECUTE;
        /// The section can be read
        const MEM_READ = section_table::IMAGE_SCN_MEM_READ;
        /// The section can be written to
        const MEM_WRITE = section_table::IMAGE_SCN_MEM_WRITE;
    }
}

/// The MS-DOS header at the start of every image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    /// File offset of the NT headers
    pub e_lfanew: u32,
}

impl DosHeader {
    /// Decode the 64-byte DOS header at the parser position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 64 bytes are left.
    pub fn read(parser: &mut Parser) -> Result<DosHeader> {
        let mut header = DosHeader {
            e_magic: parser.read_le()?,
            e_cblp: parser.read_le()?,
            e_cp: parser.read_le()?,
            e_crlc: parser.read_le()?,
            e_cparhdr: parser.read_le()?,
            e_minalloc: parser.read_le()?,
            e_maxalloc: parser.read_le()?,
            e_ss: parser.read_le()?,
            e_sp: parser.read_le()?,
            e_csum: parser.read_le()?,
            e_ip: parser.read_le()?,
            e_cs: parser.read_le()?,
            e_lfarlc: parser.read_le()?,
            e_ovno: parser.read_le()?,
            ..DosHeader::default()
        };

        for value in &mut header.e_res {
            *value = parser.read_le()?;
        }
        header.e_oemid = parser.read_le()?;
        header.e_oeminfo = parser.read_le()?;
        for value in &mut header.e_res2 {
            *value = parser.read_le()?;
        }
        header.e_lfanew = parser.read_le()?;

        Ok(header)
    }
}

/// The COFF file header following the NT signature.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl FileHeader {
    /// Decode the 20-byte file header at the parser position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 20 bytes are left.
    pub fn read(parser: &mut Parser) -> Result<FileHeader> {
        Ok(FileHeader {
            machine: parser.read_le()?,
            number_of_sections: parser.read_le()?,
            time_date_stamp: parser.read_le()?,
            pointer_to_symbol_table: parser.read_le()?,
            number_of_symbols: parser.read_le()?,
            size_of_optional_header: parser.read_le()?,
            characteristics: parser.read_le()?,
        })
    }

    /// The characteristics as flags; unknown bits are dropped.
    #[must_use]
    pub fn flags(&self) -> FileCharacteristics {
        FileCharacteristics::from_bits_truncate(self.characteristics)
    }
}

/// One (RVA, size) slot of the data directory array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDirectory {
    /// RVA of the described structure
    pub virtual_address: u32,
    /// Size of the described structure
    pub size: u32,
}

/// The optional header, for both PE32 and PE32+ images.
///
/// `base_of_data` only exists in PE32 headers and is zero for PE32+.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct OptionalHeader {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    /// Directory count as declared by the file, before clamping
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [DataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

impl OptionalHeader {
    /// Decode an optional header of the layout selected by `is_64bit`.
    ///
    /// The magic is read as stored; callers decide whether it matches the layout.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the parser holds less than a complete
    /// header of that layout.
    pub fn read(parser: &mut Parser, is_64bit: bool) -> Result<OptionalHeader> {
        let mut header = OptionalHeader {
            magic: parser.read_le()?,
            major_linker_version: parser.read_le()?,
            minor_linker_version: parser.read_le()?,
            size_of_code: parser.read_le()?,
            size_of_initialized_data: parser.read_le()?,
            size_of_uninitialized_data: parser.read_le()?,
            address_of_entry_point: parser.read_le()?,
            base_of_code: parser.read_le()?,
            ..OptionalHeader::default()
        };

        if is_64bit {
            header.image_base = parser.read_le()?;
        } else {
            header.base_of_data = parser.read_le()?;
            header.image_base = u64::from(parser.read_le::<u32>()?);
        }

        header.section_alignment = parser.read_le()?;
        header.file_alignment = parser.read_le()?;
        header.major_operating_system_version = parser.read_le()?;
        header.minor_operating_system_version = parser.read_le()?;
        header.major_image_version = parser.read_le()?;
        header.minor_image_version = parser.read_le()?;
        header.major_subsystem_version = parser.read_le()?;
        header.minor_subsystem_version = parser.read_le()?;
        header.win32_version_value = parser.read_le()?;
        header.size_of_image = parser.read_le()?;
        header.size_of_headers = parser.read_le()?;
        header.check_sum = parser.read_le()?;
        header.subsystem = parser.read_le()?;
        header.dll_characteristics = parser.read_le()?;

        header.size_of_stack_reserve = read_size(parser, is_64bit)?;
        header.size_of_stack_commit = read_size(parser, is_64bit)?;
        header.size_of_heap_reserve = read_size(parser, is_64bit)?;
        header.size_of_heap_commit = read_size(parser, is_64bit)?;

        header.loader_flags = parser.read_le()?;
        header.number_of_rva_and_sizes = parser.read_le()?;
        for directory in &mut header.data_directory {
            directory.virtual_address = parser.read_le()?;
            directory.size = parser.read_le()?;
        }

        Ok(header)
    }

    /// Returns true for a PE32+ header.
    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.magic == IMAGE_NT_OPTIONAL_HDR64_MAGIC
    }

    /// The DLL characteristics as flags; unknown bits are dropped.
    #[must_use]
    pub fn dll_flags(&self) -> DllCharacteristics {
        DllCharacteristics::from_bits_truncate(self.dll_characteristics)
    }
}

fn read_size(parser: &mut Parser, is_64bit: bool) -> Result<u64> {
    if is_64bit {
        parser.read_le::<u64>()
    } else {
        Ok(u64::from(parser.read_le::<u32>()?))
    }
}

/// One entry of the section table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct SectionHeader {
    /// The raw 8-byte name field
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
    /// The resolved name, either from `name` or from the COFF string table
    pub section_name: String,
}

impl SectionHeader {
    /// Decode a 40-byte section table entry. `section_name` is left empty.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than 40 bytes are left.
    pub fn read(parser: &mut Parser) -> Result<SectionHeader> {
        Ok(SectionHeader {
            name: parser.read_bytes::<8>()?,
            virtual_size: parser.read_le()?,
            virtual_address: parser.read_le()?,
            size_of_raw_data: parser.read_le()?,
            pointer_to_raw_data: parser.read_le()?,
            pointer_to_relocations: parser.read_le()?,
            pointer_to_linenumbers: parser.read_le()?,
            number_of_relocations: parser.read_le()?,
            number_of_linenumbers: parser.read_le()?,
            characteristics: parser.read_le()?,
            section_name: String::new(),
        })
    }

    /// The memory access flags; all other characteristic bits are dropped.
    #[must_use]
    pub fn flags(&self) -> SectionFlags {
        SectionFlags::from_bits_truncate(self.characteristics)
    }
}
