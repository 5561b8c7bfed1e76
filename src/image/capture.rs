//! Header capture.
//!
//! Reads the DOS header, the NT headers and the section table out of the input buffer and
//! records every deviation the Windows loader checks for. Capture only stops early when the
//! input is not a PE image at all, or when the NT headers are not inside the file; in every
//! other case the captured values are kept as the file declares them and mapping continues.

use std::ops::ControlFlow;

use log::trace;

use super::{
    headers::{
        DosHeader, FileCharacteristics, FileHeader, OptionalHeader, SectionHeader,
        IMAGE_DATA_DIRECTORY_SIZE, IMAGE_DIRECTORY_ENTRY_SECURITY, IMAGE_DOS_HEADER_SIZE,
        IMAGE_DOS_SIGNATURE, IMAGE_FILE_HEADER_SIZE, IMAGE_NT_OPTIONAL_HDR32_MAGIC,
        IMAGE_NT_OPTIONAL_HDR64_MAGIC, IMAGE_NT_SIGNATURE, IMAGE_NUMBEROF_DIRECTORY_ENTRIES,
        IMAGE_OPTIONAL_HEADER32_SIZE, IMAGE_OPTIONAL_HEADER64_SIZE, IMAGE_SECTION_HEADER_SIZE,
        IMAGE_SIZEOF_COFF_SYMBOL, OPTIONAL_HEADER32_DIRECTORY_OFFSET,
        OPTIONAL_HEADER64_DIRECTORY_OFFSET, OPTIONAL_HEADER_CHECKSUM_OFFSET,
    },
    page::{align_to_size, bytes_to_pages, PAGE_SIZE},
    status::LoaderError,
    ImageLoader,
};
use crate::{
    file::{io::read_le_at, parser::Parser},
    image::access::StringPolicy,
    Error, Result,
};

/// Longest section name resolved through the COFF string table.
pub const MAX_SECTION_NAME_LENGTH: usize = 1024;

impl ImageLoader {
    pub(crate) fn capture_dos_header(&mut self, data: &[u8]) -> Result<()> {
        if data.len() <= IMAGE_DOS_HEADER_SIZE as usize {
            return Err(malformed_error!(
                "The file is too small to hold a DOS header - {} bytes",
                data.len()
            ));
        }

        let header = DosHeader::read(&mut Parser::new(data))?;
        if header.e_magic != IMAGE_DOS_SIGNATURE {
            return Err(Error::NotSupported);
        }

        if header.e_lfanew & 3 != 0 {
            self.set_loader_error(LoaderError::ELfanewUnaligned);
        }
        if header.e_lfanew as usize > data.len() {
            self.set_loader_error(LoaderError::ELfanewOutOfFile);
        }

        self.dos_header = header;
        Ok(())
    }

    /// Captures signature, file header and optional header.
    ///
    /// Breaks when the NT headers are not inside the file; nothing after them can be
    /// captured in that case.
    pub(crate) fn capture_nt_headers(&mut self, data: &[u8]) -> Result<ControlFlow<()>> {
        let file_size = data.len() as u64;
        let e_lfanew = self.dos_header.e_lfanew;
        let nt_offset = u64::from(e_lfanew);
        let nt_headers_size = 4 + IMAGE_FILE_HEADER_SIZE + IMAGE_OPTIONAL_HEADER32_SIZE;

        if e_lfanew.checked_add(nt_headers_size).is_none() {
            self.set_loader_error(LoaderError::NtHeaderOffsetOverflow);
            return Ok(ControlFlow::Break(()));
        }

        if self.config.nt_headers_size_check && nt_offset + u64::from(nt_headers_size) > file_size
        {
            self.set_loader_error(LoaderError::NtHeaderOutOfFile);
            return Ok(ControlFlow::Break(()));
        }

        if nt_offset + 4 >= file_size {
            self.set_loader_error(LoaderError::NtHeaderOutOfFile);
            return Ok(ControlFlow::Break(()));
        }

        let mut offset = nt_offset as usize;
        let signature = read_le_at::<u32>(data, &mut offset)?;
        if signature != IMAGE_NT_SIGNATURE {
            self.set_loader_error(LoaderError::NoNtSignature);
            return Err(Error::NotSupported);
        }
        self.nt_signature = signature;

        if nt_offset + 4 + u64::from(IMAGE_FILE_HEADER_SIZE) >= file_size {
            self.set_loader_error(LoaderError::NtHeaderOutOfFile);
            return Ok(ControlFlow::Break(()));
        }

        let mut parser = Parser::new(data);
        parser.seek(offset)?;
        let file_header = FileHeader::read(&mut parser)?;

        if file_header.machine == 0 && file_header.size_of_optional_header == 0 {
            self.set_loader_error(LoaderError::FileHeaderInvalid);
        }
        if !file_header
            .flags()
            .contains(FileCharacteristics::EXECUTABLE_IMAGE)
        {
            self.set_loader_error(LoaderError::ImageNonExecutable);
        }
        if file_header.number_of_sections > self.config.max_section_count {
            self.set_loader_error(LoaderError::ImageNonExecutable);
        }
        self.file_header = file_header;

        let optional_offset = parser.pos();
        let magic = parser.peek_le::<u16>().unwrap_or(0);
        self.capture_optional_header(data, optional_offset, magic == IMAGE_NT_OPTIONAL_HDR64_MAGIC)?;
        self.headers_captured = true;

        for violation in self.nt_header_violations() {
            self.set_loader_error(violation);
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Decodes the optional header from a zero-padded copy, so that a header cut by the end
    /// of the file reads as zeros past the cut.
    fn capture_optional_header(&mut self, data: &[u8], offset: usize, is_64bit: bool) -> Result<()> {
        let (header_size, expected_magic, directory_offset) = if is_64bit {
            (
                IMAGE_OPTIONAL_HEADER64_SIZE,
                IMAGE_NT_OPTIONAL_HDR64_MAGIC,
                OPTIONAL_HEADER64_DIRECTORY_OFFSET,
            )
        } else {
            (
                IMAGE_OPTIONAL_HEADER32_SIZE,
                IMAGE_NT_OPTIONAL_HDR32_MAGIC,
                OPTIONAL_HEADER32_DIRECTORY_OFFSET,
            )
        };

        let mut buffer = vec![0u8; header_size as usize];
        let available = data.len().saturating_sub(offset).min(buffer.len());
        buffer[..available].copy_from_slice(&data[offset..offset + available]);

        let mut header = OptionalHeader::read(&mut Parser::new(&buffer), is_64bit)?;
        if header.magic != expected_magic {
            self.set_loader_error(LoaderError::NoOptionalHeaderMagic);
            return Ok(());
        }

        let declared = header
            .number_of_rva_and_sizes
            .min(IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32);
        let header_room = u32::from(self.file_header.size_of_optional_header)
            .saturating_sub(directory_offset)
            / IMAGE_DATA_DIRECTORY_SIZE;
        let directory_file_offset = offset as u64 + u64::from(directory_offset);
        let file_room = (data.len() as u64).saturating_sub(directory_file_offset)
            / u64::from(IMAGE_DATA_DIRECTORY_SIZE);

        #[allow(clippy::cast_possible_truncation)]
        let real = declared.min(header_room).min(file_room.min(u64::from(u32::MAX)) as u32);
        for directory in header.data_directory.iter_mut().skip(real as usize) {
            *directory = Default::default();
        }

        trace!(
            "Optional header: {} data directories declared, {} present",
            header.number_of_rva_and_sizes,
            real
        );

        #[allow(clippy::cast_possible_truncation)]
        let offset = offset as u32;
        self.real_number_of_rva_and_sizes = real;
        self.checksum_file_offset = offset + OPTIONAL_HEADER_CHECKSUM_OFFSET;
        self.security_dir_file_offset = offset
            + directory_offset
            + IMAGE_DATA_DIRECTORY_SIZE * IMAGE_DIRECTORY_ENTRY_SECURITY as u32;
        self.optional_header = header;
        Ok(())
    }

    /// Captures the section table and checks its layout against `SizeOfImage`.
    pub(crate) fn capture_section_headers(&mut self, data: &[u8]) {
        let file_size = data.len() as u64;
        let table_offset = u64::from(self.dos_header.e_lfanew)
            + 4
            + u64::from(IMAGE_FILE_HEADER_SIZE)
            + u64::from(self.file_header.size_of_optional_header);

        if table_offset > file_size {
            self.set_loader_error(LoaderError::SectionHeadersOutOfImage);
            return;
        }

        let section_alignment = self.optional_header.section_alignment;
        let file_alignment = self.optional_header.file_alignment;
        let single_subsection = section_alignment < PAGE_SIZE;

        let mut number_of_ptes = bytes_to_pages(self.optional_header.size_of_image);
        let mut next_virtual_address = 0u32;
        if !single_subsection {
            let header_size = align_to_size(self.optional_header.size_of_headers, section_alignment);
            let header_ptes = header_size / PAGE_SIZE;
            if header_ptes > number_of_ptes {
                self.set_loader_error(LoaderError::SectionHeadersOverflow);
            }
            number_of_ptes = number_of_ptes.wrapping_sub(header_ptes);
            next_virtual_address = header_size;
        }

        let mut parser = Parser::new(data);
        let Ok(table_start) = usize::try_from(table_offset) else {
            return;
        };
        if parser.seek(table_start).is_err() {
            return;
        }

        let declared = usize::from(self.file_header.number_of_sections);
        let mut raw_data_beyond_eof = false;
        let mut last_section_cut = false;

        for index in 0..declared {
            let Ok(mut section) = SectionHeader::read(&mut parser) else {
                trace!("Section table cut after {index} of {declared} entries");
                break;
            };
            section.section_name = self.resolve_section_name(data, &section.name);

            if single_subsection {
                if section.virtual_address != section.pointer_to_raw_data
                    || section.size_of_raw_data < section.virtual_size
                {
                    self.set_loader_error(LoaderError::SectionSizeMismatch);
                }
            } else {
                if section.virtual_address != next_virtual_address {
                    self.set_loader_error(LoaderError::InvalidSectionVa);
                }

                let virtual_size = if section.virtual_size == 0 {
                    section.size_of_raw_data
                } else {
                    section.virtual_size
                };
                let section_size = align_to_size(virtual_size, section_alignment);
                let section_ptes = section_size / PAGE_SIZE;
                if section_size < virtual_size || section_ptes > number_of_ptes {
                    self.set_loader_error(LoaderError::InvalidSectionVsize);
                }
                number_of_ptes = number_of_ptes.wrapping_sub(section_ptes);
                next_virtual_address = section.virtual_address.wrapping_add(section_size);

                if align_to_size(section.size_of_raw_data, file_alignment)
                    < section.size_of_raw_data
                {
                    self.set_loader_error(LoaderError::InvalidSectionRawSize);
                }
            }

            if section.pointer_to_raw_data != 0 {
                match section
                    .pointer_to_raw_data
                    .checked_add(section.size_of_raw_data)
                {
                    None => self.set_loader_error(LoaderError::RawDataOverflow),
                    Some(end) if u64::from(end) > file_size => {
                        raw_data_beyond_eof = true;
                        last_section_cut = index + 1 == declared;
                    }
                    Some(_) => {}
                }
            }

            trace!(
                "Section {index} '{}': va {:#x} vsize {:#x} raw {:#x}+{:#x}",
                section.section_name,
                section.virtual_address,
                section.virtual_size,
                section.pointer_to_raw_data,
                section.size_of_raw_data
            );
            self.sections.push(section);
        }

        if raw_data_beyond_eof {
            self.set_loader_error(if last_section_cut {
                LoaderError::FileIsCut
            } else {
                LoaderError::FileIsCutLoadable
            });
        }

        if self.config.sizeof_image_must_match && !single_subsection {
            let threshold = section_alignment / PAGE_SIZE;
            if number_of_ptes >= threshold {
                self.set_loader_error(LoaderError::InvalidSizeOfImage);
            }
        }

        if self.sections.len() as u64 * u64::from(IMAGE_SECTION_HEADER_SIZE) + table_offset
            > file_size
        {
            trace!("Section table reaches past the end of the file");
        }
    }

    /// Resolves `/NNN` names through the COFF string table, otherwise strips trailing NULs.
    fn resolve_section_name(&self, data: &[u8], name: &[u8; 8]) -> String {
        let end = name.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
        let name = &name[..end];

        if let Some(digits) = name.strip_prefix(b"/") {
            let index = std::str::from_utf8(digits)
                .ok()
                .and_then(|text| text.parse::<u32>().ok());

            if let (Some(index), true) = (index, self.file_header.pointer_to_symbol_table != 0) {
                let string_table = u64::from(self.file_header.pointer_to_symbol_table)
                    + u64::from(self.file_header.number_of_symbols)
                        * u64::from(IMAGE_SIZEOF_COFF_SYMBOL);
                let offset = string_table + u64::from(index);

                if let Ok(offset) = usize::try_from(offset) {
                    if let Some(resolved) = ImageLoader::read_string_raw(
                        data,
                        offset,
                        MAX_SECTION_NAME_LENGTH,
                        StringPolicy::PRINTABLE | StringPolicy::TERMINATED,
                    ) {
                        return resolved;
                    }
                }
            }
        }

        String::from_utf8_lossy(name).into_owned()
    }
}
