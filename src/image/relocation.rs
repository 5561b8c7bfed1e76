//! Base relocation.
//!
//! Moves a mapped image to a new base address by applying the fixups of its base relocation
//! directory. The directory is walked and validated completely before the first byte of the
//! image changes, so a rejected relocation leaves the image as it was.
//!
//! # Examples
//!
//! ```rust,no_run
//! use peloader::ImageLoader;
//!
//! let mut loader = ImageLoader::default();
//! loader.load_file("tests/samples/sample.dll", false)?;
//! loader.relocate_image(0x1_8000_0000)?;
//! assert_eq!(loader.image_base(), 0x1_8000_0000);
//! # Ok::<(), peloader::Error>(())
//! ```

use log::{debug, trace};

use super::{
    headers::{
        FileCharacteristics, IMAGE_DIRECTORY_ENTRY_BASERELOC, IMAGE_FILE_HEADER_SIZE,
        OPTIONAL_HEADER32_IMAGE_BASE_OFFSET, OPTIONAL_HEADER64_IMAGE_BASE_OFFSET,
    },
    ImageLoader,
};
use crate::{file::io::read_le_at, Error, Result};

/// Largest base relocation directory the loader processes.
pub const MAX_RELOCATION_DIRECTORY_SIZE: u32 = 10 * 1024 * 1024;

/// Size of the `VirtualAddress` + `SizeOfBlock` header of a relocation block.
const BLOCK_HEADER_SIZE: u32 = 8;

/// Fixup types of base relocation entries (`IMAGE_REL_BASED_*`).
#[allow(missing_docs)]
pub mod kind {
    pub const ABSOLUTE: u8 = 0;
    pub const HIGH: u8 = 1;
    pub const LOW: u8 = 2;
    pub const HIGHLOW: u8 = 3;
    pub const HIGHADJ: u8 = 4;
    pub const MIPS_JMPADDR: u8 = 5;
    pub const IA64_IMM64: u8 = 9;
    pub const DIR64: u8 = 10;
}

/// One bit field of the 64-bit immediate of an IA-64 `movl` bundle: the 32-bit word of the
/// bundle it lives in, its width, its bit position in that word and in the immediate.
struct Imm64Field {
    word: usize,
    size: u32,
    inst_pos: u32,
    val_pos: u32,
}

const IA64_IMM64_FIELDS: [Imm64Field; 8] = [
    Imm64Field { word: 3, size: 7, inst_pos: 4, val_pos: 0 },
    Imm64Field { word: 3, size: 9, inst_pos: 18, val_pos: 7 },
    Imm64Field { word: 3, size: 5, inst_pos: 13, val_pos: 16 },
    Imm64Field { word: 3, size: 1, inst_pos: 12, val_pos: 21 },
    Imm64Field { word: 1, size: 10, inst_pos: 14, val_pos: 22 },
    Imm64Field { word: 1, size: 8, inst_pos: 24, val_pos: 32 },
    Imm64Field { word: 2, size: 23, inst_pos: 0, val_pos: 40 },
    Imm64Field { word: 3, size: 1, inst_pos: 27, val_pos: 63 },
];

/// A validated fixup waiting to be applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Fixup {
    rva: u32,
    kind: u8,
    /// Low half of the target of a `HIGHADJ` fixup, taken from the following entry.
    adjust: i16,
}

impl Fixup {
    fn target_size(&self) -> u32 {
        match self.kind {
            kind::HIGH | kind::LOW | kind::HIGHADJ => 2,
            kind::DIR64 => 8,
            kind::IA64_IMM64 => 16,
            _ => 4,
        }
    }

    fn target_rva(&self) -> u32 {
        if self.kind == kind::IA64_IMM64 {
            self.rva & !15
        } else {
            self.rva
        }
    }
}

/// Decodes the immediate of an IA-64 `movl` bundle.
fn ia64_extract_imm64(bundle: &[u32; 4]) -> u64 {
    IA64_IMM64_FIELDS.iter().fold(0u64, |value, field| {
        let bits = (u64::from(bundle[field.word]) >> field.inst_pos) & ((1u64 << field.size) - 1);
        value | (bits << field.val_pos)
    })
}

/// Encodes `value` into the immediate of an IA-64 `movl` bundle.
fn ia64_insert_imm64(bundle: &mut [u32; 4], value: u64) {
    for field in &IA64_IMM64_FIELDS {
        let mask = (1u32 << field.size).wrapping_sub(1);
        #[allow(clippy::cast_possible_truncation)]
        let bits = ((value >> field.val_pos) as u32) & mask;
        bundle[field.word] = (bundle[field.word] & !(mask << field.inst_pos)) | (bits << field.inst_pos);
    }
}

impl ImageLoader {
    /// Rebases the mapped image to `new_image_base`.
    ///
    /// Every fixup of the base relocation directory is applied and `ImageBase` is updated,
    /// both in the captured optional header and in the mapped header page.
    ///
    /// # Errors
    /// Returns [`crate::Error::Relocation`] without touching the image if the new base does
    /// not fit a 32-bit image, relocations are stripped, the image is a rejected
    /// app-container image, or the relocation directory is missing or malformed.
    pub fn relocate_image(&mut self, new_image_base: u64) -> Result<()> {
        let old_image_base = self.optional_header.image_base;
        if new_image_base == old_image_base {
            return Ok(());
        }

        let is_64bit = self.optional_header.is_64bit();
        if !is_64bit && new_image_base > u64::from(u32::MAX) {
            return Err(Error::Relocation(format!(
                "Image base {new_image_base:#x} does not fit a 32-bit image"
            )));
        }

        if self
            .file_header
            .flags()
            .contains(FileCharacteristics::RELOCS_STRIPPED)
        {
            return Err(Error::Relocation("Relocations are stripped".to_string()));
        }

        if self.config.app_container_check && self.is_bad_app_container() {
            return Err(Error::Relocation(
                "App container image without page alignment".to_string(),
            ));
        }

        let rva = self.data_dir_rva(IMAGE_DIRECTORY_ENTRY_BASERELOC);
        let size = self.data_dir_size(IMAGE_DIRECTORY_ENTRY_BASERELOC);
        if rva == 0 || size == 0 {
            return Err(Error::Relocation(
                "The image has no base relocation directory".to_string(),
            ));
        }
        if !self.is_valid_image_block(rva, size) {
            return Err(Error::Relocation(format!(
                "Base relocation directory {rva:#x}+{size:#x} is outside the image"
            )));
        }
        if !(BLOCK_HEADER_SIZE..=MAX_RELOCATION_DIRECTORY_SIZE).contains(&size) {
            return Err(Error::Relocation(format!(
                "Invalid base relocation directory size {size:#x}"
            )));
        }

        let mut directory = vec![0u8; size as usize];
        self.read_image(&mut directory, rva);
        let fixups = self.collect_fixups(&directory)?;

        let difference = if is_64bit {
            new_image_base.wrapping_sub(old_image_base)
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let delta = (new_image_base as u32).wrapping_sub(old_image_base as u32);
            i64::from(delta as i32) as u64
        };

        debug!(
            "Relocating {old_image_base:#x} -> {new_image_base:#x}: {} fixups",
            fixups.len()
        );
        for fixup in &fixups {
            self.apply_fixup(fixup, difference);
        }

        self.write_new_image_base(new_image_base);
        Ok(())
    }

    /// Walks the relocation blocks and validates every entry.
    fn collect_fixups(&self, directory: &[u8]) -> Result<Vec<Fixup>> {
        let mut fixups = Vec::new();
        let mut offset = 0usize;

        while offset + (BLOCK_HEADER_SIZE as usize) <= directory.len() {
            let block_start = offset;
            let virtual_address = read_le_at::<u32>(directory, &mut offset)?;
            let block_size = read_le_at::<u32>(directory, &mut offset)?;

            if block_size < BLOCK_HEADER_SIZE {
                if virtual_address == 0 && block_size == 0 {
                    break;
                }
                return Err(Error::Relocation(format!(
                    "Relocation block at {block_start:#x} has invalid size {block_size:#x}"
                )));
            }

            let block_end = block_start
                .checked_add(block_size as usize)
                .filter(|end| *end <= directory.len())
                .ok_or_else(|| {
                    Error::Relocation(format!(
                        "Relocation block at {block_start:#x} exceeds the directory"
                    ))
                })?;

            if !self.is_good_mapped_page(virtual_address) || self.is_zero_page(virtual_address) {
                trace!("Skipping relocation block for unmapped page {virtual_address:#x}");
                offset = block_end;
                continue;
            }

            while offset + 2 <= block_end {
                let entry = read_le_at::<u16>(directory, &mut offset)?;
                #[allow(clippy::cast_possible_truncation)]
                let fixup_kind = (entry >> 12) as u8;
                let rva = virtual_address.wrapping_add(u32::from(entry & 0x0FFF));

                let fixup = match fixup_kind {
                    kind::ABSOLUTE => continue,
                    kind::HIGHADJ => {
                        if offset + 2 > block_end {
                            return Err(Error::Relocation(format!(
                                "HIGHADJ fixup at {rva:#x} misses its second entry"
                            )));
                        }
                        let adjust = read_le_at::<i16>(directory, &mut offset)?;
                        Fixup { rva, kind: fixup_kind, adjust }
                    }
                    kind::HIGH
                    | kind::LOW
                    | kind::HIGHLOW
                    | kind::MIPS_JMPADDR
                    | kind::IA64_IMM64
                    | kind::DIR64 => Fixup { rva, kind: fixup_kind, adjust: 0 },
                    other => {
                        return Err(Error::Relocation(format!(
                            "Unsupported relocation type {other} at {rva:#x}"
                        )))
                    }
                };

                if !self.is_valid_image_block(fixup.target_rva(), fixup.target_size()) {
                    return Err(Error::Relocation(format!(
                        "Fixup target {rva:#x} is outside the image"
                    )));
                }
                fixups.push(fixup);
            }

            offset = block_end;
        }

        Ok(fixups)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn apply_fixup(&mut self, fixup: &Fixup, difference: u64) {
        let rva = fixup.rva;

        match fixup.kind {
            kind::HIGH => {
                let value = self.read_value::<u16>(rva).unwrap_or(0);
                self.write_value(rva, value.wrapping_add((difference >> 16) as u16));
            }
            kind::LOW => {
                let value = self.read_value::<u16>(rva).unwrap_or(0);
                self.write_value(rva, value.wrapping_add(difference as u16));
            }
            kind::HIGHLOW => {
                let value = self.read_value::<u32>(rva).unwrap_or(0);
                self.write_value(rva, value.wrapping_add(difference as u32));
            }
            kind::DIR64 => {
                let value = self.read_value::<u64>(rva).unwrap_or(0);
                self.write_value(rva, value.wrapping_add(difference));
            }
            kind::HIGHADJ => {
                let high = self.read_value::<u16>(rva).unwrap_or(0);
                let value = ((u32::from(high) << 16) as i32)
                    .wrapping_add(i32::from(fixup.adjust))
                    .wrapping_add(difference as i32)
                    .wrapping_add(0x8000);
                self.write_value(rva, (value >> 16) as u16);
            }
            kind::MIPS_JMPADDR => {
                let value = self.read_value::<u32>(rva).unwrap_or(0);
                let target = ((value & 0x03FF_FFFF) << 2).wrapping_add(difference as u32);
                self.write_value(rva, (value & !0x03FF_FFFF) | ((target >> 2) & 0x03FF_FFFF));
            }
            kind::IA64_IMM64 => {
                let bundle_rva = fixup.target_rva();
                let mut bundle = [0u32; 4];
                for (index, word) in bundle.iter_mut().enumerate() {
                    *word = self
                        .read_value::<u32>(bundle_rva + 4 * index as u32)
                        .unwrap_or(0);
                }
                let value = ia64_extract_imm64(&bundle).wrapping_add(difference);
                ia64_insert_imm64(&mut bundle, value);
                for (index, word) in bundle.iter().enumerate() {
                    self.write_value(bundle_rva + 4 * index as u32, *word);
                }
            }
            _ => {}
        }
    }

    /// Stores the new base in the captured header and in the mapped optional header.
    #[allow(clippy::cast_possible_truncation)]
    fn write_new_image_base(&mut self, new_image_base: u64) {
        let optional_header =
            self.dos_header.e_lfanew.wrapping_add(4 + IMAGE_FILE_HEADER_SIZE);

        if self.optional_header.is_64bit() {
            self.write_value(
                optional_header.wrapping_add(OPTIONAL_HEADER64_IMAGE_BASE_OFFSET),
                new_image_base,
            );
        } else {
            self.write_value(
                optional_header.wrapping_add(OPTIONAL_HEADER32_IMAGE_BASE_OFFSET),
                new_image_base as u32,
            );
        }

        self.optional_header.image_base = new_image_base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::PeBuilder;

    fn entry(kind: u8, offset: u16) -> u16 {
        (u16::from(kind) << 12) | offset
    }

    fn load(data: &[u8]) -> ImageLoader {
        let mut loader = ImageLoader::default();
        loader.load(data, false).unwrap();
        loader
    }

    #[test]
    fn test_relocate_64bit_dir64() {
        let data = PeBuilder::new_64bit()
            .relocations(vec![(0x1000, vec![entry(kind::DIR64, 0x10), entry(kind::ABSOLUTE, 0)])])
            .build();
        let mut loader = load(&data);
        assert!(loader.write_value(0x1010, 0x1_4000_1234u64));

        loader.relocate_image(0x1_8000_0000).unwrap();
        assert_eq!(loader.read_value::<u64>(0x1010), Some(0x1_8000_1234));
        assert_eq!(loader.image_base(), 0x1_8000_0000);
        assert_eq!(loader.read_value::<u64>(0x80 + 24 + 24), Some(0x1_8000_0000));
    }

    #[test]
    fn test_relocate_32bit_kinds() {
        let data = PeBuilder::new_32bit()
            .relocations(vec![(
                0x1000,
                vec![
                    entry(kind::HIGHLOW, 0x00),
                    entry(kind::HIGH, 0x04),
                    entry(kind::LOW, 0x06),
                    entry(kind::HIGHADJ, 0x08),
                    0x9000,
                    entry(kind::MIPS_JMPADDR, 0x0C),
                ],
            )])
            .build();
        let mut loader = load(&data);
        loader.write_value(0x1000, 0x0040_1000u32);
        loader.write_value(0x1004, 0x0040u16);
        loader.write_value(0x1006, 0x1000u16);
        loader.write_value(0x1008, 0x0040u16);
        loader.write_value(0x100C, 0x0C10_0400u32);

        loader.relocate_image(0x0120_8000).unwrap();
        let difference = 0x0120_8000u32 - 0x0040_0000;

        assert_eq!(loader.read_value::<u32>(0x1000), Some(0x0120_9000));
        assert_eq!(loader.read_value::<u16>(0x1004), Some(0x0120));
        assert_eq!(loader.read_value::<u16>(0x1006), Some(0x9000));

        let high_adj = (0x0040_0000i32 + i32::from(0x9000u16 as i16) + difference as i32 + 0x8000) >> 16;
        assert_eq!(loader.read_value::<u16>(0x1008), Some(high_adj as u16));

        let target = ((0x0010_0400u32 << 2) + difference) >> 2;
        assert_eq!(
            loader.read_value::<u32>(0x100C),
            Some(0x0C00_0000 | (target & 0x03FF_FFFF))
        );
        assert_eq!(loader.read_value::<u32>(0x80 + 24 + 28), Some(0x0120_8000));
    }

    #[test]
    fn test_relocate_32bit_downwards_sign_extends() {
        let data = PeBuilder::new_32bit()
            .image_base(0x1000_0000)
            .relocations(vec![(0x1000, vec![entry(kind::HIGHLOW, 0)])])
            .build();
        let mut loader = load(&data);
        loader.write_value(0x1000, 0x1000_2000u32);

        loader.relocate_image(0x0040_0000).unwrap();
        assert_eq!(loader.read_value::<u32>(0x1000), Some(0x0040_2000));
    }

    #[test]
    fn test_ia64_imm64_roundtrip() {
        let mut bundle = [0x1111_1111u32, 0x2222_2222, 0x3333_3333, 0x4444_4444];
        let original = bundle;
        ia64_insert_imm64(&mut bundle, 0x8123_4567_89AB_CDEF);
        assert_eq!(ia64_extract_imm64(&bundle), 0x8123_4567_89AB_CDEF);
        assert_eq!(bundle[0], original[0]);

        let data = PeBuilder::new_64bit()
            .machine(crate::image::headers::machine::IA64)
            .relocations(vec![(0x1000, vec![entry(kind::IA64_IMM64, 0x22)])])
            .build();
        let mut loader = load(&data);
        for (index, word) in bundle.iter().enumerate() {
            loader.write_value(0x1020 + 4 * index as u32, *word);
        }

        loader.relocate_image(0x1_4001_0000).unwrap();
        let mut relocated = [0u32; 4];
        for (index, word) in relocated.iter_mut().enumerate() {
            *word = loader.read_value(0x1020 + 4 * index as u32).unwrap();
        }
        assert_eq!(ia64_extract_imm64(&relocated), 0x8123_4567_89AC_CDEF);
        assert_eq!(relocated[0], original[0]);
    }

    #[test]
    fn test_rejected_relocations_leave_image_untouched() {
        let data = PeBuilder::new_64bit()
            .relocations(vec![
                (0x1000, vec![entry(kind::DIR64, 0x10)]),
                (0x1000, vec![entry(7, 0x20)]),
            ])
            .build();
        let mut loader = load(&data);
        loader.write_value(0x1010, 0x1_4000_1234u64);

        assert!(matches!(
            loader.relocate_image(0x1_8000_0000),
            Err(Error::Relocation(_))
        ));
        assert_eq!(loader.read_value::<u64>(0x1010), Some(0x1_4000_1234));
        assert_eq!(loader.image_base(), 0x1_4000_0000);
    }

    #[test]
    fn test_relocation_preconditions() {
        let mut loader = load(&PeBuilder::new_64bit().build());
        assert!(loader.relocate_image(0x1_4000_0000).is_ok());
        assert!(loader.relocate_image(0x1_8000_0000).is_err());

        let data = PeBuilder::new_32bit()
            .relocations(vec![(0x1000, vec![entry(kind::HIGHLOW, 0)])])
            .build();
        let mut loader = load(&data);
        assert!(loader.relocate_image(0x1_0000_0000).is_err());

        let data = PeBuilder::new_32bit()
            .characteristics(0x0103)
            .relocations(vec![(0x1000, vec![entry(kind::HIGHLOW, 0)])])
            .build();
        let mut loader = load(&data);
        assert!(loader.relocate_image(0x0100_0000).is_err());
    }

    #[test]
    fn test_highadj_without_second_entry() {
        let data = PeBuilder::new_32bit()
            .relocations(vec![(0x1000, vec![entry(kind::HIGHADJ, 0)])])
            .build();
        let mut loader = load(&data);
        assert!(loader.relocate_image(0x0100_0000).is_err());
    }

    #[test]
    fn test_blocks_for_unmapped_pages_are_skipped() {
        let data = PeBuilder::new_64bit()
            .size_of_image(0x5000)
            .relocations(vec![
                (0x3000, vec![entry(kind::DIR64, 0)]),
                (0x1000, vec![entry(kind::DIR64, 0)]),
            ])
            .build();
        let mut loader = load(&data);
        loader.write_value(0x1000, 0x1_4000_0010u64);

        loader.relocate_image(0x1_4010_0000).unwrap();
        assert_eq!(loader.read_value::<u64>(0x1000), Some(0x1_4010_0010));
    }
}
