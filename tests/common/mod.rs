//! Shared helpers for the integration tests: a small writer for synthetic PE images.

#![allow(dead_code)]

/// Offset of the NT headers in every generated image.
pub const E_LFANEW: usize = 0x80;

/// A section of a generated image.
#[derive(Clone, Debug)]
pub struct Section {
    pub name: &'static str,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
    pub characteristics: u32,
}

impl Section {
    pub fn new(name: &'static str, va: u32, vs: u32, ptr: u32, raw: u32) -> Self {
        Section {
            name,
            virtual_address: va,
            virtual_size: vs,
            pointer_to_raw_data: ptr,
            size_of_raw_data: raw,
            characteristics: 0x6000_0020,
        }
    }
}

/// Layout of a generated image. [`Image::build`] writes the headers, the section table
/// and a byte pattern into every section's raw data.
#[derive(Clone, Debug)]
pub struct Image {
    pub is_64bit: bool,
    pub machine: u16,
    pub characteristics: u16,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_headers: u32,
    pub size_of_image: u32,
    pub number_of_rva_and_sizes: u32,
    pub size_of_optional_header: Option<u16>,
    pub directories: Vec<(usize, u32, u32)>,
    pub sections: Vec<Section>,
}

impl Image {
    /// The minimal AMD64 image: one `.text` section at 0x1000 with 0x200 bytes at 0x400.
    pub fn amd64() -> Self {
        Image {
            is_64bit: true,
            machine: 0x8664,
            characteristics: 0x0022,
            image_base: 0x1_4000_0000,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            size_of_headers: 0x400,
            size_of_image: 0x2000,
            number_of_rva_and_sizes: 16,
            size_of_optional_header: None,
            directories: Vec::new(),
            sections: vec![Section::new(".text", 0x1000, 0x50, 0x400, 0x200)],
        }
    }

    /// The same layout as an i386 image based at 0x40_0000.
    pub fn i386() -> Self {
        Image {
            is_64bit: false,
            machine: 0x014c,
            characteristics: 0x0102,
            image_base: 0x40_0000,
            ..Image::amd64()
        }
    }

    /// Byte stored at file offset `offset` of a section's raw data.
    pub fn pattern(offset: usize) -> u8 {
        (offset % 253) as u8 ^ 0x5A
    }

    pub fn build(&self) -> Vec<u8> {
        let optional_size: usize = if self.is_64bit { 240 } else { 224 };
        let size_of_optional_header = self
            .size_of_optional_header
            .map_or(optional_size, usize::from);
        let table = E_LFANEW + 24 + size_of_optional_header;

        let mut size = (self.size_of_headers as usize).max(table + 40 * self.sections.len());
        for section in &self.sections {
            size = size.max((section.pointer_to_raw_data + section.size_of_raw_data) as usize);
        }
        let mut out = vec![0u8; size.max(E_LFANEW + 24 + optional_size)];

        for section in &self.sections {
            let start = section.pointer_to_raw_data as usize;
            if start == 0 {
                continue;
            }
            for offset in start..start + section.size_of_raw_data as usize {
                out[offset] = Self::pattern(offset);
            }
        }

        out[..2].copy_from_slice(b"MZ");
        out[0x3C..0x40].copy_from_slice(&(E_LFANEW as u32).to_le_bytes());

        let nt = E_LFANEW;
        out[nt..nt + 4].copy_from_slice(b"PE\0\0");
        out[nt + 4..nt + 6].copy_from_slice(&self.machine.to_le_bytes());
        out[nt + 6..nt + 8].copy_from_slice(&(self.sections.len() as u16).to_le_bytes());
        out[nt + 20..nt + 22].copy_from_slice(&(size_of_optional_header as u16).to_le_bytes());
        out[nt + 22..nt + 24].copy_from_slice(&self.characteristics.to_le_bytes());

        let opt = nt + 24;
        let magic: u16 = if self.is_64bit { 0x20b } else { 0x10b };
        out[opt..opt + 2].copy_from_slice(&magic.to_le_bytes());
        out[opt + 16..opt + 20].copy_from_slice(&0x1000u32.to_le_bytes());
        if self.is_64bit {
            out[opt + 24..opt + 32].copy_from_slice(&self.image_base.to_le_bytes());
        } else {
            out[opt + 28..opt + 32].copy_from_slice(&(self.image_base as u32).to_le_bytes());
        }
        out[opt + 32..opt + 36].copy_from_slice(&self.section_alignment.to_le_bytes());
        out[opt + 36..opt + 40].copy_from_slice(&self.file_alignment.to_le_bytes());
        out[opt + 40..opt + 42].copy_from_slice(&6u16.to_le_bytes());
        out[opt + 48..opt + 50].copy_from_slice(&6u16.to_le_bytes());
        out[opt + 56..opt + 60].copy_from_slice(&self.size_of_image.to_le_bytes());
        out[opt + 60..opt + 64].copy_from_slice(&self.size_of_headers.to_le_bytes());
        out[opt + 68..opt + 70].copy_from_slice(&3u16.to_le_bytes());

        let (count, directories) = if self.is_64bit { (108, 112) } else { (92, 96) };
        out[opt + count..opt + count + 4].copy_from_slice(&self.number_of_rva_and_sizes.to_le_bytes());
        for &(index, rva, size) in &self.directories {
            let entry = opt + directories + 8 * index;
            out[entry..entry + 4].copy_from_slice(&rva.to_le_bytes());
            out[entry + 4..entry + 8].copy_from_slice(&size.to_le_bytes());
        }

        for (index, section) in self.sections.iter().enumerate() {
            let entry = table + 40 * index;
            let name = section.name.as_bytes();
            out[entry..entry + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            out[entry + 8..entry + 12].copy_from_slice(&section.virtual_size.to_le_bytes());
            out[entry + 12..entry + 16].copy_from_slice(&section.virtual_address.to_le_bytes());
            out[entry + 16..entry + 20].copy_from_slice(&section.size_of_raw_data.to_le_bytes());
            out[entry + 20..entry + 24].copy_from_slice(&section.pointer_to_raw_data.to_le_bytes());
            out[entry + 36..entry + 40].copy_from_slice(&section.characteristics.to_le_bytes());
        }

        out.truncate(size);
        out
    }
}

/// Encodes base relocation blocks.
pub fn relocation_blocks(blocks: &[(u32, &[u16])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (page, entries) in blocks {
        out.extend_from_slice(&page.to_le_bytes());
        out.extend_from_slice(&(8 + 2 * entries.len() as u32).to_le_bytes());
        for entry in *entries {
            out.extend_from_slice(&entry.to_le_bytes());
        }
    }
    out
}
