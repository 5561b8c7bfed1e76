#![no_main]

use libfuzzer_sys::fuzz_target;
use peloader::{ImageLoader, LoaderConfig, LoaderMode};

fuzz_target!(|data: &[u8]| {
    let mut loader = ImageLoader::new(LoaderConfig::new(LoaderMode::Windows10).with_64bit_windows());
    if loader.load(data, false).is_err() {
        return;
    }

    let mut buffer = [0u8; 0x40];
    let _ = loader.read_image(&mut buffer, loader.address_of_entry_point());
    let _ = loader.file_offset_from_rva(loader.size_of_headers());
    let _ = loader.read_string_rc(loader.data_dir_rva(2));
    let _ = loader.relocate_image(0x1_0000_0000 + loader.image_base() % 0x1000_0000);
});
