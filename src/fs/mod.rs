//! Embedded-filesystem codecs
//!
//! Raw partition bytes read by the flasher land here: detection sniffs
//! which filesystem an image holds, and the per-format codecs mount it
//! into an ephemeral in-memory instance that can list, read, and edit
//! files before being serialized back into a flashable image.

use std::fmt::{self, Display, Formatter};

pub mod fat;
pub mod littlefs;
pub mod spiffs;

pub use fat::FatImage;
pub use littlefs::{LittleFsConfig, LittleFsImage};
pub use spiffs::SpiffsImage;

/// SPIFFS image magic, little-endian in the first four bytes
pub(crate) const SPIFFS_MAGIC: u32 = 0x2014_0529;
/// FAT boot-sector signature at offset 510
pub(crate) const FAT_BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
/// A FAT filesystem may start one sector in on ESP targets
pub(crate) const FAT_SECTOR_OFFSET: usize = 0x1000;

/// LittleFS block-size candidates probed on desktop-class layouts
pub const LITTLEFS_BLOCK_CANDIDATES: &[u32] = &[4096, 2048, 1024, 512];
/// LittleFS block-size candidates probed on the ESP8266
pub const LITTLEFS_BLOCK_CANDIDATES_ESP8266: &[u32] = &[8192, 4096];

/// How many bytes of the region head detection looks at
pub const DETECT_PROBE_LEN: usize = 8192;

/// The filesystems the codec layer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    LittleFs,
    Fat,
    Spiffs,
}

impl Display for FilesystemKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FilesystemKind::LittleFs => write!(f, "LittleFS"),
            FilesystemKind::Fat => write!(f, "FAT"),
            FilesystemKind::Spiffs => write!(f, "SPIFFS"),
        }
    }
}

/// A file or directory listed out of a mounted image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size: usize,
    pub is_dir: bool,
}

/// Identify the filesystem held in `data`
///
/// Probes, in order: LittleFS (superblock tag at block 0 or 1 for every
/// candidate block size), FAT (boot signature plus `FAT` tag, at offset 0
/// or one sector in), SPIFFS (magic word). `None` means unknown.
pub fn detect(data: &[u8]) -> Option<FilesystemKind> {
    detect_with(data, LITTLEFS_BLOCK_CANDIDATES)
}

/// [detect] with an explicit LittleFS block-size candidate list (the
/// ESP8266 uses larger blocks)
pub fn detect_with(data: &[u8], littlefs_blocks: &[u32]) -> Option<FilesystemKind> {
    let probe = &data[..data.len().min(DETECT_PROBE_LEN)];

    if is_littlefs_superblock(data, 0)
        || littlefs_blocks
            .iter()
            .any(|block| is_littlefs_superblock(data, *block as usize))
    {
        return Some(FilesystemKind::LittleFs);
    }

    if is_fat_boot_sector(probe) || is_fat_boot_sector(&data[FAT_SECTOR_OFFSET.min(data.len())..]) {
        return Some(FilesystemKind::Fat);
    }

    if probe.len() >= 4 {
        let magic = u32::from_le_bytes(probe[0..4].try_into().unwrap());
        if magic == SPIFFS_MAGIC {
            return Some(FilesystemKind::Spiffs);
        }
    }

    None
}

/// A LittleFS superblock: the ASCII tag at [8..16) of the block and a
/// major version of 2 in the leading version word
pub(crate) fn is_littlefs_superblock(data: &[u8], offset: usize) -> bool {
    let Some(block) = data.get(offset..offset + 16) else {
        return false;
    };

    &block[8..16] == b"littlefs" && u16::from_le_bytes(block[2..4].try_into().unwrap()) == 2
}

/// 0xAA55 at [510..512) with a `FAT` tag at one of the two BPB positions
pub(crate) fn is_fat_boot_sector(data: &[u8]) -> bool {
    let Some(signature) = data.get(510..512) else {
        return false;
    };
    if signature != FAT_BOOT_SIGNATURE {
        return false;
    }

    let tag_at = |range: std::ops::Range<usize>| {
        data.get(range)
            .map(|bytes| bytes.starts_with(b"FAT"))
            .unwrap_or(false)
    };

    tag_at(54..62) || tag_at(82..90)
}

/// Fallback filesystem layouts for ESP8266 firmware images, keyed by
/// flash size
///
/// These offsets are firmware-dependent; probing the flash for actual
/// signatures is the primary mechanism and this table only seeds the
/// probe when nothing else is known.
pub fn esp8266_layout_for_size(flash_size: u32) -> Option<(u32, u32)> {
    match flash_size {
        // 4 MB parts put the filesystem in the upper half
        0x40_0000 => Some((0x20_0000, 0x1F_B000)),
        // 2 MB parts mirror the same split
        0x20_0000 => Some((0x10_0000, 0x0F_B000)),
        // 1 MB parts squeeze it behind the firmware
        0x10_0000 => Some((0x0D_B000, 0x2_0000)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn littlefs_detection_by_superblock_tag() {
        // 512 KiB image with the tag at [8..16) and version 2.0 at [0..4)
        let mut image = vec![0u8; 512 * 1024];
        image[0..4].copy_from_slice(&[0x00, 0x00, 0x02, 0x00]);
        image[8..16].copy_from_slice(b"littlefs");

        assert_eq!(detect(&image), Some(FilesystemKind::LittleFs));

        // Corrupting a tag byte makes the image unidentifiable
        image[11] = b'X';
        assert_eq!(detect(&image), None);
    }

    #[test]
    fn littlefs_detection_at_block_one() {
        let mut image = vec![0u8; 64 * 1024];
        image[4096..4100].copy_from_slice(&[0x00, 0x00, 0x02, 0x00]);
        image[4104..4112].copy_from_slice(b"littlefs");

        assert_eq!(detect(&image), Some(FilesystemKind::LittleFs));
    }

    #[test]
    fn spiffs_detection() {
        let mut image = vec![0xFFu8; 64 * 1024];
        image[0..4].copy_from_slice(&SPIFFS_MAGIC.to_le_bytes());

        assert_eq!(detect(&image), Some(FilesystemKind::Spiffs));
    }

    #[test]
    fn fat_detection_with_sector_offset() {
        let mut image = vec![0u8; 64 * 1024];
        // Signature and tag shifted one sector in, as ESP targets lay it out
        image[FAT_SECTOR_OFFSET + 510..FAT_SECTOR_OFFSET + 512]
            .copy_from_slice(&FAT_BOOT_SIGNATURE);
        image[FAT_SECTOR_OFFSET + 54..FAT_SECTOR_OFFSET + 62].copy_from_slice(b"FAT16   ");

        assert_eq!(detect(&image), Some(FilesystemKind::Fat));
    }

    #[test]
    fn unknown_image() {
        assert_eq!(detect(&vec![0xFFu8; 4096]), None);
        assert_eq!(detect(&[]), None);
    }

    #[test]
    fn esp8266_layout_table() {
        assert_eq!(esp8266_layout_for_size(0x40_0000), Some((0x20_0000, 0x1F_B000)));
        assert_eq!(esp8266_layout_for_size(0x123), None);
    }
}
