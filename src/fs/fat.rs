//! FAT image codec
//!
//! FAT decoding is delegated to the `fatfs` driver over an in-memory
//! cursor. ESP targets sometimes place the filesystem one sector
//! (0x1000 bytes) into the partition; mounting detects that case and
//! strips the offset transparently, keeping the prefix bytes so the
//! re-serialized image still flashes to the original location.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use fatfs::{FileSystem, FsOptions};

use crate::{
    error::{Error, FsError},
    fs::{is_fat_boot_sector, FileEntry, FilesystemKind, FAT_SECTOR_OFFSET},
};

/// A mounted FAT image
#[derive(Debug)]
pub struct FatImage {
    data: Vec<u8>,
    /// Bytes in front of the actual filesystem (0 or one sector)
    offset: usize,
}

impl FatImage {
    /// Create a freshly formatted image of `partition_size` bytes
    pub fn format(partition_size: usize) -> Result<Self, Error> {
        let mut data = vec![0u8; partition_size];

        let mut cursor = Cursor::new(&mut data[..]);
        fatfs::format_volume(&mut cursor, fatfs::FormatVolumeOptions::new())
            .map_err(|_| Error::MountFailed(FilesystemKind::Fat))?;

        Ok(Self { data, offset: 0 })
    }

    /// Mount an image, auto-stripping the one-sector offset when the boot
    /// signature only shows up there
    pub fn mount(data: Vec<u8>) -> Result<Self, Error> {
        let offset = if is_fat_boot_sector(&data) {
            0
        } else if data.len() > FAT_SECTOR_OFFSET && is_fat_boot_sector(&data[FAT_SECTOR_OFFSET..])
        {
            FAT_SECTOR_OFFSET
        } else {
            return Err(Error::MountFailed(FilesystemKind::Fat));
        };

        let mut image = Self { data, offset };

        // Probe-mount once so undecodable images fail here, not on first
        // use
        image.fs()?;
        Ok(image)
    }

    /// A live filesystem view over the buffer
    ///
    /// Dropping the view flushes any pending writes back into the buffer.
    fn fs(&mut self) -> Result<FileSystem<Cursor<&mut [u8]>>, Error> {
        let slice = &mut self.data[self.offset..];
        FileSystem::new(Cursor::new(slice), FsOptions::new())
            .map_err(|_| Error::MountFailed(FilesystemKind::Fat))
    }

    /// List the direct children of `path`
    pub fn list(&mut self, path: &str) -> Result<Vec<FileEntry>, Error> {
        let prefix = normalize_dir(path);
        let fs = self.fs()?;
        let root = fs.root_dir();
        let dir = if prefix.is_empty() {
            root
        } else {
            root.open_dir(&prefix).map_err(map_io)?
        };

        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry.map_err(map_io)?;
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let path = if prefix.is_empty() {
                format!("/{name}")
            } else {
                format!("/{prefix}/{name}")
            };
            entries.push(FileEntry {
                path,
                size: entry.len() as usize,
                is_dir: entry.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Read a file's contents
    pub fn read(&mut self, path: &str) -> Result<Vec<u8>, Error> {
        let rel = normalize_file(path)?;
        let fs = self.fs()?;
        let mut file = fs.root_dir().open_file(&rel).map_err(map_io)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).map_err(map_io)?;
        Ok(contents)
    }

    /// Create or replace a file
    pub fn write(&mut self, path: &str, contents: &[u8]) -> Result<(), Error> {
        let rel = normalize_file(path)?;
        let fs = self.fs()?;
        {
            let mut file = fs.root_dir().create_file(&rel).map_err(map_io)?;
            file.seek(SeekFrom::Start(0)).map_err(map_io)?;
            file.truncate().map_err(map_io)?;
            file.write_all(contents).map_err(map_io)?;
            file.flush().map_err(map_io)?;
        }
        fs.unmount().map_err(map_io)?;
        Ok(())
    }

    /// Create a directory
    pub fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        let rel = normalize_file(path)?;
        let fs = self.fs()?;
        fs.root_dir().create_dir(&rel).map_err(map_io)?;
        fs.unmount().map_err(map_io)?;
        Ok(())
    }

    /// Remove a file or empty directory
    pub fn delete(&mut self, path: &str) -> Result<(), Error> {
        let rel = normalize_file(path)?;
        let fs = self.fs()?;
        fs.root_dir().remove(&rel).map_err(map_io)?;
        fs.unmount().map_err(map_io)?;
        Ok(())
    }

    /// Consume the instance, returning the flashable image (any stripped
    /// sector prefix included)
    pub fn to_image(self) -> Vec<u8> {
        self.data
    }
}

fn map_io(err: std::io::Error) -> Error {
    FsError::Fat(err).into()
}

/// Strip the leading slash; reject empty paths
fn normalize_file(path: &str) -> Result<String, Error> {
    let rel = path.trim_start_matches('/');
    if rel.is_empty() {
        return Err(FsError::InvalidPath(path.into()).into());
    }
    Ok(rel.to_string())
}

fn normalize_dir(path: &str) -> String {
    path.trim_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{detect, FilesystemKind};

    const IMAGE_SIZE: usize = 1024 * 1024;

    fn sample() -> FatImage {
        let mut fat = FatImage::format(IMAGE_SIZE).unwrap();
        fat.write("/readme.txt", b"hello fat").unwrap();
        fat.mkdir("/logs").unwrap();
        fat.write("/logs/0.txt", b"first").unwrap();
        fat
    }

    #[test]
    fn formatted_image_detects_as_fat() {
        let image = sample().to_image();
        assert_eq!(image.len(), IMAGE_SIZE);
        assert_eq!(detect(&image), Some(FilesystemKind::Fat));
    }

    #[test]
    fn round_trip() {
        let image = sample().to_image();
        let mut mounted = FatImage::mount(image).unwrap();

        let root = mounted.list("/").unwrap();
        assert!(root.iter().any(|e| e.path == "/readme.txt" && !e.is_dir));
        assert!(root.iter().any(|e| e.path == "/logs" && e.is_dir));

        assert_eq!(mounted.read("/readme.txt").unwrap(), b"hello fat");
        assert_eq!(mounted.read("/logs/0.txt").unwrap(), b"first");
    }

    #[test]
    fn sector_offset_is_auto_stripped() {
        let inner = sample().to_image();
        let mut shifted = vec![0xFFu8; FAT_SECTOR_OFFSET];
        shifted.extend_from_slice(&inner);

        let mut mounted = FatImage::mount(shifted).unwrap();
        assert_eq!(mounted.read("/readme.txt").unwrap(), b"hello fat");

        // The prefix survives re-serialization
        let out = mounted.to_image();
        assert_eq!(out.len(), FAT_SECTOR_OFFSET + IMAGE_SIZE);
        assert!(out[..16].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn garbage_fails_to_mount() {
        let err = FatImage::mount(vec![0u8; 64 * 1024]).unwrap_err();
        assert!(matches!(err, Error::MountFailed(FilesystemKind::Fat)));
    }

    #[test]
    fn overwrite_truncates() {
        let mut fat = sample();
        fat.write("/readme.txt", b"x").unwrap();
        assert_eq!(fat.read("/readme.txt").unwrap(), b"x");
    }

    #[test]
    fn delete_file() {
        let mut fat = sample();
        fat.delete("/logs/0.txt").unwrap();
        assert!(fat.read("/logs/0.txt").is_err());
    }
}
