//! SPIFFS image codec
//!
//! SPIFFS is a flat filesystem: there are no directories, only names that
//! may happen to contain slashes. The codec builds a filename-to-bytes
//! mapping out of the object index pages and serializes by reformatting a
//! blank image and re-inserting every file, which doubles as garbage
//! collection.

use crate::{
    error::{Error, FsError},
    fs::{FileEntry, FilesystemKind, SPIFFS_MAGIC},
};

/// Object names are at most 31 bytes plus the terminating NUL
pub const SPIFFS_NAME_MAX: usize = 31;

const PAGE_HEADER_LEN: usize = 5;
/// Index header page: page header, size, type, name
const INDEX_HEADER_LEN: usize = PAGE_HEADER_LEN + 4 + 1 + 32;
/// High bit of the object id marks index pages
const INDEX_FLAG: u16 = 0x8000;
const FREE_OBJ_ID: u16 = 0xFFFF;

/// Page/block geometry of a SPIFFS image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiffsGeometry {
    pub page_size: usize,
    pub block_size: usize,
}

impl Default for SpiffsGeometry {
    fn default() -> Self {
        Self {
            page_size: 256,
            block_size: 4096,
        }
    }
}

impl SpiffsGeometry {
    /// The ESP8266 Arduino core formats with 8 KiB blocks
    pub fn esp8266() -> Self {
        Self {
            page_size: 256,
            block_size: 8192,
        }
    }

    fn data_per_page(&self) -> usize {
        self.page_size - PAGE_HEADER_LEN
    }

    fn ids_in_header_page(&self) -> usize {
        (self.page_size - INDEX_HEADER_LEN) / 2
    }

    fn ids_in_index_page(&self) -> usize {
        (self.page_size - PAGE_HEADER_LEN) / 2
    }
}

/// A mounted SPIFFS image: a flat name-to-contents mapping
pub struct SpiffsImage {
    geometry: SpiffsGeometry,
    partition_size: usize,
    files: Vec<(String, Vec<u8>)>,
}

impl SpiffsImage {
    /// Create an empty filesystem of `partition_size` bytes
    pub fn format(partition_size: usize, geometry: SpiffsGeometry) -> Result<Self, Error> {
        if partition_size < 2 * geometry.block_size {
            return Err(Error::MountFailed(FilesystemKind::Spiffs));
        }

        Ok(Self {
            geometry,
            partition_size,
            files: Vec::new(),
        })
    }

    /// Mount an image with the desktop geometry
    pub fn mount(data: &[u8]) -> Result<Self, Error> {
        Self::mount_with(data, SpiffsGeometry::default())
    }

    pub fn mount_with(data: &[u8], geometry: SpiffsGeometry) -> Result<Self, Error> {
        if data.len() < 4
            || u32::from_le_bytes(data[0..4].try_into().unwrap()) != SPIFFS_MAGIC
            || data.len() < 2 * geometry.block_size
        {
            return Err(Error::MountFailed(FilesystemKind::Spiffs));
        }

        let page = geometry.page_size;
        let page_count = data.len() / page;

        // Collect (object id, span index, page number) of every index page
        let mut index_pages = Vec::new();
        for number in 1..page_count {
            let base = number * page;
            let obj_id = u16::from_le_bytes(data[base..base + 2].try_into().unwrap());
            if obj_id == FREE_OBJ_ID || obj_id & INDEX_FLAG == 0 {
                continue;
            }
            let span = u16::from_le_bytes(data[base + 2..base + 4].try_into().unwrap());
            index_pages.push((obj_id & !INDEX_FLAG, span, number));
        }
        index_pages.sort_unstable();

        let mut files = Vec::new();
        let mut cursor = 0;
        while cursor < index_pages.len() {
            let (obj_id, span, number) = index_pages[cursor];
            if span != 0 {
                // An orphaned continuation index; skip it
                cursor += 1;
                continue;
            }

            let base = number * page;
            let size =
                u32::from_le_bytes(data[base + 5..base + 9].try_into().unwrap()) as usize;
            let name_field = &data[base + 10..base + 10 + 32];
            let name_len = name_field.iter().position(|b| *b == 0).unwrap_or(32);
            let name = String::from_utf8_lossy(&name_field[..name_len]).into_owned();

            // Page-id list: tail of the header page, then any continuation
            // index pages of the same object
            let mut ids: Vec<u16> = Vec::new();
            let id_area = &data[base + INDEX_HEADER_LEN..base + page];
            ids.extend(
                id_area
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes(c.try_into().unwrap())),
            );
            cursor += 1;
            while cursor < index_pages.len() && index_pages[cursor].0 == obj_id {
                let (_, _, cont) = index_pages[cursor];
                let cont_base = cont * page;
                ids.extend(
                    data[cont_base + PAGE_HEADER_LEN..cont_base + page]
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes(c.try_into().unwrap())),
                );
                cursor += 1;
            }

            let needed = size.div_ceil(geometry.data_per_page());
            if ids.len() < needed {
                return Err(FsError::Corrupt("object index shorter than its size").into());
            }

            let mut contents = Vec::with_capacity(size);
            for id in ids.iter().take(needed) {
                let data_base = *id as usize * page;
                if data_base + page > data.len() {
                    return Err(FsError::Corrupt("data page out of range").into());
                }
                let take = (size - contents.len()).min(geometry.data_per_page());
                contents.extend_from_slice(
                    &data[data_base + PAGE_HEADER_LEN..data_base + PAGE_HEADER_LEN + take],
                );
            }

            files.push((name, contents));
        }

        Ok(Self {
            geometry,
            partition_size: data.len(),
            files,
        })
    }

    fn find(&self, path: &str) -> Option<usize> {
        self.files
            .iter()
            .position(|(name, _)| name == path || normalized(name) == normalized(path))
    }

    /// List every file; SPIFFS has no directories, so the one listing is
    /// the whole namespace with each name in its original form
    pub fn list(&self) -> Vec<FileEntry> {
        let mut entries: Vec<FileEntry> = self
            .files
            .iter()
            .map(|(name, contents)| FileEntry {
                path: name.clone(),
                size: contents.len(),
                is_dir: false,
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    pub fn read(&self, path: &str) -> Result<&[u8], Error> {
        let index = self
            .find(path)
            .ok_or_else(|| FsError::NotFound(path.into()))?;
        Ok(&self.files[index].1)
    }

    /// Create or replace a file
    pub fn write(&mut self, path: &str, contents: &[u8]) -> Result<(), Error> {
        if path.trim_start_matches('/').is_empty() {
            return Err(FsError::InvalidPath(path.into()).into());
        }
        if path.len() > SPIFFS_NAME_MAX {
            return Err(FsError::InvalidPath(path.into()).into());
        }

        match self.find(path) {
            Some(index) => self.files[index].1 = contents.to_vec(),
            None => self.files.push((path.to_string(), contents.to_vec())),
        }

        if self.pages_needed() * self.geometry.page_size > self.partition_size {
            // Undo so the instance stays serializable
            self.delete(path).ok();
            return Err(FsError::NoSpace(path.into()).into());
        }

        Ok(())
    }

    /// Directory creation is meaningless on a flat filesystem
    pub fn mkdir(&mut self, _path: &str) -> Result<(), Error> {
        Err(FsError::NotSupported("directories").into())
    }

    pub fn delete(&mut self, path: &str) -> Result<(), Error> {
        let index = self
            .find(path)
            .ok_or_else(|| FsError::NotFound(path.into()))?;
        self.files.remove(index);
        Ok(())
    }

    fn pages_needed(&self) -> usize {
        let mut pages = 1; // magic page
        for (_, contents) in &self.files {
            let data_pages = contents.len().div_ceil(self.geometry.data_per_page()).max(1);
            let mut remaining_ids = data_pages.saturating_sub(self.geometry.ids_in_header_page());
            let mut index_pages = 1;
            while remaining_ids > 0 {
                remaining_ids = remaining_ids.saturating_sub(self.geometry.ids_in_index_page());
                index_pages += 1;
            }
            pages += data_pages + index_pages;
        }
        pages
    }

    /// Serialize by formatting a blank image and re-inserting every file,
    /// consuming the instance
    pub fn to_image(self) -> Result<Vec<u8>, Error> {
        let page = self.geometry.page_size;
        let mut image = vec![0xFFu8; self.partition_size];
        image[0..4].copy_from_slice(&SPIFFS_MAGIC.to_le_bytes());

        if self.pages_needed() * page > self.partition_size {
            return Err(FsError::NoSpace("image".into()).into());
        }

        let mut next_page = 1usize;
        for (obj_index, (name, contents)) in self.files.iter().enumerate() {
            let obj_id = (obj_index + 1) as u16;
            let data_pages = contents
                .len()
                .div_ceil(self.geometry.data_per_page())
                .max(1);

            // Data pages first
            let mut page_ids = Vec::with_capacity(data_pages);
            for span in 0..data_pages {
                let number = next_page;
                next_page += 1;
                page_ids.push(number as u16);

                let base = number * page;
                image[base..base + 2].copy_from_slice(&obj_id.to_le_bytes());
                image[base + 2..base + 4].copy_from_slice(&(span as u16).to_le_bytes());
                image[base + 4] = 0x80; // flags: final

                let offset = span * self.geometry.data_per_page();
                let take = (contents.len() - offset).min(self.geometry.data_per_page());
                image[base + PAGE_HEADER_LEN..base + PAGE_HEADER_LEN + take]
                    .copy_from_slice(&contents[offset..offset + take]);
            }

            // Index header page
            let header_page = next_page;
            next_page += 1;
            let base = header_page * page;
            image[base..base + 2].copy_from_slice(&(obj_id | INDEX_FLAG).to_le_bytes());
            image[base + 2..base + 4].copy_from_slice(&0u16.to_le_bytes());
            image[base + 4] = 0x80;
            image[base + 5..base + 9].copy_from_slice(&(contents.len() as u32).to_le_bytes());
            image[base + 9] = 1; // object type: file

            let mut name_field = [0u8; 32];
            let len = name.len().min(SPIFFS_NAME_MAX);
            name_field[..len].copy_from_slice(&name.as_bytes()[..len]);
            image[base + 10..base + 42].copy_from_slice(&name_field);

            let header_ids = page_ids.len().min(self.geometry.ids_in_header_page());
            for (i, id) in page_ids[..header_ids].iter().enumerate() {
                let at = base + INDEX_HEADER_LEN + i * 2;
                image[at..at + 2].copy_from_slice(&id.to_le_bytes());
            }

            // Continuation index pages for large files
            let mut written = header_ids;
            let mut span = 1u16;
            while written < page_ids.len() {
                let number = next_page;
                next_page += 1;
                let base = number * page;
                image[base..base + 2].copy_from_slice(&(obj_id | INDEX_FLAG).to_le_bytes());
                image[base + 2..base + 4].copy_from_slice(&span.to_le_bytes());
                image[base + 4] = 0x80;

                let batch = (page_ids.len() - written).min(self.geometry.ids_in_index_page());
                for (i, id) in page_ids[written..written + batch].iter().enumerate() {
                    let at = base + PAGE_HEADER_LEN + i * 2;
                    image[at..at + 2].copy_from_slice(&id.to_le_bytes());
                }
                written += batch;
                span += 1;
            }
        }

        Ok(image)
    }
}

/// Names compare equal with or without their leading slash
fn normalized(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{detect, FilesystemKind};

    fn sample() -> SpiffsImage {
        let mut fs = SpiffsImage::format(64 * 1024, SpiffsGeometry::default()).unwrap();
        fs.write("/config.json", b"{\"ap\":true}").unwrap();
        fs.write("data/cal.bin", &[7u8; 700]).unwrap();
        fs
    }

    #[test]
    fn image_carries_magic_and_detects() {
        let image = sample().to_image().unwrap();
        assert_eq!(&image[0..4], &SPIFFS_MAGIC.to_le_bytes());
        assert_eq!(detect(&image), Some(FilesystemKind::Spiffs));
    }

    #[test]
    fn round_trip_preserves_names_verbatim() {
        let image = sample().to_image().unwrap();
        let mounted = SpiffsImage::mount(&image).unwrap();

        let listing = mounted.list();
        assert_eq!(listing.len(), 2);
        // The leading slash (or its absence) survives
        assert!(listing.iter().any(|e| e.path == "/config.json"));
        assert!(listing.iter().any(|e| e.path == "data/cal.bin" && e.size == 700));

        assert_eq!(mounted.read("/config.json").unwrap(), b"{\"ap\":true}");
        assert_eq!(mounted.read("data/cal.bin").unwrap(), &[7u8; 700][..]);
    }

    #[test]
    fn lookup_tolerates_leading_slash_differences() {
        let fs = sample();
        assert!(fs.read("config.json").is_ok());
        assert!(fs.read("/data/cal.bin").is_ok());
    }

    #[test]
    fn mkdir_is_not_supported() {
        let mut fs = sample();
        assert!(matches!(
            fs.mkdir("/logs"),
            Err(Error::Filesystem(FsError::NotSupported(_)))
        ));
    }

    #[test]
    fn delete_then_reserialize_drops_the_file() {
        let mut fs = sample();
        fs.delete("/config.json").unwrap();

        let image = fs.to_image().unwrap();
        let mounted = SpiffsImage::mount(&image).unwrap();
        assert_eq!(mounted.list().len(), 1);
        assert!(mounted.read("/config.json").is_err());
    }

    #[test]
    fn large_files_span_continuation_indices() {
        let mut fs = SpiffsImage::format(256 * 1024, SpiffsGeometry::default()).unwrap();
        let big: Vec<u8> = (0..40_000u32).map(|i| (i % 241) as u8).collect();
        fs.write("big.bin", &big).unwrap();

        let image = fs.to_image().unwrap();
        let mounted = SpiffsImage::mount(&image).unwrap();
        assert_eq!(mounted.read("big.bin").unwrap(), &big[..]);
    }

    #[test]
    fn bad_magic_fails_to_mount() {
        let image = vec![0u8; 64 * 1024];
        assert!(matches!(
            SpiffsImage::mount(&image),
            Err(Error::MountFailed(FilesystemKind::Spiffs))
        ));
    }

    #[test]
    fn name_length_is_bounded() {
        let mut fs = sample();
        let long = "x".repeat(40);
        assert!(fs.write(&long, b"y").is_err());
    }
}
