//! LittleFS v2 image codec
//!
//! Mounts an image by walking the metadata tags of each directory pair,
//! building the tree as an arena of nodes with parent indices. Files are
//! materialized eagerly (inline structs out of the metadata itself, CTZ
//! skip-lists out of the data blocks), so the instance owns everything it
//! needs and [LittleFsImage::to_image] can emit a fresh, mirrored image
//! of partition size.

use std::collections::HashSet;

use log::debug;

use crate::{
    error::{Error, FsError},
    fs::{FileEntry, FilesystemKind, LITTLEFS_BLOCK_CANDIDATES},
};

/// On-disk version word: major 2, minor 0
const DISK_VERSION: u32 = 0x0002_0000;

// 12-bit tag types
const TYPE_NAME_REG: u16 = 0x001;
const TYPE_NAME_DIR: u16 = 0x002;
const TYPE_SUPERBLOCK: u16 = 0x0FF;
const TYPE_STRUCT_DIR: u16 = 0x200;
const TYPE_STRUCT_INLINE: u16 = 0x201;
const TYPE_STRUCT_CTZ: u16 = 0x202;
const TYPE_CRC: u16 = 0x500;

/// Tag id used when the tag is not tied to an entry
const NO_ID: u16 = 0x3FF;

/// Mount-time tuning, matching the littlefs `lfs_config` fields that
/// matter to a host-side codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LittleFsConfig {
    pub read_size: u32,
    pub prog_size: u32,
    pub cache_size: u32,
    pub lookahead_size: u32,
    pub name_max: usize,
    pub block_cycles: i32,
}

impl Default for LittleFsConfig {
    fn default() -> Self {
        Self {
            read_size: 256,
            prog_size: 256,
            cache_size: 256,
            lookahead_size: 128,
            name_max: 255,
            block_cycles: 512,
        }
    }
}

impl LittleFsConfig {
    /// The geometry the ESP8266 Arduino core formats with
    pub fn esp8266() -> Self {
        Self {
            read_size: 64,
            prog_size: 64,
            cache_size: 64,
            lookahead_size: 64,
            name_max: 32,
            block_cycles: 16,
        }
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Dir,
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    /// Arena index of the parent; the root points at itself
    parent: usize,
    kind: NodeKind,
}

/// A mounted LittleFS image
pub struct LittleFsImage {
    config: LittleFsConfig,
    block_size: u32,
    block_count: u32,
    nodes: Vec<Node>,
}

/// A decoded metadata tag
#[derive(Debug, Clone, Copy)]
struct Tag {
    type12: u16,
    id: u16,
    len: usize,
    /// Offset of the payload within the block
    data_off: usize,
}

/// Decode one metadata block into its revision word and tag list
///
/// Tags are 32-bit big-endian words XOR-chained against their predecessor
/// (chain seed 0xFFFFFFFF); a decoded tag with the top bit set marks the
/// end of the log. Payloads are padded to 32-bit alignment.
fn parse_metadata_block(block: &[u8]) -> (u32, Vec<Tag>) {
    let mut tags = Vec::new();
    if block.len() < 4 {
        return (0, tags);
    }

    let rev = u32::from_le_bytes(block[0..4].try_into().unwrap());
    let mut ptag: u32 = 0xFFFF_FFFF;
    let mut pos = 4;

    while pos + 4 <= block.len() {
        let raw = u32::from_be_bytes(block[pos..pos + 4].try_into().unwrap());
        let tag = raw ^ ptag;
        if tag & 0x8000_0000 != 0 {
            break;
        }
        ptag = tag;

        let type12 = ((tag >> 20) & 0xFFF) as u16;
        let id = ((tag >> 10) & 0x3FF) as u16;
        let raw_len = (tag & 0x3FF) as usize;
        // 0x3FF length marks a tag without payload (deletions)
        let len = if raw_len == 0x3FF { 0 } else { raw_len };

        let data_off = pos + 4;
        if data_off + len > block.len() {
            break;
        }

        tags.push(Tag {
            type12,
            id,
            len,
            data_off,
        });

        pos = data_off + len.next_multiple_of(4);
        if type12 == TYPE_CRC {
            // A commit boundary; everything after it in our own images is
            // erased flash
            break;
        }
    }

    (rev, tags)
}

/// XOR-chained tag writer for one metadata block
struct MetadataBuilder {
    buf: Vec<u8>,
    ptag: u32,
}

impl MetadataBuilder {
    fn new(rev: u32) -> Self {
        Self {
            buf: rev.to_le_bytes().to_vec(),
            ptag: 0xFFFF_FFFF,
        }
    }

    fn push(&mut self, type12: u16, id: u16, data: &[u8]) {
        let tag = ((type12 as u32 & 0xFFF) << 20)
            | ((id as u32 & 0x3FF) << 10)
            | (data.len() as u32 & 0x3FF);
        self.buf.extend_from_slice(&(tag ^ self.ptag).to_be_bytes());
        self.ptag = tag;

        self.buf.extend_from_slice(data);
        let padded = data.len().next_multiple_of(4);
        self.buf.extend(std::iter::repeat(0).take(padded - data.len()));
    }

    /// Close the log with a CRC commit tag and pad out to a full block
    fn finish(mut self, block_size: usize) -> Result<Vec<u8>, FsError> {
        let crc = lfs_crc32(&self.buf);
        self.push(TYPE_CRC, NO_ID, &crc.to_le_bytes());

        if self.buf.len() > block_size {
            return Err(FsError::NoSpace("metadata block".into()));
        }
        self.buf.resize(block_size, 0xFF);
        Ok(self.buf)
    }
}

/// The CRC littlefs stamps its commits with: polynomial 0x04C11DB7,
/// reflected, all-ones init, no final XOR
fn lfs_crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// Pointer words at the head of CTZ block `index`
fn ctz_pointer_count(index: usize) -> usize {
    if index == 0 {
        0
    } else {
        index.trailing_zeros() as usize + 1
    }
}

/// Payload capacity of CTZ block `index`
fn ctz_capacity(block_size: usize, index: usize) -> usize {
    block_size - 4 * ctz_pointer_count(index)
}

/// Number of CTZ blocks a file of `size` bytes occupies
fn ctz_block_count(block_size: usize, size: usize) -> usize {
    let mut remaining = size;
    let mut index = 0;
    loop {
        let cap = ctz_capacity(block_size, index);
        if remaining <= cap {
            return index + 1;
        }
        remaining -= cap;
        index += 1;
    }
}

impl LittleFsImage {
    /// Create an empty filesystem of `partition_size` bytes
    pub fn format(partition_size: usize, block_size: u32, config: LittleFsConfig) -> Result<Self, Error> {
        if block_size == 0 || partition_size < 2 * block_size as usize {
            return Err(Error::MountFailed(FilesystemKind::LittleFs));
        }

        Ok(Self {
            config,
            block_size,
            block_count: (partition_size / block_size as usize) as u32,
            nodes: vec![Node {
                name: String::new(),
                parent: 0,
                kind: NodeKind::Dir,
            }],
        })
    }

    /// Mount an image, probing the desktop block-size candidates
    pub fn mount(data: &[u8]) -> Result<Self, Error> {
        Self::mount_with(data, LITTLEFS_BLOCK_CANDIDATES, LittleFsConfig::default())
    }

    /// Mount with explicit candidates and tuning (the ESP8266 geometry
    /// differs in both)
    pub fn mount_with(
        data: &[u8],
        candidates: &[u32],
        config: LittleFsConfig,
    ) -> Result<Self, Error> {
        for block_size in candidates {
            match Self::try_mount(data, *block_size, config) {
                Ok(image) => return Ok(image),
                Err(err) => debug!("Mount with block size {block_size} failed: {err:?}"),
            }
        }

        Err(Error::MountFailed(FilesystemKind::LittleFs))
    }

    fn try_mount(data: &[u8], candidate: u32, config: LittleFsConfig) -> Result<Self, Error> {
        let bs = candidate as usize;
        if data.len() < 2 * bs {
            return Err(Error::MountFailed(FilesystemKind::LittleFs));
        }

        // The root pair is blocks {0, 1}; take whichever side parses with
        // the higher revision
        let (tags, _) = Self::parse_pair(data, bs, [0, 1])
            .ok_or(Error::MountFailed(FilesystemKind::LittleFs))?;

        // The pair must hold the superblock entry
        let superblock = tags
            .iter()
            .find(|(tag, _)| tag.type12 == TYPE_SUPERBLOCK && tag.len == 8)
            .ok_or(Error::MountFailed(FilesystemKind::LittleFs))?;
        if superblock.1 != b"littlefs" {
            return Err(Error::MountFailed(FilesystemKind::LittleFs));
        }

        let inline = tags
            .iter()
            .find(|(tag, _)| tag.type12 == TYPE_STRUCT_INLINE && tag.id == superblock.0.id)
            .ok_or(Error::MountFailed(FilesystemKind::LittleFs))?;
        if inline.1.len() < 12 {
            return Err(Error::MountFailed(FilesystemKind::LittleFs));
        }

        let version = u32::from_le_bytes(inline.1[0..4].try_into().unwrap());
        if version >> 16 != 2 {
            return Err(Error::MountFailed(FilesystemKind::LittleFs));
        }

        let block_size = u32::from_le_bytes(inline.1[4..8].try_into().unwrap());
        if block_size as usize != bs {
            return Err(Error::MountFailed(FilesystemKind::LittleFs));
        }

        let stored_count = u32::from_le_bytes(inline.1[8..12].try_into().unwrap());
        let block_count = if stored_count != 0 {
            stored_count
        } else {
            (data.len() / bs) as u32
        };

        let mut image = Self {
            config,
            block_size,
            block_count,
            nodes: vec![Node {
                name: String::new(),
                parent: 0,
                kind: NodeKind::Dir,
            }],
        };

        let mut visited = HashSet::new();
        visited.insert(0u32);
        visited.insert(1u32);
        image.load_dir(data, 0, [0, 1], &mut visited)?;

        Ok(image)
    }

    /// Decode both blocks of a metadata pair; returns the winning side's
    /// tags with their payloads resolved
    fn parse_pair(data: &[u8], bs: usize, pair: [u32; 2]) -> Option<(Vec<(Tag, Vec<u8>)>, u32)> {
        let mut best: Option<(u32, u32, Vec<Tag>)> = None;

        for block_no in pair {
            let start = block_no as usize * bs;
            let Some(block) = data.get(start..start + bs) else {
                continue;
            };
            let (rev, tags) = parse_metadata_block(block);
            if tags.is_empty() {
                continue;
            }
            let better = match &best {
                Some((best_rev, _, _)) => rev > *best_rev,
                None => true,
            };
            if better {
                best = Some((rev, block_no, tags));
            }
        }

        let (_, block_no, tags) = best?;
        let start = block_no as usize * bs;
        let block = &data[start..start + bs];

        let resolved = tags
            .into_iter()
            .map(|tag| {
                let payload = block[tag.data_off..tag.data_off + tag.len].to_vec();
                (tag, payload)
            })
            .collect();

        Some((resolved, block_no))
    }

    /// Recursively load a directory pair into the arena
    fn load_dir(
        &mut self,
        data: &[u8],
        parent: usize,
        pair: [u32; 2],
        visited: &mut HashSet<u32>,
    ) -> Result<(), Error> {
        let bs = self.block_size as usize;
        let Some((tags, _)) = Self::parse_pair(data, bs, pair) else {
            return Err(Error::MountFailed(FilesystemKind::LittleFs));
        };

        // First pass: names; second pass: structures by id
        for (tag, payload) in &tags {
            let kind = match tag.type12 {
                TYPE_NAME_REG => NodeKind::File(Vec::new()),
                TYPE_NAME_DIR => NodeKind::Dir,
                _ => continue,
            };

            let name = String::from_utf8_lossy(payload).into_owned();
            let node_index = self.nodes.len();
            self.nodes.push(Node {
                name,
                parent,
                kind,
            });

            // Locate this entry's struct tag
            let structure = tags.iter().find(|(t, _)| {
                t.id == tag.id
                    && matches!(
                        t.type12,
                        TYPE_STRUCT_INLINE | TYPE_STRUCT_CTZ | TYPE_STRUCT_DIR
                    )
            });
            let Some((st, spayload)) = structure else {
                continue;
            };

            match st.type12 {
                TYPE_STRUCT_INLINE => {
                    self.nodes[node_index].kind = NodeKind::File(spayload.clone());
                }
                TYPE_STRUCT_CTZ if spayload.len() >= 8 => {
                    let head = u32::from_le_bytes(spayload[0..4].try_into().unwrap());
                    let size = u32::from_le_bytes(spayload[4..8].try_into().unwrap());
                    let contents = self.read_ctz(data, head, size as usize)?;
                    self.nodes[node_index].kind = NodeKind::File(contents);
                }
                TYPE_STRUCT_DIR if spayload.len() >= 8 => {
                    let a = u32::from_le_bytes(spayload[0..4].try_into().unwrap());
                    let b = u32::from_le_bytes(spayload[4..8].try_into().unwrap());
                    // Cycle guard: directory entries can reference each
                    // other in corrupted images
                    if visited.insert(a) && visited.insert(b) {
                        self.load_dir(data, node_index, [a, b], visited)?;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Assemble a file stored as a CTZ skip-list
    ///
    /// `head` is the disk block of the *last* list element; every block
    /// except index 0 leads with its back-pointers, the first of which is
    /// enough to walk the chain backwards.
    fn read_ctz(&self, data: &[u8], head: u32, size: usize) -> Result<Vec<u8>, Error> {
        let bs = self.block_size as usize;
        if size == 0 {
            return Ok(Vec::new());
        }

        let count = ctz_block_count(bs, size);
        let mut disk_blocks = vec![0u32; count];
        let mut current = head;

        for index in (1..count).rev() {
            disk_blocks[index] = current;
            let start = current as usize * bs;
            let ptr_bytes = data
                .get(start..start + 4)
                .ok_or(Error::Filesystem(FsError::Corrupt("CTZ pointer out of range")))?;
            current = u32::from_le_bytes(ptr_bytes.try_into().unwrap());
        }
        disk_blocks[0] = current;

        let mut contents = Vec::with_capacity(size);
        let mut remaining = size;
        for (index, block_no) in disk_blocks.iter().enumerate() {
            let skip = 4 * ctz_pointer_count(index);
            let take = remaining.min(ctz_capacity(bs, index));
            let start = *block_no as usize * bs + skip;
            let chunk = data
                .get(start..start + take)
                .ok_or(Error::Filesystem(FsError::Corrupt("CTZ data out of range")))?;
            contents.extend_from_slice(chunk);
            remaining -= take;
        }

        Ok(contents)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Resolve a path to an arena index
    fn resolve(&self, path: &str) -> Option<usize> {
        let mut current = 0usize;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.child(current, component)?;
        }
        Some(current)
    }

    fn child(&self, parent: usize, name: &str) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .find(|(index, node)| {
                node.parent == parent && node.name == name && *index != parent
            })
            .map(|(index, _)| index)
    }

    fn full_path(&self, mut index: usize) -> String {
        let mut components = Vec::new();
        while index != 0 {
            components.push(self.nodes[index].name.clone());
            index = self.nodes[index].parent;
        }
        components.reverse();
        format!("/{}", components.join("/"))
    }

    /// List the direct children of `path`
    pub fn list(&self, path: &str) -> Result<Vec<FileEntry>, Error> {
        let dir = self
            .resolve(path)
            .ok_or_else(|| FsError::NotFound(path.into()))?;
        if !matches!(self.nodes[dir].kind, NodeKind::Dir) {
            return Err(FsError::InvalidPath(path.into()).into());
        }

        let mut entries: Vec<FileEntry> = self
            .nodes
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(index, node)| node.parent == dir && *index != dir)
            .map(|(index, node)| FileEntry {
                path: self.full_path(index),
                size: match &node.kind {
                    NodeKind::File(data) => data.len(),
                    NodeKind::Dir => 0,
                },
                is_dir: matches!(node.kind, NodeKind::Dir),
            })
            .collect();

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Read a file's contents
    pub fn read(&self, path: &str) -> Result<&[u8], Error> {
        let index = self
            .resolve(path)
            .ok_or_else(|| FsError::NotFound(path.into()))?;
        match &self.nodes[index].kind {
            NodeKind::File(data) => Ok(data),
            NodeKind::Dir => Err(FsError::InvalidPath(path.into()).into()),
        }
    }

    /// Create or replace a file
    pub fn write(&mut self, path: &str, contents: &[u8]) -> Result<(), Error> {
        let (parent_path, name) = split_path(path)?;
        if name.len() > self.config.name_max {
            return Err(FsError::InvalidPath(path.into()).into());
        }

        let parent = self
            .resolve(parent_path)
            .ok_or_else(|| FsError::NotFound(parent_path.into()))?;
        if !matches!(self.nodes[parent].kind, NodeKind::Dir) {
            return Err(FsError::InvalidPath(parent_path.into()).into());
        }

        let previous = match self.child(parent, name) {
            Some(existing) => {
                if matches!(self.nodes[existing].kind, NodeKind::Dir) {
                    return Err(FsError::AlreadyExists(path.into()).into());
                }
                let old = std::mem::replace(
                    &mut self.nodes[existing].kind,
                    NodeKind::File(contents.to_vec()),
                );
                Some((existing, old))
            }
            None => {
                self.nodes.push(Node {
                    name: name.to_string(),
                    parent,
                    kind: NodeKind::File(contents.to_vec()),
                });
                None
            }
        };

        if self.usage_estimate() > (self.block_count as usize) * (self.block_size as usize) {
            // Roll the write back so the instance stays serializable
            match previous {
                Some((existing, old)) => self.nodes[existing].kind = old,
                None => {
                    self.nodes.pop();
                }
            }
            return Err(FsError::NoSpace(path.into()).into());
        }

        Ok(())
    }

    /// Create a directory
    pub fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        let (parent_path, name) = split_path(path)?;
        if name.len() > self.config.name_max {
            return Err(FsError::InvalidPath(path.into()).into());
        }

        let parent = self
            .resolve(parent_path)
            .ok_or_else(|| FsError::NotFound(parent_path.into()))?;
        if self.child(parent, name).is_some() {
            return Err(FsError::AlreadyExists(path.into()).into());
        }

        self.nodes.push(Node {
            name: name.to_string(),
            parent,
            kind: NodeKind::Dir,
        });
        Ok(())
    }

    /// Remove a file or (recursively) a directory
    pub fn delete(&mut self, path: &str) -> Result<(), Error> {
        let index = self
            .resolve(path)
            .ok_or_else(|| FsError::NotFound(path.into()))?;
        if index == 0 {
            return Err(FsError::InvalidPath(path.into()).into());
        }

        // Collect the whole subtree before touching the arena
        let mut doomed = vec![index];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let target = doomed[cursor];
            cursor += 1;
            for (i, node) in self.nodes.iter().enumerate().skip(1) {
                if node.parent == target && !doomed.contains(&i) {
                    doomed.push(i);
                }
            }
        }

        // Highest first so removal does not shift earlier indices
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for target in doomed {
            self.nodes.remove(target);
            for node in self.nodes.iter_mut() {
                if node.parent > target {
                    node.parent -= 1;
                }
            }
        }

        Ok(())
    }

    /// Estimated bytes used, a monotone upper bound of the true value
    ///
    /// Two blocks for the root metadata mirrors; per file the data blocks
    /// plus one metadata block; per directory one block.
    pub fn usage_estimate(&self) -> usize {
        let block = self.block_size as usize;
        let mut used = 2 * block;

        for node in self.nodes.iter().skip(1) {
            match &node.kind {
                NodeKind::File(data) => {
                    used += data.len().div_ceil(block) * block + block;
                }
                NodeKind::Dir => used += block,
            }
        }

        used
    }

    /// Serialize into a flashable image of the partition size, consuming
    /// the instance
    pub fn to_image(self) -> Result<Vec<u8>, Error> {
        let bs = self.block_size as usize;
        let total = self.block_count as usize * bs;
        let mut image = vec![0xFFu8; total];

        // Inline payloads must fit the 10-bit tag length
        let inline_max = (bs / 4).min(0x3FE);

        // Assign metadata pairs: root gets {0, 1}, every directory its own
        // pair after that
        let mut next_block = 2u32;
        let mut dir_pairs: Vec<Option<[u32; 2]>> = vec![None; self.nodes.len()];
        dir_pairs[0] = Some([0, 1]);
        for (index, node) in self.nodes.iter().enumerate().skip(1) {
            if matches!(node.kind, NodeKind::Dir) {
                dir_pairs[index] = Some([next_block, next_block + 1]);
                next_block += 2;
            }
        }

        // Lay out CTZ chains for files too large to inline
        let mut file_structs: Vec<Option<(u32, u32)>> = vec![None; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate().skip(1) {
            let NodeKind::File(data) = &node.kind else {
                continue;
            };
            if data.len() <= inline_max {
                continue;
            }

            let count = ctz_block_count(bs, data.len());
            if next_block as usize + count > self.block_count as usize {
                return Err(FsError::NoSpace(node.name.clone()).into());
            }

            let mut offset = 0usize;
            let mut blocks = Vec::with_capacity(count);
            for ctz_index in 0..count {
                let disk = next_block;
                next_block += 1;
                blocks.push(disk);

                let base = disk as usize * bs;
                // Back-pointers: 2^k steps for k in 0..=ctz(index)
                for k in 0..ctz_pointer_count(ctz_index) {
                    let target = blocks[ctz_index - (1 << k)];
                    let at = base + 4 * k;
                    image[at..at + 4].copy_from_slice(&target.to_le_bytes());
                }

                let skip = 4 * ctz_pointer_count(ctz_index);
                let take = (data.len() - offset).min(ctz_capacity(bs, ctz_index));
                image[base + skip..base + skip + take]
                    .copy_from_slice(&data[offset..offset + take]);
                offset += take;
            }

            file_structs[index] = Some((*blocks.last().unwrap(), data.len() as u32));
        }

        if next_block as usize > self.block_count as usize {
            return Err(FsError::NoSpace("image".into()).into());
        }

        // Emit each directory pair's metadata
        for (dir_index, pair) in dir_pairs.iter().enumerate() {
            let Some(pair) = pair else { continue };

            let mut builder = MetadataBuilder::new(DISK_VERSION);

            let mut next_id: u16 = 0;
            if dir_index == 0 {
                // Superblock entry occupies id 0 of the root pair
                builder.push(TYPE_SUPERBLOCK, 0, b"littlefs");
                let mut inline = Vec::with_capacity(24);
                inline.extend_from_slice(&DISK_VERSION.to_le_bytes());
                inline.extend_from_slice(&self.block_size.to_le_bytes());
                inline.extend_from_slice(&self.block_count.to_le_bytes());
                inline.extend_from_slice(&(self.config.name_max as u32).to_le_bytes());
                inline.extend_from_slice(&0x7FFF_FFFFu32.to_le_bytes()); // file_max
                inline.extend_from_slice(&0x3FEu32.to_le_bytes()); // attr_max
                builder.push(TYPE_STRUCT_INLINE, 0, &inline);
                next_id = 1;
            }

            let mut children: Vec<usize> = (1..self.nodes.len())
                .filter(|i| self.nodes[*i].parent == dir_index && *i != dir_index)
                .collect();
            children.sort_by(|a, b| self.nodes[*a].name.cmp(&self.nodes[*b].name));

            for child in children {
                let node = &self.nodes[child];
                let id = next_id;
                next_id += 1;

                match &node.kind {
                    NodeKind::File(data) => {
                        builder.push(TYPE_NAME_REG, id, node.name.as_bytes());
                        if let Some((head, size)) = file_structs[child] {
                            let mut ctz = Vec::with_capacity(8);
                            ctz.extend_from_slice(&head.to_le_bytes());
                            ctz.extend_from_slice(&size.to_le_bytes());
                            builder.push(TYPE_STRUCT_CTZ, id, &ctz);
                        } else {
                            builder.push(TYPE_STRUCT_INLINE, id, data);
                        }
                    }
                    NodeKind::Dir => {
                        builder.push(TYPE_NAME_DIR, id, node.name.as_bytes());
                        let child_pair = dir_pairs[child].unwrap();
                        let mut dirstruct = Vec::with_capacity(8);
                        dirstruct.extend_from_slice(&child_pair[0].to_le_bytes());
                        dirstruct.extend_from_slice(&child_pair[1].to_le_bytes());
                        builder.push(TYPE_STRUCT_DIR, id, &dirstruct);
                    }
                }
            }

            let block = builder.finish(bs)?;
            for block_no in pair {
                let start = *block_no as usize * bs;
                image[start..start + bs].copy_from_slice(&block);
            }
        }

        Ok(image)
    }
}

fn split_path(path: &str) -> Result<(&str, &str), FsError> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidPath(path.into()));
    }

    match trimmed.rfind('/') {
        Some(split) => Ok((&trimmed[..split], &trimmed[split + 1..])),
        None => Ok(("", trimmed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{detect, FilesystemKind};

    fn sample_image() -> LittleFsImage {
        let mut fs = LittleFsImage::format(256 * 1024, 4096, LittleFsConfig::default()).unwrap();
        fs.write("/boot.cfg", b"mode=fast\n").unwrap();
        fs.mkdir("/www").unwrap();
        fs.write("/www/index.html", b"<html>hi</html>").unwrap();
        // Large enough to need a CTZ chain over several blocks
        let blob: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
        fs.write("/www/app.bin", &blob).unwrap();
        fs
    }

    #[test]
    fn to_image_is_detectable_and_mirrored() {
        let image = sample_image().to_image().unwrap();
        assert_eq!(image.len(), 256 * 1024);
        assert_eq!(detect(&image), Some(FilesystemKind::LittleFs));

        // Both superblock mirrors carry the tag
        assert_eq!(&image[8..16], b"littlefs");
        assert_eq!(&image[4096 + 8..4096 + 16], b"littlefs");
    }

    #[test]
    fn round_trip_preserves_paths_and_contents() {
        let original = sample_image();
        let expected_list = original.list("/").unwrap();
        let blob = original.read("/www/app.bin").unwrap().to_vec();

        let image = original.to_image().unwrap();
        let mounted = LittleFsImage::mount(&image).unwrap();

        assert_eq!(mounted.list("/").unwrap(), expected_list);
        assert_eq!(mounted.read("/boot.cfg").unwrap(), b"mode=fast\n");
        assert_eq!(mounted.read("/www/index.html").unwrap(), b"<html>hi</html>");
        assert_eq!(mounted.read("/www/app.bin").unwrap(), &blob[..]);

        let www = mounted.list("/www").unwrap();
        assert_eq!(www.len(), 2);
        assert!(www.iter().any(|e| e.path == "/www/app.bin" && e.size == blob.len()));
    }

    #[test]
    fn wrong_major_version_fails_to_mount() {
        let mut image = sample_image().to_image().unwrap();
        // Patch the version word inside the superblock inline struct of
        // both mirrors: major 3
        let mounted = LittleFsImage::mount(&image).unwrap();
        drop(mounted);

        // The inline struct payload follows the name tag: rev(4) + tag(4)
        // + "littlefs"(8) + tag(4) puts the version at offset 20
        for base in [0usize, 4096] {
            image[base + 22] = 0x03;
        }
        assert!(matches!(
            LittleFsImage::mount(&image),
            Err(Error::MountFailed(FilesystemKind::LittleFs))
        ));
    }

    #[test]
    fn mount_rejects_garbage() {
        assert!(LittleFsImage::mount(&vec![0xAB; 64 * 1024]).is_err());
        assert!(LittleFsImage::mount(&[]).is_err());
    }

    #[test]
    fn delete_removes_subtrees() {
        let mut fs = sample_image();
        fs.delete("/www").unwrap();
        assert!(fs.read("/www/index.html").is_err());
        assert_eq!(fs.list("/").unwrap().len(), 1);
    }

    #[test]
    fn overwrite_replaces_contents() {
        let mut fs = sample_image();
        fs.write("/boot.cfg", b"mode=slow\n").unwrap();
        assert_eq!(fs.read("/boot.cfg").unwrap(), b"mode=slow\n");

        let image = fs.to_image().unwrap();
        let mounted = LittleFsImage::mount(&image).unwrap();
        assert_eq!(mounted.read("/boot.cfg").unwrap(), b"mode=slow\n");
    }

    #[test]
    fn name_max_is_enforced() {
        let mut fs =
            LittleFsImage::format(64 * 1024, 4096, LittleFsConfig::esp8266()).unwrap();
        let long = format!("/{}", "n".repeat(33));
        assert!(fs.write(&long, b"x").is_err());
    }

    #[test]
    fn usage_estimate_is_monotone_upper_bound() {
        let mut fs = LittleFsImage::format(256 * 1024, 4096, LittleFsConfig::default()).unwrap();
        let empty = fs.usage_estimate();
        assert_eq!(empty, 2 * 4096);

        fs.write("/a", &[0u8; 10]).unwrap();
        let one = fs.usage_estimate();
        assert!(one > empty);

        fs.write("/b", &[0u8; 9000]).unwrap();
        let two = fs.usage_estimate();
        assert!(two > one);
        // 9000 bytes -> 3 data blocks + 1 metadata block
        assert_eq!(two - one, 4 * 4096);
    }

    #[test]
    fn write_into_missing_directory_fails() {
        let mut fs = LittleFsImage::format(64 * 1024, 4096, LittleFsConfig::default()).unwrap();
        assert!(matches!(
            fs.write("/nope/file", b"x"),
            Err(Error::Filesystem(FsError::NotFound(_)))
        ));
    }

    #[test]
    fn ctz_geometry() {
        assert_eq!(ctz_pointer_count(0), 0);
        assert_eq!(ctz_pointer_count(1), 1);
        assert_eq!(ctz_pointer_count(2), 2);
        assert_eq!(ctz_pointer_count(3), 1);
        assert_eq!(ctz_pointer_count(4), 3);

        // A file one byte over a block's capacity spills into a second
        assert_eq!(ctz_block_count(4096, 4096), 1);
        assert_eq!(ctz_block_count(4096, 4097), 2);
    }
}
