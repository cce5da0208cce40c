//! NVS (non-volatile storage) partition codec
//!
//! An NVS partition is a log-structured key/value store over 4 KiB pages.
//! Every page carries a 32-byte header, a 2-bit-per-entry state map, and
//! 126 packed 32-byte entries. This codec decodes the live entries,
//! resolves namespaces, and supports in-place edits that keep the entry
//! CRCs consistent with what ESP-IDF validates on boot.

use std::collections::HashMap;

use crc::{Algorithm, Crc};
use log::warn;

use crate::error::{Error, NvsError};

pub const NVS_PAGE_SIZE: usize = 4096;
const PAGE_HEADER_SIZE: usize = 32;
const BITMAP_SIZE: usize = 32;
const ENTRY_SIZE: usize = 32;
/// Entries per page: (4096 - 64) / 32
pub const ENTRIES_PER_PAGE: usize = 126;

const KEY_LEN: usize = 16;

/// CRC-32 with the IEEE polynomial, zero init and inverted output, the
/// variant the NVS on-flash format uses everywhere
const NVS_CRC_ALGORITHM: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04C1_1DB7,
    init: 0x0000_0000,
    refin: true,
    refout: true,
    xorout: 0xFFFF_FFFF,
    check: 0,
    residue: 0,
};

const NVS_CRC: Crc<u32> = Crc::<u32>::new(&NVS_CRC_ALGORITHM);

pub(crate) fn nvs_crc32(data: &[u8]) -> u32 {
    NVS_CRC.checksum(data)
}

/// Header CRC input: entry bytes [0..4) and [8..32), skipping the word the
/// CRC itself lives in
fn entry_header_crc(entry: &[u8]) -> u32 {
    let mut digest = NVS_CRC.digest();
    digest.update(&entry[0..4]);
    digest.update(&entry[8..32]);
    digest.finalize()
}

/// Page lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageState {
    Uninitialized = 0xFFFF_FFFF,
    Active = 0xFFFF_FFFE,
    Full = 0xFFFF_FFFC,
    Freeing = 0xFFFF_FFF8,
    Corrupt = 0xFFFF_FFF0,
}

impl PageState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0xFFFF_FFFF => PageState::Uninitialized,
            0xFFFF_FFFE => PageState::Active,
            0xFFFF_FFFC => PageState::Full,
            0xFFFF_FFF8 => PageState::Freeing,
            _ => PageState::Corrupt,
        }
    }
}

/// Per-entry state from the page bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Empty,
    Written,
    Erased,
}

impl EntryState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            3 => EntryState::Empty,
            2 => EntryState::Written,
            _ => EntryState::Erased,
        }
    }

    fn bits(self) -> u8 {
        match self {
            EntryState::Empty => 3,
            EntryState::Written => 2,
            EntryState::Erased => 0,
        }
    }
}

/// On-flash data-type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    U8 = 0x01,
    U16 = 0x02,
    U32 = 0x04,
    U64 = 0x08,
    I8 = 0x11,
    I16 = 0x12,
    I32 = 0x14,
    I64 = 0x18,
    Str = 0x21,
    Blob = 0x41,
    BlobData = 0x42,
    BlobIndex = 0x48,
}

impl DataType {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => DataType::U8,
            0x02 => DataType::U16,
            0x04 => DataType::U32,
            0x08 => DataType::U64,
            0x11 => DataType::I8,
            0x12 => DataType::I16,
            0x14 => DataType::I32,
            0x18 => DataType::I64,
            0x21 => DataType::Str,
            0x41 => DataType::Blob,
            0x42 => DataType::BlobData,
            0x48 => DataType::BlobIndex,
            _ => return None,
        })
    }

    /// Width of a primitive payload, `None` for the variable-size types
    fn primitive_width(self) -> Option<usize> {
        match self {
            DataType::U8 | DataType::I8 => Some(1),
            DataType::U16 | DataType::I16 => Some(2),
            DataType::U32 | DataType::I32 => Some(4),
            DataType::U64 | DataType::I64 => Some(8),
            _ => None,
        }
    }
}

/// A decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum NvsValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    Str(String),
    Blob(Vec<u8>),
    /// Index entry tying together the chunks of a large blob
    BlobIndex {
        total_size: u32,
        chunk_count: u8,
        chunk_start: u8,
    },
}

impl NvsValue {
    fn data_type(&self) -> DataType {
        match self {
            NvsValue::U8(_) => DataType::U8,
            NvsValue::I8(_) => DataType::I8,
            NvsValue::U16(_) => DataType::U16,
            NvsValue::I16(_) => DataType::I16,
            NvsValue::U32(_) => DataType::U32,
            NvsValue::I32(_) => DataType::I32,
            NvsValue::U64(_) => DataType::U64,
            NvsValue::I64(_) => DataType::I64,
            NvsValue::Str(_) => DataType::Str,
            NvsValue::Blob(_) => DataType::BlobData,
            NvsValue::BlobIndex { .. } => DataType::BlobIndex,
        }
    }

    fn primitive_bytes(&self) -> Option<Vec<u8>> {
        Some(match self {
            NvsValue::U8(v) => vec![*v],
            NvsValue::I8(v) => v.to_le_bytes().to_vec(),
            NvsValue::U16(v) => v.to_le_bytes().to_vec(),
            NvsValue::I16(v) => v.to_le_bytes().to_vec(),
            NvsValue::U32(v) => v.to_le_bytes().to_vec(),
            NvsValue::I32(v) => v.to_le_bytes().to_vec(),
            NvsValue::U64(v) => v.to_le_bytes().to_vec(),
            NvsValue::I64(v) => v.to_le_bytes().to_vec(),
            _ => return None,
        })
    }
}

/// A live entry with its location inside the partition
#[derive(Debug, Clone)]
pub struct NvsEntry {
    pub namespace: String,
    pub key: String,
    pub value: NvsValue,
    /// The stored header CRC matched the recomputed one
    pub crc_ok: bool,
    pub page: usize,
    pub slot: usize,
    pub span: usize,
}

/// An NVS partition image with in-place edit support
///
/// The buffer is owned; [NvsPartition::into_bytes] hands it back for
/// flashing once edits are done.
pub struct NvsPartition {
    data: Vec<u8>,
    dirty: bool,
}

impl NvsPartition {
    pub fn new(data: Vec<u8>) -> Result<Self, Error> {
        if data.is_empty() || data.len() % NVS_PAGE_SIZE != 0 {
            return Err(NvsError::Corrupt("size is not a multiple of the page size").into());
        }

        Ok(Self { data, dirty: false })
    }

    /// Whether any edit has touched the buffer
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Consume the partition, returning the (possibly edited) image
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn page_count(&self) -> usize {
        self.data.len() / NVS_PAGE_SIZE
    }

    fn page_state(&self, page: usize) -> PageState {
        let base = page * NVS_PAGE_SIZE;
        let raw = u32::from_le_bytes(self.data[base..base + 4].try_into().unwrap());
        PageState::from_raw(raw)
    }

    fn entry_state(&self, page: usize, slot: usize) -> EntryState {
        let base = page * NVS_PAGE_SIZE + PAGE_HEADER_SIZE;
        let byte = self.data[base + slot / 4];
        EntryState::from_bits((byte >> ((slot % 4) * 2)) & 0x3)
    }

    fn set_entry_state(&mut self, page: usize, slot: usize, state: EntryState) {
        let base = page * NVS_PAGE_SIZE + PAGE_HEADER_SIZE;
        let shift = (slot % 4) * 2;
        let byte = &mut self.data[base + slot / 4];
        *byte = (*byte & !(0x3 << shift)) | (state.bits() << shift);
    }

    fn entry_offset(&self, page: usize, slot: usize) -> usize {
        page * NVS_PAGE_SIZE + PAGE_HEADER_SIZE + BITMAP_SIZE + slot * ENTRY_SIZE
    }

    fn entry_bytes(&self, page: usize, slot: usize) -> &[u8] {
        let offset = self.entry_offset(page, slot);
        &self.data[offset..offset + ENTRY_SIZE]
    }

    /// Pages that take part in decoding, in image order, stopping at the
    /// first uninitialized or corrupt page
    fn live_pages(&self) -> Vec<usize> {
        let mut pages = Vec::new();
        for page in 0..self.page_count() {
            match self.page_state(page) {
                PageState::Uninitialized | PageState::Corrupt => break,
                _ => pages.push(page),
            }
        }
        pages
    }

    /// The namespace table: 1-byte index to name
    ///
    /// Namespace definitions are ordinary entries under the reserved
    /// ns_index 0; they bootstrap the resolution of everything else.
    pub fn namespaces(&self) -> HashMap<u8, String> {
        let mut namespaces = HashMap::new();

        self.walk(|page, slot, entry| {
            if entry[0] == 0 {
                let key = read_key(entry);
                let id = entry[24];
                namespaces.insert(id, key);
            }
            let _ = (page, slot);
        });

        namespaces
    }

    /// Walk every written entry slot, honoring spans
    fn walk(&self, mut visit: impl FnMut(usize, usize, &[u8])) {
        for page in self.live_pages() {
            let mut slot = 0;
            while slot < ENTRIES_PER_PAGE {
                if self.entry_state(page, slot) != EntryState::Written {
                    slot += 1;
                    continue;
                }

                let entry = self.entry_bytes(page, slot);
                let span = (entry[2] as usize).max(1);
                visit(page, slot, entry);
                slot += span.min(ENTRIES_PER_PAGE - slot);
            }
        }
    }

    /// Decode all live entries
    pub fn entries(&self) -> Vec<NvsEntry> {
        let namespaces = self.namespaces();
        let mut entries = Vec::new();

        self.walk(|page, slot, entry| {
            let ns_index = entry[0];
            if ns_index == 0 {
                return;
            }

            let Some(data_type) = DataType::from_raw(entry[1]) else {
                warn!("Entry at page {page} slot {slot} has unknown type {:#04x}", entry[1]);
                return;
            };

            let span = (entry[2] as usize).max(1);
            let stored_crc = u32::from_le_bytes(entry[4..8].try_into().unwrap());
            let crc_ok = stored_crc == entry_header_crc(entry);
            if !crc_ok {
                warn!("Header CRC mismatch at page {page} slot {slot}");
            }

            let Some(value) = self.decode_value(page, slot, data_type) else {
                return;
            };

            entries.push(NvsEntry {
                namespace: namespaces
                    .get(&ns_index)
                    .cloned()
                    .unwrap_or_else(|| format!("ns#{ns_index}")),
                key: read_key(entry),
                value,
                crc_ok,
                page,
                slot,
                span,
            });
        });

        entries
    }

    fn decode_value(&self, page: usize, slot: usize, data_type: DataType) -> Option<NvsValue> {
        let entry = self.entry_bytes(page, slot);
        let data = &entry[24..32];

        Some(match data_type {
            DataType::U8 => NvsValue::U8(data[0]),
            DataType::I8 => NvsValue::I8(data[0] as i8),
            DataType::U16 => NvsValue::U16(u16::from_le_bytes(data[0..2].try_into().unwrap())),
            DataType::I16 => NvsValue::I16(i16::from_le_bytes(data[0..2].try_into().unwrap())),
            DataType::U32 => NvsValue::U32(u32::from_le_bytes(data[0..4].try_into().unwrap())),
            DataType::I32 => NvsValue::I32(i32::from_le_bytes(data[0..4].try_into().unwrap())),
            DataType::U64 => NvsValue::U64(u64::from_le_bytes(data.try_into().unwrap())),
            DataType::I64 => NvsValue::I64(i64::from_le_bytes(data.try_into().unwrap())),
            DataType::Str => {
                let payload = self.read_var_payload(page, slot)?;
                let text = payload.strip_suffix(&[0]).unwrap_or(&payload);
                NvsValue::Str(String::from_utf8_lossy(text).into_owned())
            }
            DataType::Blob | DataType::BlobData => {
                NvsValue::Blob(self.read_var_payload(page, slot)?)
            }
            DataType::BlobIndex => NvsValue::BlobIndex {
                total_size: u32::from_le_bytes(data[0..4].try_into().unwrap()),
                chunk_count: data[4],
                chunk_start: data[5],
            },
        })
    }

    /// Read the payload of a string/blob entry from its span slots,
    /// verifying the stored data CRC
    fn read_var_payload(&self, page: usize, slot: usize) -> Option<Vec<u8>> {
        let entry = self.entry_bytes(page, slot);
        let size = u16::from_le_bytes(entry[24..26].try_into().unwrap()) as usize;
        let stored_crc = u32::from_le_bytes(entry[28..32].try_into().unwrap());

        let span = (entry[2] as usize).max(1);
        let capacity = (span - 1) * ENTRY_SIZE;
        if size > capacity || slot + span > ENTRIES_PER_PAGE {
            warn!("Variable entry at page {page} slot {slot} overruns its span");
            return None;
        }

        let start = self.entry_offset(page, slot + 1);
        let payload = self.data[start..start + size].to_vec();

        if nvs_crc32(&payload) != stored_crc {
            warn!("Data CRC mismatch at page {page} slot {slot}");
        }

        Some(payload)
    }

    fn find_entry(&self, namespace: &str, key: &str) -> Result<NvsEntry, NvsError> {
        self.entries()
            .into_iter()
            .find(|entry| entry.namespace == namespace && entry.key == key)
            .ok_or_else(|| NvsError::NotFound(format!("{namespace}/{key}")))
    }

    fn recompute_header_crc(&mut self, page: usize, slot: usize) {
        let offset = self.entry_offset(page, slot);
        let crc = entry_header_crc(&self.data[offset..offset + ENTRY_SIZE]);
        self.data[offset + 4..offset + 8].copy_from_slice(&crc.to_le_bytes());
    }

    /// Overwrite a primitive entry in place
    ///
    /// The new value must match the stored data type exactly.
    pub fn set_value(&mut self, namespace: &str, key: &str, value: NvsValue) -> Result<(), Error> {
        let entry = self.find_entry(namespace, key)?;

        let offset = self.entry_offset(entry.page, entry.slot);
        let stored_type = DataType::from_raw(self.data[offset + 1]).ok_or(NvsError::TypeMismatch)?;

        if stored_type != value.data_type() {
            return Err(NvsError::TypeMismatch.into());
        }
        let bytes = value.primitive_bytes().ok_or(NvsError::TypeMismatch)?;
        debug_assert_eq!(Some(bytes.len()), stored_type.primitive_width());

        self.data[offset + 24..offset + 24 + bytes.len()].copy_from_slice(&bytes);
        self.recompute_header_crc(entry.page, entry.slot);
        self.dirty = true;

        Ok(())
    }

    /// Overwrite a string or blob payload in place
    ///
    /// `payload` must fit into the `(span - 1) * 32` bytes the entry
    /// already occupies; growing an entry would mean relocating it, which
    /// in-place editing does not do. Strings gain their terminating NUL
    /// here.
    pub fn set_bytes(&mut self, namespace: &str, key: &str, payload: &[u8]) -> Result<(), Error> {
        let entry = self.find_entry(namespace, key)?;

        let offset = self.entry_offset(entry.page, entry.slot);
        let stored_type = DataType::from_raw(self.data[offset + 1]).ok_or(NvsError::TypeMismatch)?;

        let mut owned;
        let payload: &[u8] = match stored_type {
            DataType::Str => {
                owned = payload.to_vec();
                owned.push(0);
                &owned
            }
            DataType::Blob | DataType::BlobData => payload,
            _ => return Err(NvsError::TypeMismatch.into()),
        };

        let capacity = (entry.span - 1) * ENTRY_SIZE;
        if payload.len() > capacity {
            return Err(NvsError::Overflow {
                key: key.into(),
                size: capacity,
            }
            .into());
        }

        // Payload bytes live in the span slots following the header entry
        let start = self.entry_offset(entry.page, entry.slot + 1);
        self.data[start..start + payload.len()].copy_from_slice(payload);
        self.data[start + payload.len()..start + capacity].fill(0xFF);

        let crc = nvs_crc32(payload);
        self.data[offset + 24..offset + 26].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        self.data[offset + 28..offset + 32].copy_from_slice(&crc.to_le_bytes());
        self.recompute_header_crc(entry.page, entry.slot);
        self.dirty = true;

        Ok(())
    }

    /// Erase an entry: flip its bitmap states (including every span slot)
    /// to erased and fill the slots with 0xFF
    pub fn delete(&mut self, namespace: &str, key: &str) -> Result<(), Error> {
        let entry = self.find_entry(namespace, key)?;

        for slot in entry.slot..entry.slot + entry.span {
            self.set_entry_state(entry.page, slot, EntryState::Erased);
            let offset = self.entry_offset(entry.page, slot);
            self.data[offset..offset + ENTRY_SIZE].fill(0xFF);
        }
        self.dirty = true;

        Ok(())
    }
}

fn read_key(entry: &[u8]) -> String {
    let key = &entry[8..8 + KEY_LEN];
    let end = key.iter().position(|b| *b == 0).unwrap_or(KEY_LEN);
    String::from_utf8_lossy(&key[..end]).into_owned()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Builder for synthetic single-partition images used across the
    /// codec tests
    pub struct PageBuilder {
        page: Vec<u8>,
        next_slot: usize,
    }

    impl PageBuilder {
        pub fn new(state: PageState, seqnr: u32) -> Self {
            let mut page = vec![0xFFu8; NVS_PAGE_SIZE];
            page[0..4].copy_from_slice(&(state as u32).to_le_bytes());
            page[4..8].copy_from_slice(&seqnr.to_le_bytes());
            page[8] = 0xFE; // version 2
            Self { page, next_slot: 0 }
        }

        fn mark_written(&mut self, slot: usize) {
            let byte = PAGE_HEADER_SIZE + slot / 4;
            let shift = (slot % 4) * 2;
            self.page[byte] = (self.page[byte] & !(0x3 << shift)) | (0x2 << shift);
        }

        fn write_entry(&mut self, entry: [u8; ENTRY_SIZE]) -> usize {
            let slot = self.next_slot;
            let offset = PAGE_HEADER_SIZE + BITMAP_SIZE + slot * ENTRY_SIZE;
            self.page[offset..offset + ENTRY_SIZE].copy_from_slice(&entry);
            self.mark_written(slot);
            self.next_slot += 1;
            slot
        }

        fn header(ns_index: u8, data_type: u8, span: u8, key: &str) -> [u8; ENTRY_SIZE] {
            let mut entry = [0xFFu8; ENTRY_SIZE];
            entry[0] = ns_index;
            entry[1] = data_type;
            entry[2] = span;
            entry[3] = 0xFF; // chunk index: none
            entry[8..8 + KEY_LEN].fill(0);
            entry[8..8 + key.len()].copy_from_slice(key.as_bytes());
            entry
        }

        fn seal(entry: &mut [u8; ENTRY_SIZE]) {
            let crc = entry_header_crc(entry);
            entry[4..8].copy_from_slice(&crc.to_le_bytes());
        }

        /// Define a namespace; returns its 1-byte id
        pub fn namespace(&mut self, id: u8, name: &str) -> u8 {
            let mut entry = Self::header(0, DataType::U8 as u8, 1, name);
            entry[24..32].fill(0);
            entry[24] = id;
            Self::seal(&mut entry);
            self.write_entry(entry);
            id
        }

        pub fn primitive(&mut self, ns: u8, key: &str, value: NvsValue) -> usize {
            let bytes = value.primitive_bytes().unwrap();
            let mut entry = Self::header(ns, value.data_type() as u8, 1, key);
            entry[24..32].fill(0);
            entry[24..24 + bytes.len()].copy_from_slice(&bytes);
            Self::seal(&mut entry);
            self.write_entry(entry)
        }

        pub fn string(&mut self, ns: u8, key: &str, value: &str) -> usize {
            let mut payload = value.as_bytes().to_vec();
            payload.push(0);
            let span = 1 + payload.len().div_ceil(ENTRY_SIZE);

            let mut entry = Self::header(ns, DataType::Str as u8, span as u8, key);
            entry[24..26].copy_from_slice(&(payload.len() as u16).to_le_bytes());
            entry[26..28].fill(0xFF);
            entry[28..32].copy_from_slice(&nvs_crc32(&payload).to_le_bytes());
            Self::seal(&mut entry);
            let slot = self.write_entry(entry);

            for chunk in payload.chunks(ENTRY_SIZE) {
                let mut data = [0xFFu8; ENTRY_SIZE];
                data[..chunk.len()].copy_from_slice(chunk);
                self.write_entry(data);
            }
            slot
        }

        pub fn build(self) -> Vec<u8> {
            self.page
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::PageBuilder, *};

    fn wifi_partition() -> NvsPartition {
        let mut builder = PageBuilder::new(PageState::Active, 0);
        let ns = builder.namespace(1, "wifi");
        builder.primitive(ns, "wifi_cnt", NvsValue::U32(5));
        builder.string(ns, "ssid", "espnet");
        NvsPartition::new(builder.build()).unwrap()
    }

    #[test]
    fn decodes_entries_and_namespaces() {
        let partition = wifi_partition();

        let namespaces = partition.namespaces();
        assert_eq!(namespaces.get(&1).map(String::as_str), Some("wifi"));

        let entries = partition.entries();
        assert_eq!(entries.len(), 2);

        let count = entries.iter().find(|e| e.key == "wifi_cnt").unwrap();
        assert_eq!(count.namespace, "wifi");
        assert_eq!(count.value, NvsValue::U32(5));
        assert!(count.crc_ok);

        let ssid = entries.iter().find(|e| e.key == "ssid").unwrap();
        assert_eq!(ssid.value, NvsValue::Str("espnet".into()));
        assert!(ssid.crc_ok);
    }

    #[test]
    fn primitive_edit_updates_only_value_and_crc() {
        let mut partition = wifi_partition();
        let before = partition.data.clone();

        let slot = partition
            .entries()
            .iter()
            .find(|e| e.key == "wifi_cnt")
            .unwrap()
            .slot;

        partition.set_value("wifi", "wifi_cnt", NvsValue::U32(7)).unwrap();
        assert!(partition.is_dirty());

        let offset = partition.entry_offset(0, slot);
        assert_eq!(
            &partition.data[offset + 24..offset + 28],
            &[0x07, 0x00, 0x00, 0x00]
        );

        // The recomputed CRC matches what a fresh decode validates
        assert!(partition
            .entries()
            .iter()
            .find(|e| e.key == "wifi_cnt")
            .unwrap()
            .crc_ok);

        // Every byte outside the entry's value word and CRC word is
        // untouched
        let after = &partition.data;
        for (i, (a, b)) in before.iter().zip(after.iter()).enumerate() {
            let in_value = (offset + 24..offset + 28).contains(&i);
            let in_crc = (offset + 4..offset + 8).contains(&i);
            if !in_value && !in_crc {
                assert_eq!(a, b, "byte {i} changed unexpectedly");
            }
        }
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut partition = wifi_partition();
        let err = partition
            .set_value("wifi", "wifi_cnt", NvsValue::U16(7))
            .unwrap_err();
        assert!(matches!(err, Error::Nvs(NvsError::TypeMismatch)));
    }

    #[test]
    fn missing_entry_is_not_found() {
        let mut partition = wifi_partition();
        let err = partition
            .set_value("wifi", "nope", NvsValue::U32(1))
            .unwrap_err();
        assert!(matches!(err, Error::Nvs(NvsError::NotFound(_))));
    }

    #[test]
    fn string_edit_in_place() {
        let mut partition = wifi_partition();
        partition.set_bytes("wifi", "ssid", b"ap-2").unwrap();

        let entries = partition.entries();
        let ssid = entries.iter().find(|e| e.key == "ssid").unwrap();
        assert_eq!(ssid.value, NvsValue::Str("ap-2".into()));
        assert!(ssid.crc_ok);
    }

    #[test]
    fn oversized_string_edit_overflows() {
        let mut partition = wifi_partition();
        // "espnet" + NUL occupies one 32-byte span slot
        let too_long = "x".repeat(64);
        let err = partition
            .set_bytes("wifi", "ssid", too_long.as_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::Nvs(NvsError::Overflow { .. })));
    }

    #[test]
    fn delete_clears_span_and_bitmap() {
        let mut partition = wifi_partition();
        let ssid = partition
            .entries()
            .iter()
            .find(|e| e.key == "ssid")
            .cloned()
            .unwrap();

        partition.delete("wifi", "ssid").unwrap();

        assert!(partition.entries().iter().all(|e| e.key != "ssid"));
        for slot in ssid.slot..ssid.slot + ssid.span {
            assert_eq!(partition.entry_state(0, slot), EntryState::Erased);
            let offset = partition.entry_offset(0, slot);
            assert!(partition.data[offset..offset + ENTRY_SIZE]
                .iter()
                .all(|b| *b == 0xFF));
        }
    }

    #[test]
    fn parsing_stops_at_uninitialized_page() {
        let mut builder = PageBuilder::new(PageState::Active, 0);
        let ns = builder.namespace(1, "app");
        builder.primitive(ns, "boots", NvsValue::U32(3));
        let mut image = builder.build();
        // A second, never-touched page
        image.extend(vec![0xFFu8; NVS_PAGE_SIZE]);
        // And a stray page after it which must not be decoded
        let mut ghost = PageBuilder::new(PageState::Active, 1);
        let ghost_ns = ghost.namespace(2, "ghost");
        ghost.primitive(ghost_ns, "zombie", NvsValue::U8(1));
        image.extend(ghost.build());

        let partition = NvsPartition::new(image).unwrap();
        let entries = partition.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "boots");
    }

    #[test]
    fn odd_sized_image_is_rejected() {
        assert!(NvsPartition::new(vec![0u8; 100]).is_err());
    }
}
