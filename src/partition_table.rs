//! Binary partition-table codec
//!
//! ESP32-family devices keep a 4 KiB partition table at flash offset
//! 0x8000: up to 95 packed 32-byte entries introduced by the magic
//! 0x50AA, optionally terminated by an MD5 digest entry (magic 0xEBEB)
//! covering everything before it.

use std::fmt::{self, Display, Formatter};

use md5::{Digest, Md5};

use crate::error::{Error, PartitionTableError};

/// Flash offset the table lives at on the ESP32 family
pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
/// Total size of the table region
pub const PARTITION_TABLE_SIZE: usize = 0x1000;

const ENTRY_SIZE: usize = 32;
const ENTRY_MAGIC: [u8; 2] = [0xAA, 0x50];
const MD5_MAGIC: [u8; 2] = [0xEB, 0xEB];
const MAX_NAME_LEN: usize = 16;

/// Partition type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    App,
    Data,
    Custom(u8),
}

impl From<u8> for Type {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => Type::App,
            0x01 => Type::Data,
            other => Type::Custom(other),
        }
    }
}

impl Type {
    pub fn as_u8(&self) -> u8 {
        match self {
            Type::App => 0x00,
            Type::Data => 0x01,
            Type::Custom(raw) => *raw,
        }
    }

    /// Human-readable name of a (type, subtype) pair
    pub fn subtype_name(&self, subtype: u8) -> String {
        match (self, subtype) {
            (Type::App, 0x00) => "factory".into(),
            (Type::App, 0x10..=0x1F) => format!("ota_{}", subtype - 0x10),
            (Type::App, 0x20) => "test".into(),
            (Type::Data, 0x00) => "ota".into(),
            (Type::Data, 0x01) => "phy".into(),
            (Type::Data, 0x02) => "nvs".into(),
            (Type::Data, 0x03) => "coredump".into(),
            (Type::Data, 0x04) => "nvs_keys".into(),
            (Type::Data, 0x05) => "efuse".into(),
            (Type::Data, 0x81) => "fat".into(),
            (Type::Data, 0x82) => "spiffs".into(),
            (Type::Data, 0x83) => "littlefs".into(),
            _ => format!("{subtype:#04x}"),
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Type::App => write!(f, "app"),
            Type::Data => write!(f, "data"),
            Type::Custom(raw) => write!(f, "{raw:#04x}"),
        }
    }
}

/// Well-known data subtypes
pub mod subtype {
    pub const OTA: u8 = 0x00;
    pub const PHY: u8 = 0x01;
    pub const NVS: u8 = 0x02;
    pub const COREDUMP: u8 = 0x03;
    pub const NVS_KEYS: u8 = 0x04;
    pub const EFUSE: u8 = 0x05;
    pub const FAT: u8 = 0x81;
    pub const SPIFFS: u8 = 0x82;
    pub const LITTLEFS: u8 = 0x83;
}

/// One 32-byte table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub ty: Type,
    pub subtype: u8,
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

impl Partition {
    /// Does this partition hold a filesystem or NVS image worth decoding?
    pub fn is_data_image(&self) -> bool {
        self.ty == Type::Data
            && matches!(
                self.subtype,
                subtype::NVS | subtype::FAT | subtype::SPIFFS | subtype::LITTLEFS
            )
    }

    fn from_bytes(index: usize, bytes: &[u8]) -> Result<Self, PartitionTableError> {
        if bytes.len() < ENTRY_SIZE {
            return Err(PartitionTableError::Truncated(index));
        }

        let name_bytes = &bytes[12..12 + MAX_NAME_LEN];
        let name_end = name_bytes.iter().position(|b| *b == 0).unwrap_or(MAX_NAME_LEN);
        let name = std::str::from_utf8(&name_bytes[..name_end])
            .map_err(|_| PartitionTableError::InvalidName)?
            .to_string();

        Ok(Partition {
            name,
            ty: Type::from(bytes[2]),
            subtype: bytes[3],
            offset: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[28..32].try_into().unwrap()),
        })
    }

    fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0..2].copy_from_slice(&ENTRY_MAGIC);
        out[2] = self.ty.as_u8();
        out[3] = self.subtype;
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());

        let name = self.name.as_bytes();
        let len = name.len().min(MAX_NAME_LEN - 1);
        out[12..12 + len].copy_from_slice(&name[..len]);

        out[28..32].copy_from_slice(&self.flags.to_le_bytes());
        out
    }
}

/// The decoded table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
}

impl PartitionTable {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }

    /// Decode a table read from flash
    ///
    /// Parsing stops at the MD5 entry or the first slot that does not
    /// carry the entry magic; a table whose very first slot has no magic
    /// is rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let mut partitions = Vec::new();

        for (index, entry) in data.chunks(ENTRY_SIZE).enumerate() {
            if entry.len() < ENTRY_SIZE || entry[0..2] != ENTRY_MAGIC {
                if entry.len() >= 2 && entry[0..2] == MD5_MAGIC {
                    break;
                }
                if index == 0 {
                    return Err(PartitionTableError::MissingMagic.into());
                }
                break;
            }

            partitions.push(Partition::from_bytes(index, entry)?);
        }

        if partitions.is_empty() {
            return Err(PartitionTableError::MissingMagic.into());
        }

        Ok(Self { partitions })
    }

    /// Serialize back into the 4 KiB flash representation, with the MD5
    /// trailer entry
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PARTITION_TABLE_SIZE);
        for partition in &self.partitions {
            out.extend_from_slice(&partition.to_bytes());
        }

        let mut hasher = Md5::new();
        hasher.update(&out);
        let digest = hasher.finalize();

        let mut md5_entry = [0xFFu8; ENTRY_SIZE];
        md5_entry[0..2].copy_from_slice(&MD5_MAGIC);
        md5_entry[16..32].copy_from_slice(&digest);
        out.extend_from_slice(&md5_entry);

        out.resize(PARTITION_TABLE_SIZE, 0xFF);
        out
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn find_by_subtype(&self, ty: Type, subtype: u8) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.ty == ty && p.subtype == subtype)
    }

    /// The NVS data partition, when present
    pub fn nvs(&self) -> Option<&Partition> {
        self.find_by_subtype(Type::Data, subtype::NVS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> PartitionTable {
        PartitionTable::new(vec![
            Partition {
                name: "nvs".into(),
                ty: Type::Data,
                subtype: subtype::NVS,
                offset: 0x9000,
                size: 0x6000,
                flags: 0,
            },
            Partition {
                name: "phy_init".into(),
                ty: Type::Data,
                subtype: subtype::PHY,
                offset: 0xF000,
                size: 0x1000,
                flags: 0,
            },
            Partition {
                name: "factory".into(),
                ty: Type::App,
                subtype: 0x00,
                offset: 0x10000,
                size: 0x100000,
                flags: 0,
            },
            Partition {
                name: "storage".into(),
                ty: Type::Data,
                subtype: subtype::SPIFFS,
                offset: 0x110000,
                size: 0xF0000,
                flags: 0,
            },
        ])
    }

    #[test]
    fn round_trip() {
        let table = sample_table();
        let bytes = table.to_bytes();
        assert_eq!(bytes.len(), PARTITION_TABLE_SIZE);

        let parsed = PartitionTable::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn entries_carry_the_magic() {
        let bytes = sample_table().to_bytes();
        for i in 0..4 {
            assert_eq!(&bytes[i * ENTRY_SIZE..i * ENTRY_SIZE + 2], &ENTRY_MAGIC);
        }
        assert_eq!(&bytes[4 * ENTRY_SIZE..4 * ENTRY_SIZE + 2], &MD5_MAGIC);
    }

    #[test]
    fn unformatted_flash_is_rejected() {
        let blank = vec![0xFF; PARTITION_TABLE_SIZE];
        assert!(PartitionTable::from_bytes(&blank).is_err());
    }

    #[test]
    fn lookup_by_name_and_subtype() {
        let table = sample_table();
        assert_eq!(table.find("factory").unwrap().offset, 0x10000);
        assert_eq!(table.nvs().unwrap().size, 0x6000);
        assert!(table
            .find_by_subtype(Type::Data, subtype::SPIFFS)
            .unwrap()
            .is_data_image());
    }

    #[test]
    fn subtype_names() {
        assert_eq!(Type::App.subtype_name(0x10), "ota_0");
        assert_eq!(Type::App.subtype_name(0x20), "test");
        assert_eq!(Type::Data.subtype_name(0x82), "spiffs");
    }
}
