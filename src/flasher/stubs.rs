//! Flasher stub payloads
//!
//! Stubs are compiled per chip family and shipped by the embedding shell
//! in the TOML format used by the esptool family of tools: an entry point
//! plus base64-encoded text/data sections with their load addresses.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A second-stage loader image, ready for RAM upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashStub {
    /// Entry point address
    entry: u32,
    /// Text section (base64)
    text: String,
    /// Load address of the text section
    text_start: u32,
    /// Data section (base64)
    data: String,
    /// Load address of the data section
    data_start: u32,
}

impl FlashStub {
    /// Parse a stub from its TOML source
    pub fn from_toml(source: &str) -> Result<Self, Error> {
        let stub: FlashStub = toml::from_str(source).map_err(Error::InvalidStub)?;
        // Decode both sections now so a bad payload fails before upload
        stub.decode(&stub.text)?;
        stub.decode(&stub.data)?;
        Ok(stub)
    }

    fn decode(&self, section: &str) -> Result<Vec<u8>, Error> {
        general_purpose::STANDARD
            .decode(section)
            .map_err(|_| Error::InternalError)
    }

    /// Entry point address
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Text load address and bytes
    pub fn text(&self) -> (u32, Vec<u8>) {
        (self.text_start, self.decode(&self.text).unwrap())
    }

    /// Data load address and bytes
    pub fn data(&self) -> (u32, Vec<u8>) {
        (self.data_start, self.decode(&self.data).unwrap())
    }
}

#[cfg(test)]
pub(crate) fn synthetic_stub(entry: u32, text: &[u8], data: &[u8]) -> FlashStub {
    FlashStub {
        entry,
        text: general_purpose::STANDARD.encode(text),
        text_start: 0x4010_0000,
        data: general_purpose::STANDARD.encode(data),
        data_start: 0x3FFD_0000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_round_trips_through_toml() {
        let source = r#"
            entry = 1074520064
            text = "qAop"
            text_start = 1074520064
            data = "ESIzRA=="
            data_start = 1073605632
        "#;

        let stub = FlashStub::from_toml(source).unwrap();
        assert_eq!(stub.entry(), 1074520064);

        let (text_addr, text) = stub.text();
        assert_eq!(text_addr, 1074520064);
        assert_eq!(text, vec![0xA8, 0x0A, 0x29]);

        let (data_addr, data) = stub.data();
        assert_eq!(data_addr, 1073605632);
        assert_eq!(data, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        assert!(FlashStub::from_toml("entry = \"not a number\"").is_err());
    }
}
