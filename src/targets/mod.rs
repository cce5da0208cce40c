//! Supported target devices
//!
//! Every chip family is described by a [ChipDescriptor], a plain-data record
//! holding the register addresses and protocol constants the rest of the
//! library needs. The descriptors live in a compile-time registry; the few
//! addresses that moved between silicon revisions are resolved through
//! functions of `(chip, revision)`.

use strum::{Display, EnumIter, EnumString, IntoEnumIterator, VariantNames};

use crate::Error;

mod esp32;
mod esp32c2;
mod esp32c3;
mod esp32c5;
mod esp32c6;
mod esp32c61;
mod esp32h2;
mod esp32h21;
mod esp32h4;
mod esp32p4;
mod esp32s2;
mod esp32s3;
mod esp32s31;
mod esp8266;

/// Register holding the chip-detect magic value
///
/// This is the UART date register of the ROM UART; it is mapped at the same
/// address on every family that predates the chip-id scheme, so it can be
/// read before the family is known.
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C2, ESP8684
    Esp32c2,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C5
    Esp32c5,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-C61
    Esp32c61,
    /// ESP32-H2
    Esp32h2,
    /// ESP32-H21
    Esp32h21,
    /// ESP32-H4
    Esp32h4,
    /// ESP32-P4
    Esp32p4,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
    /// ESP32-S31
    Esp32s31,
    /// ESP8266
    Esp8266,
}

/// SPI controller registers of a chip, as base plus sub-register offsets
#[derive(Debug, Clone, Copy)]
pub struct SpiRegisters {
    pub base: u32,
    pub usr_offset: u32,
    pub usr1_offset: u32,
    pub usr2_offset: u32,
    pub w0_offset: u32,
    pub mosi_length_offset: Option<u32>,
    pub miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}

/// RTC watchdog registers used for the WDT reset and for disabling the
/// watchdog while flashing
#[derive(Debug, Clone, Copy)]
pub struct RtcWdtRegisters {
    /// Write-protect register; unlocked by writing [RtcWdtRegisters::write_key]
    pub protect: u32,
    pub config0: u32,
    pub config1: u32,
    pub write_key: u32,
}

/// A single field inside the eFuse block, addressed as (word, shift, mask)
#[derive(Debug, Clone, Copy)]
pub struct EfuseField {
    pub word: u32,
    pub shift: u32,
    pub mask: u32,
}

impl EfuseField {
    pub(crate) const fn new(word: u32, shift: u32, mask: u32) -> Self {
        Self { word, shift, mask }
    }

    /// Extract the field from a raw eFuse word
    pub fn extract(&self, raw: u32) -> u32 {
        (raw >> self.shift) & self.mask
    }
}

/// Immutable description of one chip family
#[derive(Debug, Clone, Copy)]
pub struct ChipDescriptor {
    /// Human-readable product name
    pub name: &'static str,
    /// Family tag reported in the GET_SECURITY_INFO response; chips that
    /// predate the command carry `None`
    pub chip_id: Option<u16>,
    /// Flash offset the second-stage bootloader is written to
    pub bootloader_offset: u32,
    /// Magic values the chip-detect register may hold for this family
    pub magic_values: &'static [u32],
    /// UART date register backing the legacy magic detection
    pub uart_date_reg: u32,
    /// SPI controller registers
    pub spi: SpiRegisters,
    /// Base address of the eFuse read registers
    pub efuse_base: u32,
    /// eFuse word indices holding the factory MAC address
    pub mac_efuse_words: (u32, u32),
    /// Major chip revision field in eFuse BLOCK1
    pub rev_major: EfuseField,
    /// Minor chip revision (or its low bits, when split across words)
    pub rev_minor: EfuseField,
    /// High bit(s) of the minor revision; several families spread the
    /// minor version over two eFuse words
    pub rev_minor_hi: Option<EfuseField>,
    /// RTC watchdog registers, where present
    pub rtc_wdt: Option<RtcWdtRegisters>,
    /// ROM .bss word holding the active UART device number; `None` when the
    /// family has no native USB
    pub uartdev_buf_no: Option<u32>,
    /// Sentinel read from `uartdev_buf_no` when the USB-OTG path is active
    pub usb_otg_sentinel: Option<u32>,
    /// Sentinel read from `uartdev_buf_no` when USB-JTAG/Serial is active
    pub usb_jtag_sentinel: Option<u32>,
    /// RTC_CNTL_OPTION1 register holding the force-download-boot latch
    pub rtc_option1_reg: Option<u32>,
    /// Bit mask of the force-download-boot latch within OPTION1
    pub force_download_boot_mask: u32,
    /// GPIO strap register, where the bootstrap pins can be read back
    pub gpio_strap_reg: Option<u32>,
}

impl Chip {
    /// Look up the descriptor of this family
    pub fn descriptor(&self) -> &'static ChipDescriptor {
        match self {
            Chip::Esp32 => &esp32::DESCRIPTOR,
            Chip::Esp32c2 => &esp32c2::DESCRIPTOR,
            Chip::Esp32c3 => &esp32c3::DESCRIPTOR,
            Chip::Esp32c5 => &esp32c5::DESCRIPTOR,
            Chip::Esp32c6 => &esp32c6::DESCRIPTOR,
            Chip::Esp32c61 => &esp32c61::DESCRIPTOR,
            Chip::Esp32h2 => &esp32h2::DESCRIPTOR,
            Chip::Esp32h21 => &esp32h21::DESCRIPTOR,
            Chip::Esp32h4 => &esp32h4::DESCRIPTOR,
            Chip::Esp32p4 => &esp32p4::DESCRIPTOR,
            Chip::Esp32s2 => &esp32s2::DESCRIPTOR,
            Chip::Esp32s3 => &esp32s3::DESCRIPTOR,
            Chip::Esp32s31 => &esp32s31::DESCRIPTOR,
            Chip::Esp8266 => &esp8266::DESCRIPTOR,
        }
    }

    /// Identify a family from the chip-detect magic value
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        Chip::iter()
            .find(|chip| chip.descriptor().magic_values.contains(&magic))
            .ok_or(Error::ChipDetect(magic))
    }

    /// Identify a family from the GET_SECURITY_INFO chip-id field
    pub fn from_chip_id(chip_id: u32) -> Result<Self, Error> {
        Chip::iter()
            .find(|chip| chip.descriptor().chip_id == Some(chip_id as u16))
            .ok_or(Error::ChipIdDetect(chip_id))
    }

    /// Address of the `UARTDEV_BUF_NO` word, resolved for the detected chip
    /// revision (`major * 100 + minor`)
    ///
    /// The ESP32-C3, ESP32-S3 and ESP32-P4 relocated the word between
    /// revisions; every other family has a single address (or none).
    pub fn uartdev_buf_no(&self, revision: u32) -> Option<u32> {
        match self {
            Chip::Esp32c3 => Some(if revision >= 107 {
                esp32c3::UARTDEV_BUF_NO_ECO7
            } else {
                esp32c3::UARTDEV_BUF_NO
            }),
            Chip::Esp32s3 => Some(if revision >= 200 {
                esp32s3::UARTDEV_BUF_NO_V2
            } else {
                esp32s3::UARTDEV_BUF_NO
            }),
            Chip::Esp32p4 => Some(if revision >= 300 {
                esp32p4::UARTDEV_BUF_NO
            } else {
                esp32p4::UARTDEV_BUF_NO_RC1
            }),
            _ => self.descriptor().uartdev_buf_no,
        }
    }

    /// Does this family understand the CHANGE_BAUDRATE command?
    pub fn supports_change_baudrate(&self) -> bool {
        !matches!(self, Chip::Esp8266)
    }

    /// Does this family have a native USB peripheral (OTG or JTAG/Serial)?
    pub fn has_native_usb(&self) -> bool {
        self.descriptor().uartdev_buf_no.is_some()
    }

    /// Address of the nth word of the eFuse read block
    pub fn efuse_word_addr(&self, n: u32) -> u32 {
        self.descriptor().efuse_base + n * 4
    }
}

/// Format raw MAC bytes the way the ROM console prints them
pub(crate) fn bytes_to_mac_addr(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_are_unique_per_family() {
        for chip in Chip::iter() {
            let descriptor = chip.descriptor();
            assert!(!descriptor.name.is_empty());
            assert!(!descriptor.magic_values.is_empty() || descriptor.chip_id.is_some());
        }

        // No two families may share a chip-id
        let ids: Vec<u16> = Chip::iter()
            .filter_map(|chip| chip.descriptor().chip_id)
            .collect();
        let mut deduped = ids.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len());
    }

    #[test]
    fn wdt_write_keys_match_the_documented_constant() {
        for chip in Chip::iter() {
            if let Some(wdt) = chip.descriptor().rtc_wdt {
                assert_eq!(wdt.write_key, 0x50D8_3AA1, "{chip}");
            }
        }
    }

    #[test]
    fn magic_detection() {
        assert_eq!(Chip::from_magic(0xFFF0_C101).unwrap(), Chip::Esp8266);
        assert_eq!(Chip::from_magic(0x00F0_1D83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0x0000_07C6).unwrap(), Chip::Esp32s2);
        assert!(matches!(
            Chip::from_magic(0xDEAD_BEEF),
            Err(Error::ChipDetect(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn revision_dependent_addresses_resolve_to_one_value() {
        for chip in [Chip::Esp32c3, Chip::Esp32s3, Chip::Esp32p4] {
            for revision in [0, 100, 107, 200, 300, 301] {
                assert!(chip.uartdev_buf_no(revision).is_some());
            }
        }

        // Both ends of each revision split are distinct
        assert_ne!(
            Chip::Esp32p4.uartdev_buf_no(0),
            Chip::Esp32p4.uartdev_buf_no(300)
        );
    }

    #[test]
    fn esp8266_has_no_usb_path() {
        assert!(!Chip::Esp8266.has_native_usb());
        assert!(!Chip::Esp8266.supports_change_baudrate());
        assert!(Chip::Esp8266.descriptor().rtc_wdt.is_none());
    }
}
