//! Commands understood by the ROM bootloader and the flasher stub

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::flasher::{checksum, SpiAttachParams, SpiSetParams, CHECKSUM_INIT};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
/// Per-packet budget while streaming READ_FLASH data frames
pub(crate) const FLASH_READ_PACKET_TIMEOUT: Duration = Duration::from_millis(100);
/// No command may wait longer than this, however large the region
pub(crate) const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(150);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const FLASH_DEFL_END_TIMEOUT: Duration = Duration::from_secs(10);

/// Input data for the SYNC command: 0x07 0x07 0x12 0x20 followed by 32 x 'U'
pub(crate) const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

/// Types of commands that can be sent to a target device
///
/// <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/serial-protocol.html#commands>
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    Unknown = 0,
    // Supported by every bootloader
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    // Supported by the ESP32-and-later bootloaders
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
    GetSecurityInfo = 0x14,
    // Stub-only commands
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
    ReadFlash = 0xD2,
    // Reads the SPI flash manufacturer and device id; not part of the
    // serial protocol proper
    FlashDetect = 0x9F,
}

impl CommandType {
    /// The fixed time budget for this command
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            CommandType::FlashDeflEnd => FLASH_DEFL_END_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// The time budget for this command when it covers `size` bytes of flash
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn scale(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            let scaled = Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64);
            scaled.clamp(DEFAULT_TIMEOUT, MAX_COMMAND_TIMEOUT)
        }

        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin | CommandType::EraseRegion => {
                scale(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData | CommandType::FlashDeflData => {
                scale(ERASE_WRITE_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashMd5 => scale(MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// A command along with its payload, ready for serialization
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        spi_params: SpiSetParams,
    },
    SpiAttach {
        spi_params: SpiAttachParams,
    },
    SpiAttachStub {
        spi_params: SpiAttachParams,
    },
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for the ROM loader)
        prior_baud: u32,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashDeflData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    GetSecurityInfo,
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
    ReadFlash {
        offset: u32,
        size: u32,
        block_size: u32,
        max_in_flight: u32,
    },
    FlashDetect,
}

impl Command<'_> {
    /// The type of this command
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::MemData { .. } => CommandType::MemData,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::SpiAttachStub { .. } => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::GetSecurityInfo => CommandType::GetSecurityInfo,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
            Command::ReadFlash { .. } => CommandType::ReadFlash,
            Command::FlashDetect => CommandType::FlashDetect,
        }
    }

    /// The time budget for this command when it covers `size` bytes
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        self.command_type().timeout_for_size(size)
    }

    /// Serialize the command header and body (everything between the SLIP
    /// delimiters)
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        // Direction byte followed by the command identifier
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => {
                begin_command(
                    writer,
                    size,
                    blocks,
                    block_size,
                    offset,
                    supports_encryption,
                )?;
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            }
            | Command::MemData {
                data,
                pad_to,
                pad_byte,
                sequence,
            }
            | Command::FlashDeflData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::FlashEnd { reboot } => {
                write_basic(writer, &[u8::from(!reboot)], 0)?;
            }
            Command::MemEnd { no_entry, entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: u32::from(no_entry),
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(writer, &SYNC_FRAME, 0)?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct WriteRegParams {
                    address: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    address,
                    value,
                    mask: mask.unwrap_or(0xFFFFFFFF),
                    delay_us: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiSetParams { spi_params } => {
                write_basic(writer, &spi_params.encode(), 0)?;
            }
            Command::SpiAttach { spi_params } => {
                write_basic(writer, &spi_params.encode(false), 0)?;
            }
            Command::SpiAttachStub { spi_params } => {
                write_basic(writer, &spi_params.encode(true), 0)?;
            }
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&new_baud.to_le_bytes());
                data[4..].copy_from_slice(&prior_baud.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
            Command::FlashDeflEnd { reboot } => {
                // 0 means reboot, 1 means do nothing
                write_basic(writer, &[u8::from(!reboot)], 0)?;
            }
            Command::FlashMd5 { offset, size } => {
                let mut data = [0u8; 16];
                data[..4].copy_from_slice(&offset.to_le_bytes());
                data[4..8].copy_from_slice(&size.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
            Command::GetSecurityInfo => {
                write_basic(writer, &[], 0)?;
            }
            Command::EraseFlash => {
                write_basic(writer, &[], 0)?;
            }
            Command::EraseRegion { offset, size } => {
                let mut data = [0u8; 8];
                data[..4].copy_from_slice(&offset.to_le_bytes());
                data[4..].copy_from_slice(&size.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
            Command::ReadFlash {
                offset,
                size,
                block_size,
                max_in_flight,
            } => {
                let mut data = [0u8; 16];
                data[..4].copy_from_slice(&offset.to_le_bytes());
                data[4..8].copy_from_slice(&size.to_le_bytes());
                data[8..12].copy_from_slice(&block_size.to_le_bytes());
                data[12..].copy_from_slice(&max_in_flight.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
            Command::FlashDetect => {
                write_basic(writer, &[], 0)?;
            }
        };
        Ok(())
    }
}

/// Write the size/checksum words followed by the data body
fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

/// Write a `*_BEGIN` command body
fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
        encrypted: 0,
    };

    let bytes = bytes_of(&params);
    let data = if !supports_encryption {
        // The ESP8266 and ESP32 do not take the `encrypted` word
        &bytes[..bytes.len() - 4]
    } else {
        bytes
    };
    write_basic(writer, data, 0)
}

/// Write a `*_DATA` command body, padding to `pad_to` with `pad_byte`
///
/// Data commands are the only ones whose checksum word is used by the
/// loader; it is the XOR over the (padded) data body, seeded with 0xEF.
fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(command: Command<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        command.write(&mut out).unwrap();
        out
    }

    #[test]
    fn sync_frame_is_36_bytes() {
        let bytes = serialize(Command::Sync);

        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], CommandType::Sync as u8);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 36);
        assert_eq!(&bytes[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(bytes[12..44].iter().all(|b| *b == 0x55));
    }

    #[test]
    fn data_command_checksum_seed() {
        let bytes = serialize(Command::FlashData {
            data: &[0xFF],
            pad_to: 0,
            pad_byte: 0xFF,
            sequence: 0,
        });

        let check = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(check, (0xEFu8 ^ 0xFF) as u32);
        assert_eq!(check, 0x10);
    }

    #[test]
    fn data_command_checksum_covers_padding() {
        let bytes = serialize(Command::FlashData {
            data: &[0x01, 0x02],
            pad_to: 4,
            pad_byte: 0xFF,
            sequence: 7,
        });

        let size = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let sequence = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let check = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(size, 4);
        assert_eq!(sequence, 7);
        assert_eq!(check, (0xEFu8 ^ 0x01 ^ 0x02 ^ 0xFF ^ 0xFF) as u32);
    }

    #[test]
    fn read_flash_carries_all_four_words() {
        let bytes = serialize(Command::ReadFlash {
            offset: 0x1000,
            size: 0x4000,
            block_size: 0x1000,
            max_in_flight: 64 * 1024,
        });

        assert_eq!(bytes[1], 0xD2);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 16);
        let words: Vec<u32> = bytes[8..24]
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![0x1000, 0x4000, 0x1000, 64 * 1024]);
    }

    #[test]
    fn size_scaled_timeouts_are_clamped() {
        // Tiny regions fall back to the default, huge ones to the cap
        assert_eq!(
            CommandType::EraseRegion.timeout_for_size(0x1000),
            DEFAULT_TIMEOUT
        );
        assert_eq!(
            CommandType::EraseRegion.timeout_for_size(128 * 1024 * 1024),
            MAX_COMMAND_TIMEOUT
        );
    }

    #[test]
    fn erase_chip_budget() {
        assert_eq!(
            CommandType::EraseFlash.timeout(),
            Duration::from_secs(150)
        );
    }
}
