//! High-level flash operations on a connected target
//!
//! The [Flasher] drives the whole console/flash dance:
//!
//! ```text
//! ROM-download --upload-stub--> STUB
//! STUB --read/write/erase--> STUB
//! STUB --hard_reset(firmware)--> RUNNING (port may re-enumerate)
//! ```
//!
//! It owns the [Connection] for the duration of a session and feeds raw
//! partition bytes to the filesystem codecs in [crate::fs].

use std::{io::Write as _, thread::sleep, time::Duration};

use flate2::{write::ZlibEncoder, Compression};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use strum::{Display, EnumIter, VariantNames};

use crate::{
    command::{Command, CommandType},
    connection::{
        reset::{reset_to_firmware, ResetAfterOperation},
        Connection, Mode,
    },
    error::{ChecksumRegion, ConnectionError, Error, ResultExt},
    event::ProgressCallbacks,
    targets::{bytes_to_mac_addr, Chip},
};

pub mod stubs;

pub use stubs::FlashStub;

pub(crate) const CHECKSUM_INIT: u8 = 0xEF;

pub(crate) const FLASH_SECTOR_SIZE: usize = 0x1000;
const FLASH_BLOCK_SIZE: usize = 0x100;
const FLASH_SECTORS_PER_BLOCK: usize = FLASH_SECTOR_SIZE / FLASH_BLOCK_SIZE;

const EXPECTED_STUB_HANDSHAKE: &str = "OHAI";
const STUB_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(50);

/// XOR checksum over a data body, as carried by the `*_DATA` commands
pub(crate) fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Supported flash sizes
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Display, VariantNames, EnumIter)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashSize {
    /// 256 KB
    #[strum(serialize = "256K")]
    Flash256Kb = 0x12,
    /// 512 KB
    #[strum(serialize = "512K")]
    Flash512Kb = 0x13,
    /// 1 MB
    #[strum(serialize = "1M")]
    Flash1Mb = 0x14,
    /// 2 MB
    #[strum(serialize = "2M")]
    Flash2Mb = 0x15,
    /// 4 MB
    #[default]
    #[strum(serialize = "4M")]
    Flash4Mb = 0x16,
    /// 8 MB
    #[strum(serialize = "8M")]
    Flash8Mb = 0x17,
    /// 16 MB
    #[strum(serialize = "16M")]
    Flash16Mb = 0x18,
    /// 32 MB
    #[strum(serialize = "32M")]
    Flash32Mb = 0x19,
    /// 64 MB
    #[strum(serialize = "64M")]
    Flash64Mb = 0x1A,
    /// 128 MB
    #[strum(serialize = "128M")]
    Flash128Mb = 0x21,
}

impl FlashSize {
    /// Decode the size-id byte of the SPI flash id
    fn from_detected(value: u8) -> Option<FlashSize> {
        match value {
            0x12 => Some(FlashSize::Flash256Kb),
            0x13 => Some(FlashSize::Flash512Kb),
            0x14 => Some(FlashSize::Flash1Mb),
            0x15 => Some(FlashSize::Flash2Mb),
            0x16 => Some(FlashSize::Flash4Mb),
            0x17 => Some(FlashSize::Flash8Mb),
            0x18 => Some(FlashSize::Flash16Mb),
            0x19 => Some(FlashSize::Flash32Mb),
            0x1A => Some(FlashSize::Flash64Mb),
            0x21 => Some(FlashSize::Flash128Mb),
            _ => None,
        }
    }

    /// The flash size in bytes
    pub fn size(self) -> u32 {
        match self {
            FlashSize::Flash256Kb => 0x0004_0000,
            FlashSize::Flash512Kb => 0x0008_0000,
            FlashSize::Flash1Mb => 0x0010_0000,
            FlashSize::Flash2Mb => 0x0020_0000,
            FlashSize::Flash4Mb => 0x0040_0000,
            FlashSize::Flash8Mb => 0x0080_0000,
            FlashSize::Flash16Mb => 0x0100_0000,
            FlashSize::Flash32Mb => 0x0200_0000,
            FlashSize::Flash64Mb => 0x0400_0000,
            FlashSize::Flash128Mb => 0x0800_0000,
        }
    }
}

/// Parameters for attaching to a target device's SPI flash
#[derive(Copy, Clone, Debug)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    pub const fn default() -> Self {
        SpiAttachParams {
            clk: 0,
            q: 0,
            d: 0,
            hd: 0,
            cs: 0,
        }
    }

    /// Alternate pin assignment of the ESP32-PICO-D4 package
    pub const fn esp32_pico_d4() -> Self {
        SpiAttachParams {
            clk: 6,
            q: 17,
            d: 8,
            hd: 11,
            cs: 16,
        }
    }

    pub fn encode(self, stub: bool) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded: Vec<u8> = packed.to_le_bytes().to_vec();

        if !stub {
            encoded.append(&mut vec![0u8; 4]);
        }

        encoded
    }
}

/// Parameters of the attached SPI flash, passed with SPI_SET_PARAMS
#[derive(Copy, Clone, Debug)]
pub struct SpiSetParams {
    /// Total flash size in bytes
    size: u32,
}

impl SpiSetParams {
    pub const fn new(size: u32) -> Self {
        SpiSetParams { size }
    }

    /// Encoded as: id, total size, block size, sector size, page size,
    /// status mask
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded: Vec<u8> = Vec::with_capacity(24);
        encoded.extend_from_slice(&0u32.to_le_bytes());
        encoded.extend_from_slice(&self.size.to_le_bytes());
        encoded.extend_from_slice(&0x10000u32.to_le_bytes());
        encoded.extend_from_slice(&(FLASH_SECTOR_SIZE as u32).to_le_bytes());
        encoded.extend_from_slice(&0x100u32.to_le_bytes());
        encoded.extend_from_slice(&0xFFFFu32.to_le_bytes());
        encoded
    }
}

/// The kinds of transport a session may run over, as far as flow control
/// is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Raw USB bulk without serial buffering (Android-class hosts)
    AndroidUsb,
    /// A browser-mediated serial port
    WebSerial,
    /// A native serial port
    Native,
}

/// Tuning triple for the streamed READ_FLASH command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFlashParams {
    /// Bytes per streamed SLIP packet
    pub chunk_size: u32,
    /// Packets the stub may emit between acknowledgements
    pub block_size: u32,
    /// Bytes the stub may have on the wire before waiting for an ack
    pub max_in_flight: u32,
}

impl ReadFlashParams {
    pub const CHUNK_RANGE: std::ops::RangeInclusive<u32> = 0x1000..=0x40000;
    pub const BLOCK_RANGE: std::ops::RangeInclusive<u32> = 31..=3968;
    pub const IN_FLIGHT_RANGE: std::ops::RangeInclusive<u32> = 31..=253_952;

    /// The per-transport defaults; a single table so the default cannot
    /// diverge between code paths
    pub const fn for_transport(kind: TransportKind) -> Self {
        match kind {
            TransportKind::AndroidUsb => ReadFlashParams {
                chunk_size: 0x1000,
                block_size: 31,
                max_in_flight: 15_872,
            },
            TransportKind::WebSerial => ReadFlashParams {
                chunk_size: 0x1000,
                block_size: 248,
                max_in_flight: 63_488,
            },
            TransportKind::Native => ReadFlashParams {
                chunk_size: 0x4000,
                block_size: 3968,
                max_in_flight: 253_952,
            },
        }
    }

    /// Check the triple against the supported envelope
    pub fn validate(&self) -> bool {
        Self::CHUNK_RANGE.contains(&self.chunk_size)
            && Self::BLOCK_RANGE.contains(&self.block_size)
            && Self::IN_FLIGHT_RANGE.contains(&self.max_in_flight)
    }
}

/// List of SPI attach parameters to try while detecting the flash
const TRY_SPI_PARAMS: [SpiAttachParams; 2] =
    [SpiAttachParams::default(), SpiAttachParams::esp32_pico_d4()];

/// Connect to and operate on a target device's flash
pub struct Flasher {
    connection: Connection,
    chip: Chip,
    flash_size: FlashSize,
    spi_params: SpiAttachParams,
    read_params: ReadFlashParams,
    verify: bool,
    skip: bool,
}

impl Flasher {
    /// Establish a session: reset into download mode, sync, and detect the
    /// chip
    pub fn connect(mut connection: Connection, transport_kind: TransportKind) -> Result<Self, Error> {
        connection.begin()?;
        let chip = connection.detect_chip()?;

        Ok(Flasher {
            connection,
            chip,
            flash_size: FlashSize::default(),
            spi_params: SpiAttachParams::default(),
            read_params: ReadFlashParams::for_transport(transport_kind),
            verify: true,
            skip: false,
        })
    }

    /// The active connection
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// The chip this session talks to
    pub fn chip(&self) -> Chip {
        self.chip
    }

    /// The detected flash size
    pub fn flash_size(&self) -> FlashSize {
        self.flash_size
    }

    /// Verify written regions against their MD5 digest (default: on)
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    /// Skip regions whose MD5 already matches (default: off)
    pub fn set_skip(&mut self, skip: bool) {
        self.skip = skip;
    }

    /// Replace the read-tuning triple; rejected when outside the envelope
    pub fn set_read_params(&mut self, params: ReadFlashParams) -> Result<(), Error> {
        if !params.validate() {
            return Err(Error::InternalError);
        }
        self.read_params = params;
        Ok(())
    }

    /// Upload the flasher stub and switch the session to the stub command
    /// set
    ///
    /// A failed handshake is not fatal: the session stays on the ROM
    /// command set with its smaller write page.
    pub fn load_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        debug!("Loading flash stub for {}", self.chip);

        match self.try_load_stub(stub) {
            Ok(()) => {
                self.connection.set_mode(Mode::Stub);
                info!("Flasher stub running");
                Ok(())
            }
            Err(err) => {
                warn!("Stub handshake failed ({err:?}), staying on ROM loader");
                Ok(())
            }
        }
    }

    fn try_load_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        for (addr, payload) in [stub.text(), stub.data()] {
            if payload.is_empty() {
                continue;
            }

            let block_size = Mode::Rom.flash_write_size();
            let blocks = payload.len().div_ceil(block_size);
            debug!("Writing {} byte stub segment to {addr:#x}", payload.len());

            self.connection.command(Command::MemBegin {
                size: payload.len() as u32,
                blocks: blocks as u32,
                block_size: block_size as u32,
                offset: addr,
                supports_encryption: false,
            })?;

            for (sequence, block) in payload.chunks(block_size).enumerate() {
                self.connection.command(Command::MemData {
                    data: block,
                    pad_to: 0,
                    pad_byte: 0xFF,
                    sequence: sequence as u32,
                })?;
            }
        }

        self.connection.command(Command::MemEnd {
            no_entry: false,
            entry: stub.entry(),
        })?;

        // The stub greets with OHAI once it owns the UART
        let handshake = self.connection.read_frame(STUB_HANDSHAKE_TIMEOUT)?;
        if handshake != EXPECTED_STUB_HANDSHAKE.as_bytes() {
            return Err(Error::Connection(ConnectionError::InvalidStubHandshake));
        }

        Ok(())
    }

    /// Attach the SPI flash and detect its size
    pub fn attach_flash(&mut self) -> Result<(), Error> {
        for spi_params in TRY_SPI_PARAMS.iter().copied() {
            debug!("Attempting flash enable with: {spi_params:?}");

            if let Err(_e) = self.enable_flash(spi_params) {
                debug!("Flash enable failed");
                continue;
            }

            if let Some(flash_size) = self.detect_flash_size()? {
                debug!("Detected flash size: {flash_size}");
                self.flash_size = flash_size;
                self.spi_params = spi_params;

                self.connection.command(Command::SpiSetParams {
                    spi_params: SpiSetParams::new(flash_size.size()),
                })?;

                return Ok(());
            }
        }

        Err(Error::FlashConnect)
    }

    fn enable_flash(&mut self, spi_params: SpiAttachParams) -> Result<(), Error> {
        match self.chip {
            Chip::Esp8266 => {
                // The ESP8266 attaches its flash through a zero-length
                // FLASH_BEGIN instead
                self.connection.command(Command::FlashBegin {
                    size: 0,
                    blocks: 0,
                    block_size: self.connection.mode().flash_write_size() as u32,
                    offset: 0,
                    supports_encryption: false,
                })?;
            }
            _ => {
                let command = match self.connection.mode() {
                    Mode::Stub => Command::SpiAttachStub { spi_params },
                    Mode::Rom => Command::SpiAttach { spi_params },
                };
                self.connection.command(command)?;
            }
        }
        Ok(())
    }

    /// Read the SPI flash id and derive the size from its size-id byte
    pub fn detect_flash_size(&mut self) -> Result<Option<FlashSize>, Error> {
        const FLASH_RETRY: u8 = 0xFF;

        let flash_id = self.spi_command(CommandType::FlashDetect, &[], 24)?;
        let size_id = (flash_id >> 16) as u8;

        // This value indicates that an alternate attach should be tried
        if size_id == FLASH_RETRY {
            return Ok(None);
        }

        Ok(Some(match FlashSize::from_detected(size_id) {
            Some(size) => size,
            None => {
                warn!(
                    "Could not detect flash size (FlashID={flash_id:#06X}, SizeID={size_id:#04X}), defaulting to 4MB"
                );
                FlashSize::default()
            }
        }))
    }

    /// Run a raw SPI flash command through the controller registers
    fn spi_command(&mut self, command: CommandType, data: &[u8], read_bits: u32) -> Result<u32, Error> {
        assert!(read_bits < 32);
        assert!(data.len() < 64);

        let spi_registers = self.chip.descriptor().spi;

        let old_spi_usr = self.connection.read_reg(spi_registers.usr())?;
        let old_spi_usr2 = self.connection.read_reg(spi_registers.usr2())?;

        let mut flags = 1 << 31;
        if !data.is_empty() {
            flags |= 1 << 27;
        }
        if read_bits > 0 {
            flags |= 1 << 28;
        }

        self.connection.write_reg(spi_registers.usr(), flags, None)?;
        self.connection
            .write_reg(spi_registers.usr2(), 7 << 28 | command as u32, None)?;

        if let (Some(mosi_data_length), Some(miso_data_length)) =
            (spi_registers.mosi_length(), spi_registers.miso_length())
        {
            if !data.is_empty() {
                self.connection
                    .write_reg(mosi_data_length, data.len() as u32 * 8 - 1, None)?;
            }
            if read_bits > 0 {
                self.connection
                    .write_reg(miso_data_length, read_bits - 1, None)?;
            }
        } else {
            // Chips without the dedicated length registers pack both into
            // USR1
            let mosi_mask = if data.is_empty() {
                0
            } else {
                data.len() as u32 * 8 - 1
            };
            let miso_mask = if read_bits == 0 { 0 } else { read_bits - 1 };
            self.connection
                .write_reg(spi_registers.usr1(), miso_mask << 8 | mosi_mask << 17, None)?;
        }

        if data.is_empty() {
            self.connection.write_reg(spi_registers.w0(), 0, None)?;
        } else {
            for (i, bytes) in data.chunks(4).enumerate() {
                let mut data_bytes = [0; 4];
                data_bytes[0..bytes.len()].copy_from_slice(bytes);
                let data = u32::from_le_bytes(data_bytes);
                self.connection
                    .write_reg(spi_registers.w0() + (i as u32) * 4, data, None)?;
            }
        }

        self.connection.write_reg(spi_registers.cmd(), 1 << 18, None)?;

        let mut i = 0;
        loop {
            sleep(Duration::from_millis(1));
            if self.connection.read_reg(spi_registers.cmd())? & (1 << 18) == 0 {
                break;
            }
            i += 1;
            if i > 10 {
                return Err(Error::Connection(ConnectionError::Timeout(command.into())));
            }
        }

        let result = self.connection.read_reg(spi_registers.w0())?;
        self.connection
            .write_reg(spi_registers.usr(), old_spi_usr, None)?;
        self.connection
            .write_reg(spi_registers.usr2(), old_spi_usr2, None)?;

        Ok(result)
    }

    /// Write `data` to flash at `offset`
    ///
    /// Stub sessions compress the stream with raw DEFLATE; ROM sessions
    /// fall back to plain writes with the smaller page. Blocks are padded
    /// to the write page with 0xFF.
    pub fn write_flash(
        &mut self,
        offset: u32,
        data: &[u8],
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        if self.skip && self.region_matches(offset, data)? {
            info!("Skipping {:#x}, contents already match", offset);
            return Ok(());
        }

        match self.connection.mode() {
            Mode::Stub => self.write_flash_deflated(offset, data, &mut progress)?,
            Mode::Rom => self.write_flash_plain(offset, data, &mut progress)?,
        }

        if self.verify {
            if !self.region_matches(offset, data)? {
                return Err(Error::ChecksumMismatch(ChecksumRegion {
                    offset,
                    size: data.len() as u32,
                }));
            }
            debug!("MD5 of {:#x}..{:#x} verified", offset, offset as usize + data.len());
        }

        Ok(())
    }

    fn write_flash_plain(
        &mut self,
        offset: u32,
        data: &[u8],
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let block_size = self.connection.mode().flash_write_size();
        let block_count = data.len().div_ceil(block_size);
        let erase_size = match self.chip {
            // The ESP8266 ROM miscounts the sectors it has to erase
            Chip::Esp8266 => get_erase_size(offset as usize, data.len()) as u32,
            _ => data.len() as u32,
        };

        self.connection
            .command_with_timeout(
                Command::FlashBegin {
                    size: erase_size,
                    blocks: block_count as u32,
                    block_size: block_size as u32,
                    offset,
                    supports_encryption: false,
                },
                CommandType::FlashBegin.timeout_for_size(erase_size),
            )
            .flashing()?;

        if let Some(cb) = progress.as_mut() {
            cb.init(offset, block_count)
        }

        for (sequence, block) in data.chunks(block_size).enumerate() {
            self.connection
                .command_with_timeout(
                    Command::FlashData {
                        data: block,
                        pad_to: block_size,
                        pad_byte: 0xFF,
                        sequence: sequence as u32,
                    },
                    CommandType::FlashData.timeout_for_size(block_size as u32),
                )
                .flashing()?;

            if let Some(cb) = progress.as_mut() {
                cb.update(sequence + 1)
            }
        }

        self.connection
            .command(Command::FlashEnd { reboot: false })
            .flashing()?;

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        Ok(())
    }

    fn write_flash_deflated(
        &mut self,
        offset: u32,
        data: &[u8],
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        let block_size = self.connection.mode().flash_write_size();
        let block_count = compressed.len().div_ceil(block_size);
        let erase_count = data.len().div_ceil(FLASH_SECTOR_SIZE);
        let erase_size = (erase_count * FLASH_SECTOR_SIZE) as u32;

        debug!(
            "Compressed {} bytes to {} for {offset:#x}",
            data.len(),
            compressed.len()
        );

        self.connection
            .command_with_timeout(
                Command::FlashDeflBegin {
                    size: data.len() as u32,
                    blocks: block_count as u32,
                    block_size: block_size as u32,
                    offset,
                    supports_encryption: false,
                },
                CommandType::FlashDeflBegin.timeout_for_size(erase_size),
            )
            .flashing()?;

        if let Some(cb) = progress.as_mut() {
            cb.init(offset, block_count)
        }

        for (sequence, block) in compressed.chunks(block_size).enumerate() {
            self.connection
                .command_with_timeout(
                    Command::FlashDeflData {
                        data: block,
                        pad_to: 0,
                        pad_byte: 0xFF,
                        sequence: sequence as u32,
                    },
                    CommandType::FlashDeflData.timeout_for_size(block_size as u32),
                )
                .flashing()?;

            if let Some(cb) = progress.as_mut() {
                cb.update(sequence + 1)
            }
        }

        self.connection
            .command(Command::FlashDeflEnd { reboot: false })
            .flashing()?;

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        Ok(())
    }

    /// Ask the device for the MD5 digest of a flash region
    pub fn flash_md5(&mut self, offset: u32, size: u32) -> Result<[u8; 16], Error> {
        let response = self.connection.command_with_timeout(
            Command::FlashMd5 { offset, size },
            CommandType::FlashMd5.timeout_for_size(size),
        )?;

        // The stub answers with 16 raw bytes, the ROM with 32 hex digits
        let data = &response.data;
        match data.len() {
            16 => Ok(data.as_slice().try_into().unwrap()),
            32 => {
                let mut digest = [0u8; 16];
                for (i, pair) in data.chunks(2).enumerate() {
                    let hex = std::str::from_utf8(pair).map_err(|_| Error::InternalError)?;
                    digest[i] = u8::from_str_radix(hex, 16).map_err(|_| Error::InternalError)?;
                }
                Ok(digest)
            }
            _ => Err(Error::InternalError),
        }
    }

    fn region_matches(&mut self, offset: u32, data: &[u8]) -> Result<bool, Error> {
        let device = self.flash_md5(offset, data.len() as u32)?;

        let mut hasher = Md5::new();
        hasher.update(data);
        let local = hasher.finalize();

        Ok(device.as_slice() == local.as_slice())
    }

    /// Read `size` bytes of flash starting at `offset` via the stub's
    /// streaming READ_FLASH
    ///
    /// The stub pushes SLIP packets of `chunk_size` bytes; the host
    /// acknowledges the running byte count whenever a window of
    /// `max_in_flight` drains, and cross-checks the final MD5 trailer.
    pub fn read_flash(
        &mut self,
        offset: u32,
        size: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<Vec<u8>, Error> {
        if self.connection.mode() != Mode::Stub {
            return Err(Error::NotSupported {
                chip: self.chip,
                operation: "READ_FLASH",
            });
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        let params = self.read_params;
        self.connection.command(Command::ReadFlash {
            offset,
            size,
            block_size: params.chunk_size,
            max_in_flight: params.max_in_flight,
        })?;

        if let Some(cb) = progress.as_mut() {
            cb.init(offset, size as usize)
        }

        let mut data: Vec<u8> = Vec::with_capacity(size as usize);
        let mut last_ack = 0u32;

        while (data.len() as u32) < size {
            let packet = self.connection.read_stream_packet()?;
            data.extend_from_slice(&packet);

            let received = data.len() as u32;
            if received - last_ack >= params.max_in_flight || received >= size {
                self.connection.write_raw(&received.to_le_bytes())?;
                last_ack = received;
            }

            if let Some(cb) = progress.as_mut() {
                cb.update(data.len().min(size as usize))
            }
        }

        data.truncate(size as usize);

        // Digest trailer closes the stream
        let digest = self.connection.read_stream_packet()?;

        let mut hasher = Md5::new();
        hasher.update(&data);
        let local = hasher.finalize();

        if digest.len() != 16 || digest != local.as_slice() {
            return Err(Error::ChecksumMismatch(ChecksumRegion { offset, size }));
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        Ok(data)
    }

    /// Erase the entire flash (stub only)
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        if self.connection.mode() != Mode::Stub {
            return Err(Error::NotSupported {
                chip: self.chip,
                operation: "ERASE_FLASH",
            });
        }

        info!("Erasing entire flash");
        self.connection.command(Command::EraseFlash)?;
        Ok(())
    }

    /// Erase `size` bytes starting at the sector containing `offset`
    ///
    /// A zero-byte region completes without sending anything.
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        if size == 0 {
            return Ok(());
        }
        if self.connection.mode() != Mode::Stub {
            return Err(Error::NotSupported {
                chip: self.chip,
                operation: "ERASE_REGION",
            });
        }

        let sector = FLASH_SECTOR_SIZE as u32;
        let start = offset & !(sector - 1);
        let length = (offset + size).next_multiple_of(sector) - start;

        debug!("Erasing {length:#x} bytes at {start:#08x}");
        self.connection.command_with_timeout(
            Command::EraseRegion {
                offset: start,
                size: length,
            },
            CommandType::EraseRegion.timeout_for_size(length),
        )?;
        sleep(Duration::from_millis(50));
        Ok(())
    }

    /// Renegotiate the line speed
    pub fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.connection.change_baud(self.chip, baud)
    }

    /// The factory MAC address from eFuse
    pub fn mac_address(&mut self) -> Result<String, Error> {
        let descriptor = self.chip.descriptor();
        let word5 = self.connection.read_efuse(self.chip, descriptor.mac_efuse_words.0)?;
        let word6 = self.connection.read_efuse(self.chip, descriptor.mac_efuse_words.1)?;

        let bytes = ((word6 as u64) << 32) | word5 as u64;
        let bytes = bytes.to_be_bytes();

        Ok(bytes_to_mac_addr(&bytes[2..]))
    }

    /// Finish the session, resetting the device as requested
    pub fn finish(&mut self, reset: ResetAfterOperation) -> Result<(), Error> {
        match reset {
            ResetAfterOperation::HardReset => reset_to_firmware(&mut self.connection, self.chip),
            other => self.connection.reset_after(other),
        }
    }

    pub fn into_connection(self) -> Connection {
        self.connection
    }
}

/// The number of bytes the ESP8266 ROM will actually erase for a region,
/// compensating for its off-by-half sector accounting
pub(crate) fn get_erase_size(offset: usize, size: usize) -> usize {
    let sector_count = size.div_ceil(FLASH_SECTOR_SIZE);
    let start_sector = offset / FLASH_SECTOR_SIZE;

    let head_sectors = usize::min(
        FLASH_SECTORS_PER_BLOCK - (start_sector % FLASH_SECTORS_PER_BLOCK),
        sector_count,
    );

    if sector_count < 2 * head_sectors {
        sector_count.div_ceil(2) * FLASH_SECTOR_SIZE
    } else {
        (sector_count - head_sectors) * FLASH_SECTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::testing::LoopbackTransport,
        slip,
    };

    fn stub_flasher(transport: LoopbackTransport) -> Flasher {
        let mut connection = Connection::new(Box::new(transport));
        connection.set_mode(Mode::Stub);
        Flasher {
            connection,
            chip: Chip::Esp32,
            flash_size: FlashSize::default(),
            spi_params: SpiAttachParams::default(),
            read_params: ReadFlashParams::for_transport(TransportKind::Native),
            verify: false,
            skip: false,
        }
    }

    fn rom_flasher(transport: LoopbackTransport) -> Flasher {
        let mut flasher = stub_flasher(transport);
        flasher.connection.set_mode(Mode::Rom);
        flasher
    }

    #[test]
    fn erase_region_of_zero_bytes_sends_nothing() {
        // The loopback holds no response; had a command been sent the
        // exchange would have timed out instead of succeeding
        let mut flasher = stub_flasher(LoopbackTransport::new());
        flasher.erase_region(0x10000, 0).unwrap();
    }

    #[test]
    fn erase_region_aligns_to_sectors() {
        let mut transport = LoopbackTransport::new();
        transport.push_response(CommandType::EraseRegion as u8, 0, &[], 4);

        let mut flasher = stub_flasher(transport);
        flasher.erase_region(0x10010, 0x20).unwrap();
    }

    #[test]
    fn erase_region_requires_stub() {
        let mut flasher = rom_flasher(LoopbackTransport::new());
        let err = flasher.erase_region(0, 0x1000).unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
    }

    #[test]
    fn plain_write_produces_expected_frame_count() {
        let mut transport = LoopbackTransport::new();
        // FLASH_BEGIN + 10 FLASH_DATA + FLASH_END for 4 KiB at 0x400 pages
        transport.push_response(CommandType::FlashBegin as u8, 0, &[], 2);
        for _ in 0..10 {
            transport.push_response(CommandType::FlashData as u8, 0, &[], 2);
        }
        transport.push_response(CommandType::FlashEnd as u8, 0, &[], 2);

        let data = vec![0xAB; 10 * 0x400];
        let mut flasher = rom_flasher(transport);
        flasher.write_flash(0x10000, &data, None).unwrap();
    }

    #[test]
    fn read_flash_streams_and_verifies_md5() {
        let expected: Vec<u8> = (0..0x2000u32).map(|i| (i % 251) as u8).collect();

        let mut transport = LoopbackTransport::new();
        transport.push_response(CommandType::ReadFlash as u8, 0, &[], 4);
        // Stream arrives in chunk_size packets, then the MD5 trailer
        for chunk in expected.chunks(0x1000) {
            transport.rx.extend(slip::encode(chunk));
        }
        let mut hasher = Md5::new();
        hasher.update(&expected);
        transport.rx.extend(slip::encode(&hasher.finalize()));

        let mut flasher = stub_flasher(transport);
        flasher
            .set_read_params(ReadFlashParams {
                chunk_size: 0x1000,
                block_size: 31,
                max_in_flight: 0x1000,
            })
            .unwrap();

        let data = flasher.read_flash(0, expected.len() as u32, None).unwrap();
        assert_eq!(data, expected);
    }

    #[test]
    fn read_flash_flags_digest_mismatch() {
        let payload = vec![0x5A; 0x1000];

        let mut transport = LoopbackTransport::new();
        transport.push_response(CommandType::ReadFlash as u8, 0, &[], 4);
        transport.rx.extend(slip::encode(&payload));
        transport.rx.extend(slip::encode(&[0u8; 16]));

        let mut flasher = stub_flasher(transport);
        let err = flasher.read_flash(0, 0x1000, None).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch(_)));
    }

    #[test]
    fn read_flash_requires_stub() {
        let mut flasher = rom_flasher(LoopbackTransport::new());
        let err = flasher.read_flash(0, 0x1000, None).unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
    }

    #[test]
    fn stub_upload_switches_to_stub_mode() {
        let mut transport = LoopbackTransport::new();
        // One MemBegin/MemData pair per section, then MemEnd
        for _ in 0..2 {
            transport.push_response(CommandType::MemBegin as u8, 0, &[], 2);
            transport.push_response(CommandType::MemData as u8, 0, &[], 2);
        }
        transport.push_response(CommandType::MemEnd as u8, 0, &[], 2);
        transport.rx.extend(slip::encode(b"OHAI"));

        let mut flasher = rom_flasher(transport);
        let stub = stubs::synthetic_stub(0x4010_0000, &[0x6A; 100], &[0x01; 16]);
        flasher.load_stub(&stub).unwrap();
        assert_eq!(flasher.connection.mode(), Mode::Stub);
    }

    #[test]
    fn failed_stub_handshake_falls_back_to_rom() {
        // A silent device: the upload times out, which is logged and
        // leaves the session on the ROM command set
        let mut flasher = rom_flasher(LoopbackTransport::new());
        let stub = stubs::synthetic_stub(0x4010_0000, &[1, 2, 3], &[]);
        flasher.load_stub(&stub).unwrap();
        assert_eq!(flasher.connection.mode(), Mode::Rom);
    }

    #[test]
    fn read_params_envelope() {
        for kind in [
            TransportKind::AndroidUsb,
            TransportKind::WebSerial,
            TransportKind::Native,
        ] {
            assert!(ReadFlashParams::for_transport(kind).validate());
        }

        let bad = ReadFlashParams {
            chunk_size: 0x800,
            block_size: 31,
            max_in_flight: 31,
        };
        assert!(!bad.validate());
    }

    #[test]
    fn esp8266_erase_size_quirk() {
        assert_eq!(get_erase_size(0, 0x1000), 0x1000);
        // Inside the first 64 KiB block only half the sectors count
        assert_eq!(get_erase_size(0, 0x10000), 0x8000);
        assert_eq!(get_erase_size(0x1000, 0x10000), 0x8000);
        // Past the block boundary the head sectors drop out entirely
        assert_eq!(get_erase_size(0, 0x20000), 0x10000);
    }
}
