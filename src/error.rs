//! Library error types

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::{command::CommandType, fs::FilesystemKind, targets::Chip};

/// All possible errors returned by the library
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Chip not recognized, magic value {0:#010x} does not match any supported device")]
    #[diagnostic(
        code(espkit::unrecognized_chip),
        help("If your chip is supported, try hard-resetting the device and try again")
    )]
    ChipDetect(u32),

    #[error("Chip-id {0} does not match any supported device")]
    #[diagnostic(code(espkit::unrecognized_chip_id))]
    ChipIdDetect(u32),

    #[error("Failed to connect to on-device flash")]
    #[diagnostic(code(espkit::flash_connect))]
    FlashConnect,

    #[error("MD5 digest of the {0} region disagrees with the device")]
    #[diagnostic(
        code(espkit::checksum_mismatch),
        help("Retry the operation; if the mismatch persists the flash may be failing")
    )]
    ChecksumMismatch(ChecksumRegion),

    #[error("The {chip} does not support {operation} in the current mode")]
    #[diagnostic(code(espkit::not_supported))]
    NotSupported {
        chip: Chip,
        operation: &'static str,
    },

    #[error("Error while processing the partition table")]
    #[diagnostic(transparent)]
    PartitionTable(#[from] PartitionTableError),

    #[error("Could not identify a filesystem in the provided image")]
    #[diagnostic(
        code(espkit::unknown_filesystem),
        help("The region may be unformatted, encrypted, or hold raw application data")
    )]
    UnknownFilesystem,

    #[error("Failed to mount {0} image")]
    #[diagnostic(
        code(espkit::mount_failed),
        help("The image may be truncated or use an unsupported geometry")
    )]
    MountFailed(FilesystemKind),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Filesystem(#[from] FsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Nvs(#[from] NvsError),

    #[error("The provided stub payload is not valid")]
    #[diagnostic(code(espkit::invalid_stub))]
    InvalidStub(#[source] toml::de::Error),

    #[error("Canceled by user")]
    Canceled,

    #[error("Internal error, please open an issue with the log attached")]
    InternalError,
}

/// Errors originating from the transport or the framing layer
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(espkit::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("USB transfer failed: {0}")]
    #[diagnostic(code(espkit::usb_error))]
    Usb(#[source] rusb::Error),

    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(espkit::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(espkit::timeout))]
    Timeout(TimedOutCommand),

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(espkit::slip_framing),
        help("Try hard-resetting the device; if the error persists your ROM may be corrupted")
    )]
    SlipRead,

    #[error("Received packet too large for the receive buffer")]
    #[diagnostic(code(espkit::oversized_packet))]
    OverSizedPacket,

    #[error("The serial port closed or re-enumerated underneath us")]
    #[diagnostic(
        code(espkit::transport_lost),
        help("Select the port again once the device has re-enumerated")
    )]
    TransportLost,

    #[error("The device did not reply to our sync requests")]
    #[diagnostic(
        code(espkit::no_sync_reply),
        help("The chip may not be in download mode; try the boot button or a different reset strategy")
    )]
    NoSyncReply,

    #[error("The chip booted into firmware (boot mode {0}) instead of download mode")]
    #[diagnostic(code(espkit::wrong_boot_mode))]
    WrongBootMode(String),

    #[error("Invalid stub handshake response received")]
    InvalidStubHandshake,
}

/// Operation name carried inside [ConnectionError::Timeout]
#[derive(Debug, Default, Clone)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(command: CommandType) -> Self {
        TimedOutCommand {
            command: Some(command),
        }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

/// The flash region an MD5 comparison failed over
#[derive(Debug, Clone, Copy)]
pub struct ChecksumRegion {
    pub offset: u32,
    pub size: u32,
}

impl Display for ChecksumRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}..{:#x}", self.offset, self.offset + self.size)
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => from_error_kind(kind, err),
            serialport::ErrorKind::NoDevice => ConnectionError::TransportLost,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<rusb::Error> for ConnectionError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => ConnectionError::Timeout(TimedOutCommand::default()),
            rusb::Error::NoDevice | rusb::Error::Pipe => ConnectionError::TransportLost,
            _ => ConnectionError::Usb(err),
        }
    }
}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

fn from_error_kind<E: Into<serialport::Error>>(kind: io::ErrorKind, err: E) -> ConnectionError {
    match kind {
        io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe => ConnectionError::TransportLost,
        _ => ConnectionError::Serial(err.into()),
    }
}

/// Error classes reported by the ROM bootloader status trailer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error, Diagnostic)]
#[repr(u8)]
#[non_exhaustive]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(espkit::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(espkit::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(espkit::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(espkit::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(espkit::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(espkit::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(espkit::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Other")]
    #[diagnostic(code(espkit::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        match raw {
            0x05 => RomErrorKind::InvalidMessage,
            0x06 => RomErrorKind::FailedToAct,
            0x07 => RomErrorKind::InvalidCrc,
            0x08 => RomErrorKind::FlashWriteError,
            0x09 => RomErrorKind::FlashReadError,
            0x0a => RomErrorKind::FlashReadLengthError,
            0x0b => RomErrorKind::DeflateError,
            _ => RomErrorKind::Other,
        }
    }
}

/// An error reported in the status trailer of a command response
#[derive(Copy, Clone, Debug, Error, Diagnostic)]
#[non_exhaustive]
#[error("Error while running {command} command")]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }

    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

/// Errors produced while decoding or re-imaging an embedded filesystem
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum FsError {
    #[error("'{0}' was not found in the filesystem")]
    #[diagnostic(code(espkit::fs::not_found))]
    NotFound(String),

    #[error("The filesystem does not support {0}")]
    #[diagnostic(code(espkit::fs::not_supported))]
    NotSupported(&'static str),

    #[error("'{0}' already exists")]
    #[diagnostic(code(espkit::fs::exists))]
    AlreadyExists(String),

    #[error("The image is full, '{0}' does not fit")]
    #[diagnostic(code(espkit::fs::full))]
    NoSpace(String),

    #[error("Path '{0}' is not valid for this filesystem")]
    #[diagnostic(code(espkit::fs::bad_path))]
    InvalidPath(String),

    #[error("The image is corrupt: {0}")]
    #[diagnostic(code(espkit::fs::corrupt))]
    Corrupt(&'static str),

    #[error("FAT driver error: {0}")]
    #[diagnostic(code(espkit::fs::fat))]
    Fat(#[from] io::Error),
}

/// Errors produced by the NVS codec
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum NvsError {
    #[error("Entry '{0}' was not found in any active page")]
    #[diagnostic(code(espkit::nvs::not_found))]
    NotFound(String),

    #[error("New value does not fit into the {size} byte slot of '{key}'")]
    #[diagnostic(
        code(espkit::nvs::overflow),
        help("Growing an entry requires rewriting the partition; only in-place edits are supported")
    )]
    Overflow { key: String, size: usize },

    #[error("Value type does not match the stored type of the entry")]
    #[diagnostic(code(espkit::nvs::type_mismatch))]
    TypeMismatch,

    #[error("The partition is corrupt: {0}")]
    #[diagnostic(code(espkit::nvs::corrupt))]
    Corrupt(&'static str),
}

/// Errors produced by the partition-table codec
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum PartitionTableError {
    #[error("No partition entry with magic 0x50AA found at the table offset")]
    #[diagnostic(
        code(espkit::partition_table::no_magic),
        help("The device may use a custom table offset, or the table may never have been written")
    )]
    MissingMagic,

    #[error("Partition entry {0} is truncated")]
    #[diagnostic(code(espkit::partition_table::truncated))]
    Truncated(usize),

    #[error("Partition name is not valid UTF-8")]
    #[diagnostic(code(espkit::partition_table::bad_name))]
    InvalidName,
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}
