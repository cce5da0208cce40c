//! Establish a connection with a target device
//!
//! The [Connection] struct owns the transport and sequences every command
//! and response exchanged with the ROM bootloader or the flasher stub. It
//! knows nothing about flash layout; the higher-level operations live in
//! [crate::flasher].

use std::{thread::sleep, time::Duration};

use log::debug;
use regex::Regex;

use crate::{
    command::{Command, CommandType, FLASH_READ_PACKET_TIMEOUT},
    connection::reset::{
        construct_reset_strategy_sequence, soft_reset, HardReset, ResetAfterOperation,
        ResetStrategy,
    },
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    event::{CancelToken, Event, EventSink, NullEventSink},
    interface::{PortInfo, TimedReader, Transport},
    slip::{SlipDecoder, SlipEncoder, SlipError},
    targets::{Chip, CHIP_DETECT_MAGIC_REG_ADDR},
};

pub mod reset;

const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 8;
/// Commands are re-sent this many times after a retriable failure
const COMMAND_RETRIES: usize = 3;
/// How long to keep draining queued sync echoes once one arrived
const SYNC_DRAIN: Duration = Duration::from_millis(50);

/// Which command set the other end currently speaks
///
/// The ROM bootloader and the RAM stub share opcodes but differ in block
/// sizes, in a handful of stub-only commands, and in the width of the
/// status trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Rom,
    Stub,
}

impl Mode {
    /// Number of trailing status bytes in a response
    pub fn status_trailer_len(self) -> usize {
        match self {
            Mode::Rom => 2,
            Mode::Stub => 4,
        }
    }

    /// Page size for FLASH_DATA frames
    pub fn flash_write_size(self) -> usize {
        match self {
            Mode::Rom => 0x400,
            Mode::Stub => 0x4000,
        }
    }
}

/// A decoded response frame
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub direction: u8,
    pub return_op: u8,
    pub return_length: u16,
    pub value: u32,
    /// Body bytes between the value word and the status trailer
    pub data: Vec<u8>,
    /// First trailer byte; non-zero means the command failed
    pub status: u8,
    /// Second trailer byte; the ROM error class when `status` is non-zero
    pub error: u8,
}

/// An established connection with a target device
pub struct Connection {
    transport: Box<dyn Transport>,
    decoder: SlipDecoder,
    mode: Mode,
    chip: Option<Chip>,
    revision: u32,
    events: Box<dyn EventSink>,
    cancel: CancelToken,
    reconnect_pending: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_event_sink(transport, Box::new(NullEventSink))
    }

    pub fn with_event_sink(transport: Box<dyn Transport>, events: Box<dyn EventSink>) -> Self {
        Connection {
            transport,
            decoder: SlipDecoder::new(),
            mode: Mode::Rom,
            chip: None,
            revision: 0,
            events,
            cancel: CancelToken::new(),
            reconnect_pending: false,
        }
    }

    /// The cancellation token observed by every suspension point
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The command set in use
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        debug!("Switching command set to {:?}", mode);
        self.mode = mode;
    }

    /// The detected chip, once detection ran
    pub fn chip(&self) -> Option<Chip> {
        self.chip
    }

    /// The detected chip revision as `major * 100 + minor`
    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn port_info(&self) -> PortInfo {
        self.transport.info()
    }

    fn check_cancel(&self) -> Result<(), Error> {
        if self.cancel.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Drive the device into download mode and synchronize with it
    pub fn begin(&mut self) -> Result<(), Error> {
        let port_info = self.transport.info();
        let reset_sequence = construct_reset_strategy_sequence(port_info.pid);

        for (_, reset_strategy) in (0..MAX_CONNECT_ATTEMPTS).zip(reset_sequence.iter().cycle()) {
            self.check_cancel()?;
            match self.connect_attempt(reset_strategy.as_ref()) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!("Connection attempt failed ({e:#?}), retrying");
                }
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    fn connect_attempt(&mut self, reset_strategy: &dyn ResetStrategy) -> Result<(), Error> {
        reset_strategy.reset(self.transport.as_mut())?;

        // The ROM prints a boot banner after reset; keep it around so a
        // failed sync can tell "wrong boot mode" apart from "dead wire"
        let mut banner = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match self.transport.read(&mut chunk, Duration::from_millis(20)) {
                Ok(0) | Err(_) => break,
                Ok(n) => banner.extend_from_slice(&chunk[..n]),
            }
            if banner.len() > 4096 {
                break;
            }
        }

        let banner = String::from_utf8_lossy(&banner).into_owned();
        let pattern = Regex::new(r"boot:(0x[0-9a-fA-F]+)(.*waiting for download)?").unwrap();
        let boot_log = pattern.captures(&banner).map(|captures| {
            let mode = captures.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let download = captures.get(2).is_some();
            debug!("Boot mode {mode}, download mode: {download}");
            (mode, download)
        });

        if self.sync().is_ok() {
            return Ok(());
        }

        match boot_log {
            Some((_, true)) => Err(Error::Connection(ConnectionError::NoSyncReply)),
            Some((mode, false)) => Err(Error::Connection(ConnectionError::WrongBootMode(mode))),
            None => Err(Error::Connection(ConnectionError::ConnectionFailed)),
        }
    }

    /// Synchronize with the loader
    ///
    /// Sends the fixed 36-byte sync packet with a short per-attempt budget;
    /// a responsive loader echoes one response per attempt and possibly a
    /// few more, which are drained before returning.
    pub fn sync(&mut self) -> Result<(), Error> {
        let timeout = CommandType::Sync.timeout();

        for attempt in 0..MAX_SYNC_ATTEMPTS {
            self.check_cancel()?;
            self.write_command(Command::Sync).for_command(CommandType::Sync)?;

            match self.read_response(timeout) {
                Ok(Some(response)) if response.return_op == CommandType::Sync as u8 => {
                    if response.status != 0 {
                        return Err(Error::RomError(RomError::new(
                            CommandType::Sync,
                            RomErrorKind::from(response.error),
                        )));
                    }

                    // The loader replies once per sync packet it saw; eat
                    // the stragglers so they do not confuse the next command
                    while self.read_response(SYNC_DRAIN).ok().flatten().is_some() {}

                    debug!("Synced after {} attempt(s)", attempt + 1);
                    return Ok(());
                }
                _ => continue,
            }
        }

        Err(Error::Connection(ConnectionError::Timeout(
            CommandType::Sync.into(),
        )))
    }

    /// Write a command frame without waiting for the response
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {:?}", command.command_type());

        self.transport.clear_input()?;

        let mut encoded = Vec::new();
        let mut encoder = SlipEncoder::new(&mut encoded)?;
        command.write(&mut encoder)?;
        encoder.finish()?;

        self.transport.write_all(&encoded)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Read one response frame, decoding the header and the
    /// mode-appropriate status trailer
    pub fn read_response(&mut self, timeout: Duration) -> Result<Option<CommandResponse>, Error> {
        let frame = self.read_frame(timeout)?;

        let trailer = self.mode.status_trailer_len();
        // direction + op + size + value + trailer
        if frame.len() < 8 + trailer {
            // Unsolicited loader output; not a response
            return Ok(None);
        }

        let data_end = frame.len() - trailer;
        let response = CommandResponse {
            direction: frame[0],
            return_op: frame[1],
            return_length: u16::from_le_bytes(frame[2..4].try_into().unwrap()),
            value: u32::from_le_bytes(frame[4..8].try_into().unwrap()),
            data: frame[8..data_end].to_vec(),
            status: frame[data_end],
            error: frame[data_end + 1],
        };

        if response.direction != 0x01 {
            return Ok(None);
        }

        Ok(Some(response))
    }

    /// Read one raw SLIP frame (used by the streaming flash read)
    pub(crate) fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        let Connection {
            transport, decoder, ..
        } = self;

        let mut reader = TimedReader::new(transport.as_mut(), timeout);
        let mut frame = Vec::new();
        match decoder.decode(&mut reader, &mut frame) {
            Ok(_) => Ok(frame),
            Err(err) => {
                // Whatever was half-collected is unusable now
                decoder.reset();
                match err {
                    SlipError::ReadError(err)
                        if err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        Err(Error::Connection(ConnectionError::Timeout(Default::default())))
                    }
                    SlipError::ReadError(err) => Err(err.into()),
                    _ => Err(Error::Connection(ConnectionError::SlipRead)),
                }
            }
        }
    }

    /// Send a command and return its response, retrying on transient errors
    ///
    /// SLIP framing errors and the ROM's own "invalid message" complaint
    /// (0x05) are retried up to a fixed budget; every other trailer error
    /// is surfaced. One-shot commands (sync, baud change, the erase/end
    /// family) are never re-sent.
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        self.command_with_timeout(command, command.command_type().timeout())
    }

    pub fn command_with_timeout(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        let retries = if is_one_shot(ty) { 0 } else { COMMAND_RETRIES };

        let mut attempt = 0;
        loop {
            self.check_cancel()?;
            attempt += 1;

            match self.exchange(command, timeout) {
                Ok(response) => return Ok(response),
                Err(Error::Connection(ConnectionError::SlipRead)) if attempt <= retries => {
                    debug!("SLIP framing error running {ty}, retrying");
                    continue;
                }
                Err(Error::RomError(err))
                    if err.kind() == RomErrorKind::InvalidMessage && attempt <= retries =>
                {
                    debug!("Loader rejected {ty} as invalid, retrying");
                    continue;
                }
                Err(err) => return Err(err).for_command(ty),
            }
        }
    }

    fn exchange(&mut self, command: Command<'_>, timeout: Duration) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        // Responses to earlier chatter may still be queued; discard frames
        // until the op echo matches
        for _ in 0..100 {
            match self.read_response(timeout).for_command(ty)? {
                Some(response) if response.return_op == ty as u8 => {
                    return if response.status != 0 {
                        Err(Error::RomError(RomError::new(
                            ty,
                            RomErrorKind::from(response.error),
                        )))
                    } else {
                        Ok(response)
                    };
                }
                _ => continue,
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Read a register
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        let response = self.command(Command::ReadReg { address })?;
        Ok(response.value)
    }

    /// Write a register
    pub fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.command(Command::WriteReg {
            address,
            value,
            mask,
        })?;
        Ok(())
    }

    /// Read the nth word of the eFuse read block
    pub fn read_efuse(&mut self, chip: Chip, word: u32) -> Result<u32, Error> {
        self.read_reg(chip.efuse_word_addr(word))
    }

    /// Identify the connected chip
    ///
    /// First the legacy magic value is read from the (family-independent)
    /// UART date register; families that share a magic-less ROM are then
    /// told apart via the GET_SECURITY_INFO chip-id.
    pub fn detect_chip(&mut self) -> Result<Chip, Error> {
        let magic = self.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;

        let chip = match Chip::from_magic(magic) {
            Ok(chip) => chip,
            Err(_) => {
                debug!("Magic {magic:#010x} unknown, trying GET_SECURITY_INFO");
                let response = self.command(Command::GetSecurityInfo)?;
                // Flags word, flash_crypt_cnt, seven key-purpose bytes,
                // then the chip id
                if response.data.len() < 16 {
                    return Err(Error::ChipDetect(magic));
                }
                let chip_id = u32::from_le_bytes(response.data[12..16].try_into().unwrap());
                Chip::from_chip_id(chip_id)?
            }
        };

        self.chip = Some(chip);
        self.revision = self.chip_revision(chip).unwrap_or(0);
        debug!("Detected {chip}, revision {}", self.revision);

        self.events.event(Event::ChipDetected {
            chip,
            revision: self.revision,
        });

        Ok(chip)
    }

    /// Read the chip revision (`major * 100 + minor`) from eFuse BLOCK1
    ///
    /// On families that split the minor version across two words the high
    /// bits are shifted above the low field's width.
    pub fn chip_revision(&mut self, chip: Chip) -> Result<u32, Error> {
        let descriptor = chip.descriptor();
        if descriptor.rev_major.mask == 0 {
            return Ok(0);
        }

        let major_word = self.read_efuse(chip, descriptor.rev_major.word)?;
        let minor_word = self.read_efuse(chip, descriptor.rev_minor.word)?;

        let major = descriptor.rev_major.extract(major_word);
        let mut minor = descriptor.rev_minor.extract(minor_word);

        if let Some(hi_field) = descriptor.rev_minor_hi {
            let hi_word = self.read_efuse(chip, hi_field.word)?;
            let hi = hi_field.extract(hi_word);
            minor += hi << descriptor.rev_minor.mask.count_ones();
        }

        Ok(major * 100 + minor)
    }

    /// Renegotiate the line speed
    ///
    /// The ESP8266 ROM does not implement CHANGE_BAUDRATE; asking for it is
    /// rejected before anything is sent so the current baud stays valid.
    pub fn change_baud(&mut self, chip: Chip, new_baud: u32) -> Result<(), Error> {
        if !chip.supports_change_baudrate() {
            return Err(Error::NotSupported {
                chip,
                operation: "CHANGE_BAUDRATE",
            });
        }

        let prior_baud = match self.mode {
            Mode::Stub => self.transport.baud()?,
            Mode::Rom => 0,
        };

        debug!("Changing baud to {new_baud}");
        self.command(Command::ChangeBaudrate {
            new_baud,
            prior_baud,
        })?;
        self.transport.set_baud(new_baud)?;
        sleep(Duration::from_millis(50));
        self.transport.clear_input()?;

        Ok(())
    }

    /// Reset into firmware once an operation finished
    pub fn reset_after(&mut self, operation: ResetAfterOperation) -> Result<(), Error> {
        let chip = self.chip;
        match operation {
            ResetAfterOperation::HardReset => {
                if self.will_reenumerate() {
                    self.port_will_change();
                }
                HardReset.reset(self.transport.as_mut())
            }
            ResetAfterOperation::SoftReset => soft_reset(self, false),
            ResetAfterOperation::NoReset => {
                debug!("Staying in bootloader");
                soft_reset(self, true)
            }
            ResetAfterOperation::NoResetNoStub => {
                debug!("Staying in flasher stub");
                Ok(())
            }
        }
        .or_else(|err| {
            // A device that is already rebooting cannot always answer; when
            // the caller is tearing the session down anyway this is noise
            if chip.is_some() && self.cancel.is_canceled() {
                log::warn!("Reset during teardown failed: {err:?}");
                Ok(())
            } else {
                Err(err)
            }
        })
    }

    /// Will a reset of this device tear down the USB device we talk through?
    pub fn will_reenumerate(&self) -> bool {
        match self.chip {
            Some(chip) => chip.has_native_usb(),
            None => self.transport.info().pid == crate::interface::USB_SERIAL_JTAG_PID,
        }
    }

    /// Announce that the port is about to disappear
    pub(crate) fn port_will_change(&mut self) {
        self.reconnect_pending = true;
        self.events.event(Event::PortWillChange);
    }

    /// Has a re-enumeration been announced without a new port arriving yet?
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Hand a fresh transport to the session after re-enumeration
    pub fn replace_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = transport;
        self.decoder = SlipDecoder::new();
        self.reconnect_pending = false;
    }

    /// Write raw bytes, bypassing framing (used for read-flash acks)
    pub(crate) fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.transport.write_all(data)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Read one streamed data packet
    pub(crate) fn read_stream_packet(&mut self) -> Result<Vec<u8>, Error> {
        self.read_frame(FLASH_READ_PACKET_TIMEOUT)
    }

    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    /// Release the port handle
    pub fn close(&mut self) -> Result<(), Error> {
        self.transport.close()?;
        Ok(())
    }
}

/// Commands which must never be re-sent, per the protocol contract
fn is_one_shot(ty: CommandType) -> bool {
    matches!(
        ty,
        CommandType::Sync
            | CommandType::ChangeBaudrate
            | CommandType::EraseFlash
            | CommandType::EraseRegion
            | CommandType::FlashEnd
            | CommandType::FlashDeflEnd
            | CommandType::MemEnd
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::VecDeque,
        time::Duration,
    };

    use crate::{
        error::ConnectionError,
        interface::{PortInfo, SignalUpdate, Transport},
        slip,
    };

    /// In-memory transport: reads serve pre-loaded frames, writes are
    /// logged for inspection
    #[derive(Default)]
    pub struct LoopbackTransport {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
        pub info: PortInfo,
        pub baud: u32,
        pub signal_log: Vec<(Option<bool>, Option<bool>)>,
    }

    impl LoopbackTransport {
        pub fn new() -> Self {
            Self {
                baud: 115_200,
                ..Self::default()
            }
        }

        /// Queue a SLIP-framed loader response
        pub fn push_response(&mut self, op: u8, value: u32, data: &[u8], trailer_len: usize) {
            let mut body = vec![0x01, op];
            let size = (data.len() + trailer_len) as u16;
            body.extend_from_slice(&size.to_le_bytes());
            body.extend_from_slice(&value.to_le_bytes());
            body.extend_from_slice(data);
            body.extend_from_slice(&vec![0u8; trailer_len]);
            self.rx.extend(slip::encode(&body));
        }

        /// Queue a response whose status trailer signals `error`
        pub fn push_error_response(&mut self, op: u8, error: u8, trailer_len: usize) {
            let mut body = vec![0x01, op];
            body.extend_from_slice(&(trailer_len as u16).to_le_bytes());
            body.extend_from_slice(&0u32.to_le_bytes());
            let mut trailer = vec![0u8; trailer_len];
            trailer[0] = 1;
            trailer[1] = error;
            body.extend_from_slice(&trailer);
            self.rx.extend(slip::encode(&body));
        }
    }

    impl Transport for LoopbackTransport {
        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, ConnectionError> {
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
            self.tx.extend_from_slice(data);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn clear_input(&mut self) -> Result<(), ConnectionError> {
            // Keep the pre-loaded frames; tests stage them up front
            Ok(())
        }

        fn set_signals(&mut self, signals: SignalUpdate) -> Result<(), ConnectionError> {
            self.signal_log.push((signals.dtr, signals.rts));
            Ok(())
        }

        fn set_baud(&mut self, baud: u32) -> Result<(), ConnectionError> {
            self.baud = baud;
            Ok(())
        }

        fn baud(&self) -> Result<u32, ConnectionError> {
            Ok(self.baud)
        }

        fn info(&self) -> PortInfo {
            self.info
        }

        fn close(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::LoopbackTransport, *};

    fn connection(transport: LoopbackTransport) -> Connection {
        Connection::new(Box::new(transport))
    }

    #[test]
    fn sync_succeeds_within_budget() {
        let mut transport = LoopbackTransport::new();
        for _ in 0..2 {
            transport.push_response(CommandType::Sync as u8, 0, &[], 2);
        }

        let mut connection = connection(transport);
        connection.sync().unwrap();
    }

    #[test]
    fn sync_against_silent_port_times_out() {
        let mut connection = connection(LoopbackTransport::new());
        let err = connection.sync().unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Timeout(_))
        ));
    }

    #[test]
    fn response_value_and_data_pass_through_unchanged() {
        let mut transport = LoopbackTransport::new();
        transport.push_response(CommandType::ReadReg as u8, 0xDEAD_BEEF, &[], 2);

        let mut connection = connection(transport);
        let value = connection.read_reg(0x4000_1000).unwrap();
        assert_eq!(value, 0xDEAD_BEEF);
    }

    #[test]
    fn mismatched_op_frames_are_discarded() {
        let mut transport = LoopbackTransport::new();
        // Stale sync echo queued in front of the real answer
        transport.push_response(CommandType::Sync as u8, 0, &[], 2);
        transport.push_response(CommandType::ReadReg as u8, 42, &[], 2);

        let mut connection = connection(transport);
        assert_eq!(connection.read_reg(0).unwrap(), 42);
    }

    #[test]
    fn trailer_error_is_surfaced_not_retried() {
        let mut transport = LoopbackTransport::new();
        transport.push_error_response(CommandType::ReadReg as u8, 0x07, 2);

        let mut connection = connection(transport);
        let err = connection.read_reg(0).unwrap_err();
        match err {
            Error::RomError(e) => assert_eq!(e.kind(), RomErrorKind::InvalidCrc),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn invalid_message_is_retried() {
        let mut transport = LoopbackTransport::new();
        transport.push_error_response(CommandType::ReadReg as u8, 0x05, 2);
        transport.push_response(CommandType::ReadReg as u8, 7, &[], 2);

        let mut connection = connection(transport);
        assert_eq!(connection.read_reg(0).unwrap(), 7);
    }

    #[test]
    fn stub_mode_reads_four_byte_trailer() {
        let mut transport = LoopbackTransport::new();
        transport.push_response(CommandType::ReadReg as u8, 9, &[], 4);

        let mut connection = connection(transport);
        connection.set_mode(Mode::Stub);
        assert_eq!(connection.read_reg(0).unwrap(), 9);
    }

    #[test]
    fn change_baud_on_esp8266_is_rejected_untouched() {
        let mut connection = connection(LoopbackTransport::new());
        let before = connection.transport().baud().unwrap();

        let err = connection.change_baud(Chip::Esp8266, 921_600).unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
        assert_eq!(connection.transport().baud().unwrap(), before);
    }

    #[test]
    fn magic_detection_prefers_legacy_values() {
        {
            let mut transport = LoopbackTransport::new();
            transport.push_response(CommandType::ReadReg as u8, 0xFFF0_C101, &[], 2);

            let mut connection = connection(transport);
            assert_eq!(connection.detect_chip().unwrap(), Chip::Esp8266);
        }

        {
            let mut transport = LoopbackTransport::new();
            transport.push_response(CommandType::ReadReg as u8, 0x00F0_1D83, &[], 2);
            // ESP32 revision comes from eFuse reads afterwards
            transport.push_response(CommandType::ReadReg as u8, 0, &[], 2);
            transport.push_response(CommandType::ReadReg as u8, 0, &[], 2);

            let mut connection = connection(transport);
            assert_eq!(connection.detect_chip().unwrap(), Chip::Esp32);
        }
    }

    #[test]
    fn unknown_magic_falls_through_to_chip_id() {
        let mut transport = LoopbackTransport::new();
        transport.push_response(CommandType::ReadReg as u8, 0x1234_5678, &[], 2);

        // Security info payload: flags, flash_crypt_cnt, key purposes,
        // then the chip id (13 = C6)
        let mut info = vec![0u8; 12];
        info.extend_from_slice(&13u32.to_le_bytes());
        info.extend_from_slice(&[0u8; 4]);
        transport.push_response(CommandType::GetSecurityInfo as u8, 0, &info, 2);

        // Revision eFuse reads: major word, minor low word, minor high word
        let mut t = transport;
        for _ in 0..3 {
            t.push_response(CommandType::ReadReg as u8, 0, &[], 2);
        }

        let mut connection = connection(t);
        assert_eq!(connection.detect_chip().unwrap(), Chip::Esp32c6);
    }

    #[test]
    fn split_minor_revision_is_composed_from_two_words() {
        // ESP32-C6: major = word22 bits 24-25, minor = (word22 bit23 << 3)
        // + word20 bits 18-20
        let mut transport = LoopbackTransport::new();
        transport.push_response(CommandType::ReadReg as u8, 0x2CE0_806F, &[], 2);
        // Word 22: major 1, minor-hi 1
        let word22 = (1 << 24) | (1 << 23);
        // Word 20: minor-lo 2
        let word20 = 2 << 18;
        transport.push_response(CommandType::ReadReg as u8, word22, &[], 2);
        transport.push_response(CommandType::ReadReg as u8, word20, &[], 2);
        transport.push_response(CommandType::ReadReg as u8, word22, &[], 2);

        let mut connection = connection(transport);
        assert_eq!(connection.detect_chip().unwrap(), Chip::Esp32c6);
        // major 1, minor (1 << 3) + 2 = 10
        assert_eq!(connection.revision(), 110);
    }
}
