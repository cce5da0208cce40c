//! Transport abstraction over the byte stream to the target
//!
//! Two backings exist: [SerialInterface] for hosts with a proper serial
//! enumeration (FTDI/CH34x/CP210x/CDC adapters on desktops) and
//! [usb::UsbInterface] for platforms where only raw USB bulk access is
//! available. Both honor the same contract: timed reads, write-through
//! writes, and partial signal updates that never clobber the line that was
//! not named.

use std::{
    io::Read,
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, FlowControl, SerialPort};

use crate::error::ConnectionError;

pub mod usb;

/// USB PID of the on-chip USB-JTAG/Serial peripheral
pub const USB_SERIAL_JTAG_PID: u16 = 0x1001;

/// Vendor/product identity of the port, where the backing knows it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub vid: u16,
    pub pid: u16,
}

/// A partial update of the out-of-band serial lines
///
/// `None` leaves the current level of that line untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalUpdate {
    pub dtr: Option<bool>,
    pub rts: Option<bool>,
    pub break_condition: Option<bool>,
}

impl SignalUpdate {
    pub fn dtr(level: bool) -> Self {
        Self {
            dtr: Some(level),
            ..Self::default()
        }
    }

    pub fn rts(level: bool) -> Self {
        Self {
            rts: Some(level),
            ..Self::default()
        }
    }

    pub fn dtr_rts(dtr: bool, rts: bool) -> Self {
        Self {
            dtr: Some(dtr),
            rts: Some(rts),
            break_condition: None,
        }
    }
}

/// Byte-stream transport to the target device
///
/// The transport never interprets the bytes it moves.
pub trait Transport {
    /// Read up to `buf.len()` bytes, waiting at most `timeout` for the
    /// first one. Returns the number of bytes placed into `buf`; zero
    /// means the timeout elapsed with nothing to read.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError>;

    /// Write the whole buffer
    fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Block until everything written has left the host
    fn flush(&mut self) -> Result<(), ConnectionError>;

    /// Drop any bytes already received but not yet read
    fn clear_input(&mut self) -> Result<(), ConnectionError>;

    /// Apply a (possibly partial) signal update
    fn set_signals(&mut self, signals: SignalUpdate) -> Result<(), ConnectionError>;

    /// Drive DTR and RTS in one operation where the backing allows it
    ///
    /// The default implementation falls back to two sequential updates.
    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<(), ConnectionError> {
        self.set_signals(SignalUpdate::dtr_rts(dtr, rts))
    }

    /// Change the line speed
    fn set_baud(&mut self, baud: u32) -> Result<(), ConnectionError>;

    /// The current line speed
    fn baud(&self) -> Result<u32, ConnectionError>;

    /// Vendor/product identity, zeroed when unknown
    fn info(&self) -> PortInfo;

    /// Release the port
    fn close(&mut self) -> Result<(), ConnectionError>;

    /// Read until `count` bytes have arrived, `predicate` matches the bytes
    /// collected so far, or the timeout elapses (an error)
    fn read_exact_until(
        &mut self,
        count: usize,
        predicate: &mut dyn FnMut(&[u8]) -> bool,
        timeout: Duration,
    ) -> Result<Vec<u8>, ConnectionError> {
        let deadline = Instant::now() + timeout;
        let mut collected = Vec::with_capacity(count);
        let mut chunk = [0u8; 64];

        while collected.len() < count && !predicate(&collected) {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ConnectionError::Timeout(Default::default()))?;

            let want = (count - collected.len()).min(chunk.len());
            let read = self.read(&mut chunk[..want], remaining)?;
            if read == 0 {
                return Err(ConnectionError::Timeout(Default::default()));
            }
            collected.extend_from_slice(&chunk[..read]);
        }

        Ok(collected)
    }
}

/// Native serial backing
pub struct SerialInterface {
    port: Box<dyn SerialPort>,
    info: PortInfo,
    // Captured at open time; the trait object hides the descriptor the
    // tight-reset ioctl needs
    #[cfg(unix)]
    raw_fd: Option<std::os::fd::RawFd>,
}

impl SerialInterface {
    /// Open `port_name` at `baud`
    pub fn open(port_name: &str, baud: u32) -> Result<Self, ConnectionError> {
        let builder = serialport::new(port_name, baud)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(10));

        #[cfg(unix)]
        let (port, raw_fd): (Box<dyn SerialPort>, _) = {
            use std::os::fd::AsRawFd;

            let native = builder.open_native().map_err(ConnectionError::from)?;
            let raw_fd = Some(native.as_raw_fd());
            (Box::new(native), raw_fd)
        };

        #[cfg(not(unix))]
        let port = builder.open().map_err(ConnectionError::from)?;

        let info = serialport::available_ports()
            .ok()
            .and_then(|ports| {
                ports.into_iter().find_map(|p| match p.port_type {
                    serialport::SerialPortType::UsbPort(usb) if p.port_name == port_name => {
                        Some(PortInfo {
                            vid: usb.vid,
                            pid: usb.pid,
                        })
                    }
                    _ => None,
                })
            })
            .unwrap_or_default();

        Ok(Self {
            port,
            info,
            #[cfg(unix)]
            raw_fd,
        })
    }

    /// Wrap an already-open port (used by the tests and by shells that do
    /// their own enumeration)
    pub fn from_port(port: Box<dyn SerialPort>, info: PortInfo) -> Self {
        Self {
            port,
            info,
            #[cfg(unix)]
            raw_fd: None,
        }
    }

    pub fn serial_port(&self) -> &dyn SerialPort {
        self.port.as_ref()
    }
}

impl Transport for SerialInterface {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError> {
        self.port.set_timeout(timeout).map_err(ConnectionError::from)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        std::io::Write::write_all(&mut self.port, data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ConnectionError> {
        std::io::Write::flush(&mut self.port)?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), ConnectionError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_signals(&mut self, signals: SignalUpdate) -> Result<(), ConnectionError> {
        // The serial driver latches each line on its own, so touching only
        // one of them cannot disturb the other
        if let Some(dtr) = signals.dtr {
            self.port.write_data_terminal_ready(dtr)?;
        }
        if let Some(rts) = signals.rts {
            self.port.write_request_to_send(rts)?;
        }
        if let Some(level) = signals.break_condition {
            if level {
                self.port.set_break()?;
            } else {
                self.port.clear_break()?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<(), ConnectionError> {
        let Some(fd) = self.raw_fd else {
            // No descriptor to hand to the ioctl; fall back to flipping
            // the lines one after the other
            return self.set_signals(SignalUpdate::dtr_rts(dtr, rts));
        };

        let mut status: i32 = 0;
        if unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut status) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        if dtr {
            status |= libc::TIOCM_DTR
        } else {
            status &= !libc::TIOCM_DTR
        }

        if rts {
            status |= libc::TIOCM_RTS
        } else {
            status &= !libc::TIOCM_RTS
        }

        if unsafe { libc::ioctl(fd, libc::TIOCMSET, &status) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), ConnectionError> {
        self.port.set_baud_rate(baud)?;
        Ok(())
    }

    fn baud(&self) -> Result<u32, ConnectionError> {
        Ok(self.port.baud_rate()?)
    }

    fn info(&self) -> PortInfo {
        self.info
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        // Dropping the boxed port releases the handle; nothing to do
        // beyond lowering the control lines.
        self.set_signals(SignalUpdate::dtr_rts(false, false))
    }
}

/// `io::Read` adapter over a [Transport], bounded by a deadline
///
/// Timeouts surface as `io::ErrorKind::TimedOut`, which the SLIP decoder
/// passes through as a read error.
pub(crate) struct TimedReader<'a> {
    transport: &'a mut dyn Transport,
    deadline: Instant,
}

impl<'a> TimedReader<'a> {
    pub fn new(transport: &'a mut dyn Transport, timeout: Duration) -> Self {
        Self {
            transport,
            deadline: Instant::now() + timeout,
        }
    }
}

impl Read for TimedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self
            .deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::TimedOut))?;

        match self.transport.read(buf, remaining) {
            Ok(0) => Err(std::io::ErrorKind::TimedOut.into()),
            Ok(n) => Ok(n),
            Err(ConnectionError::Timeout(_)) => Err(std::io::ErrorKind::TimedOut.into()),
            Err(_) => Err(std::io::ErrorKind::Other.into()),
        }
    }
}
