//! Raw USB-bulk backing for platforms without serial enumeration
//!
//! On Android-class hosts the usual serial stack is unavailable and the
//! bridge chip (or the chip's own USB peripheral) must be driven directly
//! over bulk endpoints. The per-bridge initialization (line coding, baud
//! divisors, modem-control requests) lives here so that the rest of the
//! library sees the same [Transport] contract as the native serial path.

use std::{collections::VecDeque, time::Duration};

use log::debug;
use rusb::{Context, DeviceHandle, Direction, TransferType, UsbContext};

use crate::{
    error::ConnectionError,
    interface::{PortInfo, SignalUpdate, Transport},
};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

// requestType fields: vendor/class, host-to-device, device/interface recipient
const REQTYPE_VENDOR_OUT: u8 = 0x40;
const REQTYPE_CLASS_INTERFACE_OUT: u8 = 0x21;

/// The USB-to-serial bridge families we know how to program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// Plain CDC-ACM, which includes the on-chip USB-OTG and
    /// USB-JTAG/Serial peripherals
    CdcAcm,
    Ftdi,
    Ch34x,
    Cp210x,
}

impl BridgeKind {
    /// Classify a bridge by its vendor id
    pub fn from_ids(vid: u16, _pid: u16) -> Self {
        match vid {
            0x0403 => BridgeKind::Ftdi,
            0x1A86 | 0x4348 => BridgeKind::Ch34x,
            0x10C4 => BridgeKind::Cp210x,
            _ => BridgeKind::CdcAcm,
        }
    }
}

/// Compute the FTDI baud divisor for a 3 MHz base clock
///
/// Returns the `(value, index)` pair of the SIO_SET_BAUDRATE control
/// request: a 14-bit integer divisor with a 3-bit sub-integer selected by
/// fraction buckets.
pub fn ftdi_baud_divisor(baud: u32) -> (u16, u16) {
    const BASE_CLOCK: f64 = 3_000_000.0;
    // Bucket edges for the 3-bit sub-integer part
    const FRACTION_EDGES: [f64; 7] = [0.0625, 0.1875, 0.3125, 0.4375, 0.5625, 0.6875, 0.8125];

    let divisor = BASE_CLOCK / baud as f64;
    let integer = divisor as u32;
    let fraction = divisor - integer as f64;

    let sub_integer = FRACTION_EDGES
        .iter()
        .position(|edge| fraction < *edge)
        .unwrap_or(FRACTION_EDGES.len()) as u32;

    let value = (integer & 0xFF) | (sub_integer << 14) | (((integer >> 8) & 0x3F) << 8);
    let index = (integer >> 14) & 0x03;

    (value as u16, index as u16)
}

/// Compute the CH34x split baud registers
///
/// The pair is written through vendor request 0x9A, first to register pair
/// 0x1312 and then to 0x0F2C.
pub fn ch34x_baud_registers(baud: u32) -> Result<(u16, u16), ConnectionError> {
    const BAUDBASE_FACTOR: u32 = 1_532_620_800;

    let baud = baud.max(1);
    let mut factor = BAUDBASE_FACTOR / baud;
    let mut divisor: u16 = 3;

    while factor > 0xFFF0 && divisor > 0 {
        factor >>= 3;
        divisor -= 1;
    }
    if factor > 0xFFF0 {
        return Err(ConnectionError::ConnectionFailed);
    }
    let factor = 0x10000 - factor;

    let prescale = ((factor & 0xFF00) as u16) | divisor | 0x0080;
    let modulus = (factor & 0xFF) as u16;
    Ok((prescale, modulus))
}

/// Raw USB transport over a pair of bulk endpoints
pub struct UsbInterface {
    handle: DeviceHandle<Context>,
    info: PortInfo,
    bridge: BridgeKind,
    endpoint_in: u8,
    endpoint_out: u8,
    interface_number: u8,
    baud: u32,
    buffered: VecDeque<u8>,
    dtr: bool,
    rts: bool,
}

impl UsbInterface {
    /// Open the nth device matching `vid:pid` and initialize its bridge
    pub fn open(vid: u16, pid: u16, nth: usize, baud: u32) -> Result<Self, ConnectionError> {
        let context = Context::new().map_err(ConnectionError::from)?;

        let device = context
            .devices()
            .map_err(ConnectionError::from)?
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .map(|desc| desc.vendor_id() == vid && desc.product_id() == pid)
                    .unwrap_or(false)
            })
            .nth(nth)
            .ok_or(ConnectionError::TransportLost)?;

        debug!("Found USB device {:04x}:{:04x}", vid, pid);

        // Find the first interface exposing a bulk IN/OUT pair
        let config = device.config_descriptor(0).map_err(ConnectionError::from)?;
        let mut endpoints = None;
        'outer: for interface in config.interfaces() {
            for descriptor in interface.descriptors() {
                let mut ep_in = None;
                let mut ep_out = None;
                for endpoint in descriptor.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::In => ep_in = Some(endpoint.address()),
                        Direction::Out => ep_out = Some(endpoint.address()),
                    }
                }
                if let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) {
                    endpoints = Some((interface.number(), ep_in, ep_out));
                    break 'outer;
                }
            }
        }
        let (interface_number, endpoint_in, endpoint_out) =
            endpoints.ok_or(ConnectionError::TransportLost)?;

        let handle = device.open().map_err(ConnectionError::from)?;
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle
            .claim_interface(interface_number)
            .map_err(ConnectionError::from)?;

        let mut interface = Self {
            handle,
            info: PortInfo { vid, pid },
            bridge: BridgeKind::from_ids(vid, pid),
            endpoint_in,
            endpoint_out,
            interface_number,
            baud,
            buffered: VecDeque::new(),
            dtr: false,
            rts: false,
        };
        interface.init_bridge()?;

        Ok(interface)
    }

    fn init_bridge(&mut self) -> Result<(), ConnectionError> {
        debug!("Initializing {:?} bridge", self.bridge);

        match self.bridge {
            BridgeKind::CdcAcm => {
                self.cdc_set_line_coding(self.baud)?;
                self.cdc_set_control_lines()?;
            }
            BridgeKind::Ftdi => {
                // SIO_RESET
                self.vendor_out(0x00, 0, 0, &[])?;
                self.ftdi_set_baud(self.baud)?;
                // SIO_SET_DATA: 8N1
                self.vendor_out(0x04, 0x0008, 0, &[])?;
            }
            BridgeKind::Ch34x => {
                // Vendor init request
                self.vendor_out(0xA1, 0, 0, &[])?;
                self.ch34x_set_baud(self.baud)?;
                // LCR: enable RX/TX, 8N1
                self.vendor_out(0x9A, 0x2518, 0x00C3, &[])?;
            }
            BridgeKind::Cp210x => {
                // IFC_ENABLE(1)
                self.class_out(0x00, 0x0001, &[])?;
                // SET_LINE_CTL: 8N1
                self.class_out(0x03, 0x0800, &[])?;
                // SET_MHS: deassert DTR and RTS, mask both
                self.class_out(0x07, 0x0300, &[])?;
                self.cp210x_set_baud(self.baud)?;
            }
        }

        Ok(())
    }

    fn vendor_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), ConnectionError> {
        self.handle
            .write_control(REQTYPE_VENDOR_OUT, request, value, index, data, CONTROL_TIMEOUT)
            .map_err(ConnectionError::from)?;
        Ok(())
    }

    fn class_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), ConnectionError> {
        self.handle
            .write_control(
                REQTYPE_CLASS_INTERFACE_OUT,
                request,
                value,
                self.interface_number as u16,
                data,
                CONTROL_TIMEOUT,
            )
            .map_err(ConnectionError::from)?;
        Ok(())
    }

    fn cdc_set_line_coding(&self, baud: u32) -> Result<(), ConnectionError> {
        // dwDTERate, 1 stop bit, no parity, 8 data bits
        let mut coding = [0u8; 7];
        coding[..4].copy_from_slice(&baud.to_le_bytes());
        coding[6] = 8;
        // SET_LINE_CODING
        self.class_out(0x20, 0, &coding)
    }

    fn cdc_set_control_lines(&self) -> Result<(), ConnectionError> {
        let value = u16::from(self.dtr) | (u16::from(self.rts) << 1);
        // SET_CONTROL_LINE_STATE
        self.class_out(0x22, value, &[])
    }

    fn ftdi_set_baud(&self, baud: u32) -> Result<(), ConnectionError> {
        let (value, index) = ftdi_baud_divisor(baud);
        // SIO_SET_BAUDRATE
        self.vendor_out(0x03, value, index, &[])
    }

    fn ftdi_set_modem_lines(&self) -> Result<(), ConnectionError> {
        // SIO_SET_MODEM_CTRL: high byte is the update mask
        let dtr = 0x0100 | u16::from(self.dtr);
        let rts = 0x0200 | (u16::from(self.rts) << 1);
        self.vendor_out(0x01, dtr, 0, &[])?;
        self.vendor_out(0x01, rts, 0, &[])
    }

    fn ch34x_set_baud(&self, baud: u32) -> Result<(), ConnectionError> {
        let (prescale, modulus) = ch34x_baud_registers(baud)?;
        self.vendor_out(0x9A, 0x1312, prescale, &[])?;
        self.vendor_out(0x9A, 0x0F2C, modulus, &[])
    }

    fn ch34x_set_modem_lines(&self) -> Result<(), ConnectionError> {
        // Active-low modem control bits: DTR = 0x20, RTS = 0x40
        let mut bits = 0u16;
        if self.dtr {
            bits |= 0x20;
        }
        if self.rts {
            bits |= 0x40;
        }
        self.vendor_out(0xA4, !bits & 0x0060, 0, &[])
    }

    fn cp210x_set_baud(&self, baud: u32) -> Result<(), ConnectionError> {
        // IFC_SET_BAUDRATE carries the rate as a little-endian dword
        self.class_out(0x1E, 0, &baud.to_le_bytes())
    }

    fn cp210x_set_modem_lines(&self) -> Result<(), ConnectionError> {
        let bits = u16::from(self.dtr) | (u16::from(self.rts) << 1);
        // SET_MHS with both change masks set
        self.class_out(0x07, bits | 0x0300, &[])
    }

    fn apply_modem_lines(&self) -> Result<(), ConnectionError> {
        match self.bridge {
            BridgeKind::CdcAcm => self.cdc_set_control_lines(),
            BridgeKind::Ftdi => self.ftdi_set_modem_lines(),
            BridgeKind::Ch34x => self.ch34x_set_modem_lines(),
            BridgeKind::Cp210x => self.cp210x_set_modem_lines(),
        }
    }
}

impl Transport for UsbInterface {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ConnectionError> {
        // Drain the carry-over from the previous bulk transfer first
        if !self.buffered.is_empty() {
            let mut n = 0;
            while n < buf.len() {
                match self.buffered.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            return Ok(n);
        }

        let mut chunk = [0u8; 512];
        let read = match self.handle.read_bulk(self.endpoint_in, &mut chunk, timeout) {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        // FTDI prefixes every transfer with two modem-status bytes
        let payload = if self.bridge == BridgeKind::Ftdi {
            &chunk[2.min(read)..read]
        } else {
            &chunk[..read]
        };

        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        self.buffered.extend(&payload[n..]);
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut written = 0;
        while written < data.len() {
            written += self
                .handle
                .write_bulk(self.endpoint_out, &data[written..], Duration::from_secs(5))
                .map_err(ConnectionError::from)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ConnectionError> {
        // Bulk writes are not host-buffered
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), ConnectionError> {
        self.buffered.clear();
        let mut scratch = [0u8; 512];
        while let Ok(n) = self
            .handle
            .read_bulk(self.endpoint_in, &mut scratch, Duration::from_millis(1))
        {
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    fn set_signals(&mut self, signals: SignalUpdate) -> Result<(), ConnectionError> {
        if let Some(dtr) = signals.dtr {
            self.dtr = dtr;
        }
        if let Some(rts) = signals.rts {
            self.rts = rts;
        }
        // Break is only meaningful for CDC
        if let Some(level) = signals.break_condition {
            if self.bridge == BridgeKind::CdcAcm {
                // SEND_BREAK: 0xFFFF starts, 0 stops
                self.class_out(0x23, if level { 0xFFFF } else { 0 }, &[])?;
            }
        }
        self.apply_modem_lines()
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), ConnectionError> {
        match self.bridge {
            BridgeKind::CdcAcm => self.cdc_set_line_coding(baud)?,
            BridgeKind::Ftdi => self.ftdi_set_baud(baud)?,
            BridgeKind::Ch34x => self.ch34x_set_baud(baud)?,
            BridgeKind::Cp210x => self.cp210x_set_baud(baud)?,
        }
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
        let _ = self.handle.release_interface(self.interface_number);
        Ok(())
    }
}

impl Drop for UsbInterface {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ftdi_divisor_for_3mbaud_is_unity() {
        // 3 MHz base / 3 MBd = 1.0: no fraction, no high bits
        let (value, index) = ftdi_baud_divisor(3_000_000);
        assert_eq!(value & 0x3FFF, 1);
        assert_eq!(index, 0);
    }

    #[test]
    fn ftdi_divisor_for_115200() {
        // 3e6 / 115200 = 26.0416...: integer 26, fraction lands in the
        // first bucket (< 0.0625) so the sub-integer is 0
        let (value, index) = ftdi_baud_divisor(115_200);
        assert_eq!(value & 0x00FF, 26);
        assert_eq!(value >> 14, 0);
        assert_eq!(index, 0);
    }

    #[test]
    fn ftdi_divisor_fraction_buckets() {
        // 3e6 / 1333333 = 2.25: fraction 0.25 falls in bucket 2
        let (value, index) = ftdi_baud_divisor(1_333_333);
        assert_eq!(value & 0x00FF, 2);
        assert_eq!((value >> 8) & 0x3F, 0);
        assert_eq!(value >> 14, 2);
        assert_eq!(index, 0);
    }

    #[test]
    fn ch34x_registers_for_common_rates() {
        for baud in [9600, 74880, 115_200, 460_800, 921_600] {
            let (prescale, modulus) = ch34x_baud_registers(baud).unwrap();
            // The divisor lives in the low bits with the mandatory 0x80 set
            assert_ne!(prescale & 0x0080, 0, "baud {baud}");
            assert!(modulus <= 0xFF);
        }
    }

    #[test]
    fn bridge_classification() {
        assert_eq!(BridgeKind::from_ids(0x0403, 0x6010), BridgeKind::Ftdi);
        assert_eq!(BridgeKind::from_ids(0x1A86, 0x7523), BridgeKind::Ch34x);
        assert_eq!(BridgeKind::from_ids(0x10C4, 0xEA60), BridgeKind::Cp210x);
        assert_eq!(BridgeKind::from_ids(0x303A, 0x1001), BridgeKind::CdcAcm);
    }
}
