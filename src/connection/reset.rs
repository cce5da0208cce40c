//! Strategies for driving a target into download or firmware mode
//!
//! Adapters with EN/IO0 wired to DTR/RTS get the classic pulse sequences.
//! Chips talking through their own USB peripheral ignore those lines, so
//! they are rebooted by arming the RTC watchdog instead; on USB-OTG parts
//! the force-download-boot latch must be cleared first or the chip falls
//! straight back into the ROM loader. A watchdog (or hard) reset of a
//! native-USB chip tears down the USB device, which the session reports
//! as a port-will-change event before touching anything.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{
    command::Command,
    connection::{Connection, Mode},
    error::Error,
    interface::{SignalUpdate, Transport, USB_SERIAL_JTAG_PID},
    targets::Chip,
};

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 500; // ms

/// Watchdog stage budget armed before the forced reboot
const WDT_RESET_STAGE_MS: u32 = 2000;
/// RTC slow-clock ticks per millisecond, nominal 90 kHz RC oscillator
const RTC_SLOW_CLK_TICKS_PER_MS: u32 = 90;

/// What to do with the device once an operation completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetAfterOperation {
    /// Reset into firmware via the appropriate strategy
    #[default]
    HardReset,
    /// Ask the loader to start the user code itself
    SoftReset,
    /// Leave the device in the bootloader
    NoReset,
    /// Leave the device in the flasher stub
    NoResetNoStub,
}

/// How the chip reaches the host, as revealed by the ROM .bss probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMode {
    /// An external UART bridge; DTR/RTS are (presumably) wired up
    ExternalUart,
    /// The on-chip USB-OTG peripheral
    UsbOtg,
    /// The on-chip USB-JTAG/Serial peripheral
    UsbJtagSerial,
}

/// Some strategy for resetting a target device through the serial lines
pub trait ResetStrategy {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error>;

    fn set_dtr(&self, transport: &mut dyn Transport, level: bool) -> Result<(), Error> {
        transport.set_signals(SignalUpdate::dtr(level))?;
        Ok(())
    }

    fn set_rts(&self, transport: &mut dyn Transport, level: bool) -> Result<(), Error> {
        transport.set_signals(SignalUpdate::rts(level))?;
        Ok(())
    }

    fn set_dtr_rts(
        &self,
        transport: &mut dyn Transport,
        dtr: bool,
        rts: bool,
    ) -> Result<(), Error> {
        transport.set_dtr_rts(dtr, rts)?;
        Ok(())
    }
}

/// Classic reset sequence, sets DTR and RTS sequentially
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!("Using classic reset strategy with delay of {}ms", self.delay);

        self.set_rts(transport, false)?;
        self.set_dtr(transport, false)?;

        // Don't-care pass through both-high, so inverting and
        // non-inverting adapter wirings end up in the same state
        self.set_rts(transport, true)?;
        self.set_dtr(transport, true)?;

        self.set_rts(transport, true)?; // EN = LOW, chip in reset
        self.set_dtr(transport, false)?; // IO0 = HIGH

        sleep(Duration::from_millis(100));

        self.set_rts(transport, false)?; // EN = HIGH, chip out of reset
        self.set_dtr(transport, true)?; // IO0 = LOW

        sleep(Duration::from_millis(self.delay));

        self.set_rts(transport, false)?;
        self.set_dtr(transport, false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// UNIX-only variant which flips DTR and RTS in the same ioctl, avoiding
/// the window where only one line has moved
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct UnixTightReset {
    delay: u64,
}

#[cfg(unix)]
impl UnixTightReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

#[cfg(unix)]
impl ResetStrategy for UnixTightReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!(
            "Using UnixTight reset strategy with delay of {}ms",
            self.delay
        );

        self.set_dtr_rts(transport, false, false)?;
        self.set_dtr_rts(transport, true, true)?;
        self.set_dtr_rts(transport, false, true)?; // IO0 = HIGH, EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        self.set_dtr_rts(transport, true, false)?; // IO0 = LOW, EN = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        self.set_dtr_rts(transport, false, false)?; // IO0 = HIGH, done
        self.set_dtr(transport, false)?; // Needed in some environments to ensure IO0 = HIGH

        Ok(())
    }
}

/// Download-mode entry for the USB-JTAG/Serial peripheral, where DTR and
/// RTS drive an on-chip state machine instead of physical pins
#[derive(Debug, Clone, Copy)]
pub struct UsbJtagSerialReset;

impl ResetStrategy for UsbJtagSerialReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!("Using UsbJtagSerial reset strategy");

        self.set_dtr(transport, false)?; // Idle
        self.set_rts(transport, false)?;

        sleep(Duration::from_millis(100));

        self.set_dtr(transport, true)?; // Set IO0
        self.set_rts(transport, false)?;

        sleep(Duration::from_millis(100));

        self.set_rts(transport, true)?; // Reset. Calls inverted to go through (1,1) instead of (0,0)
        self.set_dtr(transport, false)?;
        self.set_rts(transport, true)?; // RTS set as Windows only propagates DTR on RTS setting

        sleep(Duration::from_millis(100));

        self.set_dtr(transport, false)?;
        self.set_rts(transport, false)?;

        Ok(())
    }
}

/// Firmware-mode reset via the serial lines
#[derive(Debug, Clone, Copy)]
pub struct HardReset;

impl ResetStrategy for HardReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!("Using HardReset strategy");

        if transport.info().pid == USB_SERIAL_JTAG_PID {
            sleep(Duration::from_millis(100));
            self.set_dtr(transport, false)?;
            sleep(Duration::from_millis(100));
            self.set_rts(transport, true)?;
            self.set_dtr(transport, false)?;
            self.set_rts(transport, true)?;
            sleep(Duration::from_millis(100));
            self.set_rts(transport, false)?;
        } else {
            self.set_rts(transport, true)?; // EN = LOW

            sleep(Duration::from_millis(100));

            self.set_rts(transport, false)?;
        }

        Ok(())
    }
}

/// Construct the sequence of reset strategies to try for download-mode
/// entry, based on the host OS and the port identity
pub fn construct_reset_strategy_sequence(pid: u16) -> Vec<Box<dyn ResetStrategy>> {
    // USB-JTAG/Serial mode
    if pid == USB_SERIAL_JTAG_PID {
        return vec![Box::new(UsbJtagSerialReset)];
    }

    // USB-to-Serial bridge
    #[cfg(unix)]
    {
        vec![
            Box::new(UnixTightReset::new(false)),
            Box::new(UnixTightReset::new(true)),
            Box::new(ClassicReset::new(false)),
            Box::new(ClassicReset::new(true)),
        ]
    }

    #[cfg(not(unix))]
    {
        vec![
            Box::new(ClassicReset::new(false)),
            Box::new(ClassicReset::new(true)),
        ]
    }
}

/// Probe how the chip reaches the host
///
/// Reads the ROM's `UARTDEV_BUF_NO` byte (at the revision-resolved address)
/// and compares it against the family's sentinels. Families without a
/// native USB peripheral short-circuit to [UsbMode::ExternalUart].
pub fn probe_usb_mode(connection: &mut Connection, chip: Chip) -> Result<UsbMode, Error> {
    let descriptor = chip.descriptor();

    let Some(address) = chip.uartdev_buf_no(connection.revision()) else {
        return Ok(UsbMode::ExternalUart);
    };

    let uart_no = connection.read_reg(address)? & 0xFF;
    debug!("UARTDEV_BUF_NO = {uart_no}");

    if descriptor.usb_otg_sentinel == Some(uart_no) {
        Ok(UsbMode::UsbOtg)
    } else if descriptor.usb_jtag_sentinel == Some(uart_no) {
        Ok(UsbMode::UsbJtagSerial)
    } else {
        Ok(UsbMode::ExternalUart)
    }
}

/// Force a reboot by arming the RTC watchdog
///
/// Used when DTR/RTS are not electrically connected to EN/IO0, which is
/// the case whenever the chip's own USB peripheral is the transport. The
/// port handle becomes invalid; a port-will-change event fires before the
/// registers are touched.
pub fn wdt_reset(connection: &mut Connection, chip: Chip) -> Result<(), Error> {
    let descriptor = chip.descriptor();

    if descriptor.usb_otg_sentinel.is_none() && descriptor.usb_jtag_sentinel.is_none() {
        return Err(Error::NotSupported {
            chip,
            operation: "watchdog reset",
        });
    }
    let Some(wdt) = descriptor.rtc_wdt else {
        return Err(Error::NotSupported {
            chip,
            operation: "watchdog reset",
        });
    };

    debug!("Resetting {chip} via RTC watchdog");
    connection.port_will_change();

    // Unlock, arm a single ~2 s stage with a system reset action, re-lock
    connection.write_reg(wdt.protect, wdt.write_key, None)?;
    connection.write_reg(
        wdt.config1,
        WDT_RESET_STAGE_MS * RTC_SLOW_CLK_TICKS_PER_MS,
        None,
    )?;
    // Enable, stage0 = reset system
    connection.write_reg(wdt.config0, (1 << 31) | (3 << 28), None)?;
    connection.write_reg(wdt.protect, 0, None)?;

    Ok(())
}

/// Reset a USB-OTG chip into firmware
///
/// The ROM latches "force download boot" in RTC_CNTL_OPTION1 when the
/// download mode was entered over USB-OTG; unless the latch is cleared the
/// watchdog reboot lands right back in the ROM loader.
pub fn usb_otg_reset(connection: &mut Connection, chip: Chip) -> Result<(), Error> {
    let descriptor = chip.descriptor();

    if let Some(option1) = descriptor.rtc_option1_reg {
        let value = connection.read_reg(option1)?;
        connection.write_reg(
            option1,
            value & !descriptor.force_download_boot_mask,
            None,
        )?;
    }

    wdt_reset(connection, chip)
}

/// Reset into firmware using whatever strategy the wiring calls for
pub fn reset_to_firmware(connection: &mut Connection, chip: Chip) -> Result<(), Error> {
    match probe_usb_mode(connection, chip)? {
        UsbMode::ExternalUart => {
            if connection.will_reenumerate() {
                connection.port_will_change();
            }
            HardReset.reset(connection.transport())
        }
        UsbMode::UsbJtagSerial => wdt_reset(connection, chip),
        UsbMode::UsbOtg => usb_otg_reset(connection, chip),
    }
}

/// Ask the loader itself to leave download mode
///
/// With `stay_in_bootloader` the loader is parked instead, which survives
/// without any pin wiggling at all.
pub fn soft_reset(connection: &mut Connection, stay_in_bootloader: bool) -> Result<(), Error> {
    debug!("Soft resetting (stay_in_bootloader: {stay_in_bootloader})");

    if stay_in_bootloader && connection.mode() == Mode::Rom {
        // Already exactly where we want to be
        return Ok(());
    }

    connection.command(Command::FlashBegin {
        size: 0,
        blocks: 0,
        block_size: connection.mode().flash_write_size() as u32,
        offset: 0,
        supports_encryption: false,
    })?;
    connection.command(Command::FlashEnd {
        reboot: !stay_in_bootloader,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::LoopbackTransport;

    #[test]
    fn wdt_reset_requires_usb_sentinels() {
        for chip in [Chip::Esp8266, Chip::Esp32] {
            let mut connection = Connection::new(Box::new(LoopbackTransport::new()));
            let err = wdt_reset(&mut connection, chip).unwrap_err();
            assert!(matches!(err, Error::NotSupported { .. }), "{chip}");
        }
    }

    #[test]
    fn wdt_reset_unlocks_arms_and_relocks() {
        use crate::command::CommandType;

        let mut transport = LoopbackTransport::new();
        for _ in 0..4 {
            transport.push_response(CommandType::WriteReg as u8, 0, &[], 2);
        }

        let mut connection = Connection::new(Box::new(transport));
        wdt_reset(&mut connection, Chip::Esp32c3).unwrap();
        assert!(connection.reconnect_pending());
    }

    #[test]
    fn jtag_strategy_is_selected_by_pid() {
        let sequence = construct_reset_strategy_sequence(USB_SERIAL_JTAG_PID);
        assert_eq!(sequence.len(), 1);

        let sequence = construct_reset_strategy_sequence(0x6010);
        assert!(sequence.len() >= 2);
    }
}
