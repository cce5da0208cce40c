use crate::targets::{
    ChipDescriptor, EfuseField, RtcWdtRegisters, SpiRegisters, CHIP_DETECT_MAGIC_REG_ADDR,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0000_07C6];

/// Value of `UARTDEV_BUF_NO` when the USB-OTG peripheral is in use
const UARTDEV_BUF_NO_USB_OTG: u32 = 2;

pub(crate) const DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    name: "ESP32-S2",
    chip_id: Some(2),
    bootloader_offset: 0x1000,
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    uart_date_reg: CHIP_DETECT_MAGIC_REG_ADDR,
    spi: SpiRegisters {
        base: 0x3F40_2000,
        usr_offset: 0x18,
        usr1_offset: 0x1C,
        usr2_offset: 0x20,
        w0_offset: 0x58,
        mosi_length_offset: Some(0x24),
        miso_length_offset: Some(0x28),
    },
    efuse_base: 0x3F41_A000,
    mac_efuse_words: (17, 18),
    rev_major: EfuseField::new(20, 18, 0x3),
    rev_minor: EfuseField::new(21, 4, 0x7),
    rev_minor_hi: Some(EfuseField::new(20, 20, 0x1)),
    rtc_wdt: Some(RtcWdtRegisters {
        protect: 0x3F40_80AC,
        config0: 0x3F40_8094,
        config1: 0x3F40_8098,
        write_key: 0x50D8_3AA1,
    }),
    uartdev_buf_no: Some(0x3FFF_FD14),
    usb_otg_sentinel: Some(UARTDEV_BUF_NO_USB_OTG),
    usb_jtag_sentinel: None,
    rtc_option1_reg: Some(0x3F40_8128),
    force_download_boot_mask: 0x1,
    gpio_strap_reg: Some(0x3F40_4038),
};
