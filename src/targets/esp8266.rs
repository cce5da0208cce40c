use crate::targets::{ChipDescriptor, EfuseField, SpiRegisters, CHIP_DETECT_MAGIC_REG_ADDR};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0xFFF0_C101];

pub(crate) const DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    name: "ESP8266",
    chip_id: None,
    bootloader_offset: 0x0,
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    uart_date_reg: CHIP_DETECT_MAGIC_REG_ADDR,
    spi: SpiRegisters {
        base: 0x6000_0200,
        usr_offset: 0x1C,
        usr1_offset: 0x20,
        usr2_offset: 0x24,
        w0_offset: 0x40,
        mosi_length_offset: None,
        miso_length_offset: None,
    },
    efuse_base: 0x3FF0_0050,
    mac_efuse_words: (0, 1),
    // The ESP8266 has no readable revision fields
    rev_major: EfuseField::new(0, 0, 0),
    rev_minor: EfuseField::new(0, 0, 0),
    rev_minor_hi: None,
    rtc_wdt: None,
    uartdev_buf_no: None,
    usb_otg_sentinel: None,
    usb_jtag_sentinel: None,
    rtc_option1_reg: None,
    force_download_boot_mask: 0,
    gpio_strap_reg: None,
};
