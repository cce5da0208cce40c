use crate::targets::{
    ChipDescriptor, EfuseField, RtcWdtRegisters, SpiRegisters, CHIP_DETECT_MAGIC_REG_ADDR,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0, 0x0ADD_BAD0];

/// `UARTDEV_BUF_NO` address on production silicon (revision >= v3.0)
pub(crate) const UARTDEV_BUF_NO: u32 = 0x4FF3_FEC8;
/// `UARTDEV_BUF_NO` address on the RC1 engineering samples
pub(crate) const UARTDEV_BUF_NO_RC1: u32 = 0x4FF3_FF0C;

pub(crate) const DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    name: "ESP32-P4",
    chip_id: Some(18),
    bootloader_offset: 0x2000,
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    uart_date_reg: CHIP_DETECT_MAGIC_REG_ADDR,
    spi: SpiRegisters {
        base: 0x5008_D000,
        usr_offset: 0x18,
        usr1_offset: 0x1C,
        usr2_offset: 0x20,
        w0_offset: 0x58,
        mosi_length_offset: Some(0x24),
        miso_length_offset: Some(0x28),
    },
    efuse_base: 0x5012_D000,
    mac_efuse_words: (17, 18),
    rev_major: EfuseField::new(19, 4, 0x3),
    rev_minor: EfuseField::new(19, 0, 0xF),
    rev_minor_hi: None,
    rtc_wdt: Some(RtcWdtRegisters {
        protect: 0x5011_6018,
        config0: 0x5011_6000,
        config1: 0x5011_6004,
        write_key: 0x50D8_3AA1,
    }),
    uartdev_buf_no: Some(UARTDEV_BUF_NO),
    usb_otg_sentinel: Some(5),
    usb_jtag_sentinel: Some(6),
    rtc_option1_reg: Some(0x5011_0008),
    force_download_boot_mask: 0x1,
    gpio_strap_reg: Some(0x500E_0038),
};
