use crate::targets::{
    ChipDescriptor, EfuseField, RtcWdtRegisters, SpiRegisters, CHIP_DETECT_MAGIC_REG_ADDR,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x00F0_1D83];

pub(crate) const DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    name: "ESP32",
    chip_id: Some(0),
    bootloader_offset: 0x1000,
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    uart_date_reg: CHIP_DETECT_MAGIC_REG_ADDR,
    spi: SpiRegisters {
        base: 0x3FF4_2000,
        usr_offset: 0x1C,
        usr1_offset: 0x20,
        usr2_offset: 0x24,
        w0_offset: 0x80,
        mosi_length_offset: Some(0x28),
        miso_length_offset: Some(0x2C),
    },
    efuse_base: 0x3FF5_A000,
    mac_efuse_words: (1, 2),
    rev_major: EfuseField::new(3, 15, 0x1),
    rev_minor: EfuseField::new(5, 24, 0x3),
    rev_minor_hi: None,
    rtc_wdt: Some(RtcWdtRegisters {
        protect: 0x3FF4_80A4,
        config0: 0x3FF4_808C,
        config1: 0x3FF4_8090,
        write_key: 0x50D8_3AA1,
    }),
    uartdev_buf_no: None,
    usb_otg_sentinel: None,
    usb_jtag_sentinel: None,
    rtc_option1_reg: None,
    force_download_boot_mask: 0,
    gpio_strap_reg: Some(0x3FF4_4038),
};
