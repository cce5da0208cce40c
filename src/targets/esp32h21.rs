use crate::targets::{
    ChipDescriptor, EfuseField, RtcWdtRegisters, SpiRegisters, CHIP_DETECT_MAGIC_REG_ADDR,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x6BF7_A651];

pub(crate) const DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    name: "ESP32-H21",
    chip_id: Some(25),
    bootloader_offset: 0x0,
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    uart_date_reg: CHIP_DETECT_MAGIC_REG_ADDR,
    spi: SpiRegisters {
        base: 0x6000_3000,
        usr_offset: 0x18,
        usr1_offset: 0x1C,
        usr2_offset: 0x20,
        w0_offset: 0x58,
        mosi_length_offset: Some(0x24),
        miso_length_offset: Some(0x28),
    },
    efuse_base: 0x600B_0800,
    mac_efuse_words: (17, 18),
    rev_major: EfuseField::new(22, 24, 0x3),
    rev_minor: EfuseField::new(20, 18, 0x7),
    rev_minor_hi: Some(EfuseField::new(22, 23, 0x1)),
    rtc_wdt: Some(RtcWdtRegisters {
        protect: 0x600B_1C18,
        config0: 0x600B_1C00,
        config1: 0x600B_1C04,
        write_key: 0x50D8_3AA1,
    }),
    uartdev_buf_no: Some(0x4084_FF00),
    usb_otg_sentinel: None,
    usb_jtag_sentinel: Some(3),
    rtc_option1_reg: None,
    force_download_boot_mask: 0,
    gpio_strap_reg: Some(0x6009_1038),
};
