use crate::targets::{
    ChipDescriptor, EfuseField, RtcWdtRegisters, SpiRegisters, CHIP_DETECT_MAGIC_REG_ADDR,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[
    0x6F51_306F, // ECO0
    0x7C41_A06F, // ECO1
];

pub(crate) const DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    name: "ESP32-C2",
    chip_id: Some(12),
    bootloader_offset: 0x0,
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    uart_date_reg: CHIP_DETECT_MAGIC_REG_ADDR,
    spi: SpiRegisters {
        base: 0x6000_2000,
        usr_offset: 0x18,
        usr1_offset: 0x1C,
        usr2_offset: 0x20,
        w0_offset: 0x58,
        mosi_length_offset: Some(0x24),
        miso_length_offset: Some(0x28),
    },
    efuse_base: 0x6000_8800,
    mac_efuse_words: (16, 17),
    rev_major: EfuseField::new(17, 20, 0x3),
    rev_minor: EfuseField::new(17, 16, 0xF),
    rev_minor_hi: None,
    rtc_wdt: Some(RtcWdtRegisters {
        protect: 0x6000_80A8,
        config0: 0x6000_8090,
        config1: 0x6000_8094,
        write_key: 0x50D8_3AA1,
    }),
    uartdev_buf_no: None,
    usb_otg_sentinel: None,
    usb_jtag_sentinel: None,
    rtc_option1_reg: None,
    force_download_boot_mask: 0,
    gpio_strap_reg: Some(0x6000_4038),
};
