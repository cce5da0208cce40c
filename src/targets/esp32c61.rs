use crate::targets::{
    ChipDescriptor, EfuseField, RtcWdtRegisters, SpiRegisters, CHIP_DETECT_MAGIC_REG_ADDR,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x33F0_206F, 0x2421_606F];

pub(crate) const DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    name: "ESP32-C61",
    chip_id: Some(20),
    bootloader_offset: 0x2000,
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
    efuse_base: 0x600B_4800,
    mac_efuse_words: (17, 18),
    rev_major: EfuseField::new(22, 23, 0x3),
    rev_minor: EfuseField::new(22, 16, 0xF),
    rev_minor_hi: None,
    rtc_wdt: Some(RtcWdtRegisters {
        protect: 0x600B_2818,
        config0: 0x600B_2800,
        config1: 0x600B_2804,
        write_key: 0x50D8_3AA1,
    }),
    uartdev_buf_no: Some(0x4085_F5DC),
    usb_otg_sentinel: None,
    usb_jtag_sentinel: Some(3),
    rtc_option1_reg: None,
    force_download_boot_mask: 0,
    gpio_strap_reg: Some(0x6009_1038),
};
