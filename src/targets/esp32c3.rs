use crate::targets::{
    ChipDescriptor, EfuseField, RtcWdtRegisters, SpiRegisters, CHIP_DETECT_MAGIC_REG_ADDR,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[
    0x6921_506F, // ECO1 + ECO2
    0x1B31_506F, // ECO3
    0x4881_606F, // ECO6
    0x4361_606F, // ECO7
];

/// `UARTDEV_BUF_NO` address on revisions before ECO7
pub(crate) const UARTDEV_BUF_NO: u32 = 0x3FCD_F07C;
/// ECO7 moved the ROM .bss around
pub(crate) const UARTDEV_BUF_NO_ECO7: u32 = 0x3FCD_F174;

pub(crate) const DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    name: "ESP32-C3",
    chip_id: Some(5),
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
    mac_efuse_words: (17, 18),
    rev_major: EfuseField::new(22, 24, 0x3),
    rev_minor: EfuseField::new(20, 18, 0x7),
    rev_minor_hi: Some(EfuseField::new(22, 23, 0x1)),
    rtc_wdt: Some(RtcWdtRegisters {
        protect: 0x6000_80A8,
        config0: 0x6000_8090,
        config1: 0x6000_8094,
        write_key: 0x50D8_3AA1,
    }),
    uartdev_buf_no: Some(UARTDEV_BUF_NO),
    usb_otg_sentinel: None,
    usb_jtag_sentinel: Some(3),
    rtc_option1_reg: None,
    force_download_boot_mask: 0,
    gpio_strap_reg: Some(0x6000_4038),
};
