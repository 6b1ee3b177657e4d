/// Programming unit of the flash controller, one double word.
pub const PROG_UNIT_SIZE: usize = 8;

/// Value of an erased flash cell.
pub const ERASED_BYTE: u8 = 0xff;

/// Highest page index a WRP area register can hold (7-bit fields).
pub const WRP_MAX_PAGE: u16 = 0x7f;

/// Default number of status polls before a stalled option commit resets the device.
pub const DEFAULT_OPTION_TIMEOUT: u32 = 0x0010_0000;

/// Page-count sentinels of an erase request.
pub mod erase {
    pub const MASS: u16 = 0xffff;
    pub const BANK1: u16 = 0xfffe;
    pub const BANK2: u16 = 0xfffd;
}

/// RDP byte values in OPTR[7:0].
pub mod rdp {
    pub const LEVEL_0: u8 = 0xaa;
    pub const LEVEL_1: u8 = 0xbb;
    pub const LEVEL_2: u8 = 0xcc;
}

/// Byte offsets of the option registers inside the option-byte area.
pub mod option_offsets {
    pub const OPTR: usize = 0;
    pub const PCROP1ASR: usize = 8;
    pub const PCROP1AER: usize = 16;
    pub const WRP1AR: usize = 24;
    pub const WRP1BR: usize = 32;
    pub const PCROP1BSR: usize = 40;
    pub const PCROP1BER: usize = 48;
    pub const IPCCBR: usize = 104;
}
