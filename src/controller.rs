//! Abstract NVM controller interface.
//!
//! Everything above this module talks to the flash controller through the
//! [`Controller`] trait, so the engines run the same against the hardware
//! registers and against [`SimController`](crate::sim::SimController).
use std::ops::{Deref, DerefMut};

use bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::constants::option_offsets;
use crate::protection::{RdpLevel, WrpArea};

bitfield! {
    /// Flash status register (SR).
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct Status(u32);
    impl Debug;
    pub eop, set_eop: 0;
    pub operr, set_operr: 1;
    pub progerr, set_progerr: 3;
    pub wrperr, set_wrperr: 4;
    pub pgaerr, set_pgaerr: 5;
    pub sizerr, set_sizerr: 6;
    pub pgserr, set_pgserr: 7;
    pub misserr, set_misserr: 8;
    pub fasterr, set_fasterr: 9;
    pub rderr, set_rderr: 14;
    pub optverr, set_optverr: 15;
    pub bsy, set_bsy: 16;
    pub cfgbsy, set_cfgbsy: 18;
    pub pesd, set_pesd: 19;
}

impl Status {
    /// Error flags cleared before every program, erase or option operation.
    pub const ALL_ERRORS: u32 = (1 << 1)
        | (1 << 3)
        | (1 << 4)
        | (1 << 5)
        | (1 << 6)
        | (1 << 7)
        | (1 << 8)
        | (1 << 9)
        | (1 << 14)
        | (1 << 15);

    pub fn has_errors(&self) -> bool {
        self.0 & Self::ALL_ERRORS != 0
    }

    pub fn errors(&self) -> Status {
        Status(self.0 & Self::ALL_ERRORS)
    }

    pub fn clear_errors(&mut self) {
        self.0 &= !Self::ALL_ERRORS;
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        value.0
    }
}

bitfield! {
    /// User and read protection option register (OPTR).
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Optr(u32);
    impl Debug;
    pub u8, rdp, set_rdp: 7, 0;
    pub u8, esel, set_esel: 8, 8;
    pub u8, bor_lev, set_bor_lev: 11, 9;
    pub nrst_stop, set_nrst_stop: 12;
    pub nrst_stdby, set_nrst_stdby: 13;
    pub nrst_shdw, set_nrst_shdw: 14;
    pub iwdg_sw, set_iwdg_sw: 16;
    pub wwdg_sw, set_wwdg_sw: 19;
    pub boot_lock, set_boot_lock: 30;
    pub c2_boot_lock, set_c2_boot_lock: 31;
}

impl From<u32> for Optr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Optr> for u32 {
    fn from(value: Optr) -> Self {
        value.0
    }
}

bitfield! {
    /// Write protection area register (WRP1AR / WRP1BR).
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct WrpAreaRegister(u32);
    impl Debug;
    pub u8, start, set_start: 6, 0;
    pub u8, end, set_end: 22, 16;
}

impl WrpAreaRegister {
    pub fn new(start: u8, end: u8) -> Self {
        let mut reg = WrpAreaRegister(0);
        reg.set_start(start);
        reg.set_end(end);
        reg
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether `page` falls inside the area. An area whose start is above
    /// its end protects nothing.
    pub fn protects(&self, page: u16) -> bool {
        let (start, end) = (u16::from(self.start()), u16::from(self.end()));
        start <= end && (start..=end).contains(&page)
    }
}

impl From<u32> for WrpAreaRegister {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Option registers mirrored in the option-byte area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OptionRegister {
    Optr,
    Pcrop1Asr,
    Pcrop1Aer,
    Wrp1Ar,
    Wrp1Br,
    Pcrop1Bsr,
    Pcrop1Ber,
    Ipccbr,
}

impl OptionRegister {
    pub const ALL: [OptionRegister; 8] = [
        OptionRegister::Optr,
        OptionRegister::Pcrop1Asr,
        OptionRegister::Pcrop1Aer,
        OptionRegister::Wrp1Ar,
        OptionRegister::Wrp1Br,
        OptionRegister::Pcrop1Bsr,
        OptionRegister::Pcrop1Ber,
        OptionRegister::Ipccbr,
    ];

    /// Byte offset of the register inside the option-byte area.
    pub const fn offset(self) -> usize {
        match self {
            OptionRegister::Optr => option_offsets::OPTR,
            OptionRegister::Pcrop1Asr => option_offsets::PCROP1ASR,
            OptionRegister::Pcrop1Aer => option_offsets::PCROP1AER,
            OptionRegister::Wrp1Ar => option_offsets::WRP1AR,
            OptionRegister::Wrp1Br => option_offsets::WRP1BR,
            OptionRegister::Pcrop1Bsr => option_offsets::PCROP1BSR,
            OptionRegister::Pcrop1Ber => option_offsets::PCROP1BER,
            OptionRegister::Ipccbr => option_offsets::IPCCBR,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            OptionRegister::Optr => "OPTR",
            OptionRegister::Pcrop1Asr => "PCROP1ASR",
            OptionRegister::Pcrop1Aer => "PCROP1AER",
            OptionRegister::Wrp1Ar => "WRP1AR",
            OptionRegister::Wrp1Br => "WRP1BR",
            OptionRegister::Pcrop1Bsr => "PCROP1BSR",
            OptionRegister::Pcrop1Ber => "PCROP1BER",
            OptionRegister::Ipccbr => "IPCCBR",
        }
    }
}

/// A single option-byte change programmed through the controller's option
/// mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionProgram {
    Rdp(RdpLevel),
    Wrp { area: WrpArea, start: u8, end: u8 },
}

/// Abstraction of the NVM controller.
///
/// Primitives report the error flags raised by the controller as the
/// `Err` value.
pub trait Controller {
    fn unlock(&mut self);
    fn lock(&mut self);
    fn is_locked(&self) -> bool;
    fn unlock_options(&mut self);
    fn lock_options(&mut self);
    fn options_locked(&self) -> bool;

    fn status(&mut self) -> Status;
    fn clear_errors(&mut self);

    /// Program one double word. `address` must be 8-byte aligned.
    fn program_double_word(&mut self, address: u32, data: u64) -> Result<(), Status>;
    fn erase_page(&mut self, page: u16) -> Result<(), Status>;
    fn mass_erase(&mut self) -> Result<(), Status>;

    /// Read a byte of any mapped memory, `None` when nothing is mapped there.
    fn read_byte(&self, address: u32) -> Option<u8>;

    fn read_option(&self, register: OptionRegister) -> u32;
    fn write_option(&mut self, register: OptionRegister, value: u32);
    fn program_option(&mut self, request: OptionProgram) -> Result<(), Status>;
    /// Set OPTSTRT.
    fn start_option_commit(&mut self);
    /// Set OBL_LAUNCH, reloading the option bytes.
    fn launch_options(&mut self);

    fn system_reset(&mut self) -> !;
}

/// Controller with program/erase access unlocked. Locks again when dropped.
pub struct Unlocked<'a> {
    controller: &'a mut dyn Controller,
}

impl<'a> Unlocked<'a> {
    pub fn new(controller: &'a mut dyn Controller) -> Self {
        controller.unlock();
        Unlocked { controller }
    }
}

impl<'a> Deref for Unlocked<'a> {
    type Target = dyn Controller + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.controller
    }
}

impl<'a> DerefMut for Unlocked<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.controller
    }
}

impl Drop for Unlocked<'_> {
    fn drop(&mut self) {
        self.controller.lock();
    }
}

/// Controller with both program/erase and option register access unlocked.
/// Relocks the options, then the controller, when dropped.
pub struct OptionsUnlocked<'a> {
    controller: &'a mut dyn Controller,
}

impl<'a> OptionsUnlocked<'a> {
    pub fn new(controller: &'a mut dyn Controller) -> Self {
        controller.unlock();
        controller.unlock_options();
        OptionsUnlocked { controller }
    }
}

impl<'a> Deref for OptionsUnlocked<'a> {
    type Target = dyn Controller + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.controller
    }
}

impl<'a> DerefMut for OptionsUnlocked<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.controller
    }
}

impl Drop for OptionsUnlocked<'_> {
    fn drop(&mut self) {
        self.controller.lock_options();
        self.controller.lock();
    }
}
