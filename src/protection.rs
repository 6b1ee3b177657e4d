//! Write protection areas and read-out protection level.

use std::fmt;

use crate::constants::rdp;
use crate::controller::{Controller, OptionProgram, OptionRegister, Optr, OptionsUnlocked};
use crate::deferred::Completion;
use crate::device::FlashGeometry;
use crate::error::{Error, Result};

/// Requested write protection state, as sent by the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpState {
    Disable,
    Enable,
}

impl TryFrom<u8> for WpState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(WpState::Disable),
            1 => Ok(WpState::Enable),
            other => Err(Error::InvalidState(other)),
        }
    }
}

/// The two write protection slots of bank 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrpArea {
    A,
    B,
}

impl WrpArea {
    pub const fn register(self) -> OptionRegister {
        match self {
            WrpArea::A => OptionRegister::Wrp1Ar,
            WrpArea::B => OptionRegister::Wrp1Br,
        }
    }
}

/// Read-out protection level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RdpLevel {
    /// No protection
    Level0,
    /// Memory read protection
    Level1,
    /// Full chip protection, irreversible
    Level2,
}

impl RdpLevel {
    /// Decode the OPTR RDP byte. Anything but the level 0 and level 2 keys
    /// reads as level 1.
    pub fn from_optr(optr: u32) -> Self {
        match Optr::from(optr).rdp() {
            rdp::LEVEL_0 => RdpLevel::Level0,
            rdp::LEVEL_2 => RdpLevel::Level2,
            _ => RdpLevel::Level1,
        }
    }

    pub const fn to_byte(self) -> u8 {
        match self {
            RdpLevel::Level0 => rdp::LEVEL_0,
            RdpLevel::Level1 => rdp::LEVEL_1,
            RdpLevel::Level2 => rdp::LEVEL_2,
        }
    }
}

impl TryFrom<u8> for RdpLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            rdp::LEVEL_0 => Ok(RdpLevel::Level0),
            rdp::LEVEL_1 => Ok(RdpLevel::Level1),
            rdp::LEVEL_2 => Ok(RdpLevel::Level2),
            other => Err(Error::InvalidRdpLevel(other)),
        }
    }
}

impl fmt::Display for RdpLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RdpLevel::Level0 => write!(f, "level 0 (no protection)"),
            RdpLevel::Level1 => write!(f, "level 1 (memory read protection)"),
            RdpLevel::Level2 => write!(f, "level 2 (full chip protection)"),
        }
    }
}

/// Enable or disable the write protection areas of bank 1.
///
/// `pages` is `[a_start, a_end, b_start, b_end]`: area A is written when at
/// least two bytes are given, area B when at least four are. Disabling
/// ignores `pages` and clears both areas.
///
/// A failed option program still leaves the option reload due, see
/// [`Error::completion`].
pub fn set_write_protection(
    controller: &mut dyn Controller,
    geometry: &FlashGeometry,
    state: WpState,
    pages: &[u8],
) -> Result<Completion> {
    match state {
        WpState::Enable => enable_write_protection(controller, geometry, pages)?,
        WpState::Disable => disable_write_protection(controller, geometry)?,
    }
    Ok(Completion::ReloadOptions)
}

fn enable_write_protection(
    controller: &mut dyn Controller,
    geometry: &FlashGeometry,
    pages: &[u8],
) -> Result<()> {
    let areas: Vec<(WrpArea, u8, u8)> = [WrpArea::A, WrpArea::B]
        .into_iter()
        .zip(pages.chunks_exact(2))
        .map(|(area, pair)| (area, pair[0], pair[1]))
        .collect();

    for &(_, start, end) in &areas {
        for page in [start, end] {
            if u16::from(page) > geometry.max_page {
                return Err(Error::PageOutOfRange {
                    page: page.into(),
                    max: geometry.max_page,
                });
            }
        }
    }

    program_areas(controller, areas)?;
    log::info!("Write protection enabled");
    Ok(())
}

fn disable_write_protection(controller: &mut dyn Controller, geometry: &FlashGeometry) -> Result<()> {
    // (max page, 0) is the hardware encoding of an empty area
    let start = geometry.max_page_byte();

    program_areas(controller, [(WrpArea::A, start, 0), (WrpArea::B, start, 0)])?;
    log::info!("Write protection disabled");
    Ok(())
}

/// Program every area, even past a failing one. The first failure is
/// reported.
fn program_areas(
    controller: &mut dyn Controller,
    areas: impl IntoIterator<Item = (WrpArea, u8, u8)>,
) -> Result<()> {
    let mut options = OptionsUnlocked::new(controller);
    options.clear_errors();

    let mut failure = None;
    for (area, start, end) in areas {
        log::debug!("WRP area {:?}: pages {}..={}", area, start, end);
        if let Err(status) = options.program_option(OptionProgram::Wrp { area, start, end }) {
            log::warn!("Programming WRP area {:?} failed: {:?}", area, status);
            failure = failure.or(Some(status));
        }
    }

    match failure {
        Some(status) => Err(Error::OptionProgram { status }),
        None => Ok(()),
    }
}

/// Current read-out protection level, from the option snapshot.
pub fn read_protection(controller: &dyn Controller) -> RdpLevel {
    RdpLevel::from_optr(controller.read_option(OptionRegister::Optr))
}

/// Program a new read-out protection level.
///
/// Level 2 can never be set through the bootloader. Asking for it leaves
/// the controller untouched and reports no error.
pub fn set_read_protection(controller: &mut dyn Controller, level: RdpLevel) -> Result<Completion> {
    if level == RdpLevel::Level2 {
        log::warn!("Ignoring request for RDP {}", level);
        return Ok(Completion::Done);
    }

    let mut options = OptionsUnlocked::new(controller);
    options.clear_errors();
    options
        .program_option(OptionProgram::Rdp(level))
        .map_err(|status| Error::OptionProgram { status })?;

    log::info!("RDP set to {}", level);
    Ok(Completion::ReloadOptions)
}
