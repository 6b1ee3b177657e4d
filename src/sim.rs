//! Simulated NVM controller.
//!
//! Keeps the flash, OTP and option registers in memory and enforces the
//! same contracts as the hardware: locked controllers refuse to program,
//! a double word must be erased before it is programmed, OTP is never
//! erased, write protected pages reject program and erase, and option
//! values only take effect after an option launch. Busy and suspend flags
//! can be held for a number of polls, or forever, to exercise the bounded
//! waits.
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::ERASED_BYTE;
use crate::controller::{Controller, OptionProgram, OptionRegister, Optr, Status, WrpAreaRegister};
use crate::device::Device;
use crate::region::{Descriptor, MemoryKind};

/// Panic payload of [`SimController::system_reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemReset;

/// How long a status flag stays set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hold {
    #[default]
    Clear,
    /// Set for the given number of polls
    Polls(u32),
    Stuck,
}

impl Hold {
    /// Consume one poll, returning whether the flag reads as set.
    fn poll(&mut self) -> bool {
        match *self {
            Hold::Clear => false,
            Hold::Polls(0) => {
                *self = Hold::Clear;
                false
            }
            Hold::Polls(n) => {
                *self = Hold::Polls(n - 1);
                true
            }
            Hold::Stuck => true,
        }
    }
}

/// Everything the simulator saw, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    pub unlocks: usize,
    pub locks: usize,
    pub option_unlocks: usize,
    pub option_locks: usize,
    pub error_clears: usize,
    pub programs: Vec<(u32, u64)>,
    pub page_erases: Vec<u16>,
    pub mass_erases: usize,
    pub option_writes: Vec<(OptionRegister, u32)>,
    pub option_programs: Vec<OptionProgram>,
    pub option_starts: usize,
    pub option_launches: usize,
    pub status_polls: usize,
}

/// Option register defaults of a blank part.
pub const DEFAULT_OPTIONS: [u32; 8] = [
    0x3fef_f0aa, // OPTR, RDP level 0
    0xffff_ffff, // PCROP1ASR
    0x0000_0000, // PCROP1AER
    0x0000_007f, // WRP1AR, empty area
    0x0000_007f, // WRP1BR, empty area
    0xffff_ffff, // PCROP1BSR
    0x0000_0000, // PCROP1BER
    0x0000_0000, // IPCCBR
];

pub struct SimController {
    flash: Descriptor,
    page_size: u32,
    pages: u32,
    otp: Descriptor,
    option_area: Descriptor,
    read_only: Vec<(Descriptor, Vec<u8>)>,

    flash_mem: Vec<u8>,
    otp_mem: Vec<u8>,
    /// Option registers as written
    options: [u32; 8],
    /// Option values in effect since the last launch
    loaded: [u32; 8],

    sr: Status,
    locked: bool,
    options_locked: bool,
    busy: Hold,
    suspended: Hold,
    busy_on_commit: Hold,
    failing_pages: HashSet<u16>,
    fail_mass_erase: bool,
    /// Option program calls seen, and the one to fail
    option_program_calls: usize,
    failing_option_program: Option<usize>,

    journal: Journal,
}

impl SimController {
    /// A blank, locked part laid out like `device`.
    pub fn new(device: &Device) -> Self {
        let region = |kind: MemoryKind| {
            device
                .regions
                .iter()
                .find(|r| r.kind == kind)
                .map(|r| Descriptor::new(kind, r.start, r.size))
                .unwrap_or_else(|| Descriptor::new(kind, 0, 0))
        };
        let flash = region(MemoryKind::Flash);
        let otp = region(MemoryKind::Otp);
        let read_only = [MemoryKind::System, MemoryKind::EngineeringBytes]
            .into_iter()
            .map(region)
            .filter(|d| d.size > 0)
            .map(|d| (d, vec![0u8; d.size as usize]))
            .collect();

        SimController {
            flash,
            page_size: device.flash.page_size,
            pages: device.flash.pages(),
            otp,
            option_area: region(MemoryKind::OptionBytes),
            read_only,
            flash_mem: vec![ERASED_BYTE; flash.size as usize],
            otp_mem: vec![ERASED_BYTE; otp.size as usize],
            options: DEFAULT_OPTIONS,
            loaded: DEFAULT_OPTIONS,
            sr: Status::default(),
            locked: true,
            options_locked: true,
            busy: Hold::Clear,
            suspended: Hold::Clear,
            busy_on_commit: Hold::Clear,
            failing_pages: HashSet::new(),
            fail_mass_erase: false,
            option_program_calls: 0,
            failing_option_program: None,
            journal: Journal::default(),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn clear_journal(&mut self) {
        self.journal = Journal::default();
    }

    /// Hold BSY for the next status polls.
    pub fn hold_busy(&mut self, hold: Hold) {
        self.busy = hold;
    }

    /// Hold PESD for the next status polls.
    pub fn hold_suspended(&mut self, hold: Hold) {
        self.suspended = hold;
    }

    /// Hold BSY once OPTSTRT is set.
    pub fn hold_busy_on_commit(&mut self, hold: Hold) {
        self.busy_on_commit = hold;
    }

    /// Make the `nth` option program from now on (counting from 0) fail
    /// with OPTVERR, leaving its register untouched.
    pub fn fail_option_program(&mut self, nth: usize) {
        self.failing_option_program = Some(self.option_program_calls + nth);
    }

    /// Make erasing `page` fail with OPERR.
    pub fn fail_page(&mut self, page: u16) {
        self.failing_pages.insert(page);
    }

    pub fn fail_mass_erase(&mut self, fail: bool) {
        self.fail_mass_erase = fail;
    }

    /// Raise error flags as a previous, unrelated operation would have.
    pub fn raise_errors(&mut self, errors: Status) {
        self.sr = Status::from(u32::from(self.sr) | u32::from(errors.errors()));
    }

    pub fn flash(&self) -> &[u8] {
        &self.flash_mem
    }

    pub fn otp(&self) -> &[u8] {
        &self.otp_mem
    }

    pub fn option(&self, register: OptionRegister) -> u32 {
        self.options[register.index()]
    }

    pub fn loaded_option(&self, register: OptionRegister) -> u32 {
        self.loaded[register.index()]
    }

    /// Fill system memory or engineering bytes.
    pub fn preload(&mut self, kind: MemoryKind, data: &[u8]) {
        if let Some((_, mem)) = self.read_only.iter_mut().find(|(d, _)| d.kind == kind) {
            let n = data.len().min(mem.len());
            mem[..n].copy_from_slice(&data[..n]);
        }
    }

    fn page_of(&self, address: u32) -> u16 {
        ((address - self.flash.start) / self.page_size) as u16
    }

    fn write_protected(&self, page: u16) -> bool {
        [OptionRegister::Wrp1Ar, OptionRegister::Wrp1Br]
            .iter()
            .any(|reg| WrpAreaRegister::from(self.loaded[reg.index()]).protects(page))
    }

    fn fault(&mut self, set: impl Fn(&mut Status)) -> Status {
        let mut flags = Status::default();
        set(&mut flags);
        self.sr = Status::from(u32::from(self.sr) | u32::from(flags));
        flags
    }

    fn option_area_byte(&self, offset: usize) -> Option<u8> {
        OptionRegister::ALL
            .iter()
            .find(|reg| (reg.offset()..reg.offset() + 4).contains(&offset))
            .map(|reg| self.options[reg.index()].to_le_bytes()[offset - reg.offset()])
            .or(Some(0))
    }
}

impl Controller for SimController {
    fn unlock(&mut self) {
        self.journal.unlocks += 1;
        self.locked = false;
    }

    fn lock(&mut self) {
        self.journal.locks += 1;
        self.locked = true;
    }

    fn is_locked(&self) -> bool {
        self.locked
    }

    fn unlock_options(&mut self) {
        self.journal.option_unlocks += 1;
        // OPTLOCK can only be cleared once the controller itself is unlocked
        if !self.locked {
            self.options_locked = false;
        }
    }

    fn lock_options(&mut self) {
        self.journal.option_locks += 1;
        self.options_locked = true;
    }

    fn options_locked(&self) -> bool {
        self.options_locked
    }

    fn status(&mut self) -> Status {
        self.journal.status_polls += 1;
        let mut sr = self.sr;
        sr.set_bsy(self.busy.poll());
        sr.set_pesd(self.suspended.poll());
        sr
    }

    fn clear_errors(&mut self) {
        self.journal.error_clears += 1;
        self.sr.clear_errors();
    }

    fn program_double_word(&mut self, address: u32, data: u64) -> Result<(), Status> {
        if self.locked || self.sr.has_errors() {
            return Err(self.fault(|f| f.set_pgserr(true)));
        }
        if address % 8 != 0 {
            return Err(self.fault(|f| f.set_pgaerr(true)));
        }

        let (mem, offset) = if self.flash.contains_range(address, 8) {
            if self.write_protected(self.page_of(address)) {
                return Err(self.fault(|f| f.set_wrperr(true)));
            }
            (&mut self.flash_mem, (address - self.flash.start) as usize)
        } else if self.otp.contains_range(address, 8) {
            (&mut self.otp_mem, (address - self.otp.start) as usize)
        } else {
            return Err(self.fault(|f| f.set_operr(true)));
        };

        let cell = &mut mem[offset..offset + 8];
        if cell.iter().any(|&b| b != ERASED_BYTE) && data != 0 {
            return Err(self.fault(|f| f.set_progerr(true)));
        }
        cell.copy_from_slice(&data.to_le_bytes());
        self.journal.programs.push((address, data));
        Ok(())
    }

    fn erase_page(&mut self, page: u16) -> Result<(), Status> {
        if self.locked {
            return Err(self.fault(|f| f.set_pgserr(true)));
        }
        if u32::from(page) >= self.pages {
            return Err(self.fault(|f| f.set_pgserr(true)));
        }
        if self.write_protected(page) {
            return Err(self.fault(|f| f.set_wrperr(true)));
        }
        if self.failing_pages.contains(&page) {
            return Err(self.fault(|f| f.set_operr(true)));
        }

        let start = page as usize * self.page_size as usize;
        match self.flash_mem.get_mut(start..start + self.page_size as usize) {
            Some(cells) => cells.fill(ERASED_BYTE),
            None => return Err(self.fault(|f| f.set_operr(true))),
        }
        self.journal.page_erases.push(page);
        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), Status> {
        if self.locked {
            return Err(self.fault(|f| f.set_pgserr(true)));
        }
        if (0..self.pages as u16).any(|page| self.write_protected(page)) {
            return Err(self.fault(|f| f.set_wrperr(true)));
        }
        if self.fail_mass_erase {
            return Err(self.fault(|f| f.set_operr(true)));
        }

        self.flash_mem.fill(ERASED_BYTE);
        self.journal.mass_erases += 1;
        Ok(())
    }

    fn read_byte(&self, address: u32) -> Option<u8> {
        if self.flash.contains(address) {
            return Some(self.flash_mem[(address - self.flash.start) as usize]);
        }
        if self.otp.contains(address) {
            return Some(self.otp_mem[(address - self.otp.start) as usize]);
        }
        if self.option_area.contains(address) {
            return self.option_area_byte((address - self.option_area.start) as usize);
        }
        self.read_only
            .iter()
            .find(|(d, _)| d.contains(address))
            .map(|(d, mem)| mem[(address - d.start) as usize])
    }

    fn read_option(&self, register: OptionRegister) -> u32 {
        self.options[register.index()]
    }

    fn write_option(&mut self, register: OptionRegister, value: u32) {
        if self.options_locked {
            log::warn!("{} write ignored, option registers are locked", register.name());
            return;
        }
        self.options[register.index()] = value;
        self.journal.option_writes.push((register, value));
    }

    fn program_option(&mut self, request: OptionProgram) -> Result<(), Status> {
        if self.options_locked {
            return Err(self.fault(|f| f.set_pgserr(true)));
        }
        let call = self.option_program_calls;
        self.option_program_calls += 1;
        if self.failing_option_program == Some(call) {
            return Err(self.fault(|f| f.set_optverr(true)));
        }
        match request {
            OptionProgram::Rdp(level) => {
                let mut optr = Optr::from(self.options[OptionRegister::Optr.index()]);
                optr.set_rdp(level.to_byte());
                self.options[OptionRegister::Optr.index()] = optr.into();
            }
            OptionProgram::Wrp { area, start, end } => {
                self.options[area.register().index()] = WrpAreaRegister::new(start, end).bits();
            }
        }
        self.journal.option_programs.push(request);
        Ok(())
    }

    fn start_option_commit(&mut self) {
        self.journal.option_starts += 1;
        self.busy = self.busy_on_commit;
    }

    fn launch_options(&mut self) {
        if self.options_locked {
            log::warn!("OBL_LAUNCH ignored, option registers are locked");
            return;
        }
        self.journal.option_launches += 1;
        self.loaded = self.options;
    }

    fn system_reset(&mut self) -> ! {
        std::panic::panic_any(SystemReset)
    }
}

/// Option register values as persisted by the host tool.
#[derive(Debug, Serialize, Deserialize)]
struct OptionImage {
    registers: BTreeMap<OptionRegister, u32>,
    loaded: BTreeMap<OptionRegister, u32>,
}

impl SimController {
    /// Restore a device saved with [`SimController::save`]. A missing
    /// directory gives a blank part.
    pub fn load(device: &Device, dir: &Path) -> anyhow::Result<Self> {
        let mut sim = SimController::new(device);
        if !dir.exists() {
            log::debug!("No saved state in {}, starting blank", dir.display());
            return Ok(sim);
        }

        let flash = fs::read(dir.join("flash.bin"))?;
        anyhow::ensure!(flash.len() == sim.flash_mem.len(), "flash.bin size mismatch");
        sim.flash_mem = flash;

        let otp = fs::read(dir.join("otp.bin"))?;
        anyhow::ensure!(otp.len() == sim.otp_mem.len(), "otp.bin size mismatch");
        sim.otp_mem = otp;

        let image: OptionImage = serde_yaml::from_str(&fs::read_to_string(dir.join("options.yaml"))?)?;
        for (register, value) in image.registers {
            sim.options[register.index()] = value;
        }
        for (register, value) in image.loaded {
            sim.loaded[register.index()] = value;
        }
        Ok(sim)
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("flash.bin"), &self.flash_mem)?;
        fs::write(dir.join("otp.bin"), &self.otp_mem)?;

        let image = OptionImage {
            registers: OptionRegister::ALL
                .iter()
                .map(|&reg| (reg, self.options[reg.index()]))
                .collect(),
            loaded: OptionRegister::ALL
                .iter()
                .map(|&reg| (reg, self.loaded[reg.index()]))
                .collect(),
        };
        fs::write(dir.join("options.yaml"), serde_yaml::to_string(&image)?)?;
        log::debug!("Saved device state to {}", dir.display());
        Ok(())
    }
}
