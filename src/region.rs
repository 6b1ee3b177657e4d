//! Memory regions and their capabilities.
//!
//! Every physical memory is one [`Region`]. Capabilities a memory lacks
//! keep the trait's default body and fail with [`Error::Unsupported`].

use std::fmt;

use scroll::{Pread, LE};
use serde::{Deserialize, Serialize};

use crate::constants::{PROG_UNIT_SIZE, WRP_MAX_PAGE};
use crate::controller::Controller;
use crate::deferred::Completion;
use crate::device::{Device, FlashGeometry};
use crate::error::{Error, Result};
use crate::protection::{self, RdpLevel, WpState};
use crate::{erase, option_bytes, program};

/// Region kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryKind {
    Flash,
    Ram,
    OptionBytes,
    Otp,
    System,
    EngineeringBytes,
    Error,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryKind::Flash => "flash",
            MemoryKind::Ram => "RAM",
            MemoryKind::OptionBytes => "option bytes",
            MemoryKind::Otp => "OTP",
            MemoryKind::System => "system memory",
            MemoryKind::EngineeringBytes => "engineering bytes",
            MemoryKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// Region capabilities, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Erase,
    ReadProtection,
    WriteProtection,
    Jump,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Erase => "erase",
            Operation::ReadProtection => "read protection",
            Operation::WriteProtection => "write protection",
            Operation::Jump => "jump",
        };
        f.write_str(name)
    }
}

/// Address range of a region. `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub start: u32,
    pub end: u32,
    pub size: u32,
    pub kind: MemoryKind,
}

impl Descriptor {
    pub fn new(kind: MemoryKind, start: u32, size: u32) -> Self {
        Descriptor {
            start,
            end: start.saturating_add(size),
            size,
            kind,
        }
    }

    pub fn contains(&self, address: u32) -> bool {
        (self.start..self.end).contains(&address)
    }

    /// Whether `len` bytes from `address` stay inside the region.
    pub fn contains_range(&self, address: u32, len: usize) -> bool {
        self.contains(address)
            && u64::from(address) + len as u64 <= u64::from(self.end)
    }

    fn overlaps(&self, other: &Descriptor) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} 0x{:08x}..0x{:08x} ({} bytes)",
            self.kind, self.start, self.end, self.size
        )
    }
}

/// Application entry decoded from a vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpTarget {
    pub stack_pointer: u32,
    pub entry: u32,
}

/// Capability table of one memory.
pub trait Region {
    fn descriptor(&self) -> &Descriptor;

    fn kind(&self) -> MemoryKind {
        self.descriptor().kind
    }

    fn unsupported(&self, operation: Operation) -> Error {
        Error::Unsupported {
            kind: self.kind(),
            operation,
        }
    }

    fn read(&self, controller: &dyn Controller, address: u32) -> Result<u8> {
        let descriptor = self.descriptor();
        if !descriptor.contains(address) {
            return Err(Error::AddressOutOfBounds {
                address,
                len: 1,
                kind: descriptor.kind,
            });
        }
        controller
            .read_byte(address)
            .ok_or(Error::AddressNotMapped(address))
    }

    fn write(&self, _controller: &mut dyn Controller, _address: u32, _data: &[u8]) -> Result<Completion> {
        Err(self.unsupported(Operation::Write))
    }

    fn erase(&self, _controller: &mut dyn Controller, _request: &[u8]) -> Result<Completion> {
        Err(self.unsupported(Operation::Erase))
    }

    fn set_read_protection(&self, _controller: &mut dyn Controller, _level: RdpLevel) -> Result<Completion> {
        Err(self.unsupported(Operation::ReadProtection))
    }

    fn set_write_protection(
        &self,
        _controller: &mut dyn Controller,
        _state: WpState,
        _pages: &[u8],
    ) -> Result<Completion> {
        Err(self.unsupported(Operation::WriteProtection))
    }

    fn jump(&self, _controller: &dyn Controller, _address: u32) -> Result<JumpTarget> {
        Err(self.unsupported(Operation::Jump))
    }
}

/// Main program flash.
#[derive(Debug, Clone)]
pub struct FlashRegion {
    descriptor: Descriptor,
    geometry: FlashGeometry,
}

impl FlashRegion {
    pub fn new(descriptor: Descriptor, geometry: FlashGeometry) -> Self {
        FlashRegion {
            descriptor,
            geometry,
        }
    }

    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }
}

impl Region for FlashRegion {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn write(&self, controller: &mut dyn Controller, address: u32, data: &[u8]) -> Result<Completion> {
        program::program(controller, &self.descriptor, address, data)?;
        Ok(Completion::Done)
    }

    fn erase(&self, controller: &mut dyn Controller, request: &[u8]) -> Result<Completion> {
        erase::erase(controller, &self.geometry, request)?;
        Ok(Completion::Done)
    }

    fn set_read_protection(&self, controller: &mut dyn Controller, level: RdpLevel) -> Result<Completion> {
        protection::set_read_protection(controller, level)
    }

    fn set_write_protection(
        &self,
        controller: &mut dyn Controller,
        state: WpState,
        pages: &[u8],
    ) -> Result<Completion> {
        protection::set_write_protection(controller, &self.geometry, state, pages)
    }

    fn jump(&self, controller: &dyn Controller, address: u32) -> Result<JumpTarget> {
        // initial MSP, then the reset handler
        let mut table = [0u8; 8];
        for (i, byte) in table.iter_mut().enumerate() {
            *byte = self.read(controller, address.wrapping_add(i as u32))?;
        }
        let stack_pointer: u32 = table.pread_with(0, LE).map_err(|_| Error::AddressNotMapped(address))?;
        let entry: u32 = table.pread_with(4, LE).map_err(|_| Error::AddressNotMapped(address))?;
        Ok(JumpTarget {
            stack_pointer,
            entry,
        })
    }
}

/// One-time programmable area. Programmed like flash, never erased.
#[derive(Debug, Clone)]
pub struct OtpRegion {
    descriptor: Descriptor,
}

impl OtpRegion {
    pub fn new(descriptor: Descriptor) -> Self {
        OtpRegion { descriptor }
    }
}

impl Region for OtpRegion {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn write(&self, controller: &mut dyn Controller, address: u32, data: &[u8]) -> Result<Completion> {
        program::program(controller, &self.descriptor, address, data)?;
        Ok(Completion::Done)
    }
}

/// Option-byte area, written through the option commit engine.
#[derive(Debug, Clone)]
pub struct OptionBytesRegion {
    descriptor: Descriptor,
    timeout: u32,
}

impl OptionBytesRegion {
    pub fn new(descriptor: Descriptor, timeout: u32) -> Self {
        OptionBytesRegion {
            descriptor,
            timeout,
        }
    }
}

impl Region for OptionBytesRegion {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn write(&self, controller: &mut dyn Controller, address: u32, data: &[u8]) -> Result<Completion> {
        if address != self.descriptor.start {
            return Err(Error::OptionAddress {
                address,
                start: self.descriptor.start,
            });
        }
        if data.len() > self.descriptor.size as usize {
            return Err(Error::AddressOutOfBounds {
                address,
                len: data.len(),
                kind: self.descriptor.kind,
            });
        }
        Ok(option_bytes::commit(controller, data, self.timeout))
    }
}

/// Memory the bootloader may only read: system memory, engineering bytes.
#[derive(Debug, Clone)]
pub struct ReadOnlyRegion {
    descriptor: Descriptor,
}

impl ReadOnlyRegion {
    pub fn new(descriptor: Descriptor) -> Self {
        ReadOnlyRegion { descriptor }
    }
}

impl Region for ReadOnlyRegion {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }
}

/// All regions of a device, fixed once built.
pub struct Registry {
    regions: Vec<Box<dyn Region>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.regions.iter().map(|region| region.descriptor()))
            .finish()
    }
}

impl Registry {
    /// Build a registry, checking that every region is well formed, kinds
    /// are unique and no two regions overlap.
    pub fn new(regions: Vec<Box<dyn Region>>) -> Result<Self> {
        for (i, region) in regions.iter().enumerate() {
            let d = region.descriptor();
            if d.start >= d.end || d.size != d.end - d.start {
                return Err(Error::InvalidLayout(format!("malformed region {}", d)));
            }
            for other in &regions[..i] {
                let o = other.descriptor();
                if o.kind == d.kind {
                    return Err(Error::InvalidLayout(format!("duplicate {} region", d.kind)));
                }
                if o.overlaps(d) {
                    return Err(Error::InvalidLayout(format!("{} overlaps {}", d, o)));
                }
            }
        }
        Ok(Registry { regions })
    }

    /// Build the registry described by a device file.
    pub fn from_device(device: &Device) -> Result<Self> {
        let mut regions: Vec<Box<dyn Region>> = Vec::with_capacity(device.regions.len());
        for spec in &device.regions {
            let descriptor = Descriptor::new(spec.kind, spec.start, spec.size);
            let region: Box<dyn Region> = match spec.kind {
                MemoryKind::Flash => {
                    check_geometry(&device.flash, spec.size)?;
                    Box::new(FlashRegion::new(descriptor, device.flash.clone()))
                }
                MemoryKind::Otp => Box::new(OtpRegion::new(descriptor)),
                MemoryKind::OptionBytes => {
                    Box::new(OptionBytesRegion::new(descriptor, device.option_timeout))
                }
                MemoryKind::System | MemoryKind::EngineeringBytes => {
                    Box::new(ReadOnlyRegion::new(descriptor))
                }
                MemoryKind::Ram | MemoryKind::Error => {
                    return Err(Error::InvalidLayout(format!(
                        "{} regions are not managed by the NVM core",
                        spec.kind
                    )));
                }
            };
            regions.push(region);
        }
        Registry::new(regions)
    }

    pub fn get(&self, kind: MemoryKind) -> Result<&dyn Region> {
        self.regions
            .iter()
            .find(|region| region.kind() == kind)
            .map(|region| region.as_ref())
            .ok_or(Error::UnsupportedRegion(kind))
    }

    pub fn find(&self, address: u32) -> Result<&dyn Region> {
        self.regions
            .iter()
            .find(|region| region.descriptor().contains(address))
            .map(|region| region.as_ref())
            .ok_or(Error::AddressNotMapped(address))
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Region> {
        self.regions.iter().map(|region| region.as_ref())
    }
}

/// Pages must tile the flash exactly, and every page index must fit the
/// WRP area registers.
fn check_geometry(geometry: &FlashGeometry, flash_size: u32) -> Result<()> {
    if geometry.page_size == 0 || geometry.page_size as usize % PROG_UNIT_SIZE != 0 {
        return Err(Error::InvalidLayout(format!(
            "page size {} is not a multiple of the programming unit",
            geometry.page_size
        )));
    }
    if geometry.max_page > WRP_MAX_PAGE {
        return Err(Error::InvalidLayout(format!(
            "last page {} does not fit a WRP area (at most {})",
            geometry.max_page, WRP_MAX_PAGE
        )));
    }
    if u64::from(geometry.pages()) * u64::from(geometry.page_size) != u64::from(flash_size) {
        return Err(Error::InvalidLayout(format!(
            "{} pages of {} bytes do not cover {} bytes of flash",
            geometry.pages(),
            geometry.page_size,
            flash_size
        )));
    }
    Ok(())
}
