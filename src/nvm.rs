//! Region-agnostic NVM access.

use crate::controller::Controller;
use crate::deferred::{Completion, Deferred};
use crate::device::Device;
use crate::error::Result;
use crate::protection::{self, RdpLevel, WpState};
use crate::region::{JumpTarget, MemoryKind, Region, Registry};

pub struct Nvm<C: Controller> {
    controller: C,
    device: Device,
    registry: Registry,
}

impl<C: Controller> Nvm<C> {
    pub fn new(controller: C, device: Device) -> Result<Self> {
        let registry = Registry::from_device(&device)?;
        log::debug!("Memory map of {}: {:?}", device, registry);
        Ok(Nvm {
            controller,
            device,
            registry,
        })
    }

    pub fn dump_info(&self) {
        log::info!("Device: {} ({})", self.device, self.device.description);
        for region in self.registry.iter() {
            log::info!("  {}", region.descriptor());
        }
        log::info!(
            "Flash: {} pages of {}KiB",
            self.device.flash.pages(),
            self.device.flash.page_size / 1024
        );
        log::info!("RDP: {}", self.read_protection());
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    pub fn into_controller(self) -> C {
        self.controller
    }

    pub fn region(&self, kind: MemoryKind) -> Result<&dyn Region> {
        self.registry.get(kind)
    }

    pub fn read(&self, address: u32) -> Result<u8> {
        self.registry.find(address)?.read(&self.controller, address)
    }

    /// Read `len` bytes starting at `address`, all inside one region.
    pub fn read_memory(&self, address: u32, len: usize) -> Result<Vec<u8>> {
        let region = self.registry.find(address)?;
        (0..len as u32)
            .map(|i| region.read(&self.controller, address.wrapping_add(i)))
            .collect()
    }

    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<Completion> {
        let region = self.registry.find(address)?;
        region.write(&mut self.controller, address, data)
    }

    pub fn erase(&mut self, kind: MemoryKind, request: &[u8]) -> Result<Completion> {
        let region = self.registry.get(kind)?;
        region.erase(&mut self.controller, request)
    }

    pub fn set_write_protection(&mut self, state: WpState, pages: &[u8]) -> Result<Completion> {
        let region = self.registry.get(MemoryKind::Flash)?;
        region.set_write_protection(&mut self.controller, state, pages)
    }

    pub fn set_read_protection(&mut self, level: RdpLevel) -> Result<Completion> {
        let region = self.registry.get(MemoryKind::Flash)?;
        region.set_read_protection(&mut self.controller, level)
    }

    pub fn read_protection(&self) -> RdpLevel {
        protection::read_protection(&self.controller)
    }

    pub fn jump_target(&self, address: u32) -> Result<JumpTarget> {
        self.registry.find(address)?.jump(&self.controller, address)
    }

    /// Run what the last responses left pending. Call once the response
    /// has been sent.
    pub fn post_process(&mut self, deferred: &mut Deferred) -> bool {
        deferred.flush(&mut self.controller)
    }
}
