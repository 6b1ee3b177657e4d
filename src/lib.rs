//! NVM programming, erase and protection core of the STM32WL open bootloader.

pub mod constants;
pub mod controller;
pub mod deferred;
pub mod device;
pub mod erase;
pub mod error;
pub mod nvm;
pub mod option_bytes;
pub mod program;
pub mod protection;
pub mod region;
pub mod sim;

pub use self::controller::Controller;
pub use self::deferred::{Completion, Deferred};
pub use self::device::Device;
pub use self::error::{Error, Result};
pub use self::nvm::Nvm;
pub use self::region::{MemoryKind, Region, Registry};
