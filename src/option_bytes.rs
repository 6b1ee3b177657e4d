//! Option commit engine.
//!
//! The option buffer sent by the host is a byte image of the option-byte
//! area. Each register is described by an [`OptionField`]: where it starts
//! in the image and which image bytes land in which bits. A field is only
//! written when the buffer reaches past its offset, shorter buffers leave
//! the trailing registers alone.
//!
//! Committing waits on BSY and PESD, sets OPTSTRT and waits on BSY again.
//! A flag that never clears resets the device; no answer could be trusted
//! after that.

use crate::controller::{Controller, OptionRegister, OptionsUnlocked, Status};
use crate::deferred::Completion;

/// One image byte of a field, placed at `shift` in the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lane {
    /// Offset from the start of the field
    pub byte: usize,
    pub shift: u32,
}

const fn lane(byte: usize, shift: u32) -> Lane {
    Lane { byte, shift }
}

/// A register of the option image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionField {
    pub register: OptionRegister,
    pub lanes: &'static [Lane],
}

impl OptionField {
    pub const fn offset(&self) -> usize {
        self.register.offset()
    }

    /// Whether a buffer of `len` bytes carries this field.
    pub const fn is_present(&self, len: usize) -> bool {
        len > self.offset()
    }

    /// Register value encoded by `image`. Lanes the image is too short for
    /// keep their bits from `current`.
    pub fn value(&self, image: &[u8], current: u32) -> u32 {
        self.lanes.iter().fold(0, |value, lane| {
            let byte = match image.get(self.offset() + lane.byte) {
                Some(&byte) => byte,
                None => (current >> lane.shift) as u8,
            };
            value | (u32::from(byte) << lane.shift)
        })
    }
}

/// Layout of the option image, in image order.
pub const FIELDS: [OptionField; 8] = [
    // user options and RDP
    OptionField {
        register: OptionRegister::Optr,
        lanes: &[lane(0, 0), lane(1, 8), lane(2, 16), lane(3, 24)],
    },
    OptionField {
        register: OptionRegister::Pcrop1Asr,
        lanes: &[lane(0, 0)],
    },
    OptionField {
        register: OptionRegister::Pcrop1Aer,
        lanes: &[lane(0, 0), lane(3, 24)],
    },
    OptionField {
        register: OptionRegister::Wrp1Ar,
        lanes: &[lane(0, 0), lane(2, 16)],
    },
    OptionField {
        register: OptionRegister::Wrp1Br,
        lanes: &[lane(0, 0), lane(2, 16)],
    },
    OptionField {
        register: OptionRegister::Pcrop1Bsr,
        lanes: &[lane(0, 0)],
    },
    OptionField {
        register: OptionRegister::Pcrop1Ber,
        lanes: &[lane(0, 0)],
    },
    // IPCC mailbox data buffer base
    OptionField {
        register: OptionRegister::Ipccbr,
        lanes: &[lane(0, 0), lane(1, 8)],
    },
];

/// Register writes encoded by `image`, in the order they are applied.
pub fn pack(image: &[u8], current: impl Fn(OptionRegister) -> u32) -> Vec<(OptionRegister, u32)> {
    FIELDS
        .iter()
        .filter(|field| field.is_present(image.len()))
        .map(|field| (field.register, field.value(image, current(field.register))))
        .collect()
}

/// Write the option image and start the option programming.
pub fn commit(controller: &mut dyn Controller, image: &[u8], timeout: u32) -> Completion {
    let mut options = OptionsUnlocked::new(controller);
    options.clear_errors();

    let writes = pack(image, |register| options.read_option(register));
    for (register, value) in writes {
        log::debug!("{} <= 0x{:08x}", register.name(), value);
        options.write_option(register, value);
    }

    wait_while(&mut *options, timeout, "BSY", |sr| sr.bsy());
    wait_while(&mut *options, timeout, "PESD", |sr| sr.pesd());

    options.start_option_commit();

    wait_while(&mut *options, timeout, "BSY", |sr| sr.bsy());

    log::info!("Option bytes programmed ({} bytes)", image.len());
    Completion::ReloadOptions
}

/// Spin while `pending` holds. The flag may read as set `timeout` times;
/// one more and the device is reset.
fn wait_while(
    controller: &mut dyn Controller,
    timeout: u32,
    flag: &str,
    pending: impl Fn(Status) -> bool,
) {
    let mut polls: u32 = 0;
    while pending(controller.status()) {
        if polls >= timeout {
            log::error!("{} still set after {} polls, resetting", flag, timeout);
            controller.system_reset();
        }
        polls += 1;
    }
}
