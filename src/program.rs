//! Program engine: byte streams to double-word programming units.

use crate::constants::{ERASED_BYTE, PROG_UNIT_SIZE};
use crate::controller::{Controller, Unlocked};
use crate::error::{Error, Result};
use crate::region::Descriptor;

/// Split `data` into programming units. The last unit is padded with the
/// erased value.
pub fn program_units(data: &[u8]) -> impl Iterator<Item = [u8; PROG_UNIT_SIZE]> + '_ {
    data.chunks(PROG_UNIT_SIZE).map(|chunk| {
        let mut unit = [ERASED_BYTE; PROG_UNIT_SIZE];
        unit[..chunk.len()].copy_from_slice(chunk);
        unit
    })
}

/// Program `data` at `address` inside `region`, one double word at a time.
///
/// An empty `data` is a no-op and leaves the controller alone. The
/// controller is locked again on every other exit path, and the first unit
/// the controller rejects ends the sequence.
pub fn program(
    controller: &mut dyn Controller,
    region: &Descriptor,
    address: u32,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        log::debug!("Nothing to program at 0x{:08x}", address);
        return Ok(());
    }

    let padded_len = data.len().div_ceil(PROG_UNIT_SIZE) * PROG_UNIT_SIZE;
    if !region.contains_range(address, padded_len) {
        return Err(Error::AddressOutOfBounds {
            address,
            len: data.len(),
            kind: region.kind,
        });
    }
    if address as usize % PROG_UNIT_SIZE != 0 {
        return Err(Error::Misaligned {
            address,
            alignment: PROG_UNIT_SIZE,
        });
    }

    let mut flash = Unlocked::new(controller);
    let mut unit_address = address;
    for unit in program_units(data) {
        // stale flags from an earlier operation must not fail this unit
        flash.clear_errors();
        flash
            .program_double_word(unit_address, u64::from_le_bytes(unit))
            .map_err(|status| Error::Program {
                address: unit_address,
                status,
            })?;
        unit_address += PROG_UNIT_SIZE as u32;
    }

    log::debug!(
        "Programmed {} bytes ({} units) at 0x{:08x}",
        data.len(),
        padded_len / PROG_UNIT_SIZE,
        address
    );
    Ok(())
}
