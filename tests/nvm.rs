use std::panic::{self, AssertUnwindSafe};

use openbl_nvm::controller::{Controller, OptionProgram, OptionRegister, Status};
use openbl_nvm::protection::{RdpLevel, WpState, WrpArea};
use openbl_nvm::region::Operation;
use openbl_nvm::sim::{Hold, SimController, SystemReset};
use openbl_nvm::{Completion, Deferred, Device, Error, MemoryKind, Nvm};

const FLASH: u32 = 0x0800_0000;
const OTP: u32 = 0x1fff_7000;
const OPTION_BYTES: u32 = 0x1fff_7800;
const SYSTEM: u32 = 0x1fff_0000;
const PAGE: u32 = 2048;

fn nvm() -> Nvm<SimController> {
    let device = Device::stm32wl55().unwrap();
    let sim = SimController::new(&device);
    Nvm::new(sim, device).unwrap()
}

fn page_request(count: u16, pages: &[u16]) -> Vec<u8> {
    std::iter::once(count)
        .chain(pages.iter().copied())
        .flat_map(u16::to_le_bytes)
        .collect()
}

fn assert_relocked(nvm: &Nvm<SimController>) {
    let sim = nvm.controller();
    assert!(sim.is_locked());
    assert!(sim.options_locked());
    assert_eq!(sim.journal().unlocks, sim.journal().locks);
    assert_eq!(sim.journal().option_unlocks, sim.journal().option_locks);
}

#[test]
fn program_pads_last_unit() {
    let mut nvm = nvm();
    let data: Vec<u8> = (1..=13).collect();

    assert_eq!(nvm.write(FLASH, &data).unwrap(), Completion::Done);

    let readback = nvm.read_memory(FLASH, 16).unwrap();
    assert_eq!(&readback[..13], &data[..]);
    assert_eq!(&readback[13..], &[0xff; 3]);
    assert_eq!(nvm.controller().journal().programs.len(), 2);
    assert_relocked(&nvm);
}

#[test]
fn program_nothing_leaves_controller_alone() {
    let mut nvm = nvm();
    assert_eq!(nvm.write(FLASH + 8, &[]).unwrap(), Completion::Done);
    assert_eq!(nvm.controller().journal().unlocks, 0);
}

#[test]
fn program_rejects_bad_requests_before_unlocking() {
    let mut nvm = nvm();

    assert_eq!(
        nvm.write(FLASH + 4, &[0; 8]),
        Err(Error::Misaligned {
            address: FLASH + 4,
            alignment: 8
        })
    );

    // the padded unit would cross the end of flash
    let last = FLASH + 256 * 1024 - 8;
    assert!(matches!(
        nvm.write(last, &[0; 9]),
        Err(Error::AddressOutOfBounds { .. })
    ));
    assert_eq!(nvm.controller().journal().unlocks, 0);
}

#[test]
fn stale_errors_do_not_fail_programming() {
    let mut nvm = nvm();
    let mut stale = Status::default();
    stale.set_progerr(true);
    stale.set_pgserr(true);
    nvm.controller_mut().raise_errors(stale);

    nvm.write(FLASH, &[0x55; 8]).unwrap();
    assert_eq!(nvm.read(FLASH).unwrap(), 0x55);
}

#[test]
fn program_failure_stops_and_relocks() {
    let mut nvm = nvm();
    nvm.write(FLASH + 8, &[0x11; 8]).unwrap();
    nvm.controller_mut().clear_journal();

    let err = nvm.write(FLASH, &[0x22; 24]).unwrap_err();
    match err {
        Error::Program { address, status } => {
            assert_eq!(address, FLASH + 8);
            assert!(status.progerr());
        }
        other => panic!("unexpected {:?}", other),
    }
    // first unit went in, third was never attempted
    assert_eq!(nvm.controller().journal().programs.len(), 1);
    assert_eq!(nvm.read(FLASH + 16).unwrap(), 0xff);
    assert_relocked(&nvm);
}

#[test]
fn otp_is_programmed_but_never_erased() {
    let mut nvm = nvm();
    nvm.write(OTP, b"serial01").unwrap();
    assert_eq!(nvm.read_memory(OTP, 8).unwrap(), b"serial01");

    assert_eq!(
        nvm.erase(MemoryKind::Otp, &page_request(1, &[0])),
        Err(Error::Unsupported {
            kind: MemoryKind::Otp,
            operation: Operation::Erase
        })
    );
}

#[test]
fn read_only_regions_refuse_writes() {
    let mut nvm = nvm();
    nvm.controller_mut().preload(MemoryKind::System, &[0xde, 0xad]);

    assert_eq!(nvm.read(SYSTEM).unwrap(), 0xde);
    assert_eq!(
        nvm.write(SYSTEM, &[0; 8]),
        Err(Error::Unsupported {
            kind: MemoryKind::System,
            operation: Operation::Write
        })
    );
    assert_eq!(nvm.controller().journal().unlocks, 0);
}

#[test]
fn unmapped_addresses() {
    let mut nvm = nvm();
    assert_eq!(nvm.read(0x2000_0000), Err(Error::AddressNotMapped(0x2000_0000)));
    assert_eq!(
        nvm.write(0x2000_0000, &[0; 8]),
        Err(Error::AddressNotMapped(0x2000_0000))
    );
    assert_eq!(
        nvm.registry().find(OPTION_BYTES + 4).unwrap().kind(),
        MemoryKind::OptionBytes
    );
}

#[test]
fn page_erase_takes_pages_present() {
    let mut nvm = nvm();
    for page in 1..=3 {
        nvm.write(FLASH + page * PAGE, &[0; 8]).unwrap();
    }
    nvm.controller_mut().clear_journal();

    // three pages announced, two carried
    nvm.erase(MemoryKind::Flash, &page_request(3, &[1, 2])).unwrap();

    assert_eq!(nvm.controller().journal().page_erases, vec![1, 2]);
    assert_eq!(nvm.read(FLASH + PAGE).unwrap(), 0xff);
    assert_eq!(nvm.read(FLASH + 3 * PAGE).unwrap(), 0x00);
    assert_relocked(&nvm);
}

#[test]
fn page_erase_out_of_range_erases_nothing() {
    let mut nvm = nvm();
    assert_eq!(
        nvm.erase(MemoryKind::Flash, &page_request(2, &[4, 128])),
        Err(Error::PageOutOfRange { page: 128, max: 127 })
    );
    assert!(nvm.controller().journal().page_erases.is_empty());
    assert_eq!(nvm.controller().journal().unlocks, 0);
}

#[test]
fn failed_pages_are_counted() {
    let mut nvm = nvm();
    nvm.controller_mut().fail_page(5);

    assert_eq!(
        nvm.erase(MemoryKind::Flash, &page_request(3, &[4, 5, 6])),
        Err(Error::PagesFailed { failed: 1, total: 3 })
    );
    assert_eq!(nvm.controller().journal().page_erases, vec![4, 6]);
    assert_relocked(&nvm);
}

#[test]
fn mass_erase_request_length() {
    let mut nvm = nvm();
    nvm.write(FLASH, &[0; 16]).unwrap();

    assert_eq!(
        nvm.erase(MemoryKind::Flash, &[0xff]),
        Err(Error::RequestTooShort { len: 1, min: 2 })
    );
    assert_eq!(nvm.controller().journal().mass_erases, 0);

    nvm.erase(MemoryKind::Flash, &[0xff, 0xff]).unwrap();
    assert_eq!(nvm.controller().journal().mass_erases, 1);
    assert_eq!(nvm.read(FLASH).unwrap(), 0xff);

    // bank selectors end up in the same primitive
    nvm.erase(MemoryKind::Flash, &0xfffeu16.to_le_bytes()).unwrap();
    nvm.erase(MemoryKind::Flash, &0xfffdu16.to_le_bytes()).unwrap();
    assert_eq!(nvm.controller().journal().mass_erases, 3);
    assert_relocked(&nvm);
}

#[test]
fn mass_erase_failure() {
    let mut nvm = nvm();
    nvm.controller_mut().fail_mass_erase(true);
    assert!(matches!(
        nvm.erase(MemoryKind::Flash, &[0xff, 0xff]),
        Err(Error::Erase { status }) if status.operr()
    ));
    assert_relocked(&nvm);
}

#[test]
fn disabling_write_protection_clears_both_areas() {
    let mut nvm = nvm();
    let mut deferred = Deferred::new();

    deferred.record(nvm.set_write_protection(WpState::Enable, &[2, 4, 9, 10]).unwrap());
    nvm.post_process(&mut deferred);
    assert_eq!(nvm.controller().loaded_option(OptionRegister::Wrp1Ar), 0x0004_0002);
    assert!(nvm.erase(MemoryKind::Flash, &page_request(1, &[3])).is_err());
    nvm.controller_mut().clear_journal();

    let completion = nvm.set_write_protection(WpState::Disable, &[1, 2, 3, 4]).unwrap();
    assert_eq!(completion, Completion::ReloadOptions);
    assert_eq!(
        nvm.controller().journal().option_programs,
        vec![
            OptionProgram::Wrp {
                area: WrpArea::A,
                start: 0x7f,
                end: 0
            },
            OptionProgram::Wrp {
                area: WrpArea::B,
                start: 0x7f,
                end: 0
            },
        ]
    );

    deferred.record(completion);
    assert!(nvm.post_process(&mut deferred));
    assert_eq!(nvm.controller().loaded_option(OptionRegister::Wrp1Ar), 0x7f);
    assert_eq!(nvm.controller().loaded_option(OptionRegister::Wrp1Br), 0x7f);
    nvm.erase(MemoryKind::Flash, &page_request(2, &[3, 10])).unwrap();
    assert_relocked(&nvm);
}

#[test]
fn failed_area_still_reloads_options() {
    let mut nvm = nvm();
    let mut deferred = Deferred::new();
    nvm.controller_mut().fail_option_program(1);

    let result = nvm.set_write_protection(WpState::Enable, &[2, 4, 9, 10]);
    assert!(matches!(
        result,
        Err(Error::OptionProgram { status }) if status.optverr()
    ));
    assert_eq!(
        nvm.controller().journal().option_programs,
        vec![OptionProgram::Wrp {
            area: WrpArea::A,
            start: 2,
            end: 4
        }]
    );
    assert_relocked(&nvm);

    deferred.record_result(&result);
    assert!(nvm.post_process(&mut deferred));
    assert_eq!(nvm.controller().loaded_option(OptionRegister::Wrp1Ar), 0x0004_0002);
    assert_eq!(nvm.controller().loaded_option(OptionRegister::Wrp1Br), 0x7f);
}

#[test]
fn failed_first_area_does_not_skip_the_second() {
    let mut nvm = nvm();
    let mut deferred = Deferred::new();
    nvm.controller_mut().fail_option_program(0);

    let result = nvm.set_write_protection(WpState::Disable, &[]);
    assert!(matches!(result, Err(Error::OptionProgram { .. })));
    assert_eq!(
        nvm.controller().journal().option_programs,
        vec![OptionProgram::Wrp {
            area: WrpArea::B,
            start: 0x7f,
            end: 0
        }]
    );

    deferred.record_result(&result);
    assert!(deferred.is_pending());
}

#[test]
fn failed_rdp_program_still_reloads_options() {
    let mut nvm = nvm();
    let mut deferred = Deferred::new();
    nvm.controller_mut().fail_option_program(0);

    let result = nvm.set_read_protection(RdpLevel::Level1);
    assert!(matches!(result, Err(Error::OptionProgram { .. })));
    deferred.record_result(&result);
    assert!(nvm.post_process(&mut deferred));
    assert_eq!(nvm.controller().journal().option_launches, 1);
    assert_relocked(&nvm);
}

#[test]
fn write_protection_areas_follow_request_length() {
    let mut nvm = nvm();
    nvm.set_write_protection(WpState::Enable, &[2, 4, 9]).unwrap();
    assert_eq!(
        nvm.controller().journal().option_programs,
        vec![OptionProgram::Wrp {
            area: WrpArea::A,
            start: 2,
            end: 4
        }]
    );

    nvm.controller_mut().clear_journal();
    nvm.set_write_protection(WpState::Enable, &[2, 4, 9, 10]).unwrap();
    assert_eq!(nvm.controller().journal().option_programs.len(), 2);

    assert_eq!(
        nvm.set_write_protection(WpState::Enable, &[2, 200]),
        Err(Error::PageOutOfRange { page: 200, max: 127 })
    );
}

#[test]
fn protected_page_fails_while_others_erase() {
    let mut nvm = nvm();
    let mut deferred = Deferred::new();

    deferred.record(nvm.set_write_protection(WpState::Enable, &[2, 2]).unwrap());
    assert!(nvm.post_process(&mut deferred));
    nvm.controller_mut().clear_journal();

    let err = nvm.erase(MemoryKind::Flash, &page_request(3, &[1, 2, 3])).unwrap_err();
    assert_eq!(err, Error::PagesFailed { failed: 1, total: 3 });
    assert_eq!(nvm.controller().journal().page_erases, vec![1, 3]);

    assert!(matches!(
        nvm.write(FLASH + 2 * PAGE, &[0; 8]),
        Err(Error::Program { status, .. }) if status.wrperr()
    ));
    assert_relocked(&nvm);
}

#[test]
fn option_buffer_gates_fields_by_length() {
    let mut nvm = nvm();
    let image = [0xbb, 0xf0, 0xef, 0x3f, 0x12, 0x00, 0x00, 0x00, 0x34];

    assert_eq!(
        nvm.write(OPTION_BYTES, &image[..5]).unwrap(),
        Completion::ReloadOptions
    );
    assert_eq!(
        nvm.controller().journal().option_writes,
        vec![(OptionRegister::Optr, 0x3fef_f0bb)]
    );
    assert_eq!(nvm.controller().journal().option_starts, 1);

    nvm.controller_mut().clear_journal();
    nvm.write(OPTION_BYTES, &image).unwrap();
    assert_eq!(
        nvm.controller().journal().option_writes,
        vec![
            (OptionRegister::Optr, 0x3fef_f0bb),
            (OptionRegister::Pcrop1Asr, 0x34),
        ]
    );
    assert_relocked(&nvm);
}

#[test]
fn option_buffer_placement() {
    let mut nvm = nvm();
    assert_eq!(
        nvm.write(OPTION_BYTES + 8, &[0; 4]),
        Err(Error::OptionAddress {
            address: OPTION_BYTES + 8,
            start: OPTION_BYTES
        })
    );
    assert!(matches!(
        nvm.write(OPTION_BYTES, &[0; 113]),
        Err(Error::AddressOutOfBounds { .. })
    ));
    assert!(nvm.controller().journal().option_writes.is_empty());
}

#[test]
fn option_commit_waits_for_busy() {
    let mut nvm = nvm();
    nvm.controller_mut().hold_busy(Hold::Polls(3));
    nvm.controller_mut().hold_suspended(Hold::Polls(2));

    nvm.write(OPTION_BYTES, &[0xaa]).unwrap();
    assert_eq!(nvm.controller().journal().option_starts, 1);
    assert!(nvm.controller().journal().status_polls > 5);
}

fn assert_commit_resets(nvm: &mut Nvm<SimController>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = nvm.write(OPTION_BYTES, &[0xaa, 0xf0, 0xef, 0x3f]);
    }));
    let payload = result.unwrap_err();
    assert!(payload.downcast_ref::<SystemReset>().is_some());
    // unwinding relocked everything
    assert_relocked(nvm);
}

#[test]
fn stalled_option_commit_resets() {
    let mut nvm = nvm();
    nvm.controller_mut().hold_busy(Hold::Stuck);

    assert_commit_resets(&mut nvm);
    assert_eq!(nvm.controller().journal().option_starts, 0);
}

#[test]
fn stalled_suspend_resets() {
    let mut nvm = nvm();
    nvm.controller_mut().hold_suspended(Hold::Stuck);

    assert_commit_resets(&mut nvm);
    assert_eq!(nvm.controller().journal().option_writes.len(), 1);
    assert_eq!(nvm.controller().journal().option_starts, 0);
}

#[test]
fn stall_after_option_start_resets() {
    let mut nvm = nvm();
    nvm.controller_mut().hold_busy_on_commit(Hold::Stuck);

    assert_commit_resets(&mut nvm);
    assert_eq!(nvm.controller().journal().option_starts, 1);
}

#[test]
fn rdp_level_2_is_ignored() {
    let mut nvm = nvm();
    assert_eq!(
        nvm.set_read_protection(RdpLevel::Level2).unwrap(),
        Completion::Done
    );
    let journal = nvm.controller().journal();
    assert!(journal.option_programs.is_empty());
    assert_eq!(journal.unlocks, 0);
    assert_eq!(nvm.read_protection(), RdpLevel::Level0);
}

#[test]
fn rdp_change_reloads_options_once() {
    let mut nvm = nvm();
    let mut deferred = Deferred::new();

    deferred.record(nvm.set_read_protection(RdpLevel::Level1).unwrap());
    assert!(deferred.is_pending());
    // nothing applies before the response is out
    assert_eq!(nvm.controller().loaded_option(OptionRegister::Optr) & 0xff, 0xaa);
    assert_eq!(nvm.controller().journal().option_launches, 0);

    assert!(nvm.post_process(&mut deferred));
    assert!(!nvm.post_process(&mut deferred));
    assert_eq!(nvm.controller().journal().option_launches, 1);
    assert_eq!(nvm.controller().loaded_option(OptionRegister::Optr) & 0xff, 0xbb);
    assert_eq!(nvm.read_protection(), RdpLevel::Level1);
    assert_relocked(&nvm);
}

#[test]
fn reloads_do_not_stack() {
    let mut nvm = nvm();
    let mut deferred = Deferred::new();

    deferred.record(nvm.set_read_protection(RdpLevel::Level1).unwrap());
    deferred.record(nvm.set_write_protection(WpState::Disable, &[]).unwrap());
    deferred.record(Completion::Done);

    assert!(nvm.post_process(&mut deferred));
    assert_eq!(nvm.controller().journal().option_launches, 1);
}

#[test]
fn jump_target_from_vector_table() {
    let mut nvm = nvm();
    let mut table = Vec::new();
    table.extend_from_slice(&0x2000_8000u32.to_le_bytes());
    table.extend_from_slice(&0x0800_0101u32.to_le_bytes());
    nvm.write(FLASH, &table).unwrap();

    let target = nvm.jump_target(FLASH).unwrap();
    assert_eq!(target.stack_pointer, 0x2000_8000);
    assert_eq!(target.entry, 0x0800_0101);

    assert!(matches!(
        nvm.jump_target(OTP),
        Err(Error::Unsupported {
            operation: Operation::Jump,
            ..
        })
    ));
}

#[test]
fn state_survives_save_and_load() {
    let dir = std::env::temp_dir().join(format!("openbl-nvm-{}", std::process::id()));
    let device = Device::stm32wl55().unwrap();

    let mut nvm = Nvm::new(SimController::new(&device), device.clone()).unwrap();
    let mut deferred = Deferred::new();
    nvm.write(FLASH + PAGE, &[0x42; 8]).unwrap();
    deferred.record(nvm.set_read_protection(RdpLevel::Level1).unwrap());
    nvm.post_process(&mut deferred);
    nvm.into_controller().save(&dir).unwrap();

    let nvm = Nvm::new(SimController::load(&device, &dir).unwrap(), device).unwrap();
    assert_eq!(nvm.read(FLASH + PAGE).unwrap(), 0x42);
    assert_eq!(nvm.read_protection(), RdpLevel::Level1);

    std::fs::remove_dir_all(&dir).unwrap();
}
