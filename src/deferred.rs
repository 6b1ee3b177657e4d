//! Option reload deferred until the response has been sent.
//!
//! Option-byte and protection changes only take effect once the controller
//! reloads its option configuration, which on hardware resets the device.
//! Operations report that need through [`Completion`]; the post-processing
//! stage keeps it in a [`Deferred`] slot and flushes it after the
//! acknowledgement has left.

use crate::controller::{Controller, OptionsUnlocked};
use crate::error::Result;

/// Outcome of a successful NVM operation.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// New option values are only applied after an option reload.
    ReloadOptions,
}

impl Completion {
    pub fn requires_reload(self) -> bool {
        self == Completion::ReloadOptions
    }
}

/// The pending reload action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reload;

impl Reload {
    fn run(self, controller: &mut dyn Controller) {
        let mut options = OptionsUnlocked::new(controller);
        options.launch_options();
    }
}

/// Single-slot holder for the post-response option reload.
#[derive(Debug, Default)]
pub struct Deferred {
    pending: Option<Reload>,
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation outcome. At most one reload is ever pending.
    pub fn record(&mut self, completion: Completion) {
        if completion.requires_reload() {
            if self.pending.is_some() {
                log::debug!("Option reload already pending");
            }
            self.pending = Some(Reload);
        }
    }

    /// Record the outcome of an operation, failed or not.
    pub fn record_result(&mut self, result: &Result<Completion>) {
        match result {
            Ok(completion) => self.record(*completion),
            Err(err) => self.record(err.completion()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Run the pending reload, if any, and clear the slot.
    ///
    /// Returns whether a reload was run.
    pub fn flush(&mut self, controller: &mut dyn Controller) -> bool {
        match self.pending.take() {
            Some(reload) => {
                log::info!("Reloading option bytes");
                reload.run(controller);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Status;
    use crate::error::Error;

    #[test]
    fn failed_option_program_still_reloads() {
        let mut deferred = Deferred::new();
        deferred.record_result(&Err(Error::PageOutOfRange { page: 200, max: 127 }));
        assert!(!deferred.is_pending());

        deferred.record_result(&Err(Error::OptionProgram {
            status: Status::default(),
        }));
        assert!(deferred.is_pending());
    }

    #[test]
    fn done_does_not_arm() {
        let mut deferred = Deferred::new();
        deferred.record_result(&Ok(Completion::Done));
        assert!(!deferred.is_pending());
        deferred.record_result(&Ok(Completion::ReloadOptions));
        assert!(deferred.is_pending());
    }
}
