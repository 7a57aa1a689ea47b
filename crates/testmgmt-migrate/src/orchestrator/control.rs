//! Cooperative pause/cancel signalling.

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::state::JobStatus;

/// Why the entity loop stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Pause,
    Cancel,
    /// A systemic failure; the job fails.
    Halt,
}

/// Signals for one run of a job.
///
/// A fresh control is created for every run, so a pause token never needs
/// resetting: resume starts a new run with new tokens.
#[derive(Debug, Clone, Default)]
pub struct JobControl {
    pause: CancellationToken,
    cancel: CancellationToken,
    halt: CancellationToken,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.pause.cancel();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn halt(&self) {
        self.halt.cancel();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause.is_cancelled()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    /// Pending interrupt, strongest first. Checked at entity boundaries only.
    pub fn interrupt(&self) -> Option<Interrupt> {
        if self.is_halted() {
            Some(Interrupt::Halt)
        } else if self.is_cancel_requested() {
            Some(Interrupt::Cancel)
        } else if self.is_pause_requested() {
            Some(Interrupt::Pause)
        } else {
            None
        }
    }
}

/// Orchestrator-side bookkeeping for a job started in this process.
pub(crate) struct JobHandle {
    pub(crate) config: Config,
    pub(crate) status: watch::Sender<JobStatus>,
    /// Control of the run in progress; `None` while paused or terminal.
    /// Runs clear it under this lock when they settle, which serializes
    /// settling against pause/cancel/resume requests.
    pub(crate) active: Mutex<Option<JobControl>>,
}

impl JobHandle {
    pub(crate) fn new(config: Config, status: JobStatus) -> Self {
        let (tx, _rx) = watch::channel(status);
        Self {
            config,
            status: tx,
            active: Mutex::new(None),
        }
    }

    pub(crate) fn publish(&self, status: JobStatus) {
        self.status.send_replace(status);
    }
}
