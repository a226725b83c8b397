//! The machine facade.
//!
//! [`Vm`] wires the CPU, its memory, the image loader, and the terminal
//! together. [`Vm::stdio`] builds the production machine around the
//! process's terminal; [`Vm::new`] accepts any byte sink and key reader,
//! which is what tests and embedders use.
//!
//! A [`StopHandle`] taken before [`Vm::start`] lets another thread (for
//! example a signal handler) stop the machine cleanly.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::loader::{self, LoadError};
use crate::sim::io::{self, Keyboard, RawModeGuard, Stop};
use crate::sim::{Cpu, ExecError};

/// The errors that can result from [`Vm::start`].
#[derive(Debug, Error)]
pub enum VmError {
    /// The object image was malformed; nothing was executed.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// Execution ended on a terminal IO failure.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// The terminal could not be switched into raw mode.
    #[error("terminal setup failed: {0}")]
    Terminal(#[source] std::io::Error),
}

/// A complete LC-3 machine: CPU, memory, keyboard, and output sink.
pub struct Vm {
    cpu: Cpu,
    reader: Box<dyn FnMut() -> Result<u8, Stop> + Send>,
    raw_mode: bool,
}

impl Vm {
    /// Creates a machine with a custom byte sink and key reader.
    ///
    /// The terminal is left untouched; use [`Vm::stdio`] for a machine
    /// that talks to the real terminal.
    pub fn new(
        sink: Box<dyn Write + Send>,
        reader: impl FnMut() -> Result<u8, Stop> + Send + 'static,
    ) -> Self {
        Self {
            cpu: Cpu::new(sink),
            reader: Box::new(reader),
            raw_mode: false,
        }
    }

    /// Creates a machine wired to the process's stdin and stdout.
    ///
    /// [`Vm::start`] will hold the terminal in raw, no-echo mode for the
    /// duration of the run.
    pub fn stdio() -> Self {
        Self {
            cpu: Cpu::new(io::stdout_sink()),
            reader: Box::new(io::stdin_reader()),
            raw_mode: true,
        }
    }

    /// Returns a handle that can stop the machine from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(self.cpu.running()))
    }

    /// Loads the object image and executes it, blocking the caller until
    /// the program halts, a [`StopHandle`] fires, or terminal IO fails.
    ///
    /// The keyboard poller runs for the duration of the call; raw mode
    /// (for [`Vm::stdio`] machines) is restored on every exit path.
    pub fn start(mut self, image: &[u8]) -> Result<(), VmError> {
        loader::load_image(&mut self.cpu.mem, image)?;

        let _raw = match self.raw_mode {
            true => Some(RawModeGuard::enable().map_err(VmError::Terminal)?),
            false => None,
        };

        let keyboard = Keyboard::spawn(self.reader, Arc::clone(self.cpu.running()));
        self.cpu.reset();
        self.cpu.run(&keyboard)?;
        Ok(())
    }
}

/// Stops a running [`Vm`]. Cloneable and safe to fire from any thread.
///
/// The CPU observes the stop at its next instruction boundary; a pending
/// keyboard trap is unblocked as well.
#[derive(Clone)]
pub struct StopHandle(Arc<std::sync::atomic::AtomicBool>);

impl StopHandle {
    /// Requests the machine to stop.
    pub fn stop(&self) {
        self.0.store(false, Ordering::Release);
    }
}
