//! An LC-3 virtual machine.
//!
//! This crate executes bare object images for the LC-3 architecture:
//! a 16-bit machine with 65,536 words of memory, eight general-purpose
//! registers, a one-hot condition code, and memory-mapped keyboard
//! registers fed by a background poller. Traps are serviced directly by
//! the host rather than by executing the trap vector table.
//!
//! # Usage
//!
//! Build a [`vm::Vm`] around a byte sink and a key reader, then hand it an
//! object image (big-endian origin word followed by big-endian code words):
//!
//! ```
//! use lc3vm::sim::io::Stop;
//! use lc3vm::vm::Vm;
//!
//! // An image containing only `TRAP x25` (HALT) at the x3000 origin.
//! let image = [0x30, 0x00, 0xF0, 0x25];
//!
//! let vm = Vm::new(Box::new(Vec::<u8>::new()), || Err(Stop));
//! vm.start(&image).unwrap();
//! ```
//!
//! [`Vm::stdio`] builds the production machine instead: output goes to
//! stdout, keystrokes come from stdin, and the terminal is held in raw
//! no-echo mode while the program runs. A [`vm::StopHandle`] stops the
//! machine cleanly from another thread.
//!
//! If more granularity is needed, the [`sim`] module exposes the CPU and
//! its memory directly, and [`loader`] parses images on their own.
//!
//! [`Vm::stdio`]: vm::Vm::stdio
#![warn(missing_docs)]

pub mod isa;
pub mod loader;
pub mod sim;
pub mod vm;
