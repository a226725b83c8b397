//! Simulation and execution of LC-3 machine code.
//!
//! This module is focused on executing code already loaded into memory
//! (see [`crate::loader`] for getting it there).
//!
//! This module consists of:
//! - [`Cpu`]: the struct driving the fetch-decode-execute loop,
//! - [`mem`]: the module handling memory and the register file,
//! - [`io`]: the module handling terminal IO.
//!
//! The CPU is the only component that knows about the memory-mapped
//! keyboard registers: it clears the `KBSR` ready bit when the running
//! program reads `KBDR`, drops guest writes to either register, and stages
//! bytes from the keystroke channel into them at instruction boundaries.

pub mod io;
pub mod mem;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, trace};

use crate::isa::reg_consts::{R0, R7};
use crate::isa::{Flag, ImmOrReg, Instr};

use self::io::Keyboard;
use self::mem::{Mem, RegFile, KBDR, KBSR, USER_SPACE_START};

/// Trap vectors serviced directly by the host.
mod trap {
    /// Read a character from the keyboard, not echoed.
    pub const GETC: u16 = 0x20;
    /// Output a character.
    pub const OUT: u16 = 0x21;
    /// Output a word string.
    pub const PUTS: u16 = 0x22;
    /// Read a character from the keyboard, echoed.
    pub const IN: u16 = 0x23;
    /// Output a byte string, two packed characters per word.
    pub const PUTSP: u16 = 0x24;
    /// Halt the program.
    pub const HALT: u16 = 0x25;
}

/// Errors that can end execution.
///
/// [`ExecError::Halted`] and [`ExecError::Interrupted`] are clean exits;
/// [`Cpu::run`] absorbs them and returns `Ok`. Only terminal IO failures
/// surface to the caller.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program executed the HALT trap.
    #[error("program halted")]
    Halted,
    /// An external stop request was observed mid-instruction.
    #[error("execution interrupted")]
    Interrupted,
    /// The byte sink failed; the run cannot usefully continue.
    #[error("terminal write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes code loaded into memory.
pub struct Cpu {
    /// The machine's memory.
    ///
    /// Note that this is held in the heap, as it is too large for the stack.
    pub mem: Mem,

    /// The register file.
    pub reg_file: RegFile,

    /// The program counter.
    ///
    /// Always points at the *next* word to fetch; PC-relative offsets are
    /// applied after the fetch increment.
    pub pc: u16,

    /// The condition code.
    cc: Flag,

    /// Cleared by the HALT trap or an external stop request.
    /// The loop observes it at each instruction boundary.
    running: Arc<AtomicBool>,

    /// Where guest output bytes go.
    sink: Box<dyn Write + Send>,
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("reg_file", &self.reg_file)
            .field("pc", &self.pc)
            .field("cc", &self.cc)
            .finish_non_exhaustive()
    }
}

impl Cpu {
    /// Creates a CPU writing guest output to the given sink.
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            mem: Mem::new(),
            reg_file: RegFile::new(),
            pc: USER_SPACE_START,
            cc: Flag::Zro,
            running: Arc::new(AtomicBool::new(true)),
            sink,
        }
    }

    /// Resets the register state back to its power-on values.
    ///
    /// Memory contents and the running flag are left alone.
    pub fn reset(&mut self) {
        self.reg_file = RegFile::new();
        self.pc = USER_SPACE_START;
        self.cc = Flag::Zro;
    }

    /// Gets the current condition code.
    pub fn cc(&self) -> Flag {
        self.cc
    }

    /// Gets a reference to the running flag.
    ///
    /// Storing `false` from any thread stops the machine at the next
    /// instruction boundary, and unblocks a pending keyboard trap.
    pub fn running(&self) -> &Arc<AtomicBool> {
        &self.running
    }

    /// Runs until HALT, an external stop, or a sink failure.
    ///
    /// Keystrokes are taken from `keyboard`, both for the keyboard traps and
    /// for staging into `KBSR`/`KBDR`. On an external stop a newline is
    /// emitted so the host shell prompt lands on a fresh line.
    pub fn run(&mut self, keyboard: &Keyboard) -> Result<(), ExecError> {
        let halted = loop {
            if !self.running.load(Ordering::Acquire) {
                break false;
            }
            match self.step(keyboard) {
                Ok(()) => {}
                Err(ExecError::Halted) => break true,
                Err(ExecError::Interrupted) => break false,
                Err(e) => {
                    self.running.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        };
        self.running.store(false, Ordering::Release);

        if !halted {
            // Best effort; the run is already over.
            let _ = self.sink.write_all(b"\n");
            let _ = self.sink.flush();
        }
        Ok(())
    }

    /// Simulates one step, executing one instruction.
    fn step(&mut self, keyboard: &Keyboard) -> Result<(), ExecError> {
        self.stage_key(keyboard);

        let at = self.pc;
        let word = self.mem_read(at);
        self.pc = self.pc.wrapping_add(1);

        let instr = Instr::decode(word);
        trace!("x{at:04X}  {instr}");

        match instr {
            Instr::BR(cc, off) => {
                if cc & self.cc.mask() != 0 {
                    self.pc = self.pc.wrapping_add_signed(off.get());
                }
            }
            Instr::ADD(dr, sr1, sr2) => {
                let result = self.reg_file[sr1].wrapping_add(self.operand(sr2));
                self.reg_file[dr] = result;
                self.set_cc(result);
            }
            Instr::LD(dr, off) => {
                let val = self.mem_read(self.pc.wrapping_add_signed(off.get()));
                self.reg_file[dr] = val;
                self.set_cc(val);
            }
            Instr::ST(sr, off) => {
                let ea = self.pc.wrapping_add_signed(off.get());
                self.mem_write(ea, self.reg_file[sr]);
            }
            Instr::JSR(target) => {
                self.reg_file[R7] = self.pc;
                self.pc = match target {
                    ImmOrReg::Imm(off) => self.pc.wrapping_add_signed(off.get()),
                    ImmOrReg::Reg(br) => self.reg_file[br],
                };
            }
            Instr::AND(dr, sr1, sr2) => {
                let result = self.reg_file[sr1] & self.operand(sr2);
                self.reg_file[dr] = result;
                self.set_cc(result);
            }
            Instr::LDR(dr, br, off) => {
                let ea = self.reg_file[br].wrapping_add_signed(off.get());
                let val = self.mem_read(ea);
                self.reg_file[dr] = val;
                self.set_cc(val);
            }
            Instr::STR(sr, br, off) => {
                let ea = self.reg_file[br].wrapping_add_signed(off.get());
                self.mem_write(ea, self.reg_file[sr]);
            }
            Instr::RTI => {
                info!("x{at:04X}  RTI is not implemented, continuing");
            }
            Instr::NOT(dr, sr) => {
                let result = !self.reg_file[sr];
                self.reg_file[dr] = result;
                self.set_cc(result);
            }
            Instr::LDI(dr, off) => {
                let ea = self.mem_read(self.pc.wrapping_add_signed(off.get()));
                let val = self.mem_read(ea);
                self.reg_file[dr] = val;
                self.set_cc(val);
            }
            Instr::STI(sr, off) => {
                let ea = self.mem_read(self.pc.wrapping_add_signed(off.get()));
                self.mem_write(ea, self.reg_file[sr]);
            }
            Instr::JMP(br) => {
                self.pc = self.reg_file[br];
            }
            Instr::Reserved => {
                info!("x{at:04X}  reserved opcode, continuing");
            }
            Instr::LEA(dr, off) => {
                let result = self.pc.wrapping_add_signed(off.get());
                self.reg_file[dr] = result;
                self.set_cc(result);
            }
            Instr::TRAP(vect) => self.service_trap(vect.get(), keyboard)?,
        }

        Ok(())
    }

    /// Services a trap on behalf of the guest.
    ///
    /// The trap vector table is never consulted and R7 is not clobbered;
    /// the host performs the routine directly.
    fn service_trap(&mut self, vect: u16, keyboard: &Keyboard) -> Result<(), ExecError> {
        match vect {
            trap::GETC => {
                let byte = self.take_key(keyboard)?;
                self.reg_file[R0] = u16::from(byte);
                self.set_cc(self.reg_file[R0]);
            }
            trap::OUT => {
                let byte = self.reg_file[R0] as u8;
                self.sink.write_all(&[byte])?;
                self.sink.flush()?;
            }
            trap::PUTS => {
                let mut addr = self.reg_file[R0];
                loop {
                    let word = self.mem_read(addr);
                    if word == 0 {
                        break;
                    }
                    self.sink.write_all(&[word as u8])?;
                    addr = addr.wrapping_add(1);
                }
                self.sink.flush()?;
            }
            trap::IN => {
                self.sink.write_all(b"Enter a character: ")?;
                self.sink.flush()?;
                let byte = self.take_key(keyboard)?;
                self.sink.write_all(&[byte])?;
                self.sink.flush()?;
                self.reg_file[R0] = u16::from(byte);
                self.set_cc(self.reg_file[R0]);
            }
            trap::PUTSP => {
                // Two packed characters per word, low byte first. A word
                // whose low byte is zero terminates the string.
                let mut addr = self.reg_file[R0];
                loop {
                    let word = self.mem_read(addr);
                    if word == 0 {
                        break;
                    }
                    self.sink.write_all(&[word as u8])?;
                    let hi = (word >> 8) as u8;
                    if hi != 0 {
                        self.sink.write_all(&[hi])?;
                    }
                    addr = addr.wrapping_add(1);
                }
                self.sink.flush()?;
            }
            trap::HALT => {
                self.sink.write_all(b"HALT\n")?;
                self.sink.flush()?;
                self.running.store(false, Ordering::Release);
                return Err(ExecError::Halted);
            }
            _ => {
                info!("unknown trap vector x{vect:02X}, continuing");
            }
        }
        Ok(())
    }

    /// Takes one byte from the keystroke channel, blocking until one
    /// arrives or the machine is stopped.
    fn take_key(&mut self, keyboard: &Keyboard) -> Result<u8, ExecError> {
        keyboard.recv(&self.running).ok_or(ExecError::Interrupted)
    }

    /// Moves a waiting keystroke into the device registers, if the previous
    /// one has been consumed.
    ///
    /// This is what lets guest programs that poll `KBSR`/`KBDR` instead of
    /// calling GETC see characters.
    fn stage_key(&mut self, keyboard: &Keyboard) {
        if self.mem.read(KBSR) & 0x8000 == 0 {
            if let Some(byte) = keyboard.try_recv() {
                self.mem.write(KBSR, self.mem.read(KBSR) | 0x8000);
                self.mem.write(KBDR, u16::from(byte));
            }
        }
    }

    /// Reads memory on behalf of the guest.
    ///
    /// Reading `KBDR` consumes the pending keystroke by clearing the
    /// `KBSR` ready bit.
    fn mem_read(&mut self, addr: u16) -> u16 {
        if addr == KBDR {
            let status = self.mem.read(KBSR);
            self.mem.write(KBSR, status & 0x7FFF);
        }
        self.mem.read(addr)
    }

    /// Writes memory on behalf of the guest.
    ///
    /// Writes to the device-owned keyboard registers are silently dropped.
    fn mem_write(&mut self, addr: u16, data: u16) {
        if addr == KBSR || addr == KBDR {
            return;
        }
        self.mem.write(addr, data);
    }

    /// Resolves the register-or-immediate operand of `ADD` and `AND`.
    fn operand(&self, value: ImmOrReg<5>) -> u16 {
        match value {
            ImmOrReg::Imm(imm) => imm.get() as u16,
            ImmOrReg::Reg(reg) => self.reg_file[reg],
        }
    }

    /// Sets the condition code from the value just written.
    fn set_cc(&mut self, result: u16) {
        self.cc = match (result as i16).cmp(&0) {
            std::cmp::Ordering::Less => Flag::Neg,
            std::cmp::Ordering::Equal => Flag::Zro,
            std::cmp::Ordering::Greater => Flag::Pos,
        };
    }
}
