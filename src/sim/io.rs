//! Terminal IO for the LC-3 VM.
//!
//! This module consists of:
//! - [`Keyboard`]: the receiving half of the keystroke channel, fed by a
//!   background poller thread,
//! - [`RawModeGuard`]: an RAII toggle for the terminal's raw mode,
//! - [`stdin_reader`] / [`stdout_sink`]: the production byte source and sink.
//!
//! The poller owns only the send side of a bounded single-slot channel; it
//! never touches VM memory. The CPU drains the channel at instruction
//! boundaries (for programs polling `KBSR`/`KBDR`) or directly inside the
//! keyboard traps. The single slot gives natural backpressure: the poller
//! waits for the CPU to take a byte before reading another one.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as cbc;
use tracing::debug;

/// Pacing quantum of the keyboard poller.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A helper struct for [`Keyboard::spawn`],
/// indicating the reader is exhausted and no more bytes will come from it.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stop;

/// The consuming half of the keystroke channel.
///
/// Bytes are produced by a poller thread started with [`Keyboard::spawn`]
/// and buffered in a channel of capacity 1: at most one keystroke is ever
/// in flight between the poller and the CPU.
pub struct Keyboard {
    keys: cbc::Receiver<u8>,
    #[allow(unused)]
    poll_handle: JoinHandle<()>,
}

impl Keyboard {
    /// Spawns a keyboard poller around the given reader and returns the
    /// consuming half of its channel.
    ///
    /// The reader function should block until a byte is ready, or return
    /// [`Stop`] if there are no more bytes to read. It is called roughly
    /// every 5 ms while the `running` flag stays set.
    ///
    /// The poller thread exits when the reader reports [`Stop`], when the
    /// `running` flag is cleared, or when the returned `Keyboard` is
    /// dropped. A reader blocked inside an OS read cannot observe the flag
    /// until it yields a byte; the thread is therefore never joined on
    /// shutdown, only signalled.
    pub fn spawn(
        mut reader: impl FnMut() -> Result<u8, Stop> + Send + 'static,
        running: Arc<AtomicBool>,
    ) -> Self {
        let (tx, rx) = cbc::bounded(1);

        let poll_handle = thread::spawn(move || {
            let ticker = cbc::tick(POLL_INTERVAL);
            while running.load(Ordering::Acquire) {
                let _ = ticker.recv();
                let Ok(byte) = reader() else { return };
                // A full slot blocks here until the CPU takes the byte.
                if tx.send(byte).is_err() {
                    return;
                }
            }
        });

        Self { keys: rx, poll_handle }
    }

    /// Takes the buffered keystroke, if one is waiting.
    pub(crate) fn try_recv(&self) -> Option<u8> {
        self.keys.try_recv().ok()
    }

    /// Takes one keystroke, blocking until one arrives.
    ///
    /// Returns `None` if the `running` flag is cleared while waiting or if
    /// the poller is gone and the channel has drained.
    pub(crate) fn recv(&self, running: &AtomicBool) -> Option<u8> {
        loop {
            if !running.load(Ordering::Acquire) {
                return None;
            }
            match self.keys.recv_timeout(POLL_INTERVAL) {
                Ok(byte) => return Some(byte),
                Err(cbc::RecvTimeoutError::Timeout) => continue,
                Err(cbc::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// A reader for [`Keyboard::spawn`] that takes single bytes from stdin.
///
/// Read errors from interrupted system calls are retried; end of input and
/// hard errors report [`Stop`].
pub fn stdin_reader() -> impl FnMut() -> Result<u8, Stop> + Send {
    move || loop {
        let mut stdin = io::stdin().lock();
        match stdin.fill_buf() {
            Ok(&[byte, ..]) => {
                stdin.consume(1);
                return Ok(byte);
            }
            Ok([]) => return Err(Stop),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return Err(Stop),
        }
    }
}

/// The byte sink the VM writes guest output to: stdout, flushed by the CPU
/// after every trap service so single characters are immediately visible.
pub fn stdout_sink() -> Box<dyn Write + Send> {
    Box::new(io::stdout())
}

/// Puts the controlling terminal into non-canonical, no-echo mode for the
/// guard's lifetime. Dropping the guard restores the previous settings.
#[derive(Debug)]
pub struct RawModeGuard(());

impl RawModeGuard {
    /// Enables raw mode.
    pub fn enable() -> io::Result<Self> {
        debug!("enabling raw mode");
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self(()))
    }
}
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        debug!("disabling raw mode");
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{Keyboard, Stop};

    fn running_flag(value: bool) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(value))
    }

    #[test]
    fn delivers_bytes_in_order() {
        let running = running_flag(true);
        let mut bytes = vec![b'a', b'b', b'c'].into_iter();
        let kb = Keyboard::spawn(move || bytes.next().ok_or(Stop), Arc::clone(&running));

        assert_eq!(kb.recv(&running), Some(b'a'));
        assert_eq!(kb.recv(&running), Some(b'b'));
        assert_eq!(kb.recv(&running), Some(b'c'));
        // Reader exhausted, poller gone, channel drained.
        assert_eq!(kb.recv(&running), None);
    }

    #[test]
    fn recv_unblocks_when_flag_clears() {
        let running = running_flag(true);
        let blocked = Arc::clone(&running);
        let kb = Keyboard::spawn(
            move || {
                // Nothing to read until shutdown.
                while blocked.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(Stop)
            },
            Arc::clone(&running),
        );

        let waiter = {
            let running = Arc::clone(&running);
            std::thread::spawn(move || kb.recv(&running))
        };
        std::thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::Release);
        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn try_recv_does_not_block() {
        let running = running_flag(true);
        let kb = Keyboard::spawn(|| Err(Stop), Arc::clone(&running));
        assert_eq!(kb.try_recv(), None);
    }

    #[test]
    fn single_slot_backpressure() {
        let running = running_flag(true);
        let mut bytes = vec![1u8, 2, 3, 4].into_iter();
        let kb = Keyboard::spawn(move || bytes.next().ok_or(Stop), Arc::clone(&running));

        // Let the poller run far ahead of the consumer; at most one byte may
        // be buffered, the rest wait in the producer.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(kb.try_recv(), Some(1));
        assert_eq!(kb.recv(&running), Some(2));
        assert_eq!(kb.recv(&running), Some(3));
        assert_eq!(kb.recv(&running), Some(4));
    }
}
