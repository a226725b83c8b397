//! Object image loading.
//!
//! An object image is a bare binary blob: a big-endian 16-bit origin
//! address followed by big-endian 16-bit words, loaded consecutively from
//! the origin. There is no checksum and no section table.

use thiserror::Error;
use tracing::debug;

use crate::sim::mem::{Mem, MMIO_START};

/// The errors that can result from [`load_image`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The image is smaller than an origin header plus one word.
    #[error("image file too short ({0} bytes)")]
    TooShort(usize),
}

/// Parses an object image and copies its words into memory.
///
/// Loading stops silently once the destination would reach the
/// memory-mapped device registers; a dangling odd byte at the end of the
/// image is ignored. Returns the origin address.
pub fn load_image(mem: &mut Mem, image: &[u8]) -> Result<u16, LoadError> {
    if image.len() < 4 {
        return Err(LoadError::TooShort(image.len()));
    }

    let origin = u16::from_be_bytes([image[0], image[1]]);
    debug!("loading {} byte image at x{origin:04X}", image.len());

    let mut addr = origin;
    for pair in image[2..].chunks_exact(2) {
        if addr >= MMIO_START {
            break;
        }
        mem.write(addr, u16::from_be_bytes([pair[0], pair[1]]));
        addr = addr.wrapping_add(1);
    }

    Ok(origin)
}

#[cfg(test)]
mod test {
    use crate::sim::mem::{Mem, MMIO_START};

    use super::{load_image, LoadError};

    #[test]
    fn rejects_short_images() {
        let mut mem = Mem::new();
        assert_eq!(load_image(&mut mem, &[]), Err(LoadError::TooShort(0)));
        assert_eq!(load_image(&mut mem, &[0x30]), Err(LoadError::TooShort(1)));
        assert_eq!(
            load_image(&mut mem, &[0x30, 0x00, 0xF0]),
            Err(LoadError::TooShort(3))
        );
    }

    #[test]
    fn loads_words_from_origin() {
        let mut mem = Mem::new();
        let origin = load_image(&mut mem, &[0x30, 0x00, 0xF0, 0x25, 0x12, 0x34]).unwrap();
        assert_eq!(origin, 0x3000);
        assert_eq!(mem.read(0x3000), 0xF025);
        assert_eq!(mem.read(0x3001), 0x1234);
        assert_eq!(mem.read(0x3002), 0);
    }

    #[test]
    fn ignores_dangling_odd_byte() {
        let mut mem = Mem::new();
        load_image(&mut mem, &[0x30, 0x00, 0xF0, 0x25, 0xAB]).unwrap();
        assert_eq!(mem.read(0x3000), 0xF025);
        assert_eq!(mem.read(0x3001), 0);
    }

    #[test]
    fn stops_at_device_registers() {
        let mut mem = Mem::new();
        // Four words aimed at xFDFE: only the two below the device window land.
        let image = [0xFD, 0xFE, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04];
        load_image(&mut mem, &image).unwrap();
        assert_eq!(mem.read(0xFDFE), 1);
        assert_eq!(mem.read(0xFDFF), 2);
        assert_eq!(mem.read(MMIO_START), 0);
        assert_eq!(mem.read(MMIO_START + 1), 0);
    }
}
