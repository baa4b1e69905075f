//! Tag image format.
//!
//! The tag takes two 1-bit planes, black/white then red. Each plane is sent
//! as one line per image column, every line wrapped in a small header:
//!
//! ```text
//! ┌──────┬──────────┬────────────┬─────────────┬────────────────────┐
//! │ 0x75 │ line len │ line bytes │ 4 × 0x00    │ packed pixels      │
//! │ 1    │ 1        │ 1          │ 4           │ ceil(height / 8)   │
//! └──────┴──────────┴────────────┴─────────────┴────────────────────┘
//! ```
//!
//! The concatenated lines are prefixed with their total length (u32 LE).
//! Pixels are packed MSB first, top of the column in the first byte.
//!
//! Quantizing a picture down to black/white/red is left to the caller.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TransferError};

/// Width of the 2.13" tag panel, in pixels.
pub const TAG_WIDTH: usize = 250;

/// Height of the 2.13" tag panel, in pixels.
pub const TAG_HEIGHT: usize = 122;

/// Tallest column a line header can describe.
pub const MAX_HEIGHT: usize = 128;

/// First byte of every line.
const LINE_MARKER: u8 = 0x75;

/// Reserved bytes between the line header and the pixels.
const LINE_PADDING: [u8; 4] = [0; 4];

/// Header bytes counted by the line length field.
const LINE_HEADER_LEN: usize = 3 + LINE_PADDING.len();

/// Colours the panel can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pixel {
    /// Ink off on both planes.
    Black,
    /// Set on the black/white plane.
    White,
    /// Set on the red plane.
    Red,
}

/// A column-major 1-bit plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitplane {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl Bitplane {
    /// Create an all-zero plane.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width == 0 {
            return Err(TransferError::InvalidBitmap("width must be nonzero".into()));
        }
        if height == 0 || height > MAX_HEIGHT {
            return Err(TransferError::InvalidBitmap(format!(
                "height {height} outside 1..={MAX_HEIGHT}"
            )));
        }

        Ok(Self {
            width,
            height,
            data: vec![0; width * height.div_ceil(8)],
        })
    }

    /// Create a plane from a per-pixel predicate.
    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> bool) -> Result<Self> {
        let mut plane = Self::new(width, height)?;
        for x in 0..width {
            for y in 0..height {
                if f(x, y) {
                    plane.set(x, y, true);
                }
            }
        }
        Ok(plane)
    }

    /// Plane width (number of lines).
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Plane height (pixels per line).
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Packed bytes per line.
    #[inline]
    pub fn line_bytes(&self) -> usize {
        self.height.div_ceil(8)
    }

    /// Packed pixels of column `x`.
    ///
    /// # Panics
    ///
    /// Panics if `x >= self.width()`.
    pub fn line(&self, x: usize) -> &[u8] {
        let n = self.line_bytes();
        &self.data[x * n..(x + 1) * n]
    }

    /// Set or clear one pixel. Out-of-bounds coordinates are ignored.
    pub fn set(&mut self, x: usize, y: usize, on: bool) {
        if x >= self.width || y >= self.height {
            return;
        }
        let (byte, mask) = self.locate(x, y);
        if on {
            self.data[byte] |= mask;
        } else {
            self.data[byte] &= !mask;
        }
    }

    /// Read one pixel. Out-of-bounds coordinates read as clear.
    pub fn get(&self, x: usize, y: usize) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let (byte, mask) = self.locate(x, y);
        self.data[byte] & mask != 0
    }

    fn locate(&self, x: usize, y: usize) -> (usize, u8) {
        (x * self.line_bytes() + y / 8, 0x80 >> (y % 8))
    }

    fn put_lines(&self, buf: &mut BytesMut) {
        let n = self.line_bytes();
        for x in 0..self.width {
            buf.put_u8(LINE_MARKER);
            // n <= 16, so both fit a byte.
            buf.put_u8((LINE_HEADER_LEN + n) as u8);
            buf.put_u8(n as u8);
            buf.extend_from_slice(&LINE_PADDING);
            buf.extend_from_slice(self.line(x));
        }
    }
}

/// Serialize a black/white plane and a red plane into the tag format.
pub fn encode_planes(bw: &Bitplane, red: &Bitplane) -> Result<Bytes> {
    if bw.width != red.width || bw.height != red.height {
        return Err(TransferError::InvalidBitmap(format!(
            "plane geometry differs: {}x{} vs {}x{}",
            bw.width, bw.height, red.width, red.height
        )));
    }

    let line_len = LINE_HEADER_LEN + bw.line_bytes();
    let body_len = 2 * bw.width * line_len;
    let prefix = u32::try_from(body_len).map_err(|_| TransferError::ImageTooLarge(body_len))?;

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32_le(prefix);
    bw.put_lines(&mut buf);
    red.put_lines(&mut buf);

    tracing::trace!(width = bw.width, height = bw.height, len = buf.len(), "Encoded image");
    Ok(buf.freeze())
}

/// Build both planes from a pixel source and serialize them.
pub fn encode_image(
    width: usize,
    height: usize,
    pixel: impl Fn(usize, usize) -> Pixel,
) -> Result<Bytes> {
    let bw = Bitplane::from_fn(width, height, |x, y| pixel(x, y) == Pixel::White)?;
    let red = Bitplane::from_fn(width, height, |x, y| pixel(x, y) == Pixel::Red)?;
    encode_planes(&bw, &red)
}
