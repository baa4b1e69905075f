//! Block layout for the image characteristic.
//!
//! Each data-channel write is one block:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ Block index  │ Image bytes                  │
//! │ 4 bytes LE   │ up to block_size - 4 bytes   │
//! └──────────────┴──────────────────────────────┘
//! ```

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};

use super::opcode::BLOCK_INDEX_SIZE;
use crate::error::{Result, TransferError};

/// Geometry of a chunked transfer: negotiated block size and image length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    block_size: u16,
    image_len: usize,
    blocks_total: u32,
}

impl BlockLayout {
    /// Validate a negotiated block size against an image length.
    ///
    /// The block must carry the index prefix plus at least one image byte.
    pub fn new(block_size: u16, image_len: usize) -> Result<Self> {
        if (block_size as usize) <= BLOCK_INDEX_SIZE {
            return Err(TransferError::InvalidBlockSize(block_size));
        }
        if image_len == 0 {
            return Err(TransferError::EmptyImage);
        }

        let chunk = block_size as usize - BLOCK_INDEX_SIZE;
        let blocks_total = u32::try_from(image_len.div_ceil(chunk))
            .map_err(|_| TransferError::ImageTooLarge(image_len))?;

        Ok(Self {
            block_size,
            image_len,
            blocks_total,
        })
    }

    /// Negotiated block size (index prefix included).
    #[inline]
    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Image bytes carried by a full block.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.block_size as usize - BLOCK_INDEX_SIZE
    }

    /// Number of blocks needed for the whole image.
    #[inline]
    pub fn blocks_total(&self) -> u32 {
        self.blocks_total
    }

    /// Length of the image being transferred.
    #[inline]
    pub fn image_len(&self) -> usize {
        self.image_len
    }

    /// Byte range of the image covered by `index`.
    pub fn range(&self, index: u32) -> Result<Range<usize>> {
        if index >= self.blocks_total {
            return Err(TransferError::IndexOutOfRange {
                index,
                blocks_total: self.blocks_total,
            });
        }
        let start = index as usize * self.chunk_size();
        let end = (start + self.chunk_size()).min(self.image_len);
        Ok(start..end)
    }

    /// Build the data-channel write for `index`: index prefix plus slice.
    ///
    /// `image` must be the buffer this layout was computed for.
    pub fn block(&self, image: &Bytes, index: u32) -> Result<Bytes> {
        debug_assert_eq!(image.len(), self.image_len);
        let range = self.range(index)?;

        let mut buf = BytesMut::with_capacity(BLOCK_INDEX_SIZE + range.len());
        buf.put_u32_le(index);
        buf.extend_from_slice(&image[range]);
        debug_assert!(buf.len() <= self.block_size as usize);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_rejects_small_block_size() {
        assert!(matches!(
            BlockLayout::new(4, 100),
            Err(TransferError::InvalidBlockSize(4))
        ));
        assert!(matches!(
            BlockLayout::new(0, 100),
            Err(TransferError::InvalidBlockSize(0))
        ));
        assert!(BlockLayout::new(5, 100).is_ok());
    }

    #[test]
    fn test_rejects_empty_image() {
        assert!(matches!(
            BlockLayout::new(104, 0),
            Err(TransferError::EmptyImage)
        ));
    }

    #[test]
    fn test_blocks_total_exact_multiple() {
        let layout = BlockLayout::new(104, 1000).unwrap();
        assert_eq!(layout.chunk_size(), 100);
        assert_eq!(layout.blocks_total(), 10);
        assert_eq!(layout.range(9).unwrap(), 900..1000);
    }

    #[test]
    fn test_chunk_lengths_across_geometries() {
        for image_len in [1usize, 2, 99, 100, 101, 1000, 4003, 8000] {
            for block_size in [5u16, 6, 20, 104, 244, 512] {
                let layout = BlockLayout::new(block_size, image_len).unwrap();
                let chunk = block_size as usize - BLOCK_INDEX_SIZE;
                let total = layout.blocks_total() as usize;
                assert_eq!(total, image_len.div_ceil(chunk));

                for index in 0..total - 1 {
                    assert_eq!(layout.range(index as u32).unwrap().len(), chunk);
                }
                let last = layout.range(total as u32 - 1).unwrap().len();
                assert_eq!(last, image_len - (total - 1) * chunk);
                assert!(last >= 1 && last <= chunk);
            }
        }
    }

    #[test]
    fn test_range_out_of_bounds() {
        let layout = BlockLayout::new(104, 1000).unwrap();
        assert!(matches!(
            layout.range(10),
            Err(TransferError::IndexOutOfRange {
                index: 10,
                blocks_total: 10
            })
        ));
    }

    #[test]
    fn test_block_has_index_prefix() {
        let data = image(250);
        let layout = BlockLayout::new(104, data.len()).unwrap();

        let block = layout.block(&data, 2).unwrap();
        assert_eq!(&block[..4], &[2, 0, 0, 0]);
        assert_eq!(&block[4..], &data[200..250]);
        assert!(block.len() <= 104);

        let first = layout.block(&data, 0).unwrap();
        assert_eq!(first.len(), 104);
    }
}
