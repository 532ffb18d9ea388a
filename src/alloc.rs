//! The allocation bitmap: one bit per allocation block, MSB first
//! within each byte, bit set meaning the block is in use.
//!
//! On HFS+ the bitmap lives in the allocation file's fork; on classic
//! HFS it occupies a fixed sector range. Either way it is presented
//! here as a resolved span. Block numbers are validated against the
//! variant's bit width before any I/O: classic HFS addresses blocks
//! with 16 bits, HFS+/HFSX with 32.

use crate::error::{Error, Result};
use crate::extents::{Extent, ForkSpan};
use crate::source::ReadSeek;
use crate::volume::Variant;

#[derive(Debug, Clone)]
pub struct AllocationFile {
    span: ForkSpan,
    max_block: u64,
}

impl AllocationFile {
    pub fn new(span: ForkSpan, variant: Variant) -> Self {
        let max_block = match variant {
            Variant::Classic => u16::MAX as u64,
            Variant::Plus | Variant::X => u32::MAX as u64,
        };
        AllocationFile { span, max_block }
    }

    fn check_range(&self, what: &str, value: u64) -> Result<()> {
        if value > self.max_block {
            return Err(Error::OutOfRange(format!(
                "{what} {value} exceeds the variant maximum {}",
                self.max_block
            )));
        }
        Ok(())
    }

    /// Whether allocation block `block` is marked in use.
    pub fn is_block_used(&self, source: &mut dyn ReadSeek, block: u64) -> Result<bool> {
        self.check_range("block number", block)?;
        let byte_offset = block / 8;
        if byte_offset >= self.span.length() {
            return Err(Error::OutOfRange(format!(
                "block number {block} lies beyond the {}-byte allocation bitmap",
                self.span.length()
            )));
        }
        let mut byte = [0u8; 1];
        self.span.read_exact_at(source, byte_offset, &mut byte)?;
        let bit = 7 - (block % 8);
        Ok((byte[0] >> bit) & 1 == 1)
    }

    /// Build an extent descriptor after validating both fields against
    /// the variant's bit width. Pure; performs no I/O and never touches
    /// the bitmap.
    pub fn create_extent_descriptor(&self, start_block: u64, block_count: u64) -> Result<Extent> {
        self.check_range("start block", start_block)?;
        self.check_range("block count", block_count)?;
        Ok(Extent::new(start_block, block_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;
    use std::io::Cursor;

    fn bitmap_file(bits: &[u8]) -> (AllocationFile, Cursor<Vec<u8>>) {
        let geometry = Geometry {
            fs_offset: 0,
            block_size: 512,
            first_block_offset: 0,
        };
        let mut image = bits.to_vec();
        image.resize(512, 0);
        let span = ForkSpan::new(geometry, vec![Extent::new(0, 1)], bits.len() as u64);
        (
            AllocationFile::new(span, Variant::Plus),
            Cursor::new(image),
        )
    }

    #[test]
    fn test_bits_are_msb_first() {
        let (alloc, mut src) = bitmap_file(&[0b1010_0000, 0b0000_0001]);
        assert!(alloc.is_block_used(&mut src, 0).unwrap());
        assert!(!alloc.is_block_used(&mut src, 1).unwrap());
        assert!(alloc.is_block_used(&mut src, 2).unwrap());
        assert!(!alloc.is_block_used(&mut src, 14).unwrap());
        assert!(alloc.is_block_used(&mut src, 15).unwrap());
    }

    #[test]
    fn test_variant_range_is_enforced() {
        let (alloc, mut src) = bitmap_file(&[0xFF]);
        // Beyond the bitmap but within u32: rejected for the bitmap.
        assert!(matches!(
            alloc.is_block_used(&mut src, 5000),
            Err(Error::OutOfRange(_))
        ));

        let geometry = Geometry {
            fs_offset: 0,
            block_size: 512,
            first_block_offset: 0,
        };
        let span = ForkSpan::new(geometry, vec![Extent::new(0, 1)], 512);
        let classic = AllocationFile::new(span, Variant::Classic);
        let mut src = Cursor::new(vec![0u8; 512]);
        assert!(matches!(
            classic.is_block_used(&mut src, u16::MAX as u64 + 1),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_create_extent_descriptor_validates_without_io() {
        let (alloc, _) = bitmap_file(&[0x00]);
        let e = alloc.create_extent_descriptor(10, 20).unwrap();
        assert_eq!(e, Extent::new(10, 20));
        assert!(matches!(
            alloc.create_extent_descriptor(u32::MAX as u64 + 1, 1),
            Err(Error::OutOfRange(_))
        ));

        let geometry = Geometry {
            fs_offset: 0,
            block_size: 512,
            first_block_offset: 0,
        };
        let span = ForkSpan::new(geometry, vec![Extent::new(0, 1)], 512);
        let classic = AllocationFile::new(span, Variant::Classic);
        assert!(matches!(
            classic.create_extent_descriptor(0x1_0000, 1),
            Err(Error::OutOfRange(_))
        ));
    }
}
