//! Seekable logical byte streams over a fork's extents.
//!
//! A `ForkStream` presents a fork as a contiguous stream: a logical
//! position is mapped to (extent, intra-extent offset) and then to an
//! absolute source offset. Seeking only moves the logical pointer; the
//! work happens at read time, where a cached last logical/physical
//! position pair suppresses redundant source seeks on sequential reads.
//! The stream assumes exclusive use of the underlying source cursor.

use std::io::{Read, Seek, SeekFrom};

use crate::error::Result;
use crate::extents::{Extent, ExtentResolver, ForkData, ForkKind, NoOverflow, OverflowLookup};
use crate::volume::Geometry;

#[derive(Debug)]
pub struct ForkStream<B, O = NoOverflow> {
    source: B,
    overflow: O,
    geometry: Geometry,
    length: u64,
    resolver: ExtentResolver,
    position: u64,
    last_logical: Option<u64>,
    last_physical: u64,
}

impl<B: Read + Seek> ForkStream<B, NoOverflow> {
    /// Stream over a fully-resolved extent list; no overflow lookups
    /// will ever be attempted.
    pub fn resolved(source: B, geometry: Geometry, extents: Vec<Extent>, length: u64) -> Self {
        ForkStream {
            source,
            overflow: NoOverflow,
            geometry,
            length,
            resolver: ExtentResolver::complete(ForkKind::Data, 0, extents),
            position: 0,
            last_logical: None,
            last_physical: 0,
        }
    }
}

impl<B: Read + Seek, O: OverflowLookup> ForkStream<B, O> {
    pub fn new(
        source: B,
        geometry: Geometry,
        fork: &ForkData,
        kind: ForkKind,
        file_id: u32,
        overflow: O,
    ) -> Self {
        ForkStream {
            source,
            overflow,
            geometry,
            length: fork.logical_size,
            resolver: ExtentResolver::new(kind, file_id, &fork.extents),
            position: 0,
            last_logical: None,
            last_physical: 0,
        }
    }

    /// Logical fork length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn resolver(&self) -> &ExtentResolver {
        &self.resolver
    }

    pub fn into_source(self) -> B {
        self.source
    }

    /// Move the logical position. No I/O happens until the next read;
    /// positions at or past the fork length simply read as end of fork.
    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    /// Read up to `buf.len()` bytes at the current logical position,
    /// crossing extent boundaries transparently. Returns 0 at or past
    /// end of fork. A short read from the source yields a partial
    /// count, as does an extent-resolution failure after some bytes
    /// have already been produced; a failure with no progress is
    /// returned as the error itself.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.position >= self.length {
            return Ok(0);
        }
        let block_size = self.geometry.block_size;
        let want = (self.length - self.position).min(buf.len() as u64) as usize;
        let mut done = 0usize;

        while done < want {
            let pos = self.position + done as u64;
            let before = (self.resolver.known_blocks(), self.resolver.state());
            let located =
                self.resolver
                    .locate(&mut self.source, &self.overflow, pos / block_size);
            if (self.resolver.known_blocks(), self.resolver.state()) != before {
                // The resolver walked the overflow tree, so the source
                // cursor is no longer where the last data read left it.
                self.last_logical = None;
            }
            let (extent, extent_first_block) = match located {
                Ok(v) => v,
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            };
            let skip = pos - extent_first_block * block_size;
            let physical = self.geometry.block_offset(extent.start_block) + skip;
            let in_extent = extent.block_count * block_size - skip;
            let chunk = ((want - done) as u64).min(in_extent) as usize;

            if self.last_logical != Some(pos) || self.last_physical != physical {
                if let Err(e) = self.source.seek(SeekFrom::Start(physical)) {
                    if done == 0 {
                        return Err(e.into());
                    }
                    break;
                }
            }
            let n = match self.source.read(&mut buf[done..done + chunk]) {
                Ok(n) => n,
                Err(e) if done == 0 => return Err(e.into()),
                Err(_) => break,
            };
            if n == 0 {
                break;
            }
            done += n;
            self.last_logical = Some(pos + n as u64);
            self.last_physical = physical + n as u64;
            if n < chunk {
                break;
            }
        }

        self.position += done as u64;
        Ok(done)
    }
}

impl<B: Read + Seek, O: OverflowLookup> Read for ForkStream<B, O> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        ForkStream::read(self, buf).map_err(Into::into)
    }
}

impl<B: Read + Seek, O: OverflowLookup> Seek for ForkStream<B, O> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.length.checked_add_signed(d),
            SeekFrom::Current(d) => self.position.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.position = p;
                Ok(p)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of fork",
            )),
        }
    }
}
