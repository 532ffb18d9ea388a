use std::io::{Read, Seek, SeekFrom};

/// Object-safe alias for the byte-source capability the reader is built
/// on: anything seekable and readable. One source handle serves one
/// reader at a time; callers wanting concurrent access must duplicate
/// the handle or serialize externally.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// A windowed view over a larger source: offsets are re-based so that 0
/// maps to `start` in the inner source, and reads never cross `len`.
///
/// Used for embedded HFS+ volumes inside a classic HFS wrapper and for
/// the classic volume bitmap's fixed sector range.
#[derive(Debug)]
pub struct SubSource<R> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> SubSource<R> {
    pub fn new(inner: R, start: u64, len: u64) -> Self {
        SubSource {
            inner,
            start,
            len,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for SubSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let left = (self.len - self.pos).min(buf.len() as u64) as usize;
        self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.inner.read(&mut buf[..left])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for SubSource<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of sub-source",
            )),
        }
    }
}
