//! Extent descriptors, fork data, and the overflow-extent machinery.
//!
//! Classic HFS records extents as 16-bit start/count pairs (three per
//! fork); HFS+ and HFSX use 32-bit pairs (eight per fork). Both decode
//! into the same logical shapes so everything downstream is
//! variant-agnostic. A fork whose inline extents do not cover its
//! logical size continues in the Extents Overflow B-tree, keyed by
//! (file ID, fork type, starting allocation block).

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;
use std::fmt;

use crate::btree::BTree;
use crate::error::{Error, Result};
use crate::source::ReadSeek;
use crate::volume::{Geometry, Variant};

/// A contiguous run of allocation blocks. A zero block count is the
/// end-of-chain sentinel, not a real extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start_block: u64,
    pub block_count: u64,
}

impl Extent {
    pub const fn new(start_block: u64, block_count: u64) -> Self {
        Extent {
            start_block,
            block_count,
        }
    }

    /// 32-bit descriptor: start_block (u32) + block_count (u32).
    pub fn parse_plus(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::MalformedStructure(
                "extent descriptor shorter than 8 bytes".into(),
            ));
        }
        Ok(Extent {
            start_block: BigEndian::read_u32(&data[0..4]) as u64,
            block_count: BigEndian::read_u32(&data[4..8]) as u64,
        })
    }

    /// 16-bit descriptor: start_block (u16) + block_count (u16).
    pub fn parse_classic(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::MalformedStructure(
                "extent descriptor shorter than 4 bytes".into(),
            ));
        }
        Ok(Extent {
            start_block: BigEndian::read_u16(&data[0..2]) as u64,
            block_count: BigEndian::read_u16(&data[2..4]) as u64,
        })
    }

    pub fn is_end(&self) -> bool {
        self.block_count == 0
    }
}

/// The two forks a catalog file record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForkKind {
    Data,
    Resource,
}

impl ForkKind {
    /// On-disk fork type byte in extent keys.
    pub fn key_byte(self) -> u8 {
        match self {
            ForkKind::Data => 0x00,
            ForkKind::Resource => 0xFF,
        }
    }
}

impl fmt::Display for ForkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForkKind::Data => "data",
            ForkKind::Resource => "resource",
        })
    }
}

/// Fork metadata: authoritative byte length plus the inline extents.
/// The extent array may over-allocate up to block-size granularity.
#[derive(Debug, Clone)]
pub struct ForkData {
    pub logical_size: u64,
    pub total_blocks: u64,
    pub extents: Vec<Extent>,
}

impl ForkData {
    /// HFS+ fork data (80 bytes): logical size, clump size, total
    /// blocks, then eight extent descriptors.
    pub fn parse_plus(data: &[u8]) -> Result<Self> {
        if data.len() < 80 {
            return Err(Error::MalformedStructure(
                "fork data shorter than 80 bytes".into(),
            ));
        }
        let mut extents = Vec::with_capacity(8);
        for i in 0..8 {
            extents.push(Extent::parse_plus(&data[16 + i * 8..24 + i * 8])?);
        }
        Ok(ForkData {
            logical_size: BigEndian::read_u64(&data[0..8]),
            total_blocks: BigEndian::read_u32(&data[12..16]) as u64,
            extents,
        })
    }

    /// Classic fork description: the catalog record and MDB store the
    /// length and the three-slot extent record separately.
    pub fn parse_classic(logical_size: u64, total_blocks: u64, rec: &[u8]) -> Result<Self> {
        if rec.len() < 12 {
            return Err(Error::MalformedStructure(
                "extent record shorter than 12 bytes".into(),
            ));
        }
        let mut extents = Vec::with_capacity(3);
        for i in 0..3 {
            extents.push(Extent::parse_classic(&rec[i * 4..i * 4 + 4])?);
        }
        Ok(ForkData {
            logical_size,
            total_blocks,
            extents,
        })
    }

    pub fn empty() -> Self {
        ForkData {
            logical_size: 0,
            total_blocks: 0,
            extents: Vec::new(),
        }
    }
}

/// Key of the Extents Overflow B-tree. Ordering is file ID, then fork
/// type byte, then start block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentKey {
    pub fork: ForkKind,
    pub file_id: u32,
    pub start_block: u64,
}

impl ExtentKey {
    /// Decode a key body (without its length prefix) in either width.
    pub fn parse(variant: Variant, key: &[u8]) -> Result<Self> {
        match variant {
            Variant::Classic => {
                // fork type (1) + file ID (4) + start block (2)
                if key.len() < 7 {
                    return Err(Error::CorruptBTree("extent key shorter than 7 bytes".into()));
                }
                Ok(ExtentKey {
                    fork: fork_from_key_byte(key[0])?,
                    file_id: BigEndian::read_u32(&key[1..5]),
                    start_block: BigEndian::read_u16(&key[5..7]) as u64,
                })
            }
            Variant::Plus | Variant::X => {
                // fork type (1) + pad (1) + file ID (4) + start block (4)
                if key.len() < 10 {
                    return Err(Error::CorruptBTree(
                        "extent key shorter than 10 bytes".into(),
                    ));
                }
                Ok(ExtentKey {
                    fork: fork_from_key_byte(key[0])?,
                    file_id: BigEndian::read_u32(&key[2..6]),
                    start_block: BigEndian::read_u32(&key[6..10]) as u64,
                })
            }
        }
    }

    pub fn compare(&self, other: &ExtentKey) -> Ordering {
        self.file_id
            .cmp(&other.file_id)
            .then(self.fork.key_byte().cmp(&other.fork.key_byte()))
            .then(self.start_block.cmp(&other.start_block))
    }
}

fn fork_from_key_byte(b: u8) -> Result<ForkKind> {
    match b {
        0x00 => Ok(ForkKind::Data),
        0xFF => Ok(ForkKind::Resource),
        other => Err(Error::CorruptBTree(format!(
            "invalid fork type byte 0x{other:02X} in extent key"
        ))),
    }
}

/// Decode one overflow leaf record: a fixed array of descriptors
/// (eight for HFS+/HFSX, three for classic), zero-count slots included.
pub fn parse_overflow_record(variant: Variant, data: &[u8]) -> Result<Vec<Extent>> {
    match variant {
        Variant::Classic => {
            if data.len() < 12 {
                return Err(Error::CorruptBTree(
                    "overflow extent record shorter than 12 bytes".into(),
                ));
            }
            (0..3).map(|i| Extent::parse_classic(&data[i * 4..])).collect()
        }
        Variant::Plus | Variant::X => {
            if data.len() < 64 {
                return Err(Error::CorruptBTree(
                    "overflow extent record shorter than 64 bytes".into(),
                ));
            }
            (0..8).map(|i| Extent::parse_plus(&data[i * 8..])).collect()
        }
    }
}

/// Source of overflow extent records. The real implementation walks the
/// Extents Overflow B-tree; tests substitute stubs.
pub trait OverflowLookup {
    /// The record whose key is exactly (file ID, fork, start block), as
    /// raw descriptor slots, or `None` if no such record exists.
    fn lookup(
        &self,
        source: &mut dyn ReadSeek,
        fork: ForkKind,
        file_id: u32,
        start_block: u64,
    ) -> Result<Option<Vec<Extent>>>;
}

impl<T: OverflowLookup + ?Sized> OverflowLookup for &T {
    fn lookup(
        &self,
        source: &mut dyn ReadSeek,
        fork: ForkKind,
        file_id: u32,
        start_block: u64,
    ) -> Result<Option<Vec<Extent>>> {
        (**self).lookup(source, fork, file_id, start_block)
    }
}

/// For forks whose extent list is known to be complete (the Extents
/// Overflow file itself, fully pre-resolved forks).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverflow;

impl OverflowLookup for NoOverflow {
    fn lookup(
        &self,
        _source: &mut dyn ReadSeek,
        _fork: ForkKind,
        _file_id: u32,
        _start_block: u64,
    ) -> Result<Option<Vec<Extent>>> {
        Ok(None)
    }
}

/// Resolver state. `Extending` means at least one overflow record has
/// been pulled in; `Exhausted` and `Failed` are terminal and suppress
/// further tree queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Bootstrapped,
    Extending,
    Exhausted,
    Failed,
}

/// Grows a fork's extent list on demand. Basic extents are consumed in
/// array order before any overflow record is requested; overflow
/// records are fetched with the cumulative block count as the key's
/// start block, so the resolved list is gapless and strictly ordered.
#[derive(Debug, Clone)]
pub struct ExtentResolver {
    fork: ForkKind,
    file_id: u32,
    extents: Vec<Extent>,
    known_blocks: u64,
    state: ResolveState,
}

impl ExtentResolver {
    pub fn new(fork: ForkKind, file_id: u32, basic: &[Extent]) -> Self {
        let mut extents = Vec::with_capacity(basic.len());
        let mut known_blocks = 0;
        let mut state = ResolveState::Bootstrapped;
        for e in basic {
            if e.is_end() {
                // A sentinel inside the inline array: the fork is fully
                // mapped without overflow records.
                state = ResolveState::Exhausted;
                break;
            }
            extents.push(*e);
            known_blocks += e.block_count;
        }
        ExtentResolver {
            fork,
            file_id,
            extents,
            known_blocks,
            state,
        }
    }

    /// Resolver over an extent list that is already complete; it will
    /// never query an overflow source.
    pub fn complete(fork: ForkKind, file_id: u32, extents: Vec<Extent>) -> Self {
        let mut r = ExtentResolver::new(fork, file_id, &extents);
        r.state = ResolveState::Exhausted;
        r
    }

    pub fn state(&self) -> ResolveState {
        self.state
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Allocation blocks covered by the extents resolved so far.
    pub fn known_blocks(&self) -> u64 {
        self.known_blocks
    }

    pub fn into_extents(self) -> Vec<Extent> {
        self.extents
    }

    /// The extent covering logical `block`, with the logical block
    /// number at which that extent begins. Fetches overflow records as
    /// needed; a missing record marks the resolver failed.
    pub fn locate(
        &mut self,
        source: &mut dyn ReadSeek,
        overflow: &dyn OverflowLookup,
        block: u64,
    ) -> Result<(Extent, u64)> {
        loop {
            if block < self.known_blocks {
                let mut first = 0;
                for e in &self.extents {
                    if block < first + e.block_count {
                        return Ok((*e, first));
                    }
                    first += e.block_count;
                }
            }
            match self.state {
                ResolveState::Exhausted | ResolveState::Failed => {
                    return Err(self.missing(block));
                }
                ResolveState::Bootstrapped | ResolveState::Extending => {
                    self.extend(source, overflow)?;
                }
            }
        }
    }

    fn extend(&mut self, source: &mut dyn ReadSeek, overflow: &dyn OverflowLookup) -> Result<()> {
        let batch = match overflow.lookup(source, self.fork, self.file_id, self.known_blocks) {
            Ok(b) => b,
            Err(e) => {
                self.state = ResolveState::Failed;
                return Err(e);
            }
        };
        let Some(batch) = batch else {
            self.state = ResolveState::Failed;
            return Err(self.missing(self.known_blocks));
        };
        self.state = ResolveState::Extending;
        let mut grew = false;
        for e in batch {
            if e.is_end() {
                self.state = ResolveState::Exhausted;
                break;
            }
            self.extents.push(e);
            self.known_blocks += e.block_count;
            grew = true;
        }
        if !grew && self.state != ResolveState::Exhausted {
            // An overflow record with no usable slots and no sentinel
            // would make this loop spin.
            self.state = ResolveState::Failed;
            return Err(Error::CorruptBTree(format!(
                "empty overflow extent record for CNID {}",
                self.file_id
            )));
        }
        Ok(())
    }

    fn missing(&self, block: u64) -> Error {
        Error::MissingOverflowExtent {
            fork: self.fork,
            file_id: self.file_id,
            start_block: block,
        }
    }
}

/// A fully-resolved extent list plus the geometry needed to map
/// fork-relative byte offsets to absolute offsets in the source.
#[derive(Debug, Clone)]
pub struct ForkSpan {
    geometry: Geometry,
    extents: Vec<Extent>,
    length: u64,
}

impl ForkSpan {
    pub fn new(geometry: Geometry, extents: Vec<Extent>, length: u64) -> Self {
        let end = extents.iter().position(Extent::is_end);
        let mut extents = extents;
        if let Some(end) = end {
            extents.truncate(end);
        }
        ForkSpan {
            geometry,
            extents,
            length,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Absolute source offset and remaining contiguous run length for a
    /// fork-relative offset, or `None` past the mapped extents.
    pub fn map(&self, offset: u64) -> Option<(u64, u64)> {
        let block_size = self.geometry.block_size;
        let mut covered = 0;
        for e in &self.extents {
            let len = e.block_count * block_size;
            if offset < covered + len {
                let skip = offset - covered;
                return Some((self.geometry.block_offset(e.start_block) + skip, len - skip));
            }
            covered += len;
        }
        None
    }

    /// Read exactly `buf.len()` bytes at `offset` within the fork,
    /// crossing extent boundaries as needed.
    pub fn read_exact_at(
        &self,
        source: &mut dyn ReadSeek,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let fork_off = offset + done as u64;
            let Some((abs, run)) = self.map(fork_off) else {
                return Err(Error::MalformedStructure(format!(
                    "read at {fork_off} past the mapped extents of a fork"
                )));
            };
            let chunk = ((buf.len() - done) as u64).min(run) as usize;
            source.seek(std::io::SeekFrom::Start(abs))?;
            source.read_exact(&mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }
}

/// Handle on the Extents Overflow file's B-tree. Its own extents are
/// inline in the volume header by format guarantee, so opening it never
/// recurses into overflow resolution.
#[derive(Debug, Clone)]
pub struct ExtentsOverflowFile {
    tree: BTree,
}

impl ExtentsOverflowFile {
    pub fn open(
        source: &mut dyn ReadSeek,
        geometry: Geometry,
        fork: &ForkData,
        variant: Variant,
    ) -> Result<Self> {
        let span = ForkSpan::new(geometry, fork.extents.clone(), fork.logical_size);
        let tree = BTree::open(source, span, variant)?;
        Ok(ExtentsOverflowFile { tree })
    }

    pub fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Exact-key lookup returning the record's raw descriptor slots.
    pub fn record_for(&self, source: &mut dyn ReadSeek, key: ExtentKey) -> Result<Option<Vec<Extent>>> {
        let variant = self.tree.variant();
        let found = self.tree.find(source, |raw| {
            Ok(ExtentKey::parse(variant, raw)?.compare(&key))
        })?;
        match found {
            Some(rec) => Ok(Some(parse_overflow_record(variant, &rec.data)?)),
            None => Ok(None),
        }
    }
}

impl OverflowLookup for ExtentsOverflowFile {
    fn lookup(
        &self,
        source: &mut dyn ReadSeek,
        fork: ForkKind,
        file_id: u32,
        start_block: u64,
    ) -> Result<Option<Vec<Extent>>> {
        self.record_for(
            source,
            ExtentKey {
                fork,
                file_id,
                start_block,
            },
        )
    }
}

/// Stub overflow source backed by a map, for tests of the resolver and
/// fork streams.
#[cfg(test)]
pub(crate) struct StubOverflow(
    pub(crate) std::collections::HashMap<(u32, u8, u64), Vec<Extent>>,
);

#[cfg(test)]
impl OverflowLookup for StubOverflow {
    fn lookup(
        &self,
        _source: &mut dyn ReadSeek,
        fork: ForkKind,
        file_id: u32,
        start_block: u64,
    ) -> Result<Option<Vec<Extent>>> {
        Ok(self
            .0
            .get(&(file_id, fork.key_byte(), start_block))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    fn geometry() -> Geometry {
        Geometry {
            fs_offset: 0,
            block_size: 512,
            first_block_offset: 0,
        }
    }

    #[test]
    fn test_extent_parse_both_widths() {
        let mut plus = [0u8; 8];
        BigEndian::write_u32(&mut plus[0..4], 100);
        BigEndian::write_u32(&mut plus[4..8], 50);
        let e = Extent::parse_plus(&plus).unwrap();
        assert_eq!(e, Extent::new(100, 50));
        assert!(!e.is_end());

        let mut classic = [0u8; 4];
        BigEndian::write_u16(&mut classic[0..2], 7);
        BigEndian::write_u16(&mut classic[2..4], 0);
        let e = Extent::parse_classic(&classic).unwrap();
        assert_eq!(e, Extent::new(7, 0));
        assert!(e.is_end());
    }

    #[test]
    fn test_fork_data_parse_plus() {
        let mut data = [0u8; 80];
        BigEndian::write_u64(&mut data[0..8], 123456);
        BigEndian::write_u32(&mut data[12..16], 31);
        BigEndian::write_u32(&mut data[16..20], 10);
        BigEndian::write_u32(&mut data[20..24], 31);
        let fork = ForkData::parse_plus(&data).unwrap();
        assert_eq!(fork.logical_size, 123456);
        assert_eq!(fork.total_blocks, 31);
        assert_eq!(fork.extents.len(), 8);
        assert_eq!(fork.extents[0], Extent::new(10, 31));
        assert!(fork.extents[1].is_end());
    }

    #[test]
    fn test_extent_key_ordering() {
        let k = |file_id, fork, start_block| ExtentKey {
            fork,
            file_id,
            start_block,
        };
        // File ID dominates fork type, fork type dominates start block.
        assert_eq!(
            k(5, ForkKind::Resource, 0).compare(&k(6, ForkKind::Data, 0)),
            Ordering::Less
        );
        assert_eq!(
            k(5, ForkKind::Data, 99).compare(&k(5, ForkKind::Resource, 0)),
            Ordering::Less
        );
        assert_eq!(
            k(5, ForkKind::Data, 10).compare(&k(5, ForkKind::Data, 20)),
            Ordering::Less
        );
        assert_eq!(
            k(5, ForkKind::Data, 10).compare(&k(5, ForkKind::Data, 10)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_extent_key_parse_round_trip() {
        let mut plus = [0u8; 10];
        plus[0] = 0xFF;
        BigEndian::write_u32(&mut plus[2..6], 42);
        BigEndian::write_u32(&mut plus[6..10], 80);
        let k = ExtentKey::parse(Variant::Plus, &plus).unwrap();
        assert_eq!(k.fork, ForkKind::Resource);
        assert_eq!(k.file_id, 42);
        assert_eq!(k.start_block, 80);

        let mut classic = [0u8; 7];
        classic[0] = 0x00;
        BigEndian::write_u32(&mut classic[1..5], 17);
        BigEndian::write_u16(&mut classic[5..7], 3);
        let k = ExtentKey::parse(Variant::Classic, &classic).unwrap();
        assert_eq!(k.fork, ForkKind::Data);
        assert_eq!(k.file_id, 17);
        assert_eq!(k.start_block, 3);
    }

    #[test]
    fn test_resolver_basic_extents_only() {
        let basic = [Extent::new(10, 4), Extent::new(50, 2), Extent::new(0, 0)];
        let mut r = ExtentResolver::new(ForkKind::Data, 20, &basic);
        assert_eq!(r.state(), ResolveState::Exhausted);
        assert_eq!(r.known_blocks(), 6);

        let mut src = Cursor::new(Vec::new());
        let (e, first) = r.locate(&mut src, &NoOverflow, 5).unwrap();
        assert_eq!(e, Extent::new(50, 2));
        assert_eq!(first, 4);
    }

    #[test]
    fn test_resolver_fetches_overflow_in_order() {
        // 8 basic extents of 10 blocks each, then one overflow record.
        let basic: Vec<Extent> = (0..8).map(|i| Extent::new(100 + i * 10, 10)).collect();
        let mut map = HashMap::new();
        map.insert(
            (5, 0x00, 80),
            vec![Extent::new(500, 20), Extent::new(0, 0)],
        );
        let stub = StubOverflow(map);
        let mut r = ExtentResolver::new(ForkKind::Data, 5, &basic);
        assert_eq!(r.state(), ResolveState::Bootstrapped);

        let mut src = Cursor::new(Vec::new());
        let (e, first) = r.locate(&mut src, &stub, 85).unwrap();
        assert_eq!(e, Extent::new(500, 20));
        assert_eq!(first, 80);
        assert_eq!(r.state(), ResolveState::Exhausted);

        // A later request past the sentinel fails without re-querying.
        let err = r.locate(&mut src, &stub, 150).unwrap_err();
        assert!(matches!(err, Error::MissingOverflowExtent { .. }));
    }

    #[test]
    fn test_resolver_missing_record_is_sticky() {
        let basic = [Extent::new(10, 4)];
        let stub = StubOverflow(HashMap::new());
        let mut r = ExtentResolver::new(ForkKind::Data, 5, &basic);
        let mut src = Cursor::new(Vec::new());

        let err = r.locate(&mut src, &stub, 10).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingOverflowExtent {
                fork: ForkKind::Data,
                file_id: 5,
                start_block: 4,
            }
        ));
        assert_eq!(r.state(), ResolveState::Failed);

        // Already-resolved extents stay readable after the failure.
        let (e, first) = r.locate(&mut src, &stub, 2).unwrap();
        assert_eq!(e, Extent::new(10, 4));
        assert_eq!(first, 0);
    }

    #[test]
    fn test_fork_span_maps_across_extents() {
        let span = ForkSpan::new(
            geometry(),
            vec![Extent::new(2, 2), Extent::new(10, 1), Extent::new(0, 0)],
            1400,
        );
        assert_eq!(span.extents().len(), 2);
        // Offset 0 is block 2 of the volume.
        assert_eq!(span.map(0), Some((1024, 1024)));
        // Offset 1025 is one byte into the second extent.
        assert_eq!(span.map(1025), Some((5121, 511)));
        assert_eq!(span.map(1536), None);
    }

    #[test]
    fn test_fork_span_read_exact_at_crosses_boundary() {
        let mut image = vec![0u8; 8192];
        image[1024..2048].fill(0xAA); // blocks 2-3, the first extent
        image[2048..3072].fill(0xBB); // adjacent blocks not in the fork
        image[5120..5632].fill(0xCC); // block 10, the second extent
        let span = ForkSpan::new(
            geometry(),
            vec![Extent::new(2, 2), Extent::new(10, 1)],
            1536,
        );
        let mut src = Cursor::new(image);
        let mut buf = [0u8; 4];
        span.read_exact_at(&mut src, 1022, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xAA, 0xCC, 0xCC]);
    }
}
