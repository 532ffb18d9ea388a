//! Volume-level wiring: header decoding, variant selection, and the
//! `HfsVolume` handle tying the catalog, extents overflow and
//! allocation machinery to one byte source.
//!
//! The volume owns the single source handle; every operation takes
//! `&mut self`, so exclusive use of the source cursor is enforced by
//! the borrow checker rather than by convention. Fork streams handed to
//! callers hold the exclusive borrow for as long as they live.

use byteorder::{BigEndian, ByteOrder};
use std::io::{Read, Seek, SeekFrom};

use crate::alloc::AllocationFile;
use crate::btree::{BTree, NameOrder};
use crate::catalog::{
    CatalogKey, CatalogRecord, FileRecord, FolderRecord, ThreadRecord, ALLOCATION_FILE_ID,
    CATALOG_FILE_ID, ROOT_FOLDER_ID,
};
use crate::error::{Error, Result};
use crate::extents::{
    Extent, ExtentResolver, ExtentsOverflowFile, ForkData, ForkKind, ForkSpan,
};
use crate::fork::ForkStream;
use crate::source::ReadSeek;

const HFS_SIGNATURE: u16 = 0x4244; // "BD"
const HFS_PLUS_SIGNATURE: u16 = 0x482B; // "H+"
const HFSX_SIGNATURE: u16 = 0x4858; // "HX"

const HFS_PLUS_VERSION: u16 = 4;
const HFSX_VERSION: u16 = 5;

/// Where the volume header / master directory block sits, relative to
/// the start of the volume.
const HEADER_OFFSET: u64 = 1024;

/// The on-disk structure family of an open volume. Classic HFS uses
/// 16-bit block addressing and MacRoman names; HFS+ and HFSX use
/// 32-bit addressing and UTF-16 names. HFSX additionally declares its
/// catalog name order in the catalog tree header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Classic,
    Plus,
    X,
}

/// The numbers needed to turn an allocation block into an absolute
/// source offset.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Byte offset of the volume within the source.
    pub fs_offset: u64,
    /// Allocation block size in bytes.
    pub block_size: u64,
    /// Byte offset from the volume start to allocation block 0.
    pub first_block_offset: u64,
}

impl Geometry {
    pub fn block_offset(&self, block: u64) -> u64 {
        self.fs_offset + self.first_block_offset + block * self.block_size
    }
}

/// HFS+ / HFSX volume header (512 bytes at volume offset 1024).
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_catalog_id: u32,
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 512 {
            return Err(Error::MalformedStructure("volume header too short".into()));
        }
        let signature = BigEndian::read_u16(&data[0..2]);
        if signature != HFS_PLUS_SIGNATURE && signature != HFSX_SIGNATURE {
            return Err(Error::MalformedStructure(format!(
                "bad volume header signature 0x{signature:04X}"
            )));
        }
        let version = BigEndian::read_u16(&data[2..4]);
        if version != HFS_PLUS_VERSION && version != HFSX_VERSION {
            return Err(Error::MalformedStructure(format!(
                "unsupported volume format version {version}"
            )));
        }
        let block_size = BigEndian::read_u32(&data[40..44]);
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(Error::MalformedStructure(format!(
                "invalid allocation block size {block_size}"
            )));
        }
        Ok(VolumeHeader {
            signature,
            version,
            attributes: BigEndian::read_u32(&data[4..8]),
            block_size,
            total_blocks: BigEndian::read_u32(&data[44..48]),
            free_blocks: BigEndian::read_u32(&data[48..52]),
            next_catalog_id: BigEndian::read_u32(&data[64..68]),
            allocation_file: ForkData::parse_plus(&data[112..192])?,
            extents_file: ForkData::parse_plus(&data[192..272])?,
            catalog_file: ForkData::parse_plus(&data[272..352])?,
            attributes_file: ForkData::parse_plus(&data[352..432])?,
            startup_file: ForkData::parse_plus(&data[432..512])?,
        })
    }

    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }
}

/// Classic HFS master directory block (at volume offset 1024).
#[derive(Debug, Clone)]
pub struct Mdb {
    pub signature: u16,
    pub total_blocks: u16,
    pub block_size: u32,
    pub free_blocks: u16,
    pub volume_name: String,
    /// First sector of the volume bitmap.
    pub bitmap_start: u16,
    /// First allocation block, in 512-byte sectors from volume start.
    pub alloc_block_start: u16,
    pub next_catalog_id: u32,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub embedded_signature: u16,
    pub embedded_start_block: u16,
    pub embedded_block_count: u16,
}

impl Mdb {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 162 {
            return Err(Error::MalformedStructure(
                "master directory block too short".into(),
            ));
        }
        let signature = BigEndian::read_u16(&data[0..2]);
        if signature != HFS_SIGNATURE {
            return Err(Error::MalformedStructure(format!(
                "bad MDB signature 0x{signature:04X}"
            )));
        }
        let block_size = BigEndian::read_u32(&data[20..24]);
        if block_size == 0 || block_size % 512 != 0 {
            return Err(Error::MalformedStructure(format!(
                "invalid allocation block size {block_size}"
            )));
        }

        // Volume name: Pascal string, at most 27 characters.
        let name_len = (data[36] as usize).min(27);
        let volume_name = crate::unicode::mac_roman_to_string(&data[37..37 + name_len]);

        let extents_size = BigEndian::read_u32(&data[130..134]) as u64;
        let catalog_size = BigEndian::read_u32(&data[146..150]) as u64;
        let extents_file =
            ForkData::parse_classic(extents_size, extents_size / block_size as u64, &data[134..146])?;
        let catalog_file =
            ForkData::parse_classic(catalog_size, catalog_size / block_size as u64, &data[150..162])?;

        Ok(Mdb {
            signature,
            total_blocks: BigEndian::read_u16(&data[18..20]),
            block_size,
            free_blocks: BigEndian::read_u16(&data[34..36]),
            volume_name,
            bitmap_start: BigEndian::read_u16(&data[14..16]),
            alloc_block_start: BigEndian::read_u16(&data[28..30]),
            next_catalog_id: BigEndian::read_u32(&data[30..34]),
            extents_file,
            catalog_file,
            embedded_signature: BigEndian::read_u16(&data[124..126]),
            embedded_start_block: BigEndian::read_u16(&data[126..128]),
            embedded_block_count: BigEndian::read_u16(&data[128..130]),
        })
    }

    pub fn has_embedded_plus(&self) -> bool {
        self.embedded_signature == HFS_PLUS_SIGNATURE
    }

    /// Absolute offset of an embedded HFS+ volume within the source.
    pub fn embedded_offset(&self, fs_offset: u64) -> u64 {
        fs_offset
            + self.alloc_block_start as u64 * 512
            + self.embedded_start_block as u64 * self.block_size as u64
    }
}

/// An open volume: the owned source plus the derived, read-only
/// projections of its on-disk structures.
pub struct HfsVolume<R> {
    source: R,
    variant: Variant,
    geometry: Geometry,
    total_blocks: u64,
    free_blocks: u64,
    next_catalog_id: u32,
    label: String,
    catalog: BTree,
    extents_overflow: ExtentsOverflowFile,
    allocation: AllocationFile,
}

impl<R: Read + Seek> HfsVolume<R> {
    /// Open the volume at `fs_offset` within the source, detecting the
    /// variant from the signature at offset 1024. A classic volume
    /// wrapping an embedded HFS+ volume is followed into the embedded
    /// volume, as the wrapper exists only as a carrier.
    pub fn open(mut source: R, fs_offset: u64) -> Result<Self> {
        source.seek(SeekFrom::Start(fs_offset + HEADER_OFFSET))?;
        let mut sig = [0u8; 2];
        source.read_exact(&mut sig)?;
        match BigEndian::read_u16(&sig) {
            HFS_SIGNATURE => {
                let mdb = read_mdb(&mut source, fs_offset)?;
                if mdb.has_embedded_plus() {
                    let embedded = mdb.embedded_offset(fs_offset);
                    Self::open_plus(source, embedded)
                } else {
                    Self::open_classic(source, fs_offset, mdb)
                }
            }
            HFS_PLUS_SIGNATURE | HFSX_SIGNATURE => Self::open_plus(source, fs_offset),
            other => Err(Error::MalformedStructure(format!(
                "no HFS family signature at volume offset 1024 (found 0x{other:04X})"
            ))),
        }
    }

    fn open_plus(mut source: R, fs_offset: u64) -> Result<Self> {
        source.seek(SeekFrom::Start(fs_offset + HEADER_OFFSET))?;
        let mut buf = [0u8; 512];
        source.read_exact(&mut buf)?;
        let vh = VolumeHeader::parse(&buf)?;

        let variant = if vh.is_hfsx() {
            Variant::X
        } else {
            Variant::Plus
        };
        let geometry = Geometry {
            fs_offset,
            block_size: vh.block_size as u64,
            first_block_offset: 0,
        };

        // The extents overflow file's own extents are inline by format
        // guarantee; everything else resolves through it.
        let extents_overflow =
            ExtentsOverflowFile::open(&mut source, geometry, &vh.extents_file, variant)?;

        let catalog_span = resolve_span(
            &mut source,
            geometry,
            &vh.catalog_file,
            ForkKind::Data,
            CATALOG_FILE_ID,
            &extents_overflow,
        )?;
        let catalog = BTree::open_catalog(&mut source, catalog_span, variant)?;

        let alloc_span = resolve_span(
            &mut source,
            geometry,
            &vh.allocation_file,
            ForkKind::Data,
            ALLOCATION_FILE_ID,
            &extents_overflow,
        )?;
        let allocation = AllocationFile::new(alloc_span, variant);

        let mut volume = HfsVolume {
            source,
            variant,
            geometry,
            total_blocks: vh.total_blocks as u64,
            free_blocks: vh.free_blocks as u64,
            next_catalog_id: vh.next_catalog_id,
            label: String::new(),
            catalog,
            extents_overflow,
            allocation,
        };
        volume.label = match volume.thread_for(ROOT_FOLDER_ID)? {
            Some(thread) => thread.name.to_display_string(),
            None => String::new(),
        };
        Ok(volume)
    }

    fn open_classic(mut source: R, fs_offset: u64, mdb: Mdb) -> Result<Self> {
        let variant = Variant::Classic;
        let geometry = Geometry {
            fs_offset,
            block_size: mdb.block_size as u64,
            first_block_offset: mdb.alloc_block_start as u64 * 512,
        };

        let extents_overflow =
            ExtentsOverflowFile::open(&mut source, geometry, &mdb.extents_file, variant)?;

        let catalog_span = resolve_span(
            &mut source,
            geometry,
            &mdb.catalog_file,
            ForkKind::Data,
            CATALOG_FILE_ID,
            &extents_overflow,
        )?;
        let catalog = BTree::open_catalog(&mut source, catalog_span, variant)?;

        // The classic bitmap is not a fork: it occupies a fixed sector
        // range, presented here as a sector-addressed span.
        let bitmap_len = (mdb.total_blocks as u64).div_ceil(8);
        let bitmap_geometry = Geometry {
            fs_offset,
            block_size: 512,
            first_block_offset: 0,
        };
        let bitmap_span = ForkSpan::new(
            bitmap_geometry,
            vec![Extent::new(mdb.bitmap_start as u64, bitmap_len.div_ceil(512))],
            bitmap_len,
        );
        let allocation = AllocationFile::new(bitmap_span, variant);

        Ok(HfsVolume {
            source,
            variant,
            geometry,
            total_blocks: mdb.total_blocks as u64,
            free_blocks: mdb.free_blocks as u64,
            next_catalog_id: mdb.next_catalog_id,
            label: mdb.volume_name,
            catalog,
            extents_overflow,
            allocation,
        })
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn block_size(&self) -> u64 {
        self.geometry.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    pub fn next_catalog_id(&self) -> u32 {
        self.next_catalog_id
    }

    /// Volume label, if one was found.
    pub fn label(&self) -> Option<&str> {
        if self.label.is_empty() {
            None
        } else {
            Some(&self.label)
        }
    }

    /// The name order the catalog tree was opened with.
    pub fn name_order(&self) -> NameOrder {
        self.catalog.name_order()
    }

    /// Exact catalog lookup by parent folder ID and name.
    pub fn find(&mut self, parent_id: u32, name: &str) -> Result<Option<(CatalogKey, CatalogRecord)>> {
        let Some(key) = CatalogKey::for_search(self.variant, parent_id, name) else {
            return Ok(None);
        };
        self.find_by_key(&key)
    }

    /// Exact catalog lookup with an already-built key (as recovered
    /// from a thread record).
    pub fn find_by_key(&mut self, key: &CatalogKey) -> Result<Option<(CatalogKey, CatalogRecord)>> {
        let variant = self.variant;
        let order = self.catalog.name_order();
        let block_size = self.geometry.block_size;
        let found = self.catalog.find(&mut self.source, |raw| {
            Ok(CatalogKey::parse(variant, raw)?.compare(key, order))
        })?;
        match found {
            Some(rec) => {
                let key = CatalogKey::parse(variant, &rec.key)?;
                let record = CatalogRecord::parse(variant, &rec.data, block_size)?;
                Ok(Some((key, record)))
            }
            None => Ok(None),
        }
    }

    /// All file and folder records whose key's parent is `folder_id`,
    /// in key order. Thread records are not children and are skipped.
    pub fn list_children(&mut self, folder_id: u32) -> Result<Vec<(CatalogKey, CatalogRecord)>> {
        let variant = self.variant;
        let order = self.catalog.name_order();
        let block_size = self.geometry.block_size;
        // Lower bound: (folder_id, empty name) sorts before every real
        // child of the folder.
        let bound = CatalogKey::thread(variant, folder_id);

        let mut children = Vec::new();
        let mut cursor = self.catalog.leaf_records_from(&mut self.source, |raw| {
            Ok(CatalogKey::parse(variant, raw)?.compare(&bound, order))
        })?;
        while let Some(rec) = cursor.next_record()? {
            let key = CatalogKey::parse(variant, &rec.key)?;
            if key.parent_id != folder_id {
                break;
            }
            match CatalogRecord::parse(variant, &rec.data, block_size)? {
                CatalogRecord::FileThread(_) | CatalogRecord::FolderThread(_) => {}
                record => children.push((key, record)),
            }
        }
        Ok(children)
    }

    /// The thread record of a CNID, keyed by (CNID, empty name).
    pub fn thread_for(&mut self, cnid: u32) -> Result<Option<ThreadRecord>> {
        let variant = self.variant;
        let block_size = self.geometry.block_size;
        let record = match self.find_threaded(cnid)? {
            Some(data) => CatalogRecord::parse(variant, &data, block_size)?,
            None => return Ok(None),
        };
        match record {
            CatalogRecord::FileThread(t) | CatalogRecord::FolderThread(t) => Ok(Some(t)),
            _ => Err(Error::CorruptBTree(format!(
                "record keyed (CNID {cnid}, empty name) is not a thread"
            ))),
        }
    }

    fn find_threaded(&mut self, cnid: u32) -> Result<Option<Vec<u8>>> {
        let variant = self.variant;
        let order = self.catalog.name_order();
        let key = CatalogKey::thread(variant, cnid);
        let found = self.catalog.find(&mut self.source, |raw| {
            Ok(CatalogKey::parse(variant, raw)?.compare(&key, order))
        })?;
        Ok(found.map(|rec| rec.data))
    }

    /// The root folder's record.
    pub fn root_folder(&mut self) -> Result<FolderRecord> {
        let thread = self.thread_for(ROOT_FOLDER_ID)?.ok_or_else(|| {
            Error::CorruptBTree("catalog has no thread record for the root folder".into())
        })?;
        let key = CatalogKey {
            parent_id: thread.parent_id,
            name: thread.name,
        };
        match self.find_by_key(&key)? {
            Some((_, CatalogRecord::Folder(folder))) => Ok(folder),
            _ => Err(Error::CorruptBTree(
                "root folder thread does not lead to a folder record".into(),
            )),
        }
    }

    /// Path components from the root folder down to `cnid`, resolved
    /// through thread records. The root itself yields an empty path.
    pub fn path_to(&mut self, cnid: u32) -> Result<Vec<String>> {
        let mut components = Vec::new();
        let mut current = cnid;
        let mut hops = 0u32;
        while current != ROOT_FOLDER_ID {
            hops += 1;
            if hops > 512 {
                return Err(Error::CorruptBTree(
                    "catalog thread chain does not reach the root".into(),
                ));
            }
            let thread = self.thread_for(current)?.ok_or_else(|| {
                Error::CorruptBTree(format!("no thread record for CNID {current}"))
            })?;
            components.push(thread.name.to_display_string());
            current = thread.parent_id;
        }
        components.reverse();
        Ok(components)
    }

    /// A seekable stream over one fork of a file. The stream holds the
    /// volume's source exclusively for as long as it lives; overflow
    /// extents are fetched lazily as reads cross into them.
    pub fn fork_stream(
        &mut self,
        file: &FileRecord,
        kind: ForkKind,
    ) -> ForkStream<&mut R, &ExtentsOverflowFile> {
        let fork = match kind {
            ForkKind::Data => &file.data_fork,
            ForkKind::Resource => &file.resource_fork,
        };
        ForkStream::new(
            &mut self.source,
            self.geometry,
            fork,
            kind,
            file.file_id,
            &self.extents_overflow,
        )
    }

    /// Read a whole fork (up to `max_bytes`) into memory.
    pub fn read_fork(
        &mut self,
        file: &FileRecord,
        kind: ForkKind,
        max_bytes: usize,
    ) -> Result<Vec<u8>> {
        let mut stream = self.fork_stream(file, kind);
        let want = (stream.length() as usize).min(max_bytes);
        let mut data = vec![0u8; want];
        let mut got = 0;
        while got < want {
            let n = stream.read(&mut data[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        data.truncate(got);
        Ok(data)
    }

    pub fn allocation_file(&self) -> &AllocationFile {
        &self.allocation
    }

    /// Whether allocation block `block` is in use.
    pub fn is_block_used(&mut self, block: u64) -> Result<bool> {
        self.allocation.is_block_used(&mut self.source, block)
    }

    /// Direct access to the extents overflow tree.
    pub fn extents_overflow(&self) -> &ExtentsOverflowFile {
        &self.extents_overflow
    }

    pub fn into_source(self) -> R {
        self.source
    }
}

fn read_mdb(source: &mut dyn ReadSeek, fs_offset: u64) -> Result<Mdb> {
    source.seek(SeekFrom::Start(fs_offset + HEADER_OFFSET))?;
    let mut buf = [0u8; 162];
    source.read_exact(&mut buf)?;
    Mdb::parse(&buf)
}

/// Resolve a special file's complete extent list up front, querying the
/// overflow tree for any extents beyond the inline ones. Catalog and
/// allocation sessions then never re-enter the resolver.
fn resolve_span(
    source: &mut dyn ReadSeek,
    geometry: Geometry,
    fork: &ForkData,
    kind: ForkKind,
    file_id: u32,
    overflow: &ExtentsOverflowFile,
) -> Result<ForkSpan> {
    let mut resolver = ExtentResolver::new(kind, file_id, &fork.extents);
    let needed_blocks = fork.logical_size.div_ceil(geometry.block_size.max(1));
    if needed_blocks > 0 && resolver.known_blocks() < needed_blocks {
        resolver.locate(source, overflow, needed_blocks - 1)?;
    }
    Ok(ForkSpan::new(
        geometry,
        resolver.into_extents(),
        fork.logical_size,
    ))
}
