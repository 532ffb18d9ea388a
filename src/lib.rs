//! Read-only driver for the HFS family of filesystems (classic HFS,
//! HFS+, HFSX), built for browsing and recovering volumes from raw
//! disk images.
//!
//! The entry point is [`HfsVolume::open`] over anything `Read + Seek`.
//! From there: catalog lookups and folder listings through the catalog
//! B-tree, seekable per-fork byte streams that stitch inline and
//! overflow extents together transparently, and the allocation bitmap
//! for free-space reporting. Everything is decoded on demand from the
//! on-disk bytes; nothing is ever written back.
//!
//! ```no_run
//! use hfs_reader::{ForkKind, HfsVolume};
//!
//! let image = std::fs::File::open("volume.img")?;
//! let mut volume = HfsVolume::open(image, 0)?;
//! for (key, record) in volume.list_children(hfs_reader::catalog::ROOT_FOLDER_ID)? {
//!     println!("{}", key.name.to_display_string());
//!     if let hfs_reader::CatalogRecord::File(file) = record {
//!         let data = volume.read_fork(&file, ForkKind::Data, usize::MAX)?;
//!         println!("  {} bytes", data.len());
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod alloc;
pub mod btree;
pub mod catalog;
pub mod error;
pub mod extents;
pub mod fork;
pub mod source;
pub mod unicode;
pub mod volume;

pub use alloc::AllocationFile;
pub use btree::{BTree, NameOrder};
pub use catalog::{CatalogKey, CatalogRecord, FileRecord, FolderRecord, ThreadRecord};
pub use error::{Error, Result};
pub use extents::{
    Extent, ExtentKey, ExtentResolver, ExtentsOverflowFile, ForkData, ForkKind, NoOverflow,
    OverflowLookup, ResolveState,
};
pub use fork::ForkStream;
pub use source::SubSource;
pub use volume::{Geometry, HfsVolume, Mdb, Variant, VolumeHeader};
