//! Catalog keys and leaf records.
//!
//! The catalog B-tree maps (parent ID, node name) to file, folder and
//! thread records. Classic HFS names are MacRoman Pascal strings and
//! keys carry a one-byte length; HFS+/HFSX names are UTF-16BE and keys
//! carry a two-byte length. Thread records key on (CNID, empty name)
//! and exist so a catalog node ID can be resolved to its parent and
//! name without scanning.

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;

use crate::btree::NameOrder;
use crate::error::{Error, Result};
use crate::extents::ForkData;
use crate::unicode;
use crate::volume::Variant;

/// Reserved catalog node IDs.
pub const ROOT_PARENT_ID: u32 = 1;
pub const ROOT_FOLDER_ID: u32 = 2;
pub const EXTENTS_FILE_ID: u32 = 3;
pub const CATALOG_FILE_ID: u32 = 4;
pub const BAD_BLOCK_FILE_ID: u32 = 5;
pub const ALLOCATION_FILE_ID: u32 = 6;
pub const FIRST_USER_ID: u32 = 16;

/// Catalog record types (same numbering in both variants).
const REC_FOLDER: u8 = 1;
const REC_FILE: u8 = 2;
const REC_FOLDER_THREAD: u8 = 3;
const REC_FILE_THREAD: u8 = 4;

/// A catalog node name in its on-disk form. Kept raw so that key
/// comparison uses the stored code units or bytes, not a decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeName {
    Unicode(Vec<u16>),
    MacRoman(Vec<u8>),
}

impl NodeName {
    pub fn is_empty(&self) -> bool {
        match self {
            NodeName::Unicode(u) => u.is_empty(),
            NodeName::MacRoman(b) => b.is_empty(),
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            NodeName::Unicode(u) => unicode::units_to_string(u),
            NodeName::MacRoman(b) => unicode::mac_roman_to_string(b),
        }
    }
}

/// A catalog key: parent folder ID plus node name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_id: u32,
    pub name: NodeName,
}

impl CatalogKey {
    /// Decode a key body (without its length prefix) in either width.
    pub fn parse(variant: Variant, key: &[u8]) -> Result<Self> {
        match variant {
            Variant::Classic => {
                // reserved (1) + parent ID (4) + Pascal name
                if key.len() < 6 {
                    return Err(Error::CorruptBTree(
                        "catalog key shorter than 6 bytes".into(),
                    ));
                }
                let parent_id = BigEndian::read_u32(&key[1..5]);
                let name_len = key[5] as usize;
                if 6 + name_len > key.len() {
                    return Err(Error::CorruptBTree(format!(
                        "catalog key name of {name_len} bytes exceeds the key"
                    )));
                }
                Ok(CatalogKey {
                    parent_id,
                    name: NodeName::MacRoman(key[6..6 + name_len].to_vec()),
                })
            }
            Variant::Plus | Variant::X => {
                // parent ID (4) + name length (2) + UTF-16BE units
                if key.len() < 6 {
                    return Err(Error::CorruptBTree(
                        "catalog key shorter than 6 bytes".into(),
                    ));
                }
                let parent_id = BigEndian::read_u32(&key[0..4]);
                let name_len = BigEndian::read_u16(&key[4..6]) as usize;
                if 6 + name_len * 2 > key.len() {
                    return Err(Error::CorruptBTree(format!(
                        "catalog key name of {name_len} units exceeds the key"
                    )));
                }
                Ok(CatalogKey {
                    parent_id,
                    name: NodeName::Unicode(unicode::utf16be_to_units(&key[6..6 + name_len * 2])),
                })
            }
        }
    }

    /// The key of a CNID's thread record: the CNID as parent plus an
    /// empty name. Also the lower bound for listing a folder's
    /// children, since the empty name sorts first under both orders.
    pub fn thread(variant: Variant, cnid: u32) -> Self {
        CatalogKey {
            parent_id: cnid,
            name: match variant {
                Variant::Classic => NodeName::MacRoman(Vec::new()),
                Variant::Plus | Variant::X => NodeName::Unicode(Vec::new()),
            },
        }
    }

    /// Build a search key for a name given as a string. `None` when the
    /// name cannot exist on the variant (not representable in MacRoman
    /// on classic volumes).
    pub fn for_search(variant: Variant, parent_id: u32, name: &str) -> Option<Self> {
        let name = match variant {
            Variant::Classic => NodeName::MacRoman(unicode::string_to_mac_roman(name)?),
            Variant::Plus | Variant::X => NodeName::Unicode(unicode::string_to_units(name)),
        };
        Some(CatalogKey { parent_id, name })
    }

    /// Order this key relative to `other` under the tree's name order.
    /// Parent IDs compare as unsigned integers first; names compare by
    /// the strategy fixed at tree open.
    pub fn compare(&self, other: &CatalogKey, order: NameOrder) -> Ordering {
        self.parent_id
            .cmp(&other.parent_id)
            .then_with(|| match (&self.name, &other.name) {
                (NodeName::Unicode(a), NodeName::Unicode(b)) => match order {
                    NameOrder::Binary => unicode::compare_binary(a, b),
                    NameOrder::CaseFolding => unicode::compare_folded(a, b),
                },
                // Classic names compare as unsigned bytes.
                (NodeName::MacRoman(a), NodeName::MacRoman(b)) => a.cmp(b),
                // Mixed widths cannot come from one tree; widen and
                // compare binary to stay deterministic.
                (a, b) => {
                    let wa = widen(a);
                    let wb = widen(b);
                    unicode::compare_binary(&wa, &wb)
                }
            })
    }
}

fn widen(name: &NodeName) -> Vec<u16> {
    match name {
        NodeName::Unicode(u) => u.clone(),
        NodeName::MacRoman(b) => b.iter().map(|&x| x as u16).collect(),
    }
}

/// Decode a 4-byte Mac OS type/creator code to a string. Non-printable
/// bytes are replaced with '.'.
fn decode_fourcc(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// A catalog file record with both of its forks.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: u32,
    pub flags: u16,
    pub file_type: String,
    pub creator: String,
    /// Seconds since 1904-01-01, as stored on disk.
    pub create_date: u32,
    pub modify_date: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

#[derive(Debug, Clone)]
pub struct FolderRecord {
    pub folder_id: u32,
    pub flags: u16,
    /// Number of children, as maintained by the writer.
    pub valence: u32,
    pub create_date: u32,
    pub modify_date: u32,
}

/// Thread record: maps a CNID back to its parent and name.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub parent_id: u32,
    pub name: NodeName,
}

#[derive(Debug, Clone)]
pub enum CatalogRecord {
    File(FileRecord),
    Folder(FolderRecord),
    FileThread(ThreadRecord),
    FolderThread(ThreadRecord),
}

impl CatalogRecord {
    /// Decode a catalog leaf record's data in either variant.
    /// `block_size` sizes the classic forks, whose records store
    /// physical lengths in bytes.
    pub fn parse(variant: Variant, data: &[u8], block_size: u64) -> Result<Self> {
        match variant {
            Variant::Classic => Self::parse_classic(data, block_size),
            Variant::Plus | Variant::X => Self::parse_plus(data),
        }
    }

    fn record_type_plus(data: &[u8]) -> Result<u8> {
        if data.len() < 2 {
            return Err(Error::CorruptBTree("catalog record shorter than 2 bytes".into()));
        }
        let t = BigEndian::read_i16(&data[0..2]);
        u8::try_from(t).map_err(|_| Error::CorruptBTree(format!("invalid catalog record type {t}")))
    }

    fn parse_plus(data: &[u8]) -> Result<Self> {
        match Self::record_type_plus(data)? {
            REC_FOLDER => {
                if data.len() < 88 {
                    return Err(Error::CorruptBTree("folder record shorter than 88 bytes".into()));
                }
                Ok(CatalogRecord::Folder(FolderRecord {
                    folder_id: BigEndian::read_u32(&data[8..12]),
                    flags: BigEndian::read_u16(&data[2..4]),
                    valence: BigEndian::read_u32(&data[4..8]),
                    create_date: BigEndian::read_u32(&data[12..16]),
                    modify_date: BigEndian::read_u32(&data[16..20]),
                }))
            }
            REC_FILE => {
                if data.len() < 248 {
                    return Err(Error::CorruptBTree("file record shorter than 248 bytes".into()));
                }
                Ok(CatalogRecord::File(FileRecord {
                    file_id: BigEndian::read_u32(&data[8..12]),
                    flags: BigEndian::read_u16(&data[2..4]),
                    file_type: decode_fourcc(&data[48..52]),
                    creator: decode_fourcc(&data[52..56]),
                    create_date: BigEndian::read_u32(&data[12..16]),
                    modify_date: BigEndian::read_u32(&data[16..20]),
                    data_fork: ForkData::parse_plus(&data[88..168])?,
                    resource_fork: ForkData::parse_plus(&data[168..248])?,
                }))
            }
            t @ (REC_FOLDER_THREAD | REC_FILE_THREAD) => {
                if data.len() < 10 {
                    return Err(Error::CorruptBTree("thread record shorter than 10 bytes".into()));
                }
                let parent_id = BigEndian::read_u32(&data[4..8]);
                let name_len = BigEndian::read_u16(&data[8..10]) as usize;
                if 10 + name_len * 2 > data.len() {
                    return Err(Error::CorruptBTree(format!(
                        "thread name of {name_len} units exceeds the record"
                    )));
                }
                let thread = ThreadRecord {
                    parent_id,
                    name: NodeName::Unicode(unicode::utf16be_to_units(
                        &data[10..10 + name_len * 2],
                    )),
                };
                Ok(if t == REC_FOLDER_THREAD {
                    CatalogRecord::FolderThread(thread)
                } else {
                    CatalogRecord::FileThread(thread)
                })
            }
            other => Err(Error::CorruptBTree(format!(
                "invalid catalog record type {other}"
            ))),
        }
    }

    fn parse_classic(data: &[u8], block_size: u64) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::CorruptBTree("empty catalog record".into()));
        }
        match data[0] {
            REC_FOLDER => {
                if data.len() < 70 {
                    return Err(Error::CorruptBTree(
                        "directory record shorter than 70 bytes".into(),
                    ));
                }
                Ok(CatalogRecord::Folder(FolderRecord {
                    folder_id: BigEndian::read_u32(&data[6..10]),
                    flags: BigEndian::read_u16(&data[2..4]),
                    valence: BigEndian::read_u16(&data[4..6]) as u32,
                    create_date: BigEndian::read_u32(&data[10..14]),
                    modify_date: BigEndian::read_u32(&data[14..18]),
                }))
            }
            REC_FILE => {
                if data.len() < 102 {
                    return Err(Error::CorruptBTree(
                        "file record shorter than 102 bytes".into(),
                    ));
                }
                let data_len = BigEndian::read_u32(&data[26..30]) as u64;
                let data_phys = BigEndian::read_u32(&data[30..34]) as u64;
                let rsrc_len = BigEndian::read_u32(&data[36..40]) as u64;
                let rsrc_phys = BigEndian::read_u32(&data[40..44]) as u64;
                Ok(CatalogRecord::File(FileRecord {
                    file_id: BigEndian::read_u32(&data[20..24]),
                    flags: data[2] as u16,
                    file_type: decode_fourcc(&data[4..8]),
                    creator: decode_fourcc(&data[8..12]),
                    create_date: BigEndian::read_u32(&data[44..48]),
                    modify_date: BigEndian::read_u32(&data[48..52]),
                    data_fork: ForkData::parse_classic(
                        data_len,
                        data_phys / block_size.max(1),
                        &data[74..86],
                    )?,
                    resource_fork: ForkData::parse_classic(
                        rsrc_len,
                        rsrc_phys / block_size.max(1),
                        &data[86..98],
                    )?,
                }))
            }
            t @ (REC_FOLDER_THREAD | REC_FILE_THREAD) => {
                if data.len() < 15 {
                    return Err(Error::CorruptBTree(
                        "thread record shorter than 15 bytes".into(),
                    ));
                }
                let parent_id = BigEndian::read_u32(&data[10..14]);
                let name_len = data[14] as usize;
                if 15 + name_len > data.len() {
                    return Err(Error::CorruptBTree(format!(
                        "thread name of {name_len} bytes exceeds the record"
                    )));
                }
                let thread = ThreadRecord {
                    parent_id,
                    name: NodeName::MacRoman(data[15..15 + name_len].to_vec()),
                };
                Ok(if t == REC_FOLDER_THREAD {
                    CatalogRecord::FolderThread(thread)
                } else {
                    CatalogRecord::FileThread(thread)
                })
            }
            other => Err(Error::CorruptBTree(format!(
                "invalid catalog record type {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plus_key_bytes(parent: u32, name: &str) -> Vec<u8> {
        let units = unicode::string_to_units(name);
        let mut key = vec![0u8; 6 + units.len() * 2];
        BigEndian::write_u32(&mut key[0..4], parent);
        BigEndian::write_u16(&mut key[4..6], units.len() as u16);
        for (i, u) in units.iter().enumerate() {
            BigEndian::write_u16(&mut key[6 + i * 2..8 + i * 2], *u);
        }
        key
    }

    fn classic_key_bytes(parent: u32, name: &[u8]) -> Vec<u8> {
        let mut key = vec![0u8; 6 + name.len()];
        BigEndian::write_u32(&mut key[1..5], parent);
        key[5] = name.len() as u8;
        key[6..].copy_from_slice(name);
        key
    }

    #[test]
    fn test_parse_plus_key() {
        let raw = plus_key_bytes(2, "hello");
        let key = CatalogKey::parse(Variant::Plus, &raw).unwrap();
        assert_eq!(key.parent_id, 2);
        assert_eq!(key.name.to_display_string(), "hello");
    }

    #[test]
    fn test_parse_classic_key() {
        let raw = classic_key_bytes(17, b"System Folder");
        let key = CatalogKey::parse(Variant::Classic, &raw).unwrap();
        assert_eq!(key.parent_id, 17);
        assert_eq!(key.name.to_display_string(), "System Folder");
    }

    #[test]
    fn test_key_name_overrun_is_corrupt() {
        let mut raw = plus_key_bytes(2, "hi");
        BigEndian::write_u16(&mut raw[4..6], 200);
        assert!(matches!(
            CatalogKey::parse(Variant::Plus, &raw),
            Err(Error::CorruptBTree(_))
        ));
    }

    #[test]
    fn test_key_compare_parent_id_dominates() {
        let a = CatalogKey::for_search(Variant::Plus, 2, "zzz").unwrap();
        let b = CatalogKey::for_search(Variant::Plus, 3, "aaa").unwrap();
        assert_eq!(a.compare(&b, NameOrder::Binary), Ordering::Less);
        assert_eq!(a.compare(&b, NameOrder::CaseFolding), Ordering::Less);
    }

    #[test]
    fn test_key_compare_folding_vs_binary() {
        let upper = CatalogKey::for_search(Variant::Plus, 2, "Apple").unwrap();
        let lower = CatalogKey::for_search(Variant::Plus, 2, "apple").unwrap();
        // Folding: equal. Binary: ordered by raw unit value, 'A' < 'a'.
        assert_eq!(upper.compare(&lower, NameOrder::CaseFolding), Ordering::Equal);
        assert_eq!(upper.compare(&lower, NameOrder::Binary), Ordering::Less);
        assert_eq!(lower.compare(&upper, NameOrder::Binary), Ordering::Greater);
    }

    #[test]
    fn test_parse_plus_file_record() {
        let mut data = vec![0u8; 248];
        BigEndian::write_i16(&mut data[0..2], REC_FILE as i16);
        BigEndian::write_u16(&mut data[2..4], 0x0002);
        BigEndian::write_u32(&mut data[8..12], 42);
        BigEndian::write_u32(&mut data[12..16], 1000);
        BigEndian::write_u32(&mut data[16..20], 2000);
        data[48..52].copy_from_slice(b"TEXT");
        data[52..56].copy_from_slice(b"ttxt");
        BigEndian::write_u64(&mut data[88..96], 1234); // data fork size
        BigEndian::write_u32(&mut data[104..108], 10); // first extent start
        BigEndian::write_u32(&mut data[108..112], 3); // first extent count

        let rec = CatalogRecord::parse(Variant::Plus, &data, 512).unwrap();
        let CatalogRecord::File(f) = rec else {
            panic!("expected a file record");
        };
        assert_eq!(f.file_id, 42);
        assert_eq!(f.file_type, "TEXT");
        assert_eq!(f.creator, "ttxt");
        assert_eq!(f.create_date, 1000);
        assert_eq!(f.data_fork.logical_size, 1234);
        assert_eq!(f.data_fork.extents[0].start_block, 10);
        assert_eq!(f.resource_fork.logical_size, 0);
    }

    #[test]
    fn test_parse_plus_thread_record() {
        let units = unicode::string_to_units("Backup");
        let mut data = vec![0u8; 10 + units.len() * 2];
        BigEndian::write_i16(&mut data[0..2], REC_FOLDER_THREAD as i16);
        BigEndian::write_u32(&mut data[4..8], 2);
        BigEndian::write_u16(&mut data[8..10], units.len() as u16);
        for (i, u) in units.iter().enumerate() {
            BigEndian::write_u16(&mut data[10 + i * 2..12 + i * 2], *u);
        }

        let rec = CatalogRecord::parse(Variant::Plus, &data, 512).unwrap();
        let CatalogRecord::FolderThread(t) = rec else {
            panic!("expected a folder thread");
        };
        assert_eq!(t.parent_id, 2);
        assert_eq!(t.name.to_display_string(), "Backup");
    }

    #[test]
    fn test_parse_classic_file_record() {
        let mut data = vec![0u8; 102];
        data[0] = REC_FILE;
        data[4..8].copy_from_slice(b"APPL");
        data[8..12].copy_from_slice(b"MACS");
        BigEndian::write_u32(&mut data[20..24], 77);
        BigEndian::write_u32(&mut data[26..30], 600); // data logical length
        BigEndian::write_u32(&mut data[30..34], 1024); // data physical length
        BigEndian::write_u16(&mut data[74..76], 9); // first data extent start
        BigEndian::write_u16(&mut data[76..78], 2); // first data extent count

        let rec = CatalogRecord::parse(Variant::Classic, &data, 512).unwrap();
        let CatalogRecord::File(f) = rec else {
            panic!("expected a file record");
        };
        assert_eq!(f.file_id, 77);
        assert_eq!(f.file_type, "APPL");
        assert_eq!(f.data_fork.logical_size, 600);
        assert_eq!(f.data_fork.total_blocks, 2);
        assert_eq!(f.data_fork.extents[0].start_block, 9);
        assert_eq!(f.data_fork.extents[0].block_count, 2);
    }

    #[test]
    fn test_parse_rejects_unknown_record_type() {
        let mut data = vec![0u8; 16];
        BigEndian::write_i16(&mut data[0..2], 9);
        assert!(matches!(
            CatalogRecord::parse(Variant::Plus, &data, 512),
            Err(Error::CorruptBTree(_))
        ));
        let mut data = vec![0u8; 16];
        data[0] = 9;
        assert!(matches!(
            CatalogRecord::parse(Variant::Classic, &data, 512),
            Err(Error::CorruptBTree(_))
        ));
    }
}
