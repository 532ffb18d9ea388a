//! The on-disk B-tree format shared by the Catalog and Extents
//! Overflow files.
//!
//! A tree file is an array of fixed-size nodes. Node 0 is the header
//! node; its first record declares the node size, node count, root and
//! the leaf chain endpoints. Index nodes map keys to child node
//! numbers, leaf nodes hold the records, and all leaves form a doubly
//! linked list independent of the tree structure. Records sit at
//! offsets listed in a table growing backward from the node end.

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::extents::ForkSpan;
use crate::source::ReadSeek;
use crate::volume::Variant;

pub const NODE_DESCRIPTOR_LEN: usize = 14;
pub const HEADER_RECORD_LEN: usize = 106;

/// Key compare type byte values in the header record (HFSX).
pub const KEY_COMPARE_CASE_FOLDING: u8 = 0xCF;
pub const KEY_COMPARE_BINARY: u8 = 0xBC;

/// Index keys are padded to the maximum key length unless this header
/// attribute bit is set.
const ATTR_VARIABLE_INDEX_KEYS: u32 = 0x0000_0004;

/// How catalog node names are ordered in this tree. Fixed when the
/// tree is opened and applied to every comparison against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameOrder {
    Binary,
    CaseFolding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
}

impl NodeKind {
    fn from_raw(raw: i8) -> Result<Self> {
        match raw {
            -1 => Ok(NodeKind::Leaf),
            0 => Ok(NodeKind::Index),
            1 => Ok(NodeKind::Header),
            2 => Ok(NodeKind::Map),
            other => Err(Error::CorruptBTree(format!("unknown node kind {other}"))),
        }
    }
}

/// B-tree node descriptor (14 bytes at the start of each node).
#[derive(Debug, Clone, Copy)]
pub struct NodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: NodeKind,
    pub height: u8,
    pub num_records: u16,
}

impl NodeDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < NODE_DESCRIPTOR_LEN {
            return Err(Error::MalformedStructure(
                "node descriptor shorter than 14 bytes".into(),
            ));
        }
        Ok(NodeDescriptor {
            forward_link: BigEndian::read_u32(&data[0..4]),
            backward_link: BigEndian::read_u32(&data[4..8]),
            kind: NodeKind::from_raw(data[8] as i8)?,
            height: data[9],
            num_records: BigEndian::read_u16(&data[10..12]),
        })
    }
}

/// B-tree header record (record 0 of the header node).
#[derive(Debug, Clone, Copy)]
pub struct HeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    /// Raw compare-type byte; meaningful only for HFSX catalog trees.
    pub key_compare_raw: u8,
    pub attributes: u32,
}

impl HeaderRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_RECORD_LEN {
            return Err(Error::MalformedStructure(
                "B-tree header record shorter than 106 bytes".into(),
            ));
        }
        Ok(HeaderRecord {
            tree_depth: BigEndian::read_u16(&data[0..2]),
            root_node: BigEndian::read_u32(&data[2..6]),
            leaf_records: BigEndian::read_u32(&data[6..10]),
            first_leaf: BigEndian::read_u32(&data[10..14]),
            last_leaf: BigEndian::read_u32(&data[14..18]),
            node_size: BigEndian::read_u16(&data[18..20]),
            max_key_length: BigEndian::read_u16(&data[20..22]),
            total_nodes: BigEndian::read_u32(&data[22..26]),
            free_nodes: BigEndian::read_u32(&data[26..30]),
            key_compare_raw: data[37],
            attributes: BigEndian::read_u32(&data[38..42]),
        })
    }
}

/// A node's bytes plus its decoded descriptor and record offset table.
#[derive(Debug)]
pub struct Node {
    pub desc: NodeDescriptor,
    data: Vec<u8>,
    offsets: Vec<u16>,
}

impl Node {
    fn parse(data: Vec<u8>) -> Result<Self> {
        let desc = NodeDescriptor::parse(&data)?;
        let node_size = data.len();
        let count = desc.num_records as usize + 1;
        if NODE_DESCRIPTOR_LEN + count * 2 > node_size {
            return Err(Error::CorruptBTree(format!(
                "offset table for {} records does not fit a {node_size}-byte node",
                desc.num_records
            )));
        }
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let slot = node_size - 2 * (i + 1);
            offsets.push(BigEndian::read_u16(&data[slot..slot + 2]));
        }
        Ok(Node {
            desc,
            data,
            offsets,
        })
    }

    /// Raw bytes of record `index`, bounds-checked against the offset
    /// table and the node size.
    pub fn record(&self, index: usize) -> Result<&[u8]> {
        if index >= self.desc.num_records as usize {
            return Err(Error::CorruptBTree(format!(
                "record {index} out of range ({} records)",
                self.desc.num_records
            )));
        }
        let start = self.offsets[index] as usize;
        let end = self.offsets[index + 1] as usize;
        let limit = self.data.len() - 2 * self.offsets.len();
        if start < NODE_DESCRIPTOR_LEN || start >= end || end > limit {
            return Err(Error::CorruptBTree(format!(
                "record {index} spans {start}..{end} outside the usable node area"
            )));
        }
        Ok(&self.data[start..end])
    }
}

/// A record pulled out of a leaf node: the key body (without its length
/// prefix) and the record data following it.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

/// Handle on one open B-tree file. Holds the resolved extent span of
/// the tree file and the header-declared shape; all node reads go
/// through the span against a caller-supplied source.
#[derive(Debug, Clone)]
pub struct BTree {
    span: ForkSpan,
    header: HeaderRecord,
    variant: Variant,
    name_order: NameOrder,
}

impl BTree {
    /// Open a tree whose keys need no name ordering (the Extents
    /// Overflow file): names compare binary regardless of variant.
    pub fn open(source: &mut dyn ReadSeek, span: ForkSpan, variant: Variant) -> Result<Self> {
        Self::open_inner(source, span, variant, false)
    }

    /// Open a catalog tree: for HFSX the header's compare-type byte
    /// selects the name order and must be valid; classic HFS and HFS+
    /// always compare binary.
    pub fn open_catalog(
        source: &mut dyn ReadSeek,
        span: ForkSpan,
        variant: Variant,
    ) -> Result<Self> {
        Self::open_inner(source, span, variant, true)
    }

    fn open_inner(
        source: &mut dyn ReadSeek,
        span: ForkSpan,
        variant: Variant,
        catalog: bool,
    ) -> Result<Self> {
        let mut first = vec![0u8; NODE_DESCRIPTOR_LEN + HEADER_RECORD_LEN];
        span.read_exact_at(source, 0, &mut first)?;
        let desc = NodeDescriptor::parse(&first)?;
        if desc.kind != NodeKind::Header {
            return Err(Error::CorruptBTree(format!(
                "node 0 is a {:?} node, expected the header node",
                desc.kind
            )));
        }
        let header = HeaderRecord::parse(&first[NODE_DESCRIPTOR_LEN..])?;

        let node_size = header.node_size as u64;
        if node_size < 512 || !node_size.is_power_of_two() {
            return Err(Error::MalformedStructure(format!(
                "invalid B-tree node size {node_size}"
            )));
        }
        let needed = header.total_nodes as u64 * node_size;
        if span.length() < needed {
            return Err(Error::MalformedStructure(format!(
                "B-tree claims {} nodes of {node_size} bytes but the file has only {} bytes",
                header.total_nodes,
                span.length()
            )));
        }

        let name_order = match variant {
            Variant::Classic | Variant::Plus => NameOrder::Binary,
            Variant::X => {
                if catalog {
                    match header.key_compare_raw {
                        KEY_COMPARE_BINARY => NameOrder::Binary,
                        KEY_COMPARE_CASE_FOLDING => NameOrder::CaseFolding,
                        other => {
                            return Err(Error::MalformedStructure(format!(
                                "invalid HFSX key compare type 0x{other:02X}"
                            )))
                        }
                    }
                } else {
                    NameOrder::Binary
                }
            }
        };

        Ok(BTree {
            span,
            header,
            variant,
            name_order,
        })
    }

    pub fn header(&self) -> &HeaderRecord {
        &self.header
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn name_order(&self) -> NameOrder {
        self.name_order
    }

    /// Read and parse one node. The node number is validated against
    /// the header's node count before any I/O.
    pub fn node(&self, source: &mut dyn ReadSeek, number: u32) -> Result<Node> {
        if number >= self.header.total_nodes {
            return Err(Error::CorruptBTree(format!(
                "node {number} out of range ({} nodes)",
                self.header.total_nodes
            )));
        }
        let node_size = self.header.node_size as usize;
        let mut data = vec![0u8; node_size];
        self.span
            .read_exact_at(source, number as u64 * node_size as u64, &mut data)?;
        Node::parse(data)
    }

    fn key_length_field(&self) -> usize {
        match self.variant {
            Variant::Classic => 1,
            Variant::Plus | Variant::X => 2,
        }
    }

    fn read_key_length(&self, rec: &[u8]) -> Result<usize> {
        match self.variant {
            Variant::Classic => {
                if rec.is_empty() {
                    return Err(Error::CorruptBTree("empty record".into()));
                }
                Ok(rec[0] as usize)
            }
            Variant::Plus | Variant::X => {
                if rec.len() < 2 {
                    return Err(Error::CorruptBTree("record shorter than its key length".into()));
                }
                Ok(BigEndian::read_u16(&rec[0..2]) as usize)
            }
        }
    }

    /// Split a leaf record into key body and record data. Record data
    /// starts on the next even offset after the key.
    pub fn split_leaf_record<'a>(&self, rec: &'a [u8]) -> Result<(&'a [u8], &'a [u8])> {
        let field = self.key_length_field();
        let klen = self.read_key_length(rec)?;
        let data_start = (field + klen + 1) & !1;
        if field + klen > rec.len() || data_start > rec.len() {
            return Err(Error::CorruptBTree(format!(
                "key of {klen} bytes exceeds a {}-byte record",
                rec.len()
            )));
        }
        Ok((&rec[field..field + klen], &rec[data_start..]))
    }

    /// Split an index record into key body and child node number. In
    /// trees without variable-length index keys the key field is padded
    /// to the maximum key length.
    pub fn split_index_record<'a>(&self, rec: &'a [u8]) -> Result<(&'a [u8], u32)> {
        let field = self.key_length_field();
        let klen = self.read_key_length(rec)?;
        let occupied = if self.header.attributes & ATTR_VARIABLE_INDEX_KEYS != 0 {
            klen
        } else {
            self.header.max_key_length as usize
        };
        let child_start = (field + occupied + 1) & !1;
        if field + klen > rec.len() || child_start + 4 > rec.len() {
            return Err(Error::CorruptBTree(format!(
                "index record of {} bytes cannot hold a {klen}-byte key and a child pointer",
                rec.len()
            )));
        }
        Ok((
            &rec[field..field + klen],
            BigEndian::read_u32(&rec[child_start..child_start + 4]),
        ))
    }

    /// Exact-match search. `cmp` orders a stored key body relative to
    /// the search key (`Less` = stored key sorts first). Returns the
    /// matching leaf record, or `None` — corruption is an error, never
    /// a silent miss.
    pub fn find(
        &self,
        source: &mut dyn ReadSeek,
        mut cmp: impl FnMut(&[u8]) -> Result<Ordering>,
    ) -> Result<Option<Record>> {
        if self.header.root_node == 0 {
            return Ok(None);
        }
        let mut current = self.header.root_node;
        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > self.header.total_nodes {
                return Err(Error::CorruptBTree(
                    "B-tree descent did not terminate".into(),
                ));
            }
            let node = self.node(source, current)?;
            match node.desc.kind {
                NodeKind::Index => {
                    // Descend through the last record whose key does
                    // not exceed the search key.
                    let mut child = None;
                    for i in 0..node.desc.num_records as usize {
                        let (key, down) = self.split_index_record(node.record(i)?)?;
                        match cmp(key)? {
                            Ordering::Less | Ordering::Equal => child = Some(down),
                            Ordering::Greater => break,
                        }
                    }
                    match child {
                        Some(down) => current = down,
                        None => return Ok(None),
                    }
                }
                NodeKind::Leaf => {
                    for i in 0..node.desc.num_records as usize {
                        let (key, data) = self.split_leaf_record(node.record(i)?)?;
                        match cmp(key)? {
                            Ordering::Equal => {
                                return Ok(Some(Record {
                                    key: key.to_vec(),
                                    data: data.to_vec(),
                                }))
                            }
                            Ordering::Greater => return Ok(None),
                            Ordering::Less => {}
                        }
                    }
                    return Ok(None);
                }
                other => {
                    return Err(Error::CorruptBTree(format!(
                        "{other:?} node in the search path"
                    )))
                }
            }
        }
    }

    /// Ordered leaf iteration from the first leaf node.
    pub fn leaf_records<'t, 's>(
        &'t self,
        source: &'s mut dyn ReadSeek,
    ) -> Result<LeafCursor<'t, 's>> {
        let node = match self.header.first_leaf {
            0 => None,
            first => {
                let node = self.node(source, first)?;
                if node.desc.kind != NodeKind::Leaf {
                    return Err(Error::CorruptBTree(format!(
                        "first leaf points at a {:?} node",
                        node.desc.kind
                    )));
                }
                Some(node)
            }
        };
        Ok(LeafCursor {
            tree: self,
            source,
            node,
            index: 0,
            visited: 1,
        })
    }

    /// Ordered leaf iteration starting at the first record whose key is
    /// not less than the search key (the insertion point).
    pub fn leaf_records_from<'t, 's>(
        &'t self,
        source: &'s mut dyn ReadSeek,
        mut cmp: impl FnMut(&[u8]) -> Result<Ordering>,
    ) -> Result<LeafCursor<'t, 's>> {
        if self.header.root_node == 0 {
            return Ok(LeafCursor {
                tree: self,
                source,
                node: None,
                index: 0,
                visited: 0,
            });
        }
        let mut current = self.header.root_node;
        let mut steps = 0u32;
        let node = loop {
            steps += 1;
            if steps > self.header.total_nodes {
                return Err(Error::CorruptBTree(
                    "B-tree descent did not terminate".into(),
                ));
            }
            let node = self.node(source, current)?;
            match node.desc.kind {
                NodeKind::Index => {
                    let mut child = None;
                    for i in 0..node.desc.num_records as usize {
                        let (key, down) = self.split_index_record(node.record(i)?)?;
                        if child.is_none() {
                            // Keys smaller than the whole subtree start
                            // iteration at the leftmost child.
                            child = Some(down);
                        }
                        match cmp(key)? {
                            Ordering::Less | Ordering::Equal => child = Some(down),
                            Ordering::Greater => break,
                        }
                    }
                    match child {
                        Some(down) => current = down,
                        None => {
                            return Err(Error::CorruptBTree("index node with no records".into()))
                        }
                    }
                }
                NodeKind::Leaf => break node,
                other => {
                    return Err(Error::CorruptBTree(format!(
                        "{other:?} node in the search path"
                    )))
                }
            }
        };

        let mut index = node.desc.num_records as usize;
        for i in 0..node.desc.num_records as usize {
            let (key, _) = self.split_leaf_record(node.record(i)?)?;
            if cmp(key)? != Ordering::Less {
                index = i;
                break;
            }
        }
        Ok(LeafCursor {
            tree: self,
            source,
            node: Some(node),
            index,
            visited: steps,
        })
    }
}

/// Lazy, ordered walk over the leaf chain. Restartable by creating a
/// new cursor; not resumable across volume close.
pub struct LeafCursor<'t, 's> {
    tree: &'t BTree,
    source: &'s mut dyn ReadSeek,
    node: Option<Node>,
    index: usize,
    visited: u32,
}

impl LeafCursor<'_, '_> {
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let Some(node) = &self.node else {
                return Ok(None);
            };
            if self.index < node.desc.num_records as usize {
                let rec = node.record(self.index)?;
                self.index += 1;
                let (key, data) = self.tree.split_leaf_record(rec)?;
                return Ok(Some(Record {
                    key: key.to_vec(),
                    data: data.to_vec(),
                }));
            }
            let next = node.desc.forward_link;
            if next == 0 {
                self.node = None;
                return Ok(None);
            }
            self.visited += 1;
            if self.visited > self.tree.header.total_nodes {
                return Err(Error::CorruptBTree("leaf chain does not terminate".into()));
            }
            let node = self.tree.node(self.source, next)?;
            if node.desc.kind != NodeKind::Leaf {
                return Err(Error::CorruptBTree(format!(
                    "leaf chain reached a {:?} node",
                    node.desc.kind
                )));
            }
            self.node = Some(node);
            self.index = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extents::{Extent, ExtentKey, ForkKind};
    use crate::volume::Geometry;
    use std::io::Cursor;

    const NODE_SIZE: usize = 512;

    fn make_node(kind: i8, height: u8, fwd: u32, bwd: u32, recs: &[Vec<u8>]) -> Vec<u8> {
        let mut n = vec![0u8; NODE_SIZE];
        BigEndian::write_u32(&mut n[0..4], fwd);
        BigEndian::write_u32(&mut n[4..8], bwd);
        n[8] = kind as u8;
        n[9] = height;
        BigEndian::write_u16(&mut n[10..12], recs.len() as u16);
        let mut off = NODE_DESCRIPTOR_LEN;
        for (i, r) in recs.iter().enumerate() {
            let slot = NODE_SIZE - 2 * (i + 1);
            BigEndian::write_u16(&mut n[slot..slot + 2], off as u16);
            n[off..off + r.len()].copy_from_slice(r);
            off += r.len();
        }
        let free = NODE_SIZE - 2 * (recs.len() + 1);
        BigEndian::write_u16(&mut n[free..free + 2], off as u16);
        n
    }

    fn header_record(root: u32, first_leaf: u32, last_leaf: u32, total_nodes: u32) -> Vec<u8> {
        let mut h = vec![0u8; HEADER_RECORD_LEN];
        BigEndian::write_u16(&mut h[0..2], 1); // depth
        BigEndian::write_u32(&mut h[2..6], root);
        BigEndian::write_u32(&mut h[10..14], first_leaf);
        BigEndian::write_u32(&mut h[14..18], last_leaf);
        BigEndian::write_u16(&mut h[18..20], NODE_SIZE as u16);
        BigEndian::write_u16(&mut h[20..22], 10); // max key length
        BigEndian::write_u32(&mut h[22..26], total_nodes);
        h
    }

    /// An extent-style leaf or index record: u16 key length, 10-byte
    /// key, 4-byte payload (a child pointer for index nodes).
    fn extent_record(file_id: u32, start_block: u32, payload: u32) -> Vec<u8> {
        let mut r = vec![0u8; 16];
        BigEndian::write_u16(&mut r[0..2], 10);
        r[2] = 0x00; // data fork
        BigEndian::write_u32(&mut r[4..8], file_id);
        BigEndian::write_u32(&mut r[8..12], start_block);
        BigEndian::write_u32(&mut r[12..16], payload);
        r
    }

    fn tree_image(nodes: Vec<Vec<u8>>) -> (BTree, Cursor<Vec<u8>>) {
        let total = nodes.len() as u32;
        let image: Vec<u8> = nodes.concat();
        let geometry = Geometry {
            fs_offset: 0,
            block_size: NODE_SIZE as u64,
            first_block_offset: 0,
        };
        let span = ForkSpan::new(
            geometry,
            vec![Extent::new(0, total as u64)],
            image.len() as u64,
        );
        let mut source = Cursor::new(image);
        let tree = BTree::open(&mut source, span, Variant::Plus).unwrap();
        (tree, source)
    }

    fn search_for(file_id: u32, start_block: u64) -> impl FnMut(&[u8]) -> Result<Ordering> {
        let want = ExtentKey {
            fork: ForkKind::Data,
            file_id,
            start_block,
        };
        move |raw| Ok(ExtentKey::parse(Variant::Plus, raw)?.compare(&want))
    }

    #[test]
    fn test_open_reads_header() {
        let nodes = vec![
            make_node(1, 0, 0, 0, &[header_record(1, 1, 1, 2)]),
            make_node(-1, 1, 0, 0, &[extent_record(5, 0, 0xAA)]),
        ];
        let (tree, _) = tree_image(nodes);
        assert_eq!(tree.header().root_node, 1);
        assert_eq!(tree.header().node_size, NODE_SIZE as u16);
        assert_eq!(tree.name_order(), NameOrder::Binary);
    }

    #[test]
    fn test_open_rejects_bad_node_size() {
        let mut header = header_record(1, 1, 1, 2);
        BigEndian::write_u16(&mut header[18..20], 300); // not a power of two
        let image = [
            make_node(1, 0, 0, 0, &[header]),
            make_node(-1, 1, 0, 0, &[extent_record(5, 0, 0)]),
        ]
        .concat();
        let geometry = Geometry {
            fs_offset: 0,
            block_size: NODE_SIZE as u64,
            first_block_offset: 0,
        };
        let span = ForkSpan::new(geometry, vec![Extent::new(0, 2)], image.len() as u64);
        let err = BTree::open(&mut Cursor::new(image), span, Variant::Plus).unwrap_err();
        assert!(matches!(err, Error::MalformedStructure(_)));
    }

    #[test]
    fn test_open_rejects_short_stream() {
        // Header claims 8 nodes; the span only holds 2.
        let image = [
            make_node(1, 0, 0, 0, &[header_record(1, 1, 1, 8)]),
            make_node(-1, 1, 0, 0, &[extent_record(5, 0, 0)]),
        ]
        .concat();
        let geometry = Geometry {
            fs_offset: 0,
            block_size: NODE_SIZE as u64,
            first_block_offset: 0,
        };
        let span = ForkSpan::new(geometry, vec![Extent::new(0, 2)], image.len() as u64);
        let err = BTree::open(&mut Cursor::new(image), span, Variant::Plus).unwrap_err();
        assert!(matches!(err, Error::MalformedStructure(_)));
    }

    #[test]
    fn test_find_descends_index_to_leaf() {
        // Root index node fans out to two leaves chained together.
        let nodes = vec![
            make_node(1, 0, 0, 0, &[header_record(3, 1, 2, 4)]),
            make_node(
                -1,
                1,
                2,
                0,
                &[extent_record(2, 0, 0x11), extent_record(5, 0, 0x22)],
            ),
            make_node(
                -1,
                1,
                0,
                1,
                &[extent_record(5, 80, 0x33), extent_record(9, 0, 0x44)],
            ),
            make_node(
                0,
                2,
                0,
                0,
                &[extent_record(2, 0, 1), extent_record(5, 80, 2)],
            ),
        ];
        let (tree, mut src) = tree_image(nodes);

        let rec = tree.find(&mut src, search_for(5, 0)).unwrap().unwrap();
        assert_eq!(BigEndian::read_u32(&rec.data), 0x22);

        let rec = tree.find(&mut src, search_for(9, 0)).unwrap().unwrap();
        assert_eq!(BigEndian::read_u32(&rec.data), 0x44);

        // Present in no leaf: a clean miss, not an error.
        assert!(tree.find(&mut src, search_for(7, 0)).unwrap().is_none());
        // Smaller than every key in the tree: also a miss.
        assert!(tree.find(&mut src, search_for(1, 0)).unwrap().is_none());
    }

    #[test]
    fn test_find_rejects_out_of_range_child() {
        // The index record points at node 999 of a 3-node tree.
        let nodes = vec![
            make_node(1, 0, 0, 0, &[header_record(2, 1, 1, 3)]),
            make_node(-1, 1, 0, 0, &[extent_record(5, 0, 0x11)]),
            make_node(0, 2, 0, 0, &[extent_record(5, 0, 999)]),
        ];
        let (tree, mut src) = tree_image(nodes);
        let err = tree.find(&mut src, search_for(5, 0)).unwrap_err();
        assert!(matches!(err, Error::CorruptBTree(_)));
    }

    #[test]
    fn test_find_rejects_unexpected_node_kind() {
        // Root points at the header node itself.
        let nodes = vec![
            make_node(1, 0, 0, 0, &[header_record(0, 1, 1, 2)]),
            make_node(-1, 1, 0, 0, &[extent_record(5, 0, 0x11)]),
        ];
        let (tree, mut src) = tree_image(nodes);
        // Rewrite the root to 0 by hand: root 0 means an empty tree.
        assert!(tree.find(&mut src, search_for(5, 0)).unwrap().is_none());

        let nodes = vec![
            make_node(1, 0, 0, 0, &[header_record(2, 1, 1, 3)]),
            make_node(-1, 1, 0, 0, &[extent_record(5, 0, 0x11)]),
            make_node(0, 2, 0, 0, &[extent_record(5, 0, 0)]), // child 0: the header node
        ];
        let (tree, mut src) = tree_image(nodes);
        let err = tree.find(&mut src, search_for(5, 0)).unwrap_err();
        assert!(matches!(err, Error::CorruptBTree(_)));
    }

    #[test]
    fn test_leaf_chain_iteration() {
        let nodes = vec![
            make_node(1, 0, 0, 0, &[header_record(3, 1, 2, 4)]),
            make_node(
                -1,
                1,
                2,
                0,
                &[extent_record(2, 0, 0x11), extent_record(5, 0, 0x22)],
            ),
            make_node(
                -1,
                1,
                0,
                1,
                &[extent_record(5, 80, 0x33), extent_record(9, 0, 0x44)],
            ),
            make_node(
                0,
                2,
                0,
                0,
                &[extent_record(2, 0, 1), extent_record(5, 80, 2)],
            ),
        ];
        let (tree, mut src) = tree_image(nodes);

        let mut cursor = tree.leaf_records(&mut src).unwrap();
        let mut payloads = Vec::new();
        while let Some(rec) = cursor.next_record().unwrap() {
            payloads.push(BigEndian::read_u32(&rec.data));
        }
        assert_eq!(payloads, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_leaf_iteration_from_insertion_point() {
        let nodes = vec![
            make_node(1, 0, 0, 0, &[header_record(3, 1, 2, 4)]),
            make_node(
                -1,
                1,
                2,
                0,
                &[extent_record(2, 0, 0x11), extent_record(5, 0, 0x22)],
            ),
            make_node(
                -1,
                1,
                0,
                1,
                &[extent_record(5, 80, 0x33), extent_record(9, 0, 0x44)],
            ),
            make_node(
                0,
                2,
                0,
                0,
                &[extent_record(2, 0, 1), extent_record(5, 80, 2)],
            ),
        ];
        let (tree, mut src) = tree_image(nodes);

        // Key (5, 1) does not exist; iteration starts at (5, 80).
        let mut cursor = tree
            .leaf_records_from(&mut src, search_for(5, 1))
            .unwrap();
        let rec = cursor.next_record().unwrap().unwrap();
        assert_eq!(BigEndian::read_u32(&rec.data), 0x33);

        // Smaller than everything: starts at the very first record.
        let mut cursor = tree
            .leaf_records_from(&mut src, search_for(1, 0))
            .unwrap();
        let rec = cursor.next_record().unwrap().unwrap();
        assert_eq!(BigEndian::read_u32(&rec.data), 0x11);

        // Greater than everything: empty iteration.
        let mut cursor = tree
            .leaf_records_from(&mut src, search_for(99, 0))
            .unwrap();
        assert!(cursor.next_record().unwrap().is_none());
    }

    #[test]
    fn test_every_iterated_key_is_findable() {
        let nodes = vec![
            make_node(1, 0, 0, 0, &[header_record(3, 1, 2, 4)]),
            make_node(
                -1,
                1,
                2,
                0,
                &[extent_record(2, 0, 0x11), extent_record(5, 0, 0x22)],
            ),
            make_node(
                -1,
                1,
                0,
                1,
                &[extent_record(5, 80, 0x33), extent_record(9, 0, 0x44)],
            ),
            make_node(
                0,
                2,
                0,
                0,
                &[extent_record(2, 0, 1), extent_record(5, 80, 2)],
            ),
        ];
        let (tree, mut src) = tree_image(nodes);

        let mut keys = Vec::new();
        {
            let mut cursor = tree.leaf_records(&mut src).unwrap();
            while let Some(rec) = cursor.next_record().unwrap() {
                let key = ExtentKey::parse(Variant::Plus, &rec.key).unwrap();
                keys.push((key, rec.data.clone()));
            }
        }
        for (key, data) in keys {
            let rec = tree
                .find(&mut src, |raw| {
                    Ok(ExtentKey::parse(Variant::Plus, raw)?.compare(&key))
                })
                .unwrap()
                .unwrap();
            assert_eq!(rec.data, data);
        }
    }
}
