//! The directory entry (Dirent): one 128-byte node of the storage tree
//! (§4.C). One instance per storage, stream, or the root; held in a flat
//! array indexed by directory-stream position.
//!
//! https://winprotocoldoc.blob.core.windows.net/productionwindowsarchives/MS-CFB/%5bMS-CFB%5d.pdf

use crate::constants;
use crate::error::{CorruptReason, Error};
use crate::Result;
use chrono::NaiveDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    Unallocated,
    Storage,
    Stream,
    Root,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

/// One 128-byte directory record. Tree pointers (`left_sibling`,
/// `right_sibling`, `child`) and `children` are kept in sync by the engine,
/// not by `Dirent` itself — `Dirent` only knows how to parse/serialize its
/// own record and compare names.
#[derive(Clone, Debug)]
pub struct Dirent {
    pub name: String,
    pub object_type: ObjectType,
    pub color: Color,
    /// Tree pointer, not parent/child in the filesystem sense. `NO_STREAM`
    /// means "no sibling on this side".
    pub left_sibling: u32,
    pub right_sibling: u32,
    /// SID of this storage's child subtree root, or `NO_STREAM`.
    pub child: u32,
    pub clsid: [u8; 16],
    pub state_bits: u32,
    creation_time_raw: i64,
    modification_time_raw: i64,
    /// First sector of this entry's content: an index into the mini-FAT if
    /// `size < mini_cutoff` and this is a stream (or the root's mini-stream
    /// body, always big-FAT), otherwise an index into the big-FAT.
    pub start_sector: u32,
    pub size: u64,
    /// Ordered children (dirent-array indices), reconstructed by DFS on
    /// load and maintained directly thereafter; not itself a disk field.
    pub children: Vec<usize>,
}

impl Dirent {
    pub fn new_root() -> Self {
        Dirent {
            name: "Root Entry".to_string(),
            object_type: ObjectType::Root,
            color: Color::Black,
            left_sibling: constants::NO_STREAM,
            right_sibling: constants::NO_STREAM,
            child: constants::NO_STREAM,
            clsid: [0u8; 16],
            state_bits: 0,
            creation_time_raw: 0,
            modification_time_raw: 0,
            start_sector: constants::END_OF_CHAIN,
            size: 0,
            children: Vec::new(),
        }
    }

    pub fn new_storage(name: impl Into<String>) -> Self {
        Dirent {
            name: name.into(),
            object_type: ObjectType::Storage,
            color: Color::Black,
            left_sibling: constants::NO_STREAM,
            right_sibling: constants::NO_STREAM,
            child: constants::NO_STREAM,
            clsid: [0u8; 16],
            state_bits: 0,
            creation_time_raw: 0,
            modification_time_raw: 0,
            start_sector: constants::END_OF_CHAIN,
            size: 0,
            children: Vec::new(),
        }
    }

    pub fn new_stream(name: impl Into<String>) -> Self {
        Dirent {
            name: name.into(),
            object_type: ObjectType::Stream,
            color: Color::Black,
            left_sibling: constants::NO_STREAM,
            right_sibling: constants::NO_STREAM,
            child: constants::NO_STREAM,
            clsid: [0u8; 16],
            state_bits: 0,
            creation_time_raw: 0,
            modification_time_raw: 0,
            start_sector: constants::END_OF_CHAIN,
            size: 0,
            children: Vec::new(),
        }
    }

    pub fn is_storage_like(&self) -> bool {
        matches!(self.object_type, ObjectType::Storage | ObjectType::Root)
    }

    /// A copy of this dirent with fresh tree-pointer defaults and a new
    /// `children` list — used when repacking into a compacted dirent array,
    /// where tree pointers get reassigned by [`bulk_load_tree`] afterward.
    pub(crate) fn with_children(&self, children: Vec<usize>) -> Self {
        let mut d = self.clone();
        d.left_sibling = constants::NO_STREAM;
        d.right_sibling = constants::NO_STREAM;
        d.child = constants::NO_STREAM;
        d.children = children;
        d
    }

    pub fn creation_time(&self) -> Option<NaiveDateTime> {
        epochs::windows_file(self.creation_time_raw)
    }

    pub fn modification_time(&self) -> Option<NaiveDateTime> {
        epochs::windows_file(self.modification_time_raw)
    }

    pub fn parse(buf: &[u8], index: usize) -> Result<Self> {
        if buf.len() != constants::DIRENT_LEN {
            return Err(Error::Corrupt(CorruptReason::UnexpectedEof(
                constants::DIRENT_LEN,
                buf.len(),
            )));
        }

        let object_type = match buf[66] {
            constants::OBJECT_TYPE_UNALLOCATED => ObjectType::Unallocated,
            constants::OBJECT_TYPE_STORAGE => ObjectType::Storage,
            constants::OBJECT_TYPE_STREAM => ObjectType::Stream,
            constants::OBJECT_TYPE_ROOT => ObjectType::Root,
            other => {
                return Err(Error::Corrupt(CorruptReason::BadDirent(
                    index,
                    "object_type",
                    format!("{:#04x}", other),
                )))
            }
        };

        let name_len = u16::from_le_bytes(buf[64..66].try_into().unwrap()) as usize;
        let name = if object_type == ObjectType::Unallocated {
            String::new()
        } else {
            if name_len == 0
                || name_len > constants::DIRENT_NAME_FIELD_LEN
                || name_len % 2 != 0
            {
                return Err(Error::Corrupt(CorruptReason::BadDirent(
                    index,
                    "name_len",
                    name_len.to_string(),
                )));
            }
            let units: Vec<u16> = buf[0..name_len]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            let mut name = String::from_utf16(&units).map_err(|e| {
                Error::Corrupt(CorruptReason::BadDirent(index, "name", e.to_string()))
            })?;
            if name.ends_with('\u{0}') {
                name.pop();
            }
            name
        };

        let color = match buf[67] {
            constants::COLOR_RED => Color::Red,
            constants::COLOR_BLACK => Color::Black,
            other => {
                return Err(Error::Corrupt(CorruptReason::BadDirent(
                    index,
                    "color_flag",
                    format!("{:#04x}", other),
                )))
            }
        };

        let left_sibling = u32::from_le_bytes(buf[68..72].try_into().unwrap());
        let right_sibling = u32::from_le_bytes(buf[72..76].try_into().unwrap());
        let child = u32::from_le_bytes(buf[76..80].try_into().unwrap());
        let clsid: [u8; 16] = buf[80..96].try_into().unwrap();
        let state_bits = u32::from_le_bytes(buf[96..100].try_into().unwrap());
        let creation_time_raw = i64::from_le_bytes(buf[100..108].try_into().unwrap());
        let modification_time_raw = i64::from_le_bytes(buf[108..116].try_into().unwrap());
        let start_sector = u32::from_le_bytes(buf[116..120].try_into().unwrap());
        let size = u64::from_le_bytes(buf[120..128].try_into().unwrap());

        if object_type == ObjectType::Storage && size != 0 {
            return Err(Error::Corrupt(CorruptReason::BadDirent(
                index,
                "stream_size",
                "storage object has non-zero size".to_string(),
            )));
        }
        if object_type == ObjectType::Root && size % constants::MINI_SECTOR_SIZE as u64 != 0 {
            return Err(Error::Corrupt(CorruptReason::BadDirent(
                index,
                "stream_size",
                "root mini-stream size is not a multiple of the mini sector size".to_string(),
            )));
        }

        Ok(Dirent {
            name,
            object_type,
            color,
            left_sibling,
            right_sibling,
            child,
            clsid,
            state_bits,
            creation_time_raw,
            modification_time_raw,
            start_sector,
            size,
            children: Vec::new(),
        })
    }

    pub fn serialize(&self) -> [u8; constants::DIRENT_LEN] {
        let mut buf = [0u8; constants::DIRENT_LEN];

        if self.object_type != ObjectType::Unallocated {
            let mut units: Vec<u16> = self.name.encode_utf16().collect();
            units.truncate(constants::DIRENT_MAX_NAME_CHARS);
            units.push(0);
            for (i, unit) in units.iter().enumerate() {
                buf[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
            }
            let name_len = (units.len() * 2) as u16;
            buf[64..66].copy_from_slice(&name_len.to_le_bytes());
        }

        buf[66] = match self.object_type {
            ObjectType::Unallocated => constants::OBJECT_TYPE_UNALLOCATED,
            ObjectType::Storage => constants::OBJECT_TYPE_STORAGE,
            ObjectType::Stream => constants::OBJECT_TYPE_STREAM,
            ObjectType::Root => constants::OBJECT_TYPE_ROOT,
        };
        buf[67] = match self.color {
            Color::Red => constants::COLOR_RED,
            Color::Black => constants::COLOR_BLACK,
        };
        buf[68..72].copy_from_slice(&self.left_sibling.to_le_bytes());
        buf[72..76].copy_from_slice(&self.right_sibling.to_le_bytes());
        buf[76..80].copy_from_slice(&self.child.to_le_bytes());
        buf[80..96].copy_from_slice(&self.clsid);
        buf[96..100].copy_from_slice(&self.state_bits.to_le_bytes());
        buf[100..108].copy_from_slice(&self.creation_time_raw.to_le_bytes());
        buf[108..116].copy_from_slice(&self.modification_time_raw.to_le_bytes());
        buf[116..120].copy_from_slice(&self.start_sector.to_le_bytes());
        buf[120..128].copy_from_slice(&self.size.to_le_bytes());

        buf
    }
}

/// The OLE directory-tree ordering: `(name.length ASC, uppercased-name
/// ASC)`, where "length" is counted in UTF-16 code units (matching the
/// on-disk name-length field) and uppercasing is ASCII-only — this is the
/// historical OLE rule, and Unicode-aware case folding would disagree with
/// files written by other implementations (§9 "Name case folding").
pub fn name_order(a: &str, b: &str) -> std::cmp::Ordering {
    let a_units = a.encode_utf16().count();
    let b_units = b.encode_utf16().count();
    a_units
        .cmp(&b_units)
        .then_with(|| ascii_upper(a).cmp(&ascii_upper(b)))
}

fn ascii_upper(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii() { c.to_ascii_uppercase() } else { c })
        .collect()
}

/// Build a red-black (sub)tree over `sorted` (dirent-array indices, already
/// sorted by [`name_order`]), writing `left_sibling`/`right_sibling`/`color`
/// back into `dirents`. Returns the subtree's root SID, or `NO_STREAM` if
/// `sorted` is empty.
///
/// The construction is a median-split balanced BST, which places every leaf
/// at depth `floor(log2 n)` or `ceil(log2 n)`; coloring only the deepest
/// leaves red and everything else black satisfies both red-black invariants
/// (no two reds in a row, equal black-height on every root-to-NIL path)
/// without needing a rebalancing pass.
pub fn bulk_load_tree(dirents: &mut [Dirent], sorted: &[usize]) -> u32 {
    if sorted.is_empty() {
        return constants::NO_STREAM;
    }

    let mut depth_of = std::collections::HashMap::with_capacity(sorted.len());
    record_depths(sorted, 0, &mut depth_of);
    let max_depth = *depth_of.values().max().unwrap();

    build_subtree(dirents, sorted, &depth_of, max_depth)
}

fn record_depths(items: &[usize], depth: u32, out: &mut std::collections::HashMap<usize, u32>) {
    if items.is_empty() {
        return;
    }
    let mid = items.len() / 2;
    out.insert(items[mid], depth);
    record_depths(&items[..mid], depth + 1, out);
    record_depths(&items[mid + 1..], depth + 1, out);
}

fn build_subtree(
    dirents: &mut [Dirent],
    items: &[usize],
    depth_of: &std::collections::HashMap<usize, u32>,
    max_depth: u32,
) -> u32 {
    if items.is_empty() {
        return constants::NO_STREAM;
    }
    let mid = items.len() / 2;
    let idx = items[mid];
    let left = build_subtree(dirents, &items[..mid], depth_of, max_depth);
    let right = build_subtree(dirents, &items[mid + 1..], depth_of, max_depth);
    let is_leaf = left == constants::NO_STREAM && right == constants::NO_STREAM;
    let depth = depth_of[&idx];

    dirents[idx].left_sibling = left;
    dirents[idx].right_sibling = right;
    dirents[idx].color = if is_leaf && depth == max_depth {
        Color::Red
    } else {
        Color::Black
    };

    idx as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_bytes() {
        let mut d = Dirent::new_stream("hello");
        d.start_sector = 7;
        d.size = 5;
        d.state_bits = 0xdead_beef;
        let bytes = d.serialize();
        let parsed = Dirent::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.name, "hello");
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn name_order_by_length_then_ascii_upper() {
        assert_eq!(name_order("a", "bb"), std::cmp::Ordering::Less);
        assert_eq!(name_order("ab", "AB"), std::cmp::Ordering::Equal);
        assert_eq!(name_order("abc", "ABD"), std::cmp::Ordering::Less);
    }

    #[test]
    fn name_order_leaves_non_ascii_untouched() {
        // uppercasing is ASCII-only: a lowercase-only non-ASCII letter does
        // not compare equal to its uppercase form.
        assert_ne!(name_order("\u{00e9}", "\u{00c9}"), std::cmp::Ordering::Equal);
    }

    #[test]
    fn bulk_load_round_trips_through_dfs() {
        let names = vec!["zeta", "alpha", "gamma", "beta", "epsilon", "delta", "eta"];
        let mut dirents: Vec<Dirent> = names.iter().map(|n| Dirent::new_stream(*n)).collect();
        let mut order: Vec<usize> = (0..dirents.len()).collect();
        order.sort_by(|&a, &b| name_order(&dirents[a].name, &dirents[b].name));

        let root = bulk_load_tree(&mut dirents, &order);

        // DFS (left, self, right) from `root` must yield the sorted order.
        let mut out = Vec::new();
        fn dfs(dirents: &[Dirent], sid: u32, out: &mut Vec<usize>) {
            if sid == constants::NO_STREAM {
                return;
            }
            let d = &dirents[sid as usize];
            dfs(dirents, d.left_sibling, out);
            out.push(sid as usize);
            dfs(dirents, d.right_sibling, out);
        }
        dfs(&dirents, root, &mut out);
        assert_eq!(out, order);
    }

    #[test]
    fn bulk_load_empty_yields_no_stream() {
        let mut dirents: Vec<Dirent> = Vec::new();
        assert_eq!(bulk_load_tree(&mut dirents, &[]), constants::NO_STREAM);
    }
}
