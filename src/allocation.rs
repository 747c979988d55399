//! Sector allocation tables (§4.B): a mapping `SID -> next SID or reserved
//! tag`, plus the DIFAT (`META_BAT`) bookkeeping that locates the big-FAT's
//! own pages.

use crate::constants::{self, sids_per_sector};
use crate::error::{CorruptReason, Error};
use crate::header::Header;
use crate::Result;

/// A sector-chain allocation table. The same type backs both the big-FAT
/// (big sectors of the host file) and the mini-FAT (mini sectors of the
/// mini-stream) — they differ only in which sector size their entries index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationTable {
    entries: Vec<u32>,
}

impl AllocationTable {
    pub fn new() -> Self {
        AllocationTable {
            entries: Vec::new(),
        }
    }

    pub fn from_entries(entries: Vec<u32>) -> Self {
        AllocationTable { entries }
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walk the chain starting at `start`, stopping at `END_OF_CHAIN`.
    /// `start == END_OF_CHAIN` (no content allocated) yields an empty chain.
    pub fn chain(&self, start: u32) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        if start == constants::END_OF_CHAIN {
            return Ok(out);
        }
        let mut visited = vec![false; self.entries.len()];
        let mut sid = start;
        loop {
            let idx = sid as usize;
            if idx >= self.entries.len() {
                return Err(Error::Corrupt(CorruptReason::SidOutOfRange(
                    sid,
                    self.entries.len(),
                )));
            }
            if visited[idx] {
                return Err(Error::Corrupt(CorruptReason::CyclicChain(start)));
            }
            visited[idx] = true;
            out.push(sid);
            let next = self.entries[idx];
            if next == constants::END_OF_CHAIN {
                break;
            }
            sid = next;
        }
        Ok(out)
    }

    /// Mark every sector in the chain starting at `start` as free. A no-op
    /// if `start == END_OF_CHAIN`.
    pub fn free(&mut self, start: u32) -> Result<()> {
        for sid in self.chain(start)? {
            self.entries[sid as usize] = constants::FREE_SID;
        }
        Ok(())
    }

    /// Allocate `count` fresh sectors and link them into one chain,
    /// extending the table by whole `sector_size`-sized pages when there
    /// aren't enough free entries already. Returns the chain's first SID
    /// (`END_OF_CHAIN` if `count == 0`).
    pub fn allocate(&mut self, count: usize, sector_size: u32) -> u32 {
        if count == 0 {
            return constants::END_OF_CHAIN;
        }

        let mut free_sids: Vec<u32> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == constants::FREE_SID)
            .map(|(i, _)| i as u32)
            .collect();

        while free_sids.len() < count {
            let grow_by = sids_per_sector(sector_size) as usize;
            let base = self.entries.len() as u32;
            self.entries
                .extend(std::iter::repeat(constants::FREE_SID).take(grow_by));
            free_sids.extend(base..base + grow_by as u32);
        }

        let chosen = &free_sids[0..count];
        for pair in chosen.windows(2) {
            self.entries[pair[0] as usize] = pair[1];
        }
        self.entries[chosen[count - 1] as usize] = constants::END_OF_CHAIN;
        chosen[0]
    }

    /// Grow or shrink the chain starting at `start` to hold exactly `bytes`
    /// bytes at `sector_size` bytes/sector. Returns the chain's (possibly
    /// new) first SID, `END_OF_CHAIN` if `bytes == 0`.
    pub fn truncate_to_size(&mut self, start: u32, bytes: u64, sector_size: u32) -> Result<u32> {
        let wanted = ((bytes + sector_size as u64 - 1) / sector_size as u64) as usize;
        let mut chain = self.chain(start)?;

        if wanted == 0 {
            if !chain.is_empty() {
                self.free(start)?;
            }
            return Ok(constants::END_OF_CHAIN);
        }

        if chain.is_empty() {
            return Ok(self.allocate(wanted, sector_size));
        }

        match chain.len().cmp(&wanted) {
            std::cmp::Ordering::Greater => {
                let tail_start = chain[wanted];
                self.entries[chain[wanted - 1] as usize] = constants::END_OF_CHAIN;
                self.free(tail_start)?;
                chain.truncate(wanted);
            }
            std::cmp::Ordering::Less => {
                let extra = self.allocate(wanted - chain.len(), sector_size);
                self.entries[*chain.last().unwrap() as usize] = extra;
            }
            std::cmp::Ordering::Equal => {}
        }

        Ok(chain[0])
    }

    /// Mark `sids` as reserved for the table's own on-disk storage
    /// (`FAT_SID` or `DIFAT_SID`), overwriting whatever was there.
    pub fn mark_reserved(&mut self, sids: &[u32], tag: u32) {
        for &sid in sids {
            self.entries[sid as usize] = tag;
        }
    }

    /// Serialize into `sector_size`-sized pages, little-endian, padded with
    /// `FREE_SID` bytes.
    pub fn to_sector_pages(&self, sector_size: u32) -> Vec<Vec<u8>> {
        let per_sector = sids_per_sector(sector_size) as usize;
        self.entries
            .chunks(per_sector)
            .map(|chunk| {
                let mut buf = Vec::with_capacity(sector_size as usize);
                for &sid in chunk {
                    buf.extend_from_slice(&sid.to_le_bytes());
                }
                buf.resize(sector_size as usize, 0xFF);
                buf
            })
            .collect()
    }
}

/// Materialize the flat list of big-FAT page SIDs from the header's inline
/// 109-entry prefix plus any linked overflow DIFAT sectors (§9 "Cyclic /
/// self-describing tables"). `read_sector` fetches one big sector's raw
/// bytes by SID.
pub fn read_difat<F>(header: &Header, sector_size: u32, mut read_sector: F) -> Result<Vec<u32>>
where
    F: FnMut(u32) -> Result<Vec<u8>>,
{
    let mut pages: Vec<u32> = header
        .difat_head
        .iter()
        .copied()
        .take_while(|&sid| sid != constants::FREE_SID)
        .collect();

    let per_sector = sids_per_sector(sector_size) as usize;
    let mut next = header.first_difat_sector;
    let mut hops = 0u32;
    while next != constants::END_OF_CHAIN {
        hops += 1;
        if hops > header.difat_sector_count + 1 {
            return Err(Error::Corrupt(CorruptReason::CyclicChain(next)));
        }
        let buf = read_sector(next)?;
        if buf.len() < sector_size as usize {
            return Err(Error::Corrupt(CorruptReason::UnexpectedEof(
                sector_size as usize,
                buf.len(),
            )));
        }
        let entries: Vec<u32> = buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        pages.extend(
            entries[..per_sector - 1]
                .iter()
                .copied()
                .take_while(|&sid| sid != constants::FREE_SID),
        );
        next = entries[per_sector - 1];
    }

    Ok(pages)
}

/// Read each big-FAT page named by `pages` and concatenate them into one
/// flat allocation table.
pub fn build_fat<F>(pages: &[u32], mut read_sector: F) -> Result<AllocationTable>
where
    F: FnMut(u32) -> Result<Vec<u8>>,
{
    let mut entries = Vec::new();
    for &sid in pages {
        let buf = read_sector(sid)?;
        entries.extend(
            buf.chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );
    }
    Ok(AllocationTable::from_entries(entries))
}

/// The DIFAT layout to write on repack: the header's inline 109-entry
/// prefix, plus any linked overflow sectors beyond that.
pub struct DifatLayout {
    pub head: [u32; constants::DIFAT_HEADER_ENTRIES],
    /// `(sid, sector bytes)` for each overflow DIFAT sector, in chain order.
    pub overflow_sectors: Vec<(u32, Vec<u8>)>,
    pub first_overflow_sid: u32,
}

/// Lay out the DIFAT for `fat_pages` (the big-FAT's own page SIDs),
/// allocating overflow sectors one at a time via `alloc_sid` when there are
/// more than 109 pages.
pub fn build_difat_layout(
    fat_pages: &[u32],
    sector_size: u32,
    mut alloc_sid: impl FnMut() -> u32,
) -> DifatLayout {
    let mut head = [constants::FREE_SID; constants::DIFAT_HEADER_ENTRIES];

    if fat_pages.len() <= constants::DIFAT_HEADER_ENTRIES {
        head[..fat_pages.len()].copy_from_slice(fat_pages);
        return DifatLayout {
            head,
            overflow_sectors: Vec::new(),
            first_overflow_sid: constants::END_OF_CHAIN,
        };
    }

    head.copy_from_slice(&fat_pages[..constants::DIFAT_HEADER_ENTRIES]);
    let remaining = &fat_pages[constants::DIFAT_HEADER_ENTRIES..];
    let per_sector = sids_per_sector(sector_size) as usize;
    let slots_per_overflow = per_sector - 1;

    let chunks: Vec<&[u32]> = remaining.chunks(slots_per_overflow).collect();
    let sids: Vec<u32> = (0..chunks.len()).map(|_| alloc_sid()).collect();

    let mut overflow_sectors = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let mut buf = vec![0xFFu8; sector_size as usize];
        for (j, &page) in chunk.iter().enumerate() {
            buf[j * 4..j * 4 + 4].copy_from_slice(&page.to_le_bytes());
        }
        let next = sids.get(i + 1).copied().unwrap_or(constants::END_OF_CHAIN);
        buf[slots_per_overflow * 4..slots_per_overflow * 4 + 4].copy_from_slice(&next.to_le_bytes());
        overflow_sectors.push((sids[i], buf));
    }

    DifatLayout {
        head,
        first_overflow_sid: sids.first().copied().unwrap_or(constants::END_OF_CHAIN),
        overflow_sectors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_walks_to_end() {
        // 0 -> 2 -> 1 -> END
        let t = AllocationTable::from_entries(vec![2, constants::END_OF_CHAIN, 1]);
        assert_eq!(t.chain(0).unwrap(), vec![0, 2, 1]);
    }

    #[test]
    fn chain_detects_cycle() {
        // 0 -> 1 -> 0 ...
        let t = AllocationTable::from_entries(vec![1, 0]);
        let err = t.chain(0).unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Corrupt);
    }

    #[test]
    fn chain_rejects_out_of_range_sid() {
        let t = AllocationTable::from_entries(vec![5]);
        assert!(t.chain(0).is_err());
    }

    #[test]
    fn allocate_extends_table_by_whole_sectors() {
        let mut t = AllocationTable::new();
        let first = t.allocate(3, 512);
        assert_eq!(t.len(), 512 / 4);
        assert_eq!(t.chain(first).unwrap().len(), 3);
    }

    #[test]
    fn free_reclaims_a_chain_for_reuse() {
        let mut t = AllocationTable::new();
        let first = t.allocate(2, 512);
        t.free(first).unwrap();
        assert!(t.entries().iter().all(|&e| e == constants::FREE_SID));
        let second = t.allocate(2, 512);
        // reused the same freed slots rather than growing again.
        assert_eq!(t.len(), 512 / 4);
        assert_eq!(second, first);
    }

    #[test]
    fn truncate_to_size_grows_and_shrinks() {
        let mut t = AllocationTable::new();
        let start = t.truncate_to_size(constants::END_OF_CHAIN, 1000, 512).unwrap();
        assert_eq!(t.chain(start).unwrap().len(), 2);

        let start = t.truncate_to_size(start, 4000, 512).unwrap();
        assert_eq!(t.chain(start).unwrap().len(), 8);

        let start = t.truncate_to_size(start, 1, 512).unwrap();
        assert_eq!(t.chain(start).unwrap().len(), 1);

        let start = t.truncate_to_size(start, 0, 512).unwrap();
        assert_eq!(start, constants::END_OF_CHAIN);
    }

    #[test]
    fn difat_overflow_round_trips_through_second_level_sector() {
        // more than 109 FAT pages forces an overflow DIFAT sector.
        let fat_pages: Vec<u32> = (0..150).collect();
        let mut next_sid = 1000u32;
        let layout = build_difat_layout(&fat_pages, 512, || {
            let sid = next_sid;
            next_sid += 1;
            sid
        });
        assert_eq!(layout.head.len(), constants::DIFAT_HEADER_ENTRIES);
        assert_eq!(&layout.head[..], &fat_pages[..constants::DIFAT_HEADER_ENTRIES]);
        assert_eq!(layout.overflow_sectors.len(), 1);
        assert_eq!(layout.first_overflow_sid, 1000);

        // now read it back via read_difat using a fake header + sector store.
        let mut header = Header::new_v3();
        header.difat_head = layout.head;
        header.first_difat_sector = layout.first_overflow_sid;
        header.difat_sector_count = layout.overflow_sectors.len() as u32;

        let store = layout.overflow_sectors.clone();
        let read_back = read_difat(&header, 512, |sid| {
            store
                .iter()
                .find(|(s, _)| *s == sid)
                .map(|(_, b)| b.clone())
                .ok_or(Error::Unsupported("sector not found in test store"))
        })
        .unwrap();

        assert_eq!(read_back, fat_pages);
    }
}
