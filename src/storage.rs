//! `Storage`: the engine composing Header + AllocationTable + Dirent +
//! RangesIO (§4.E). Owns the host handle, the two allocation tables, and
//! the flat dirent array; mutation is in-memory until `flush`/`close` runs
//! a repack.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use derivative::Derivative;

use crate::allocation::{self, AllocationTable};
use crate::constants;
use crate::directory::{bulk_load_tree, name_order, Dirent, ObjectType};
use crate::error::{CorruptReason, Error};
use crate::header::Header;
use crate::rangesio::{Ranges, RangesIO};
use crate::Result;

/// How a container was opened, mirroring POSIX `open(2)` flags (§9 "Open
/// questions, resolved": (a) mode-string semantics).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// `O_RDONLY`. `close`/`flush` never touch the host.
    Read,
    /// `O_RDWR`. `close`/`flush` repack in place.
    ReadWrite,
    /// `O_CREAT`. Starts from an empty container; behaves like `ReadWrite`
    /// from then on.
    Create,
    /// `O_CREAT | O_EXCL`. Like `Create`, but fails with `AlreadyExists` if
    /// the host path already exists.
    CreateNew,
}

/// Lets `Storage::flush` resize the host to exactly the repacked image's
/// length. Implemented for the two hosts this crate uses: real files, and
/// in-memory buffers for tests.
pub trait SetLen {
    fn set_len_bytes(&mut self, len: u64) -> io::Result<()>;
}

impl SetLen for std::fs::File {
    fn set_len_bytes(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl SetLen for std::io::Cursor<Vec<u8>> {
    fn set_len_bytes(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        Ok(())
    }
}

/// A CFB container. `H` is the host handle backing the on-disk bytes —
/// `std::fs::File` for real containers, `std::io::Cursor<Vec<u8>>` in
/// tests and for fully in-memory containers.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Storage<H> {
    #[derivative(Debug = "ignore")]
    host: H,
    header: Header,
    #[derivative(Debug = "ignore")]
    big_fat: AllocationTable,
    #[derivative(Debug = "ignore")]
    mini_fat: AllocationTable,
    dirents: Vec<Dirent>,
    mode: Mode,
    /// Set once a structural corruption is detected mid-operation; once
    /// set, `flush`/`close` refuse to repack (§7).
    corrupt: bool,
    host_path: Option<PathBuf>,
}

fn read_sector<H: Read + Seek>(host: &mut H, sid: u32, sector_size: u32) -> Result<Vec<u8>> {
    let offset = constants::HEADER_LEN as u64 + sid as u64 * sector_size as u64;
    host.seek(SeekFrom::Start(offset)).map_err(Error::Io)?;
    let mut buf = vec![0u8; sector_size as usize];
    host.read_exact(&mut buf).map_err(Error::Io)?;
    Ok(buf)
}

fn read_chain_bytes<H: Read + Seek>(
    host: &mut H,
    fat: &AllocationTable,
    start: u32,
    sector_size: u32,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for sid in fat.chain(start)? {
        out.extend(read_sector(host, sid, sector_size)?);
    }
    Ok(out)
}

fn dfs_collect(dirents: &[Dirent], sid: u32, out: &mut Vec<usize>) -> Result<()> {
    if sid == constants::NO_STREAM {
        return Ok(());
    }
    let idx = sid as usize;
    let d = dirents
        .get(idx)
        .ok_or_else(|| Error::Corrupt(CorruptReason::SidOutOfRange(sid, dirents.len())))?;
    dfs_collect(dirents, d.left_sibling, out)?;
    out.push(idx);
    dfs_collect(dirents, d.right_sibling, out)?;
    Ok(())
}

fn reconstruct_children(dirents: &mut Vec<Dirent>) -> Result<()> {
    for i in 0..dirents.len() {
        if !dirents[i].is_storage_like() {
            continue;
        }
        let child_root = dirents[i].child;
        let mut order = Vec::new();
        dfs_collect(dirents, child_root, &mut order)?;
        dirents[i].children = order;
    }
    Ok(())
}

fn place_padded(big_sectors: &mut [Vec<u8>], chain: &[u32], content: &[u8], sector_size: usize) {
    for (i, &sid) in chain.iter().enumerate() {
        let start = i * sector_size;
        let mut sector = vec![0u8; sector_size];
        if start < content.len() {
            let end = (start + sector_size).min(content.len());
            sector[..end - start].copy_from_slice(&content[start..end]);
        }
        big_sectors[sid as usize] = sector;
    }
}

fn place_pages(big_sectors: &mut [Vec<u8>], sids: &[u32], pages: &[Vec<u8>]) {
    for (sid, page) in sids.iter().zip(pages.iter()) {
        big_sectors[*sid as usize] = page.clone();
    }
}

impl<H: Read + Write + Seek> Storage<H> {
    /// Parse an existing container from `host`.
    pub fn from_reader(mut host: H, mode: Mode) -> Result<Self> {
        host.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        let mut hdr_buf = [0u8; constants::HEADER_LEN];
        host.read_exact(&mut hdr_buf).map_err(Error::Io)?;
        let header = Header::parse(&hdr_buf)?;
        let sector_size = header.big_sector_size();
        log::debug!(
            "opened container: major_version={} sector_size={} mini_cutoff={}",
            header.major_version,
            sector_size,
            header.mini_cutoff
        );

        let difat_pages = allocation::read_difat(&header, sector_size, |sid| {
            read_sector(&mut host, sid, sector_size)
        })?;
        let big_fat = allocation::build_fat(&difat_pages, |sid| {
            read_sector(&mut host, sid, sector_size)
        })?;

        let dir_bytes =
            read_chain_bytes(&mut host, &big_fat, header.first_directory_sector, sector_size)?;
        if dir_bytes.len() % constants::DIRENT_LEN != 0 {
            return Err(Error::Corrupt(CorruptReason::MisalignedDirectoryStream(
                dir_bytes.len(),
                constants::DIRENT_LEN,
            )));
        }
        let mut dirents: Vec<Dirent> = dir_bytes
            .chunks(constants::DIRENT_LEN)
            .enumerate()
            .map(|(i, chunk)| Dirent::parse(chunk, i))
            .collect::<Result<_>>()?;

        if dirents.is_empty() || dirents[0].object_type != ObjectType::Root {
            return Err(Error::Corrupt(CorruptReason::BadDirent(
                0,
                "object_type",
                "first directory entry is not the root storage".to_string(),
            )));
        }
        reconstruct_children(&mut dirents)?;

        let mini_fat = if header.first_mini_fat_sector == constants::END_OF_CHAIN {
            AllocationTable::new()
        } else {
            let bytes = read_chain_bytes(
                &mut host,
                &big_fat,
                header.first_mini_fat_sector,
                sector_size,
            )?;
            let entries = bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            AllocationTable::from_entries(entries)
        };

        Ok(Storage {
            host,
            header,
            big_fat,
            mini_fat,
            dirents,
            mode,
            corrupt: false,
            host_path: None,
        })
    }

    /// Build a fresh, empty container (no streams, just a root storage).
    pub fn empty(host: H, mode: Mode) -> Self {
        Storage {
            host,
            header: Header::new_v3(),
            big_fat: AllocationTable::new(),
            mini_fat: AllocationTable::new(),
            dirents: vec![Dirent::new_root()],
            mode,
            corrupt: false,
            host_path: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_writable(&self) -> bool {
        self.mode != Mode::Read && !self.corrupt
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn dirents(&self) -> &[Dirent] {
        &self.dirents
    }

    pub fn dirent(&self, idx: usize) -> &Dirent {
        &self.dirents[idx]
    }

    pub fn root(&self) -> &Dirent {
        &self.dirents[0]
    }

    const ROOT: usize = 0;

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.dirents[idx].children
    }

    /// Resolve a `/`-separated path from the root. Missing components, or
    /// an empty path under a non-root start, yield `None` rather than an
    /// error — callers map that to `NotFound` themselves (§4.E "Access").
    /// Duplicate names are representable; this returns the first match in
    /// children order (§9 (b), left unspecified beyond "not crashing").
    pub fn dirent_from_path(&self, path: &str) -> Option<usize> {
        let trimmed = path.trim_matches('/');
        let mut cur = Self::ROOT;
        if trimmed.is_empty() {
            return Some(cur);
        }
        for part in trimmed.split('/') {
            cur = self.dirents[cur]
                .children
                .iter()
                .copied()
                .find(|&c| self.dirents[c].name == part)?;
        }
        Some(cur)
    }

    /// Append a new storage or stream under `parent`. Fails with
    /// `NotDirectory` if `parent` is a stream.
    pub fn new_child(&mut self, parent: usize, kind: ObjectType, name: impl Into<String>) -> Result<usize> {
        if !self.is_writable() {
            return Err(Error::Unsupported("storage is read-only"));
        }
        if !self.dirents[parent].is_storage_like() {
            return Err(Error::NotDirectory(self.dirents[parent].name.clone()));
        }
        let dirent = match kind {
            ObjectType::Storage => Dirent::new_storage(name),
            ObjectType::Stream => Dirent::new_stream(name),
            _ => return Err(Error::Unsupported("new_child kind must be storage or stream")),
        };
        let idx = self.dirents.len();
        self.dirents.push(dirent);
        self.dirents[parent].children.push(idx);
        Ok(idx)
    }

    /// Remove `child` from `parent`'s children. The chain is freed on the
    /// next repack, not immediately. Fails with `NotEmpty` if `child` is a
    /// non-empty storage.
    pub fn delete(&mut self, parent: usize, child: usize) -> Result<()> {
        if !self.is_writable() {
            return Err(Error::Unsupported("storage is read-only"));
        }
        if self.dirents[child].object_type == ObjectType::Storage
            && !self.dirents[child].children.is_empty()
        {
            return Err(Error::NotEmpty(self.dirents[child].name.clone()));
        }
        let pos = self.dirents[parent]
            .children
            .iter()
            .position(|&c| c == child)
            .ok_or_else(|| Error::NotFound(self.dirents[child].name.clone()))?;
        self.dirents[parent].children.remove(pos);
        self.dirents[child].object_type = ObjectType::Unallocated;
        Ok(())
    }

    /// Open a stream for random-access read/write. Fails with `IsDirectory`
    /// if `idx` names a storage.
    pub fn open_stream(&mut self, idx: usize) -> Result<StreamIo<'_, H>> {
        if self.dirents[idx].object_type != ObjectType::Stream {
            return Err(Error::IsDirectory(self.dirents[idx].name.clone()));
        }
        Ok(StreamIo {
            storage: self,
            idx,
            pos: 0,
        })
    }

    /// Convenience: replace a stream's entire content in one call.
    pub fn write_stream(&mut self, idx: usize, data: &[u8]) -> Result<()> {
        self.resize_stream(idx, data.len() as u64)?;
        let mut io = self.open_stream(idx)?;
        io.write_all(data).map_err(Error::Io)?;
        Ok(())
    }

    pub fn to_tree(&self) -> String {
        let mut out = String::new();
        self.write_tree(Self::ROOT, 0, &mut out);
        out
    }

    fn write_tree(&self, idx: usize, depth: usize, out: &mut String) {
        let d = &self.dirents[idx];
        out.push_str(&"  ".repeat(depth));
        out.push_str(&d.name);
        if d.object_type == ObjectType::Stream {
            out.push_str(&format!(" ({} bytes)", d.size));
        }
        out.push('\n');
        for &c in &d.children {
            self.write_tree(c, depth + 1, out);
        }
    }

    fn compute_stream_ranges(&self, idx: usize) -> Result<Ranges> {
        let d = &self.dirents[idx];
        let sector_size = self.header.big_sector_size() as u64;
        let header_len = constants::HEADER_LEN as u64;

        if d.size < self.header.mini_cutoff as u64 {
            let mini_size = self.header.mini_sector_size() as u64;
            let root = &self.dirents[Self::ROOT];
            let root_chain = self.big_fat.chain(root.start_sector)?;
            let root_ranges = Ranges::new(
                root_chain
                    .iter()
                    .map(|&sid| (header_len + sid as u64 * sector_size, sector_size))
                    .collect(),
                root.size,
            );
            let chain = self.mini_fat.chain(d.start_sector)?;
            let mut ranges = Vec::with_capacity(chain.len());
            for sid in chain {
                let logical = sid as u64 * mini_size;
                let (host_off, _avail) = root_ranges.resolve(logical).ok_or_else(|| {
                    Error::Corrupt(CorruptReason::SidOutOfRange(sid, root.size as usize))
                })?;
                ranges.push((host_off, mini_size));
            }
            Ok(Ranges::new(ranges, d.size))
        } else {
            let chain = self.big_fat.chain(d.start_sector)?;
            let ranges = chain
                .iter()
                .map(|&sid| (header_len + sid as u64 * sector_size, sector_size))
                .collect();
            Ok(Ranges::new(ranges, d.size))
        }
    }

    /// Resolve `idx`'s backing ranges, marking the storage non-writable if
    /// doing so discovers a structural corruption (cyclic chain, SID out of
    /// range) that `from_reader` did not catch up front — chains are walked
    /// lazily, per stream, not eagerly for the whole tree on open (§7: a
    /// corruption discovered mid-operation must abort the operation and
    /// leave the storage refusing to repack).
    fn stream_ranges(&mut self, idx: usize) -> Result<Ranges> {
        match self.compute_stream_ranges(idx) {
            Ok(ranges) => Ok(ranges),
            Err(e @ Error::Corrupt(_)) => {
                self.corrupt = true;
                log::warn!("corruption discovered reading stream {idx}: {e}");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn read_stream_at(&mut self, idx: usize, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let ranges = self
            .stream_ranges(idx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let mut io = RangesIO::new(&mut self.host, ranges);
        io.seek(SeekFrom::Start(pos))?;
        io.read(buf)
    }

    fn write_stream_at(&mut self, idx: usize, pos: u64, buf: &[u8]) -> io::Result<usize> {
        let ranges = self
            .stream_ranges(idx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let mut io = RangesIO::new(&mut self.host, ranges);
        io.seek(SeekFrom::Start(pos))?;
        io.write(buf)
    }

    fn read_stream_all(&mut self, idx: usize) -> Result<Vec<u8>> {
        let size = self.dirents[idx].size as usize;
        let mut buf = vec![0u8; size];
        let mut done = 0;
        while done < size {
            let n = self
                .read_stream_at(idx, done as u64, &mut buf[done..])
                .map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(buf)
    }

    /// Grow root's mini-stream body (a big-FAT chain) so every mini-FAT
    /// entry has a backing byte range, mirroring how the big-FAT's own
    /// length always matches the host's real sector count.
    fn sync_mini_stream_capacity(&mut self) -> Result<()> {
        let needed = self.mini_fat.len() as u64 * self.header.mini_sector_size() as u64;
        if needed > self.dirents[Self::ROOT].size {
            let sector_size = self.header.big_sector_size();
            let new_start = self
                .big_fat
                .truncate_to_size(self.dirents[Self::ROOT].start_sector, needed, sector_size)?;
            self.dirents[Self::ROOT].start_sector = new_start;
            self.dirents[Self::ROOT].size = needed;
        }
        Ok(())
    }

    /// Grow or shrink a stream's chain to `new_size`, migrating it between
    /// the mini-FAT and big-FAT tiers if `new_size` crosses `mini_cutoff`
    /// (§9 "Polymorphic streams").
    fn resize_stream(&mut self, idx: usize, new_size: u64) -> Result<()> {
        if !self.is_writable() {
            return Err(Error::Unsupported("storage is read-only"));
        }
        let cutoff = self.header.mini_cutoff as u64;
        let old_size = self.dirents[idx].size;
        let old_mini = old_size < cutoff;
        let new_mini = new_size < cutoff;
        let sector_size = self.header.big_sector_size();
        let mini_size = self.header.mini_sector_size();

        if old_mini == new_mini {
            let start = self.dirents[idx].start_sector;
            let new_start = if new_mini {
                let s = self.mini_fat.truncate_to_size(start, new_size, mini_size)?;
                self.sync_mini_stream_capacity()?;
                s
            } else {
                self.big_fat.truncate_to_size(start, new_size, sector_size)?
            };
            self.dirents[idx].start_sector = new_start;
            self.dirents[idx].size = new_size;
            return Ok(());
        }

        let old_bytes = self.read_stream_all(idx)?;
        let old_start = self.dirents[idx].start_sector;
        if old_mini {
            self.mini_fat.free(old_start)?;
        } else {
            self.big_fat.free(old_start)?;
        }

        let new_start = if new_mini {
            let s = self
                .mini_fat
                .truncate_to_size(constants::END_OF_CHAIN, new_size, mini_size)?;
            self.sync_mini_stream_capacity()?;
            s
        } else {
            self.big_fat
                .truncate_to_size(constants::END_OF_CHAIN, new_size, sector_size)?
        };
        self.dirents[idx].start_sector = new_start;
        self.dirents[idx].size = new_size;

        let keep = old_bytes.len().min(new_size as usize);
        if keep > 0 {
            self.write_stream_at(idx, 0, &old_bytes[..keep])
                .map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Drop deleted entries and renumber the dirent array, preserving the
    /// root at index 0. Returns the compacted array plus an old-index ->
    /// new-index map (entries only present for the live nodes that were
    /// kept).
    fn compact_dirents(&self) -> (Vec<Dirent>, HashMap<usize, usize>) {
        let mut order = Vec::new();
        let mut map = HashMap::new();

        fn visit(old: &[Dirent], old_idx: usize, order: &mut Vec<usize>, map: &mut HashMap<usize, usize>) {
            let new_idx = order.len();
            order.push(old_idx);
            map.insert(old_idx, new_idx);
            for &c in &old[old_idx].children {
                if old[c].object_type != ObjectType::Unallocated {
                    visit(old, c, order, map);
                }
            }
        }
        visit(&self.dirents, Self::ROOT, &mut order, &mut map);

        let new_dirents: Vec<Dirent> = order
            .iter()
            .map(|&old_idx| {
                let new_children: Vec<usize> = self.dirents[old_idx]
                    .children
                    .iter()
                    .filter(|&&c| self.dirents[c].object_type != ObjectType::Unallocated)
                    .map(|&c| map[&c])
                    .collect();
                self.dirents[old_idx].with_children(new_children)
            })
            .collect();

        (new_dirents, map)
    }

    /// Rebuild the container from scratch: discard both allocation tables,
    /// reallocate every reachable stream fresh, rebuild the directory
    /// red-black tree, and serialize a brand-new image (§4.E "Repack").
    /// Mutates `self` to reflect the rebuilt state and returns the final
    /// byte image ready to be written to a host.
    fn repack(&mut self) -> Result<Vec<u8>> {
        let sector_size = self.header.big_sector_size();
        let mini_size = self.header.mini_sector_size();
        let per_sector = constants::sids_per_sector(sector_size) as usize;

        let (mut new_dirents, old_to_new) = self.compact_dirents();

        // snapshot every live stream's bytes before the old tables are
        // discarded.
        let mut stream_bytes: HashMap<usize, Vec<u8>> = HashMap::new();
        for (&old_idx, &new_idx) in &old_to_new {
            if self.dirents[old_idx].object_type == ObjectType::Stream {
                stream_bytes.insert(new_idx, self.read_stream_all(old_idx)?);
            }
        }

        // assign tree pointers for every storage-like node up front; this
        // only depends on names/children, not on content allocation.
        for idx in 0..new_dirents.len() {
            if !new_dirents[idx].is_storage_like() {
                continue;
            }
            let mut sorted = new_dirents[idx].children.clone();
            sorted.sort_by(|&a, &b| name_order(&new_dirents[a].name, &new_dirents[b].name));
            let subtree_root = bulk_load_tree(&mut new_dirents, &sorted);
            new_dirents[idx].child = subtree_root;
        }

        self.big_fat = AllocationTable::new();
        self.mini_fat = AllocationTable::new();

        let mut mini_stream_bytes: Vec<u8> = Vec::new();
        let mut big_tier_content: Vec<(usize, Vec<u8>)> = Vec::new();

        for (&new_idx, bytes) in stream_bytes.iter() {
            let size = bytes.len() as u64;
            if size < self.header.mini_cutoff as u64 {
                let sectors_needed = ((size + mini_size as u64 - 1) / mini_size as u64) as usize;
                let start = self.mini_fat.allocate(sectors_needed, mini_size);
                if sectors_needed > 0 {
                    let offset = mini_stream_bytes.len();
                    mini_stream_bytes.resize(offset + sectors_needed * mini_size as usize, 0);
                    mini_stream_bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
                }
                new_dirents[new_idx].start_sector = start;
                new_dirents[new_idx].size = size;
            } else {
                new_dirents[new_idx].size = size;
                big_tier_content.push((new_idx, bytes.clone()));
            }
        }
        mini_stream_bytes.resize(self.mini_fat.len() * mini_size as usize, 0);

        for (new_idx, bytes) in &big_tier_content {
            let sectors_needed =
                ((bytes.len() as u64 + sector_size as u64 - 1) / sector_size as u64) as usize;
            let start = self.big_fat.allocate(sectors_needed, sector_size);
            new_dirents[*new_idx].start_sector = start;
        }

        let mini_body_sectors =
            ((mini_stream_bytes.len() as u64 + sector_size as u64 - 1) / sector_size as u64) as usize;
        let root_start = self.big_fat.allocate(mini_body_sectors, sector_size);
        new_dirents[Self::ROOT].start_sector = root_start;
        new_dirents[Self::ROOT].size = mini_stream_bytes.len() as u64;

        let dir_bytes: Vec<u8> = new_dirents.iter().flat_map(|d| d.serialize()).collect();
        let dir_sectors_needed =
            ((dir_bytes.len() as u64 + sector_size as u64 - 1) / sector_size as u64) as usize;
        let dir_start = self.big_fat.allocate(dir_sectors_needed.max(1), sector_size);

        let mini_fat_pages = self.mini_fat.to_sector_pages(sector_size);
        let mini_fat_start = self.big_fat.allocate(mini_fat_pages.len(), sector_size);

        // FAT pages and DIFAT overflow describe the big-FAT's own storage,
        // which in turn changes the big-FAT's length — converge (§9
        // "Cyclic / self-describing tables").
        let mut fat_page_sids: Vec<u32> = Vec::new();
        let mut prev_overflow_sids: Vec<u32> = Vec::new();
        let difat_layout = loop {
            let mut grew = false;
            loop {
                let pages_needed = (self.big_fat.len() + per_sector - 1) / per_sector;
                if fat_page_sids.len() >= pages_needed {
                    break;
                }
                let sid = self.big_fat.allocate(1, sector_size);
                self.big_fat.mark_reserved(&[sid], constants::FAT_SID);
                fat_page_sids.push(sid);
                grew = true;
            }

            if !prev_overflow_sids.is_empty() {
                self.big_fat.mark_reserved(&prev_overflow_sids, constants::FREE_SID);
            }

            let before = self.big_fat.len();
            let layout = {
                let big_fat = &mut self.big_fat;
                allocation::build_difat_layout(&fat_page_sids, sector_size, || {
                    let sid = big_fat.allocate(1, sector_size);
                    big_fat.mark_reserved(&[sid], constants::DIFAT_SID);
                    sid
                })
            };
            if self.big_fat.len() != before {
                grew = true;
            }
            prev_overflow_sids = layout.overflow_sectors.iter().map(|(sid, _)| *sid).collect();

            if !grew {
                break layout;
            }
        };

        let mut big_sectors: Vec<Vec<u8>> = vec![vec![0u8; sector_size as usize]; self.big_fat.len()];

        let root_chain = self.big_fat.chain(root_start)?;
        place_padded(&mut big_sectors, &root_chain, &mini_stream_bytes, sector_size as usize);

        for (new_idx, bytes) in &big_tier_content {
            let chain = self.big_fat.chain(new_dirents[*new_idx].start_sector)?;
            place_padded(&mut big_sectors, &chain, bytes, sector_size as usize);
        }

        let dir_chain = self.big_fat.chain(dir_start)?;
        place_padded(&mut big_sectors, &dir_chain, &dir_bytes, sector_size as usize);

        let mini_fat_chain = self.big_fat.chain(mini_fat_start)?;
        place_pages(&mut big_sectors, &mini_fat_chain, &mini_fat_pages);

        place_pages(
            &mut big_sectors,
            &fat_page_sids,
            &self.big_fat.to_sector_pages(sector_size),
        );
        let overflow_sids: Vec<u32> = difat_layout.overflow_sectors.iter().map(|(s, _)| *s).collect();
        let overflow_pages: Vec<Vec<u8>> =
            difat_layout.overflow_sectors.iter().map(|(_, b)| b.clone()).collect();
        place_pages(&mut big_sectors, &overflow_sids, &overflow_pages);

        let mut header = self.header.clone();
        header.fat_sector_count = fat_page_sids.len() as u32;
        header.first_directory_sector = dir_start;
        header.mini_fat_sector_count = mini_fat_chain.len() as u32;
        header.first_mini_fat_sector = mini_fat_start;
        header.difat_sector_count = difat_layout.overflow_sectors.len() as u32;
        header.first_difat_sector = difat_layout.first_overflow_sid;
        header.difat_head = difat_layout.head;
        header.directory_sectors_len = 0;

        log::info!(
            "repacked container: {} dirents, {} big sectors, {} mini sectors",
            new_dirents.len(),
            self.big_fat.len(),
            self.mini_fat.len()
        );

        let mut image = Vec::with_capacity(
            constants::HEADER_LEN + big_sectors.len() * sector_size as usize,
        );
        image.extend_from_slice(&header.write());
        for sector in &big_sectors {
            image.extend_from_slice(sector);
        }

        self.header = header;
        self.dirents = new_dirents;

        Ok(image)
    }
}

impl<H: Read + Write + Seek + SetLen> Storage<H> {
    /// Repack (if writable and not corrupt) and rewrite `self`'s host in
    /// place. Leaves the host untouched for `Mode::Read` or a storage
    /// already marked corrupt (§7 "a failed repack is reported to the
    /// caller and the original file is preserved").
    pub fn flush(&mut self) -> Result<()> {
        if self.mode == Mode::Read || self.corrupt {
            return Ok(());
        }
        let image = match self.repack() {
            Ok(image) => image,
            Err(e) => {
                self.corrupt = true;
                return Err(e);
            }
        };
        self.host.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
        self.host.write_all(&image).map_err(Error::Io)?;
        self.host
            .set_len_bytes(image.len() as u64)
            .map_err(Error::Io)?;
        Ok(())
    }
}

impl Storage<std::fs::File> {
    /// Open a container backed by a real file.
    pub fn open<P: AsRef<Path>>(path: P, mode: Mode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut storage = match mode {
            Mode::Read => {
                let file = std::fs::File::open(&path).map_err(Error::Io)?;
                Self::from_reader(file, mode)?
            }
            Mode::ReadWrite => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(Error::Io)?;
                Self::from_reader(file, mode)?
            }
            Mode::Create => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(Error::Io)?;
                Self::empty(file, mode)
            }
            Mode::CreateNew => {
                if path.exists() {
                    return Err(Error::AlreadyExists(path.display().to_string()));
                }
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(Error::Io)?;
                Self::empty(file, mode)
            }
        };
        storage.host_path = Some(path);
        Ok(storage)
    }

    /// Repack to a sibling temp file and atomically rename it over the
    /// host path, so a failure mid-repack never corrupts the original
    /// (§9 "In-place vs copy repack").
    pub fn close(mut self) -> Result<()> {
        if self.mode == Mode::Read || self.corrupt {
            return Ok(());
        }
        let path = self
            .host_path
            .clone()
            .expect("file-backed storage always has a host path");
        let image = match self.repack() {
            Ok(image) => image,
            Err(e) => {
                self.corrupt = true;
                return Err(e);
            }
        };
        let tmp_path = path.with_extension("cfb-tmp");
        {
            let mut tmp = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(Error::Io)?;
            tmp.write_all(&image).map_err(Error::Io)?;
        }
        std::fs::rename(&tmp_path, &path).map_err(Error::Io)?;
        Ok(())
    }
}

/// Open `path` in `mode`, run `block` against the container, and guarantee
/// the host handle is released when `block` exits on any path (§5 "Scoped
/// acquisition"). If `block` returns `Ok`, the container is repacked and
/// closed before this function returns that value; if `block` returns
/// `Err`, the container is dropped unrepacked and the error is propagated.
///
/// Rust's `Drop` already releases the handle on every exit path without
/// this helper — it exists for callers who want the explicit block form
/// the spec names, rather than relying on scope exit.
pub fn with_storage<P, F, T>(path: P, mode: Mode, block: F) -> Result<T>
where
    P: AsRef<Path>,
    F: FnOnce(&mut Storage<std::fs::File>) -> Result<T>,
{
    let mut storage = Storage::open(path, mode)?;
    let value = block(&mut storage)?;
    storage.close()?;
    Ok(value)
}

/// A stream's random-access `Read + Write + Seek` handle, borrowed from its
/// owning `Storage`. Dropping it is a no-op — mutations are already
/// reflected in the storage's in-memory tables; `Storage::flush`/`close` is
/// what commits them to the host.
pub struct StreamIo<'s, H> {
    storage: &'s mut Storage<H>,
    idx: usize,
    pos: u64,
}

impl<'s, H: Read + Write + Seek> StreamIo<'s, H> {
    pub fn len(&self) -> u64 {
        self.storage.dirents[self.idx].size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `(host_offset, length)` ranges currently backing this stream.
    /// Marks the storage non-writable if resolving them discovers a
    /// structural corruption (see `Storage::stream_ranges`).
    pub fn ranges(&mut self) -> Vec<(u64, u64)> {
        self.storage
            .stream_ranges(self.idx)
            .map(|r| r.ranges().to_vec())
            .unwrap_or_default()
    }

    /// Iterate this stream's `(host_offset, length)` ranges in chain order.
    pub fn each_range(&mut self) -> impl Iterator<Item = (u64, u64)> {
        self.ranges().into_iter()
    }

    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.storage.resize_stream(self.idx, new_size)?;
        if self.pos > new_size {
            self.pos = new_size;
        }
        Ok(())
    }
}

impl<'s, H: Read + Write + Seek> Read for StreamIo<'s, H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.storage.read_stream_at(self.idx, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<'s, H: Read + Write + Seek> Write for StreamIo<'s, H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.storage.write_stream_at(self.idx, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'s, H: Read + Write + Seek> Seek for StreamIo<'s, H> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.storage.dirents[self.idx].size as i64;
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => size + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "negative seek position",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn new_memory_storage() -> Storage<Cursor<Vec<u8>>> {
        Storage::empty(Cursor::new(Vec::new()), Mode::Create)
    }

    #[test]
    fn create_write_reopen_round_trips_a_mini_stream() {
        let mut s = new_memory_storage();
        let idx = s.new_child(0, ObjectType::Stream, "hello").unwrap();
        s.write_stream(idx, b"world").unwrap();
        s.flush().unwrap();

        let bytes = s.host.get_ref().clone();
        let mut reopened = Storage::from_reader(Cursor::new(bytes), Mode::Read).unwrap();
        let found = reopened.dirent_from_path("/hello").unwrap();
        let mut io = reopened.open_stream(found).unwrap();
        let mut data = Vec::new();
        io.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"world");
        assert_eq!(reopened.dirent(found).size, 5);
        assert!((reopened.dirent(found).size as u32) < reopened.header().mini_cutoff);
    }

    #[test]
    fn large_stream_crosses_cutoff_into_big_fat() {
        let mut s = new_memory_storage();
        let idx = s.new_child(0, ObjectType::Stream, "big").unwrap();
        let cutoff = s.header().mini_cutoff as usize;
        let mut content = vec![b'x'; cutoff];
        content.push(b'y');
        s.write_stream(idx, &content).unwrap();
        s.flush().unwrap();

        let bytes = s.host.get_ref().clone();
        let mut reopened = Storage::from_reader(Cursor::new(bytes), Mode::Read).unwrap();
        let found = reopened.dirent_from_path("/big").unwrap();
        assert!(reopened.dirent(found).size >= reopened.header().mini_cutoff as u64);
        let mut io = reopened.open_stream(found).unwrap();
        let mut data = Vec::new();
        io.read_to_end(&mut data).unwrap();
        assert_eq!(data, content);
    }

    #[test]
    fn delete_and_repack_removes_stream_keeps_siblings() {
        let mut s = new_memory_storage();
        let a = s.new_child(0, ObjectType::Stream, "a").unwrap();
        let b = s.new_child(0, ObjectType::Stream, "b").unwrap();
        s.write_stream(a, b"AAA").unwrap();
        s.write_stream(b, b"BBB").unwrap();
        s.delete(0, a).unwrap();
        s.flush().unwrap();

        let bytes = s.host.get_ref().clone();
        let mut reopened = Storage::from_reader(Cursor::new(bytes), Mode::Read).unwrap();
        assert!(reopened.dirent_from_path("/a").is_none());
        let found_b = reopened.dirent_from_path("/b").unwrap();
        let mut io = reopened.open_stream(found_b).unwrap();
        let mut data = Vec::new();
        io.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"BBB");
    }

    #[test]
    fn enumerate_root_children_in_order() {
        let mut s = new_memory_storage();
        for name in ["w", "x", "y", "z"] {
            s.new_child(0, ObjectType::Stream, name).unwrap();
        }
        let names: Vec<&str> = s
            .children(0)
            .iter()
            .map(|&i| s.dirent(i).name.as_str())
            .collect();
        assert_eq!(names, vec!["w", "x", "y", "z"]);
    }

    #[test]
    fn open_stream_on_storage_is_is_directory() {
        let mut s = new_memory_storage();
        let storage_idx = s.new_child(0, ObjectType::Storage, "dir").unwrap();
        let err = s.open_stream(storage_idx).unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::IsDirectory);
    }

    #[test]
    fn new_child_under_a_stream_is_not_directory() {
        let mut s = new_memory_storage();
        let stream_idx = s.new_child(0, ObjectType::Stream, "leaf").unwrap();
        let err = s
            .new_child(stream_idx, ObjectType::Stream, "nope")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::NotDirectory);
    }

    #[test]
    fn corrupt_magic_fails_to_open() {
        let mut bytes = vec![0u8; constants::HEADER_LEN];
        bytes[0] = 0xFF;
        let err = Storage::from_reader(Cursor::new(bytes), Mode::Read).unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Corrupt);
    }

    #[test]
    fn idempotent_repack() {
        let mut s = new_memory_storage();
        let idx = s.new_child(0, ObjectType::Stream, "stable").unwrap();
        s.write_stream(idx, b"content").unwrap();
        s.flush().unwrap();
        let first_image = s.host.get_ref().clone();

        let mut reopened = Storage::from_reader(Cursor::new(first_image.clone()), Mode::ReadWrite).unwrap();
        reopened.flush().unwrap();
        let second_image = reopened.host.get_ref().clone();

        assert_eq!(first_image, second_image);
    }

    #[test]
    fn corruption_discovered_on_read_blocks_a_later_repack() {
        let mut s = new_memory_storage();
        let idx = s.new_child(0, ObjectType::Stream, "bad").unwrap();
        s.write_stream(idx, b"short").unwrap();
        s.flush().unwrap();
        let good_image = s.host.get_ref().clone();

        let mut reopened =
            Storage::from_reader(Cursor::new(good_image.clone()), Mode::ReadWrite).unwrap();
        let bad_idx = reopened.dirent_from_path("/bad").unwrap();

        // close the mini-FAT chain backing `bad` into a self-loop, as if an
        // earlier writer had corrupted it; `from_reader` never walks every
        // stream's chain up front, so this is only discovered on read.
        let start = reopened.dirent(bad_idx).start_sector;
        reopened.mini_fat.mark_reserved(&[start], start);

        let mut io = reopened.open_stream(bad_idx).unwrap();
        let mut buf = Vec::new();
        let err = io.read_to_end(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert!(!reopened.is_writable());

        // a later flush/close must refuse to repack over the now-corrupt
        // storage rather than writing a fresh image derived from it.
        reopened.flush().unwrap();
        assert_eq!(reopened.host.get_ref(), &good_image);
    }

    #[test]
    fn nested_storage_path_lookup() {
        let mut s = new_memory_storage();
        let dir = s.new_child(0, ObjectType::Storage, "dir").unwrap();
        let leaf = s.new_child(dir, ObjectType::Stream, "leaf").unwrap();
        s.write_stream(leaf, b"nested").unwrap();
        s.flush().unwrap();

        let bytes = s.host.get_ref().clone();
        let mut reopened = Storage::from_reader(Cursor::new(bytes), Mode::Read).unwrap();
        let found = reopened.dirent_from_path("/dir/leaf").unwrap();
        let mut io = reopened.open_stream(found).unwrap();
        let mut data = Vec::new();
        io.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"nested");
    }

    #[test]
    fn many_streams_force_fat_overflow_and_survive_repack() {
        let mut s = new_memory_storage();
        for i in 0..600 {
            let idx = s
                .new_child(0, ObjectType::Stream, format!("s{i}"))
                .unwrap();
            s.write_stream(idx, &vec![(i % 256) as u8; 5000]).unwrap();
        }
        s.flush().unwrap();

        let bytes = s.host.get_ref().clone();
        let mut reopened = Storage::from_reader(Cursor::new(bytes), Mode::Read).unwrap();
        for i in [0usize, 299, 599] {
            let found = reopened.dirent_from_path(&format!("/s{i}")).unwrap();
            let mut io = reopened.open_stream(found).unwrap();
            let mut data = Vec::new();
            io.read_to_end(&mut data).unwrap();
            assert_eq!(data, vec![(i % 256) as u8; 5000]);
        }
    }
}
