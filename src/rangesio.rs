//! Presents a linked sector chain as a seekable byte stream over an ordered
//! list of `(host_offset, length)` ranges (§4.D).
//!
//! Two flavours share this one adapter: a `RangesIO` ranging directly into
//! the host file (big-sector streams, and the mini-stream body itself,
//! which is a big-sector chain owned by the root dirent), and a
//! `RangesIO` ranging into the *mini-stream's logical byte space* for
//! mini-sector streams — the engine builds the latter by first resolving
//! each mini-FAT chain entry to `(root_mini_stream_offset, mini_sector_size)`
//! and then translating those through the root's own `RangesIO`, so
//! composition is literal rather than a distinct type.

use std::io::{self, Read, Seek, SeekFrom, Write};

/// An ordered list of byte ranges backing one logical stream, plus the
/// stream's declared logical size (which may be less than the summed range
/// lengths if the last sector is only partially used).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ranges {
    ranges: Vec<(u64, u64)>,
    size: u64,
}

impl Ranges {
    pub fn new(ranges: Vec<(u64, u64)>, size: u64) -> Self {
        Ranges { ranges, size }
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn locate(&self, pos: u64) -> Option<(usize, u64)> {
        let mut acc = 0u64;
        for (i, &(_, len)) in self.ranges.iter().enumerate() {
            if pos < acc + len {
                return Some((i, pos - acc));
            }
            acc += len;
        }
        None
    }

    /// Resolve a logical position to `(host_offset, bytes_available_in_that_range)`.
    /// Used by the engine to translate mini-FAT sector indices through the
    /// root's own ranges into absolute host offsets.
    pub fn resolve(&self, pos: u64) -> Option<(u64, u64)> {
        let (idx, off) = self.locate(pos)?;
        let (range_off, range_len) = self.ranges[idx];
        Some((range_off + off, range_len - off))
    }
}

/// A `Read + Write + Seek` adapter presenting `ranges` as one contiguous
/// logical stream over a backing `host`.
pub struct RangesIO<'a, H> {
    host: &'a mut H,
    ranges: Ranges,
    pos: u64,
}

impl<'a, H: Read + Write + Seek> RangesIO<'a, H> {
    pub fn new(host: &'a mut H, ranges: Ranges) -> Self {
        RangesIO {
            host,
            ranges,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.ranges.size
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.size == 0
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        self.ranges.ranges()
    }

    /// Iterate the `(host_offset, length)` ranges backing this stream, in
    /// chain order.
    pub fn each_range(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.ranges().iter().copied()
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Replace the backing ranges — used after the engine's allocator has
    /// grown or shrunk the stream's chain. The position is clamped to the
    /// new size if it would otherwise run past the end.
    pub fn set_ranges(&mut self, ranges: Ranges) {
        self.ranges = ranges;
        if self.pos > self.ranges.size {
            self.pos = self.ranges.size;
        }
    }
}

impl<'a, H: Read + Write + Seek> Read for RangesIO<'a, H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.ranges.size {
            return Ok(0);
        }
        let avail = self.ranges.size - self.pos;
        let want = (buf.len() as u64).min(avail);

        let mut done = 0u64;
        while done < want {
            let (idx, off) = match self.ranges.locate(self.pos) {
                Some(v) => v,
                None => break,
            };
            let (range_off, range_len) = self.ranges.ranges()[idx];
            let chunk = (range_len - off).min(want - done);
            self.host.seek(SeekFrom::Start(range_off + off))?;
            let n = self
                .host
                .read(&mut buf[done as usize..(done + chunk) as usize])?;
            if n == 0 {
                break;
            }
            done += n as u64;
            self.pos += n as u64;
        }
        Ok(done as usize)
    }
}

impl<'a, H: Read + Write + Seek> Write for RangesIO<'a, H> {
    /// Writes are bounded by the currently allocated ranges — a write that
    /// would cross past `len()` fails rather than silently growing, since
    /// `RangesIO` does not own the `AllocationTable` that would need to
    /// grow. Callers extend a stream by allocating first (via the engine's
    /// `truncate_to_size`/`set_ranges`) and writing second.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos + buf.len() as u64 > self.ranges.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write past end of allocated ranges; caller must grow the chain first",
            ));
        }

        let mut done = 0usize;
        while done < buf.len() {
            let (idx, off) = self.ranges.locate(self.pos).ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "write past end of ranges")
            })?;
            let (range_off, range_len) = self.ranges.ranges()[idx];
            let chunk = ((range_len - off) as usize).min(buf.len() - done);
            self.host.seek(SeekFrom::Start(range_off + off))?;
            let n = self.host.write(&buf[done..done + chunk])?;
            if n == 0 {
                break;
            }
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.host.flush()
    }
}

impl<'a, H: Read + Write + Seek> Seek for RangesIO<'a, H> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos: i64 = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => self.ranges.size as i64 + delta,
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

    fn host_with(bytes: &[u8]) -> Cursor<Vec<u8>> {
        Cursor::new(bytes.to_vec())
    }

    #[test]
    fn read_splits_across_range_boundary() {
        let mut host = host_with(b"AAAABBBBCCCC");
        // two ranges: [0..4) then [8..12), logical stream "AAAACCCC"
        let ranges = Ranges::new(vec![(0, 4), (8, 4)], 8);
        let mut io = RangesIO::new(&mut host, ranges);
        let mut buf = [0u8; 8];
        let n = io.read(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&buf, b"AAAACCCC");
    }

    #[test]
    fn short_read_at_end_of_stream_is_not_an_error() {
        let mut host = host_with(b"hello world");
        let ranges = Ranges::new(vec![(0, 5)], 5);
        let mut io = RangesIO::new(&mut host, ranges);
        let mut buf = [0u8; 100];
        let n = io.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
        let n2 = io.read(&mut buf).unwrap();
        assert_eq!(n2, 0);
    }

    #[test]
    fn seek_and_read_consistency() {
        let mut host = host_with(b"0123456789");
        let ranges = Ranges::new(vec![(0, 10)], 10);
        let mut io = RangesIO::new(&mut host, ranges);
        io.seek(SeekFrom::Start(3)).unwrap();
        let mut buf = [0u8; 4];
        io.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn seek_negative_is_invalid_argument() {
        let mut host = host_with(b"0123456789");
        let ranges = Ranges::new(vec![(0, 10)], 10);
        let mut io = RangesIO::new(&mut host, ranges);
        let err = io.seek(SeekFrom::Start(0)).and_then(|_| io.seek(SeekFrom::Current(-5)));
        assert!(err.is_err());
        assert_eq!(err.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn write_splits_across_range_boundary() {
        let mut host = host_with(b"XXXXXXXXXXXX");
        let ranges = Ranges::new(vec![(0, 4), (8, 4)], 8);
        {
            let mut io = RangesIO::new(&mut host, ranges);
            io.write_all(b"AAAABBBB").unwrap();
        }
        assert_eq!(host.into_inner(), b"AAAAXXXXBBBB".to_vec());
    }

    #[test]
    fn each_range_matches_ranges_slice() {
        let mut host = host_with(b"AAAABBBBCCCC");
        let ranges = Ranges::new(vec![(0, 4), (8, 4)], 8);
        let io = RangesIO::new(&mut host, ranges);
        let collected: Vec<(u64, u64)> = io.each_range().collect();
        assert_eq!(collected, io.ranges().to_vec());
    }

    #[test]
    fn write_past_allocated_ranges_errors() {
        let mut host = host_with(b"XXXX");
        let ranges = Ranges::new(vec![(0, 4)], 4);
        let mut io = RangesIO::new(&mut host, ranges);
        assert!(io.write(b"TOO LONG").is_err());
    }
}
