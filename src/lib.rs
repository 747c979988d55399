//! A reader/writer for the OLE2 Compound File Binary (CFB) format — the
//! container format behind legacy `.doc`/`.xls`/`.ppt`, `.msi`, and other
//! structured-storage documents.
//!
//! A [`Storage`] composes a 512-byte [`header`], the big- and mini-FAT
//! allocation tables, and a flat array of [`Dirent`] nodes forming the
//! storage/stream tree. Streams are read and written through
//! [`StreamIo`], a `Read + Write + Seek` handle that the engine builds on
//! top of [`RangesIO`] over whichever allocation tier (big-FAT or
//! mini-FAT) a stream currently belongs to.
//!
//! ```rust
//! use cfb_container::{Mode, ObjectType, Storage};
//! use std::io::{Cursor, Read, Write};
//!
//! let mut storage = Storage::empty(Cursor::new(Vec::new()), Mode::Create);
//! let idx = storage.new_child(0, ObjectType::Stream, "greeting").unwrap();
//! storage.write_stream(idx, b"hello").unwrap();
//! storage.flush().unwrap();
//!
//! let mut io = storage.open_stream(idx).unwrap();
//! let mut data = Vec::new();
//! io.read_to_end(&mut data).unwrap();
//! assert_eq!(data, b"hello");
//! ```

pub mod allocation;
pub mod constants;
pub mod directory;
pub mod error;
pub mod header;
pub mod rangesio;
pub mod storage;

pub use directory::{Color, Dirent, ObjectType};
pub use error::{CorruptReason, Error, Kind};
pub use header::Header;
pub use rangesio::{Ranges, RangesIO};
pub use storage::{with_storage, Mode, SetLen, Storage, StreamIo};

pub type Result<T> = std::result::Result<T, Error>;
