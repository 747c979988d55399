//! On-disk constants for the Compound File Binary format.
//!
//! https://winprotocoldoc.blob.core.windows.net/productionwindowsarchives/MS-CFB/%5bMS-CFB%5d.pdf

pub const HEADER_LEN: usize = 512;

pub const MAGIC_BYTES: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
pub const CORRECT_MINOR_VERSION: u16 = 0x003E;
pub const MAJOR_VERSION_3: u16 = 0x0003;
pub const MAJOR_VERSION_4: u16 = 0x0004;
pub const BYTE_ORDER_MARK: u16 = 0xFFFE;

pub const SECTOR_SHIFT_VERSION_3: u16 = 0x0009;
pub const SECTOR_SHIFT_VERSION_4: u16 = 0x000C;
pub const MINI_SECTOR_SHIFT: u16 = 0x0006;
pub const MINI_SECTOR_SIZE: u32 = 64;

pub const DEFAULT_MINI_CUTOFF: u32 = 0x0000_1000;

/// Reserved sector-ID values. Everything at or below `MAX_REGULAR_SID` is a
/// regular, in-use SID ("REGSID").
pub const MAX_REGULAR_SID: u32 = 0xFFFF_FFFA;
pub const FREE_SID: u32 = 0xFFFF_FFFF;
pub const END_OF_CHAIN: u32 = 0xFFFF_FFFE;
pub const FAT_SID: u32 = 0xFFFF_FFFD;
pub const DIFAT_SID: u32 = 0xFFFF_FFFC;
pub const NO_STREAM: u32 = 0xFFFF_FFFF;

pub const DIRENT_LEN: usize = 128;
pub const DIRENT_NAME_FIELD_LEN: usize = 64;
pub const DIRENT_MAX_NAME_CHARS: usize = 31;

pub const DIFAT_HEADER_ENTRIES: usize = 109;

pub const OBJECT_TYPE_UNALLOCATED: u8 = 0x00;
pub const OBJECT_TYPE_STORAGE: u8 = 0x01;
pub const OBJECT_TYPE_STREAM: u8 = 0x02;
pub const OBJECT_TYPE_ROOT: u8 = 0x05;

pub const COLOR_RED: u8 = 0x00;
pub const COLOR_BLACK: u8 = 0x01;

/// Entries per sector of a SID table (4 bytes each) at a given sector size.
pub fn sids_per_sector(sector_size: u32) -> u32 {
    sector_size / 4
}
