//! The 512-byte container header (§4.A of the on-disk layout).
//!
//! https://winprotocoldoc.blob.core.windows.net/productionwindowsarchives/MS-CFB/%5bMS-CFB%5d.pdf

use crate::constants;
use crate::error::{CorruptReason, Error};
use crate::Result;

/// The parsed, validated 512-byte header plus the inline 109-entry DIFAT
/// prefix that shares the same sector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub major_version: u16,
    pub minor_version: u16,
    pub log2_big_sector: u16,
    pub log2_mini_sector: u16,
    /// v3: always 0 on disk; kept for round-trip with v4 files that set it.
    pub directory_sectors_len: u32,
    pub fat_sector_count: u32,
    pub first_directory_sector: u32,
    pub mini_cutoff: u32,
    pub first_mini_fat_sector: u32,
    pub mini_fat_sector_count: u32,
    pub first_difat_sector: u32,
    pub difat_sector_count: u32,
    /// The first 109 FAT-page SIDs, inline in the header sector.
    pub difat_head: [u32; constants::DIFAT_HEADER_ENTRIES],
}

impl Header {
    pub fn big_sector_size(&self) -> u32 {
        1u32 << self.log2_big_sector
    }

    pub fn mini_sector_size(&self) -> u32 {
        1u32 << self.log2_mini_sector
    }

    /// The canonical empty-container header: major version 3, 512-byte
    /// sectors, 64-byte mini sectors, mini-cutoff 4096.
    pub fn new_v3() -> Self {
        Header {
            major_version: constants::MAJOR_VERSION_3,
            minor_version: constants::CORRECT_MINOR_VERSION,
            log2_big_sector: constants::SECTOR_SHIFT_VERSION_3,
            log2_mini_sector: constants::MINI_SECTOR_SHIFT,
            directory_sectors_len: 0,
            fat_sector_count: 0,
            first_directory_sector: constants::END_OF_CHAIN,
            mini_cutoff: constants::DEFAULT_MINI_CUTOFF,
            first_mini_fat_sector: constants::END_OF_CHAIN,
            mini_fat_sector_count: 0,
            first_difat_sector: constants::END_OF_CHAIN,
            difat_sector_count: 0,
            difat_head: [constants::FREE_SID; constants::DIFAT_HEADER_ENTRIES],
        }
    }

    pub fn parse(buf: &[u8; constants::HEADER_LEN]) -> Result<Self> {
        let magic: [u8; 8] = buf[0..8].try_into().unwrap();
        if magic != constants::MAGIC_BYTES {
            return Err(Error::Corrupt(CorruptReason::WrongMagic(magic.to_vec())));
        }

        // class_id (8..24) is reserved, unused; we don't validate it's zero
        // since some writers in the wild leave garbage there.

        let minor_version = u16::from_le_bytes(buf[24..26].try_into().unwrap());
        let major_version = u16::from_le_bytes(buf[26..28].try_into().unwrap());
        if major_version != constants::MAJOR_VERSION_3 && major_version != constants::MAJOR_VERSION_4
        {
            return Err(Error::Corrupt(CorruptReason::BadHeaderField(
                "major_version",
                format!("{:#06x}", major_version),
            )));
        }

        let byte_order = u16::from_le_bytes(buf[28..30].try_into().unwrap());
        if byte_order != constants::BYTE_ORDER_MARK {
            return Err(Error::Corrupt(CorruptReason::BadHeaderField(
                "byte_order_mark",
                format!("{:#06x}", byte_order),
            )));
        }

        let log2_big_sector = u16::from_le_bytes(buf[30..32].try_into().unwrap());
        let expected_log2_big = if major_version == constants::MAJOR_VERSION_3 {
            constants::SECTOR_SHIFT_VERSION_3
        } else {
            constants::SECTOR_SHIFT_VERSION_4
        };
        if log2_big_sector != expected_log2_big {
            return Err(Error::Corrupt(CorruptReason::BadHeaderField(
                "sector_shift",
                format!("{} for major version {}", log2_big_sector, major_version),
            )));
        }

        let log2_mini_sector = u16::from_le_bytes(buf[32..34].try_into().unwrap());
        if log2_mini_sector != constants::MINI_SECTOR_SHIFT {
            return Err(Error::Corrupt(CorruptReason::BadHeaderField(
                "mini_sector_shift",
                log2_mini_sector.to_string(),
            )));
        }

        // buf[34..40] reserved, buf[40..44] directory_sectors_len (v3: must be 0).
        let directory_sectors_len = u32::from_le_bytes(buf[40..44].try_into().unwrap());
        if major_version == constants::MAJOR_VERSION_3 && directory_sectors_len != 0 {
            return Err(Error::Corrupt(CorruptReason::BadHeaderField(
                "directory_sectors_len",
                "non-zero for a version-3 container".to_string(),
            )));
        }

        let fat_sector_count = u32::from_le_bytes(buf[44..48].try_into().unwrap());
        let first_directory_sector = u32::from_le_bytes(buf[48..52].try_into().unwrap());
        // buf[52..56] transaction signature, ignored on read, written as 0.
        let mini_cutoff = u32::from_le_bytes(buf[56..60].try_into().unwrap());
        if mini_cutoff == 0 {
            return Err(Error::Corrupt(CorruptReason::BadHeaderField(
                "mini_cutoff",
                "must be positive".to_string(),
            )));
        }
        let first_mini_fat_sector = u32::from_le_bytes(buf[60..64].try_into().unwrap());
        let mini_fat_sector_count = u32::from_le_bytes(buf[64..68].try_into().unwrap());
        let first_difat_sector = u32::from_le_bytes(buf[68..72].try_into().unwrap());
        let difat_sector_count = u32::from_le_bytes(buf[72..76].try_into().unwrap());

        let mut difat_head = [constants::FREE_SID; constants::DIFAT_HEADER_ENTRIES];
        for (i, slot) in difat_head.iter_mut().enumerate() {
            let off = 76 + i * 4;
            *slot = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        }

        let big = 1u32 << log2_big_sector;
        let mini = 1u32 << log2_mini_sector;
        if !big.is_power_of_two() || big < 128 {
            return Err(Error::Unsupported("big sector size below minimum"));
        }
        if big < mini {
            return Err(Error::Corrupt(CorruptReason::BadHeaderField(
                "sector_shift",
                "big sector size smaller than mini sector size".to_string(),
            )));
        }

        Ok(Header {
            major_version,
            minor_version,
            log2_big_sector,
            log2_mini_sector,
            directory_sectors_len,
            fat_sector_count,
            first_directory_sector,
            mini_cutoff,
            first_mini_fat_sector,
            mini_fat_sector_count,
            first_difat_sector,
            difat_sector_count,
            difat_head,
        })
    }

    pub fn write(&self) -> [u8; constants::HEADER_LEN] {
        let mut buf = [0u8; constants::HEADER_LEN];
        buf[0..8].copy_from_slice(&constants::MAGIC_BYTES);
        // buf[8..24] class_id stays zero.
        buf[24..26].copy_from_slice(&self.minor_version.to_le_bytes());
        buf[26..28].copy_from_slice(&self.major_version.to_le_bytes());
        buf[28..30].copy_from_slice(&constants::BYTE_ORDER_MARK.to_le_bytes());
        buf[30..32].copy_from_slice(&self.log2_big_sector.to_le_bytes());
        buf[32..34].copy_from_slice(&self.log2_mini_sector.to_le_bytes());
        // buf[34..40] reserved, stays zero.
        buf[40..44].copy_from_slice(&self.directory_sectors_len.to_le_bytes());
        buf[44..48].copy_from_slice(&self.fat_sector_count.to_le_bytes());
        buf[48..52].copy_from_slice(&self.first_directory_sector.to_le_bytes());
        // buf[52..56] transaction signature, stays zero.
        buf[56..60].copy_from_slice(&self.mini_cutoff.to_le_bytes());
        buf[60..64].copy_from_slice(&self.first_mini_fat_sector.to_le_bytes());
        buf[64..68].copy_from_slice(&self.mini_fat_sector_count.to_le_bytes());
        buf[68..72].copy_from_slice(&self.first_difat_sector.to_le_bytes());
        buf[72..76].copy_from_slice(&self.difat_sector_count.to_le_bytes());
        for (i, sid) in self.difat_head.iter().enumerate() {
            let off = 76 + i * 4;
            buf[off..off + 4].copy_from_slice(&sid.to_le_bytes());
        }
        buf
    }
}
