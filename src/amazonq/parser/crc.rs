//! CRC32 checksum
//!
//! AWS Event Stream uses CRC32 (ISO-HDLC/Ethernet/ZIP standard)

use crc::{CRC_32_ISO_HDLC, Crc};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Calculate CRC32 checksum (ISO-HDLC standard, polynomial 0xEDB88320)
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}
