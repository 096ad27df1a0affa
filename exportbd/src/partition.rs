//! MBR partition table lookup.
//!
//! Maps a 1-based partition number to a byte range of the image so the
//! export can be restricted to a single partition. Primary partitions are
//! numbers 1-4; logical partitions inside extended containers (system
//! types 0x05 and 0x0F) start at 5.
//!
//! Only one level of extended-partition nesting is followed. Each
//! container visited advances the logical numbering by a fixed four
//! slots, whether or not they are all populated. This matches the
//! long-standing `qemu-nbd -P` numbering rather than a full EBR-chain
//! walk, so partition numbers line up with what users of that tool
//! expect.

use std::io;

use async_trait::async_trait;

use crate::error::PartitionError;

/// Sector size the partition table format is defined in terms of.
pub const SECTOR_SIZE: usize = 512;

const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];

/// CHS-addressed extended container.
const SYS_EXTENDED: u8 = 0x05;
/// LBA-addressed extended container.
const SYS_EXTENDED_LBA: u8 = 0x0f;

/// Sector-granular read access to the backing image.
#[async_trait]
pub trait SectorRead: Send + Sync {
    /// Read the 512-byte sector at the given LBA.
    async fn read_sector(&self, lba: u64) -> io::Result<[u8; SECTOR_SIZE]>;
}

/// One decoded 16-byte partition table entry.
///
/// The CHS fields are decoded for completeness; only `system_type` and
/// the absolute LBA fields drive the lookup.
#[derive(Debug, Clone, Copy)]
pub struct PartitionRecord {
    pub bootable: bool,
    pub start_head: u8,
    /// 6-bit sector, 0-63.
    pub start_sector: u8,
    /// 10-bit cylinder, 0-1023.
    pub start_cylinder: u16,
    pub end_head: u8,
    pub end_sector: u8,
    pub end_cylinder: u16,
    pub system_type: u8,
    /// Absolute start LBA.
    pub start_sector_abs: u32,
    /// Sector count; zero marks an unused slot.
    pub sector_count_abs: u32,
}

impl PartitionRecord {
    /// Decode one table slot. `slot` must be 16 bytes.
    fn decode(slot: &[u8]) -> Self {
        debug_assert_eq!(slot.len(), ENTRY_SIZE);
        Self {
            bootable: slot[0] & 0x80 != 0,
            start_head: slot[1],
            start_sector: slot[2] & 0x3f,
            start_cylinder: slot[3] as u16 | ((slot[2] as u16) << 2) & 0x0300,
            system_type: slot[4],
            end_head: slot[5],
            end_sector: slot[6] & 0x3f,
            end_cylinder: slot[7] as u16 | ((slot[6] as u16) << 2) & 0x0300,
            start_sector_abs: u32::from_le_bytes(slot[8..12].try_into().unwrap()),
            sector_count_abs: u32::from_le_bytes(slot[12..16].try_into().unwrap()),
        }
    }

    fn is_empty(&self) -> bool {
        self.sector_count_abs == 0
    }

    fn is_extended_container(&self) -> bool {
        matches!(self.system_type, SYS_EXTENDED | SYS_EXTENDED_LBA)
    }

    /// Byte offset and length of the partition's data region.
    fn byte_range(&self) -> (u64, u64) {
        (
            (self.start_sector_abs as u64) << 9,
            (self.sector_count_abs as u64) << 9,
        )
    }
}

/// Decode the four table slots of a boot-record sector.
fn decode_table(sector: &[u8; SECTOR_SIZE]) -> [PartitionRecord; 4] {
    std::array::from_fn(|i| {
        let at = TABLE_OFFSET + i * ENTRY_SIZE;
        PartitionRecord::decode(&sector[at..at + ENTRY_SIZE])
    })
}

/// Resolve `partition` (1-based) to `(offset_bytes, size_bytes)`.
///
/// Fails with [`PartitionError::InvalidLayout`] when sector 0 lacks the
/// boot signature, and with [`PartitionError::NotFound`] when no slot
/// maps to the requested number.
pub async fn locate<S>(image: &S, partition: u32) -> Result<(u64, u64), PartitionError>
where
    S: SectorRead + ?Sized,
{
    let mbr = image.read_sector(0).await?;
    if mbr[SECTOR_SIZE - 2..] != BOOT_SIGNATURE {
        return Err(PartitionError::InvalidLayout);
    }

    // Logical partition numbers start after the four primary slots.
    let mut ext_partnum: u32 = 4;

    for (i, record) in decode_table(&mbr).iter().enumerate() {
        if record.is_empty() {
            continue;
        }

        if record.is_extended_container() {
            let ebr = image.read_sector(record.start_sector_abs as u64).await?;
            for (j, logical) in decode_table(&ebr).iter().enumerate() {
                if logical.is_empty() {
                    continue;
                }
                if ext_partnum + j as u32 + 1 == partition {
                    return Ok(logical.byte_range());
                }
            }
            // Each container owns a full block of four numbers, populated
            // or not.
            ext_partnum += 4;
        } else if i as u32 + 1 == partition {
            return Ok(record.byte_range());
        }
    }

    Err(PartitionError::NotFound(partition))
}
