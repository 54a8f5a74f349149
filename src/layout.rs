// MIT License - Copyright (c) 2021 TJForc
// EVO panel memory layout

use bitflags::bitflags;

use crate::error::{Result, SessionError};
use crate::memory::MemorySnapshot;

pub const MAX_ZONES: u16 = 192;
pub const MAX_PARTITIONS: u16 = 8;

/// Labels are fixed-width ASCII, space padded.
pub const LABEL_LEN: u8 = 16;

const ZONE_LABELS_LOW: u16 = 0x430;
const ZONE_LABELS_HIGH: u16 = 0x62F7;
const PARTITION_LABELS: u16 = 0x3A6B;
const PARTITION_STRIDE: u16 = 107;

/// RAM block holding the first zone status page.
pub const ZONE_PAGE_LOW: u16 = 1;
/// RAM block holding the second zone status page.
pub const ZONE_PAGE_HIGH: u16 = 9;
/// RAM blocks holding partition flags.
pub const PARTITION_PAGES: (u16, u16) = (3, 4);
/// Bytes of flags per partition.
pub const PARTITION_FLAGS_LEN: usize = 6;

/// EEPROM address of the label of zone `zone` (1-192).
pub fn zone_label_address(zone: u16) -> Result<u16> {
    match zone {
        1..=96 => Ok(ZONE_LABELS_LOW + (zone - 1) * LABEL_LEN as u16),
        97..=MAX_ZONES => Ok(ZONE_LABELS_HIGH + (zone - 97) * LABEL_LEN as u16),
        _ => Err(SessionError::InvalidArgument {
            details: format!("zone must be 1 to {}, got {}", MAX_ZONES, zone),
        }),
    }
}

/// EEPROM address of the label of partition `partition` (1-8).
pub fn partition_label_address(partition: u16) -> Result<u16> {
    if !(1..=MAX_PARTITIONS).contains(&partition) {
        return Err(SessionError::InvalidArgument {
            details: format!("partition must be 1 to {}, got {}", MAX_PARTITIONS, partition),
        });
    }
    Ok(PARTITION_LABELS + (partition - 1) * PARTITION_STRIDE)
}

/// Decode a label read from EEPROM.
pub fn decode_label(raw: &[u8]) -> String {
    raw.iter()
        .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { ' ' })
        .collect::<String>()
        .trim_end()
        .to_string()
}

bitflags! {
    /// Status of a single zone.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ZoneFlags: u8 {
        const OPENED      = 0b001;
        const TAMPERED    = 0b010;
        const LOW_BATTERY = 0b100;
    }
}

/// Raw zone bitmaps, one bit per zone, LSB of byte 0 is zone 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneStateFlags {
    pub opened: Vec<u8>,
    pub tampered: Vec<u8>,
    pub low_battery: Vec<u8>,
}

impl ZoneStateFlags {
    /// Pull the zone bitmaps out of the two zone status pages.
    pub fn from_snapshot(snapshot: &MemorySnapshot) -> Option<Self> {
        Some(Self {
            opened: snapshot.read_span((ZONE_PAGE_LOW, 28..40), (ZONE_PAGE_HIGH, 0..22))?,
            tampered: snapshot.read_span((ZONE_PAGE_LOW, 40..52), (ZONE_PAGE_HIGH, 22..34))?,
            low_battery: snapshot.read_bytes(ZONE_PAGE_HIGH, 34..64)?.to_vec(),
        })
    }

    /// Flags of zone `zone` (1-based). Zones beyond a bitmap read as clear.
    pub fn zone(&self, zone: u16) -> ZoneFlags {
        let Some(index) = (zone as usize).checked_sub(1) else {
            return ZoneFlags::empty();
        };
        let mut flags = ZoneFlags::empty();
        flags.set(ZoneFlags::OPENED, bit(&self.opened, index));
        flags.set(ZoneFlags::TAMPERED, bit(&self.tampered, index));
        flags.set(ZoneFlags::LOW_BATTERY, bit(&self.low_battery, index));
        flags
    }
}

fn bit(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
}

/// Six flag bytes per partition, partitions 1-8 in order.
pub fn partition_flags(snapshot: &MemorySnapshot) -> Option<Vec<[u8; PARTITION_FLAGS_LEN]>> {
    let (first, second) = PARTITION_PAGES;
    let merged = snapshot.read_span((first, 32..64), (second, 0..16))?;
    Some(
        merged
            .chunks_exact(PARTITION_FLAGS_LEN)
            .filter_map(|c| c.try_into().ok())
            .collect(),
    )
}
