// SPDX-License-Identifier: Apache-2.0

//! The table of negotiated shared-memory regions and address translation
//! into the local mapping.

use std::fs::File;

use log::debug;

use crate::mem::Mapping;
use crate::{Error, Result};

/// Maximum number of regions one session may negotiate.
pub const MAX_REGIONS: usize = 8;

/// Which address space an incoming address belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrSpace {
    /// Guest-physical addresses, used by descriptor buffer pointers.
    GuestPhys,
    /// The peer's process addresses, used by ring addresses.
    User,
}

/// One negotiated region, as carried by the memory-table message.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegionInfo {
    /// Region start in the guest-physical space.
    pub guest_phys_addr: u64,
    /// Region length in bytes.
    pub memory_size: u64,
    /// Region start in the owning peer's address space.
    pub userspace_addr: u64,
    /// Offset of the region within its backing object.
    pub mmap_offset: u64,
}

struct Region {
    info: RegionInfo,
    mapping: Mapping,
}

/// Ordered set of the session's shared-memory regions.
///
/// The client fills it with the regions it created; the server fills it from
/// the memory-table message, mapping each attached descriptor. Addresses
/// found in rings and descriptors resolve against it by linear scan.
#[derive(Default)]
pub struct MemoryTable {
    regions: Vec<Region>,
}

impl MemoryTable {
    /// An empty table.
    pub fn new() -> Self {
        MemoryTable::default()
    }

    /// Number of registered regions.
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Drops all regions and their mappings.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Registers a region backed by an existing local mapping.
    pub fn add_region(&mut self, info: RegionInfo, mapping: Mapping) -> Result<()> {
        if self.regions.len() == MAX_REGIONS {
            return Err(Error::TooManyRegions);
        }
        if mapping.len() < info.memory_size as usize {
            return Err(Error::RegionTooSmall);
        }
        debug!(
            "region {}: guest {:#x} user {:#x} size {:#x}",
            self.regions.len(),
            info.guest_phys_addr,
            info.userspace_addr,
            info.memory_size
        );
        self.regions.push(Region { info, mapping });
        Ok(())
    }

    /// Maps `file` per `info` and registers the result. Server-side entry
    /// point for each descriptor of the memory-table message.
    pub fn add_mapped_region(&mut self, info: RegionInfo, file: File) -> Result<()> {
        let mapping = Mapping::from_file(file, info.mmap_offset, info.memory_size as usize)?;
        self.add_region(info, mapping)
    }

    /// Resolves `len` bytes at `addr` in `space` to a window of the local
    /// mapping. A miss is fatal to session setup; the result is never a
    /// dangling address.
    pub fn translate(&self, addr: u64, len: usize, space: AddrSpace) -> Result<Mapping> {
        for region in &self.regions {
            let base = match space {
                AddrSpace::GuestPhys => region.info.guest_phys_addr,
                AddrSpace::User => region.info.userspace_addr,
            };
            let size = region.info.memory_size;
            if addr >= base && addr - base < size {
                let offset = addr - base;
                if len as u64 > size - offset {
                    return Err(Error::TranslationMiss { addr, len });
                }
                return region.mapping.subrange(offset as usize, len);
            }
        }
        Err(Error::TranslationMiss { addr, len })
    }
}

#[cfg(test)]
mod tests {
    use crate::mem::tests::test_segment;

    use super::*;

    fn table_with_two_regions() -> MemoryTable {
        let seg_a = test_segment("table-a", 8192);
        let seg_b = test_segment("table-b", 8192);

        let mut table = MemoryTable::new();
        table
            .add_region(
                RegionInfo {
                    guest_phys_addr: 0x1000_0000,
                    memory_size: 8192,
                    userspace_addr: 0x7f00_0000_0000,
                    mmap_offset: 0,
                },
                seg_a.map().unwrap(),
            )
            .unwrap();
        table
            .add_region(
                RegionInfo {
                    guest_phys_addr: 0x2000_0000,
                    memory_size: 8192,
                    userspace_addr: 0x7f10_0000_0000,
                    mmap_offset: 0,
                },
                seg_b.map().unwrap(),
            )
            .unwrap();
        table
    }

    #[test]
    fn translate_both_spaces() {
        let table = table_with_two_regions();
        assert_eq!(table.num_regions(), 2);

        // Any address inside either region resolves in either space.
        let w = table
            .translate(0x1000_0000 + 16, 64, AddrSpace::GuestPhys)
            .unwrap();
        assert_eq!(w.len(), 64);
        let w = table
            .translate(0x7f10_0000_0000 + 4096, 100, AddrSpace::User)
            .unwrap();
        assert_eq!(w.len(), 100);
    }

    #[test]
    fn translate_respects_region_identity() {
        let table = table_with_two_regions();

        let a = table.translate(0x1000_0000, 16, AddrSpace::GuestPhys).unwrap();
        let b = table.translate(0x2000_0000, 16, AddrSpace::GuestPhys).unwrap();
        a.write(0, &[1u8; 16]).unwrap();
        b.write(0, &[2u8; 16]).unwrap();
        let mut buf = [0u8; 16];
        a.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16]);
    }

    #[test]
    fn translate_misses_are_errors() {
        let table = table_with_two_regions();

        assert!(matches!(
            table.translate(0x3000_0000, 1, AddrSpace::GuestPhys),
            Err(Error::TranslationMiss { .. })
        ));
        // In range but overrunning the region end.
        assert!(table
            .translate(0x1000_0000 + 8000, 1000, AddrSpace::GuestPhys)
            .is_err());
        // Guest address asked for in the user space.
        assert!(table.translate(0x1000_0000, 16, AddrSpace::User).is_err());
    }

    #[test]
    fn region_count_capped() {
        let seg = test_segment("table-cap", 4096);
        let mut table = MemoryTable::new();
        for i in 0..MAX_REGIONS {
            table
                .add_region(
                    RegionInfo {
                        guest_phys_addr: (i as u64) << 32,
                        memory_size: 4096,
                        userspace_addr: (i as u64) << 32,
                        mmap_offset: 0,
                    },
                    seg.map().unwrap(),
                )
                .unwrap();
        }
        assert!(table
            .add_region(RegionInfo::default(), seg.map().unwrap())
            .is_err());
    }
}
