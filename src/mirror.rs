use serde::{Deserialize, Serialize};

/// One mask per 64 KiB page of the 128 MiB physical space.
pub const MASK_PAGES: usize = 0x800;

const PHYSICAL_MASK: u32 = 0x07FF_FFFF;

/// Per-page read and write masks describing how each region mirrors.
///
/// A stored mask is the region's own size mask ORed with its start address,
/// so `address & mask` folds any mirror back onto the canonical range. A
/// zero mask marks a page as inaccessible for that direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMasks {
    read: Vec<u32>,
    write: Vec<u32>,
}

impl Default for RegionMasks {
    fn default() -> Self {
        Self {
            read: vec![0; MASK_PAGES],
            write: vec![0; MASK_PAGES],
        }
    }
}

impl RegionMasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard console layout.
    pub fn standard() -> Self {
        let mut masks = Self::new();

        masks.fill(0x0000_0000, 0x07FF_FFFF, 0, false, false);
        masks.fill(0x0000_0000, 0x000F_FFFF, 0x0007_FFFF, true, false); // BIOS
        masks.fill(0x0010_0000, 0x0017_FFFF, 0x0000_007F, true, true); // SMPC
        masks.fill(0x0018_0000, 0x001F_FFFF, 0x0000_FFFF, true, true); // backup RAM
        masks.fill(0x0020_0000, 0x002F_FFFF, 0x000F_FFFF, true, true); // low work RAM
        masks.fill(0x0100_0000, 0x017F_FFFF, 0, true, true); // MINIT
        masks.fill(0x0180_0000, 0x01FF_FFFF, 0, true, true); // SINIT
        masks.fill(0x0200_0000, 0x03FF_FFFF, 0, true, true); // CS0
        masks.fill(0x0400_0000, 0x04FF_FFFF, 0, true, true); // CS1
        masks.fill(0x0580_0000, 0x058F_FFFF, 0x0000_003F, true, true); // CS2
        masks.fill(0x05A0_0000, 0x05AF_FFFF, 0x0007_FFFF, true, true); // sound RAM
        masks.fill(0x05B0_0000, 0x05BF_FFFF, 0x0000_0FFF, true, true); // SCSP
        masks.fill(0x05C0_0000, 0x05C7_FFFF, 0x0007_FFFF, true, true); // VDP1 VRAM
        masks.fill(0x05C8_0000, 0x05CF_FFFF, 0x0003_FFFF, true, true); // VDP1 framebuffer
        masks.fill(0x05D0_0000, 0x05D7_FFFF, 0x0000_001F, true, true); // VDP1 registers
        masks.fill(0x05E0_0000, 0x05EF_FFFF, 0x0007_FFFF, true, true); // VDP2 VRAM
        masks.fill(0x05F0_0000, 0x05F7_FFFF, 0x0000_0FFF, true, true); // VDP2 color RAM
        masks.fill(0x05F8_0000, 0x05FB_FFFF, 0x0000_01FF, true, true); // VDP2 registers
        masks.fill(0x05FE_0000, 0x05FE_FFFF, 0x0000_00FF, true, true); // SCU registers
        masks.fill(0x0600_0000, 0x07FF_FFFF, 0x000F_FFFF, true, true); // high work RAM

        masks
    }

    /// Stamps every page from `start` through `end` inclusive.
    pub fn fill(&mut self, start: u32, end: u32, mask: u32, readable: bool, writable: bool) {
        let read_mask = if readable { mask | start } else { 0 };
        let write_mask = if writable { mask | start } else { 0 };

        let first = (start >> 16) as usize;
        let last = ((end >> 16) as usize).min(MASK_PAGES - 1);
        for page in first..=last {
            self.read[page] = read_mask;
            self.write[page] = write_mask;
        }
    }

    fn page(address: u32) -> usize {
        ((address & PHYSICAL_MASK) >> 16) as usize
    }

    pub fn read_mask(&self, address: u32) -> u32 {
        self.read[Self::page(address)]
    }

    pub fn write_mask(&self, address: u32) -> u32 {
        self.write[Self::page(address)]
    }

    pub fn fold_read(&self, address: u32) -> u32 {
        address & self.read_mask(address)
    }

    pub fn fold_write(&self, address: u32) -> u32 {
        address & self.write_mask(address)
    }
}
