use serde::{Deserialize, Serialize};

use crate::region::BusDevice;

pub const INDIRECT_MODE: u32 = 0x0100_0000;
/// Bit 31 of a descriptor's read address marks the last table entry.
pub const INDIRECT_END: u32 = 0x8000_0000;

const BUS_MASK: u32 = 0x0FFF_FFFF;

/// Programmed state of one DMA level as written by the CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaRegisters {
    pub read: u32,
    pub write: u32,
    pub count: u32,
    pub add: u32,
    pub enable: u32,
    pub mode: u32,
}

impl DmaRegisters {
    pub fn reset(&mut self) {
        self.add = 0x101;
        self.enable = 0;
        self.mode = 7;
    }
}

/// Written range produced by one burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Burst {
    pub start: u32,
    pub length: u32,
}

/// Live transfer state of one DMA level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaChannel {
    pub level: usize,
    pub read_address: u32,
    pub write_address: u32,
    pub transfer_number: i32,
    pub read_add: u32,
    pub write_add: u32,
    pub add_value: u32,
    pub mode: u32,
    pub indirect_address: u32,
}

fn on_bbus(address: u32) -> bool {
    (0x05A0_0000..0x05FF_0000).contains(&(address & 0x1FFF_FFFF))
}

/// Sources that return the same value on every read during a fill.
fn constant_source(address: u32) -> bool {
    (address & 0x1FF0_0000) == 0x0020_0000
        || (address & 0x1E00_0000) == 0x0600_0000
        || (address & 0x1FF0_0000) == 0x05A0_0000
        || (address & 0x1DF0_0000) == 0x05C0_0000
}

impl DmaChannel {
    pub fn new(level: usize) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.transfer_number > 0
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.level);
    }

    /// Latches the programmed registers and derives the per-unit increments.
    pub fn arm(&mut self, regs: &DmaRegisters, memory: &mut dyn BusDevice) {
        self.read_address = regs.read;
        self.write_address = regs.write;
        self.transfer_number = regs.count as i32;
        self.add_value = regs.add;
        self.mode = regs.mode;

        tracing::debug!(
            "[DMA] Level {} armed R={:08X} W={:08X} C={:X} AD={:X} MD={:08X}",
            self.level,
            self.read_address,
            self.write_address,
            self.transfer_number,
            self.add_value,
            self.mode
        );

        self.set_add_value(memory);
    }

    fn set_add_value(&mut self, memory: &mut dyn BusDevice) {
        self.read_add = (self.add_value & 0x100) >> 6;
        self.write_add = 1 << (self.add_value & 7);

        if self.mode & INDIRECT_MODE != 0 {
            self.indirect_address = self.write_address;
            self.load_descriptor(memory);
        } else if self.level > 0 {
            self.transfer_number &= 0xFFF;
            if self.transfer_number == 0 {
                self.transfer_number = 0x1000;
            }
        } else if self.transfer_number == 0 {
            self.transfer_number = 0x10_0000;
        }
    }

    fn load_descriptor(&mut self, memory: &mut dyn BusDevice) {
        let table = self.indirect_address;
        self.transfer_number = memory.read_long(table) as i32;
        self.write_address = memory.read_long(table.wrapping_add(4));
        self.read_address = memory.read_long(table.wrapping_add(8));
        self.indirect_address = table.wrapping_add(0xC);
    }

    /// Advances an armed channel by up to `budget` units. Returns true when
    /// the transfer (or the whole indirect chain) completed on this call.
    pub fn step(
        &mut self,
        memory: &mut dyn BusDevice,
        budget: i32,
        bursts: &mut Vec<Burst>,
    ) -> bool {
        if !self.is_active() {
            return false;
        }

        let mut time = budget;
        if self.mode & INDIRECT_MODE != 0 {
            while time > 0 {
                bursts.push(self.exec(memory, &mut time));
                if self.transfer_number <= 0 {
                    if self.read_address & INDIRECT_END != 0 {
                        self.clear();
                        return true;
                    }
                    self.load_descriptor(memory);
                }
            }
            return false;
        }

        bursts.push(self.exec(memory, &mut time));
        if self.transfer_number <= 0 {
            self.transfer_number = 0;
            return true;
        }
        false
    }

    fn exec(&mut self, memory: &mut dyn BusDevice, time: &mut i32) -> Burst {
        let start = self.write_address;

        if self.read_add == 0 {
            self.exec_fill(memory, time);
        } else {
            self.exec_copy(memory, time);
        }

        Burst {
            start,
            length: self.write_address.wrapping_sub(start),
        }
    }

    fn exec_fill(&mut self, memory: &mut dyn BusDevice, time: &mut i32) {
        if *time <= 0 {
            return;
        }

        let constant = constant_source(self.read_address);
        let fixed = if constant {
            let source = self.read_address & BUS_MASK;
            if self.read_address & 2 != 0 {
                (memory.read_word(source) as u32) << 16
                    | memory.read_word(source.wrapping_add(2)) as u32
            } else {
                memory.read_long(source)
            }
        } else {
            0
        };

        let halves = on_bbus(self.write_address);
        while *time > 0 {
            *time -= 1;
            let value = if constant {
                fixed
            } else {
                memory.read_long(self.read_address & BUS_MASK)
            };

            if halves {
                memory.write_word(self.write_address, (value >> 16) as u16);
                self.write_address = self.write_address.wrapping_add(self.write_add);
                memory.write_word(self.write_address, value as u16);
                self.write_address = self.write_address.wrapping_add(self.write_add);
            } else {
                memory.write_long(self.write_address, value);
                self.write_address = self.write_address.wrapping_add(self.write_add);
            }
            self.read_address = self.read_address.wrapping_add(self.read_add);

            self.transfer_number -= 4;
            if self.transfer_number <= 0 {
                return;
            }
        }
    }

    fn exec_copy(&mut self, memory: &mut dyn BusDevice, time: &mut i32) {
        while *time > 0 {
            *time -= 1;
            if on_bbus(self.write_address) {
                let value = memory.read_word(self.read_address & BUS_MASK);
                memory.write_word(self.write_address, value);
                self.write_address = self.write_address.wrapping_add(self.write_add);
                self.read_address = self.read_address.wrapping_add(2);
                self.transfer_number -= 2;
            } else if on_bbus(self.read_address) {
                let value = memory.read_word(self.read_address & BUS_MASK);
                memory.write_word(self.write_address, value);
                self.write_address = self.write_address.wrapping_add(self.write_add >> 1);
                self.read_address = self.read_address.wrapping_add(2);
                self.transfer_number -= 2;
            } else {
                let value = memory.read_long(self.read_address & BUS_MASK);
                memory.write_long(self.write_address, value);
                self.read_address = self.read_address.wrapping_add(4);
                self.write_address = self.write_address.wrapping_add(self.write_add);
                self.transfer_number -= 4;
            }

            if self.transfer_number <= 0 {
                return;
            }
        }
    }
}
