use std::{
    fmt::{self, Debug},
    fs::File,
    io::Read,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

/// A memory-mapped device as seen from the CPU bus. Addresses handed to a
/// device are already masked by the dispatcher; devices decide their own
/// mirroring.
///
/// Every access width has a default that logs the access and returns zero, so
/// a device only implements the widths its hardware actually decodes.
pub trait BusDevice: Debug {
    fn read_byte(&mut self, address: u32) -> u8 {
        unhandled_read("byte", address);
        0
    }

    fn read_word(&mut self, address: u32) -> u16 {
        unhandled_read("word", address);
        0
    }

    fn read_long(&mut self, address: u32) -> u32 {
        unhandled_read("long", address);
        0
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        unhandled_write("byte", address, value as u32);
    }

    fn write_word(&mut self, address: u32, value: u16) {
        unhandled_write("word", address, value as u32);
    }

    fn write_long(&mut self, address: u32, value: u32) {
        unhandled_write("long", address, value);
    }

    /// Backing storage for bulk loads, when the device has any.
    fn buffer_mut(&mut self) -> Option<&mut [u8]> {
        None
    }
}

pub(crate) fn unhandled_read(width: &str, address: u32) {
    tracing::trace!("[BUS] Unhandled {} read {:08X}", width, address);
}

pub(crate) fn unhandled_write(width: &str, address: u32, value: u32) {
    tracing::trace!(
        "[BUS] Unhandled {} write {:08X} = {:08X}",
        width,
        address,
        value
    );
}

/// Open decode: every access is logged and reads return zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Unhandled;

impl BusDevice for Unhandled {}

/// Big-endian byte buffer mirrored across its power-of-two size.
#[derive(Default, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({:#X} bytes)", self.data.len())
    }
}

impl Buffer {
    pub fn new(size: usize, fill: u8) -> Self {
        let size = size.max(4).next_power_of_two();
        Self {
            data: vec![fill; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn offset(&self, address: u32) -> usize {
        address as usize & (self.data.len() - 1)
    }

    pub fn read_u8(&self, address: u32) -> u8 {
        self.data[self.offset(address)]
    }

    pub fn read_u16(&self, address: u32) -> u16 {
        u16::from_be_bytes([self.read_u8(address), self.read_u8(address.wrapping_add(1))])
    }

    pub fn read_u32(&self, address: u32) -> u32 {
        u32::from_be_bytes([
            self.read_u8(address),
            self.read_u8(address.wrapping_add(1)),
            self.read_u8(address.wrapping_add(2)),
            self.read_u8(address.wrapping_add(3)),
        ])
    }

    pub fn write_u8(&mut self, address: u32, value: u8) {
        let offset = self.offset(address);
        self.data[offset] = value;
    }

    pub fn write_u16(&mut self, address: u32, value: u16) {
        for (i, byte) in value.to_be_bytes().into_iter().enumerate() {
            self.write_u8(address.wrapping_add(i as u32), byte);
        }
    }

    pub fn write_u32(&mut self, address: u32, value: u32) {
        for (i, byte) in value.to_be_bytes().into_iter().enumerate() {
            self.write_u8(address.wrapping_add(i as u32), byte);
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct RamRegion {
    pub buffer: Buffer,
}

impl RamRegion {
    pub fn new(size: usize) -> Self {
        Self::filled(size, 0)
    }

    /// Region whose cells power up holding `fill`. Used for the open
    /// cartridge windows, which read back all ones.
    pub fn filled(size: usize, fill: u8) -> Self {
        Self {
            buffer: Buffer::new(size, fill),
        }
    }
}

impl BusDevice for RamRegion {
    fn read_byte(&mut self, address: u32) -> u8 {
        self.buffer.read_u8(address)
    }

    fn read_word(&mut self, address: u32) -> u16 {
        self.buffer.read_u16(address)
    }

    fn read_long(&mut self, address: u32) -> u32 {
        self.buffer.read_u32(address)
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        self.buffer.write_u8(address, value);
    }

    fn write_word(&mut self, address: u32, value: u16) {
        self.buffer.write_u16(address, value);
    }

    fn write_long(&mut self, address: u32, value: u32) {
        self.buffer.write_u32(address, value);
    }

    fn buffer_mut(&mut self) -> Option<&mut [u8]> {
        Some(self.buffer.as_mut_slice())
    }
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct RomRegion {
    pub rom_path: Option<PathBuf>,
    pub buffer: Buffer,
}

impl RomRegion {
    /// Image smaller than `size` is repeated to fill the region.
    pub fn new(rom: &[u8], size: usize) -> Self {
        let mut buffer = Buffer::new(size, 0xFF);
        if !rom.is_empty() {
            for (cell, byte) in buffer.as_mut_slice().iter_mut().zip(rom.iter().cycle()) {
                *cell = *byte;
            }
        }

        Self {
            rom_path: None,
            buffer,
        }
    }

    pub fn load(rom_path: PathBuf, size: usize) -> anyhow::Result<Self> {
        let mut file = File::open(&rom_path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut region = Self::new(&data, size);
        region.rom_path = Some(rom_path);

        Ok(region)
    }
}

impl BusDevice for RomRegion {
    fn read_byte(&mut self, address: u32) -> u8 {
        self.buffer.read_u8(address)
    }

    fn read_word(&mut self, address: u32) -> u16 {
        self.buffer.read_u16(address)
    }

    fn read_long(&mut self, address: u32) -> u32 {
        self.buffer.read_u32(address)
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        unhandled_write("byte", address, value as u32);
    }

    fn write_word(&mut self, address: u32, value: u16) {
        unhandled_write("word", address, value as u32);
    }

    fn write_long(&mut self, address: u32, value: u32) {
        unhandled_write("long", address, value);
    }

    fn buffer_mut(&mut self) -> Option<&mut [u8]> {
        Some(self.buffer.as_mut_slice())
    }
}

/// Battery-backed cartridge RAM. The chip sits on odd bytes of an 8-bit
/// window, so only byte accesses are decoded.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct BackupRam {
    pub buffer: Buffer,
    pub written: bool,
}

impl BackupRam {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: Buffer::new(size, 0),
            written: false,
        }
    }
}

impl BusDevice for BackupRam {
    fn read_byte(&mut self, address: u32) -> u8 {
        self.buffer.read_u8(address)
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        self.buffer.write_u8(address, value);
        self.written = true;
    }

    fn buffer_mut(&mut self) -> Option<&mut [u8]> {
        Some(self.buffer.as_mut_slice())
    }
}
