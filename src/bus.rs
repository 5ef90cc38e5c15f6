use std::{cell::RefCell, collections::VecDeque, fs::File, io::Read, path::Path, rc::Rc};

use crate::{
    error::ScuError,
    machine::Message,
    mirror::RegionMasks,
    region::{unhandled_read, unhandled_write, BackupRam, BusDevice, RamRegion, Unhandled},
    scu::Scu,
};

/// 512 KiB pages across the 128 MiB external space.
pub const PAGE_COUNT: usize = 0x100;
pub const PAGE_SHIFT: u32 = 19;

/// Sub-window of the last VDP2 page that belongs to the SCU registers.
pub const SCU_WINDOW: u32 = 0x05FE_0000;

pub const WORK_RAM_SIZE: usize = 0x10_0000;
pub const BACKUP_RAM_SIZE: usize = 0x1_0000;

const EXTERNAL_MASK: u32 = 0x0FFF_FFFF;

// Page ranges, end exclusive
pub const BIOS_PAGES: (usize, usize) = (0x00, 0x02);
pub const SMPC_PAGES: (usize, usize) = (0x02, 0x03);
pub const BACKUP_PAGES: (usize, usize) = (0x03, 0x04);
pub const LOW_RAM_PAGES: (usize, usize) = (0x04, 0x06);
pub const MINIT_PAGES: (usize, usize) = (0x20, 0x30);
pub const SINIT_PAGES: (usize, usize) = (0x30, 0x40);
pub const CS0_PAGES: (usize, usize) = (0x40, 0x80);
pub const CS1_PAGES: (usize, usize) = (0x80, 0xA0);
pub const CS2_PAGES: (usize, usize) = (0xB0, 0xB2);
pub const SOUND_RAM_PAGES: (usize, usize) = (0xB4, 0xB6);
pub const SCSP_PAGES: (usize, usize) = (0xB6, 0xB8);
pub const VDP1_RAM_PAGES: (usize, usize) = (0xB8, 0xB9);
pub const VDP1_FB_PAGES: (usize, usize) = (0xB9, 0xBA);
pub const VDP1_REG_PAGES: (usize, usize) = (0xBA, 0xBC);
pub const VDP2_RAM_PAGES: (usize, usize) = (0xBC, 0xBE);
pub const VDP2_CRAM_PAGES: (usize, usize) = (0xBE, 0xBF);
pub const VDP2_REG_PAGE: usize = 0xBF;
pub const HIGH_RAM_PAGES: (usize, usize) = (0xC0, 0x100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Unhandled,
    Device(usize),
    /// VDP2 registers, except for the SCU register window.
    Vdp2OrScu(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Device(usize, u32),
    Scu(u32),
    Unhandled(u32),
    DataArray(u32),
    AddressArray(u32),
    OnChip(u32),
    Unmapped(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Byte,
    Word,
    Long,
}

impl Width {
    fn name(self) -> &'static str {
        match self {
            Width::Byte => "byte",
            Width::Word => "word",
            Width::Long => "long",
        }
    }
}

fn device_read(device: &mut dyn BusDevice, width: Width, address: u32) -> u32 {
    match width {
        Width::Byte => device.read_byte(address) as u32,
        Width::Word => device.read_word(address) as u32,
        Width::Long => device.read_long(address),
    }
}

fn device_write(device: &mut dyn BusDevice, width: Width, address: u32, value: u32) {
    match width {
        Width::Byte => device.write_byte(address, value as u8),
        Width::Word => device.write_word(address, value as u16),
        Width::Long => device.write_long(address, value),
    }
}

/// Devices supplied by the embedder. Anything left `None` decodes as
/// unhandled.
#[derive(Debug, Default)]
pub struct Devices {
    pub bios: Option<Box<dyn BusDevice>>,
    pub smpc: Option<Box<dyn BusDevice>>,
    /// Word writes here capture input on the slave CPU.
    pub minit: Option<Box<dyn BusDevice>>,
    /// Word writes here capture input on the master CPU.
    pub sinit: Option<Box<dyn BusDevice>>,
    pub cs0: Option<Box<dyn BusDevice>>,
    pub cs1: Option<Box<dyn BusDevice>>,
    pub cs2: Option<Box<dyn BusDevice>>,
    pub sound_ram: Option<Box<dyn BusDevice>>,
    pub scsp: Option<Box<dyn BusDevice>>,
    pub vdp1_ram: Option<Box<dyn BusDevice>>,
    pub vdp1_framebuffer: Option<Box<dyn BusDevice>>,
    pub vdp1_registers: Option<Box<dyn BusDevice>>,
    pub vdp2_ram: Option<Box<dyn BusDevice>>,
    pub vdp2_color_ram: Option<Box<dyn BusDevice>>,
    pub vdp2_registers: Option<Box<dyn BusDevice>>,
    pub data_array: Option<Box<dyn BusDevice>>,
    pub address_array: Option<Box<dyn BusDevice>>,
    pub onchip: Option<Box<dyn BusDevice>>,
}

fn or_unhandled(device: Option<Box<dyn BusDevice>>) -> Box<dyn BusDevice> {
    device.unwrap_or_else(|| Box::new(Unhandled))
}

/// Page table plus the CPU-internal handler sets. This is everything a
/// transfer can reach; the SCU's own register window is not part of it.
#[derive(Debug)]
pub struct MemoryMap {
    pages: [Handler; PAGE_COUNT],
    devices: Vec<Box<dyn BusDevice>>,
    data_array: Box<dyn BusDevice>,
    address_array: Box<dyn BusDevice>,
    onchip: Box<dyn BusDevice>,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    pub fn new() -> Self {
        Self {
            pages: [Handler::Unhandled; PAGE_COUNT],
            devices: Vec::new(),
            data_array: Box::new(Unhandled),
            address_array: Box::new(Unhandled),
            onchip: Box::new(Unhandled),
        }
    }

    fn attach(&mut self, (start, end): (usize, usize), device: Box<dyn BusDevice>) -> usize {
        let id = self.devices.len();
        self.devices.push(device);
        for page in start..end.min(PAGE_COUNT) {
            self.pages[page] = Handler::Device(id);
        }
        id
    }

    /// Points pages `start..end` at `device`. Later installs overwrite
    /// earlier ones.
    pub fn install(
        &mut self,
        start: usize,
        end: usize,
        device: Box<dyn BusDevice>,
    ) -> Result<usize, ScuError> {
        if start >= end || end > PAGE_COUNT {
            return Err(ScuError::InvalidPageRange { start, end });
        }
        Ok(self.attach((start, end), device))
    }

    pub fn install_vdp2_registers(&mut self, device: Box<dyn BusDevice>) -> usize {
        let id = self.devices.len();
        self.devices.push(device);
        self.pages[VDP2_REG_PAGE] = Handler::Vdp2OrScu(id);
        id
    }

    pub fn set_data_array(&mut self, device: Box<dyn BusDevice>) {
        self.data_array = device;
    }

    pub fn set_address_array(&mut self, device: Box<dyn BusDevice>) {
        self.address_array = device;
    }

    pub fn set_onchip(&mut self, device: Box<dyn BusDevice>) {
        self.onchip = device;
    }

    pub fn handler(&self, page: usize) -> Handler {
        self.pages[page & (PAGE_COUNT - 1)]
    }

    pub fn device_mut(&mut self, id: usize) -> Option<&mut Box<dyn BusDevice>> {
        self.devices.get_mut(id)
    }

    /// Decodes the cache zone in the top three address bits.
    pub fn route(&self, address: u32) -> Route {
        match address >> 29 {
            0 | 1 | 5 => {
                let masked = address & EXTERNAL_MASK;
                let page = ((masked >> PAGE_SHIFT) & 0xFF) as usize;
                match self.pages[page] {
                    Handler::Unhandled => Route::Unhandled(masked),
                    Handler::Device(id) => Route::Device(id, masked),
                    Handler::Vdp2OrScu(id) => {
                        if masked & 0xFFFF_0000 == SCU_WINDOW {
                            Route::Scu(masked)
                        } else {
                            Route::Device(id, masked)
                        }
                    }
                }
            }
            2 | 6 => Route::DataArray(address),
            3 => Route::AddressArray(address),
            7 => Route::OnChip(address & 0x1FF),
            _ => Route::Unmapped(address),
        }
    }

    fn read_routed(&mut self, width: Width, route: Route) -> u32 {
        match route {
            Route::Device(id, address) => device_read(self.devices[id].as_mut(), width, address),
            Route::DataArray(address) => device_read(self.data_array.as_mut(), width, address),
            Route::AddressArray(address) => match width {
                Width::Long => self.address_array.read_long(address),
                _ => 0,
            },
            Route::OnChip(address) => device_read(self.onchip.as_mut(), width, address),
            Route::Scu(address) | Route::Unhandled(address) | Route::Unmapped(address) => {
                unhandled_read(width.name(), address);
                0
            }
        }
    }

    fn write_routed(&mut self, width: Width, route: Route, value: u32) {
        match route {
            Route::Device(id, address) => {
                device_write(self.devices[id].as_mut(), width, address, value)
            }
            Route::DataArray(address) => {
                device_write(self.data_array.as_mut(), width, address, value)
            }
            Route::AddressArray(address) => match width {
                Width::Long => self.address_array.write_long(address, value),
                _ => unhandled_write(width.name(), address, value),
            },
            Route::OnChip(address) => device_write(self.onchip.as_mut(), width, address, value),
            Route::Scu(address) | Route::Unhandled(address) | Route::Unmapped(address) => {
                unhandled_write(width.name(), address, value)
            }
        }
    }

    fn read(&mut self, width: Width, address: u32) -> u32 {
        let route = self.route(address);
        self.read_routed(width, route)
    }

    fn write(&mut self, width: Width, address: u32, value: u32) {
        let route = self.route(address);
        self.write_routed(width, route, value)
    }
}

impl BusDevice for MemoryMap {
    fn read_byte(&mut self, address: u32) -> u8 {
        self.read(Width::Byte, address) as u8
    }

    fn read_word(&mut self, address: u32) -> u16 {
        self.read(Width::Word, address) as u16
    }

    fn read_long(&mut self, address: u32) -> u32 {
        self.read(Width::Long, address)
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        self.write(Width::Byte, address, value as u32)
    }

    fn write_word(&mut self, address: u32, value: u16) {
        self.write(Width::Word, address, value as u32)
    }

    fn write_long(&mut self, address: u32, value: u32) {
        self.write(Width::Long, address, value)
    }
}

/// CPU-side address dispatcher: the memory map plus the SCU, whose register
/// window sits inside the VDP2 page.
#[derive(Debug)]
pub struct Bus {
    pub map: MemoryMap,
    pub scu: Scu,
    masks: RegionMasks,
}

impl Bus {
    pub fn new(devices: Devices, queue: Rc<RefCell<VecDeque<Message>>>) -> Self {
        let Devices {
            bios,
            smpc,
            minit,
            sinit,
            cs0,
            cs1,
            cs2,
            sound_ram,
            scsp,
            vdp1_ram,
            vdp1_framebuffer,
            vdp1_registers,
            vdp2_ram,
            vdp2_color_ram,
            vdp2_registers,
            data_array,
            address_array,
            onchip,
        } = devices;

        let mut map = MemoryMap::new();
        map.attach(BIOS_PAGES, or_unhandled(bios));
        map.attach(SMPC_PAGES, or_unhandled(smpc));
        map.attach(BACKUP_PAGES, Box::new(BackupRam::new(BACKUP_RAM_SIZE)));
        map.attach(LOW_RAM_PAGES, Box::new(RamRegion::new(WORK_RAM_SIZE)));
        map.attach(MINIT_PAGES, or_unhandled(minit));
        map.attach(SINIT_PAGES, or_unhandled(sinit));
        map.attach(CS0_PAGES, or_unhandled(cs0));
        map.attach(CS1_PAGES, or_unhandled(cs1));
        map.attach(CS2_PAGES, or_unhandled(cs2));
        map.attach(SOUND_RAM_PAGES, or_unhandled(sound_ram));
        map.attach(SCSP_PAGES, or_unhandled(scsp));
        map.attach(VDP1_RAM_PAGES, or_unhandled(vdp1_ram));
        map.attach(VDP1_FB_PAGES, or_unhandled(vdp1_framebuffer));
        map.attach(VDP1_REG_PAGES, or_unhandled(vdp1_registers));
        map.attach(VDP2_RAM_PAGES, or_unhandled(vdp2_ram));
        map.attach(VDP2_CRAM_PAGES, or_unhandled(vdp2_color_ram));
        map.install_vdp2_registers(or_unhandled(vdp2_registers));
        map.attach(HIGH_RAM_PAGES, Box::new(RamRegion::new(WORK_RAM_SIZE)));

        map.set_data_array(or_unhandled(data_array));
        map.set_address_array(or_unhandled(address_array));
        map.set_onchip(or_unhandled(onchip));

        tracing::info!("[BUS] Memory map ready, {} devices", map.devices.len());

        Self {
            map,
            scu: Scu::new(queue),
            masks: RegionMasks::standard(),
        }
    }

    pub fn reset(&mut self) {
        self.scu.reset();
    }

    pub fn masks(&self) -> &RegionMasks {
        &self.masks
    }

    /// Controller and the memory it transfers against, borrowed together.
    pub fn split(&mut self) -> (&mut Scu, &mut MemoryMap) {
        (&mut self.scu, &mut self.map)
    }

    pub fn exec(&mut self, timing: u32) {
        self.scu.exec(&mut self.map, timing);
    }

    pub fn read_byte(&mut self, address: u32) -> u8 {
        match self.map.route(address) {
            Route::Scu(address) => self.scu.read_byte(address),
            route => self.map.read_routed(Width::Byte, route) as u8,
        }
    }

    pub fn read_word(&mut self, address: u32) -> u16 {
        match self.map.route(address) {
            Route::Scu(address) => self.scu.read_word(address),
            route => self.map.read_routed(Width::Word, route) as u16,
        }
    }

    pub fn read_long(&mut self, address: u32) -> u32 {
        match self.map.route(address) {
            Route::Scu(address) => self.scu.read_long(address),
            route => self.map.read_routed(Width::Long, route),
        }
    }

    pub fn write_byte(&mut self, address: u32, value: u8) {
        match self.map.route(address) {
            Route::Scu(address) => self.scu.write_byte(address, value),
            route => self.map.write_routed(Width::Byte, route, value as u32),
        }
    }

    pub fn write_word(&mut self, address: u32, value: u16) {
        match self.map.route(address) {
            Route::Scu(address) => self.scu.write_word(address, value),
            route => self.map.write_routed(Width::Word, route, value as u32),
        }
    }

    pub fn write_long(&mut self, address: u32, value: u32) {
        match self.map.route(address) {
            Route::Scu(address) => self.scu.write_long(&mut self.map, address, value),
            route => self.map.write_routed(Width::Long, route, value),
        }
    }

    /// Copies `data` straight into device backing storage, folding each
    /// address through the region masks. Returns the number of bytes stored.
    pub fn load_bytes(&mut self, address: u32, data: &[u8]) -> usize {
        let mut stored = 0;
        for (i, byte) in data.iter().enumerate() {
            let address = address.wrapping_add(i as u32);
            if self.masks.read_mask(address) == 0 {
                continue;
            }
            let folded = self.masks.fold_read(address);
            let Route::Device(id, folded) = self.map.route(folded) else {
                continue;
            };
            let Some(buffer) = self.map.devices[id].buffer_mut() else {
                continue;
            };
            let len = buffer.len();
            if len == 0 {
                continue;
            }
            buffer[folded as usize & (len - 1)] = *byte;
            stored += 1;
        }
        stored
    }

    pub fn load_file(&mut self, address: u32, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let mut file = File::open(path.as_ref())?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let stored = self.load_bytes(address, &data);
        tracing::info!(
            "[BUS] Loaded {} of {} bytes from {:?} at {:08X}",
            stored,
            data.len(),
            path.as_ref(),
            address
        );
        Ok(stored)
    }
}
