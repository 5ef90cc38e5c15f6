use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::{
    bus::{Bus, Devices},
    clock::{Clock, ClockEvent, CPU_CYCLES_PER_FRAME},
    hexdump,
    region::BusDevice,
};

/// Slice of CPU cycles the controller is advanced by between clock events.
pub const STEP_SLICE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cpu {
    Master,
    Slave,
}

/// Notifications from the controller to whoever drives the CPUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SendInterrupt { cpu: Cpu, vector: u8, level: u8 },
    /// A transfer wrote `length` bytes of work RAM at `start`.
    WriteNotify { start: u32, length: u32 },
}

#[derive(Debug)]
pub struct Machine {
    pub bus: Bus,
    pub queue: Rc<RefCell<VecDeque<Message>>>,
    pub clock: Clock,
    pub cycles: usize,
    pub frame_ready: bool,
}

impl Machine {
    pub fn new(devices: Devices) -> Self {
        tracing::info!("Initializing SCU bus");
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        let bus = Bus::new(devices, queue.clone());

        Self {
            bus,
            queue,
            clock: Clock::new(),
            cycles: 0,
            frame_ready: false,
        }
    }

    pub fn reset(&mut self) {
        self.bus.reset();
        self.clock.reset();
        self.queue.borrow_mut().clear();
        self.cycles = 0;
        self.frame_ready = false;
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }

    pub fn get_cycles(&self) -> usize {
        self.cycles
    }

    /// Takes every message queued since the last call.
    pub fn drain_messages(&mut self) -> Vec<Message> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn memory_dump(&mut self, start: u32, end: u32) -> String {
        let bytes: Vec<u8> = (start..end).map(|a| self.bus.read_byte(a)).collect();
        hexdump(&bytes, start)
    }

    pub fn step(&mut self, cycles: u32) {
        let mut remaining = cycles;

        while remaining > 0 {
            let slice = remaining.min(STEP_SLICE);

            let events = self.clock.tick(slice);
            if !events.is_empty() {
                self.handle_clock_events(events);
            }

            self.bus.exec(slice);

            self.cycles += slice as usize;
            remaining -= slice;
        }
    }

    fn handle_clock_events(&mut self, events: Vec<ClockEvent>) {
        let (scu, map) = self.bus.split();
        let memory: &mut dyn BusDevice = map;

        for event in events {
            match event {
                ClockEvent::VBlankStart => scu.send_vblank_in(memory),
                ClockEvent::VBlankEnd => scu.send_vblank_out(memory),
                ClockEvent::HBlankStart => scu.send_hblank_in(memory),
                ClockEvent::HBlankEnd => {}
                ClockEvent::ScanlineStart(line) => scu.set_line(line),
                ClockEvent::FrameEnd => {
                    self.frame_ready = true;
                    tracing::trace!(
                        "Frame {} completed, total cycles: {}",
                        self.clock.frame_count(),
                        self.clock.total_cycles()
                    );
                }
            }
        }
    }

    pub fn step_frame(&mut self) {
        self.frame_ready = false;
        let remaining = self.clock.cycles_until_frame_end() as u32;
        self.step(remaining);
    }

    pub fn is_frame_ready(&self) -> bool {
        self.frame_ready
    }

    pub fn get_frame_progress(&self) -> f64 {
        self.clock.frame_progress()
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(Devices::default())
    }
}

#[derive(Default)]
pub struct MachineBuilder {
    devices: Devices,
    slave_running: bool,
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bios(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.bios = Some(device);
        self
    }

    pub fn smpc(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.smpc = Some(device);
        self
    }

    pub fn minit(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.minit = Some(device);
        self
    }

    pub fn sinit(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.sinit = Some(device);
        self
    }

    pub fn cs0(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.cs0 = Some(device);
        self
    }

    pub fn cs1(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.cs1 = Some(device);
        self
    }

    /// CS2 carries the CD block.
    pub fn cs2(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.cs2 = Some(device);
        self
    }

    pub fn sound_ram(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.sound_ram = Some(device);
        self
    }

    pub fn scsp(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.scsp = Some(device);
        self
    }

    pub fn vdp1_ram(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.vdp1_ram = Some(device);
        self
    }

    pub fn vdp1_framebuffer(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.vdp1_framebuffer = Some(device);
        self
    }

    pub fn vdp1_registers(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.vdp1_registers = Some(device);
        self
    }

    pub fn vdp2_ram(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.vdp2_ram = Some(device);
        self
    }

    pub fn vdp2_color_ram(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.vdp2_color_ram = Some(device);
        self
    }

    pub fn vdp2_registers(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.vdp2_registers = Some(device);
        self
    }

    pub fn data_array(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.data_array = Some(device);
        self
    }

    pub fn address_array(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.address_array = Some(device);
        self
    }

    pub fn onchip(&mut self, device: Box<dyn BusDevice>) -> &mut Self {
        self.devices.onchip = Some(device);
        self
    }

    pub fn slave_cpu_running(&mut self, running: bool) -> &mut Self {
        self.slave_running = running;
        self
    }

    /// Consumes the configured devices; a second build starts from defaults.
    pub fn build(&mut self) -> Machine {
        let devices = std::mem::take(&mut self.devices);
        let mut machine = Machine::new(devices);
        machine.bus.scu.set_slave_running(self.slave_running);
        machine
    }
}
