use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::{
    breakpoint::Breakpoints,
    dma::{Burst, DmaChannel, DmaRegisters},
    dsp::Dsp,
    interrupt::{self, Interrupt, InterruptController},
    machine::Message,
    region::{unhandled_read, unhandled_write, BusDevice},
};

pub const VERSION: u32 = 4;
pub const CHANNELS: usize = 3;

/// Start-factor field value that arms a channel on an enable write.
pub const FACTOR_IMMEDIATE: u32 = 7;
const ENABLE_BIT: u32 = 0x1;
const START_ARMED: u32 = 0x100;

const FULL_DRAIN: i32 = 0x7FFF_FFFF;
const ARM_BUDGET: i32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFactor {
    VBlankIn = 0,
    VBlankOut = 1,
    HBlankIn = 2,
    Timer0 = 3,
    Timer1 = 4,
    SoundRequest = 5,
    SpriteDrawEnd = 6,
}

fn touches_work_ram(burst: &Burst) -> bool {
    if burst.length == 0 {
        return false;
    }
    let start = (burst.start & 0x0FFF_FFFF) as u64;
    let end = start + burst.length as u64;
    let overlaps = |lo: u64, hi: u64| start < hi && end > lo;
    overlaps(0x0020_0000, 0x0030_0000) || overlaps(0x0600_0000, 0x0800_0000)
}

/// System control unit: DMA levels, timers, the DSP and interrupt routing.
///
/// Every entry point that can start a transfer takes the memory the
/// transfer runs against, so the controller never holds a handle back to
/// the bus that owns it.
#[derive(Debug)]
pub struct Scu {
    pub regs: [DmaRegisters; CHANNELS],
    channels: [DmaChannel; CHANNELS],
    pub dstp: u32,
    pub dsta: u32,
    pub pda: u32,
    pub t0c: u32,
    pub t1s: u32,
    pub t1md: u32,
    pub asr0: u32,
    pub asr1: u32,
    pub aref: u32,
    pub rsel: u32,
    pub ver: u32,
    timer0: u32,
    timer0_set: bool,
    timer1_set: bool,
    timer1_preset: u32,
    timer1_counter: i32,
    line: u32,
    pub interrupts: InterruptController,
    pub dsp: Dsp,
    pub breakpoints: Breakpoints,
    queue: Rc<RefCell<VecDeque<Message>>>,
}

impl Scu {
    pub fn new(queue: Rc<RefCell<VecDeque<Message>>>) -> Self {
        let mut scu = Self {
            regs: [DmaRegisters::default(); CHANNELS],
            channels: [DmaChannel::new(0), DmaChannel::new(1), DmaChannel::new(2)],
            dstp: 0,
            dsta: 0,
            pda: 0,
            t0c: 0,
            t1s: 0,
            t1md: 0,
            asr0: 0,
            asr1: 0,
            aref: 0,
            rsel: 0,
            ver: VERSION,
            timer0: 0,
            timer0_set: false,
            timer1_set: false,
            timer1_preset: 0,
            timer1_counter: 0,
            line: 0,
            interrupts: InterruptController::new(queue.clone()),
            dsp: Dsp::new(),
            breakpoints: Breakpoints::new(),
            queue,
        };
        scu.reset();
        scu
    }

    pub fn reset(&mut self) {
        for regs in self.regs.iter_mut() {
            regs.reset();
        }
        for channel in self.channels.iter_mut() {
            channel.clear();
        }
        self.dstp = 0;
        self.dsta = 0;
        self.dsp.reset();
        self.pda = 0;
        self.t1md = 0;
        self.interrupts.reset();
        self.asr0 = 0;
        self.asr1 = 0;
        self.aref = 0;
        self.rsel = 0;
        self.ver = VERSION;
        self.timer0 = 0;
        self.timer1_counter = 0;
    }

    pub fn channel(&self, level: usize) -> &DmaChannel {
        &self.channels[level]
    }

    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    pub fn set_slave_running(&mut self, running: bool) {
        self.interrupts.slave_running = running;
    }

    fn raise(&mut self, interrupt: Interrupt) {
        if let Err(e) = self.interrupts.raise(interrupt) {
            tracing::debug!("[SCU] {}", e);
        }
    }

    fn notify(&self, burst: &Burst) {
        if touches_work_ram(burst) {
            self.queue.borrow_mut().push_back(Message::WriteNotify {
                start: burst.start,
                length: burst.length,
            });
        }
    }

    /// Advances timers, DMA and the DSP by `timing` CPU cycles.
    pub fn exec(&mut self, memory: &mut dyn BusDevice, timing: u32) {
        if self.t1md & 0x1 != 0
            && (self.t1md & 0x80 == 0 || self.line == self.t0c || self.t0c > 500)
        {
            self.timer1_exec(memory, timing);
        }

        self.process_dma(memory, (timing << 4) as i32);

        if self.dsp.is_executing() {
            let mut counter = timing as i32;
            while counter > 0 {
                self.breakpoints.check(self.dsp.pc());
                let outcome = self.dsp.step(memory);
                if outcome.ended {
                    counter = 1;
                    if outcome.interrupt {
                        self.send_dsp_end();
                    }
                }
                if outcome.held {
                    counter += 1;
                }
                counter -= 1;
            }
        }
    }

    fn timer1_exec(&mut self, memory: &mut dyn BusDevice, timing: u32) {
        if self.timer1_counter <= 0 {
            return;
        }
        self.timer1_counter -= (timing >> 1) as i32;
        if self.timer1_counter <= 0 {
            self.timer1_set = true;
            if self.t1md & 0x80 == 0 || self.timer0_set {
                self.send_timer1(memory);
            }
        }
    }

    /// Steps all three levels in order, lowest first.
    pub fn process_dma(&mut self, memory: &mut dyn BusDevice, budget: i32) {
        for level in 0..CHANNELS {
            let mut bursts = Vec::new();
            let finished = self.channels[level].step(memory, budget, &mut bursts);
            for burst in bursts.iter() {
                self.notify(burst);
            }
            if finished {
                tracing::debug!("[DMA] Level {} end", level);
                self.raise(interrupt::dma_end(level));
            }
        }
    }

    fn arm(&mut self, memory: &mut dyn BusDevice, level: usize) {
        let regs = self.regs[level];
        self.channels[level].arm(&regs, memory);
        self.process_dma(memory, ARM_BUDGET);
    }

    fn write_enable(&mut self, memory: &mut dyn BusDevice, level: usize, value: u32) {
        if value & ENABLE_BIT != 0 && self.regs[level].mode & 0x7 == FACTOR_IMMEDIATE {
            if self.channels[level].transfer_number != 0 {
                self.process_dma(memory, FULL_DRAIN);
            }
            self.arm(memory, level);
        }
        self.regs[level].enable = value;
    }

    pub fn check_start_factor(&mut self, memory: &mut dyn BusDevice, factor: StartFactor) {
        for level in 0..CHANNELS {
            let regs = self.regs[level];
            if regs.enable & START_ARMED == 0 || regs.mode & 0x7 != factor as u32 {
                continue;
            }
            if self.channels[level].is_active() {
                self.process_dma(memory, FULL_DRAIN);
            }
            self.arm(memory, level);
            self.regs[level].enable = 0;
        }
    }

    pub fn read_byte(&mut self, address: u32) -> u8 {
        match address & 0xFF {
            0xA7 => self.interrupts.ist as u8,
            _ => {
                unhandled_read("byte", address);
                0
            }
        }
    }

    pub fn read_word(&mut self, address: u32) -> u16 {
        unhandled_read("word", address);
        0
    }

    pub fn read_long(&mut self, address: u32) -> u32 {
        let offset = address & 0xFF;
        match offset {
            0x00 | 0x20 | 0x40 => self.regs[(offset >> 5) as usize].read,
            0x04 | 0x24 | 0x44 => self.regs[(offset >> 5) as usize].write,
            0x08 | 0x28 | 0x48 => self.regs[(offset >> 5) as usize].count,
            0x7C => {
                for (level, bit) in [0x10, 0x100, 0x1000].into_iter().enumerate() {
                    if self.channels[level].is_active() {
                        self.dsta |= bit;
                    } else {
                        self.dsta &= !bit;
                    }
                }
                self.dsta
            }
            0x80 => self.dsp.read_control(),
            0x8C => self.dsp.read_data(),
            0xA4 => self.interrupts.ist,
            0xA8 => self.interrupts.aiack,
            0xC4 => self.rsel,
            0xC8 => self.ver,
            _ => {
                unhandled_read("long", address);
                0
            }
        }
    }

    pub fn write_byte(&mut self, address: u32, value: u8) {
        match address & 0xFF {
            0xA7 => self
                .interrupts
                .write_status(0xFFFF_FF00 | value as u32),
            _ => unhandled_write("byte", address, value as u32),
        }
    }

    pub fn write_word(&mut self, address: u32, value: u16) {
        unhandled_write("word", address, value as u32);
    }

    pub fn write_long(&mut self, memory: &mut dyn BusDevice, address: u32, value: u32) {
        let offset = address & 0xFF;
        match offset {
            0x00..=0x57 if offset & 0x1F <= 0x14 => {
                let level = (offset >> 5) as usize;
                match offset & 0x1F {
                    0x00 => self.regs[level].read = value,
                    0x04 => self.regs[level].write = value,
                    0x08 => self.regs[level].count = value,
                    0x0C => self.regs[level].add = value,
                    0x10 => self.write_enable(memory, level, value),
                    0x14 => self.regs[level].mode = value,
                    _ => unhandled_write("long", address, value),
                }
            }
            0x60 => self.dstp = value,
            0x7C => self.dsta = value,
            0x80 => self.dsp.write_control(value),
            0x84 => self.dsp.write_program(value),
            0x88 => self.dsp.write_data_address(value),
            0x8C => self.dsp.write_data(value),
            0x90 => self.t0c = value,
            0x94 => {
                self.t1s = value;
                self.timer1_set = true;
                self.timer1_preset = value;
            }
            0x98 => self.t1md = value,
            0xA0 => {
                tracing::trace!("[SCU] IMS = {:X} line {}", value, self.line);
                self.interrupts.write_mask(value);
            }
            0xA4 => self.interrupts.write_status(value),
            0xA8 => self.interrupts.write_abus_ack(value),
            0xB0 => self.asr0 = value,
            0xB4 => self.asr1 = value,
            0xB8 => self.aref = value,
            0xC4 => self.rsel = value,
            _ => unhandled_write("long", address, value),
        }
    }

    pub fn send_vblank_in(&mut self, memory: &mut dyn BusDevice) {
        self.interrupts.remove(&interrupt::TIMER0);
        self.raise(interrupt::VBLANK_IN);
        self.check_start_factor(memory, StartFactor::VBlankIn);
    }

    pub fn send_vblank_out(&mut self, memory: &mut dyn BusDevice) {
        self.raise(interrupt::VBLANK_OUT);
        self.interrupts.remove(&interrupt::VBLANK_IN);
        self.interrupts.remove(&interrupt::TIMER0);
        self.interrupts.remove(&interrupt::TIMER1);
        self.timer0 = 0;

        if self.t1md & 0x1 != 0 {
            if self.timer0 == self.t0c {
                self.timer0_set = true;
                self.send_timer0(memory);
            } else {
                self.timer0_set = false;
                self.interrupts.remove(&interrupt::TIMER0);
            }
        }

        self.check_start_factor(memory, StartFactor::VBlankOut);
    }

    pub fn send_hblank_in(&mut self, memory: &mut dyn BusDevice) {
        self.raise(interrupt::HBLANK_IN);
        self.timer0 = self.timer0.wrapping_add(1);

        if self.t1md & 0x1 != 0 {
            if self.timer0 == self.t0c {
                self.send_timer0(memory);
                self.timer0_set = true;
            } else {
                self.timer0_set = false;
                self.interrupts.remove(&interrupt::TIMER0);
            }

            if self.timer1_set {
                self.timer1_set = false;
                self.timer1_counter = self.timer1_preset as i32;
                self.interrupts.remove(&interrupt::TIMER1);
            }
        }

        self.check_start_factor(memory, StartFactor::HBlankIn);
    }

    pub fn send_timer0(&mut self, memory: &mut dyn BusDevice) {
        self.raise(interrupt::TIMER0);
        self.check_start_factor(memory, StartFactor::Timer0);
    }

    pub fn send_timer1(&mut self, memory: &mut dyn BusDevice) {
        self.raise(interrupt::TIMER1);
        self.check_start_factor(memory, StartFactor::Timer1);
    }

    pub fn send_dsp_end(&mut self) {
        self.raise(interrupt::DSP_END);
    }

    pub fn send_sound_request(&mut self, memory: &mut dyn BusDevice) {
        self.raise(interrupt::SOUND_REQUEST);
        self.check_start_factor(memory, StartFactor::SoundRequest);
    }

    pub fn send_system_manager(&mut self) {
        self.raise(interrupt::SYSTEM_MANAGER);
    }

    pub fn send_pad_interrupt(&mut self) {
        self.raise(interrupt::PAD);
    }

    pub fn send_dma_illegal(&mut self) {
        self.raise(interrupt::DMA_ILLEGAL);
    }

    pub fn send_draw_end(&mut self, memory: &mut dyn BusDevice) {
        self.raise(interrupt::SPRITE_DRAW_END);
        self.check_start_factor(memory, StartFactor::SpriteDrawEnd);
    }

    pub fn send_external_interrupt00(&mut self) {
        self.raise(interrupt::EXTERNAL_00);
    }

    pub fn remove_vblank_in(&mut self) {
        self.interrupts.remove(&interrupt::VBLANK_IN);
    }

    pub fn remove_vblank_out(&mut self) {
        self.interrupts.remove(&interrupt::VBLANK_OUT);
    }

    pub fn remove_hblank_in(&mut self) {
        self.interrupts.remove(&interrupt::HBLANK_IN);
    }

    pub fn remove_timer0(&mut self) {
        self.interrupts.remove(&interrupt::TIMER0);
    }

    pub fn remove_timer1(&mut self) {
        self.interrupts.remove(&interrupt::TIMER1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RamRegion;

    fn scu() -> (Scu, Rc<RefCell<VecDeque<Message>>>) {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        (Scu::new(queue.clone()), queue)
    }

    #[test]
    fn test_reset_values() {
        let (mut scu, _) = scu();
        let mut mem = RamRegion::new(0x100);

        assert_eq!(scu.regs[1].add, 0x101);
        assert_eq!(scu.regs[2].mode, 7);
        assert_eq!(scu.interrupts.ims, 0xBFFF);
        assert_eq!(scu.read_long(0xC8), 4);

        scu.write_long(&mut mem, 0xC4, 1);
        assert_eq!(scu.read_long(0xC4), 1);
        assert_eq!(scu.read_word(0xC4), 0);
    }

    #[test]
    fn test_status_byte_port() {
        let (mut scu, _) = scu();
        scu.interrupts.ist = 0x0000_0123;

        assert_eq!(scu.read_byte(0xA7), 0x23);
        scu.write_byte(0xA7, 0x03);
        assert_eq!(scu.read_long(0xA4), 0x0000_0103);
    }

    #[test]
    fn test_start_factor_arms_and_clears_enable() {
        let (mut scu, _) = scu();
        let mut mem = RamRegion::new(0x0100_0000);
        mem.write_long(0x1000, 0x1234_5678);

        scu.write_long(&mut mem, 0x40, 0x1000);
        scu.write_long(&mut mem, 0x44, 0x2000);
        scu.write_long(&mut mem, 0x48, 4);
        scu.write_long(&mut mem, 0x4C, 0x102);
        scu.write_long(&mut mem, 0x54, StartFactor::HBlankIn as u32);
        scu.write_long(&mut mem, 0x50, START_ARMED);
        assert_eq!(mem.read_long(0x2000), 0);

        scu.send_vblank_in(&mut mem);
        assert_eq!(mem.read_long(0x2000), 0);

        scu.send_hblank_in(&mut mem);
        assert_eq!(mem.read_long(0x2000), 0x1234_5678);
        assert_eq!(scu.regs[2].enable, 0);
        assert!(scu
            .interrupts
            .pending()
            .iter()
            .any(|i| i.vector == 0x49));
    }

    #[test]
    fn test_dsta_reflects_active_levels() {
        let (mut scu, _) = scu();
        let mut mem = RamRegion::new(0x0100_0000);

        scu.write_long(&mut mem, 0x20, 0x1000);
        scu.write_long(&mut mem, 0x24, 0x8000);
        scu.write_long(&mut mem, 0x28, 0x1000);
        scu.write_long(&mut mem, 0x2C, 0x102);
        scu.write_long(&mut mem, 0x30, 0x101);

        assert_eq!(scu.read_long(0x7C), 0x100);
        scu.process_dma(&mut mem, FULL_DRAIN);
        assert_eq!(scu.read_long(0x7C), 0);
    }

    #[test]
    fn test_timer0_compare_on_hblank() {
        let (mut scu, queue) = scu();
        let mut mem = RamRegion::new(0x100);
        scu.write_long(&mut mem, 0xA0, !(interrupt::TIMER0.mask) & 0xBFFF);
        scu.write_long(&mut mem, 0x90, 2);
        scu.write_long(&mut mem, 0x98, 1);

        scu.send_vblank_out(&mut mem);
        scu.send_hblank_in(&mut mem);
        assert!(queue.borrow().is_empty());
        scu.send_hblank_in(&mut mem);

        assert!(queue.borrow().iter().any(|m| matches!(
            m,
            Message::SendInterrupt { vector: 0x43, .. }
        )));
    }

    #[test]
    fn test_work_ram_notify_filter() {
        assert!(touches_work_ram(&Burst {
            start: 0x0600_0000,
            length: 4
        }));
        assert!(touches_work_ram(&Burst {
            start: 0x002F_FFFE,
            length: 4
        }));
        assert!(!touches_work_ram(&Burst {
            start: 0x05C0_0000,
            length: 0x100
        }));
        assert!(!touches_work_ram(&Burst {
            start: 0x0600_0000,
            length: 0
        }));
    }
}
