use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::{
    error::ScuError,
    machine::{Cpu, Message},
};

pub const MAX_PENDING: usize = 30;

/// Mask bit of the A-bus external interrupts, gated by the acknowledge
/// register instead of the status register.
pub const ABUS_MASK: u32 = 0x8000;

pub const IMS_RESET: u32 = 0xBFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    pub vector: u8,
    pub level: u8,
    pub mask: u32,
    pub status: u32,
}

impl Interrupt {
    pub const fn new(vector: u8, level: u8, mask: u32, status: u32) -> Self {
        Self {
            vector,
            level,
            mask,
            status,
        }
    }
}

pub const VBLANK_IN: Interrupt = Interrupt::new(0x40, 0xF, 0x0001, 0x0001);
pub const VBLANK_OUT: Interrupt = Interrupt::new(0x41, 0xE, 0x0002, 0x0002);
pub const HBLANK_IN: Interrupt = Interrupt::new(0x42, 0xD, 0x0004, 0x0004);
pub const TIMER0: Interrupt = Interrupt::new(0x43, 0xC, 0x0008, 0x0008);
pub const TIMER1: Interrupt = Interrupt::new(0x44, 0xB, 0x0010, 0x0010);
pub const DSP_END: Interrupt = Interrupt::new(0x45, 0xA, 0x0020, 0x0020);
pub const SOUND_REQUEST: Interrupt = Interrupt::new(0x46, 0x9, 0x0040, 0x0040);
pub const SYSTEM_MANAGER: Interrupt = Interrupt::new(0x47, 0x8, 0x0080, 0x0080);
pub const PAD: Interrupt = Interrupt::new(0x48, 0x8, 0x0100, 0x0100);
pub const DMA_ILLEGAL: Interrupt = Interrupt::new(0x4C, 0x3, 0x1000, 0x1000);
pub const SPRITE_DRAW_END: Interrupt = Interrupt::new(0x4D, 0x2, 0x2000, 0x2000);
pub const EXTERNAL_00: Interrupt = Interrupt::new(0x50, 0x7, ABUS_MASK, 0x10000);

/// Channel 0 ends on vector 0x4B at level 5, channels 1 and 2 at level 6.
pub const fn dma_end(channel: usize) -> Interrupt {
    let mask = 0x800 >> channel;
    let level = if channel == 0 { 5 } else { 6 };
    Interrupt::new(0x4B - channel as u8, level, mask, mask)
}

pub fn vector_name(vector: u8) -> &'static str {
    match vector {
        0x40 => "VBlank-IN",
        0x41 => "VBlank-OUT",
        0x42 => "HBlank-IN",
        0x43 => "Timer 0",
        0x44 => "Timer 1",
        0x45 => "DSP End",
        0x46 => "Sound Request",
        0x47 => "System Manager",
        0x48 => "PAD Interrupt",
        0x49 => "Level 2 DMA End",
        0x4A => "Level 1 DMA End",
        0x4B => "Level 0 DMA End",
        0x4C => "DMA-illegal",
        0x4D => "Sprite Draw End",
        0x50..=0x5F => "External Interrupt",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Queued,
    /// A-bus request with no acknowledge outstanding, or masked.
    Ignored,
}

/// Interrupt status/mask registers and the pending queue.
#[derive(Debug)]
pub struct InterruptController {
    pub ims: u32,
    pub ist: u32,
    pub aiack: u32,
    pub slave_running: bool,
    pending: Vec<Interrupt>,
    queue: Rc<RefCell<VecDeque<Message>>>,
}

impl InterruptController {
    pub fn new(queue: Rc<RefCell<VecDeque<Message>>>) -> Self {
        Self {
            ims: IMS_RESET,
            ist: 0,
            aiack: 0,
            slave_running: false,
            pending: Vec::with_capacity(MAX_PENDING),
            queue,
        }
    }

    /// Status is left untouched, as on hardware.
    pub fn reset(&mut self) {
        self.ims = IMS_RESET;
        self.aiack = 0;
        self.pending.clear();
    }

    pub fn pending(&self) -> &[Interrupt] {
        &self.pending
    }

    fn masked(&self, interrupt: &Interrupt) -> bool {
        self.ims & interrupt.mask != 0
    }

    fn deliver(&self, interrupt: &Interrupt) {
        tracing::debug!(
            "[SCU] Interrupt {:#04X} ({}) level {}",
            interrupt.vector,
            vector_name(interrupt.vector),
            interrupt.level
        );

        let mut queue = self.queue.borrow_mut();
        queue.push_back(Message::SendInterrupt {
            cpu: Cpu::Master,
            vector: interrupt.vector,
            level: interrupt.level,
        });

        if self.slave_running {
            match interrupt.vector {
                0x42 => queue.push_back(Message::SendInterrupt {
                    cpu: Cpu::Slave,
                    vector: 0x41,
                    level: 0x1,
                }),
                0x40 => queue.push_back(Message::SendInterrupt {
                    cpu: Cpu::Slave,
                    vector: 0x43,
                    level: 0x2,
                }),
                _ => {}
            }
        }
    }

    fn deliver_abus(&mut self, interrupt: &Interrupt) -> bool {
        if self.aiack == 0 {
            return false;
        }
        self.aiack = 0;
        if self.ims & ABUS_MASK != 0 {
            return false;
        }
        self.deliver(interrupt);
        true
    }

    /// Delivers `interrupt` now if it is unmasked, otherwise parks it and
    /// latches its status bit.
    pub fn raise(&mut self, interrupt: Interrupt) -> Result<Delivery, ScuError> {
        if interrupt.mask & ABUS_MASK != 0 {
            return Ok(match self.deliver_abus(&interrupt) {
                true => Delivery::Delivered,
                false => Delivery::Ignored,
            });
        }

        self.ist |= interrupt.status;
        if !self.masked(&interrupt) {
            self.deliver(&interrupt);
            return Ok(Delivery::Delivered);
        }

        self.enqueue(interrupt)?;
        Ok(Delivery::Queued)
    }

    fn enqueue(&mut self, interrupt: Interrupt) -> Result<(), ScuError> {
        if self.pending.iter().any(|i| i.vector == interrupt.vector) {
            return Err(ScuError::DuplicateInterrupt(interrupt.vector));
        }
        if self.pending.len() >= MAX_PENDING {
            return Err(ScuError::InterruptQueueFull(interrupt.vector));
        }

        self.pending.push(interrupt);

        // exchange sort, highest level first; retest walks from the back
        let len = self.pending.len();
        for i in 0..len {
            for j in (i + 1)..len {
                if self.pending[i].level < self.pending[j].level {
                    self.pending.swap(i, j);
                }
            }
        }

        Ok(())
    }

    /// Drops the pending record for `interrupt` and clears its status bit.
    pub fn remove(&mut self, interrupt: &Interrupt) {
        self.ist &= !interrupt.status;
        if let Some(index) = self
            .pending
            .iter()
            .position(|i| i.vector == interrupt.vector)
        {
            self.pending.remove(index);
        }
    }

    /// Drops every pending record whose status bit went from set to clear.
    pub fn remove_by_status_change(&mut self, before: u32, after: u32) {
        let cleared = before & !after;
        for bit in 0..32 {
            let status = 1u32 << bit;
            if cleared & status == 0 {
                continue;
            }
            if let Some(index) = self.pending.iter().position(|i| i.status == status) {
                self.ist &= !status;
                self.pending.remove(index);
            }
        }
    }

    /// Re-evaluates the pending queue against the current mask.
    ///
    /// Each pass walks from the back of the queue and stops after the first
    /// delivery; passes repeat until nothing more is released.
    pub fn retest(&mut self) {
        while self.retest_pass() {}
    }

    fn retest_pass(&mut self) -> bool {
        let mut i = 0;
        while i < self.pending.len() {
            let index = self.pending.len() - 1 - i;
            let interrupt = self.pending[index];

            // A-bus sources are never parked, so only the mask gates here
            if !self.masked(&interrupt) && self.ist & interrupt.status != 0 {
                self.deliver(&interrupt);
                self.ist &= !interrupt.status;
                self.pending.remove(index);
                return true;
            }

            i += 1;
        }

        false
    }

    pub fn write_mask(&mut self, value: u32) {
        self.ims = value;
        self.retest();
    }

    /// Status writes can only clear bits.
    pub fn write_status(&mut self, value: u32) {
        let after = self.ist & value;
        self.remove_by_status_change(self.ist, after);
        self.ist = after;
        self.retest();
    }

    pub fn write_abus_ack(&mut self, value: u32) {
        self.aiack = value;
        self.retest();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (InterruptController, Rc<RefCell<VecDeque<Message>>>) {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        (InterruptController::new(queue.clone()), queue)
    }

    fn vectors(queue: &Rc<RefCell<VecDeque<Message>>>) -> Vec<u8> {
        queue
            .borrow()
            .iter()
            .filter_map(|m| match m {
                Message::SendInterrupt { vector, .. } => Some(*vector),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_dma_end_vectors() {
        assert_eq!(dma_end(0), Interrupt::new(0x4B, 5, 0x800, 0x800));
        assert_eq!(dma_end(1), Interrupt::new(0x4A, 6, 0x400, 0x400));
        assert_eq!(dma_end(2), Interrupt::new(0x49, 6, 0x200, 0x200));
    }

    #[test]
    fn test_unmasked_delivers_immediately() {
        let (mut ctl, queue) = controller();
        ctl.ims = 0;

        assert_eq!(ctl.raise(TIMER0).unwrap(), Delivery::Delivered);
        assert_eq!(vectors(&queue), vec![0x43]);
        assert_eq!(ctl.ist & TIMER0.status, TIMER0.status);
        assert!(ctl.pending().is_empty());
    }

    #[test]
    fn test_masked_is_queued_once() {
        let (mut ctl, queue) = controller();

        assert_eq!(ctl.raise(VBLANK_IN).unwrap(), Delivery::Queued);
        assert!(matches!(
            ctl.raise(VBLANK_IN),
            Err(ScuError::DuplicateInterrupt(0x40))
        ));
        assert_eq!(ctl.pending().len(), 1);
        assert!(queue.borrow().is_empty());
    }

    #[test]
    fn test_queue_rejects_overflow() {
        let (mut ctl, _queue) = controller();
        ctl.ims = 0xFFFF_FFFF;

        for vector in 0..MAX_PENDING as u8 {
            ctl.raise(Interrupt::new(vector, vector % 16, 1, 1)).unwrap();
        }
        let before = ctl.pending().to_vec();

        assert!(matches!(
            ctl.raise(Interrupt::new(0x7F, 1, 1, 1)),
            Err(ScuError::InterruptQueueFull(0x7F))
        ));
        assert_eq!(ctl.pending(), &before[..]);
    }

    #[test]
    fn test_unmask_releases_lowest_level_first() {
        let (mut ctl, queue) = controller();
        ctl.ims = 0xFFFF;
        ctl.raise(TIMER1).unwrap();
        ctl.raise(SYSTEM_MANAGER).unwrap();
        ctl.raise(VBLANK_OUT).unwrap();

        ctl.write_mask(0);

        assert_eq!(vectors(&queue), vec![0x47, 0x44, 0x41]);
        assert!(ctl.pending().is_empty());
        assert_eq!(ctl.ist, 0);
    }

    #[test]
    fn test_status_clear_drops_record() {
        let (mut ctl, queue) = controller();
        ctl.raise(TIMER0).unwrap();
        ctl.raise(TIMER1).unwrap();

        ctl.write_status(!TIMER0.status);
        ctl.write_mask(0);

        assert_eq!(vectors(&queue), vec![0x44]);
    }

    #[test]
    fn test_abus_requires_acknowledge() {
        let (mut ctl, queue) = controller();
        ctl.ims = 0;

        assert_eq!(ctl.raise(EXTERNAL_00).unwrap(), Delivery::Ignored);
        ctl.aiack = 1;
        assert_eq!(ctl.raise(EXTERNAL_00).unwrap(), Delivery::Delivered);
        assert_eq!(ctl.aiack, 0);
        assert_eq!(vectors(&queue), vec![0x50]);
    }

    #[test]
    fn test_masked_abus_is_dropped_not_parked() {
        let (mut ctl, queue) = controller();
        ctl.ims = ABUS_MASK;
        ctl.aiack = 1;

        assert_eq!(ctl.raise(EXTERNAL_00).unwrap(), Delivery::Ignored);
        assert_eq!(ctl.aiack, 0);
        assert!(ctl.pending().is_empty());
        assert_eq!(ctl.ist & EXTERNAL_00.status, 0);

        ctl.write_abus_ack(1);
        ctl.write_mask(0);
        assert!(vectors(&queue).is_empty());
        assert_eq!(ctl.aiack, 1);
    }

    #[test]
    fn test_slave_mirror() {
        let (mut ctl, queue) = controller();
        ctl.ims = 0;
        ctl.slave_running = true;
        ctl.raise(HBLANK_IN).unwrap();

        let messages: Vec<Message> = queue.borrow().iter().cloned().collect();
        assert_eq!(
            messages,
            vec![
                Message::SendInterrupt {
                    cpu: Cpu::Master,
                    vector: 0x42,
                    level: 0xD
                },
                Message::SendInterrupt {
                    cpu: Cpu::Slave,
                    vector: 0x41,
                    level: 0x1
                },
            ]
        );
    }
}
