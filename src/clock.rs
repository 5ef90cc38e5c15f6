/// Saturn NTSC timing constants, in master SH-2 cycles.
pub const SCANLINES_PER_FRAME: u32 = 263;
pub const CPU_CYCLES_PER_SCANLINE: u32 = 1705;
pub const VBLANK_START_LINE: u32 = 224;
/// Cycle within the line where horizontal blanking begins.
pub const HBLANK_START_CYCLE: u32 = 1364;

pub const CPU_CYCLES_PER_FRAME: u32 = SCANLINES_PER_FRAME * CPU_CYCLES_PER_SCANLINE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEvent {
    VBlankStart,
    VBlankEnd,
    HBlankStart,
    HBlankEnd,
    ScanlineStart(u32),
    FrameEnd,
}

/// Beam position tracker. Feeds the controller its blanking interrupts.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    total_cycles: u64,
    current_scanline: u32,
    /// Cycles into the current scanline
    scanline_cycle: u32,
    frame_count: u64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Advances by `cycles` and returns the events crossed, in order.
    ///
    /// The beam moves from one blanking edge to the next, so the cost is
    /// per edge crossed rather than per cycle.
    pub fn tick(&mut self, cycles: u32) -> Vec<ClockEvent> {
        let mut events = Vec::new();
        let mut remaining = cycles;

        while remaining > 0 {
            let edge = if self.scanline_cycle < HBLANK_START_CYCLE {
                HBLANK_START_CYCLE
            } else {
                CPU_CYCLES_PER_SCANLINE
            };
            let advance = remaining.min(edge - self.scanline_cycle);

            self.scanline_cycle += advance;
            self.total_cycles += advance as u64;
            remaining -= advance;

            if self.scanline_cycle == HBLANK_START_CYCLE {
                events.push(ClockEvent::HBlankStart);
            } else if self.scanline_cycle == CPU_CYCLES_PER_SCANLINE {
                self.end_line(&mut events);
            }
        }

        events
    }

    fn end_line(&mut self, events: &mut Vec<ClockEvent>) {
        self.scanline_cycle = 0;
        self.current_scanline += 1;
        events.push(ClockEvent::HBlankEnd);

        if self.current_scanline == VBLANK_START_LINE {
            events.push(ClockEvent::VBlankStart);
        }

        if self.current_scanline == SCANLINES_PER_FRAME {
            self.current_scanline = 0;
            self.frame_count += 1;
            events.push(ClockEvent::VBlankEnd);
            events.push(ClockEvent::FrameEnd);
        }

        events.push(ClockEvent::ScanlineStart(self.current_scanline));
    }

    fn cycles_in_frame(&self) -> u64 {
        self.current_scanline as u64 * CPU_CYCLES_PER_SCANLINE as u64 + self.scanline_cycle as u64
    }

    pub fn cycles_until_frame_end(&self) -> u64 {
        CPU_CYCLES_PER_FRAME as u64 - self.cycles_in_frame()
    }

    /// Progress through the current frame, 0.0 to 1.0.
    pub fn frame_progress(&self) -> f64 {
        self.cycles_in_frame() as f64 / CPU_CYCLES_PER_FRAME as f64
    }

    pub fn current_scanline(&self) -> u32 {
        self.current_scanline
    }

    pub fn scanline_cycle(&self) -> u32 {
        self.scanline_cycle
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}
