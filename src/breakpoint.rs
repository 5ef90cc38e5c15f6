use derivative::Derivative;

use crate::error::ScuError;

pub const MAX_BREAKPOINTS: usize = 10;
pub const EMPTY_SLOT: u32 = 0xFFFF_FFFF;

pub type BreakpointCallback = Box<dyn FnMut(u32)>;

/// DSP program-counter breakpoints. Active entries are kept packed at the
/// front of the table.
#[derive(Derivative)]
#[derivative(Debug, Default)]
pub struct Breakpoints {
    #[derivative(Default(value = "[EMPTY_SLOT; MAX_BREAKPOINTS]"))]
    slots: [u32; MAX_BREAKPOINTS],
    count: usize,
    #[derivative(Debug = "ignore")]
    callback: Option<BreakpointCallback>,
    in_breakpoint: bool,
}

impl Breakpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, address: u32) -> Result<(), ScuError> {
        if self.count >= MAX_BREAKPOINTS {
            return Err(ScuError::BreakpointListFull);
        }
        if self.active().contains(&address) {
            return Err(ScuError::DuplicateBreakpoint(address));
        }

        self.slots[self.count] = address;
        self.count += 1;
        Ok(())
    }

    pub fn remove(&mut self, address: u32) -> Result<(), ScuError> {
        let index = self
            .active()
            .iter()
            .position(|a| *a == address)
            .ok_or(ScuError::BreakpointNotFound(address))?;

        self.slots[index] = EMPTY_SLOT;
        self.compact();
        self.count -= 1;
        Ok(())
    }

    fn compact(&mut self) {
        for i in 0..MAX_BREAKPOINTS {
            for j in (i + 1)..MAX_BREAKPOINTS {
                if self.slots[i] == EMPTY_SLOT && self.slots[j] != EMPTY_SLOT {
                    self.slots.swap(i, j);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots = [EMPTY_SLOT; MAX_BREAKPOINTS];
        self.count = 0;
    }

    pub fn active(&self) -> &[u32] {
        &self.slots[..self.count]
    }

    /// Full table including empty slots.
    pub fn slots(&self) -> &[u32; MAX_BREAKPOINTS] {
        &self.slots
    }

    pub fn set_callback(&mut self, callback: impl FnMut(u32) + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Fires the callback when `pc` matches an active entry. Re-entry from
    /// inside the callback is suppressed.
    pub fn check(&mut self, pc: u8) {
        if self.in_breakpoint || !self.active().contains(&(pc as u32)) {
            return;
        }

        tracing::debug!("[DSP] Breakpoint hit at {:02X}", pc);
        self.in_breakpoint = true;
        if let Some(callback) = self.callback.as_mut() {
            callback(pc as u32);
        }
        self.in_breakpoint = false;
    }
}
