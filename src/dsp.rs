use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::{error::ScuError, region::BusDevice};

pub const PROGRAM_SIZE: usize = 256;
pub const BANK_SIZE: usize = 64;
pub const NO_JUMP: u32 = 0xFFFF_FFFF;

// Program control port
pub const PC_FIELD: u32 = 0xFF;
pub const LE: u32 = 1 << 15;
pub const EX: u32 = 1 << 16;
pub const ES: u32 = 1 << 17;
pub const E: u32 = 1 << 18;
pub const V: u32 = 1 << 19;
pub const C: u32 = 1 << 20;
pub const Z: u32 = 1 << 21;
pub const S: u32 = 1 << 22;
pub const T0: u32 = 1 << 23;
pub const EP: u32 = 1 << 25;
pub const PR: u32 = 1 << 26;

const CONTROL_KEEP: u32 = 0x00FC_0000;
const CONTROL_WRITABLE: u32 = 0x0603_80FF;
const CONTROL_READABLE: u32 = 0x00FD_00FF;

/// One 64-word data RAM bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBank(#[serde(with = "BigArray")] pub [u32; BANK_SIZE]);

/// Complete register file of the DSP. Snapshots copy it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DspState {
    pub control: u32,
    pub pc: u8,
    pub top: u8,
    pub lop: u16,
    pub jump_address: u32,
    pub delayed: bool,
    pub data_ram_page: u8,
    pub data_ram_address: u8,
    pub ct: [u8; 4],
    pub rx: u32,
    pub ry: u32,
    pub ra0: u32,
    pub wa0: u32,
    pub ra0m: u32,
    pub wa0m: u32,
    pub ac: i64,
    pub p: i64,
    pub alu: i64,
    pub mul: i64,
    #[serde(with = "BigArray")]
    pub program: [u32; PROGRAM_SIZE],
    pub data: [DataBank; 4],
    pub dma_instruction: u32,
    pub dma_wait: i32,
    pub dma_size: u32,
}

impl Default for DspState {
    fn default() -> Self {
        Self {
            control: 0,
            pc: 0,
            top: 0,
            lop: 0,
            jump_address: NO_JUMP,
            delayed: false,
            data_ram_page: 0,
            data_ram_address: 0,
            ct: [0; 4],
            rx: 0,
            ry: 0,
            ra0: 0,
            wa0: 0,
            ra0m: 0,
            wa0m: 0,
            ac: 0,
            p: 0,
            alu: 0,
            mul: 0,
            program: [0; PROGRAM_SIZE],
            data: [DataBank([0xFFFF_FFFF; BANK_SIZE]); 4],
            dma_instruction: 0,
            dma_wait: 0,
            dma_size: 0,
        }
    }
}

impl DspState {
    pub fn to_json(&self) -> Result<String, ScuError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ScuError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AluOp {
    Nop,
    And,
    Or,
    Xor,
    Add,
    Sub,
    Ad2,
    Sr,
    Rr,
    Sl,
    Rl,
    Rl8,
}

impl AluOp {
    fn decode(instruction: u32) -> Self {
        match instruction >> 26 {
            0x1 => AluOp::And,
            0x2 => AluOp::Or,
            0x3 => AluOp::Xor,
            0x4 => AluOp::Add,
            0x5 => AluOp::Sub,
            0x6 => AluOp::Ad2,
            0x8 => AluOp::Sr,
            0x9 => AluOp::Rr,
            0xA => AluOp::Sl,
            0xB => AluOp::Rl,
            0xF => AluOp::Rl8,
            _ => AluOp::Nop,
        }
    }
}

/// Bus moves of an operation-group instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Moves {
    p_bus: u32,
    x_load: bool,
    x_source: u8,
    y_load: bool,
    y_source: u8,
    a_bus: u32,
    d1_bus: u32,
    d1_dest: u8,
    d1_immediate: u32,
    d1_source: u8,
}

impl Moves {
    fn decode(instruction: u32) -> Self {
        Self {
            p_bus: (instruction >> 23) & 0x3,
            x_load: (instruction >> 23) & 0x4 != 0,
            x_source: ((instruction >> 20) & 0x7) as u8,
            y_load: (instruction >> 17) & 0x4 != 0,
            y_source: ((instruction >> 14) & 0x7) as u8,
            a_bus: (instruction >> 17) & 0x3,
            d1_bus: (instruction >> 12) & 0x3,
            d1_dest: ((instruction >> 8) & 0xF) as u8,
            d1_immediate: (instruction & 0xFF) as u8 as i8 as u32,
            d1_source: (instruction & 0xF) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Instruction {
    Operation(Moves),
    LoadImmediate {
        dest: u8,
        condition: Option<u8>,
        value: u32,
    },
    Dma(u32),
    Jump {
        condition: u8,
        target: u8,
    },
    Loop {
        repeat: bool,
    },
    End {
        interrupt: bool,
    },
    Reserved,
    Invalid,
}

impl Instruction {
    fn decode(instruction: u32) -> Self {
        match instruction >> 30 {
            0x0 => Instruction::Operation(Moves::decode(instruction)),
            0x2 => {
                let dest = ((instruction >> 26) & 0xF) as u8;
                if (instruction >> 25) & 1 != 0 {
                    Instruction::LoadImmediate {
                        dest,
                        condition: Some(((instruction >> 19) & 0x3F) as u8),
                        value: sign_extend(instruction, 19),
                    }
                } else {
                    Instruction::LoadImmediate {
                        dest,
                        condition: None,
                        value: sign_extend(instruction, 25),
                    }
                }
            }
            0x3 => match (instruction >> 28) & 0xF {
                0xC => Instruction::Dma(instruction),
                0xD => Instruction::Jump {
                    condition: ((instruction >> 19) & 0x7F) as u8,
                    target: (instruction & 0xFF) as u8,
                },
                0xE => Instruction::Loop {
                    repeat: instruction & 0x0800_0000 != 0,
                },
                0xF => Instruction::End {
                    interrupt: instruction & 0x0800_0000 != 0,
                },
                _ => Instruction::Reserved,
            },
            _ => Instruction::Invalid,
        }
    }
}

fn sign_extend(value: u32, bits: u32) -> u32 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaTransfer {
    /// D0 bus into data RAM, immediate count.
    LoadImmediate,
    /// Data RAM onto the D0 bus, immediate count.
    StoreImmediate,
    /// D0 bus into data or program RAM, count from data RAM.
    LoadCounted,
    /// Data RAM onto the D0 bus, count from data RAM.
    StoreCounted,
}

/// Returns the transfer kind and whether the address register is held.
fn decode_dma(instruction: u32) -> Option<(DmaTransfer, bool)> {
    let low = (instruction >> 10) & 0x1F;
    let high = (instruction >> 11) & 0x0F;

    if low == 0x00 {
        Some((DmaTransfer::LoadImmediate, false))
    } else if low == 0x04 {
        Some((DmaTransfer::StoreImmediate, false))
    } else if high == 0x04 {
        Some((DmaTransfer::LoadCounted, false))
    } else if low == 0x0C {
        Some((DmaTransfer::StoreCounted, false))
    } else if high == 0x08 {
        Some((DmaTransfer::LoadImmediate, true))
    } else if low == 0x14 {
        Some((DmaTransfer::StoreImmediate, true))
    } else if high == 0x0C {
        Some((DmaTransfer::LoadCounted, true))
    } else if low == 0x1C {
        Some((DmaTransfer::StoreCounted, true))
    } else {
        None
    }
}

/// What the caller's cycle loop needs to know about one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub ended: bool,
    pub interrupt: bool,
    /// A delayed jump landed; the clock is held for one cycle.
    pub held: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Dsp {
    state: DspState,
    increment: [bool; 4],
}

impl Dsp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.state.control = 0;
    }

    pub fn state(&self) -> DspState {
        self.state.clone()
    }

    pub fn set_state(&mut self, state: DspState) {
        self.state = state;
    }

    pub fn pc(&self) -> u8 {
        self.state.pc
    }

    pub fn is_executing(&self) -> bool {
        self.flag(EX)
    }

    fn flag(&self, bit: u32) -> bool {
        self.state.control & bit != 0
    }

    fn set_flag(&mut self, bit: u32, on: bool) {
        if on {
            self.state.control |= bit;
        } else {
            self.state.control &= !bit;
        }
    }

    pub fn read_control(&self) -> u32 {
        self.state.control & CONTROL_READABLE
    }

    pub fn write_control(&mut self, value: u32) {
        tracing::debug!("[DSP] Program control port = {:08X}", value);
        self.state.control = (self.state.control & CONTROL_KEEP) | (value & CONTROL_WRITABLE);

        if self.flag(LE) {
            self.state.pc = (self.state.control & PC_FIELD) as u8;
        }
        if value & EX != 0 {
            self.state.jump_address = NO_JUMP;
        }
    }

    pub fn write_program(&mut self, value: u32) {
        self.state.program[self.state.pc as usize] = value;
        self.state.pc = self.state.pc.wrapping_add(1);
        self.state.control = (self.state.control & !PC_FIELD) | self.state.pc as u32;
    }

    pub fn write_data_address(&mut self, value: u32) {
        self.state.data_ram_address = value as u8;
    }

    fn data_port_cell(&mut self) -> &mut u32 {
        let address = self.state.data_ram_address;
        self.state.data_ram_address = address.wrapping_add(1);
        &mut self.state.data[((address >> 6) & 0x3) as usize].0[(address & 0x3F) as usize]
    }

    /// The data port is only reachable while the program is stopped.
    pub fn write_data(&mut self, value: u32) {
        if !self.is_executing() {
            *self.data_port_cell() = value;
        }
    }

    pub fn read_data(&mut self) -> u32 {
        if self.is_executing() {
            return 0;
        }
        *self.data_port_cell()
    }

    fn md(&self, bank: usize) -> u32 {
        self.state.data[bank].0[(self.state.ct[bank] & 0x3F) as usize]
    }

    fn set_md(&mut self, bank: usize, value: u32) {
        let index = (self.state.ct[bank] & 0x3F) as usize;
        self.state.data[bank].0[index] = value;
    }

    fn apply_increments(&mut self) {
        for bank in 0..4 {
            if self.increment[bank] {
                self.state.ct[bank] = self.state.ct[bank].wrapping_add(1) & 0x3F;
            }
            self.increment[bank] = false;
        }
    }

    fn condition(&self, code: u8) -> Option<bool> {
        let z = self.flag(Z);
        let s = self.flag(S);
        let c = self.flag(C);
        let t0 = self.flag(T0);

        match code {
            0x01 => Some(!z),
            0x02 => Some(!s),
            0x03 => Some(!z && !s),
            0x04 => Some(!c),
            0x08 => Some(!t0),
            0x21 => Some(z),
            0x22 => Some(s),
            0x23 => Some(z || s),
            0x24 => Some(c),
            0x28 => Some(t0),
            _ => None,
        }
    }

    /// Runs one instruction at the program counter.
    pub fn step(&mut self, memory: &mut dyn BusDevice) -> StepOutcome {
        if self.flag(T0) {
            self.step_dma(memory);
        }

        let instruction = self.state.program[self.state.pc as usize];
        self.increment = [false; 4];
        self.compute_alu(AluOp::decode(instruction));

        let mut outcome = StepOutcome::default();
        match Instruction::decode(instruction) {
            Instruction::Operation(moves) => self.execute_moves(memory, moves),
            Instruction::LoadImmediate {
                dest,
                condition,
                value,
            } => {
                let taken = match condition {
                    Some(code) => self.condition(code).unwrap_or(false),
                    None => true,
                };
                if taken {
                    self.write_immediate_dest(memory, dest, value);
                }
            }
            Instruction::Dma(instruction) => self.start_dma(memory, instruction),
            Instruction::Jump { condition, target } => self.jump(condition, target),
            Instruction::Loop { repeat } => {
                if self.state.lop != 0 {
                    self.state.jump_address = if repeat {
                        self.state.pc as u32
                    } else {
                        self.state.top as u32
                    };
                    self.state.delayed = false;
                    self.state.lop -= 1;
                }
            }
            Instruction::End { interrupt } => {
                self.set_flag(EX, false);
                if interrupt {
                    self.set_flag(E, true);
                }
                tracing::debug!("[DSP] Program ended at {:02X}", self.state.pc);
                let next = self.state.pc.wrapping_add(1) as u32;
                self.state.control = (self.state.control & !PC_FIELD) | next;
                outcome.ended = true;
                outcome.interrupt = interrupt;
            }
            Instruction::Reserved => {}
            Instruction::Invalid => {
                tracing::warn!(
                    "[DSP] Invalid opcode {:08X} at {:02X}",
                    instruction,
                    self.state.pc
                );
            }
        }

        self.apply_increments();
        self.state.pc = self.state.pc.wrapping_add(1);

        if self.state.jump_address != NO_JUMP {
            if self.state.delayed {
                self.state.pc = self.state.jump_address as u8;
                self.state.jump_address = NO_JUMP;
                outcome.held = true;
            } else {
                self.state.delayed = true;
            }
        }

        outcome
    }

    fn compute_alu(&mut self, op: AluOp) {
        let ac = self.state.ac;
        let acl = ac as u32;
        let pl = self.state.p as u32;
        self.state.alu = ac;

        let low = match op {
            AluOp::Nop => return,
            AluOp::And | AluOp::Or | AluOp::Xor => {
                self.set_flag(C, false);
                match op {
                    AluOp::And => acl & pl,
                    AluOp::Or => acl | pl,
                    _ => acl ^ pl,
                }
            }
            AluOp::Add => {
                self.set_flag(C, (acl as u64 + pl as u64) & 0x1_0000_0000 != 0);
                acl.wrapping_add(pl)
            }
            AluOp::Sub => {
                self.set_flag(C, (acl as u64).wrapping_sub(pl as u64) & 0x1_0000_0000 != 0);
                acl.wrapping_sub(pl)
            }
            AluOp::Ad2 => {
                let p = self.state.p;
                let alu = ac.wrapping_add(p);
                self.state.alu = alu;
                self.set_flag(Z, alu == 0);
                self.set_flag(S, alu & 0x8000_0000_0000 != 0);
                let carry = ((ac as u64 & 0xFFFF_FFFF_FFFF) + (p as u64 & 0xFFFF_FFFF_FFFF))
                    & 0x1_0000_0000_0000;
                self.set_flag(C, carry != 0);
                return;
            }
            AluOp::Sr => {
                self.set_flag(C, acl & 1 != 0);
                (acl & 0x8000_0000) | (acl >> 1)
            }
            AluOp::Rr => {
                self.set_flag(C, acl & 1 != 0);
                acl.rotate_right(1)
            }
            AluOp::Sl => {
                self.set_flag(C, acl >> 31 != 0);
                acl << 1
            }
            AluOp::Rl => {
                self.set_flag(C, acl >> 31 != 0);
                acl.rotate_left(1)
            }
            AluOp::Rl8 => {
                self.set_flag(C, (acl >> 24) & 1 != 0);
                acl.rotate_left(8)
            }
        };

        self.state.alu = ((ac as u64 & 0xFFFF_FFFF_0000_0000) | low as u64) as i64;
        self.set_flag(Z, low == 0);
        self.set_flag(S, low & 0x8000_0000 != 0);
    }

    fn execute_moves(&mut self, memory: &mut dyn BusDevice, moves: Moves) {
        // the multiplier runs on every operation step
        self.state.mul = (self.state.rx as i32 as i64) * (self.state.ry as i32 as i64);

        match moves.p_bus {
            2 => self.state.p = self.state.mul,
            3 => self.state.p = self.read_source(memory, moves.x_source) as i32 as i64,
            _ => {}
        }

        if moves.x_load {
            self.state.rx = self.read_source(memory, moves.x_source);
        }
        if moves.y_load {
            self.state.ry = self.read_source(memory, moves.y_source);
        }

        match moves.a_bus {
            1 => self.state.ac = 0,
            2 => self.state.ac = self.state.alu,
            3 => self.state.ac = self.read_source(memory, moves.y_source) as i32 as i64,
            _ => {}
        }

        match moves.d1_bus {
            1 => {
                self.apply_increments();
                self.write_d1_dest(memory, moves.d1_dest, moves.d1_immediate);
            }
            3 => {
                let value = self.read_source(memory, moves.d1_source);
                self.write_d1_dest(memory, moves.d1_dest, value);
            }
            _ => {}
        }
    }

    fn finish_dma(&mut self, memory: &mut dyn BusDevice) {
        if self.state.dma_wait > 0 {
            self.state.dma_wait = 0;
            self.step_dma(memory);
        }
    }

    fn read_source(&mut self, memory: &mut dyn BusDevice, source: u8) -> u32 {
        match source {
            0..=7 => {
                let bank = (source & 0x3) as usize;
                if source & 0x4 != 0 {
                    self.increment[bank] = true;
                }
                self.finish_dma(memory);
                self.md(bank)
            }
            0x9 => self.state.alu as u32,
            0xA => (self.state.alu >> 16) as u32,
            _ => 0xFFFF_FFFF,
        }
    }

    fn write_d1_dest(&mut self, memory: &mut dyn BusDevice, dest: u8, value: u32) {
        self.finish_dma(memory);

        match dest {
            0x0..=0x3 => {
                self.set_md(dest as usize, value);
                self.increment[dest as usize] = true;
            }
            0x4 => self.state.rx = value,
            0x5 => self.state.p = value as i32 as i64,
            0x6 => self.state.ra0 = value,
            0x7 => self.state.wa0 = value,
            0xA => self.state.lop = value as u16,
            0xB => self.state.top = value as u8,
            0xC..=0xF => {
                let bank = (dest - 0xC) as usize;
                self.state.ct[bank] = (value & 0x3F) as u8;
                self.increment[bank] = false;
            }
            _ => {}
        }
    }

    fn write_immediate_dest(&mut self, memory: &mut dyn BusDevice, dest: u8, value: u32) {
        self.finish_dma(memory);

        match dest {
            0x0..=0x3 => {
                self.set_md(dest as usize, value);
                self.increment[dest as usize] = true;
            }
            0x4 => self.state.rx = value,
            0x5 => self.state.p = value as i32 as i64,
            0x6 => self.state.ra0 = value & 0x01FF_FFFF,
            0x7 => self.state.wa0 = value & 0x01FF_FFFF,
            0xA => self.state.lop = (value & 0x0FFF) as u16,
            0xC => {
                self.state.top = self.state.pc.wrapping_add(1);
                self.state.jump_address = value;
                self.state.delayed = false;
            }
            _ => tracing::warn!("[DSP] Bad immediate destination {:X} = {:08X}", dest, value),
        }
    }

    fn jump(&mut self, condition: u8, target: u8) {
        if self.state.jump_address != NO_JUMP {
            return;
        }

        let taken = if condition == 0 {
            Some(true)
        } else if condition & 0x40 != 0 {
            self.condition(condition & 0x3F)
        } else {
            None
        };

        match taken {
            Some(true) => {
                self.state.jump_address = target as u32;
                self.state.delayed = false;
            }
            Some(false) => {}
            None => tracing::warn!("[DSP] Unknown jump condition {:02X}", condition),
        }
    }

    fn start_dma(&mut self, memory: &mut dyn BusDevice, instruction: u32) {
        self.finish_dma(memory);

        self.state.dma_instruction = instruction;
        self.set_flag(T0, true);

        let count = match decode_dma(instruction) {
            Some((DmaTransfer::LoadImmediate | DmaTransfer::StoreImmediate, _)) => {
                instruction & 0xFF
            }
            Some((DmaTransfer::LoadCounted | DmaTransfer::StoreCounted, _)) => {
                let bank = (instruction & 0x3) as usize;
                let count = self.md(bank);
                if instruction & 0x4 != 0 {
                    self.state.ct[bank] = self.state.ct[bank].wrapping_add(1) & 0x3F;
                }
                count
            }
            None => 0,
        };

        self.state.dma_size = count;
        self.state.wa0m = self.state.wa0;
        self.state.ra0m = self.state.ra0;

        let cycle = match (self.state.wa0m << 2) & 0xDFF0_0000 {
            0x0020_0000 => 2,
            0x05A0_0000 | 0x05C0_0000 | 0x05E0_0000 => 1,
            _ => 4,
        };
        self.state.dma_wait = ((count >> cycle) as i64 + 1).min(i32::MAX as i64) as i32;

        tracing::trace!(
            "[DSP] DMA {:08X} RA={:08X} WA={:08X} count={} wait={}",
            instruction,
            self.state.ra0m << 2,
            self.state.wa0m << 2,
            count,
            self.state.dma_wait
        );
    }

    /// Counts down a pending transfer and runs it once the wait expires.
    fn step_dma(&mut self, memory: &mut dyn BusDevice) {
        if !self.flag(T0) {
            return;
        }

        self.state.dma_wait = self.state.dma_wait.saturating_sub(1);
        if self.state.dma_wait > 0 {
            return;
        }

        let instruction = self.state.dma_instruction;
        if let Some((transfer, hold)) = decode_dma(instruction) {
            let saved_ra0 = self.state.ra0m;
            let saved_wa0 = self.state.wa0m;

            match transfer {
                DmaTransfer::LoadImmediate => self.dma_load(memory, instruction, instruction & 0xFF, false),
                DmaTransfer::LoadCounted => {
                    self.dma_load(memory, instruction, self.state.dma_size, true)
                }
                DmaTransfer::StoreImmediate => {
                    self.dma_store(memory, instruction, instruction & 0xFF)
                }
                DmaTransfer::StoreCounted => {
                    self.dma_store(memory, instruction, self.state.dma_size)
                }
            }

            if hold {
                match transfer {
                    DmaTransfer::LoadImmediate | DmaTransfer::LoadCounted => {
                        self.state.ra0 = saved_ra0
                    }
                    DmaTransfer::StoreImmediate | DmaTransfer::StoreCounted => {
                        self.state.wa0 = saved_wa0
                    }
                }
            }
        }

        self.set_flag(T0, false);
        self.state.dma_instruction = 0;
        self.state.dma_wait = 0;
    }

    /// D0 bus into data RAM. The counted form can also fill program RAM.
    fn dma_load(&mut self, memory: &mut dyn BusDevice, instruction: u32, count: u32, counted: bool) {
        let select = if counted {
            (instruction >> 8) & 0x7
        } else {
            (instruction >> 8) & 0x3
        };
        let mode = (instruction >> 15) & 0x7;
        let add = (1u32 << (mode & 0x2)) & !1;
        let abus_check = (self.state.ra0m << 2) & 0x0FF0_0000;

        let mut index = 0usize;
        for _ in 0..count {
            let value = memory.read_long(self.state.ra0m << 2);
            if select == 0x4 {
                self.state.program[index & (PROGRAM_SIZE - 1)] = value;
                index += 1;
            } else {
                let bank = (select & 0x3) as usize;
                self.set_md(bank, value);
                self.state.ct[bank] = self.state.ct[bank].wrapping_add(1) & 0x3F;
            }
            self.state.ra0m = self.state.ra0m.wrapping_add(add >> 2);
        }

        if !counted || !(0x0200_0000..0x0590_0000).contains(&abus_check) {
            self.state.ra0 = self.state.ra0m;
        }
        self.set_flag(T0, false);
    }

    fn dma_store(&mut self, memory: &mut dyn BusDevice, instruction: u32, count: u32) {
        let bank = ((instruction >> 8) & 0x3) as usize;
        let add = 0x40u32 >> (7 - ((instruction >> 15) & 0x7));
        self.write_d0_bus(memory, bank, add, count);
    }

    fn write_d0_bus(&mut self, memory: &mut dyn BusDevice, bank: usize, add: u32, count: u32) {
        let mut address = (self.state.wa0m << 2) & 0x0FFF_FFFF;

        if (0x0200_0000..0x05A0_0000).contains(&address) {
            let add = add.min(1);
            for _ in 0..count {
                let value = self.md(bank);
                memory.write_long(self.state.wa0m << 2, value);
                self.state.ct[bank] = self.state.ct[bank].wrapping_add(1) & 0x3F;
                self.state.wa0m = self.state.wa0m.wrapping_add(add);
            }
        } else if (0x05A0_0000..0x0600_0000).contains(&address) {
            let add = add.max(1);
            for _ in 0..count {
                let value = self.md(bank);
                memory.write_word(address, (value >> 16) as u16);
                memory.write_word(address.wrapping_add(2), value as u16);
                self.state.ct[bank] = self.state.ct[bank].wrapping_add(1) & 0x3F;
                address = address.wrapping_add(add << 2);
            }
            self.state.wa0m = self.state.wa0m.wrapping_add(add.wrapping_mul(count));
        } else {
            // always lands in high work RAM
            let add = (add >> 1).max(1);
            for _ in 0..count {
                let value = self.md(bank);
                let target = 0x0600_0000 | ((self.state.wa0m << 2) & 0x000F_FFFC);
                memory.write_long(target, value);
                self.state.ct[bank] = self.state.ct[bank].wrapping_add(1) & 0x3F;
                self.state.wa0m = self.state.wa0m.wrapping_add(add);
            }
        }

        self.state.wa0 = self.state.wa0m;
        self.set_flag(T0, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{RamRegion, Unhandled};

    const NOP: u32 = 0x0000_0000;
    const END: u32 = 0xF000_0000;
    const ENDI: u32 = 0xF800_0000;

    fn mvi(dest: u32, value: u32) -> u32 {
        0x8000_0000 | (dest << 26) | (value & 0x01FF_FFFF)
    }

    fn jmp(condition: u32, target: u32) -> u32 {
        0xD000_0000 | (condition << 19) | target
    }

    fn load(dsp: &mut Dsp, program: &[u32]) {
        dsp.write_control(LE);
        for word in program {
            dsp.write_program(*word);
        }
        dsp.write_control(LE | EX);
    }

    #[test]
    fn test_data_memory_powers_up_all_ones() {
        let mut dsp = Dsp::new();
        dsp.write_data_address(0x41);
        assert_eq!(dsp.read_data(), 0xFFFF_FFFF);
        assert_eq!(dsp.state().data_ram_address, 0x42);
    }

    #[test]
    fn test_delayed_branch_runs_slot() {
        let mut dsp = Dsp::new();
        let mut bus = Unhandled;
        load(&mut dsp, &[NOP, jmp(0, 5), mvi(0, 0x1234), END, END, END]);

        let mut trace = Vec::new();
        let mut held = Vec::new();
        while dsp.is_executing() {
            trace.push(dsp.pc());
            held.push(dsp.step(&mut bus).held);
        }

        assert_eq!(trace, vec![0, 1, 2, 5]);
        assert_eq!(held, vec![false, false, true, false]);
        assert_eq!(dsp.state().data[0].0[0], 0x1234);
        assert_eq!(dsp.state().ct[0], 1);
    }

    #[test]
    fn test_conditional_jump_reads_flags() {
        let mut dsp = Dsp::new();
        let mut bus = Unhandled;
        // AND with AC = P = 0 sets Z
        load(&mut dsp, &[0x0400_0000, jmp(0x61, 4), NOP, END, ENDI]);

        let mut last = StepOutcome::default();
        while dsp.is_executing() {
            last = dsp.step(&mut bus);
        }

        assert!(last.interrupt);
        assert_ne!(dsp.read_control() & E, 0);
        assert_eq!(dsp.read_control() & PC_FIELD, 5);
    }

    #[test]
    fn test_alu_add_carry_and_shift() {
        let mut dsp = Dsp::new();
        dsp.state.ac = 0xFFFF_FFFF;
        dsp.state.p = 1;
        dsp.compute_alu(AluOp::Add);
        assert_eq!(dsp.state.alu as u32, 0);
        assert!(dsp.flag(C));
        assert!(dsp.flag(Z));

        dsp.state.ac = 0x8000_0001;
        dsp.compute_alu(AluOp::Sr);
        assert_eq!(dsp.state.alu as u32, 0xC000_0000);
        assert!(dsp.flag(C));
        assert!(dsp.flag(S));

        dsp.state.ac = 0x1200_0034;
        dsp.compute_alu(AluOp::Rl8);
        assert_eq!(dsp.state.alu as u32, 0x0000_3412);
    }

    #[test]
    fn test_loop_bottom_repeats_until_counter_expires() {
        let mut dsp = Dsp::new();
        let mut bus = Unhandled;
        // LOP = 2, TOP = 2; body increments CT0 through MC0 writes
        load(
            &mut dsp,
            &[
                mvi(0xA, 2),
                0x0000_3B02,
                mvi(0, 7),
                0xE000_0000,
                NOP,
                END,
            ],
        );

        let mut steps = 0;
        while dsp.is_executing() && steps < 64 {
            dsp.step(&mut bus);
            steps += 1;
        }

        assert!(!dsp.is_executing());
        assert_eq!(dsp.state().lop, 0);
        assert_eq!(dsp.state().ct[0], 3);
    }

    #[test]
    fn test_dma_loads_data_ram() {
        let mut dsp = Dsp::new();
        let mut ram = RamRegion::new(0x0100_0000);
        for i in 0..4u32 {
            ram.write_long(0x0020_0000 + i * 4, 0x100 + i);
        }
        // RA0 = 0x200000 >> 2, DMA D0 -> MC0 x4
        load(&mut dsp, &[mvi(6, 0x0020_0000 >> 2), 0xC001_0004, NOP, END]);

        while dsp.is_executing() {
            dsp.step(&mut ram);
        }

        let state = dsp.state();
        assert_eq!(&state.data[0].0[..4], &[0x100, 0x101, 0x102, 0x103]);
        assert_eq!(state.ct[0], 4);
        assert_eq!(state.ra0, (0x0020_0000 >> 2) + 4);
        assert_eq!(state.control & T0, 0);
    }

    #[test]
    fn test_dma_store_to_cpu_bus_lands_in_high_ram() {
        let mut dsp = Dsp::new();
        let mut ram = RamRegion::new(0x0100_0000);
        dsp.write_data_address(0);
        dsp.write_data(0xAABB_CCDD);
        dsp.write_data(0x1122_3344);
        // WA0 = 0x6000100 >> 2, DMA MC0 -> D0 x2 with add 4
        load(&mut dsp, &[mvi(7, 0x0600_0100 >> 2), 0xC001_1002, NOP, END]);

        while dsp.is_executing() {
            dsp.step(&mut ram);
        }

        assert_eq!(ram.read_long(0x0600_0100), 0xAABB_CCDD);
        assert_eq!(ram.read_long(0x0600_0104), 0x1122_3344);
        assert_eq!(dsp.state().wa0, (0x0600_0100 >> 2) + 2);
    }

    #[test]
    fn test_ct_write_wraps_to_six_bits() {
        let mut dsp = Dsp::new();
        let mut bus = Unhandled;
        // MOV #-1,CT0; MVI #0x55,MC0; MOV #0x45,CT1
        load(&mut dsp, &[0x0000_1CFF, mvi(0, 0x55), 0x0000_1D45, END]);

        dsp.step(&mut bus);
        assert_eq!(dsp.state.ct[0], 0x3F);

        while dsp.is_executing() {
            dsp.step(&mut bus);
        }

        assert_eq!(dsp.state.data[0].0[0x3F], 0x55);
        assert_eq!(dsp.state.ct[0], 0);
        assert_eq!(dsp.state.ct[1], 0x05);
    }

    #[test]
    fn test_dma_load_wraps_counter() {
        let mut dsp = Dsp::new();
        let mut ram = RamRegion::new(0x0100_0000);
        for i in 0..4u32 {
            ram.write_long(0x0020_0000 + i * 4, 0x200 + i);
        }
        // MOV #62,CT0 then load four words into MC0
        load(
            &mut dsp,
            &[0x0000_1C3E, mvi(6, 0x0020_0000 >> 2), 0xC001_0004, NOP, END],
        );

        while dsp.is_executing() {
            dsp.step(&mut ram);
        }

        let bank = &dsp.state.data[0].0;
        assert_eq!(bank[62], 0x200);
        assert_eq!(bank[63], 0x201);
        assert_eq!(bank[0], 0x202);
        assert_eq!(bank[1], 0x203);
        assert_eq!(dsp.state.ct[0], 2);
    }

    #[test]
    fn test_dma_wait_depends_on_write_area() {
        let cases = [
            (0x0020_0000, 0x40 / 4 + 1),
            (0x05A0_0000, 0x40 / 2 + 1),
            (0x05C0_0000, 0x40 / 2 + 1),
            (0x05E0_0000, 0x40 / 2 + 1),
            (0x0600_0000, 0x40 / 16 + 1),
            (0x0000_0000, 0x40 / 16 + 1),
        ];

        for (area, wait) in cases {
            let mut dsp = Dsp::new();
            dsp.state.wa0 = area >> 2;
            dsp.start_dma(&mut Unhandled, 0xC001_1040);
            assert_eq!(dsp.state.dma_wait, wait, "write area {:08X}", area);
        }
    }

    #[test]
    fn test_dma_runs_after_wait_expires() {
        let mut dsp = Dsp::new();
        let mut ram = RamRegion::new(0x0100_0000);
        dsp.write_data_address(0);
        dsp.write_data(0x0BAD_F00D);
        load(&mut dsp, &[]);
        dsp.state.wa0 = 0x0600_0200 >> 2;
        // MC0 -> D0 x 0x40 into high RAM, four idle steps first
        dsp.start_dma(&mut ram, 0xC001_1040);
        assert_eq!(dsp.state.dma_wait, 5);

        for _ in 0..4 {
            dsp.step(&mut ram);
            assert_ne!(dsp.state.control & T0, 0);
        }
        assert_eq!(ram.read_long(0x0600_0200), 0);

        dsp.step(&mut ram);
        assert_eq!(dsp.state.control & T0, 0);
        assert_eq!(ram.read_long(0x0600_0200), 0x0BAD_F00D);
    }

    #[test]
    fn test_counted_dma_with_huge_count_saturates_wait() {
        let mut dsp = Dsp::new();
        // MC0 still holds its power-up 0xFFFFFFFF
        dsp.state.wa0 = 0x05A0_0000 >> 2;
        dsp.start_dma(&mut Unhandled, 0xC001_3000);
        assert_eq!(dsp.state.dma_size, 0xFFFF_FFFF);
        assert_eq!(dsp.state.dma_wait, i32::MAX);

        load(&mut dsp, &[NOP, NOP, END]);
        dsp.step(&mut Unhandled);
        assert_eq!(dsp.state.dma_wait, i32::MAX - 1);
        assert_ne!(dsp.state.control & T0, 0);
    }

    #[test]
    fn test_counted_dma_load_takes_count_from_bank() {
        let mut dsp = Dsp::new();
        let mut ram = RamRegion::new(0x0100_0000);
        for i in 0..3u32 {
            ram.write_long(0x0020_0000 + i * 4, 0x300 + i);
        }
        dsp.write_data_address(0x40);
        dsp.write_data(3);
        // count from MC1 with CT1 increment, into MC0
        load(&mut dsp, &[mvi(6, 0x0020_0000 >> 2), 0xC001_2005, NOP, END]);

        while dsp.is_executing() {
            dsp.step(&mut ram);
        }

        assert_eq!(&dsp.state.data[0].0[..4], &[0x300, 0x301, 0x302, 0xFFFF_FFFF]);
        assert_eq!(dsp.state.ct[0], 3);
        assert_eq!(dsp.state.ct[1], 1);
        assert_eq!(dsp.state.ra0, (0x0020_0000 >> 2) + 3);
    }

    #[test]
    fn test_counted_dma_from_abus_keeps_ra0() {
        let mut dsp = Dsp::new();
        let mut ram = RamRegion::new(0x0100_0000);
        // 0x02000000 folds onto offset 0 of the scratch RAM
        ram.write_long(0, 0x4141_4141);
        ram.write_long(4, 0x4242_4242);
        dsp.write_data_address(0x40);
        dsp.write_data(2);
        load(&mut dsp, &[mvi(6, 0x0200_0000 >> 2), 0xC001_2001, NOP, END]);

        while dsp.is_executing() {
            dsp.step(&mut ram);
        }

        assert_eq!(&dsp.state.data[0].0[..2], &[0x4141_4141, 0x4242_4242]);
        assert_eq!(dsp.state.ra0, 0x0200_0000 >> 2);
        assert_eq!(dsp.state.ct[1], 0);
    }

    #[test]
    fn test_counted_dma_fills_program_ram() {
        let mut dsp = Dsp::new();
        let mut ram = RamRegion::new(0x0100_0000);
        ram.write_long(0x0020_0000, 0x1111_1111);
        ram.write_long(0x0020_0004, 0x2222_2222);
        dsp.write_data_address(0x40);
        dsp.write_data(2);
        load(&mut dsp, &[mvi(6, 0x0020_0000 >> 2), 0xC001_2401, NOP, END]);

        while dsp.is_executing() {
            dsp.step(&mut ram);
        }

        assert_eq!(dsp.state.program[0], 0x1111_1111);
        assert_eq!(dsp.state.program[1], 0x2222_2222);
        assert_eq!(dsp.state.program[3], END);
        assert_eq!(dsp.state.data[0].0[0], 0xFFFF_FFFF);
    }

    #[test]
    fn test_counted_dma_store_splits_on_bbus() {
        let mut dsp = Dsp::new();
        let mut ram = RamRegion::new(0x0100_0000);
        dsp.write_data_address(0);
        dsp.write_data(0xAAAA_BBBB);
        dsp.write_data(0xCCCC_DDDD);
        dsp.write_data_address(0x40);
        dsp.write_data(2);
        // count from MC1, MC0 -> D0 with add 8
        load(
            &mut dsp,
            &[mvi(7, 0x05C0_0000 >> 2), 0xC001_3001, NOP, NOP, END],
        );

        while dsp.is_executing() {
            dsp.step(&mut ram);
        }

        assert_eq!(ram.read_word(0x05C0_0000), 0xAAAA);
        assert_eq!(ram.read_word(0x05C0_0002), 0xBBBB);
        assert_eq!(ram.read_long(0x05C0_0008), 0xCCCC_DDDD);
        assert_eq!(dsp.state.wa0, (0x05C0_0000 >> 2) + 4);
        assert_eq!(dsp.state.ct[0], 2);
    }

    #[test]
    fn test_hold_dma_restores_address_registers() {
        let mut dsp = Dsp::new();
        let mut ram = RamRegion::new(0x0100_0000);
        ram.write_long(0x0020_0000, 0x5151_5151);
        ram.write_long(0x0020_0004, 0x5252_5252);
        // load two words with RA0 held, then store them back with WA0 held
        load(
            &mut dsp,
            &[
                mvi(6, 0x0020_0000 >> 2),
                mvi(7, 0x0600_0100 >> 2),
                0xC001_4002,
                NOP,
                0x0000_1C00,
                0xC001_5002,
                NOP,
                END,
            ],
        );

        while dsp.is_executing() {
            dsp.step(&mut ram);
        }

        assert_eq!(&dsp.state.data[0].0[..2], &[0x5151_5151, 0x5252_5252]);
        assert_eq!(dsp.state.ra0, 0x0020_0000 >> 2);
        assert_eq!(ram.read_long(0x0600_0100), 0x5151_5151);
        assert_eq!(ram.read_long(0x0600_0104), 0x5252_5252);
        assert_eq!(dsp.state.wa0, 0x0600_0100 >> 2);
    }

    #[test]
    fn test_multiplier_feeds_p() {
        let mut dsp = Dsp::new();
        let mut bus = Unhandled;
        // NOP, then MOV MUL,P
        load(&mut dsp, &[NOP, 0x0100_0000, END]);
        dsp.state.rx = (-3i32) as u32;
        dsp.state.ry = 7;

        dsp.step(&mut bus);
        assert_eq!(dsp.state.mul, -21);
        assert_eq!(dsp.state.p, 0);

        dsp.state.rx = 0x8000_0000;
        dsp.step(&mut bus);
        assert_eq!(dsp.state.mul, -(1i64 << 31) * 7);
        assert_eq!(dsp.state.p, dsp.state.mul);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut dsp = Dsp::new();
        load(&mut dsp, &[mvi(0, 0x42), END]);
        dsp.step(&mut Unhandled);

        let json = dsp.state().to_json().unwrap();
        let mut restored = Dsp::new();
        restored.set_state(DspState::from_json(&json).unwrap());

        assert_eq!(restored.state(), dsp.state());
    }
}
