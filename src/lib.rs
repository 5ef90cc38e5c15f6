pub mod breakpoint;
pub mod bus;
pub mod clock;
pub mod dma;
pub mod dsp;
pub mod error;
pub mod interrupt;
pub mod machine;
pub mod mirror;
pub mod region;
pub mod scu;
pub mod utils;

pub use breakpoint::Breakpoints;
pub use bus::{Bus, Devices, MemoryMap};
pub use dsp::{Dsp, DspState};
pub use error::{Result, ScuError};
pub use interrupt::{Interrupt, InterruptController};
pub use machine::{Cpu, Machine, MachineBuilder, Message};
pub use mirror::RegionMasks;
pub use region::{BackupRam, BusDevice, RamRegion, RomRegion, Unhandled};
pub use scu::Scu;
pub use utils::hexdump;
