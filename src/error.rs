// Controller and bus error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScuError {
    #[error("breakpoint list is full")]
    BreakpointListFull,
    #[error("breakpoint already set at {0:#04X}")]
    DuplicateBreakpoint(u32),
    #[error("no breakpoint at {0:#04X}")]
    BreakpointNotFound(u32),
    #[error("interrupt queue is full, vector {0:#04X} dropped")]
    InterruptQueueFull(u8),
    #[error("vector {0:#04X} is already pending")]
    DuplicateInterrupt(u8),
    #[error("invalid page range {start:#04X}..{end:#04X}")]
    InvalidPageRange { start: usize, end: usize },
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScuError>;
