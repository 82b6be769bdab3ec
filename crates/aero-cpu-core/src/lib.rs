//! CPU context, segmentation, flags, interrupts and the Tier-0 interpreter.
//!
//! This crate owns the architectural state machine described by the decoder's
//! consumer side: registers, RFLAGS, segment caches, control registers, the
//! interrupt/exception unit, and the per-instruction execution loop (`execute::step`).
//! It depends on `aero-cpu-decoder` for the instruction stream and `aero-mmu` for
//! the A20 gate helper, but owns all side-effecting state transitions itself.

pub mod exceptions;
pub mod execute;
pub mod flags;
pub mod interrupts;
pub mod mem;
pub mod segmentation;
pub mod state;

pub use exceptions::Exception;
pub use execute::{step, StepExit, MSR_EFER};
pub use interrupts::{CpuCore, CpuExit, InterruptController};
pub use mem::{CpuBus, MemFault};
pub use segmentation::LoadReason;
pub use state::{CpuMode, CpuState, DtReg, SegmentCache, SegmentFile};
