//! The fault taxonomy raised by the decoder and execution engine (§4.5, §7).

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    #[error("invalid opcode")]
    InvalidOpcode,
    #[error("general protection fault (selector/error code {0:#06x})")]
    GeneralProtection(u16),
    #[error("divide error")]
    DivideError,
}

impl Exception {
    /// The IVT/IDT vector this fault is delivered through.
    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::InvalidOpcode => 6,
            Exception::GeneralProtection(_) => 13,
        }
    }

    /// Whether the IDT gate frame carries a hardware error code for this vector
    /// (§4.5 — only a subset of faults push one).
    pub fn error_code(self) -> Option<u16> {
        match self {
            Exception::GeneralProtection(code) => Some(code),
            _ => None,
        }
    }
}
