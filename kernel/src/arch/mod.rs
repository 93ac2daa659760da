//! Architecture support needed by the timing core.
//!
//! The only architectural service the core consumes directly is local
//! interrupt masking; everything else about the hardware timer sits behind
//! [`crate::timer::driver::ClockDriver`].

pub mod irq;

pub use irq::{irq_lock, irq_unlock, IrqKey};
