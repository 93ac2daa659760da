//! Local interrupt masking.
//!
//! [`irq_lock`] masks interrupts on the calling execution unit and returns
//! the previous state as an opaque [`IrqKey`]; [`irq_unlock`] restores
//! exactly that state. Keys nest: an inner lock/unlock pair taken with
//! interrupts already masked leaves them masked.
//!
//! # Architecture implementations
//!
//! * **x86_64 (bare metal)**: RFLAGS is sampled, then `cli`; unlock issues
//!   `sti` only if IF (bit 9) was set in the saved flags.
//! * **Everything else**: hosted builds have no interrupts to mask, so the
//!   key always reports "enabled" and unlock is a no-op.

/// Saved interrupt-enable state returned by [`irq_lock`].
///
/// The value is architecture defined and only meaningful to
/// [`irq_unlock`] on the same execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "the key must be handed back to irq_unlock"]
pub struct IrqKey(usize);

impl IrqKey {
    /// Build a key from a raw architecture value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw architecture value.
    pub const fn raw(self) -> usize {
        self.0
    }
}

// ---------------------------------------------------------------------------
// x86_64 implementation
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use super::IrqKey;

    /// RFLAGS.IF
    const IF_FLAG: u64 = 1 << 9;

    #[inline]
    pub fn lock() -> IrqKey {
        let flags = x86_64::registers::rflags::read_raw();
        x86_64::instructions::interrupts::disable();
        IrqKey(flags as usize)
    }

    #[inline]
    pub fn unlock(key: IrqKey) {
        if key.0 as u64 & IF_FLAG != 0 {
            x86_64::instructions::interrupts::enable();
        }
    }
}

// ---------------------------------------------------------------------------
// Hosted fallback
// ---------------------------------------------------------------------------

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    use super::IrqKey;

    /// Reported by every hosted lock; there is nothing to mask.
    const HOSTED_ENABLED: usize = 1;

    #[inline]
    pub fn lock() -> IrqKey {
        IrqKey(HOSTED_ENABLED)
    }

    #[inline]
    pub fn unlock(_key: IrqKey) {}
}

/// Mask local interrupts, returning the state to restore later.
#[inline]
pub fn irq_lock() -> IrqKey {
    imp::lock()
}

/// Restore the interrupt state captured by a matching [`irq_lock`].
#[inline]
pub fn irq_unlock(key: IrqKey) {
    imp::unlock(key)
}
