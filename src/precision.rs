//! Process-wide mixed precision switch.
//!
//! The flag is owned by whoever drives execution; backbones only read it when
//! they are built to pick the kernel path of their depthwise convolutions.
use core::sync::atomic::{AtomicBool, Ordering};

static MIXED_PRECISION: AtomicBool = AtomicBool::new(false);

/// Whether mixed precision execution is currently active.
pub fn mixed_precision_enabled() -> bool {
    MIXED_PRECISION.load(Ordering::Acquire)
}

/// Toggle mixed precision execution, returning the previous state.
pub fn set_mixed_precision(enabled: bool) -> bool {
    MIXED_PRECISION.swap(enabled, Ordering::AcqRel)
}

/// Scoped mixed precision state, restored to its previous value on drop.
#[must_use = "the previous state is restored as soon as the guard is dropped"]
pub struct MixedPrecisionGuard {
    previous: bool,
}

impl MixedPrecisionGuard {
    pub fn new(enabled: bool) -> Self {
        Self {
            previous: set_mixed_precision(enabled),
        }
    }
}

impl Drop for MixedPrecisionGuard {
    fn drop(&mut self) {
        set_mixed_precision(self.previous);
    }
}
