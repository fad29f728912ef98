//! Bounded busy-wait

/// Spin until `done` returns true or `budget` checks have failed.
///
/// Returns whether the condition was observed. A budget of zero never
/// checks and reports failure.
#[inline]
pub fn spin_until(budget: u32, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..budget {
        if done() {
            return true;
        }
        core::hint::spin_loop();
    }
    false
}
