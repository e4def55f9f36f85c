//! LockHierarchy (C2, spec §4.2).
//!
//! A process-wide, debug-time lock-order checker. It does not itself hold
//! any lock; it tracks, per-thread, the set of levels currently held and
//! rejects (debug) or logs (release) an acquisition that would violate the
//! declared partial order.
//!
//! Declared order, low to high:
//! `PreviewPorts < RingBuffer < AlarmQueue < Pipeline < CrossCamera < TaskManager`

use std::cell::RefCell;

use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    PreviewPorts = 0,
    RingBuffer = 1,
    AlarmQueue = 2,
    Pipeline = 3,
    CrossCamera = 4,
    TaskManager = 5,
}

thread_local! {
    static HELD_LEVELS: RefCell<Vec<LockLevel>> = RefCell::new(Vec::new());
}

/// RAII token proving (in debug builds) that acquiring `level` did not
/// violate the declared lock order. Drop it when you release the
/// corresponding lock.
pub struct LockToken {
    level: LockLevel,
}

impl LockToken {
    /// Record acquisition of `level` on the current thread.
    ///
    /// In debug builds, panics if a lock at level >= `level` is already held
    /// by this thread (CI is expected to catch ordering regressions this
    /// way). In release builds the violation is logged and execution
    /// continues, per spec: "not a replacement for disciplined design".
    #[track_caller]
    pub fn acquire(level: LockLevel) -> Self {
        HELD_LEVELS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&highest) = held.iter().max() {
                if highest >= level {
                    let msg = format!(
                        "lock order violation: acquiring {level:?} while holding {highest:?}"
                    );
                    if cfg!(debug_assertions) {
                        panic!("{msg}");
                    } else {
                        error!("{msg}");
                    }
                }
            }
            held.push(level);
        });
        LockToken { level }
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        HELD_LEVELS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&l| l == self.level) {
                held.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_acquisition_is_fine() {
        let _a = LockToken::acquire(LockLevel::PreviewPorts);
        let _b = LockToken::acquire(LockLevel::RingBuffer);
        let _c = LockToken::acquire(LockLevel::TaskManager);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn descending_acquisition_panics_in_debug() {
        let _hi = LockToken::acquire(LockLevel::TaskManager);
        let _lo = LockToken::acquire(LockLevel::PreviewPorts);
    }

    #[test]
    fn dropping_a_token_frees_its_level_for_reacquisition() {
        {
            let _a = LockToken::acquire(LockLevel::Pipeline);
        }
        // Pipeline was released, so acquiring a lower level is fine again.
        let _b = LockToken::acquire(LockLevel::PreviewPorts);
        let _c = LockToken::acquire(LockLevel::Pipeline);
    }
}
