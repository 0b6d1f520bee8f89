use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use serde::{Deserialize, Serialize};

/// Lifecycle of the session teardown sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TeardownState {
    /// No teardown is running.
    Idle,
    /// A teardown sequence owns the guard.
    TearingDown,
}

impl TeardownState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::TearingDown => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        if raw == Self::TearingDown.as_u8() {
            Self::TearingDown
        } else {
            Self::Idle
        }
    }
}

/// Process-wide guard allowing at most one teardown at a time.
///
/// `try_begin` performs the `Idle -> TearingDown` transition in a single
/// compare-exchange, so it must be called before the teardown's first await.
#[derive(Debug, Clone, Default)]
pub struct TeardownGuard {
    state: Arc<AtomicU8>,
}

impl TeardownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TeardownState {
        TeardownState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Take the guard, or return `None` when a teardown is already running.
    pub fn try_begin(&self) -> Option<TeardownTicket> {
        self.state
            .compare_exchange(
                TeardownState::Idle.as_u8(),
                TeardownState::TearingDown.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| TeardownTicket {
                state: Arc::clone(&self.state),
            })
    }
}

/// Ownership of a running teardown. Dropping it returns the guard to `Idle`.
#[derive(Debug)]
pub struct TeardownTicket {
    state: Arc<AtomicU8>,
}

impl Drop for TeardownTicket {
    fn drop(&mut self) {
        self.state
            .store(TeardownState::Idle.as_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let guard = TeardownGuard::new();
        assert_eq!(guard.state(), TeardownState::Idle);
    }

    #[test]
    fn second_begin_is_rejected_while_ticket_is_held() {
        let guard = TeardownGuard::new();
        let ticket = guard.try_begin().expect("first begin should win");
        assert_eq!(guard.state(), TeardownState::TearingDown);
        assert!(guard.try_begin().is_none());

        drop(ticket);
        assert_eq!(guard.state(), TeardownState::Idle);
        assert!(guard.try_begin().is_some());
    }

    #[test]
    fn clones_share_the_same_guard() {
        let guard = TeardownGuard::new();
        let other = guard.clone();
        let _ticket = guard.try_begin().expect("first begin should win");
        assert!(other.try_begin().is_none());
        assert_eq!(other.state(), TeardownState::TearingDown);
    }

    #[test]
    fn exactly_one_thread_wins_the_guard() {
        let guard = TeardownGuard::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    guard.try_begin().map(std::mem::forget).is_some()
                })
            })
            .collect::<Vec<_>>();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread should join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
