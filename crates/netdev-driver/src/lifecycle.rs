//! Service lifecycle state exposed to the health endpoint

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum LifecycleState {
    #[display("starting")]
    Starting = 0,
    #[display("ready")]
    Ready = 1,
    #[display("shutting-down")]
    ShuttingDown = 2,
}

/// Starting -> Ready -> ShuttingDown, never backwards
#[derive(Debug)]
pub struct ServiceLifecycle {
    state: AtomicU8,
}

impl Default for ServiceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceLifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Starting as u8),
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.load(Ordering::Acquire) {
            0 => LifecycleState::Starting,
            1 => LifecycleState::Ready,
            _ => LifecycleState::ShuttingDown,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Starting -> Ready. Returns false if shutdown already began.
    pub fn mark_ready(&self) -> bool {
        self.state
            .compare_exchange(
                LifecycleState::Starting as u8,
                LifecycleState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn begin_shutdown(&self) {
        self.state
            .store(LifecycleState::ShuttingDown as u8, Ordering::Release);
    }
}
