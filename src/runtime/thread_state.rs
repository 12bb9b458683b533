/* The packed state-and-flags word every thread polls */

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Terminated = 0,
    Runnable,
    TimedWaiting,
    Sleeping,
    Blocked,
    Waiting,
    WaitingForLockInflation,
    WaitingForGcToComplete,
    WaitingForCheckPointsToRun,
    WaitingPerformingGc,
    WaitingForGcThreadFlip,
    WaitingForDeoptimization,
    WaitingForSuspendBarrier,
    Starting,
    Native,
    Suspended,
}

impl ThreadState {
    pub fn from_u8(v: u8) -> ThreadState {
        match v {
            1 => ThreadState::Runnable,
            2 => ThreadState::TimedWaiting,
            3 => ThreadState::Sleeping,
            4 => ThreadState::Blocked,
            5 => ThreadState::Waiting,
            6 => ThreadState::WaitingForLockInflation,
            7 => ThreadState::WaitingForGcToComplete,
            8 => ThreadState::WaitingForCheckPointsToRun,
            9 => ThreadState::WaitingPerformingGc,
            10 => ThreadState::WaitingForGcThreadFlip,
            11 => ThreadState::WaitingForDeoptimization,
            12 => ThreadState::WaitingForSuspendBarrier,
            13 => ThreadState::Starting,
            14 => ThreadState::Native,
            15 => ThreadState::Suspended,
            _ => ThreadState::Terminated,
        }
    }

    pub fn is_runnable(&self) -> bool {
        *self == ThreadState::Runnable
    }
}

// Flags live above the state byte.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadFlag: u32 {
        const SUSPEND_REQUEST = 1 << 8;
        const CHECKPOINT_REQUEST = 1 << 9;
        const EMPTY_CHECKPOINT_REQUEST = 1 << 10;
        const ACTIVE_SUSPEND_BARRIER = 1 << 11;
        const PENDING_FLIP_FUNCTION = 1 << 12;
        const RUNNING_FLIP_FUNCTION = 1 << 13;
        const SUSPENSION_IMMUNE = 1 << 14;
        const MONITOR_JNI_ENTRY_EXIT = 1 << 15;
    }
}

impl ThreadFlag {
    /// Flags a safepoint poll must act on.
    pub const SUSPEND_OR_CHECKPOINT: ThreadFlag = ThreadFlag::SUSPEND_REQUEST
        .union(ThreadFlag::CHECKPOINT_REQUEST)
        .union(ThreadFlag::EMPTY_CHECKPOINT_REQUEST);
}

const STATE_MASK: u32 = 0xff;

/// Snapshot of the state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateAndFlags(u32);

impl StateAndFlags {
    pub fn new(state: ThreadState) -> StateAndFlags {
        StateAndFlags(state as u32)
    }

    pub fn from_raw(v: u32) -> StateAndFlags {
        StateAndFlags(v)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8((self.0 & STATE_MASK) as u8)
    }

    pub fn flags(&self) -> ThreadFlag {
        ThreadFlag::from_bits_truncate(self.0 & !STATE_MASK)
    }

    pub fn is_flag_set(&self, flag: ThreadFlag) -> bool {
        self.0 & flag.bits() != 0
    }

    pub fn is_any_of(&self, flags: ThreadFlag) -> bool {
        self.0 & flags.bits() != 0
    }

    pub fn with_state(&self, state: ThreadState) -> StateAndFlags {
        StateAndFlags((self.0 & !STATE_MASK) | state as u32)
    }

    pub fn with_flag(&self, flag: ThreadFlag) -> StateAndFlags {
        StateAndFlags(self.0 | flag.bits())
    }

    pub fn without_flag(&self, flag: ThreadFlag) -> StateAndFlags {
        StateAndFlags(self.0 & !flag.bits())
    }
}

#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicStateAndFlags(AtomicU32);

impl AtomicStateAndFlags {
    pub fn new(state: ThreadState) -> AtomicStateAndFlags {
        AtomicStateAndFlags(AtomicU32::new(state as u32))
    }

    pub fn load(&self, order: Ordering) -> StateAndFlags {
        StateAndFlags(self.0.load(order))
    }

    /// Strong CAS; used at state boundaries with `SeqCst`.
    pub fn compare_exchange(&self, old: StateAndFlags, new: StateAndFlags, order: Ordering) -> Result<StateAndFlags, StateAndFlags> {
        let failure = match order {
            Ordering::Release | Ordering::Relaxed => Ordering::Relaxed,
            Ordering::AcqRel => Ordering::Acquire,
            other => other,
        };
        self.0.compare_exchange(old.0, new.0, order, failure).map(StateAndFlags).map_err(StateAndFlags)
    }

    pub fn set_flag(&self, flag: ThreadFlag, order: Ordering) -> StateAndFlags {
        StateAndFlags(self.0.fetch_or(flag.bits(), order))
    }

    pub fn clear_flag(&self, flag: ThreadFlag, order: Ordering) -> StateAndFlags {
        StateAndFlags(self.0.fetch_and(!flag.bits(), order))
    }

    /// Replace the state byte, keeping flags. Only the owning thread changes its state.
    pub fn set_state(&self, state: ThreadState) {
        let mut old = self.load(Ordering::Relaxed);
        loop {
            match self.compare_exchange(old, old.with_state(state), Ordering::SeqCst) {
                Ok(_) => return,
                Err(actual) => old = actual,
            }
        }
    }
}
