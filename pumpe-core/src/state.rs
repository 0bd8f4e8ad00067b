//! The per-gate state cell: an atomic state machine plus an in-flight
//! request counter.
//!
//! The state lives in an atomic and transitions by compare-and-exchange
//! against its legal predecessors; illegal transitions are silent no-ops.
//! The counter sits behind its own small mutex so that a decrement can
//! saturate at zero atomically with the read.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

/// Gate states. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GateState {
    Ready = 0,
    Maintenance = 1,
    Closed = 2,
}

impl GateState {
    fn from_u8(raw: u8) -> GateState {
        match raw {
            1 => GateState::Maintenance,
            2 => GateState::Closed,
            _ => GateState::Ready,
        }
    }
}

#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
    reqs: Mutex<u64>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(GateState::Ready as u8),
            reqs: Mutex::new(0),
        }
    }

    /// Ready is reachable from the initial state and from Maintenance.
    pub fn to_ready(&self) {
        let _ = self.state.compare_exchange(
            GateState::Maintenance as u8,
            GateState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Maintenance is reachable only from Ready.
    pub fn to_maintenance(&self) {
        let _ = self.state.compare_exchange(
            GateState::Ready as u8,
            GateState::Maintenance as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Closed is reachable from Ready and from Maintenance, never left.
    pub fn to_closed(&self) {
        if self
            .state
            .compare_exchange(
                GateState::Ready as u8,
                GateState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return;
        }

        let _ = self.state.compare_exchange(
            GateState::Maintenance as u8,
            GateState::Closed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn get(&self) -> GateState {
        GateState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.get() == GateState::Ready
    }

    pub fn add_req(&self) {
        let mut reqs = self.reqs.lock().expect("request counter poisoned");
        *reqs += 1;
    }

    /// Decrement, saturating at zero.
    pub fn did_req(&self) {
        let mut reqs = self.reqs.lock().expect("request counter poisoned");
        *reqs = reqs.saturating_sub(1);
    }

    pub fn req_count(&self) -> u64 {
        *self.reqs.lock().expect("request counter poisoned")
    }

    pub fn has_no_reqs(&self) -> bool {
        self.req_count() == 0
    }

    pub fn reset_reqs(&self) {
        let mut reqs = self.reqs.lock().expect("request counter poisoned");
        *reqs = 0;
    }
}
