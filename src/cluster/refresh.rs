//! Single-flight gate for topology refreshes
//!
//! At most one refresh runs cluster-wide. Callers that arrive while one
//! is in flight block until it settles and receive a clone of its
//! outcome instead of launching their own, so a redirect storm collapses
//! into a single topology query chain.

use parking_lot::{Condvar, Mutex};

use crate::utils::Result;

#[derive(Default)]
struct FlightState {
    active: bool,
    /// Incremented when a flight settles, so waiters can tell "my
    /// flight finished" from a spurious wakeup followed by a new flight.
    epoch: u64,
    last: Option<Result<()>>,
}

#[derive(Default)]
pub struct SingleFlight {
    state: Mutex<FlightState>,
    settled: Condvar,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f`, or wait for the in-flight run and return its outcome
    pub fn run<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        {
            let mut state = self.state.lock();
            if state.active {
                let joined = state.epoch;
                while state.active && state.epoch == joined {
                    self.settled.wait(&mut state);
                }
                return state.last.clone().unwrap_or(Ok(()));
            }
            state.active = true;
        }

        let outcome = f();

        let mut state = self.state.lock();
        state.active = false;
        state.epoch += 1;
        state.last = Some(outcome.clone());
        self.settled.notify_all();
        outcome
    }
}
