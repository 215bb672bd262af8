//! In-process collective backend
//!
//! Every member of a `ThreadGroup` runs on its own thread inside one process.
//! A collective deposits the member's buffer in a shared slot, waits for the
//! whole group, reads every slot, then waits again so no member can overwrite
//! its slot before the others have read it.
//!
//! A member that is dropped (normally or while its thread unwinds from a
//! panic) closes the group: peers blocked in a collective, and every later
//! collective, return an error instead of waiting forever.

use candle_core::Result;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::sync::ProcessGroup;

struct State {
    slots: Vec<Option<Vec<f32>>>,
    /// Members waiting at the current rendezvous
    arrived: usize,
    /// Bumped each time the whole group has arrived
    generation: u64,
    /// Set once any member has been dropped
    closed: bool,
}

struct Rendezvous {
    state: Mutex<State>,
    ready: Condvar,
}

/// One member of an in-process group
pub struct ThreadGroup {
    name: String,
    rank: usize,
    size: usize,
    shared: Arc<Rendezvous>,
}

impl ThreadGroup {
    /// Create all `size` members of a new group, indexed by rank.
    ///
    /// Hand each member to the thread that plays that rank.
    pub fn create(name: &str, size: usize) -> Vec<ThreadGroup> {
        let shared = Arc::new(Rendezvous {
            state: Mutex::new(State {
                slots: vec![None; size],
                arrived: 0,
                generation: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        });

        (0..size)
            .map(|rank| ThreadGroup {
                name: name.to_string(),
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn closed_error(&self) -> candle_core::Error {
        candle_core::Error::Msg(format!(
            "{}: a peer left the group during a collective (rank {})",
            self.name, self.rank
        ))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>> {
        self.shared.state.lock().map_err(|_| {
            candle_core::Error::Msg(format!("{}: a peer thread panicked during a collective", self.name))
        })
    }

    /// Block until all members have arrived; the last one releases the rest
    fn arrive<'a>(&'a self, mut state: MutexGuard<'a, State>) -> Result<MutexGuard<'a, State>> {
        if state.closed {
            return Err(self.closed_error());
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.shared.ready.notify_all();
            return Ok(state);
        }

        while state.generation == generation {
            if state.closed {
                return Err(self.closed_error());
            }
            state = self.shared.ready.wait(state).map_err(|_| {
                candle_core::Error::Msg(format!("{}: a peer thread panicked during a collective", self.name))
            })?;
        }
        Ok(state)
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.closed = true;
        self.shared.ready.notify_all();
    }
}

impl ProcessGroup for ThreadGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather_host(&self, data: &[f32]) -> Result<Vec<Vec<f32>>> {
        if self.size == 1 {
            return Ok(vec![data.to_vec()]);
        }

        let mut state = self.lock_state()?;
        state.slots[self.rank] = Some(data.to_vec());
        let state = self.arrive(state)?;

        let gathered = state
            .slots
            .iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.clone().ok_or_else(|| {
                    candle_core::Error::Msg(format!("{}: rank {} contributed nothing", self.name, rank))
                })
            })
            .collect::<Result<Vec<_>>>();

        // Second phase: nobody refills a slot until everyone has read
        drop(self.arrive(state)?);
        gathered
    }
}
