// src/fsm.rs
// Generic state machine harness driving the master and slave managers.
// Each tick the owner runs the current state's handler, gets a Transition
// back, and the next state comes from a data-driven lookup table.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transition {
    Repeat,
    Next1,
    Next2,
    Next3,
    Next4,
    Error,
}

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
            Transition::Repeat => "REPEAT",
            Transition::Next1 => "NEXT1",
            Transition::Next2 => "NEXT2",
            Transition::Next3 => "NEXT3",
            Transition::Next4 => "NEXT4",
            Transition::Error => "ERROR",
        }
    }
}

pub struct StateMachine<S: Copy + Eq + Hash> {
    state: S,
    table: HashMap<(S, Transition), S>,
}

impl<S: Copy + Eq + Hash> StateMachine<S> {
    pub fn new(start: S) -> Self {
        Self { state: start, table: HashMap::new() }
    }

    /// Builder-style table entry: in `from`, transition `t` leads to `to`.
    pub fn on(mut self, from: S, t: Transition, to: S) -> Self {
        self.table.insert((from, t), to);
        self
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Force a state, bypassing the table. Used for external resets.
    pub fn set_state(&mut self, state: S) {
        self.state = state;
    }

    /// Apply a transition. Returns `(old, new)` when the state changed so the
    /// caller can log it; `Repeat` and unmapped transitions keep the state.
    pub fn apply(&mut self, t: Transition) -> Option<(S, S)> {
        if t == Transition::Repeat {
            return None;
        }
        match self.table.get(&(self.state, t)) {
            Some(&next) => {
                let old = self.state;
                self.state = next;
                Some((old, next))
            }
            None => None,
        }
    }
}
