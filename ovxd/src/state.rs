// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The lifecycle shared by switches, links, routes and networks.
//!
//! ```text
//! Init --register--> Inactive --boot--> Active
//!                    Inactive <--tear_down-- Active
//!                    Inactive --unregister--> Stopped
//! ```
//!
//! A transition requested from the wrong state is logged and ignored, and
//! the caller is told nothing happened.  Callers rely on this: tearing down
//! an element that is already down, or booting one twice, must be harmless.

use serde::Serialize;
use slog::debug;
use slog::warn;

/// The lifecycle state of an element.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum State {
    #[default]
    Init,
    Inactive,
    Active,
    Stopped,
}

/// A requested lifecycle transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum Transition {
    Register,
    Boot,
    TearDown,
    Unregister,
}

impl State {
    /// The state reached by applying `t`, if `t` is legal here.
    pub fn next(self, t: Transition) -> Option<State> {
        match (self, t) {
            (State::Init, Transition::Register) => Some(State::Inactive),
            (State::Inactive, Transition::Boot) => Some(State::Active),
            (State::Active, Transition::TearDown) => Some(State::Inactive),
            (State::Inactive, Transition::Unregister) => Some(State::Stopped),
            _ => None,
        }
    }

    /// Apply `t` in place.  Returns false, leaving the state untouched, if
    /// the transition is not legal from the current state.
    pub fn apply(
        &mut self,
        log: &slog::Logger,
        element: &str,
        t: Transition,
    ) -> bool {
        match self.next(t) {
            Some(next) => {
                debug!(log, "state transition";
                    "element" => element,
                    "from" => %self,
                    "to" => %next,
                );
                *self = next;
                true
            }
            None => {
                warn!(log, "ignoring illegal transition";
                    "element" => element,
                    "state" => %self,
                    "transition" => %t,
                );
                false
            }
        }
    }

    pub fn is_active(self) -> bool {
        self == State::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_log;

    #[test]
    fn test_full_lifecycle() {
        let log = test_log();
        let mut s = State::default();
        assert!(s.apply(&log, "sw", Transition::Register));
        assert!(s.apply(&log, "sw", Transition::Boot));
        assert!(s.is_active());
        assert!(s.apply(&log, "sw", Transition::TearDown));
        assert!(s.apply(&log, "sw", Transition::Boot));
        assert!(s.apply(&log, "sw", Transition::TearDown));
        assert!(s.apply(&log, "sw", Transition::Unregister));
        assert_eq!(s, State::Stopped);
    }

    // Illegal transitions are tolerated rather than reported, because
    // callers depend on repeating them.  They must never change the state.
    #[test]
    fn test_illegal_transitions_are_ignored() {
        let log = test_log();
        let mut s = State::Init;
        assert!(!s.apply(&log, "sw", Transition::Boot));
        assert!(!s.apply(&log, "sw", Transition::Unregister));
        assert_eq!(s, State::Init);

        s = State::Stopped;
        for t in [
            Transition::Register,
            Transition::Boot,
            Transition::TearDown,
            Transition::Unregister,
        ] {
            assert!(!s.apply(&log, "sw", t));
            assert_eq!(s, State::Stopped);
        }

        s = State::Active;
        assert!(!s.apply(&log, "sw", Transition::Unregister));
        assert!(!s.apply(&log, "sw", Transition::Boot));
        assert_eq!(s, State::Active);
    }
}
