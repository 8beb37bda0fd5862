// Copyright (c) 2025 - Cowboy AI, Inc.
//! Finite State Machines
//!
//! Node membership is modelled as a Mealy machine: the next state and the
//! output depend on the current state and the input.
//!
//! ```text
//! (State, Input) → (State, Output)
//! ```
//!
//! Transitions are pure. The controller performs the side effects and only
//! feeds the machine facts it has confirmed; [`TrackedMachine`] keeps the
//! timestamped trail of every accepted input.
//!
//! # Example
//!
//! ```rust
//! use cim_provisioning::state_machine::membership::{MembershipEvent, MembershipState};
//! use cim_provisioning::state_machine::StateMachine;
//!
//! let (next, _) = MembershipState::Provisioning
//!     .transition(&MembershipEvent::HostReady)
//!     .unwrap();
//! assert_eq!(next, MembershipState::Provisioned);
//! ```

pub mod membership;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of a state transition
pub type TransitionResult<S> = Result<S, TransitionError>;

/// Input rejected by a state machine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The input is not accepted in the current state
    #[error("{input} is not accepted in state {from}")]
    InvalidTransition { from: String, input: String },

    /// The machine reached a final state and accepts nothing
    #[error("{state} is final, {input} rejected")]
    Terminal { state: String, input: String },
}

/// A machine with typed states, inputs and outputs
pub trait StateMachine: Sized + Clone {
    type Input;
    type Output;

    /// Next state and output for `input`, or the reason it is rejected
    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)>;

    /// Whether no input is accepted any more
    fn is_terminal(&self) -> bool {
        false
    }

    /// Inputs accepted in this state, payloads left empty
    fn accepted_inputs(&self) -> Vec<Self::Input> {
        Vec::new()
    }
}

/// One accepted input
#[derive(Debug, Clone, Serialize)]
pub struct Transition<S, I> {
    pub from: S,
    pub to: S,
    pub input: I,
    pub at: DateTime<Utc>,
}

/// A machine together with the trail of transitions that led to its state
///
/// Rejected inputs change neither the state nor the trail.
#[derive(Debug, Clone)]
pub struct TrackedMachine<M: StateMachine> {
    current: M,
    trail: Vec<Transition<M, M::Input>>,
}

impl<M: StateMachine> TrackedMachine<M> {
    pub fn new(initial: M) -> Self {
        Self {
            current: initial,
            trail: Vec::new(),
        }
    }

    pub fn state(&self) -> &M {
        &self.current
    }

    pub fn history(&self) -> &[Transition<M, M::Input>] {
        &self.trail
    }

    /// When the current state was entered; `None` for the initial state
    pub fn entered_at(&self) -> Option<DateTime<Utc>> {
        self.trail.last().map(|t| t.at)
    }

    /// Feed `input`, recording it at `at` when accepted
    pub fn apply(&mut self, input: M::Input, at: DateTime<Utc>) -> TransitionResult<M::Output> {
        let (next, output) = self.current.transition(&input)?;
        let from = std::mem::replace(&mut self.current, next.clone());
        self.trail.push(Transition {
            from,
            to: next,
            input,
            at,
        });
        Ok(output)
    }
}
