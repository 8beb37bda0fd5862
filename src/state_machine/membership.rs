// Copyright (c) 2025 - Cowboy AI, Inc.
//! Node Membership State Machine
//!
//! Formal FSM for the life of a node inside a cluster. Uses the generic
//! StateMachine trait from parent module.
//!
//! # States
//!
//! - Provisioning: host requested from the stack
//! - Provisioned: host reached the Started state
//! - Joining: flavor join callback invoked
//! - Member: coordinator confirmed membership
//! - Leaving: removal requested
//! - Removed: coordinator confirmed the node is absent (terminal)
//! - Failed: any step failed (surfaced to the caller)
//!
//! # Inputs
//!
//! - HostReady: Provisioning → Provisioned
//! - JoinStarted: Provisioned → Joining
//! - MembershipConfirmed: Joining → Member
//! - RemovalRequested: Member | Provisioned | Failed | Leaving → Leaving
//! - AbsenceConfirmed: Leaving → Removed
//! - Fail: any non-terminal state → Failed
//!
//! Membership is never inferred from a command exit status: the controller
//! only feeds `MembershipConfirmed` and `AbsenceConfirmed` after polling the
//! coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{StateMachine, TransitionError, TransitionResult};

/// Membership state of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    Provisioning,
    Provisioned,
    Joining,
    Member,
    Leaving,
    Removed,
    Failed { reason: String },
}

impl MembershipState {
    /// Short name of the state, without payload
    pub fn name(&self) -> &'static str {
        match self {
            MembershipState::Provisioning => "Provisioning",
            MembershipState::Provisioned => "Provisioned",
            MembershipState::Joining => "Joining",
            MembershipState::Member => "Member",
            MembershipState::Leaving => "Leaving",
            MembershipState::Removed => "Removed",
            MembershipState::Failed { .. } => "Failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, MembershipState::Failed { .. })
    }

    /// Whether the node may currently answer remote commands
    pub fn has_running_host(&self) -> bool {
        matches!(
            self,
            MembershipState::Provisioned | MembershipState::Joining | MembershipState::Member
        )
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipState::Failed { reason } => write!(f, "Failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Membership event (FSM input)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEvent {
    /// Stack reports the host Started
    HostReady,

    /// Flavor join callback invoked
    JoinStarted,

    /// Coordinator reports the node as an active member
    MembershipConfirmed,

    /// Caller asked to remove the node
    RemovalRequested,

    /// Coordinator reports the node absent
    AbsenceConfirmed,

    /// A step failed
    Fail { reason: String },
}

impl fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipEvent::HostReady => f.write_str("HostReady"),
            MembershipEvent::JoinStarted => f.write_str("JoinStarted"),
            MembershipEvent::MembershipConfirmed => f.write_str("MembershipConfirmed"),
            MembershipEvent::RemovalRequested => f.write_str("RemovalRequested"),
            MembershipEvent::AbsenceConfirmed => f.write_str("AbsenceConfirmed"),
            MembershipEvent::Fail { reason } => write!(f, "Fail({reason})"),
        }
    }
}

/// Transition output with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutput {
    /// Warnings generated during transition
    pub warnings: Vec<String>,

    /// Whether this is a critical transition
    pub is_critical: bool,
}

impl TransitionOutput {
    /// Create output with no warnings
    pub fn ok() -> Self {
        Self {
            warnings: Vec::new(),
            is_critical: false,
        }
    }

    /// Create output with warnings
    pub fn with_warnings(warnings: Vec<String>) -> Self {
        Self {
            warnings,
            is_critical: false,
        }
    }

    /// Create output for critical transition
    pub fn critical(warnings: Vec<String>) -> Self {
        Self {
            warnings,
            is_critical: true,
        }
    }
}

impl StateMachine for MembershipState {
    type Input = MembershipEvent;
    type Output = TransitionOutput;

    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)> {
        use MembershipEvent::*;
        use MembershipState::*;

        match (self, input) {
            (Removed, _) => Err(TransitionError::Terminal {
                state: self.to_string(),
                input: input.to_string(),
            }),

            (Provisioning, HostReady) => Ok((Provisioned, TransitionOutput::ok())),
            (Provisioned, JoinStarted) => Ok((Joining, TransitionOutput::ok())),
            (Joining, MembershipConfirmed) => Ok((Member, TransitionOutput::ok())),

            (Member, RemovalRequested) => Ok((Leaving, TransitionOutput::ok())),
            (Provisioned, RemovalRequested) => Ok((
                Leaving,
                TransitionOutput::with_warnings(vec![
                    "Removing a node that never joined".to_string()
                ]),
            )),
            (Failed { reason }, RemovalRequested) => Ok((
                Leaving,
                TransitionOutput::with_warnings(vec![format!(
                    "Removing a failed node: {reason}"
                )]),
            )),
            (Leaving, RemovalRequested) => Ok((
                Leaving,
                TransitionOutput::with_warnings(vec!["Removal retried".to_string()]),
            )),
            (Leaving, AbsenceConfirmed) => Ok((Removed, TransitionOutput::ok())),

            (_, Fail { reason }) => Ok((
                Failed {
                    reason: reason.clone(),
                },
                TransitionOutput::critical(vec![reason.clone()]),
            )),

            (state, event) => Err(TransitionError::InvalidTransition {
                from: state.to_string(),
                input: event.to_string(),
            }),
        }
    }

    fn is_terminal(&self) -> bool {
        *self == MembershipState::Removed
    }

    fn accepted_inputs(&self) -> Vec<Self::Input> {
        use MembershipEvent::*;
        use MembershipState::*;

        let fail = Fail {
            reason: String::new(),
        };
        match self {
            Provisioning => vec![HostReady, fail],
            Provisioned => vec![JoinStarted, RemovalRequested, fail],
            Joining => vec![MembershipConfirmed, fail],
            Member => vec![RemovalRequested, fail],
            Leaving => vec![RemovalRequested, AbsenceConfirmed, fail],
            Failed { .. } => vec![RemovalRequested, fail],
            Removed => vec![],
        }
    }
}
