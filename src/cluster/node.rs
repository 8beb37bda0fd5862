// Copyright (c) 2025 - Cowboy AI, Inc.
//! Node records
//!
//! A [`NodeRecord`] is the controller's view of one cluster node. Its
//! membership only moves through [`NodeRecord::apply`], which feeds the
//! membership state machine and keeps the timestamped history.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::identity::NodeRole;
use crate::domain::Hostname;
use crate::errors::ProvisioningResult;
use crate::stack::Host;
use crate::state_machine::membership::{MembershipEvent, MembershipState, TransitionOutput};
use crate::state_machine::{TrackedMachine, Transition};

/// A cluster node and its membership history
#[derive(Debug, Clone)]
pub struct NodeRecord {
    id: Uuid,
    name: Hostname,
    role: NodeRole,
    host: Option<Host>,
    membership: TrackedMachine<MembershipState>,
    created_at: DateTime<Utc>,
}

impl NodeRecord {
    /// New record in `Provisioning`, without a backing host yet
    pub fn new(name: Hostname, role: NodeRole) -> Self {
        Self {
            id: Uuid::now_v7(),
            name,
            role,
            host: None,
            membership: TrackedMachine::new(MembershipState::Provisioning),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &Hostname {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn host(&self) -> Option<&Host> {
        self.host.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> &MembershipState {
        self.membership.state()
    }

    pub fn history(&self) -> &[Transition<MembershipState, MembershipEvent>] {
        self.membership.history()
    }

    pub fn is_member(&self) -> bool {
        *self.state() == MembershipState::Member
    }

    pub(crate) fn attach_host(&mut self, host: Host) {
        self.host = Some(host);
    }

    /// Feed one membership event to the state machine
    pub fn apply(&mut self, event: MembershipEvent) -> ProvisioningResult<TransitionOutput> {
        let output = self.membership.apply(event, Utc::now())?;
        for warning in &output.warnings {
            warn!(node = %self.name, %warning, "membership transition");
        }
        Ok(output)
    }

    /// Addressing view passed to blueprint callbacks
    pub fn view(&self) -> Option<NodeView> {
        self.host.as_ref().map(|host| NodeView {
            name: self.name.to_string(),
            role: self.role,
            host_id: host.id.clone(),
            private_ip: host.private_ip,
            public_ip: host.public_ip,
        })
    }
}

/// What a blueprint needs to address a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub name: String,
    pub role: NodeRole,
    pub host_id: String,
    pub private_ip: Ipv4Addr,
    pub public_ip: Option<Ipv4Addr>,
}
