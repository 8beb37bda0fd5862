// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-memory provider API
//!
//! Behaves like an EC2-style control plane: calls return immediately, new
//! resources stay `pending` for a few describe calls, deletes are refused while
//! dependents exist, and instance state codes carry an opaque high byte.
//! Faults can be scripted per operation to exercise retry and rollback paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::domain::Cidr;
use crate::errors::{ProvisioningError, ResourceKind};
use crate::stack::model::{HostSizing, VolumeSpeed};

/// Provider-internal bits carried in the high byte of instance state codes
const STATE_HIGH_BYTE: u16 = 0x0100;

pub(crate) const CODE_PENDING: u16 = 0;
pub(crate) const CODE_RUNNING: u16 = 16;
pub(crate) const CODE_SHUTTING_DOWN: u16 = 32;
pub(crate) const CODE_TERMINATED: u16 = 48;
pub(crate) const CODE_STOPPING: u16 = 64;
pub(crate) const CODE_STOPPED: u16 = 80;
/// Not part of the documented set
const CODE_IMPAIRED: u16 = 17;

/// Scripted failure of a provider operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Request rate exceeded; callers may retry
    Throttled,
    /// The provider refused the request
    Rejected(String),
}

/// Error returned by the provider API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum CloudError {
    #[error("request limit exceeded")]
    Throttled,

    #[error("{0}")]
    Rejected(String),

    #[error("dependency violation: {0}")]
    DependencyViolation(String),

    #[error("'{0}' does not exist")]
    NotFound(String),
}

impl CloudError {
    /// Classify for the engine: throttling is transient, absence is NotFound
    pub(crate) fn into_provisioning(self, kind: ResourceKind, target: &str) -> ProvisioningError {
        match self {
            CloudError::Throttled => ProvisioningError::recoverable(target, self.to_string()),
            CloudError::NotFound(_) => ProvisioningError::not_found(kind, target),
            CloudError::Rejected(_) | CloudError::DependencyViolation(_) => {
                ProvisioningError::fatal(target, self.to_string())
            }
        }
    }
}

impl From<Fault> for CloudError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Throttled => CloudError::Throttled,
            Fault::Rejected(message) => CloudError::Rejected(message),
        }
    }
}

pub(crate) type CloudResult<T> = Result<T, CloudError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Association {
    pub id: String,
    pub subnet_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub destination: Cidr,
    pub gateway_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawKind {
    Vpc {
        cidr: Cidr,
    },
    Subnet {
        vpc_id: String,
        cidr: Cidr,
        public: bool,
        next_host: u32,
    },
    InternetGateway {
        attached_to: Option<String>,
    },
    RouteTable {
        vpc_id: String,
        main: bool,
        associations: Vec<Association>,
        routes: Vec<Route>,
    },
    Address {
        vpc_id: String,
        public_ip: Ipv4Addr,
        instance_id: Option<String>,
    },
    Instance {
        code: u16,
        target: u16,
        image: String,
        sizing: HostSizing,
        vpc_id: String,
        subnet_id: String,
        private_ip: Ipv4Addr,
        tags: BTreeMap<String, String>,
    },
    Volume {
        size_gb: u32,
        speed: VolumeSpeed,
        attached_to: Option<(String, String)>,
    },
}

/// A provider object as returned by describe calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Raw {
    pub id: String,
    pub name: String,
    /// Describe calls left before the resource settles
    pub pending: u32,
    pub kind: RawKind,
}

impl Raw {
    pub(crate) fn is_pending(&self) -> bool {
        self.pending > 0
    }

    /// Instance state code as the provider reports it
    pub(crate) fn instance_code(&self) -> Option<u16> {
        match self.kind {
            RawKind::Instance { code, .. } => Some(STATE_HIGH_BYTE | code),
            _ => None,
        }
    }

    fn tick(&mut self) {
        if self.pending > 0 {
            self.pending -= 1;
        }
        if self.pending == 0 {
            if let RawKind::Instance { code, target, .. } = &mut self.kind {
                *code = *target;
            }
        }
    }
}

#[derive(Debug, Default)]
struct CloudState {
    next_id: u64,
    next_public: u32,
    settle_after: u32,
    resources: BTreeMap<String, Raw>,
    scripted: HashMap<String, VecDeque<Fault>>,
    persistent: HashMap<String, Fault>,
    calls: Vec<String>,
}

impl CloudState {
    /// Record a call; faults keyed `op:subject` win over faults keyed `op`
    fn call(&mut self, op: &str, subject: &str) -> CloudResult<()> {
        let keyed = format!("{op}:{subject}");
        self.calls.push(keyed.clone());
        for key in [keyed.as_str(), op] {
            if let Some(fault) = self.persistent.get(key) {
                return Err(fault.clone().into());
            }
            if let Some(fault) = self.scripted.get_mut(key).and_then(VecDeque::pop_front) {
                return Err(fault.into());
            }
        }
        Ok(())
    }

    fn insert(&mut self, prefix: &str, name: &str, pending: u32, kind: RawKind) -> String {
        self.next_id += 1;
        let id = format!("{prefix}-{:05}", self.next_id);
        self.resources.insert(
            id.clone(),
            Raw {
                id: id.clone(),
                name: name.to_string(),
                pending,
                kind,
            },
        );
        id
    }

    fn get(&self, id: &str) -> CloudResult<&Raw> {
        self.resources
            .get(id)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> CloudResult<&mut Raw> {
        self.resources
            .get_mut(id)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }

    fn any(&self, predicate: impl Fn(&Raw) -> bool) -> Option<&Raw> {
        self.resources.values().find(|r| predicate(r))
    }

    fn remove(&mut self, id: &str) -> CloudResult<Raw> {
        self.resources
            .remove(id)
            .ok_or_else(|| CloudError::NotFound(id.to_string()))
    }
}

/// Eventually consistent in-memory cloud
#[derive(Debug)]
pub struct SimulatedCloud {
    state: Mutex<CloudState>,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    /// Resources settle after two describe calls
    pub fn new() -> Self {
        Self::with_settle_after(2)
    }

    /// Resources settle after `describes` describe calls
    pub fn with_settle_after(describes: u32) -> Self {
        Self {
            state: Mutex::new(CloudState {
                settle_after: describes,
                ..CloudState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `times` calls of `op` fail with `fault`
    ///
    /// `op` may name a single subject, as in `run_instances:web-1`.
    pub fn fail_next(&self, op: &str, fault: Fault, times: usize) {
        let mut state = self.lock();
        let queue = state.scripted.entry(op.to_string()).or_default();
        queue.extend(std::iter::repeat(fault).take(times));
    }

    /// Make every call of `op` fail with `fault` until cleared
    pub fn fail_always(&self, op: &str, fault: Fault) {
        self.lock().persistent.insert(op.to_string(), fault);
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.scripted.clear();
        state.persistent.clear();
    }

    /// Every call made so far, as `op:subject`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of calls of `op`
    pub fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Ids of every resource that still exists and is not a terminated instance
    pub fn live_resources(&self) -> Vec<String> {
        self.lock()
            .resources
            .values()
            .filter(|r| {
                !matches!(
                    r.kind,
                    RawKind::Instance {
                        code: CODE_TERMINATED,
                        ..
                    }
                )
            })
            .map(|r| r.id.clone())
            .collect()
    }

    // ---------------------------------------------------------------
    // Generic reads
    // ---------------------------------------------------------------

    /// Describe one resource; each call moves a pending resource closer to settled
    pub(crate) fn describe(&self, op: &str, id: &str) -> CloudResult<Raw> {
        let mut state = self.lock();
        state.call(op, id)?;
        let raw = state.get_mut(id)?;
        raw.tick();
        Ok(raw.clone())
    }

    /// Every resource matching `predicate`, ordered by id
    pub(crate) fn list(&self, op: &str, predicate: impl Fn(&Raw) -> bool) -> CloudResult<Vec<Raw>> {
        let mut state = self.lock();
        state.call(op, "*")?;
        Ok(state
            .resources
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect())
    }

    pub(crate) fn create_tags(&self, id: &str, tags: &[(&str, String)]) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("create_tags", id)?;
        match &mut state.get_mut(id)?.kind {
            RawKind::Instance { tags: current, .. } => {
                for (key, value) in tags {
                    current.insert(key.to_string(), value.clone());
                }
                Ok(())
            }
            _ => Err(CloudError::Rejected(format!("'{id}' cannot be tagged"))),
        }
    }

    // ---------------------------------------------------------------
    // VPC, subnets, gateways, routes
    // ---------------------------------------------------------------

    /// Create a VPC together with its main route table
    pub(crate) fn create_vpc(&self, name: &str, cidr: Cidr) -> CloudResult<String> {
        let mut state = self.lock();
        state.call("create_vpc", name)?;
        let pending = state.settle_after;
        let vpc_id = state.insert("vpc", name, pending, RawKind::Vpc { cidr });
        state.insert(
            "rtb",
            &format!("{name}-main"),
            0,
            RawKind::RouteTable {
                vpc_id: vpc_id.clone(),
                main: true,
                associations: Vec::new(),
                routes: Vec::new(),
            },
        );
        Ok(vpc_id)
    }

    pub(crate) fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("delete_vpc", vpc_id)?;
        if !matches!(state.get(vpc_id)?.kind, RawKind::Vpc { .. }) {
            return Err(CloudError::NotFound(vpc_id.to_string()));
        }

        let blocker = state.any(|r| match &r.kind {
            RawKind::Subnet { vpc_id: owner, .. } => owner == vpc_id,
            RawKind::InternetGateway { attached_to } => attached_to.as_deref() == Some(vpc_id),
            RawKind::RouteTable {
                vpc_id: owner,
                main,
                ..
            } => owner == vpc_id && !main,
            RawKind::Address { vpc_id: owner, .. } => owner == vpc_id,
            _ => false,
        });
        if let Some(blocker) = blocker {
            return Err(CloudError::DependencyViolation(format!(
                "'{vpc_id}' still has dependent '{}'",
                blocker.id
            )));
        }

        let main_tables: Vec<String> = state
            .resources
            .values()
            .filter(|r| matches!(&r.kind, RawKind::RouteTable { vpc_id: owner, .. } if owner == vpc_id))
            .map(|r| r.id.clone())
            .collect();
        for table in main_tables {
            state.remove(&table)?;
        }
        state.remove(vpc_id)?;
        Ok(())
    }

    pub(crate) fn create_subnet(
        &self,
        vpc_id: &str,
        name: &str,
        cidr: Cidr,
        public: bool,
    ) -> CloudResult<String> {
        let mut state = self.lock();
        state.call("create_subnet", name)?;
        match &state.get(vpc_id)?.kind {
            RawKind::Vpc { cidr: parent } if parent.covers(&cidr) => {}
            RawKind::Vpc { cidr: parent } => {
                return Err(CloudError::Rejected(format!(
                    "{cidr} is outside of {parent}"
                )))
            }
            _ => return Err(CloudError::NotFound(vpc_id.to_string())),
        }
        let overlap = state.any(|r| match &r.kind {
            RawKind::Subnet {
                vpc_id: owner,
                cidr: other,
                ..
            } => owner == vpc_id && (other.covers(&cidr) || cidr.covers(other)),
            _ => false,
        });
        if let Some(other) = overlap {
            return Err(CloudError::Rejected(format!(
                "{cidr} conflicts with '{}'",
                other.id
            )));
        }

        let pending = state.settle_after;
        Ok(state.insert(
            "subnet",
            name,
            pending,
            RawKind::Subnet {
                vpc_id: vpc_id.to_string(),
                cidr,
                public,
                next_host: 0,
            },
        ))
    }

    pub(crate) fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("delete_subnet", subnet_id)?;
        if !matches!(state.get(subnet_id)?.kind, RawKind::Subnet { .. }) {
            return Err(CloudError::NotFound(subnet_id.to_string()));
        }
        let blocker = state.any(|r| match &r.kind {
            RawKind::RouteTable { associations, .. } => {
                associations.iter().any(|a| a.subnet_id == subnet_id)
            }
            RawKind::Instance {
                subnet_id: owner,
                code,
                ..
            } => owner == subnet_id && *code != CODE_TERMINATED,
            _ => false,
        });
        if let Some(blocker) = blocker {
            return Err(CloudError::DependencyViolation(format!(
                "'{subnet_id}' is used by '{}'",
                blocker.id
            )));
        }
        state.remove(subnet_id)?;
        Ok(())
    }

    pub(crate) fn create_internet_gateway(&self, name: &str) -> CloudResult<String> {
        let mut state = self.lock();
        state.call("create_internet_gateway", name)?;
        Ok(state.insert(
            "igw",
            name,
            0,
            RawKind::InternetGateway { attached_to: None },
        ))
    }

    pub(crate) fn attach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("attach_internet_gateway", igw_id)?;
        state.get(vpc_id)?;
        match &mut state.get_mut(igw_id)?.kind {
            RawKind::InternetGateway { attached_to } if attached_to.is_none() => {
                *attached_to = Some(vpc_id.to_string());
                Ok(())
            }
            RawKind::InternetGateway { .. } => Err(CloudError::Rejected(format!(
                "'{igw_id}' is already attached"
            ))),
            _ => Err(CloudError::NotFound(igw_id.to_string())),
        }
    }

    pub(crate) fn detach_internet_gateway(&self, igw_id: &str, vpc_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("detach_internet_gateway", igw_id)?;
        let mapped = state.any(|r| {
            matches!(&r.kind, RawKind::Address { vpc_id: owner, .. } if owner == vpc_id)
        });
        if let Some(address) = mapped {
            return Err(CloudError::DependencyViolation(format!(
                "'{vpc_id}' has mapped public address '{}'",
                address.id
            )));
        }
        match &mut state.get_mut(igw_id)?.kind {
            RawKind::InternetGateway { attached_to } if attached_to.as_deref() == Some(vpc_id) => {
                *attached_to = None;
                Ok(())
            }
            RawKind::InternetGateway { .. } => Err(CloudError::Rejected(format!(
                "'{igw_id}' is not attached to '{vpc_id}'"
            ))),
            _ => Err(CloudError::NotFound(igw_id.to_string())),
        }
    }

    pub(crate) fn delete_internet_gateway(&self, igw_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("delete_internet_gateway", igw_id)?;
        match &state.get(igw_id)?.kind {
            RawKind::InternetGateway { attached_to: None } => {}
            RawKind::InternetGateway { .. } => {
                return Err(CloudError::DependencyViolation(format!(
                    "'{igw_id}' is still attached"
                )))
            }
            _ => return Err(CloudError::NotFound(igw_id.to_string())),
        }
        state.remove(igw_id)?;
        Ok(())
    }

    pub(crate) fn main_route_table(&self, vpc_id: &str) -> CloudResult<String> {
        let mut state = self.lock();
        state.call("describe_route_tables", vpc_id)?;
        state
            .any(|r| {
                matches!(&r.kind, RawKind::RouteTable { vpc_id: owner, main: true, .. } if owner == vpc_id)
            })
            .map(|r| r.id.clone())
            .ok_or_else(|| CloudError::NotFound(format!("main route table of '{vpc_id}'")))
    }

    pub(crate) fn create_route(
        &self,
        table_id: &str,
        destination: Cidr,
        gateway_id: &str,
    ) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("create_route", table_id)?;
        state.get(gateway_id)?;
        match &mut state.get_mut(table_id)?.kind {
            RawKind::RouteTable { routes, .. } => {
                if routes.iter().any(|r| r.destination == destination) {
                    return Err(CloudError::Rejected(format!(
                        "route to {destination} already exists"
                    )));
                }
                routes.push(Route {
                    destination,
                    gateway_id: gateway_id.to_string(),
                });
                Ok(())
            }
            _ => Err(CloudError::NotFound(table_id.to_string())),
        }
    }

    pub(crate) fn delete_route(&self, table_id: &str, destination: Cidr) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("delete_route", table_id)?;
        match &mut state.get_mut(table_id)?.kind {
            RawKind::RouteTable { routes, .. } => {
                let before = routes.len();
                routes.retain(|r| r.destination != destination);
                if routes.len() == before {
                    return Err(CloudError::NotFound(format!("{table_id} route {destination}")));
                }
                Ok(())
            }
            _ => Err(CloudError::NotFound(table_id.to_string())),
        }
    }

    pub(crate) fn associate_route_table(&self, table_id: &str, subnet_id: &str) -> CloudResult<String> {
        let mut state = self.lock();
        state.call("associate_route_table", subnet_id)?;
        state.get(subnet_id)?;
        state.next_id += 1;
        let association_id = format!("rtbassoc-{:05}", state.next_id);
        match &mut state.get_mut(table_id)?.kind {
            RawKind::RouteTable { associations, .. } => {
                associations.push(Association {
                    id: association_id.clone(),
                    subnet_id: subnet_id.to_string(),
                });
                Ok(association_id)
            }
            _ => Err(CloudError::NotFound(table_id.to_string())),
        }
    }

    pub(crate) fn disassociate_route_table(&self, association_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("disassociate_route_table", association_id)?;
        for raw in state.resources.values_mut() {
            if let RawKind::RouteTable { associations, .. } = &mut raw.kind {
                if let Some(pos) = associations.iter().position(|a| a.id == association_id) {
                    associations.remove(pos);
                    return Ok(());
                }
            }
        }
        Err(CloudError::NotFound(association_id.to_string()))
    }

    pub(crate) fn delete_route_table(&self, table_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("delete_route_table", table_id)?;
        match &state.get(table_id)?.kind {
            RawKind::RouteTable { main: true, .. } => {
                return Err(CloudError::Rejected(format!(
                    "'{table_id}' is a main route table"
                )))
            }
            RawKind::RouteTable { associations, .. } if !associations.is_empty() => {
                return Err(CloudError::DependencyViolation(format!(
                    "'{table_id}' has associations"
                )))
            }
            RawKind::RouteTable { .. } => {}
            _ => return Err(CloudError::NotFound(table_id.to_string())),
        }
        state.remove(table_id)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Instances and addresses
    // ---------------------------------------------------------------

    /// Launch an instance; it reports pending until it settles
    pub(crate) fn run_instance(
        &self,
        name: &str,
        image: &str,
        sizing: HostSizing,
        subnet_id: &str,
    ) -> CloudResult<String> {
        let mut state = self.lock();
        state.call("run_instances", name)?;
        // a scripted boot fault makes the instance settle into an undocumented code
        let impaired = state.call("instance_boot", name).is_err();

        let (vpc_id, private_ip) = match &mut state.get_mut(subnet_id)?.kind {
            RawKind::Subnet {
                vpc_id,
                cidr,
                next_host,
                ..
            } => {
                // first usable address is reserved for the router
                let ip = cidr.host(*next_host + 1).ok_or_else(|| {
                    CloudError::Rejected(format!("no free address in '{subnet_id}'"))
                })?;
                *next_host += 1;
                (vpc_id.clone(), ip)
            }
            _ => return Err(CloudError::NotFound(subnet_id.to_string())),
        };

        let pending = state.settle_after;
        Ok(state.insert(
            "i",
            name,
            pending,
            RawKind::Instance {
                code: CODE_PENDING,
                target: if impaired { CODE_IMPAIRED } else { CODE_RUNNING },
                image: image.to_string(),
                sizing,
                vpc_id,
                subnet_id: subnet_id.to_string(),
                private_ip,
                tags: BTreeMap::new(),
            },
        ))
    }

    fn move_instance(&self, op: &str, id: &str, via: u16, target_code: u16) -> CloudResult<()> {
        let mut state = self.lock();
        state.call(op, id)?;
        let pending = state.settle_after;
        let raw = state.get_mut(id)?;
        match &mut raw.kind {
            RawKind::Instance { code, target, .. } if *code != CODE_TERMINATED => {
                *code = via;
                *target = target_code;
            }
            _ => return Err(CloudError::NotFound(id.to_string())),
        }
        raw.pending = pending;
        if pending == 0 {
            raw.tick();
        }
        Ok(())
    }

    pub(crate) fn start_instance(&self, id: &str) -> CloudResult<()> {
        self.move_instance("start_instances", id, CODE_PENDING, CODE_RUNNING)
    }

    pub(crate) fn stop_instance(&self, id: &str) -> CloudResult<()> {
        self.move_instance("stop_instances", id, CODE_STOPPING, CODE_STOPPED)
    }

    /// Terminate an instance; terminated instances stay visible with code 48
    pub(crate) fn terminate_instance(&self, id: &str) -> CloudResult<()> {
        self.move_instance("terminate_instances", id, CODE_SHUTTING_DOWN, CODE_TERMINATED)
    }

    pub(crate) fn allocate_address(&self, vpc_id: &str) -> CloudResult<String> {
        let mut state = self.lock();
        state.call("allocate_address", vpc_id)?;
        state.get(vpc_id)?;
        state.next_public += 1;
        let n = state.next_public;
        let public_ip = Ipv4Addr::new(203, 0, (n / 250) as u8 % 255, (n % 250) as u8 + 1);
        Ok(state.insert(
            "eipalloc",
            &public_ip.to_string(),
            0,
            RawKind::Address {
                vpc_id: vpc_id.to_string(),
                public_ip,
                instance_id: None,
            },
        ))
    }

    pub(crate) fn associate_address(&self, address_id: &str, instance_id: &str) -> CloudResult<Ipv4Addr> {
        let mut state = self.lock();
        state.call("associate_address", address_id)?;
        match &state.get(instance_id)?.kind {
            RawKind::Instance { code, .. } if *code == CODE_RUNNING => {}
            RawKind::Instance { .. } => {
                return Err(CloudError::Rejected(format!(
                    "'{instance_id}' is not running"
                )))
            }
            _ => return Err(CloudError::NotFound(instance_id.to_string())),
        }
        match &mut state.get_mut(address_id)?.kind {
            RawKind::Address {
                instance_id: current,
                public_ip,
                ..
            } => {
                *current = Some(instance_id.to_string());
                Ok(*public_ip)
            }
            _ => Err(CloudError::NotFound(address_id.to_string())),
        }
    }

    pub(crate) fn disassociate_address(&self, address_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("disassociate_address", address_id)?;
        match &mut state.get_mut(address_id)?.kind {
            RawKind::Address { instance_id, .. } => {
                *instance_id = None;
                Ok(())
            }
            _ => Err(CloudError::NotFound(address_id.to_string())),
        }
    }

    pub(crate) fn release_address(&self, address_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("release_address", address_id)?;
        match &state.get(address_id)?.kind {
            RawKind::Address {
                instance_id: None, ..
            } => {}
            RawKind::Address { .. } => {
                return Err(CloudError::DependencyViolation(format!(
                    "'{address_id}' is still associated"
                )))
            }
            _ => return Err(CloudError::NotFound(address_id.to_string())),
        }
        state.remove(address_id)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Volumes
    // ---------------------------------------------------------------

    pub(crate) fn create_volume(&self, name: &str, size_gb: u32, speed: VolumeSpeed) -> CloudResult<String> {
        let mut state = self.lock();
        state.call("create_volume", name)?;
        if size_gb == 0 {
            return Err(CloudError::Rejected("volume size must be positive".to_string()));
        }
        let pending = state.settle_after;
        Ok(state.insert(
            "vol",
            name,
            pending,
            RawKind::Volume {
                size_gb,
                speed,
                attached_to: None,
            },
        ))
    }

    /// Attach a volume; returns the device name
    pub(crate) fn attach_volume(&self, volume_id: &str, instance_id: &str) -> CloudResult<String> {
        let mut state = self.lock();
        state.call("attach_volume", volume_id)?;
        if !matches!(state.get(instance_id)?.kind, RawKind::Instance { code, .. } if code == CODE_RUNNING)
        {
            return Err(CloudError::Rejected(format!("'{instance_id}' is not running")));
        }
        let used = state
            .resources
            .values()
            .filter(|r| matches!(&r.kind, RawKind::Volume { attached_to: Some((host, _)), .. } if host == instance_id))
            .count();
        let device = format!("/dev/xvd{}", (b'f' + used as u8) as char);

        let pending = state.settle_after;
        let raw = state.get_mut(volume_id)?;
        let settled = raw.pending == 0;
        match &mut raw.kind {
            RawKind::Volume { attached_to, .. } if attached_to.is_none() && settled => {
                *attached_to = Some((instance_id.to_string(), device.clone()));
            }
            RawKind::Volume { .. } => {
                return Err(CloudError::Rejected(format!(
                    "'{volume_id}' is not available"
                )))
            }
            _ => return Err(CloudError::NotFound(volume_id.to_string())),
        }
        raw.pending = pending;
        Ok(device)
    }

    pub(crate) fn detach_volume(&self, volume_id: &str, instance_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("detach_volume", volume_id)?;
        let pending = state.settle_after;
        let raw = state.get_mut(volume_id)?;
        match &mut raw.kind {
            RawKind::Volume { attached_to, .. }
                if attached_to.as_ref().map(|(host, _)| host.as_str()) == Some(instance_id) =>
            {
                *attached_to = None;
                raw.pending = pending;
                Ok(())
            }
            RawKind::Volume { .. } => Err(CloudError::NotFound(format!(
                "attachment of '{volume_id}' to '{instance_id}'"
            ))),
            _ => Err(CloudError::NotFound(volume_id.to_string())),
        }
    }

    pub(crate) fn delete_volume(&self, volume_id: &str) -> CloudResult<()> {
        let mut state = self.lock();
        state.call("delete_volume", volume_id)?;
        match &state.get(volume_id)?.kind {
            RawKind::Volume {
                attached_to: Some((host, _)),
                ..
            } => {
                return Err(CloudError::DependencyViolation(format!(
                    "'{volume_id}' is attached to '{host}'"
                )))
            }
            RawKind::Volume { .. } => {}
            _ => return Err(CloudError::NotFound(volume_id.to_string())),
        }
        state.remove(volume_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        Cidr::new(s).unwrap()
    }

    #[test]
    fn test_resources_settle_after_describes() {
        let cloud = SimulatedCloud::with_settle_after(2);
        let vpc = cloud.create_vpc("net", cidr("10.0.0.0/16")).unwrap();

        assert!(cloud.describe("describe_vpcs", &vpc).unwrap().is_pending());
        assert!(!cloud.describe("describe_vpcs", &vpc).unwrap().is_pending());
    }

    #[test]
    fn test_instance_code_carries_high_byte() {
        let cloud = SimulatedCloud::with_settle_after(0);
        let vpc = cloud.create_vpc("net", cidr("10.0.0.0/16")).unwrap();
        let subnet = cloud
            .create_subnet(&vpc, "net-sub", cidr("10.0.0.0/24"), false)
            .unwrap();
        let id = cloud
            .run_instance("n1", "img", HostSizing::new(1, 1, 10), &subnet)
            .unwrap();

        let code = cloud
            .describe("describe_instances", &id)
            .unwrap()
            .instance_code()
            .unwrap();
        assert_eq!(code, 0x0100 | CODE_RUNNING);
    }

    #[test]
    fn test_vpc_delete_refused_with_dependents() {
        let cloud = SimulatedCloud::with_settle_after(0);
        let vpc = cloud.create_vpc("net", cidr("10.0.0.0/16")).unwrap();
        let subnet = cloud
            .create_subnet(&vpc, "net-sub", cidr("10.0.0.0/24"), false)
            .unwrap();

        assert!(matches!(
            cloud.delete_vpc(&vpc),
            Err(CloudError::DependencyViolation(_))
        ));
        cloud.delete_subnet(&subnet).unwrap();
        cloud.delete_vpc(&vpc).unwrap();
        assert!(cloud.live_resources().is_empty());
    }

    #[test]
    fn test_scripted_faults() {
        let cloud = SimulatedCloud::new();
        cloud.fail_next("create_vpc", Fault::Throttled, 1);

        assert_eq!(
            cloud.create_vpc("net", cidr("10.0.0.0/16")),
            Err(CloudError::Throttled)
        );
        assert!(cloud.create_vpc("net", cidr("10.0.0.0/16")).is_ok());
        assert_eq!(cloud.call_count("create_vpc"), 2);
    }

    #[test]
    fn test_overlapping_subnets_rejected() {
        let cloud = SimulatedCloud::with_settle_after(0);
        let vpc = cloud.create_vpc("net", cidr("10.0.0.0/16")).unwrap();
        cloud
            .create_subnet(&vpc, "a", cidr("10.0.0.0/17"), true)
            .unwrap();
        assert!(matches!(
            cloud.create_subnet(&vpc, "b", cidr("10.0.64.0/18"), false),
            Err(CloudError::Rejected(_))
        ));
    }
}
