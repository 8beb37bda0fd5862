// Copyright (c) 2025 - Cowboy AI, Inc.
//! Resource Saga
//!
//! Builds a composite resource (a network with its subnets, gateway and
//! routes; a host with its public address) as an ordered list of steps, each
//! paired with a compensating action. When a step fails, the compensations of
//! the steps that already completed run in reverse order.
//!
//! ```text
//! Steps:         [Step 1] → [Step 2] → [Step 3] → [FAIL]
//! Compensation:                        [Comp 2] → [Comp 1]
//! ```
//!
//! Compensation is best-effort: a failing compensation is logged, recorded as
//! a consequence on the returned [`ProvisioningError::Composite`], and the
//! remaining compensations still run.

pub mod registry;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ProvisioningError, ProvisioningResult};

pub use registry::{SagaLease, SagaRegistry};

/// One step of a composite-resource build
///
/// `C` is the context shared by all steps of a saga; a step records the
/// handles it produced in it so later steps and compensations can use them.
#[async_trait]
pub trait SagaStep<C: Send>: Send + Sync {
    /// Step name, used in errors and logs
    fn name(&self) -> &str;

    /// Perform the step
    ///
    /// A step that fails must not leave work behind for its own
    /// compensation: only completed steps are compensated.
    async fn execute(&self, ctx: &mut C, cancel: &CancellationToken) -> ProvisioningResult<()>;

    /// Undo the step
    ///
    /// Runs even when the saga was cancelled.
    async fn compensate(&self, ctx: &mut C) -> ProvisioningResult<()>;
}

/// Ordered multi-step builder with LIFO compensating rollback
pub struct ResourceSaga<C: Send> {
    resource: String,
    steps: Vec<Box<dyn SagaStep<C>>>,
}

impl<C: Send> ResourceSaga<C> {
    /// Create an empty saga building `resource`
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn step(mut self, step: impl SagaStep<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append an already boxed step
    pub fn boxed_step(mut self, step: Box<dyn SagaStep<C>>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order.
    ///
    /// The token is checked before each step; a cancelled saga rolls back
    /// like a failed one and reports [`ProvisioningError::Cancelled`] as the
    /// source of the composite error.
    pub async fn run(&self, ctx: &mut C, cancel: &CancellationToken) -> ProvisioningResult<()> {
        let saga = self.resource.as_str();
        let mut completed: Vec<&dyn SagaStep<C>> = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let result = if cancel.is_cancelled() {
                Err(ProvisioningError::cancelled(format!("{saga}/{}", step.name())))
            } else {
                debug!(%saga, step = step.name(), "executing saga step");
                step.execute(ctx, cancel).await
            };

            if let Err(source) = result {
                warn!(%saga, step = step.name(), error = %source, "saga step failed, rolling back");
                let consequences = Self::rollback(saga, completed, ctx).await;
                return Err(ProvisioningError::Composite {
                    resource: self.resource.clone(),
                    step: step.name().to_string(),
                    source: Box::new(source),
                    consequences,
                });
            }
            completed.push(step.as_ref());
        }

        info!(%saga, steps = self.steps.len(), "composite resource built");
        Ok(())
    }

    async fn rollback(
        saga: &str,
        completed: Vec<&dyn SagaStep<C>>,
        ctx: &mut C,
    ) -> Vec<ProvisioningError> {
        let mut consequences = Vec::new();
        for step in completed.into_iter().rev() {
            match step.compensate(ctx).await {
                Ok(()) => debug!(%saga, step = step.name(), "compensated"),
                Err(err) => {
                    warn!(%saga, step = step.name(), error = %err, "compensation failed");
                    consequences.push(err);
                }
            }
        }
        consequences
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Journal {
        entries: Vec<String>,
    }

    struct Recorded {
        name: &'static str,
        fail_execute: bool,
        fail_compensate: bool,
    }

    impl Recorded {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                fail_execute: false,
                fail_compensate: false,
            }
        }
    }

    #[async_trait]
    impl SagaStep<Journal> for Recorded {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, ctx: &mut Journal, _cancel: &CancellationToken) -> ProvisioningResult<()> {
            if self.fail_execute {
                return Err(ProvisioningError::fatal(self.name, "refused"));
            }
            ctx.entries.push(format!("do {}", self.name));
            Ok(())
        }

        async fn compensate(&self, ctx: &mut Journal) -> ProvisioningResult<()> {
            ctx.entries.push(format!("undo {}", self.name));
            if self.fail_compensate {
                return Err(ProvisioningError::fatal(self.name, "stuck"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let saga = ResourceSaga::new("net-a")
            .step(Recorded::ok("vpc"))
            .step(Recorded::ok("subnet"));
        let mut journal = Journal::default();

        saga.run(&mut journal, &CancellationToken::new()).await.unwrap();
        assert_eq!(journal.entries, vec!["do vpc", "do subnet"]);
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse() {
        let saga = ResourceSaga::new("net-a")
            .step(Recorded::ok("vpc"))
            .step(Recorded::ok("subnet"))
            .step(Recorded {
                name: "gateway",
                fail_execute: true,
                fail_compensate: false,
            });
        let mut journal = Journal::default();

        let err = saga
            .run(&mut journal, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            journal.entries,
            vec!["do vpc", "do subnet", "undo subnet", "undo vpc"]
        );
        match err {
            ProvisioningError::Composite {
                resource,
                step,
                consequences,
                ..
            } => {
                assert_eq!(resource, "net-a");
                assert_eq!(step, "gateway");
                assert!(consequences.is_empty());
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compensation_failure_is_a_consequence() {
        let saga = ResourceSaga::new("host-a")
            .step(Recorded {
                name: "instance",
                fail_execute: false,
                fail_compensate: true,
            })
            .step(Recorded::ok("address"))
            .step(Recorded {
                name: "associate",
                fail_execute: true,
                fail_compensate: false,
            });
        let mut journal = Journal::default();

        let err = saga
            .run(&mut journal, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.consequences().len(), 1);
        assert!(err.to_string().contains("stuck"));
        assert_eq!(
            journal.entries,
            vec!["do instance", "do address", "undo address", "undo instance"]
        );
    }

    #[tokio::test]
    async fn test_cancelled_saga_rolls_back_without_running_more_steps() {
        let saga = ResourceSaga::new("vol-a").step(Recorded::ok("volume"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut journal = Journal::default();

        let err = saga.run(&mut journal, &cancel).await.unwrap_err();

        assert!(journal.entries.is_empty());
        assert_eq!(err.kind(), crate::errors::ErrorKind::Cancelled);
    }
}
