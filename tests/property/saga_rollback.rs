// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for Saga Rollback
//!
//! For any number of steps and any failing step, exactly the completed steps
//! are compensated, newest first, and every failing compensation shows up as
//! a consequence of the returned error.

use async_trait::async_trait;
use cim_provisioning::saga::{ResourceSaga, SagaStep};
use cim_provisioning::{ProvisioningError, ProvisioningResult};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Saga Definition
// ============================================================================

#[derive(Debug, Default)]
struct Journal {
    done: Vec<usize>,
    undone: Vec<usize>,
}

struct Step {
    index: usize,
    name: String,
    fails: bool,
    compensation_fails: bool,
}

#[async_trait]
impl SagaStep<Journal> for Step {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut Journal, _cancel: &CancellationToken) -> ProvisioningResult<()> {
        if self.fails {
            return Err(ProvisioningError::fatal(&self.name, "refused"));
        }
        ctx.done.push(self.index);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut Journal) -> ProvisioningResult<()> {
        ctx.undone.push(self.index);
        if self.compensation_fails {
            return Err(ProvisioningError::fatal(&self.name, "stuck"));
        }
        Ok(())
    }
}

/// Steps, the index of the failing step (if any) and failing compensations
fn saga_shape() -> impl Strategy<Value = (usize, Option<usize>, Vec<bool>)> {
    (1usize..10).prop_flat_map(|len| {
        (
            Just(len),
            prop::option::of(0..len),
            prop::collection::vec(any::<bool>(), len),
        )
    })
}

fn build(len: usize, failing: Option<usize>, stuck: &[bool]) -> ResourceSaga<Journal> {
    (0..len).fold(ResourceSaga::new("prop"), |saga, index| {
        saga.step(Step {
            index,
            name: format!("step-{index}"),
            fails: failing == Some(index),
            compensation_fails: stuck[index],
        })
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: Rollback undoes exactly the completed prefix, in reverse
    #[test]
    fn prop_rollback_is_lifo((len, failing, stuck) in saga_shape()) {
        let saga = build(len, failing, &stuck);
        let mut journal = Journal::default();
        let result = tokio_test::block_on(saga.run(&mut journal, &CancellationToken::new()));

        match failing {
            None => {
                prop_assert!(result.is_ok());
                prop_assert_eq!(journal.done, (0..len).collect::<Vec<_>>());
                prop_assert!(journal.undone.is_empty(), "A successful saga must not compensate");
            }
            Some(k) => {
                prop_assert!(result.is_err());
                prop_assert_eq!(journal.done, (0..k).collect::<Vec<_>>());
                prop_assert_eq!(journal.undone, (0..k).rev().collect::<Vec<_>>());
            }
        }
    }

    /// Property: Failing compensations become consequences, the rest still run
    #[test]
    fn prop_compensation_failures_are_consequences((len, failing, stuck) in saga_shape()) {
        let Some(k) = failing else { return Ok(()); };
        let saga = build(len, failing, &stuck);
        let mut journal = Journal::default();
        let err = tokio_test::block_on(saga.run(&mut journal, &CancellationToken::new()))
            .unwrap_err();

        let expected = stuck[..k].iter().filter(|s| **s).count();
        prop_assert_eq!(err.consequences().len(), expected);
        match err {
            ProvisioningError::Composite { step, .. } => {
                prop_assert_eq!(step, format!("step-{k}"));
            }
            other => prop_assert!(false, "expected composite, got {}", other),
        }
    }

    /// Property: A cancelled saga executes nothing and compensates nothing
    #[test]
    fn prop_cancelled_saga_is_inert((len, _failing, stuck) in saga_shape()) {
        let saga = build(len, None, &stuck);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut journal = Journal::default();

        let err = tokio_test::block_on(saga.run(&mut journal, &cancel)).unwrap_err();

        prop_assert!(journal.done.is_empty());
        prop_assert!(journal.undone.is_empty());
        prop_assert!(err.consequences().is_empty());
    }
}
