// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for the Convergence Poller
//!
//! Runs `poll_until` on a paused clock and checks, for arbitrary policies and
//! readiness points, that delays stay within bounds and the budget is never
//! exceeded.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cim_provisioning::convergence::{poll_until, CheckError};
use cim_provisioning::{PollPolicy, ProvisioningError};
use proptest::prelude::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Harness
// ============================================================================

struct Run {
    result: Result<u32, ProvisioningError>,
    /// Clock offsets of every check, relative to the first one
    checks: Vec<Duration>,
}

/// Poll a check that becomes ready on attempt `ready_at`
fn run_poll(policy: PollPolicy, ready_at: u32) -> Run {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();

    runtime.block_on(async move {
        let started = Instant::now();
        let checks = Arc::new(Mutex::new(Vec::new()));
        let recorder = checks.clone();

        let result = poll_until("prop", &policy, &CancellationToken::new(), || {
            let recorder = recorder.clone();
            async move {
                let mut checks = recorder.lock().unwrap();
                checks.push(started.elapsed());
                let attempt = checks.len() as u32;
                if attempt >= ready_at {
                    Ok(attempt)
                } else {
                    Err(CheckError::not_ready(format!("attempt {attempt}")))
                }
            }
        })
        .await;

        let checks = checks.lock().unwrap().clone();
        Run { result, checks }
    })
}

fn policy() -> impl Strategy<Value = PollPolicy> {
    (1u64..50, 1u64..8, 1u64..5_000).prop_map(|(min, factor, timeout)| {
        PollPolicy::new(
            Duration::from_millis(min),
            Duration::from_millis(min * factor),
            Duration::from_millis(timeout),
        )
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: Every wait lies between the minimum and maximum delay
    #[test]
    fn prop_delays_within_bounds(policy in policy(), ready_at in 1u32..40) {
        let run = run_poll(policy, ready_at);

        for pair in run.checks.windows(2) {
            let gap = pair[1] - pair[0];
            prop_assert!(gap >= policy.min_delay, "gap {:?} below {:?}", gap, policy.min_delay);
            prop_assert!(gap <= policy.max_delay, "gap {:?} above {:?}", gap, policy.max_delay);
        }
    }

    /// Property: Delays never shrink, except for a final wait cut short by the budget
    #[test]
    fn prop_delays_are_monotonic(policy in policy(), ready_at in 1u32..40) {
        let run = run_poll(policy, ready_at);
        let gaps: Vec<Duration> = run.checks.windows(2).map(|p| p[1] - p[0]).collect();

        for i in 1..gaps.len() {
            if gaps[i] < gaps[i - 1] {
                prop_assert_eq!(run.checks[i + 1], policy.timeout, "delay shrank: {:?}", gaps);
            }
        }
    }

    /// Property: The poll never runs past its budget
    #[test]
    fn prop_budget_is_respected(policy in policy(), ready_at in 1u32..40) {
        let run = run_poll(policy, ready_at);

        let last = run.checks.last().copied().unwrap_or_default();
        prop_assert!(last <= policy.timeout, "checked at {:?} past {:?}", last, policy.timeout);
        match run.result {
            Ok(attempt) => {
                prop_assert_eq!(attempt, ready_at);
                prop_assert_eq!(run.checks.len() as u32, ready_at);
            }
            Err(ProvisioningError::Timeout { attempts, .. }) => {
                prop_assert!(attempts < ready_at);
                prop_assert_eq!(attempts as usize, run.checks.len());
            }
            Err(other) => prop_assert!(false, "unexpected error {}", other),
        }
    }
}
