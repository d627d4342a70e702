// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RetryDecision {
    /// Issue the command again; this is attempt number `n` of the budget.
    Retry(u32),
    /// The budget is spent.
    Exhausted,
    /// The command has been outstanding for too long.
    TimedOut(Duration),
}

/// Retry budget for one class of transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RetryClass {
    Failure,
    Busy,
}

impl RetryClass {
    pub(super) fn name(self) -> &'static str {
        match self {
            RetryClass::Failure => "failure",
            RetryClass::Busy => "busy",
        }
    }
}

pub(super) fn tunnel_cmd_elapsed(
    started: Instant,
    now: Instant,
    limit: Duration,
) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(started);
    (elapsed > limit).then_some(elapsed)
}

/// Decide whether to retry a command that came back failed or busy,
/// consuming one retry from `count` if so. The budget is checked before the
/// elapsed time, so `max` retries follow the first attempt at most.
pub(super) fn retry_decision(
    count: &mut u32,
    max: u32,
    started: Instant,
    now: Instant,
    limit: Duration,
) -> RetryDecision {
    if *count >= max {
        RetryDecision::Exhausted
    } else if let Some(elapsed) = tunnel_cmd_elapsed(started, now, limit) {
        RetryDecision::TimedOut(elapsed)
    } else {
        *count += 1;
        RetryDecision::Retry(*count)
    }
}
