// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

/// Work an enclosure object asks its host to run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Condition {
    FirmwareDownload,
    DiscoveryUpdate,
    ExpanderControlNeeded,
}

/// What a condition function tells its host after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    /// Finished for now; run again only if rescheduled.
    Done,
    /// A command is in flight; run again when it completes.
    Pending,
    /// Run again immediately.
    Reschedule,
}

pub trait Scheduler {
    fn set_condition(&mut self, condition: Condition);

    /// Run the current condition again after `delay`.
    fn reschedule(&mut self, delay: Duration);

    fn clear_current_condition(&mut self);
}

/// A [`Scheduler`] that records requests for a single-threaded host loop to
/// act on.
#[derive(Debug, Default)]
pub struct LocalScheduler {
    conditions: BTreeSet<Condition>,
    current: Option<Condition>,
    reschedule: Option<Duration>,
    set_counts: BTreeMap<Condition, usize>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self, condition: Condition) -> bool {
        self.conditions.contains(&condition)
    }

    /// Mark `condition` as the one being run.
    pub fn set_current(&mut self, condition: Condition) {
        self.current = Some(condition);
    }

    /// Clear `condition`, returning whether it was set.
    pub fn take_condition(&mut self, condition: Condition) -> bool {
        self.conditions.remove(&condition)
    }

    pub fn take_reschedule(&mut self) -> Option<Duration> {
        self.reschedule.take()
    }

    pub fn pending_reschedule(&self) -> Option<Duration> {
        self.reschedule
    }

    /// How many times `condition` has been set.
    pub fn set_count(&self, condition: Condition) -> usize {
        self.set_counts.get(&condition).copied().unwrap_or(0)
    }
}

impl Scheduler for LocalScheduler {
    fn set_condition(&mut self, condition: Condition) {
        self.conditions.insert(condition);
        *self.set_counts.entry(condition).or_default() += 1;
    }

    fn reschedule(&mut self, delay: Duration) {
        // The earliest request wins.
        self.reschedule = Some(match self.reschedule {
            Some(existing) => existing.min(delay),
            None => delay,
        });
    }

    fn clear_current_condition(&mut self) {
        if let Some(current) = self.current.take() {
            self.conditions.remove(&current);
        }
    }
}
