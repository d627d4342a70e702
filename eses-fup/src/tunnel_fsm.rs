// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! State machine that downloads and activates firmware on a peer component by
//! tunneling commands through the local expander.
//!
//! Each call to [`run`] consumes one [`Event`], looks up the handler for the
//! current `(State, Event)` pair in the [`FsmTable`] for the operation, runs
//! it, and returns a [`ScheduleOp`] telling the caller when to call again.
//! Handlers never block: commands are issued through a [`TunnelTransport`] and
//! their outcome arrives as the event for a later call.

use crate::attributes::AttributeStore;
use crate::config::TunnelFupConfig;
use crate::fup_info::EnclosureFupInfo;
use crate::fup_info::FupOperation;
use crate::scheduler::Scheduler;
use crate::transport::EnclosureStatus;
use crate::transport::TunnelTransport;
use eses_messages::PageCode;
use slog::debug;
use slog::info;
use slog::Logger;
use std::time::Duration;
use tokio::time::Instant;

mod handlers;
mod peer_reset;
mod retry;
mod revision;
mod table;

pub use table::Action;
pub use table::FsmTable;
pub use table::Step;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
pub enum State {
    Init,
    SendGetConfig,
    Ready,
    SendDownloadControlPage,
    GetDownloadControlPageStatus,
    ReceiveDownloadStatusPage,
    GetReceiveDownloadStatusPageStatus,
    WaitForReset,
    /// Returned by a handler when the operation concluded. Never stored as
    /// the current state.
    Last,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
pub enum Event {
    TunnelDownloadRequested,
    Succeeded,
    Processing,
    Failed,
    Busy,
    TunneledCommandFailed,
    TunnelDownloadFailed,
}

impl From<EnclosureStatus> for Event {
    fn from(status: EnclosureStatus) -> Self {
        match status {
            EnclosureStatus::Ok => Self::Succeeded,
            EnclosureStatus::ProcessingTunnelCmd => Self::Processing,
            EnclosureStatus::Busy => Self::Busy,
            EnclosureStatus::TunneledCmdFailed => Self::TunneledCommandFailed,
            EnclosureStatus::TunnelDlFailed => Self::TunnelDownloadFailed,
            EnclosureStatus::CmdFailed
            | EnclosureStatus::PageInvalid
            | EnclosureStatus::PacketFailed => Self::Failed,
        }
    }
}

/// What the state machine asks of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOp {
    /// A command is in flight; call again with its completion.
    Pend,
    /// Call again after the delay; zero means as soon as possible.
    Delay(Duration),
    Fail,
    Done,
}

/// Persistent state of the tunneled upgrade. One per enclosure, reinitialized
/// at the start of every download or activate.
#[derive(Debug, Clone)]
pub struct TunnelFupContext {
    pub(crate) current_state: State,
    pub(crate) previous_state: State,
    pub(crate) new_event: Event,
    pub(crate) schedule_op: ScheduleOp,
    pub(crate) failure_retry_count: u32,
    pub(crate) busy_retry_count: u32,
    /// Download status errors reported by the peer during this operation.
    /// Unlike the retry counts this is not reset by a new command.
    pub(crate) rejected_downloads: u32,
    /// When the current tunneled command was first issued.
    pub(crate) tunnel_cmd_start: Instant,
    /// Start of the reset wait, and the last time progress was logged.
    pub(crate) time_marker: Instant,
    /// Page the next tunnel command status should carry.
    pub(crate) expected_page: PageCode,
    pub(crate) generation_code: u32,
    pub(crate) max_failure_retry_count: u32,
    pub(crate) max_busy_retry_count: u32,
}

impl TunnelFupContext {
    pub fn new(config: &TunnelFupConfig) -> Self {
        let now = Instant::now();
        Self {
            current_state: State::Init,
            previous_state: State::Last,
            new_event: Event::TunnelDownloadRequested,
            schedule_op: ScheduleOp::Pend,
            failure_retry_count: 0,
            busy_retry_count: 0,
            rejected_downloads: 0,
            tunnel_cmd_start: now,
            time_marker: now,
            expected_page: PageCode::INVALID,
            generation_code: 0,
            max_failure_retry_count: config.max_failure_retry_count,
            max_busy_retry_count: config.max_busy_retry_count,
        }
    }

    /// Prepare for a new operation starting in `state`. The generation code
    /// learned by earlier operations is kept.
    pub fn init(&mut self, state: State, event: Event, config: &TunnelFupConfig) {
        let generation_code = self.generation_code;
        *self = Self::new(config);
        self.current_state = state;
        self.new_event = event;
        self.generation_code = generation_code;
    }

    pub fn current_state(&self) -> State {
        self.current_state
    }

    pub fn previous_state(&self) -> State {
        self.previous_state
    }

    pub fn new_event(&self) -> Event {
        self.new_event
    }

    pub fn schedule_op(&self) -> ScheduleOp {
        self.schedule_op
    }

    pub fn failure_retry_count(&self) -> u32 {
        self.failure_retry_count
    }

    pub fn busy_retry_count(&self) -> u32 {
        self.busy_retry_count
    }

    pub fn rejected_downloads(&self) -> u32 {
        self.rejected_downloads
    }

    pub fn generation_code(&self) -> u32 {
        self.generation_code
    }

    pub fn expected_page(&self) -> PageCode {
        self.expected_page
    }

    pub(crate) fn reset_retry_counts(&mut self) {
        self.failure_retry_count = 0;
        self.busy_retry_count = 0;
    }
}

/// Collaborators a handler may touch while processing one event.
pub struct FupEnv<'a> {
    pub log: &'a Logger,
    pub config: &'a TunnelFupConfig,
    pub info: &'a mut EnclosureFupInfo,
    pub transport: &'a mut dyn TunnelTransport,
    pub attributes: &'a dyn AttributeStore,
    pub scheduler: &'a mut dyn Scheduler,
}

/// Process `event` against `table`, returning what the caller should do next.
pub fn run(
    table: FsmTable,
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    event: Event,
) -> ScheduleOp {
    let current = ctx.current_state;
    let (action, proposed) = table.entry(current, event);

    let first_chunk = env.info.progress.bytes_transferred == 0
        && env.info.operation == FupOperation::Download
        && env.info.use_tunnelling;
    if first_chunk {
        info!(
            env.log, "tunnel fup transition";
            "state" => ?current,
            "event" => ?event,
            "next" => ?proposed,
        );
    } else {
        debug!(
            env.log, "tunnel fup transition";
            "state" => ?current,
            "event" => ?event,
            "next" => ?proposed,
        );
    }

    let next = handlers::dispatch(action, ctx, env, event, proposed);
    if next != State::Last && next != current {
        ctx.previous_state = current;
        ctx.current_state = next;
    }

    ctx.schedule_op
}

#[cfg(test)]
mod tests;
