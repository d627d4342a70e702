// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! Cell handlers. Each sets `ctx.schedule_op` and returns the state to move
//! to, or [`State::Last`] once the operation has concluded.

use super::peer_reset;
use super::retry;
use super::retry::RetryClass;
use super::retry::RetryDecision;
use super::revision;
use super::Action;
use super::Event;
use super::FupEnv;
use super::ScheduleOp;
use super::State;
use super::Step;
use super::TunnelFupContext;
use crate::error::TransportError;
use crate::fup_info::FupOperation;
use crate::fup_info::FupTarget;
use crate::fup_info::FwTargetKind;
use crate::transport::DownloadControl;
use crate::transport::TunnelRequest;
use eses_messages::DownloadMode;
use eses_messages::PageCode;
use slog::error;
use slog::info;
use slog::warn;
use slog_error_chain::InlineErrorChain;
use std::time::Duration;
use tokio::time::Instant;

pub(super) fn dispatch(
    action: Action,
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    event: Event,
    next: State,
) -> State {
    match action {
        Action::Invalid => invalid(ctx, env, event),
        Action::Send(step) => send(step, ctx, env, next),
        Action::GetTunnelCommandStatus => {
            ctx.reset_retry_counts();
            ctx.schedule_op = issue(Step::TunnelCommandStatus, ctx, env);
            next
        }
        Action::HandleProcessing => handle_processing(ctx, env, next),
        Action::HandleFailure(step) => {
            handle_retry(RetryClass::Failure, step, ctx, env, next)
        }
        Action::HandleDownloadRejected(step) => {
            download_rejected(step, ctx, env, next)
        }
        Action::HandleBusy(step) => {
            handle_retry(RetryClass::Busy, step, ctx, env, next)
        }
        Action::DownloadComplete => download_complete(ctx, env, next),
        Action::CheckRevision => check_revision(None, ctx, env, next),
        Action::CheckRevisionAndIssue(step) => {
            check_revision(Some(step), ctx, env, next)
        }
        Action::WaitForReset => wait_for_reset(ctx, env, next),
    }
}

fn invalid(
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    event: Event,
) -> State {
    error!(
        env.log, "unexpected event for tunnel fup state";
        "state" => ?ctx.current_state,
        "previous" => ?ctx.previous_state,
        "event" => ?event,
    );
    ctx.schedule_op = ScheduleOp::Fail;
    State::Last
}

fn send(
    step: Step,
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    next: State,
) -> State {
    ctx.reset_retry_counts();
    ctx.tunnel_cmd_start = Instant::now();
    match step {
        Step::GetConfiguration => ctx.expected_page = PageCode::CONFIGURATION,
        Step::ReceiveDownloadStatusPage => {
            ctx.expected_page = PageCode::DOWNLOAD_MICROCODE
        }
        Step::DownloadControlPage | Step::TunnelCommandStatus => (),
    }
    ctx.schedule_op = issue(step, ctx, env);
    next
}

/// Hand `step` to the transport. A command that cannot even be issued fails
/// the operation; there is nothing on the wire to retry.
fn issue(
    step: Step,
    ctx: &TunnelFupContext,
    env: &mut FupEnv<'_>,
) -> ScheduleOp {
    let Some(target) = env.info.target else {
        error!(
            env.log, "no firmware target for tunneled command";
            "step" => ?step,
        );
        return ScheduleOp::Fail;
    };

    let result = match step {
        Step::GetConfiguration => {
            env.transport.send(target, TunnelRequest::GetConfiguration)
        }
        Step::ReceiveDownloadStatusPage => {
            env.transport.send(target, TunnelRequest::GetDownloadStatus)
        }
        Step::TunnelCommandStatus => {
            env.transport.send(target, TunnelRequest::GetTunnelCommandStatus)
        }
        Step::DownloadControlPage => {
            issue_download_control(ctx.generation_code, target, env)
        }
    };

    match result {
        Ok(()) => ScheduleOp::Pend,
        Err(err) => {
            error!(
                env.log, "failed to issue tunneled command";
                "step" => ?step,
                "target" => %target,
                "err" => %InlineErrorChain::new(&err),
            );
            ScheduleOp::Fail
        }
    }
}

fn issue_download_control(
    generation_code: u32,
    target: FupTarget,
    env: &mut FupEnv<'_>,
) -> Result<(), TransportError> {
    let progress = &mut env.info.progress;
    let control = match env.info.operation {
        FupOperation::Activate => DownloadControl {
            mode: DownloadMode::Activate,
            generation_code,
            buffer_offset: 0,
            image_length: 0,
            chunk: &[],
        },
        _ => {
            let image =
                env.info.image.as_deref().ok_or(TransportError::ImageMissing)?;
            let offset = progress.bytes_transferred;
            let len = progress.remaining().min(env.config.max_chunk_size);
            let chunk = image
                .get(offset as usize..(offset + len) as usize)
                .ok_or(TransportError::ImageMissing)?;
            progress.current_chunk_size = len;
            DownloadControl {
                mode: DownloadMode::Download,
                generation_code,
                buffer_offset: offset,
                image_length: progress.image_size,
                chunk,
            }
        }
    };
    env.transport.send(target, TunnelRequest::DownloadFirmware(control))
}

/// Reset the peer and wait for it to come back.
fn escalate(ctx: &mut TunnelFupContext, env: &mut FupEnv<'_>) -> State {
    peer_reset::reset_peer(ctx, env);
    ctx.schedule_op = ScheduleOp::Delay(env.config.peer_reset_poll_time);
    State::WaitForReset
}

fn handle_retry(
    class: RetryClass,
    step: Step,
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    next: State,
) -> State {
    let (count, max) = match class {
        RetryClass::Failure => {
            (&mut ctx.failure_retry_count, ctx.max_failure_retry_count)
        }
        RetryClass::Busy => (&mut ctx.busy_retry_count, ctx.max_busy_retry_count),
    };
    let decision = retry::retry_decision(
        count,
        max,
        ctx.tunnel_cmd_start,
        Instant::now(),
        env.config.tunnel_cmd_time_limit,
    );

    match decision {
        RetryDecision::Retry(attempt) => {
            info!(
                env.log, "retrying tunneled command";
                "reason" => class.name(),
                "step" => ?step,
                "attempt" => attempt,
                "max" => max,
            );
            ctx.schedule_op = issue(step, ctx, env);
            next
        }
        RetryDecision::Exhausted => {
            error!(
                env.log, "tunneled command retries exhausted, resetting peer";
                "reason" => class.name(),
                "step" => ?step,
                "retries" => max,
            );
            escalate(ctx, env)
        }
        RetryDecision::TimedOut(elapsed) => {
            error!(
                env.log, "tunneled command timed out, resetting peer";
                "reason" => class.name(),
                "step" => ?step,
                "elapsed" => ?elapsed,
            );
            escalate(ctx, env)
        }
    }
}

/// The peer answered with a download error. Resending only helps if the
/// error was transient, so the peer is reset once it has rejected more than
/// the failure budget.
fn download_rejected(
    step: Step,
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    next: State,
) -> State {
    ctx.rejected_downloads += 1;
    if ctx.rejected_downloads > ctx.max_failure_retry_count {
        error!(
            env.log, "peer keeps rejecting firmware download, resetting peer";
            "rejections" => ctx.rejected_downloads,
            "operation" => ?env.info.operation,
        );
        return escalate(ctx, env);
    }
    handle_retry(RetryClass::Failure, step, ctx, env, next)
}

fn handle_processing(
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    next: State,
) -> State {
    if let Some(elapsed) = retry::tunnel_cmd_elapsed(
        ctx.tunnel_cmd_start,
        Instant::now(),
        env.config.tunnel_cmd_time_limit,
    ) {
        error!(
            env.log, "peer still processing tunneled command, resetting peer";
            "elapsed" => ?elapsed,
        );
        return escalate(ctx, env);
    }
    ctx.schedule_op = issue(Step::TunnelCommandStatus, ctx, env);
    next
}

fn download_complete(
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    next: State,
) -> State {
    let progress = &mut env.info.progress;
    if progress.current_chunk_size == 0 {
        progress.zero_byte_chunks += 1;
    } else {
        progress.zero_byte_chunks = 0;
    }
    if progress.zero_byte_chunks > env.config.max_zero_byte_chunks {
        error!(
            env.log, "image transfer stalled, resetting peer";
            "empty_chunks" => progress.zero_byte_chunks,
            "bytes_transferred" => progress.bytes_transferred,
        );
        return escalate(ctx, env);
    }

    if progress.current_chunk_size > 0 {
        ctx.rejected_downloads = 0;
    }
    progress.bytes_transferred += progress.current_chunk_size;
    progress.current_chunk_size = 0;

    let now = Instant::now();
    if now.saturating_duration_since(ctx.time_marker) >= env.config.dl_log_interval
    {
        info!(
            env.log, "image transfer progress";
            "bytes_transferred" => progress.bytes_transferred,
            "image_size" => progress.image_size,
            "elapsed" => ?now.saturating_duration_since(env.info.start_time),
        );
        ctx.time_marker = now;
    }

    if progress.bytes_transferred >= progress.image_size {
        info!(
            env.log, "image transfer complete";
            "bytes_transferred" => progress.bytes_transferred,
        );
        ctx.schedule_op = ScheduleOp::Done;
        return State::Last;
    }

    ctx.new_event = Event::TunnelDownloadRequested;
    ctx.schedule_op = ScheduleOp::Delay(Duration::ZERO);
    next
}

/// Activation often takes the peer offline, so a failed or unanswered query
/// is first checked against the revision before it counts as an error.
fn check_revision(
    issue_step: Option<Step>,
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    next: State,
) -> State {
    if revision::revision_changed(ctx, env) || env.info.is_idle_status() {
        info!(env.log, "firmware activation complete");
        ctx.schedule_op = ScheduleOp::Done;
        return State::Last;
    }

    let kind = env.info.target.map(|t| t.kind).unwrap_or(FwTargetKind::LccMain);
    let limit = env.config.activate_time_limit(kind);
    let elapsed = Instant::now().saturating_duration_since(env.info.start_time);
    if elapsed > limit {
        error!(
            env.log, "firmware activation timed out, resetting peer";
            "elapsed" => ?elapsed,
            "limit" => ?limit,
        );
        return escalate(ctx, env);
    }

    ctx.schedule_op = match issue_step {
        Some(step) => issue(step, ctx, env),
        None => ScheduleOp::Delay(env.config.check_rev_poll_time),
    };
    next
}

fn wait_for_reset(
    ctx: &mut TunnelFupContext,
    env: &mut FupEnv<'_>,
    next: State,
) -> State {
    let waited = Instant::now().saturating_duration_since(ctx.time_marker);
    if waited <= env.config.lcc_reset_time {
        ctx.schedule_op = ScheduleOp::Delay(env.config.peer_reset_poll_time);
        return next;
    }

    info!(env.log, "peer reset completed"; "waited" => ?waited);

    // Some power supply images only show their new revision after a reset.
    let ps_activate = env.info.operation == FupOperation::Activate
        && env.info.target.map(|t| t.kind) == Some(FwTargetKind::PowerSupply);
    ctx.schedule_op = if ps_activate
        && (revision::revision_changed(ctx, env) || env.info.is_idle_status())
    {
        ScheduleOp::Done
    } else {
        warn!(
            env.log, "firmware operation failed after peer reset";
            "operation" => ?env.info.operation,
        );
        ScheduleOp::Fail
    };
    State::Last
}
