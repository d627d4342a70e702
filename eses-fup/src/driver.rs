// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! Async host loop that runs an [`EnclosureFup`]'s conditions until its
//! firmware operation concludes.

use crate::enclosure::EnclosureFup;
use crate::error::DriverError;
use crate::error::FupRequestError;
use crate::fup_info::FupAdditionalStatus;
use crate::fup_info::FupOperation;
use crate::fup_info::FupStatus;
use crate::fup_info::FupTarget;
use crate::fup_info::ImageTransferProgress;
use crate::scheduler::Condition;
use crate::scheduler::LifecycleStatus;
use crate::scheduler::LocalScheduler;
use crate::transport::Completion;
use crate::transport::EnclosureStatus;
use futures::FutureExt;
use serde::Serialize;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Final state of a firmware operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FupOutcome {
    pub operation: FupOperation,
    pub target: Option<FupTarget>,
    pub status: FupStatus,
    pub additional_status: FupAdditionalStatus,
    pub bytes_transferred: u32,
    pub image_size: u32,
}

impl FupOutcome {
    pub fn is_success(&self) -> bool {
        self.status == FupStatus::None
    }
}

/// Owns an enclosure and plays the part of its condition scheduler.
///
/// Tunneled command completions arrive on `completions`; the transport the
/// enclosure was built with must feed that channel.
pub struct FupDriver {
    log: Logger,
    enclosure: EnclosureFup,
    scheduler: LocalScheduler,
    completions: mpsc::UnboundedReceiver<Completion>,
    completion_timeout: Duration,
    progress: watch::Sender<ImageTransferProgress>,
    operation: FupOperation,
}

impl FupDriver {
    pub fn new(
        log: &Logger,
        enclosure: EnclosureFup,
        completions: mpsc::UnboundedReceiver<Completion>,
    ) -> Self {
        let completion_timeout = enclosure.config().tunnel_cmd_time_limit;
        let (progress, _) = watch::channel(enclosure.progress());
        Self {
            log: log.new(o!("component" => "fup-driver")),
            enclosure,
            scheduler: LocalScheduler::new(),
            completions,
            completion_timeout,
            progress,
            operation: FupOperation::None,
        }
    }

    /// How long to wait for a command to complete before reporting it as a
    /// failed packet.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn enclosure(&self) -> &EnclosureFup {
        &self.enclosure
    }

    /// Transfer progress, updated after every step of the state machine.
    pub fn progress(&self) -> watch::Receiver<ImageTransferProgress> {
        self.progress.subscribe()
    }

    pub fn start_download(
        &mut self,
        target: FupTarget,
        image: Vec<u8>,
    ) -> Result<Uuid, FupRequestError> {
        let id =
            self.enclosure.start_download(target, image, &mut self.scheduler)?;
        self.operation = FupOperation::Download;
        self.progress.send_replace(self.enclosure.progress());
        Ok(id)
    }

    pub fn start_activate(
        &mut self,
        target: FupTarget,
    ) -> Result<Uuid, FupRequestError> {
        let id = self.enclosure.start_activate(target, &mut self.scheduler)?;
        self.operation = FupOperation::Activate;
        self.progress.send_replace(self.enclosure.progress());
        Ok(id)
    }

    pub fn abort(&mut self) -> Result<(), FupRequestError> {
        self.enclosure.abort()
    }

    /// Run conditions until no firmware operation remains scheduled.
    pub async fn run_to_completion(
        &mut self,
    ) -> Result<FupOutcome, DriverError> {
        loop {
            if self.scheduler.take_condition(Condition::DiscoveryUpdate) {
                self.enclosure.process_fup_status_change();
            }
            if self.scheduler.take_condition(Condition::ExpanderControlNeeded) {
                let sent = self.enclosure.expander_control();
                debug!(self.log, "expander control"; "power_cycles" => sent);
            }
            if !self.scheduler.is_set(Condition::FirmwareDownload) {
                break;
            }

            // Whatever asked for the condition to run again is served now.
            self.scheduler.take_reschedule();
            self.scheduler.set_current(Condition::FirmwareDownload);
            let status =
                self.enclosure.firmware_download_cond(&mut self.scheduler);
            self.progress.send_replace(self.enclosure.progress());

            if !self.scheduler.is_set(Condition::FirmwareDownload) {
                continue;
            }
            match (status, self.scheduler.take_reschedule()) {
                (LifecycleStatus::Reschedule, _) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                (_, Some(delay)) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
                (LifecycleStatus::Pending, None) => (),
                (LifecycleStatus::Done, None) => {
                    warn!(self.log, "firmware download condition went idle");
                    break;
                }
            }

            let completion = match tokio::time::timeout(
                self.completion_timeout,
                self.completions.recv(),
            )
            .await
            {
                Ok(Some(completion)) => completion,
                Ok(None) => return Err(DriverError::CompletionChannelClosed),
                Err(_) => {
                    warn!(
                        self.log, "tunneled command never completed";
                        "timeout" => ?self.completion_timeout,
                    );
                    Completion::Status(EnclosureStatus::PacketFailed)
                }
            };
            self.enclosure.command_completion(completion, &mut self.scheduler);
        }

        let info = self.enclosure.info();
        Ok(FupOutcome {
            operation: self.operation,
            target: info.target,
            status: info.status,
            additional_status: info.additional_status,
            bytes_transferred: info.progress.bytes_transferred,
            image_size: info.progress.image_size,
        })
    }

    /// Run to completion on a new task. The driver is handed back so another
    /// operation can follow.
    pub fn spawn(mut self) -> FupDriverTask {
        FupDriverTask::spawn(async move {
            let result = self.run_to_completion().await;
            (self, result)
        })
    }
}

type DriverTaskOutput = (FupDriver, Result<FupOutcome, DriverError>);

/// A newtype wrapper around the [`JoinHandle`] for the tokio task running a
/// [`FupDriver`].
pub struct FupDriverTask {
    inner: JoinHandle<DriverTaskOutput>,
}

impl FupDriverTask {
    fn spawn<T>(task: T) -> Self
    where
        T: Future<Output = DriverTaskOutput> + Send + 'static,
    {
        let inner = tokio::task::spawn(task);
        Self { inner }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl Future for FupDriverTask {
    type Output = Result<DriverTaskOutput, JoinError>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}
