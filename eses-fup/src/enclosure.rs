// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use crate::attributes::AttributeId;
use crate::attributes::AttributeStore;
use crate::attributes::AttributeValue;
use crate::attributes::ComponentType;
use crate::attributes::FwRevision;
use crate::attributes::PowerCycleRequest;
use crate::config::TunnelFupConfig;
use crate::error::FupRequestError;
use crate::fup_info::EnclosureFupInfo;
use crate::fup_info::FupAdditionalStatus;
use crate::fup_info::FupOperation;
use crate::fup_info::FupStatus;
use crate::fup_info::FupTarget;
use crate::fup_info::ImageTransferProgress;
use crate::notify::DataChangeInfo;
use crate::notify::DataChangeType;
use crate::notify::DeviceLocation;
use crate::notify::FupNotifier;
use crate::scheduler::Condition;
use crate::scheduler::LifecycleStatus;
use crate::scheduler::Scheduler;
use crate::status_page;
use crate::transport::Completion;
use crate::transport::TunnelTransport;
use crate::tunnel_fsm;
use crate::tunnel_fsm::Event;
use crate::tunnel_fsm::FsmTable;
use crate::tunnel_fsm::FupEnv;
use crate::tunnel_fsm::ScheduleOp;
use crate::tunnel_fsm::State;
use crate::tunnel_fsm::TunnelFupContext;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Where an enclosure sits in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclosureLocation {
    pub bus: u8,
    pub enclosure: u8,
}

type StatusPair = (FupStatus, FupAdditionalStatus);

#[derive(Debug, Clone, Copy, Default)]
struct NotifiedStatus {
    current: StatusPair,
    previous: StatusPair,
}

/// Firmware upgrade state of one enclosure and the collaborators needed to
/// drive it.
pub struct EnclosureFup {
    log: Logger,
    config: TunnelFupConfig,
    location: EnclosureLocation,
    context: TunnelFupContext,
    info: EnclosureFupInfo,
    transport: Box<dyn TunnelTransport>,
    attributes: Arc<dyn AttributeStore>,
    notifier: Box<dyn FupNotifier>,
    /// Other enclosure objects have been told an activation is under way.
    inform_fw_activating: bool,
    notified: BTreeMap<FupTarget, NotifiedStatus>,
}

impl EnclosureFup {
    pub fn new(
        log: &Logger,
        config: TunnelFupConfig,
        location: EnclosureLocation,
        transport: Box<dyn TunnelTransport>,
        attributes: Arc<dyn AttributeStore>,
        notifier: Box<dyn FupNotifier>,
    ) -> Self {
        let log = log.new(o!(
            "bus" => location.bus,
            "enclosure" => location.enclosure,
        ));
        Self {
            log,
            context: TunnelFupContext::new(&config),
            config,
            location,
            info: EnclosureFupInfo::new(),
            transport,
            attributes,
            notifier,
            inform_fw_activating: false,
            notified: BTreeMap::new(),
        }
    }

    pub fn info(&self) -> &EnclosureFupInfo {
        &self.info
    }

    pub fn context(&self) -> &TunnelFupContext {
        &self.context
    }

    pub fn config(&self) -> &TunnelFupConfig {
        &self.config
    }

    pub fn progress(&self) -> ImageTransferProgress {
        self.info.progress
    }

    pub fn inform_fw_activating(&self) -> bool {
        self.inform_fw_activating
    }

    /// Request a tunneled download of `image` to `target`.
    pub fn start_download(
        &mut self,
        target: FupTarget,
        image: Vec<u8>,
        scheduler: &mut dyn Scheduler,
    ) -> Result<Uuid, FupRequestError> {
        if image.is_empty() {
            return Err(FupRequestError::ImageEmpty);
        }
        self.config.validate().map_err(FupRequestError::InvalidConfig)?;
        let image_size = u32::try_from(image.len())
            .map_err(|_| FupRequestError::ImageTooLarge(image.len()))?;
        self.start(
            FupOperation::Download,
            target,
            Some(image),
            image_size,
            scheduler,
        )
    }

    /// Request activation of an image previously downloaded to `target`.
    pub fn start_activate(
        &mut self,
        target: FupTarget,
        scheduler: &mut dyn Scheduler,
    ) -> Result<Uuid, FupRequestError> {
        self.start(FupOperation::Activate, target, None, 0, scheduler)
    }

    fn start(
        &mut self,
        operation: FupOperation,
        target: FupTarget,
        image: Option<Vec<u8>>,
        image_size: u32,
        scheduler: &mut dyn Scheduler,
    ) -> Result<Uuid, FupRequestError> {
        if self.info.operation != FupOperation::None {
            return Err(FupRequestError::OperationInProgress(
                self.info.operation,
            ));
        }
        let old_revision = self.check_target(target)?;

        let request_id = Uuid::new_v4();
        self.info = EnclosureFupInfo {
            operation,
            target: Some(target),
            status: FupStatus::InProgress,
            additional_status: FupAdditionalStatus::None,
            use_tunnelling: true,
            progress: ImageTransferProgress::new(image_size),
            image,
            start_time: Instant::now(),
            old_revision,
            request_id: Some(request_id),
        };

        let state = match operation {
            FupOperation::Download => State::Init,
            _ => State::Ready,
        };
        self.context.init(state, Event::TunnelDownloadRequested, &self.config);

        info!(
            self.log, "starting tunneled firmware operation";
            "operation" => ?operation,
            "target" => %target,
            "image_size" => image_size,
            "old_revision" => %old_revision,
            "request_id" => %request_id,
        );

        scheduler.set_condition(Condition::FirmwareDownload);
        scheduler.set_condition(Condition::DiscoveryUpdate);
        Ok(request_id)
    }

    /// Confirm `target` exists and is on the peer side, returning its
    /// current revision.
    fn check_target(
        &self,
        target: FupTarget,
    ) -> Result<FwRevision, FupRequestError> {
        let not_found = |err| FupRequestError::TargetNotFound { target, err };
        let component = target.kind.component_type();
        let index = self
            .attributes
            .index_for_side(component, target.side)
            .map_err(not_found)?;

        let local = self
            .attributes
            .find_first_bool(AttributeId::IsLocal, ComponentType::Lcc, true)
            .and_then(|lcc| {
                self.attributes.get_u8(AttributeId::Side, ComponentType::Lcc, lcc)
            })
            .map_err(not_found)?;
        if local == target.side {
            return Err(FupRequestError::TunnellingRequired(target));
        }

        self.attributes.get_revision(component, index).map_err(not_found)
    }

    /// Abort the current operation. Takes effect the next time the firmware
    /// download condition runs.
    pub fn abort(&mut self) -> Result<(), FupRequestError> {
        match self.info.operation {
            FupOperation::None | FupOperation::Abort => {
                Err(FupRequestError::NothingToAbort)
            }
            FupOperation::Download | FupOperation::Activate => {
                info!(self.log, "aborting firmware operation");
                self.info.operation = FupOperation::Abort;
                Ok(())
            }
        }
    }

    /// Whether other enclosure objects must be told that a peer activation
    /// started or finished.
    pub fn need_to_notify_upstream(&self) -> bool {
        let info = &self.info;
        let informed = self.inform_fw_activating;
        let announcing_target =
            info.target.is_some_and(|t| t.kind.announces_activation());

        let idle = matches!(info.operation, FupOperation::Abort | FupOperation::None);
        let activation_started = info.operation == FupOperation::Activate
            && info.status == FupStatus::InProgress
            && announcing_target;
        let activation_ended = (info.operation == FupOperation::Activate
            && info.status == FupStatus::None)
            || info.operation == FupOperation::None;

        (idle && informed)
            || (activation_started && !informed)
            || (activation_ended && informed)
    }

    /// The firmware download condition: advance the current operation by one
    /// event.
    pub fn firmware_download_cond(
        &mut self,
        scheduler: &mut dyn Scheduler,
    ) -> LifecycleStatus {
        if self.need_to_notify_upstream() {
            self.inform_fw_activating = !self.inform_fw_activating;
            self.notifier.fw_activation(self.inform_fw_activating);
            scheduler.reschedule(Duration::ZERO);
            return LifecycleStatus::Pending;
        }

        let table = match self.info.operation {
            FupOperation::Abort | FupOperation::None => {
                if self.info.operation == FupOperation::Abort {
                    info!(self.log, "firmware operation aborted");
                    self.info.set_status(
                        FupStatus::Abort,
                        FupAdditionalStatus::None,
                    );
                }
                self.info.operation = FupOperation::None;
                self.info.release_image();
                scheduler.clear_current_condition();
                return LifecycleStatus::Done;
            }
            FupOperation::Download if self.info.use_tunnelling => {
                FsmTable::Download
            }
            FupOperation::Activate if self.info.use_tunnelling => {
                FsmTable::Activate
            }
            FupOperation::Download | FupOperation::Activate => {
                error!(
                    self.log, "firmware operation without tunnelling";
                    "operation" => ?self.info.operation,
                );
                return self.handle_schedule_op(ScheduleOp::Fail, scheduler);
            }
        };

        let event = self.context.new_event;
        let mut env = FupEnv {
            log: &self.log,
            config: &self.config,
            info: &mut self.info,
            transport: &mut *self.transport,
            attributes: &*self.attributes,
            scheduler: &mut *scheduler,
        };
        let op = tunnel_fsm::run(table, &mut self.context, &mut env, event);
        self.handle_schedule_op(op, scheduler)
    }

    /// Translate the state machine's request into host scheduler calls.
    pub fn handle_schedule_op(
        &mut self,
        op: ScheduleOp,
        scheduler: &mut dyn Scheduler,
    ) -> LifecycleStatus {
        match op {
            ScheduleOp::Pend => LifecycleStatus::Pending,
            ScheduleOp::Delay(delay) if delay.is_zero() => {
                LifecycleStatus::Reschedule
            }
            ScheduleOp::Delay(delay) => {
                scheduler.reschedule(delay);
                LifecycleStatus::Done
            }
            ScheduleOp::Fail => {
                error!(
                    self.log, "firmware operation failed";
                    "operation" => ?self.info.operation,
                    "state" => ?self.context.current_state(),
                    "bytes_transferred" => self.info.progress.bytes_transferred,
                );
                self.finish(FupStatus::Fail, self.info.additional_status, scheduler)
            }
            ScheduleOp::Done => {
                info!(
                    self.log, "firmware operation complete";
                    "operation" => ?self.info.operation,
                    "elapsed" => ?self.info.start_time.elapsed(),
                );
                self.finish(FupStatus::None, FupAdditionalStatus::None, scheduler)
            }
        }
    }

    fn finish(
        &mut self,
        status: FupStatus,
        additional_status: FupAdditionalStatus,
        scheduler: &mut dyn Scheduler,
    ) -> LifecycleStatus {
        self.info.operation = FupOperation::None;
        self.info.set_status(status, additional_status);
        self.info.release_image();
        scheduler.set_condition(Condition::DiscoveryUpdate);
        scheduler.reschedule(Duration::ZERO);
        LifecycleStatus::Done
    }

    /// Record the outcome of the last tunneled command as the next event.
    pub fn command_completion(
        &mut self,
        completion: Completion,
        scheduler: &mut dyn Scheduler,
    ) {
        let status = match completion {
            Completion::Status(status) => status,
            Completion::TunnelStatusPage(page) => {
                status_page::handle_tunnel_status_page(
                    &self.log,
                    &page,
                    &mut self.context,
                    &mut self.info,
                )
            }
        };
        let event = Event::from(status);
        debug!(
            self.log, "tunneled command completed";
            "status" => ?status,
            "event" => ?event,
        );
        self.context.new_event = event;
        scheduler.reschedule(Duration::ZERO);
    }

    /// Notify upper layers of every target whose status changed since it was
    /// last reported.
    pub fn process_fup_status_change(&mut self) {
        if let Some(target) = self.info.target {
            self.notified.entry(target).or_default().current =
                self.info.status_pair();
        }

        for (target, entry) in &mut self.notified {
            if entry.current == entry.previous {
                continue;
            }
            entry.previous = entry.current;
            self.notifier.data_change(DataChangeInfo {
                device: target.kind.device_type(),
                location: DeviceLocation {
                    bus: self.location.bus,
                    enclosure: self.location.enclosure,
                    slot: target.side,
                },
                change: DataChangeType::FupInfo,
                status: entry.current.0,
                additional_status: entry.current.1,
            });
        }
    }

    /// Carry out requested LCC power cycles, returning how many were sent.
    pub fn expander_control(&mut self) -> usize {
        let mut sent = 0;
        for index in 0..self.attributes.component_count(ComponentType::Lcc) {
            match self.attributes.get_power_cycle_request(index) {
                Ok(PowerCycleRequest::Begin) => (),
                Ok(_) => continue,
                Err(err) => {
                    debug!(
                        self.log, "no power cycle state for LCC";
                        "lcc" => index,
                        "err" => %InlineErrorChain::new(&err),
                    );
                    continue;
                }
            }

            if let Err(err) = self.transport.power_cycle_lcc(index) {
                error!(
                    self.log, "failed to power cycle LCC";
                    "lcc" => index,
                    "err" => %InlineErrorChain::new(&err),
                );
                continue;
            }
            info!(self.log, "power cycled LCC"; "lcc" => index);
            sent += 1;

            if let Err(err) = self.attributes.set(
                AttributeId::PowerCycleRequest,
                ComponentType::Lcc,
                index,
                AttributeValue::PowerCycle(PowerCycleRequest::Completed),
            ) {
                error!(
                    self.log, "failed to record power cycle";
                    "lcc" => index,
                    "err" => %InlineErrorChain::new(&err),
                );
            }
        }
        sent
    }
}
