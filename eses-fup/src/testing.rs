// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! Test doubles shared by the unit tests.

use crate::attributes::field_replaceable_attributes;
use crate::attributes::lcc_attributes;
use crate::attributes::ComponentType;
use crate::attributes::FwRevision;
use crate::attributes::InMemoryAttributeStore;
use crate::config::TunnelFupConfig;
use crate::enclosure::EnclosureFup;
use crate::enclosure::EnclosureLocation;
use crate::error::TransportError;
use crate::fup_info::FupTarget;
use crate::notify::DataChangeInfo;
use crate::notify::FupNotifier;
use crate::scheduler::LocalScheduler;
use crate::transport::TunnelOpcode;
use crate::transport::TunnelRequest;
use crate::transport::TunnelTransport;
use eses_messages::DownloadMode;
use slog::o;
use slog::Drain;
use slog::Logger;
use std::sync::Arc;
use std::sync::Mutex;

pub(crate) fn test_logger() -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!("component" => "eses-fup-test"))
}

pub(crate) const OLD_REVISION: &str = "1.00";

/// Two LCCs (local on side 0, peer on side 1) and a power supply on each
/// side, all at [`OLD_REVISION`].
pub(crate) fn attribute_fixture() -> Arc<InMemoryAttributeStore> {
    let store = InMemoryAttributeStore::new();
    let rev = FwRevision::from_str_lossy(OLD_REVISION);
    store.add_component(ComponentType::Lcc, lcc_attributes(0, true, rev));
    store.add_component(ComponentType::Lcc, lcc_attributes(1, false, rev));
    store.add_component(
        ComponentType::PowerSupply,
        field_replaceable_attributes(0, rev),
    );
    store.add_component(
        ComponentType::PowerSupply,
        field_replaceable_attributes(1, rev),
    );
    Arc::new(store)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sent {
    Command(FupTarget, TunnelOpcode),
    DownloadControl { mode: DownloadMode, offset: u32, len: usize },
    PowerCycle(usize),
}

/// Records every command; completions are fed back by the test.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingTransport {
    sent: Arc<Mutex<Vec<Sent>>>,
    refuse: Arc<Mutex<Option<TransportError>>>,
}

impl RecordingTransport {
    pub(crate) fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn last(&self) -> Option<Sent> {
        self.sent.lock().unwrap().last().copied()
    }

    /// Make every following command fail to issue with `err`.
    pub(crate) fn refuse_with(&self, err: TransportError) {
        *self.refuse.lock().unwrap() = Some(err);
    }
}

impl TunnelTransport for RecordingTransport {
    fn send(
        &mut self,
        target: FupTarget,
        request: TunnelRequest<'_>,
    ) -> Result<(), TransportError> {
        if let Some(err) = self.refuse.lock().unwrap().clone() {
            return Err(err);
        }
        let record = match request {
            TunnelRequest::DownloadFirmware(control) => Sent::DownloadControl {
                mode: control.mode,
                offset: control.buffer_offset,
                len: control.chunk.len(),
            },
            other => Sent::Command(target, other.opcode()),
        };
        self.sent.lock().unwrap().push(record);
        Ok(())
    }

    fn power_cycle_lcc(&mut self, index: usize) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(Sent::PowerCycle(index));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notification {
    DataChange(DataChangeInfo),
    Activation(bool),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub(crate) fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }
}

impl FupNotifier for RecordingNotifier {
    fn data_change(&mut self, info: DataChangeInfo) {
        self.notifications.lock().unwrap().push(Notification::DataChange(info));
    }

    fn fw_activation(&mut self, activating: bool) {
        self.notifications
            .lock()
            .unwrap()
            .push(Notification::Activation(activating));
    }
}

pub(crate) struct Fixture {
    pub(crate) enclosure: EnclosureFup,
    pub(crate) scheduler: LocalScheduler,
    pub(crate) transport: RecordingTransport,
    pub(crate) notifier: RecordingNotifier,
    pub(crate) attributes: Arc<InMemoryAttributeStore>,
}

pub(crate) fn enclosure_fixture() -> Fixture {
    enclosure_fixture_with(TunnelFupConfig::default())
}

pub(crate) fn enclosure_fixture_with(config: TunnelFupConfig) -> Fixture {
    let transport = RecordingTransport::default();
    let notifier = RecordingNotifier::default();
    let attributes = attribute_fixture();
    let enclosure = EnclosureFup::new(
        &test_logger(),
        config,
        EnclosureLocation { bus: 0, enclosure: 1 },
        Box::new(transport.clone()),
        attributes.clone(),
        Box::new(notifier.clone()),
    );
    Fixture {
        enclosure,
        scheduler: LocalScheduler::new(),
        transport,
        notifier,
        attributes,
    }
}
