// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use crate::fup_info::FupAdditionalStatus;
use crate::fup_info::FupStatus;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::Logger;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceType {
    Lcc,
    PowerSupply,
    Fan,
    Sps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceLocation {
    pub bus: u8,
    pub enclosure: u8,
    pub slot: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChangeType {
    FupInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChangeInfo {
    pub device: DeviceType,
    pub location: DeviceLocation,
    pub change: DataChangeType,
    pub status: FupStatus,
    pub additional_status: FupAdditionalStatus,
}

/// Receives firmware upgrade notifications meant for upper layers and other
/// enclosure objects.
pub trait FupNotifier: Send {
    fn data_change(&mut self, info: DataChangeInfo);

    /// Activation of an image that takes the peer LCC down has started
    /// (`true`) or finished (`false`).
    fn fw_activation(&mut self, activating: bool);
}

/// A [`FupNotifier`] that only logs.
pub struct LogNotifier {
    log: Logger,
}

impl LogNotifier {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.clone() }
    }
}

impl FupNotifier for LogNotifier {
    fn data_change(&mut self, info: DataChangeInfo) {
        let device: &'static str = info.device.into();
        let status: &'static str = info.status.into();
        let additional: &'static str = info.additional_status.into();
        info!(
            self.log, "firmware upgrade status changed";
            "device" => device,
            "bus" => info.location.bus,
            "enclosure" => info.location.enclosure,
            "slot" => info.location.slot,
            "status" => status,
            "additional_status" => additional,
        );
    }

    fn fw_activation(&mut self, activating: bool) {
        info!(self.log, "peer firmware activation"; "activating" => activating);
    }
}
