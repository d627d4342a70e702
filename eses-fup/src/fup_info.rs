// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use crate::attributes::ComponentType;
use crate::attributes::FwRevision;
use crate::notify::DeviceType;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// The kind of component whose firmware is being upgraded.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FwTargetKind {
    LccExpander,
    LccBootLoader,
    LccInitString,
    LccFpga,
    LccMain,
    PowerSupply,
    Cooling,
    SpsPrimary,
    SpsSecondary,
    SpsBattery,
}

impl FwTargetKind {
    pub fn is_lcc(self) -> bool {
        matches!(
            self,
            Self::LccExpander
                | Self::LccBootLoader
                | Self::LccInitString
                | Self::LccFpga
                | Self::LccMain
        )
    }

    /// Activating these images takes the peer LCC down, so other enclosure
    /// objects are told activation is under way.
    pub fn announces_activation(self) -> bool {
        matches!(
            self,
            Self::LccExpander | Self::LccMain | Self::LccFpga | Self::LccInitString
        )
    }

    pub fn component_type(self) -> ComponentType {
        match self {
            Self::LccExpander
            | Self::LccBootLoader
            | Self::LccInitString
            | Self::LccFpga
            | Self::LccMain => ComponentType::Lcc,
            Self::PowerSupply => ComponentType::PowerSupply,
            Self::Cooling => ComponentType::Cooling,
            Self::SpsPrimary | Self::SpsSecondary | Self::SpsBattery => {
                ComponentType::Sps
            }
        }
    }

    pub fn device_type(self) -> DeviceType {
        match self.component_type() {
            ComponentType::Lcc => DeviceType::Lcc,
            ComponentType::PowerSupply => DeviceType::PowerSupply,
            ComponentType::Cooling => DeviceType::Fan,
            ComponentType::Sps => DeviceType::Sps,
        }
    }
}

impl fmt::Display for FwTargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &'static str = self.into();
        f.write_str(s)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct FupTarget {
    pub kind: FwTargetKind,
    pub side: u8,
}

impl fmt::Display for FupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.side)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum FupOperation {
    #[default]
    None,
    Download,
    Activate,
    Abort,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum FupStatus {
    #[default]
    None,
    InProgress,
    Fail,
    Abort,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum FupAdditionalStatus {
    #[default]
    None,
    NeedsStatusRequest,
    Busy,
    ImageLoaded,
    ErrorPage,
    Unknown,
    TunnelProcessing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageTransferProgress {
    pub bytes_transferred: u32,
    pub current_chunk_size: u32,
    pub image_size: u32,
    pub zero_byte_chunks: u32,
}

impl ImageTransferProgress {
    pub fn new(image_size: u32) -> Self {
        Self { image_size, ..Default::default() }
    }

    pub fn remaining(&self) -> u32 {
        self.image_size.saturating_sub(self.bytes_transferred)
    }
}

/// Firmware upgrade bookkeeping for one enclosure.
#[derive(Debug, Clone)]
pub struct EnclosureFupInfo {
    pub operation: FupOperation,
    pub target: Option<FupTarget>,
    pub status: FupStatus,
    pub additional_status: FupAdditionalStatus,
    pub use_tunnelling: bool,
    pub progress: ImageTransferProgress,
    pub image: Option<Vec<u8>>,
    pub start_time: Instant,
    /// Revision of the target captured when the operation was requested.
    pub old_revision: FwRevision,
    pub request_id: Option<Uuid>,
}

impl EnclosureFupInfo {
    pub fn new() -> Self {
        Self {
            operation: FupOperation::None,
            target: None,
            status: FupStatus::None,
            additional_status: FupAdditionalStatus::None,
            use_tunnelling: false,
            progress: ImageTransferProgress::default(),
            image: None,
            start_time: Instant::now(),
            old_revision: FwRevision::default(),
            request_id: None,
        }
    }

    pub fn status_pair(&self) -> (FupStatus, FupAdditionalStatus) {
        (self.status, self.additional_status)
    }

    /// True once the target reports no operation in progress.
    pub fn is_idle_status(&self) -> bool {
        self.status_pair() == (FupStatus::None, FupAdditionalStatus::None)
    }

    pub fn set_status(
        &mut self,
        status: FupStatus,
        additional_status: FupAdditionalStatus,
    ) {
        self.status = status;
        self.additional_status = additional_status;
    }

    pub fn release_image(&mut self) {
        self.image = None;
    }
}

impl Default for EnclosureFupInfo {
    fn default() -> Self {
        Self::new()
    }
}
